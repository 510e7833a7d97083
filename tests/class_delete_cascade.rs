use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_classroomd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn classroomd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn create_profile(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    email: &str,
    name: &str,
    role: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "profiles.create",
        json!({ "email": email, "fullName": name, "role": role }),
    );
    created
        .get("profile")
        .and_then(|p| p.get("id"))
        .and_then(|v| v.as_str())
        .expect("profile id")
        .to_string()
}

#[test]
fn deleting_a_class_removes_every_dependent_row_and_object() {
    let workspace = temp_dir("classroomd-class-cascade");
    let sources = temp_dir("classroomd-class-cascade-src");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher_id = create_profile(
        &mut stdin,
        &mut reader,
        "2",
        "cascade.teacher@example.com",
        "Cascade Teacher",
        "teacher",
    );
    let student_id = create_profile(
        &mut stdin,
        &mut reader,
        "3",
        "cascade.student@example.com",
        "Cascade Student",
        "student",
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.create",
        json!({ "actorId": teacher_id, "name": "Cascade Class" }),
    );
    let class_id = created
        .get("class")
        .and_then(|c| c.get("id"))
        .and_then(|v| v.as_str())
        .expect("class id")
        .to_string();
    let class_code = created
        .get("class")
        .and_then(|c| c.get("classCode"))
        .and_then(|v| v.as_str())
        .expect("class code")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "classes.join",
        json!({ "actorId": student_id, "code": class_code }),
    );

    let assignment = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "assignments.create",
        json!({
            "actorId": teacher_id,
            "classId": class_id,
            "title": "Doomed Assignment",
            "points": 10
        }),
    );
    let assignment_id = assignment
        .get("assignment")
        .and_then(|a| a.get("id"))
        .and_then(|v| v.as_str())
        .expect("assignment id")
        .to_string();

    let essay = sources.join("essay.txt");
    std::fs::write(&essay, "essay body").expect("write source");
    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "submissions.submit",
        json!({
            "actorId": student_id,
            "assignmentId": assignment_id,
            "content": "doomed",
            "files": [ { "sourcePath": essay.to_string_lossy() } ]
        }),
    );
    let file_id = submitted
        .get("files")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|f| f.get("fileId"))
        .and_then(|v| v.as_str())
        .expect("file id")
        .to_string();
    let url = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "files.url",
        json!({ "actorId": student_id, "kind": "submission", "fileId": file_id }),
    );
    let object_path = url
        .get("url")
        .and_then(|v| v.as_str())
        .expect("url")
        .to_string();
    assert!(std::path::Path::new(&object_path).exists());

    let handout = sources.join("handout.txt");
    std::fs::write(&handout, "handout body").expect("write source");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "materials.upload",
        json!({
            "actorId": teacher_id,
            "classId": class_id,
            "file": { "sourcePath": handout.to_string_lossy() }
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "classes.delete",
        json!({ "actorId": teacher_id, "classId": class_id }),
    );

    // Rows, enrollment, and stored objects are all gone.
    let class_gone = request(
        &mut stdin,
        &mut reader,
        "11",
        "classes.get",
        json!({ "actorId": teacher_id, "classId": class_id }),
    );
    assert_eq!(error_code(&class_gone), "not_found");
    let assignment_gone = request(
        &mut stdin,
        &mut reader,
        "12",
        "assignments.get",
        json!({ "actorId": teacher_id, "assignmentId": assignment_id }),
    );
    assert_eq!(error_code(&assignment_gone), "not_found");
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "submissions.list",
        json!({ "actorId": student_id }),
    );
    assert_eq!(
        listed
            .get("submissions")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );
    assert!(!std::path::Path::new(&object_path).exists());

    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "classes.list",
        json!({ "actorId": student_id }),
    );
    assert_eq!(
        empty
            .get("classes")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );
}
