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
fn grade_must_stay_within_zero_and_points() {
    let workspace = temp_dir("classroomd-grading-bounds");
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
        "bounds.teacher@example.com",
        "Bounds Teacher",
        "teacher",
    );
    let student_id = create_profile(
        &mut stdin,
        &mut reader,
        "3",
        "bounds.student@example.com",
        "Bounds Student",
        "student",
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.create",
        json!({ "actorId": teacher_id, "name": "Bounds Class" }),
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
            "title": "Quiz",
            "points": 25
        }),
    );
    let assignment_id = assignment
        .get("assignment")
        .and_then(|a| a.get("id"))
        .and_then(|v| v.as_str())
        .expect("assignment id")
        .to_string();

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "submissions.submit",
        json!({
            "actorId": student_id,
            "assignmentId": assignment_id,
            "content": "answers"
        }),
    );
    let submission_id = submitted
        .get("submissionId")
        .and_then(|v| v.as_str())
        .expect("submission id")
        .to_string();

    let over = request(
        &mut stdin,
        &mut reader,
        "8",
        "submissions.grade",
        json!({
            "actorId": teacher_id,
            "submissionId": submission_id,
            "grade": 26
        }),
    );
    assert_eq!(error_code(&over), "bad_params");
    assert_eq!(
        over.get("error")
            .and_then(|e| e.get("details"))
            .and_then(|d| d.get("points"))
            .and_then(|v| v.as_i64()),
        Some(25)
    );

    let negative = request(
        &mut stdin,
        &mut reader,
        "9",
        "submissions.grade",
        json!({
            "actorId": teacher_id,
            "submissionId": submission_id,
            "grade": -1
        }),
    );
    assert_eq!(error_code(&negative), "bad_params");

    let missing = request(
        &mut stdin,
        &mut reader,
        "10",
        "submissions.grade",
        json!({
            "actorId": teacher_id,
            "submissionId": submission_id
        }),
    );
    assert_eq!(error_code(&missing), "bad_params");

    // A rejected grade leaves the submission ungraded.
    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "submissions.get",
        json!({ "actorId": teacher_id, "submissionId": submission_id }),
    );
    assert!(detail
        .get("submission")
        .and_then(|s| s.get("grade"))
        .map(|v| v.is_null())
        .unwrap_or(false));

    // Both endpoints of the range are valid.
    let zero = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "submissions.grade",
        json!({
            "actorId": teacher_id,
            "submissionId": submission_id,
            "grade": 0
        }),
    );
    assert_eq!(zero.get("grade").and_then(|v| v.as_i64()), Some(0));
    let full = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "submissions.grade",
        json!({
            "actorId": teacher_id,
            "submissionId": submission_id,
            "grade": 25
        }),
    );
    assert_eq!(full.get("grade").and_then(|v| v.as_i64()), Some(25));
}
