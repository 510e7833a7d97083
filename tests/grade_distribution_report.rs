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

fn bucket_count(distribution: &[serde_json::Value], range: &str) -> i64 {
    distribution
        .iter()
        .find(|b| b.get("range").and_then(|v| v.as_str()) == Some(range))
        .and_then(|b| b.get("count"))
        .and_then(|v| v.as_i64())
        .unwrap_or(-1)
}

#[test]
fn distribution_buckets_graded_work_into_inclusive_ranges() {
    let workspace = temp_dir("classroomd-grade-distribution");
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
        "dist.teacher@example.com",
        "Dist Teacher",
        "teacher",
    );
    let student_id = create_profile(
        &mut stdin,
        &mut reader,
        "3",
        "dist.student@example.com",
        "Dist Student",
        "student",
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.create",
        json!({ "actorId": teacher_id, "name": "Dist Class" }),
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

    // Four assignments out of 100, graded 100 / 85 / 11 / 10. One stays
    // ungraded and must not appear in the distribution.
    let grades: [(&str, Option<i64>); 5] = [
        ("A1", Some(100)),
        ("A2", Some(85)),
        ("A3", Some(11)),
        ("A4", Some(10)),
        ("A5", None),
    ];
    let mut next_id = 6;
    for (title, grade) in grades {
        let assignment = request_ok(
            &mut stdin,
            &mut reader,
            &next_id.to_string(),
            "assignments.create",
            json!({
                "actorId": teacher_id,
                "classId": class_id,
                "title": title,
                "points": 100
            }),
        );
        next_id += 1;
        let assignment_id = assignment
            .get("assignment")
            .and_then(|a| a.get("id"))
            .and_then(|v| v.as_str())
            .expect("assignment id")
            .to_string();
        let submitted = request_ok(
            &mut stdin,
            &mut reader,
            &next_id.to_string(),
            "submissions.submit",
            json!({
                "actorId": student_id,
                "assignmentId": assignment_id,
                "content": title
            }),
        );
        next_id += 1;
        if let Some(grade) = grade {
            let submission_id = submitted
                .get("submissionId")
                .and_then(|v| v.as_str())
                .expect("submission id")
                .to_string();
            let _ = request_ok(
                &mut stdin,
                &mut reader,
                &next_id.to_string(),
                "submissions.grade",
                json!({
                    "actorId": teacher_id,
                    "submissionId": submission_id,
                    "grade": grade
                }),
            );
            next_id += 1;
        }
    }

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "99",
        "reports.gradeDistribution",
        json!({ "actorId": teacher_id, "classId": class_id }),
    );
    assert_eq!(report.get("gradedCount").and_then(|v| v.as_i64()), Some(4));
    let distribution = report
        .get("distribution")
        .and_then(|v| v.as_array())
        .expect("distribution")
        .clone();
    assert_eq!(distribution.len(), 10);
    assert_eq!(bucket_count(&distribution, "91-100%"), 1);
    assert_eq!(bucket_count(&distribution, "81-90%"), 1);
    assert_eq!(bucket_count(&distribution, "11-20%"), 1);
    assert_eq!(bucket_count(&distribution, "0-10%"), 1);
    assert_eq!(bucket_count(&distribution, "41-50%"), 0);

    // Without classId the teacher gets the same report across every class
    // they own; with only one class the numbers match.
    let all_classes = request_ok(
        &mut stdin,
        &mut reader,
        "100",
        "reports.gradeDistribution",
        json!({ "actorId": teacher_id }),
    );
    assert_eq!(
        all_classes.get("gradedCount").and_then(|v| v.as_i64()),
        Some(4)
    );
    let all_distribution = all_classes
        .get("distribution")
        .and_then(|v| v.as_array())
        .expect("distribution")
        .clone();
    assert_eq!(bucket_count(&all_distribution, "91-100%"), 1);
    assert_eq!(bucket_count(&all_distribution, "0-10%"), 1);

    // Students don't get the distribution, scoped or not.
    let denied = request(
        &mut stdin,
        &mut reader,
        "101",
        "reports.gradeDistribution",
        json!({ "actorId": student_id, "classId": class_id }),
    );
    assert_eq!(denied.get("ok").and_then(|v| v.as_bool()), Some(false));
    let denied_all = request(
        &mut stdin,
        &mut reader,
        "102",
        "reports.gradeDistribution",
        json!({ "actorId": student_id }),
    );
    assert_eq!(
        denied_all
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("forbidden")
    );
}
