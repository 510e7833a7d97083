use rusqlite::OptionalExtension;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::files::{file_meta_json, store_object};
use crate::ipc::helpers::{
    db_conn, load_viewer, object_store, optional_bool, optional_i64, optional_str, optional_ts,
    required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{self, SubmitOutcome};
use crate::storage::SUBMISSIONS_BUCKET;

struct AssignmentContext {
    class_id: String,
    due_date: Option<String>,
    points: i64,
    teacher_id: String,
    allow_late: bool,
}

fn load_assignment_context(
    conn: &rusqlite::Connection,
    assignment_id: &str,
) -> Result<AssignmentContext, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT a.class_id, a.due_date, a.points, c.teacher_id, c.allow_late_submissions
             FROM assignments a
             JOIN classes c ON c.id = a.class_id
             WHERE a.id = ?",
            [assignment_id],
            |r| {
                Ok(AssignmentContext {
                    class_id: r.get(0)?,
                    due_date: r.get(1)?,
                    points: r.get(2)?,
                    teacher_id: r.get(3)?,
                    allow_late: r.get::<_, i64>(4)? != 0,
                })
            },
        )
        .optional()?;
    row.ok_or_else(|| HandlerErr::not_found("assignment not found"))
}

fn submissions_submit(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let store = object_store(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    if !viewer.can_enroll() {
        return Err(HandlerErr::forbidden("only students can submit work"));
    }

    let assignment_id = required_str(&req.params, "assignmentId")?;
    let content = optional_str(&req.params, "content").unwrap_or_default();
    let assignment = load_assignment_context(conn, &assignment_id)?;

    let enrolled: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM class_enrollments WHERE class_id = ? AND student_id = ?",
            [&assignment.class_id, &viewer.id],
            |r| r.get(0),
        )
        .optional()?;
    if enrolled.is_none() {
        return Err(HandlerErr::forbidden("not enrolled in this class"));
    }

    let existing = conn
        .query_row(
            "SELECT id, deadline_override, grade
             FROM submissions
             WHERE assignment_id = ? AND student_id = ?",
            [&assignment_id, &viewer.id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, Option<i64>>(2)?,
                ))
            },
        )
        .optional()?;

    if let Some((_, _, Some(_))) = &existing {
        return Err(HandlerErr::new(
            "already_graded",
            "this submission has been graded and can no longer be edited",
        ));
    }

    // The prior row's per-student override wins over the assignment due date;
    // lateness is fixed now and never recomputed.
    let deadline_override = existing
        .as_ref()
        .and_then(|(_, o, _)| o.as_deref())
        .and_then(lifecycle::parse_ts);
    let due_date = assignment.due_date.as_deref().and_then(lifecycle::parse_ts);
    let effective = lifecycle::effective_deadline(deadline_override, due_date);

    let now = lifecycle::now_utc();
    let is_late = match lifecycle::evaluate_submission(now, effective, assignment.allow_late) {
        SubmitOutcome::Closed => {
            return Err(HandlerErr::new(
                "submission_closed",
                "assignment closed: past due and late submissions are not accepted",
            ));
        }
        SubmitOutcome::Accept { is_late } => is_late,
    };

    let submitted_at = lifecycle::format_ts(now);
    let submission_id = match &existing {
        Some((id, _, _)) => id.clone(),
        None => Uuid::new_v4().to_string(),
    };
    conn.execute(
        "INSERT INTO submissions(id, assignment_id, student_id, content, status,
                                 submitted_at, is_late)
         VALUES(?, ?, ?, ?, 'submitted', ?, ?)
         ON CONFLICT(assignment_id, student_id) DO UPDATE SET
           content = excluded.content,
           status = 'submitted',
           submitted_at = excluded.submitted_at,
           is_late = excluded.is_late",
        (
            &submission_id,
            &assignment_id,
            &viewer.id,
            &content,
            &submitted_at,
            is_late as i64,
        ),
    )?;

    // Files are uploaded after the row write; a per-file failure is reported
    // and skipped without rolling the submission back. failFast stops the
    // batch at the first failure (already-written files stay).
    let fail_fast = optional_bool(&req.params, "failFast").unwrap_or(false);
    let mut file_results: Vec<serde_json::Value> = Vec::new();
    if let Some(files) = req.params.get("files").and_then(|v| v.as_array()) {
        for file_params in files {
            let label = optional_str(file_params, "fileName")
                .or_else(|| optional_str(file_params, "sourcePath"))
                .unwrap_or_default();
            match store_object(store, SUBMISSIONS_BUCKET, &submission_id, file_params) {
                Ok(uploaded) => {
                    let file_id = Uuid::new_v4().to_string();
                    conn.execute(
                        "INSERT INTO submission_files(id, submission_id, file_name, file_path,
                                                      file_size, file_type, created_at)
                         VALUES(?, ?, ?, ?, ?, ?, ?)",
                        (
                            &file_id,
                            &submission_id,
                            &uploaded.file_name,
                            &uploaded.file_path,
                            uploaded.file_size,
                            &uploaded.file_type,
                            &submitted_at,
                        ),
                    )?;
                    file_results.push(json!({
                        "fileName": uploaded.file_name,
                        "ok": true,
                        "fileId": file_id,
                    }));
                }
                Err(e) => {
                    warn!(
                        submission = %submission_id,
                        file = %label,
                        error = %e.message,
                        "submission file upload failed; skipping"
                    );
                    file_results.push(json!({
                        "fileName": label,
                        "ok": false,
                        "error": e.message,
                    }));
                    if fail_fast {
                        break;
                    }
                }
            }
        }
    }

    Ok(json!({
        "submissionId": submission_id,
        "status": "submitted",
        "isLate": is_late,
        "submittedAt": submitted_at,
        "files": file_results,
    }))
}

fn submissions_grade(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let submission_id = required_str(&req.params, "submissionId")?;

    let row = conn
        .query_row(
            "SELECT s.assignment_id FROM submissions s WHERE s.id = ?",
            [&submission_id],
            |r| r.get::<_, String>(0),
        )
        .optional()?;
    let Some(assignment_id) = row else {
        return Err(HandlerErr::not_found("submission not found"));
    };
    let assignment = load_assignment_context(conn, &assignment_id)?;
    if !viewer.is_admin() && assignment.teacher_id != viewer.id {
        return Err(HandlerErr::forbidden("not the owning teacher"));
    }

    let grade = optional_i64(&req.params, "grade")
        .ok_or_else(|| HandlerErr::bad_params("missing grade"))?;
    if grade < 0 || grade > assignment.points {
        return Err(HandlerErr::with_details(
            "bad_params",
            format!("grade must be between 0 and {}", assignment.points),
            json!({ "points": assignment.points }),
        ));
    }
    let feedback = optional_str(&req.params, "feedback");
    let deadline_override = optional_ts(&req.params, "deadlineOverride")?.map(lifecycle::format_ts);

    // Re-grading overwrites in place; there is no grade history.
    let graded_at = lifecycle::format_ts(lifecycle::now_utc());
    if let Some(override_ts) = &deadline_override {
        conn.execute(
            "UPDATE submissions
             SET grade = ?, feedback = ?, graded_at = ?, status = 'graded',
                 deadline_override = ?
             WHERE id = ?",
            (
                grade,
                feedback.as_deref(),
                &graded_at,
                override_ts,
                &submission_id,
            ),
        )?;
    } else {
        conn.execute(
            "UPDATE submissions
             SET grade = ?, feedback = ?, graded_at = ?, status = 'graded'
             WHERE id = ?",
            (grade, feedback.as_deref(), &graded_at, &submission_id),
        )?;
    }

    Ok(json!({
        "submissionId": submission_id,
        "status": "graded",
        "grade": grade,
        "gradedAt": graded_at,
    }))
}

fn submissions_extend_deadline(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let submission_id = required_str(&req.params, "submissionId")?;

    let row = conn
        .query_row(
            "SELECT s.assignment_id FROM submissions s WHERE s.id = ?",
            [&submission_id],
            |r| r.get::<_, String>(0),
        )
        .optional()?;
    let Some(assignment_id) = row else {
        return Err(HandlerErr::not_found("submission not found"));
    };
    let assignment = load_assignment_context(conn, &assignment_id)?;
    if !viewer.is_admin() && assignment.teacher_id != viewer.id {
        return Err(HandlerErr::forbidden("not the owning teacher"));
    }

    // Explicit null clears the override and the due date applies again.
    let deadline_override = optional_ts(&req.params, "deadlineOverride")?.map(lifecycle::format_ts);
    conn.execute(
        "UPDATE submissions SET deadline_override = ? WHERE id = ?",
        (deadline_override.as_deref(), &submission_id),
    )?;

    Ok(json!({
        "submissionId": submission_id,
        "deadlineOverride": deadline_override,
    }))
}

fn submissions_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let submission_id = required_str(&req.params, "submissionId")?;

    let row = conn
        .query_row(
            "SELECT s.id, s.assignment_id, s.student_id, s.content, s.status, s.submitted_at,
                    s.is_late, s.deadline_override, s.grade, s.feedback, s.graded_at,
                    a.title, a.points, c.id, c.name, c.teacher_id,
                    p.full_name, p.email
             FROM submissions s
             JOIN assignments a ON a.id = s.assignment_id
             JOIN classes c ON c.id = a.class_id
             JOIN profiles p ON p.id = s.student_id
             WHERE s.id = ?",
            [&submission_id],
            |r| {
                let student_id: String = r.get(2)?;
                let teacher_id: String = r.get(15)?;
                let value = json!({
                    "id": r.get::<_, String>(0)?,
                    "assignmentId": r.get::<_, String>(1)?,
                    "studentId": student_id.clone(),
                    "content": r.get::<_, String>(3)?,
                    "status": r.get::<_, String>(4)?,
                    "submittedAt": r.get::<_, String>(5)?,
                    "isLate": r.get::<_, i64>(6)? != 0,
                    "deadlineOverride": r.get::<_, Option<String>>(7)?,
                    "grade": r.get::<_, Option<i64>>(8)?,
                    "feedback": r.get::<_, Option<String>>(9)?,
                    "gradedAt": r.get::<_, Option<String>>(10)?,
                    "assignment": {
                        "title": r.get::<_, String>(11)?,
                        "points": r.get::<_, i64>(12)?,
                    },
                    "class": {
                        "id": r.get::<_, String>(13)?,
                        "name": r.get::<_, String>(14)?,
                    },
                    "student": {
                        "fullName": r.get::<_, String>(16)?,
                        "email": r.get::<_, String>(17)?,
                    },
                });
                Ok((value, student_id, teacher_id))
            },
        )
        .optional()?;
    let Some((submission, student_id, teacher_id)) = row else {
        return Err(HandlerErr::not_found("submission not found"));
    };

    let allowed = viewer.is_admin() || viewer.id == student_id || viewer.id == teacher_id;
    if !allowed {
        return Err(HandlerErr::forbidden("no access to this submission"));
    }

    let mut stmt = conn.prepare(
        "SELECT id, file_name, file_path, file_size, file_type, created_at
         FROM submission_files
         WHERE submission_id = ?
         ORDER BY created_at DESC",
    )?;
    let files = stmt
        .query_map([&submission_id], |r| {
            let id: String = r.get(0)?;
            let file_name: String = r.get(1)?;
            let file_path: String = r.get(2)?;
            let file_size: i64 = r.get(3)?;
            let file_type: String = r.get(4)?;
            let created_at: String = r.get(5)?;
            Ok(file_meta_json(
                &id, &file_name, &file_path, file_size, &file_type, &created_at,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({
        "submission": submission,
        "files": files,
    }))
}

fn submissions_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let assignment_filter = optional_str(&req.params, "assignmentId");

    let submissions = if viewer.can_enroll() {
        // Students see their own submissions across classes.
        let sql = "SELECT s.id, s.assignment_id, a.title, c.name, s.status, s.submitted_at,
                          s.is_late, s.grade, a.points
                   FROM submissions s
                   JOIN assignments a ON a.id = s.assignment_id
                   JOIN classes c ON c.id = a.class_id
                   WHERE s.student_id = ?1
                     AND (?2 IS NULL OR s.assignment_id = ?2)
                   ORDER BY s.submitted_at DESC";
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map((&viewer.id, assignment_filter.as_deref()), |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "assignmentId": r.get::<_, String>(1)?,
                    "assignmentTitle": r.get::<_, String>(2)?,
                    "className": r.get::<_, String>(3)?,
                    "status": r.get::<_, String>(4)?,
                    "submittedAt": r.get::<_, String>(5)?,
                    "isLate": r.get::<_, i64>(6)? != 0,
                    "grade": r.get::<_, Option<i64>>(7)?,
                    "points": r.get::<_, i64>(8)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    } else {
        let Some(assignment_id) = assignment_filter else {
            return Err(HandlerErr::bad_params("missing assignmentId"));
        };
        let assignment = load_assignment_context(conn, &assignment_id)?;
        if !viewer.is_admin() && assignment.teacher_id != viewer.id {
            return Err(HandlerErr::forbidden("not the owning teacher"));
        }
        let sql = "SELECT s.id, s.student_id, p.full_name, p.email, s.status, s.submitted_at,
                          s.is_late, s.grade
                   FROM submissions s
                   JOIN profiles p ON p.id = s.student_id
                   WHERE s.assignment_id = ?
                   ORDER BY s.submitted_at DESC";
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([&assignment_id], |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "studentId": r.get::<_, String>(1)?,
                    "studentName": r.get::<_, String>(2)?,
                    "studentEmail": r.get::<_, String>(3)?,
                    "status": r.get::<_, String>(4)?,
                    "submittedAt": r.get::<_, String>(5)?,
                    "isLate": r.get::<_, i64>(6)? != 0,
                    "grade": r.get::<_, Option<i64>>(7)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    Ok(json!({ "submissions": submissions }))
}

fn submissions_delete_file(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let store = object_store(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let file_id = required_str(&req.params, "fileId")?;

    let row = conn
        .query_row(
            "SELECT f.file_path, s.student_id, s.grade, c.teacher_id
             FROM submission_files f
             JOIN submissions s ON s.id = f.submission_id
             JOIN assignments a ON a.id = s.assignment_id
             JOIN classes c ON c.id = a.class_id
             WHERE f.id = ?",
            [&file_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<i64>>(2)?,
                    r.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;
    let Some((file_path, student_id, grade, teacher_id)) = row else {
        return Err(HandlerErr::not_found("file not found"));
    };

    // The owning student may delete only while ungraded; the teacher always.
    let as_student = viewer.id == student_id && grade.is_none();
    let as_teacher = viewer.is_admin() || viewer.id == teacher_id;
    if !as_student && !as_teacher {
        if viewer.id == student_id {
            return Err(HandlerErr::new(
                "already_graded",
                "graded submissions are read-only",
            ));
        }
        return Err(HandlerErr::forbidden("no access to this file"));
    }

    // Storage first; if the object removal fails, the metadata row must
    // survive so the file is never a dangling reference.
    store
        .remove(&file_path)
        .map_err(|e| HandlerErr::new("storage_delete_failed", format!("{e:#}")))?;
    conn.execute("DELETE FROM submission_files WHERE id = ?", [&file_id])?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "submissions.submit" => submissions_submit(state, req),
        "submissions.grade" => submissions_grade(state, req),
        "submissions.extendDeadline" => submissions_extend_deadline(state, req),
        "submissions.get" => submissions_get(state, req),
        "submissions.list" => submissions_list(state, req),
        "submissions.deleteFile" => submissions_delete_file(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
