use rusqlite::OptionalExtension;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    db_conn, is_unique_violation, load_viewer, object_store, optional_bool, optional_str,
    required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle;
use crate::viewer::Role;

const CODE_RETRY_LIMIT: usize = 8;

fn class_row_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let subject: Option<String> = row.get(2)?;
    let description: Option<String> = row.get(3)?;
    let teacher_id: String = row.get(4)?;
    let class_code: String = row.get(5)?;
    let allow_late: i64 = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(json!({
        "id": id,
        "name": name,
        "subject": subject,
        "description": description,
        "teacherId": teacher_id,
        "classCode": class_code,
        "allowLateSubmissions": allow_late != 0,
        "createdAt": created_at,
    }))
}

const CLASS_COLUMNS: &str =
    "id, name, subject, description, teacher_id, class_code, allow_late_submissions, created_at";

fn classes_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    if !viewer.can_create_class() {
        return Err(HandlerErr::forbidden("only teachers can create classes"));
    }

    let name = required_str(&req.params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let subject = optional_str(&req.params, "subject");
    let description = optional_str(&req.params, "description");
    let allow_late = optional_bool(&req.params, "allowLateSubmissions").unwrap_or(false);

    let class_id = Uuid::new_v4().to_string();
    let created_at = lifecycle::format_ts(lifecycle::now_utc());

    // The code is the sole enrollment credential; retry on the (rare)
    // uniqueness collision instead of failing the create.
    let mut last_err: Option<rusqlite::Error> = None;
    for _ in 0..CODE_RETRY_LIMIT {
        let code = lifecycle::generate_class_code();
        match conn.execute(
            "INSERT INTO classes(id, name, subject, description, teacher_id, class_code,
                                 allow_late_submissions, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &class_id,
                &name,
                subject.as_deref(),
                description.as_deref(),
                &viewer.id,
                &code,
                allow_late as i64,
                &created_at,
            ),
        ) {
            Ok(_) => {
                return Ok(json!({
                    "class": {
                        "id": class_id,
                        "name": name,
                        "subject": subject,
                        "description": description,
                        "teacherId": viewer.id,
                        "classCode": code,
                        "allowLateSubmissions": allow_late,
                        "createdAt": created_at,
                    }
                }));
            }
            Err(e) if is_unique_violation(&e) => {
                last_err = Some(e);
                continue;
            }
            Err(e) => {
                return Err(HandlerErr::with_details(
                    "db_insert_failed",
                    e.to_string(),
                    json!({ "table": "classes" }),
                ));
            }
        }
    }
    Err(HandlerErr::new(
        "db_insert_failed",
        format!(
            "could not allocate a unique class code: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ),
    ))
}

/// Privileged "my classes" projection: teachers see classes they teach,
/// students see classes they're enrolled in, admins see everything. This is
/// the trusted-query boundary; no per-table ownership filter would produce
/// the same view.
fn classes_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;

    let (sql, binds): (String, Vec<String>) = match viewer.role {
        Role::Admin => (
            format!(
                "SELECT {CLASS_COLUMNS},
                   (SELECT COUNT(*) FROM class_enrollments e WHERE e.class_id = classes.id)
                 FROM classes ORDER BY name"
            ),
            vec![],
        ),
        Role::Teacher => (
            format!(
                "SELECT {CLASS_COLUMNS},
                   (SELECT COUNT(*) FROM class_enrollments e WHERE e.class_id = classes.id)
                 FROM classes WHERE teacher_id = ? ORDER BY name"
            ),
            vec![viewer.id.clone()],
        ),
        Role::Student => (
            format!(
                "SELECT {CLASS_COLUMNS},
                   (SELECT COUNT(*) FROM class_enrollments e WHERE e.class_id = classes.id)
                 FROM classes
                 WHERE id IN (SELECT class_id FROM class_enrollments WHERE student_id = ?)
                 ORDER BY name"
            ),
            vec![viewer.id.clone()],
        ),
    };

    let mut stmt = conn.prepare(&sql)?;
    let classes = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |row| {
            let mut value = class_row_json(row)?;
            let enrollment_count: i64 = row.get(8)?;
            value["enrollmentCount"] = json!(enrollment_count);
            Ok(value)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({ "classes": classes }))
}

fn classes_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let class_id = required_str(&req.params, "classId")?;

    let class = conn
        .query_row(
            &format!("SELECT {CLASS_COLUMNS} FROM classes WHERE id = ?"),
            [&class_id],
            class_row_json,
        )
        .optional()?;
    let Some(class) = class else {
        return Err(HandlerErr::not_found("class not found"));
    };
    if !viewer.can_view_class(conn, &class_id)? {
        return Err(HandlerErr::forbidden("not a member of this class"));
    }

    let mut stmt = conn.prepare(
        "SELECT p.id, p.full_name, p.email, e.enrolled_at
         FROM class_enrollments e
         JOIN profiles p ON p.id = e.student_id
         WHERE e.class_id = ?
         ORDER BY p.full_name",
    )?;
    let students = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let full_name: String = r.get(1)?;
            let email: String = r.get(2)?;
            let enrolled_at: String = r.get(3)?;
            Ok(json!({
                "id": id,
                "fullName": full_name,
                "email": email,
                "enrolledAt": enrolled_at,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let assignment_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM assignments WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    )?;

    Ok(json!({
        "class": class,
        "students": students,
        "assignmentCount": assignment_count,
    }))
}

fn classes_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let class_id = required_str(&req.params, "classId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("class not found"));
    }
    if !viewer.can_manage_class(conn, &class_id)? {
        return Err(HandlerErr::forbidden("not the owning teacher"));
    }

    let patch = req
        .params
        .get("patch")
        .cloned()
        .unwrap_or_else(|| json!({}));
    if let Some(name) = optional_str(&patch, "name") {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(HandlerErr::bad_params("name must not be empty"));
        }
        conn.execute("UPDATE classes SET name = ? WHERE id = ?", (&name, &class_id))?;
    }
    if patch.get("subject").is_some() {
        conn.execute(
            "UPDATE classes SET subject = ? WHERE id = ?",
            (optional_str(&patch, "subject").as_deref(), &class_id),
        )?;
    }
    if patch.get("description").is_some() {
        conn.execute(
            "UPDATE classes SET description = ? WHERE id = ?",
            (optional_str(&patch, "description").as_deref(), &class_id),
        )?;
    }
    if let Some(allow_late) = optional_bool(&patch, "allowLateSubmissions") {
        conn.execute(
            "UPDATE classes SET allow_late_submissions = ? WHERE id = ?",
            (allow_late as i64, &class_id),
        )?;
    }

    Ok(json!({ "ok": true }))
}

fn classes_join(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    if !viewer.can_enroll() {
        return Err(HandlerErr::forbidden("only students can join classes"));
    }

    let code = required_str(&req.params, "code")?
        .trim()
        .to_ascii_uppercase();
    if code.is_empty() {
        return Err(HandlerErr::bad_params("code must not be empty"));
    }

    let class = conn
        .query_row(
            "SELECT id, name FROM classes WHERE class_code = ?",
            [&code],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
        )
        .optional()?;
    let Some((class_id, class_name)) = class else {
        return Err(HandlerErr::new("invalid_code", "invalid class code"));
    };

    let enrolled_at = lifecycle::format_ts(lifecycle::now_utc());
    if let Err(e) = conn.execute(
        "INSERT INTO class_enrollments(class_id, student_id, enrolled_at) VALUES(?, ?, ?)",
        (&class_id, &viewer.id, &enrolled_at),
    ) {
        if is_unique_violation(&e) {
            return Err(HandlerErr::new(
                "already_enrolled",
                "you are already enrolled in this class",
            ));
        }
        return Err(HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "class_enrollments" }),
        ));
    }

    Ok(json!({ "classId": class_id, "className": class_name }))
}

fn classes_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let store = object_store(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let class_id = required_str(&req.params, "classId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("class not found"));
    }
    if !viewer.can_manage_class(conn, &class_id)? {
        return Err(HandlerErr::forbidden("not the owning teacher"));
    }

    // Stored objects go first, best-effort; a failed object removal must not
    // block deleting the class itself.
    let mut paths_stmt = conn.prepare(
        "SELECT file_path FROM submission_files
         WHERE submission_id IN (
           SELECT s.id FROM submissions s
           JOIN assignments a ON a.id = s.assignment_id
           WHERE a.class_id = ?
         )
         UNION ALL
         SELECT file_path FROM assignment_attachments
         WHERE assignment_id IN (SELECT id FROM assignments WHERE class_id = ?)
         UNION ALL
         SELECT file_path FROM study_materials WHERE class_id = ?",
    )?;
    let paths = paths_stmt
        .query_map([&class_id, &class_id, &class_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for path in paths {
        if let Err(e) = store.remove(&path) {
            warn!(file_path = %path, error = %e, "leaving orphaned object behind");
        }
    }

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM submission_files
         WHERE submission_id IN (
           SELECT s.id FROM submissions s
           JOIN assignments a ON a.id = s.assignment_id
           WHERE a.class_id = ?
         )",
        [&class_id],
    )?;
    tx.execute(
        "DELETE FROM submissions
         WHERE assignment_id IN (SELECT id FROM assignments WHERE class_id = ?)",
        [&class_id],
    )?;
    tx.execute(
        "DELETE FROM assignment_attachments
         WHERE assignment_id IN (SELECT id FROM assignments WHERE class_id = ?)",
        [&class_id],
    )?;
    tx.execute("DELETE FROM assignments WHERE class_id = ?", [&class_id])?;
    tx.execute("DELETE FROM study_materials WHERE class_id = ?", [&class_id])?;
    tx.execute("DELETE FROM class_enrollments WHERE class_id = ?", [&class_id])?;
    tx.execute("DELETE FROM classes WHERE id = ?", [&class_id])?;
    tx.commit()?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "classes.create" => classes_create(state, req),
        "classes.list" => classes_list(state, req),
        "classes.get" => classes_get(state, req),
        "classes.update" => classes_update(state, req),
        "classes.join" => classes_join(state, req),
        "classes.delete" => classes_delete(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
