use rusqlite::OptionalExtension;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::files::{file_meta_json, store_object};
use crate::ipc::helpers::{
    db_conn, load_viewer, object_store, optional_i64, optional_str, optional_ts, required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle;
use crate::storage::ATTACHMENTS_BUCKET;
use crate::viewer::Role;

fn assignment_base_json(
    id: &str,
    class_id: &str,
    class_name: &str,
    title: &str,
    description: Option<String>,
    due_date: Option<String>,
    points: i64,
    created_at: &str,
) -> serde_json::Value {
    json!({
        "id": id,
        "classId": class_id,
        "className": class_name,
        "title": title,
        "description": description,
        "dueDate": due_date,
        "points": points,
        "createdAt": created_at,
    })
}

fn parse_points(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    let points = optional_i64(params, key)
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if points <= 0 {
        return Err(HandlerErr::bad_params("points must be a positive integer"));
    }
    Ok(points)
}

fn assignments_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let class_id = required_str(&req.params, "classId")?;

    let class_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()?;
    if class_exists.is_none() {
        return Err(HandlerErr::not_found("class not found"));
    }
    if !viewer.can_manage_class(conn, &class_id)? {
        return Err(HandlerErr::forbidden("not the owning teacher"));
    }

    let title = required_str(&req.params, "title")?.trim().to_string();
    if title.is_empty() {
        return Err(HandlerErr::bad_params("title must not be empty"));
    }
    let description = optional_str(&req.params, "description");
    let due_date = optional_ts(&req.params, "dueDate")?.map(lifecycle::format_ts);
    let points = parse_points(&req.params, "points")?;

    let assignment_id = Uuid::new_v4().to_string();
    let created_at = lifecycle::format_ts(lifecycle::now_utc());
    conn.execute(
        "INSERT INTO assignments(id, class_id, title, description, due_date, points, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &assignment_id,
            &class_id,
            &title,
            description.as_deref(),
            due_date.as_deref(),
            points,
            &created_at,
        ),
    )?;

    Ok(json!({
        "assignment": {
            "id": assignment_id,
            "classId": class_id,
            "title": title,
            "description": description,
            "dueDate": due_date,
            "points": points,
            "createdAt": created_at,
        }
    }))
}

fn assignments_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let class_filter = optional_str(&req.params, "classId");

    if let Some(class_id) = &class_filter {
        if !viewer.can_view_class(conn, class_id)? {
            return Err(HandlerErr::forbidden("not a member of this class"));
        }
    }

    let assignments = match viewer.role {
        Role::Student => {
            let sql = "SELECT a.id, a.class_id, c.name, a.title, a.description, a.due_date,
                              a.points, a.created_at,
                              s.id, s.status, s.grade, s.is_late
                       FROM assignments a
                       JOIN classes c ON c.id = a.class_id
                       LEFT JOIN submissions s
                         ON s.assignment_id = a.id AND s.student_id = ?1
                       WHERE a.class_id IN (
                           SELECT class_id FROM class_enrollments WHERE student_id = ?1
                         )
                         AND (?2 IS NULL OR a.class_id = ?2)
                       ORDER BY a.due_date IS NULL, a.due_date, a.created_at";
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map((&viewer.id, class_filter.as_deref()), |r| {
                    let mut value = assignment_base_json(
                        &r.get::<_, String>(0)?,
                        &r.get::<_, String>(1)?,
                        &r.get::<_, String>(2)?,
                        &r.get::<_, String>(3)?,
                        r.get(4)?,
                        r.get(5)?,
                        r.get(6)?,
                        &r.get::<_, String>(7)?,
                    );
                    let submission_id: Option<String> = r.get(8)?;
                    value["submission"] = match submission_id {
                        Some(id) => {
                            let status: String = r.get(9)?;
                            let grade: Option<i64> = r.get(10)?;
                            let is_late: i64 = r.get(11)?;
                            json!({
                                "id": id,
                                "status": status,
                                "grade": grade,
                                "isLate": is_late != 0,
                            })
                        }
                        None => serde_json::Value::Null,
                    };
                    Ok(value)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        Role::Teacher | Role::Admin => {
            let sql = "SELECT a.id, a.class_id, c.name, a.title, a.description, a.due_date,
                              a.points, a.created_at,
                              (SELECT COUNT(*) FROM submissions s WHERE s.assignment_id = a.id)
                       FROM assignments a
                       JOIN classes c ON c.id = a.class_id
                       WHERE (?1 IS NULL OR c.teacher_id = ?1)
                         AND (?2 IS NULL OR a.class_id = ?2)
                       ORDER BY a.created_at DESC";
            let teacher_scope = if viewer.is_admin() {
                None
            } else {
                Some(viewer.id.clone())
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map((teacher_scope.as_deref(), class_filter.as_deref()), |r| {
                    let mut value = assignment_base_json(
                        &r.get::<_, String>(0)?,
                        &r.get::<_, String>(1)?,
                        &r.get::<_, String>(2)?,
                        &r.get::<_, String>(3)?,
                        r.get(4)?,
                        r.get(5)?,
                        r.get(6)?,
                        &r.get::<_, String>(7)?,
                    );
                    let submission_count: i64 = r.get(8)?;
                    value["submissionCount"] = json!(submission_count);
                    Ok(value)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };

    Ok(json!({ "assignments": assignments }))
}

struct AssignmentRow {
    class_id: String,
}

fn load_assignment(
    conn: &rusqlite::Connection,
    assignment_id: &str,
) -> Result<AssignmentRow, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT class_id FROM assignments WHERE id = ?",
            [assignment_id],
            |r| {
                Ok(AssignmentRow {
                    class_id: r.get(0)?,
                })
            },
        )
        .optional()?;
    row.ok_or_else(|| HandlerErr::not_found("assignment not found"))
}

fn assignments_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let assignment_id = required_str(&req.params, "assignmentId")?;

    let row = conn
        .query_row(
            "SELECT a.id, a.class_id, c.name, a.title, a.description, a.due_date, a.points,
                    a.created_at, c.teacher_id, c.allow_late_submissions
             FROM assignments a
             JOIN classes c ON c.id = a.class_id
             WHERE a.id = ?",
            [&assignment_id],
            |r| {
                let mut value = assignment_base_json(
                    &r.get::<_, String>(0)?,
                    &r.get::<_, String>(1)?,
                    &r.get::<_, String>(2)?,
                    &r.get::<_, String>(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    &r.get::<_, String>(7)?,
                );
                value["teacherId"] = json!(r.get::<_, String>(8)?);
                value["allowLateSubmissions"] = json!(r.get::<_, i64>(9)? != 0);
                Ok(value)
            },
        )
        .optional()?;
    let Some(assignment) = row else {
        return Err(HandlerErr::not_found("assignment not found"));
    };
    let class_id = assignment["classId"].as_str().unwrap_or_default().to_string();
    if !viewer.can_view_class(conn, &class_id)? {
        return Err(HandlerErr::forbidden("not a member of this class"));
    }

    let mut stmt = conn.prepare(
        "SELECT id, file_name, file_path, file_size, file_type, created_at
         FROM assignment_attachments
         WHERE assignment_id = ?
         ORDER BY created_at DESC",
    )?;
    let attachments = stmt
        .query_map([&assignment_id], |r| {
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
        "assignment": assignment,
        "attachments": attachments,
    }))
}

fn assignments_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let assignment_id = required_str(&req.params, "assignmentId")?;

    let assignment = load_assignment(conn, &assignment_id)?;
    if !viewer.can_manage_class(conn, &assignment.class_id)? {
        return Err(HandlerErr::forbidden("not the owning teacher"));
    }

    let patch = req
        .params
        .get("patch")
        .cloned()
        .unwrap_or_else(|| json!({}));
    if let Some(title) = optional_str(&patch, "title") {
        let title = title.trim().to_string();
        if title.is_empty() {
            return Err(HandlerErr::bad_params("title must not be empty"));
        }
        conn.execute(
            "UPDATE assignments SET title = ? WHERE id = ?",
            (&title, &assignment_id),
        )?;
    }
    if patch.get("description").is_some() {
        conn.execute(
            "UPDATE assignments SET description = ? WHERE id = ?",
            (optional_str(&patch, "description").as_deref(), &assignment_id),
        )?;
    }
    if patch.get("dueDate").is_some() {
        // A due-date edit does not reflag existing rows; is_late is frozen at
        // submission-write time.
        let due_date = optional_ts(&patch, "dueDate")?.map(lifecycle::format_ts);
        conn.execute(
            "UPDATE assignments SET due_date = ? WHERE id = ?",
            (due_date.as_deref(), &assignment_id),
        )?;
    }
    if patch.get("points").is_some() {
        let points = parse_points(&patch, "points")?;
        conn.execute(
            "UPDATE assignments SET points = ? WHERE id = ?",
            (points, &assignment_id),
        )?;
    }

    Ok(json!({ "ok": true }))
}

fn assignments_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let store = object_store(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let assignment_id = required_str(&req.params, "assignmentId")?;

    let assignment = load_assignment(conn, &assignment_id)?;
    if !viewer.can_manage_class(conn, &assignment.class_id)? {
        return Err(HandlerErr::forbidden("not the owning teacher"));
    }

    let mut paths_stmt = conn.prepare(
        "SELECT file_path FROM submission_files
         WHERE submission_id IN (SELECT id FROM submissions WHERE assignment_id = ?)
         UNION ALL
         SELECT file_path FROM assignment_attachments WHERE assignment_id = ?",
    )?;
    let paths = paths_stmt
        .query_map([&assignment_id, &assignment_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for path in paths {
        if let Err(e) = store.remove(&path) {
            warn!(file_path = %path, error = %e, "leaving orphaned object behind");
        }
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM submission_files
         WHERE submission_id IN (SELECT id FROM submissions WHERE assignment_id = ?)",
        [&assignment_id],
    )?;
    tx.execute(
        "DELETE FROM submissions WHERE assignment_id = ?",
        [&assignment_id],
    )?;
    tx.execute(
        "DELETE FROM assignment_attachments WHERE assignment_id = ?",
        [&assignment_id],
    )?;
    tx.execute("DELETE FROM assignments WHERE id = ?", [&assignment_id])?;
    tx.commit()?;

    Ok(json!({ "ok": true }))
}

fn assignments_attach(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let store = object_store(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let assignment_id = required_str(&req.params, "assignmentId")?;

    let assignment = load_assignment(conn, &assignment_id)?;
    if !viewer.can_manage_class(conn, &assignment.class_id)? {
        return Err(HandlerErr::forbidden("not the owning teacher"));
    }

    let file_params = req
        .params
        .get("file")
        .ok_or_else(|| HandlerErr::bad_params("missing file"))?;
    let uploaded = store_object(store, ATTACHMENTS_BUCKET, &assignment_id, file_params)?;

    let file_id = Uuid::new_v4().to_string();
    let created_at = lifecycle::format_ts(lifecycle::now_utc());
    conn.execute(
        "INSERT INTO assignment_attachments(id, assignment_id, file_name, file_path,
                                            file_size, file_type, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &file_id,
            &assignment_id,
            &uploaded.file_name,
            &uploaded.file_path,
            uploaded.file_size,
            &uploaded.file_type,
            &created_at,
        ),
    )?;

    Ok(json!({
        "attachment": file_meta_json(
            &file_id,
            &uploaded.file_name,
            &uploaded.file_path,
            uploaded.file_size,
            &uploaded.file_type,
            &created_at,
        )
    }))
}

fn assignments_delete_attachment(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let store = object_store(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let file_id = required_str(&req.params, "fileId")?;

    let row = conn
        .query_row(
            "SELECT f.file_path, a.class_id
             FROM assignment_attachments f
             JOIN assignments a ON a.id = f.assignment_id
             WHERE f.id = ?",
            [&file_id],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
        )
        .optional()?;
    let Some((file_path, class_id)) = row else {
        return Err(HandlerErr::not_found("attachment not found"));
    };
    if !viewer.can_manage_class(conn, &class_id)? {
        return Err(HandlerErr::forbidden("not the owning teacher"));
    }

    // Storage first; a failed object delete keeps the metadata row.
    store
        .remove(&file_path)
        .map_err(|e| HandlerErr::new("storage_delete_failed", format!("{e:#}")))?;
    conn.execute("DELETE FROM assignment_attachments WHERE id = ?", [&file_id])?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "assignments.create" => assignments_create(state, req),
        "assignments.list" => assignments_list(state, req),
        "assignments.get" => assignments_get(state, req),
        "assignments.update" => assignments_update(state, req),
        "assignments.delete" => assignments_delete(state, req),
        "assignments.attach" => assignments_attach(state, req),
        "assignments.deleteAttachment" => assignments_delete_attachment(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
