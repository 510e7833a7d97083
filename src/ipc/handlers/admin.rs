use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{db_conn, load_viewer, object_store, optional_i64, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle;
use crate::viewer::{Role, Viewer};

fn require_admin(viewer: &Viewer) -> Result<(), HandlerErr> {
    if viewer.is_admin() {
        Ok(())
    } else {
        Err(HandlerErr::forbidden("admin only"))
    }
}

pub fn record_audit(
    conn: &Connection,
    admin_id: &str,
    action: &str,
    resource_type: &str,
    resource_id: Option<&str>,
    details: Option<&serde_json::Value>,
) -> Result<String, HandlerErr> {
    let entry_id = Uuid::new_v4().to_string();
    let created_at = lifecycle::format_ts(lifecycle::now_utc());
    conn.execute(
        "INSERT INTO admin_audit_logs(id, admin_id, action, resource_type, resource_id,
                                      details, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &entry_id,
            admin_id,
            action,
            resource_type,
            resource_id,
            details.map(|d| d.to_string()),
            &created_at,
        ),
    )?;
    Ok(entry_id)
}

fn admin_list_users(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    require_admin(&viewer)?;

    let role_filter = match optional_str(&req.params, "role") {
        Some(raw) => Some(
            Role::parse(&raw)
                .ok_or_else(|| {
                    HandlerErr::bad_params("role must be student, teacher, or admin")
                })?
                .as_str()
                .to_string(),
        ),
        None => None,
    };
    // Substring match over name and email, case-insensitive.
    let query_filter = optional_str(&req.params, "query")
        .map(|q| q.trim().to_lowercase())
        .filter(|q| !q.is_empty());

    let mut stmt = conn.prepare(
        "SELECT p.id, p.email, p.full_name, p.role, p.created_at,
                (SELECT COUNT(*) FROM classes c WHERE c.teacher_id = p.id),
                (SELECT COUNT(*) FROM class_enrollments e WHERE e.student_id = p.id)
         FROM profiles p
         WHERE (?1 IS NULL OR p.role = ?1)
           AND (?2 IS NULL
                OR instr(lower(p.full_name), ?2) > 0
                OR instr(lower(p.email), ?2) > 0)
         ORDER BY p.created_at",
    )?;
    let users = stmt
        .query_map((role_filter.as_deref(), query_filter.as_deref()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "email": r.get::<_, String>(1)?,
                "fullName": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?,
                "classesTaught": r.get::<_, i64>(5)?,
                "enrollments": r.get::<_, i64>(6)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({ "users": users }))
}

fn admin_set_role(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    require_admin(&viewer)?;

    let user_id = required_str(&req.params, "userId")?;
    let role = optional_str(&req.params, "role")
        .and_then(|r| Role::parse(&r))
        .ok_or_else(|| HandlerErr::bad_params("role must be student, teacher, or admin"))?;
    if user_id == viewer.id {
        return Err(HandlerErr::bad_params("cannot change your own role"));
    }

    let previous: Option<String> = conn
        .query_row("SELECT role FROM profiles WHERE id = ?", [&user_id], |r| {
            r.get(0)
        })
        .optional()?;
    let Some(previous) = previous else {
        return Err(HandlerErr::not_found("user not found"));
    };

    conn.execute(
        "UPDATE profiles SET role = ? WHERE id = ?",
        (role.as_str(), &user_id),
    )?;
    record_audit(
        conn,
        &viewer.id,
        "set_role",
        "profile",
        Some(&user_id),
        Some(&json!({ "from": previous, "to": role.as_str() })),
    )?;

    Ok(json!({ "userId": user_id, "role": role.as_str() }))
}

fn admin_delete_user(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let store = object_store(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    require_admin(&viewer)?;

    let user_id = required_str(&req.params, "userId")?;
    if user_id == viewer.id {
        return Err(HandlerErr::bad_params("cannot delete your own account"));
    }
    let role: Option<String> = conn
        .query_row("SELECT role FROM profiles WHERE id = ?", [&user_id], |r| {
            r.get(0)
        })
        .optional()?;
    let Some(role) = role else {
        return Err(HandlerErr::not_found("user not found"));
    };
    if role == "admin" {
        return Err(HandlerErr::forbidden("cannot delete an admin account"));
    }

    // A teacher's classes hold other students' work; they must be deleted
    // (or reassigned) one by one before the account can go.
    let owned: i64 = conn.query_row(
        "SELECT COUNT(*) FROM classes WHERE teacher_id = ?",
        [&user_id],
        |r| r.get(0),
    )?;
    if owned > 0 {
        return Err(HandlerErr::with_details(
            "user_owns_classes",
            "delete or reassign this user's classes first",
            json!({ "classCount": owned }),
        ));
    }

    // The user's own uploads go first, best-effort.
    let mut paths_stmt = conn.prepare(
        "SELECT file_path FROM submission_files
         WHERE submission_id IN (SELECT id FROM submissions WHERE student_id = ?)
         UNION ALL
         SELECT file_path FROM study_materials WHERE uploaded_by = ?",
    )?;
    let paths = paths_stmt
        .query_map([&user_id, &user_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for path in paths {
        if let Err(e) = store.remove(&path) {
            warn!(file_path = %path, error = %e, "leaving orphaned object behind");
        }
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM submission_files
         WHERE submission_id IN (SELECT id FROM submissions WHERE student_id = ?)",
        [&user_id],
    )?;
    tx.execute("DELETE FROM submissions WHERE student_id = ?", [&user_id])?;
    tx.execute(
        "DELETE FROM study_materials WHERE uploaded_by = ?",
        [&user_id],
    )?;
    tx.execute(
        "DELETE FROM class_enrollments WHERE student_id = ?",
        [&user_id],
    )?;
    tx.execute("DELETE FROM profiles WHERE id = ?", [&user_id])?;
    tx.commit()?;

    record_audit(
        conn,
        &viewer.id,
        "delete_user",
        "profile",
        Some(&user_id),
        Some(&json!({ "role": role })),
    )?;

    Ok(json!({ "ok": true }))
}

fn audit_record(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    require_admin(&viewer)?;

    let action = required_str(&req.params, "action")?;
    let resource_type = required_str(&req.params, "resourceType")?;
    let resource_id = optional_str(&req.params, "resourceId");
    let details = req.params.get("details");

    let entry_id = record_audit(
        conn,
        &viewer.id,
        &action,
        &resource_type,
        resource_id.as_deref(),
        details,
    )?;
    Ok(json!({ "entryId": entry_id }))
}

fn audit_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    require_admin(&viewer)?;

    let limit = optional_i64(&req.params, "limit").unwrap_or(50).clamp(1, 500);
    let mut stmt = conn.prepare(
        "SELECT l.id, l.admin_id, p.email, l.action, l.resource_type, l.resource_id,
                l.details, l.created_at
         FROM admin_audit_logs l
         JOIN profiles p ON p.id = l.admin_id
         ORDER BY l.created_at DESC, l.id
         LIMIT ?",
    )?;
    let entries = stmt
        .query_map([limit], |r| {
            let details: Option<String> = r.get(6)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "adminId": r.get::<_, String>(1)?,
                "adminEmail": r.get::<_, String>(2)?,
                "action": r.get::<_, String>(3)?,
                "resourceType": r.get::<_, String>(4)?,
                "resourceId": r.get::<_, Option<String>>(5)?,
                "details": details
                    .and_then(|d| serde_json::from_str::<serde_json::Value>(&d).ok()),
                "createdAt": r.get::<_, String>(7)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({ "entries": entries }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "admin.listUsers" => admin_list_users(state, req),
        "admin.setRole" => admin_set_role(state, req),
        "admin.deleteUser" => admin_delete_user(state, req),
        "audit.record" => audit_record(state, req),
        "audit.list" => audit_list(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
