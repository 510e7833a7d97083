use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{db_conn, is_unique_violation, load_viewer, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle;
use crate::viewer::Role;

fn profiles_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;

    let email = required_str(&req.params, "email")?.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(HandlerErr::bad_params("email must be a valid address"));
    }
    let full_name = required_str(&req.params, "fullName")?.trim().to_string();
    if full_name.is_empty() {
        return Err(HandlerErr::bad_params("fullName must not be empty"));
    }
    let role = match optional_str(&req.params, "role") {
        Some(raw) => Role::parse(&raw)
            .ok_or_else(|| HandlerErr::bad_params("role must be student, teacher, or admin"))?,
        None => Role::Student,
    };

    let profile_id = Uuid::new_v4().to_string();
    let created_at = lifecycle::format_ts(lifecycle::now_utc());
    if let Err(e) = conn.execute(
        "INSERT INTO profiles(id, email, full_name, role, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&profile_id, &email, &full_name, role.as_str(), &created_at),
    ) {
        if is_unique_violation(&e) {
            return Err(HandlerErr::new(
                "email_taken",
                "a profile with this email already exists",
            ));
        }
        return Err(HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "profiles" }),
        ));
    }

    Ok(json!({
        "profile": {
            "id": profile_id,
            "email": email,
            "fullName": full_name,
            "role": role.as_str(),
            "createdAt": created_at,
        }
    }))
}

fn session_open(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    Ok(json!({
        "profile": viewer.profile_json(),
        "capabilities": viewer.capabilities(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "profiles.create" => profiles_create(state, req),
        "session.open" => session_open(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
