use std::path::Path;

use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{db_conn, load_viewer, object_store, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle;
use crate::storage::{ObjectStore, MATERIALS_BUCKET};
use crate::viewer::Viewer;

pub struct UploadedObject {
    pub file_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub file_type: String,
}

/// Copies the file named by `params.sourcePath` into the store under
/// `<bucket>/<owner_id>/<uuid>.<ext>`.
pub fn store_object(
    store: &ObjectStore,
    bucket: &str,
    owner_id: &str,
    params: &serde_json::Value,
) -> Result<UploadedObject, HandlerErr> {
    let source = required_str(params, "sourcePath")?;
    let source_path = Path::new(&source);
    let file_name = optional_str(params, "fileName")
        .or_else(|| {
            source_path
                .file_name()
                .and_then(|s| s.to_str())
                .map(|s| s.to_string())
        })
        .ok_or_else(|| HandlerErr::bad_params("cannot derive fileName from sourcePath"))?;
    let file_type =
        optional_str(params, "fileType").unwrap_or_else(|| "application/octet-stream".to_string());

    let ext = Path::new(&file_name)
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("bin");
    let key = format!("{}/{}.{}", owner_id, Uuid::new_v4(), ext);

    let (file_path, size) = store
        .upload(bucket, &key, source_path)
        .map_err(|e| HandlerErr::new("storage_upload_failed", format!("{e:#}")))?;

    Ok(UploadedObject {
        file_name,
        file_path,
        file_size: size as i64,
        file_type,
    })
}

pub fn file_meta_json(
    id: &str,
    file_name: &str,
    file_path: &str,
    file_size: i64,
    file_type: &str,
    created_at: &str,
) -> serde_json::Value {
    json!({
        "id": id,
        "fileName": file_name,
        "filePath": file_path,
        "fileSize": file_size,
        "fileType": file_type,
        "createdAt": created_at,
    })
}

struct FileRecord {
    owner_id: String,
    file_name: String,
    file_path: String,
}

fn load_file_record(
    conn: &Connection,
    kind: &str,
    file_id: &str,
) -> Result<FileRecord, HandlerErr> {
    let (table, owner_col) = match kind {
        "submission" => ("submission_files", "submission_id"),
        "attachment" => ("assignment_attachments", "assignment_id"),
        "material" => ("study_materials", "class_id"),
        _ => {
            return Err(HandlerErr::bad_params(
                "kind must be submission, attachment, or material",
            ))
        }
    };
    let sql = format!(
        "SELECT {owner_col}, file_name, file_path FROM {table} WHERE id = ?"
    );
    let row = conn
        .query_row(&sql, [file_id], |r| {
            Ok(FileRecord {
                owner_id: r.get(0)?,
                file_name: r.get(1)?,
                file_path: r.get(2)?,
            })
        })
        .optional()?;
    row.ok_or_else(|| HandlerErr::not_found("file not found"))
}

fn can_read_file(
    conn: &Connection,
    viewer: &Viewer,
    kind: &str,
    record: &FileRecord,
) -> Result<bool, HandlerErr> {
    match kind {
        "submission" => {
            let row = conn
                .query_row(
                    "SELECT s.student_id, c.id
                     FROM submissions s
                     JOIN assignments a ON a.id = s.assignment_id
                     JOIN classes c ON c.id = a.class_id
                     WHERE s.id = ?",
                    [&record.owner_id],
                    |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
                )
                .optional()?;
            let Some((student_id, class_id)) = row else {
                return Ok(false);
            };
            Ok(student_id == viewer.id || viewer.can_manage_class(conn, &class_id)?)
        }
        "attachment" => {
            let class_id: Option<String> = conn
                .query_row(
                    "SELECT class_id FROM assignments WHERE id = ?",
                    [&record.owner_id],
                    |r| r.get(0),
                )
                .optional()?;
            match class_id {
                Some(class_id) => viewer.can_view_class(conn, &class_id),
                None => Ok(false),
            }
        }
        "material" => viewer.can_view_class(conn, &record.owner_id),
        _ => Ok(false),
    }
}

fn files_url(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let store = object_store(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let kind = required_str(&req.params, "kind")?;
    let file_id = required_str(&req.params, "fileId")?;

    let record = load_file_record(conn, &kind, &file_id)?;
    if !can_read_file(conn, &viewer, &kind, &record)? {
        return Err(HandlerErr::forbidden("no access to this file"));
    }
    let path = store
        .object_path(&record.file_path)
        .map_err(|e| HandlerErr::new("storage_path_invalid", format!("{e:#}")))?;
    Ok(json!({
        "fileName": record.file_name,
        "url": path.to_string_lossy(),
    }))
}

fn materials_upload(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
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

    let file_params = req
        .params
        .get("file")
        .ok_or_else(|| HandlerErr::bad_params("missing file"))?;
    let uploaded = store_object(store, MATERIALS_BUCKET, &class_id, file_params)?;

    let material_id = Uuid::new_v4().to_string();
    let created_at = lifecycle::format_ts(lifecycle::now_utc());
    conn.execute(
        "INSERT INTO study_materials(id, class_id, uploaded_by, file_name, file_path,
                                     file_size, file_type, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &material_id,
            &class_id,
            &viewer.id,
            &uploaded.file_name,
            &uploaded.file_path,
            uploaded.file_size,
            &uploaded.file_type,
            &created_at,
        ),
    )?;

    Ok(json!({
        "material": file_meta_json(
            &material_id,
            &uploaded.file_name,
            &uploaded.file_path,
            uploaded.file_size,
            &uploaded.file_type,
            &created_at,
        )
    }))
}

fn materials_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let class_id = required_str(&req.params, "classId")?;

    if !viewer.can_view_class(conn, &class_id)? {
        return Err(HandlerErr::forbidden("not a member of this class"));
    }

    let mut stmt = conn.prepare(
        "SELECT id, file_name, file_path, file_size, file_type, created_at
         FROM study_materials
         WHERE class_id = ?
         ORDER BY created_at DESC",
    )?;
    let materials = stmt
        .query_map([&class_id], |r| {
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

    Ok(json!({ "materials": materials }))
}

fn materials_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let store = object_store(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let file_id = required_str(&req.params, "fileId")?;

    let record = load_file_record(conn, "material", &file_id)?;
    if !viewer.can_manage_class(conn, &record.owner_id)? {
        return Err(HandlerErr::forbidden("not the owning teacher"));
    }

    // Storage first; a failed object delete keeps the metadata row.
    store
        .remove(&record.file_path)
        .map_err(|e| HandlerErr::new("storage_delete_failed", format!("{e:#}")))?;
    conn.execute("DELETE FROM study_materials WHERE id = ?", [&file_id])?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "files.url" => files_url(state, req),
        "materials.upload" => materials_upload(state, req),
        "materials.list" => materials_list(state, req),
        "materials.delete" => materials_delete(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
