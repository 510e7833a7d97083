use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::HandlerErr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Role> {
        match raw {
            "student" => Some(Role::Student),
            "teacher" => Some(Role::Teacher),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
        }
    }
}

/// The acting profile, resolved once per request. Handlers consult the
/// capability surface instead of re-deriving role comparisons inline.
#[derive(Debug, Clone)]
pub struct Viewer {
    pub id: String,
    pub email: String,
    pub full_name: String,
    pub role: Role,
}

impl Viewer {
    pub fn load(conn: &Connection, actor_id: &str) -> Result<Viewer, HandlerErr> {
        let row = conn
            .query_row(
                "SELECT id, email, full_name, role FROM profiles WHERE id = ?",
                [actor_id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, email, full_name, role_raw)) = row else {
            return Err(HandlerErr::not_found("unknown actor"));
        };
        let Some(role) = Role::parse(&role_raw) else {
            return Err(HandlerErr::new(
                "server_error",
                format!("profile {} has invalid role {}", id, role_raw),
            ));
        };
        Ok(Viewer {
            id,
            email,
            full_name,
            role,
        })
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn can_create_class(&self) -> bool {
        matches!(self.role, Role::Teacher | Role::Admin)
    }

    pub fn can_enroll(&self) -> bool {
        self.role == Role::Student
    }

    pub fn capabilities(&self) -> serde_json::Value {
        json!({
            "canCreateClass": self.can_create_class(),
            "canEnroll": self.can_enroll(),
            "canGrade": matches!(self.role, Role::Teacher | Role::Admin),
            "canManageUsers": self.is_admin(),
            "canViewAudit": self.is_admin(),
        })
    }

    /// Owning teacher or admin.
    pub fn can_manage_class(&self, conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
        if self.is_admin() {
            return Ok(true);
        }
        let teacher_id: Option<String> = conn
            .query_row(
                "SELECT teacher_id FROM classes WHERE id = ?",
                [class_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(teacher_id.as_deref() == Some(self.id.as_str()))
    }

    /// Owner, enrolled student, or admin.
    pub fn can_view_class(&self, conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
        if self.can_manage_class(conn, class_id)? {
            return Ok(true);
        }
        let enrolled: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM class_enrollments WHERE class_id = ? AND student_id = ?",
                [class_id, self.id.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(enrolled.is_some())
    }

    pub fn profile_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "email": self.email,
            "fullName": self.full_name,
            "role": self.role.as_str(),
        })
    }
}
