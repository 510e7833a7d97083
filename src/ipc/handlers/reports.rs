use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{db_conn, load_viewer, optional_str};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle;
use crate::viewer::Viewer;

fn count(conn: &Connection, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<i64, HandlerErr> {
    Ok(conn.query_row(sql, params, |r| r.get(0))?)
}

fn require_class_manager(
    conn: &Connection,
    viewer: &Viewer,
    class_id: &str,
) -> Result<(), HandlerErr> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("class not found"));
    }
    if !viewer.can_manage_class(conn, class_id)? {
        return Err(HandlerErr::forbidden("not the owning teacher"));
    }
    Ok(())
}

/// Teachers report over the classes they own, admins over everything. An
/// explicit classId narrows to one class the caller can manage. Returns the
/// teacher-id scope bind (None for admins).
fn report_scope(
    conn: &Connection,
    viewer: &Viewer,
    class_filter: Option<&str>,
) -> Result<Option<String>, HandlerErr> {
    match class_filter {
        Some(class_id) => require_class_manager(conn, viewer, class_id)?,
        None => {
            if viewer.can_enroll() {
                return Err(HandlerErr::forbidden("not a teacher"));
            }
        }
    }
    Ok(if viewer.is_admin() {
        None
    } else {
        Some(viewer.id.clone())
    })
}

fn reports_dashboard(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;

    if viewer.is_admin() {
        return Ok(json!({
            "role": "admin",
            "totalUsers": count(conn, "SELECT COUNT(*) FROM profiles", &[])?,
            "totalClasses": count(conn, "SELECT COUNT(*) FROM classes", &[])?,
            "totalAssignments": count(conn, "SELECT COUNT(*) FROM assignments", &[])?,
            "totalSubmissions": count(conn, "SELECT COUNT(*) FROM submissions", &[])?,
        }));
    }

    if viewer.can_enroll() {
        let enrolled = count(
            conn,
            "SELECT COUNT(*) FROM class_enrollments WHERE student_id = ?",
            &[&viewer.id],
        )?;
        // Assignments in enrolled classes with no submission from this student.
        let pending = count(
            conn,
            "SELECT COUNT(*) FROM assignments a
             JOIN class_enrollments e ON e.class_id = a.class_id AND e.student_id = ?1
             WHERE NOT EXISTS (
               SELECT 1 FROM submissions s
               WHERE s.assignment_id = a.id AND s.student_id = ?1
             )",
            &[&viewer.id],
        )?;
        let submitted = count(
            conn,
            "SELECT COUNT(*) FROM submissions WHERE student_id = ?",
            &[&viewer.id],
        )?;
        let graded = count(
            conn,
            "SELECT COUNT(*) FROM submissions WHERE student_id = ? AND grade IS NOT NULL",
            &[&viewer.id],
        )?;
        return Ok(json!({
            "role": "student",
            "enrolledClasses": enrolled,
            "pendingAssignments": pending,
            "submittedCount": submitted,
            "gradedCount": graded,
        }));
    }

    let classes = count(
        conn,
        "SELECT COUNT(*) FROM classes WHERE teacher_id = ?",
        &[&viewer.id],
    )?;
    let students = count(
        conn,
        "SELECT COUNT(DISTINCT e.student_id)
         FROM class_enrollments e
         JOIN classes c ON c.id = e.class_id
         WHERE c.teacher_id = ?",
        &[&viewer.id],
    )?;
    let assignments = count(
        conn,
        "SELECT COUNT(*) FROM assignments a
         JOIN classes c ON c.id = a.class_id
         WHERE c.teacher_id = ?",
        &[&viewer.id],
    )?;
    let ungraded = count(
        conn,
        "SELECT COUNT(*) FROM submissions s
         JOIN assignments a ON a.id = s.assignment_id
         JOIN classes c ON c.id = a.class_id
         WHERE c.teacher_id = ? AND s.grade IS NULL",
        &[&viewer.id],
    )?;
    Ok(json!({
        "role": "teacher",
        "classCount": classes,
        "studentCount": students,
        "assignmentCount": assignments,
        "ungradedSubmissions": ungraded,
    }))
}

fn graded_percents(
    conn: &Connection,
    teacher_scope: Option<&str>,
    class_filter: Option<&str>,
) -> Result<Vec<f64>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT s.grade, a.points
         FROM submissions s
         JOIN assignments a ON a.id = s.assignment_id
         JOIN classes c ON c.id = a.class_id
         WHERE s.grade IS NOT NULL AND a.points > 0
           AND (?1 IS NULL OR c.teacher_id = ?1)
           AND (?2 IS NULL OR a.class_id = ?2)",
    )?;
    let percents = stmt
        .query_map((teacher_scope, class_filter), |r| {
            let grade: i64 = r.get(0)?;
            let points: i64 = r.get(1)?;
            Ok(lifecycle::grade_percent(grade, points))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(percents)
}

fn distribution_json(percents: &[f64]) -> Vec<serde_json::Value> {
    lifecycle::grade_distribution(percents)
        .into_iter()
        .map(|b| json!({ "range": b.range, "count": b.count }))
        .collect()
}

fn reports_grade_distribution(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let class_filter = optional_str(&req.params, "classId");
    let teacher_scope = report_scope(conn, &viewer, class_filter.as_deref())?;

    let percents = graded_percents(conn, teacher_scope.as_deref(), class_filter.as_deref())?;
    Ok(json!({
        "gradedCount": percents.len(),
        "distribution": distribution_json(&percents),
    }))
}

fn reports_at_risk(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    let class_filter = optional_str(&req.params, "classId");
    let teacher_scope = report_scope(conn, &viewer, class_filter.as_deref())?;

    let assignment_total = count(
        conn,
        "SELECT COUNT(*) FROM assignments a
         JOIN classes c ON c.id = a.class_id
         WHERE (?1 IS NULL OR c.teacher_id = ?1)
           AND (?2 IS NULL OR a.class_id = ?2)",
        &[&teacher_scope, &class_filter],
    )?;

    // Assigned/submitted are summed per enrollment, so a student behind in
    // several of the scope's classes accumulates across all of them.
    let mut stmt = conn.prepare(
        "SELECT p.id, p.full_name, p.email,
                SUM((SELECT COUNT(*) FROM assignments a WHERE a.class_id = e.class_id)),
                SUM((SELECT COUNT(*) FROM submissions s
                     JOIN assignments a ON a.id = s.assignment_id
                     WHERE a.class_id = e.class_id AND s.student_id = p.id))
         FROM class_enrollments e
         JOIN classes c ON c.id = e.class_id
         JOIN profiles p ON p.id = e.student_id
         WHERE (?1 IS NULL OR c.teacher_id = ?1)
           AND (?2 IS NULL OR e.class_id = ?2)
         GROUP BY p.id
         ORDER BY p.full_name",
    )?;
    let students = stmt
        .query_map((teacher_scope.as_deref(), class_filter.as_deref()), |r| {
            let id: String = r.get(0)?;
            let full_name: String = r.get(1)?;
            let email: String = r.get(2)?;
            let assigned: i64 = r.get(3)?;
            let submitted: i64 = r.get(4)?;
            Ok((id, full_name, email, assigned, submitted))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let at_risk = students
        .into_iter()
        .filter_map(|(id, full_name, email, assigned, submitted)| {
            let missing = lifecycle::missing_count(assigned, submitted);
            if lifecycle::is_at_risk(missing) {
                Some(json!({
                    "studentId": id,
                    "fullName": full_name,
                    "email": email,
                    "missingCount": missing,
                }))
            } else {
                None
            }
        })
        .collect::<Vec<_>>();

    Ok(json!({
        "assignmentCount": assignment_total,
        "atRisk": at_risk,
    }))
}

fn reports_analytics(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let viewer = load_viewer(conn, &req.params)?;
    if !viewer.is_admin() {
        return Err(HandlerErr::forbidden("admin only"));
    }

    let total_users = count(conn, "SELECT COUNT(*) FROM profiles", &[])?;
    let teachers = count(
        conn,
        "SELECT COUNT(*) FROM profiles WHERE role = 'teacher'",
        &[],
    )?;
    let students = count(
        conn,
        "SELECT COUNT(*) FROM profiles WHERE role = 'student'",
        &[],
    )?;
    let total_classes = count(conn, "SELECT COUNT(*) FROM classes", &[])?;
    let total_assignments = count(conn, "SELECT COUNT(*) FROM assignments", &[])?;
    let total_submissions = count(conn, "SELECT COUNT(*) FROM submissions", &[])?;
    let total_enrollments = count(conn, "SELECT COUNT(*) FROM class_enrollments", &[])?;
    let graded = count(
        conn,
        "SELECT COUNT(*) FROM submissions WHERE grade IS NOT NULL",
        &[],
    )?;
    let late = count(
        conn,
        "SELECT COUNT(*) FROM submissions WHERE is_late = 1",
        &[],
    )?;

    let ratio = |num: i64, den: i64| if den > 0 { num as f64 / den as f64 } else { 0.0 };

    let percents = graded_percents(conn, None, None)?;

    // Top 5 teachers by distinct enrolled students across their classes.
    let mut stmt = conn.prepare(
        "SELECT p.full_name,
                (SELECT COUNT(*) FROM classes c WHERE c.teacher_id = p.id),
                (SELECT COUNT(DISTINCT e.student_id)
                 FROM class_enrollments e
                 JOIN classes c ON c.id = e.class_id
                 WHERE c.teacher_id = p.id)
         FROM profiles p
         WHERE p.role = 'teacher'
         ORDER BY 3 DESC, p.full_name
         LIMIT 5",
    )?;
    let top_teachers = stmt
        .query_map([], |r| {
            Ok(json!({
                "name": r.get::<_, String>(0)?,
                "classCount": r.get::<_, i64>(1)?,
                "studentCount": r.get::<_, i64>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({
        "totalUsers": total_users,
        "teacherCount": teachers,
        "studentCount": students,
        "totalClasses": total_classes,
        "totalAssignments": total_assignments,
        "totalSubmissions": total_submissions,
        "avgStudentsPerClass": ratio(total_enrollments, total_classes),
        "avgAssignmentsPerClass": ratio(total_assignments, total_classes),
        "avgSubmissionsPerAssignment": ratio(total_submissions, total_assignments),
        "gradedRate": ratio(graded, total_submissions),
        "lateSubmissions": late,
        "gradeDistribution": distribution_json(&percents),
        "topTeachers": top_teachers,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "reports.dashboard" => reports_dashboard(state, req),
        "reports.gradeDistribution" => reports_grade_distribution(state, req),
        "reports.atRisk" => reports_at_risk(state, req),
        "reports.analytics" => reports_analytics(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
