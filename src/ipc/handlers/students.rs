use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_students_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let first_name = match req.params.get("firstName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing firstName", None),
    };
    let last_name = match req.params.get("lastName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing lastName", None),
    };
    if first_name.is_empty() || last_name.is_empty() {
        return err(&req.id, "bad_params", "names must not be empty", None);
    }
    let class_id = req
        .params
        .get("classId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if let Some(cid) = class_id.as_deref() {
        let exists: Option<i64> = match conn
            .query_row("SELECT 1 FROM classes WHERE id = ?", [cid], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if exists.is_none() {
            return err(&req.id, "not_found", "class not found", None);
        }
    }

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, first_name, last_name, class_id, active, status, archived, deleted)
         VALUES(?, ?, ?, ?, 1, 'enrolled', 0, 0)",
        (&student_id, &first_name, &last_name, &class_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "classId": class_id }),
    )
}

fn handle_students_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let row = conn
        .query_row(
            "SELECT s.id, s.first_name, s.last_name, s.class_id, s.active, s.status,
                    s.archived, s.deleted, c.grade, c.section, c.year
             FROM students s
             LEFT JOIN classes c ON c.id = s.class_id
             WHERE s.id = ?",
            [&student_id],
            |r| {
                let active: i64 = r.get(4)?;
                let archived: i64 = r.get(6)?;
                let deleted: i64 = r.get(7)?;
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "firstName": r.get::<_, String>(1)?,
                    "lastName": r.get::<_, String>(2)?,
                    "classId": r.get::<_, Option<String>>(3)?,
                    "active": active != 0,
                    "status": r.get::<_, String>(5)?,
                    "archived": archived != 0,
                    "deleted": deleted != 0,
                    "grade": r.get::<_, Option<String>>(8)?,
                    "section": r.get::<_, Option<String>>(9)?,
                    "year": r.get::<_, Option<i64>>(10)?
                }))
            },
        )
        .optional();

    match row {
        Ok(Some(student)) => ok(&req.id, json!({ "student": student })),
        Ok(None) => err(&req.id, "not_found", "student not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };

    let class_filter = req
        .params
        .get("classId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let include_inactive = req
        .params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut stmt = match conn.prepare(
        "SELECT id, first_name, last_name, class_id, active, status
         FROM students
         WHERE (?1 IS NULL OR class_id = ?1)
           AND deleted = 0
           AND (?2 OR (active = 1 AND archived = 0))
         ORDER BY last_name, first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((&class_filter, include_inactive), |row| {
            let active: i64 = row.get(4)?;
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "firstName": row.get::<_, String>(1)?,
                "lastName": row.get::<_, String>(2)?,
                "classId": row.get::<_, Option<String>>(3)?,
                "active": active != 0,
                "status": row.get::<_, String>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.enroll" => Some(handle_students_enroll(state, req)),
        "students.get" => Some(handle_students_get(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        _ => None,
    }
}
