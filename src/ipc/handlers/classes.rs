use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::movement::Grade;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn db_query_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    }
}

/// One teacher per class per year. Returns the conflicting class when the
/// teacher already owns one in `year` (excluding `exclude_class_id` so a
/// class update can keep its own teacher).
fn teacher_conflict(
    conn: &Connection,
    teacher_id: &str,
    year: i64,
    exclude_class_id: Option<&str>,
) -> Result<Option<(String, String, String)>, HandlerErr> {
    conn.query_row(
        "SELECT id, grade, section FROM classes
         WHERE teacher_id = ? AND year = ? AND id != ?",
        (teacher_id, year, exclude_class_id.unwrap_or("")),
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )
    .optional()
    .map_err(db_query_err)
}

fn teacher_exists(conn: &Connection, teacher_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM teachers WHERE id = ?", [teacher_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(db_query_err)
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let grade_raw = match req.params.get("grade").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing grade", None),
    };
    let Some(grade) = Grade::parse(&grade_raw) else {
        return err(
            &req.id,
            "bad_params",
            "grade must be one of: ECD, 1..7",
            Some(json!({ "grade": grade_raw })),
        );
    };
    let section = match req.params.get("section").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_ascii_uppercase(),
        None => return err(&req.id, "bad_params", "missing section", None),
    };
    if section != "A" && section != "B" {
        return err(
            &req.id,
            "bad_params",
            "section must be A or B",
            Some(json!({ "section": section })),
        );
    }
    let year = match req.params.get("year").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing year", None),
    };
    let teacher_id = req
        .params
        .get("teacherId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if let Some(tid) = teacher_id.as_deref() {
        match teacher_exists(conn, tid) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "teacher not found", None),
            Err(e) => return e.response(&req.id),
        }
        match teacher_conflict(conn, tid, year, None) {
            Ok(Some((class_id, g, s))) => {
                return err(
                    &req.id,
                    "conflict",
                    format!(
                        "teacher already owns class {}{} in {}",
                        g, s, year
                    ),
                    Some(json!({ "classId": class_id, "year": year })),
                )
            }
            Ok(None) => {}
            Err(e) => return e.response(&req.id),
        }
    }

    let exists: Option<String> = match conn
        .query_row(
            "SELECT id FROM classes WHERE grade = ? AND section = ? AND year = ?",
            (grade.code(), &section, year),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_some() {
        return err(
            &req.id,
            "conflict",
            format!("class {}{} already exists in {}", grade.code(), section, year),
            None,
        );
    }

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, grade, section, year, teacher_id) VALUES(?, ?, ?, ?, ?)",
        (&class_id, grade.code(), &section, year, &teacher_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(
        &req.id,
        json!({
            "classId": class_id,
            "grade": grade.code(),
            "section": section,
            "year": year
        }),
    )
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let year: Option<i64> = match conn
        .query_row("SELECT year FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(year) = year else {
        return err(&req.id, "not_found", "class not found", None);
    };

    // The only mutable attribute is the owning teacher; grade/section/year
    // are the class's identity.
    let Some(teacher_param) = req.params.get("teacherId") else {
        return err(&req.id, "bad_params", "missing teacherId", None);
    };
    let teacher_id = teacher_param.as_str().map(|s| s.to_string());
    if !teacher_param.is_null() && teacher_id.is_none() {
        return err(&req.id, "bad_params", "teacherId must be a string or null", None);
    }

    if let Some(tid) = teacher_id.as_deref() {
        match teacher_exists(conn, tid) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "teacher not found", None),
            Err(e) => return e.response(&req.id),
        }
        match teacher_conflict(conn, tid, year, Some(&class_id)) {
            Ok(Some((other_id, g, s))) => {
                return err(
                    &req.id,
                    "conflict",
                    format!("teacher already owns class {}{} in {}", g, s, year),
                    Some(json!({ "classId": other_id, "year": year })),
                )
            }
            Ok(None) => {}
            Err(e) => return e.response(&req.id),
        }
    }

    if let Err(e) = conn.execute(
        "UPDATE classes SET teacher_id = ? WHERE id = ?",
        (&teacher_id, &class_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "classId": class_id, "teacherId": teacher_id }))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    let year_filter = req.params.get("year").and_then(|v| v.as_i64());

    // Include enrolment counts so the UI can show a useful dashboard.
    let sql = "SELECT
           c.id, c.grade, c.section, c.year, c.teacher_id, t.name,
           (SELECT COUNT(*) FROM students s
            WHERE s.class_id = c.id AND s.deleted = 0 AND s.archived = 0) AS student_count
         FROM classes c
         LEFT JOIN teachers t ON t.id = c.teacher_id
         WHERE (?1 IS NULL OR c.year = ?1)
         ORDER BY c.year, c.grade, c.section";
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([year_filter], |row| {
            let id: String = row.get(0)?;
            let grade: String = row.get(1)?;
            let section: String = row.get(2)?;
            let year: i64 = row.get(3)?;
            let teacher_id: Option<String> = row.get(4)?;
            let teacher_name: Option<String> = row.get(5)?;
            let student_count: i64 = row.get(6)?;
            Ok(json!({
                "id": id,
                "grade": grade,
                "section": section,
                "year": year,
                "teacherId": teacher_id,
                "teacherName": teacher_name,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.update" => Some(handle_classes_update(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        _ => None,
    }
}
