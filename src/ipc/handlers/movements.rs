use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use crate::movement::{
    self, ClassRef, Grade, MovementRequest, MovementType, StudentState, Verdict,
};
use crate::registry;
use crate::rollover;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn db_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

#[derive(Debug, Clone)]
struct StudentRow {
    id: String,
    class_id: Option<String>,
    active: bool,
    graduated: bool,
}

fn load_student(conn: &Connection, student_id: &str) -> Result<StudentRow, HandlerErr> {
    let row: Option<StudentRow> = conn
        .query_row(
            "SELECT id, class_id, active, status FROM students WHERE id = ? AND deleted = 0",
            [student_id],
            |r| {
                let active: i64 = r.get(2)?;
                let status: String = r.get(3)?;
                Ok(StudentRow {
                    id: r.get(0)?,
                    class_id: r.get(1)?,
                    active: active != 0,
                    graduated: status == "graduated",
                })
            },
        )
        .optional()
        .map_err(db_err)?;
    row.ok_or_else(|| HandlerErr::new("not_found", "student not found"))
}

#[derive(Debug, Clone)]
struct ClassSnapshot {
    class: ClassRef,
    section: String,
}

fn load_class(conn: &Connection, class_id: &str) -> Result<Option<ClassSnapshot>, HandlerErr> {
    let raw: Option<(String, String, String, i64)> = conn
        .query_row(
            "SELECT id, grade, section, year FROM classes WHERE id = ?",
            [class_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((id, grade_raw, section, year)) = raw else {
        return Ok(None);
    };
    let grade = Grade::parse(&grade_raw)
        .ok_or_else(|| HandlerErr::new("invalid_state", format!("unknown grade: {grade_raw}")))?;
    Ok(Some(ClassSnapshot {
        class: ClassRef { id, grade, year },
        section,
    }))
}

/// Outstanding amount on the current term's balance row, zero when there is
/// no current term or no row. This is the snapshot a movement preserves.
fn arrears_snapshot(conn: &Connection, student_id: &str) -> Result<f64, HandlerErr> {
    let current = registry::current_term(conn).map_err(|e| HandlerErr::new(e.code, e.message))?;
    let Some(term) = current else {
        return Ok(0.0);
    };
    ledger::outstanding_for_term(conn, student_id, &term.id)
        .map_err(|e| HandlerErr::new(e.code, e.message))
}

fn insert_movement(
    conn: &Connection,
    student_id: &str,
    from_class_id: Option<&str>,
    to_class_id: Option<&str>,
    movement_type: MovementType,
    arrears: f64,
    reason: Option<&str>,
    moved_by: &str,
) -> Result<String, HandlerErr> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO student_movements(
            id, student_id, from_class_id, to_class_id, movement_type,
            previous_arrears, preserved_arrears, reason, moved_by, movement_date)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            student_id,
            from_class_id,
            to_class_id,
            movement_type.code(),
            arrears,
            arrears,
            reason,
            moved_by,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    Ok(id)
}

/// Graduate in place: movement row with a zero arrears snapshot (the
/// student's own ledger keeps the outstanding amount), then deactivate,
/// mark graduated and archive.
fn apply_graduation(
    conn: &Connection,
    student: &StudentRow,
    from: &ClassSnapshot,
    reason: Option<&str>,
    actor: &str,
) -> Result<String, HandlerErr> {
    let verdict = movement::validate(&MovementRequest {
        movement_type: MovementType::Graduation,
        student: StudentState {
            active: student.active,
            graduated: student.graduated,
        },
        from: Some(&from.class),
        to: None,
        reason,
    });
    if let Verdict::Rejected(rule) = verdict {
        return Err(HandlerErr {
            code: "validation_failed",
            message: rule.message().to_string(),
            details: Some(json!({ "rule": rule.code() })),
        });
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let movement_id = insert_movement(
        &tx,
        &student.id,
        Some(&from.class.id),
        None,
        MovementType::Graduation,
        0.0,
        reason,
        actor,
    )?;
    tx.execute(
        "UPDATE students SET active = 0, status = 'graduated', archived = 1 WHERE id = ?",
        [&student.id],
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(movement_id)
}

struct AppliedMovement {
    movement_id: String,
    movement_type: MovementType,
    to_class_id: Option<String>,
    preserved_arrears: f64,
}

/// Validate and apply a single class-to-class movement, one transaction.
fn apply_move(
    conn: &Connection,
    movement_type: MovementType,
    student: &StudentRow,
    from: &ClassSnapshot,
    to: &ClassSnapshot,
    reason: Option<&str>,
    actor: &str,
) -> Result<AppliedMovement, HandlerErr> {
    let verdict = movement::validate(&MovementRequest {
        movement_type,
        student: StudentState {
            active: student.active,
            graduated: student.graduated,
        },
        from: Some(&from.class),
        to: Some(&to.class),
        reason,
    });
    if let Verdict::Rejected(rule) = verdict {
        return Err(HandlerErr {
            code: "validation_failed",
            message: rule.message().to_string(),
            details: Some(json!({ "rule": rule.code() })),
        });
    }

    let arrears = arrears_snapshot(conn, &student.id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let movement_id = insert_movement(
        &tx,
        &student.id,
        Some(&from.class.id),
        Some(&to.class.id),
        movement_type,
        arrears,
        reason,
        actor,
    )?;
    tx.execute(
        "UPDATE students SET class_id = ? WHERE id = ?",
        (&to.class.id, &student.id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(AppliedMovement {
        movement_id,
        movement_type,
        to_class_id: Some(to.class.id.clone()),
        preserved_arrears: arrears,
    })
}

fn handle_single(
    state: &mut AppState,
    req: &Request,
    movement_type: MovementType,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let target_class_id = match get_required_str(&req.params, "targetClassId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let actor = match get_required_str(&req.params, "actorId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let reason = req
        .params
        .get("reason")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let student = match load_student(conn, &student_id) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let from = match student.class_id.as_deref() {
        Some(cid) => match load_class(conn, cid) {
            Ok(Some(c)) => c,
            Ok(None) => return err(&req.id, "invalid_state", "student's class is missing", None),
            Err(e) => return e.response(&req.id),
        },
        None => {
            return err(
                &req.id,
                "validation_failed",
                "student has no current class assignment",
                Some(json!({ "rule": "student_unassigned" })),
            )
        }
    };

    // A terminal-grade promotion is a graduation in disguise.
    if movement_type == MovementType::Promotion && from.class.grade.is_terminal() && student.active
    {
        return match apply_graduation(conn, &student, &from, reason.as_deref(), &actor) {
            Ok(movement_id) => ok(
                &req.id,
                json!({
                    "movementId": movement_id,
                    "movementType": MovementType::Graduation.code(),
                    "toClassId": null,
                    "preservedArrears": 0.0
                }),
            ),
            Err(e) => e.response(&req.id),
        };
    }

    let to = match load_class(conn, &target_class_id) {
        Ok(Some(c)) => c,
        Ok(None) => return err(&req.id, "not_found", "target class not found", None),
        Err(e) => return e.response(&req.id),
    };

    match apply_move(
        conn,
        movement_type,
        &student,
        &from,
        &to,
        reason.as_deref(),
        &actor,
    ) {
        Ok(applied) => ok(
            &req.id,
            json!({
                "movementId": applied.movement_id,
                "movementType": applied.movement_type.code(),
                "toClassId": applied.to_class_id,
                "preservedArrears": applied.preserved_arrears
            }),
        ),
        Err(e) => e.response(&req.id),
    }
}

/// Advance one student for bulk promotion: graduate from the terminal grade,
/// otherwise promote into the resolved next-grade class of the same year.
fn bulk_promote_one(
    conn: &Connection,
    student_id: &str,
    actor: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let student = load_student(conn, student_id)?;
    let Some(class_id) = student.class_id.as_deref() else {
        return Err(HandlerErr::new(
            "validation_failed",
            "student has no current class assignment",
        ));
    };
    let Some(from) = load_class(conn, class_id)? else {
        return Err(HandlerErr::new("invalid_state", "student's class is missing"));
    };

    if from.class.grade.is_terminal() {
        if student.active {
            let movement_id = apply_graduation(conn, &student, &from, None, actor)?;
            return Ok(json!({
                "studentId": student_id,
                "movementId": movement_id,
                "movementType": MovementType::Graduation.code(),
                "toClassId": null
            }));
        }
        return Err(HandlerErr::new("validation_failed", "student is not active"));
    }

    let next_grade = from
        .class
        .grade
        .next()
        .expect("non-terminal grade has a successor");
    let destination =
        rollover::resolve_destination(conn, from.class.year, next_grade, &from.section)
            .map_err(|e| HandlerErr::new(e.code, e.message))?;
    let Some((dest, _fallback)) = destination else {
        return Err(HandlerErr::new(
            "validation_failed",
            format!(
                "no class for grade {} in {}",
                next_grade.code(),
                from.class.year
            ),
        ));
    };
    let to = ClassSnapshot {
        class: ClassRef {
            id: dest.id,
            grade: dest.grade,
            year: dest.year,
        },
        section: dest.section,
    };

    let applied = apply_move(
        conn,
        MovementType::Promotion,
        &student,
        &from,
        &to,
        None,
        actor,
    )?;
    Ok(json!({
        "studentId": student_id,
        "movementId": applied.movement_id,
        "movementType": applied.movement_type.code(),
        "toClassId": applied.to_class_id
    }))
}

fn handle_bulk_promote(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(ids) = req.params.get("studentIds").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing studentIds", None);
    };
    let actor = match get_required_str(&req.params, "actorId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let mut student_ids = Vec::with_capacity(ids.len());
    for v in ids {
        match v.as_str() {
            Some(s) => student_ids.push(s.to_string()),
            None => return err(&req.id, "bad_params", "studentIds must be strings", None),
        }
    }

    // Students are independent: one failure never rolls back another's
    // committed movement.
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    for student_id in &student_ids {
        match bulk_promote_one(conn, student_id, &actor) {
            Ok(entry) => succeeded.push(entry),
            Err(e) => failed.push(json!({ "studentId": student_id, "reason": e.message })),
        }
    }

    ok(
        &req.id,
        json!({ "succeeded": succeeded, "failed": failed }),
    )
}

fn handle_movements_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "movements": [] }));
    };

    let student_filter = req
        .params
        .get("studentId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut stmt = match conn.prepare(
        "SELECT id, student_id, from_class_id, to_class_id, movement_type,
                previous_arrears, preserved_arrears, reason, moved_by, movement_date
         FROM student_movements
         WHERE (?1 IS NULL OR student_id = ?1)
         ORDER BY movement_date, rowid",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&student_filter], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "studentId": row.get::<_, String>(1)?,
                "fromClassId": row.get::<_, Option<String>>(2)?,
                "toClassId": row.get::<_, Option<String>>(3)?,
                "movementType": row.get::<_, String>(4)?,
                "previousArrears": row.get::<_, f64>(5)?,
                "preservedArrears": row.get::<_, f64>(6)?,
                "reason": row.get::<_, Option<String>>(7)?,
                "movedBy": row.get::<_, String>(8)?,
                "movementDate": row.get::<_, String>(9)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(movements) => ok(&req.id, json!({ "movements": movements })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "movements.promote" => Some(handle_single(state, req, MovementType::Promotion)),
        "movements.demote" => Some(handle_single(state, req, MovementType::Demotion)),
        "movements.transfer" => Some(handle_single(state, req, MovementType::Transfer)),
        "movements.bulkPromote" => Some(handle_bulk_promote(state, req)),
        "movements.list" => Some(handle_movements_list(state, req)),
        _ => None,
    }
}
