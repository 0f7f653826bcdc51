//! Year rollover: create the next academic year and advance the whole
//! student body into it in one transaction.
//!
//! Callers wrap `run` in a transaction; every failure before the first write
//! (and any fatal failure after) rolls the whole invocation back. The only
//! softness is the per-student skip path: a student whose destination cannot
//! be resolved at execution time is recorded in the report and the batch
//! continues.

use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::ledger::{self, LedgerError};
use crate::movement::{self, ClassRef, Grade, MovementRequest, MovementType, StudentState, Verdict};
use crate::registry::{self, RegistryError, YearRow};

#[derive(Debug, Clone)]
pub struct RolloverError {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl RolloverError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }
}

impl From<RegistryError> for RolloverError {
    fn from(e: RegistryError) -> Self {
        Self::new(e.code, e.message)
    }
}

impl From<LedgerError> for RolloverError {
    fn from(e: LedgerError) -> Self {
        Self::new(e.code, e.message)
    }
}

fn db_err(e: rusqlite::Error) -> RolloverError {
    RolloverError::new("db_query_failed", e.to_string())
}

#[derive(Debug, Clone)]
pub struct ClassRow {
    pub id: String,
    pub grade: Grade,
    pub section: String,
    pub year: i64,
}

fn class_from_sql(row: &rusqlite::Row) -> rusqlite::Result<(String, String, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn class_row(raw: (String, String, String, i64)) -> Result<ClassRow, RolloverError> {
    let grade = Grade::parse(&raw.1)
        .ok_or_else(|| RolloverError::new("invalid_state", format!("unknown grade: {}", raw.1)))?;
    Ok(ClassRow {
        id: raw.0,
        grade,
        section: raw.2,
        year: raw.3,
    })
}

/// Destination class for a student advancing into `grade` of `year`: the
/// same section when it exists, otherwise the lowest section code (ties on
/// class id). Returns the class and whether the fallback was taken.
pub fn resolve_destination(
    conn: &Connection,
    year: i64,
    grade: Grade,
    section: &str,
) -> Result<Option<(ClassRow, bool)>, RolloverError> {
    let exact = conn
        .query_row(
            "SELECT id, grade, section, year FROM classes
             WHERE year = ? AND grade = ? AND section = ?",
            (year, grade.code(), section),
            class_from_sql,
        )
        .optional()
        .map_err(db_err)?;
    if let Some(raw) = exact {
        return Ok(Some((class_row(raw)?, false)));
    }

    let fallback = conn
        .query_row(
            "SELECT id, grade, section, year FROM classes
             WHERE year = ? AND grade = ?
             ORDER BY section, id LIMIT 1",
            (year, grade.code()),
            class_from_sql,
        )
        .optional()
        .map_err(db_err)?;
    match fallback {
        Some(raw) => Ok(Some((class_row(raw)?, true))),
        None => Ok(None),
    }
}

/// `date` one calendar year later; Feb 29 lands on Feb 28.
fn shift_date_one_year(date: &str) -> Result<String, RolloverError> {
    let d = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| RolloverError::new("invalid_state", format!("bad stored date {date}: {e}")))?;
    let shifted = NaiveDate::from_ymd_opt(d.year() + 1, d.month(), d.day())
        .or_else(|| NaiveDate::from_ymd_opt(d.year() + 1, d.month(), d.day() - 1))
        .ok_or_else(|| RolloverError::new("invalid_state", format!("cannot shift date {date}")))?;
    Ok(shifted.format("%Y-%m-%d").to_string())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedStudent {
    pub student_id: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct RolloverOutcome {
    pub new_year: YearRow,
    pub promoted: usize,
    pub graduated: usize,
    pub skipped: Vec<SkippedStudent>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
struct ActiveStudent {
    id: String,
    class: Option<ClassRow>,
}

fn load_active_students(conn: &Connection) -> Result<Vec<ActiveStudent>, RolloverError> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, c.id, c.grade, c.section, c.year
             FROM students s
             LEFT JOIN classes c ON c.id = s.class_id
             WHERE s.active = 1 AND s.archived = 0 AND s.deleted = 0
             ORDER BY s.id",
        )
        .map_err(db_err)?;
    let raw = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let class_id: Option<String> = row.get(1)?;
            let grade: Option<String> = row.get(2)?;
            let section: Option<String> = row.get(3)?;
            let year: Option<i64> = row.get(4)?;
            Ok((id, class_id, grade, section, year))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut students = Vec::with_capacity(raw.len());
    for (id, class_id, grade, section, year) in raw {
        let class = match (class_id, grade, section, year) {
            (Some(cid), Some(g), Some(s), Some(y)) => Some(class_row((cid, g, s, y))?),
            _ => None,
        };
        students.push(ActiveStudent { id, class });
    }
    Ok(students)
}

/// Grades with no destination class in the target year, for pre-validation.
fn missing_destination_grades(
    students: &[ActiveStudent],
    conn: &Connection,
    source_year: i64,
    target_year: i64,
) -> Result<Vec<&'static str>, RolloverError> {
    let mut missing = BTreeSet::new();
    for student in students {
        let Some(class) = &student.class else {
            continue;
        };
        if class.year != source_year || class.grade.is_terminal() {
            continue;
        }
        let Some(next) = class.grade.next() else {
            continue;
        };
        if resolve_destination(conn, target_year, next, &class.section)?.is_none() {
            missing.insert(next.code());
        }
    }
    Ok(missing.into_iter().collect())
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
) -> Result<String, RolloverError> {
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
    .map_err(|e| RolloverError::new("db_insert_failed", e.to_string()))?;
    Ok(id)
}

/// Run the rollover for `year_id`. The caller supplies the transaction; all
/// reads and writes here go through it.
pub fn run(conn: &Connection, year_id: &str, actor: &str) -> Result<RolloverOutcome, RolloverError> {
    let Some(source_year) = registry::find_year(conn, year_id)? else {
        return Err(RolloverError::new("not_found", "academic year not found"));
    };
    let active = registry::active_year(conn)?;
    if active.as_ref().map(|y| y.id.as_str()) != Some(year_id) {
        return Err(RolloverError::new(
            "invalid_state",
            "rollover must start from the active academic year",
        ));
    }
    let current = registry::current_term(conn)?;
    let on_final_term = current
        .as_ref()
        .map(|t| t.year_id == source_year.id && t.term == 3)
        .unwrap_or(false);
    if !on_final_term {
        return Err(RolloverError::new(
            "invalid_state",
            "rollover requires the year's final term to be current",
        ));
    }

    let target_year_number = source_year.year + 1;
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM academic_years WHERE year = ?",
            [target_year_number],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if existing.is_some() {
        return Err(RolloverError::with_details(
            "validation_failed",
            format!("academic year {} already exists", target_year_number),
            json!({ "year": target_year_number }),
        ));
    }

    let students = load_active_students(conn)?;
    let missing =
        missing_destination_grades(&students, conn, source_year.year, target_year_number)?;
    if !missing.is_empty() {
        return Err(RolloverError::with_details(
            "validation_failed",
            format!(
                "no destination classes in {} for grades: {}",
                target_year_number,
                missing.join(", ")
            ),
            json!({ "missingGrades": missing }),
        ));
    }

    // Reads are done; first write. From here any error aborts the caller's
    // transaction as a whole.
    let new_year_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO academic_years(id, year, start_date, end_date, is_active, is_completed)
         VALUES(?, ?, ?, ?, 0, 0)",
        (
            &new_year_id,
            target_year_number,
            shift_date_one_year(&source_year.start_date)?,
            shift_date_one_year(&source_year.end_date)?,
        ),
    )
    .map_err(|e| RolloverError::new("db_insert_failed", e.to_string()))?;

    let mut source_terms_stmt = conn
        .prepare(
            "SELECT t.id, t.term, t.start_date, t.end_date, f.amount
             FROM academic_terms t
             LEFT JOIN term_fees f ON f.term_id = t.id
             WHERE t.year_id = ?
             ORDER BY t.term",
        )
        .map_err(db_err)?;
    let source_terms = source_terms_stmt
        .query_map([&source_year.id], |row| {
            let id: String = row.get(0)?;
            let term: i64 = row.get(1)?;
            let start: String = row.get(2)?;
            let end: String = row.get(3)?;
            let fee: Option<f64> = row.get(4)?;
            Ok((id, term, start, end, fee))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut new_term1_id: Option<String> = None;
    for (_, term, start, end, fee) in &source_terms {
        let new_term_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO academic_terms(id, year_id, term, start_date, end_date, is_current, is_completed)
             VALUES(?, ?, ?, ?, ?, 0, 0)",
            (
                &new_term_id,
                &new_year_id,
                term,
                shift_date_one_year(start)?,
                shift_date_one_year(end)?,
            ),
        )
        .map_err(|e| RolloverError::new("db_insert_failed", e.to_string()))?;
        if let Some(amount) = fee {
            conn.execute(
                "INSERT INTO term_fees(term_id, amount) VALUES(?, ?)",
                (&new_term_id, amount),
            )
            .map_err(|e| RolloverError::new("db_insert_failed", e.to_string()))?;
        }
        if *term == 1 {
            new_term1_id = Some(new_term_id);
        }
    }
    let Some(new_term1_id) = new_term1_id else {
        return Err(RolloverError::new(
            "invalid_state",
            "the rolled year has no term 1 to seed balances into",
        ));
    };

    let current_term_id = current.map(|t| t.id).unwrap_or_default();
    let mut promoted = 0usize;
    let mut graduated = 0usize;
    let mut skipped: Vec<SkippedStudent> = Vec::new();
    let mut fallback_notes: BTreeSet<String> = BTreeSet::new();

    for student in &students {
        let Some(class) = &student.class else {
            skipped.push(SkippedStudent {
                student_id: student.id.clone(),
                reason: "student has no current class assignment".to_string(),
            });
            continue;
        };
        if class.year != source_year.year {
            skipped.push(SkippedStudent {
                student_id: student.id.clone(),
                reason: format!("student's class belongs to year {}", class.year),
            });
            continue;
        }

        let arrears = ledger::outstanding_for_term(conn, &student.id, &current_term_id)?;

        if class.grade.is_terminal() {
            insert_movement(
                conn,
                &student.id,
                Some(&class.id),
                None,
                MovementType::Graduation,
                0.0,
                None,
                actor,
            )?;
            conn.execute(
                "UPDATE students SET active = 0, status = 'graduated', archived = 1 WHERE id = ?",
                [&student.id],
            )
            .map_err(|e| RolloverError::new("db_update_failed", e.to_string()))?;
            graduated += 1;
            continue;
        }

        let next_grade = class
            .grade
            .next()
            .expect("non-terminal grade has a successor");
        let resolved = resolve_destination(conn, target_year_number, next_grade, &class.section)?;
        let Some((destination, used_fallback)) = resolved else {
            // Pre-validation covered this; a concurrent edit inside the
            // transaction cannot happen, but keep the batch alive anyway.
            log::warn!(
                "rollover: no destination for student {} (grade {} section {})",
                student.id,
                next_grade.code(),
                class.section
            );
            skipped.push(SkippedStudent {
                student_id: student.id.clone(),
                reason: format!(
                    "no class for grade {} in {}",
                    next_grade.code(),
                    target_year_number
                ),
            });
            continue;
        };
        if used_fallback {
            fallback_notes.insert(format!(
                "no section {} class for grade {} in {}; using {}{}",
                class.section,
                next_grade.code(),
                target_year_number,
                destination.grade.code(),
                destination.section
            ));
        }

        let from_ref = ClassRef {
            id: class.id.clone(),
            grade: class.grade,
            year: class.year,
        };
        let to_ref = ClassRef {
            id: destination.id.clone(),
            grade: destination.grade,
            year: destination.year,
        };
        let verdict = movement::validate(&MovementRequest {
            movement_type: MovementType::Promotion,
            student: StudentState {
                active: true,
                graduated: false,
            },
            from: Some(&from_ref),
            to: Some(&to_ref),
            reason: None,
        });
        if let Verdict::Rejected(rule) = verdict {
            skipped.push(SkippedStudent {
                student_id: student.id.clone(),
                reason: rule.message().to_string(),
            });
            continue;
        }

        insert_movement(
            conn,
            &student.id,
            Some(&class.id),
            Some(&destination.id),
            MovementType::Promotion,
            arrears,
            None,
            actor,
        )?;
        conn.execute(
            "UPDATE students SET class_id = ? WHERE id = ?",
            (&destination.id, &student.id),
        )
        .map_err(|e| RolloverError::new("db_update_failed", e.to_string()))?;
        ledger::initialize_term_balance(conn, &student.id, &new_term1_id)?;
        promoted += 1;
    }

    let new_year = registry::find_year(conn, &new_year_id)?
        .ok_or_else(|| RolloverError::new("not_found", "created year vanished"))?;

    Ok(RolloverOutcome {
        new_year,
        promoted,
        graduated,
        skipped,
        warnings: fallback_notes.into_iter().collect(),
    })
}
