//! Period registry: academic years and terms, and the two singleton flags
//! (one active year, one current term system-wide).
//!
//! Activation is a single transaction that clears every flag and sets the
//! new one, so no interleaving can observe zero or two active rows.

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearRow {
    pub id: String,
    pub year: i64,
    pub start_date: String,
    pub end_date: String,
    pub is_active: bool,
    pub is_completed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermRow {
    pub id: String,
    pub year_id: String,
    pub term: i64,
    pub start_date: String,
    pub end_date: String,
    pub is_current: bool,
    pub is_completed: bool,
}

#[derive(Debug, Clone)]
pub struct RegistryError {
    pub code: &'static str,
    pub message: String,
}

impl RegistryError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

fn db_err(e: rusqlite::Error) -> RegistryError {
    RegistryError::new("db_query_failed", e.to_string())
}

fn year_from_sql(row: &rusqlite::Row) -> rusqlite::Result<YearRow> {
    Ok(YearRow {
        id: row.get(0)?,
        year: row.get(1)?,
        start_date: row.get(2)?,
        end_date: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
        is_completed: row.get::<_, i64>(5)? != 0,
    })
}

fn term_from_sql(row: &rusqlite::Row) -> rusqlite::Result<TermRow> {
    Ok(TermRow {
        id: row.get(0)?,
        year_id: row.get(1)?,
        term: row.get(2)?,
        start_date: row.get(3)?,
        end_date: row.get(4)?,
        is_current: row.get::<_, i64>(5)? != 0,
        is_completed: row.get::<_, i64>(6)? != 0,
    })
}

const YEAR_COLS: &str = "id, year, start_date, end_date, is_active, is_completed";
const TERM_COLS: &str = "id, year_id, term, start_date, end_date, is_current, is_completed";

pub fn find_year(conn: &Connection, year_id: &str) -> Result<Option<YearRow>, RegistryError> {
    conn.query_row(
        &format!("SELECT {} FROM academic_years WHERE id = ?", YEAR_COLS),
        [year_id],
        year_from_sql,
    )
    .optional()
    .map_err(db_err)
}

pub fn find_term(conn: &Connection, term_id: &str) -> Result<Option<TermRow>, RegistryError> {
    conn.query_row(
        &format!("SELECT {} FROM academic_terms WHERE id = ?", TERM_COLS),
        [term_id],
        term_from_sql,
    )
    .optional()
    .map_err(db_err)
}

pub fn active_year(conn: &Connection) -> Result<Option<YearRow>, RegistryError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM academic_years WHERE is_active = 1",
            YEAR_COLS
        ),
        [],
        year_from_sql,
    )
    .optional()
    .map_err(db_err)
}

pub fn current_term(conn: &Connection) -> Result<Option<TermRow>, RegistryError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM academic_terms WHERE is_current = 1",
            TERM_COLS
        ),
        [],
        term_from_sql,
    )
    .optional()
    .map_err(db_err)
}

/// Make `year_id` the single active year. Years advance one at a time:
/// with an active year present the target must be the year after it.
pub fn activate_year(conn: &Connection, year_id: &str) -> Result<YearRow, RegistryError> {
    let Some(target) = find_year(conn, year_id)? else {
        return Err(RegistryError::new("not_found", "academic year not found"));
    };
    if target.is_completed {
        return Err(RegistryError::new(
            "invalid_state",
            "cannot activate a completed academic year",
        ));
    }
    if let Some(active) = active_year(conn)? {
        if active.id == target.id {
            return Ok(target);
        }
        if target.year != active.year + 1 {
            return Err(RegistryError::new(
                "invalid_state",
                format!(
                    "years advance sequentially: active year is {}, cannot activate {}",
                    active.year, target.year
                ),
            ));
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| RegistryError::new("db_tx_failed", e.to_string()))?;
    tx.execute("UPDATE academic_years SET is_active = 0", [])
        .map_err(|e| RegistryError::new("db_update_failed", e.to_string()))?;
    tx.execute(
        "UPDATE academic_years SET is_active = 1 WHERE id = ?",
        [year_id],
    )
    .map_err(|e| RegistryError::new("db_update_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| RegistryError::new("db_commit_failed", e.to_string()))?;

    find_year(conn, year_id)?
        .ok_or_else(|| RegistryError::new("not_found", "academic year not found"))
}

/// Make `term_id` the single current term. The term must belong to the
/// active year; progression is forward-only and non-skippable.
pub fn activate_term(conn: &Connection, term_id: &str) -> Result<TermRow, RegistryError> {
    let Some(target) = find_term(conn, term_id)? else {
        return Err(RegistryError::new("not_found", "academic term not found"));
    };
    if target.is_completed {
        return Err(RegistryError::new(
            "invalid_state",
            "cannot re-activate a completed term",
        ));
    }
    let Some(active) = active_year(conn)? else {
        return Err(RegistryError::new(
            "invalid_state",
            "no active academic year",
        ));
    };
    if target.year_id != active.id {
        return Err(RegistryError::new(
            "invalid_state",
            "term does not belong to the active academic year",
        ));
    }

    match current_term(conn)? {
        Some(current) if current.id == target.id => return Ok(target),
        Some(current) if current.year_id == target.year_id => {
            if target.term < current.term {
                return Err(RegistryError::new(
                    "invalid_state",
                    format!(
                        "terms progress forward only: current term is {}, cannot activate term {}",
                        current.term, target.term
                    ),
                ));
            }
            if target.term != current.term + 1 {
                return Err(RegistryError::new(
                    "invalid_state",
                    format!(
                        "terms advance sequentially: current term is {}, cannot activate term {}",
                        current.term, target.term
                    ),
                ));
            }
        }
        // Current term left over from the previous year, or none at all:
        // a new year starts on term 1.
        _ => {
            if target.term != 1 {
                return Err(RegistryError::new(
                    "invalid_state",
                    "a new academic year must start on term 1",
                ));
            }
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| RegistryError::new("db_tx_failed", e.to_string()))?;
    tx.execute("UPDATE academic_terms SET is_current = 0", [])
        .map_err(|e| RegistryError::new("db_update_failed", e.to_string()))?;
    tx.execute(
        "UPDATE academic_terms SET is_current = 1 WHERE id = ?",
        [term_id],
    )
    .map_err(|e| RegistryError::new("db_update_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| RegistryError::new("db_commit_failed", e.to_string()))?;

    find_term(conn, term_id)?
        .ok_or_else(|| RegistryError::new("not_found", "academic term not found"))
}

/// Mark a term completed. Completed terms can never become current again.
pub fn complete_term(conn: &Connection, term_id: &str) -> Result<TermRow, RegistryError> {
    let Some(target) = find_term(conn, term_id)? else {
        return Err(RegistryError::new("not_found", "academic term not found"));
    };
    if target.is_completed {
        return Ok(target);
    }
    conn.execute(
        "UPDATE academic_terms SET is_completed = 1 WHERE id = ?",
        [term_id],
    )
    .map_err(|e| RegistryError::new("db_update_failed", e.to_string()))?;
    find_term(conn, term_id)?
        .ok_or_else(|| RegistryError::new("not_found", "academic term not found"))
}
