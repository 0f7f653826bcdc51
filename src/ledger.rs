//! Balance ledger: one row per (student, term), created exactly once.
//!
//! Arrears carry forward through `carry_forward`: the prior term's unpaid
//! remainder, clamped at zero so a credit never becomes negative arrears.

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceRow {
    pub id: String,
    pub student_id: String,
    pub term_id: String,
    pub term_fee: f64,
    pub previous_arrears: f64,
    pub amount_paid: f64,
}

impl BalanceRow {
    /// Signed balance: positive is owed, negative is credit.
    pub fn current_balance(&self) -> f64 {
        self.term_fee + self.previous_arrears - self.amount_paid
    }

    /// Amount still owed for display/carry purposes; credit clamps to zero.
    pub fn outstanding(&self) -> f64 {
        self.current_balance().max(0.0)
    }
}

#[derive(Debug, Clone)]
pub struct LedgerError {
    pub code: &'static str,
    pub message: String,
}

impl LedgerError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

fn db_err(e: rusqlite::Error) -> LedgerError {
    LedgerError::new("db_query_failed", e.to_string())
}

/// Unpaid remainder a term hands to its successor.
pub fn carry_forward(term_fee: f64, previous_arrears: f64, amount_paid: f64) -> f64 {
    (term_fee + previous_arrears - amount_paid).max(0.0)
}

fn row_from_sql(row: &rusqlite::Row) -> rusqlite::Result<BalanceRow> {
    Ok(BalanceRow {
        id: row.get(0)?,
        student_id: row.get(1)?,
        term_id: row.get(2)?,
        term_fee: row.get(3)?,
        previous_arrears: row.get(4)?,
        amount_paid: row.get(5)?,
    })
}

pub fn find_balance(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
) -> Result<Option<BalanceRow>, LedgerError> {
    conn.query_row(
        "SELECT id, student_id, term_id, term_fee, previous_arrears, amount_paid
         FROM student_balances WHERE student_id = ? AND term_id = ?",
        (student_id, term_id),
        row_from_sql,
    )
    .optional()
    .map_err(db_err)
}

/// The term immediately before `term_id` in fee sequence: same year term-1,
/// or term 3 of the previous calendar year for a term 1.
fn preceding_term_id(conn: &Connection, term_id: &str) -> Result<Option<String>, LedgerError> {
    let found: Option<(String, i64, i64)> = conn
        .query_row(
            "SELECT t.year_id, t.term, y.year
             FROM academic_terms t JOIN academic_years y ON y.id = t.year_id
             WHERE t.id = ?",
            [term_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((year_id, term, year)) = found else {
        return Err(LedgerError::new("not_found", "term not found"));
    };

    if term > 1 {
        conn.query_row(
            "SELECT id FROM academic_terms WHERE year_id = ? AND term = ?",
            (&year_id, term - 1),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)
    } else {
        conn.query_row(
            "SELECT t.id
             FROM academic_terms t JOIN academic_years y ON y.id = t.year_id
             WHERE y.year = ? AND t.term = 3",
            [year - 1],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)
    }
}

/// Create the (student, term) balance row, carrying arrears from the
/// preceding term. Idempotent: an existing row is returned untouched.
/// Returns the row and whether it was created by this call.
pub fn initialize_term_balance(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
) -> Result<(BalanceRow, bool), LedgerError> {
    if let Some(existing) = find_balance(conn, student_id, term_id)? {
        return Ok((existing, false));
    }

    let student_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    if student_exists.is_none() {
        return Err(LedgerError::new("not_found", "student not found"));
    }

    let fee: Option<f64> = conn
        .query_row(
            "SELECT f.amount FROM term_fees f
             JOIN academic_terms t ON t.id = f.term_id
             WHERE t.id = ?",
            [term_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    let Some(term_fee) = fee else {
        let term_exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM academic_terms WHERE id = ?",
                [term_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if term_exists.is_none() {
            return Err(LedgerError::new("not_found", "term not found"));
        }
        return Err(LedgerError::new("not_found", "no fee configured for term"));
    };

    let previous_arrears = match preceding_term_id(conn, term_id)? {
        Some(prior_term_id) => match find_balance(conn, student_id, &prior_term_id)? {
            Some(prior) => carry_forward(prior.term_fee, prior.previous_arrears, prior.amount_paid),
            None => 0.0,
        },
        None => 0.0,
    };

    let row = BalanceRow {
        id: Uuid::new_v4().to_string(),
        student_id: student_id.to_string(),
        term_id: term_id.to_string(),
        term_fee,
        previous_arrears,
        amount_paid: 0.0,
    };
    conn.execute(
        "INSERT INTO student_balances(id, student_id, term_id, term_fee, previous_arrears, amount_paid)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &row.id,
            &row.student_id,
            &row.term_id,
            row.term_fee,
            row.previous_arrears,
            row.amount_paid,
        ),
    )
    .map_err(|e| LedgerError::new("db_insert_failed", e.to_string()))?;

    Ok((row, true))
}

/// Outstanding amount for a (student, term), zero when no row exists.
pub fn outstanding_for_term(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
) -> Result<f64, LedgerError> {
    Ok(find_balance(conn, student_id, term_id)?
        .map(|row| row.outstanding())
        .unwrap_or(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carry_forward_sums_fee_and_arrears_minus_paid() {
        assert_eq!(carry_forward(100.0, 20.0, 90.0), 30.0);
        assert_eq!(carry_forward(100.0, 0.0, 100.0), 0.0);
    }

    #[test]
    fn carry_forward_clamps_credit_to_zero() {
        // Overpayment is a credit, not negative arrears.
        assert_eq!(carry_forward(100.0, 0.0, 150.0), 0.0);
        assert_eq!(carry_forward(0.0, 10.0, 40.0), 0.0);
    }

    #[test]
    fn outstanding_clamps_but_current_balance_stays_signed() {
        let row = BalanceRow {
            id: "b".to_string(),
            student_id: "s".to_string(),
            term_id: "t".to_string(),
            term_fee: 50.0,
            previous_arrears: 0.0,
            amount_paid: 80.0,
        };
        assert_eq!(row.current_balance(), -30.0);
        assert_eq!(row.outstanding(), 0.0);
    }
}
