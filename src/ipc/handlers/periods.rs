use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::registry;
use chrono::NaiveDate;
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

fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "bad_params",
        message: message.into(),
        details: None,
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

fn get_date(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let raw = get_required_str(params, key)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|_| bad_params(format!("{} must be YYYY-MM-DD", key)))?;
    Ok(raw)
}

fn handle_years_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let year = match req.params.get("year").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing year", None),
    };
    let (start_date, end_date) = match (
        get_date(&req.params, "startDate"),
        get_date(&req.params, "endDate"),
    ) {
        (Ok(s), Ok(e)) => (s, e),
        (Err(e), _) | (_, Err(e)) => return e.response(&req.id),
    };
    let Some(terms) = req.params.get("terms").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing terms", None);
    };
    if terms.len() != 3 {
        return err(
            &req.id,
            "bad_params",
            "an academic year has exactly three terms",
            Some(json!({ "termCount": terms.len() })),
        );
    }

    let mut parsed_terms: Vec<(i64, String, String, Option<f64>)> = Vec::with_capacity(3);
    for (i, t) in terms.iter().enumerate() {
        let number = match t.get("term").and_then(|v| v.as_i64()) {
            Some(n) if (1..=3).contains(&n) => n,
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "each term needs a term number in 1..=3",
                    Some(json!({ "index": i })),
                )
            }
        };
        let (start, end) = match (get_date(t, "startDate"), get_date(t, "endDate")) {
            (Ok(s), Ok(e)) => (s, e),
            (Err(e), _) | (_, Err(e)) => return e.response(&req.id),
        };
        let fee = t.get("fee").and_then(|v| v.as_f64());
        if let Some(f) = fee {
            if f < 0.0 {
                return err(&req.id, "bad_params", "fee must not be negative", None);
            }
        }
        parsed_terms.push((number, start, end, fee));
    }
    let mut numbers: Vec<i64> = parsed_terms.iter().map(|t| t.0).collect();
    numbers.sort_unstable();
    if numbers != [1, 2, 3] {
        return err(
            &req.id,
            "bad_params",
            "terms must be numbered 1, 2 and 3",
            None,
        );
    }

    let exists: Option<String> = match conn
        .query_row(
            "SELECT id FROM academic_years WHERE year = ?",
            [year],
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
            format!("academic year {} already exists", year),
            Some(json!({ "year": year })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let year_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO academic_years(id, year, start_date, end_date, is_active, is_completed)
         VALUES(?, ?, ?, ?, 0, 0)",
        (&year_id, year, &start_date, &end_date),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    let mut term_ids = Vec::with_capacity(3);
    for (number, start, end, fee) in &parsed_terms {
        let term_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO academic_terms(id, year_id, term, start_date, end_date, is_current, is_completed)
             VALUES(?, ?, ?, ?, ?, 0, 0)",
            (&term_id, &year_id, number, start, end),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        if let Some(amount) = fee {
            if let Err(e) = tx.execute(
                "INSERT INTO term_fees(term_id, amount) VALUES(?, ?)",
                (&term_id, amount),
            ) {
                let _ = tx.rollback();
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
        }
        term_ids.push(json!({ "termId": term_id, "term": number }));
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "yearId": year_id, "year": year, "terms": term_ids }),
    )
}

fn list_terms_json(conn: &Connection, year_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT t.id, t.term, t.start_date, t.end_date, t.is_current, t.is_completed, f.amount
             FROM academic_terms t
             LEFT JOIN term_fees f ON f.term_id = t.id
             WHERE t.year_id = ?
             ORDER BY t.term",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    stmt.query_map([year_id], |row| {
        let id: String = row.get(0)?;
        let term: i64 = row.get(1)?;
        let start: String = row.get(2)?;
        let end: String = row.get(3)?;
        let is_current: i64 = row.get(4)?;
        let is_completed: i64 = row.get(5)?;
        let fee: Option<f64> = row.get(6)?;
        Ok(json!({
            "termId": id,
            "term": term,
            "startDate": start,
            "endDate": end,
            "isCurrent": is_current != 0,
            "isCompleted": is_completed != 0,
            "fee": fee
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn handle_years_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "years": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT id, year, start_date, end_date, is_active, is_completed
         FROM academic_years ORDER BY year",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let years = match stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let year: i64 = row.get(1)?;
            let start: String = row.get(2)?;
            let end: String = row.get(3)?;
            let is_active: i64 = row.get(4)?;
            let is_completed: i64 = row.get(5)?;
            Ok((id, year, start, end, is_active != 0, is_completed != 0))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut rows = Vec::with_capacity(years.len());
    for (id, year, start, end, is_active, is_completed) in years {
        let terms = match list_terms_json(conn, &id) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        };
        rows.push(json!({
            "yearId": id,
            "year": year,
            "startDate": start,
            "endDate": end,
            "isActive": is_active,
            "isCompleted": is_completed,
            "terms": terms
        }));
    }

    ok(&req.id, json!({ "years": rows }))
}

fn handle_years_activate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let year_id = match get_required_str(&req.params, "yearId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match registry::activate_year(conn, &year_id) {
        Ok(year) => ok(
            &req.id,
            json!({ "yearId": year.id, "year": year.year, "isActive": year.is_active }),
        ),
        Err(e) => err(&req.id, e.code, e.message, None),
    }
}

fn handle_terms_activate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let term_id = match get_required_str(&req.params, "termId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match registry::activate_term(conn, &term_id) {
        Ok(term) => ok(
            &req.id,
            json!({ "termId": term.id, "term": term.term, "isCurrent": term.is_current }),
        ),
        Err(e) => err(&req.id, e.code, e.message, None),
    }
}

fn handle_terms_complete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let term_id = match get_required_str(&req.params, "termId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match registry::complete_term(conn, &term_id) {
        Ok(term) => ok(
            &req.id,
            json!({ "termId": term.id, "term": term.term, "isCompleted": term.is_completed }),
        ),
        Err(e) => err(&req.id, e.code, e.message, None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "years.create" => Some(handle_years_create(state, req)),
        "years.list" => Some(handle_years_list(state, req)),
        "years.activate" => Some(handle_years_activate(state, req)),
        "terms.activate" => Some(handle_terms_activate(state, req)),
        "terms.complete" => Some(handle_terms_complete(state, req)),
        _ => None,
    }
}
