use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use serde_json::json;

fn get_required_str(
    params: &serde_json::Value,
    key: &str,
) -> Result<String, (&'static str, String)> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or(("bad_params", format!("missing {}", key)))
}

fn balance_json(row: &ledger::BalanceRow) -> serde_json::Value {
    json!({
        "balanceId": row.id,
        "studentId": row.student_id,
        "termId": row.term_id,
        "termFee": row.term_fee,
        "previousArrears": row.previous_arrears,
        "amountPaid": row.amount_paid,
        "currentBalance": row.current_balance(),
        "outstanding": row.outstanding()
    })
}

fn handle_balances_initialize(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (student_id, term_id) = match (
        get_required_str(&req.params, "studentId"),
        get_required_str(&req.params, "termId"),
    ) {
        (Ok(s), Ok(t)) => (s, t),
        (Err((c, m)), _) | (_, Err((c, m))) => return err(&req.id, c, m, None),
    };

    match ledger::initialize_term_balance(conn, &student_id, &term_id) {
        Ok((row, created)) => {
            let mut result = balance_json(&row);
            result["created"] = json!(created);
            ok(&req.id, result)
        }
        Err(e) => err(&req.id, e.code, e.message, None),
    }
}

fn handle_balances_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (student_id, term_id) = match (
        get_required_str(&req.params, "studentId"),
        get_required_str(&req.params, "termId"),
    ) {
        (Ok(s), Ok(t)) => (s, t),
        (Err((c, m)), _) | (_, Err((c, m))) => return err(&req.id, c, m, None),
    };

    match ledger::find_balance(conn, &student_id, &term_id) {
        Ok(Some(row)) => ok(&req.id, balance_json(&row)),
        Ok(None) => err(&req.id, "not_found", "balance not found", None),
        Err(e) => err(&req.id, e.code, e.message, None),
    }
}

fn handle_balances_record_payment(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (student_id, term_id) = match (
        get_required_str(&req.params, "studentId"),
        get_required_str(&req.params, "termId"),
    ) {
        (Ok(s), Ok(t)) => (s, t),
        (Err((c, m)), _) | (_, Err((c, m))) => return err(&req.id, c, m, None),
    };
    let amount = match req.params.get("amount").and_then(|v| v.as_f64()) {
        Some(v) if v > 0.0 => v,
        Some(_) => return err(&req.id, "bad_params", "amount must be positive", None),
        None => return err(&req.id, "bad_params", "missing amount", None),
    };

    let existing = match ledger::find_balance(conn, &student_id, &term_id) {
        Ok(Some(row)) => row,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "balance not found; initialize the term first",
                None,
            )
        }
        Err(e) => return err(&req.id, e.code, e.message, None),
    };

    if let Err(e) = conn.execute(
        "UPDATE student_balances SET amount_paid = amount_paid + ? WHERE id = ?",
        (amount, &existing.id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    match ledger::find_balance(conn, &student_id, &term_id) {
        Ok(Some(row)) => ok(&req.id, balance_json(&row)),
        Ok(None) => err(&req.id, "not_found", "balance not found", None),
        Err(e) => err(&req.id, e.code, e.message, None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "balances.initialize" => Some(handle_balances_initialize(state, req)),
        "balances.get" => Some(handle_balances_get(state, req)),
        "balances.recordPayment" => Some(handle_balances_record_payment(state, req)),
        _ => None,
    }
}
