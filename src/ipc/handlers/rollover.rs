use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rollover;
use serde_json::json;

fn handle_rollover_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let year_id = match req.params.get("yearId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing yearId", None),
    };
    let actor = req
        .params
        .get("actorId")
        .and_then(|v| v.as_str())
        .unwrap_or("system")
        .to_string();

    // One transaction for the whole rollover: pre-validation failures and
    // fatal errors leave the store untouched.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let outcome = match rollover::run(&tx, &year_id, &actor) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            log::error!("rollover for year {} failed: {}", year_id, e.message);
            return err(&req.id, e.code, e.message, e.details);
        }
    };

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    let skipped = match serde_json::to_value(&outcome.skipped) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "internal", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "newYearId": outcome.new_year.id,
            "year": outcome.new_year.year,
            "promoted": outcome.promoted,
            "graduated": outcome.graduated,
            "skipped": skipped,
            "warnings": outcome.warnings
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "rollover.run" => Some(handle_rollover_run(state, req)),
        _ => None,
    }
}
