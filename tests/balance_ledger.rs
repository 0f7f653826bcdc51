use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_enrolld");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn enrolld");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> (String, String) {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    let error = value.get("error").cloned().unwrap_or_else(|| json!({}));
    (
        error
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        error
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
    )
}

fn create_year(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    year: i64,
    fees: [Option<f64>; 3],
) -> (String, Vec<String>) {
    let mk_term = |n: i64, fee: Option<f64>| {
        let mut t = json!({
            "term": n,
            "startDate": format!("{}-0{}-01", year, n * 3 - 2),
            "endDate": format!("{}-0{}-28", year, n * 3),
        });
        if let Some(f) = fee {
            t["fee"] = json!(f);
        }
        t
    };
    let created = request_ok(
        stdin,
        reader,
        &format!("year-{}", year),
        "years.create",
        json!({
            "year": year,
            "startDate": format!("{}-01-01", year),
            "endDate": format!("{}-12-01", year),
            "terms": [mk_term(1, fees[0]), mk_term(2, fees[1]), mk_term(3, fees[2])]
        }),
    );
    let year_id = created
        .get("yearId")
        .and_then(|v| v.as_str())
        .expect("yearId")
        .to_string();
    let term_ids = created
        .get("terms")
        .and_then(|v| v.as_array())
        .expect("terms")
        .iter()
        .map(|t| {
            t.get("termId")
                .and_then(|v| v.as_str())
                .expect("termId")
                .to_string()
        })
        .collect();
    (year_id, term_ids)
}

fn enroll_somewhere(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    first: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        &format!("enroll-{}", first),
        "students.enroll",
        json!({ "firstName": first, "lastName": "Ledger" }),
    );
    created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string()
}

#[test]
fn initialize_is_idempotent_per_student_and_term() {
    let workspace = temp_dir("enrolld-ledger-idempotent");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (_year, terms) = create_year(
        &mut stdin,
        &mut reader,
        2025,
        [Some(100.0), Some(100.0), Some(100.0)],
    );
    let student = enroll_somewhere(&mut stdin, &mut reader, "Ida");

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "init1",
        "balances.initialize",
        json!({ "studentId": student, "termId": terms[0] }),
    );
    assert_eq!(first.get("created").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(first.get("amountPaid").and_then(|v| v.as_f64()), Some(0.0));

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "init2",
        "balances.initialize",
        json!({ "studentId": student, "termId": terms[0] }),
    );
    assert_eq!(second.get("created").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        first.get("balanceId").and_then(|v| v.as_str()),
        second.get("balanceId").and_then(|v| v.as_str()),
        "second call must return the same row"
    );
}

#[test]
fn arrears_carry_into_the_next_term() {
    let workspace = temp_dir("enrolld-ledger-carry");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (_year, terms) = create_year(
        &mut stdin,
        &mut reader,
        2025,
        [Some(100.0), Some(80.0), Some(100.0)],
    );
    let student = enroll_somewhere(&mut stdin, &mut reader, "Carry");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "init1",
        "balances.initialize",
        json!({ "studentId": student, "termId": terms[0] }),
    );
    let paid = request_ok(
        &mut stdin,
        &mut reader,
        "pay",
        "balances.recordPayment",
        json!({ "studentId": student, "termId": terms[0], "amount": 40.0 }),
    );
    assert_eq!(paid.get("amountPaid").and_then(|v| v.as_f64()), Some(40.0));
    assert_eq!(
        paid.get("currentBalance").and_then(|v| v.as_f64()),
        Some(60.0)
    );

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "init2",
        "balances.initialize",
        json!({ "studentId": student, "termId": terms[1] }),
    );
    assert_eq!(
        second.get("previousArrears").and_then(|v| v.as_f64()),
        Some(60.0)
    );
    assert_eq!(second.get("termFee").and_then(|v| v.as_f64()), Some(80.0));
    assert_eq!(
        second.get("outstanding").and_then(|v| v.as_f64()),
        Some(140.0)
    );
}

#[test]
fn credit_does_not_become_negative_arrears() {
    let workspace = temp_dir("enrolld-ledger-credit");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (_year, terms) = create_year(
        &mut stdin,
        &mut reader,
        2025,
        [Some(100.0), Some(100.0), Some(100.0)],
    );
    let student = enroll_somewhere(&mut stdin, &mut reader, "Credit");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "init1",
        "balances.initialize",
        json!({ "studentId": student, "termId": terms[0] }),
    );
    let paid = request_ok(
        &mut stdin,
        &mut reader,
        "pay",
        "balances.recordPayment",
        json!({ "studentId": student, "termId": terms[0], "amount": 150.0 }),
    );
    // The row keeps the signed credit; carry-forward clamps it.
    assert_eq!(
        paid.get("currentBalance").and_then(|v| v.as_f64()),
        Some(-50.0)
    );
    assert_eq!(paid.get("outstanding").and_then(|v| v.as_f64()), Some(0.0));

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "init2",
        "balances.initialize",
        json!({ "studentId": student, "termId": terms[1] }),
    );
    assert_eq!(
        second.get("previousArrears").and_then(|v| v.as_f64()),
        Some(0.0)
    );
}

#[test]
fn arrears_carry_from_final_term_into_the_next_year() {
    let workspace = temp_dir("enrolld-ledger-cross-year");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (_y25, terms_25) = create_year(
        &mut stdin,
        &mut reader,
        2025,
        [Some(100.0), Some(100.0), Some(100.0)],
    );
    let (_y26, terms_26) = create_year(
        &mut stdin,
        &mut reader,
        2026,
        [Some(110.0), Some(110.0), Some(110.0)],
    );
    let student = enroll_somewhere(&mut stdin, &mut reader, "Year");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "init-t3",
        "balances.initialize",
        json!({ "studentId": student, "termId": terms_25[2] }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "pay",
        "balances.recordPayment",
        json!({ "studentId": student, "termId": terms_25[2], "amount": 70.0 }),
    );

    let next = request_ok(
        &mut stdin,
        &mut reader,
        "init-next",
        "balances.initialize",
        json!({ "studentId": student, "termId": terms_26[0] }),
    );
    assert_eq!(
        next.get("previousArrears").and_then(|v| v.as_f64()),
        Some(30.0)
    );
    assert_eq!(next.get("termFee").and_then(|v| v.as_f64()), Some(110.0));
}

#[test]
fn missing_fee_blocks_initialization() {
    let workspace = temp_dir("enrolld-ledger-no-fee");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (_year, terms) = create_year(
        &mut stdin,
        &mut reader,
        2025,
        [Some(100.0), None, Some(100.0)],
    );
    let student = enroll_somewhere(&mut stdin, &mut reader, "NoFee");

    let (code, message) = request_err(
        &mut stdin,
        &mut reader,
        "init",
        "balances.initialize",
        json!({ "studentId": student, "termId": terms[1] }),
    );
    assert_eq!(code, "not_found");
    assert!(message.contains("fee"), "unexpected message: {}", message);

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "init-missing-student",
        "balances.initialize",
        json!({ "studentId": "no-such-student", "termId": terms[0] }),
    );
    assert_eq!(code, "not_found");
}
