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

fn setup_year_2025(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    let created = request_ok(
        stdin,
        reader,
        "year-create",
        "years.create",
        json!({
            "year": 2025,
            "startDate": "2025-01-06",
            "endDate": "2025-12-05",
            "terms": [
                { "term": 1, "startDate": "2025-01-06", "endDate": "2025-04-04", "fee": 100.0 },
                { "term": 2, "startDate": "2025-05-05", "endDate": "2025-08-08", "fee": 100.0 },
                { "term": 3, "startDate": "2025-09-08", "endDate": "2025-12-05", "fee": 100.0 }
            ]
        }),
    );
    let year_id = created
        .get("yearId")
        .and_then(|v| v.as_str())
        .expect("yearId")
        .to_string();
    let term1 = created["terms"][0]["termId"]
        .as_str()
        .expect("termId")
        .to_string();
    let _ = request_ok(
        stdin,
        reader,
        "year-activate",
        "years.activate",
        json!({ "yearId": year_id }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "term-activate",
        "terms.activate",
        json!({ "termId": term1 }),
    );
}

fn create_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    grade: &str,
    section: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        &format!("class-{}-{}", grade, section),
        "classes.create",
        json!({ "grade": grade, "section": section, "year": 2025 }),
    );
    created
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string()
}

fn enroll(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    first: &str,
    class_id: Option<&str>,
) -> String {
    let mut params = json!({ "firstName": first, "lastName": "Batch" });
    if let Some(cid) = class_id {
        params["classId"] = json!(cid);
    }
    let created = request_ok(
        stdin,
        reader,
        &format!("enroll-{}", first),
        "students.enroll",
        params,
    );
    created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string()
}

#[test]
fn one_failure_does_not_block_the_batch() {
    let workspace = temp_dir("enrolld-bulk");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    setup_year_2025(&mut stdin, &mut reader);
    let class_3a = create_class(&mut stdin, &mut reader, "3", "A");
    let class_4a = create_class(&mut stdin, &mut reader, "4", "A");
    let class_7a = create_class(&mut stdin, &mut reader, "7", "A");

    let alice = enroll(&mut stdin, &mut reader, "Alice", Some(&class_3a));
    let bob = enroll(&mut stdin, &mut reader, "Bob", Some(&class_7a));
    let carol = enroll(&mut stdin, &mut reader, "Carol", None);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "bulk",
        "movements.bulkPromote",
        json!({
            "studentIds": [alice, bob, carol, "no-such-student"],
            "actorId": "head"
        }),
    );

    let succeeded = result
        .get("succeeded")
        .and_then(|v| v.as_array())
        .expect("succeeded");
    let failed = result
        .get("failed")
        .and_then(|v| v.as_array())
        .expect("failed");
    assert_eq!(succeeded.len(), 2);
    assert_eq!(failed.len(), 2);

    let alice_entry = succeeded
        .iter()
        .find(|e| e.get("studentId").and_then(|v| v.as_str()) == Some(alice.as_str()))
        .expect("alice entry");
    assert_eq!(
        alice_entry.get("movementType").and_then(|v| v.as_str()),
        Some("promotion")
    );
    assert_eq!(
        alice_entry.get("toClassId").and_then(|v| v.as_str()),
        Some(class_4a.as_str())
    );

    // Terminal-grade students graduate instead of promoting.
    let bob_entry = succeeded
        .iter()
        .find(|e| e.get("studentId").and_then(|v| v.as_str()) == Some(bob.as_str()))
        .expect("bob entry");
    assert_eq!(
        bob_entry.get("movementType").and_then(|v| v.as_str()),
        Some("graduation")
    );

    let carol_entry = failed
        .iter()
        .find(|e| e.get("studentId").and_then(|v| v.as_str()) == Some(carol.as_str()))
        .expect("carol entry");
    assert!(
        carol_entry
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .contains("class"),
        "unexpected reason: {}",
        carol_entry
    );
    let ghost_entry = failed
        .iter()
        .find(|e| e.get("studentId").and_then(|v| v.as_str()) == Some("no-such-student"))
        .expect("ghost entry");
    assert!(
        ghost_entry
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .contains("not found"),
        "unexpected reason: {}",
        ghost_entry
    );

    // The committed movements survived the failures.
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "get-alice",
        "students.get",
        json!({ "studentId": alice }),
    );
    assert_eq!(
        fetched["student"].get("classId").and_then(|v| v.as_str()),
        Some(class_4a.as_str())
    );
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "get-bob",
        "students.get",
        json!({ "studentId": bob }),
    );
    assert_eq!(
        fetched["student"].get("status").and_then(|v| v.as_str()),
        Some("graduated")
    );
}

#[test]
fn missing_next_grade_class_fails_only_that_student() {
    let workspace = temp_dir("enrolld-bulk-missing");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    setup_year_2025(&mut stdin, &mut reader);
    let class_3a = create_class(&mut stdin, &mut reader, "3", "A");
    let class_4a = create_class(&mut stdin, &mut reader, "4", "A");
    let class_5b = create_class(&mut stdin, &mut reader, "5", "B");

    let mona = enroll(&mut stdin, &mut reader, "Mona", Some(&class_3a));
    let nigel = enroll(&mut stdin, &mut reader, "Nigel", Some(&class_5b));

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "bulk",
        "movements.bulkPromote",
        json!({ "studentIds": [mona, nigel], "actorId": "head" }),
    );

    let succeeded = result
        .get("succeeded")
        .and_then(|v| v.as_array())
        .expect("succeeded");
    let failed = result
        .get("failed")
        .and_then(|v| v.as_array())
        .expect("failed");
    assert_eq!(succeeded.len(), 1);
    assert_eq!(
        succeeded[0].get("toClassId").and_then(|v| v.as_str()),
        Some(class_4a.as_str())
    );
    assert_eq!(failed.len(), 1);
    assert!(
        failed[0]
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .contains("no class for grade 6"),
        "unexpected reason: {}",
        failed[0]
    );
}
