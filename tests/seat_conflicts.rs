use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_workspace(prefix: &str) -> PathBuf {
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
    let exe = env!("CARGO_BIN_EXE_seatbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn seatbookd");
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
    let payload = json!({ "id": id, "method": method, "params": params });
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
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().expect("error body")
}

fn error_code(error: &serde_json::Value) -> &str {
    error.get("code").and_then(|v| v.as_str()).unwrap_or("")
}

fn seat_entry(seats: &serde_json::Value, number: i64) -> serde_json::Value {
    seats
        .get("seats")
        .and_then(|v| v.as_array())
        .and_then(|arr| {
            arr.iter()
                .find(|s| s.get("seatNumber").and_then(|v| v.as_i64()) == Some(number))
        })
        .cloned()
        .unwrap_or_else(|| panic!("seat {} missing from seats.list", number))
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
    phone: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({ "name": name, "phone": phone }),
    );
    created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string()
}

#[test]
fn occupied_seats_stale_versions_and_noop_assigns_are_refused_cleanly() {
    let workspace = temp_workspace("seatbook-conflict");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.signUp",
        json!({ "email": "admin@example.com", "password": "secret1" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "seats.initialize",
        json!({ "count": 3 }),
    );

    let anil = create_student(&mut stdin, &mut reader, "4", "Anil", "9000000001");
    let banu = create_student(&mut stdin, &mut reader, "5", "Banu", "9000000002");

    // Anil takes seat 1.
    let seats = request_ok(&mut stdin, &mut reader, "6", "seats.list", json!({}));
    let seat1 = seat_entry(&seats, 1);
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "seats.assign",
        json!({ "studentId": anil, "seatId": seat1["id"], "seatVersion": seat1["version"] }),
    );

    // A different student cannot take it, even with a fresh version.
    let seats = request_ok(&mut stdin, &mut reader, "8", "seats.list", json!({}));
    let seat1 = seat_entry(&seats, 1);
    let error = request_err(
        &mut stdin,
        &mut reader,
        "9",
        "seats.assign",
        json!({ "studentId": banu, "seatId": seat1["id"], "seatVersion": seat1["version"] }),
    );
    assert_eq!(error_code(&error), "seat_occupied");

    // Version is required whenever a seat is targeted.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "10",
        "seats.assign",
        json!({ "studentId": banu, "seatId": seat1["id"] }),
    );
    assert_eq!(error_code(&error), "bad_params");

    // A stale version on an empty seat is a conflict and writes nothing.
    let seats = request_ok(&mut stdin, &mut reader, "11", "seats.list", json!({}));
    let seat2 = seat_entry(&seats, 2);
    let stale_version = seat2["version"].clone();
    request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "seats.assign",
        json!({ "studentId": banu, "seatId": seat2["id"], "seatVersion": stale_version }),
    );
    let seats = request_ok(&mut stdin, &mut reader, "13", "seats.list", json!({}));
    let seat2_fresh = seat_entry(&seats, 2);
    request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "seats.clear",
        json!({ "seatId": seat2_fresh["id"], "seatVersion": seat2_fresh["version"] }),
    );
    // Seat 2 is empty again, but its version moved twice since the read.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "15",
        "seats.assign",
        json!({ "studentId": anil, "seatId": seat2["id"], "seatVersion": stale_version }),
    );
    assert_eq!(error_code(&error), "conflict");
    let fresh = error
        .get("details")
        .and_then(|d| d.get("version"))
        .and_then(|v| v.as_i64())
        .expect("fresh version in details");
    assert_eq!(fresh, 2);

    let db_path = workspace.join("seatbook.sqlite3");
    let conn = Connection::open(&db_path).expect("open db");
    let anil_seat: Option<i64> = conn
        .query_row("SELECT seat_number FROM students WHERE id = ?", [&anil], |r| r.get(0))
        .expect("anil row");
    assert_eq!(anil_seat, Some(1), "conflict must not move the student");
    let seat2_occupant: Option<String> = conn
        .query_row("SELECT student_id FROM seats WHERE seat_number = 2", [], |r| r.get(0))
        .expect("seat 2 row");
    assert_eq!(seat2_occupant, None, "conflict must not claim the seat");

    // Re-assigning the seat a student already holds changes nothing and
    // leaves no history row behind.
    let history_before: i64 = conn
        .query_row("SELECT COUNT(*) FROM seat_history", [], |r| r.get(0))
        .expect("history count");
    let seats = request_ok(&mut stdin, &mut reader, "16", "seats.list", json!({}));
    let seat1 = seat_entry(&seats, 1);
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "seats.assign",
        json!({ "studentId": anil, "seatId": seat1["id"], "seatVersion": seat1["version"] }),
    );
    assert_eq!(result.get("changed").and_then(|v| v.as_bool()), Some(false));
    let history_after: i64 = conn
        .query_row("SELECT COUNT(*) FROM seat_history", [], |r| r.get(0))
        .expect("history count");
    assert_eq!(history_before, history_after);

    // Clearing with a stale version is refused the same way.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "18",
        "seats.clear",
        json!({ "seatId": seat1["id"], "seatVersion": 999 }),
    );
    assert_eq!(error_code(&error), "conflict");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
