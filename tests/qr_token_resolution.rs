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

fn resolve_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    token: &str,
) -> String {
    let value = request(
        stdin,
        reader,
        id,
        "attendance.resolveToken",
        json!({ "token": token }),
    );
    assert!(
        !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
        "resolveToken unexpectedly succeeded for {}: {}",
        token,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

#[test]
fn tokens_resolve_by_uuid_code_or_verification_url() {
    let workspace = temp_workspace("seatbook-token");
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

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "name": "Asha", "phone": "9000000001" }),
    );
    let student_id = created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let ss_id = created
        .get("ssId")
        .and_then(|v| v.as_str())
        .expect("ssId")
        .to_string();

    // By printed code, any case.
    for (req_id, token) in [("4", ss_id.clone()), ("5", ss_id.to_lowercase())] {
        let resolved = request_ok(
            &mut stdin,
            &mut reader,
            req_id,
            "attendance.resolveToken",
            json!({ "token": token }),
        );
        assert_eq!(
            resolved.get("id").and_then(|v| v.as_str()),
            Some(student_id.as_str())
        );
        assert_eq!(
            resolved.get("name").and_then(|v| v.as_str()),
            Some("Asha")
        );
    }

    // By internal UUID.
    let resolved = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.resolveToken",
        json!({ "token": student_id }),
    );
    assert_eq!(
        resolved.get("ssId").and_then(|v| v.as_str()),
        Some(ss_id.as_str())
    );

    // QR labels that encode the full verification URL.
    let url = format!("https://portal.example.com/verify/{}", ss_id);
    let resolved = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.resolveToken",
        json!({ "token": url }),
    );
    assert_eq!(
        resolved.get("id").and_then(|v| v.as_str()),
        Some(student_id.as_str())
    );

    // Negative outcomes: garbage and unknown-but-well-formed tokens.
    assert_eq!(
        resolve_err_code(&mut stdin, &mut reader, "8", "not-a-real-uuid-or-code!!"),
        "not_found"
    );
    assert_eq!(
        resolve_err_code(&mut stdin, &mut reader, "9", "SS9999"),
        "not_found"
    );
    assert_eq!(
        resolve_err_code(&mut stdin, &mut reader, "10", ""),
        "not_found"
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
