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

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert!(
        !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
        "{} unexpectedly succeeded: {}",
        method,
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
fn first_run_signup_then_admin_gated_staff_creation() {
    let workspace = temp_workspace("seatbook-staff");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // First run: no admin yet, so signup is open.
    let exists = request_ok(&mut stdin, &mut reader, "2", "auth.adminExists", json!({}));
    assert_eq!(exists.get("adminExists").and_then(|v| v.as_bool()), Some(false));

    let admin = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.signUp",
        json!({ "email": "admin@example.com", "password": "secret1" }),
    );
    assert_eq!(admin.get("role").and_then(|v| v.as_str()), Some("admin"));

    let exists = request_ok(&mut stdin, &mut reader, "4", "auth.adminExists", json!({}));
    assert_eq!(exists.get("adminExists").and_then(|v| v.as_bool()), Some(true));

    // The gate closes once an admin exists.
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "5",
            "auth.signUp",
            json!({ "email": "second@example.com", "password": "secret1" }),
        ),
        "forbidden"
    );

    // Admin creates a staff account; identity and role land together.
    let staff = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "staff.create",
        json!({ "email": "staff@example.com", "password": "secret2" }),
    );
    let staff_id = staff
        .get("userId")
        .and_then(|v| v.as_str())
        .expect("userId")
        .to_string();

    let db_path = workspace.join("seatbook.sqlite3");
    let conn = Connection::open(&db_path).expect("open db");
    let role: String = conn
        .query_row(
            "SELECT role FROM user_roles WHERE user_id = ?",
            [&staff_id],
            |r| r.get(0),
        )
        .expect("staff role row");
    assert_eq!(role, "staff");

    // No identity exists without a role.
    let orphans: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM users u
             WHERE NOT EXISTS (SELECT 1 FROM user_roles r WHERE r.user_id = u.id)",
            [],
            |r| r.get(0),
        )
        .expect("orphan count");
    assert_eq!(orphans, 0);

    // A duplicate email fails at the identity step and leaves no extra rows.
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "7",
            "staff.create",
            json!({ "email": "staff@example.com", "password": "secret3" }),
        ),
        "db_insert_failed"
    );
    let users: i64 = conn
        .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
        .expect("user count");
    assert_eq!(users, 2);

    // Staff can sign in but cannot mint more staff.
    let signed_in = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "auth.signIn",
        json!({ "email": "staff@example.com", "password": "secret2" }),
    );
    assert_eq!(signed_in.get("role").and_then(|v| v.as_str()), Some("staff"));
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "9",
            "staff.create",
            json!({ "email": "more@example.com", "password": "secret4" }),
        ),
        "forbidden"
    );

    // Wrong password and missing account share one refusal.
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "10",
            "auth.signIn",
            json!({ "email": "staff@example.com", "password": "wrong!" }),
        ),
        "unauthorized"
    );
    assert_eq!(
        request_err_code(
            &mut stdin,
            &mut reader,
            "11",
            "auth.signIn",
            json!({ "email": "nobody@example.com", "password": "secret2" }),
        ),
        "unauthorized"
    );

    // Signed out, domain operations refuse to run.
    request_ok(&mut stdin, &mut reader, "12", "auth.signOut", json!({}));
    assert_eq!(
        request_err_code(&mut stdin, &mut reader, "13", "students.list", json!({})),
        "unauthorized"
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
