use rusqlite::Connection;
use std::path::Path;
use uuid::Uuid;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("seatbook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Creates every table the daemon needs. Also used by unit tests against an
/// in-memory connection, so it must stay independent of the workspace path.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            ss_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            phone TEXT NOT NULL,
            email TEXT,
            photo TEXT,
            monthly_fee REAL NOT NULL DEFAULT 0,
            discount REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'active',
            fee_status TEXT NOT NULL DEFAULT 'pending',
            fee_due_date TEXT,
            seat_number INTEGER,
            date_joined TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_ss_id ON students(ss_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_status ON students(status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS seats(
            id TEXT PRIMARY KEY,
            seat_number INTEGER NOT NULL UNIQUE,
            student_id TEXT REFERENCES students(id),
            version INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    // Workspaces created before the optimistic-concurrency counter existed.
    ensure_seats_version(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_seats_student ON seats(student_id)",
        [],
    )?;

    // No foreign key on student_id: history rows outlive deleted students.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS seat_history(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            old_seat INTEGER,
            new_seat INTEGER,
            changed_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_seat_history_student ON seat_history(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL REFERENCES students(id),
            check_in TEXT NOT NULL,
            check_out TEXT,
            seat_number INTEGER,
            recorded_by TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_check_in ON attendance(check_in)",
        [],
    )?;
    // At most one open session per student. The tracker checks before
    // inserting (it wants to hand back the existing record); the index backs
    // the invariant when something else writes the table.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_attendance_open_session
            ON attendance(student_id)
            WHERE check_out IS NULL",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL REFERENCES students(id),
            amount REAL NOT NULL,
            method TEXT NOT NULL DEFAULT 'cash',
            notes TEXT,
            payment_date TEXT NOT NULL,
            recorded_by TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_student ON payments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_date ON payments(payment_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            id TEXT PRIMARY KEY,
            brand_name TEXT NOT NULL DEFAULT 'SeatBook',
            total_seats INTEGER NOT NULL DEFAULT 50,
            default_monthly_fee REAL NOT NULL DEFAULT 1000,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_roles(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id),
            role TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(user_id)
        )",
        [],
    )?;

    // No foreign keys: audit rows must survive whatever they describe.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_logs(
            id TEXT PRIMARY KEY,
            user_id TEXT,
            user_email TEXT,
            user_role TEXT,
            action TEXT NOT NULL,
            table_name TEXT,
            record_id TEXT,
            details TEXT,
            timestamp TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_logs_timestamp ON audit_logs(timestamp)",
        [],
    )?;

    ensure_students_fee_due_date(conn)?;
    seed_settings(conn)?;

    Ok(())
}

fn ensure_seats_version(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "seats", "version")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE seats ADD COLUMN version INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn ensure_students_fee_due_date(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "fee_due_date")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN fee_due_date TEXT", [])?;
    Ok(())
}

fn seed_settings(conn: &Connection) -> anyhow::Result<()> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO settings(id, updated_at)
         SELECT ?, strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE NOT EXISTS (SELECT 1 FROM settings)",
        [&id],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
