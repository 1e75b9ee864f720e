use chrono::{DateTime, Duration, Local, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{db_err, err, ok, HandlerErr};
use crate::ipc::handlers::auth;
use crate::ipc::helpers::{format_utc, get_required_str, now_utc};
use crate::ipc::types::{AppState, CallerContext, Request};
use crate::token::{parse_token, ParsedToken};

struct OpenSession {
    id: String,
    check_in: String,
}

fn open_session(conn: &Connection, student_id: &str) -> Result<Option<OpenSession>, HandlerErr> {
    conn.query_row(
        "SELECT id, check_in FROM attendance
         WHERE student_id = ? AND check_out IS NULL
         ORDER BY check_in DESC
         LIMIT 1",
        [student_id],
        |r| {
            Ok(OpenSession {
                id: r.get(0)?,
                check_in: r.get(1)?,
            })
        },
    )
    .optional()
    .map_err(|e| db_err("db_query_failed", e))
}

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| db_err("db_query_failed", e))
}

fn attendance_check_in(
    conn: &Connection,
    caller: &CallerContext,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    // OUT -> IN only. A second check-in hands back the open session instead
    // of creating a duplicate.
    if let Some(existing) = open_session(conn, &student_id)? {
        return Err(HandlerErr::with_details(
            "already_checked_in",
            "Already Checked In",
            json!({ "attendanceId": existing.id, "checkIn": existing.check_in }),
        ));
    }

    let seat_number: Option<i64> = conn
        .query_row(
            "SELECT seat_number FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?
        .flatten();

    let id = Uuid::new_v4().to_string();
    let now = now_utc();
    conn.execute(
        "INSERT INTO attendance(id, student_id, check_in, check_out, seat_number, recorded_by, created_at)
         VALUES(?, ?, ?, NULL, ?, ?, ?)",
        (&id, &student_id, &now, seat_number, &caller.user_id, &now),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "attendance" }))
    })?;

    Ok(json!({
        "attendanceId": id,
        "studentId": student_id,
        "checkIn": now,
        "seatNumber": seat_number
    }))
}

fn attendance_check_out(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    // IN -> OUT only. Nothing open is a normal negative outcome.
    let Some(existing) = open_session(conn, &student_id)? else {
        return Err(HandlerErr::new("not_checked_in", "Not Checked In"));
    };

    let now = now_utc();
    conn.execute(
        "UPDATE attendance SET check_out = ? WHERE id = ?",
        (&now, &existing.id),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_update_failed", e.to_string(), json!({ "table": "attendance" }))
    })?;

    Ok(json!({
        "attendanceId": existing.id,
        "studentId": student_id,
        "checkIn": existing.check_in,
        "checkOut": now,
        "duration": fmt_duration(&existing.check_in, Some(now.as_str()), Utc::now())
    }))
}

fn attendance_resolve_token(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let raw = get_required_str(params, "token")?;

    let row = match parse_token(&raw) {
        ParsedToken::StudentUuid(id) => lookup_student(conn, "id", &id)?,
        ParsedToken::StudentCode(code) => lookup_student(conn, "ss_id", &code)?,
        ParsedToken::Unrecognized => {
            return Err(HandlerErr::not_found("unrecognized token"));
        }
    };

    row.ok_or_else(|| HandlerErr::not_found("no student matching token"))
}

fn lookup_student(
    conn: &Connection,
    column: &str,
    value: &str,
) -> Result<Option<serde_json::Value>, HandlerErr> {
    // `column` is one of two fixed names chosen above, never caller input.
    let sql = format!(
        "SELECT id, ss_id, name, seat_number, phone, status FROM students WHERE {} = ?",
        column
    );
    conn.query_row(&sql, [value], |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "ssId": r.get::<_, String>(1)?,
            "name": r.get::<_, String>(2)?,
            "seatNumber": r.get::<_, Option<i64>>(3)?,
            "phone": r.get::<_, String>(4)?,
            "status": r.get::<_, String>(5)?,
        }))
    })
    .optional()
    .map_err(|e| db_err("db_query_failed", e))
}

fn session_rows(
    conn: &Connection,
    where_clause: &str,
    bind: &[&dyn rusqlite::ToSql],
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let sql = format!(
        "SELECT a.id, a.student_id, a.check_in, a.check_out, a.seat_number,
                st.name, st.ss_id, st.seat_number, st.phone
         FROM attendance a
         JOIN students st ON st.id = a.student_id
         {}
         ORDER BY a.check_in DESC",
        where_clause
    );
    let now = Utc::now();
    let mut stmt = conn.prepare(&sql).map_err(|e| db_err("db_query_failed", e))?;
    stmt.query_map(bind, |r| {
        let check_in: String = r.get(2)?;
        let check_out: Option<String> = r.get(3)?;
        let duration = fmt_duration(&check_in, check_out.as_deref(), now);
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "studentId": r.get::<_, String>(1)?,
            "checkIn": check_in,
            "checkOut": check_out,
            "seatNumber": r.get::<_, Option<i64>>(4)?,
            "student": {
                "name": r.get::<_, String>(5)?,
                "ssId": r.get::<_, String>(6)?,
                "seatNumber": r.get::<_, Option<i64>>(7)?,
                "phone": r.get::<_, String>(8)?,
            },
            "duration": duration,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| db_err("db_query_failed", e))
}

fn attendance_today(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let (start, end) = local_day_bounds_utc(Local::now());
    let rows = session_rows(
        conn,
        "WHERE a.check_in >= ? AND a.check_in < ?",
        &[&start, &end],
    )?;
    Ok(json!({ "records": rows }))
}

fn attendance_present(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let rows = session_rows(conn, "WHERE a.check_out IS NULL", &[])?;
    Ok(json!({ "records": rows }))
}

/// UTC bounds of the caller's local calendar day, for comparing against the
/// stored UTC timestamps as text.
fn local_day_bounds_utc(now_local: DateTime<Local>) -> (String, String) {
    let start_naive = now_local.date_naive().and_time(NaiveTime::MIN);
    let end_naive = start_naive + Duration::days(1);
    let to_utc = |naive: NaiveDateTime| match naive.and_local_timezone(Local) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        // DST fold: take the earlier reading.
        LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
        LocalResult::None => Utc.from_utc_datetime(&naive),
    };
    (format_utc(to_utc(start_naive)), format_utc(to_utc(end_naive)))
}

/// Elapsed time as "3h 25m", floored to whole hours and minutes. Display
/// only; nothing stores this.
fn fmt_duration(check_in: &str, check_out: Option<&str>, now: DateTime<Utc>) -> Option<String> {
    let start = DateTime::parse_from_rfc3339(check_in).ok()?.with_timezone(&Utc);
    let end = match check_out {
        Some(t) => DateTime::parse_from_rfc3339(t).ok()?.with_timezone(&Utc),
        None => now,
    };
    let minutes = (end - start).num_minutes().max(0);
    Some(format!("{}h {}m", minutes / 60, minutes % 60))
}

fn handle_check_in(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match auth::require_caller(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_check_in(conn, &caller, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_check_out(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = auth::require_caller(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_check_out(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_resolve_token(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = auth::require_caller(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_resolve_token(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_today(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = auth::require_caller(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_today(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_present(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = auth::require_caller(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_present(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.checkIn" => Some(handle_check_in(state, req)),
        "attendance.checkOut" => Some(handle_check_out(state, req)),
        "attendance.resolveToken" => Some(handle_resolve_token(state, req)),
        "attendance.today" => Some(handle_today(state, req)),
        "attendance.present" => Some(handle_present(state, req)),
        _ => None,
    }
}
