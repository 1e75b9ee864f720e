use chrono::{Months, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::ipc::error::{db_err, err, ok, HandlerErr};
use crate::ipc::handlers::{audit, auth};
use crate::ipc::helpers::{
    format_utc, get_opt_str, get_opt_u64, get_required_f64, get_required_str, now_utc,
};
use crate::ipc::types::{AppState, CallerContext, Request};

const METHODS: [&str; 4] = ["cash", "upi", "online", "other"];

fn payments_record(
    conn: &Connection,
    caller: &CallerContext,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    // The dialog pre-fills monthly_fee - discount, but whatever the operator
    // typed is what gets recorded.
    let amount = get_required_f64(params, "amount")?;
    let method = get_opt_str(params, "method").unwrap_or_else(|| "cash".into());
    if !METHODS.contains(&method.as_str()) {
        return Err(HandlerErr::bad_params(
            "method must be cash, upi, online, or other",
        ));
    }
    let notes = get_opt_str(params, "notes");

    let exists = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?
        .is_some();
    if !exists {
        return Err(HandlerErr::not_found("student not found"));
    }

    let id = Uuid::new_v4().to_string();
    let paid_at = Utc::now();
    let payment_date = format_utc(paid_at);
    conn.execute(
        "INSERT INTO payments(id, student_id, amount, method, notes, payment_date, recorded_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &student_id,
            amount,
            &method,
            notes.as_deref(),
            &payment_date,
            &caller.user_id,
            &payment_date,
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "payments" }))
    })?;

    // Follow-up write, not transactional with the insert: the payment row is
    // the record of truth and stands even if this marking fails.
    let next_due = paid_at
        .checked_add_months(Months::new(1))
        .map(format_utc)
        .unwrap_or_else(|| payment_date.clone());
    let marked = conn.execute(
        "UPDATE students SET fee_status = 'paid', fee_due_date = ?, updated_at = ? WHERE id = ?",
        (&next_due, &now_utc(), &student_id),
    );
    if let Err(e) = marked {
        warn!(student_id = %student_id, error = %e, "payment recorded but fee status not updated");
    }

    audit::append(
        conn,
        Some(caller),
        "payment.record",
        Some("payments"),
        Some(id.as_str()),
        Some(json!({ "studentId": student_id, "amount": amount, "method": method })),
    );

    Ok(json!({
        "paymentId": id,
        "studentId": student_id,
        "amount": amount,
        "paymentDate": payment_date,
        "nextDueDate": next_due
    }))
}

fn payments_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_opt_str(params, "studentId");
    let limit = get_opt_u64(params, "limit").unwrap_or(50).min(500) as i64;

    let sql = format!(
        "SELECT p.id, p.student_id, p.amount, p.method, p.notes, p.payment_date, p.recorded_by,
                st.ss_id, st.name
         FROM payments p
         JOIN students st ON st.id = p.student_id
         {}
         ORDER BY p.payment_date DESC, p.rowid DESC
         LIMIT ?",
        if student_id.is_some() {
            "WHERE p.student_id = ?"
        } else {
            ""
        }
    );

    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "studentId": r.get::<_, String>(1)?,
            "amount": r.get::<_, f64>(2)?,
            "method": r.get::<_, String>(3)?,
            "notes": r.get::<_, Option<String>>(4)?,
            "paymentDate": r.get::<_, String>(5)?,
            "recordedBy": r.get::<_, Option<String>>(6)?,
            "student": {
                "ssId": r.get::<_, String>(7)?,
                "name": r.get::<_, String>(8)?,
            }
        }))
    };

    let mut stmt = conn.prepare(&sql).map_err(|e| db_err("db_query_failed", e))?;
    let rows = match &student_id {
        Some(sid) => stmt
            .query_map((sid, limit), map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([limit], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(|e| db_err("db_query_failed", e))?;

    Ok(json!({ "payments": rows }))
}

fn handle_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match auth::require_caller(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match payments_record(conn, &caller, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = auth::require_caller(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match payments_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "payments.record" => Some(handle_record(state, req)),
        "payments.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
