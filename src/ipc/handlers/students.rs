use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::codes;
use crate::ipc::error::{db_err, err, ok, HandlerErr};
use crate::ipc::handlers::{audit, auth, seats};
use crate::ipc::helpers::{
    get_opt_f64, get_opt_str, get_opt_u64, get_required_str, now_utc, today_local,
};
use crate::ipc::types::{AppState, CallerContext, Request};

const STATUSES: [&str; 2] = ["active", "inactive"];
const FEE_STATUSES: [&str; 3] = ["paid", "pending", "overdue"];

/// Read-then-compute code generation: latest code in, next code out. Two
/// registrations racing here can compute the same code; the UNIQUE
/// constraint on ss_id turns the loser into a store-rejected write.
fn next_code(conn: &Connection) -> Result<String, HandlerErr> {
    let last: Option<String> = conn
        .query_row(
            "SELECT ss_id FROM students ORDER BY created_at DESC, rowid DESC LIMIT 1",
            [],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;
    Ok(codes::next_code(last.as_deref()))
}

fn students_next_code(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({ "ssId": next_code(conn)? }))
}

fn students_create(
    conn: &Connection,
    caller: &CallerContext,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    let phone = get_required_str(params, "phone")?.trim().to_string();
    if name.is_empty() || phone.is_empty() {
        return Err(HandlerErr::bad_params("name/phone must not be empty"));
    }
    let email = get_opt_str(params, "email");
    let photo = get_opt_str(params, "photo");
    let discount = get_opt_f64(params, "discount").unwrap_or(0.0);

    let monthly_fee = match get_opt_f64(params, "monthlyFee") {
        Some(v) => v,
        None => conn
            .query_row("SELECT default_monthly_fee FROM settings LIMIT 1", [], |r| {
                r.get(0)
            })
            .optional()
            .map_err(|e| db_err("db_query_failed", e))?
            .unwrap_or(0.0),
    };

    let ss_id = match get_opt_str(params, "ssId") {
        Some(v) => v.to_ascii_uppercase(),
        None => next_code(conn)?,
    };

    let student_id = Uuid::new_v4().to_string();
    let now = now_utc();
    conn.execute(
        "INSERT INTO students(
            id, ss_id, name, phone, email, photo, monthly_fee, discount,
            status, fee_status, seat_number, date_joined, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'active', 'pending', NULL, ?, ?, ?)",
        (
            &student_id,
            &ss_id,
            &name,
            &phone,
            email.as_deref(),
            photo.as_deref(),
            monthly_fee,
            discount,
            today_local(),
            &now,
            &now,
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "students" }))
    })?;

    audit::append(
        conn,
        Some(caller),
        "student.create",
        Some("students"),
        Some(student_id.as_str()),
        Some(json!({ "ssId": ss_id, "name": name })),
    );

    // Optional initial seat; dialogs submit "" for "no seat". Runs after the
    // insert, so a seat failure leaves the registration in place and the
    // error reports the already-created student.
    let seat_id = get_opt_str(params, "seatId");
    let mut seat_number = serde_json::Value::Null;
    if let Some(sid) = seat_id {
        let seat_version = params.get("seatVersion").and_then(|v| v.as_i64());
        match seats::assign_seat(conn, caller, &student_id, Some(&sid), seat_version) {
            Ok(assigned) => seat_number = assigned["seatNumber"].clone(),
            Err(e) => {
                let mut details = e.details.unwrap_or_else(|| json!({}));
                details["studentId"] = json!(student_id);
                return Err(HandlerErr::with_details(e.code, e.message, details));
            }
        }
    }

    Ok(json!({
        "studentId": student_id,
        "ssId": ss_id,
        "seatNumber": seat_number
    }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut where_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(status) = get_opt_str(params, "status") {
        if !STATUSES.contains(&status.as_str()) {
            return Err(HandlerErr::bad_params("invalid status filter"));
        }
        where_parts.push("status = ?".into());
        bind_values.push(Value::Text(status));
    }
    if let Some(fee_status) = get_opt_str(params, "feeStatus") {
        if !FEE_STATUSES.contains(&fee_status.as_str()) {
            return Err(HandlerErr::bad_params("invalid feeStatus filter"));
        }
        where_parts.push("fee_status = ?".into());
        bind_values.push(Value::Text(fee_status));
    }
    if let Some(search) = get_opt_str(params, "search") {
        let pattern = format!("%{}%", search);
        where_parts
            .push("(name LIKE ? COLLATE NOCASE OR ss_id LIKE ? COLLATE NOCASE OR phone LIKE ?)".into());
        bind_values.push(Value::Text(pattern.clone()));
        bind_values.push(Value::Text(pattern.clone()));
        bind_values.push(Value::Text(pattern));
    }

    let where_clause = if where_parts.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", where_parts.join(" AND "))
    };

    let sort_by = get_opt_str(params, "sortBy").unwrap_or_else(|| "created_at".into());
    // Sort keys are interpolated into SQL, so only known columns pass.
    const SORTABLE: [&str; 8] = [
        "created_at",
        "name",
        "ss_id",
        "seat_number",
        "monthly_fee",
        "status",
        "fee_status",
        "date_joined",
    ];
    if !SORTABLE.contains(&sort_by.as_str()) {
        return Err(HandlerErr::bad_params("invalid sortBy"));
    }
    let sort_dir = match get_opt_str(params, "sortDir").as_deref() {
        None | Some("desc") => "DESC",
        Some("asc") => "ASC",
        Some(_) => return Err(HandlerErr::bad_params("sortDir must be asc or desc")),
    };

    let total: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM students {}", where_clause),
            params_from_iter(bind_values.iter()),
            |r| r.get(0),
        )
        .map_err(|e| db_err("db_query_failed", e))?;

    let page = get_opt_u64(params, "page").unwrap_or(1).max(1);
    let page_size = get_opt_u64(params, "pageSize").unwrap_or(20).clamp(1, 200);
    let offset = (page - 1) * page_size;

    let sql = format!(
        "SELECT id, ss_id, name, phone, email, photo, monthly_fee, discount,
                status, fee_status, fee_due_date, seat_number, date_joined, created_at
         FROM students
         {}
         ORDER BY {} {}
         LIMIT {} OFFSET {}",
        where_clause, sort_by, sort_dir, page_size, offset
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| db_err("db_query_failed", e))?;
    let rows = stmt
        .query_map(params_from_iter(bind_values.iter()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "ssId": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "phone": r.get::<_, String>(3)?,
                "email": r.get::<_, Option<String>>(4)?,
                "photo": r.get::<_, Option<String>>(5)?,
                "monthlyFee": r.get::<_, f64>(6)?,
                "discount": r.get::<_, f64>(7)?,
                "status": r.get::<_, String>(8)?,
                "feeStatus": r.get::<_, String>(9)?,
                "feeDueDate": r.get::<_, Option<String>>(10)?,
                "seatNumber": r.get::<_, Option<i64>>(11)?,
                "dateJoined": r.get::<_, String>(12)?,
                "createdAt": r.get::<_, String>(13)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;

    Ok(json!({ "students": rows, "total": total }))
}

fn students_update(
    conn: &Connection,
    caller: &CallerContext,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing/invalid patch"));
    };

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

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    let mut patched_keys: Vec<&str> = Vec::new();

    if let Some(v) = patch.get("phone") {
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(HandlerErr::bad_params("patch.phone must be a non-empty string"));
        };
        set_parts.push("phone = ?".into());
        bind_values.push(Value::Text(s.to_string()));
        patched_keys.push("phone");
    }
    if let Some(v) = patch.get("name") {
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(HandlerErr::bad_params("patch.name must be a non-empty string"));
        };
        set_parts.push("name = ?".into());
        bind_values.push(Value::Text(s.to_string()));
        patched_keys.push("name");
    }
    if let Some(v) = patch.get("email") {
        match v {
            serde_json::Value::Null => {
                set_parts.push("email = NULL".into());
            }
            serde_json::Value::String(s) => {
                set_parts.push("email = ?".into());
                bind_values.push(Value::Text(s.trim().to_string()));
            }
            _ => return Err(HandlerErr::bad_params("patch.email must be string or null")),
        }
        patched_keys.push("email");
    }
    if let Some(v) = patch.get("photo") {
        match v {
            serde_json::Value::Null => {
                set_parts.push("photo = NULL".into());
            }
            serde_json::Value::String(s) => {
                set_parts.push("photo = ?".into());
                bind_values.push(Value::Text(s.trim().to_string()));
            }
            _ => return Err(HandlerErr::bad_params("patch.photo must be string or null")),
        }
        patched_keys.push("photo");
    }
    if let Some(v) = patch.get("status") {
        let Some(s) = v.as_str().filter(|s| STATUSES.contains(s)) else {
            return Err(HandlerErr::bad_params("patch.status must be active or inactive"));
        };
        set_parts.push("status = ?".into());
        bind_values.push(Value::Text(s.to_string()));
        patched_keys.push("status");
    }
    if let Some(v) = patch.get("feeStatus") {
        let Some(s) = v.as_str().filter(|s| FEE_STATUSES.contains(s)) else {
            return Err(HandlerErr::bad_params(
                "patch.feeStatus must be paid, pending, or overdue",
            ));
        };
        set_parts.push("fee_status = ?".into());
        bind_values.push(Value::Text(s.to_string()));
        patched_keys.push("feeStatus");
    }
    if let Some(v) = patch.get("monthlyFee") {
        let Some(n) = v.as_f64() else {
            return Err(HandlerErr::bad_params("patch.monthlyFee must be a number"));
        };
        set_parts.push("monthly_fee = ?".into());
        bind_values.push(Value::Real(n));
        patched_keys.push("monthlyFee");
    }
    if let Some(v) = patch.get("discount") {
        let Some(n) = v.as_f64() else {
            return Err(HandlerErr::bad_params("patch.discount must be a number"));
        };
        set_parts.push("discount = ?".into());
        bind_values.push(Value::Real(n));
        patched_keys.push("discount");
    }

    if set_parts.is_empty() {
        return Err(HandlerErr::bad_params("patch has no recognized fields"));
    }

    set_parts.push("updated_at = ?".into());
    bind_values.push(Value::Text(now_utc()));
    bind_values.push(Value::Text(student_id.clone()));

    let sql = format!(
        "UPDATE students SET {} WHERE id = ?",
        set_parts.join(", ")
    );
    conn.execute(&sql, params_from_iter(bind_values.iter()))
        .map_err(|e| {
            HandlerErr::with_details("db_update_failed", e.to_string(), json!({ "table": "students" }))
        })?;

    audit::append(
        conn,
        Some(caller),
        "student.update",
        Some("students"),
        Some(student_id.as_str()),
        Some(json!({ "fields": patched_keys })),
    );

    Ok(json!({ "studentId": student_id }))
}

fn students_delete(
    conn: &Connection,
    caller: &CallerContext,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;

    let row: Option<(String, Option<i64>)> = conn
        .query_row(
            "SELECT ss_id, seat_number FROM students WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;
    let Some((ss_id, seat_number)) = row else {
        return Err(HandlerErr::not_found("student not found"));
    };

    let now = now_utc();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;

    // Release the seat first; the seats table still references the student
    // row until it does. Rolled back along with everything else if the
    // delete is refused.
    if let Some(n) = seat_number {
        tx.execute(
            "UPDATE seats SET student_id = NULL, version = version + 1, updated_at = ?
             WHERE seat_number = ? AND student_id = ?",
            (&now, n, &student_id),
        )
        .map_err(|e| db_err("db_update_failed", e))?;
        tx.execute(
            "INSERT INTO seat_history(id, student_id, old_seat, new_seat, changed_at)
             VALUES(?, ?, ?, NULL, ?)",
            (Uuid::new_v4().to_string(), &student_id, n, &now),
        )
        .map_err(|e| db_err("db_insert_failed", e))?;
    }

    // Attendance/payment rows keep their foreign keys, so the store refuses
    // to delete a student with history; that surfaces as the error below.
    tx.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| {
            HandlerErr::with_details("db_delete_failed", e.to_string(), json!({ "table": "students" }))
        })?;

    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    audit::append(
        conn,
        Some(caller),
        "student.delete",
        Some("students"),
        Some(student_id.as_str()),
        Some(json!({ "ssId": ss_id, "seatNumber": seat_number })),
    );

    Ok(json!({ "studentId": student_id }))
}

fn handle_next_code(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = auth::require_caller(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_next_code(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match auth::require_caller(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_create(conn, &caller, &req.params) {
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
    match students_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match auth::require_caller(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_update(conn, &caller, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match auth::require_admin(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_delete(conn, &caller, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.nextCode" => Some(handle_next_code(state, req)),
        "students.create" => Some(handle_create(state, req)),
        "students.list" => Some(handle_list(state, req)),
        "students.update" => Some(handle_update(state, req)),
        "students.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
