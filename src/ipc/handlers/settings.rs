use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::{db_err, err, ok, HandlerErr};
use crate::ipc::handlers::{audit, auth};
use crate::ipc::helpers::now_utc;
use crate::ipc::types::{AppState, CallerContext, Request};

fn settings_get(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT id, brand_name, total_seats, default_monthly_fee, updated_at
         FROM settings
         LIMIT 1",
        [],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "brandName": r.get::<_, String>(1)?,
                "totalSeats": r.get::<_, i64>(2)?,
                "defaultMonthlyFee": r.get::<_, f64>(3)?,
                "updatedAt": r.get::<_, String>(4)?,
            }))
        },
    )
    .optional()
    .map_err(|e| db_err("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::not_found("settings not found"))
}

fn settings_update(
    conn: &Connection,
    caller: &CallerContext,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing/invalid patch"));
    };

    let id: Option<String> = conn
        .query_row("SELECT id FROM settings LIMIT 1", [], |r| r.get(0))
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;
    let Some(id) = id else {
        return Err(HandlerErr::not_found("settings not found"));
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("brandName") {
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(HandlerErr::bad_params("patch.brandName must be a non-empty string"));
        };
        set_parts.push("brand_name = ?".into());
        bind_values.push(Value::Text(s.to_string()));
    }
    if let Some(v) = patch.get("totalSeats") {
        let Some(n) = v.as_i64().filter(|n| *n >= 0) else {
            return Err(HandlerErr::bad_params(
                "patch.totalSeats must be a non-negative integer",
            ));
        };
        set_parts.push("total_seats = ?".into());
        bind_values.push(Value::Integer(n));
    }
    if let Some(v) = patch.get("defaultMonthlyFee") {
        let Some(n) = v.as_f64() else {
            return Err(HandlerErr::bad_params("patch.defaultMonthlyFee must be a number"));
        };
        set_parts.push("default_monthly_fee = ?".into());
        bind_values.push(Value::Real(n));
    }

    if set_parts.is_empty() {
        return Err(HandlerErr::bad_params("patch has no recognized fields"));
    }

    set_parts.push("updated_at = ?".into());
    bind_values.push(Value::Text(now_utc()));
    bind_values.push(Value::Text(id.clone()));

    conn.execute(
        &format!("UPDATE settings SET {} WHERE id = ?", set_parts.join(", ")),
        params_from_iter(bind_values.iter()),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_update_failed", e.to_string(), json!({ "table": "settings" }))
    })?;

    audit::append(conn, Some(caller), "settings.update", Some("settings"), Some(id.as_str()), None);

    settings_get(conn)
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = auth::require_caller(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match settings_get(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match auth::require_admin(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match settings_update(conn, &caller, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_get(state, req)),
        "settings.update" => Some(handle_update(state, req)),
        _ => None,
    }
}
