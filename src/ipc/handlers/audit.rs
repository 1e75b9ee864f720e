use rusqlite::Connection;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::ipc::error::{db_err, err, ok, HandlerErr};
use crate::ipc::handlers::auth;
use crate::ipc::helpers::{get_opt_u64, now_utc};
use crate::ipc::types::{AppState, CallerContext, Request};

/// Append an audit row. Best-effort: a failure here must never fail the
/// operation being audited, so it is logged and swallowed.
pub fn append(
    conn: &Connection,
    caller: Option<&CallerContext>,
    action: &str,
    table_name: Option<&str>,
    record_id: Option<&str>,
    details: Option<serde_json::Value>,
) {
    let id = Uuid::new_v4().to_string();
    let details_text = details.map(|d| d.to_string());
    let result = conn.execute(
        "INSERT INTO audit_logs(
            id, user_id, user_email, user_role, action, table_name, record_id, details, timestamp
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            caller.map(|c| c.user_id.as_str()),
            caller.map(|c| c.email.as_str()),
            caller.map(|c| c.role.as_str()),
            action,
            table_name,
            record_id,
            details_text.as_deref(),
            now_utc(),
        ),
    );
    if let Err(e) = result {
        warn!(action, error = %e, "failed to write audit log entry");
    }
}

fn audit_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let limit = get_opt_u64(params, "limit").unwrap_or(100).min(1000) as i64;

    let mut stmt = conn
        .prepare(
            "SELECT id, user_id, user_email, user_role, action, table_name, record_id, details, timestamp
             FROM audit_logs
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    let rows = stmt
        .query_map([limit], |r| {
            let details_text: Option<String> = r.get(7)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "userId": r.get::<_, Option<String>>(1)?,
                "userEmail": r.get::<_, Option<String>>(2)?,
                "userRole": r.get::<_, Option<String>>(3)?,
                "action": r.get::<_, String>(4)?,
                "tableName": r.get::<_, Option<String>>(5)?,
                "recordId": r.get::<_, Option<String>>(6)?,
                "details": details_text
                    .and_then(|t| serde_json::from_str::<serde_json::Value>(&t).ok()),
                "timestamp": r.get::<_, String>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;

    Ok(json!({ "entries": rows }))
}

fn handle_audit_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = auth::require_admin(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match audit_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "audit.list" => Some(handle_audit_list(state, req)),
        _ => None,
    }
}
