use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use rand_core::OsRng;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::ipc::error::{db_err, err, ok, HandlerErr};
use crate::ipc::handlers::audit;
use crate::ipc::helpers::{get_required_str, now_utc};
use crate::ipc::types::{AppState, CallerContext, Request, Role};

/// Resolve the signed-in session into an explicit caller context. Every
/// operation that stamps `recorded_by` or checks a role takes this as an
/// argument instead of reaching into ambient state.
pub fn require_caller(state: &AppState) -> Result<CallerContext, HandlerErr> {
    state
        .session
        .clone()
        .ok_or_else(|| HandlerErr::new("unauthorized", "sign in first"))
}

pub fn require_admin(state: &AppState) -> Result<CallerContext, HandlerErr> {
    let caller = require_caller(state)?;
    if caller.role != Role::Admin {
        return Err(HandlerErr::new("forbidden", "admin role required"));
    }
    Ok(caller)
}

pub fn admin_exists(conn: &Connection) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM user_roles WHERE role = 'admin' LIMIT 1",
        [],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| db_err("db_query_failed", e))
}

fn hash_password(password: &str) -> Result<String, HandlerErr> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| HandlerErr::new("hash_failed", e.to_string()))
}

fn verify_password(stored: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

fn check_credentials(email: &str, password: &str) -> Result<(), HandlerErr> {
    if !email.contains('@') {
        return Err(HandlerErr::bad_params("invalid email"));
    }
    if password.len() < 6 {
        return Err(HandlerErr::bad_params(
            "password must be at least 6 characters",
        ));
    }
    Ok(())
}

/// Create an identity and grant it a role. If the role insert fails, the
/// just-created identity is deleted again so no role-less account remains.
pub fn create_account(
    conn: &Connection,
    email: &str,
    password: &str,
    role: Role,
) -> Result<String, HandlerErr> {
    let user_id = Uuid::new_v4().to_string();
    let hash = hash_password(password)?;
    let now = now_utc();

    conn.execute(
        "INSERT INTO users(id, email, password_hash, created_at) VALUES(?, ?, ?, ?)",
        (&user_id, email, &hash, &now),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "users" }))
    })?;

    let role_row_id = Uuid::new_v4().to_string();
    let role_insert = conn.execute(
        "INSERT INTO user_roles(id, user_id, role, created_at) VALUES(?, ?, ?, ?)",
        (&role_row_id, &user_id, role.as_str(), &now),
    );
    if let Err(e) = role_insert {
        // Compensating action: take the identity back out rather than leave
        // an account no role policy will ever match.
        if let Err(del) = conn.execute("DELETE FROM users WHERE id = ?", [&user_id]) {
            warn!(user_id = %user_id, error = %del, "failed to delete identity after role assignment failure");
        }
        return Err(HandlerErr::with_details(
            "db_insert_failed",
            format!("failed to assign {} role: {}", role.as_str(), e),
            json!({ "table": "user_roles" }),
        ));
    }

    Ok(user_id)
}

fn handle_admin_exists(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match admin_exists(conn) {
        Ok(exists) => ok(&req.id, json!({ "adminExists": exists })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_sign_up(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let result = (|| {
        let email = get_required_str(&req.params, "email")?;
        let password = get_required_str(&req.params, "password")?;
        check_credentials(&email, &password)?;

        // First-run flow only: once an admin exists, accounts come from
        // staff.create.
        if admin_exists(conn)? {
            return Err(HandlerErr::new("forbidden", "admin account already exists"));
        }

        let user_id = create_account(conn, &email, &password, Role::Admin)?;
        let caller = CallerContext {
            user_id: user_id.clone(),
            email,
            role: Role::Admin,
        };
        audit::append(conn, Some(&caller), "auth.signup", Some("users"), Some(user_id.as_str()), None);
        Ok(caller)
    })();

    match result {
        Ok(caller) => {
            let body = json!({ "userId": caller.user_id, "email": caller.email, "role": caller.role.as_str() });
            state.session = Some(caller);
            ok(&req.id, body)
        }
        Err(e) => e.response(&req.id),
    }
}

fn handle_sign_in(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let result = (|| {
        let email = get_required_str(&req.params, "email")?;
        let password = get_required_str(&req.params, "password")?;

        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT id, password_hash FROM users WHERE email = ?",
                [&email],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(|e| db_err("db_query_failed", e))?;

        // One message for both failure paths; no account enumeration.
        let Some((user_id, stored_hash)) = row else {
            return Err(HandlerErr::new("unauthorized", "invalid email or password"));
        };
        if !verify_password(&stored_hash, &password) {
            return Err(HandlerErr::new("unauthorized", "invalid email or password"));
        }

        let role_str: Option<String> = conn
            .query_row(
                "SELECT role FROM user_roles WHERE user_id = ?",
                [&user_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| db_err("db_query_failed", e))?;
        let role = role_str
            .as_deref()
            .and_then(Role::parse)
            .ok_or_else(|| HandlerErr::new("unauthorized", "no role assigned"))?;

        Ok(CallerContext {
            user_id,
            email,
            role,
        })
    })();

    match result {
        Ok(caller) => {
            let body = json!({ "userId": caller.user_id, "email": caller.email, "role": caller.role.as_str() });
            state.session = Some(caller);
            ok(&req.id, body)
        }
        Err(e) => e.response(&req.id),
    }
}

fn handle_sign_out(state: &mut AppState, req: &Request) -> serde_json::Value {
    state.session = None;
    ok(&req.id, json!({ "signedIn": false }))
}

fn handle_session(state: &mut AppState, req: &Request) -> serde_json::Value {
    match state.session.as_ref() {
        Some(s) => ok(
            &req.id,
            json!({
                "signedIn": true,
                "userId": s.user_id,
                "email": s.email,
                "role": s.role.as_str()
            }),
        ),
        None => ok(&req.id, json!({ "signedIn": false })),
    }
}

fn handle_staff_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match require_caller(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    if caller.role != Role::Admin {
        return err(
            &req.id,
            "forbidden",
            "only admins can create staff accounts",
            None,
        );
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let result: Result<serde_json::Value, HandlerErr> = (|| {
        let email = get_required_str(&req.params, "email")?;
        let password = get_required_str(&req.params, "password")?;
        check_credentials(&email, &password)?;

        let user_id = create_account(conn, &email, &password, Role::Staff)?;
        audit::append(
            conn,
            Some(&caller),
            "staff.create",
            Some("users"),
            Some(user_id.as_str()),
            Some(json!({ "email": email })),
        );
        Ok(json!({ "userId": user_id }))
    })();

    match result {
        Ok(body) => ok(&req.id, body),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.adminExists" => Some(handle_admin_exists(state, req)),
        "auth.signUp" => Some(handle_sign_up(state, req)),
        "auth.signIn" => Some(handle_sign_in(state, req)),
        "auth.signOut" => Some(handle_sign_out(state, req)),
        "auth.session" => Some(handle_session(state, req)),
        "staff.create" => Some(handle_staff_create(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute("PRAGMA foreign_keys = ON", []).expect("pragma");
        db::init_schema(&conn).expect("schema");
        conn
    }

    #[test]
    fn create_account_writes_identity_and_role() {
        let conn = memory_db();
        let user_id = create_account(&conn, "staff@example.com", "secret1", Role::Staff)
            .expect("create account");

        let role: String = conn
            .query_row(
                "SELECT role FROM user_roles WHERE user_id = ?",
                [&user_id],
                |r| r.get(0),
            )
            .expect("role row");
        assert_eq!(role, "staff");
    }

    #[test]
    fn role_assignment_failure_deletes_the_identity() {
        let conn = memory_db();
        // Sabotage the role table so the second step fails after the first
        // succeeded.
        conn.execute("DROP TABLE user_roles", []).expect("drop");

        let result = create_account(&conn, "staff@example.com", "secret1", Role::Staff);
        assert!(result.is_err());

        let users: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .expect("count users");
        assert_eq!(users, 0, "compensating delete must remove the identity");
    }

    #[test]
    fn sign_in_round_trips_password_hash() {
        let conn = memory_db();
        create_account(&conn, "admin@example.com", "hunter22", Role::Admin).expect("create");

        let stored: String = conn
            .query_row(
                "SELECT password_hash FROM users WHERE email = ?",
                ["admin@example.com"],
                |r| r.get(0),
            )
            .expect("hash");
        assert!(verify_password(&stored, "hunter22"));
        assert!(!verify_password(&stored, "hunter23"));
    }
}
