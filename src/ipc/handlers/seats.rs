use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::ipc::error::{db_err, err, ok, HandlerErr};
use crate::ipc::handlers::{audit, auth};
use crate::ipc::helpers::{get_opt_u64, get_required_str, now_utc};
use crate::ipc::types::{AppState, CallerContext, Request};

struct SeatRow {
    id: String,
    seat_number: i64,
    student_id: Option<String>,
    version: i64,
}

fn load_seat(conn: &Connection, seat_id: &str) -> Result<SeatRow, HandlerErr> {
    conn.query_row(
        "SELECT id, seat_number, student_id, version FROM seats WHERE id = ?",
        [seat_id],
        |r| {
            Ok(SeatRow {
                id: r.get(0)?,
                seat_number: r.get(1)?,
                student_id: r.get(2)?,
                version: r.get(3)?,
            })
        },
    )
    .optional()
    .map_err(|e| db_err("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::not_found("seat not found"))
}

fn push_history(
    conn: &Connection,
    student_id: &str,
    old_seat: Option<i64>,
    new_seat: Option<i64>,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO seat_history(id, student_id, old_seat, new_seat, changed_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            student_id,
            old_seat,
            new_seat,
            now_utc(),
        ),
    )
    .map_err(|e| db_err("db_insert_failed", e))?;
    Ok(())
}

/// Move a student onto a seat (or off every seat, when `seat_id` is None),
/// keeping `students.seat_number` and `seats.student_id` in agreement.
///
/// The write order is the documented one — student row first, then free the
/// old seat, then claim the new one, then the history record — and the whole
/// sequence runs in one transaction so a failure partway leaves nothing
/// half-moved. Also used by student registration for an initial seat.
pub fn assign_seat(
    conn: &Connection,
    caller: &CallerContext,
    student_id: &str,
    seat_id: Option<&str>,
    seat_version: Option<i64>,
) -> Result<serde_json::Value, HandlerErr> {
    let old_seat: Option<i64> = conn
        .query_row(
            "SELECT seat_number FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;

    let target = match seat_id {
        Some(sid) => {
            let seat = load_seat(conn, sid)?;
            if let Some(occupant) = &seat.student_id {
                if occupant != student_id {
                    return Err(HandlerErr::with_details(
                        "seat_occupied",
                        format!("seat {} is already occupied", seat.seat_number),
                        json!({ "seatNumber": seat.seat_number }),
                    ));
                }
            }
            // The caller must hand back the version it read; a mismatch means
            // someone else touched the seat since, and the write is refused.
            let expected = seat_version
                .ok_or_else(|| HandlerErr::bad_params("missing seatVersion"))?;
            if expected != seat.version {
                return Err(HandlerErr::with_details(
                    "conflict",
                    format!("seat {} was modified by someone else", seat.seat_number),
                    json!({ "seatId": seat.id, "version": seat.version }),
                ));
            }
            Some(seat)
        }
        None => None,
    };

    let new_seat_number = target.as_ref().map(|s| s.seat_number);
    if old_seat == new_seat_number {
        return Ok(json!({
            "studentId": student_id,
            "seatNumber": new_seat_number,
            "changed": false
        }));
    }

    let now = now_utc();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;

    tx.execute(
        "UPDATE students SET seat_number = ?, updated_at = ? WHERE id = ?",
        (new_seat_number, &now, student_id),
    )
    .map_err(|e| db_err("db_update_failed", e))?;

    if let Some(old) = old_seat {
        tx.execute(
            "UPDATE seats SET student_id = NULL, version = version + 1, updated_at = ?
             WHERE seat_number = ? AND student_id = ?",
            (&now, old, student_id),
        )
        .map_err(|e| db_err("db_update_failed", e))?;
    }

    if let Some(seat) = &target {
        tx.execute(
            "UPDATE seats SET student_id = ?, version = version + 1, updated_at = ? WHERE id = ?",
            (student_id, &now, &seat.id),
        )
        .map_err(|e| db_err("db_update_failed", e))?;
    }

    push_history(&tx, student_id, old_seat, new_seat_number)?;

    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    audit::append(
        conn,
        Some(caller),
        "seat.assign",
        Some("seats"),
        target.as_ref().map(|s| s.id.as_str()),
        Some(json!({
            "studentId": student_id,
            "oldSeat": old_seat,
            "newSeat": new_seat_number
        })),
    );

    Ok(json!({
        "studentId": student_id,
        "seatNumber": new_seat_number,
        "seatVersion": target.as_ref().map(|s| s.version + 1),
        "changed": true
    }))
}

fn seats_assign(
    conn: &Connection,
    caller: &CallerContext,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    // seatId may be null (or "") to clear the student's seat.
    let seat_id = params
        .get("seatId")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let seat_version = params.get("seatVersion").and_then(|v| v.as_i64());
    assign_seat(conn, caller, &student_id, seat_id.as_deref(), seat_version)
}

fn seats_clear(
    conn: &Connection,
    caller: &CallerContext,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let seat_id = get_required_str(params, "seatId")?;
    let seat = load_seat(conn, &seat_id)?;

    let expected = params
        .get("seatVersion")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("missing seatVersion"))?;
    if expected != seat.version {
        return Err(HandlerErr::with_details(
            "conflict",
            format!("seat {} was modified by someone else", seat.seat_number),
            json!({ "seatId": seat.id, "version": seat.version }),
        ));
    }

    let Some(occupant) = seat.student_id.clone() else {
        return Ok(json!({
            "seatId": seat.id,
            "seatNumber": seat.seat_number,
            "changed": false
        }));
    };

    let now = now_utc();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;

    tx.execute(
        "UPDATE students SET seat_number = NULL, updated_at = ? WHERE id = ?",
        (&now, &occupant),
    )
    .map_err(|e| db_err("db_update_failed", e))?;
    tx.execute(
        "UPDATE seats SET student_id = NULL, version = version + 1, updated_at = ? WHERE id = ?",
        (&now, &seat.id),
    )
    .map_err(|e| db_err("db_update_failed", e))?;
    push_history(&tx, &occupant, Some(seat.seat_number), None)?;

    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    audit::append(
        conn,
        Some(caller),
        "seat.clear",
        Some("seats"),
        Some(seat.id.as_str()),
        Some(json!({ "studentId": occupant, "oldSeat": seat.seat_number })),
    );

    Ok(json!({
        "seatId": seat.id,
        "seatNumber": seat.seat_number,
        "seatVersion": seat.version + 1,
        "changed": true
    }))
}

fn seats_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.seat_number, s.version, st.id, st.ss_id, st.name
             FROM seats s
             LEFT JOIN students st ON st.id = s.student_id
             ORDER BY s.seat_number",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    let rows = stmt
        .query_map([], |r| {
            let student_id: Option<String> = r.get(3)?;
            let student = match student_id {
                Some(id) => json!({
                    "id": id,
                    "ssId": r.get::<_, String>(4)?,
                    "name": r.get::<_, String>(5)?,
                }),
                None => serde_json::Value::Null,
            };
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "seatNumber": r.get::<_, i64>(1)?,
                "version": r.get::<_, i64>(2)?,
                "student": student,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;

    Ok(json!({ "seats": rows }))
}

/// One-time setup: bulk-create seats numbered 1..count. There is no
/// duplicate pre-check; a second run trips UNIQUE(seat_number) and the
/// transaction rolls back with nothing created.
fn seats_initialize(
    conn: &Connection,
    caller: &CallerContext,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let count = get_opt_u64(params, "count")
        .ok_or_else(|| HandlerErr::bad_params("missing count"))?;
    if count == 0 {
        return Err(HandlerErr::bad_params("count must be at least 1"));
    }

    let now = now_utc();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    for n in 1..=count {
        tx.execute(
            "INSERT INTO seats(id, seat_number, student_id, version, created_at, updated_at)
             VALUES(?, ?, NULL, 0, ?, ?)",
            (Uuid::new_v4().to_string(), n as i64, &now, &now),
        )
        .map_err(|e| {
            HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "seats" }))
        })?;
    }
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    audit::append(
        conn,
        Some(caller),
        "seats.initialize",
        Some("seats"),
        None,
        Some(json!({ "count": count })),
    );

    Ok(json!({ "created": count }))
}

/// Repair pass for the seat↔student invariant. The seat side owns the
/// relationship, so a disagreeing occupant gets its denormalized
/// seat_number rewritten from the seat, and a student claiming a seat no
/// seat row backs is cleared.
fn seats_reconcile(
    conn: &Connection,
    caller: &CallerContext,
) -> Result<serde_json::Value, HandlerErr> {
    let now = now_utc();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;

    let mut repairs: Vec<serde_json::Value> = Vec::new();

    let mismatched: Vec<(i64, String, Option<i64>)> = {
        let mut stmt = tx
            .prepare(
                "SELECT s.seat_number, s.student_id, st.seat_number
                 FROM seats s
                 JOIN students st ON st.id = s.student_id
                 WHERE st.seat_number IS NOT s.seat_number",
            )
            .map_err(|e| db_err("db_query_failed", e))?;
        stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| db_err("db_query_failed", e))?
    };
    for (seat_number, student_id, claimed) in mismatched {
        tx.execute(
            "UPDATE students SET seat_number = ?, updated_at = ? WHERE id = ?",
            (seat_number, &now, &student_id),
        )
        .map_err(|e| db_err("db_update_failed", e))?;
        push_history(&tx, &student_id, claimed, Some(seat_number))?;
        warn!(
            student_id = %student_id,
            seat_number,
            claimed = ?claimed,
            "repaired occupant with disagreeing seat_number"
        );
        repairs.push(json!({
            "kind": "occupant_mismatch",
            "studentId": student_id,
            "seatNumber": seat_number,
            "claimed": claimed
        }));
    }

    // Re-query after the first pass; students fixed above no longer match.
    let orphans: Vec<(String, i64)> = {
        let mut stmt = tx
            .prepare(
                "SELECT st.id, st.seat_number
                 FROM students st
                 WHERE st.seat_number IS NOT NULL
                   AND NOT EXISTS (
                     SELECT 1 FROM seats s
                     WHERE s.student_id = st.id AND s.seat_number = st.seat_number
                   )",
            )
            .map_err(|e| db_err("db_query_failed", e))?;
        stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| db_err("db_query_failed", e))?
    };
    for (student_id, claimed) in orphans {
        tx.execute(
            "UPDATE students SET seat_number = NULL, updated_at = ? WHERE id = ?",
            (&now, &student_id),
        )
        .map_err(|e| db_err("db_update_failed", e))?;
        push_history(&tx, &student_id, Some(claimed), None)?;
        warn!(
            student_id = %student_id,
            claimed,
            "cleared seat claim no seat row backs"
        );
        repairs.push(json!({
            "kind": "orphan_claim",
            "studentId": student_id,
            "claimed": claimed
        }));
    }

    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    if !repairs.is_empty() {
        audit::append(
            conn,
            Some(caller),
            "seats.reconcile",
            Some("seats"),
            None,
            Some(json!({ "repaired": repairs.len() })),
        );
    }

    Ok(json!({ "repairs": repairs }))
}

fn handle_seats_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = auth::require_caller(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match seats_list(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_seats_assign(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match auth::require_caller(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match seats_assign(conn, &caller, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_seats_clear(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match auth::require_caller(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match seats_clear(conn, &caller, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_seats_initialize(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match auth::require_admin(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match seats_initialize(conn, &caller, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_seats_reconcile(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match auth::require_admin(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match seats_reconcile(conn, &caller) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "seats.list" => Some(handle_seats_list(state, req)),
        "seats.assign" => Some(handle_seats_assign(state, req)),
        "seats.clear" => Some(handle_seats_clear(state, req)),
        "seats.initialize" => Some(handle_seats_initialize(state, req)),
        "seats.reconcile" => Some(handle_seats_reconcile(state, req)),
        _ => None,
    }
}
