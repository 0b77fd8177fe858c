//! Durable operation log: the ordered staging area for pending mutations.
//!
//! Entries are appended with a write-time BIGSERIAL sequence that defines
//! total replay order regardless of caller concurrency, and are deleted once
//! replayed or discarded. The session id is the log partition: discard and
//! replay always scope to exactly one session.

use sqlx::postgres::PgConnection;
use sqlx::Row;

use tributary_contracts::{Action, BrokerError};

use crate::internal_error;

#[derive(Debug, Clone, PartialEq)]
pub struct OperationEntry {
    pub sequence: i64,
    pub session_id: String,
    pub connector_id: String,
    pub public_id: String,
    pub vendor_id: String,
    pub action: Action,
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct NewOperation<'a> {
    pub session_id: &'a str,
    pub connector_id: &'a str,
    pub public_id: &'a str,
    pub vendor_id: &'a str,
    pub action: Action,
    pub payload: Option<&'a serde_json::Value>,
}

/// Appends one entry; the returned sequence is assigned by the store at
/// write time.
pub async fn append(conn: &mut PgConnection, op: NewOperation<'_>) -> Result<i64, BrokerError> {
    let row = sqlx::query(
        "INSERT INTO trib_operation_log (session_id, connector_id, public_id, vendor_id, action, payload_json) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING sequence",
    )
    .bind(op.session_id)
    .bind(op.connector_id)
    .bind(op.public_id)
    .bind(op.vendor_id)
    .bind(op.action.as_str())
    .bind(op.payload)
    .fetch_one(conn)
    .await
    .map_err(internal_error)?;

    row.try_get::<i64, _>("sequence").map_err(internal_error)
}

/// All buffered entries for one session, in replay (sequence) order.
pub async fn entries_for_session(
    conn: &mut PgConnection,
    session_id: &str,
) -> Result<Vec<OperationEntry>, BrokerError> {
    let rows = sqlx::query(
        "SELECT sequence, session_id, connector_id, public_id, vendor_id, action, payload_json \
         FROM trib_operation_log WHERE session_id = $1 ORDER BY sequence ASC",
    )
    .bind(session_id)
    .fetch_all(conn)
    .await
    .map_err(internal_error)?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let action_token: String = row.try_get("action").map_err(internal_error)?;
        let action = Action::parse(&action_token).map_err(|_| {
            BrokerError::internal(format!(
                "operation log row carries unknown action `{}`",
                action_token
            ))
        })?;
        entries.push(OperationEntry {
            sequence: row.try_get("sequence").map_err(internal_error)?,
            session_id: row.try_get("session_id").map_err(internal_error)?,
            connector_id: row.try_get("connector_id").map_err(internal_error)?,
            public_id: row.try_get("public_id").map_err(internal_error)?,
            vendor_id: row.try_get("vendor_id").map_err(internal_error)?,
            action,
            payload: row.try_get("payload_json").map_err(internal_error)?,
        });
    }
    Ok(entries)
}

/// Deletes every buffered entry for a session (rollback, post-replay
/// cleanup, or last-open-wins discard). Returns how many rows went away.
pub async fn discard_session(
    conn: &mut PgConnection,
    session_id: &str,
) -> Result<u64, BrokerError> {
    let result = sqlx::query("DELETE FROM trib_operation_log WHERE session_id = $1")
        .bind(session_id)
        .execute(conn)
        .await
        .map_err(internal_error)?;
    Ok(result.rows_affected())
}

/// Deletes exactly the given entries (stream auto-commit cleanup).
pub async fn delete_sequences(
    conn: &mut PgConnection,
    sequences: &[i64],
) -> Result<(), BrokerError> {
    if sequences.is_empty() {
        return Ok(());
    }
    sqlx::query("DELETE FROM trib_operation_log WHERE sequence = ANY($1)")
        .bind(sequences)
        .execute(conn)
        .await
        .map_err(internal_error)?;
    Ok(())
}

pub async fn count_for_session(
    conn: &mut PgConnection,
    session_id: &str,
) -> Result<i64, BrokerError> {
    let row = sqlx::query("SELECT count(*) AS n FROM trib_operation_log WHERE session_id = $1")
        .bind(session_id)
        .fetch_one(conn)
        .await
        .map_err(internal_error)?;
    row.try_get::<i64, _>("n").map_err(internal_error)
}
