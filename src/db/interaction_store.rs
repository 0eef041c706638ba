//! Interaction log storage
//!
//! One log per (node, user), created lazily by the first append. Events are
//! rows keyed by `(log_id, seq)`; an append never rewrites earlier events.
//!
//! `append` is the only write path. It runs in an IMMEDIATE transaction and
//! bumps `event_count` with a compare-and-set, so two writers on different
//! connections can never both claim the same sequence number. A lost race
//! surfaces as a constraint violation or a failed compare-and-set and is
//! retried from the top.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use super::models::{InteractionEvent, InteractionLog, INTERACTION_LOG_VERSION};
use super::LearningDb;
use crate::error::{is_constraint_violation, sql_error, StorageError};

/// Storage for per (node, user) interaction logs
#[derive(Clone)]
pub struct InteractionStore {
    db: Arc<LearningDb>,
    conflict_retries: u32,
}

impl InteractionStore {
    pub fn new(db: Arc<LearningDb>, conflict_retries: u32) -> Self {
        Self {
            db,
            conflict_retries,
        }
    }

    /// Load the log for (node, user), if one exists
    pub fn get(&self, node_id: &str, user_id: &str) -> Result<Option<InteractionLog>, StorageError> {
        self.db.retry_transient("get_log", || {
            self.db.with_conn(|conn| load_log(conn, node_id, user_id))
        })
    }

    /// Append one event to the (node, user) log, creating the log if needed.
    /// Returns the log as it stands after the append.
    pub fn append(
        &self,
        node_id: &str,
        user_id: &str,
        event: &InteractionEvent,
    ) -> Result<InteractionLog, StorageError> {
        let mut attempt = 0;
        loop {
            let result = self.db.retry_transient("append_event", || {
                self.db.with_conn_mut(|conn| {
                    append_once(conn, node_id, user_id, event)?;
                    load_log(conn, node_id, user_id)?.ok_or_else(|| {
                        StorageError::Internal(format!(
                            "log for node {} user {} missing after append",
                            node_id, user_id
                        ))
                    })
                })
            });

            match result {
                Err(StorageError::Conflict(reason)) if attempt < self.conflict_retries => {
                    attempt += 1;
                    warn!(node_id, user_id, attempt, %reason, "Append collided, retrying");
                }
                Err(StorageError::Conflict(reason)) => {
                    return Err(StorageError::Conflict(format!(
                        "append to log for node {} user {} gave up after {} retries: {}",
                        node_id, user_id, self.conflict_retries, reason
                    )));
                }
                Ok(log) => {
                    debug!(node_id, user_id, events = log.len(), "Appended interaction event");
                    return Ok(log);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Constraint violations during an append mean another writer got there first
fn append_error(context: &str, e: rusqlite::Error) -> StorageError {
    if is_constraint_violation(&e) {
        StorageError::Conflict(format!("{}: {}", context, e))
    } else {
        sql_error(context, e)
    }
}

fn append_once(
    conn: &mut Connection,
    node_id: &str,
    user_id: &str,
    event: &InteractionEvent,
) -> Result<(), StorageError> {
    let now = Utc::now();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| sql_error("Failed to start append transaction", e))?;

    let existing: Option<(String, i64)> = tx
        .query_row(
            "SELECT id, event_count FROM interaction_logs WHERE node_id = ?1 AND user_id = ?2",
            params![node_id, user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| sql_error("Failed to read log head", e))?;

    let (log_id, seq) = match existing {
        Some(head) => head,
        None => {
            let log_id = uuid::Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO interaction_logs (id, node_id, user_id, version, event_count,
                 created_at, updated_at) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
                params![log_id, node_id, user_id, INTERACTION_LOG_VERSION, now],
            )
            .map_err(|e| append_error("Failed to create log", e))?;
            (log_id, 0)
        }
    };

    tx.execute(
        "INSERT INTO interaction_events (log_id, seq, id, event_type, payload_json, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![log_id, seq, event.id, event.event_type, event.payload, event.timestamp],
    )
    .map_err(|e| append_error("Failed to insert event", e))?;

    let bumped = tx
        .execute(
            "UPDATE interaction_logs SET event_count = event_count + 1, updated_at = ?1
             WHERE id = ?2 AND event_count = ?3",
            params![now, log_id, seq],
        )
        .map_err(|e| sql_error("Failed to advance log head", e))?;

    if bumped != 1 {
        return Err(StorageError::Conflict(format!(
            "log {} moved past sequence {}",
            log_id, seq
        )));
    }

    tx.commit()
        .map_err(|e| sql_error("Failed to commit append", e))
}

fn load_log(
    conn: &Connection,
    node_id: &str,
    user_id: &str,
) -> Result<Option<InteractionLog>, StorageError> {
    let head = conn
        .query_row(
            "SELECT id, version, created_at, updated_at FROM interaction_logs
             WHERE node_id = ?1 AND user_id = ?2",
            params![node_id, user_id],
            |row| {
                Ok(InteractionLog {
                    id: row.get(0)?,
                    node_id: node_id.to_string(),
                    user_id: user_id.to_string(),
                    version: row.get(1)?,
                    events: Vec::new(),
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(|e| sql_error("Failed to read log", e))?;

    let Some(mut log) = head else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, event_type, payload_json, recorded_at FROM interaction_events
             WHERE log_id = ?1 ORDER BY seq",
        )
        .map_err(|e| sql_error("Failed to prepare query", e))?;
    let rows = stmt
        .query_map(params![log.id], |row| {
            Ok(InteractionEvent {
                id: row.get(0)?,
                event_type: row.get(1)?,
                payload: row.get(2)?,
                timestamp: row.get(3)?,
            })
        })
        .map_err(|e| sql_error("Failed to query events", e))?;

    log.events = rows
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| sql_error("Failed to read event row", e))?;

    Ok(Some(log))
}
