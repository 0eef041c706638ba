//! SQLite database module for the learning content graph
//!
//! One database holds the three entity families the services work on:
//!
//! - `content_nodes`, `content_links` - modules, lessons, exercises and their typed edges
//! - `permissions`, `permission_groups`, `group_members` - explicit grants and groups
//! - `interaction_logs`, `interaction_events` - per (node, user) append-only histories
//!
//! Each family has a store wrapping a shared [`LearningDb`]. Stores hold no
//! business rules; multi-row writes that must be all-or-nothing run inside a
//! single SQLite transaction.

pub mod schema;
pub mod models;
pub mod content_store;
pub mod permission_store;
pub mod interaction_store;

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{sql_error, StorageError};

/// SQLite database shared by all stores
pub struct LearningDb {
    conn: Mutex<Connection>,
    transient_retries: u32,
}

impl LearningDb {
    /// Open or create the database under `config.storage_dir`
    pub fn open(config: &Config) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&config.storage_dir).map_err(|e| {
            StorageError::Internal(format!(
                "Failed to create storage dir {:?}: {}",
                config.storage_dir, e
            ))
        })?;

        let db_path = config.db_path();
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(&db_path).map_err(|e| sql_error("Failed to open SQLite", e))?;

        conn.busy_timeout(config.busy_timeout())
            .map_err(|e| sql_error("Failed to set busy timeout", e))?;

        // WAL for concurrent readers; foreign keys keep links and grants attached to nodes
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )
        .map_err(|e| sql_error("Failed to set PRAGMA", e))?;

        Self::from_connection(conn, config.transient_retries)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| sql_error("Failed to open in-memory SQLite", e))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| sql_error("Failed to set PRAGMA", e))?;

        Self::from_connection(conn, Config::default().transient_retries)
    }

    fn from_connection(conn: Connection, transient_retries: u32) -> Result<Self, StorageError> {
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            transient_retries,
        })
    }

    /// Run a read with shared access to the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StorageError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StorageError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Retry `op` while it fails with a transient storage error. Only for
    /// idempotent reads and single-transaction writes.
    pub fn retry_transient<F, T>(&self, what: &str, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Result<T, StorageError>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < self.transient_retries => {
                    attempt += 1;
                    warn!(operation = what, attempt, error = %e, "Transient storage failure, retrying");
                    thread::sleep(Duration::from_millis(10 * u64::from(attempt)));
                }
                result => return result,
            }
        }
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, StorageError> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<u64, StorageError> {
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get::<_, i64>(0)
                })
                .map(|n| n as u64)
                .map_err(|e| sql_error("Query failed", e))
            };

            Ok(DbStats {
                node_count: count("content_nodes")?,
                link_count: count("content_links")?,
                permission_count: count("permissions")?,
                group_count: count("permission_groups")?,
                interaction_log_count: count("interaction_logs")?,
                interaction_event_count: count("interaction_events")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub node_count: u64,
    pub link_count: u64,
    pub permission_count: u64,
    pub group_count: u64,
    pub interaction_log_count: u64,
    pub interaction_event_count: u64,
}

// Re-exports
pub use content_store::ContentStore;
pub use interaction_store::InteractionStore;
pub use models::{
    ContentLink, ContentNode, EventType, GroupMember, GroupRole, InteractionEvent,
    InteractionLog, LinkType, Metadata, NodeStatus, NodeType, Permission, PermissionGroup,
    PermissionLevel, Principal,
};
pub use permission_store::PermissionStore;

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            storage_dir: dir.path().join("nested"),
            ..Default::default()
        };

        let db = LearningDb::open(&config).unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.node_count, 0);
        assert!(config.db_path().exists());
    }

    #[test]
    fn test_retry_transient_gives_up() {
        let db = LearningDb::open_in_memory().unwrap();
        let calls = Cell::new(0);

        let result: Result<(), _> = db.retry_transient("test", || {
            calls.set(calls.get() + 1);
            Err(StorageError::StorageUnavailable("busy".into()))
        });

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.get(), 1 + Config::default().transient_retries);
    }

    #[test]
    fn test_retry_transient_skips_business_errors() {
        let db = LearningDb::open_in_memory().unwrap();
        let calls = Cell::new(0);

        let result: Result<(), _> = db.retry_transient("test", || {
            calls.set(calls.get() + 1);
            Err(StorageError::NotFound("node".into()))
        });

        assert_eq!(result.unwrap_err().code(), "not_found");
        assert_eq!(calls.get(), 1);
    }
}
