//! Database schema definitions

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::{sql_error, StorageError};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| sql_error("Failed to create schema_version table", e))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()
        .map_err(|e| sql_error("Failed to read schema_version", e))?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StorageError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| sql_error("Failed to clear schema_version", e))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| sql_error("Failed to set schema_version", e))?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(CONTENT_SCHEMA)
        .map_err(|e| sql_error("Failed to create content tables", e))?;

    conn.execute_batch(PERMISSIONS_SCHEMA)
        .map_err(|e| sql_error("Failed to create permission tables", e))?;

    conn.execute_batch(INTERACTIONS_SCHEMA)
        .map_err(|e| sql_error("Failed to create interaction tables", e))?;

    Ok(())
}

/// Content nodes and typed links
const CONTENT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS content_nodes (
    id TEXT PRIMARY KEY NOT NULL,
    node_type TEXT NOT NULL CHECK (node_type IN ('MODULE', 'LESSON', 'EXERCISE')),
    status TEXT NOT NULL DEFAULT 'DRAFT' CHECK (status IN ('DRAFT', 'CREATED', 'ARCHIVED')),
    body_json TEXT NOT NULL,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    owner_id TEXT NOT NULL,

    -- Public fallback when no grant applies
    is_public INTEGER NOT NULL DEFAULT 0,
    default_permission TEXT,

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_content_nodes_type ON content_nodes(node_type);
CREATE INDEX IF NOT EXISTS idx_content_nodes_owner ON content_nodes(owner_id);

CREATE TABLE IF NOT EXISTS content_links (
    id TEXT PRIMARY KEY NOT NULL,
    from_id TEXT NOT NULL REFERENCES content_nodes(id) ON DELETE CASCADE,
    to_id TEXT NOT NULL REFERENCES content_nodes(id) ON DELETE CASCADE,
    link_type TEXT NOT NULL,
    -- Node type of from_id; tells the owning module and owning lesson apart
    source_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (from_id, to_id, link_type)
);

CREATE INDEX IF NOT EXISTS idx_content_links_from ON content_links(from_id);
CREATE INDEX IF NOT EXISTS idx_content_links_to ON content_links(to_id);

-- At most one owning module and one owning lesson per node
CREATE UNIQUE INDEX IF NOT EXISTS idx_content_links_owner
    ON content_links(to_id, source_type) WHERE link_type = 'DEPENDENCY';
"#;

/// Explicit grants, groups and membership
const PERMISSIONS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS permission_groups (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    owner_id TEXT NOT NULL,
    is_public INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS group_members (
    group_id TEXT NOT NULL REFERENCES permission_groups(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'MEMBER',
    joined_at TEXT NOT NULL,
    PRIMARY KEY (group_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members(user_id);

CREATE TABLE IF NOT EXISTS permissions (
    id TEXT PRIMARY KEY NOT NULL,
    content_node_id TEXT NOT NULL REFERENCES content_nodes(id) ON DELETE CASCADE,
    principal_kind TEXT NOT NULL CHECK (principal_kind IN ('USER', 'GROUP')),
    principal_id TEXT NOT NULL,
    level TEXT NOT NULL CHECK (level IN ('VIEW', 'INTERACT', 'EDIT', 'ADMIN')),
    granted_by TEXT,
    expires_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (content_node_id, principal_kind, principal_id)
);

CREATE INDEX IF NOT EXISTS idx_permissions_principal ON permissions(principal_kind, principal_id);
"#;

/// Append-only interaction logs, one per (node, user)
const INTERACTIONS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS interaction_logs (
    id TEXT PRIMARY KEY NOT NULL,
    node_id TEXT NOT NULL REFERENCES content_nodes(id),
    user_id TEXT NOT NULL,
    version TEXT NOT NULL DEFAULT '1.0',
    -- Number of events; compare-and-set guard for appends
    event_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (node_id, user_id)
);

CREATE TABLE IF NOT EXISTS interaction_events (
    log_id TEXT NOT NULL REFERENCES interaction_logs(id),
    seq INTEGER NOT NULL,
    id TEXT NOT NULL UNIQUE,
    event_type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (log_id, seq)
);
"#;
