//! Content node and link storage
//!
//! Pure CRUD and query primitives over `content_nodes` and `content_links`.
//! Node-plus-link inserts, status cascades and lesson replacement each run in
//! one transaction so a reader never sees a child without its owning link.
//! Read-modify-write paths take the write lock up front (IMMEDIATE).

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior,
};
use tracing::{debug, info};

use super::models::{ContentLink, ContentNode, LinkType, NodeStatus, NodeType};
use super::LearningDb;
use crate::body::NodeBody;
use crate::error::{is_constraint_violation, sql_error, StorageError};

const NODE_COLUMNS: &str = "n.id, n.node_type, n.status, n.body_json, n.metadata_json, n.owner_id,
    n.is_public, n.default_permission, n.created_at, n.updated_at";

const LINK_COLUMNS: &str = "id, from_id, to_id, link_type, source_type, created_at";

// =============================================================================
// Row mapping
// =============================================================================

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn node_from_row(row: &Row) -> rusqlite::Result<ContentNode> {
    Ok(ContentNode {
        id: row.get(0)?,
        node_type: row.get(1)?,
        status: row.get(2)?,
        body: json_column::<NodeBody>(row, 3)?,
        metadata: json_column(row, 4)?,
        owner_id: row.get(5)?,
        is_public: row.get(6)?,
        default_permission: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn link_from_row(row: &Row) -> rusqlite::Result<ContentLink> {
    Ok(ContentLink {
        id: row.get(0)?,
        from_id: row.get(1)?,
        to_id: row.get(2)?,
        link_type: row.get(3)?,
        source_type: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value)
        .map_err(|e| StorageError::Internal(format!("JSON encode failed: {}", e)))
}

// =============================================================================
// Statement helpers
// =============================================================================

fn insert_node_row(conn: &Connection, node: &ContentNode) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO content_nodes (id, node_type, status, body_json, metadata_json, owner_id,
         is_public, default_permission, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            node.id,
            node.node_type,
            node.status,
            encode_json(&node.body)?,
            encode_json(&node.metadata)?,
            node.owner_id,
            node.is_public,
            node.default_permission,
            node.created_at,
            node.updated_at,
        ],
    )
    .map_err(|e| write_error("Failed to insert node", &node.id, e))?;
    Ok(())
}

fn insert_link_row(conn: &Connection, link: &ContentLink) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO content_links (id, from_id, to_id, link_type, source_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            link.id,
            link.from_id,
            link.to_id,
            link.link_type,
            link.source_type,
            link.created_at,
        ],
    )
    .map_err(|e| write_error("Failed to insert link", &link.to_id, e))?;
    Ok(())
}

fn node_row(conn: &Connection, id: &str) -> Result<Option<ContentNode>, StorageError> {
    let sql = format!("SELECT {} FROM content_nodes n WHERE n.id = ?1", NODE_COLUMNS);
    conn.query_row(&sql, params![id], node_from_row)
        .optional()
        .map_err(|e| sql_error("Failed to get node", e))
}

fn write_node_row(conn: &Connection, node: &ContentNode) -> Result<(), StorageError> {
    let updated = conn
        .execute(
            "UPDATE content_nodes SET body_json = ?1, metadata_json = ?2, status = ?3,
             is_public = ?4, default_permission = ?5, updated_at = ?6
             WHERE id = ?7",
            params![
                encode_json(&node.body)?,
                encode_json(&node.metadata)?,
                node.status,
                node.is_public,
                node.default_permission,
                node.updated_at,
                node.id,
            ],
        )
        .map_err(|e| sql_error("Failed to update node", e))?;

    if updated == 0 {
        return Err(StorageError::NotFound(format!("content node {}", node.id)));
    }
    Ok(())
}

/// Targets of outgoing DEPENDENCY links with their current status
fn dependency_targets(
    conn: &Connection,
    from_id: &str,
) -> Result<Vec<(String, NodeStatus)>, StorageError> {
    let mut stmt = conn
        .prepare(
            "SELECT n.id, n.status FROM content_links l JOIN content_nodes n ON n.id = l.to_id
             WHERE l.from_id = ?1 AND l.link_type = ?2 ORDER BY l.rowid",
        )
        .map_err(|e| sql_error("Failed to prepare query", e))?;
    let rows = stmt
        .query_map(params![from_id, LinkType::Dependency], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .map_err(|e| sql_error("Failed to query dependencies", e))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| sql_error("Failed to read dependency row", e))
}

fn set_status_row(
    conn: &Connection,
    id: &str,
    status: NodeStatus,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    let updated = conn
        .execute(
            "UPDATE content_nodes SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, now, id],
        )
        .map_err(|e| sql_error("Failed to update status", e))?;

    if updated == 0 {
        return Err(StorageError::NotFound(format!("content node {}", id)));
    }
    Ok(())
}

/// Constraint violations on insert mean a duplicate id or a second owning link
fn write_error(context: &str, id: &str, e: rusqlite::Error) -> StorageError {
    if is_constraint_violation(&e) {
        StorageError::Conflict(format!("{} {}: {}", context, id, e))
    } else {
        sql_error(context, e)
    }
}

fn child_nodes(
    conn: &Connection,
    from_id: &str,
    node_type: NodeType,
) -> Result<Vec<ContentNode>, StorageError> {
    let sql = format!(
        "SELECT {} FROM content_links l JOIN content_nodes n ON n.id = l.to_id
         WHERE l.from_id = ?1 AND l.link_type = ?2 AND n.node_type = ?3
         ORDER BY n.rowid",
        NODE_COLUMNS
    );

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| sql_error("Failed to prepare query", e))?;
    let rows = stmt
        .query_map(params![from_id, LinkType::Dependency, node_type], node_from_row)
        .map_err(|e| sql_error("Failed to query children", e))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| sql_error("Failed to read child row", e))
}

// =============================================================================
// ContentStore
// =============================================================================

/// Storage for content nodes and typed links
#[derive(Clone)]
pub struct ContentStore {
    db: Arc<LearningDb>,
}

impl ContentStore {
    pub fn new(db: Arc<LearningDb>) -> Self {
        Self { db }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Get a node by ID
    pub fn get_node(&self, id: &str) -> Result<Option<ContentNode>, StorageError> {
        self.db
            .retry_transient("get_node", || self.db.with_conn(|conn| node_row(conn, id)))
    }

    /// Outgoing links of a node
    pub fn links_from(&self, id: &str) -> Result<Vec<ContentLink>, StorageError> {
        self.links_where("from_id", id)
    }

    /// Incoming links of a node
    pub fn links_to(&self, id: &str) -> Result<Vec<ContentLink>, StorageError> {
        self.links_where("to_id", id)
    }

    fn links_where(&self, column: &str, id: &str) -> Result<Vec<ContentLink>, StorageError> {
        let sql = format!(
            "SELECT {} FROM content_links WHERE {} = ?1 ORDER BY rowid",
            LINK_COLUMNS, column
        );

        self.db.retry_transient("links", || {
            self.db.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(|e| sql_error("Failed to prepare query", e))?;
                let rows = stmt
                    .query_map(params![id], link_from_row)
                    .map_err(|e| sql_error("Failed to query links", e))?;
                rows.collect::<Result<Vec<_>, _>>()
                    .map_err(|e| sql_error("Failed to read link row", e))
            })
        })
    }

    /// DEPENDENCY children of `from_id` with the given type, in creation order
    pub fn children(
        &self,
        from_id: &str,
        node_type: NodeType,
    ) -> Result<Vec<ContentNode>, StorageError> {
        self.db.retry_transient("children", || {
            self.db.with_conn(|conn| child_nodes(conn, from_id, node_type))
        })
    }

    /// Modules a user might see: owned, public, or carrying any grant for the
    /// user or one of `group_ids`. Grant expiry is left to the caller.
    pub fn candidate_modules(
        &self,
        user_id: &str,
        group_ids: &[String],
    ) -> Result<Vec<ContentNode>, StorageError> {
        let mut sql = format!(
            "SELECT {} FROM content_nodes n WHERE n.node_type = 'MODULE' AND (
                n.owner_id = ?1 OR n.is_public = 1
                OR EXISTS (SELECT 1 FROM permissions p WHERE p.content_node_id = n.id
                           AND p.principal_kind = 'USER' AND p.principal_id = ?1)",
            NODE_COLUMNS
        );
        if !group_ids.is_empty() {
            let placeholders = vec!["?"; group_ids.len()].join(", ");
            sql.push_str(&format!(
                " OR EXISTS (SELECT 1 FROM permissions p WHERE p.content_node_id = n.id
                   AND p.principal_kind = 'GROUP' AND p.principal_id IN ({}))",
                placeholders
            ));
        }
        sql.push_str(") ORDER BY n.rowid");

        let mut bind: Vec<&str> = vec![user_id];
        bind.extend(group_ids.iter().map(String::as_str));

        self.db.retry_transient("candidate_modules", || {
            self.db.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(|e| sql_error("Failed to prepare query", e))?;
                let rows = stmt
                    .query_map(params_from_iter(bind.iter()), node_from_row)
                    .map_err(|e| sql_error("Failed to query modules", e))?;
                rows.collect::<Result<Vec<_>, _>>()
                    .map_err(|e| sql_error("Failed to read module row", e))
            })
        })
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Insert a root node (no links)
    pub fn insert_root(&self, node: &ContentNode) -> Result<(), StorageError> {
        self.insert_with_links(node, &[])
    }

    /// Insert a node and its incoming links in one transaction
    pub fn insert_with_links(
        &self,
        node: &ContentNode,
        links: &[ContentLink],
    ) -> Result<(), StorageError> {
        self.db.retry_transient("insert_node", || {
            self.db.with_conn_mut(|conn| {
                let tx = conn
                    .transaction()
                    .map_err(|e| sql_error("Failed to start transaction", e))?;

                insert_node_row(&tx, node)?;
                for link in links {
                    insert_link_row(&tx, link)?;
                }

                tx.commit()
                    .map_err(|e| sql_error("Failed to commit node insert", e))
            })
        })?;

        debug!(node_id = %node.id, node_type = %node.node_type, links = links.len(), "Inserted node");
        Ok(())
    }

    /// Load a node, apply `change` and write it back inside one IMMEDIATE
    /// transaction, so concurrent writers always start from the stored row.
    /// Returns the node as written.
    pub fn modify_node<F>(&self, id: &str, mut change: F) -> Result<ContentNode, StorageError>
    where
        F: FnMut(&mut ContentNode) -> Result<(), StorageError>,
    {
        let node = self.db.retry_transient("modify_node", || {
            self.db.with_conn_mut(|conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(|e| sql_error("Failed to start transaction", e))?;

                let mut node = node_row(&tx, id)?
                    .ok_or_else(|| StorageError::NotFound(format!("content node {}", id)))?;
                change(&mut node)?;
                write_node_row(&tx, &node)?;

                tx.commit()
                    .map_err(|e| sql_error("Failed to commit node update", e))?;
                Ok(node)
            })
        })?;

        debug!(node_id = %node.id, status = %node.status, "Updated node");
        Ok(node)
    }

    /// Set `root_id` and every DRAFT node reachable from it over DEPENDENCY
    /// links to `status`, all or nothing. The walk and the updates share one
    /// IMMEDIATE transaction; descendants in any other status keep it.
    ///
    /// `guard` sees the root as stored inside the transaction and may refuse
    /// the change. Returns the ids that were updated, root first.
    pub fn set_status_cascade<G>(
        &self,
        root_id: &str,
        status: NodeStatus,
        now: DateTime<Utc>,
        guard: G,
    ) -> Result<Vec<String>, StorageError>
    where
        G: Fn(&ContentNode) -> Result<(), StorageError>,
    {
        let updated = self.db.retry_transient("set_status_cascade", || {
            self.db.with_conn_mut(|conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(|e| sql_error("Failed to start transaction", e))?;

                let root = node_row(&tx, root_id)?
                    .ok_or_else(|| StorageError::NotFound(format!("content node {}", root_id)))?;
                guard(&root)?;

                let mut updated = vec![root.id.clone()];
                let mut visited: HashSet<String> = HashSet::from([root.id.clone()]);
                let mut queue = vec![root.id];

                while let Some(current) = queue.pop() {
                    for (child_id, child_status) in dependency_targets(&tx, &current)? {
                        if !visited.insert(child_id.clone()) {
                            continue;
                        }
                        if child_status == NodeStatus::Draft {
                            updated.push(child_id.clone());
                        }
                        queue.push(child_id);
                    }
                }

                for id in &updated {
                    set_status_row(&tx, id, status, now)?;
                }

                tx.commit()
                    .map_err(|e| sql_error("Failed to commit status update", e))?;
                Ok(updated)
            })
        })?;

        info!(root_id, count = updated.len(), status = %status, "Updated node status");
        Ok(updated)
    }

    /// Archive the module's current lessons and insert `lessons` with their
    /// links, in one transaction. Returns the ids of the archived lessons.
    pub fn replace_lessons(
        &self,
        module_id: &str,
        lessons: &[(ContentNode, ContentLink)],
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StorageError> {
        let archived = self.db.retry_transient("replace_lessons", || {
            self.db.with_conn_mut(|conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(|e| sql_error("Failed to start transaction", e))?;

                let archived: Vec<String> = child_nodes(&tx, module_id, NodeType::Lesson)?
                    .into_iter()
                    .filter(|lesson| lesson.status != NodeStatus::Archived)
                    .map(|lesson| lesson.id)
                    .collect();

                for id in &archived {
                    set_status_row(&tx, id, NodeStatus::Archived, now)?;
                }
                for (lesson, link) in lessons {
                    insert_node_row(&tx, lesson)?;
                    insert_link_row(&tx, link)?;
                }

                tx.commit()
                    .map_err(|e| sql_error("Failed to commit lesson replacement", e))?;
                Ok(archived)
            })
        })?;

        info!(
            module_id,
            archived = archived.len(),
            created = lessons.len(),
            "Replaced module lessons"
        );
        Ok(archived)
    }
}
