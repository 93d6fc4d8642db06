//! Node table and sync-node sets
//!
//! [`SyncDb`] is the narrow relational interface the pipeline reads and
//! writes through. One row per logical object; the row keeps both replica
//! identifiers, the `(parent, name)` placement and the content indicators the
//! operation computer diffs against.
//!
//! ## Type mapping
//!
//! | Domain type      | SQL type | Strategy                                |
//! |------------------|----------|-----------------------------------------|
//! | NodeId           | TEXT     | opaque string                           |
//! | DbNodeId         | INTEGER  | rowid                                   |
//! | NodeType         | TEXT     | `"file"` / `"directory"`                |
//! | DateTime<Utc>    | TEXT     | RFC 3339 via `to_rfc3339` / parse       |

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use pairdrive_core::domain::{DbNodeId, NodeId, NodeType, ReplicaSide};

use crate::{DbPool, StoreError};

/// Sync-node sets persisted per side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncNodeSet {
    TmpLocalBlacklist,
    TmpRemoteBlacklist,
    Undecided,
}

impl SyncNodeSet {
    fn as_str(self) -> &'static str {
        match self {
            SyncNodeSet::TmpLocalBlacklist => "tmp_local_blacklist",
            SyncNodeSet::TmpRemoteBlacklist => "tmp_remote_blacklist",
            SyncNodeSet::Undecided => "undecided",
        }
    }
}

/// One row of the node table
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub db_id: DbNodeId,
    pub parent_db_id: Option<DbNodeId>,
    pub local_id: Option<NodeId>,
    pub remote_id: Option<NodeId>,
    pub name: String,
    pub node_type: NodeType,
    pub size: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub local_modified_at: Option<DateTime<Utc>>,
    pub remote_modified_at: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
}

impl NodeRecord {
    pub fn node_id(&self, side: ReplicaSide) -> Option<&NodeId> {
        match side {
            ReplicaSide::Local => self.local_id.as_ref(),
            ReplicaSide::Remote => self.remote_id.as_ref(),
        }
    }

    pub fn modified_at(&self, side: ReplicaSide) -> Option<DateTime<Utc>> {
        match side {
            ReplicaSide::Local => self.local_modified_at,
            ReplicaSide::Remote => self.remote_modified_at,
        }
    }
}

/// Insert payload for a node row
#[derive(Debug, Clone)]
pub struct NewNode {
    pub parent_db_id: DbNodeId,
    pub local_id: Option<NodeId>,
    pub remote_id: Option<NodeId>,
    pub name: String,
    pub node_type: NodeType,
    pub size: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub local_modified_at: Option<DateTime<Utc>>,
    pub remote_modified_at: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
}

impl NewNode {
    pub fn new(parent_db_id: DbNodeId, name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            parent_db_id,
            local_id: None,
            remote_id: None,
            name: name.into(),
            node_type,
            size: 0,
            created_at: Some(Utc::now()),
            local_modified_at: None,
            remote_modified_at: None,
            content_hash: None,
        }
    }

    pub fn with_ids(mut self, local: Option<NodeId>, remote: Option<NodeId>) -> Self {
        self.local_id = local;
        self.remote_id = remote;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }
}

/// The sync database: one row per synchronized object
pub struct SyncDb {
    pool: SqlitePool,
    root_db_id: DbNodeId,
}

impl SyncDb {
    /// Wraps a migrated pool, creating the root row if it does not exist.
    pub async fn open(
        pool: &DbPool,
        local_root_id: &NodeId,
        remote_root_id: &NodeId,
    ) -> Result<Self, StoreError> {
        let pool = pool.pool().clone();

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT db_id FROM node WHERE parent_db_id IS NULL")
                .fetch_optional(&pool)
                .await?;

        let root_db_id = match existing {
            Some(id) => id,
            None => {
                sqlx::query(
                    "INSERT INTO node (parent_db_id, local_id, remote_id, name, node_type) \
                     VALUES (NULL, ?, ?, '', 'directory')",
                )
                .bind(local_root_id.as_str())
                .bind(remote_root_id.as_str())
                .execute(&pool)
                .await?
                .last_insert_rowid()
            }
        };

        Ok(Self { pool, root_db_id })
    }

    pub fn root_db_id(&self) -> DbNodeId {
        self.root_db_id
    }

    /// Starts a transaction for an executor commit.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    // ------------------------------------------------------------------
    // Node reads
    // ------------------------------------------------------------------

    pub async fn node_by_db_id(&self, db_id: DbNodeId) -> Result<Option<NodeRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM node WHERE db_id = ?")
            .bind(db_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_record).transpose()
    }

    pub async fn node_by_id(
        &self,
        side: ReplicaSide,
        node_id: &NodeId,
    ) -> Result<Option<NodeRecord>, StoreError> {
        let sql = match side {
            ReplicaSide::Local => "SELECT * FROM node WHERE local_id = ?",
            ReplicaSide::Remote => "SELECT * FROM node WHERE remote_id = ?",
        };
        let row = sqlx::query(sql)
            .bind(node_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_record).transpose()
    }

    pub async fn children(&self, db_id: DbNodeId) -> Result<Vec<NodeRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM node WHERE parent_db_id = ? ORDER BY db_id")
            .bind(db_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_record).collect()
    }

    pub async fn child_by_name(
        &self,
        parent_db_id: DbNodeId,
        name: &str,
    ) -> Result<Option<NodeRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM node WHERE parent_db_id = ? AND name = ?")
            .bind(parent_db_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_record).transpose()
    }

    /// All node ids known on one side, the root excluded.
    pub async fn ids(&self, side: ReplicaSide) -> Result<Vec<NodeId>, StoreError> {
        let sql = match side {
            ReplicaSide::Local => {
                "SELECT local_id FROM node WHERE local_id IS NOT NULL AND parent_db_id IS NOT NULL"
            }
            ReplicaSide::Remote => {
                "SELECT remote_id FROM node WHERE remote_id IS NOT NULL AND parent_db_id IS NOT NULL"
            }
        };
        let rows: Vec<String> = sqlx::query_scalar(sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(NodeId::new).collect())
    }

    pub async fn all_nodes(&self) -> Result<Vec<NodeRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM node WHERE parent_db_id IS NOT NULL ORDER BY db_id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_record).collect()
    }

    /// Reconstructs the relative path of a row by walking parent links.
    pub async fn path(&self, db_id: DbNodeId) -> Result<Option<PathBuf>, StoreError> {
        if db_id == self.root_db_id {
            return Ok(Some(PathBuf::new()));
        }
        let mut names: Vec<String> = Vec::new();
        let mut current = db_id;
        loop {
            let Some(record) = self.node_by_db_id(current).await? else {
                return Ok(None);
            };
            match record.parent_db_id {
                None => break, // reached the root without passing through it
                Some(parent) => {
                    names.push(record.name);
                    if parent == self.root_db_id {
                        break;
                    }
                    current = parent;
                }
            }
        }
        let mut path = PathBuf::new();
        for name in names.iter().rev() {
            path.push(name);
        }
        Ok(Some(path))
    }

    /// Resolves a relative path to a row by walking child names from the root.
    pub async fn node_by_path(&self, path: &Path) -> Result<Option<NodeRecord>, StoreError> {
        let mut current = self.root_db_id;
        let mut record: Option<NodeRecord> = None;
        for component in path.components() {
            let name = component.as_os_str().to_string_lossy();
            match self.child_by_name(current, &name).await? {
                Some(child) => {
                    current = child.db_id;
                    record = Some(child);
                }
                None => return Ok(None),
            }
        }
        Ok(record)
    }

    /// True when `ancestor_db_id` lies on the parent chain of `candidate`.
    pub async fn ancestor(
        &self,
        ancestor_db_id: DbNodeId,
        candidate: DbNodeId,
    ) -> Result<bool, StoreError> {
        let mut current = candidate;
        loop {
            let Some(record) = self.node_by_db_id(current).await? else {
                return Ok(false);
            };
            match record.parent_db_id {
                None => return Ok(false),
                Some(parent) if parent == ancestor_db_id => return Ok(true),
                Some(parent) => current = parent,
            }
        }
    }

    /// Ancestor test by per-side node ids, as the conflict resolver needs it.
    pub async fn ancestor_by_ids(
        &self,
        side: ReplicaSide,
        ancestor: &NodeId,
        candidate: &NodeId,
    ) -> Result<bool, StoreError> {
        let (Some(a), Some(c)) = (
            self.node_by_id(side, ancestor).await?,
            self.node_by_id(side, candidate).await?,
        ) else {
            return Ok(false);
        };
        self.ancestor(a.db_id, c.db_id).await
    }

    // ------------------------------------------------------------------
    // Node writes (single statements; `*_in` variants run inside an
    // executor-owned transaction)
    // ------------------------------------------------------------------

    pub async fn insert_node(&self, node: &NewNode) -> Result<DbNodeId, StoreError> {
        Self::insert_node_in(&self.pool, node).await
    }

    pub async fn insert_node_in<'e, E>(executor: E, node: &NewNode) -> Result<DbNodeId, StoreError>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            "INSERT INTO node (parent_db_id, local_id, remote_id, name, node_type, size, \
             created_at, local_modified_at, remote_modified_at, content_hash) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(node.parent_db_id)
        .bind(node.local_id.as_ref().map(NodeId::as_str))
        .bind(node.remote_id.as_ref().map(NodeId::as_str))
        .bind(&node.name)
        .bind(node.node_type.as_str())
        .bind(node.size as i64)
        .bind(node.created_at.map(|t| t.to_rfc3339()))
        .bind(node.local_modified_at.map(|t| t.to_rfc3339()))
        .bind(node.remote_modified_at.map(|t| t.to_rfc3339()))
        .bind(node.content_hash.as_deref())
        .execute(executor)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update_parent_and_name(
        &self,
        db_id: DbNodeId,
        parent_db_id: DbNodeId,
        name: &str,
    ) -> Result<(), StoreError> {
        Self::update_parent_and_name_in(&self.pool, db_id, parent_db_id, name).await
    }

    pub async fn update_parent_and_name_in<'e, E>(
        executor: E,
        db_id: DbNodeId,
        parent_db_id: DbNodeId,
        name: &str,
    ) -> Result<(), StoreError>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query("UPDATE node SET parent_db_id = ?, name = ? WHERE db_id = ?")
            .bind(parent_db_id)
            .bind(name)
            .bind(db_id)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn update_content(
        &self,
        db_id: DbNodeId,
        size: u64,
        content_hash: Option<&str>,
        local_modified_at: Option<DateTime<Utc>>,
        remote_modified_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        Self::update_content_in(
            &self.pool,
            db_id,
            size,
            content_hash,
            local_modified_at,
            remote_modified_at,
        )
        .await
    }

    pub async fn update_content_in<'e, E>(
        executor: E,
        db_id: DbNodeId,
        size: u64,
        content_hash: Option<&str>,
        local_modified_at: Option<DateTime<Utc>>,
        remote_modified_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            "UPDATE node SET size = ?, content_hash = COALESCE(?, content_hash), \
             local_modified_at = COALESCE(?, local_modified_at), \
             remote_modified_at = COALESCE(?, remote_modified_at) WHERE db_id = ?",
        )
        .bind(size as i64)
        .bind(content_hash)
        .bind(local_modified_at.map(|t| t.to_rfc3339()))
        .bind(remote_modified_at.map(|t| t.to_rfc3339()))
        .bind(db_id)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Records one side's identifier on a row (after a create is executed).
    pub async fn update_node_id(
        &self,
        db_id: DbNodeId,
        side: ReplicaSide,
        node_id: &NodeId,
    ) -> Result<(), StoreError> {
        Self::update_node_id_in(&self.pool, db_id, side, node_id).await
    }

    pub async fn update_node_id_in<'e, E>(
        executor: E,
        db_id: DbNodeId,
        side: ReplicaSide,
        node_id: &NodeId,
    ) -> Result<(), StoreError>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let sql = match side {
            ReplicaSide::Local => "UPDATE node SET local_id = ? WHERE db_id = ?",
            ReplicaSide::Remote => "UPDATE node SET remote_id = ? WHERE db_id = ?",
        };
        sqlx::query(sql)
            .bind(node_id.as_str())
            .bind(db_id)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Deletes a row; descendants cascade.
    pub async fn delete_node(&self, db_id: DbNodeId) -> Result<(), StoreError> {
        Self::delete_node_in(&self.pool, db_id).await
    }

    pub async fn delete_node_in<'e, E>(executor: E, db_id: DbNodeId) -> Result<(), StoreError>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query("DELETE FROM node WHERE db_id = ?")
            .bind(db_id)
            .execute(executor)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sync-node sets
    // ------------------------------------------------------------------

    pub async fn select_all_sync_nodes(
        &self,
        set: SyncNodeSet,
    ) -> Result<Vec<NodeId>, StoreError> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT node_id FROM sync_node WHERE set_type = ?")
                .bind(set.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(NodeId::new).collect())
    }

    /// Replaces the whole membership of one set.
    pub async fn update_all_sync_nodes(
        &self,
        set: SyncNodeSet,
        node_ids: &[NodeId],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sync_node WHERE set_type = ?")
            .bind(set.as_str())
            .execute(&mut *tx)
            .await?;
        for node_id in node_ids {
            sqlx::query("INSERT OR IGNORE INTO sync_node (node_id, set_type) VALUES (?, ?)")
                .bind(node_id.as_str())
                .bind(set.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_sync_node(
        &self,
        set: SyncNodeSet,
        node_id: &NodeId,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO sync_node (node_id, set_type) VALUES (?, ?)")
            .bind(node_id.as_str())
            .bind(set.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_sync_node(
        &self,
        set: SyncNodeSet,
        node_id: &NodeId,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_node WHERE node_id = ? AND set_type = ?")
            .bind(node_id.as_str())
            .bind(set.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Error counts
    // ------------------------------------------------------------------

    pub async fn error_count(
        &self,
        side: ReplicaSide,
        node_id: &NodeId,
    ) -> Result<u32, StoreError> {
        let count: Option<i64> =
            sqlx::query_scalar("SELECT count FROM error_count WHERE node_id = ? AND side = ?")
                .bind(node_id.as_str())
                .bind(side.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(count.unwrap_or(0) as u32)
    }

    pub async fn set_error_count(
        &self,
        side: ReplicaSide,
        node_id: &NodeId,
        count: u32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO error_count (node_id, side, count, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(node_id, side) DO UPDATE SET count = excluded.count, \
             updated_at = excluded.updated_at",
        )
        .bind(node_id.as_str())
        .bind(side.as_str())
        .bind(count as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_error_count(
        &self,
        side: ReplicaSide,
        node_id: &NodeId,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM error_count WHERE node_id = ? AND side = ?")
            .bind(node_id.as_str())
            .bind(side.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Meta
    // ------------------------------------------------------------------

    pub async fn meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_record(row: SqliteRow) -> Result<NodeRecord, StoreError> {
    let node_type = match row.try_get::<String, _>("node_type")?.as_str() {
        "file" => NodeType::File,
        "directory" => NodeType::Directory,
        other => {
            return Err(StoreError::CorruptRow(format!(
                "unknown node type: {other}"
            )))
        }
    };

    Ok(NodeRecord {
        db_id: row.try_get("db_id")?,
        parent_db_id: row.try_get("parent_db_id")?,
        local_id: row
            .try_get::<Option<String>, _>("local_id")?
            .map(NodeId::new),
        remote_id: row
            .try_get::<Option<String>, _>("remote_id")?
            .map(NodeId::new),
        name: row.try_get("name")?,
        node_type,
        size: row.try_get::<i64, _>("size")? as u64,
        created_at: parse_time(row.try_get::<Option<String>, _>("created_at")?)?,
        local_modified_at: parse_time(row.try_get::<Option<String>, _>("local_modified_at")?)?,
        remote_modified_at: parse_time(row.try_get::<Option<String>, _>("remote_modified_at")?)?,
        content_hash: row.try_get("content_hash")?,
    })
}

fn parse_time(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    match value {
        None => Ok(None),
        Some(text) => DateTime::parse_from_rfc3339(&text)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| StoreError::CorruptRow(format!("bad timestamp {text:?}: {e}"))),
    }
}
