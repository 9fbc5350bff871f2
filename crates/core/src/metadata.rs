//! Relational metadata store: folders, deduplicated content, name bindings,
//! chunk maps, and the trash.
//!
//! Every mutating method runs inside one transaction and bumps
//! `metadata.db_version` exactly once on commit.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool, Sqlite, Transaction};

use crate::{Error, Result};

const FORBIDDEN_CHARS: &[char] = &['\\', '/', '<', '>', ':', '"', '|', '?', '*'];
const TRASH_RETENTION_SECS: f64 = 30.0 * 24.0 * 60.0 * 60.0;
const ROOT_FOLDER_NAME: &str = "TDrive";
const TRASH_FOLDER_NAME: &str = "Recycle Bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    Folder,
    Binding,
}

impl ItemType {
    fn as_str(self) -> &'static str {
        match self {
            ItemType::Folder => "folder",
            ItemType::Binding => "binding",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "folder" => Ok(ItemType::Folder),
            "binding" => Ok(ItemType::Binding),
            other => Err(Error::Other {
                message: format!("unknown item_type {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrashRecord {
    pub item_id: i64,
    pub item_type: ItemType,
    pub original_parent_id: Option<i64>,
    pub original_name: String,
    pub trashed_at: f64,
}

#[derive(Debug, Clone)]
pub struct ChunkRef {
    pub part_num: i64,
    pub message_id: i64,
    pub part_hash: String,
}

#[derive(Debug, Clone)]
pub struct ListEntry {
    pub kind: ItemType,
    pub id: i64,
    pub name: String,
    pub relative_path: String,
    pub size: Option<i64>,
    pub hash: Option<String>,
    pub chunks: Option<Vec<ChunkRef>>,
}

pub struct MetadataStore {
    pool: SqlitePool,
    pub root_folder_id: i64,
    pub trash_folder_id: i64,
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.chars().any(|c| FORBIDDEN_CHARS.contains(&c)) {
        return Err(Error::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

impl MetadataStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(options).await?;

        sqlx::query("PRAGMA foreign_keys = ON;").execute(&pool).await?;
        sqlx::migrate!("./migrations/metadata").run(&pool).await?;

        let (root_folder_id, trash_folder_id) = Self::bootstrap_roots(&pool).await?;
        Ok(Self {
            pool,
            root_folder_id,
            trash_folder_id,
        })
    }

    async fn bootstrap_roots(pool: &SqlitePool) -> Result<(i64, i64)> {
        let mut tx = pool.begin().await?;

        let root_folder_id = match find_root_folder(&mut tx, ROOT_FOLDER_NAME).await? {
            Some(id) => id,
            None => insert_folder(&mut tx, None, ROOT_FOLDER_NAME).await?,
        };
        let trash_folder_id = match find_root_folder(&mut tx, TRASH_FOLDER_NAME).await? {
            Some(id) => id,
            None => insert_folder(&mut tx, None, TRASH_FOLDER_NAME).await?,
        };

        tx.commit().await?;
        Ok((root_folder_id, trash_folder_id))
    }

    pub async fn db_version(&self) -> Result<i64> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = 'db_version'")
            .fetch_one(&self.pool)
            .await?;
        let value: String = row.get(0);
        value.parse().map_err(|_| Error::CatalogueCorrupt {
            message: "db_version is not an integer".to_string(),
        })
    }

    async fn bump_version(tx: &mut Transaction<'_, Sqlite>) -> Result<()> {
        sqlx::query("UPDATE metadata SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT) WHERE key = 'db_version'")
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn add_folder(&self, parent_id: i64, name: &str) -> Result<i64> {
        validate_name(name)?;
        let mut tx = self.pool.begin().await?;
        ensure_not_in_trash(&mut tx, parent_id, self.trash_folder_id).await?;
        ensure_not_collision(&mut tx, parent_id, name, ItemType::Folder).await?;
        let id = insert_folder(&mut tx, Some(parent_id), name).await?;
        Self::bump_version(&mut tx).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Inserts a Binding for `name` in `folder_id` against content identified
    /// by `hash`/`size`. Reuses an existing Content row on hash match
    /// (dedup); creates one otherwise.
    pub async fn add_binding(&self, folder_id: i64, name: &str, hash: &str, size: i64) -> Result<i64> {
        validate_name(name)?;
        let mut tx = self.pool.begin().await?;
        ensure_not_in_trash(&mut tx, folder_id, self.trash_folder_id).await?;
        ensure_not_collision(&mut tx, folder_id, name, ItemType::Binding).await?;

        let content_id = match find_content_id(&mut tx, hash).await? {
            Some(id) => id,
            None => {
                sqlx::query("INSERT INTO contents (hash, size) VALUES (?1, ?2)")
                    .bind(hash)
                    .bind(size)
                    .execute(&mut *tx)
                    .await?
                    .last_insert_rowid()
            }
        };

        let binding_id = sqlx::query("INSERT INTO bindings (folder_id, content_id, name, modif_date) VALUES (?1, ?2, ?3, ?4)")
            .bind(folder_id)
            .bind(content_id)
            .bind(name)
            .bind(now())
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        adjust_ancestor_sizes(&mut tx, folder_id, size).await?;
        Self::bump_version(&mut tx).await?;
        tx.commit().await?;
        Ok(binding_id)
    }

    pub async fn add_chunks(&self, content_id: i64, chunks: &[ChunkRef]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query("INSERT INTO chunks (content_id, part_num, message_id, part_hash) VALUES (?1, ?2, ?3, ?4)")
                .bind(content_id)
                .bind(chunk.part_num)
                .bind(chunk.message_id)
                .bind(&chunk.part_hash)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn find_content_by_hash(&self, hash: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT id FROM contents WHERE hash = ?1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn content_hash_and_size(&self, content_id: i64) -> Result<(String, i64)> {
        let row = sqlx::query("SELECT hash, size FROM contents WHERE id = ?1")
            .bind(content_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::PathNotFound {
                message: format!("content {content_id} not found"),
            })?;
        Ok((row.get(0), row.get(1)))
    }

    pub async fn chunks_for_content(&self, content_id: i64) -> Result<Vec<ChunkRef>> {
        let rows = sqlx::query("SELECT part_num, message_id, part_hash FROM chunks WHERE content_id = ?1 ORDER BY part_num")
            .bind(content_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| ChunkRef {
                part_num: r.get(0),
                message_id: r.get(1),
                part_hash: r.get(2),
            })
            .collect())
    }

    /// Removes a Binding. Returns message ids to purge remotely if that was
    /// the Content's last reference.
    pub async fn remove_binding(&self, binding_id: i64) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT folder_id, content_id FROM bindings WHERE id = ?1")
            .bind(binding_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::PathNotFound {
                message: format!("binding {binding_id} not found"),
            })?;
        let folder_id: i64 = row.get(0);
        let content_id: i64 = row.get(1);
        let (_, size) = content_hash_and_size_tx(&mut tx, content_id).await?;

        sqlx::query("DELETE FROM bindings WHERE id = ?1").bind(binding_id).execute(&mut *tx).await?;
        adjust_ancestor_sizes(&mut tx, folder_id, -size).await?;

        let orphaned = purge_content_if_orphaned(&mut tx, content_id).await?;
        Self::bump_version(&mut tx).await?;
        tx.commit().await?;
        Ok(orphaned)
    }

    /// Removes a Folder and every descendant Binding/Folder. Returns the
    /// union of remote message ids orphaned by the removal.
    pub async fn remove_folder(&self, folder_id: i64) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let parent_id: Option<i64> = sqlx::query("SELECT parent_id FROM folders WHERE id = ?1")
            .bind(folder_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::PathNotFound {
                message: format!("folder {folder_id} not found"),
            })?
            .get(0);
        let size: i64 = sqlx::query("SELECT total_size FROM folders WHERE id = ?1")
            .bind(folder_id)
            .fetch_one(&mut *tx)
            .await?
            .get(0);

        let descendant_folder_ids = descendant_folder_ids(&mut tx, folder_id).await?;
        let content_ids: Vec<i64> = sqlx::query(&format!(
            "SELECT DISTINCT content_id FROM bindings WHERE folder_id IN ({})",
            in_list(&descendant_folder_ids)
        ))
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|r| r.get(0))
        .collect();

        let mut orphaned = Vec::new();
        for content_id in content_ids {
            orphaned.extend(purge_content_if_orphaned_after_folder_delete(&mut tx, content_id, &descendant_folder_ids).await?);
        }

        sqlx::query(&format!("DELETE FROM folders WHERE id IN ({})", in_list(&descendant_folder_ids)))
            .execute(&mut *tx)
            .await?;

        if let Some(parent_id) = parent_id {
            adjust_ancestor_sizes(&mut tx, parent_id, -size).await?;
        }
        Self::bump_version(&mut tx).await?;
        tx.commit().await?;
        Ok(orphaned)
    }

    pub async fn soft_delete(&self, item_id: i64, item_type: ItemType) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let (current_parent, current_name, size) = match item_type {
            ItemType::Folder => {
                let row = sqlx::query("SELECT parent_id, name, total_size FROM folders WHERE id = ?1")
                    .bind(item_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| Error::PathNotFound {
                        message: format!("folder {item_id} not found"),
                    })?;
                (row.get::<Option<i64>, _>(0), row.get::<String, _>(1), row.get::<i64, _>(2))
            }
            ItemType::Binding => {
                let row = sqlx::query("SELECT folder_id, name, content_id FROM bindings WHERE id = ?1")
                    .bind(item_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| Error::PathNotFound {
                        message: format!("binding {item_id} not found"),
                    })?;
                let content_id: i64 = row.get(2);
                let (_, size) = content_hash_and_size_tx(&mut tx, content_id).await?;
                (Some(row.get::<i64, _>(0)), row.get::<String, _>(1), size)
            }
        };

        let trash_name = format!("{current_name}.{}.trashed", (now() * 1000.0) as i64);
        match item_type {
            ItemType::Folder => {
                sqlx::query("UPDATE folders SET parent_id = ?1, name = ?2 WHERE id = ?3")
                    .bind(self.trash_folder_id)
                    .bind(&trash_name)
                    .bind(item_id)
                    .execute(&mut *tx)
                    .await?;
            }
            ItemType::Binding => {
                sqlx::query("UPDATE bindings SET folder_id = ?1, name = ?2 WHERE id = ?3")
                    .bind(self.trash_folder_id)
                    .bind(&trash_name)
                    .bind(item_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        if let Some(parent_id) = current_parent {
            adjust_ancestor_sizes(&mut tx, parent_id, -size).await?;
        }
        adjust_ancestor_sizes(&mut tx, self.trash_folder_id, size).await?;

        sqlx::query(
            "INSERT INTO trash_records (item_id, item_type, original_parent_id, original_name, trashed_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(item_id)
        .bind(item_type.as_str())
        .bind(current_parent)
        .bind(&current_name)
        .bind(now())
        .execute(&mut *tx)
        .await?;

        Self::bump_version(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn restore(&self, item_id: i64, item_type: ItemType) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT original_parent_id, original_name FROM trash_records WHERE item_id = ?1 AND item_type = ?2",
        )
        .bind(item_id)
        .bind(item_type.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::PathNotFound {
            message: format!("no trash record for {item_id}"),
        })?;

        let original_parent_id: Option<i64> = row.get(0);
        let original_name: String = row.get(1);

        let target_parent = match original_parent_id {
            Some(id) if folder_exists(&mut tx, id).await? => id,
            _ => self.root_folder_id,
        };

        let final_name = match item_type {
            ItemType::Folder => unique_sibling_name(&mut tx, target_parent, &original_name, ItemType::Folder).await?,
            ItemType::Binding => unique_sibling_name(&mut tx, target_parent, &original_name, ItemType::Binding).await?,
        };

        let size = match item_type {
            ItemType::Folder => {
                let r = sqlx::query("SELECT total_size FROM folders WHERE id = ?1").bind(item_id).fetch_one(&mut *tx).await?;
                sqlx::query("UPDATE folders SET parent_id = ?1, name = ?2 WHERE id = ?3")
                    .bind(target_parent)
                    .bind(&final_name)
                    .bind(item_id)
                    .execute(&mut *tx)
                    .await?;
                r.get::<i64, _>(0)
            }
            ItemType::Binding => {
                let r = sqlx::query("SELECT content_id FROM bindings WHERE id = ?1").bind(item_id).fetch_one(&mut *tx).await?;
                let content_id: i64 = r.get(0);
                let (_, size) = content_hash_and_size_tx(&mut tx, content_id).await?;
                sqlx::query("UPDATE bindings SET folder_id = ?1, name = ?2 WHERE id = ?3")
                    .bind(target_parent)
                    .bind(&final_name)
                    .bind(item_id)
                    .execute(&mut *tx)
                    .await?;
                size
            }
        };

        adjust_ancestor_sizes(&mut tx, self.trash_folder_id, -size).await?;
        adjust_ancestor_sizes(&mut tx, target_parent, size).await?;

        sqlx::query("DELETE FROM trash_records WHERE item_id = ?1 AND item_type = ?2")
            .bind(item_id)
            .bind(item_type.as_str())
            .execute(&mut *tx)
            .await?;

        Self::bump_version(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn expired_trash(&self, as_of: f64) -> Result<Vec<TrashRecord>> {
        let cutoff = as_of - TRASH_RETENTION_SECS;
        let rows = sqlx::query(
            "SELECT item_id, item_type, original_parent_id, original_name, trashed_at FROM trash_records WHERE trashed_at < ?1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(TrashRecord {
                    item_id: r.get(0),
                    item_type: ItemType::parse(r.get::<String, _>(1).as_str())?,
                    original_parent_id: r.get(2),
                    original_name: r.get(3),
                    trashed_at: r.get(4),
                })
            })
            .collect()
    }

    pub async fn rename_folder(&self, folder_id: i64, new_name: &str) -> Result<()> {
        validate_name(new_name)?;
        let mut tx = self.pool.begin().await?;
        let parent_id: i64 = sqlx::query("SELECT parent_id FROM folders WHERE id = ?1")
            .bind(folder_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::PathNotFound {
                message: format!("folder {folder_id} not found"),
            })?
            .get::<Option<i64>, _>(0)
            .ok_or_else(|| Error::InvalidOperation {
                message: "cannot rename a root folder".to_string(),
            })?;

        ensure_not_collision_excluding(&mut tx, parent_id, new_name, ItemType::Folder, folder_id).await?;
        sqlx::query("UPDATE folders SET name = ?1 WHERE id = ?2")
            .bind(new_name)
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;
        Self::bump_version(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn rename_binding(&self, binding_id: i64, new_name: &str) -> Result<()> {
        validate_name(new_name)?;
        let mut tx = self.pool.begin().await?;
        let folder_id: i64 = sqlx::query("SELECT folder_id FROM bindings WHERE id = ?1")
            .bind(binding_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::PathNotFound {
                message: format!("binding {binding_id} not found"),
            })?
            .get(0);

        ensure_not_collision_excluding(&mut tx, folder_id, new_name, ItemType::Binding, binding_id).await?;
        sqlx::query("UPDATE bindings SET name = ?1, modif_date = ?2 WHERE id = ?3")
            .bind(new_name)
            .bind(now())
            .bind(binding_id)
            .execute(&mut *tx)
            .await?;
        Self::bump_version(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn move_folder(&self, folder_id: i64, new_parent_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if folder_id == new_parent_id || is_descendant(&mut tx, new_parent_id, folder_id).await? {
            return Err(Error::InvalidOperation {
                message: "cannot move a folder into itself or a descendant".to_string(),
            });
        }

        let row = sqlx::query("SELECT parent_id, name, total_size FROM folders WHERE id = ?1")
            .bind(folder_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::PathNotFound {
                message: format!("folder {folder_id} not found"),
            })?;
        let old_parent_id: Option<i64> = row.get(0);
        let name: String = row.get(1);
        let size: i64 = row.get(2);

        ensure_not_collision(&mut tx, new_parent_id, &name, ItemType::Folder).await?;

        sqlx::query("UPDATE folders SET parent_id = ?1 WHERE id = ?2")
            .bind(new_parent_id)
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;

        if let Some(old_parent_id) = old_parent_id {
            adjust_ancestor_sizes(&mut tx, old_parent_id, -size).await?;
        }
        adjust_ancestor_sizes(&mut tx, new_parent_id, size).await?;

        Self::bump_version(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn move_binding(&self, binding_id: i64, new_folder_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT folder_id, name, content_id FROM bindings WHERE id = ?1")
            .bind(binding_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::PathNotFound {
                message: format!("binding {binding_id} not found"),
            })?;
        let old_folder_id: i64 = row.get(0);
        let name: String = row.get(1);
        let content_id: i64 = row.get(2);
        let (_, size) = content_hash_and_size_tx(&mut tx, content_id).await?;

        ensure_not_collision(&mut tx, new_folder_id, &name, ItemType::Binding).await?;

        sqlx::query("UPDATE bindings SET folder_id = ?1 WHERE id = ?2")
            .bind(new_folder_id)
            .bind(binding_id)
            .execute(&mut *tx)
            .await?;

        adjust_ancestor_sizes(&mut tx, old_folder_id, -size).await?;
        adjust_ancestor_sizes(&mut tx, new_folder_id, size).await?;

        Self::bump_version(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Flat recursive listing of everything under `folder_id`, used to drive
    /// folder uploads/downloads.
    pub async fn list_recursive(&self, folder_id: i64) -> Result<Vec<ListEntry>> {
        let mut tx = self.pool.begin().await?;
        let mut out = Vec::new();
        self.walk_recursive(&mut tx, folder_id, "", &mut out).await?;
        tx.commit().await?;
        Ok(out)
    }

    async fn walk_recursive(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        folder_id: i64,
        prefix: &str,
        out: &mut Vec<ListEntry>,
    ) -> Result<()> {
        let folders = sqlx::query("SELECT id, name FROM folders WHERE parent_id = ?1 ORDER BY name")
            .bind(folder_id)
            .fetch_all(&mut **tx)
            .await?;
        let bindings = sqlx::query("SELECT id, name, content_id FROM bindings WHERE folder_id = ?1 ORDER BY name")
            .bind(folder_id)
            .fetch_all(&mut **tx)
            .await?;

        for row in bindings {
            let id: i64 = row.get(0);
            let name: String = row.get(1);
            let content_id: i64 = row.get(2);
            let (hash, size) = content_hash_and_size_tx(tx, content_id).await?;
            let chunks = sqlx::query("SELECT part_num, message_id, part_hash FROM chunks WHERE content_id = ?1 ORDER BY part_num")
                .bind(content_id)
                .fetch_all(&mut **tx)
                .await?
                .into_iter()
                .map(|r| ChunkRef {
                    part_num: r.get(0),
                    message_id: r.get(1),
                    part_hash: r.get(2),
                })
                .collect();

            out.push(ListEntry {
                kind: ItemType::Binding,
                id,
                name: name.clone(),
                relative_path: format!("{prefix}{name}"),
                size: Some(size),
                hash: Some(hash),
                chunks: Some(chunks),
            });
        }

        for row in folders {
            let id: i64 = row.get(0);
            let name: String = row.get(1);
            let relative_path = format!("{prefix}{name}/");
            out.push(ListEntry {
                kind: ItemType::Folder,
                id,
                name: name.clone(),
                relative_path: relative_path.clone(),
                size: None,
                hash: None,
                chunks: None,
            });
            Box::pin(self.walk_recursive(tx, id, &relative_path, out)).await?;
        }

        Ok(())
    }

    pub async fn folder_contents(&self, folder_id: i64) -> Result<Vec<ListEntry>> {
        let mut tx = self.pool.begin().await?;
        let mut out = Vec::new();
        let folders = sqlx::query("SELECT id, name FROM folders WHERE parent_id = ?1 ORDER BY name")
            .bind(folder_id)
            .fetch_all(&mut *tx)
            .await?;
        for row in folders {
            out.push(ListEntry {
                kind: ItemType::Folder,
                id: row.get(0),
                name: row.get(1),
                relative_path: String::new(),
                size: None,
                hash: None,
                chunks: None,
            });
        }
        let bindings = sqlx::query("SELECT id, name, content_id FROM bindings WHERE folder_id = ?1 ORDER BY name")
            .bind(folder_id)
            .fetch_all(&mut *tx)
            .await?;
        for row in bindings {
            let content_id: i64 = row.get(2);
            let (hash, size) = content_hash_and_size_tx(&mut tx, content_id).await?;
            out.push(ListEntry {
                kind: ItemType::Binding,
                id: row.get(0),
                name: row.get(1),
                relative_path: String::new(),
                size: Some(size),
                hash: Some(hash),
                chunks: None,
            });
        }
        tx.commit().await?;
        Ok(out)
    }

    /// Fails fast with [`Error::InvalidName`] or [`Error::AlreadyExists`]
    /// before the caller does expensive work (hashing, chunking). The
    /// authoritative check still runs inside the mutating transaction that
    /// follows, so a race in between just surfaces the same error later.
    pub async fn check_name_available(&self, folder_id: i64, name: &str, kind: ItemType) -> Result<()> {
        validate_name(name)?;
        let mut tx = self.pool.begin().await?;
        ensure_not_collision(&mut tx, folder_id, name, kind).await?;
        tx.rollback().await?;
        Ok(())
    }

    pub async fn binding_info(&self, binding_id: i64) -> Result<(String, i64)> {
        let row = sqlx::query("SELECT name, content_id FROM bindings WHERE id = ?1")
            .bind(binding_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::PathNotFound {
                message: format!("binding {binding_id} not found"),
            })?;
        Ok((row.get(0), row.get(1)))
    }

    /// Inserts a fresh Content row, its Chunks, and a Binding referencing it,
    /// all in one transaction. Used for the non-dedup upload path; the
    /// dedup ("instant upload") path uses [`Self::add_binding`] instead,
    /// since no Chunks need to be created there.
    pub async fn finalize_upload(
        &self,
        folder_id: i64,
        name: &str,
        hash: &str,
        size: i64,
        chunks: &[ChunkRef],
    ) -> Result<(i64, i64)> {
        validate_name(name)?;
        let mut tx = self.pool.begin().await?;
        ensure_not_in_trash(&mut tx, folder_id, self.trash_folder_id).await?;
        ensure_not_collision(&mut tx, folder_id, name, ItemType::Binding).await?;

        let content_id = match find_content_id(&mut tx, hash).await? {
            Some(id) => id,
            None => {
                sqlx::query("INSERT INTO contents (hash, size) VALUES (?1, ?2)")
                    .bind(hash)
                    .bind(size)
                    .execute(&mut *tx)
                    .await?
                    .last_insert_rowid()
            }
        };

        for chunk in chunks {
            sqlx::query("INSERT INTO chunks (content_id, part_num, message_id, part_hash) VALUES (?1, ?2, ?3, ?4)")
                .bind(content_id)
                .bind(chunk.part_num)
                .bind(chunk.message_id)
                .bind(&chunk.part_hash)
                .execute(&mut *tx)
                .await?;
        }

        let binding_id = sqlx::query("INSERT INTO bindings (folder_id, content_id, name, modif_date) VALUES (?1, ?2, ?3, ?4)")
            .bind(folder_id)
            .bind(content_id)
            .bind(name)
            .bind(now())
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        adjust_ancestor_sizes(&mut tx, folder_id, size).await?;
        Self::bump_version(&mut tx).await?;
        tx.commit().await?;
        Ok((binding_id, content_id))
    }

    pub async fn folder_exists(&self, folder_id: i64) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM folders WHERE id = ?1").bind(folder_id).fetch_optional(&self.pool).await?;
        Ok(row.is_some())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn find_root_folder(tx: &mut Transaction<'_, Sqlite>, name: &str) -> Result<Option<i64>> {
    let row = sqlx::query("SELECT id FROM folders WHERE parent_id IS NULL AND name = ?1")
        .bind(name)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row.map(|r| r.get(0)))
}

async fn insert_folder(tx: &mut Transaction<'_, Sqlite>, parent_id: Option<i64>, name: &str) -> Result<i64> {
    Ok(sqlx::query("INSERT INTO folders (parent_id, name, total_size, modif_date) VALUES (?1, ?2, 0, ?3)")
        .bind(parent_id)
        .bind(name)
        .bind(now())
        .execute(&mut **tx)
        .await?
        .last_insert_rowid())
}

async fn ensure_not_collision(tx: &mut Transaction<'_, Sqlite>, folder_id: i64, name: &str, kind: ItemType) -> Result<()> {
    let exists = match kind {
        ItemType::Folder => sqlx::query("SELECT 1 FROM folders WHERE parent_id = ?1 AND name = ?2")
            .bind(folder_id)
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?
            .is_some(),
        ItemType::Binding => sqlx::query("SELECT 1 FROM bindings WHERE folder_id = ?1 AND name = ?2")
            .bind(folder_id)
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?
            .is_some(),
    };
    if exists {
        return Err(Error::AlreadyExists {
            folder_id,
            name: name.to_string(),
        });
    }
    Ok(())
}

async fn ensure_not_collision_excluding(
    tx: &mut Transaction<'_, Sqlite>,
    folder_id: i64,
    name: &str,
    kind: ItemType,
    excluding_id: i64,
) -> Result<()> {
    let exists = match kind {
        ItemType::Folder => sqlx::query("SELECT 1 FROM folders WHERE parent_id = ?1 AND name = ?2 AND id != ?3")
            .bind(folder_id)
            .bind(name)
            .bind(excluding_id)
            .fetch_optional(&mut **tx)
            .await?
            .is_some(),
        ItemType::Binding => sqlx::query("SELECT 1 FROM bindings WHERE folder_id = ?1 AND name = ?2 AND id != ?3")
            .bind(folder_id)
            .bind(name)
            .bind(excluding_id)
            .fetch_optional(&mut **tx)
            .await?
            .is_some(),
    };
    if exists {
        return Err(Error::AlreadyExists {
            folder_id,
            name: name.to_string(),
        });
    }
    Ok(())
}

async fn adjust_ancestor_sizes(tx: &mut Transaction<'_, Sqlite>, start_folder_id: i64, delta: i64) -> Result<()> {
    if delta == 0 {
        return Ok(());
    }
    let mut current = Some(start_folder_id);
    while let Some(folder_id) = current {
        sqlx::query("UPDATE folders SET total_size = total_size + ?1 WHERE id = ?2")
            .bind(delta)
            .bind(folder_id)
            .execute(&mut **tx)
            .await?;
        current = sqlx::query("SELECT parent_id FROM folders WHERE id = ?1")
            .bind(folder_id)
            .fetch_one(&mut **tx)
            .await?
            .get(0);
    }
    Ok(())
}

/// Rejects creating new folders/bindings directly in the trash root or any
/// of its descendants; only [`MetadataStore::soft_delete`] is allowed to
/// place items there.
async fn ensure_not_in_trash(tx: &mut Transaction<'_, Sqlite>, target_folder_id: i64, trash_folder_id: i64) -> Result<()> {
    if target_folder_id == trash_folder_id || is_descendant(tx, target_folder_id, trash_folder_id).await? {
        return Err(Error::InvalidOperation {
            message: "cannot create items inside the trash".to_string(),
        });
    }
    Ok(())
}

async fn is_descendant(tx: &mut Transaction<'_, Sqlite>, candidate: i64, ancestor: i64) -> Result<bool> {
    let mut current = Some(candidate);
    while let Some(folder_id) = current {
        if folder_id == ancestor {
            return Ok(true);
        }
        current = sqlx::query("SELECT parent_id FROM folders WHERE id = ?1")
            .bind(folder_id)
            .fetch_optional(&mut **tx)
            .await?
            .and_then(|r| r.get(0));
    }
    Ok(false)
}

async fn folder_exists(tx: &mut Transaction<'_, Sqlite>, folder_id: i64) -> Result<bool> {
    Ok(sqlx::query("SELECT 1 FROM folders WHERE id = ?1")
        .bind(folder_id)
        .fetch_optional(&mut **tx)
        .await?
        .is_some())
}

async fn find_content_id(tx: &mut Transaction<'_, Sqlite>, hash: &str) -> Result<Option<i64>> {
    let row = sqlx::query("SELECT id FROM contents WHERE hash = ?1").bind(hash).fetch_optional(&mut **tx).await?;
    Ok(row.map(|r| r.get(0)))
}

async fn content_hash_and_size_tx(tx: &mut Transaction<'_, Sqlite>, content_id: i64) -> Result<(String, i64)> {
    let row = sqlx::query("SELECT hash, size FROM contents WHERE id = ?1")
        .bind(content_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| Error::PathNotFound {
            message: format!("content {content_id} not found"),
        })?;
    Ok((row.get(0), row.get(1)))
}

/// Deletes `content_id` and its chunks if no binding references it anymore.
/// Returns the message ids of deleted chunks.
async fn purge_content_if_orphaned(tx: &mut Transaction<'_, Sqlite>, content_id: i64) -> Result<Vec<i64>> {
    let remaining: i64 = sqlx::query("SELECT COUNT(*) FROM bindings WHERE content_id = ?1")
        .bind(content_id)
        .fetch_one(&mut **tx)
        .await?
        .get(0);
    if remaining > 0 {
        return Ok(Vec::new());
    }

    let message_ids: Vec<i64> = sqlx::query("SELECT message_id FROM chunks WHERE content_id = ?1")
        .bind(content_id)
        .fetch_all(&mut **tx)
        .await?
        .into_iter()
        .map(|r| r.get(0))
        .collect();

    sqlx::query("DELETE FROM contents WHERE id = ?1").bind(content_id).execute(&mut **tx).await?;
    Ok(message_ids)
}

/// Variant used during folder deletion: a content is orphaned if every
/// remaining binding to it lies within the folder subtree being deleted.
async fn purge_content_if_orphaned_after_folder_delete(
    tx: &mut Transaction<'_, Sqlite>,
    content_id: i64,
    deleted_folder_ids: &[i64],
) -> Result<Vec<i64>> {
    let remaining: i64 = sqlx::query(&format!(
        "SELECT COUNT(*) FROM bindings WHERE content_id = ?1 AND folder_id NOT IN ({})",
        in_list(deleted_folder_ids)
    ))
    .bind(content_id)
    .fetch_one(&mut **tx)
    .await?
    .get(0);
    if remaining > 0 {
        return Ok(Vec::new());
    }

    let message_ids: Vec<i64> = sqlx::query("SELECT message_id FROM chunks WHERE content_id = ?1")
        .bind(content_id)
        .fetch_all(&mut **tx)
        .await?
        .into_iter()
        .map(|r| r.get(0))
        .collect();

    sqlx::query("DELETE FROM contents WHERE id = ?1").bind(content_id).execute(&mut **tx).await?;
    Ok(message_ids)
}

async fn descendant_folder_ids(tx: &mut Transaction<'_, Sqlite>, root: i64) -> Result<Vec<i64>> {
    let mut ids = vec![root];
    let mut frontier = vec![root];
    while !frontier.is_empty() {
        let rows = sqlx::query(&format!("SELECT id FROM folders WHERE parent_id IN ({})", in_list(&frontier)))
            .fetch_all(&mut **tx)
            .await?;
        frontier = rows.into_iter().map(|r| r.get(0)).collect();
        ids.extend(frontier.iter().copied());
    }
    Ok(ids)
}

async fn sibling_exists(tx: &mut Transaction<'_, Sqlite>, parent_id: i64, candidate: &str, kind: ItemType) -> Result<bool> {
    let found = match kind {
        ItemType::Folder => sqlx::query("SELECT 1 FROM folders WHERE parent_id = ?1 AND name = ?2")
            .bind(parent_id)
            .bind(candidate)
            .fetch_optional(&mut **tx)
            .await?,
        ItemType::Binding => sqlx::query("SELECT 1 FROM bindings WHERE folder_id = ?1 AND name = ?2")
            .bind(parent_id)
            .bind(candidate)
            .fetch_optional(&mut **tx)
            .await?,
    };
    Ok(found.is_some())
}

async fn unique_sibling_name(tx: &mut Transaction<'_, Sqlite>, parent_id: i64, name: &str, kind: ItemType) -> Result<String> {
    if !sibling_exists(tx, parent_id, name, kind).await? {
        return Ok(name.to_string());
    }

    let path = std::path::Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let ext = path.extension().and_then(|s| s.to_str());

    let mut n = 1u64;
    loop {
        let candidate = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        if !sibling_exists(tx, parent_id, &candidate, kind).await? {
            return Ok(candidate);
        }
        n += 1;
    }
}

fn in_list(ids: &[i64]) -> String {
    if ids.is_empty() {
        "NULL".to_string()
    } else {
        ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_tmp() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("meta.db")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn bootstraps_root_and_trash_once() {
        let (_dir, store) = open_tmp().await;
        assert_ne!(store.root_folder_id, store.trash_folder_id);
        assert_eq!(store.db_version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejects_forbidden_names() {
        let (_dir, store) = open_tmp().await;
        assert!(matches!(
            store.add_folder(store.root_folder_id, "a/b").await,
            Err(Error::InvalidName { .. })
        ));
        assert!(matches!(
            store.add_folder(store.root_folder_id, "..").await,
            Err(Error::InvalidName { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_creating_items_inside_trash() {
        let (_dir, store) = open_tmp().await;
        assert!(matches!(
            store.add_folder(store.trash_folder_id, "nope").await,
            Err(Error::InvalidOperation { .. })
        ));
        assert!(matches!(
            store.add_binding(store.trash_folder_id, "nope.txt", "hash1", 10).await,
            Err(Error::InvalidOperation { .. })
        ));
        assert!(matches!(
            store.finalize_upload(store.trash_folder_id, "nope.txt", "hash1", 10, &[]).await,
            Err(Error::InvalidOperation { .. })
        ));

        // a deleted folder now living under the trash root is also off-limits
        let sub = store.add_folder(store.root_folder_id, "docs").await.unwrap();
        store.soft_delete(sub, ItemType::Folder).await.unwrap();
        assert!(matches!(
            store.add_folder(sub, "nope").await,
            Err(Error::InvalidOperation { .. })
        ));
    }

    #[tokio::test]
    async fn dedup_reuses_content_and_skips_chunks() {
        let (_dir, store) = open_tmp().await;
        let sub = store.add_folder(store.root_folder_id, "docs").await.unwrap();

        let b1 = store.add_binding(store.root_folder_id, "a.txt", "hash1", 100).await.unwrap();
        let b2 = store.add_binding(sub, "b.txt", "hash1", 100).await.unwrap();
        assert_ne!(b1, b2);

        let content_id = store.find_content_by_hash("hash1").await.unwrap().unwrap();
        let orphaned = store.remove_binding(b1).await.unwrap();
        assert!(orphaned.is_empty(), "content still referenced by b2");

        let orphaned = store.remove_binding(b2).await.unwrap();
        assert!(orphaned.is_empty(), "no chunks were ever attached");
        assert!(store.find_content_by_hash("hash1").await.unwrap().is_none());
        let _ = content_id;
    }

    #[tokio::test]
    async fn recursive_size_aggregation_follows_the_whole_chain() {
        let (_dir, store) = open_tmp().await;
        let a = store.add_folder(store.root_folder_id, "a").await.unwrap();
        let b = store.add_folder(a, "b").await.unwrap();
        store.add_binding(b, "f.bin", "h", 42).await.unwrap();

        let contents = store.folder_contents(store.root_folder_id).await.unwrap();
        let root_total: i64 = sqlx::query("SELECT total_size FROM folders WHERE id = ?1")
            .bind(store.root_folder_id)
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(root_total, 42);
        assert_eq!(contents.len(), 1);
    }

    #[tokio::test]
    async fn soft_delete_then_restore_round_trips() {
        let (_dir, store) = open_tmp().await;
        let binding = store.add_binding(store.root_folder_id, "f.bin", "h", 10).await.unwrap();

        store.soft_delete(binding, ItemType::Binding).await.unwrap();
        let trashed: i64 = sqlx::query("SELECT folder_id FROM bindings WHERE id = ?1")
            .bind(binding)
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(trashed, store.trash_folder_id);

        store.restore(binding, ItemType::Binding).await.unwrap();
        let restored: i64 = sqlx::query("SELECT folder_id FROM bindings WHERE id = ?1")
            .bind(binding)
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(restored, store.root_folder_id);
    }

    #[tokio::test]
    async fn move_folder_rejects_cycles() {
        let (_dir, store) = open_tmp().await;
        let a = store.add_folder(store.root_folder_id, "a").await.unwrap();
        let b = store.add_folder(a, "b").await.unwrap();
        assert!(matches!(store.move_folder(a, b).await, Err(Error::InvalidOperation { .. })));
    }

    #[tokio::test]
    async fn remove_folder_cascades_and_reports_orphans() {
        let (_dir, store) = open_tmp().await;
        let a = store.add_folder(store.root_folder_id, "a").await.unwrap();
        let binding = store.add_binding(a, "f.bin", "h", 5).await.unwrap();
        let content_id = store.find_content_by_hash("h").await.unwrap().unwrap();
        store
            .add_chunks(content_id, &[ChunkRef { part_num: 1, message_id: 99, part_hash: "ph".into() }])
            .await
            .unwrap();

        let orphaned = store.remove_folder(a).await.unwrap();
        assert_eq!(orphaned, vec![99]);
        assert!(store.find_content_by_hash("h").await.unwrap().is_none());
        let _ = binding;
    }
}
