//! Transfer checkpoint store: durable record of in-flight uploads/downloads,
//! separate from the metadata catalogue.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool, Sqlite, Transaction};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Upload,
    Download,
}

impl TaskKind {
    fn as_str(self) -> &'static str {
        match self {
            TaskKind::Upload => "upload",
            TaskKind::Download => "download",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "upload" { TaskKind::Upload } else { TaskKind::Download }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Transferring,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Transferring => "transferring",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "queued" => TaskStatus::Queued,
            "transferring" => TaskStatus::Transferring,
            "paused" => TaskStatus::Paused,
            "completed" => TaskStatus::Completed,
            _ => TaskStatus::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubTask {
    pub id: String,
    pub main_task_id: String,
    pub local_path: String,
    pub remote_id: Option<String>,
    pub status: TaskStatus,
    pub hash: Option<String>,
    pub total_size: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressPart {
    pub part_num: i64,
    pub message_id: Option<i64>,
    pub hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MainTask {
    pub id: String,
    pub kind: TaskKind,
    pub is_folder: bool,
    pub status: TaskStatus,
    pub total_size: i64,
    pub local_path: String,
    pub remote_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone)]
pub struct TaskView {
    pub main: MainTask,
    pub sub_tasks: Vec<(SubTask, Vec<ProgressPart>)>,
}

pub struct CheckpointStore {
    pool: SqlitePool,
}

fn now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

impl CheckpointStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(options).await?;
        sqlx::migrate!("./migrations/checkpoint").run(&pool).await?;

        let store = Self { pool };
        store.reset_zombie_tasks().await?;
        Ok(store)
    }

    /// Flips any `transferring` main task (and its sub-tasks) to `paused`.
    /// Run once at startup: a `transferring` row surviving a restart means
    /// the process died mid-transfer.
    pub async fn reset_zombie_tasks(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE main_tasks SET status = 'paused', updated_at = ?1 WHERE status = 'transferring'")
            .bind(now())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE sub_tasks SET status = 'paused' WHERE status = 'transferring' AND main_task_id IN \
             (SELECT task_id FROM main_tasks WHERE status = 'paused')",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn create_main_task(
        &self,
        id: &str,
        kind: TaskKind,
        is_folder: bool,
        local_path: &str,
        remote_id: Option<&str>,
    ) -> Result<()> {
        let ts = now();
        sqlx::query(
            "INSERT INTO main_tasks (task_id, kind, is_folder, status, total_size, local_path, remote_id, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?5, ?6, ?6)",
        )
        .bind(id)
        .bind(kind.as_str())
        .bind(is_folder)
        .bind(local_path)
        .bind(remote_id)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn create_sub_tasks_bulk(&self, main_task_id: &str, sub_tasks: &[(String, String, i64)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (id, local_path, total_size) in sub_tasks {
            sqlx::query(
                "INSERT INTO sub_tasks (sub_task_id, main_task_id, local_path, status, total_size) VALUES (?1, ?2, ?3, 'queued', ?4)",
            )
            .bind(id)
            .bind(main_task_id)
            .bind(local_path)
            .bind(total_size)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn update_main_task_status(&self, id: &str, status: TaskStatus, error_message: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE main_tasks SET status = ?1, error_message = ?2, updated_at = ?3 WHERE task_id = ?4")
            .bind(status.as_str())
            .bind(error_message)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_main_task_total_size(&self, id: &str, total_size: i64) -> Result<()> {
        sqlx::query("UPDATE main_tasks SET total_size = ?1, updated_at = ?2 WHERE task_id = ?3")
            .bind(total_size)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_sub_task_status(&self, id: &str, status: TaskStatus, error_message: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE sub_tasks SET status = ?1, error_message = ?2 WHERE sub_task_id = ?3")
            .bind(status.as_str())
            .bind(error_message)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_sub_task_hash(&self, id: &str, hash: &str) -> Result<()> {
        sqlx::query("UPDATE sub_tasks SET hash = ?1 WHERE sub_task_id = ?2").bind(hash).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn set_sub_task_remote_id(&self, id: &str, remote_id: &str) -> Result<()> {
        sqlx::query("UPDATE sub_tasks SET remote_id = ?1 WHERE sub_task_id = ?2").bind(remote_id).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    /// Records a completed part. This is the durability point: callers must
    /// not advance past a chunk until this returns `Ok`.
    pub async fn add_progress_part(&self, sub_task_id: &str, part: &ProgressPart) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO progress_parts (sub_task_id, part_num, message_id, hash) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(sub_task_id)
        .bind(part.part_num)
        .bind(part.message_id)
        .bind(&part.hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn completed_parts(&self, sub_task_id: &str) -> Result<Vec<ProgressPart>> {
        let rows = sqlx::query("SELECT part_num, message_id, hash FROM progress_parts WHERE sub_task_id = ?1 ORDER BY part_num")
            .bind(sub_task_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| ProgressPart {
                part_num: r.get(0),
                message_id: r.get(1),
                hash: r.get(2),
            })
            .collect())
    }

    pub async fn delete_task(&self, main_task_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM progress_parts WHERE sub_task_id IN (SELECT sub_task_id FROM sub_tasks WHERE main_task_id = ?1)",
        )
        .bind(main_task_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM sub_tasks WHERE main_task_id = ?1").bind(main_task_id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM main_tasks WHERE task_id = ?1").bind(main_task_id).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_task(&self, main_task_id: &str) -> Result<Option<TaskView>> {
        let main_row = match sqlx::query(
            "SELECT task_id, kind, is_folder, status, total_size, local_path, remote_id, error_message, created_at, updated_at \
             FROM main_tasks WHERE task_id = ?1",
        )
        .bind(main_task_id)
        .fetch_optional(&self.pool)
        .await?
        {
            Some(row) => row,
            None => return Ok(None),
        };

        let main = MainTask {
            id: main_row.get(0),
            kind: TaskKind::parse(main_row.get::<String, _>(1).as_str()),
            is_folder: main_row.get(2),
            status: TaskStatus::parse(main_row.get::<String, _>(3).as_str()),
            total_size: main_row.get(4),
            local_path: main_row.get(5),
            remote_id: main_row.get(6),
            error_message: main_row.get(7),
            created_at: main_row.get(8),
            updated_at: main_row.get(9),
        };

        let sub_rows = sqlx::query(
            "SELECT sub_task_id, main_task_id, local_path, remote_id, status, hash, total_size, error_message \
             FROM sub_tasks WHERE main_task_id = ?1 ORDER BY sub_task_id",
        )
        .bind(main_task_id)
        .fetch_all(&self.pool)
        .await?;

        let mut sub_tasks = Vec::with_capacity(sub_rows.len());
        for row in sub_rows {
            let sub = SubTask {
                id: row.get(0),
                main_task_id: row.get(1),
                local_path: row.get(2),
                remote_id: row.get(3),
                status: TaskStatus::parse(row.get::<String, _>(4).as_str()),
                hash: row.get(5),
                total_size: row.get(6),
                error_message: row.get(7),
            };
            let parts = self.completed_parts(&sub.id).await?;
            sub_tasks.push((sub, parts));
        }

        Ok(Some(TaskView { main, sub_tasks }))
    }

    pub async fn record_traffic(&self, day: &str, bytes: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO traffic_stats (date, bytes) VALUES (?1, ?2) \
             ON CONFLICT(date) DO UPDATE SET bytes = bytes + excluded.bytes",
        )
        .bind(day)
        .bind(bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_artifact(&self, task_id: &str, artifact_type: &str, db_id: i64) -> Result<()> {
        sqlx::query("INSERT INTO created_artifacts (task_id, artifact_type, db_id, created_at) VALUES (?1, ?2, ?3, ?4)")
            .bind(task_id)
            .bind(artifact_type)
            .bind(db_id)
            .bind(now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_tmp() -> (tempfile::TempDir, CheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(&dir.path().join("checkpoint.db")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn reset_zombie_tasks_flips_transferring_to_paused_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.db");
        {
            let store = CheckpointStore::open(&path).await.unwrap();
            store.create_main_task("t1", TaskKind::Upload, false, "/tmp/a", None).await.unwrap();
            store.update_main_task_status("t1", TaskStatus::Transferring, None).await.unwrap();
        }

        let store = CheckpointStore::open(&path).await.unwrap();
        let view = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(view.main.status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn progress_parts_survive_and_drive_resume() {
        let (_dir, store) = open_tmp().await;
        store.create_main_task("t1", TaskKind::Upload, false, "/tmp/a", None).await.unwrap();
        store.create_sub_tasks_bulk("t1", &[("t1".to_string(), "/tmp/a".to_string(), 100)]).await.unwrap();

        store
            .add_progress_part("t1", &ProgressPart { part_num: 1, message_id: Some(42), hash: Some("h".into()) })
            .await
            .unwrap();

        let parts = store.completed_parts("t1").await.unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].message_id, Some(42));
    }

    #[tokio::test]
    async fn delete_task_removes_sub_tasks_and_parts() {
        let (_dir, store) = open_tmp().await;
        store.create_main_task("t1", TaskKind::Download, false, "/tmp/a", None).await.unwrap();
        store.create_sub_tasks_bulk("t1", &[("t1".to_string(), "/tmp/a".to_string(), 10)]).await.unwrap();
        store
            .add_progress_part("t1", &ProgressPart { part_num: 1, message_id: None, hash: None })
            .await
            .unwrap();

        store.delete_task("t1").await.unwrap();
        assert!(store.get_task("t1").await.unwrap().is_none());
    }
}
