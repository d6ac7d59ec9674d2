//! SQLite-based persistence for the task registry
//!
//! All writes go through one writer task so rows land in mutation order.

use crate::error::HubdlError;
use chrono::{DateTime, Utc};
use hubdl_types::{Backend, DownloadTask, RepoKind, RepoRef, TaskStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Database connection pool for task persistence
#[derive(Clone, Debug)]
pub struct TaskDatabase {
    pool: SqlitePool,
}

impl TaskDatabase {
    /// Open (or create) the database at `db_path`
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, HubdlError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                repo_id TEXT NOT NULL,
                repo_kind TEXT NOT NULL,
                revision TEXT NOT NULL,
                include_patterns TEXT NOT NULL,
                exclude_patterns TEXT NOT NULL,
                target_dir TEXT,
                resolved_target_dir TEXT,
                status TEXT NOT NULL,
                total_bytes INTEGER NOT NULL DEFAULT 0,
                total_files INTEGER NOT NULL DEFAULT 0,
                downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                downloaded_files INTEGER NOT NULL DEFAULT 0,
                result_path TEXT,
                error_message TEXT,
                backend TEXT NOT NULL,
                accelerated INTEGER NOT NULL DEFAULT 0,
                job_ids TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            "#,
        )
        .execute(&pool)
        .await?;

        // Databases from before job groups were stored
        let has_job_ids: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info('tasks') WHERE name = 'job_ids'")
                .fetch_one(&pool)
                .await?;
        if has_job_ids == 0 {
            debug!("Adding job_ids column to tasks");
            sqlx::query("ALTER TABLE tasks ADD COLUMN job_ids TEXT NOT NULL DEFAULT '[]'")
                .execute(&pool)
                .await?;
        }

        Ok(Self { pool })
    }

    /// Save or update a task
    pub async fn upsert_task(&self, task: &DownloadTask) -> Result<(), HubdlError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, repo_id, repo_kind, revision, include_patterns, exclude_patterns,
                target_dir, resolved_target_dir, status, total_bytes, total_files,
                downloaded_bytes, downloaded_files, result_path, error_message,
                backend, accelerated, job_ids, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                include_patterns = excluded.include_patterns,
                exclude_patterns = excluded.exclude_patterns,
                target_dir = excluded.target_dir,
                resolved_target_dir = excluded.resolved_target_dir,
                status = excluded.status,
                total_bytes = excluded.total_bytes,
                total_files = excluded.total_files,
                downloaded_bytes = excluded.downloaded_bytes,
                downloaded_files = excluded.downloaded_files,
                result_path = excluded.result_path,
                error_message = excluded.error_message,
                backend = excluded.backend,
                accelerated = excluded.accelerated,
                job_ids = excluded.job_ids
            "#,
        )
        .bind(&task.id)
        .bind(&task.repo.id)
        .bind(task.repo.kind.as_str())
        .bind(&task.repo.revision)
        .bind(serde_json::to_string(&task.include_patterns)?)
        .bind(serde_json::to_string(&task.exclude_patterns)?)
        .bind(task.target_dir.as_ref().map(|p| p.to_string_lossy().to_string()))
        .bind(
            task.resolved_target_dir
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        )
        .bind(task.status.as_str())
        .bind(task.total_bytes as i64)
        .bind(task.total_files as i64)
        .bind(task.downloaded_bytes as i64)
        .bind(task.downloaded_files as i64)
        .bind(task.result_path.as_ref().map(|p| p.to_string_lossy().to_string()))
        .bind(task.error_message.as_ref())
        .bind(task.backend.as_str())
        .bind(task.accelerated)
        .bind(serde_json::to_string(&task.accelerator_jobs)?)
        .bind(task.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete a task
    pub async fn delete_task(&self, id: &str) -> Result<(), HubdlError> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Load all tasks, oldest first
    pub async fn load_all_tasks(&self) -> Result<Vec<DownloadTask>, HubdlError> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Skipping unreadable task row: {}", e),
            }
        }
        Ok(tasks)
    }
}

fn row_to_task(row: &SqliteRow) -> Result<DownloadTask, HubdlError> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("repo_kind")?;
    let status: String = row.try_get("status")?;
    let backend: String = row.try_get("backend")?;
    let include: String = row.try_get("include_patterns")?;
    let exclude: String = row.try_get("exclude_patterns")?;
    let job_ids: String = row.try_get("job_ids")?;
    let created_at: String = row.try_get("created_at")?;

    let repo = RepoRef::new(
        row.try_get::<String, _>("repo_id")?,
        kind.parse::<RepoKind>()
            .map_err(|e| HubdlError::Serialization(e.to_string()))?,
        row.try_get::<String, _>("revision")?,
    );
    let backend = backend
        .parse::<Backend>()
        .map_err(|e| HubdlError::Serialization(e.to_string()))?;

    let mut task = DownloadTask::new(id, repo, backend);
    task.include_patterns = serde_json::from_str(&include)?;
    task.exclude_patterns = serde_json::from_str(&exclude)?;
    task.target_dir = row.try_get::<Option<String>, _>("target_dir")?.map(PathBuf::from);
    task.resolved_target_dir = row
        .try_get::<Option<String>, _>("resolved_target_dir")?
        .map(PathBuf::from);
    task.status = status
        .parse::<TaskStatus>()
        .map_err(|e| HubdlError::Serialization(e.to_string()))?;
    task.total_bytes = row.try_get::<i64, _>("total_bytes")? as u64;
    task.total_files = row.try_get::<i64, _>("total_files")? as u64;
    task.downloaded_bytes = row.try_get::<i64, _>("downloaded_bytes")? as u64;
    task.downloaded_files = row.try_get::<i64, _>("downloaded_files")? as u64;
    task.result_path = row.try_get::<Option<String>, _>("result_path")?.map(PathBuf::from);
    task.error_message = row.try_get("error_message")?;
    task.accelerated = row.try_get::<bool, _>("accelerated")?;
    task.accelerator_jobs = serde_json::from_str(&job_ids)?;
    task.created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    task.recompute_progress();

    Ok(task)
}

// ============================================================================
// Writer task
// ============================================================================

enum PersistCommand {
    Upsert(Box<DownloadTask>),
    Delete(String),
    Flush(oneshot::Sender<()>),
}

/// Handle to the persistence writer
#[derive(Clone)]
pub struct Persistence {
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl Persistence {
    /// Start the writer task for `db`
    pub fn spawn(db: TaskDatabase) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(db, rx));
        Self { tx }
    }

    pub fn upsert(&self, task: &DownloadTask) {
        if self.tx.send(PersistCommand::Upsert(Box::new(task.clone()))).is_err() {
            error!("Persistence writer is gone; task {} not saved", task.id);
        }
    }

    pub fn delete(&self, id: &str) {
        if self.tx.send(PersistCommand::Delete(id.to_string())).is_err() {
            error!("Persistence writer is gone; task {} not deleted", id);
        }
    }

    /// Wait until everything queued so far is written
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn run_writer(db: TaskDatabase, mut rx: mpsc::UnboundedReceiver<PersistCommand>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        // Only the latest write per task matters
        let mut ops: Vec<(String, Option<Box<DownloadTask>>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut acks = Vec::new();
        for command in batch {
            let (id, op) = match command {
                PersistCommand::Upsert(task) => (task.id.clone(), Some(task)),
                PersistCommand::Delete(id) => (id, None),
                PersistCommand::Flush(ack) => {
                    acks.push(ack);
                    continue;
                }
            };
            match index.get(&id) {
                Some(&i) => ops[i].1 = op,
                None => {
                    index.insert(id.clone(), ops.len());
                    ops.push((id, op));
                }
            }
        }

        if !ops.is_empty() {
            debug!("Writing {} task changes", ops.len());
        }
        for (id, op) in ops {
            let result = match op {
                Some(task) => db.upsert_task(&task).await,
                None => db.delete_task(&id).await,
            };
            if let Err(e) = result {
                error!("Failed to persist task {}: {}", id, e);
            }
        }

        for ack in acks {
            let _ = ack.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubdl_types::Transition;

    fn task(id: &str) -> DownloadTask {
        let mut task = DownloadTask::new(id.into(), RepoRef::model("org/model"), Backend::Accelerator);
        task.include_patterns = vec!["*.gguf".into()];
        task.resolved_target_dir = Some(PathBuf::from("/d/models--org--model"));
        task
    }

    #[tokio::test]
    async fn test_round_trip_through_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let db = TaskDatabase::new(dir.path().join("tasks.db")).await.unwrap();

        let mut t = task("a");
        t.transition(Transition::Start).unwrap();
        t.total_bytes = 100;
        t.downloaded_bytes = 40;
        t.accelerator_jobs = vec!["0000000000000001".into(), "0000000000000002".into()];
        db.upsert_task(&t).await.unwrap();

        let loaded = db.load_all_tasks().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, TaskStatus::Downloading);
        assert_eq!(loaded[0].include_patterns, vec!["*.gguf"]);
        assert_eq!(loaded[0].backend, Backend::Accelerator);
        assert_eq!(loaded[0].downloaded_bytes, 40);
        assert_eq!(loaded[0].resolved_target_dir, t.resolved_target_dir);
        assert_eq!(loaded[0].accelerator_jobs, t.accelerator_jobs);
    }

    #[tokio::test]
    async fn test_adds_job_ids_to_older_databases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        {
            let options = SqliteConnectOptions::new().filename(&path).create_if_missing(true);
            let pool = SqlitePool::connect_with(options).await.unwrap();
            sqlx::query(
                r#"
                CREATE TABLE tasks (
                    id TEXT PRIMARY KEY,
                    repo_id TEXT NOT NULL,
                    repo_kind TEXT NOT NULL,
                    revision TEXT NOT NULL,
                    include_patterns TEXT NOT NULL,
                    exclude_patterns TEXT NOT NULL,
                    target_dir TEXT,
                    resolved_target_dir TEXT,
                    status TEXT NOT NULL,
                    total_bytes INTEGER NOT NULL DEFAULT 0,
                    total_files INTEGER NOT NULL DEFAULT 0,
                    downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                    downloaded_files INTEGER NOT NULL DEFAULT 0,
                    result_path TEXT,
                    error_message TEXT,
                    backend TEXT NOT NULL,
                    accelerated INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );
                INSERT INTO tasks (id, repo_id, repo_kind, revision, include_patterns,
                    exclude_patterns, status, backend, created_at)
                VALUES ('old', 'org/model', 'model', 'main', '[]', '[]', 'paused',
                    'accelerator', '2024-01-01T00:00:00+00:00');
                "#,
            )
            .execute(&pool)
            .await
            .unwrap();
            pool.close().await;
        }

        let db = TaskDatabase::new(&path).await.unwrap();
        let loaded = db.load_all_tasks().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].accelerator_jobs.is_empty());

        let mut t = loaded[0].clone();
        t.accelerator_jobs = vec!["0000000000000003".into()];
        db.upsert_task(&t).await.unwrap();
        assert_eq!(db.load_all_tasks().await.unwrap()[0].accelerator_jobs, t.accelerator_jobs);
    }

    #[tokio::test]
    async fn test_writer_coalesces_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let db = TaskDatabase::new(dir.path().join("tasks.db")).await.unwrap();
        let persistence = Persistence::spawn(db.clone());

        let mut a = task("a");
        persistence.upsert(&a);
        a.downloaded_bytes = 10;
        persistence.upsert(&a);
        persistence.upsert(&task("b"));
        persistence.delete("b");
        persistence.flush().await;

        let loaded = db.load_all_tasks().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "a");
        assert_eq!(loaded[0].downloaded_bytes, 10);
    }
}
