//! Snapshot/batch persistence + rate-limited HTTP fetch utilities.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::info_span;
use uuid::Uuid;

use spt_core::{
    BatchStatus, ErrorRecord, IngestionBatch, PlatformId, Snapshot, Student,
};

pub const CRATE_NAME: &str = "spt-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("batch {0} not found")]
    BatchNotFound(Uuid),
    #[error("snapshot already recorded for student {student_id} in batch {batch_id}")]
    SnapshotExists { student_id: String, batch_id: Uuid },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait StudentStore: Send + Sync {
    async fn upsert_student(&self, student: Student) -> Result<(), StoreError>;
    async fn student(&self, registration_no: &str) -> Result<Option<Student>, StoreError>;
    async fn active_students(&self) -> Result<Vec<Student>, StoreError>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist an immutable snapshot. A second save for the same
    /// `(student_id, batch_id)` key is rejected with `SnapshotExists`.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError>;
    async fn latest_snapshot(&self, student_id: &str) -> Result<Option<Snapshot>, StoreError>;
    /// Most-recent-first history, bounded by `limit`.
    async fn snapshot_history(
        &self,
        student_id: &str,
        limit: usize,
    ) -> Result<Vec<Snapshot>, StoreError>;
    async fn snapshots_for_batch(&self, batch_id: Uuid) -> Result<Vec<Snapshot>, StoreError>;
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn create_batch(&self, batch: IngestionBatch) -> Result<(), StoreError>;
    async fn batch(&self, batch_id: Uuid) -> Result<Option<IngestionBatch>, StoreError>;
    async fn set_batch_status(&self, batch_id: Uuid, status: BatchStatus) -> Result<(), StoreError>;
    /// Atomically bump progress counters and append the optional error
    /// record. Counters only ever increase.
    async fn record_task_outcome(
        &self,
        batch_id: Uuid,
        succeeded: bool,
        error: Option<ErrorRecord>,
    ) -> Result<(), StoreError>;
    /// Append an error record without touching progress counters.
    async fn record_batch_error(&self, batch_id: Uuid, error: ErrorRecord)
        -> Result<(), StoreError>;
    /// Most recently created batches first, by week number then submit time.
    async fn latest_batches(&self, limit: usize) -> Result<Vec<IngestionBatch>, StoreError>;
    /// Highest week number assigned so far across all batches; 0 if none.
    async fn max_week_number(&self) -> Result<u32, StoreError>;
}

pub trait Store: StudentStore + SnapshotStore + BatchStore {}

impl<T: StudentStore + SnapshotStore + BatchStore> Store for T {}

/// Pick the persistence back-end from the environment: Postgres when
/// `DATABASE_URL` is set, otherwise JSON files under `SPT_DATA_DIR`.
pub async fn store_from_env() -> anyhow::Result<Arc<dyn Store>> {
    if let Ok(database_url) = std::env::var("DATABASE_URL") {
        let store = PgStore::connect(&database_url).await?;
        store.init_schema().await.context("initializing schema")?;
        return Ok(Arc::new(store));
    }
    let data_dir = std::env::var("SPT_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    Ok(Arc::new(JsonFileStore::new(data_dir)))
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    students: BTreeMap<String, Student>,
    snapshots: BTreeMap<(String, Uuid), Snapshot>,
    batches: BTreeMap<Uuid, IngestionBatch>,
}

/// Mutex-guarded maps; the default for tests and embedded use.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StudentStore for MemoryStore {
    async fn upsert_student(&self, student: Student) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .students
            .insert(student.registration_no.clone(), student);
        Ok(())
    }

    async fn student(&self, registration_no: &str) -> Result<Option<Student>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.students.get(registration_no).cloned())
    }

    async fn active_students(&self) -> Result<Vec<Student>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .students
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect())
    }
}

fn most_recent_first(snapshots: &mut [Snapshot]) {
    snapshots.sort_by(|a, b| {
        b.week_number
            .cmp(&a.week_number)
            .then(b.captured_at.cmp(&a.captured_at))
    });
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (snapshot.student_id.clone(), snapshot.batch_id);
        if inner.snapshots.contains_key(&key) {
            return Err(StoreError::SnapshotExists {
                student_id: key.0,
                batch_id: key.1,
            });
        }
        inner.snapshots.insert(key, snapshot);
        Ok(())
    }

    async fn latest_snapshot(&self, student_id: &str) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.snapshot_history(student_id, 1).await?.into_iter().next())
    }

    async fn snapshot_history(
        &self,
        student_id: &str,
        limit: usize,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let inner = self.inner.lock().await;
        let mut history: Vec<Snapshot> = inner
            .snapshots
            .values()
            .filter(|s| s.student_id == student_id)
            .cloned()
            .collect();
        most_recent_first(&mut history);
        history.truncate(limit);
        Ok(history)
    }

    async fn snapshots_for_batch(&self, batch_id: Uuid) -> Result<Vec<Snapshot>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .snapshots
            .values()
            .filter(|s| s.batch_id == batch_id)
            .cloned()
            .collect())
    }
}

fn apply_task_outcome(batch: &mut IngestionBatch, succeeded: bool, error: Option<ErrorRecord>) {
    batch.progress.processed += 1;
    if succeeded {
        batch.progress.succeeded += 1;
    } else {
        batch.progress.failed += 1;
    }
    if let Some(error) = error {
        batch.errors.push(error);
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn create_batch(&self, batch: IngestionBatch) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.batches.insert(batch.batch_id, batch);
        Ok(())
    }

    async fn batch(&self, batch_id: Uuid) -> Result<Option<IngestionBatch>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.batches.get(&batch_id).cloned())
    }

    async fn set_batch_status(&self, batch_id: Uuid, status: BatchStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let batch = inner
            .batches
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        batch.status = status;
        Ok(())
    }

    async fn record_task_outcome(
        &self,
        batch_id: Uuid,
        succeeded: bool,
        error: Option<ErrorRecord>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let batch = inner
            .batches
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        apply_task_outcome(batch, succeeded, error);
        Ok(())
    }

    async fn record_batch_error(
        &self,
        batch_id: Uuid,
        error: ErrorRecord,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let batch = inner
            .batches
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        batch.errors.push(error);
        Ok(())
    }

    async fn latest_batches(&self, limit: usize) -> Result<Vec<IngestionBatch>, StoreError> {
        let inner = self.inner.lock().await;
        let mut batches: Vec<IngestionBatch> = inner.batches.values().cloned().collect();
        batches.sort_by(|a, b| {
            b.week_number
                .cmp(&a.week_number)
                .then(b.submitted_at.cmp(&a.submitted_at))
        });
        batches.truncate(limit);
        Ok(batches)
    }

    async fn max_week_number(&self) -> Result<u32, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .batches
            .values()
            .map(|b| b.week_number)
            .max()
            .unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

/// One JSON document per row, written with a temp-file + atomic rename.
/// Layout: `students/{reg}.json`, `snapshots/{student}/{batch}.json`,
/// `batches/{batch}.json`.
pub struct JsonFileStore {
    root: PathBuf,
    // Serializes read-modify-write cycles on batch documents.
    batch_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            batch_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn student_path(&self, registration_no: &str) -> PathBuf {
        self.root
            .join("students")
            .join(format!("{}.json", sanitize_component(registration_no)))
    }

    fn snapshot_dir(&self, student_id: &str) -> PathBuf {
        self.root
            .join("snapshots")
            .join(sanitize_component(student_id))
    }

    fn snapshot_path(&self, student_id: &str, batch_id: Uuid) -> PathBuf {
        self.snapshot_dir(student_id).join(format!("{batch_id}.json"))
    }

    fn batch_path(&self, batch_id: Uuid) -> PathBuf {
        self.root.join("batches").join(format!("{batch_id}.json"))
    }

    async fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(value)?;
        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(temp_name);
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);
        match fs::rename(&temp_path, path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err.into())
            }
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &Path,
    ) -> Result<Option<T>, StoreError> {
        match fs::read_to_string(path).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_dir_json<T: serde::de::DeserializeOwned>(
        &self,
        dir: &Path,
    ) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path).await?;
            out.push(serde_json::from_str(&text)?);
        }
        Ok(out)
    }
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl StudentStore for JsonFileStore {
    async fn upsert_student(&self, student: Student) -> Result<(), StoreError> {
        let path = self.student_path(&student.registration_no);
        self.write_json(&path, &student).await
    }

    async fn student(&self, registration_no: &str) -> Result<Option<Student>, StoreError> {
        self.read_json(&self.student_path(registration_no)).await
    }

    async fn active_students(&self) -> Result<Vec<Student>, StoreError> {
        let students: Vec<Student> = self.read_dir_json(&self.root.join("students")).await?;
        Ok(students.into_iter().filter(|s| s.active).collect())
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let path = self.snapshot_path(&snapshot.student_id, snapshot.batch_id);
        if fs::try_exists(&path).await? {
            return Err(StoreError::SnapshotExists {
                student_id: snapshot.student_id,
                batch_id: snapshot.batch_id,
            });
        }
        self.write_json(&path, &snapshot).await
    }

    async fn latest_snapshot(&self, student_id: &str) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.snapshot_history(student_id, 1).await?.into_iter().next())
    }

    async fn snapshot_history(
        &self,
        student_id: &str,
        limit: usize,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let mut history: Vec<Snapshot> =
            self.read_dir_json(&self.snapshot_dir(student_id)).await?;
        most_recent_first(&mut history);
        history.truncate(limit);
        Ok(history)
    }

    async fn snapshots_for_batch(&self, batch_id: Uuid) -> Result<Vec<Snapshot>, StoreError> {
        let snapshot_root = self.root.join("snapshots");
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&snapshot_root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join(format!("{batch_id}.json"));
            if let Some(snapshot) = self.read_json::<Snapshot>(&path).await? {
                out.push(snapshot);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl BatchStore for JsonFileStore {
    async fn create_batch(&self, batch: IngestionBatch) -> Result<(), StoreError> {
        let _guard = self.batch_lock.lock().await;
        let path = self.batch_path(batch.batch_id);
        self.write_json(&path, &batch).await
    }

    async fn batch(&self, batch_id: Uuid) -> Result<Option<IngestionBatch>, StoreError> {
        self.read_json(&self.batch_path(batch_id)).await
    }

    async fn set_batch_status(&self, batch_id: Uuid, status: BatchStatus) -> Result<(), StoreError> {
        let _guard = self.batch_lock.lock().await;
        let path = self.batch_path(batch_id);
        let mut batch: IngestionBatch = self
            .read_json(&path)
            .await?
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        batch.status = status;
        self.write_json(&path, &batch).await
    }

    async fn record_task_outcome(
        &self,
        batch_id: Uuid,
        succeeded: bool,
        error: Option<ErrorRecord>,
    ) -> Result<(), StoreError> {
        let _guard = self.batch_lock.lock().await;
        let path = self.batch_path(batch_id);
        let mut batch: IngestionBatch = self
            .read_json(&path)
            .await?
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        apply_task_outcome(&mut batch, succeeded, error);
        self.write_json(&path, &batch).await
    }

    async fn record_batch_error(
        &self,
        batch_id: Uuid,
        error: ErrorRecord,
    ) -> Result<(), StoreError> {
        let _guard = self.batch_lock.lock().await;
        let path = self.batch_path(batch_id);
        let mut batch: IngestionBatch = self
            .read_json(&path)
            .await?
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        batch.errors.push(error);
        self.write_json(&path, &batch).await
    }

    async fn latest_batches(&self, limit: usize) -> Result<Vec<IngestionBatch>, StoreError> {
        let mut batches: Vec<IngestionBatch> =
            self.read_dir_json(&self.root.join("batches")).await?;
        batches.sort_by(|a, b| {
            b.week_number
                .cmp(&a.week_number)
                .then(b.submitted_at.cmp(&a.submitted_at))
        });
        batches.truncate(limit);
        Ok(batches)
    }

    async fn max_week_number(&self) -> Result<u32, StoreError> {
        let batches: Vec<IngestionBatch> = self.read_dir_json(&self.root.join("batches")).await?;
        Ok(batches.iter().map(|b| b.week_number).max().unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

/// Runtime-query Postgres back-end; rows carry the serialized document in a
/// JSONB column next to the columns the store filters and sorts on.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to Postgres")?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS students (
                registration_no TEXT PRIMARY KEY,
                active BOOLEAN NOT NULL,
                data JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                student_id TEXT NOT NULL,
                batch_id UUID NOT NULL,
                week_number INT NOT NULL,
                captured_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL,
                PRIMARY KEY (student_id, batch_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS snapshots_student_week
                ON snapshots (student_id, week_number DESC, captured_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batches (
                batch_id UUID PRIMARY KEY,
                week_number INT NOT NULL,
                submitted_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                data JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_batch_for_update(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        batch_id: Uuid,
    ) -> Result<IngestionBatch, StoreError> {
        let row = sqlx::query("SELECT data FROM batches WHERE batch_id = $1 FOR UPDATE")
            .bind(batch_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        let data: serde_json::Value = row.try_get("data")?;
        Ok(serde_json::from_value(data)?)
    }

    async fn store_batch(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        batch: &IngestionBatch,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE batches SET status = $2, data = $3 WHERE batch_id = $1")
            .bind(batch.batch_id)
            .bind(status_str(batch.status))
            .bind(serde_json::to_value(batch)?)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

fn status_str(status: BatchStatus) -> &'static str {
    match status {
        BatchStatus::Pending => "pending",
        BatchStatus::Processing => "processing",
        BatchStatus::Completed => "completed",
        BatchStatus::Failed => "failed",
        BatchStatus::Cancelled => "cancelled",
    }
}

#[async_trait]
impl StudentStore for PgStore {
    async fn upsert_student(&self, student: Student) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO students (registration_no, active, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (registration_no) DO UPDATE
                SET active = EXCLUDED.active, data = EXCLUDED.data
            "#,
        )
        .bind(&student.registration_no)
        .bind(student.active)
        .bind(serde_json::to_value(&student)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn student(&self, registration_no: &str) -> Result<Option<Student>, StoreError> {
        let row = sqlx::query("SELECT data FROM students WHERE registration_no = $1")
            .bind(registration_no)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn active_students(&self) -> Result<Vec<Student>, StoreError> {
        let rows = sqlx::query(
            "SELECT data FROM students WHERE active ORDER BY registration_no",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let data: serde_json::Value = row.try_get("data")?;
            out.push(serde_json::from_value(data)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO snapshots (student_id, batch_id, week_number, captured_at, data)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (student_id, batch_id) DO NOTHING
            "#,
        )
        .bind(&snapshot.student_id)
        .bind(snapshot.batch_id)
        .bind(snapshot.week_number as i32)
        .bind(snapshot.captured_at)
        .bind(serde_json::to_value(&snapshot)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SnapshotExists {
                student_id: snapshot.student_id,
                batch_id: snapshot.batch_id,
            });
        }
        Ok(())
    }

    async fn latest_snapshot(&self, student_id: &str) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.snapshot_history(student_id, 1).await?.into_iter().next())
    }

    async fn snapshot_history(
        &self,
        student_id: &str,
        limit: usize,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM snapshots
             WHERE student_id = $1
             ORDER BY week_number DESC, captured_at DESC
             LIMIT $2
            "#,
        )
        .bind(student_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let data: serde_json::Value = row.try_get("data")?;
            out.push(serde_json::from_value(data)?);
        }
        Ok(out)
    }

    async fn snapshots_for_batch(&self, batch_id: Uuid) -> Result<Vec<Snapshot>, StoreError> {
        let rows = sqlx::query("SELECT data FROM snapshots WHERE batch_id = $1")
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let data: serde_json::Value = row.try_get("data")?;
            out.push(serde_json::from_value(data)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl BatchStore for PgStore {
    async fn create_batch(&self, batch: IngestionBatch) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO batches (batch_id, week_number, submitted_at, status, data)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(batch.batch_id)
        .bind(batch.week_number as i32)
        .bind(batch.submitted_at)
        .bind(status_str(batch.status))
        .bind(serde_json::to_value(&batch)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn batch(&self, batch_id: Uuid) -> Result<Option<IngestionBatch>, StoreError> {
        let row = sqlx::query("SELECT data FROM batches WHERE batch_id = $1")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn set_batch_status(&self, batch_id: Uuid, status: BatchStatus) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut batch = Self::load_batch_for_update(&mut tx, batch_id).await?;
        batch.status = status;
        Self::store_batch(&mut tx, &batch).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_task_outcome(
        &self,
        batch_id: Uuid,
        succeeded: bool,
        error: Option<ErrorRecord>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut batch = Self::load_batch_for_update(&mut tx, batch_id).await?;
        apply_task_outcome(&mut batch, succeeded, error);
        Self::store_batch(&mut tx, &batch).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_batch_error(
        &self,
        batch_id: Uuid,
        error: ErrorRecord,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut batch = Self::load_batch_for_update(&mut tx, batch_id).await?;
        batch.errors.push(error);
        Self::store_batch(&mut tx, &batch).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn latest_batches(&self, limit: usize) -> Result<Vec<IngestionBatch>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM batches
             ORDER BY week_number DESC, submitted_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let data: serde_json::Value = row.try_get("data")?;
            out.push(serde_json::from_value(data)?);
        }
        Ok(out)
    }

    async fn max_week_number(&self) -> Result<u32, StoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(week_number), 0) AS max_week FROM batches")
            .fetch_one(&self.pool)
            .await?;
        let max_week: i32 = row.try_get("max_week")?;
        Ok(max_week.max(0) as u32)
    }
}

// ---------------------------------------------------------------------------
// HTTP fetch utilities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

/// Token bucket on the tokio clock; `take` cooperatively suspends the
/// calling task until a token is available.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out for {url}")]
    Timeout { url: String },
    #[error("transient failure for {url} after {attempts} attempts: {detail}")]
    Transient {
        url: String,
        attempts: usize,
        detail: String,
    },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
}

impl FetchError {
    /// Definitive failures that must not be retried by callers.
    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchError::Status { .. })
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limits: BTreeMap<PlatformId, RateLimit>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
            rate_limits: BTreeMap::new(),
        }
    }
}

/// Shared HTTP client with one token bucket per platform and a bounded
/// retry-with-backoff loop. Platforms without a configured rate limit get
/// a conservative 1 request/second bucket.
pub struct PlatformFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    buckets: HashMap<PlatformId, TokenBucket>,
    backoff: BackoffPolicy,
}

impl PlatformFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        let mut buckets = HashMap::new();
        for platform in PlatformId::ALL {
            let limit = config.rate_limits.get(&platform).copied().unwrap_or(RateLimit {
                capacity: 1,
                refill_every: Duration::from_secs(1),
            });
            buckets.insert(
                platform,
                TokenBucket::new(limit.capacity.max(1), limit.refill_every),
            );
        }

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            buckets,
            backoff: config.backoff,
        })
    }

    pub async fn get_text(&self, platform: PlatformId, url: &str) -> Result<String, FetchError> {
        self.execute(platform, url, || self.client.get(url)).await
    }

    pub async fn post_json(
        &self,
        platform: PlatformId,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<String, FetchError> {
        self.execute(platform, url, || self.client.post(url).json(body))
            .await
    }

    async fn execute<F>(
        &self,
        platform: PlatformId,
        url: &str,
        build: F,
    ) -> Result<String, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        if let Some(bucket) = self.buckets.get(&platform) {
            bucket.take().await;
        }

        let span = info_span!("platform_fetch", platform = platform.as_str(), url);
        let _guard = span.enter();

        let mut last_detail = String::new();
        for attempt in 0..=self.backoff.max_retries {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return resp.text().await.map_err(|err| FetchError::Transient {
                            url: final_url,
                            attempts: attempt + 1,
                            detail: err.to_string(),
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_detail = format!("http status {status}");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    if classify_status(status) == RetryDisposition::Retryable {
                        return Err(FetchError::Transient {
                            url: final_url,
                            attempts: attempt + 1,
                            detail: format!("http status {status}"),
                        });
                    }
                    return Err(FetchError::Status {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_detail = err.to_string();
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    if err.is_timeout() {
                        return Err(FetchError::Timeout {
                            url: url.to_string(),
                        });
                    }
                    return Err(FetchError::Transient {
                        url: url.to_string(),
                        attempts: attempt + 1,
                        detail: err.to_string(),
                    });
                }
            }
        }

        Err(FetchError::Transient {
            url: url.to_string(),
            attempts: self.backoff.max_retries + 1,
            detail: last_detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use spt_core::{
        BatchProgress, ErrorKind, FetchStatus, PerformanceTier, PlatformObservation,
        PlatformStats, TrendLabel,
    };
    use tempfile::tempdir;

    fn sample_snapshot(student_id: &str, batch_id: Uuid, week_number: u32) -> Snapshot {
        Snapshot {
            student_id: student_id.to_string(),
            batch_id,
            week_number,
            week_label: format!("Week {week_number}"),
            captured_at: Utc.with_ymd_and_hms(2026, 8, 2, 23, 59, 0).single().unwrap(),
            observations: vec![PlatformObservation {
                platform: PlatformId::Codeforces,
                stats: PlatformStats {
                    rating: 1400,
                    max_rating: 1500,
                    problems_solved: 50,
                    contests_participated: 12,
                    rank: 900,
                    extra: BTreeMap::new(),
                },
                fetch_status: FetchStatus::Success,
                error_detail: None,
                rating_delta: 0,
                max_rating_delta: 0,
                problems_delta: 0,
                contests_delta: 0,
                rank_delta: 0,
                first_seen: true,
            }],
            aggregate_score: 72.0,
            performance_tier: PerformanceTier::Medium,
            trend: TrendLabel::Up,
            active_platform_count: 1,
        }
    }

    fn sample_batch(week_number: u32) -> IngestionBatch {
        IngestionBatch {
            batch_id: Uuid::new_v4(),
            week_number,
            week_label: format!("Week {week_number}"),
            submitted_at: Utc.with_ymd_and_hms(2026, 8, 2, 23, 59, 0).single().unwrap(),
            total_students: 3,
            status: BatchStatus::Pending,
            progress: BatchProgress::default(),
            errors: Vec::new(),
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retryable_statuses_are_5xx_and_throttling() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_spaces_out_takes() {
        let bucket = TokenBucket::new(1, Duration::from_secs(1));
        let started = Instant::now();
        for _ in 0..5 {
            bucket.take().await;
        }
        // First token is free; the remaining four each wait a refill.
        assert!(started.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_allows_bursts_up_to_capacity() {
        let bucket = TokenBucket::new(3, Duration::from_secs(1));
        let started = Instant::now();
        for _ in 0..3 {
            bucket.take().await;
        }
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn memory_store_snapshot_round_trip_and_immutability() {
        let store = MemoryStore::new();
        let batch_id = Uuid::new_v4();
        let snapshot = sample_snapshot("REG001", batch_id, 1);

        store.save_snapshot(snapshot.clone()).await.unwrap();
        let latest = store.latest_snapshot("REG001").await.unwrap().unwrap();
        assert_eq!(latest, snapshot);

        let err = store.save_snapshot(snapshot).await.unwrap_err();
        assert!(matches!(err, StoreError::SnapshotExists { .. }));
    }

    #[tokio::test]
    async fn memory_store_history_is_most_recent_first() {
        let store = MemoryStore::new();
        for week in 1..=3 {
            store
                .save_snapshot(sample_snapshot("REG001", Uuid::new_v4(), week))
                .await
                .unwrap();
        }
        let history = store.snapshot_history("REG001", 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].week_number, 3);
        assert_eq!(history[1].week_number, 2);
    }

    #[tokio::test]
    async fn memory_store_progress_counters_stay_consistent() {
        let store = MemoryStore::new();
        let batch = sample_batch(1);
        let batch_id = batch.batch_id;
        store.create_batch(batch).await.unwrap();

        store.record_task_outcome(batch_id, true, None).await.unwrap();
        store
            .record_task_outcome(
                batch_id,
                false,
                Some(ErrorRecord {
                    kind: ErrorKind::Timeout,
                    message: "task timed out".to_string(),
                    student_id: Some("REG002".to_string()),
                    platform: None,
                    timestamp: Utc::now(),
                }),
            )
            .await
            .unwrap();

        let batch = store.batch(batch_id).await.unwrap().unwrap();
        assert_eq!(batch.progress.processed, 2);
        assert_eq!(
            batch.progress.succeeded + batch.progress.failed,
            batch.progress.processed
        );
        assert_eq!(batch.errors.len(), 1);
    }

    #[tokio::test]
    async fn memory_store_tracks_max_week_number() {
        let store = MemoryStore::new();
        assert_eq!(store.max_week_number().await.unwrap(), 0);
        store.create_batch(sample_batch(1)).await.unwrap();
        store.create_batch(sample_batch(4)).await.unwrap();
        assert_eq!(store.max_week_number().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn file_store_snapshot_round_trip_and_immutability() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let snapshot = sample_snapshot("REG001", Uuid::new_v4(), 1);

        store.save_snapshot(snapshot.clone()).await.unwrap();
        let latest = store.latest_snapshot("REG001").await.unwrap().unwrap();
        assert_eq!(latest, snapshot);

        let err = store.save_snapshot(snapshot).await.unwrap_err();
        assert!(matches!(err, StoreError::SnapshotExists { .. }));
    }

    #[tokio::test]
    async fn file_store_batch_progress_persists() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let batch = sample_batch(2);
        let batch_id = batch.batch_id;
        store.create_batch(batch).await.unwrap();
        store.set_batch_status(batch_id, BatchStatus::Processing).await.unwrap();
        store.record_task_outcome(batch_id, true, None).await.unwrap();

        let reloaded = store.batch(batch_id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, BatchStatus::Processing);
        assert_eq!(reloaded.progress.processed, 1);
        assert_eq!(reloaded.progress.succeeded, 1);
        assert_eq!(store.max_week_number().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn file_store_upserts_students_and_lists_active_only() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let mut student = Student {
            registration_no: "REG001".to_string(),
            name: "Priya Sharma".to_string(),
            group: "A".to_string(),
            cohort: "2027".to_string(),
            active: true,
            handles: BTreeMap::new(),
        };
        store.upsert_student(student.clone()).await.unwrap();
        student.active = false;
        store.upsert_student(student.clone()).await.unwrap();

        assert!(store.active_students().await.unwrap().is_empty());
        let reloaded = store.student("REG001").await.unwrap().unwrap();
        assert!(!reloaded.active);
    }
}
