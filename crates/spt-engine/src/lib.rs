//! Ingestion pipeline orchestration: batch submission, bounded worker pool,
//! reconciliation/scoring, weekly trigger, and report export.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use spt_core::{
    BatchProgress, BatchStatus, ComparisonSummary, ErrorKind, ErrorRecord, FetchStatus,
    IngestionBatch, PerformanceTier, PlatformId, PlatformObservation, PlatformStats, Snapshot,
    Student, StudentComparison, StudentRecord, TrendLabel,
};
use spt_platforms::{client_for, default_base_url, PlatformClient};
use spt_store::{
    store_from_env, BatchStore, FetcherConfig, PlatformFetcher, RateLimit, SnapshotStore, Store,
    StoreError, StudentStore,
};

pub const CRATE_NAME: &str = "spt-engine";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Scoring constants. The formula shape is fixed; these constants are the
/// configuration surface.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub rating_divisor: f64,
    pub rating_cap: f64,
    pub problems_divisor: f64,
    pub problems_cap: f64,
    pub contests_multiplier: f64,
    pub contests_cap: f64,
    pub high_threshold: f64,
    pub medium_threshold: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            rating_divisor: 20.0,
            rating_cap: 40.0,
            problems_divisor: 5.0,
            problems_cap: 40.0,
            contests_multiplier: 2.0,
            contests_cap: 20.0,
            high_threshold: 80.0,
            medium_threshold: 50.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker_count: usize,
    pub max_batch_size: usize,
    pub stagger: Duration,
    pub task_timeout: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    /// `None` disables post-batch report export.
    pub reports_dir: Option<PathBuf>,
    pub registry_path: PathBuf,
    pub scheduler_enabled: bool,
    pub weekly_cron: String,
    pub weights: ScoreWeights,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            max_batch_size: 500,
            stagger: Duration::from_millis(200),
            task_timeout: Duration::from_secs(60),
            http_timeout: Duration::from_secs(15),
            user_agent: "spt-bot/0.1".to_string(),
            reports_dir: Some(PathBuf::from("./reports")),
            registry_path: PathBuf::from("platforms.yaml"),
            scheduler_enabled: false,
            weekly_cron: "0 59 23 * * Sun".to_string(),
            weights: ScoreWeights::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_count: env_parse("SPT_WORKER_COUNT", defaults.worker_count),
            max_batch_size: env_parse("SPT_MAX_BATCH_SIZE", defaults.max_batch_size),
            stagger: Duration::from_millis(env_parse("SPT_STAGGER_MS", 200)),
            task_timeout: Duration::from_secs(env_parse("SPT_TASK_TIMEOUT_SECS", 60)),
            http_timeout: Duration::from_secs(env_parse("SPT_HTTP_TIMEOUT_SECS", 15)),
            user_agent: std::env::var("SPT_USER_AGENT")
                .unwrap_or_else(|_| defaults.user_agent.clone()),
            reports_dir: Some(
                std::env::var("SPT_REPORTS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./reports")),
            ),
            registry_path: std::env::var("SPT_PLATFORMS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| defaults.registry_path.clone()),
            scheduler_enabled: std::env::var("SPT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            weekly_cron: std::env::var("SPT_WEEKLY_CRON")
                .unwrap_or_else(|_| defaults.weekly_cron.clone()),
            weights: ScoreWeights::default(),
        }
    }
}

/// Per-platform settings loaded from `platforms.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformRegistry {
    pub platforms: Vec<PlatformConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    pub platform: PlatformId,
    pub enabled: bool,
    pub mode: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_rate_capacity")]
    pub rate_capacity: u32,
    #[serde(default = "default_refill_ms")]
    pub refill_ms: u64,
}

fn default_rate_capacity() -> u32 {
    1
}

fn default_refill_ms() -> u64 {
    1_000
}

impl PlatformRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Registry file is optional; the built-in defaults enable every known
    /// platform, scraped ones at roughly 1 request/second.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        Ok(Self::default())
    }

    pub fn rate_limits(&self) -> BTreeMap<PlatformId, RateLimit> {
        self.platforms
            .iter()
            .map(|p| {
                (
                    p.platform,
                    RateLimit {
                        capacity: p.rate_capacity,
                        refill_every: Duration::from_millis(p.refill_ms),
                    },
                )
            })
            .collect()
    }

    pub fn build_clients(&self) -> BTreeMap<PlatformId, Arc<dyn PlatformClient>> {
        self.platforms
            .iter()
            .filter(|p| p.enabled)
            .map(|p| {
                let base = p
                    .base_url
                    .clone()
                    .unwrap_or_else(|| default_base_url(p.platform).to_string());
                (p.platform, client_for(p.platform, &base))
            })
            .collect()
    }
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        let scraped = |platform| PlatformConfig {
            platform,
            enabled: true,
            mode: "scrape".to_string(),
            base_url: None,
            rate_capacity: 1,
            refill_ms: 1_000,
        };
        Self {
            platforms: vec![
                PlatformConfig {
                    platform: PlatformId::Codeforces,
                    enabled: true,
                    mode: "api".to_string(),
                    base_url: None,
                    rate_capacity: 5,
                    refill_ms: 1_000,
                },
                PlatformConfig {
                    platform: PlatformId::Leetcode,
                    enabled: true,
                    mode: "api".to_string(),
                    base_url: None,
                    rate_capacity: 3,
                    refill_ms: 1_000,
                },
                scraped(PlatformId::Codechef),
                scraped(PlatformId::Hackerrank),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciliation / scoring
// ---------------------------------------------------------------------------

/// Result of one platform fetch attempt before reconciliation.
#[derive(Debug, Clone)]
pub struct ObservationInput {
    pub platform: PlatformId,
    pub outcome: FetchOutcome,
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Success(PlatformStats),
    Failed { kind: ErrorKind, detail: String },
    Skipped,
}

// Deltas are taken against the prior snapshot's successful observation for
// the platform; prior failed/skipped observations carry no real data.
fn prior_success(prior: Option<&Snapshot>, platform: PlatformId) -> Option<&PlatformObservation> {
    prior.and_then(|snapshot| {
        snapshot
            .observations
            .iter()
            .find(|o| o.platform == platform && o.fetch_status == FetchStatus::Success)
    })
}

pub fn platform_score(stats: &PlatformStats, weights: &ScoreWeights) -> f64 {
    let rating = (stats.rating.max(0) as f64 / weights.rating_divisor).min(weights.rating_cap);
    let problems =
        (stats.problems_solved as f64 / weights.problems_divisor).min(weights.problems_cap);
    let contests =
        (stats.contests_participated as f64 * weights.contests_multiplier).min(weights.contests_cap);
    (rating + problems + contests).clamp(0.0, 100.0)
}

pub fn tier_for_score(score: f64, weights: &ScoreWeights) -> PerformanceTier {
    if score >= weights.high_threshold {
        PerformanceTier::High
    } else if score >= weights.medium_threshold {
        PerformanceTier::Medium
    } else {
        PerformanceTier::Low
    }
}

/// Combine current fetch results with the student's prior snapshot into a
/// fully populated snapshot. Pure: no I/O, no hidden state; the same inputs
/// always produce the same snapshot.
///
/// Trend with no prior snapshot: `Up` when this run produced the student's
/// first successful data, `Stable` otherwise.
#[allow(clippy::too_many_arguments)]
pub fn reconcile(
    student_id: &str,
    batch_id: Uuid,
    week_number: u32,
    week_label: &str,
    captured_at: DateTime<Utc>,
    inputs: &[ObservationInput],
    prior: Option<&Snapshot>,
    weights: &ScoreWeights,
) -> Snapshot {
    let mut observations = Vec::with_capacity(inputs.len());
    let mut score_sum = 0.0;
    let mut success_count = 0u32;

    for input in inputs {
        let observation = match &input.outcome {
            FetchOutcome::Success(stats) => {
                score_sum += platform_score(stats, weights);
                success_count += 1;
                match prior_success(prior, input.platform) {
                    Some(prior_obs) => PlatformObservation {
                        platform: input.platform,
                        stats: stats.clone(),
                        fetch_status: FetchStatus::Success,
                        error_detail: None,
                        rating_delta: stats.rating - prior_obs.stats.rating,
                        max_rating_delta: stats.max_rating - prior_obs.stats.max_rating,
                        problems_delta: stats.problems_solved as i64
                            - prior_obs.stats.problems_solved as i64,
                        contests_delta: stats.contests_participated as i64
                            - prior_obs.stats.contests_participated as i64,
                        rank_delta: prior_obs.stats.rank as i64 - stats.rank as i64,
                        first_seen: false,
                    },
                    None => PlatformObservation {
                        platform: input.platform,
                        stats: stats.clone(),
                        fetch_status: FetchStatus::Success,
                        error_detail: None,
                        rating_delta: stats.rating,
                        max_rating_delta: stats.max_rating,
                        problems_delta: stats.problems_solved as i64,
                        contests_delta: stats.contests_participated as i64,
                        rank_delta: 0,
                        first_seen: true,
                    },
                }
            }
            FetchOutcome::Failed { detail, .. } => PlatformObservation {
                platform: input.platform,
                stats: PlatformStats::default(),
                fetch_status: FetchStatus::Failed,
                error_detail: Some(detail.clone()),
                rating_delta: 0,
                max_rating_delta: 0,
                problems_delta: 0,
                contests_delta: 0,
                rank_delta: 0,
                first_seen: false,
            },
            FetchOutcome::Skipped => PlatformObservation {
                platform: input.platform,
                stats: PlatformStats::default(),
                fetch_status: FetchStatus::Skipped,
                error_detail: None,
                rating_delta: 0,
                max_rating_delta: 0,
                problems_delta: 0,
                contests_delta: 0,
                rank_delta: 0,
                first_seen: false,
            },
        };
        observations.push(observation);
    }

    let aggregate_score = if success_count > 0 {
        score_sum / success_count as f64
    } else {
        0.0
    };

    let trend = match prior {
        Some(prior_snapshot) => {
            if aggregate_score > prior_snapshot.aggregate_score {
                TrendLabel::Up
            } else if aggregate_score < prior_snapshot.aggregate_score {
                TrendLabel::Down
            } else {
                TrendLabel::Stable
            }
        }
        None if success_count > 0 => TrendLabel::Up,
        None => TrendLabel::Stable,
    };

    Snapshot {
        student_id: student_id.to_string(),
        batch_id,
        week_number,
        week_label: week_label.to_string(),
        captured_at,
        observations,
        aggregate_score,
        performance_tier: tier_for_score(aggregate_score, weights),
        trend,
        active_platform_count: success_count,
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("batch must contain at least one student")]
    EmptyBatch,
    #[error("batch of {len} students exceeds the configured maximum of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("storage unavailable: {0}")]
    Infrastructure(#[from] StoreError),
}

/// Status-query view: the batch plus derived presentation fields.
#[derive(Debug, Clone, Serialize)]
pub struct BatchStatusView {
    pub batch_id: Uuid,
    pub week_number: u32,
    pub week_label: String,
    pub status: BatchStatus,
    pub total_students: u32,
    pub progress: BatchProgress,
    pub percent_complete: f64,
    pub recent_errors: Vec<ErrorRecord>,
}

impl BatchStatusView {
    fn from_batch(batch: &IngestionBatch) -> Self {
        Self {
            batch_id: batch.batch_id,
            week_number: batch.week_number,
            week_label: batch.week_label.clone(),
            status: batch.status,
            total_students: batch.total_students,
            progress: batch.progress,
            percent_complete: batch.percent_complete(),
            recent_errors: batch.recent_errors(10).to_vec(),
        }
    }
}

struct BatchHandle {
    cancel: CancellationToken,
    done: Arc<Notify>,
}

/// Owns the IngestionBatch lifecycle: one shared bounded worker pool across
/// all batches, one task per student, failures isolated per student.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    fetcher: Arc<PlatformFetcher>,
    clients: BTreeMap<PlatformId, Arc<dyn PlatformClient>>,
    workers: Arc<Semaphore>,
    // Serializes week sequencing relative to concurrent submits.
    submit_serial: Mutex<()>,
    live: Mutex<HashMap<Uuid, BatchHandle>>,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        fetcher: Arc<PlatformFetcher>,
        clients: BTreeMap<PlatformId, Arc<dyn PlatformClient>>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            fetcher,
            clients,
            workers: Arc::new(Semaphore::new(config.worker_count.max(1))),
            submit_serial: Mutex::new(()),
            live: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Validate, persist and start processing a batch. Returns synchronously
    /// with the batch id; processing continues in the background.
    pub async fn submit(self: &Arc<Self>, records: Vec<StudentRecord>) -> Result<Uuid, SubmitError> {
        if records.is_empty() {
            return Err(SubmitError::EmptyBatch);
        }
        if records.len() > self.config.max_batch_size {
            return Err(SubmitError::TooLarge {
                len: records.len(),
                max: self.config.max_batch_size,
            });
        }

        let mut students = Vec::with_capacity(records.len());
        for record in records {
            let student = record.into_student();
            self.store.upsert_student(student.clone()).await?;
            students.push(student);
        }

        // Week sequencing and batch creation must be atomic relative to
        // other submits, or two batches could share a week number.
        let batch = {
            let _serial = self.submit_serial.lock().await;
            let week_number = self.store.max_week_number().await? + 1;
            let batch = IngestionBatch {
                batch_id: Uuid::new_v4(),
                week_number,
                week_label: format!("Week {week_number}"),
                submitted_at: Utc::now(),
                total_students: students.len() as u32,
                status: BatchStatus::Pending,
                progress: BatchProgress::default(),
                errors: Vec::new(),
            };
            self.store.create_batch(batch.clone()).await?;
            batch
        };

        self.store
            .set_batch_status(batch.batch_id, BatchStatus::Processing)
            .await?;

        let cancel = CancellationToken::new();
        let done = Arc::new(Notify::new());
        self.live.lock().await.insert(
            batch.batch_id,
            BatchHandle {
                cancel: cancel.clone(),
                done: done.clone(),
            },
        );

        let batch_id = batch.batch_id;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.drive_batch(batch, students, cancel).await;
        });

        Ok(batch_id)
    }

    pub async fn status(&self, batch_id: Uuid) -> Result<Option<BatchStatusView>, StoreError> {
        Ok(self
            .store
            .batch(batch_id)
            .await?
            .map(|batch| BatchStatusView::from_batch(&batch)))
    }

    /// Cancel a live batch. Tasks not yet started are dropped; tasks already
    /// executing a platform call run to completion but their results are
    /// discarded before the snapshot write.
    pub async fn cancel(&self, batch_id: Uuid) -> Result<bool, StoreError> {
        let cancelled = {
            let live = self.live.lock().await;
            match live.get(&batch_id) {
                Some(handle) => {
                    handle.cancel.cancel();
                    true
                }
                None => false,
            }
        };
        if cancelled {
            self.store
                .set_batch_status(batch_id, BatchStatus::Cancelled)
                .await?;
        }
        Ok(cancelled)
    }

    /// Block until the batch has fully resolved (all tasks drained). Returns
    /// immediately for unknown or already-finished batches.
    pub async fn wait_for(&self, batch_id: Uuid) {
        loop {
            let done = {
                let live = self.live.lock().await;
                match live.get(&batch_id) {
                    Some(handle) => handle.done.clone(),
                    None => return,
                }
            };
            let notified = done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.live.lock().await.contains_key(&batch_id) {
                return;
            }
            notified.await;
        }
    }

    async fn drive_batch(
        self: Arc<Self>,
        batch: IngestionBatch,
        students: Vec<Student>,
        cancel: CancellationToken,
    ) {
        let infra_failed = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();
        for (index, student) in students.into_iter().enumerate() {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            let infra_failed = Arc::clone(&infra_failed);
            let batch_id = batch.batch_id;
            let week_number = batch.week_number;
            let week_label = batch.week_label.clone();
            let stagger = this.config.stagger;
            tasks.spawn(async move {
                tokio::time::sleep(stagger * index as u32).await;
                if cancel.is_cancelled() {
                    return;
                }
                let permit = this.workers.clone().acquire_owned().await;
                let _permit = match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                if cancel.is_cancelled() {
                    return;
                }
                this.run_student_task(
                    batch_id,
                    week_number,
                    &week_label,
                    student,
                    &cancel,
                    &infra_failed,
                )
                .await;
            });
        }
        while tasks.join_next().await.is_some() {}

        if !cancel.is_cancelled() && !infra_failed.load(Ordering::SeqCst) {
            if let Err(err) = self
                .store
                .set_batch_status(batch.batch_id, BatchStatus::Completed)
                .await
            {
                warn!(batch_id = %batch.batch_id, error = %err, "failed to mark batch completed");
            } else if let Some(reports_dir) = self.config.reports_dir.clone() {
                match self.export_batch_reports(&reports_dir, batch.batch_id).await {
                    Ok(dir) => info!(batch_id = %batch.batch_id, dir = %dir.display(), "batch reports written"),
                    Err(err) => warn!(batch_id = %batch.batch_id, error = %err, "failed to write batch reports"),
                }
            }
        }

        let mut live = self.live.lock().await;
        if let Some(handle) = live.remove(&batch.batch_id) {
            handle.done.notify_waiters();
        }
    }

    async fn run_student_task(
        &self,
        batch_id: Uuid,
        week_number: u32,
        week_label: &str,
        student: Student,
        cancel: &CancellationToken,
        infra_failed: &AtomicBool,
    ) {
        let student_id = student.registration_no.clone();
        let collected = tokio::time::timeout(
            self.config.task_timeout,
            self.collect_observations(&student),
        )
        .await;

        let (inputs, platform_errors) = match collected {
            Ok(result) => result,
            Err(_) => {
                if cancel.is_cancelled() {
                    return;
                }
                let record = ErrorRecord {
                    kind: ErrorKind::Timeout,
                    message: format!(
                        "student task exceeded {}s wall clock",
                        self.config.task_timeout.as_secs()
                    ),
                    student_id: Some(student_id.clone()),
                    platform: None,
                    timestamp: Utc::now(),
                };
                if let Err(err) = self
                    .store
                    .record_task_outcome(batch_id, false, Some(record))
                    .await
                {
                    self.flag_infrastructure(batch_id, cancel, infra_failed, err).await;
                }
                return;
            }
        };

        // Cancelled while the fetches were in flight: discard the results.
        if cancel.is_cancelled() {
            return;
        }

        let prior = match self.store.latest_snapshot(&student_id).await {
            Ok(prior) => prior,
            Err(err) => {
                self.flag_infrastructure(batch_id, cancel, infra_failed, err).await;
                return;
            }
        };

        let snapshot = reconcile(
            &student_id,
            batch_id,
            week_number,
            week_label,
            Utc::now(),
            &inputs,
            prior.as_ref(),
            &self.config.weights,
        );

        if cancel.is_cancelled() {
            return;
        }

        if let Err(err) = self.store.save_snapshot(snapshot).await {
            match err {
                StoreError::SnapshotExists { .. } => {
                    // Duplicate dispatch for the same student; count once.
                    warn!(batch_id = %batch_id, student_id = %student_id, "snapshot already present, discarding duplicate");
                }
                err => {
                    self.flag_infrastructure(batch_id, cancel, infra_failed, err).await;
                    return;
                }
            }
        }

        for record in platform_errors {
            if let Err(err) = self.store.record_batch_error(batch_id, record).await {
                self.flag_infrastructure(batch_id, cancel, infra_failed, err).await;
                return;
            }
        }
        if let Err(err) = self.store.record_task_outcome(batch_id, true, None).await {
            self.flag_infrastructure(batch_id, cancel, infra_failed, err).await;
        }
    }

    /// One fetch per registered platform, serialized within the student's
    /// task so no two fetches for the same (student, platform) ever overlap.
    async fn collect_observations(
        &self,
        student: &Student,
    ) -> (Vec<ObservationInput>, Vec<ErrorRecord>) {
        let mut inputs = Vec::with_capacity(self.clients.len());
        let mut errors = Vec::new();
        for (platform, client) in &self.clients {
            let Some(username) = student.handles.get(platform) else {
                inputs.push(ObservationInput {
                    platform: *platform,
                    outcome: FetchOutcome::Skipped,
                });
                continue;
            };
            match client.fetch(&self.fetcher, username).await {
                Ok(stats) => inputs.push(ObservationInput {
                    platform: *platform,
                    outcome: FetchOutcome::Success(stats),
                }),
                Err(err) => {
                    let kind = err.error_kind();
                    let message = err.to_string();
                    inputs.push(ObservationInput {
                        platform: *platform,
                        outcome: FetchOutcome::Failed {
                            kind,
                            detail: message.clone(),
                        },
                    });
                    errors.push(ErrorRecord {
                        kind,
                        message,
                        student_id: Some(student.registration_no.clone()),
                        platform: Some(*platform),
                        timestamp: Utc::now(),
                    });
                }
            }
        }
        (inputs, errors)
    }

    /// Storage failures are batch-level fatal: stop dispatching, mark the
    /// batch failed, and record what happened (best effort).
    async fn flag_infrastructure(
        &self,
        batch_id: Uuid,
        cancel: &CancellationToken,
        infra_failed: &AtomicBool,
        err: StoreError,
    ) {
        warn!(batch_id = %batch_id, error = %err, "infrastructure failure, aborting batch");
        infra_failed.store(true, Ordering::SeqCst);
        cancel.cancel();
        let record = ErrorRecord {
            kind: ErrorKind::Infrastructure,
            message: err.to_string(),
            student_id: None,
            platform: None,
            timestamp: Utc::now(),
        };
        if let Err(err) = self.store.record_batch_error(batch_id, record).await {
            warn!(batch_id = %batch_id, error = %err, "failed to record infrastructure error");
        }
        if let Err(err) = self
            .store
            .set_batch_status(batch_id, BatchStatus::Failed)
            .await
        {
            warn!(batch_id = %batch_id, error = %err, "failed to mark batch failed");
        }
    }

    async fn export_batch_reports(&self, reports_dir: &Path, batch_id: Uuid) -> Result<PathBuf> {
        let batch = self
            .store
            .batch(batch_id)
            .await?
            .with_context(|| format!("batch {batch_id} missing during report export"))?;
        let snapshots = self.store.snapshots_for_batch(batch_id).await?;
        write_reports(reports_dir, &batch, &snapshots).await
    }
}

// ---------------------------------------------------------------------------
// Batch comparison
// ---------------------------------------------------------------------------

/// Join two batches' snapshots by student and summarize score movement.
/// With no explicit ids, compares the two most recent batches. A student
/// present only in the later batch counts as unchanged with no delta.
pub async fn compare_batches(
    store: &dyn Store,
    batch_a: Option<Uuid>,
    batch_b: Option<Uuid>,
) -> Result<ComparisonSummary> {
    let (earlier, later) = match (batch_a, batch_b) {
        (Some(a), Some(b)) => {
            let batch_a = store
                .batch(a)
                .await?
                .with_context(|| format!("batch {a} not found"))?;
            let batch_b = store
                .batch(b)
                .await?
                .with_context(|| format!("batch {b} not found"))?;
            if batch_a.week_number <= batch_b.week_number {
                (batch_a, batch_b)
            } else {
                (batch_b, batch_a)
            }
        }
        _ => {
            let recent = store.latest_batches(2).await?;
            if recent.len() < 2 {
                anyhow::bail!("need at least two batches to compare");
            }
            // latest_batches is most-recent-first.
            (recent[1].clone(), recent[0].clone())
        }
    };

    let earlier_by_student: HashMap<String, f64> = store
        .snapshots_for_batch(earlier.batch_id)
        .await?
        .into_iter()
        .map(|s| (s.student_id, s.aggregate_score))
        .collect();

    let mut students = Vec::new();
    let (mut improved, mut declined, mut unchanged) = (0u32, 0u32, 0u32);
    let mut later_snapshots = store.snapshots_for_batch(later.batch_id).await?;
    later_snapshots.sort_by(|a, b| a.student_id.cmp(&b.student_id));

    for snapshot in later_snapshots {
        let earlier_score = earlier_by_student.get(&snapshot.student_id).copied();
        let score_delta = earlier_score.map(|e| snapshot.aggregate_score - e);
        match score_delta {
            Some(delta) if delta > 0.0 => improved += 1,
            Some(delta) if delta < 0.0 => declined += 1,
            _ => unchanged += 1,
        }
        students.push(StudentComparison {
            student_id: snapshot.student_id,
            earlier_score,
            later_score: snapshot.aggregate_score,
            score_delta,
        });
    }

    Ok(ComparisonSummary {
        earlier_batch: earlier.batch_id,
        later_batch: later.batch_id,
        improved,
        declined,
        unchanged,
        students,
    })
}

// ---------------------------------------------------------------------------
// Weekly trigger + scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("a triggered run is already in progress")]
    AlreadyRunning,
    #[error("no active students to ingest")]
    EmptyRoster,
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("storage unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Re-submits the full active roster as a new batch, on a cron schedule or
/// on demand. The is-running flag stops overlapping runs from racing on the
/// same week number.
pub struct WeeklyTrigger {
    orchestrator: Arc<Orchestrator>,
    running: AtomicBool,
}

impl WeeklyTrigger {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            running: AtomicBool::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn run(self: &Arc<Self>) -> Result<Uuid, TriggerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TriggerError::AlreadyRunning);
        }

        let result = self.run_inner().await;
        if result.is_err() {
            self.running.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn run_inner(self: &Arc<Self>) -> Result<Uuid, TriggerError> {
        let roster = self.orchestrator.store().active_students().await?;
        if roster.is_empty() {
            return Err(TriggerError::EmptyRoster);
        }
        let records = roster.into_iter().map(roster_record).collect();
        let batch_id = self.orchestrator.submit(records).await?;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.orchestrator.wait_for(batch_id).await;
            this.running.store(false, Ordering::SeqCst);
        });
        Ok(batch_id)
    }
}

fn roster_record(student: Student) -> StudentRecord {
    StudentRecord {
        registration_no: student.registration_no,
        name: student.name,
        group: student.group,
        cohort: student.cohort,
        handles: student.handles,
    }
}

pub async fn maybe_build_scheduler(
    trigger: Arc<WeeklyTrigger>,
    config: &EngineConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.weekly_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let trigger = trigger.clone();
        Box::pin(async move {
            match trigger.run().await {
                Ok(batch_id) => info!(%batch_id, "scheduled weekly ingestion submitted"),
                Err(TriggerError::AlreadyRunning) => {
                    warn!("skipping scheduled run; previous run still in progress")
                }
                Err(err) => warn!(error = %err, "scheduled weekly ingestion failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

// ---------------------------------------------------------------------------
// Report export
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn tier_str(tier: PerformanceTier) -> &'static str {
    match tier {
        PerformanceTier::High => "high",
        PerformanceTier::Medium => "medium",
        PerformanceTier::Low => "low",
    }
}

fn trend_str(trend: TrendLabel) -> &'static str {
    match trend {
        TrendLabel::Up => "up",
        TrendLabel::Down => "down",
        TrendLabel::Stable => "stable",
    }
}

fn status_str(status: FetchStatus) -> &'static str {
    match status {
        FetchStatus::Success => "success",
        FetchStatus::Failed => "failed",
        FetchStatus::Skipped => "skipped",
    }
}

/// Emit the per-batch report directory: markdown brief, full JSON delta,
/// Parquet snapshot tables and a sha256 manifest.
pub async fn write_reports(
    reports_root: &Path,
    batch: &IngestionBatch,
    snapshots: &[Snapshot],
) -> Result<PathBuf> {
    let reports_dir = reports_root.join(batch.batch_id.to_string());
    tokio::fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let mut tier_counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut trend_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for snapshot in snapshots {
        *tier_counts.entry(tier_str(snapshot.performance_tier)).or_default() += 1;
        *trend_counts.entry(trend_str(snapshot.trend)).or_default() += 1;
    }

    let brief = format!(
        "# {} Ingestion Brief\n\n- Batch ID: `{}`\n- Submitted: {}\n- Students: {} (processed {}, succeeded {}, failed {})\n- Snapshots: {}\n\n## Tiers\n{}\n\n## Trends\n{}\n",
        batch.week_label,
        batch.batch_id,
        batch.submitted_at,
        batch.total_students,
        batch.progress.processed,
        batch.progress.succeeded,
        batch.progress.failed,
        snapshots.len(),
        tier_counts
            .iter()
            .map(|(k, v)| format!("- {k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n"),
        trend_counts
            .iter()
            .map(|(k, v)| format!("- {k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n"),
    );
    tokio::fs::write(reports_dir.join("batch_summary.md"), brief)
        .await
        .context("writing batch_summary.md")?;

    let delta_json = serde_json::to_vec_pretty(&serde_json::json!({
        "batch": batch,
        "snapshots": snapshots,
    }))
    .context("serializing snapshots delta")?;
    tokio::fs::write(reports_dir.join("snapshots_delta.json"), delta_json)
        .await
        .context("writing snapshots_delta.json")?;

    let snapshot_dir = reports_dir.join("snapshots");
    tokio::fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let snapshots_path = snapshot_dir.join("snapshots.parquet");
    let observations_path = snapshot_dir.join("observations.parquet");
    write_snapshots_parquet(&snapshots_path, snapshots)?;
    write_observations_parquet(&observations_path, snapshots)?;

    let manifest = ReportManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("snapshots", &reports_dir, &snapshots_path)?,
            manifest_entry("observations", &reports_dir, &observations_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    tokio::fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(reports_dir)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_snapshots_parquet(path: &Path, snapshots: &[Snapshot]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("student_id", DataType::Utf8, false),
        ArrowField::new("week_number", DataType::UInt32, false),
        ArrowField::new("aggregate_score", DataType::Float64, false),
        ArrowField::new("performance_tier", DataType::Utf8, false),
        ArrowField::new("trend", DataType::Utf8, false),
        ArrowField::new("active_platform_count", DataType::UInt32, false),
    ]));

    let student_ids = StringArray::from(
        snapshots
            .iter()
            .map(|s| Some(s.student_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let week_numbers = UInt32Array::from(snapshots.iter().map(|s| s.week_number).collect::<Vec<_>>());
    let scores = Float64Array::from(snapshots.iter().map(|s| s.aggregate_score).collect::<Vec<_>>());
    let tiers = StringArray::from(
        snapshots
            .iter()
            .map(|s| Some(tier_str(s.performance_tier)))
            .collect::<Vec<_>>(),
    );
    let trends = StringArray::from(
        snapshots
            .iter()
            .map(|s| Some(trend_str(s.trend)))
            .collect::<Vec<_>>(),
    );
    let platform_counts = UInt32Array::from(
        snapshots
            .iter()
            .map(|s| s.active_platform_count)
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(student_ids),
            Arc::new(week_numbers),
            Arc::new(scores),
            Arc::new(tiers),
            Arc::new(trends),
            Arc::new(platform_counts),
        ],
    )
    .context("building snapshots record batch")?;
    write_parquet(path, batch)
}

fn write_observations_parquet(path: &Path, snapshots: &[Snapshot]) -> Result<()> {
    let rows: Vec<(&Snapshot, &PlatformObservation)> = snapshots
        .iter()
        .flat_map(|s| s.observations.iter().map(move |o| (s, o)))
        .collect();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("student_id", DataType::Utf8, false),
        ArrowField::new("platform", DataType::Utf8, false),
        ArrowField::new("fetch_status", DataType::Utf8, false),
        ArrowField::new("rating", DataType::Int64, false),
        ArrowField::new("max_rating", DataType::Int64, false),
        ArrowField::new("problems_solved", DataType::UInt64, false),
        ArrowField::new("contests_participated", DataType::UInt64, false),
        ArrowField::new("rank", DataType::UInt64, false),
        ArrowField::new("rating_delta", DataType::Int64, false),
        ArrowField::new("problems_delta", DataType::Int64, false),
    ]));

    let student_ids = StringArray::from(
        rows.iter()
            .map(|(s, _)| Some(s.student_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let platforms = StringArray::from(
        rows.iter()
            .map(|(_, o)| Some(o.platform.as_str()))
            .collect::<Vec<_>>(),
    );
    let statuses = StringArray::from(
        rows.iter()
            .map(|(_, o)| Some(status_str(o.fetch_status)))
            .collect::<Vec<_>>(),
    );
    let ratings = Int64Array::from(rows.iter().map(|(_, o)| o.stats.rating).collect::<Vec<_>>());
    let max_ratings =
        Int64Array::from(rows.iter().map(|(_, o)| o.stats.max_rating).collect::<Vec<_>>());
    let problems = UInt64Array::from(
        rows.iter()
            .map(|(_, o)| o.stats.problems_solved)
            .collect::<Vec<_>>(),
    );
    let contests = UInt64Array::from(
        rows.iter()
            .map(|(_, o)| o.stats.contests_participated)
            .collect::<Vec<_>>(),
    );
    let ranks = UInt64Array::from(rows.iter().map(|(_, o)| o.stats.rank).collect::<Vec<_>>());
    let rating_deltas =
        Int64Array::from(rows.iter().map(|(_, o)| o.rating_delta).collect::<Vec<_>>());
    let problems_deltas =
        Int64Array::from(rows.iter().map(|(_, o)| o.problems_delta).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(student_ids),
            Arc::new(platforms),
            Arc::new(statuses),
            Arc::new(ratings),
            Arc::new(max_ratings),
            Arc::new(problems),
            Arc::new(contests),
            Arc::new(ranks),
            Arc::new(rating_deltas),
            Arc::new(problems_deltas),
        ],
    )
    .context("building observations record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ReportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ReportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub struct Pipeline {
    pub orchestrator: Arc<Orchestrator>,
    pub trigger: Arc<WeeklyTrigger>,
    pub config: EngineConfig,
}

/// Construct the full pipeline from environment + registry file: store,
/// rate-limited fetcher, platform clients, orchestrator, weekly trigger.
pub async fn pipeline_from_env() -> Result<Pipeline> {
    let config = EngineConfig::from_env();
    let registry = PlatformRegistry::load_or_default(&config.registry_path)?;
    let fetcher = PlatformFetcher::new(FetcherConfig {
        timeout: config.http_timeout,
        user_agent: Some(config.user_agent.clone()),
        rate_limits: registry.rate_limits(),
        ..FetcherConfig::default()
    })?;
    let store = store_from_env().await?;
    let orchestrator = Orchestrator::new(
        store,
        Arc::new(fetcher),
        registry.build_clients(),
        config.clone(),
    );
    let trigger = WeeklyTrigger::new(orchestrator.clone());
    Ok(Pipeline {
        orchestrator,
        trigger,
        config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use spt_core::BatchStatus;
    use spt_platforms::PlatformError;
    use spt_store::MemoryStore;

    fn stats(rating: i64, problems: u64, contests: u64, rank: u64) -> PlatformStats {
        PlatformStats {
            rating,
            max_rating: rating,
            problems_solved: problems,
            contests_participated: contests,
            rank,
            extra: BTreeMap::new(),
        }
    }

    fn success(platform: PlatformId, stats: PlatformStats) -> ObservationInput {
        ObservationInput {
            platform,
            outcome: FetchOutcome::Success(stats),
        }
    }

    fn skipped(platform: PlatformId) -> ObservationInput {
        ObservationInput {
            platform,
            outcome: FetchOutcome::Skipped,
        }
    }

    fn weights() -> ScoreWeights {
        ScoreWeights::default()
    }

    #[test]
    fn platform_score_caps_each_term() {
        let w = weights();
        // 10_000/20 would be 500; capped at 40. 10_000/5 capped at 40.
        // 1_000*2 capped at 20. Sum capped terms = 100.
        assert_eq!(platform_score(&stats(10_000, 10_000, 1_000, 1), &w), 100.0);
        // Negative ratings do not produce negative scores.
        assert_eq!(platform_score(&stats(-200, 0, 0, 1), &w), 0.0);
    }

    #[test]
    fn reconcile_computes_deltas_against_prior_snapshot() {
        let w = weights();
        let batch_a = Uuid::new_v4();
        let batch_b = Uuid::new_v4();
        let captured = Utc::now();

        let prior = reconcile(
            "REG001",
            batch_a,
            1,
            "Week 1",
            captured,
            &[success(PlatformId::Codeforces, stats(1400, 50, 10, 900))],
            None,
            &w,
        );

        let current = reconcile(
            "REG001",
            batch_b,
            2,
            "Week 2",
            captured,
            &[success(PlatformId::Codeforces, stats(1450, 55, 10, 850))],
            Some(&prior),
            &w,
        );

        let observation = &current.observations[0];
        assert_eq!(observation.rating_delta, 50);
        assert_eq!(observation.problems_delta, 5);
        assert_eq!(observation.contests_delta, 0);
        assert_eq!(observation.rank_delta, 50);
        assert!(!observation.first_seen);
        assert_eq!(current.trend, TrendLabel::Up);
    }

    #[test]
    fn reconcile_flags_new_platforms_with_current_value_deltas() {
        let w = weights();
        let captured = Utc::now();
        let prior = reconcile(
            "REG001",
            Uuid::new_v4(),
            1,
            "Week 1",
            captured,
            &[success(PlatformId::Codeforces, stats(1400, 50, 10, 900))],
            None,
            &w,
        );
        let current = reconcile(
            "REG001",
            Uuid::new_v4(),
            2,
            "Week 2",
            captured,
            &[
                success(PlatformId::Codeforces, stats(1400, 50, 10, 900)),
                success(PlatformId::Leetcode, stats(1600, 200, 5, 40_000)),
            ],
            Some(&prior),
            &w,
        );
        let leetcode = current
            .observations
            .iter()
            .find(|o| o.platform == PlatformId::Leetcode)
            .unwrap();
        assert!(leetcode.first_seen);
        assert_eq!(leetcode.rating_delta, 1600);
        assert_eq!(leetcode.problems_delta, 200);
        assert_eq!(leetcode.rank_delta, 0);
    }

    #[test]
    fn reconcile_is_deterministic() {
        let w = weights();
        let batch_id = Uuid::new_v4();
        let captured = Utc::now();
        let inputs = [
            success(PlatformId::Codeforces, stats(1520, 80, 12, 700)),
            skipped(PlatformId::Hackerrank),
        ];
        let a = reconcile("REG001", batch_id, 3, "Week 3", captured, &inputs, None, &w);
        let b = reconcile("REG001", batch_id, 3, "Week 3", captured, &inputs, None, &w);
        assert_eq!(a, b);
    }

    #[test]
    fn all_skipped_student_scores_zero_and_low() {
        let w = weights();
        let snapshot = reconcile(
            "REG001",
            Uuid::new_v4(),
            1,
            "Week 1",
            Utc::now(),
            &[
                skipped(PlatformId::Codeforces),
                skipped(PlatformId::Leetcode),
            ],
            None,
            &w,
        );
        assert_eq!(snapshot.aggregate_score, 0.0);
        assert_eq!(snapshot.performance_tier, PerformanceTier::Low);
        assert_eq!(snapshot.active_platform_count, 0);
        // No successful data on the first snapshot: stable, not up.
        assert_eq!(snapshot.trend, TrendLabel::Stable);
    }

    #[test]
    fn first_successful_snapshot_trends_up() {
        let w = weights();
        let snapshot = reconcile(
            "REG001",
            Uuid::new_v4(),
            1,
            "Week 1",
            Utc::now(),
            &[success(PlatformId::Codeforces, stats(1400, 50, 10, 900))],
            None,
            &w,
        );
        assert_eq!(snapshot.trend, TrendLabel::Up);
    }

    #[test]
    fn aggregate_is_mean_over_successful_platforms_only() {
        let w = weights();
        let snapshot = reconcile(
            "REG001",
            Uuid::new_v4(),
            1,
            "Week 1",
            Utc::now(),
            &[
                // 1000/20 + 100/5 + 5*2 = 50 + 20... rating term is
                // min(50, 40) = 40, so 40 + 20 + 10 = 70.
                success(PlatformId::Codeforces, stats(1000, 100, 5, 100)),
                ObservationInput {
                    platform: PlatformId::Leetcode,
                    outcome: FetchOutcome::Failed {
                        kind: ErrorKind::PermanentApi,
                        detail: "user not found".to_string(),
                    },
                },
                skipped(PlatformId::Codechef),
            ],
            None,
            &w,
        );
        assert_eq!(snapshot.aggregate_score, 70.0);
        assert_eq!(snapshot.performance_tier, PerformanceTier::Medium);
        assert_eq!(snapshot.active_platform_count, 1);
    }

    #[test]
    fn tier_thresholds_are_inclusive() {
        let w = weights();
        assert_eq!(tier_for_score(80.0, &w), PerformanceTier::High);
        assert_eq!(tier_for_score(79.9, &w), PerformanceTier::Medium);
        assert_eq!(tier_for_score(50.0, &w), PerformanceTier::Medium);
        assert_eq!(tier_for_score(49.9, &w), PerformanceTier::Low);
    }

    // -- orchestrator tests ------------------------------------------------

    enum FakeResponse {
        Stats(PlatformStats),
        NotFound,
        WaitForPermit(Arc<Semaphore>),
        Hang,
    }

    struct FakeClient {
        platform: PlatformId,
        responses: HashMap<String, FakeResponse>,
        calls: Arc<Mutex<HashMap<String, usize>>>,
    }

    impl FakeClient {
        fn new(platform: PlatformId) -> Self {
            Self {
                platform,
                responses: HashMap::new(),
                calls: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        fn with(mut self, username: &str, response: FakeResponse) -> Self {
            self.responses.insert(username.to_string(), response);
            self
        }
    }

    #[async_trait]
    impl PlatformClient for FakeClient {
        fn platform(&self) -> PlatformId {
            self.platform
        }

        async fn fetch(
            &self,
            _http: &PlatformFetcher,
            username: &str,
        ) -> Result<PlatformStats, PlatformError> {
            *self
                .calls
                .lock()
                .await
                .entry(username.to_string())
                .or_default() += 1;
            match self.responses.get(username) {
                Some(FakeResponse::Stats(stats)) => Ok(stats.clone()),
                Some(FakeResponse::WaitForPermit(gate)) => {
                    let permit = gate.acquire().await.expect("gate closed");
                    permit.forget();
                    Ok(stats(1200, 30, 4, 5_000))
                }
                Some(FakeResponse::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(PlatformStats::default())
                }
                Some(FakeResponse::NotFound) | None => Err(PlatformError::UserNotFound {
                    platform: self.platform,
                    username: username.to_string(),
                }),
            }
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            stagger: Duration::ZERO,
            reports_dir: None,
            ..EngineConfig::default()
        }
    }

    fn build_orchestrator(
        clients: Vec<FakeClient>,
        config: EngineConfig,
    ) -> (Arc<Orchestrator>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(PlatformFetcher::new(FetcherConfig::default()).unwrap());
        let client_map: BTreeMap<PlatformId, Arc<dyn PlatformClient>> = clients
            .into_iter()
            .map(|c| (c.platform, Arc::new(c) as Arc<dyn PlatformClient>))
            .collect();
        let orchestrator = Orchestrator::new(store.clone(), fetcher, client_map, config);
        (orchestrator, store)
    }

    fn record(reg: &str, handles: &[(PlatformId, &str)]) -> StudentRecord {
        StudentRecord {
            registration_no: reg.to_string(),
            name: format!("Student {reg}"),
            group: "A".to_string(),
            cohort: "2027".to_string(),
            handles: handles
                .iter()
                .map(|(p, h)| (*p, h.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn batch_completes_with_per_student_isolation() {
        let cf = FakeClient::new(PlatformId::Codeforces)
            .with("alice_cf", FakeResponse::Stats(stats(1450, 55, 10, 850)))
            .with("ghost", FakeResponse::NotFound);
        let lc = FakeClient::new(PlatformId::Leetcode)
            .with("bob_lc", FakeResponse::Stats(stats(1700, 300, 8, 20_000)));
        let ghost_calls = cf.calls.clone();

        let (orchestrator, store) = build_orchestrator(vec![cf, lc], test_config());
        let batch_id = orchestrator
            .submit(vec![
                record("REG001", &[(PlatformId::Codeforces, "alice_cf")]),
                record(
                    "REG002",
                    &[(PlatformId::Codeforces, "ghost"), (PlatformId::Leetcode, "bob_lc")],
                ),
                record("REG003", &[]),
            ])
            .await
            .unwrap();
        orchestrator.wait_for(batch_id).await;

        let batch = store.batch(batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.progress.processed, 3);
        assert_eq!(
            batch.progress.succeeded + batch.progress.failed,
            batch.progress.processed
        );

        // The permanent failure was not retried and did not block the
        // sibling platform for the same student.
        assert_eq!(ghost_calls.lock().await.get("ghost"), Some(&1));
        let reg2 = store.latest_snapshot("REG002").await.unwrap().unwrap();
        let cf_obs = reg2
            .observations
            .iter()
            .find(|o| o.platform == PlatformId::Codeforces)
            .unwrap();
        assert_eq!(cf_obs.fetch_status, FetchStatus::Failed);
        let lc_obs = reg2
            .observations
            .iter()
            .find(|o| o.platform == PlatformId::Leetcode)
            .unwrap();
        assert_eq!(lc_obs.fetch_status, FetchStatus::Success);
        assert!(batch
            .errors
            .iter()
            .any(|e| e.kind == ErrorKind::PermanentApi
                && e.student_id.as_deref() == Some("REG002")));

        // No handles anywhere: all skipped, score 0, tier low.
        let reg3 = store.latest_snapshot("REG003").await.unwrap().unwrap();
        assert_eq!(reg3.aggregate_score, 0.0);
        assert_eq!(reg3.performance_tier, PerformanceTier::Low);
    }

    #[tokio::test]
    async fn cancel_keeps_finished_snapshots_and_discards_the_rest() {
        let gate = Arc::new(Semaphore::new(2));
        let cf = FakeClient::new(PlatformId::Codeforces)
            .with("s1", FakeResponse::WaitForPermit(gate.clone()))
            .with("s2", FakeResponse::WaitForPermit(gate.clone()))
            .with("s3", FakeResponse::WaitForPermit(gate.clone()))
            .with("s4", FakeResponse::WaitForPermit(gate.clone()))
            .with("s5", FakeResponse::WaitForPermit(gate.clone()));

        let config = EngineConfig {
            worker_count: 1,
            ..test_config()
        };
        let (orchestrator, store) = build_orchestrator(vec![cf], config);
        let records = (1..=5)
            .map(|i| {
                record(
                    &format!("REG00{i}"),
                    &[(PlatformId::Codeforces, &format!("s{i}"))],
                )
            })
            .collect();
        let batch_id = orchestrator.submit(records).await.unwrap();

        // Two permits let exactly two tasks finish; the third blocks
        // mid-fetch on the gate.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let batch = store.batch(batch_id).await.unwrap().unwrap();
            if batch.progress.processed == 2 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "never reached 2 processed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(orchestrator.cancel(batch_id).await.unwrap());
        // Let the in-flight platform call run to completion; its result
        // must still be discarded.
        gate.add_permits(3);
        orchestrator.wait_for(batch_id).await;

        let batch = store.batch(batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Cancelled);
        assert_eq!(batch.progress.processed, 2);

        let mut persisted = 0;
        for i in 1..=5 {
            if store
                .latest_snapshot(&format!("REG00{i}"))
                .await
                .unwrap()
                .is_some()
            {
                persisted += 1;
            }
        }
        assert_eq!(persisted, 2);
    }

    #[tokio::test]
    async fn task_timeout_records_failure() {
        let cf = FakeClient::new(PlatformId::Codeforces).with("slow", FakeResponse::Hang);
        let config = EngineConfig {
            task_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let (orchestrator, store) = build_orchestrator(vec![cf], config);
        let batch_id = orchestrator
            .submit(vec![record("REG001", &[(PlatformId::Codeforces, "slow")])])
            .await
            .unwrap();
        orchestrator.wait_for(batch_id).await;

        let batch = store.batch(batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.progress.failed, 1);
        assert!(batch.errors.iter().any(|e| e.kind == ErrorKind::Timeout));
        assert!(store.latest_snapshot("REG001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn submit_validates_batch_bounds() {
        let (orchestrator, _store) = build_orchestrator(vec![], test_config());
        assert!(matches!(
            orchestrator.submit(Vec::new()).await,
            Err(SubmitError::EmptyBatch)
        ));

        let config = EngineConfig {
            max_batch_size: 2,
            ..test_config()
        };
        let (orchestrator, store) = build_orchestrator(vec![], config);
        let records = (1..=3).map(|i| record(&format!("REG00{i}"), &[])).collect();
        assert!(matches!(
            orchestrator.submit(records).await,
            Err(SubmitError::TooLarge { len: 3, max: 2 })
        ));
        // Validation failures persist nothing.
        assert!(store.latest_batches(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_submits_get_unique_week_numbers() {
        let cf = FakeClient::new(PlatformId::Codeforces)
            .with("u", FakeResponse::Stats(stats(1000, 10, 1, 100)));
        let (orchestrator, store) = build_orchestrator(vec![cf], test_config());

        let mut submits = JoinSet::new();
        for i in 0..5 {
            let orchestrator = orchestrator.clone();
            submits.spawn(async move {
                orchestrator
                    .submit(vec![record(
                        &format!("REG{i:03}"),
                        &[(PlatformId::Codeforces, "u")],
                    )])
                    .await
                    .unwrap()
            });
        }
        let mut batch_ids = Vec::new();
        while let Some(res) = submits.join_next().await {
            batch_ids.push(res.unwrap());
        }
        for batch_id in &batch_ids {
            orchestrator.wait_for(*batch_id).await;
        }

        let batches = store.latest_batches(10).await.unwrap();
        let mut weeks: Vec<u32> = batches.iter().map(|b| b.week_number).collect();
        weeks.sort_unstable();
        assert_eq!(weeks, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn trigger_guards_against_overlapping_runs() {
        let gate = Arc::new(Semaphore::new(0));
        let cf = FakeClient::new(PlatformId::Codeforces)
            .with("u1", FakeResponse::WaitForPermit(gate.clone()));
        let (orchestrator, store) = build_orchestrator(vec![cf], test_config());
        store
            .upsert_student(record("REG001", &[(PlatformId::Codeforces, "u1")]).into_student())
            .await
            .unwrap();

        let trigger = WeeklyTrigger::new(orchestrator.clone());
        let batch_id = trigger.run().await.unwrap();
        assert!(trigger.is_running());
        assert!(matches!(
            trigger.run().await,
            Err(TriggerError::AlreadyRunning)
        ));

        gate.add_permits(1);
        orchestrator.wait_for(batch_id).await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while trigger.is_running() {
            assert!(tokio::time::Instant::now() < deadline, "running flag never cleared");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn compare_defaults_to_two_most_recent_batches() {
        let store = MemoryStore::new();
        let week1 = Uuid::new_v4();
        let week2 = Uuid::new_v4();
        let mk_batch = |id, week| IngestionBatch {
            batch_id: id,
            week_number: week,
            week_label: format!("Week {week}"),
            submitted_at: Utc::now(),
            total_students: 3,
            status: BatchStatus::Completed,
            progress: BatchProgress {
                processed: 3,
                succeeded: 3,
                failed: 0,
            },
            errors: Vec::new(),
        };
        store.create_batch(mk_batch(week1, 1)).await.unwrap();
        store.create_batch(mk_batch(week2, 2)).await.unwrap();

        let w = weights();
        let mk_snapshot = |student: &str, batch, week, rating| {
            reconcile(
                student,
                batch,
                week,
                &format!("Week {week}"),
                Utc::now(),
                &[success(PlatformId::Codeforces, stats(rating, 0, 0, 0))],
                None,
                &w,
            )
        };
        // improver: 20 -> 30; decliner: 35 -> 25; joiner only in week 2.
        store.save_snapshot(mk_snapshot("REG-IMP", week1, 1, 400)).await.unwrap();
        store.save_snapshot(mk_snapshot("REG-IMP", week2, 2, 600)).await.unwrap();
        store.save_snapshot(mk_snapshot("REG-DEC", week1, 1, 700)).await.unwrap();
        store.save_snapshot(mk_snapshot("REG-DEC", week2, 2, 500)).await.unwrap();
        store.save_snapshot(mk_snapshot("REG-NEW", week2, 2, 300)).await.unwrap();

        let summary = compare_batches(&store, None, None).await.unwrap();
        assert_eq!(summary.earlier_batch, week1);
        assert_eq!(summary.later_batch, week2);
        assert_eq!(summary.improved, 1);
        assert_eq!(summary.declined, 1);
        assert_eq!(summary.unchanged, 1);

        let joiner = summary
            .students
            .iter()
            .find(|s| s.student_id == "REG-NEW")
            .unwrap();
        assert!(joiner.score_delta.is_none());
        assert!(joiner.earlier_score.is_none());
    }

    #[tokio::test]
    async fn reports_are_written_after_completion() {
        let dir = tempfile::tempdir().unwrap();
        let cf = FakeClient::new(PlatformId::Codeforces)
            .with("u", FakeResponse::Stats(stats(1400, 50, 10, 900)));
        let config = EngineConfig {
            reports_dir: Some(dir.path().to_path_buf()),
            ..test_config()
        };
        let (orchestrator, _store) = build_orchestrator(vec![cf], config);
        let batch_id = orchestrator
            .submit(vec![record("REG001", &[(PlatformId::Codeforces, "u")])])
            .await
            .unwrap();
        orchestrator.wait_for(batch_id).await;

        // Report export happens before the batch resolves its waiters.
        let report_dir = dir.path().join(batch_id.to_string());
        assert!(report_dir.join("snapshots").join("manifest.json").exists());
        assert!(report_dir.join("batch_summary.md").exists());
        assert!(report_dir.join("snapshots_delta.json").exists());
        assert!(report_dir.join("snapshots").join("snapshots.parquet").exists());
        assert!(report_dir.join("snapshots").join("observations.parquet").exists());
    }

    #[test]
    fn default_registry_rate_limits_scraped_platforms_tightly() {
        let registry = PlatformRegistry::default();
        let limits = registry.rate_limits();
        let codechef = limits.get(&PlatformId::Codechef).unwrap();
        assert_eq!(codechef.capacity, 1);
        assert_eq!(codechef.refill_every, Duration::from_secs(1));
        assert_eq!(registry.build_clients().len(), 4);
    }
}
