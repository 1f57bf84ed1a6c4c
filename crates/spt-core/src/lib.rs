//! Core domain model for the Student Platform Tracker.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "spt-core";

/// External coding platforms the tracker knows how to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformId {
    Codeforces,
    Leetcode,
    Codechef,
    Hackerrank,
}

impl PlatformId {
    pub const ALL: [PlatformId; 4] = [
        PlatformId::Codeforces,
        PlatformId::Leetcode,
        PlatformId::Codechef,
        PlatformId::Hackerrank,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformId::Codeforces => "codeforces",
            PlatformId::Leetcode => "leetcode",
            PlatformId::Codechef => "codechef",
            PlatformId::Hackerrank => "hackerrank",
        }
    }

    pub fn parse(input: &str) -> Option<PlatformId> {
        match input.trim().to_ascii_lowercase().as_str() {
            "codeforces" => Some(PlatformId::Codeforces),
            "leetcode" => Some(PlatformId::Leetcode),
            "codechef" => Some(PlatformId::Codechef),
            "hackerrank" => Some(PlatformId::Hackerrank),
            _ => None,
        }
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked student. Upserted on every ingestion batch, deactivated but
/// never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub registration_no: String,
    pub name: String,
    pub group: String,
    pub cohort: String,
    pub active: bool,
    /// Platform usernames; a platform without an entry is skipped for this
    /// student.
    pub handles: BTreeMap<PlatformId, String>,
}

/// Submit-time input row for one student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentRecord {
    pub registration_no: String,
    pub name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub cohort: String,
    #[serde(default)]
    pub handles: BTreeMap<PlatformId, String>,
}

impl StudentRecord {
    pub fn into_student(self) -> Student {
        Student {
            registration_no: self.registration_no,
            name: self.name,
            group: self.group,
            cohort: self.cohort,
            active: true,
            handles: self.handles,
        }
    }
}

/// Uniform per-platform statistics. Every client populates the full field
/// set; metrics a platform has no concept of are zero-valued, never omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlatformStats {
    pub rating: i64,
    pub max_rating: i64,
    pub problems_solved: u64,
    pub contests_participated: u64,
    pub rank: u64,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Success,
    Failed,
    Skipped,
}

/// One platform's result for one student at one capture point, with deltas
/// against the student's prior snapshot. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformObservation {
    pub platform: PlatformId,
    pub stats: PlatformStats,
    pub fetch_status: FetchStatus,
    pub error_detail: Option<String>,
    pub rating_delta: i64,
    pub max_rating_delta: i64,
    pub problems_delta: i64,
    pub contests_delta: i64,
    /// `prior.rank - current.rank`; positive means the student improved.
    pub rank_delta: i64,
    /// True when the prior snapshot had no observation for this platform.
    pub first_seen: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendLabel {
    Up,
    Down,
    Stable,
}

/// The immutable weekly record of one student's state at one batch.
/// Corrections require a new snapshot; the store rejects re-writes of the
/// same `(student_id, batch_id)` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub student_id: String,
    pub batch_id: Uuid,
    pub week_number: u32,
    pub week_label: String,
    pub captured_at: DateTime<Utc>,
    pub observations: Vec<PlatformObservation>,
    pub aggregate_score: f64,
    pub performance_tier: PerformanceTier,
    pub trend: TrendLabel,
    pub active_platform_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

/// Monotonic task counters; `succeeded + failed == processed` at every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BatchProgress {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Validation,
    TransientApi,
    PermanentApi,
    Timeout,
    Infrastructure,
}

/// Append-only error log entry attached to a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub student_id: Option<String>,
    pub platform: Option<PlatformId>,
    pub timestamp: DateTime<Utc>,
}

/// One ingestion run over a set of students, tagged with one week number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionBatch {
    pub batch_id: Uuid,
    pub week_number: u32,
    pub week_label: String,
    pub submitted_at: DateTime<Utc>,
    pub total_students: u32,
    pub status: BatchStatus,
    pub progress: BatchProgress,
    pub errors: Vec<ErrorRecord>,
}

impl IngestionBatch {
    pub fn percent_complete(&self) -> f64 {
        if self.total_students == 0 {
            return 100.0;
        }
        (self.progress.processed as f64 / self.total_students as f64) * 100.0
    }

    /// Bounded tail of the error log, oldest-first within the tail.
    pub fn recent_errors(&self, limit: usize) -> &[ErrorRecord] {
        let start = self.errors.len().saturating_sub(limit);
        &self.errors[start..]
    }
}

/// Per-student row in a batch-to-batch comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentComparison {
    pub student_id: String,
    pub earlier_score: Option<f64>,
    pub later_score: f64,
    pub score_delta: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonSummary {
    pub earlier_batch: Uuid,
    pub later_batch: Uuid,
    pub improved: u32,
    pub declined: u32,
    pub unchanged: u32,
    pub students: Vec<StudentComparison>,
}
