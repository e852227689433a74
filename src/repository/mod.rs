//! Repository contract
//!
//! Durable snapshots of registries, jobs, and metrics. The in-memory state
//! is authoritative; the repository provides warm-restart and history. All
//! operations may fail and callers log-and-proceed rather than block state
//! transitions.

mod memory;

pub use memory::MemoryRepository;

use crate::jobs::{JobStatus, RecordingJob};
use crate::metrics::MetricsSnapshot;
use crate::registry::{RecorderNode, RoomServer};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Filter for job-history queries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHistoryFilter {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub room_server_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub started_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_before: Option<DateTime<Utc>>,
}

impl JobHistoryFilter {
    pub fn matches(&self, job: &RecordingJob) -> bool {
        if let Some(id) = &self.job_id {
            if &job.job_id != id {
                return false;
            }
        }
        if let Some(id) = &self.room_server_id {
            if &job.room_server_id != id {
                return false;
            }
        }
        if let Some(id) = &self.room_id {
            if &job.room_id != id {
                return false;
            }
        }
        if let Some(id) = &self.peer_id {
            if &job.peer_id != id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(after) = self.started_after {
            if job.started_at < after {
                return false;
            }
        }
        if let Some(before) = self.started_before {
            if job.started_at > before {
                return false;
            }
        }
        true
    }
}

fn default_limit() -> usize {
    50
}

/// Offset/limit paging for history queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: default_limit(),
        }
    }
}

/// Storage backend interface.
///
/// Abstracts the persistence engine (a relational store with JSON columns
/// in production) so the core can run against an in-memory implementation
/// in development and tests.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn upsert_room_server(&self, server: &RoomServer) -> Result<()>;

    async fn upsert_recorder(&self, node: &RecorderNode) -> Result<()>;

    async fn upsert_job(&self, job: &RecordingJob) -> Result<()>;

    /// Room servers that were healthy at last persist (warm restart).
    async fn load_healthy_room_servers(&self) -> Result<Vec<RoomServer>>;

    /// Recorders that were healthy at last persist (warm restart).
    async fn load_healthy_recorders(&self) -> Result<Vec<RecorderNode>>;

    /// Jobs that were non-terminal at last persist (warm restart).
    async fn load_active_jobs(&self) -> Result<Vec<RecordingJob>>;

    /// Query job history, newest first.
    async fn query_job_history(
        &self,
        filter: &JobHistoryFilter,
        paging: &Paging,
    ) -> Result<Vec<RecordingJob>>;

    async fn append_metrics_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<()>;

    /// Snapshots with `start <= timestamp <= end`, oldest first.
    async fn query_metrics_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricsSnapshot>>;
}
