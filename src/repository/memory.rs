//! In-memory repository for development and testing

use super::{JobHistoryFilter, Paging, Repository};
use crate::jobs::RecordingJob;
use crate::metrics::MetricsSnapshot;
use crate::registry::{RecorderNode, RoomServer};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

/// In-memory repository
///
/// Stores snapshots in process memory. Suitable for development, tests, and
/// single-node deployments that can tolerate cold restarts.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    room_servers: DashMap<String, RoomServer>,
    recorders: DashMap<String, RecorderNode>,
    jobs: DashMap<String, RecordingJob>,
    metrics: RwLock<Vec<MetricsSnapshot>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn upsert_room_server(&self, server: &RoomServer) -> Result<()> {
        self.room_servers.insert(server.id.clone(), server.clone());
        Ok(())
    }

    async fn upsert_recorder(&self, node: &RecorderNode) -> Result<()> {
        self.recorders.insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn upsert_job(&self, job: &RecordingJob) -> Result<()> {
        self.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn load_healthy_room_servers(&self) -> Result<Vec<RoomServer>> {
        Ok(self
            .room_servers
            .iter()
            .filter(|entry| entry.value().is_healthy)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn load_healthy_recorders(&self) -> Result<Vec<RecorderNode>> {
        Ok(self
            .recorders
            .iter()
            .filter(|entry| entry.value().is_healthy)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn load_active_jobs(&self) -> Result<Vec<RecordingJob>> {
        Ok(self
            .jobs
            .iter()
            .filter(|entry| !entry.value().status.is_terminal())
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn query_job_history(
        &self,
        filter: &JobHistoryFilter,
        paging: &Paging,
    ) -> Result<Vec<RecordingJob>> {
        let mut jobs: Vec<RecordingJob> = self
            .jobs
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.job_id.cmp(&b.job_id)));
        Ok(jobs
            .into_iter()
            .skip(paging.offset)
            .take(paging.limit)
            .collect())
    }

    async fn append_metrics_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        self.metrics.write().push(snapshot.clone());
        Ok(())
    }

    async fn query_metrics_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricsSnapshot>> {
        let mut snapshots: Vec<MetricsSnapshot> = self
            .metrics
            .read()
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(snapshots)
    }
}
