//! Fleet health loop
//!
//! The sole source of failover. Each tick reaps stale heartbeats, reconciles
//! jobs affected by newly-unhealthy nodes, drains the pending queue, and
//! garbage-collects nodes that stayed silent long past their timeout. Only
//! one tick is ever in flight.

use crate::config::OrchestratorConfig;
use crate::dispatch::Dispatcher;
use crate::jobs::{JobFilter, JobStatus, JobStore};
use crate::placement::PlacementEngine;
use crate::registry::NodeRegistry;
use crate::repository::Repository;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const REASON_ROOM_SERVER_LOST: &str = "room server became unhealthy";
const REASON_NO_RECORDERS: &str = "no available recorders";

/// Periodic reconciliation of node health, failover, and queue draining.
pub struct HealthLoop {
    registry: Arc<NodeRegistry>,
    jobs: Arc<JobStore>,
    dispatcher: Arc<Dispatcher>,
    repository: Arc<dyn Repository>,
    placement: PlacementEngine,
    config: OrchestratorConfig,
    tick_guard: Mutex<()>,
}

impl HealthLoop {
    pub fn new(
        registry: Arc<NodeRegistry>,
        jobs: Arc<JobStore>,
        dispatcher: Arc<Dispatcher>,
        repository: Arc<dyn Repository>,
        placement: PlacementEngine,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            jobs,
            dispatcher,
            repository,
            placement,
            config,
            tick_guard: Mutex::new(()),
        }
    }

    /// Run the loop at the configured cadence.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.config.health_check_interval);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// One reconciliation pass. Serial: a second caller waits for the first.
    pub async fn tick(&self) {
        let _guard = self.tick_guard.lock().await;

        let stale = self.registry.reap_stale(self.config.node_timeout).await;

        // Mirror flipped health flags so a warm restart doesn't resurrect
        // nodes we just declared dead.
        for id in &stale.room_servers {
            if let Some(server) = self.registry.get_room_server(id).await {
                if let Err(e) = self.repository.upsert_room_server(&server).await {
                    warn!("Skipping persist of room server {}: {}", id, e);
                }
            }
        }
        for id in &stale.recorders {
            if let Some(node) = self.registry.get_recorder(id).await {
                if let Err(e) = self.repository.upsert_recorder(&node).await {
                    warn!("Skipping persist of recorder {}: {}", id, e);
                }
            }
        }

        for server_id in &stale.room_servers {
            self.fail_room_server_jobs(server_id).await;
        }
        for recorder_id in &stale.recorders {
            self.reassign_recorder_jobs(recorder_id).await;
        }

        self.drain_queue().await;

        let removed = self.registry.gc_stale(self.config.node_gc_after).await;
        if !removed.is_empty() {
            debug!("Garbage-collected {} stale nodes", removed.len());
        }
    }

    /// A dead room server is fatal to its jobs: the media source is gone.
    async fn fail_room_server_jobs(&self, server_id: &str) {
        let affected: Vec<_> = self
            .jobs
            .list_active(&JobFilter {
                room_server_id: Some(server_id.to_string()),
                ..Default::default()
            })
            .into_iter()
            .filter(|j| matches!(j.status, JobStatus::Recording | JobStatus::Initializing))
            .collect();

        for job in affected {
            warn!(
                "Failing job {}: room server {} is unhealthy",
                job.job_id, server_id
            );
            if let Err(e) = self
                .dispatcher
                .abort_placed_job(&job.job_id, REASON_ROOM_SERVER_LOST)
                .await
            {
                warn!("Abort of {} failed: {}", job.job_id, e);
            }
        }
    }

    /// Jobs on a dead recorder get one shot at reassignment across the
    /// remaining healthy fleet; the placement hint stays the original room
    /// server's region.
    async fn reassign_recorder_jobs(&self, recorder_id: &str) {
        let affected: Vec<_> = self
            .jobs
            .jobs_on_recorder(recorder_id)
            .into_iter()
            .filter(|j| matches!(j.status, JobStatus::Recording | JobStatus::Initializing))
            .collect();

        for job in affected {
            // De-account the dead placement before re-running assignment
            self.dispatcher.release_placement(&job).await;

            let room_server = self
                .registry
                .get_room_server(&job.room_server_id)
                .await
                .filter(|s| s.is_healthy);
            let Some(room_server) = room_server else {
                if let Err(e) = self
                    .dispatcher
                    .fail_job(&job.job_id, REASON_ROOM_SERVER_LOST)
                    .await
                {
                    warn!("Failing {} failed: {}", job.job_id, e);
                }
                continue;
            };

            let requirement = self.dispatcher.requirement_for(&job, &room_server);
            let candidates = self.registry.healthy_recorders().await;
            match self.placement.select_recorder(&candidates, &requirement) {
                Some(recorder) => {
                    info!(
                        "Reassigning {} from {} to {}",
                        job.job_id, recorder_id, recorder.id
                    );
                    if let Err(e) = self
                        .dispatcher
                        .assign(&job.job_id, &recorder, &room_server)
                        .await
                    {
                        warn!("Reassignment of {} failed: {}", job.job_id, e);
                    }
                }
                None => {
                    warn!("No recorder left for {}", job.job_id);
                    if let Err(e) = self
                        .dispatcher
                        .fail_job(&job.job_id, REASON_NO_RECORDERS)
                        .await
                    {
                        warn!("Failing {} failed: {}", job.job_id, e);
                    }
                }
            }
        }
    }

    /// Place queued jobs onto freed capacity. Candidates are refetched per
    /// job so every placement observes the reservations made earlier in the
    /// same pass.
    async fn drain_queue(&self) {
        for job_id in self.jobs.queue_snapshot() {
            let Some(job) = self.jobs.get(&job_id) else {
                self.jobs.remove_from_queue(&job_id);
                continue;
            };
            if job.status != JobStatus::Pending {
                self.jobs.remove_from_queue(&job_id);
                continue;
            }

            let room_server = self
                .registry
                .get_room_server(&job.room_server_id)
                .await
                .filter(|s| s.is_healthy);
            let Some(room_server) = room_server else {
                self.jobs.remove_from_queue(&job_id);
                if let Err(e) = self
                    .dispatcher
                    .fail_job(&job_id, REASON_ROOM_SERVER_LOST)
                    .await
                {
                    warn!("Failing queued {} failed: {}", job_id, e);
                }
                continue;
            };

            let requirement = self.dispatcher.requirement_for(&job, &room_server);
            let candidates = self.registry.healthy_recorders().await;
            if let Some(recorder) = self.placement.select_recorder(&candidates, &requirement) {
                self.jobs.remove_from_queue(&job_id);
                info!("Draining queued job {} onto {}", job_id, recorder.id);
                if let Err(e) = self
                    .dispatcher
                    .assign(&job_id, &recorder, &room_server)
                    .await
                {
                    warn!("Queued job {} failed to assign: {}", job_id, e);
                }
            }
            // No recorder: the job stays queued for a later tick
        }
    }
}
