//! Orchestrator assembly
//!
//! Wires the registry, job store, placement engine, dispatcher, health
//! loop, and metrics aggregator around explicit dependencies (repository,
//! RPC client, clock). A single instance owns the authoritative in-memory
//! state; the repository is consulted once at startup for warm restart.

use crate::clock::BoundedClock;
use crate::config::OrchestratorConfig;
use crate::dispatch::{Dispatcher, NodeRpc};
use crate::events::EventBus;
use crate::health::HealthLoop;
use crate::jobs::{JobStatus, JobStore};
use crate::metrics::MetricsAggregator;
use crate::placement::PlacementEngine;
use crate::registry::{NodeRegistry, RecorderNode, RoomServer};
use crate::repository::Repository;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const EVENT_BUS_CAPACITY: usize = 256;

/// The orchestrator core: one instance per process.
pub struct Orchestrator {
    pub config: OrchestratorConfig,
    pub clock: Arc<BoundedClock>,
    pub registry: Arc<NodeRegistry>,
    pub jobs: Arc<JobStore>,
    pub placement: PlacementEngine,
    pub bus: EventBus,
    pub repository: Arc<dyn Repository>,
    pub dispatcher: Arc<Dispatcher>,
    pub health: Arc<HealthLoop>,
    pub metrics: Arc<MetricsAggregator>,
}

impl Orchestrator {
    /// Build the core and warm-restart from the repository. An unreachable
    /// store degrades to a cold start with empty registries.
    pub async fn new(
        config: OrchestratorConfig,
        repository: Arc<dyn Repository>,
        rpc: Arc<dyn NodeRpc>,
    ) -> Arc<Self> {
        let clock = Arc::new(BoundedClock::new());
        let registry = Arc::new(NodeRegistry::new(
            clock.clone(),
            config.max_concurrent_per_node,
        ));
        let jobs = Arc::new(JobStore::new(clock.clone()));
        let placement = PlacementEngine::new();
        let bus = EventBus::new(EVENT_BUS_CAPACITY);

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            jobs.clone(),
            placement,
            rpc,
            repository.clone(),
            bus.clone(),
            config.callback_base_url.clone(),
        ));

        let health = Arc::new(HealthLoop::new(
            registry.clone(),
            jobs.clone(),
            dispatcher.clone(),
            repository.clone(),
            placement,
            config.clone(),
        ));

        let metrics = Arc::new(MetricsAggregator::new(
            registry.clone(),
            jobs.clone(),
            repository.clone(),
            bus.clone(),
            clock.clone(),
            config.metrics_interval,
            config.auto_scaling.clone(),
        ));

        let orchestrator = Arc::new(Self {
            config,
            clock,
            registry,
            jobs,
            placement,
            bus,
            repository,
            dispatcher,
            health,
            metrics,
        });
        orchestrator.warm_restart().await;
        orchestrator
    }

    /// Spawn the periodic loops. The returned handles run until aborted.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let health = self.health.clone();
        let metrics = self.metrics.clone();
        vec![
            tokio::spawn(async move { health.run().await }),
            tokio::spawn(async move { metrics.run().await }),
        ]
    }

    /// Seed registries and the job store from the last persisted state.
    async fn warm_restart(&self) {
        match self.repository.load_healthy_room_servers().await {
            Ok(servers) => {
                for server in servers {
                    self.registry.restore_room_server(server).await;
                }
            }
            Err(e) => warn!("Starting with empty room-server registry: {}", e),
        }
        match self.repository.load_healthy_recorders().await {
            Ok(recorders) => {
                for node in recorders {
                    self.registry.restore_recorder(node).await;
                }
            }
            Err(e) => warn!("Starting with empty recorder registry: {}", e),
        }

        match self.repository.load_active_jobs().await {
            Ok(jobs) => {
                let mut restored = 0usize;
                let mut requeued = 0usize;
                for mut job in jobs {
                    let recorder_known = match &job.recorder_id {
                        Some(id) => self.registry.get_recorder(id).await.is_some(),
                        None => false,
                    };
                    if job.status == JobStatus::Pending || !recorder_known {
                        // The placement did not survive the restart; run it again
                        job.status = JobStatus::Pending;
                        job.recorder_id = None;
                        job.rtp_forwarding = None;
                        let job_id = job.job_id.clone();
                        self.jobs.restore(job);
                        self.jobs.enqueue(&job_id);
                        requeued += 1;
                    } else {
                        self.jobs.restore(job);
                        restored += 1;
                    }
                }
                if restored + requeued > 0 {
                    info!(
                        "Warm restart: {} jobs restored, {} requeued",
                        restored, requeued
                    );
                }
            }
            Err(e) => warn!("Starting with empty job store: {}", e),
        }
    }

    /// Persist a room-server snapshot, log-and-proceed on failure.
    pub async fn persist_room_server(&self, server: &RoomServer) {
        if let Err(e) = self.repository.upsert_room_server(server).await {
            warn!("Skipping persist of room server {}: {}", server.id, e);
        }
    }

    /// Persist a recorder snapshot, log-and-proceed on failure.
    pub async fn persist_recorder(&self, node: &RecorderNode) {
        if let Err(e) = self.repository.upsert_recorder(node).await {
            warn!("Skipping persist of recorder {}: {}", node.id, e);
        }
    }
}
