//! # Recorral
//!
//! Control plane for a distributed conference-recording fleet.
//!
//! Room servers produce real-time RTP for conference participants; a pool
//! of recorder nodes accepts forwarded RTP and transcodes it to file.
//! Recorral sits between them: it accepts recording requests, picks a
//! suitable recorder, orchestrates RTP forwarding setup, tracks each job
//! to completion, reacts to node failure, and publishes a coherent view of
//! fleet capacity.
//!
//! ## Architecture
//!
//! - **Registry**: authoritative in-memory map of room servers and
//!   recorders, driven by registration and heartbeats
//! - **Dispatcher**: executes placements with rollback, owns the job
//!   lifecycle
//! - **Health loop**: the sole source of failover; reaps stale heartbeats,
//!   reassigns orphaned jobs, drains the pending queue
//! - **Metrics aggregator**: periodic fleet snapshots and advisory scaling
//!   recommendations
//!
//! A single orchestrator instance owns the in-memory state; the repository
//! exists for warm restart and history only.

pub mod api;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod orchestrator;
pub mod placement;
pub mod registry;
pub mod repository;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::config::{AutoScalingConfig, OrchestratorConfig, RpcTimeouts};
    pub use crate::dispatch::{Dispatcher, HttpNodeRpc, NodeRpc};
    pub use crate::jobs::{JobStatus, JobStore, RecordingJob, StartRecordingRequest};
    pub use crate::orchestrator::Orchestrator;
    pub use crate::placement::{PlacementEngine, PlacementRequirement};
    pub use crate::registry::{NodeRegistry, RecorderDecl, RoomServerDecl};
    pub use crate::repository::{MemoryRepository, Repository};
    pub use crate::{Error, Result};
}
