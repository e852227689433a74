//! Node registry for the recording fleet
//!
//! Maintains the authoritative in-memory view of room servers and recorder
//! nodes, with heartbeat tracking and failure detection. Nodes are owned by
//! the registry and cross-referenced from jobs by identifier only.

mod store;

pub use store::{NodeRegistry, NodesSnapshot, StaleNodes};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Hardware descriptor reported by a node at registration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareSpecs {
    /// CPU core count
    pub cpu_cores: u32,
    /// Total RAM in bytes
    pub memory_bytes: u64,
    /// Whether a hardware encoder (GPU) is present
    pub has_gpu: bool,
    /// Local disk in bytes
    pub disk_bytes: u64,
}

/// A conferencing media node that produces RTP streams for participants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomServer {
    /// Caller-supplied identifier, stable across restarts
    pub id: String,
    /// Reachable endpoint, e.g. `http://10.0.1.5:4443`
    pub url: String,
    /// Opaque locality tag
    pub region: String,
    /// Rooms currently hosted on this server
    pub rooms: Vec<String>,
    /// Declared capacity (max concurrent sessions)
    pub capacity: u32,
    /// Observed current load
    pub current_load: u32,
    /// Health flag, cleared by the health loop and restored by heartbeats
    pub is_healthy: bool,
    /// Last heartbeat time
    #[serde(skip, default = "Instant::now")]
    pub last_heartbeat: Instant,
    /// Hardware descriptor
    pub specs: HardwareSpecs,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A media node that consumes forwarded RTP and writes recording files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderNode {
    /// Generated identifier: `recorder-<region>-<unixMillis>-<suffix>`
    pub id: String,
    /// Reachable endpoint
    pub url: String,
    /// Opaque locality tag
    pub region: String,
    /// Codec identifiers this recorder can transcode
    pub supported_codecs: Vec<String>,
    /// Identifiers of jobs currently running here
    pub active_jobs: Vec<String>,
    /// Derived capacity (see [`derive_capacity`])
    pub capacity: u32,
    /// Observed current load
    pub current_load: u32,
    /// Health flag
    pub is_healthy: bool,
    /// Last heartbeat time
    #[serde(skip, default = "Instant::now")]
    pub last_heartbeat: Instant,
    /// Hardware descriptor
    pub specs: HardwareSpecs,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RecorderNode {
    /// Whether this recorder can take another job right now.
    pub fn can_accept(&self) -> bool {
        self.is_healthy && self.current_load < self.capacity
    }

    /// Load as a fraction of capacity, in `[0, 1]` for well-formed nodes.
    pub fn load_ratio(&self) -> f64 {
        if self.capacity == 0 {
            1.0
        } else {
            self.current_load as f64 / self.capacity as f64
        }
    }
}

impl RoomServer {
    /// Load as a fraction of declared capacity.
    pub fn load_ratio(&self) -> f64 {
        if self.capacity == 0 {
            1.0
        } else {
            self.current_load as f64 / self.capacity as f64
        }
    }
}

/// Registration declaration for a room server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomServerDecl {
    pub id: String,
    pub url: String,
    pub region: String,
    #[serde(default)]
    pub rooms: Vec<String>,
    pub capacity: u32,
    #[serde(default)]
    pub specs: HardwareSpecs,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Registration declaration for a recorder node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderDecl {
    pub url: String,
    pub region: String,
    #[serde(default)]
    pub supported_codecs: Vec<String>,
    #[serde(default)]
    pub specs: HardwareSpecs,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

const BYTES_PER_SLOT: u64 = 500 * 1024 * 1024;
const MAX_DERIVED_CAPACITY: u32 = 12;

/// Derive a recorder's capacity from its hardware.
///
/// `min(cores * 1.5 * (gpu ? 2 : 1), ram / 500 MiB, 12)`, further capped
/// by the configured per-node concurrency limit.
pub fn derive_capacity(specs: &HardwareSpecs, max_concurrent_per_node: u32) -> u32 {
    let cpu_slots = specs.cpu_cores as f64 * 1.5 * if specs.has_gpu { 2.0 } else { 1.0 };
    let ram_slots = (specs.memory_bytes / BYTES_PER_SLOT) as u32;
    let derived = (cpu_slots.floor() as u32)
        .min(ram_slots)
        .min(MAX_DERIVED_CAPACITY);
    derived.min(max_concurrent_per_node)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn specs(cores: u32, ram_gib: u64, gpu: bool) -> HardwareSpecs {
        HardwareSpecs {
            cpu_cores: cores,
            memory_bytes: ram_gib * GIB,
            has_gpu: gpu,
            disk_bytes: 100 * GIB,
        }
    }

    #[test]
    fn capacity_derivation_cpu_bound() {
        // min(4 * 1.5, 16, 12) = 6
        assert_eq!(derive_capacity(&specs(4, 8, false), 100), 6);
    }

    #[test]
    fn capacity_derivation_gpu_doubles_cpu_slots() {
        // min(4 * 1.5 * 2, 16, 12) = 12
        assert_eq!(derive_capacity(&specs(4, 8, true), 100), 12);
    }

    #[test]
    fn capacity_derivation_ram_bound() {
        // 1 GiB / 500 MiB = 2 slots
        assert_eq!(derive_capacity(&specs(8, 1, false), 100), 2);
    }

    #[test]
    fn capacity_derivation_hard_ceiling() {
        assert_eq!(derive_capacity(&specs(32, 64, true), 100), 12);
    }

    #[test]
    fn capacity_respects_configured_cap() {
        assert_eq!(derive_capacity(&specs(8, 16, false), 6), 6);
    }

    #[test]
    fn zero_capacity_recorder_never_accepts() {
        let node = RecorderNode {
            id: "recorder-x".to_string(),
            url: "http://10.0.0.1:7000".to_string(),
            region: "us-east-1".to_string(),
            supported_codecs: vec![],
            active_jobs: vec![],
            capacity: 0,
            current_load: 0,
            is_healthy: true,
            last_heartbeat: Instant::now(),
            specs: HardwareSpecs::default(),
            metadata: HashMap::new(),
        };
        assert!(!node.can_accept());
        assert_eq!(node.load_ratio(), 1.0);
    }
}
