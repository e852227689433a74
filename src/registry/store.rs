//! In-memory node registry with heartbeat tracking

use super::{derive_capacity, RecorderDecl, RecorderNode, RoomServer, RoomServerDecl};
use crate::clock::BoundedClock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Full registry snapshot, for metrics aggregation and the capacity view
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodesSnapshot {
    pub room_servers: Vec<RoomServer>,
    pub recorders: Vec<RecorderNode>,
}

/// Identifiers of nodes newly marked unhealthy in a reap pass
#[derive(Debug, Clone, Default)]
pub struct StaleNodes {
    pub room_servers: Vec<String>,
    pub recorders: Vec<String>,
}

impl StaleNodes {
    pub fn is_empty(&self) -> bool {
        self.room_servers.is_empty() && self.recorders.is_empty()
    }
}

/// Authoritative map of room servers and recorder nodes.
///
/// Writers are registration, heartbeat updates, the health loop, and the
/// dispatcher's load accounting. All state is in-memory; the repository is
/// only a warm-restart mirror.
pub struct NodeRegistry {
    room_servers: RwLock<HashMap<String, RoomServer>>,
    recorders: RwLock<HashMap<String, RecorderNode>>,
    clock: Arc<BoundedClock>,
    max_concurrent_per_node: u32,
}

impl NodeRegistry {
    pub fn new(clock: Arc<BoundedClock>, max_concurrent_per_node: u32) -> Self {
        Self {
            room_servers: RwLock::new(HashMap::new()),
            recorders: RwLock::new(HashMap::new()),
            clock,
            max_concurrent_per_node,
        }
    }

    /// Register a room server (or refresh an existing registration).
    /// The identifier is caller-supplied and stable across restarts.
    pub async fn register_room_server(&self, decl: RoomServerDecl) -> String {
        let server = RoomServer {
            id: decl.id.clone(),
            url: decl.url,
            region: decl.region,
            rooms: decl.rooms,
            capacity: decl.capacity,
            current_load: 0,
            is_healthy: true,
            last_heartbeat: Instant::now(),
            specs: decl.specs,
            metadata: decl.metadata,
        };
        info!(
            "Registering room server {} in {} (capacity {})",
            server.id, server.region, server.capacity
        );
        self.room_servers
            .write()
            .await
            .insert(decl.id.clone(), server);
        decl.id
    }

    /// Register a recorder node. Capacity is derived from hardware, never
    /// caller-supplied. Returns the generated identifier.
    pub async fn register_recorder(&self, decl: RecorderDecl) -> String {
        let id = format!(
            "recorder-{}-{}-{:06x}",
            decl.region,
            self.clock.unix_millis(),
            rand::random::<u32>() & 0xff_ffff
        );
        let capacity = derive_capacity(&decl.specs, self.max_concurrent_per_node);
        let node = RecorderNode {
            id: id.clone(),
            url: decl.url,
            region: decl.region,
            supported_codecs: decl.supported_codecs,
            active_jobs: Vec::new(),
            capacity,
            current_load: 0,
            is_healthy: true,
            last_heartbeat: Instant::now(),
            specs: decl.specs,
            metadata: decl.metadata,
        };
        info!(
            "Registering recorder {} in {} (derived capacity {})",
            node.id, node.region, node.capacity
        );
        self.recorders.write().await.insert(id.clone(), node);
        id
    }

    /// Re-seed a room server from a persisted snapshot (warm restart).
    pub async fn restore_room_server(&self, mut server: RoomServer) {
        server.last_heartbeat = Instant::now();
        self.room_servers
            .write()
            .await
            .insert(server.id.clone(), server);
    }

    /// Re-seed a recorder from a persisted snapshot (warm restart).
    pub async fn restore_recorder(&self, mut node: RecorderNode) {
        node.last_heartbeat = Instant::now();
        self.recorders.write().await.insert(node.id.clone(), node);
    }

    /// Record a room-server heartbeat: refreshes the timestamp, the observed
    /// load and room list, and restores the health flag. A heartbeat always
    /// wins over a prior timeout assertion.
    pub async fn room_server_heartbeat(
        &self,
        id: &str,
        load: u32,
        rooms: Option<Vec<String>>,
    ) -> bool {
        let mut servers = self.room_servers.write().await;
        if let Some(server) = servers.get_mut(id) {
            server.last_heartbeat = Instant::now();
            server.current_load = load;
            if let Some(rooms) = rooms {
                server.rooms = rooms;
            }
            if !server.is_healthy {
                info!("Room server {} recovered", id);
            }
            server.is_healthy = true;
            true
        } else {
            warn!("Heartbeat from unknown room server: {}", id);
            false
        }
    }

    /// Record a recorder heartbeat. The declared active-jobs list replaces
    /// the orchestrator's view; the load invariant is reconciled from it.
    pub async fn recorder_heartbeat(
        &self,
        id: &str,
        load: u32,
        active_jobs: Option<Vec<String>>,
    ) -> bool {
        let mut recorders = self.recorders.write().await;
        if let Some(node) = recorders.get_mut(id) {
            node.last_heartbeat = Instant::now();
            if let Some(jobs) = active_jobs {
                node.active_jobs = jobs;
                node.current_load = node.active_jobs.len() as u32;
            } else {
                node.current_load = load;
            }
            if !node.is_healthy {
                info!("Recorder {} recovered", id);
            }
            node.is_healthy = true;
            true
        } else {
            warn!("Heartbeat from unknown recorder: {}", id);
            false
        }
    }

    /// Clear a node's health flag without removing it. Works for either
    /// node kind; idempotent on already-unhealthy nodes.
    pub async fn mark_unhealthy(&self, id: &str) -> bool {
        {
            let mut servers = self.room_servers.write().await;
            if let Some(server) = servers.get_mut(id) {
                if server.is_healthy {
                    warn!("Marking room server {} unhealthy", id);
                }
                server.is_healthy = false;
                return true;
            }
        }
        let mut recorders = self.recorders.write().await;
        if let Some(node) = recorders.get_mut(id) {
            if node.is_healthy {
                warn!("Marking recorder {} unhealthy", id);
            }
            node.is_healthy = false;
            return true;
        }
        false
    }

    /// Remove a node entirely. Returns false if the id is unknown.
    pub async fn remove(&self, id: &str) -> bool {
        if self.room_servers.write().await.remove(id).is_some() {
            info!("Removed room server {}", id);
            return true;
        }
        if self.recorders.write().await.remove(id).is_some() {
            info!("Removed recorder {}", id);
            return true;
        }
        false
    }

    pub async fn get_room_server(&self, id: &str) -> Option<RoomServer> {
        self.room_servers.read().await.get(id).cloned()
    }

    pub async fn get_recorder(&self, id: &str) -> Option<RecorderNode> {
        self.recorders.read().await.get(id).cloned()
    }

    pub async fn healthy_room_servers(&self) -> Vec<RoomServer> {
        self.room_servers
            .read()
            .await
            .values()
            .filter(|s| s.is_healthy)
            .cloned()
            .collect()
    }

    pub async fn healthy_recorders(&self) -> Vec<RecorderNode> {
        self.recorders
            .read()
            .await
            .values()
            .filter(|r| r.is_healthy)
            .cloned()
            .collect()
    }

    /// Recorders in a region, optionally restricted to healthy entries.
    pub async fn recorders_in_region(&self, region: &str, healthy_only: bool) -> Vec<RecorderNode> {
        self.recorders
            .read()
            .await
            .values()
            .filter(|r| r.region == region && (!healthy_only || r.is_healthy))
            .cloned()
            .collect()
    }

    /// Clone the full registry state.
    pub async fn snapshot(&self) -> NodesSnapshot {
        NodesSnapshot {
            room_servers: self.room_servers.read().await.values().cloned().collect(),
            recorders: self.recorders.read().await.values().cloned().collect(),
        }
    }

    /// Account a placed job on a recorder. Keeps `|active_jobs| == load`.
    pub async fn reserve_recorder(&self, id: &str, job_id: &str) -> bool {
        let mut recorders = self.recorders.write().await;
        match recorders.get_mut(id) {
            Some(node) => {
                if !node.active_jobs.iter().any(|j| j == job_id) {
                    node.active_jobs.push(job_id.to_string());
                }
                node.current_load = node.active_jobs.len() as u32;
                debug!("Recorder {} load now {}", id, node.current_load);
                true
            }
            None => false,
        }
    }

    /// Release a job's slot on a recorder. Load never goes negative: it is
    /// recomputed from the active list.
    pub async fn release_recorder(&self, id: &str, job_id: &str) -> bool {
        let mut recorders = self.recorders.write().await;
        match recorders.get_mut(id) {
            Some(node) => {
                node.active_jobs.retain(|j| j != job_id);
                node.current_load = node.active_jobs.len() as u32;
                debug!("Recorder {} load now {}", id, node.current_load);
                true
            }
            None => false,
        }
    }

    /// Adjust a room server's load counter, clamped at zero.
    pub async fn bump_room_server_load(&self, id: &str, delta: i32) -> bool {
        let mut servers = self.room_servers.write().await;
        match servers.get_mut(id) {
            Some(server) => {
                let load = server.current_load as i64 + delta as i64;
                server.current_load = load.max(0) as u32;
                true
            }
            None => false,
        }
    }

    /// Scan for nodes whose last heartbeat is older than `timeout` and mark
    /// them unhealthy. Returns only the nodes that flipped in this pass.
    pub async fn reap_stale(&self, timeout: Duration) -> StaleNodes {
        let now = Instant::now();
        let mut stale = StaleNodes::default();

        {
            let mut servers = self.room_servers.write().await;
            for server in servers.values_mut() {
                if server.is_healthy && now.duration_since(server.last_heartbeat) > timeout {
                    warn!(
                        "Room server {} missed heartbeats ({}s), marking unhealthy",
                        server.id,
                        now.duration_since(server.last_heartbeat).as_secs()
                    );
                    server.is_healthy = false;
                    stale.room_servers.push(server.id.clone());
                }
            }
        }
        {
            let mut recorders = self.recorders.write().await;
            for node in recorders.values_mut() {
                if node.is_healthy && now.duration_since(node.last_heartbeat) > timeout {
                    warn!(
                        "Recorder {} missed heartbeats ({}s), marking unhealthy",
                        node.id,
                        now.duration_since(node.last_heartbeat).as_secs()
                    );
                    node.is_healthy = false;
                    stale.recorders.push(node.id.clone());
                }
            }
        }
        stale
    }

    /// Drop nodes that have been unhealthy and silent for longer than
    /// `gc_after`. Their jobs are expected to already be terminal.
    pub async fn gc_stale(&self, gc_after: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut removed = Vec::new();

        {
            let mut servers = self.room_servers.write().await;
            servers.retain(|id, server| {
                let keep =
                    server.is_healthy || now.duration_since(server.last_heartbeat) <= gc_after;
                if !keep {
                    info!("Garbage-collecting stale room server {}", id);
                    removed.push(id.clone());
                }
                keep
            });
        }
        {
            let mut recorders = self.recorders.write().await;
            recorders.retain(|id, node| {
                let keep = node.is_healthy || now.duration_since(node.last_heartbeat) <= gc_after;
                if !keep {
                    info!("Garbage-collecting stale recorder {}", id);
                    removed.push(id.clone());
                }
                keep
            });
        }
        removed
    }
}
