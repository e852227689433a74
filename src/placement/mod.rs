//! Placement engine
//!
//! Pure selection logic: given candidate recorders and a requirement, pick
//! the best one or none. No clocks, no locks, no I/O — the dispatcher and
//! health loop feed it snapshots and act on the result.

use crate::registry::{RecorderNode, RoomServer};
use serde::{Deserialize, Serialize};

/// What a job needs from a recorder
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementRequirement {
    /// Preferred region (the requesting room server's region)
    pub region: String,
    /// Codec names the recorder must ideally support
    #[serde(default)]
    pub codecs: Vec<String>,
    /// Transcoding weight estimate (1 = light, 3 = heavy)
    pub estimated_load: u32,
    /// Keep only GPU nodes if any survive the other filters
    #[serde(default)]
    pub prefer_gpu: bool,
    /// Hard floor on core count
    #[serde(default)]
    pub min_cores: Option<u32>,
    /// Hard floor on RAM
    #[serde(default)]
    pub min_memory_bytes: Option<u64>,
}

const WEIGHT_FREE_CAPACITY: f64 = 40.0;
const BONUS_REGION_MATCH: f64 = 25.0;
const PENALTY_CROSS_REGION: f64 = -10.0;
const BONUS_GPU_FOR_HEAVY: f64 = 20.0;
const BONUS_NO_GPU_FOR_LIGHT: f64 = 10.0;
const MAX_CORE_SCORE: f64 = 10.0;
const WEIGHT_LOAD_PENALTY: f64 = 5.0;
const BONUS_CODEC_MATCH: f64 = 5.0;

/// Stateless recorder/room-server selection
#[derive(Debug, Clone, Copy, Default)]
pub struct PlacementEngine;

impl PlacementEngine {
    pub fn new() -> Self {
        Self
    }

    /// Pick a recorder for the requirement, or none.
    ///
    /// Filters run in order: availability (hard), region preference
    /// (falls back), codec compatibility (falls back, scored), hardware
    /// floors (hard), GPU preference (falls back). Survivors are scored
    /// and the maximum wins; ties break on lexicographic id.
    pub fn select_recorder(
        &self,
        candidates: &[RecorderNode],
        req: &PlacementRequirement,
    ) -> Option<RecorderNode> {
        let available: Vec<&RecorderNode> =
            candidates.iter().filter(|r| r.can_accept()).collect();
        if available.is_empty() {
            return None;
        }

        let regional: Vec<&RecorderNode> = available
            .iter()
            .copied()
            .filter(|r| r.region == req.region)
            .collect();
        let pool = if regional.is_empty() { available } else { regional };

        let codec_matched: Vec<&RecorderNode> = pool
            .iter()
            .copied()
            .filter(|r| supports_codecs(r, &req.codecs))
            .collect();
        let pool = if codec_matched.is_empty() {
            pool
        } else {
            codec_matched
        };

        let pool: Vec<&RecorderNode> = pool
            .into_iter()
            .filter(|r| {
                req.min_cores.map_or(true, |min| r.specs.cpu_cores >= min)
                    && req
                        .min_memory_bytes
                        .map_or(true, |min| r.specs.memory_bytes >= min)
            })
            .collect();
        if pool.is_empty() {
            return None;
        }

        let pool = if req.prefer_gpu {
            let gpu: Vec<&RecorderNode> =
                pool.iter().copied().filter(|r| r.specs.has_gpu).collect();
            if gpu.is_empty() {
                pool
            } else {
                gpu
            }
        } else {
            pool
        };

        pool.into_iter()
            .max_by(|a, b| {
                self.score(a, req)
                    .partial_cmp(&self.score(b, req))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // On equal score the lexicographically smaller id wins
                    .then_with(|| b.id.cmp(&a.id))
            })
            .cloned()
    }

    /// Score one candidate against the requirement. Clamped at zero.
    pub fn score(&self, node: &RecorderNode, req: &PlacementRequirement) -> f64 {
        let capacity = node.capacity.max(1) as f64;
        let free_ratio = (capacity - node.current_load as f64) / capacity;

        let mut score = free_ratio * WEIGHT_FREE_CAPACITY;

        score += if node.region == req.region {
            BONUS_REGION_MATCH
        } else {
            PENALTY_CROSS_REGION
        };

        if node.specs.has_gpu && req.estimated_load > 2 {
            score += BONUS_GPU_FOR_HEAVY;
        } else if !node.specs.has_gpu && req.estimated_load <= 1 {
            score += BONUS_NO_GPU_FOR_LIGHT;
        }

        score += (node.specs.cpu_cores as f64 * 2.0).min(MAX_CORE_SCORE);
        score -= node.load_ratio() * WEIGHT_LOAD_PENALTY;

        if supports_codecs(node, &req.codecs) {
            score += BONUS_CODEC_MATCH;
        }

        score.max(0.0)
    }

    /// Pick a room server for a room: a healthy server already hosting the
    /// room wins, otherwise the least-loaded healthy server by load ratio.
    pub fn select_room_server(
        &self,
        servers: &[RoomServer],
        room_id: &str,
    ) -> Option<RoomServer> {
        let healthy: Vec<&RoomServer> = servers.iter().filter(|s| s.is_healthy).collect();

        let hosting: Vec<&RoomServer> = healthy
            .iter()
            .copied()
            .filter(|s| s.rooms.iter().any(|r| r == room_id))
            .collect();
        let pool = if hosting.is_empty() { healthy } else { hosting };

        pool.into_iter()
            .min_by(|a, b| {
                a.load_ratio()
                    .partial_cmp(&b.load_ratio())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned()
    }
}

fn supports_codecs(node: &RecorderNode, codecs: &[String]) -> bool {
    codecs
        .iter()
        .all(|c| node.supported_codecs.iter().any(|s| s == c))
}
