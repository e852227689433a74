//! Fleet metrics aggregation and scaling advice
//!
//! The aggregator periodically snapshots the registries and job store,
//! publishes the snapshot on the event bus, and appends it to the
//! repository (best-effort). Scaling recommendations are advisory only:
//! the orchestrator never provisions or decommissions nodes.

use crate::clock::BoundedClock;
use crate::config::AutoScalingConfig;
use crate::events::{Event, EventBus};
use crate::jobs::{JobFilter, JobStatus, JobStore};
use crate::registry::NodeRegistry;
use crate::repository::Repository;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-region roll-up
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionStats {
    pub room_servers: usize,
    pub recorder_nodes: usize,
    pub active_recordings: u64,
    pub capacity: u64,
    pub load: u64,
    /// Load as a percentage of capacity, 0..=100 for well-formed fleets
    pub avg_load: f64,
}

/// Immutable fleet snapshot produced by the aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_room_servers: usize,
    pub healthy_room_servers: usize,
    pub total_recorders: usize,
    pub healthy_recorders: usize,
    pub active_recordings: usize,
    pub queued_recordings: usize,
    pub total_capacity: u64,
    pub total_load: u64,
    pub regional: HashMap<String, RegionStats>,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            timestamp: DateTime::<Utc>::MIN_UTC,
            total_room_servers: 0,
            healthy_room_servers: 0,
            total_recorders: 0,
            healthy_recorders: 0,
            active_recordings: 0,
            queued_recordings: 0,
            total_capacity: 0,
            total_load: 0,
            regional: HashMap::new(),
        }
    }
}

impl MetricsSnapshot {
    /// Global utilization percentage.
    pub fn utilization(&self) -> f64 {
        if self.total_capacity == 0 {
            0.0
        } else {
            self.total_load as f64 / self.total_capacity as f64 * 100.0
        }
    }

    fn unhealthy_nodes(&self) -> usize {
        (self.total_room_servers - self.healthy_room_servers)
            + (self.total_recorders - self.healthy_recorders)
    }
}

/// Direction of a scaling recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
}

/// Urgency attached to a recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvicePriority {
    Low,
    Medium,
    High,
    Critical,
}

/// One structured scaling advisory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingRecommendation {
    /// `None` means fleet-wide
    pub region: Option<String>,
    pub action: ScalingAction,
    pub priority: AdvicePriority,
    /// Recommended node-count change (negative for scale-down)
    pub delta: i32,
    pub reason: String,
}

/// Overall fleet classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Critical,
    Warning,
    Caution,
    Healthy,
}

/// Derived alerting view over the latest snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertStatus {
    pub level: AlertLevel,
    pub utilization: f64,
    pub queue_length: usize,
    pub unhealthy_nodes: usize,
    pub reasons: Vec<String>,
}

/// Periodic fleet snapshot producer and scaling advisor
pub struct MetricsAggregator {
    registry: Arc<NodeRegistry>,
    jobs: Arc<JobStore>,
    repository: Arc<dyn Repository>,
    bus: EventBus,
    clock: Arc<BoundedClock>,
    interval: Duration,
    scaling: AutoScalingConfig,
    latest: RwLock<Option<MetricsSnapshot>>,
    last_advice: RwLock<HashMap<String, Instant>>,
}

impl MetricsAggregator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        jobs: Arc<JobStore>,
        repository: Arc<dyn Repository>,
        bus: EventBus,
        clock: Arc<BoundedClock>,
        interval: Duration,
        scaling: AutoScalingConfig,
    ) -> Self {
        Self {
            registry,
            jobs,
            repository,
            bus,
            clock,
            interval,
            scaling,
            latest: RwLock::new(None),
            last_advice: RwLock::new(HashMap::new()),
        }
    }

    /// Build a snapshot from the live registries and job store.
    pub async fn collect(&self) -> MetricsSnapshot {
        let nodes = self.registry.snapshot().await;
        let recording = self.jobs.list_active(&JobFilter {
            status: Some(JobStatus::Recording),
            ..Default::default()
        });

        let mut regional: HashMap<String, RegionStats> = HashMap::new();
        for server in &nodes.room_servers {
            regional.entry(server.region.clone()).or_default().room_servers += 1;
        }
        for node in &nodes.recorders {
            let stats = regional.entry(node.region.clone()).or_default();
            stats.recorder_nodes += 1;
            stats.capacity += node.capacity as u64;
            stats.load += node.current_load as u64;
            stats.active_recordings += node.current_load as u64;
        }
        for stats in regional.values_mut() {
            stats.avg_load = if stats.capacity == 0 {
                0.0
            } else {
                stats.load as f64 / stats.capacity as f64 * 100.0
            };
        }

        MetricsSnapshot {
            timestamp: self.clock.now(),
            total_room_servers: nodes.room_servers.len(),
            healthy_room_servers: nodes.room_servers.iter().filter(|s| s.is_healthy).count(),
            total_recorders: nodes.recorders.len(),
            healthy_recorders: nodes.recorders.iter().filter(|r| r.is_healthy).count(),
            active_recordings: recording.len(),
            queued_recordings: self.jobs.queue_len(),
            total_capacity: nodes.recorders.iter().map(|r| r.capacity as u64).sum(),
            total_load: nodes.recorders.iter().map(|r| r.current_load as u64).sum(),
            regional,
        }
    }

    /// One aggregation pass: collect, publish, persist, advise.
    pub async fn tick(&self) {
        let snapshot = self.collect().await;
        debug!(
            "Metrics: {}/{} capacity, {} active, {} queued",
            snapshot.total_load,
            snapshot.total_capacity,
            snapshot.active_recordings,
            snapshot.queued_recordings
        );

        *self.latest.write() = Some(snapshot.clone());
        self.bus.publish(Event::Metrics {
            snapshot: snapshot.clone(),
        });

        if let Err(e) = self.repository.append_metrics_snapshot(&snapshot).await {
            warn!("Skipping metrics persist: {}", e);
        }

        let advisories = self.advisories_after_cooldown(&snapshot);
        if !advisories.is_empty() {
            self.bus.publish(Event::Scaling {
                recommendations: advisories,
            });
        }
    }

    /// Run the aggregation loop at the configured cadence.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    pub fn latest(&self) -> Option<MetricsSnapshot> {
        self.latest.read().clone()
    }

    /// Structured advisory derived from the latest snapshot.
    pub fn recommendations(&self) -> Vec<ScalingRecommendation> {
        self.latest
            .read()
            .as_ref()
            .map(|s| compute_recommendations(s, &self.scaling))
            .unwrap_or_default()
    }

    /// Classify the overall fleet state from the latest snapshot.
    pub fn alert_status(&self) -> AlertStatus {
        let snapshot = self.latest.read().clone().unwrap_or_default();
        classify_alerts(&snapshot, &self.scaling)
    }

    /// Apply the advisory cooldown so pushed alerts don't repeat every tick.
    fn advisories_after_cooldown(
        &self,
        snapshot: &MetricsSnapshot,
    ) -> Vec<ScalingRecommendation> {
        let advisories = compute_recommendations(snapshot, &self.scaling);
        let now = Instant::now();
        let mut last = self.last_advice.write();
        advisories
            .into_iter()
            .filter(|advice| {
                let key = advice.region.clone().unwrap_or_else(|| "global".to_string());
                match last.get(&key) {
                    Some(at) if now.duration_since(*at) < self.scaling.cooldown_period => false,
                    _ => {
                        last.insert(key, now);
                        true
                    }
                }
            })
            .collect()
    }
}

/// Apply the advisory rules to a snapshot.
pub fn compute_recommendations(
    snapshot: &MetricsSnapshot,
    config: &AutoScalingConfig,
) -> Vec<ScalingRecommendation> {
    let mut advisories = Vec::new();

    let mut regions: Vec<(&String, &RegionStats)> = snapshot.regional.iter().collect();
    regions.sort_by(|a, b| a.0.cmp(b.0));

    for (region, stats) in regions {
        if stats.recorder_nodes == 0 {
            continue;
        }
        if stats.avg_load > config.scale_up_threshold {
            let (priority, delta) = if stats.avg_load > 90.0 {
                (AdvicePriority::Critical, 2)
            } else if stats.avg_load > 85.0 {
                (AdvicePriority::High, 1)
            } else {
                (AdvicePriority::Medium, 1)
            };
            advisories.push(ScalingRecommendation {
                region: Some(region.clone()),
                action: ScalingAction::ScaleUp,
                priority,
                delta,
                reason: format!("region {} at {:.1}% load", region, stats.avg_load),
            });
        } else if stats.avg_load < config.scale_down_threshold
            && stats.recorder_nodes > config.min_nodes
        {
            advisories.push(ScalingRecommendation {
                region: Some(region.clone()),
                action: ScalingAction::ScaleDown,
                priority: AdvicePriority::Low,
                delta: -1,
                reason: format!("region {} at {:.1}% load", region, stats.avg_load),
            });
        }
    }

    if snapshot.queued_recordings > 10 {
        advisories.push(ScalingRecommendation {
            region: None,
            action: ScalingAction::ScaleUp,
            priority: AdvicePriority::High,
            delta: 1,
            reason: format!("{} recordings waiting in queue", snapshot.queued_recordings),
        });
    }

    advisories
}

/// Classify the fleet from utilization, queue depth, node health, and
/// regional overload.
pub fn classify_alerts(snapshot: &MetricsSnapshot, config: &AutoScalingConfig) -> AlertStatus {
    let utilization = snapshot.utilization();
    let unhealthy = snapshot.unhealthy_nodes();
    let mut reasons = Vec::new();

    let work_exists = snapshot.active_recordings > 0 || snapshot.queued_recordings > 0;
    if utilization > 90.0 {
        reasons.push(format!("fleet at {utilization:.1}% capacity"));
    }
    if snapshot.healthy_recorders == 0 && work_exists {
        reasons.push("no healthy recorders for outstanding work".to_string());
    }
    let critical = !reasons.is_empty();

    if utilization > 75.0 && !critical {
        reasons.push(format!("fleet at {utilization:.1}% capacity"));
    }
    if snapshot.queued_recordings > 10 {
        reasons.push(format!("{} recordings queued", snapshot.queued_recordings));
    }
    let overloaded_regions: Vec<&String> = snapshot
        .regional
        .iter()
        .filter(|(_, stats)| stats.recorder_nodes > 0 && stats.avg_load > config.scale_up_threshold)
        .map(|(region, _)| region)
        .collect();
    for region in &overloaded_regions {
        reasons.push(format!("region {region} overloaded"));
    }
    let warning = utilization > 75.0 || snapshot.queued_recordings > 10 || !overloaded_regions.is_empty();

    if unhealthy > 0 {
        reasons.push(format!("{unhealthy} unhealthy nodes"));
    }
    if snapshot.queued_recordings > 5 && snapshot.queued_recordings <= 10 {
        reasons.push(format!("{} recordings queued", snapshot.queued_recordings));
    }
    let caution = unhealthy > 0 || snapshot.queued_recordings > 5;

    let level = if critical {
        AlertLevel::Critical
    } else if warning {
        AlertLevel::Warning
    } else if caution {
        AlertLevel::Caution
    } else {
        AlertLevel::Healthy
    };

    AlertStatus {
        level,
        utilization,
        queue_length: snapshot.queued_recordings,
        unhealthy_nodes: unhealthy,
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(recorders: usize, capacity: u64, load: u64) -> RegionStats {
        RegionStats {
            room_servers: 1,
            recorder_nodes: recorders,
            active_recordings: load,
            capacity,
            load,
            avg_load: if capacity == 0 {
                0.0
            } else {
                load as f64 / capacity as f64 * 100.0
            },
        }
    }

    fn snapshot_with(regions: Vec<(&str, RegionStats)>, queued: usize) -> MetricsSnapshot {
        let regional: HashMap<String, RegionStats> = regions
            .into_iter()
            .map(|(name, stats)| (name.to_string(), stats))
            .collect();
        let capacity = regional.values().map(|r| r.capacity).sum();
        let load = regional.values().map(|r| r.load).sum();
        let recorders = regional.values().map(|r| r.recorder_nodes).sum();
        MetricsSnapshot {
            timestamp: Utc::now(),
            total_room_servers: regional.len(),
            healthy_room_servers: regional.len(),
            total_recorders: recorders,
            healthy_recorders: recorders,
            active_recordings: load as usize,
            queued_recordings: queued,
            total_capacity: capacity,
            total_load: load,
            regional,
        }
    }

    #[test]
    fn scale_up_priority_tracks_load() {
        let config = AutoScalingConfig::default();

        let hot = snapshot_with(vec![("us-east-1", region(2, 10, 10))], 0);
        let advice = compute_recommendations(&hot, &config);
        assert_eq!(advice.len(), 1);
        assert_eq!(advice[0].action, ScalingAction::ScaleUp);
        assert_eq!(advice[0].priority, AdvicePriority::Critical);
        assert_eq!(advice[0].delta, 2);

        let warm = snapshot_with(vec![("us-east-1", region(2, 100, 87))], 0);
        let advice = compute_recommendations(&warm, &config);
        assert_eq!(advice[0].priority, AdvicePriority::High);
        assert_eq!(advice[0].delta, 1);

        let mild = snapshot_with(vec![("us-east-1", region(2, 100, 82))], 0);
        let advice = compute_recommendations(&mild, &config);
        assert_eq!(advice[0].priority, AdvicePriority::Medium);
    }

    #[test]
    fn scale_down_respects_min_nodes() {
        let config = AutoScalingConfig::default();

        let idle = snapshot_with(vec![("us-east-1", region(3, 30, 1))], 0);
        let advice = compute_recommendations(&idle, &config);
        assert_eq!(advice.len(), 1);
        assert_eq!(advice[0].action, ScalingAction::ScaleDown);
        assert_eq!(advice[0].delta, -1);
        assert_eq!(advice[0].priority, AdvicePriority::Low);

        // At the floor: no scale-down advice
        let floor = snapshot_with(vec![("us-east-1", region(1, 10, 0))], 0);
        assert!(compute_recommendations(&floor, &config).is_empty());
    }

    #[test]
    fn deep_queue_triggers_global_scale_up() {
        let config = AutoScalingConfig::default();
        let snapshot = snapshot_with(vec![("us-east-1", region(2, 10, 5))], 11);
        let advice = compute_recommendations(&snapshot, &config);
        let global: Vec<_> = advice.iter().filter(|a| a.region.is_none()).collect();
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].action, ScalingAction::ScaleUp);
        assert_eq!(global[0].priority, AdvicePriority::High);
    }

    #[test]
    fn alert_levels_escalate() {
        let config = AutoScalingConfig::default();

        let quiet = snapshot_with(vec![("us-east-1", region(2, 10, 1))], 0);
        assert_eq!(classify_alerts(&quiet, &config).level, AlertLevel::Healthy);

        let queued = snapshot_with(vec![("us-east-1", region(2, 10, 1))], 6);
        assert_eq!(classify_alerts(&queued, &config).level, AlertLevel::Caution);

        let busy = snapshot_with(vec![("us-east-1", region(2, 10, 8))], 0);
        assert_eq!(classify_alerts(&busy, &config).level, AlertLevel::Warning);

        let saturated = snapshot_with(vec![("us-east-1", region(2, 10, 10))], 2);
        assert_eq!(classify_alerts(&saturated, &config).level, AlertLevel::Critical);

        let mut dead = snapshot_with(vec![("us-east-1", region(2, 10, 0))], 1);
        dead.healthy_recorders = 0;
        assert_eq!(classify_alerts(&dead, &config).level, AlertLevel::Critical);
    }
}
