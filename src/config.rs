//! Orchestrator configuration
//!
//! Plain configuration structs with production defaults. The binary layers
//! CLI/environment overrides on top; the core only ever sees these values.

use std::time::Duration;

/// Top-level orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Health Loop cadence
    pub health_check_interval: Duration,
    /// Heartbeat staleness threshold before a node is marked unhealthy
    pub node_timeout: Duration,
    /// How long an unhealthy node is kept before it is garbage-collected
    pub node_gc_after: Duration,
    /// Metrics Aggregator cadence
    pub metrics_interval: Duration,
    /// Cap on concurrent jobs per recorder, applied on top of the
    /// hardware-derived capacity (the smaller of the two wins)
    pub max_concurrent_per_node: u32,
    /// Base URL recorders use to reach this orchestrator's event callback
    pub callback_base_url: String,
    /// RPC deadlines for outbound calls
    pub rpc: RpcTimeouts,
    /// Advisory auto-scaling thresholds
    pub auto_scaling: AutoScalingConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            node_timeout: Duration::from_secs(60),
            node_gc_after: Duration::from_secs(600),
            metrics_interval: Duration::from_secs(15),
            max_concurrent_per_node: 6,
            callback_base_url: "http://127.0.0.1:8090".to_string(),
            rpc: RpcTimeouts::default(),
            auto_scaling: AutoScalingConfig::default(),
        }
    }
}

/// Deadlines for outbound RPC to room servers and recorders
#[derive(Debug, Clone)]
pub struct RpcTimeouts {
    /// Port allocation on a recorder
    pub allocate_ports: Duration,
    /// RTP forwarding setup and recorder start
    pub start: Duration,
    /// Stop calls (both node kinds)
    pub stop: Duration,
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self {
            allocate_ports: Duration::from_secs(5),
            start: Duration::from_secs(15),
            stop: Duration::from_secs(10),
        }
    }
}

/// Advisory auto-scaling parameters. The orchestrator only recommends;
/// it never provisions or decommissions nodes.
#[derive(Debug, Clone)]
pub struct AutoScalingConfig {
    /// Lower bound on recorder fleet size per region
    pub min_nodes: usize,
    /// Upper bound on recorder fleet size per region
    pub max_nodes: usize,
    /// Regional average load (percent) above which scale-up is advised
    pub scale_up_threshold: f64,
    /// Regional average load (percent) below which scale-down is advised
    pub scale_down_threshold: f64,
    /// Minimum spacing between repeated recommendations for a region
    pub cooldown_period: Duration,
}

impl Default for AutoScalingConfig {
    fn default() -> Self {
        Self {
            min_nodes: 1,
            max_nodes: 10,
            scale_up_threshold: 80.0,
            scale_down_threshold: 30.0,
            cooldown_period: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.node_timeout, Duration::from_secs(60));
        assert_eq!(config.metrics_interval, Duration::from_secs(15));
        assert_eq!(config.max_concurrent_per_node, 6);
        assert_eq!(config.rpc.allocate_ports, Duration::from_secs(5));
        assert_eq!(config.rpc.start, Duration::from_secs(15));
        assert_eq!(config.rpc.stop, Duration::from_secs(10));
    }
}
