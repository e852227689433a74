//! Outbound RPC to room servers and recorder nodes
//!
//! The wire surface is small JSON-over-HTTP. The trait seam exists so the
//! dispatcher and health loop can be exercised against a fake in tests.

use crate::config::RpcTimeouts;
use crate::jobs::{PeerInfo, RecordingOptions, RtpStream};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatePortsRequest {
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatePortsResponse {
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_server_id: String,
    pub room_id: String,
}

/// Body of `POST {recorder}/start-recording`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRecordingRpc {
    pub job_id: String,
    pub peer_info: PeerInfo,
    pub rtp_streams: Vec<RtpStream>,
    pub options: RecordingOptions,
    pub room_info: RoomInfo,
    pub orchestrator_callback_url: String,
}

/// Where the room server should send the participant's RTP
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetNode {
    pub ip: String,
    pub ports: Vec<u16>,
}

/// Body of `POST {roomServer}/configure-rtp-forwarding`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureForwardingRpc {
    pub job_id: String,
    pub peer_id: String,
    pub target_node: TargetNode,
    pub rtp_streams: Vec<RtpStream>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobIdBody {
    job_id: String,
}

/// RPC surface of the external media-plane nodes.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Ask a recorder for `count` even-numbered RTP ports.
    async fn allocate_ports(&self, recorder_url: &str, count: usize) -> Result<Vec<u16>>;

    /// Start a recording on a recorder.
    async fn start_recording(&self, recorder_url: &str, request: &StartRecordingRpc)
        -> Result<()>;

    /// Stop a recording. Idempotent server-side.
    async fn stop_recording(&self, recorder_url: &str, job_id: &str) -> Result<()>;

    /// Point a room server's RTP forwarding at a recorder.
    async fn configure_rtp_forwarding(
        &self,
        room_server_url: &str,
        request: &ConfigureForwardingRpc,
    ) -> Result<()>;

    /// Stop RTP forwarding. Idempotent server-side.
    async fn stop_rtp_forwarding(&self, room_server_url: &str, job_id: &str) -> Result<()>;
}

/// reqwest-backed RPC client with per-call deadlines
pub struct HttpNodeRpc {
    client: reqwest::Client,
    timeouts: RpcTimeouts,
}

impl HttpNodeRpc {
    pub fn new(timeouts: RpcTimeouts) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeouts,
        }
    }

    async fn post_json<B: Serialize>(
        &self,
        url: String,
        body: &B,
        timeout: std::time::Duration,
    ) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(Error::from_rpc)?;
        if !response.status().is_success() {
            return Err(Error::Rpc(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl NodeRpc for HttpNodeRpc {
    async fn allocate_ports(&self, recorder_url: &str, count: usize) -> Result<Vec<u16>> {
        debug!("Allocating {} ports on {}", count, recorder_url);
        let response = self
            .post_json(
                format!("{recorder_url}/allocate-ports"),
                &AllocatePortsRequest { count },
                self.timeouts.allocate_ports,
            )
            .await?;
        let body: AllocatePortsResponse = response.json().await.map_err(Error::from_rpc)?;
        Ok(body.ports)
    }

    async fn start_recording(
        &self,
        recorder_url: &str,
        request: &StartRecordingRpc,
    ) -> Result<()> {
        debug!("Starting recording {} on {}", request.job_id, recorder_url);
        self.post_json(
            format!("{recorder_url}/start-recording"),
            request,
            self.timeouts.start,
        )
        .await?;
        Ok(())
    }

    async fn stop_recording(&self, recorder_url: &str, job_id: &str) -> Result<()> {
        debug!("Stopping recording {} on {}", job_id, recorder_url);
        self.post_json(
            format!("{recorder_url}/stop-recording"),
            &JobIdBody {
                job_id: job_id.to_string(),
            },
            self.timeouts.stop,
        )
        .await?;
        Ok(())
    }

    async fn configure_rtp_forwarding(
        &self,
        room_server_url: &str,
        request: &ConfigureForwardingRpc,
    ) -> Result<()> {
        debug!(
            "Configuring RTP forwarding for {} via {}",
            request.job_id, room_server_url
        );
        self.post_json(
            format!("{room_server_url}/configure-rtp-forwarding"),
            request,
            self.timeouts.start,
        )
        .await?;
        Ok(())
    }

    async fn stop_rtp_forwarding(&self, room_server_url: &str, job_id: &str) -> Result<()> {
        debug!("Stopping RTP forwarding for {} via {}", job_id, room_server_url);
        self.post_json(
            format!("{room_server_url}/stop-rtp-forwarding"),
            &JobIdBody {
                job_id: job_id.to_string(),
            },
            self.timeouts.stop,
        )
        .await?;
        Ok(())
    }
}
