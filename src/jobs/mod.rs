//! Recording job model and lifecycle
//!
//! A job is the control-plane record of one ongoing or past recording. Jobs
//! are owned by the [`JobStore`] while active; a terminal-state copy is
//! persisted to the repository. Cross-references to nodes are by identifier
//! only, never ownership edges.

mod store;

pub use store::{JobFilter, JobPatch, JobStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Job lifecycle states.
///
/// ```text
/// pending      -> initializing | failed | cancelled
/// initializing -> recording    | failed | cancelled
/// recording    -> initializing | completed | failed | cancelled
/// completed, failed, cancelled : terminal
/// ```
///
/// The `recording -> initializing` edge exists for failover reassignment:
/// a job whose recorder died re-enters placement and runs the assignment
/// sequence again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Initializing,
    Recording,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine permits `self -> to`.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Initializing)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Initializing, Recording)
                | (Initializing, Failed)
                | (Initializing, Cancelled)
                | (Recording, Initializing)
                | (Recording, Completed)
                | (Recording, Failed)
                | (Recording, Cancelled)
        )
    }
}

/// Media kind of one forwarded RTP stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Audio,
    Video,
}

/// One RTP stream to forward from the room server to the recorder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpStream {
    pub kind: StreamKind,
    /// Destination port; rewritten to the recorder-allocated port at assign
    pub port: u16,
    pub payload_type: u8,
    pub ssrc: u32,
    pub codec_name: String,
}

/// Recording quality preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Low,
    Medium,
    High,
}

/// Output container format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    Mp4,
    Webm,
    Mkv,
}

fn default_true() -> bool {
    true
}

/// Recording options carried on the request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingOptions {
    pub quality: Quality,
    pub format: ContainerFormat,
    #[serde(default = "default_true")]
    pub include_audio: bool,
    #[serde(default = "default_true")]
    pub include_video: bool,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
}

impl RecordingOptions {
    /// Transcoding weight used as the placement hint. Video quality drives
    /// the cost; audio-only jobs are always light.
    pub fn estimated_load(&self) -> u32 {
        if !self.include_video {
            return 1;
        }
        match self.quality {
            Quality::Low => 1,
            Quality::Medium => 2,
            Quality::High => 3,
        }
    }
}

/// Descriptor of the participant being recorded
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub display_name: String,
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
}

/// Who asked for the recording. The token is opaque pass-through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequesterInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// Post-run metrics reported by the recorder
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetrics {
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub bytes_written: Option<u64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// RTP forwarding configuration: where the room server sends the streams.
/// Invariant: `ports.len() == rtp_streams.len()` on the owning job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpForwarding {
    /// IP extracted from the recorder's endpoint URL
    pub target_ip: String,
    /// Ports allocated by the recorder, one per stream
    pub ports: Vec<u16>,
}

/// Control-plane record of one recording
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingJob {
    /// Generated identifier: `rec-<unixMillis>-<suffix>`
    pub job_id: String,
    pub room_server_id: String,
    pub room_id: String,
    pub peer_id: String,
    pub peer_info: PeerInfo,
    /// Empty until placement
    #[serde(default)]
    pub recorder_id: Option<String>,
    pub rtp_streams: Vec<RtpStream>,
    #[serde(default)]
    pub rtp_forwarding: Option<RtpForwarding>,
    pub options: RecordingOptions,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub requester: RequesterInfo,
    #[serde(default)]
    pub metrics: Option<JobMetrics>,
}

impl RecordingJob {
    /// Queue priority: higher drains first. FIFO within equal priority.
    ///
    /// Base 50; authenticated peers +20, moderators +30, presenters +15;
    /// +1 per 10 s spent pending (capped at +20); high quality -10,
    /// low quality +5.
    pub fn priority(&self, now: DateTime<Utc>) -> i32 {
        let mut score = 50;
        if self.peer_info.authenticated {
            score += 20;
        }
        if self.peer_info.roles.iter().any(|r| r == "moderator") {
            score += 30;
        }
        if self.peer_info.roles.iter().any(|r| r == "presenter") {
            score += 15;
        }
        let age_secs = (now - self.started_at).num_seconds().max(0);
        score += ((age_secs / 10) as i32).min(20);
        score += match self.options.quality {
            Quality::High => -10,
            Quality::Medium => 0,
            Quality::Low => 5,
        };
        score
    }
}

/// A request to start recording one participant
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRecordingRequest {
    pub room_server_id: String,
    pub room_id: String,
    pub peer_id: String,
    #[serde(default)]
    pub peer_info: PeerInfo,
    pub rtp_streams: Vec<RtpStream>,
    pub options: RecordingOptions,
    #[serde(default)]
    pub requester: RequesterInfo,
}
