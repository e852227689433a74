//! Dispatcher: placement execution and job lifecycle
//!
//! Carries out what the placement engine decides: allocates RTP ports on
//! the recorder, points the room server's forwarding at them, starts the
//! recorder, and keeps load accounting and the job state machine in step.
//! Every step after a side effect has a best-effort rollback; residual
//! state in external nodes is reconciled later by heartbeat reflection.

pub mod rpc;

pub use rpc::{
    AllocatePortsRequest, AllocatePortsResponse, ConfigureForwardingRpc, HttpNodeRpc, NodeRpc,
    RoomInfo, StartRecordingRpc, TargetNode,
};

use crate::events::{Event, EventBus};
use crate::jobs::{
    JobMetrics, JobPatch, JobStatus, JobStore, RecordingJob, RtpForwarding,
    StartRecordingRequest,
};
use crate::placement::{PlacementEngine, PlacementRequirement};
use crate::registry::{NodeRegistry, RecorderNode, RoomServer};
use crate::repository::{JobHistoryFilter, Paging, Repository};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Event kinds a recorder reports back to the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderEvent {
    Started,
    Progress,
    Completed,
    Failed,
}

/// Payload of the recorder's event callback
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderCallback {
    pub job_id: String,
    pub event: RecorderEvent,
    #[serde(default)]
    pub data: CallbackData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackData {
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: Option<JobMetrics>,
}

/// Orchestrates placement, rollback, and teardown of recordings.
pub struct Dispatcher {
    registry: Arc<NodeRegistry>,
    jobs: Arc<JobStore>,
    placement: PlacementEngine,
    rpc: Arc<dyn NodeRpc>,
    repository: Arc<dyn Repository>,
    bus: EventBus,
    callback_base_url: String,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<NodeRegistry>,
        jobs: Arc<JobStore>,
        placement: PlacementEngine,
        rpc: Arc<dyn NodeRpc>,
        repository: Arc<dyn Repository>,
        bus: EventBus,
        callback_base_url: String,
    ) -> Self {
        Self {
            registry,
            jobs,
            placement,
            rpc,
            repository,
            bus,
            callback_base_url,
        }
    }

    /// Accept a recording request: create the job, try to place it, and
    /// either assign immediately or enqueue. The returned job carries the
    /// outcome in its status (`recording`, `pending`, or `failed`).
    pub async fn start_recording(&self, request: StartRecordingRequest) -> Result<RecordingJob> {
        let room_server = self
            .registry
            .get_room_server(&request.room_server_id)
            .await
            .filter(|s| s.is_healthy)
            .ok_or_else(|| Error::NoRoomServer(request.room_server_id.clone()))?;

        let job = self.jobs.create(request);

        let candidates = self.registry.healthy_recorders().await;
        let requirement = self.requirement_for(&job, &room_server);

        let outcome = match self.placement.select_recorder(&candidates, &requirement) {
            Some(recorder) => match self.assign(&job.job_id, &recorder, &room_server).await {
                Ok(assigned) => assigned,
                Err(e) => {
                    // assign() already moved the job terminal and persisted it
                    warn!("Assignment of {} failed: {}", job.job_id, e);
                    match self.stored_outcome(&job.job_id).await {
                        Ok(failed) => failed,
                        Err(_) => {
                            // Store unreachable: synthesize the terminal view
                            let mut failed = job.clone();
                            failed.status = JobStatus::Failed;
                            failed.error_message = Some(e.to_string());
                            failed
                        }
                    }
                }
            },
            None => {
                info!("No recorder available for {}, queueing", job.job_id);
                self.jobs.enqueue(&job.job_id);
                let job = self.jobs.get(&job.job_id).unwrap_or(job);
                self.persist(&job).await;
                self.publish(&job);
                job
            }
        };
        Ok(outcome)
    }

    /// Execute a placement: port allocation, forwarding setup, recorder
    /// start, load accounting, and the transition to `recording`.
    pub async fn assign(
        &self,
        job_id: &str,
        recorder: &RecorderNode,
        room_server: &RoomServer,
    ) -> Result<RecordingJob> {
        let current = self
            .jobs
            .get(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;

        let job = if current.status == JobStatus::Initializing {
            // Reassignment of a job that never left initializing
            self.jobs.patch(
                job_id,
                JobPatch {
                    recorder_id: Some(recorder.id.clone()),
                    ..Default::default()
                },
            )?
        } else {
            self.jobs.transition(
                job_id,
                JobStatus::Initializing,
                JobPatch {
                    recorder_id: Some(recorder.id.clone()),
                    ..Default::default()
                },
            )?
        };

        let stream_count = job.rtp_streams.len();
        let ports = match self.rpc.allocate_ports(&recorder.url, stream_count).await {
            Ok(ports) if ports.len() == stream_count => ports,
            Ok(ports) => {
                let reason = format!(
                    "recorder allocated {} ports, expected {}",
                    ports.len(),
                    stream_count
                );
                // Release whatever the recorder set aside
                self.best_effort_stop_recorder(&recorder.url, job_id).await;
                return self.fail_assignment(job_id, reason).await;
            }
            Err(e) => return self.fail_assignment(job_id, e.to_string()).await,
        };

        let target_ip = match extract_host(&recorder.url) {
            Ok(ip) => ip,
            Err(e) => {
                self.best_effort_stop_recorder(&recorder.url, job_id).await;
                return self.fail_assignment(job_id, e.to_string()).await;
            }
        };

        let mut streams = job.rtp_streams.clone();
        for (stream, port) in streams.iter_mut().zip(&ports) {
            stream.port = *port;
        }
        let forwarding = RtpForwarding {
            target_ip: target_ip.clone(),
            ports: ports.clone(),
        };

        let forward_request = ConfigureForwardingRpc {
            job_id: job.job_id.clone(),
            peer_id: job.peer_id.clone(),
            target_node: TargetNode {
                ip: target_ip,
                ports,
            },
            rtp_streams: streams.clone(),
        };
        if let Err(e) = self
            .rpc
            .configure_rtp_forwarding(&room_server.url, &forward_request)
            .await
        {
            self.best_effort_stop_recorder(&recorder.url, job_id).await;
            return self.fail_assignment(job_id, e.to_string()).await;
        }

        let start_request = StartRecordingRpc {
            job_id: job.job_id.clone(),
            peer_info: job.peer_info.clone(),
            rtp_streams: streams.clone(),
            options: job.options.clone(),
            room_info: RoomInfo {
                room_server_id: room_server.id.clone(),
                room_id: job.room_id.clone(),
            },
            orchestrator_callback_url: format!(
                "{}/api/v1/callbacks/recorder",
                self.callback_base_url
            ),
        };
        if let Err(e) = self.rpc.start_recording(&recorder.url, &start_request).await {
            self.best_effort_stop_forwarding(&room_server.url, job_id).await;
            self.best_effort_stop_recorder(&recorder.url, job_id).await;
            return self.fail_assignment(job_id, e.to_string()).await;
        }

        self.registry.reserve_recorder(&recorder.id, job_id).await;
        self.registry.bump_room_server_load(&room_server.id, 1).await;

        let job = self.jobs.transition(
            job_id,
            JobStatus::Recording,
            JobPatch {
                rtp_streams: Some(streams),
                rtp_forwarding: Some(forwarding),
                ..Default::default()
            },
        )?;
        info!(
            "Job {} recording on {} ({} streams)",
            job.job_id, recorder.id, stream_count
        );
        self.persist(&job).await;
        self.publish(&job);
        Ok(job)
    }

    /// Stop a recording. Terminal jobs are a no-op returning the stored
    /// outcome; no RPC is emitted for them.
    pub async fn stop_recording(&self, job_id: &str) -> Result<RecordingJob> {
        let Some(job) = self.jobs.get(job_id) else {
            return self.stored_outcome(job_id).await;
        };

        if job.status == JobStatus::Pending {
            let job = self.jobs.transition(job_id, JobStatus::Cancelled, JobPatch::default())?;
            self.persist(&job).await;
            self.publish(&job);
            return Ok(job);
        }

        let mut stop_error: Option<String> = None;

        if let Some(recorder_id) = &job.recorder_id {
            if let Some(recorder) = self.registry.get_recorder(recorder_id).await {
                if let Err(e) = self.rpc.stop_recording(&recorder.url, job_id).await {
                    warn!("Stop of {} on {} failed: {}", job_id, recorder_id, e);
                    stop_error = Some(e.to_string());
                }
            }
        }
        if let Some(server) = self.registry.get_room_server(&job.room_server_id).await {
            if let Err(e) = self.rpc.stop_rtp_forwarding(&server.url, job_id).await {
                warn!("Forwarding stop for {} failed: {}", job_id, e);
                stop_error.get_or_insert(e.to_string());
            }
        }

        // Local accounting is always released, whatever the RPCs said
        self.release_placement(&job).await;

        let (status, patch) = match stop_error {
            None => (JobStatus::Completed, JobPatch::default()),
            Some(message) => (
                JobStatus::Failed,
                JobPatch {
                    error_message: Some(message),
                    ..Default::default()
                },
            ),
        };
        let job = self.jobs.transition(job_id, status, patch)?;
        self.persist(&job).await;
        self.publish(&job);
        Ok(job)
    }

    /// Process an event callback from a recorder. Events for unknown or
    /// terminal jobs are dropped idempotently.
    pub async fn handle_recorder_event(
        &self,
        callback: RecorderCallback,
    ) -> Result<Option<RecordingJob>> {
        let Some(job) = self.jobs.get(&callback.job_id) else {
            debug!(
                "Dropping {:?} callback for unknown/terminal job {}",
                callback.event, callback.job_id
            );
            return Ok(None);
        };

        match callback.event {
            RecorderEvent::Started => {
                debug!("Recorder confirmed start of {}", job.job_id);
                Ok(Some(job))
            }
            RecorderEvent::Progress => {
                let job = match callback.data.metrics {
                    Some(metrics) => self.jobs.patch(
                        &job.job_id,
                        JobPatch {
                            metrics: Some(metrics),
                            ..Default::default()
                        },
                    )?,
                    None => job,
                };
                Ok(Some(job))
            }
            RecorderEvent::Completed => {
                if let Some(server) = self.registry.get_room_server(&job.room_server_id).await {
                    self.best_effort_stop_forwarding(&server.url, &job.job_id).await;
                }
                self.release_placement(&job).await;
                let job = self.jobs.transition(
                    &job.job_id,
                    JobStatus::Completed,
                    JobPatch {
                        output_path: callback.data.output_path,
                        metrics: callback.data.metrics,
                        ..Default::default()
                    },
                )?;
                self.persist(&job).await;
                self.publish(&job);
                Ok(Some(job))
            }
            RecorderEvent::Failed => {
                if let Some(server) = self.registry.get_room_server(&job.room_server_id).await {
                    self.best_effort_stop_forwarding(&server.url, &job.job_id).await;
                }
                self.release_placement(&job).await;
                let reason = callback
                    .data
                    .error
                    .unwrap_or_else(|| "recorder reported failure".to_string());
                let job = self.jobs.transition(
                    &job.job_id,
                    JobStatus::Failed,
                    JobPatch {
                        error_message: Some(reason),
                        metrics: callback.data.metrics,
                        ..Default::default()
                    },
                )?;
                self.persist(&job).await;
                self.publish(&job);
                Ok(Some(job))
            }
        }
    }

    /// Transition a job terminal `failed` without touching accounting.
    pub async fn fail_job(&self, job_id: &str, reason: &str) -> Result<RecordingJob> {
        let job = self.jobs.transition(
            job_id,
            JobStatus::Failed,
            JobPatch {
                error_message: Some(reason.to_string()),
                ..Default::default()
            },
        )?;
        self.persist(&job).await;
        self.publish(&job);
        Ok(job)
    }

    /// Tear down a placed job: best-effort stops to both nodes, release of
    /// local accounting, then a terminal `failed` transition.
    pub async fn abort_placed_job(&self, job_id: &str, reason: &str) -> Result<RecordingJob> {
        if let Some(job) = self.jobs.get(job_id) {
            if let Some(recorder_id) = &job.recorder_id {
                if let Some(recorder) = self.registry.get_recorder(recorder_id).await {
                    self.best_effort_stop_recorder(&recorder.url, job_id).await;
                }
            }
            if let Some(server) = self.registry.get_room_server(&job.room_server_id).await {
                if server.is_healthy {
                    self.best_effort_stop_forwarding(&server.url, job_id).await;
                }
            }
            self.release_placement(&job).await;
        }
        self.fail_job(job_id, reason).await
    }

    /// Release a job's load accounting on its recorder and room server.
    /// Counters clamp at zero.
    pub async fn release_placement(&self, job: &RecordingJob) {
        if let Some(recorder_id) = &job.recorder_id {
            self.registry.release_recorder(recorder_id, &job.job_id).await;
        }
        self.registry
            .bump_room_server_load(&job.room_server_id, -1)
            .await;
    }

    /// Derive the placement requirement for a job. The region hint is the
    /// room server's region, also on reassignment.
    pub fn requirement_for(
        &self,
        job: &RecordingJob,
        room_server: &RoomServer,
    ) -> PlacementRequirement {
        let mut codecs: Vec<String> = job
            .rtp_streams
            .iter()
            .map(|s| s.codec_name.clone())
            .collect();
        codecs.sort();
        codecs.dedup();
        let estimated_load = job.options.estimated_load();
        PlacementRequirement {
            region: room_server.region.clone(),
            codecs,
            estimated_load,
            prefer_gpu: estimated_load > 2,
            min_cores: None,
            min_memory_bytes: None,
        }
    }

    /// Persist a job snapshot. Store failures are logged and never block
    /// the transition.
    pub async fn persist(&self, job: &RecordingJob) {
        if let Err(e) = self.repository.upsert_job(job).await {
            warn!("Skipping persist of {}: {}", job.job_id, e);
        }
    }

    pub fn publish(&self, job: &RecordingJob) {
        self.bus.publish(Event::Recording { job: job.clone() });
    }

    async fn fail_assignment(&self, job_id: &str, reason: String) -> Result<RecordingJob> {
        warn!("Assignment of {} failed: {}", job_id, reason);
        let job = self.fail_job(job_id, &reason).await?;
        Err(Error::Rpc(job.error_message.unwrap_or(reason)))
    }

    async fn best_effort_stop_recorder(&self, recorder_url: &str, job_id: &str) {
        if let Err(e) = self.rpc.stop_recording(recorder_url, job_id).await {
            debug!("Rollback stop on {} ignored error: {}", recorder_url, e);
        }
    }

    async fn best_effort_stop_forwarding(&self, room_server_url: &str, job_id: &str) {
        if let Err(e) = self.rpc.stop_rtp_forwarding(room_server_url, job_id).await {
            debug!(
                "Rollback forwarding stop on {} ignored error: {}",
                room_server_url, e
            );
        }
    }

    async fn stored_outcome(&self, job_id: &str) -> Result<RecordingJob> {
        let filter = JobHistoryFilter {
            job_id: Some(job_id.to_string()),
            ..Default::default()
        };
        let mut matches = self
            .repository
            .query_job_history(&filter, &Paging::default())
            .await?;
        matches
            .pop()
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }
}

/// Pull the host out of a node endpoint URL.
fn extract_host(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| Error::Internal(format!("bad node endpoint {url}: {e}")))?;
    parsed
        .host_str()
        .map(|h| h.to_string())
        .ok_or_else(|| Error::Internal(format!("node endpoint {url} has no host")))
}
