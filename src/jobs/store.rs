//! In-memory job store: active map plus pending queue

use super::{JobStatus, RecordingJob, RtpForwarding, RtpStream, StartRecordingRequest};
use crate::clock::BoundedClock;
use crate::jobs::JobMetrics;
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

/// Filter for active-job listings
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub room_server_id: Option<String>,
    pub room_id: Option<String>,
    pub status: Option<JobStatus>,
}

impl JobFilter {
    fn matches(&self, job: &RecordingJob) -> bool {
        if let Some(id) = &self.room_server_id {
            if &job.room_server_id != id {
                return false;
            }
        }
        if let Some(id) = &self.room_id {
            if &job.room_id != id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        true
    }
}

/// Fields a transition may update alongside the status change
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub recorder_id: Option<String>,
    pub rtp_streams: Option<Vec<RtpStream>>,
    pub rtp_forwarding: Option<RtpForwarding>,
    pub output_path: Option<String>,
    pub error_message: Option<String>,
    pub metrics: Option<JobMetrics>,
}

/// Owns every non-terminal job. Terminal transitions evict the job from the
/// active map; the returned copy is what callers persist to the repository.
pub struct JobStore {
    active: DashMap<String, RecordingJob>,
    pending: RwLock<VecDeque<String>>,
    clock: Arc<BoundedClock>,
}

impl JobStore {
    pub fn new(clock: Arc<BoundedClock>) -> Self {
        Self {
            active: DashMap::new(),
            pending: RwLock::new(VecDeque::new()),
            clock,
        }
    }

    /// Create a job in `pending` with no recorder assigned.
    pub fn create(&self, request: StartRecordingRequest) -> RecordingJob {
        let job_id = format!(
            "rec-{}-{:06x}",
            self.clock.unix_millis(),
            rand::random::<u32>() & 0xff_ffff
        );
        let job = RecordingJob {
            job_id: job_id.clone(),
            room_server_id: request.room_server_id,
            room_id: request.room_id,
            peer_id: request.peer_id,
            peer_info: request.peer_info,
            recorder_id: None,
            rtp_streams: request.rtp_streams,
            rtp_forwarding: None,
            options: request.options,
            status: JobStatus::Pending,
            started_at: self.clock.now(),
            ended_at: None,
            output_path: None,
            error_message: None,
            requester: request.requester,
            metrics: None,
        };
        self.active.insert(job_id.clone(), job.clone());
        debug!("Created job {} for peer {}", job.job_id, job.peer_id);
        job
    }

    /// Re-seed a job from a persisted snapshot (warm restart).
    pub fn restore(&self, job: RecordingJob) {
        self.active.insert(job.job_id.clone(), job);
    }

    pub fn get(&self, job_id: &str) -> Option<RecordingJob> {
        self.active.get(job_id).map(|j| j.clone())
    }

    pub fn list_active(&self, filter: &JobFilter) -> Vec<RecordingJob> {
        self.active
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Active jobs currently placed on the given recorder.
    pub fn jobs_on_recorder(&self, recorder_id: &str) -> Vec<RecordingJob> {
        self.active
            .iter()
            .filter(|entry| entry.value().recorder_id.as_deref() == Some(recorder_id))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Remove a job from the active map without a transition. Used after the
    /// terminal copy has been persisted.
    pub fn remove(&self, job_id: &str) -> Option<RecordingJob> {
        self.remove_from_queue(job_id);
        self.active.remove(job_id).map(|(_, job)| job)
    }

    /// Append to the pending queue (no duplicates).
    pub fn enqueue(&self, job_id: &str) {
        let mut queue = self.pending.write();
        if !queue.iter().any(|id| id == job_id) {
            queue.push_back(job_id.to_string());
            info!("Queued job {} ({} waiting)", job_id, queue.len());
        }
    }

    /// Remove and return the first queued job satisfying the predicate.
    pub fn dequeue_first_matching<F>(&self, pred: F) -> Option<RecordingJob>
    where
        F: Fn(&RecordingJob) -> bool,
    {
        let mut queue = self.pending.write();
        let pos = queue.iter().position(|id| {
            self.active
                .get(id.as_str())
                .map(|job| pred(job.value()))
                .unwrap_or(false)
        })?;
        let job_id = queue.remove(pos)?;
        drop(queue);
        self.get(&job_id)
    }

    /// Snapshot of queued job ids, drain-ordered: priority descending,
    /// FIFO within equal priority.
    pub fn queue_snapshot(&self) -> Vec<String> {
        let now = self.clock.now();
        let queue = self.pending.read();
        let mut entries: Vec<(usize, String, i32)> = queue
            .iter()
            .enumerate()
            .map(|(pos, id)| {
                let priority = self
                    .active
                    .get(id.as_str())
                    .map(|job| job.priority(now))
                    .unwrap_or(i32::MIN);
                (pos, id.clone(), priority)
            })
            .collect();
        entries.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
        entries.into_iter().map(|(_, id, _)| id).collect()
    }

    pub fn queue_len(&self) -> usize {
        self.pending.read().len()
    }

    pub fn remove_from_queue(&self, job_id: &str) -> bool {
        let mut queue = self.pending.write();
        let before = queue.len();
        queue.retain(|id| id != job_id);
        queue.len() != before
    }

    /// Update job fields without a status change. Used for reassignment
    /// bookkeeping and progress-metrics merges.
    pub fn patch(&self, job_id: &str, patch: JobPatch) -> Result<RecordingJob> {
        let mut entry = self
            .active
            .get_mut(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        let job = entry.value_mut();
        if let Some(recorder_id) = patch.recorder_id {
            job.recorder_id = Some(recorder_id);
        }
        if let Some(streams) = patch.rtp_streams {
            job.rtp_streams = streams;
        }
        if let Some(forwarding) = patch.rtp_forwarding {
            job.rtp_forwarding = Some(forwarding);
        }
        if let Some(path) = patch.output_path {
            job.output_path = Some(path);
        }
        if let Some(message) = patch.error_message {
            job.error_message = Some(message);
        }
        if let Some(metrics) = patch.metrics {
            job.metrics = Some(metrics);
        }
        debug!("Patched job {}", job.job_id);
        Ok(job.clone())
    }

    /// Apply a state-machine transition. Unlawful transitions fail with
    /// [`Error::InvalidTransition`]; terminal statuses auto-stamp `ended_at`
    /// and evict the job from the active map and queue.
    pub fn transition(
        &self,
        job_id: &str,
        new_status: JobStatus,
        patch: JobPatch,
    ) -> Result<RecordingJob> {
        let updated = {
            let mut entry = self
                .active
                .get_mut(job_id)
                .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
            let job = entry.value_mut();
            let from = job.status;
            if !from.can_transition(new_status) {
                return Err(Error::InvalidTransition {
                    from,
                    to: new_status,
                });
            }

            job.status = new_status;
            if let Some(recorder_id) = patch.recorder_id {
                job.recorder_id = Some(recorder_id);
            }
            if let Some(streams) = patch.rtp_streams {
                job.rtp_streams = streams;
            }
            if let Some(forwarding) = patch.rtp_forwarding {
                job.rtp_forwarding = Some(forwarding);
            }
            if let Some(path) = patch.output_path {
                job.output_path = Some(path);
            }
            if let Some(message) = patch.error_message {
                job.error_message = Some(message);
            }
            if let Some(metrics) = patch.metrics {
                job.metrics = Some(metrics);
            }
            if new_status.is_terminal() {
                job.ended_at = Some(self.clock.now());
            }
            info!(
                job_id = %job.job_id,
                from = ?from,
                to = ?new_status,
                "Job transition"
            );
            job.clone()
        };

        if new_status.is_terminal() {
            self.remove_from_queue(job_id);
            self.active.remove(job_id);
        }
        Ok(updated)
    }
}
