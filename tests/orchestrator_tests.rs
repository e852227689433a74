//! End-to-end orchestration tests
//!
//! Drive the full core (registry, dispatcher, health loop, metrics) against
//! a scripted RPC fake. Heartbeat staleness uses short real timeouts; the
//! health loop is driven by explicit ticks.

use recorral::config::OrchestratorConfig;
use recorral::dispatch::{
    CallbackData, ConfigureForwardingRpc, NodeRpc, RecorderCallback, RecorderEvent,
    StartRecordingRpc,
};
use recorral::jobs::{
    ContainerFormat, JobStatus, PeerInfo, Quality, RecordingOptions, RequesterInfo, RtpStream,
    StartRecordingRequest, StreamKind,
};
use recorral::orchestrator::Orchestrator;
use recorral::registry::{HardwareSpecs, RecorderDecl, RoomServerDecl};
use recorral::repository::{MemoryRepository, Repository};
use recorral::{Error, Result};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;

/// Scripted RPC fake: records every call, hands out sequential even ports,
/// and can be told to fail specific endpoints.
struct MockRpc {
    calls: Mutex<Vec<String>>,
    next_port: AtomicU16,
    fail_forwarding: AtomicBool,
    fail_start: AtomicBool,
}

impl MockRpc {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_port: AtomicU16::new(20000),
            fail_forwarding: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl NodeRpc for MockRpc {
    async fn allocate_ports(&self, recorder_url: &str, count: usize) -> Result<Vec<u16>> {
        self.record(format!("allocate-ports {recorder_url} {count}"));
        let base = self.next_port.fetch_add((count * 2) as u16, Ordering::SeqCst);
        Ok((0..count).map(|i| base + (i as u16) * 2).collect())
    }

    async fn start_recording(
        &self,
        recorder_url: &str,
        request: &StartRecordingRpc,
    ) -> Result<()> {
        self.record(format!("start-recording {recorder_url} {}", request.job_id));
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Rpc("recorder refused to start".to_string()));
        }
        Ok(())
    }

    async fn stop_recording(&self, recorder_url: &str, job_id: &str) -> Result<()> {
        self.record(format!("stop-recording {recorder_url} {job_id}"));
        Ok(())
    }

    async fn configure_rtp_forwarding(
        &self,
        room_server_url: &str,
        request: &ConfigureForwardingRpc,
    ) -> Result<()> {
        self.record(format!(
            "configure-rtp-forwarding {room_server_url} {}",
            request.job_id
        ));
        if self.fail_forwarding.load(Ordering::SeqCst) {
            return Err(Error::Rpc("room server refused forwarding".to_string()));
        }
        Ok(())
    }

    async fn stop_rtp_forwarding(&self, room_server_url: &str, job_id: &str) -> Result<()> {
        self.record(format!("stop-rtp-forwarding {room_server_url} {job_id}"));
        Ok(())
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    rpc: Arc<MockRpc>,
    repository: Arc<MemoryRepository>,
}

async fn harness(node_timeout: Duration) -> Harness {
    let config = OrchestratorConfig {
        node_timeout,
        node_gc_after: Duration::from_secs(3600),
        ..OrchestratorConfig::default()
    };
    let repository = Arc::new(MemoryRepository::new());
    let rpc = Arc::new(MockRpc::new());
    let repo: Arc<dyn Repository> = repository.clone();
    let node_rpc: Arc<dyn NodeRpc> = rpc.clone();
    let orchestrator = Orchestrator::new(config, repo, node_rpc).await;
    Harness {
        orchestrator,
        rpc,
        repository,
    }
}

fn room_server_decl(id: &str, capacity: u32) -> RoomServerDecl {
    RoomServerDecl {
        id: id.to_string(),
        url: format!("http://{id}.media.internal:4443"),
        region: "us-east-1".to_string(),
        rooms: vec!["room-a".to_string()],
        capacity,
        specs: HardwareSpecs::default(),
        metadata: Default::default(),
    }
}

fn recorder_decl(host: &str, cores: u32) -> RecorderDecl {
    RecorderDecl {
        url: format!("http://{host}:7000"),
        region: "us-east-1".to_string(),
        supported_codecs: vec!["opus".to_string(), "vp8".to_string()],
        specs: HardwareSpecs {
            cpu_cores: cores,
            memory_bytes: 8 * GIB,
            has_gpu: false,
            disk_bytes: 100 * GIB,
        },
        metadata: Default::default(),
    }
}

fn start_request(room_server_id: &str) -> StartRecordingRequest {
    StartRecordingRequest {
        room_server_id: room_server_id.to_string(),
        room_id: "room-a".to_string(),
        peer_id: "peer-1".to_string(),
        peer_info: PeerInfo {
            display_name: "Alice".to_string(),
            authenticated: true,
            roles: vec![],
            joined_at: None,
        },
        rtp_streams: vec![
            RtpStream {
                kind: StreamKind::Audio,
                port: 5000,
                payload_type: 111,
                ssrc: 1111,
                codec_name: "opus".to_string(),
            },
            RtpStream {
                kind: StreamKind::Video,
                port: 5002,
                payload_type: 96,
                ssrc: 2222,
                codec_name: "vp8".to_string(),
            },
        ],
        options: RecordingOptions {
            quality: Quality::Medium,
            format: ContainerFormat::Webm,
            include_audio: true,
            include_video: true,
            max_duration_secs: None,
        },
        requester: RequesterInfo {
            id: "admin".to_string(),
            name: None,
            token: None,
        },
    }
}

#[tokio::test]
async fn happy_path_assigns_and_accounts() {
    let h = harness(Duration::from_secs(60)).await;
    let orchestrator = &h.orchestrator;

    orchestrator
        .registry
        .register_room_server(room_server_decl("rs1", 10))
        .await;
    let recorder_id = orchestrator
        .registry
        .register_recorder(recorder_decl("rec-a", 4))
        .await;

    // Derived capacity: min(4 * 1.5, 16, 12) = 6
    let recorder = orchestrator.registry.get_recorder(&recorder_id).await.unwrap();
    assert_eq!(recorder.capacity, 6);

    let job = orchestrator
        .dispatcher
        .start_recording(start_request("rs1"))
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Recording);
    assert_eq!(job.recorder_id.as_deref(), Some(recorder_id.as_str()));

    let forwarding = job.rtp_forwarding.as_ref().unwrap();
    assert_eq!(forwarding.ports.len(), 2);
    assert_eq!(forwarding.target_ip, "rec-a");
    // Stream destinations are rewritten to the allocated ports
    let stream_ports: Vec<u16> = job.rtp_streams.iter().map(|s| s.port).collect();
    assert_eq!(stream_ports, forwarding.ports);
    assert!(forwarding.ports.iter().all(|p| p % 2 == 0));

    let recorder = orchestrator.registry.get_recorder(&recorder_id).await.unwrap();
    assert_eq!(recorder.current_load, 1);
    assert_eq!(recorder.active_jobs, vec![job.job_id.clone()]);

    let server = orchestrator.registry.get_room_server("rs1").await.unwrap();
    assert_eq!(server.current_load, 1);

    assert_eq!(h.rpc.count("allocate-ports"), 1);
    assert_eq!(h.rpc.count("configure-rtp-forwarding"), 1);
    assert_eq!(h.rpc.count("start-recording"), 1);
}

#[tokio::test]
async fn unknown_room_server_is_rejected() {
    let h = harness(Duration::from_secs(60)).await;
    let err = h
        .orchestrator
        .dispatcher
        .start_recording(start_request("rs-missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoRoomServer(_)));
    assert_eq!(h.rpc.count("allocate-ports"), 0);
}

#[tokio::test]
async fn saturation_queues_then_drain_places() {
    let h = harness(Duration::from_secs(60)).await;
    let orchestrator = &h.orchestrator;

    orchestrator
        .registry
        .register_room_server(room_server_decl("rs1", 10))
        .await;
    // Two one-slot recorders: min(1 * 1.5, 16, 12) = 1
    orchestrator
        .registry
        .register_recorder(recorder_decl("rec-a", 1))
        .await;
    orchestrator
        .registry
        .register_recorder(recorder_decl("rec-b", 1))
        .await;

    let mut jobs = Vec::new();
    for _ in 0..3 {
        jobs.push(
            orchestrator
                .dispatcher
                .start_recording(start_request("rs1"))
                .await
                .unwrap(),
        );
    }

    let placed: Vec<_> = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Recording)
        .collect();
    let queued: Vec<_> = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Pending)
        .collect();
    assert_eq!(placed.len(), 2);
    assert_eq!(queued.len(), 1);
    assert_eq!(orchestrator.jobs.queue_len(), 1);

    // A drain pass with no free capacity leaves the job queued
    orchestrator.health.tick().await;
    assert_eq!(orchestrator.jobs.queue_len(), 1);

    // Stop one active recording; the next tick places the queued job
    let stopped = orchestrator
        .dispatcher
        .stop_recording(&placed[0].job_id)
        .await
        .unwrap();
    assert_eq!(stopped.status, JobStatus::Completed);

    orchestrator.health.tick().await;
    assert_eq!(orchestrator.jobs.queue_len(), 0);
    let drained = orchestrator.jobs.get(&queued[0].job_id).unwrap();
    assert_eq!(drained.status, JobStatus::Recording);
    assert_eq!(
        drained.recorder_id.as_deref(),
        stopped.recorder_id.as_deref(),
        "the freed recorder takes the queued job"
    );
}

#[tokio::test]
async fn recorder_failover_reassigns_job() {
    let h = harness(Duration::from_millis(100)).await;
    let orchestrator = &h.orchestrator;

    orchestrator
        .registry
        .register_room_server(room_server_decl("rs1", 10))
        .await;
    let first = orchestrator
        .registry
        .register_recorder(recorder_decl("rec-a", 4))
        .await;

    let job = orchestrator
        .dispatcher
        .start_recording(start_request("rs1"))
        .await
        .unwrap();
    assert_eq!(job.recorder_id.as_deref(), Some(first.as_str()));

    // A second recorder joins, then the first goes silent
    let second = orchestrator
        .registry
        .register_recorder(recorder_decl("rec-b", 4))
        .await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    orchestrator
        .registry
        .room_server_heartbeat("rs1", 1, None)
        .await;
    orchestrator
        .registry
        .recorder_heartbeat(&second, 0, Some(vec![]))
        .await;

    orchestrator.health.tick().await;

    let dead = orchestrator.registry.get_recorder(&first).await.unwrap();
    assert!(!dead.is_healthy);
    assert_eq!(dead.current_load, 0);

    let job = orchestrator.jobs.get(&job.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Recording);
    assert_eq!(job.recorder_id.as_deref(), Some(second.as_str()));

    let survivor = orchestrator.registry.get_recorder(&second).await.unwrap();
    assert_eq!(survivor.current_load, 1);
    assert_eq!(survivor.active_jobs, vec![job.job_id.clone()]);

    // The room server was asked to re-point forwarding at the new recorder
    assert_eq!(h.rpc.count("configure-rtp-forwarding"), 2);
}

#[tokio::test]
async fn recorder_failover_without_fleet_is_terminal() {
    let h = harness(Duration::from_millis(100)).await;
    let orchestrator = &h.orchestrator;

    orchestrator
        .registry
        .register_room_server(room_server_decl("rs1", 10))
        .await;
    orchestrator
        .registry
        .register_recorder(recorder_decl("rec-a", 4))
        .await;

    let job = orchestrator
        .dispatcher
        .start_recording(start_request("rs1"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    orchestrator
        .registry
        .room_server_heartbeat("rs1", 1, None)
        .await;

    orchestrator.health.tick().await;

    // No recorder left: the job is terminal and queryable via history
    assert!(orchestrator.jobs.get(&job.job_id).is_none());
    let stored = orchestrator
        .dispatcher
        .stop_recording(&job.job_id)
        .await
        .unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some("no available recorders"));
}

#[tokio::test]
async fn room_server_failure_is_fatal_to_its_jobs() {
    let h = harness(Duration::from_millis(100)).await;
    let orchestrator = &h.orchestrator;

    orchestrator
        .registry
        .register_room_server(room_server_decl("rs1", 10))
        .await;
    let recorder_id = orchestrator
        .registry
        .register_recorder(recorder_decl("rec-a", 4))
        .await;

    let job = orchestrator
        .dispatcher
        .start_recording(start_request("rs1"))
        .await
        .unwrap();

    // The recorder keeps heartbeating; the room server goes silent
    tokio::time::sleep(Duration::from_millis(150)).await;
    orchestrator
        .registry
        .recorder_heartbeat(&recorder_id, 0, Some(vec![job.job_id.clone()]))
        .await;

    orchestrator.health.tick().await;

    let server = orchestrator.registry.get_room_server("rs1").await.unwrap();
    assert!(!server.is_healthy);

    // Job is terminal failed, a best-effort stop went to the recorder,
    // and its capacity was reclaimed
    assert!(orchestrator.jobs.get(&job.job_id).is_none());
    let stored = orchestrator
        .dispatcher
        .stop_recording(&job.job_id)
        .await
        .unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(
        stored.error_message.as_deref(),
        Some("room server became unhealthy")
    );
    assert!(h.rpc.count("stop-recording http://rec-a:7000") >= 1);

    let recorder = orchestrator.registry.get_recorder(&recorder_id).await.unwrap();
    assert_eq!(recorder.current_load, 0);
    assert!(recorder.active_jobs.is_empty());
}

#[tokio::test]
async fn stop_after_terminal_is_a_no_op() {
    let h = harness(Duration::from_secs(60)).await;
    let orchestrator = &h.orchestrator;

    orchestrator
        .registry
        .register_room_server(room_server_decl("rs1", 10))
        .await;
    orchestrator
        .registry
        .register_recorder(recorder_decl("rec-a", 4))
        .await;

    let job = orchestrator
        .dispatcher
        .start_recording(start_request("rs1"))
        .await
        .unwrap();

    let first = orchestrator
        .dispatcher
        .stop_recording(&job.job_id)
        .await
        .unwrap();
    assert_eq!(first.status, JobStatus::Completed);
    assert!(first.ended_at.is_some());

    let stops_before = h.rpc.count("stop-recording");
    let forwarding_stops_before = h.rpc.count("stop-rtp-forwarding");

    let second = orchestrator
        .dispatcher
        .stop_recording(&job.job_id)
        .await
        .unwrap();
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.job_id, first.job_id);
    assert_eq!(second.ended_at, first.ended_at);

    // No RPC is emitted and no counters move
    assert_eq!(h.rpc.count("stop-recording"), stops_before);
    assert_eq!(h.rpc.count("stop-rtp-forwarding"), forwarding_stops_before);
    let recorder_id = job.recorder_id.unwrap();
    let recorder = orchestrator.registry.get_recorder(&recorder_id).await.unwrap();
    assert_eq!(recorder.current_load, 0);
}

#[tokio::test]
async fn failed_forwarding_setup_rolls_back() {
    let h = harness(Duration::from_secs(60)).await;
    let orchestrator = &h.orchestrator;

    orchestrator
        .registry
        .register_room_server(room_server_decl("rs1", 10))
        .await;
    let recorder_id = orchestrator
        .registry
        .register_recorder(recorder_decl("rec-a", 4))
        .await;

    h.rpc.fail_forwarding.store(true, Ordering::SeqCst);
    let job = orchestrator
        .dispatcher
        .start_recording(start_request("rs1"))
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .contains("refused forwarding"));

    // Allocated ports were released via the idempotent recorder stop
    assert_eq!(h.rpc.count("stop-recording http://rec-a:7000"), 1);
    let recorder = orchestrator.registry.get_recorder(&recorder_id).await.unwrap();
    assert_eq!(recorder.current_load, 0);
    let server = orchestrator.registry.get_room_server("rs1").await.unwrap();
    assert_eq!(server.current_load, 0);
}

#[tokio::test]
async fn failed_recorder_start_unwinds_forwarding() {
    let h = harness(Duration::from_secs(60)).await;
    let orchestrator = &h.orchestrator;

    orchestrator
        .registry
        .register_room_server(room_server_decl("rs1", 10))
        .await;
    orchestrator
        .registry
        .register_recorder(recorder_decl("rec-a", 4))
        .await;

    h.rpc.fail_start.store(true, Ordering::SeqCst);
    let job = orchestrator
        .dispatcher
        .start_recording(start_request("rs1"))
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(h.rpc.count("stop-rtp-forwarding"), 1);
    assert_eq!(h.rpc.count("stop-recording"), 1);
}

#[tokio::test]
async fn recorder_callback_completes_job() {
    let h = harness(Duration::from_secs(60)).await;
    let orchestrator = &h.orchestrator;

    orchestrator
        .registry
        .register_room_server(room_server_decl("rs1", 10))
        .await;
    let recorder_id = orchestrator
        .registry
        .register_recorder(recorder_decl("rec-a", 4))
        .await;

    let job = orchestrator
        .dispatcher
        .start_recording(start_request("rs1"))
        .await
        .unwrap();

    let handled = orchestrator
        .dispatcher
        .handle_recorder_event(RecorderCallback {
            job_id: job.job_id.clone(),
            event: RecorderEvent::Completed,
            data: CallbackData {
                output_path: Some("/recordings/out.webm".to_string()),
                error: None,
                metrics: None,
            },
        })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(handled.status, JobStatus::Completed);
    assert_eq!(handled.output_path.as_deref(), Some("/recordings/out.webm"));

    let recorder = orchestrator.registry.get_recorder(&recorder_id).await.unwrap();
    assert_eq!(recorder.current_load, 0);

    // A late duplicate callback is dropped idempotently
    let dropped = orchestrator
        .dispatcher
        .handle_recorder_event(RecorderCallback {
            job_id: job.job_id.clone(),
            event: RecorderEvent::Completed,
            data: CallbackData::default(),
        })
        .await
        .unwrap();
    assert!(dropped.is_none());
}

#[tokio::test]
async fn warm_restart_restores_and_requeues() {
    let h = harness(Duration::from_secs(60)).await;
    let orchestrator = &h.orchestrator;

    orchestrator
        .registry
        .register_room_server(room_server_decl("rs1", 10))
        .await;
    let recorder_id = orchestrator
        .registry
        .register_recorder(recorder_decl("rec-a", 4))
        .await;

    let live = orchestrator
        .dispatcher
        .start_recording(start_request("rs1"))
        .await
        .unwrap();

    // Persist node snapshots the way the ingress does
    let server = orchestrator.registry.get_room_server("rs1").await.unwrap();
    orchestrator.persist_room_server(&server).await;
    let recorder = orchestrator.registry.get_recorder(&recorder_id).await.unwrap();
    orchestrator.persist_recorder(&recorder).await;

    // A job whose recorder no longer exists
    let mut orphan = live.clone();
    orphan.job_id = "rec-0000000000000-f00001".to_string();
    orphan.recorder_id = Some("recorder-us-east-1-0-dead".to_string());
    h.repository.upsert_job(&orphan).await.unwrap();

    // Second orchestrator instance over the same repository
    let rpc: Arc<dyn NodeRpc> = Arc::new(MockRpc::new());
    let repo: Arc<dyn Repository> = h.repository.clone();
    let restarted = Orchestrator::new(OrchestratorConfig::default(), repo, rpc).await;

    assert!(restarted.registry.get_room_server("rs1").await.is_some());
    assert!(restarted.registry.get_recorder(&recorder_id).await.is_some());

    let survived = restarted.jobs.get(&live.job_id).unwrap();
    assert_eq!(survived.status, JobStatus::Recording);

    let requeued = restarted.jobs.get(&orphan.job_id).unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert!(requeued.recorder_id.is_none());
    assert_eq!(restarted.jobs.queue_len(), 1);
}

#[tokio::test]
async fn metrics_reflect_fleet_state() {
    let h = harness(Duration::from_secs(60)).await;
    let orchestrator = &h.orchestrator;

    orchestrator
        .registry
        .register_room_server(room_server_decl("rs1", 10))
        .await;
    orchestrator
        .registry
        .register_recorder(recorder_decl("rec-a", 4))
        .await;
    orchestrator
        .dispatcher
        .start_recording(start_request("rs1"))
        .await
        .unwrap();

    orchestrator.metrics.tick().await;

    let snapshot = orchestrator.metrics.latest().unwrap();
    assert_eq!(snapshot.total_room_servers, 1);
    assert_eq!(snapshot.total_recorders, 1);
    assert_eq!(snapshot.active_recordings, 1);
    assert_eq!(snapshot.total_capacity, 6);
    assert_eq!(snapshot.total_load, 1);
    let region = snapshot.regional.get("us-east-1").unwrap();
    assert_eq!(region.recorder_nodes, 1);
    assert_eq!(region.load, 1);

    // The snapshot was appended to the repository
    let stored = h
        .repository
        .query_metrics_range(
            snapshot.timestamp - chrono::Duration::seconds(5),
            snapshot.timestamp + chrono::Duration::seconds(5),
        )
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
}
