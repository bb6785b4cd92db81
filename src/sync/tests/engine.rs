use crate::config::{SyncAlgorithm, SyncConfig};
use crate::discovery::DiscoveredService;
use crate::fanout::FanoutBuffer;
use crate::protocol::rtp::{NtpTimestamp, TimingResponse};
use crate::protocol::sdp::StreamFormat;
use crate::registry::ReceiverRegistry;
use crate::stats::ServerStats;
use crate::sync::engine::{EngineError, EngineEvent, SyncEngine};
use crate::sync::EngineHandle;
use crate::types::{DeviceKind, ReceiverId, ReceiverStatus};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

struct TestBed {
    engine: EngineHandle,
    registry: Arc<ReceiverRegistry>,
    stats: Arc<ServerStats>,
    _shutdown: broadcast::Sender<()>,
}

fn test_bed(algorithm: SyncAlgorithm, sync_interval: Duration) -> TestBed {
    let stats = ServerStats::new();
    let (shutdown, _) = broadcast::channel(1);
    let registry = ReceiverRegistry::with_probe_timeout(Duration::from_millis(200));
    let config = SyncConfig {
        global_delay: 0.1,
        sync_algorithm: algorithm,
        ..Default::default()
    };
    let engine = SyncEngine::spawn_with_interval(
        config,
        registry.clone(),
        stats.clone(),
        shutdown.clone(),
        sync_interval,
    );
    TestBed {
        engine,
        registry,
        stats,
        _shutdown: shutdown,
    }
}

/// Register a receiver backed by a local UDP port pair. `responsive`
/// receivers answer timing probes on the control port.
async fn register_sink(bed: &TestBed, name: &str, responsive: bool) -> ReceiverId {
    let (audio, control, port) = loop {
        let audio = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = audio.local_addr().unwrap().port();
        if port == u16::MAX {
            continue;
        }
        if let Ok(control) = UdpSocket::bind(("127.0.0.1", port + 1)).await {
            break (audio, control, port);
        }
    };

    // Keep the sockets alive for the duration of the test
    tokio::spawn(async move {
        let mut audio_buf = [0u8; 2048];
        let mut control_buf = [0u8; 2048];
        loop {
            tokio::select! {
                r = audio.recv_from(&mut audio_buf) => { if r.is_err() { break } }
                r = control.recv_from(&mut control_buf) => {
                    let buf = &control_buf;
                    let Ok((len, from)) = r else { break };
                    if responsive && len >= 32 && buf[1] & 0x7F == 0x52 {
                        let mut origin = [0u8; 8];
                        origin.copy_from_slice(&buf[24..32]);
                        let now = NtpTimestamp::now();
                        let reply = TimingResponse {
                            origin_time: NtpTimestamp::decode(&origin),
                            receive_time: now,
                            send_time: now,
                        };
                        let _ = control.send_to(&reply.encode(1), from).await;
                    }
                }
            }
        }
    });

    let service = DiscoveredService {
        fullname: format!("{name}._raop._tcp.local."),
        instance_name: name.to_string(),
        service_type: "_raop._tcp.local.".to_string(),
        kind: DeviceKind::AudioReceiver,
        addresses: vec![Ipv4Addr::LOCALHOST],
        port,
        txt: HashMap::new(),
    };
    bed.registry.add_discovered(&service).await
}

#[tokio::test]
async fn join_is_idempotent() {
    let bed = test_bed(SyncAlgorithm::Simple, Duration::from_secs(60));
    let id = register_sink(&bed, "room1", true).await;

    bed.engine.join(id.clone()).await.unwrap();
    bed.engine.join(id.clone()).await.unwrap();

    assert_eq!(bed.stats.snapshot().devices_connected, 1);
    assert_eq!(
        bed.registry.get(&id).await.unwrap().status,
        ReceiverStatus::Connected
    );
}

#[tokio::test]
async fn join_unknown_receiver_is_not_found() {
    let bed = test_bed(SyncAlgorithm::Simple, Duration::from_secs(60));
    let err = bed
        .engine
        .join(ReceiverId::from_string("10.1.1.1:5000"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn join_errored_receiver_is_incompatible() {
    let bed = test_bed(SyncAlgorithm::Simple, Duration::from_secs(60));
    let id = register_sink(&bed, "room1", true).await;
    bed.registry
        .set_status(&id, ReceiverStatus::Error, Some("dead".into()))
        .await
        .unwrap();

    let err = bed.engine.join(id).await.unwrap_err();
    assert!(matches!(err, EngineError::Incompatible { .. }));
}

#[tokio::test]
async fn leave_is_idempotent_and_restores_status() {
    let bed = test_bed(SyncAlgorithm::Simple, Duration::from_secs(60));
    let id = register_sink(&bed, "room1", true).await;
    bed.engine.join(id.clone()).await.unwrap();

    bed.engine.leave(id.clone()).await;
    bed.engine.leave(id.clone()).await;

    assert_eq!(bed.stats.snapshot().devices_connected, 0);
    assert_eq!(
        bed.registry.get(&id).await.unwrap().status,
        ReceiverStatus::Discovered
    );
}

#[tokio::test]
async fn membership_survives_add_remove_add() {
    let bed = test_bed(SyncAlgorithm::Simple, Duration::from_secs(60));
    let id = register_sink(&bed, "room1", true).await;

    bed.engine.join(id.clone()).await.unwrap();
    let after_first = bed.stats.snapshot().devices_connected;

    bed.engine.leave(id.clone()).await;
    bed.engine.join(id.clone()).await.unwrap();
    assert_eq!(bed.stats.snapshot().devices_connected, after_first);
}

#[tokio::test]
async fn start_without_stream_is_refused() {
    let bed = test_bed(SyncAlgorithm::Simple, Duration::from_secs(60));
    assert!(matches!(
        bed.engine.start_playback().await,
        Err(EngineError::NoActiveStream)
    ));
}

#[tokio::test]
async fn playback_can_restart_after_stop() {
    let bed = test_bed(SyncAlgorithm::Simple, Duration::from_secs(60));
    let id = register_sink(&bed, "room1", true).await;
    bed.engine.join(id).await.unwrap();

    let fanout = FanoutBuffer::new(64, bed.stats.clone());
    bed.engine
        .attach_stream(StreamFormat::default(), fanout, 0)
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        bed.stats.playback_state(),
        crate::stats::PlaybackState::Playing
    );

    bed.engine.stop_playback().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        bed.stats.playback_state(),
        crate::stats::PlaybackState::Stopped
    );

    // The stream is still attached: a manual start succeeds
    bed.engine.start_playback().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        bed.stats.playback_state(),
        crate::stats::PlaybackState::Playing
    );
}

#[tokio::test]
async fn unresponsive_receiver_is_evicted_after_three_checks() {
    let bed = test_bed(SyncAlgorithm::Advanced, Duration::from_millis(150));
    let good = register_sink(&bed, "good", true).await;
    let deaf = register_sink(&bed, "deaf", false).await;
    bed.engine.join(good.clone()).await.unwrap();
    bed.engine.join(deaf.clone()).await.unwrap();

    let mut events = bed.engine.subscribe();
    let mut registry_events = bed.registry.subscribe();

    let fanout = FanoutBuffer::new(64, bed.stats.clone());
    bed.engine
        .attach_stream(StreamFormat::default(), fanout, 0)
        .await;

    // Three failed timing probes at ~150 ms cadence with a 300 ms
    // reply timeout: eviction within a few seconds
    let evicted = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(EngineEvent::ReceiverEvicted { id, .. }) = events.recv().await {
                return id;
            }
        }
    })
    .await
    .expect("eviction event");
    assert_eq!(evicted, deaf);

    // Registry reflects the failure and emits status_changed
    let status_change = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(crate::registry::RegistryEvent::StatusChanged { receiver, .. }) =
                registry_events.recv().await
            {
                if receiver.id == deaf && receiver.status == ReceiverStatus::Error {
                    return receiver;
                }
            }
        }
    })
    .await
    .expect("status change to Error");
    assert!(status_change.status_reason.is_some());

    // The healthy receiver keeps playing
    assert_eq!(bed.stats.snapshot().devices_connected, 1);
    assert_eq!(
        bed.registry.get(&good).await.unwrap().status,
        ReceiverStatus::Connected
    );
    assert_eq!(
        bed.stats.playback_state(),
        crate::stats::PlaybackState::Playing
    );
}

#[tokio::test]
async fn responsive_receivers_accumulate_sync_corrections() {
    let bed = test_bed(SyncAlgorithm::Advanced, Duration::from_millis(100));
    let id = register_sink(&bed, "room1", true).await;
    bed.engine.join(id).await.unwrap();

    let fanout = FanoutBuffer::new(64, bed.stats.clone());
    bed.engine
        .attach_stream(StreamFormat::default(), fanout, 0)
        .await;

    // RTT measurements land and move the filtered delay at least once
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if bed.stats.snapshot().sync_corrections > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("a sync correction");
}
