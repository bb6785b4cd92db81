use super::*;
use crate::discovery::DiscoveredService;
use crate::types::DeviceKind;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn service(name: &str, host: [u8; 4], port: u16) -> DiscoveredService {
    DiscoveredService {
        fullname: format!("{name}._raop._tcp.local."),
        instance_name: name.to_string(),
        service_type: "_raop._tcp.local.".to_string(),
        kind: DeviceKind::AudioReceiver,
        addresses: vec![Ipv4Addr::from(host)],
        port,
        txt: HashMap::new(),
    }
}

/// TCP listener that answers one RTSP OPTIONS probe per connection
async fn rtsp_stub() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn serve_probes(listener: TcpListener) {
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"RTSP/1.0 200 OK\r\nCSeq: 0\r\nPublic: OPTIONS\r\n\r\n")
                    .await;
            });
        }
    });
}

#[tokio::test]
async fn discovered_receivers_are_inserted_and_merged() {
    let registry = ReceiverRegistry::new();
    let mut events = registry.subscribe();

    let id = registry
        .add_discovered(&service("Kitchen", [192, 168, 1, 50], 7000))
        .await;
    assert!(matches!(events.recv().await.unwrap(), RegistryEvent::Added(_)));

    // Same endpoint re-resolves with new TXT data
    let mut updated = service("Kitchen", [192, 168, 1, 50], 7000);
    updated
        .txt
        .insert("am".to_string(), "AudioAccessory5,1".to_string());
    let id2 = registry.add_discovered(&updated).await;
    assert_eq!(id, id2, "id never changes for the same endpoint");
    assert!(matches!(events.recv().await.unwrap(), RegistryEvent::Updated(_)));

    let receiver = registry.get(&id).await.unwrap();
    assert_eq!(receiver.model.as_deref(), Some("HomePod mini"));
    assert_eq!(registry.len().await, 1);
}

#[tokio::test]
async fn manual_receiver_reachable_via_rtsp_stub() {
    let (listener, addr) = rtsp_stub().await;
    serve_probes(listener);

    let registry = ReceiverRegistry::with_probe_timeout(Duration::from_secs(1));
    let id = registry
        .add_manual("Office", &addr.ip().to_string(), addr.port())
        .await
        .unwrap();

    let receiver = registry.get(&id).await.unwrap();
    assert_eq!(receiver.origin, ReceiverOrigin::Manual);
    assert_eq!(receiver.status, ReceiverStatus::Discovered);
    assert!(receiver.is_available());
}

#[tokio::test]
async fn unreachable_manual_receiver_registers_with_error() {
    // Bind-then-drop guarantees nothing listens on the port
    let port = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };

    let registry = ReceiverRegistry::with_probe_timeout(Duration::from_millis(500));
    let id = registry.add_manual("Ghost", "127.0.0.1", port).await.unwrap();

    let receiver = registry.get(&id).await.unwrap();
    assert_eq!(receiver.status, ReceiverStatus::Error);
    assert!(receiver.status_reason.is_some());
    assert!(!receiver.is_available());
    // Registered despite the failure
    assert_eq!(registry.len().await, 1);
}

#[tokio::test]
async fn add_remove_add_restores_membership() {
    let registry = ReceiverRegistry::new();
    let svc = service("Den", [10, 0, 0, 7], 5000);

    let id = registry.add_discovered(&svc).await;
    let count_after_first_add = registry.len().await;

    registry.remove(&id).await.unwrap();
    assert_eq!(registry.len().await, 0);

    let id2 = registry.add_discovered(&svc).await;
    assert_eq!(id, id2);
    assert_eq!(registry.len().await, count_after_first_add);
}

#[tokio::test]
async fn remove_unknown_id_is_not_found() {
    let registry = ReceiverRegistry::new();
    let err = registry
        .remove(&ReceiverId::from_string("10.9.9.9:5000"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(_)));
}

#[tokio::test]
async fn removal_by_fullname_follows_discovery_events() {
    let registry = ReceiverRegistry::new();
    let svc = service("Hall", [10, 0, 0, 8], 5000);
    registry.add_discovered(&svc).await;

    registry
        .apply_discovery_event(&DiscoveryEvent::Removed {
            fullname: svc.fullname.clone(),
        })
        .await;
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn list_filters_unavailable_receivers() {
    let registry = ReceiverRegistry::new();
    let a = registry.add_discovered(&service("A", [10, 0, 0, 1], 5000)).await;
    let _b = registry.add_discovered(&service("B", [10, 0, 0, 2], 5000)).await;

    registry
        .set_status(&a, ReceiverStatus::Error, Some("skew".into()))
        .await
        .unwrap();

    assert_eq!(registry.list(false).await.len(), 2);
    let available = registry.list(true).await;
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].name, "B");
}

#[tokio::test]
async fn status_changes_emit_events_once() {
    let registry = ReceiverRegistry::new();
    let id = registry.add_discovered(&service("A", [10, 0, 0, 1], 5000)).await;
    let mut events = registry.subscribe();

    registry
        .set_status(&id, ReceiverStatus::Connected, None)
        .await
        .unwrap();
    // Setting the same status again is a no-op
    registry
        .set_status(&id, ReceiverStatus::Connected, None)
        .await
        .unwrap();

    let event = events.recv().await.unwrap();
    let RegistryEvent::StatusChanged { receiver, old } = event else {
        panic!("expected StatusChanged");
    };
    assert_eq!(old, ReceiverStatus::Discovered);
    assert_eq!(receiver.status, ReceiverStatus::Connected);
    assert!(events.try_recv().is_err(), "no duplicate event");
}

#[tokio::test]
async fn eviction_spares_manual_receivers() {
    let (listener, addr) = rtsp_stub().await;
    serve_probes(listener);

    let registry = ReceiverRegistry::with_probe_timeout(Duration::from_secs(1));
    registry.add_discovered(&service("Old", [10, 0, 0, 1], 5000)).await;
    registry
        .add_manual("Pinned", &addr.ip().to_string(), addr.port())
        .await
        .unwrap();

    // Zero tolerance: every discovered receiver is instantly stale
    registry.evict_stale(Duration::ZERO).await;

    let remaining = registry.list(false).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].origin, ReceiverOrigin::Manual);
}

#[tokio::test]
async fn stats_break_down_by_origin_and_kind() {
    let (listener, addr) = rtsp_stub().await;
    serve_probes(listener);

    let registry = ReceiverRegistry::with_probe_timeout(Duration::from_secs(1));
    let a = registry.add_discovered(&service("A", [10, 0, 0, 1], 5000)).await;
    let mut airport = service("B", [10, 0, 0, 2], 5000);
    airport.kind = DeviceKind::AirportExpress;
    registry.add_discovered(&airport).await;
    registry
        .add_manual("Pinned", &addr.ip().to_string(), addr.port())
        .await
        .unwrap();

    registry
        .set_status(&a, ReceiverStatus::Error, Some("skew".into()))
        .await
        .unwrap();

    let stats = registry.stats().await;
    assert_eq!(stats.total, 3);
    assert_eq!(stats.available, 2);
    assert_eq!(stats.discovered, 2);
    assert_eq!(stats.manual, 1);
    // Only available receivers count toward the kind breakdown
    assert_eq!(stats.by_kind.get(&DeviceKind::AirportExpress), Some(&1));
    assert_eq!(stats.by_kind.get(&DeviceKind::Unknown), Some(&1));
    assert_eq!(stats.by_kind.get(&DeviceKind::AudioReceiver), None);
}

#[tokio::test]
async fn maintenance_pass_is_bounded_by_one_probe_timeout() {
    // Eight unreachable receivers: concurrent probes keep the sweep
    // near a single timeout, nowhere near eight of them
    let registry = ReceiverRegistry::with_probe_timeout(Duration::from_millis(400));
    for i in 0..8u8 {
        // TEST-NET-1 addresses: nothing answers, connects time out
        registry
            .add_discovered(&service(&format!("r{i}"), [192, 0, 2, i + 1], 5000))
            .await;
    }

    let started = std::time::Instant::now();
    registry.maintenance_pass(EVICT_AFTER).await;
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(1600), "{elapsed:?}");

    for receiver in registry.list(false).await {
        assert_eq!(receiver.status, ReceiverStatus::Disconnected);
    }
}

#[tokio::test]
async fn probe_distinguishes_rtsp_speakers() {
    let (listener, addr) = rtsp_stub().await;
    serve_probes(listener);
    let responded = probe_endpoint(addr, Duration::from_secs(1)).await.unwrap();
    assert!(responded);
}

#[tokio::test]
async fn probe_fails_fast_on_refused_connection() {
    let port = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };
    let result = probe_endpoint(
        SocketAddr::from(([127, 0, 0, 1], port)),
        Duration::from_millis(500),
    )
    .await;
    assert!(result.is_err());
}
