//! End-to-end terminator tests: a scripted sender over real sockets,
//! scripted receivers as UDP sinks.

use crate::config::SyncConfig;
use crate::discovery::DiscoveredService;
use crate::protocol::rtp::RtpPacket;
use crate::protocol::rtp::control::{ControlPacket, PlaybackCommand};
use crate::registry::ReceiverRegistry;
use crate::session::RaopServer;
use crate::session::server::SessionDeps;
use crate::stats::{PlaybackState, ServerStats};
use crate::sync::engine::SyncEngine;
use crate::sync::EngineHandle;
use crate::types::{DeviceKind, ReceiverId};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::broadcast;

const SDP_L16: &str = "v=0\r\no=iTunes 1 0 IN IP4 127.0.0.1\r\ns=iTunes\r\nc=IN IP4 127.0.0.1\r\n\
t=0 0\r\nm=audio 0 RTP/AVP 96\r\na=rtpmap:96 L16/44100/2\r\n";

struct Harness {
    addr: SocketAddr,
    engine: EngineHandle,
    registry: Arc<ReceiverRegistry>,
    stats: Arc<ServerStats>,
    _shutdown: broadcast::Sender<()>,
}

async fn start_harness() -> Harness {
    let stats = ServerStats::new();
    let (shutdown, _) = broadcast::channel(1);
    let registry = ReceiverRegistry::with_probe_timeout(Duration::from_millis(200));

    let sync_config = SyncConfig {
        global_delay: 0.15,
        ..Default::default()
    };
    let engine = SyncEngine::spawn(
        sync_config,
        registry.clone(),
        stats.clone(),
        shutdown.clone(),
    );

    let raop = RaopServer::bind(0).await.unwrap();
    let addr = raop.local_addr();
    let deps = SessionDeps {
        engine: engine.clone(),
        stats: stats.clone(),
        read_timeout: Duration::from_secs(5),
        shutdown: shutdown.clone(),
    };
    tokio::spawn(raop.run(deps, shutdown.subscribe()));

    Harness {
        addr,
        engine,
        registry,
        stats,
        _shutdown: shutdown,
    }
}

/// A scripted downstream receiver: audio and control UDP sockets on a
/// consecutive port pair.
struct Sink {
    audio: UdpSocket,
    control: UdpSocket,
    port: u16,
}

impl Sink {
    async fn bind() -> Sink {
        for _ in 0..16 {
            let audio = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let port = audio.local_addr().unwrap().port();
            if port == u16::MAX {
                continue;
            }
            if let Ok(control) = UdpSocket::bind(("127.0.0.1", port + 1)).await {
                return Sink {
                    audio,
                    control,
                    port,
                };
            }
        }
        panic!("no consecutive udp pair available");
    }

    async fn join(&self, harness: &Harness, name: &str) -> ReceiverId {
        let service = DiscoveredService {
            fullname: format!("{name}._raop._tcp.local."),
            instance_name: name.to_string(),
            service_type: "_raop._tcp.local.".to_string(),
            kind: DeviceKind::AudioReceiver,
            addresses: vec![Ipv4Addr::LOCALHOST],
            port: self.port,
            txt: HashMap::new(),
        };
        let id = harness.registry.add_discovered(&service).await;
        harness.engine.join(id.clone()).await.unwrap();
        id
    }

    async fn recv_audio(&self, timeout: Duration) -> Option<RtpPacket> {
        let mut buf = [0u8; 4096];
        let len = tokio::time::timeout(timeout, self.audio.recv(&mut buf))
            .await
            .ok()?
            .ok()?;
        RtpPacket::decode(&buf[..len]).ok()
    }

    async fn recv_command(&self, timeout: Duration) -> Option<PlaybackCommand> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = [0u8; 256];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let len = tokio::time::timeout(remaining, self.control.recv(&mut buf))
                .await
                .ok()?
                .ok()?;
            if let Ok(ControlPacket::Command(cmd)) = ControlPacket::decode(&buf[..len]) {
                return Some(cmd);
            }
            // Sync packets interleave with commands; skip them
        }
    }
}

/// Scripted RAOP sender
struct Sender {
    stream: TcpStream,
    cseq: u32,
}

impl Sender {
    async fn connect(addr: SocketAddr) -> Sender {
        Sender {
            stream: TcpStream::connect(addr).await.unwrap(),
            cseq: 0,
        }
    }

    async fn request(
        &mut self,
        method: &str,
        extra_headers: &[(&str, String)],
        body: Option<(&str, &str)>,
    ) -> (u16, HashMap<String, String>, Vec<u8>) {
        self.cseq += 1;
        let mut text = format!("{method} rtsp://127.0.0.1/stream RTSP/1.0\r\nCSeq: {}\r\n", self.cseq);
        for (name, value) in extra_headers {
            text.push_str(&format!("{name}: {value}\r\n"));
        }
        if let Some((content_type, payload)) = body {
            text.push_str(&format!(
                "Content-Type: {content_type}\r\nContent-Length: {}\r\n",
                payload.len()
            ));
        }
        text.push_str("\r\n");
        if let Some((_, payload)) = body {
            text.push_str(payload);
        }

        self.stream.write_all(text.as_bytes()).await.unwrap();
        self.read_response().await
    }

    async fn read_response(&mut self) -> (u16, HashMap<String, String>, Vec<u8>) {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        let header_end = loop {
            if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos;
            }
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("response timeout")
                .unwrap();
            assert!(n > 0, "connection closed before response");
            data.extend_from_slice(&buf[..n]);
        };

        let head = String::from_utf8_lossy(&data[..header_end]).to_string();
        let mut lines = head.lines();
        let status_line = lines.next().unwrap();
        let status: u16 = status_line.split_whitespace().nth(1).unwrap().parse().unwrap();
        let headers: HashMap<String, String> = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();

        let content_length: usize = headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut body = data[header_end + 4..].to_vec();
        while body.len() < content_length {
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0);
            body.extend_from_slice(&buf[..n]);
        }
        body.truncate(content_length);
        (status, headers, body)
    }
}

fn parse_server_ports(transport: &str) -> (u16, u16) {
    let spec = transport
        .split(';')
        .find_map(|p| p.trim().strip_prefix("server_port="))
        .expect("server_port in transport");
    let (a, b) = spec.split_once('-').expect("port pair");
    (a.parse().unwrap(), b.parse().unwrap())
}

/// 352 samples of stereo L16
fn audio_payload(seq: u16) -> Vec<u8> {
    vec![seq as u8; 352 * 2 * 2]
}

async fn send_audio(socket: &UdpSocket, to: SocketAddr, seqs: std::ops::Range<u16>) {
    for seq in seqs {
        let packet = RtpPacket::audio(seq, u32::from(seq) * 352, 1, audio_payload(seq));
        socket.send_to(&packet.encode(), to).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn happy_path_single_receiver() {
    let harness = start_harness().await;
    let sink = Sink::bind().await;
    sink.join(&harness, "room1").await;

    let mut sender = Sender::connect(harness.addr).await;

    // OPTIONS
    let (status, headers, _) = sender.request("OPTIONS", &[], None).await;
    assert_eq!(status, 200);
    assert!(headers["public"].contains("RECORD"));

    // ANNOUNCE
    let (status, _, _) = sender
        .request("ANNOUNCE", &[], Some(("application/sdp", SDP_L16)))
        .await;
    assert_eq!(status, 200);

    // SETUP
    let (status, headers, _) = sender
        .request(
            "SETUP",
            &[(
                "Transport",
                "RTP/AVP/UDP;unicast;mode=record;control_port=6001;timing_port=6002".to_string(),
            )],
            None,
        )
        .await;
    assert_eq!(status, 200);
    let session_token = &headers["session"];
    assert!(session_token.chars().all(|c| c.is_ascii_digit()));
    let (audio_port, control_port) = parse_server_ports(&headers["transport"]);
    assert_eq!(control_port, audio_port + 1);

    // RECORD
    let (status, headers, _) = sender
        .request(
            "RECORD",
            &[("RTP-Info", "seq=0;rtptime=0".to_string())],
            None,
        )
        .await;
    assert_eq!(status, 200);
    assert!(headers.contains_key("audio-latency"));

    // Receiver gets the start announcement
    let command = sink.recv_command(Duration::from_secs(2)).await;
    assert!(matches!(command, Some(PlaybackCommand::Start { .. })));

    // Stream RTP audio at the server
    let client_audio = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let to = SocketAddr::from(([127, 0, 0, 1], audio_port));
    send_audio(&client_audio, to, 0..40).await;

    // The sink hears contiguous audio
    let first = sink
        .recv_audio(Duration::from_secs(3))
        .await
        .expect("audio at receiver");
    let mut last_seq = first.header.sequence;
    for _ in 0..10 {
        let packet = sink.recv_audio(Duration::from_secs(2)).await.expect("more audio");
        assert_eq!(packet.header.sequence, last_seq.wrapping_add(1));
        last_seq = packet.header.sequence;
    }
    assert!(harness.stats.snapshot().frames_sent > 0);
    assert_eq!(harness.stats.playback_state(), PlaybackState::Playing);

    // TEARDOWN: session gone, group membership intact
    let (status, _, _) = sender.request("TEARDOWN", &[], None).await;
    assert_eq!(status, 200);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.stats.playback_state(), PlaybackState::Stopped);
    assert_eq!(harness.stats.snapshot().devices_connected, 1);
}

#[tokio::test]
async fn setup_mirrors_the_senders_port_pair_when_free() {
    let harness = start_harness().await;
    let mut sender = Sender::connect(harness.addr).await;

    let (preferred_audio, preferred_control) = {
        let sink = Sink::bind().await;
        (sink.port, sink.port + 1)
    }; // dropped: ports are free again

    sender
        .request("ANNOUNCE", &[], Some(("application/sdp", SDP_L16)))
        .await;
    let (status, headers, _) = sender
        .request(
            "SETUP",
            &[(
                "Transport",
                format!(
                    "RTP/AVP/UDP;unicast;mode=record;client_port={preferred_audio}-{preferred_control}"
                ),
            )],
            None,
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(
        parse_server_ports(&headers["transport"]),
        (preferred_audio, preferred_control)
    );
}

#[tokio::test]
async fn flush_resets_the_delivered_sequence_domain() {
    let harness = start_harness().await;
    let sink = Sink::bind().await;
    sink.join(&harness, "room1").await;

    let mut sender = Sender::connect(harness.addr).await;
    sender
        .request("ANNOUNCE", &[], Some(("application/sdp", SDP_L16)))
        .await;
    let (_, headers, _) = sender
        .request(
            "SETUP",
            &[("Transport", "RTP/AVP/UDP;unicast;mode=record;control_port=0".to_string())],
            None,
        )
        .await;
    let (audio_port, _) = parse_server_ports(&headers["transport"]);
    sender
        .request("RECORD", &[("RTP-Info", "seq=0;rtptime=0".to_string())], None)
        .await;

    let client_audio = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let to = SocketAddr::from(([127, 0, 0, 1], audio_port));
    send_audio(&client_audio, to, 0..20).await;
    assert!(sink.recv_audio(Duration::from_secs(3)).await.is_some());

    // FLUSH forward to 12345; a real sender resumes right away
    let (status, _, _) = sender
        .request(
            "FLUSH",
            &[("RTP-Info", "seq=12345;rtptime=4343040".to_string())],
            None,
        )
        .await;
    assert_eq!(status, 200);
    send_audio(&client_audio, to, 12_345..12_385).await;

    // Exactly one flush control frame reaches the receiver
    let mut flushes = 0;
    while let Some(cmd) = sink.recv_command(Duration::from_millis(800)).await {
        if matches!(cmd, PlaybackCommand::Flush { next_seq: 12_345 }) {
            flushes += 1;
        }
    }
    assert_eq!(flushes, 1);

    // Ignoring stragglers already in flight at the moment of the
    // flush, delivery restarts at the flushed sequence
    let mut post_flush_seqs = Vec::new();
    while let Some(packet) = sink.recv_audio(Duration::from_secs(2)).await {
        if packet.header.sequence >= 12_345 || !post_flush_seqs.is_empty() {
            post_flush_seqs.push(packet.header.sequence);
        }
        if post_flush_seqs.len() >= 5 {
            break;
        }
    }
    assert!(post_flush_seqs.len() >= 5, "audio after flush: {post_flush_seqs:?}");
    assert!(
        post_flush_seqs.iter().all(|&s| s >= 12_345),
        "{post_flush_seqs:?}"
    );
}

#[tokio::test]
async fn join_during_playback_starts_in_the_future() {
    let harness = start_harness().await;
    let sink1 = Sink::bind().await;
    sink1.join(&harness, "room1").await;

    let mut sender = Sender::connect(harness.addr).await;
    sender
        .request("ANNOUNCE", &[], Some(("application/sdp", SDP_L16)))
        .await;
    let (_, headers, _) = sender
        .request(
            "SETUP",
            &[("Transport", "RTP/AVP/UDP;unicast;mode=record;control_port=0".to_string())],
            None,
        )
        .await;
    let (audio_port, _) = parse_server_ports(&headers["transport"]);
    sender
        .request("RECORD", &[("RTP-Info", "seq=0;rtptime=0".to_string())], None)
        .await;

    let client_audio = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let to = SocketAddr::from(([127, 0, 0, 1], audio_port));
    send_audio(&client_audio, to, 0..21).await;
    assert!(sink1.recv_audio(Duration::from_secs(3)).await.is_some());

    // Second receiver joins mid-playback
    let sink2 = Sink::bind().await;
    sink2.join(&harness, "room2").await;
    send_audio(&client_audio, to, 21..120).await;

    let first = sink2
        .recv_audio(Duration::from_secs(3))
        .await
        .expect("joined receiver hears audio");
    // The join boundary is now + 200 ms, well past the 21 frames
    // published before the join: no history is replayed
    assert!(first.header.sequence > 20, "got {}", first.header.sequence);
}
