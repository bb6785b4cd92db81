use crate::protocol::rtsp::{Headers, Method, RtspRequest};
use crate::session::handler::{SessionAction, handle_request};
use crate::session::{SenderSession, SessionState};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

const SDP: &str = "v=0\r\no=iTunes 1 0 IN IP4 10.0.0.5\r\ns=iTunes\r\nc=IN IP4 10.0.0.9\r\nt=0 0\r\n\
m=audio 0 RTP/AVP 96\r\na=rtpmap:96 AppleLossless\r\na=fmtp:96 352 0 16 40 10 14 2 255 0 0 44100\r\n";

fn session_in(state: SessionState) -> SenderSession {
    let mut s = SenderSession::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000));
    let path = match state {
        SessionState::Idle => vec![],
        SessionState::Announced => vec![SessionState::Announced],
        SessionState::SetUp => vec![SessionState::Announced, SessionState::SetUp],
        SessionState::Recording | SessionState::Flushing => vec![
            SessionState::Announced,
            SessionState::SetUp,
            SessionState::Recording,
        ],
        SessionState::TornDown => vec![SessionState::Announced, SessionState::TornDown],
    };
    for step in path {
        s.transition(step).unwrap();
    }
    s
}

fn request(method: Method, cseq: u32) -> RtspRequest {
    let mut headers = Headers::new();
    headers.insert("CSeq", cseq.to_string());
    RtspRequest {
        method,
        uri: "rtsp://10.0.0.9/stream".to_string(),
        headers,
        body: Vec::new(),
    }
}

fn announce(cseq: u32, body: &str, content_type: &str) -> RtspRequest {
    let mut req = request(Method::Announce, cseq);
    req.headers.insert("Content-Type", content_type);
    req.body = body.as_bytes().to_vec();
    req
}

#[test]
fn options_lists_every_supported_verb_in_any_state() {
    for state in [SessionState::Idle, SessionState::Recording, SessionState::TornDown] {
        let outcome = handle_request(&request(Method::Options, 1), &session_in(state));
        assert_eq!(outcome.response.status.as_u16(), 200);
        let public = outcome.response.headers.get("Public").unwrap();
        for verb in ["ANNOUNCE", "SETUP", "RECORD", "PAUSE", "FLUSH", "TEARDOWN", "GET_PARAMETER", "SET_PARAMETER"] {
            assert!(public.contains(verb), "missing {verb}");
        }
        assert!(outcome.new_state.is_none());
    }
}

#[test]
fn cseq_is_echoed_verbatim() {
    let outcome = handle_request(&request(Method::Options, 42), &session_in(SessionState::Idle));
    assert_eq!(outcome.response.headers.get("CSeq"), Some("42"));
}

#[test]
fn announce_with_valid_sdp_advances_to_announced() {
    let outcome = handle_request(
        &announce(2, SDP, "application/sdp"),
        &session_in(SessionState::Idle),
    );
    assert_eq!(outcome.response.status.as_u16(), 200);
    assert_eq!(outcome.new_state, Some(SessionState::Announced));
    let Some(SessionAction::ApplyFormat(format)) = outcome.action else {
        panic!("expected ApplyFormat");
    };
    assert_eq!(format.sample_rate, 44_100);
    assert_eq!(format.frames_per_packet, 352);
}

#[test]
fn announce_without_sdp_content_type_is_400() {
    let outcome = handle_request(
        &announce(2, SDP, "text/plain"),
        &session_in(SessionState::Idle),
    );
    assert_eq!(outcome.response.status.as_u16(), 400);
    assert!(outcome.new_state.is_none());
}

#[test]
fn announce_with_garbage_body_is_400() {
    let outcome = handle_request(
        &announce(2, "m=audio 0\r\n", "application/sdp"),
        &session_in(SessionState::Idle),
    );
    assert_eq!(outcome.response.status.as_u16(), 400);
}

#[test]
fn encrypted_announce_is_401_with_diagnostic() {
    let encrypted = format!(
        "{SDP}a=rsaaeskey:c2VjcmV0a2V5\r\na=aesiv:AAAAAAAAAAAAAAAAAAAAAA==\r\n"
    );
    let outcome = handle_request(
        &announce(2, &encrypted, "application/sdp"),
        &session_in(SessionState::Idle),
    );
    assert_eq!(outcome.response.status.as_u16(), 401);
    let body = String::from_utf8_lossy(&outcome.response.body);
    assert!(body.contains("encrypted"), "{body}");
}

#[test]
fn setup_parses_transport_and_requests_port_allocation() {
    let mut req = request(Method::Setup, 3);
    req.headers.insert(
        "Transport",
        "RTP/AVP/UDP;unicast;mode=record;client_port=6000-6001",
    );
    let outcome = handle_request(&req, &session_in(SessionState::Announced));
    assert_eq!(outcome.response.status.as_u16(), 200);
    assert_eq!(outcome.new_state, Some(SessionState::SetUp));
    let Some(SessionAction::Setup { transport }) = outcome.action else {
        panic!("expected Setup");
    };
    assert_eq!(transport.client_rtp_port, Some(6000));
    assert_eq!(transport.client_control_port, Some(6001));
}

#[test]
fn setup_without_transport_is_400() {
    let outcome = handle_request(&request(Method::Setup, 3), &session_in(SessionState::Announced));
    assert_eq!(outcome.response.status.as_u16(), 400);
}

#[test]
fn record_reports_latency_and_starts_intake() {
    let mut req = request(Method::Record, 4);
    req.headers.insert("RTP-Info", "seq=17;rtptime=123456");
    let outcome = handle_request(&req, &session_in(SessionState::SetUp));
    assert_eq!(outcome.response.status.as_u16(), 200);
    assert!(outcome.response.headers.get("Audio-Latency").is_some());
    assert_eq!(outcome.new_state, Some(SessionState::Recording));
    let Some(SessionAction::StartRecording {
        initial_seq,
        initial_rtptime,
    }) = outcome.action
    else {
        panic!("expected StartRecording");
    };
    assert_eq!(initial_seq, Some(17));
    assert_eq!(initial_rtptime, Some(123_456));
}

#[test]
fn flush_carries_the_sequence_expectation() {
    let mut req = request(Method::Flush, 7);
    req.headers.insert("RTP-Info", "seq=12345;rtptime=99999");
    let outcome = handle_request(&req, &session_in(SessionState::Recording));
    assert_eq!(outcome.response.status.as_u16(), 200);
    let Some(SessionAction::Flush { next_seq }) = outcome.action else {
        panic!("expected Flush");
    };
    assert_eq!(next_seq, Some(12_345));
}

#[test]
fn teardown_from_recording_detaches() {
    let outcome = handle_request(&request(Method::Teardown, 5), &session_in(SessionState::Recording));
    assert_eq!(outcome.response.status.as_u16(), 200);
    assert_eq!(outcome.new_state, Some(SessionState::TornDown));
    assert!(matches!(outcome.action, Some(SessionAction::Teardown)));
}

#[test]
fn out_of_sequence_methods_get_455() {
    // Every (method, wrong state) pair in the table answers 455
    let cases = [
        (Method::Announce, SessionState::Announced),
        (Method::Announce, SessionState::Recording),
        (Method::Setup, SessionState::Idle),
        (Method::Setup, SessionState::Recording),
        (Method::Record, SessionState::Idle),
        (Method::Record, SessionState::Announced),
        (Method::Flush, SessionState::SetUp),
        (Method::Pause, SessionState::Idle),
        (Method::Teardown, SessionState::Idle),
    ];
    for (method, state) in cases {
        let outcome = handle_request(&request(method, 9), &session_in(state));
        assert_eq!(
            outcome.response.status.as_u16(),
            455,
            "{method:?} in {state:?}"
        );
        assert!(outcome.new_state.is_none());
        assert!(outcome.action.is_none());
    }
}

#[test]
fn get_parameter_answers_volume_queries() {
    let mut session = session_in(SessionState::Recording);
    session.set_volume_db(-12.5);

    let mut req = request(Method::GetParameter, 8);
    req.body = b"volume\r\n".to_vec();
    let outcome = handle_request(&req, &session);
    let body = String::from_utf8_lossy(&outcome.response.body);
    assert!(body.starts_with("volume: -12.5"), "{body}");
}

#[test]
fn empty_get_parameter_is_a_keepalive() {
    let outcome = handle_request(&request(Method::GetParameter, 8), &session_in(SessionState::Idle));
    assert_eq!(outcome.response.status.as_u16(), 200);
    assert!(outcome.response.body.is_empty());
}

#[test]
fn set_parameter_volume_yields_action() {
    let mut req = request(Method::SetParameter, 9);
    req.headers.insert("Content-Type", "text/parameters");
    req.body = b"volume: -20.5\r\n".to_vec();
    let outcome = handle_request(&req, &session_in(SessionState::Recording));
    assert_eq!(outcome.response.status.as_u16(), 200);
    let Some(SessionAction::SetVolume(db)) = outcome.action else {
        panic!("expected SetVolume");
    };
    assert!((db - -20.5).abs() < f32::EPSILON);
}

#[test]
fn set_parameter_metadata_is_acknowledged_and_ignored() {
    let mut req = request(Method::SetParameter, 9);
    req.headers.insert("Content-Type", "application/x-dmap-tagged");
    req.body = vec![0x6D, 0x6C, 0x69, 0x74];
    let outcome = handle_request(&req, &session_in(SessionState::Recording));
    assert_eq!(outcome.response.status.as_u16(), 200);
    assert!(outcome.action.is_none());
}
