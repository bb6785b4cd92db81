//! Pure RTSP request handlers
//!
//! Handlers take a request and the session, and return a response plus
//! the side effects the connection driver must perform. No I/O happens
//! here, which keeps every path of the state machine testable.

use super::{SenderSession, SessionState};
use crate::protocol::rtsp::{
    Method, ResponseBuilder, RtspRequest, RtspResponse, StatusCode, TransportHeader,
    headers::names,
};
use crate::protocol::sdp::{SdpParser, StreamFormat};

/// Side effects the connection driver performs after a handler ran
#[derive(Debug)]
pub enum SessionAction {
    /// Store the announced stream format
    ApplyFormat(StreamFormat),
    /// Allocate UDP ports and finish the SETUP response
    Setup {
        /// Parsed transport header from the request
        transport: TransportHeader,
    },
    /// Start audio intake and attach the stream to the sync engine
    StartRecording {
        /// Initial RTP sequence from `RTP-Info`, when present
        initial_seq: Option<u16>,
        /// Initial RTP timestamp from `RTP-Info`, when present
        initial_rtptime: Option<u32>,
    },
    /// Pause intake without ending the session
    Pause,
    /// Clear queued audio and reset the sequence expectation
    Flush {
        /// Sequence expectation from `RTP-Info`, when present
        next_seq: Option<u16>,
    },
    /// Detach the stream and schedule the connection close
    Teardown,
    /// Apply a sender volume update (dB)
    SetVolume(f32),
}

/// Result of handling one request
#[derive(Debug)]
pub struct HandleOutcome {
    /// Response to send
    pub response: RtspResponse,
    /// State to enter, validated by the caller
    pub new_state: Option<SessionState>,
    /// Side effect to perform
    pub action: Option<SessionAction>,
}

impl HandleOutcome {
    fn respond(response: RtspResponse) -> Self {
        Self {
            response,
            new_state: None,
            action: None,
        }
    }
}

/// Dispatch one request against the session state machine
#[must_use]
pub fn handle_request(request: &RtspRequest, session: &SenderSession) -> HandleOutcome {
    let cseq = request.headers.cseq().unwrap_or(0);

    match request.method {
        Method::Options => handle_options(cseq),
        Method::Announce => handle_announce(request, cseq, session),
        Method::Setup => handle_setup(request, cseq, session),
        Method::Record => handle_record(request, cseq, session),
        Method::Pause => handle_pause(cseq, session),
        Method::Flush => handle_flush(request, cseq, session),
        Method::Teardown => handle_teardown(cseq, session),
        Method::GetParameter => handle_get_parameter(request, cseq, session),
        Method::SetParameter => handle_set_parameter(request, cseq),
    }
}

/// 455 for a method arriving in the wrong state
fn out_of_sequence(cseq: u32) -> HandleOutcome {
    HandleOutcome::respond(
        ResponseBuilder::error(StatusCode::METHOD_NOT_VALID)
            .cseq(cseq)
            .build(),
    )
}

fn handle_options(cseq: u32) -> HandleOutcome {
    let verbs: Vec<&str> = Method::ALL.iter().map(|m| m.as_str()).collect();
    HandleOutcome::respond(
        ResponseBuilder::ok()
            .cseq(cseq)
            .header(names::PUBLIC, &verbs.join(", "))
            .build(),
    )
}

fn handle_announce(request: &RtspRequest, cseq: u32, session: &SenderSession) -> HandleOutcome {
    if session.state() != SessionState::Idle {
        return out_of_sequence(cseq);
    }

    let is_sdp = request
        .headers
        .content_type()
        .is_some_and(|ct| ct.contains("application/sdp"));
    if !is_sdp || request.body.is_empty() {
        return HandleOutcome::respond(
            ResponseBuilder::error(StatusCode::BAD_REQUEST).cseq(cseq).build(),
        );
    }

    let Ok(body) = std::str::from_utf8(&request.body) else {
        return HandleOutcome::respond(
            ResponseBuilder::error(StatusCode::BAD_REQUEST).cseq(cseq).build(),
        );
    };

    let format = match SdpParser::parse(body).and_then(|sdp| StreamFormat::from_sdp(&sdp)) {
        Ok(format) => format,
        Err(e) => {
            tracing::warn!(peer = %session.peer(), error = %e, "rejecting ANNOUNCE");
            return HandleOutcome::respond(
                ResponseBuilder::error(StatusCode::BAD_REQUEST).cseq(cseq).build(),
            );
        }
    };

    if format.is_encrypted() {
        // No Apple RSA private key on board; be explicit about why
        tracing::warn!(peer = %session.peer(), "encrypted sender rejected");
        return HandleOutcome::respond(
            ResponseBuilder::error(StatusCode::UNAUTHORIZED)
                .cseq(cseq)
                .text_body(
                    "encrypted RAOP sessions are not supported; \
configure the sender for unencrypted streaming\r\n",
                )
                .build(),
        );
    }

    tracing::info!(
        peer = %session.peer(),
        codec = ?format.codec,
        sample_rate = format.sample_rate,
        channels = format.channels,
        "stream announced"
    );

    HandleOutcome {
        response: ResponseBuilder::ok().cseq(cseq).build(),
        new_state: Some(SessionState::Announced),
        action: Some(SessionAction::ApplyFormat(format)),
    }
}

fn handle_setup(request: &RtspRequest, cseq: u32, session: &SenderSession) -> HandleOutcome {
    if session.state() != SessionState::Announced {
        return out_of_sequence(cseq);
    }

    let Some(transport_value) = request.headers.get(names::TRANSPORT) else {
        return HandleOutcome::respond(
            ResponseBuilder::error(StatusCode::BAD_REQUEST).cseq(cseq).build(),
        );
    };
    let Ok(transport) = TransportHeader::parse(transport_value) else {
        return HandleOutcome::respond(
            ResponseBuilder::error(StatusCode::BAD_REQUEST).cseq(cseq).build(),
        );
    };

    // The driver allocates ports and completes the Transport and
    // Session headers before sending this response
    HandleOutcome {
        response: ResponseBuilder::ok().cseq(cseq).build(),
        new_state: Some(SessionState::SetUp),
        action: Some(SessionAction::Setup { transport }),
    }
}

fn handle_record(request: &RtspRequest, cseq: u32, session: &SenderSession) -> HandleOutcome {
    if session.state() != SessionState::SetUp {
        return out_of_sequence(cseq);
    }

    let (initial_seq, initial_rtptime) = parse_rtp_info(request);
    // Advertise our intake buffering as latency, in samples
    let latency = session
        .format()
        .map_or(88_200, |f| f.sample_rate * 2);

    HandleOutcome {
        response: ResponseBuilder::ok().cseq(cseq).audio_latency(latency).build(),
        new_state: Some(SessionState::Recording),
        action: Some(SessionAction::StartRecording {
            initial_seq,
            initial_rtptime,
        }),
    }
}

fn handle_pause(cseq: u32, session: &SenderSession) -> HandleOutcome {
    if session.state() != SessionState::Recording {
        return out_of_sequence(cseq);
    }
    HandleOutcome {
        response: ResponseBuilder::ok().cseq(cseq).build(),
        new_state: None,
        action: Some(SessionAction::Pause),
    }
}

fn handle_flush(request: &RtspRequest, cseq: u32, session: &SenderSession) -> HandleOutcome {
    if session.state() != SessionState::Recording {
        return out_of_sequence(cseq);
    }
    let (next_seq, _) = parse_rtp_info(request);
    HandleOutcome {
        response: ResponseBuilder::ok().cseq(cseq).build(),
        new_state: None, // Flushing is entered and left by the driver
        action: Some(SessionAction::Flush { next_seq }),
    }
}

fn handle_teardown(cseq: u32, session: &SenderSession) -> HandleOutcome {
    if !session.state().is_active() {
        return out_of_sequence(cseq);
    }
    HandleOutcome {
        response: ResponseBuilder::ok().cseq(cseq).build(),
        new_state: Some(SessionState::TornDown),
        action: Some(SessionAction::Teardown),
    }
}

fn handle_get_parameter(request: &RtspRequest, cseq: u32, session: &SenderSession) -> HandleOutcome {
    // An empty body is a keep-alive ping
    let body = String::from_utf8_lossy(&request.body);
    if body.contains("volume") {
        return HandleOutcome::respond(
            ResponseBuilder::ok()
                .cseq(cseq)
                .text_body(&format!("volume: {:.6}\r\n", session.volume_db()))
                .build(),
        );
    }
    HandleOutcome::respond(ResponseBuilder::ok().cseq(cseq).build())
}

fn handle_set_parameter(request: &RtspRequest, cseq: u32) -> HandleOutcome {
    // Volume arrives as "volume: -20.0"; everything else (metadata,
    // artwork, progress) is acknowledged and ignored
    let body = String::from_utf8_lossy(&request.body);
    let volume = body.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "volume")
            .then(|| value.trim().parse::<f32>().ok())
            .flatten()
    });

    let mut outcome = HandleOutcome::respond(ResponseBuilder::ok().cseq(cseq).build());
    if let Some(db) = volume {
        outcome.action = Some(SessionAction::SetVolume(db));
    }
    outcome
}

/// Parse `RTP-Info: seq=...;rtptime=...`
fn parse_rtp_info(request: &RtspRequest) -> (Option<u16>, Option<u32>) {
    let Some(info) = request.headers.get(names::RTP_INFO) else {
        return (None, None);
    };
    let mut seq = None;
    let mut rtptime = None;
    for part in info.split(';') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("seq=") {
            seq = v.parse().ok();
        } else if let Some(v) = part.strip_prefix("rtptime=") {
            rtptime = v.parse().ok();
        }
    }
    (seq, rtptime)
}
