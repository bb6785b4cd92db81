//! RAOP TCP listener and per-connection driver

use super::handler::{self, SessionAction};
use super::intake::{IntakeCommand, IntakeHandle, spawn_intake};
use super::{SenderSession, SessionState};
use crate::error::ServerError;
use crate::fanout::FanoutBuffer;
use crate::protocol::rtsp::{
    ParseError, ResponseBuilder, RtspServerCodec, StatusCode, encode_response, headers::names,
};
use crate::protocol::sdp::StreamFormat;
use crate::stats::{PlaybackState, ServerStats};
use crate::sync::EngineHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;

/// Shared dependencies handed to every connection
#[derive(Clone)]
pub struct SessionDeps {
    /// Sync engine handle for attach/flush/detach
    pub engine: EngineHandle,
    /// Shared counters
    pub stats: Arc<ServerStats>,
    /// Per-request read deadline
    pub read_timeout: Duration,
    /// Server-wide shutdown signal
    pub shutdown: broadcast::Sender<()>,
}

/// RAOP terminator: accepts sender connections on the configured port
pub struct RaopServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RaopServer {
    /// Bind the RAOP listener.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::RaopBind`] when the port is unavailable;
    /// this is fatal (exit code 1).
    pub async fn bind(port: u16) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| ServerError::RaopBind { port, source })?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "RAOP listener bound");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Actual bound address (useful with port 0 in tests)
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop; runs until the shutdown signal
    pub async fn run(self, deps: SessionDeps, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::info!(%peer, "sender connected");
                            let deps = deps.clone();
                            let conn_shutdown = shutdown.resubscribe();
                            tokio::spawn(async move {
                                if let Err(e) = drive_connection(stream, peer, deps, conn_shutdown).await {
                                    tracing::warn!(%peer, error = %e, "session ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("RAOP accept loop stopped");
                    return;
                }
            }
        }
    }
}

/// Per-connection resources that need cleanup
struct ConnState {
    session: SenderSession,
    sockets: Option<(UdpSocket, UdpSocket)>,
    intake: Option<IntakeHandle>,
    streaming: bool,
}

async fn drive_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    deps: SessionDeps,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let mut codec = RtspServerCodec::new();
    let mut buf = [0u8; 4096];
    let mut conn = ConnState {
        session: SenderSession::new(peer),
        sockets: None,
        intake: None,
        streaming: false,
    };

    'connection: loop {
        // The 30 s deadline applies to an in-flight request; between
        // requests the connection may idle
        let read = async {
            if codec.buffered() > 0 {
                tokio::time::timeout(deps.read_timeout, stream.read(&mut buf))
                    .await
                    .unwrap_or_else(|_| {
                        Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "request read deadline",
                        ))
                    })
            } else {
                stream.read(&mut buf).await
            }
        };

        let n = tokio::select! {
            n = read => n,
            _ = shutdown.recv() => break 'connection,
        };

        match n {
            Ok(0) => break 'connection,
            Ok(n) => codec.feed(&buf[..n]),
            Err(e) => {
                tracing::debug!(%peer, error = %e, "read failed");
                break 'connection;
            }
        }

        loop {
            let request = match codec.decode() {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    // Malformed: 400 (or 501 for a verb we don't speak),
                    // then close
                    let status = match e {
                        ParseError::UnsupportedMethod(_) => StatusCode::NOT_IMPLEMENTED,
                        _ => StatusCode::BAD_REQUEST,
                    };
                    tracing::warn!(%peer, error = %e, "malformed RTSP request");
                    let response = ResponseBuilder::error(status).cseq(0).build();
                    let _ = stream.write_all(&encode_response(&response)).await;
                    break 'connection;
                }
            };

            let outcome = handler::handle_request(&request, &conn.session);
            let mut response = outcome.response;

            if let Some(new_state) = outcome.new_state {
                if let Err(e) = conn.session.transition(new_state) {
                    // The handlers gate on state, so this is a server bug
                    tracing::error!(%peer, error = %e, "handler/state disagreement");
                    response = ResponseBuilder::error(StatusCode::INTERNAL_ERROR)
                        .cseq(request.headers.cseq().unwrap_or(0))
                        .build();
                    stream.write_all(&encode_response(&response)).await?;
                    continue;
                }
            }

            let mut close_after = false;
            if let Some(action) = outcome.action {
                match apply_action(action, &mut conn, &deps, &mut response).await {
                    Ok(close) => close_after = close,
                    Err(e) => {
                        tracing::error!(%peer, error = %e, "action failed");
                        response = ResponseBuilder::error(StatusCode::INTERNAL_ERROR)
                            .cseq(request.headers.cseq().unwrap_or(0))
                            .build();
                    }
                }
            }

            stream.write_all(&encode_response(&response)).await?;

            if close_after {
                break 'connection;
            }
        }
    }

    // Sender gone or TEARDOWN: either way the stream detaches
    if conn.streaming {
        tracing::info!(%peer, "implicit teardown");
        deps.engine.detach_stream().await;
        deps.stats.set_playback_state(PlaybackState::Stopped);
    }
    drop(conn.intake);
    tracing::info!(%peer, "sender disconnected");
    Ok(())
}

async fn apply_action(
    action: SessionAction,
    conn: &mut ConnState,
    deps: &SessionDeps,
    response: &mut crate::protocol::rtsp::RtspResponse,
) -> std::io::Result<bool> {
    match action {
        SessionAction::ApplyFormat(format) => {
            conn.session.set_format(format);
        }
        SessionAction::Setup { transport } => {
            let (audio, control) =
                allocate_udp_pair(transport.client_rtp_port).await?;
            let audio_port = audio.local_addr()?.port();
            let control_port = control.local_addr()?.port();

            conn.session
                .set_client_ports(transport.client_rtp_port, transport.client_control_port);
            let token = conn.session.issue_token();

            response.headers.insert(names::SESSION, token);
            response.headers.insert(
                names::TRANSPORT,
                transport.to_response(audio_port, control_port),
            );
            conn.sockets = Some((audio, control));
            tracing::info!(audio_port, control_port, "session transport ready");
        }
        SessionAction::StartRecording {
            initial_seq,
            initial_rtptime,
        } => {
            let Some((audio, control)) = conn.sockets.take() else {
                return Err(std::io::Error::other("RECORD without SETUP sockets"));
            };
            let format = conn
                .session
                .format()
                .cloned()
                .unwrap_or_else(StreamFormat::default);

            let fanout = FanoutBuffer::for_format(
                format.sample_rate,
                format.channels,
                format.frames_per_packet,
                deps.stats.clone(),
            );

            let intake = spawn_intake(
                audio,
                control,
                format.clone(),
                initial_seq,
                fanout.clone(),
                deps.stats.clone(),
                deps.shutdown.subscribe(),
            );
            conn.intake = Some(intake);
            conn.streaming = true;

            deps.engine
                .attach_stream(format, fanout, u64::from(initial_seq.unwrap_or(0)))
                .await;
            deps.stats.set_playback_state(PlaybackState::Playing);
            tracing::info!(initial_seq, initial_rtptime, "recording started");
        }
        SessionAction::Pause => {
            if let Some(intake) = &conn.intake {
                intake.send(IntakeCommand::Pause(true)).await;
            }
            deps.stats.set_playback_state(PlaybackState::Paused);
        }
        SessionAction::Flush { next_seq } => {
            // Transient Flushing state around the buffer clear
            let _ = conn.session.transition(SessionState::Flushing);
            if let Some(intake) = &conn.intake {
                intake.send(IntakeCommand::Flush { next_seq }).await;
            }
            if let Some(seq) = next_seq {
                deps.engine.flush(u64::from(seq)).await;
            }
            let _ = conn.session.transition(SessionState::Recording);
        }
        SessionAction::Teardown => {
            if conn.streaming {
                deps.engine.detach_stream().await;
                deps.stats.set_playback_state(PlaybackState::Stopped);
                conn.streaming = false;
            }
            conn.intake = None;
            return Ok(true);
        }
        SessionAction::SetVolume(db) => {
            conn.session.set_volume_db(db);
            tracing::debug!(db, "sender volume updated");
        }
    }
    Ok(false)
}

/// Bind an (audio, control) UDP port pair.
///
/// Senders historically expect the server ports to mirror their own
/// pair, so that is tried first; otherwise consecutive ephemeral ports
/// are probed.
async fn allocate_udp_pair(preferred: Option<u16>) -> std::io::Result<(UdpSocket, UdpSocket)> {
    if let Some(port) = preferred {
        if port > 0 && port < u16::MAX {
            if let Ok(audio) = UdpSocket::bind(("0.0.0.0", port)).await {
                if let Ok(control) = UdpSocket::bind(("0.0.0.0", port + 1)).await {
                    return Ok((audio, control));
                }
            }
        }
    }

    for _ in 0..16 {
        let audio = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let base = audio.local_addr()?.port();
        if base == u16::MAX {
            continue;
        }
        if let Ok(control) = UdpSocket::bind(("0.0.0.0", base + 1)).await {
            return Ok((audio, control));
        }
    }
    Err(std::io::Error::other(
        "cannot allocate consecutive UDP port pair",
    ))
}
