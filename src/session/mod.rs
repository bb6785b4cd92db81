//! RAOP session termination
//!
//! One sender connection owns one [`SenderSession`]. The RTSP state
//! machine lives here; the connection driver is in [`server`], pure
//! request handling in [`handler`], and UDP audio intake in [`intake`].

pub mod decoder;
pub mod handler;
pub mod intake;
pub mod reorder;
pub mod server;

pub use server::RaopServer;

use crate::protocol::sdp::StreamFormat;
use std::net::SocketAddr;
use std::time::Instant;

/// RAOP session states.
///
/// `Flushing` is transient: a FLUSH enters it for the duration of the
/// buffer clear and returns to `Recording`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// TCP connection accepted, nothing announced yet
    Idle,
    /// ANNOUNCE accepted, stream format known
    Announced,
    /// SETUP accepted, UDP ports allocated
    SetUp,
    /// RECORD accepted, audio intake running
    Recording,
    /// FLUSH in progress
    Flushing,
    /// TEARDOWN received or transport lost
    TornDown,
}

impl SessionState {
    /// Whether a transition to `next` follows the state machine
    #[must_use]
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::{Announced, Flushing, Idle, Recording, SetUp, TornDown};
        matches!(
            (self, next),
            (Idle, Announced)
                | (Announced, SetUp)
                | (SetUp, Recording)
                | (Recording, Flushing)
                | (Flushing, Recording)
                | (Announced | SetUp | Recording | Flushing, TornDown)
        )
    }

    /// States in which a TEARDOWN is accepted
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Announced
                | SessionState::SetUp
                | SessionState::Recording
                | SessionState::Flushing
        )
    }
}

/// Per-sender session state, owned exclusively by its connection task
#[derive(Debug)]
pub struct SenderSession {
    state: SessionState,
    peer: SocketAddr,
    format: Option<StreamFormat>,
    token: Option<String>,
    client_rtp_port: Option<u16>,
    client_control_port: Option<u16>,
    volume_db: f32,
    created_at: Instant,
}

/// Session state errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A transition outside the state machine was attempted
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// State before the attempt
        from: SessionState,
        /// Requested state
        to: SessionState,
    },
}

impl SenderSession {
    /// New session for an accepted connection
    #[must_use]
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            state: SessionState::Idle,
            peer,
            format: None,
            token: None,
            client_rtp_port: None,
            client_control_port: None,
            volume_db: 0.0,
            created_at: Instant::now(),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Sender address
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Advance the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] when the transition
    /// is not in the state graph.
    pub fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(peer = %self.peer, from = ?self.state, to = ?next, "session transition");
        self.state = next;
        Ok(())
    }

    /// Stream format from ANNOUNCE
    #[must_use]
    pub fn format(&self) -> Option<&StreamFormat> {
        self.format.as_ref()
    }

    /// Record the announced stream format
    pub fn set_format(&mut self, format: StreamFormat) {
        self.format = Some(format);
    }

    /// Session token issued at SETUP
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Issue a fresh numeric session token
    pub fn issue_token(&mut self) -> String {
        let token = generate_token();
        self.token = Some(token.clone());
        token
    }

    /// Record the sender's ports from the Transport header
    pub fn set_client_ports(&mut self, rtp: Option<u16>, control: Option<u16>) {
        self.client_rtp_port = rtp;
        self.client_control_port = control;
    }

    /// Sender's RTP port, when announced
    #[must_use]
    pub fn client_rtp_port(&self) -> Option<u16> {
        self.client_rtp_port
    }

    /// Sender's control port, when announced
    #[must_use]
    pub fn client_control_port(&self) -> Option<u16> {
        self.client_control_port
    }

    /// Current volume in dB
    #[must_use]
    pub fn volume_db(&self) -> f32 {
        self.volume_db
    }

    /// Set volume, clamped to the RAOP range
    pub fn set_volume_db(&mut self, db: f32) {
        self.volume_db = db.clamp(-144.0, 0.0);
    }

    /// Session age
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

/// Numeric session token, as senders expect (`^[0-9]+$`)
fn generate_token() -> String {
    use rand::Rng;
    rand::thread_rng().gen_range(1_000_000_000u64..=9_999_999_999).to_string()
}

#[cfg(test)]
mod tests;
