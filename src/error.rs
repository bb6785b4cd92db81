//! Top-level error type and exit-code mapping

use crate::config::ConfigError;

/// Errors that prevent the server from starting or keep it from running.
///
/// Recoverable conditions (a single receiver failing, a malformed RTSP
/// request) never surface here; they are handled in place per their
/// component and reported on the event stream.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration rejected at startup
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Could not bind the RAOP TCP listener
    #[error("cannot bind RAOP listener on port {port}: {source}")]
    RaopBind {
        /// Configured listener port
        port: u16,
        /// Underlying bind failure
        source: std::io::Error,
    },

    /// Could not register our mDNS advertisement
    #[error("service advertisement failed: {0}")]
    Advertise(#[from] crate::discovery::AdvertiserError),

    /// IO error outside a recoverable context
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Process exit code for this error: 2 for invalid configuration,
    /// 1 for everything else unrecoverable.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::Config(_) => 2,
            _ => 1,
        }
    }
}
