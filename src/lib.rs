//! # airplay-multiroom
//!
//! A multi-room AirPlay audio server. It terminates RAOP (AirPlay 1)
//! sender sessions over RTSP, extracts the PCM stream, and re-streams
//! it time-synchronized to a fleet of downstream AirPlay receivers
//! discovered via mDNS or configured manually.
//!
//! ## Architecture
//!
//! - [`session`] terminates sender sessions (RTSP state machine, UDP
//!   audio intake, loss concealment)
//! - [`fanout`] carries contiguous frames from the one producer to the
//!   per-receiver egress tasks
//! - [`sync`] owns the presentation schedule and keeps every receiver
//!   within the skew tolerance
//! - [`discovery`] and [`registry`] learn and track receivers
//! - [`control`] is the contract offered to the outer shell
//!
//! ## Example
//!
//! ```rust,no_run
//! use airplay_multiroom::{Config, MultiroomServer};
//!
//! # async fn example() -> Result<(), airplay_multiroom::ServerError> {
//! let server = MultiroomServer::start(Config::default()).await?;
//! let receivers = server.control().list_receivers(false).await;
//! println!("{} receivers available", receivers.len());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod control;
pub mod discovery;
pub mod error;
pub mod fanout;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod stats;
pub mod sync;
pub mod types;

mod server;

pub use config::{Config, ConfigError};
pub use control::{ControlError, ControlSurface, ServerEvent};
pub use error::ServerError;
pub use server::MultiroomServer;
pub use stats::{PlaybackState, StatsSnapshot};
pub use types::{Receiver, ReceiverId, ReceiverStatus};
