//! Core types shared across the server

pub mod frame;
pub mod receiver;

pub use frame::AudioFrame;
pub use receiver::{DeviceKind, Receiver, ReceiverId, ReceiverOrigin, ReceiverStatus};
