//! RTP framing: audio packets, timing exchange, control frames

pub mod control;
pub mod packet;
pub mod timing;

pub use control::{ControlPacket, PlaybackCommand};
pub use packet::{RtpDecodeError, RtpHeader, RtpPacket};
pub use timing::{NtpTimestamp, TimingRequest, TimingResponse};
