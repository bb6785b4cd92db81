//! Multi-room synchronization engine

pub mod delay;
pub mod egress;
pub mod engine;
pub mod schedule;

pub use delay::DeviceDelay;
pub use engine::{EngineError, EngineEvent, EngineHandle, SyncEngine};
pub use schedule::PresentationSchedule;

#[cfg(test)]
mod tests;
