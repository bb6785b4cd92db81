//! Receiver discovery and our own service advertisement

pub mod advertiser;
pub mod browser;
pub mod parser;

pub use advertiser::{AdvertiserConfig, AdvertiserError, RaopAdvertiser};
pub use browser::{BindMode, DiscoveryBrowser, DiscoveryError, DiscoveryEvent};
pub use parser::DiscoveredService;

/// Service types we browse for, in the order they are registered
pub const BROWSE_SERVICE_TYPES: [&str; 3] = [
    "_airplay._tcp.local.",
    "_raop._tcp.local.",
    "_airport._tcp.local.",
];

/// Service type we advertise ourselves under
pub const RAOP_SERVICE_TYPE: &str = "_raop._tcp.local.";

#[cfg(test)]
mod tests;
