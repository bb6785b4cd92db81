//! Service classification and TXT record extraction

use crate::types::DeviceKind;
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Parsed view of one observed mDNS service
#[derive(Debug, Clone)]
pub struct DiscoveredService {
    /// Full service name including type and domain
    pub fullname: String,
    /// Instance name (everything before the service type)
    pub instance_name: String,
    /// Service type the sighting came from
    pub service_type: String,
    /// Classified endpoint kind
    pub kind: DeviceKind,
    /// Resolved IPv4 addresses
    pub addresses: Vec<Ipv4Addr>,
    /// Advertised port
    pub port: u16,
    /// TXT records (UTF-8 values only; others are skipped)
    pub txt: HashMap<String, String>,
}

impl DiscoveredService {
    /// Model string (`am` TXT record), mapped to a friendly name when known
    #[must_use]
    pub fn model(&self) -> Option<String> {
        self.txt.get("am").map(|m| friendly_model_name(m).to_string())
    }

    /// Firmware string (`fv` TXT record)
    #[must_use]
    pub fn firmware(&self) -> Option<String> {
        self.txt.get("fv").cloned()
    }

    /// Feature bitmap (`ft` TXT record, hex)
    #[must_use]
    pub fn features(&self) -> Option<u64> {
        self.txt.get("ft").and_then(|f| parse_hex(f))
    }
}

/// Classify a service sighting.
///
/// Rules are applied in order, first match wins:
/// 1. `_raop._tcp` → audio receiver
/// 2. `_airplay._tcp` with feature bit 1 set → video-capable
/// 3. `_airplay._tcp` → audio receiver
/// 4. `_airport._tcp` → AirPort Express
/// 5. anything else → unknown (still registered)
#[must_use]
pub fn classify(service_type: &str, txt: &HashMap<String, String>) -> DeviceKind {
    if service_type.contains("_raop._tcp") {
        return DeviceKind::AudioReceiver;
    }
    if service_type.contains("_airplay._tcp") {
        let features = txt.get("ft").and_then(|f| parse_hex(f)).unwrap_or(0);
        if features & 0x02 != 0 {
            return DeviceKind::VideoCapable;
        }
        return DeviceKind::AudioReceiver;
    }
    if service_type.contains("_airport._tcp") {
        return DeviceKind::AirportExpress;
    }
    DeviceKind::Unknown
}

/// Parse a hex string, with or without a `0x` prefix.
///
/// Some devices advertise `ft` as two comma-separated 32-bit halves
/// (`0x1234,0x5678` = low,high); those are combined.
#[must_use]
pub fn parse_hex(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some((lo, hi)) = s.split_once(',') {
        let lo = parse_hex_single(lo)?;
        let hi = parse_hex_single(hi)?;
        return Some((hi << 32) | (lo & 0xFFFF_FFFF));
    }
    parse_hex_single(s)
}

fn parse_hex_single(s: &str) -> Option<u64> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(s, 16).ok()
}

/// Map Apple model identifiers to friendly names
#[must_use]
pub fn friendly_model_name(model: &str) -> &str {
    match model {
        "AudioAccessory1,1" | "AudioAccessory1,2" => "HomePod",
        "AudioAccessory5,1" => "HomePod mini",
        "AudioAccessory6,1" => "HomePod (2nd generation)",
        "AirPort4,107" | "AirPort10,115" => "AirPort Express",
        "AppleTV5,3" => "Apple TV HD",
        "AppleTV6,2" | "AppleTV11,1" | "AppleTV14,1" => "Apple TV 4K",
        _ => model,
    }
}

/// Instance name from a service fullname
/// (`Living Room._raop._tcp.local.` → `Living Room`)
#[must_use]
pub fn instance_name(fullname: &str) -> &str {
    fullname.split('.').next().unwrap_or(fullname)
}

/// Extract UTF-8 TXT records from raw bytes, skipping values that do
/// not decode; the skip is logged, not fatal.
#[must_use]
pub fn extract_txt<'a>(
    properties: impl Iterator<Item = (&'a str, &'a [u8])>,
) -> HashMap<String, String> {
    let mut txt = HashMap::new();
    for (key, value) in properties {
        match std::str::from_utf8(value) {
            Ok(v) => {
                txt.insert(key.to_string(), v.to_string());
            }
            Err(_) => {
                tracing::debug!(key = %key, "skipping non-UTF-8 TXT record");
            }
        }
    }
    txt
}
