//! Advertisement of our own RAOP service
//!
//! Senders find us via a `_raop._tcp.local.` instance named `MAC@Name`.
//! The MAC prefix is required by the RAOP naming convention; when no
//! hardware address is available a stable pseudo-MAC is derived from
//! the machine identity so the instance name survives restarts.

use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::collections::HashMap;

/// Advertisement failures
#[derive(Debug, thiserror::Error)]
pub enum AdvertiserError {
    /// mDNS daemon rejected the registration
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    /// Registration attempted twice
    #[error("service already registered")]
    AlreadyRegistered,
}

/// What we advertise
#[derive(Debug, Clone)]
pub struct AdvertiserConfig {
    /// Instance name shown to senders
    pub name: String,
    /// RAOP RTSP port
    pub port: u16,
    /// Advertised sample rate
    pub sample_rate: u32,
    /// Advertised bit depth
    pub sample_size: u8,
    /// Advertised channel count
    pub channels: u8,
}

impl Default for AdvertiserConfig {
    fn default() -> Self {
        Self {
            name: "Multiroom Audio".to_string(),
            port: 5001,
            sample_rate: 44_100,
            sample_size: 16,
            channels: 2,
        }
    }
}

impl AdvertiserConfig {
    /// TXT records for the advertisement.
    ///
    /// `cn=0,1` announces PCM and ALAC; `et=0` announces that only
    /// unencrypted sessions are accepted.
    #[must_use]
    pub fn txt_records(&self) -> HashMap<String, String> {
        let mut txt = HashMap::new();
        txt.insert("txtvers".to_string(), "1".to_string());
        txt.insert("ch".to_string(), self.channels.to_string());
        txt.insert("cn".to_string(), "0,1".to_string());
        txt.insert("et".to_string(), "0".to_string());
        txt.insert("sr".to_string(), self.sample_rate.to_string());
        txt.insert("ss".to_string(), self.sample_size.to_string());
        txt.insert("tp".to_string(), "UDP".to_string());
        txt.insert("vs".to_string(), "130.14".to_string());
        txt
    }
}

/// Registered RAOP advertisement
pub struct RaopAdvertiser {
    daemon: ServiceDaemon,
    fullname: Option<String>,
    service_name: String,
}

impl RaopAdvertiser {
    /// Register the service on the given daemon.
    ///
    /// # Errors
    ///
    /// Returns [`AdvertiserError::Mdns`] when the daemon rejects the
    /// service info or registration.
    pub fn register(daemon: ServiceDaemon, config: &AdvertiserConfig) -> Result<Self, AdvertiserError> {
        let mac = stable_mac();
        let service_name = format!("{}@{}", format_mac(&mac), config.name);
        let host = hostname_for_mdns();

        let info = ServiceInfo::new(
            super::RAOP_SERVICE_TYPE,
            &service_name,
            &host,
            "",
            config.port,
            config.txt_records(),
        )?
        .enable_addr_auto();

        let fullname = info.get_fullname().to_string();
        daemon.register(info)?;

        tracing::info!(name = %service_name, port = config.port, "RAOP service advertised");

        Ok(Self {
            daemon,
            fullname: Some(fullname),
            service_name,
        })
    }

    /// Instance name as advertised
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Withdraw the advertisement
    pub fn unregister(&mut self) {
        if let Some(fullname) = self.fullname.take() {
            let _ = self.daemon.unregister(&fullname);
            tracing::info!(name = %fullname, "RAOP service withdrawn");
        }
    }
}

impl Drop for RaopAdvertiser {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// Derive a stable pseudo-MAC from machine identity.
///
/// The locally-administered bit is set so the address can never collide
/// with real hardware.
#[must_use]
pub fn stable_mac() -> [u8; 6] {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let seed = std::fs::read_to_string("/etc/machine-id").unwrap_or_else(|_| {
        hostname::get().map_or_else(
            |_| "airplay-multiroom".to_string(),
            |h| h.to_string_lossy().into_owned(),
        )
    });

    let mut hasher = DefaultHasher::new();
    seed.trim().hash(&mut hasher);
    let hash = hasher.finish();

    #[allow(clippy::cast_possible_truncation)]
    let mut mac = [
        (hash >> 40) as u8,
        (hash >> 32) as u8,
        (hash >> 24) as u8,
        (hash >> 16) as u8,
        (hash >> 8) as u8,
        hash as u8,
    ];
    mac[0] |= 0x02;
    mac[0] &= !0x01;
    mac
}

/// Format a MAC for the RAOP instance name: uppercase hex, no separators
#[must_use]
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter().map(|b| format!("{b:02X}")).collect()
}

fn hostname_for_mdns() -> String {
    hostname::get().map_or_else(
        |_| "airplay-multiroom.local.".to_string(),
        |h| format!("{}.local.", h.to_string_lossy()),
    )
}
