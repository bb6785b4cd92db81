//! SDP parsing for RAOP ANNOUNCE bodies

pub mod parser;
pub mod raop;

pub use parser::{SdpParseError, SdpParser};
pub use raop::{AlacParameters, AudioCodec, EncryptionParams, StreamFormat};

use std::collections::HashMap;

/// Parsed `o=` origin line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpOrigin {
    /// Username field
    pub username: String,
    /// Session id
    pub session_id: String,
    /// Session version
    pub session_version: String,
    /// Network type (`IN`)
    pub net_type: String,
    /// Address type (`IP4`)
    pub addr_type: String,
    /// Origin address
    pub unicast_address: String,
}

/// Parsed `c=` connection line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpConnection {
    /// Network type (`IN`)
    pub net_type: String,
    /// Address type
    pub addr_type: String,
    /// Connection address
    pub address: String,
}

/// One `m=` section with its attributes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaDescription {
    /// Media type, e.g. `audio`
    pub media_type: String,
    /// Declared port (0 for RAOP, ports come from SETUP)
    pub port: u16,
    /// Transport protocol, e.g. `RTP/AVP`
    pub protocol: String,
    /// Payload format numbers
    pub formats: Vec<String>,
    /// `a=` attributes scoped to this media section
    pub attributes: HashMap<String, Option<String>>,
}

/// A parsed SDP document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDescription {
    /// Protocol version (`v=`)
    pub version: u8,
    /// Origin line
    pub origin: Option<SdpOrigin>,
    /// Session name (`s=`)
    pub session_name: String,
    /// Session-level connection
    pub connection: Option<SdpConnection>,
    /// Timing line (`t=`)
    pub timing: Option<(u64, u64)>,
    /// Session-level attributes
    pub attributes: HashMap<String, Option<String>>,
    /// Media sections
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    /// First audio media section, if any
    #[must_use]
    pub fn audio_media(&self) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.media_type == "audio")
    }

    /// Re-emit as SDP text.
    ///
    /// Line order follows RFC 4566 section ordering; attribute order
    /// within a section is not preserved.
    #[must_use]
    pub fn to_sdp(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("v={}\r\n", self.version));
        if let Some(ref o) = self.origin {
            out.push_str(&format!(
                "o={} {} {} {} {} {}\r\n",
                o.username,
                o.session_id,
                o.session_version,
                o.net_type,
                o.addr_type,
                o.unicast_address
            ));
        }
        out.push_str(&format!("s={}\r\n", self.session_name));
        if let Some(ref c) = self.connection {
            out.push_str(&format!("c={} {} {}\r\n", c.net_type, c.addr_type, c.address));
        }
        if let Some((start, stop)) = self.timing {
            out.push_str(&format!("t={start} {stop}\r\n"));
        }
        emit_attributes(&mut out, &self.attributes);
        for m in &self.media {
            out.push_str(&format!(
                "m={} {} {} {}\r\n",
                m.media_type,
                m.port,
                m.protocol,
                m.formats.join(" ")
            ));
            emit_attributes(&mut out, &m.attributes);
        }
        out
    }
}

fn emit_attributes(out: &mut String, attributes: &HashMap<String, Option<String>>) {
    let mut keys: Vec<&String> = attributes.keys().collect();
    keys.sort();
    for key in keys {
        match &attributes[key] {
            Some(value) => out.push_str(&format!("a={key}:{value}\r\n")),
            None => out.push_str(&format!("a={key}\r\n")),
        }
    }
}

#[cfg(test)]
mod tests;
