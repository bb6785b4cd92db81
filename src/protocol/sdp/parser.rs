//! Line-oriented SDP parser

use super::{MediaDescription, SdpConnection, SdpOrigin, SessionDescription};

/// SDP parse failures
#[derive(Debug, thiserror::Error)]
pub enum SdpParseError {
    /// `v=` line missing or non-numeric
    #[error("invalid version line")]
    InvalidVersion,

    /// `o=` line with fewer than six fields
    #[error("invalid origin line: {0}")]
    InvalidOrigin(String),

    /// `c=` line with fewer than three fields
    #[error("invalid connection line: {0}")]
    InvalidConnection(String),

    /// `m=` line with fewer than four fields
    #[error("invalid media line: {0}")]
    InvalidMedia(String),

    /// A malformed attribute value
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    /// A field the RAOP extraction requires was absent
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// SDP parser entry point
pub struct SdpParser;

impl SdpParser {
    /// Parse an SDP document.
    ///
    /// Unknown line types are skipped; RAOP senders include lines this
    /// server has no use for.
    ///
    /// # Errors
    ///
    /// Returns [`SdpParseError`] when a recognized line is malformed.
    pub fn parse(input: &str) -> Result<SessionDescription, SdpParseError> {
        let mut sdp = SessionDescription::default();
        let mut current_media: Option<MediaDescription> = None;

        for line in input.lines() {
            let line = line.trim();
            if line.len() < 2 || line.as_bytes()[1] != b'=' {
                continue;
            }
            let value = &line[2..];

            match line.as_bytes()[0] {
                b'v' => {
                    sdp.version = value.parse().map_err(|_| SdpParseError::InvalidVersion)?;
                }
                b'o' => sdp.origin = Some(parse_origin(value)?),
                b's' => sdp.session_name = value.to_string(),
                b'c' => {
                    // RAOP puts the connection line at session level; a
                    // media-scoped one would also be acceptable here
                    sdp.connection = Some(parse_connection(value)?);
                }
                b't' => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 2 {
                        sdp.timing = Some((
                            parts[0].parse().unwrap_or(0),
                            parts[1].parse().unwrap_or(0),
                        ));
                    }
                }
                b'm' => {
                    if let Some(media) = current_media.take() {
                        sdp.media.push(media);
                    }
                    current_media = Some(parse_media(value)?);
                }
                b'a' => {
                    let (name, attr_value) = parse_attribute(value);
                    match current_media {
                        Some(ref mut media) => {
                            media.attributes.insert(name, attr_value);
                        }
                        None => {
                            sdp.attributes.insert(name, attr_value);
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(media) = current_media {
            sdp.media.push(media);
        }

        Ok(sdp)
    }
}

fn parse_origin(value: &str) -> Result<SdpOrigin, SdpParseError> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    let [username, session_id, session_version, net_type, addr_type, unicast_address, ..] =
        parts.as_slice()
    else {
        return Err(SdpParseError::InvalidOrigin(value.to_string()));
    };
    Ok(SdpOrigin {
        username: (*username).to_string(),
        session_id: (*session_id).to_string(),
        session_version: (*session_version).to_string(),
        net_type: (*net_type).to_string(),
        addr_type: (*addr_type).to_string(),
        unicast_address: (*unicast_address).to_string(),
    })
}

fn parse_connection(value: &str) -> Result<SdpConnection, SdpParseError> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    let [net_type, addr_type, address, ..] = parts.as_slice() else {
        return Err(SdpParseError::InvalidConnection(value.to_string()));
    };
    Ok(SdpConnection {
        net_type: (*net_type).to_string(),
        addr_type: (*addr_type).to_string(),
        address: (*address).to_string(),
    })
}

fn parse_media(value: &str) -> Result<MediaDescription, SdpParseError> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() < 4 {
        return Err(SdpParseError::InvalidMedia(value.to_string()));
    }
    Ok(MediaDescription {
        media_type: parts[0].to_string(),
        port: parts[1].parse().unwrap_or(0),
        protocol: parts[2].to_string(),
        formats: parts[3..].iter().map(ToString::to_string).collect(),
        attributes: std::collections::HashMap::new(),
    })
}

fn parse_attribute(value: &str) -> (String, Option<String>) {
    match value.split_once(':') {
        Some((name, v)) => (name.to_string(), Some(v.to_string())),
        None => (value.to_string(), None),
    }
}
