//! `Transport:` header negotiation
//!
//! SETUP requests carry the sender's port pair, either as
//! `client_port=A-B` or as the RAOP `control_port=`/`timing_port=`
//! variants. The response announces our chosen ports as
//! `server_port=A-B` where A receives audio and B receives control.

/// Parsed `Transport:` header from a SETUP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeader {
    /// Lower transport; only UDP is accepted for audio
    pub lower: LowerTransport,
    /// Unicast vs multicast delivery
    pub cast: CastMode,
    /// Mode parameter, `record` for RAOP sessions
    pub mode: Option<String>,
    /// Sender's RTP audio port (first of `client_port=A-B`)
    pub client_rtp_port: Option<u16>,
    /// Sender's control port (second of the pair, or `control_port=`)
    pub client_control_port: Option<u16>,
    /// Sender's timing port (`timing_port=`)
    pub client_timing_port: Option<u16>,
}

/// Lower transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerTransport {
    /// RTP over UDP (the only supported audio path)
    Udp,
    /// RTP interleaved over the RTSP TCP connection
    Tcp,
}

/// Delivery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastMode {
    /// Point-to-point
    Unicast,
    /// Multicast group delivery
    Multicast,
}

/// Transport header parse failures
#[derive(Debug, thiserror::Error)]
pub enum TransportParseError {
    /// Header was empty
    #[error("missing protocol specification")]
    MissingProtocol,

    /// Protocol was not an RTP/AVP variant
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// A port parameter failed to parse
    #[error("invalid port in parameter {0}")]
    InvalidPort(String),
}

impl TransportHeader {
    /// Parse a `Transport:` value.
    ///
    /// # Errors
    ///
    /// Returns [`TransportParseError`] on an unrecognized protocol or an
    /// unparsable port; unknown parameters are ignored.
    pub fn parse(value: &str) -> Result<Self, TransportParseError> {
        let mut parts = value.split(';');
        let spec = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(TransportParseError::MissingProtocol)?;

        let lower = match spec.split('/').collect::<Vec<_>>().as_slice() {
            ["RTP", "AVP"] | ["RTP", "AVP", "UDP"] => LowerTransport::Udp,
            ["RTP", "AVP", "TCP"] => LowerTransport::Tcp,
            _ => return Err(TransportParseError::UnsupportedProtocol(spec.to_string())),
        };

        let mut header = TransportHeader {
            lower,
            cast: CastMode::Unicast,
            mode: None,
            client_rtp_port: None,
            client_control_port: None,
            client_timing_port: None,
        };

        for part in parts {
            let part = part.trim();
            if part == "unicast" {
                header.cast = CastMode::Unicast;
            } else if part == "multicast" {
                header.cast = CastMode::Multicast;
            } else if let Some(v) = part.strip_prefix("mode=") {
                header.mode = Some(v.to_string());
            } else if let Some(v) = part.strip_prefix("client_port=") {
                let (rtp, control) = parse_port_pair(v, part)?;
                header.client_rtp_port = Some(rtp);
                header.client_control_port = control.or(header.client_control_port);
            } else if let Some(v) = part.strip_prefix("control_port=") {
                header.client_control_port = Some(parse_port(v, part)?);
            } else if let Some(v) = part.strip_prefix("timing_port=") {
                header.client_timing_port = Some(parse_port(v, part)?);
            }
        }

        Ok(header)
    }

    /// Build the response header announcing our server ports.
    ///
    /// `audio_port` receives RTP audio, `control_port` receives
    /// timing-sync and retransmit traffic.
    #[must_use]
    pub fn to_response(&self, audio_port: u16, control_port: u16) -> String {
        let mut parts = vec![
            match self.lower {
                LowerTransport::Udp => "RTP/AVP/UDP".to_string(),
                LowerTransport::Tcp => "RTP/AVP/TCP".to_string(),
            },
            match self.cast {
                CastMode::Unicast => "unicast".to_string(),
                CastMode::Multicast => "multicast".to_string(),
            },
        ];
        if let Some(ref mode) = self.mode {
            parts.push(format!("mode={mode}"));
        }
        parts.push(format!("server_port={audio_port}-{control_port}"));
        parts.join(";")
    }
}

fn parse_port(v: &str, ctx: &str) -> Result<u16, TransportParseError> {
    v.parse()
        .map_err(|_| TransportParseError::InvalidPort(ctx.to_string()))
}

fn parse_port_pair(v: &str, ctx: &str) -> Result<(u16, Option<u16>), TransportParseError> {
    match v.split_once('-') {
        Some((a, b)) => Ok((parse_port(a, ctx)?, Some(parse_port(b, ctx)?))),
        None => Ok((parse_port(v, ctx)?, None)),
    }
}
