//! Sans-IO RTSP 1.0 server protocol for RAOP session termination

pub mod codec;
pub mod headers;
pub mod transport;

pub use codec::{ParseError, ResponseBuilder, RtspServerCodec, encode_response};
pub use headers::Headers;
pub use transport::TransportHeader;

use std::str::FromStr;

/// RTSP methods a RAOP sender may issue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Capability query; valid in any state
    Options,
    /// Stream description (SDP body)
    Announce,
    /// Transport negotiation
    Setup,
    /// Start audio intake
    Record,
    /// Pause intake, keep the session
    Pause,
    /// Discard queued audio
    Flush,
    /// End the session
    Teardown,
    /// Parameter query / keep-alive
    GetParameter,
    /// Parameter update (volume, metadata)
    SetParameter,
}

impl Method {
    /// Wire name of the method
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Options => "OPTIONS",
            Method::Announce => "ANNOUNCE",
            Method::Setup => "SETUP",
            Method::Record => "RECORD",
            Method::Pause => "PAUSE",
            Method::Flush => "FLUSH",
            Method::Teardown => "TEARDOWN",
            Method::GetParameter => "GET_PARAMETER",
            Method::SetParameter => "SET_PARAMETER",
        }
    }

    /// Every supported method, in the order advertised by `Public:`
    pub const ALL: [Method; 9] = [
        Method::Options,
        Method::Announce,
        Method::Setup,
        Method::Record,
        Method::Pause,
        Method::Flush,
        Method::Teardown,
        Method::GetParameter,
        Method::SetParameter,
    ];
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OPTIONS" => Ok(Method::Options),
            "ANNOUNCE" => Ok(Method::Announce),
            "SETUP" => Ok(Method::Setup),
            "RECORD" => Ok(Method::Record),
            "PAUSE" => Ok(Method::Pause),
            "FLUSH" => Ok(Method::Flush),
            "TEARDOWN" => Ok(Method::Teardown),
            "GET_PARAMETER" => Ok(Method::GetParameter),
            "SET_PARAMETER" => Ok(Method::SetParameter),
            _ => Err(()),
        }
    }
}

/// RTSP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(u16);

impl StatusCode {
    /// 200 OK
    pub const OK: StatusCode = StatusCode(200);
    /// 400 Bad Request
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    /// 401 Unauthorized (encrypted sender without key support)
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    /// 455 Method Not Valid in This State
    pub const METHOD_NOT_VALID: StatusCode = StatusCode(455);
    /// 500 Internal Server Error
    pub const INTERNAL_ERROR: StatusCode = StatusCode(500);
    /// 501 Not Implemented (unknown method)
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);

    /// Numeric value
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Canonical reason phrase
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self.0 {
            200 => "OK",
            400 => "Bad Request",
            401 => "Unauthorized",
            404 => "Not Found",
            455 => "Method Not Valid in This State",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            _ => "Unknown",
        }
    }

    /// Whether this is a success status
    #[must_use]
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.0)
    }
}

/// A parsed RTSP request
#[derive(Debug, Clone)]
pub struct RtspRequest {
    /// Request method
    pub method: Method,
    /// Request URI as received
    pub uri: String,
    /// Case-insensitive headers
    pub headers: Headers,
    /// Body, bounded by `Content-Length`
    pub body: Vec<u8>,
}

/// An RTSP response ready for encoding
#[derive(Debug, Clone)]
pub struct RtspResponse {
    /// Status code
    pub status: StatusCode,
    /// Case-insensitive headers
    pub headers: Headers,
    /// Body bytes
    pub body: Vec<u8>,
}
