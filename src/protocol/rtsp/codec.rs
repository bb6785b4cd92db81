//! Server-side RTSP codec
//!
//! Sans-IO: `feed()` accepts bytes from the transport, `decode()` yields
//! complete requests, `encode_response()` produces wire bytes. The
//! connection driver in `session::server` owns the socket.

use super::{Headers, Method, RtspRequest, RtspResponse, StatusCode, headers::names};
use bytes::BytesMut;
use std::str::{self, FromStr};

/// Largest body we accept; ANNOUNCE SDP payloads are well under this
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Largest header section we accept
const MAX_HEADER_SIZE: usize = 16 * 1024;

/// RTSP request parse failures
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The request line was not `METHOD uri RTSP/x.y`
    #[error("invalid request line: {0}")]
    InvalidRequestLine(String),

    /// The method token is not an RTSP verb at all
    #[error("invalid method: {0}")]
    InvalidMethod(String),

    /// A recognized verb this server does not implement
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    /// A header line without a colon
    #[error("invalid header line: {0}")]
    InvalidHeader(String),

    /// Content-Length was not a number
    #[error("invalid Content-Length: {0}")]
    InvalidContentLength(String),

    /// Headers or body exceeded their caps
    #[error("message too large ({what}: {size} > {max})")]
    TooLarge {
        /// Which section overflowed
        what: &'static str,
        /// Observed size
        size: usize,
        /// Allowed maximum
        max: usize,
    },

    /// Header bytes were not UTF-8
    #[error("invalid utf-8 in headers")]
    InvalidUtf8,
}

/// Incremental parser for RTSP requests read off a TCP stream
pub struct RtspServerCodec {
    buffer: BytesMut,
}

impl RtspServerCodec {
    /// Create a codec with an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Append bytes read from the transport
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes currently buffered
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Try to decode one complete request.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] on a malformed request; the caller should
    /// answer 400 (or 501 for [`ParseError::UnsupportedMethod`]) and
    /// close the connection.
    pub fn decode(&mut self) -> Result<Option<RtspRequest>, ParseError> {
        let Some(header_end) = find_header_end(&self.buffer) else {
            if self.buffer.len() > MAX_HEADER_SIZE {
                return Err(ParseError::TooLarge {
                    what: "headers",
                    size: self.buffer.len(),
                    max: MAX_HEADER_SIZE,
                });
            }
            return Ok(None);
        };

        let header_str =
            str::from_utf8(&self.buffer[..header_end]).map_err(|_| ParseError::InvalidUtf8)?;
        let (method, uri, headers) = parse_head(header_str)?;

        let content_length = match headers.get(names::CONTENT_LENGTH) {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidContentLength(raw.to_string()))?,
            None => 0,
        };
        if content_length > MAX_BODY_SIZE {
            return Err(ParseError::TooLarge {
                what: "body",
                size: content_length,
                max: MAX_BODY_SIZE,
            });
        }

        let total = header_end + 4 + content_length;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let _ = self.buffer.split_to(header_end + 4);
        let body = if content_length > 0 {
            self.buffer.split_to(content_length).to_vec()
        } else {
            Vec::new()
        };

        Ok(Some(RtspRequest {
            method,
            uri,
            headers,
            body,
        }))
    }
}

impl Default for RtspServerCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(head: &str) -> Result<(Method, String, Headers), ParseError> {
    let mut lines = head.lines();
    let request_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ParseError::InvalidRequestLine("empty request".into()))?;

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    let [method_str, uri, version] = parts.as_slice() else {
        return Err(ParseError::InvalidRequestLine(request_line.to_string()));
    };
    if !version.starts_with("RTSP/") {
        return Err(ParseError::InvalidRequestLine(request_line.to_string()));
    }
    if !method_str
        .chars()
        .all(|c| c.is_ascii_uppercase() || c == '_')
    {
        return Err(ParseError::InvalidMethod((*method_str).to_string()));
    }
    let method = Method::from_str(method_str)
        .map_err(|()| ParseError::UnsupportedMethod((*method_str).to_string()))?;

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some(pos) = line.find(':') else {
            return Err(ParseError::InvalidHeader(line.to_string()));
        };
        headers.insert(line[..pos].trim(), line[pos + 1..].trim());
    }

    Ok((method, (*uri).to_string(), headers))
}

/// Fluent builder for RTSP responses
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    status: StatusCode,
    headers: Headers,
    body: Option<Vec<u8>>,
}

impl ResponseBuilder {
    /// Start a response with the given status
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        let mut headers = Headers::new();
        headers.insert(names::SERVER, "AirPlay-Multiroom/1.0");
        Self {
            status,
            headers,
            body: None,
        }
    }

    /// 200 OK
    #[must_use]
    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    /// Error response with the given status
    #[must_use]
    pub fn error(status: StatusCode) -> Self {
        Self::new(status)
    }

    /// Echo the request's `CSeq`
    #[must_use]
    pub fn cseq(mut self, cseq: u32) -> Self {
        self.headers.insert(names::CSEQ, cseq.to_string());
        self
    }

    /// Set the session token
    #[must_use]
    pub fn session(mut self, token: &str) -> Self {
        self.headers.insert(names::SESSION, token);
        self
    }

    /// Add an arbitrary header
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attach a `text/parameters` body
    #[must_use]
    pub fn text_body(mut self, body: &str) -> Self {
        self.body = Some(body.as_bytes().to_vec());
        self.headers.insert(names::CONTENT_TYPE, "text/parameters");
        self
    }

    /// Report our receive latency in samples (RECORD response)
    #[must_use]
    pub fn audio_latency(mut self, samples: u32) -> Self {
        self.headers
            .insert(names::AUDIO_LATENCY, samples.to_string());
        self
    }

    /// Finalize into an [`RtspResponse`]
    #[must_use]
    pub fn build(mut self) -> RtspResponse {
        if let Some(ref body) = self.body {
            self.headers
                .insert(names::CONTENT_LENGTH, body.len().to_string());
        }
        RtspResponse {
            status: self.status,
            headers: self.headers,
            body: self.body.unwrap_or_default(),
        }
    }
}

/// Encode a response into wire bytes
#[must_use]
pub fn encode_response(response: &RtspResponse) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + response.body.len());
    out.extend_from_slice(
        format!(
            "RTSP/1.0 {} {}\r\n",
            response.status.as_u16(),
            response.status.reason()
        )
        .as_bytes(),
    );
    for (name, value) in response.headers.iter() {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&response.body);
    out
}
