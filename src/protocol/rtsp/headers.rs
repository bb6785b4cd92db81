//! Case-insensitive RTSP header collection

use std::collections::HashMap;

/// Well-known header names
pub mod names {
    /// Request sequence number, echoed on every response
    pub const CSEQ: &str = "CSeq";
    /// Body media type
    pub const CONTENT_TYPE: &str = "Content-Type";
    /// Body length in bytes
    pub const CONTENT_LENGTH: &str = "Content-Length";
    /// RTSP session token
    pub const SESSION: &str = "Session";
    /// Transport negotiation
    pub const TRANSPORT: &str = "Transport";
    /// Initial sequence / rtptime on RECORD and FLUSH
    pub const RTP_INFO: &str = "RTP-Info";
    /// Supported verbs on OPTIONS
    pub const PUBLIC: &str = "Public";
    /// Receiver-side latency in samples
    pub const AUDIO_LATENCY: &str = "Audio-Latency";
    /// Server software identifier
    pub const SERVER: &str = "Server";
}

/// Header map with case-insensitive lookup and last-write-wins insert
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: HashMap<String, String>,
}

impl Headers {
    /// Create an empty collection
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing any case-insensitive match.
    /// The casing of the new name is preserved.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.inner.retain(|k, _| !k.eq_ignore_ascii_case(&name));
        self.inner.insert(name, value.into());
    }

    /// Look up a header case-insensitively
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Parsed `CSeq` value
    #[must_use]
    pub fn cseq(&self) -> Option<u32> {
        self.get(names::CSEQ)?.trim().parse().ok()
    }

    /// Parsed `Content-Length` value
    #[must_use]
    pub fn content_length(&self) -> Option<usize> {
        self.get(names::CONTENT_LENGTH)?.trim().parse().ok()
    }

    /// `Content-Type` value
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.get(names::CONTENT_TYPE)
    }

    /// Iterate over all headers
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the collection is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}
