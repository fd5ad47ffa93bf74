//! Client side of the TUS wire protocol: create, query-offset, patch-chunk,
//! plus the capability probe.
//!
//! One remote upload resource moves through Unstarted → Created →
//! InProgress → Completed; any non-success response is surfaced as a
//! [`ProtocolError`] for the caller to classify as retryable or fatal.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use tracing::debug;

use crate::error::ProtocolError;

/// Protocol version attached to every request.
pub const TUS_VERSION: &str = "1.0.0";

const UPLOAD_OFFSET: &str = "Upload-Offset";
const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

pub struct TusClient {
    http: reqwest::Client,
    headers: HashMap<String, String>,
    timeout: Duration,
}

impl TusClient {
    /// Build a client with caller headers and a per-request deadline.
    pub fn new(headers: HashMap<String, String>, timeout: Duration) -> Result<Self, ProtocolError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ProtocolError::Connection(e.to_string()))?;
        Ok(Self {
            http,
            headers,
            timeout,
        })
    }

    /// Create a new upload resource. Returns the resource URL from the
    /// `Location` header, resolved against the endpoint. Any failure here is
    /// fatal to the upload; creation is never retried.
    pub async fn create_upload(
        &self,
        endpoint: &str,
        size: u64,
        name: &str,
    ) -> Result<String, ProtocolError> {
        let mut headers = self.request_headers();
        headers.insert(
            HeaderName::from_static("upload-length"),
            header_value(&size.to_string(), "Upload-Length")?,
        );
        headers.insert(
            HeaderName::from_static("upload-metadata"),
            header_value(&format!("name {}", BASE64.encode(name)), "Upload-Metadata")?,
        );

        let resp = self
            .http
            .post(endpoint)
            .headers(headers)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(ProtocolError::from_reqwest)?;

        let status = resp.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            return Err(ProtocolError::from_status(status));
        }
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ProtocolError::MissingHeader("Location"))?;

        let url = resolve_location(endpoint, location);
        debug!(url = %url, size, "upload resource created");
        Ok(url)
    }

    /// Ask the server how many bytes it has durably received. The returned
    /// value is authoritative and overrides anything stored locally. Any
    /// failure means the resource is no longer usable for resumption.
    pub async fn query_offset(&self, upload_url: &str) -> Result<u64, ProtocolError> {
        let resp = self
            .http
            .head(upload_url)
            .headers(self.request_headers())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(ProtocolError::from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProtocolError::from_status(status));
        }
        parse_offset(resp.headers())
    }

    /// Append one chunk at the given offset. Returns the server-confirmed
    /// offset after the write.
    pub async fn patch_chunk(
        &self,
        upload_url: &str,
        offset: u64,
        data: Bytes,
    ) -> Result<u64, ProtocolError> {
        let len = data.len() as u64;
        let mut headers = self.request_headers();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(OFFSET_CONTENT_TYPE));
        headers.insert(
            CONTENT_LENGTH,
            header_value(&len.to_string(), "Content-Length")?,
        );
        headers.insert(
            HeaderName::from_static("upload-offset"),
            header_value(&offset.to_string(), "Upload-Offset")?,
        );

        let resp = self
            .http
            .patch(upload_url)
            .headers(headers)
            .timeout(self.timeout)
            .body(data)
            .send()
            .await
            .map_err(ProtocolError::from_reqwest)?;

        let status = resp.status();
        if status != StatusCode::NO_CONTENT {
            return Err(ProtocolError::from_status(status));
        }
        // Prefer the confirmed offset from the response; fall back to
        // arithmetic when a server omits the header.
        match parse_offset(resp.headers()) {
            Ok(confirmed) => Ok(confirmed),
            Err(_) => Ok(offset + len),
        }
    }

    /// Probe the endpoint's advertised `Tus-*` capabilities.
    pub async fn server_capabilities(
        &self,
        endpoint: &str,
    ) -> Result<HashMap<String, String>, ProtocolError> {
        let resp = self
            .http
            .request(reqwest::Method::OPTIONS, endpoint)
            .headers(self.request_headers())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(ProtocolError::from_reqwest)?;

        let mut caps = HashMap::new();
        for (name, value) in resp.headers() {
            if name.as_str().starts_with("tus-") {
                if let Ok(v) = value.to_str() {
                    caps.insert(name.as_str().to_string(), v.to_string());
                }
            }
        }
        Ok(caps)
    }

    /// Caller headers first, protocol headers last — `insert` replaces, so
    /// caller-supplied values can never shadow protocol-mandated ones.
    fn request_headers(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (key, value) in &self.headers {
            let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                continue;
            };
            map.insert(name, value);
        }
        map.insert(
            HeaderName::from_static("tus-resumable"),
            HeaderValue::from_static(TUS_VERSION),
        );
        map
    }
}

/// Derive the per-request deadline from chunk and file size: a fixed base,
/// plus an allowance per MiB of chunk, plus extra for files beyond 1 GiB,
/// clamped so slow links don't abort early and failures don't hang forever.
pub fn request_timeout(chunk_size: u64, file_size: u64) -> Duration {
    const GIB: u64 = 1024 * 1024 * 1024;
    let mut secs = 30 + (chunk_size / (1024 * 1024)) * 5;
    if file_size > GIB {
        secs += ((file_size - GIB) / GIB) * 10;
    }
    Duration::from_secs(secs.clamp(60, 1800))
}

fn resolve_location(endpoint: &str, location: &str) -> String {
    match url::Url::parse(endpoint).and_then(|base| base.join(location)) {
        Ok(url) => url.to_string(),
        Err(_) => location.to_string(),
    }
}

fn parse_offset(headers: &HeaderMap) -> Result<u64, ProtocolError> {
    let raw = headers
        .get(UPLOAD_OFFSET)
        .ok_or(ProtocolError::MissingHeader("Upload-Offset"))?;
    let text = raw.to_str().map_err(|_| ProtocolError::InvalidHeader {
        header: "Upload-Offset",
        value: String::from_utf8_lossy(raw.as_bytes()).into_owned(),
    })?;
    text.parse().map_err(|_| ProtocolError::InvalidHeader {
        header: "Upload-Offset",
        value: text.to_string(),
    })
}

fn header_value(text: &str, header: &'static str) -> Result<HeaderValue, ProtocolError> {
    HeaderValue::from_str(text).map_err(|_| ProtocolError::InvalidHeader {
        header,
        value: text.to_string(),
    })
}
