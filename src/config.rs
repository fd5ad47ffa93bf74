use std::collections::HashMap;

use tracing::warn;
use url::Url;

use crate::error::UploadError;

pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;
pub const MAX_CHUNK_SIZE: u64 = 32 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;
pub const DEFAULT_RETRIES: u32 = 5;
pub const MAX_RETRIES: u32 = 10;

/// Parameters for one upload.
///
/// Callers normally build this once, run it through [`clamped`], and hand it
/// to the engine. Header values are merged into every request but can never
/// override protocol-mandated headers.
///
/// [`clamped`]: UploadConfig::clamped
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// TUS creation endpoint, e.g. `https://host/files`.
    pub endpoint: String,
    /// Bytes sent per PATCH request.
    pub chunk_size: u64,
    /// Extra headers (auth tokens and the like) attached to every request.
    pub headers: HashMap<String, String>,
    /// Retry ceiling per chunk before the upload aborts as resumable.
    pub max_retries: u32,
    /// Discard any stored state and upload from the beginning.
    pub reset: bool,
}

impl UploadConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            headers: HashMap::new(),
            max_retries: DEFAULT_RETRIES,
            reset: false,
        }
    }

    /// Build a config from `TUSK_*` environment variables.
    ///
    /// Reads `TUSK_ENDPOINT`, `TUSK_CHUNK_SIZE` (MiB), `TUSK_RETRIES` and
    /// `TUSK_HEADERS` (`key1:value1,key2:value2`), honoring a `.env` file if
    /// present. The result is already clamped.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let endpoint = std::env::var("TUSK_ENDPOINT").unwrap_or_default();
        let mut config = Self::new(endpoint);

        if let Some(mib) = std::env::var("TUSK_CHUNK_SIZE")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.chunk_size = mib * 1024 * 1024;
        }
        if let Some(retries) = std::env::var("TUSK_RETRIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
        {
            config.max_retries = retries;
        }
        if let Ok(raw) = std::env::var("TUSK_HEADERS") {
            config.headers.extend(parse_header_list(&raw));
        }

        config.clamped()
    }

    /// Clamp chunk size and retry ceiling into their supported ranges,
    /// warning when a value had to be adjusted.
    pub fn clamped(mut self) -> Self {
        if self.chunk_size < MIN_CHUNK_SIZE {
            warn!(
                requested = self.chunk_size,
                min = MIN_CHUNK_SIZE,
                "chunk size too small, using minimum"
            );
            self.chunk_size = MIN_CHUNK_SIZE;
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            warn!(
                requested = self.chunk_size,
                max = MAX_CHUNK_SIZE,
                "chunk size too large, using maximum"
            );
            self.chunk_size = MAX_CHUNK_SIZE;
        }
        if self.max_retries > MAX_RETRIES {
            warn!(
                requested = self.max_retries,
                max = MAX_RETRIES,
                "retry ceiling too high, using maximum"
            );
            self.max_retries = MAX_RETRIES;
        }
        self
    }

    /// Check the parts that must be right before any network activity.
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.endpoint.is_empty() {
            return Err(UploadError::Config("endpoint is required".into()));
        }
        let url = Url::parse(&self.endpoint)
            .map_err(|e| UploadError::Config(format!("invalid endpoint URL: {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(UploadError::Config(format!(
                "endpoint must be http(s), got {}",
                url.scheme()
            )));
        }
        if self.chunk_size == 0 {
            return Err(UploadError::Config("chunk size must be nonzero".into()));
        }
        Ok(())
    }
}

/// Parse a `key1:value1,key2:value2` header list. Malformed entries are
/// skipped.
pub(crate) fn parse_header_list(raw: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for part in raw.split(',') {
        if let Some((key, value)) = part.split_once(':') {
            let key = key.trim();
            let value = value.trim();
            if !key.is_empty() {
                headers.insert(key.to_string(), value.to_string());
            }
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_out_of_range_values() {
        let mut config = UploadConfig::new("http://localhost/files");
        config.chunk_size = 1024;
        config.max_retries = 99;
        let config = config.clamped();
        assert_eq!(config.chunk_size, MIN_CHUNK_SIZE);
        assert_eq!(config.max_retries, MAX_RETRIES);

        let mut config = UploadConfig::new("http://localhost/files");
        config.chunk_size = 1024 * 1024 * 1024;
        let config = config.clamped();
        assert_eq!(config.chunk_size, MAX_CHUNK_SIZE);
    }

    #[test]
    fn validate_rejects_bad_endpoints() {
        assert!(UploadConfig::new("").validate().is_err());
        assert!(UploadConfig::new("not a url").validate().is_err());
        assert!(UploadConfig::new("ftp://host/files").validate().is_err());
        assert!(UploadConfig::new("https://host/files").validate().is_ok());
    }

    #[test]
    fn header_list_parsing() {
        let headers = parse_header_list("Authorization: Bearer abc, X-Custom:1, broken");
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer abc");
        assert_eq!(headers.get("X-Custom").unwrap(), "1");
        assert_eq!(headers.len(), 2);
    }
}
