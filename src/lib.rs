//! Client-side engine for resumable TUS uploads.
//!
//! Uploads survive interruption, restart, and process crashes: a
//! size-tiered file fingerprint keys a persisted state record, the server's
//! reported offset is the authoritative resume point, and the chunk loop
//! checkpoints as it goes.
//!
//! ```no_run
//! use std::path::Path;
//! use tusk::{StateStore, UploadConfig, Uploader};
//!
//! # async fn run() -> Result<(), tusk::UploadError> {
//! let config = UploadConfig::new("https://tusd.example.com/files").clamped();
//! let uploader = Uploader::new(config, StateStore::in_current_dir());
//! let outcome = uploader.upload(Path::new("backup.tar")).await?;
//! println!("uploaded to {}", outcome.remote_url);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod guard;
pub mod progress;
pub mod protocol;
pub mod state;
pub mod transfer;

pub use config::UploadConfig;
pub use error::{ProtocolError, UploadError};
pub use fingerprint::{fingerprint, Fingerprint, FingerprintPolicy, Strategy};
pub use guard::{ActiveUploads, ConcurrencyGuard, ProcessProbe, StaticProbe, SystemProbe};
pub use progress::{NullSink, ProgressSink, TracingSink};
pub use protocol::TusClient;
pub use state::{StateStore, UploadState};
pub use transfer::{UploadOutcome, Uploader};
