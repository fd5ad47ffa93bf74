//! Progress reporting. Implementations can log through `tracing`, feed a
//! UI, or discard reports.

/// Observational sink for transfer progress. The engine calls this at most
/// once per second during the chunk loop, plus once on completion.
pub trait ProgressSink: Send + Sync {
    /// `rate_bps` is the instantaneous rate since the previous report, in
    /// bytes per second.
    fn on_progress(&self, bytes_done: u64, bytes_total: u64, rate_bps: u64);
}

/// Sink that reports through the `tracing` crate.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn on_progress(&self, bytes_done: u64, bytes_total: u64, rate_bps: u64) {
        let pct = if bytes_total == 0 {
            100.0
        } else {
            bytes_done as f64 / bytes_total as f64 * 100.0
        };
        tracing::info!(bytes_done, bytes_total, rate_bps, "uploading {:.1}%", pct);
    }
}

/// Sink that discards all reports.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_progress(&self, _bytes_done: u64, _bytes_total: u64, _rate_bps: u64) {}
}
