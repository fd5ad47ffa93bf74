//! Advisory detection of concurrent uploads of the same file.
//!
//! A record slot owned by another live process that was saved recently is
//! counted as an active upload. This check is best-effort only: a race
//! between the check and any later state write is inherent, so the result
//! is a warning signal, never a mutual-exclusion primitive.

use std::path::Path;

use tracing::debug;

use crate::state::StateStore;

/// Records saved within this window count as active.
pub const ACTIVITY_WINDOW_SECS: i64 = 300;

/// Capability interface for process liveness. Platform-specific probing
/// stays behind this trait so tests and signal-less environments can
/// substitute a fixed answer.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the OS process table.
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        use sysinfo::{Pid, ProcessesToUpdate, System};
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).is_some()
    }
}

/// Fixed-answer probe for tests and platforms without process inspection.
pub struct StaticProbe(pub bool);

impl ProcessProbe for StaticProbe {
    fn is_alive(&self, _pid: u32) -> bool {
        self.0
    }
}

/// Result of one advisory check.
#[derive(Debug)]
pub struct ActiveUploads {
    pub count: usize,
    pub warning: Option<String>,
}

pub struct ConcurrencyGuard<'a> {
    store: &'a StateStore,
    probe: &'a dyn ProcessProbe,
}

impl<'a> ConcurrencyGuard<'a> {
    pub fn new(store: &'a StateStore, probe: &'a dyn ProcessProbe) -> Self {
        Self { store, probe }
    }

    /// Count other live uploads of this file. Records owned by dead
    /// processes are purged as a side effect; our own slot is skipped.
    pub fn check_active(&self, file_path: &Path) -> ActiveUploads {
        let now = chrono::Utc::now().timestamp();
        let mut count = 0;

        for entry in self.store.records_for(file_path) {
            if entry.pid == self.store.pid() {
                continue;
            }
            if !self.probe.is_alive(entry.pid) {
                debug!(pid = entry.pid, "purging state record of dead process");
                self.store.remove_record(&entry);
                continue;
            }
            if now - entry.saved_at() <= ACTIVITY_WINDOW_SECS {
                count += 1;
            }
        }

        let warning =
            (count > 0).then(|| format!("{count} other active upload(s) detected for this file"));
        ActiveUploads { count, warning }
    }
}
