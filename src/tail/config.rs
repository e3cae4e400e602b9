// SPDX-License-Identifier: Apache-2.0

//! Configuration for the tailing engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// How committed offsets are flushed to the durable snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlushMode {
    /// Flush on every commit. Strongest durability, highest per-record latency.
    Sync,
    /// Flush on a short timer when commits arrived since the last flush.
    Async,
    /// Flush on a long timer. Default, balances durability window against IO.
    #[default]
    Timer,
}

impl FlushMode {
    /// Flush interval for the timer-driven modes; None for sync mode, which
    /// flushes inline on the commit path.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            FlushMode::Sync => None,
            FlushMode::Async => Some(Duration::from_millis(100)),
            FlushMode::Timer => Some(Duration::from_secs(5)),
        }
    }
}

/// Configuration for the tailing engine
#[derive(Debug, Clone)]
pub struct TailConfig {
    /// Directory whose log files are tailed
    pub watch_dir: PathBuf,
    /// Path of the durable offsets snapshot (must not live in `watch_dir`)
    pub offsets_path: PathBuf,
    /// Offset flush policy
    pub flush: FlushMode,
    /// Size of each worker's read buffer in bytes
    pub read_buffer_size: usize,
    /// Capacity of the active and ready hand-off queues
    pub queue_capacity: usize,
    /// Number of reader worker threads
    pub workers: usize,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            watch_dir: PathBuf::new(),
            offsets_path: PathBuf::from("/var/lib/logyard/offsets"),
            flush: FlushMode::default(),
            read_buffer_size: 16 * 1024,
            queue_capacity: 128,
            workers: 4,
        }
    }
}

impl TailConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.watch_dir.as_os_str().is_empty() {
            return Err("watch directory must be specified".to_string());
        }
        if self.offsets_path.as_os_str().is_empty() {
            return Err("offsets path must be specified".to_string());
        }
        if self.read_buffer_size == 0 {
            return Err("read buffer size must be greater than zero".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("queue capacity must be greater than zero".to_string());
        }
        if self.workers == 0 {
            return Err("worker count must be greater than zero".to_string());
        }

        // The offsets file must never be a tailing candidate: colocating it
        // with the watched directory would feed the snapshot back into the
        // pipeline as a log source.
        if same_dir(&self.watch_dir, self.offsets_path.parent()) {
            return Err(format!(
                "offsets path {:?} is inside the watched directory {:?}",
                self.offsets_path, self.watch_dir
            ));
        }

        Ok(())
    }
}

fn same_dir(watch_dir: &Path, offsets_dir: Option<&Path>) -> bool {
    let Some(offsets_dir) = offsets_dir else {
        return false;
    };

    // Canonicalize when both paths exist, otherwise compare as given.
    match (watch_dir.canonicalize(), offsets_dir.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => watch_dir == offsets_dir,
    }
}
