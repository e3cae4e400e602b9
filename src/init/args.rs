// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use clap::{Args, ValueEnum};

use crate::tail::{FlushMode, TailConfig};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum FlushModeParam {
    /// Flush the offsets snapshot on every commit
    Sync,
    /// Flush on a short timer when offsets changed
    Async,
    /// Flush on a long timer
    #[default]
    Timer,
}

impl From<FlushModeParam> for FlushMode {
    fn from(value: FlushModeParam) -> Self {
        match value {
            FlushModeParam::Sync => FlushMode::Sync,
            FlushModeParam::Async => FlushMode::Async,
            FlushModeParam::Timer => FlushMode::Timer,
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct AgentRun {
    /// Directory of log files to tail
    #[arg(long, env = "LOGYARD_WATCH_DIR")]
    pub watch_dir: PathBuf,

    /// Path of the durable offsets snapshot (must not be inside the watched
    /// directory)
    #[arg(
        long,
        env = "LOGYARD_OFFSETS_PATH",
        default_value = "/var/lib/logyard/offsets"
    )]
    pub offsets_path: PathBuf,

    /// Offset flush policy
    #[arg(value_enum, long, env = "LOGYARD_FLUSH_MODE", default_value = "timer")]
    pub flush_mode: FlushModeParam,

    /// Read buffer size per worker, in bytes
    #[arg(long, env = "LOGYARD_READ_BUFFER_SIZE", default_value = "16384")]
    pub read_buffer_size: usize,

    /// Capacity of the scheduling queues
    #[arg(long, env = "LOGYARD_QUEUE_CAPACITY", default_value = "128")]
    pub queue_capacity: usize,

    /// Number of reader worker threads
    #[arg(long, env = "LOGYARD_WORKERS", default_value = "4")]
    pub workers: usize,
}

impl AgentRun {
    pub fn build_config(&self) -> TailConfig {
        TailConfig {
            watch_dir: self.watch_dir.clone(),
            offsets_path: self.offsets_path.clone(),
            flush: self.flush_mode.into(),
            read_buffer_size: self.read_buffer_size,
            queue_capacity: self.queue_capacity,
            workers: self.workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        run: AgentRun,
    }

    #[test]
    fn defaults_map_into_config() {
        let cli = TestCli::parse_from(["test", "--watch-dir", "/var/log/app"]);
        let config = cli.run.build_config();

        assert_eq!(config.watch_dir, PathBuf::from("/var/log/app"));
        assert_eq!(config.offsets_path, PathBuf::from("/var/lib/logyard/offsets"));
        assert_eq!(config.flush, FlushMode::Timer);
        assert_eq!(config.read_buffer_size, 16384);
        assert_eq!(config.workers, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn flush_mode_parses() {
        let cli = TestCli::parse_from([
            "test",
            "--watch-dir",
            "/var/log/app",
            "--flush-mode",
            "sync",
        ]);
        assert_eq!(cli.run.build_config().flush, FlushMode::Sync);
    }
}
