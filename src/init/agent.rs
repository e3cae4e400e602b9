// SPDX-License-Identifier: Apache-2.0

//! Agent wiring: config, registry, watcher, and the default stdout sink.

use std::io::Write;
use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tracing::{error, info};

use crate::init::args::AgentRun;
use crate::tail::{Committer, Consumer, DirWatcher, JobRegistry, Record, Result, SourceId};

/// Consumer that writes each record to stdout as one JSON line and commits
/// it immediately. The minimal durable sink: once the line is out, the
/// offset is acknowledged.
pub struct StdoutConsumer {
    committer: OnceLock<Committer>,
}

#[derive(Serialize)]
struct EmittedRecord<'a> {
    source: SourceId,
    stream: &'a str,
    offset: u64,
    line: &'a str,
}

impl StdoutConsumer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            committer: OnceLock::new(),
        })
    }

    /// Late-bound commit handle; the registry is constructed after the
    /// consumer it delivers to.
    pub fn bind(&self, committer: Committer) {
        let _ = self.committer.set(committer);
    }
}

impl Consumer for StdoutConsumer {
    fn deliver(&self, record: Record) {
        let line = String::from_utf8_lossy(&record.bytes);
        let emitted = EmittedRecord {
            source: record.source_id,
            stream: &record.stream,
            offset: record.offset,
            line: &line,
        };

        let mut stdout = std::io::stdout().lock();
        match serde_json::to_string(&emitted) {
            Ok(json) => {
                if writeln!(stdout, "{}", json).is_err() {
                    // stdout gone (pipe closed); drop the record without
                    // committing so it is re-delivered on restart.
                    return;
                }
            }
            Err(e) => {
                error!(error = %e, "failed to serialize record");
                return;
            }
        }

        if let Some(committer) = self.committer.get() {
            committer.commit(record.source_id, &record.stream, record.offset);
        }
    }
}

/// The running agent: one tail engine plus its watcher, driving records into
/// the stdout sink until a shutdown signal arrives.
pub struct Agent {
    args: AgentRun,
}

impl Agent {
    pub fn new(args: AgentRun) -> Self {
        Self { args }
    }

    pub async fn run(self) -> Result<()> {
        let config = self.args.build_config();

        let consumer = StdoutConsumer::new();
        let registry = JobRegistry::new(config.clone(), consumer.clone())?;
        consumer.bind(registry.committer());

        registry.start()?;

        let watcher = DirWatcher::spawn(&config.watch_dir, &registry)?;
        registry.attach_watcher(watcher);

        wait_for_signal().await;
        info!("shutdown signal received");

        // stop() joins the worker threads; keep that off the async runtime.
        let stopping = Arc::clone(&registry);
        tokio::task::spawn_blocking(move || stopping.stop())
            .await
            .map_err(|e| crate::tail::Error::Config(format!("shutdown task failed: {}", e)))?;

        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
