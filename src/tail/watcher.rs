// SPDX-License-Identifier: Apache-2.0

//! Directory watcher bridged onto the job registry.
//!
//! Uses OS-level file system notifications via the `notify` crate (inotify,
//! FSEvents, ReadDirectoryChangesW). The engine itself only consumes the
//! three notification entry points on [`JobRegistry`]; this module is the
//! shipped implementation that drives them. Create, rename, and append all
//! resolve the same way in the registry - re-derive the identity and resume
//! the job - so the mapping below is deliberately coarse.

use std::path::Path;
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Weak};
use std::thread;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use super::error::{Error, Result};
use super::registry::JobRegistry;

/// What a file system event means to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Notify {
    Created,
    Renamed,
    Appended,
    Ignore,
}

pub(crate) fn classify(kind: &EventKind) -> Notify {
    match kind {
        EventKind::Create(_) => Notify::Created,
        EventKind::Modify(ModifyKind::Name(_)) => Notify::Renamed,
        EventKind::Modify(_) => Notify::Appended,
        // Jobs are never destroyed while the process runs; deletions and
        // access events carry no work.
        EventKind::Remove(_) | EventKind::Access(_) => Notify::Ignore,
        EventKind::Any | EventKind::Other => Notify::Ignore,
    }
}

/// Native directory watcher plus the bridge thread that forwards its events
/// into the registry.
pub struct DirWatcher {
    // Kept alive for the lifetime of the bridge; dropping it closes the
    // event channel and lets the bridge thread exit.
    watcher: Option<RecommendedWatcher>,
    bridge: Option<thread::JoinHandle<()>>,
}

impl DirWatcher {
    /// Watch `dir` (non-recursively) and forward events to `registry`.
    pub fn spawn(dir: &Path, registry: &Arc<JobRegistry>) -> Result<Self> {
        let (tx, rx) = channel::<std::result::Result<Event, notify::Error>>();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| Error::Watcher(e.to_string()))?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Watcher(e.to_string()))?;

        let weak = Arc::downgrade(registry);
        let bridge = thread::Builder::new()
            .name("logyard-watch".to_string())
            .spawn(move || bridge_loop(rx, weak))?;

        debug!(dir = %dir.display(), "directory watcher started");
        Ok(Self {
            watcher: Some(watcher),
            bridge: Some(bridge),
        })
    }

    /// Tear down the watcher and wait for the bridge thread to drain.
    pub fn stop(mut self) {
        // Dropping the watcher closes the event channel; recv() in the
        // bridge then errors out and the thread exits.
        self.watcher.take();
        if let Some(bridge) = self.bridge.take() {
            let _ = bridge.join();
        }
    }
}

impl Drop for DirWatcher {
    fn drop(&mut self) {
        self.watcher.take();
        if let Some(bridge) = self.bridge.take() {
            let _ = bridge.join();
        }
    }
}

fn bridge_loop(
    rx: Receiver<std::result::Result<Event, notify::Error>>,
    registry: Weak<JobRegistry>,
) {
    while let Ok(res) = rx.recv() {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "watcher event error");
                continue;
            }
        };

        let Some(registry) = registry.upgrade() else {
            break;
        };
        if registry.is_shutdown() {
            break;
        }

        let note = classify(&event.kind);
        for path in &event.paths {
            match note {
                Notify::Created => registry.on_file_created(path),
                Notify::Renamed => registry.on_file_renamed(path),
                Notify::Appended => registry.on_file_appended(path),
                Notify::Ignore => {}
            }
        }
    }
    debug!("watcher bridge stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RenameMode};

    #[test]
    fn event_classification() {
        assert_eq!(
            classify(&EventKind::Create(CreateKind::File)),
            Notify::Created
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::To))),
            Notify::Renamed
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Notify::Appended
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))),
            Notify::Appended
        );
        assert_eq!(
            classify(&EventKind::Remove(notify::event::RemoveKind::File)),
            Notify::Ignore
        );
        assert_eq!(classify(&EventKind::Any), Notify::Ignore);
    }
}
