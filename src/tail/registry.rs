// SPDX-License-Identifier: Apache-2.0

//! Job registry and scheduler.
//!
//! Owns the set of tracked files keyed by stable identity, the in-memory
//! offset table, and the scheduling machinery: an active queue fed by
//! discovery/resume/release, a dispatcher thread promoting jobs to the ready
//! queue, and the worker pool draining it. Offsets committed by the consumer
//! flow back in through [`JobRegistry::commit`] and out to disk through the
//! snapshot store, either inline (sync mode) or on the flush timer.
//!
//! The offset table is the sole source of truth for resumption, so every
//! inconsistency that would silently corrupt it - a non-monotonic commit, a
//! commit for an unknown source, a double-run of a job, a malformed snapshot
//! on load - is treated as unrecoverable and takes the process down.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::config::{FlushMode, TailConfig};
use super::error::{Error, Result};
use super::job::Job;
use super::record::{Committer, Consumer};
use super::snapshot::{OffsetTable, SnapshotStore};
use super::source_id::SourceId;
use super::watcher::DirWatcher;
use super::worker::worker_loop;
use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender, SendTimeoutError};

/// Item carried by the active and ready queues. `stop()` pushes one
/// `Shutdown` sentinel per blocked consumer so nobody hangs on an empty
/// queue forever.
pub(crate) enum Dispatch {
    Job(Arc<Job>),
    Shutdown,
}

/// How long a blocking enqueue waits before re-checking the shutdown flag.
const ENQUEUE_POLL: Duration = Duration::from_millis(50);

pub struct JobRegistry {
    config: TailConfig,
    store: SnapshotStore,
    /// Offset table + identity index. Held only for lookups and updates,
    /// never across IO.
    table: Mutex<OffsetTable>,
    /// All jobs ever instantiated, by identity. Jobs are only destroyed when
    /// the process exits.
    jobs: Mutex<HashMap<SourceId, Arc<Job>>>,
    consumer: Arc<dyn Consumer>,

    active_tx: BoundedSender<Dispatch>,
    active_rx: BoundedReceiver<Dispatch>,
    ready_tx: BoundedSender<Dispatch>,
    ready_rx: BoundedReceiver<Dispatch>,

    started: AtomicBool,
    shutdown: AtomicBool,
    /// Commits since the last snapshot flush; the flush timer skips ticks
    /// where nothing changed.
    dirty_commits: AtomicU64,

    /// Jobs that are queued or running, i.e. not yet drained to EOF.
    outstanding: Mutex<usize>,
    drained: Condvar,

    flush_stop: Mutex<bool>,
    flush_cv: Condvar,

    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    watcher: Mutex<Option<DirWatcher>>,
}

impl JobRegistry {
    pub fn new(config: TailConfig, consumer: Arc<dyn Consumer>) -> Result<Arc<Self>> {
        config.validate().map_err(Error::Config)?;

        let store = SnapshotStore::open(&config.offsets_path)?;
        let (active_tx, active_rx) = bounded(config.queue_capacity);
        let (ready_tx, ready_rx) = bounded(config.queue_capacity);

        Ok(Arc::new(Self {
            config,
            store,
            table: Mutex::new(OffsetTable::default()),
            jobs: Mutex::new(HashMap::new()),
            consumer,
            active_tx,
            active_rx,
            ready_tx,
            ready_rx,
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            dirty_commits: AtomicU64::new(0),
            outstanding: Mutex::new(0),
            drained: Condvar::new(),
            flush_stop: Mutex::new(false),
            flush_cv: Condvar::new(),
            threads: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
        }))
    }

    /// Commit handle for the downstream consumer.
    pub fn committer(self: &Arc<Self>) -> Committer {
        Committer::new(Arc::downgrade(self))
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Number of tracked files. Reporting only.
    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    /// Load the durable snapshot, start the dispatcher, worker, and flush
    /// threads, then scan the watched directory so every existing file
    /// resumes from its committed offset.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Config("engine already started".to_string()));
        }

        self.load_snapshot()?;

        {
            let mut threads = self.threads.lock().unwrap();

            let registry = Arc::clone(self);
            threads.push(
                thread::Builder::new()
                    .name("logyard-dispatch".to_string())
                    .spawn(move || registry.dispatch_loop())?,
            );

            for i in 0..self.config.workers {
                let ready = self.ready_rx.clone();
                let registry = Arc::clone(self);
                let consumer = Arc::clone(&self.consumer);
                let buf_size = self.config.read_buffer_size;
                threads.push(
                    thread::Builder::new()
                        .name(format!("logyard-worker-{}", i))
                        .spawn(move || worker_loop(i, ready, registry, consumer, buf_size))?,
                );
            }

            if let Some(interval) = self.config.flush.interval() {
                let registry = Arc::clone(self);
                threads.push(
                    thread::Builder::new()
                        .name("logyard-flush".to_string())
                        .spawn(move || registry.flush_loop(interval))?,
                );
            }
        }

        for entry in fs::read_dir(&self.config.watch_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                self.add_job(&entry.path(), true)?;
            }
        }

        info!(
            watch_dir = %self.config.watch_dir.display(),
            workers = self.config.workers,
            jobs = self.job_count(),
            "tail engine started"
        );
        Ok(())
    }

    /// Hand ownership of the directory watcher to the registry so `stop()`
    /// can tear it down in order.
    pub fn attach_watcher(&self, watcher: DirWatcher) {
        *self.watcher.lock().unwrap() = Some(watcher);
    }

    /// Stop the engine: flag, one wake-up per blocked dequeue, join, stop
    /// the watcher, then one final synchronous flush so no committed offset
    /// is lost on a clean shutdown.
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping tail engine");

        // A full queue means its consumers are not blocked on empty; they
        // will observe the flag right after their next pop, so a failed
        // try_send needs no retry.
        let _ = self.active_tx.try_send(Dispatch::Shutdown);
        for _ in 0..self.config.workers {
            let _ = self.ready_tx.try_send(Dispatch::Shutdown);
        }

        {
            let mut stopped = self.flush_stop.lock().unwrap();
            *stopped = true;
        }
        self.flush_cv.notify_all();

        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in threads {
            if handle.join().is_err() {
                warn!("engine thread panicked before shutdown");
            }
        }

        if let Some(watcher) = self.watcher.lock().unwrap().take() {
            watcher.stop();
        }

        if self.started.load(Ordering::SeqCst) {
            if let Err(e) = self.flush_now() {
                panic!("fatal IO error writing final offsets snapshot: {}", e);
            }
        }
        info!("tail engine stopped");
    }

    /// Block until every tracked file has been drained to end of file.
    /// Batch-mode and test support.
    pub fn wait_until_drained(&self) {
        let mut outstanding = self.outstanding.lock().unwrap();
        while *outstanding > 0 {
            outstanding = self.drained.wait(outstanding).unwrap();
        }
    }

    // Watcher notification entry points. Create, rename, and append all
    // resolve the same way: re-derive the identity and resume the existing
    // job, or instantiate a new one.

    pub fn on_file_created(&self, path: &Path) {
        self.notify_path(path);
    }

    pub fn on_file_renamed(&self, path: &Path) {
        self.notify_path(path);
    }

    pub fn on_file_appended(&self, path: &Path) {
        self.notify_path(path);
    }

    fn notify_path(&self, path: &Path) {
        if let Err(e) = self.add_job(path, false) {
            warn!(path = %path.display(), error = %e, "failed to track notified file");
        }
    }

    /// Track a file. Called for every file found by the startup scan (with
    /// `load_offsets`) and for every watcher notification (without).
    ///
    /// Returns `Ok(None)` when the file vanished before it could be opened -
    /// a benign race with deletion, not an error.
    pub fn add_job(&self, path: &Path, load_offsets: bool) -> Result<Option<Arc<Job>>> {
        if self.is_snapshot_path(path) {
            panic!(
                "refusing to tail the offsets snapshot {} as a log source; \
                 this would feed the snapshot back into the pipeline",
                path.display()
            );
        }

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "file vanished before open, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            debug!(path = %path.display(), "not a regular file, skipping");
            return Ok(None);
        }
        let source_id = SourceId::from_metadata(&metadata);

        let mut jobs = self.jobs.lock().unwrap();

        if let Some(job) = jobs.get(&source_id) {
            // Same physical file rediscovered, most likely renamed or a
            // duplicate notification. One inode, one job.
            job.set_path(path);
            self.table.lock().unwrap().update_path(source_id, path);
            debug!(
                source_id = %source_id,
                path = %path.display(),
                "resuming existing job under new path"
            );
            let job = Arc::clone(job);
            drop(jobs);
            self.resume_job(&job);
            return Ok(Some(job));
        }

        let mut file = file;
        {
            let mut table = self.table.lock().unwrap();
            if load_offsets && table.contains_source(source_id) {
                // Streams share one physical cursor: seek to the minimum
                // committed offset so every stream sees its uncommitted
                // bytes again. At-least-once, never past.
                let resume = table.min_offset(source_id).unwrap_or(0);
                file.seek(SeekFrom::Start(resume))?;
                table.update_path(source_id, path);
                debug!(source_id = %source_id, resume, "resuming from committed offset");
            } else {
                table.register_source(source_id, path);
            }
        }

        let job = Arc::new(Job::new(source_id, path, file));
        jobs.insert(source_id, Arc::clone(&job));
        drop(jobs);

        info!(source_id = %source_id, path = %path.display(), "tracking file");
        self.resume_job(&job);
        Ok(Some(job))
    }

    /// Idle -> schedulable. No-op when the job is already queued or running.
    pub fn resume_job(&self, job: &Arc<Job>) {
        if !job.try_activate() {
            return;
        }
        {
            let mut outstanding = self.outstanding.lock().unwrap();
            *outstanding += 1;
        }
        self.enqueue(&self.active_tx, Dispatch::Job(Arc::clone(job)));
    }

    /// Hand a job back after one worker turn. Ends the turn's exclusive
    /// ownership; panics if the job was not actually running.
    pub fn release_job(&self, job: &Arc<Job>, at_end: bool) {
        job.end_turn(at_end);

        if at_end {
            let mut outstanding = self.outstanding.lock().unwrap();
            *outstanding = outstanding
                .checked_sub(1)
                .expect("outstanding-work counter underflow");
            if *outstanding == 0 {
                self.drained.notify_all();
            }
        } else {
            self.enqueue(&self.active_tx, Dispatch::Job(Arc::clone(job)));
        }
    }

    /// Record a consumer acknowledgement for `(source_id, stream)`.
    ///
    /// Offsets must be strictly increasing per stream; violations and
    /// commits for untracked sources are fatal (the table panics). In sync
    /// mode the snapshot is flushed before this returns.
    pub fn commit(&self, source_id: SourceId, stream: &str, offset: u64) {
        {
            let mut table = self.table.lock().unwrap();
            table.commit(source_id, stream, offset);
        }

        match self.config.flush {
            FlushMode::Sync => {
                if let Err(e) = self.flush_now() {
                    panic!("fatal IO error writing offsets snapshot: {}", e);
                }
            }
            FlushMode::Async | FlushMode::Timer => {
                self.dirty_commits.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    /// Rewind a job to the beginning of its file and zero every stream
    /// offset for the source. Explicit reprocessing only; never invoked by
    /// the engine itself.
    pub fn reset_job(&self, job: &Arc<Job>) -> Result<()> {
        self.table.lock().unwrap().reset_source(job.source_id());
        job.file().seek(SeekFrom::Start(0))?;
        info!(source_id = %job.source_id(), "job reset to start of file");
        Ok(())
    }

    pub(crate) fn load_snapshot(&self) -> Result<()> {
        let loaded = self.store.load()?;
        if !loaded.is_empty() {
            info!(
                sources = loaded.len(),
                snapshot = %self.store.path().display(),
                "loaded offsets snapshot"
            );
        }
        *self.table.lock().unwrap() = loaded;
        Ok(())
    }

    /// Render under the table lock, write under the store's own lock.
    fn flush_now(&self) -> Result<()> {
        let rendered = self.table.lock().unwrap().encode();
        self.store.persist(&rendered)
    }

    fn dispatch_loop(self: &Arc<Self>) {
        debug!("dispatcher started");
        loop {
            let item = match self.active_rx.recv() {
                Some(item) => item,
                None => break,
            };
            if self.is_shutdown() {
                break;
            }
            match item {
                Dispatch::Shutdown => break,
                job @ Dispatch::Job(_) => self.enqueue(&self.ready_tx, job),
            }
        }
        debug!("dispatcher stopped");
    }

    fn flush_loop(self: &Arc<Self>, interval: Duration) {
        debug!(?interval, "flush timer started");
        loop {
            {
                let stopped = self.flush_stop.lock().unwrap();
                if *stopped {
                    break;
                }
                let (stopped, _timeout) =
                    self.flush_cv.wait_timeout(stopped, interval).unwrap();
                if *stopped {
                    // Final flush happens in stop() after the workers exit.
                    break;
                }
            }

            if self.dirty_commits.swap(0, Ordering::AcqRel) > 0 {
                if let Err(e) = self.flush_now() {
                    panic!("fatal IO error writing offsets snapshot: {}", e);
                }
            }
        }
        debug!("flush timer stopped");
    }

    /// Blocking enqueue that stays responsive to shutdown: a full queue is
    /// retried until space frees up or the engine is tearing down.
    fn enqueue(&self, tx: &BoundedSender<Dispatch>, item: Dispatch) {
        let mut item = item;
        loop {
            if self.is_shutdown() {
                return;
            }
            match tx.send_timeout(item, ENQUEUE_POLL) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(back)) => item = back,
                Err(SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }

    fn is_snapshot_path(&self, path: &Path) -> bool {
        for candidate in [self.store.path(), self.store.temp_path()] {
            if path == candidate {
                return true;
            }
            if let (Ok(a), Ok(b)) = (path.canonicalize(), candidate.canonicalize()) {
                if a == b {
                    return true;
                }
            }
        }
        false
    }
}
