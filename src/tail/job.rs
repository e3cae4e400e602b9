// SPDX-License-Identifier: Apache-2.0

//! Per-file tracking state and the scheduling state machine.
//!
//! A job is created the first time a physical file is observed and lives
//! until the process exits; rotation and rename resume the existing job by
//! identity. The legal state transitions are
//! `Idle -> Active -> Running -> (Active | Idle)` and nothing else - an
//! illegal transition means the scheduler lost track of ownership, which is
//! unrecoverable because the job's read cursor is only safe under exactly
//! one owner.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::source_id::SourceId;

/// Scheduling state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Fully drained, waiting for new data
    Idle,
    /// Queued for a worker turn
    Active,
    /// Owned by exactly one worker
    Running,
}

/// In-memory tracking object for one physical file being tailed.
pub struct Job {
    source_id: SourceId,
    /// Last known path, for reporting only; identity decisions use source_id
    path: Mutex<PathBuf>,
    /// Open handle positioned at the read cursor. Only the worker currently
    /// running the job touches it; the scheduler's single-owner invariant
    /// replaces a per-file lock.
    file: Mutex<File>,
    state: Mutex<JobState>,
}

impl Job {
    pub fn new(source_id: SourceId, path: impl AsRef<Path>, file: File) -> Self {
        Self {
            source_id,
            path: Mutex::new(path.as_ref().to_path_buf()),
            file: Mutex::new(file),
            state: Mutex::new(JobState::Idle),
        }
    }

    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    pub fn path(&self) -> PathBuf {
        self.path.lock().unwrap().clone()
    }

    /// Record the path the file was most recently seen under.
    pub fn set_path(&self, path: impl AsRef<Path>) {
        *self.path.lock().unwrap() = path.as_ref().to_path_buf();
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap()
    }

    /// Lock the file handle. Held by the owning worker for the duration of a
    /// turn, and briefly by the registry when seeding or resetting cursors.
    pub fn file(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap()
    }

    /// Idle -> Active. Returns false when the job is already queued or
    /// running, in which case the caller must not enqueue it again.
    pub fn try_activate(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            JobState::Idle => {
                *state = JobState::Active;
                true
            }
            JobState::Active | JobState::Running => false,
        }
    }

    /// Active -> Running, called by the worker that dequeued the job.
    pub fn begin_turn(&self) {
        let mut state = self.state.lock().unwrap();
        match *state {
            JobState::Active => *state = JobState::Running,
            other => panic!(
                "job {} scheduled while {:?}: a job must have exactly one owner",
                self.source_id, other
            ),
        }
    }

    /// Running -> Idle (turn reached end of file) or Running -> Active (more
    /// data remains and the job goes back on the queue).
    pub fn end_turn(&self, at_end: bool) {
        let mut state = self.state.lock().unwrap();
        match *state {
            JobState::Running => {
                *state = if at_end { JobState::Idle } else { JobState::Active }
            }
            other => panic!(
                "released job {} which was not running (state {:?})",
                self.source_id, other
            ),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("source_id", &self.source_id)
            .field("path", &self.path())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn test_job() -> (Job, NamedTempFile) {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"line\n").unwrap();
        tmp.flush().unwrap();

        let file = File::open(tmp.path()).unwrap();
        let id = SourceId::from_file(&file).unwrap();
        (Job::new(id, tmp.path(), file), tmp)
    }

    #[test]
    fn full_turn_cycle() {
        let (job, _tmp) = test_job();
        assert_eq!(job.state(), JobState::Idle);

        assert!(job.try_activate());
        assert_eq!(job.state(), JobState::Active);

        job.begin_turn();
        assert_eq!(job.state(), JobState::Running);

        // Turn ended with more data: back on the queue.
        job.end_turn(false);
        assert_eq!(job.state(), JobState::Active);

        job.begin_turn();
        job.end_turn(true);
        assert_eq!(job.state(), JobState::Idle);
    }

    #[test]
    fn activate_is_idempotent_while_queued() {
        let (job, _tmp) = test_job();
        assert!(job.try_activate());
        assert!(!job.try_activate());

        job.begin_turn();
        assert!(!job.try_activate());
    }

    #[test]
    #[should_panic(expected = "exactly one owner")]
    fn double_run_panics() {
        let (job, _tmp) = test_job();
        job.try_activate();
        job.begin_turn();
        job.begin_turn();
    }

    #[test]
    #[should_panic(expected = "was not running")]
    fn release_of_idle_job_panics() {
        let (job, _tmp) = test_job();
        job.end_turn(true);
    }

    #[test]
    #[should_panic(expected = "exactly one owner")]
    fn run_of_idle_job_panics() {
        let (job, _tmp) = test_job();
        job.begin_turn();
    }

    #[test]
    fn set_path_updates_reported_path() {
        let (job, tmp) = test_job();
        assert_eq!(job.path(), tmp.path());

        job.set_path("/var/log/renamed.log");
        assert_eq!(job.path(), PathBuf::from("/var/log/renamed.log"));
    }
}
