//! Durable offset snapshots.
//!
//! The offset table maps `(source, stream)` to the committed byte offset and
//! is the sole source of truth for resumption. It is serialized as a textual,
//! forward-scannable sequence of per-source blocks:
//!
//! ```text
//! offsets v1
//! source 64769:123456 /var/log/app/a.log
//! stream 51 default
//! stream 10 errors
//! ```
//!
//! The stream name comes last on its line so it may contain spaces; the path
//! is everything after the source id for the same reason. Paths are carried
//! for reporting only - identity is always the `dev:ino` pair.
//!
//! Writes go through write-to-temp, fsync, rename-over, so a crash mid-write
//! leaves the previously valid snapshot intact: readers see the old or the
//! new snapshot, never a partial one.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::error::{Error, Result};
use super::source_id::SourceId;

const SNAPSHOT_HEADER: &str = "offsets v1";

/// Suffix of the temp file written before the atomic rename.
pub const TEMP_SUFFIX: &str = ".atomic";

/// In-memory committed-offset table plus the identity index.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OffsetTable {
    /// source -> stream name -> committed byte offset
    streams: HashMap<SourceId, BTreeMap<String, u64>>,
    /// source -> last known path, for reporting and snapshots only
    paths: HashMap<SourceId, PathBuf>,
}

impl OffsetTable {
    pub fn contains_source(&self, source_id: SourceId) -> bool {
        self.streams.contains_key(&source_id)
    }

    /// Create the (empty) stream map for a newly instantiated job. Existing
    /// entries are kept - a source rediscovered at a new path only refreshes
    /// the identity index.
    pub fn register_source(&mut self, source_id: SourceId, path: impl AsRef<Path>) {
        self.streams.entry(source_id).or_default();
        self.paths
            .insert(source_id, path.as_ref().to_path_buf());
    }

    pub fn update_path(&mut self, source_id: SourceId, path: impl AsRef<Path>) {
        self.paths
            .insert(source_id, path.as_ref().to_path_buf());
    }

    pub fn path(&self, source_id: SourceId) -> Option<&Path> {
        self.paths.get(&source_id).map(PathBuf::as_path)
    }

    pub fn committed(&self, source_id: SourceId, stream: &str) -> Option<u64> {
        self.streams.get(&source_id).and_then(|s| s.get(stream)).copied()
    }

    /// Minimum committed offset across all of a source's streams, or 0 when
    /// no stream has committed yet. Seeking here on resume guarantees
    /// at-least-once delivery for every stream sharing the physical cursor.
    pub fn min_offset(&self, source_id: SourceId) -> Option<u64> {
        self.streams
            .get(&source_id)
            .map(|streams| streams.values().copied().min().unwrap_or(0))
    }

    /// Record a commit. Offsets are strictly monotonic per (source, stream);
    /// a stale offset or an unknown source means the commit protocol was
    /// violated and the table can no longer be trusted.
    pub fn commit(&mut self, source_id: SourceId, stream: &str, offset: u64) {
        let Some(streams) = self.streams.get_mut(&source_id) else {
            panic!(
                "commit for untracked source {} (stream {:?}, offset {}): \
                 offsets exist only for sources with an instantiated job",
                source_id, stream, offset
            );
        };

        let committed = streams.entry(stream.to_string()).or_insert(0);
        if offset <= *committed {
            panic!(
                "out-of-order commit for source {} stream {:?}: offset {} is not \
                 greater than committed offset {}",
                source_id, stream, offset, *committed
            );
        }
        *committed = offset;
    }

    /// Zero every stream offset of a source. Only the explicit reset path may
    /// rewind committed offsets.
    pub fn reset_source(&mut self, source_id: SourceId) {
        if let Some(streams) = self.streams.get_mut(&source_id) {
            for offset in streams.values_mut() {
                *offset = 0;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Render the table in snapshot form. Sources are ordered by identity so
    /// output is stable across runs.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(SNAPSHOT_HEADER);
        out.push('\n');

        let mut sources: Vec<_> = self.streams.keys().copied().collect();
        sources.sort();

        for source_id in sources {
            let path = self
                .paths
                .get(&source_id)
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            out.push_str(&format!("source {} {}\n", source_id, path));

            for (stream, offset) in &self.streams[&source_id] {
                out.push_str(&format!("stream {} {}\n", offset, stream));
            }
        }

        out
    }

    /// Parse a snapshot. Any inconsistency is an error - offsets are
    /// authoritative and there is no safe partial-recovery path.
    pub fn decode(input: &str) -> Result<Self> {
        let mut table = OffsetTable::default();
        let mut current: Option<SourceId> = None;

        let mut lines = input.lines().enumerate();

        match lines.next() {
            Some((_, SNAPSHOT_HEADER)) => {}
            Some((_, other)) => {
                return Err(Error::Snapshot {
                    line: 1,
                    reason: format!("unrecognized header {:?}", other),
                })
            }
            None => {
                return Err(Error::Snapshot {
                    line: 1,
                    reason: "empty snapshot".to_string(),
                })
            }
        }

        for (idx, line) in lines {
            let line_no = idx + 1;
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix("source ") {
                let (id, path) = rest.split_once(' ').unwrap_or((rest, ""));
                let source_id: SourceId = id.parse().map_err(|reason| Error::Snapshot {
                    line: line_no,
                    reason,
                })?;
                if table.streams.contains_key(&source_id) {
                    return Err(Error::Snapshot {
                        line: line_no,
                        reason: format!("duplicate source block for {}", source_id),
                    });
                }
                table.register_source(source_id, path);
                current = Some(source_id);
            } else if let Some(rest) = line.strip_prefix("stream ") {
                let source_id = current.ok_or_else(|| Error::Snapshot {
                    line: line_no,
                    reason: "stream line before any source block".to_string(),
                })?;
                let (offset, stream) =
                    rest.split_once(' ').ok_or_else(|| Error::Snapshot {
                        line: line_no,
                        reason: format!("malformed stream line {:?}", line),
                    })?;
                let offset = offset.parse::<u64>().map_err(|e| Error::Snapshot {
                    line: line_no,
                    reason: format!("invalid offset {:?}: {}", offset, e),
                })?;
                if stream.is_empty() {
                    return Err(Error::Snapshot {
                        line: line_no,
                        reason: "empty stream name".to_string(),
                    });
                }
                let streams = table.streams.get_mut(&source_id).unwrap();
                if streams.insert(stream.to_string(), offset).is_some() {
                    return Err(Error::Snapshot {
                        line: line_no,
                        reason: format!("duplicate stream {:?} for {}", stream, source_id),
                    });
                }
            } else {
                return Err(Error::Snapshot {
                    line: line_no,
                    reason: format!("unrecognized line {:?}", line),
                });
            }
        }

        Ok(table)
    }
}

/// Owns the canonical snapshot path and serializes all writes to it.
pub struct SnapshotStore {
    path: PathBuf,
    temp_path: PathBuf,
    /// Writers take this lock for the full write-fsync-rename sequence; it is
    /// independent of the table lock, which is never held across IO.
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut temp = path.as_os_str().to_os_string();
        temp.push(TEMP_SUFFIX);

        Ok(Self {
            path,
            temp_path: PathBuf::from(temp),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Load the snapshot. A missing file is a first run, not an error; a
    /// malformed file is fatal.
    pub fn load(&self) -> Result<OffsetTable> {
        if !self.path.exists() {
            return Ok(OffsetTable::default());
        }
        let contents = fs::read_to_string(&self.path)?;
        OffsetTable::decode(&contents)
    }

    /// Durably replace the snapshot with `rendered`: temp file in the same
    /// directory, fsync, rename over the canonical path.
    pub fn persist(&self, rendered: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();

        let mut temp = File::create(&self.temp_path)?;
        temp.write_all(rendered.as_bytes())?;
        temp.sync_all()?;
        fs::rename(&self.temp_path, &self.path)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_table() -> OffsetTable {
        let mut table = OffsetTable::default();

        let a = SourceId::new(1, 100);
        let b = SourceId::new(1, 200);
        table.register_source(a, "/var/log/a.log");
        table.register_source(b, "/var/log/dir with spaces/b.log");

        table.commit(a, "default", 51);
        table.commit(a, "errors", 10);
        table.commit(b, "default", 7);

        table
    }

    #[test]
    fn encode_decode_round_trip() {
        let table = sample_table();
        let decoded = OffsetTable::decode(&table.encode()).unwrap();
        assert_eq!(decoded, table);
        assert_eq!(
            decoded.path(SourceId::new(1, 200)),
            Some(Path::new("/var/log/dir with spaces/b.log"))
        );
    }

    #[test]
    fn round_trip_keeps_sources_with_no_commits() {
        let mut table = OffsetTable::default();
        table.register_source(SourceId::new(3, 9), "/var/log/fresh.log");

        let decoded = OffsetTable::decode(&table.encode()).unwrap();
        assert_eq!(decoded, table);
        assert_eq!(decoded.min_offset(SourceId::new(3, 9)), Some(0));
    }

    #[test]
    fn stream_names_with_spaces_round_trip() {
        let mut table = OffsetTable::default();
        let id = SourceId::new(2, 5);
        table.register_source(id, "/tmp/x.log");
        table.commit(id, "stdout channel 2", 33);

        let decoded = OffsetTable::decode(&table.encode()).unwrap();
        assert_eq!(decoded.committed(id, "stdout channel 2"), Some(33));
    }

    #[test]
    fn decode_rejects_missing_header() {
        let err = OffsetTable::decode("source 1:2 /a\n").unwrap_err();
        assert!(matches!(err, Error::Snapshot { line: 1, .. }));
    }

    #[test]
    fn decode_rejects_stream_before_source() {
        let input = "offsets v1\nstream 10 default\n";
        let err = OffsetTable::decode(input).unwrap_err();
        assert!(matches!(err, Error::Snapshot { line: 2, .. }));
    }

    #[test]
    fn decode_rejects_bad_offset() {
        let input = "offsets v1\nsource 1:2 /a\nstream x default\n";
        assert!(OffsetTable::decode(input).is_err());
    }

    #[test]
    fn decode_rejects_duplicate_source() {
        let input = "offsets v1\nsource 1:2 /a\nsource 1:2 /a\n";
        assert!(OffsetTable::decode(input).is_err());
    }

    #[test]
    fn decode_rejects_unknown_line() {
        let input = "offsets v1\ngarbage\n";
        assert!(OffsetTable::decode(input).is_err());
    }

    #[test]
    fn min_offset_spans_streams() {
        let table = sample_table();
        assert_eq!(table.min_offset(SourceId::new(1, 100)), Some(10));
        assert_eq!(table.min_offset(SourceId::new(1, 200)), Some(7));
        assert_eq!(table.min_offset(SourceId::new(9, 9)), None);
    }

    #[test]
    #[should_panic(expected = "untracked source")]
    fn commit_unknown_source_panics() {
        let mut table = OffsetTable::default();
        table.commit(SourceId::new(1, 1), "default", 10);
    }

    #[test]
    #[should_panic(expected = "out-of-order commit")]
    fn backwards_commit_panics() {
        let mut table = sample_table();
        table.commit(SourceId::new(1, 100), "default", 51);
    }

    #[test]
    fn reset_zeroes_all_streams() {
        let mut table = sample_table();
        let id = SourceId::new(1, 100);
        table.reset_source(id);
        assert_eq!(table.committed(id, "default"), Some(0));
        assert_eq!(table.committed(id, "errors"), Some(0));

        // Fresh commits are legal again after the reset.
        table.commit(id, "default", 5);
        assert_eq!(table.committed(id, "default"), Some(5));
    }

    #[test]
    fn store_load_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path().join("offsets")).unwrap();
        let table = store.load().unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn store_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path().join("state/offsets")).unwrap();

        let table = sample_table();
        store.persist(&table.encode()).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, table);

        // The temp file must not survive a completed write.
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn store_persist_replaces_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path().join("offsets")).unwrap();

        let mut table = sample_table();
        store.persist(&table.encode()).unwrap();

        table.commit(SourceId::new(1, 200), "default", 99);
        store.persist(&table.encode()).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.committed(SourceId::new(1, 200), "default"), Some(99));
    }

    #[test]
    fn store_load_rejects_malformed_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offsets");
        fs::write(&path, "not a snapshot\n").unwrap();

        let store = SnapshotStore::open(&path).unwrap();
        assert!(store.load().is_err());
    }

    #[test]
    fn temp_path_is_canonical_plus_suffix() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path().join("offsets")).unwrap();
        assert_eq!(
            store.temp_path(),
            dir.path().join("offsets.atomic").as_path()
        );
    }
}
