// SPDX-License-Identifier: Apache-2.0

//! Stable file identity based on the device and inode pair.
//!
//! Paths change when log files are rotated or renamed; the inode does not,
//! for the lifetime of the file. Every correctness decision in the engine is
//! keyed by this identity, never by path.

use std::fs::{File, Metadata};
use std::io;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A stable, rename-invariant identifier for a physical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId {
    /// Device ID
    dev: u64,
    /// Inode number
    ino: u64,
}

impl SourceId {
    /// Create a SourceId from raw device and inode values.
    /// Used when loading persisted state.
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    /// Create a SourceId from file metadata.
    #[cfg(unix)]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    /// Create a SourceId from an open file handle.
    pub fn from_file(file: &File) -> io::Result<Self> {
        Ok(Self::from_metadata(&file.metadata()?))
    }

    /// Create a SourceId from a path by opening the file.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::from_file(&file)
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

impl FromStr for SourceId {
    type Err = String;

    /// Parse the `dev:ino` form produced by Display; used by the snapshot
    /// decoder.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (dev, ino) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid source id {:?}", s))?;
        let dev = dev
            .parse::<u64>()
            .map_err(|e| format!("invalid device in source id {:?}: {}", s, e))?;
        let ino = ino
            .parse::<u64>()
            .map_err(|e| format!("invalid inode in source id {:?}: {}", s, e))?;
        Ok(Self { dev, ino })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn same_file_same_id() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"test content").unwrap();
        file.flush().unwrap();

        let id1 = SourceId::from_path(file.path()).unwrap();
        let id2 = SourceId::from_path(file.path()).unwrap();

        assert_eq!(id1, id2);
    }

    #[test]
    fn different_files_different_ids() {
        let file1 = NamedTempFile::new().unwrap();
        let file2 = NamedTempFile::new().unwrap();

        let id1 = SourceId::from_path(file1.path()).unwrap();
        let id2 = SourceId::from_path(file2.path()).unwrap();

        assert_ne!(id1, id2);
    }

    #[test]
    fn id_stable_across_rename() {
        let dir = tempfile::TempDir::new().unwrap();
        let before = dir.path().join("a.log");
        let after = dir.path().join("a.log.1");
        std::fs::write(&before, b"hello\n").unwrap();

        let id1 = SourceId::from_path(&before).unwrap();
        std::fs::rename(&before, &after).unwrap();
        let id2 = SourceId::from_path(&after).unwrap();

        assert_eq!(id1, id2);
    }

    #[test]
    fn display_round_trips_through_from_str() {
        let id = SourceId::new(123, 456);
        assert_eq!(format!("{}", id), "123:456");
        assert_eq!("123:456".parse::<SourceId>().unwrap(), id);
    }

    #[test]
    fn from_str_rejects_garbage() {
        assert!("".parse::<SourceId>().is_err());
        assert!("123".parse::<SourceId>().is_err());
        assert!("a:b".parse::<SourceId>().is_err());
        assert!("12:".parse::<SourceId>().is_err());
    }
}
