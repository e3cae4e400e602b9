// SPDX-License-Identifier: Apache-2.0

//! Record hand-off between the engine and the downstream consumer.
//!
//! Workers deliver each decoded line as a [`Record`]; the consumer processes
//! it and, once the record is durably handled, commits its offset back
//! through a [`Committer`] handle. Commits drive the durable snapshot, so a
//! consumer that never commits gets full re-delivery after a restart.

use std::sync::Weak;

use tracing::debug;

use super::registry::JobRegistry;
use super::source_id::SourceId;

/// Stream name workers stamp on records. A consumer that demultiplexes one
/// physical file into several logical channels commits finer-grained stream
/// names against the same source.
pub const DEFAULT_STREAM: &str = "default";

/// One decoded line handed to the consumer.
#[derive(Debug, Clone)]
pub struct Record {
    /// Identity of the file this record came from
    pub source_id: SourceId,
    /// Logical stream within the source
    pub stream: String,
    /// Absolute byte offset of the end of this record, terminator included.
    /// Committing this value makes it the resume cursor.
    pub offset: u64,
    /// Line content, without the trailing terminator
    pub bytes: Vec<u8>,
}

/// Downstream record consumer.
///
/// `deliver` is called from worker threads; implementations must be
/// thread-safe and should not block for long, since a blocked consumer
/// stalls the delivering worker's turn.
pub trait Consumer: Send + Sync {
    fn deliver(&self, record: Record);
}

/// Cloneable commit handle given to consumers.
///
/// Holds a weak reference so a consumer outliving the engine cannot keep the
/// registry alive; commits after shutdown are dropped.
#[derive(Clone)]
pub struct Committer {
    registry: Weak<JobRegistry>,
}

impl Committer {
    pub(crate) fn new(registry: Weak<JobRegistry>) -> Self {
        Self { registry }
    }

    /// Acknowledge that everything up to `offset` on `(source_id, stream)`
    /// has been fully and durably processed.
    ///
    /// Offsets must be strictly increasing per (source, stream); committing
    /// a stale offset or an unknown source is a fatal protocol violation.
    pub fn commit(&self, source_id: SourceId, stream: &str, offset: u64) {
        match self.registry.upgrade() {
            Some(registry) => registry.commit(source_id, stream, offset),
            None => debug!(
                source_id = %source_id,
                offset,
                "dropping commit received after engine shutdown"
            ),
        }
    }
}
