//! Reader worker pool.
//!
//! Each worker loops on the ready queue, takes one job, and performs a single
//! bounded read turn before handing the job back to the scheduler. A turn
//! reads until either end of file or the first read pass that produced at
//! least one complete record - that bound is the fairness mechanism: with K
//! workers and many active files, no single high-throughput file can hold a
//! worker across scheduling turns.
//!
//! After the turn, the file handle is seeked backward over any bytes read
//! past the last emitted record boundary, so the cursor always means "bytes
//! strictly before this point have been fully turned into records". A partial
//! record with no terminator yet is never emitted; it is re-read on the
//! job's next turn.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use tracing::{debug, trace};

use super::job::Job;
use super::record::{Consumer, Record, DEFAULT_STREAM};
use super::registry::{Dispatch, JobRegistry};
use crate::bounded_channel::BoundedReceiver;

/// Main loop of one worker thread. Exits on a shutdown sentinel, on the
/// shutdown flag (checked immediately after every unblock), or when the
/// queue is torn down.
pub(crate) fn worker_loop(
    worker: usize,
    ready: BoundedReceiver<Dispatch>,
    registry: Arc<JobRegistry>,
    consumer: Arc<dyn Consumer>,
    read_buffer_size: usize,
) {
    let mut buf = vec![0u8; read_buffer_size];
    debug!(worker, "reader worker started");

    loop {
        let item = match ready.recv() {
            Some(item) => item,
            None => break,
        };
        if registry.is_shutdown() {
            break;
        }
        let job = match item {
            Dispatch::Job(job) => job,
            Dispatch::Shutdown => break,
        };

        job.begin_turn();
        let at_end = match run_turn(&job, consumer.as_ref(), &mut buf) {
            Ok(at_end) => at_end,
            // IO errors other than EOF leave the cursor ambiguous; resume
            // from the last committed offset instead.
            Err(e) => panic!(
                "fatal IO error while tailing {} ({}): {}",
                job.path().display(),
                job.source_id(),
                e
            ),
        };
        registry.release_job(&job, at_end);
    }

    debug!(worker, "reader worker stopped");
}

/// One bounded read turn over a job's file.
///
/// Emits every complete record found, leaves the cursor on the first
/// unconsumed byte, and reports whether the turn ended at end of file.
pub(crate) fn run_turn(
    job: &Job,
    consumer: &dyn Consumer,
    buf: &mut [u8],
) -> std::io::Result<bool> {
    let mut file = job.file();
    let turn_start = file.stream_position()?;

    // Bytes of a record started in an earlier pass of this turn.
    let mut carry: Vec<u8> = Vec::new();
    // Total bytes read this turn, and bytes consumed through the last
    // emitted boundary.
    let mut read_total: u64 = 0;
    let mut consumed: u64 = 0;
    let mut produced = false;

    let at_end = loop {
        let n = file.read(buf)?;
        if n == 0 {
            break true;
        }
        let chunk = &buf[..n];

        let mut seg = 0usize;
        while let Some(rel) = chunk[seg..].iter().position(|&b| b == b'\n') {
            let boundary = seg + rel;

            let mut line = std::mem::take(&mut carry);
            line.extend_from_slice(&chunk[seg..boundary]);
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            consumed = read_total + boundary as u64 + 1;
            consumer.deliver(Record {
                source_id: job.source_id(),
                stream: DEFAULT_STREAM.to_string(),
                offset: turn_start + consumed,
                bytes: line,
            });
            produced = true;
            seg = boundary + 1;
        }

        carry.extend_from_slice(&chunk[seg..]);
        read_total += n as u64;

        if produced {
            break false;
        }
    };

    // Un-read everything past the last boundary so the next turn, possibly
    // on a different worker, resumes at the first unconsumed byte.
    let unread = read_total - consumed;
    if unread > 0 {
        file.seek(SeekFrom::Current(-(unread as i64)))?;
    }

    trace!(
        source_id = %job.source_id(),
        turn_start,
        consumed,
        unread,
        at_end,
        "turn complete"
    );

    Ok(at_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tail::source_id::SourceId;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Sink {
        records: Mutex<Vec<Record>>,
    }

    impl Sink {
        fn new() -> Self {
            Self {
                records: Mutex::new(Vec::new()),
            }
        }

        fn take(&self) -> Vec<Record> {
            std::mem::take(&mut self.records.lock().unwrap())
        }
    }

    impl Consumer for Sink {
        fn deliver(&self, record: Record) {
            self.records.lock().unwrap().push(record);
        }
    }

    fn job_for(path: &Path) -> Job {
        let file = File::open(path).unwrap();
        let id = SourceId::from_file(&file).unwrap();
        Job::new(id, path, file)
    }

    fn append(path: &Path, bytes: &[u8]) {
        let mut f = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
    }

    #[test]
    fn turn_emits_complete_lines_with_end_offsets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"one\ntwo\nthree\n").unwrap();

        let job = job_for(&path);
        let sink = Sink::new();
        let mut buf = vec![0u8; 1024];

        let at_end = run_turn(&job, &sink, &mut buf).unwrap();
        // The whole file fit into one pass, which produced boundaries.
        assert!(!at_end);

        let records = sink.take();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].bytes, b"one");
        assert_eq!(records[0].offset, 4);
        assert_eq!(records[1].bytes, b"two");
        assert_eq!(records[1].offset, 8);
        assert_eq!(records[2].bytes, b"three");
        assert_eq!(records[2].offset, 14);
        assert_eq!(records[0].stream, DEFAULT_STREAM);

        // Next turn observes end of file.
        let at_end = run_turn(&job, &sink, &mut buf).unwrap();
        assert!(at_end);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn partial_line_is_held_until_terminated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"complete\npart").unwrap();

        let job = job_for(&path);
        let sink = Sink::new();
        let mut buf = vec![0u8; 1024];

        assert!(!run_turn(&job, &sink, &mut buf).unwrap());
        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes, b"complete");

        // Partial tail: read to EOF without a boundary, nothing emitted.
        assert!(run_turn(&job, &sink, &mut buf).unwrap());
        assert!(sink.take().is_empty());

        // Terminate the partial record and read again.
        append(&path, b"ial\n");
        assert!(!run_turn(&job, &sink, &mut buf).unwrap());
        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes, b"partial");
        assert_eq!(records[0].offset, 17); // "complete\npartial\n"
    }

    #[test]
    fn record_spanning_many_reads_is_assembled() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        // 95 bytes + newline: exactly six 16-byte read passes.
        let long = "x".repeat(95);
        std::fs::write(&path, format!("{}\nnext\n", long)).unwrap();

        let job = job_for(&path);
        let sink = Sink::new();
        // Buffer much smaller than the record: the turn keeps reading until
        // the first boundary shows up.
        let mut buf = vec![0u8; 16];

        assert!(!run_turn(&job, &sink, &mut buf).unwrap());
        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes.len(), 95);
        assert_eq!(records[0].offset, 96);

        // The second line was untouched by the first turn.
        assert!(!run_turn(&job, &sink, &mut buf).unwrap());
        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes, b"next");
        assert_eq!(records[0].offset, 101);
    }

    #[test]
    fn turn_stops_at_first_boundary_bearing_pass() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        // Ten short lines; an 8-byte buffer sees at most two per pass.
        let mut content = String::new();
        for i in 0..10 {
            content.push_str(&format!("l{:02}\n", i));
        }
        std::fs::write(&path, &content).unwrap();

        let job = job_for(&path);
        let sink = Sink::new();
        let mut buf = vec![0u8; 8];

        assert!(!run_turn(&job, &sink, &mut buf).unwrap());
        let first_turn = sink.take();
        assert!(!first_turn.is_empty());
        assert!(first_turn.len() < 10, "one turn must not drain the file");

        // Keep taking turns; every line comes out exactly once, in order.
        let mut all = first_turn;
        loop {
            let at_end = run_turn(&job, &sink, &mut buf).unwrap();
            all.extend(sink.take());
            if at_end {
                break;
            }
        }
        assert_eq!(all.len(), 10);
        for (i, record) in all.iter().enumerate() {
            assert_eq!(record.bytes, format!("l{:02}", i).as_bytes());
            assert_eq!(record.offset, (i as u64 + 1) * 4);
        }
    }

    #[test]
    fn seek_back_lands_on_first_unconsumed_byte() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"ab\ncdef").unwrap();

        let job = job_for(&path);
        let sink = Sink::new();
        let mut buf = vec![0u8; 1024];

        run_turn(&job, &sink, &mut buf).unwrap();
        // One record ("ab", 3 bytes consumed); the 4 tail bytes are un-read.
        let pos = job.file().stream_position().unwrap();
        assert_eq!(pos, 3);
    }

    #[test]
    fn crlf_terminator_is_stripped_from_bytes_not_offsets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"one\r\ntwo\r\n").unwrap();

        let job = job_for(&path);
        let sink = Sink::new();
        let mut buf = vec![0u8; 1024];

        run_turn(&job, &sink, &mut buf).unwrap();
        let records = sink.take();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].bytes, b"one");
        assert_eq!(records[0].offset, 5);
        assert_eq!(records[1].bytes, b"two");
        assert_eq!(records[1].offset, 10);
    }

    #[test]
    fn empty_lines_are_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"a\n\nb\n").unwrap();

        let job = job_for(&path);
        let sink = Sink::new();
        let mut buf = vec![0u8; 1024];

        run_turn(&job, &sink, &mut buf).unwrap();
        let records = sink.take();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].bytes, b"");
        assert_eq!(records[1].offset, 3);
    }

    #[test]
    fn turn_respects_preseeked_cursor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"old line\nnew line\n").unwrap();

        let job = job_for(&path);
        job.file().seek(SeekFrom::Start(9)).unwrap();

        let sink = Sink::new();
        let mut buf = vec![0u8; 1024];
        run_turn(&job, &sink, &mut buf).unwrap();

        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes, b"new line");
        assert_eq!(records[0].offset, 18);
    }
}
