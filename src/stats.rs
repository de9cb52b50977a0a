//! Adaptive usage statistics: an append-only JSON-Lines sink written off the
//! request hot path (SPEC_FULL.md §5, §6).
//!
//! A single background thread owns the file handle and drains a bounded
//! `std::sync::mpsc` channel; [`AdaptiveStats::record`] never blocks on I/O —
//! a full channel drops the record rather than stalling the query. No
//! document text is ever placed in a record, only shapes and counts.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, SyncSender};
use std::thread::JoinHandle;

/// Bound on the channel between request threads and the writer thread. Sized
/// generously above any plausible per-second query rate for a single manual
/// search process; once full, new records are dropped rather than applying
/// backpressure to the caller.
const CHANNEL_CAPACITY: usize = 4096;

/// One line of the stats sink. Deliberately shape-only: no query text, no
/// node text, nothing that could leak document contents.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StatsRecord {
    pub timestamp_ms: i64,
    pub trace_id: String,
    pub manual_id: String,
    pub normalized_query_char_len: usize,
    pub gate_used: String,
    pub candidate_count: usize,
    pub cache_mode: String,
    pub cutoff_reason: Option<String>,
    pub latency_ms: u64,
}

enum StatsEvent {
    Record(StatsRecord),
    Shutdown,
}

/// Handle to the background writer. Cloning is not supported — there is
/// exactly one writer thread and one owner of its sending half per process,
/// matching SPEC_FULL.md §5's "single background thread owns the file handle".
pub struct AdaptiveStats {
    sender: Option<SyncSender<StatsEvent>>,
    worker: Option<JoinHandle<()>>,
}

impl AdaptiveStats {
    /// Spawn the writer thread for `path`. When `enabled` is false, `record`
    /// becomes a pure no-op and no thread or file is created.
    #[must_use]
    pub fn spawn(path: PathBuf, enabled: bool) -> Self {
        if !enabled {
            return Self { sender: None, worker: None };
        }
        let (sender, receiver) = sync_channel::<StatsEvent>(CHANNEL_CAPACITY);
        let worker = std::thread::spawn(move || {
            let file = OpenOptions::new().create(true).append(true).open(&path);
            let mut file = match file {
                Ok(f) => f,
                Err(_) => return,
            };
            while let Ok(event) = receiver.recv() {
                match event {
                    StatsEvent::Record(record) => {
                        if let Ok(mut line) = serde_json::to_string(&record) {
                            line.push('\n');
                            // Write failures are swallowed: a stats sink never fails the query.
                            let _ = file.write_all(line.as_bytes());
                        }
                    }
                    StatsEvent::Shutdown => break,
                }
            }
        });
        Self {
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    /// Record one event. Non-blocking: if the channel is full, the record is
    /// silently dropped rather than stalling the caller.
    pub fn record(&self, record: StatsRecord) {
        if let Some(sender) = &self.sender {
            let _ = sender.try_send(StatsEvent::Record(record));
        }
    }

    /// Flush and join the writer thread. Used by tests and graceful shutdown;
    /// a process that exits without calling this simply loses in-flight
    /// records, which matches the "fire and forget" contract.
    pub fn shutdown(mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(StatsEvent::Shutdown);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for AdaptiveStats {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(StatsEvent::Shutdown);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(trace_id: &str) -> StatsRecord {
        StatsRecord {
            timestamp_ms: 0,
            trace_id: trace_id.to_owned(),
            manual_id: "hr".to_owned(),
            normalized_query_char_len: 12,
            gate_used: "g0".to_owned(),
            candidate_count: 3,
            cache_mode: "miss".to_owned(),
            cutoff_reason: None,
            latency_ms: 5,
        }
    }

    #[test]
    fn disabled_stats_never_creates_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.jsonl");
        let stats = AdaptiveStats::spawn(path.clone(), false);
        stats.record(sample_record("t1"));
        stats.shutdown();
        assert!(!path.exists());
    }

    #[test]
    fn enabled_stats_writes_one_json_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.jsonl");
        let stats = AdaptiveStats::spawn(path.clone(), true);
        stats.record(sample_record("t1"));
        stats.record(sample_record("t2"));
        stats.shutdown();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: StatsRecord = serde_json::from_str(line).unwrap();
            assert!(!parsed.trace_id.is_empty());
        }
    }

    #[test]
    fn records_never_carry_raw_query_or_document_text() {
        let record = sample_record("t1");
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("\"query\""));
        assert!(!json.contains("\"text\""));
    }
}
