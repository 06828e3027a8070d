//! Per-invocation log accumulation
//!
//! Each invocation gets a `LogStatStore`: a bounded in-memory buffer fed by
//! the log demultiplexer, an optional plain file writer for full capture,
//! plus completion flags for the stdout and stderr streams. `wait` blocks
//! until both streams report EOF, bounded by the caller's grace timeout.

use dashmap::DashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Initial in-memory buffer capacity
pub const DEFAULT_LOG_BUFFER: usize = 4 * 1024;
/// Hard cap on buffered log bytes per invocation; excess is discarded
pub const MAX_LOG_BUFFER: usize = 6 * 1024 * 1024;

/// Which sandbox stream a chunk of log bytes came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
    System,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Stdout => "stdout",
            LogSource::Stderr => "stderr",
            LogSource::System => "system",
        }
    }

    fn done_bit(&self) -> u8 {
        match self {
            LogSource::Stdout => 0b01,
            LogSource::Stderr => 0b10,
            // System lines have no EOF of their own
            LogSource::System => 0,
        }
    }
}

const ALL_DONE: u8 = 0b11;

/// Log accumulator for one invocation
pub struct LogStatStore {
    request_id: String,
    buf: Mutex<Vec<u8>>,
    file: Mutex<Option<BufWriter<File>>>,
    /// Bytes discarded after the buffer hit its hard cap
    truncated: AtomicUsize,
    done_mask: AtomicU8,
    done_notify: Notify,
}

impl LogStatStore {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            buf: Mutex::new(Vec::with_capacity(DEFAULT_LOG_BUFFER)),
            file: Mutex::new(None),
            truncated: AtomicUsize::new(0),
            done_mask: AtomicU8::new(0),
            done_notify: Notify::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Attach a plain file writer. The file receives every byte written,
    /// including what the in-memory buffer discards past its cap; it is
    /// flushed when both streams report EOF.
    pub fn set_file(&self, file: File) {
        *self.file.lock().expect("log file lock poisoned") = Some(BufWriter::new(file));
    }

    /// Append log bytes, returning how many were accepted.
    ///
    /// May accept fewer bytes than offered when approaching the hard cap;
    /// once the cap is reached the remainder is counted as truncated and
    /// reported as consumed so upstream readers keep draining the socket.
    pub fn write(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        if let Some(writer) = self.file.lock().expect("log file lock poisoned").as_mut() {
            if let Err(e) = writer.write_all(data) {
                debug!(request_id = %self.request_id, error = %e, "log file write failed");
            }
        }
        let mut buf = self.buf.lock().expect("log buffer lock poisoned");
        let space = MAX_LOG_BUFFER.saturating_sub(buf.len());
        if space == 0 {
            self.truncated.fetch_add(data.len(), Ordering::Relaxed);
            return data.len();
        }
        let take = space.min(data.len());
        buf.extend_from_slice(&data[..take]);
        take
    }

    /// Total bytes discarded past the hard cap
    pub fn truncated_bytes(&self) -> usize {
        self.truncated.load(Ordering::Relaxed)
    }

    /// Snapshot the buffered log bytes
    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().expect("log buffer lock poisoned").clone()
    }

    /// Mark one stream as finished for this invocation
    pub fn mark_done(&self, source: LogSource) {
        let bit = source.done_bit();
        if bit == 0 {
            return;
        }
        let prev = self.done_mask.fetch_or(bit, Ordering::AcqRel);
        if prev | bit == ALL_DONE && prev != ALL_DONE {
            self.flush_file();
            self.done_notify.notify_waiters();
        }
    }

    /// Mark both streams finished regardless of what was received
    pub fn force_done(&self) {
        let prev = self.done_mask.fetch_or(ALL_DONE, Ordering::AcqRel);
        if prev != ALL_DONE {
            self.flush_file();
            self.done_notify.notify_waiters();
        }
    }

    fn flush_file(&self) {
        if let Some(writer) = self.file.lock().expect("log file lock poisoned").as_mut() {
            if let Err(e) = writer.flush() {
                debug!(request_id = %self.request_id, error = %e, "log file flush failed");
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.done_mask.load(Ordering::Acquire) == ALL_DONE
    }

    /// Wait until both streams report EOF, bounded by `grace`.
    ///
    /// Returns true if both streams finished within the grace period.
    pub async fn wait(&self, grace: Duration) -> bool {
        if self.is_done() {
            return true;
        }
        let notified = self.done_notify.notified();
        tokio::pin!(notified);
        // Re-check after registering to close the notify race
        if self.is_done() {
            return true;
        }
        tokio::time::timeout(grace, notified).await.is_ok() && self.is_done()
    }
}

/// Log stores for one sandbox: request ID to store, plus the store of the
/// most recently started request used when a log line carries no tag
pub struct RuntimeLogStores {
    stores: DashMap<String, Arc<LogStatStore>>,
    last: RwLock<Option<Arc<LogStatStore>>>,
}

impl RuntimeLogStores {
    pub fn new() -> Self {
        Self {
            stores: DashMap::new(),
            last: RwLock::new(None),
        }
    }

    /// Register the store for a newly-started request and make it current
    pub fn insert(&self, store: Arc<LogStatStore>) {
        self.stores
            .insert(store.request_id().to_string(), store.clone());
        *self.last.write().expect("log store lock poisoned") = Some(store);
    }

    pub fn get(&self, request_id: &str) -> Option<Arc<LogStatStore>> {
        self.stores.get(request_id).map(|s| s.clone())
    }

    /// The most recently started request's store
    pub fn last(&self) -> Option<Arc<LogStatStore>> {
        self.last.read().expect("log store lock poisoned").clone()
    }

    /// Drop a completed request's store; clears "last" if it pointed here
    pub fn remove(&self, request_id: &str) {
        self.stores.remove(request_id);
        let mut last = self.last.write().expect("log store lock poisoned");
        if let Some(store) = last.as_ref() {
            if store.request_id() == request_id {
                *last = None;
            }
        }
    }

    /// Mark a stream EOF on every live store (sandbox stream closed)
    pub fn mark_all_done(&self, source: LogSource) {
        for entry in self.stores.iter() {
            entry.value().mark_done(source);
        }
    }
}

impl Default for RuntimeLogStores {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-sandbox index of log stores, keyed by runtime ID
pub struct LogStoreIndex {
    runtimes: DashMap<String, Arc<RuntimeLogStores>>,
}

impl LogStoreIndex {
    pub fn new() -> Self {
        Self {
            runtimes: DashMap::new(),
        }
    }

    /// Stores for a runtime, created on first use
    pub fn for_runtime(&self, runtime_id: &str) -> Arc<RuntimeLogStores> {
        self.runtimes
            .entry(runtime_id.to_string())
            .or_insert_with(|| Arc::new(RuntimeLogStores::new()))
            .clone()
    }

    pub fn get(&self, runtime_id: &str) -> Option<Arc<RuntimeLogStores>> {
        self.runtimes.get(runtime_id).map(|s| s.clone())
    }

    pub fn remove(&self, runtime_id: &str) {
        self.runtimes.remove(runtime_id);
    }
}

impl Default for LogStoreIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_caps_at_hard_limit() {
        let store = LogStatStore::new("req-1");
        let chunk = vec![b'x'; 1024 * 1024];
        let mut total = 0usize;
        for _ in 0..8 {
            total += store.write(&chunk);
        }
        // Everything reports consumed, but only the cap is retained
        assert_eq!(total, 8 * 1024 * 1024);
        assert_eq!(store.contents().len(), MAX_LOG_BUFFER);
        assert_eq!(store.truncated_bytes(), 2 * 1024 * 1024);
    }

    #[test]
    fn test_file_writer_flushes_on_done() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("req-1.log");
        let store = LogStatStore::new("req-1");
        store.set_file(File::create(&path).unwrap());

        store.write(b"hello ");
        store.write(b"world\n");
        store.force_done();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world\n");
    }

    #[test]
    fn test_file_writer_keeps_bytes_the_buffer_discards() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.log");
        let store = LogStatStore::new("req-1");
        store.set_file(File::create(&path).unwrap());

        store.write(&vec![b'x'; MAX_LOG_BUFFER]);
        store.write(b"tail");
        store.mark_done(LogSource::Stdout);
        store.mark_done(LogSource::Stderr);

        assert_eq!(store.contents().len(), MAX_LOG_BUFFER);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len() as usize,
            MAX_LOG_BUFFER + 4
        );
    }

    #[tokio::test]
    async fn test_wait_returns_when_both_streams_done() {
        let store = Arc::new(LogStatStore::new("req-1"));
        store.mark_done(LogSource::Stdout);

        let waiter = store.clone();
        let handle = tokio::spawn(async move { waiter.wait(Duration::from_secs(1)).await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        store.mark_done(LogSource::Stderr);
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_times_out_when_stream_never_finishes() {
        let store = LogStatStore::new("req-1");
        store.mark_done(LogSource::Stdout);
        assert!(!store.wait(Duration::from_millis(10)).await);
    }

    #[test]
    fn test_last_store_tracking() {
        let stores = RuntimeLogStores::new();
        let a = Arc::new(LogStatStore::new("a"));
        let b = Arc::new(LogStatStore::new("b"));
        stores.insert(a);
        stores.insert(b.clone());
        assert_eq!(stores.last().unwrap().request_id(), "b");

        stores.remove("b");
        assert!(stores.last().is_none());
        assert!(stores.get("b").is_none());
        assert!(stores.get("a").is_some());
    }
}
