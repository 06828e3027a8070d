//! Log line demultiplexer
//!
//! A sandbox multiplexes log lines for possibly several historical requests
//! onto one stdout (or stderr) byte stream. Lines are newline-terminated and
//! carry a `timestamp\trequestID\t` prefix identifying the originating
//! request; a NUL byte both terminates a line and marks the end of that
//! request's output. This parser is streaming, stateful, and single-pass: a
//! `Read` never guarantees a complete line or record.

use crate::logstore::{LogSource, LogStatStore, RuntimeLogStores};
use std::sync::Arc;

/// Read buffer size for sandbox log streams; also the forced-flush threshold
/// when no line terminator has arrived
pub const LOG_READ_BUFFER: usize = 64 * 1024;

/// Streaming demultiplexer for one sandbox stream (stdout or stderr)
pub struct LogDemux {
    source: LogSource,
    stores: Arc<RuntimeLogStores>,
    pending: Vec<u8>,
    /// Store resolved by the last tagged line; untagged continuation lines
    /// in the same block attach here
    current: Option<Arc<LogStatStore>>,
}

impl LogDemux {
    pub fn new(source: LogSource, stores: Arc<RuntimeLogStores>) -> Self {
        Self {
            source,
            stores,
            pending: Vec::new(),
            current: None,
        }
    }

    /// Feed one chunk read from the sandbox socket
    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        self.drain();
    }

    /// The stream closed; flush whatever is buffered
    pub fn finish(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.handle_line(&line, false);
        }
    }

    fn drain(&mut self) {
        loop {
            match self
                .pending
                .iter()
                .position(|b| *b == b'\n' || *b == b'\0')
            {
                Some(idx) => {
                    let is_terminal = self.pending[idx] == b'\0';
                    let rest = self.pending.split_off(idx + 1);
                    let mut line = std::mem::replace(&mut self.pending, rest);
                    line.pop(); // strip the terminator byte
                    self.handle_line(&line, is_terminal);
                }
                None => {
                    // No terminator yet; if the buffer is saturated, force a
                    // synthetic newline and flush rather than grow unbounded
                    if self.pending.len() >= LOG_READ_BUFFER {
                        let line = std::mem::take(&mut self.pending);
                        self.handle_line(&line, false);
                    }
                    return;
                }
            }
        }
    }

    fn handle_line(&mut self, line: &[u8], is_terminal: bool) {
        let store = if line.is_empty() {
            self.current.clone()
        } else {
            self.resolve_store(line)
        };

        if let Some(store) = &store {
            if !line.is_empty() {
                write_all(store, line);
                write_all(store, b"\n");
            }
            if is_terminal {
                store.mark_done(self.source);
            }
        }
        // Bytes with no resolvable store are discarded rather than
        // misattributed to another request

        if is_terminal {
            self.current = None;
        }
    }

    fn resolve_store(&mut self, line: &[u8]) -> Option<Arc<LogStatStore>> {
        if let Some(request_id) = parse_request_tag(line) {
            return match self.stores.get(request_id) {
                Some(store) => {
                    self.current = Some(store.clone());
                    Some(store)
                }
                None => {
                    // Tagged for a request we no longer (or do not yet) track
                    self.current = None;
                    None
                }
            };
        }
        // Untagged mid-block line: the current block's store, else the most
        // recently started request
        self.current.clone().or_else(|| self.stores.last())
    }
}

/// Extract the request ID from a `timestamp\trequestID\t...` line prefix
fn parse_request_tag(line: &[u8]) -> Option<&str> {
    let mut parts = line.splitn(3, |b| *b == b'\t');
    let timestamp = parts.next()?;
    let request_id = parts.next()?;
    parts.next()?; // the second tab must exist for this to be a tagged line

    if request_id.is_empty() || timestamp.is_empty() {
        return None;
    }
    if !timestamp.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    std::str::from_utf8(request_id).ok()
}

/// Push bytes into a store, retrying partial writes
fn write_all(store: &LogStatStore, mut data: &[u8]) {
    while !data.is_empty() {
        let n = store.write(data);
        if n == 0 {
            return;
        }
        data = &data[n..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(ids: &[&str]) -> (Arc<RuntimeLogStores>, Vec<Arc<LogStatStore>>) {
        let stores = Arc::new(RuntimeLogStores::new());
        let handles: Vec<_> = ids
            .iter()
            .map(|id| {
                let store = Arc::new(LogStatStore::new(*id));
                stores.insert(store.clone());
                store
            })
            .collect();
        (stores, handles)
    }

    #[test]
    fn test_parse_request_tag() {
        assert_eq!(
            parse_request_tag(b"1700000000000\treqid-1\thello"),
            Some("reqid-1")
        );
        assert_eq!(parse_request_tag(b"no tabs here"), None);
        assert_eq!(parse_request_tag(b"notatime\treqid-1\tx"), None);
        assert_eq!(parse_request_tag(b"1700\t\tx"), None);
    }

    #[test]
    fn test_demux_interleaved_requests() {
        let (stores, handles) = setup(&["reqid-1", "reqid-2"]);
        let mut demux = LogDemux::new(LogSource::Stdout, stores);

        demux.feed(b"1700000000001\treqid-1\tfirst line\n");
        demux.feed(b"1700000000002\treqid-2\tother request\n");
        demux.feed(b"1700000000003\treqid-1\tsecond line\n");
        demux.feed(b"\x001700000000004\treqid-2\tlast\n\x00");

        let one = handles[0].contents();
        let two = handles[1].contents();
        let one = String::from_utf8(one).unwrap();
        let two = String::from_utf8(two).unwrap();

        assert_eq!(
            one,
            "1700000000001\treqid-1\tfirst line\n1700000000003\treqid-1\tsecond line\n"
        );
        assert_eq!(
            two,
            "1700000000002\treqid-2\tother request\n1700000000004\treqid-2\tlast\n"
        );
        assert!(handles[1].contents().ends_with(b"last\n"));
    }

    #[test]
    fn test_demux_split_across_reads() {
        let (stores, handles) = setup(&["reqid-1", "reqid-2"]);
        let mut demux = LogDemux::new(LogSource::Stdout, stores);

        let stream = b"1700000000001\treqid-1\talpha\n1700000000002\treqid-2\tbeta\n1700000000003\treqid-1\tgamma\n";
        // Feed one byte at a time to exercise every split point
        for byte in stream.iter() {
            demux.feed(std::slice::from_ref(byte));
        }

        let one = String::from_utf8(handles[0].contents()).unwrap();
        let two = String::from_utf8(handles[1].contents()).unwrap();
        assert_eq!(one.matches("alpha").count(), 1);
        assert_eq!(one.matches("gamma").count(), 1);
        assert!(!one.contains("beta"));
        assert_eq!(two, "1700000000002\treqid-2\tbeta\n");
    }

    #[test]
    fn test_nul_marks_request_output_done() {
        let (stores, handles) = setup(&["reqid-1"]);
        let mut demux = LogDemux::new(LogSource::Stdout, stores);

        demux.feed(b"1700000000001\treqid-1\tbye\x00");
        assert!(handles[0].contents().ends_with(b"bye\n"));
        // Only stdout is done, stderr has not reported
        assert!(!handles[0].is_done());
        handles[0].mark_done(LogSource::Stderr);
        assert!(handles[0].is_done());
    }

    #[test]
    fn test_untagged_lines_fall_back_to_last_store() {
        let (stores, handles) = setup(&["reqid-1"]);
        let mut demux = LogDemux::new(LogSource::Stderr, stores);

        demux.feed(b"plain stderr with no tag\n");
        let contents = String::from_utf8(handles[0].contents()).unwrap();
        assert_eq!(contents, "plain stderr with no tag\n");
    }

    #[test]
    fn test_unknown_tag_discards_block() {
        let (stores, handles) = setup(&["reqid-1"]);
        let mut demux = LogDemux::new(LogSource::Stdout, stores);

        demux.feed(b"1700000000001\treqid-gone\tlost line\n");
        // A line tagged for an untracked request is dropped, never
        // misattributed to another request's store
        let contents = String::from_utf8(handles[0].contents()).unwrap();
        assert!(!contents.contains("lost line"));
    }

    #[test]
    fn test_forced_flush_on_saturated_buffer() {
        let (stores, handles) = setup(&["reqid-1"]);
        let mut demux = LogDemux::new(LogSource::Stdout, stores);

        // One giant write with no newline at all
        let big = vec![b'a'; LOG_READ_BUFFER + 10];
        demux.feed(&big);
        // A synthetic newline flush keeps the buffer bounded
        let contents = handles[0].contents();
        assert!(contents.len() >= LOG_READ_BUFFER);

        demux.feed(b"tail\n");
        let contents = handles[0].contents();
        assert!(String::from_utf8(contents).unwrap().ends_with("tail\n"));
    }
}
