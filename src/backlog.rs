//! Replication backlog.
//!
//! A bounded byte buffer holding the most recent replication stream,
//! addressed by absolute offsets. `start_offset` only ever moves forward
//! as old bytes are dropped; `tail_offset` grows with every append, and
//! `tail_offset - start_offset` always equals the buffered length.

/// Default backlog capacity.
pub const REPL_BACKLOG_CAP: usize = 4 * 1024 * 1024;

#[derive(Debug)]
pub struct ReplBacklog {
    buf: Vec<u8>,
    start_offset: i64,
    tail_offset: i64,
    cap: usize,
}

impl Default for ReplBacklog {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplBacklog {
    pub fn new() -> Self {
        Self::with_capacity(REPL_BACKLOG_CAP)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            start_offset: 0,
            tail_offset: 0,
            cap,
        }
    }

    /// Offset of the first byte still buffered.
    pub fn start_offset(&self) -> i64 {
        self.start_offset
    }

    /// Offset one past the last byte ever appended.
    pub fn tail_offset(&self) -> i64 {
        self.tail_offset
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append stream bytes, evicting from the front when over capacity.
    pub fn append(&mut self, data: &[u8]) {
        self.tail_offset += data.len() as i64;
        if self.buf.len() + data.len() <= self.cap {
            self.buf.extend_from_slice(data);
        } else if data.len() >= self.cap {
            // the new chunk alone fills the buffer; keep only its tail
            self.buf.clear();
            self.buf.extend_from_slice(&data[data.len() - self.cap..]);
        } else {
            let drop = self.buf.len() + data.len() - self.cap;
            self.buf.drain(..drop);
            self.buf.extend_from_slice(data);
        }
        self.start_offset = self.tail_offset - self.buf.len() as i64;
    }

    /// Buffered bytes from `offset` to the tail, or `None` when the
    /// offset has already been evicted (or never existed).
    pub fn slice_from(&self, offset: i64) -> Option<Vec<u8>> {
        if offset < self.start_offset || offset > self.tail_offset {
            return None;
        }
        let at = (offset - self.start_offset) as usize;
        Some(self.buf[at..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_within_capacity() {
        let mut backlog = ReplBacklog::with_capacity(16);
        backlog.append(b"abcd");
        backlog.append(b"efgh");
        assert_eq!(backlog.start_offset(), 0);
        assert_eq!(backlog.tail_offset(), 8);
        assert_eq!(backlog.slice_from(0).unwrap(), b"abcdefgh".to_vec());
        assert_eq!(backlog.slice_from(4).unwrap(), b"efgh".to_vec());
    }

    #[test]
    fn test_eviction_drops_oldest() {
        let mut backlog = ReplBacklog::with_capacity(8);
        backlog.append(b"abcd");
        backlog.append(b"efgh");
        backlog.append(b"ij");
        assert_eq!(backlog.tail_offset(), 10);
        assert_eq!(backlog.start_offset(), 2);
        assert_eq!(backlog.len(), 8);
        assert_eq!(backlog.slice_from(2).unwrap(), b"cdefghij".to_vec());
        assert!(backlog.slice_from(0).is_none());
        assert!(backlog.slice_from(1).is_none());
    }

    #[test]
    fn test_oversized_append_keeps_its_tail() {
        let mut backlog = ReplBacklog::with_capacity(4);
        backlog.append(b"0123456789");
        assert_eq!(backlog.tail_offset(), 10);
        assert_eq!(backlog.start_offset(), 6);
        assert_eq!(backlog.slice_from(6).unwrap(), b"6789".to_vec());
    }

    #[test]
    fn test_slice_at_tail_is_empty_not_none() {
        let mut backlog = ReplBacklog::with_capacity(8);
        backlog.append(b"abcd");
        let tail = backlog.tail_offset();
        assert_eq!(backlog.slice_from(tail).unwrap(), Vec::<u8>::new());
        assert!(backlog.slice_from(tail + 1).is_none());
    }

    #[test]
    fn test_offsets_are_monotonic() {
        let mut backlog = ReplBacklog::with_capacity(32);
        let mut last_tail = backlog.tail_offset();
        let mut last_start = backlog.start_offset();
        for i in 0..100 {
            backlog.append(format!("chunk-{i}").as_bytes());
            assert!(backlog.tail_offset() > last_tail);
            assert!(backlog.start_offset() >= last_start);
            assert_eq!(
                backlog.tail_offset() - backlog.start_offset(),
                backlog.len() as i64
            );
            last_tail = backlog.tail_offset();
            last_start = backlog.start_offset();
        }
    }
}
