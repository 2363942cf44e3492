//! Newline framing for text serial streams.
//!
//! [`LineFramer`] accumulates decoded text from arbitrary read chunks and yields complete
//! `\n`-terminated lines in arrival order. Each yielded line keeps its terminator.
//!
//! The buffer is unbounded unless a limit is set with [`LineFramer::with_max_line_bytes`].
//! Without a limit, a peer that never sends a newline grows the buffer indefinitely.

use crate::codec;

/// Stateful line framer for streaming data.
#[derive(Debug, Default)]
pub struct LineFramer {
    /// Decoded text not yet forming a complete line
    buffer: String,
    /// Trailing bytes of an incomplete UTF-8 sequence
    pending: Vec<u8>,
    /// Bound on the unterminated tail, in bytes
    max_line_bytes: Option<usize>,
}

impl LineFramer {
    /// Create an unbounded framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the unterminated tail to `limit` bytes.
    ///
    /// When a feed leaves a longer tail, the tail is discarded and the count is reported
    /// through [`Lines::discarded`].
    pub fn with_max_line_bytes(mut self, limit: usize) -> Self {
        self.max_line_bytes = Some(limit);
        self
    }

    /// The configured bound, if any.
    pub fn max_line_bytes(&self) -> Option<usize> {
        self.max_line_bytes
    }

    /// Feed raw bytes into the framer.
    ///
    /// Returns a lazy iterator over the complete lines now available. Lines are removed
    /// from the buffer as the iterator advances; callers that need the buffer free of
    /// newlines must exhaust it.
    pub fn feed(&mut self, data: &[u8]) -> Lines<'_> {
        self.pending.extend_from_slice(data);
        let (text, consumed) = codec::decode_partial(&self.pending);
        self.pending.drain(..consumed);
        self.buffer.push_str(&text);

        let discarded = self.enforce_limit();

        Lines {
            buffer: &mut self.buffer,
            discarded,
        }
    }

    /// Text received but not yet terminated.
    pub fn residual(&self) -> &str {
        &self.buffer
    }

    /// Bytes of an incomplete UTF-8 sequence awaiting the rest of the character.
    pub fn pending_bytes(&self) -> &[u8] {
        &self.pending
    }

    /// Flush any remaining buffered data as an unterminated line.
    ///
    /// Pending partial characters are decoded lossily.
    pub fn flush(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            let tail = codec::decode(&self.pending);
            self.pending.clear();
            self.buffer.push_str(&tail);
        }

        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    /// Drop an oversized unterminated tail. Returns the number of bytes dropped.
    fn enforce_limit(&mut self) -> usize {
        let Some(limit) = self.max_line_bytes else {
            return 0;
        };

        let tail_start = self.buffer.rfind('\n').map_or(0, |idx| idx + 1);
        let tail_len = self.buffer.len() - tail_start;
        if tail_len <= limit {
            return 0;
        }

        self.buffer.truncate(tail_start);
        let discarded = tail_len + self.pending.len();
        self.pending.clear();
        discarded
    }
}

/// Complete lines produced by one [`LineFramer::feed`] call.
#[derive(Debug)]
pub struct Lines<'a> {
    buffer: &'a mut String,
    discarded: usize,
}

impl Lines<'_> {
    /// Bytes dropped by this feed because the unterminated tail exceeded the bound.
    pub fn discarded(&self) -> usize {
        self.discarded
    }
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let idx = self.buffer.find('\n')?;
        Some(self.buffer.drain(..=idx).collect())
    }
}
