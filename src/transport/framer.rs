// Byte accumulator that turns a partially delivered stream into delimited frames.

use crate::constants::{DEFAULT_BUFFER_CAPACITY, LINE_DELIMITER};

/// Frames cut out of the buffer by one [`FrameBuffer::drain`] pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Drained {
    /// Complete messages, delimiter stripped, in stream order.
    pub frames: Vec<Vec<u8>>,
    /// Undelimited bytes thrown away because they filled the whole buffer.
    pub discarded: usize,
}

impl Drained {
    fn absorb(&mut self, other: Drained) {
        self.frames.extend(other.frames);
        self.discarded += other.discarded;
    }
}

/// Fixed-capacity receive buffer. `len` marks the end of unconsumed bytes and
/// always stays below `capacity`, so there is room for the next read.
pub struct FrameBuffer {
    buf: Box<[u8]>,
    len: usize,
    /// First position not yet searched for a delimiter.
    scanned: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }
}

impl FrameBuffer {
    /// Capacity is raised to the smallest value able to hold a one-byte
    /// message plus its delimiter.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(LINE_DELIMITER.len() + 1);
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            len: 0,
            scanned: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes received but not yet framed.
    pub fn pending(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free region to receive into; never empty.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.len..]
    }

    /// Account for `n` bytes written into [`FrameBuffer::spare_mut`].
    pub fn commit(&mut self, n: usize) {
        self.len = (self.len + n).min(self.capacity());
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.scanned = 0;
    }

    /// Cut every complete frame, then move the trailing partial frame to the
    /// front. A partial frame occupying the entire capacity can never be
    /// completed and is discarded.
    pub fn drain(&mut self) -> Drained {
        let delim = LINE_DELIMITER;
        let mut out = Drained::default();
        let mut start = 0;
        let mut search = self.scanned.max(start);

        while let Some(pos) = find(&self.buf[search..self.len], delim) {
            let end = search + pos;
            out.frames.push(self.buf[start..end].to_vec());
            start = end + delim.len();
            search = start;
        }

        let rest = self.len - start;
        if rest == self.capacity() {
            out.discarded = rest;
            self.clear();
            return out;
        }
        // A delimiter may straddle the end of what has arrived so far.
        let resume = self.len.saturating_sub(delim.len() - 1).max(start);
        self.buf.copy_within(start..self.len, 0);
        self.len = rest;
        self.scanned = resume - start;
        out
    }

    /// Copy `bytes` in, draining whenever the buffer fills up.
    pub fn push(&mut self, mut bytes: &[u8]) -> Drained {
        let mut out = Drained::default();
        loop {
            let spare = self.spare_mut();
            let n = spare.len().min(bytes.len());
            spare[..n].copy_from_slice(&bytes[..n]);
            self.commit(n);
            bytes = &bytes[n..];
            out.absorb(self.drain());
            if bytes.is_empty() {
                return out;
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
