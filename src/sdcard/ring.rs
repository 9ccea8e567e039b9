//! Receive buffer bookkeeping.
//!
//! The bus layer appends received bytes at the write cursor; the driver
//! consumes them at the parse cursor. Both cursors wrap at the capacity of
//! the buffer.
//!
//! The parse cursor is allowed to run ahead of bytes that have not arrived
//! yet (a command's response lands several bytes after the frame is queued),
//! but it is only ever *read* once the transfer that fills that position has
//! completed.

/// An index into a ring of `N` slots.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct RingCursor<const N: usize> {
    idx: usize,
}

impl<const N: usize> RingCursor<N> {
    /// A cursor at the origin.
    pub const fn new() -> RingCursor<N> {
        RingCursor { idx: 0 }
    }

    /// Where this cursor points. Always in `0..N`.
    pub const fn index(&self) -> usize {
        self.idx
    }

    /// Move forward by `n` slots, wrapping at `N`.
    pub fn advance(&mut self, n: usize) {
        self.idx = (self.idx + n % N) % N;
    }

    /// Go back to the origin.
    pub fn reset(&mut self) {
        self.idx = 0;
    }

    /// How many slots `self` has to advance to reach `other`.
    pub const fn distance_to(&self, other: &RingCursor<N>) -> usize {
        (other.idx + N - self.idx) % N
    }
}

/// A fixed-capacity receive buffer with independent write and parse cursors.
#[derive(Debug, Clone)]
pub struct RxBuffer<const N: usize> {
    data: [u8; N],
    write: RingCursor<N>,
    parse: RingCursor<N>,
}

impl<const N: usize> RxBuffer<N> {
    /// An empty, zeroed buffer.
    pub const fn new() -> RxBuffer<N> {
        RxBuffer {
            data: [0; N],
            write: RingCursor::new(),
            parse: RingCursor::new(),
        }
    }

    /// Store a received byte at the write cursor.
    pub fn push(&mut self, byte: u8) {
        self.data[self.write.index()] = byte;
        self.write.advance(1);
    }

    /// Store some received bytes.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.push(*b);
        }
    }

    /// The byte under the parse cursor.
    pub fn current(&self) -> u8 {
        self.peek(0)
    }

    /// The byte `offset` places after the parse cursor.
    pub fn peek(&self, offset: usize) -> u8 {
        let mut at = self.parse;
        at.advance(offset);
        self.data[at.index()]
    }

    /// Consume `n` bytes.
    pub fn advance(&mut self, n: usize) {
        self.parse.advance(n);
    }

    /// Discard everything not yet consumed.
    pub fn flush(&mut self) {
        self.parse = self.write;
    }

    /// Put both cursors back to the origin, so that the next bytes to arrive
    /// start at the beginning of the buffer.
    pub fn rewind(&mut self) {
        self.write.reset();
        self.parse.reset();
    }

    /// Zero the contents and rewind.
    pub fn clear(&mut self) {
        self.data = [0; N];
        self.rewind();
    }

    /// Number of bytes received but not consumed.
    pub fn unread(&self) -> usize {
        self.parse.distance_to(&self.write)
    }

    /// The write cursor.
    pub fn write_cursor(&self) -> RingCursor<N> {
        self.write
    }

    /// The parse cursor.
    pub fn parse_cursor(&self) -> RingCursor<N> {
        self.parse
    }

    /// The raw contents, from the origin.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl<const N: usize> Default for RxBuffer<N> {
    fn default() -> Self {
        RxBuffer::new()
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
