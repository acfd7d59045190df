use std::fmt;

use bytes::BytesMut;

/// Left padding is kept at a multiple of this so prepended headers stay
/// reasonably aligned.
const PAD_ALIGN: usize = 16;

/// Capacities round up to whole cache lines.
const CACHE_LINE: usize = 64;

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// A length-tracked byte region with reserved space on both sides
///
/// A `ShiftBuf` keeps its payload at a movable cursor inside a fixed
/// allocation, so protocol layers can prepend headers into the left reserve
/// and append into the right spare without copying the payload. Growth only
/// happens when an operation outruns the reserves, and it never disturbs the
/// logical content: after any `reserve`/`prepend`, `as_slice` still yields
/// the same bytes.
///
/// Buffers are owned by exactly one holder at a time; handing one to the next
/// pipeline stage is a move. Pool-managed buffers are recycled with
/// [`reset`](ShiftBuf::reset) rather than dropped.
#[derive(Clone)]
pub struct ShiftBuf {
    /// Backing storage, always initialized to its full length
    storage: BytesMut,
    /// Offset of the first payload byte
    start: usize,
    /// Payload length
    len: usize,
    /// Configured left reserve; prepends within it never reallocate
    left_pad: usize,
}

impl ShiftBuf {
    /// Create a buffer with at least `min_capacity` bytes of payload space
    /// and no left reserve
    pub fn new(min_capacity: usize) -> Self {
        Self::with_padding(min_capacity, 0)
    }

    /// Create a buffer with at least `min_capacity` bytes of payload space
    /// after a `left_pad`-byte header reserve
    ///
    /// The pad rounds up to a multiple of 16 and the payload capacity to a
    /// whole cache line.
    pub fn with_padding(min_capacity: usize, left_pad: usize) -> Self {
        let left_pad = round_up(left_pad, PAD_ALIGN);
        let capacity = if min_capacity == 0 {
            0
        } else {
            round_up(min_capacity.max(CACHE_LINE), CACHE_LINE)
        };
        Self {
            storage: BytesMut::zeroed(capacity + left_pad),
            start: left_pad,
            len: 0,
            left_pad,
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no payload
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total allocation size, including both reserves
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Allocation size excluding the configured left reserve
    ///
    /// This is the size-class identity a pool buckets by.
    pub fn data_capacity(&self) -> usize {
        self.storage.len() - self.left_pad
    }

    /// Configured left reserve
    pub fn left_pad(&self) -> usize {
        self.left_pad
    }

    /// Bytes currently available in front of the payload
    pub fn left_space(&self) -> usize {
        self.start
    }

    /// Bytes currently available behind the payload
    pub fn right_space(&self) -> usize {
        self.storage.len() - self.start - self.len
    }

    /// The payload
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    /// The payload, mutably
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.start + self.len]
    }

    /// The uninitialized-from-the-caller's-view tail, for external fills
    /// such as socket reads; commit with [`add_len`](ShiftBuf::add_len)
    pub fn unwritten_mut(&mut self) -> &mut [u8] {
        let at = self.start + self.len;
        &mut self.storage[at..]
    }

    /// Extend the payload over `n` bytes previously written through
    /// [`unwritten_mut`](ShiftBuf::unwritten_mut)
    pub fn add_len(&mut self, n: usize) {
        assert!(n <= self.right_space(), "add_len past buffer capacity");
        self.len += n;
    }

    /// Set the payload length directly, without moving the cursor
    ///
    /// Bytes between the old and new length keep whatever the storage held.
    pub fn set_len(&mut self, len: usize) {
        assert!(
            self.start + len <= self.storage.len(),
            "set_len past buffer capacity"
        );
        self.len = len;
    }

    /// Copy `data` in front of the payload
    ///
    /// Within the left reserve this moves only the cursor; beyond it the
    /// buffer grows and the payload shifts to open up room.
    pub fn prepend(&mut self, data: &[u8]) {
        if data.len() > self.start {
            self.grow_front(data.len() - self.start);
        }
        self.start -= data.len();
        self.len += data.len();
        let at = self.start;
        self.storage[at..at + data.len()].copy_from_slice(data);
    }

    /// Append `data`, growing the allocation on demand
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.reserve(data.len());
        let at = self.start + self.len;
        self.storage[at..at + data.len()].copy_from_slice(data);
        self.len += data.len();
    }

    /// Ensure at least `additional` bytes of right spare
    pub fn reserve(&mut self, additional: usize) {
        if additional <= self.right_space() {
            return;
        }
        let grow = round_up(additional - self.right_space(), CACHE_LINE);
        let mut storage = BytesMut::zeroed(self.storage.len() + grow);
        let at = self.start;
        storage[at..at + self.len].copy_from_slice(self.as_slice());
        self.storage = storage;
    }

    /// Drop `n` bytes from the front of the payload
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len, "consume past payload");
        self.start += n;
        self.len -= n;
    }

    /// Drop everything after the first `len` payload bytes
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }

    /// Move the first `n` payload bytes into a fresh buffer with the same
    /// padding configuration
    pub fn split_to(&mut self, n: usize) -> Self {
        assert!(n <= self.len, "split_to past payload");
        let mut front = Self::with_padding(self.data_capacity(), self.left_pad);
        front.extend_from_slice(&self.as_slice()[..n]);
        self.consume(n);
        front
    }

    /// Append another buffer's payload
    pub fn concat(&mut self, other: &Self) {
        self.extend_from_slice(other.as_slice());
    }

    /// Empty the buffer and restore the cursor to the configured left
    /// reserve, making it ready for pool reuse
    pub fn reset(&mut self) {
        self.start = self.left_pad;
        self.len = 0;
    }

    /// Open `need` extra bytes of front space by growing and shifting the
    /// payload right
    fn grow_front(&mut self, need: usize) {
        let delta = round_up(need, PAD_ALIGN);
        let mut storage = BytesMut::zeroed(self.storage.len() + delta);
        let at = self.start + delta;
        storage[at..at + self.len].copy_from_slice(self.as_slice());
        self.storage = storage;
        self.start += delta;
    }
}

impl fmt::Debug for ShiftBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShiftBuf")
            .field("len", &self.len)
            .field("capacity", &self.storage.len())
            .field("left_space", &self.start)
            .field("left_pad", &self.left_pad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_reserve_is_rounded() {
        let buf = ShiftBuf::with_padding(100, 5);
        assert_eq!(buf.left_pad(), 16);
        assert_eq!(buf.left_space(), 16);
        assert_eq!(buf.data_capacity() % CACHE_LINE, 0);
        assert!(buf.data_capacity() >= 100);
    }

    #[test]
    fn prepend_within_reserve_never_grows() {
        let mut buf = ShiftBuf::with_padding(64, 16);
        buf.extend_from_slice(b"payload");
        let cap = buf.capacity();
        for _ in 0..16 {
            buf.prepend(b"h");
        }
        assert_eq!(buf.capacity(), cap);
        assert_eq!(buf.left_space(), 0);
        assert_eq!(&buf.as_slice()[16..], b"payload");
    }

    #[test]
    fn prepend_past_reserve_grows_and_keeps_content() {
        let mut buf = ShiftBuf::with_padding(64, 16);
        buf.extend_from_slice(b"data");
        let cap = buf.capacity();
        buf.prepend(&[0xAA; 17]);
        assert!(buf.capacity() > cap);
        assert_eq!(buf.len(), 21);
        assert_eq!(&buf.as_slice()[..17], &[0xAA; 17]);
        assert_eq!(&buf.as_slice()[17..], b"data");
    }

    #[test]
    fn append_grows_on_demand() {
        let mut buf = ShiftBuf::new(64);
        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        buf.extend_from_slice(&data);
        assert_eq!(buf.as_slice(), &data[..]);
    }

    #[test]
    fn consume_and_split() {
        let mut buf = ShiftBuf::new(64);
        buf.extend_from_slice(b"hello world");
        buf.consume(6);
        assert_eq!(buf.as_slice(), b"world");

        let mut buf = ShiftBuf::with_padding(64, 32);
        buf.extend_from_slice(b"abcdef");
        let front = buf.split_to(2);
        assert_eq!(front.as_slice(), b"ab");
        assert_eq!(front.left_pad(), 32);
        assert_eq!(buf.as_slice(), b"cdef");
    }

    #[test]
    fn external_fill() {
        let mut buf = ShiftBuf::new(64);
        let spare = buf.unwritten_mut();
        spare[..4].copy_from_slice(b"ping");
        buf.add_len(4);
        assert_eq!(buf.as_slice(), b"ping");
    }

    #[test]
    fn reset_restores_reserve() {
        let mut buf = ShiftBuf::with_padding(64, 16);
        buf.extend_from_slice(b"xyz");
        buf.prepend(b"12");
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.left_space(), 16);
    }
}
