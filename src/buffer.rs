//! Fixed-capacity byte buffer used for one direction of a tunnel. Bytes are
//! read from one socket into `[write_ptr, write_ptr+n)` and drained from
//! `[read_ptr, write_ptr)` into the other socket; the buffer never grows and
//! is never compacted in place, it's simply reset to empty once fully
//! drained.

pub const CAPACITY: usize = 8192;

pub struct Buffer {
    data: Box<[u8; CAPACITY]>,
    read_ptr: usize,
    write_ptr: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer {
            data: Box::new([0u8; CAPACITY]),
            read_ptr: 0,
            write_ptr: 0,
        }
    }

    /// Bytes available to write into the socket on the drain side.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_ptr..self.write_ptr]
    }

    /// Free space available at the tail for a fill read.
    pub fn writable_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.write_ptr..CAPACITY]
    }

    pub fn is_empty(&self) -> bool {
        self.read_ptr == self.write_ptr
    }

    pub fn is_full(&self) -> bool {
        self.write_ptr == CAPACITY
    }

    /// Record that `n` bytes were just filled at the tail.
    pub fn commit_write(&mut self, n: usize) {
        self.write_ptr += n;
        debug_assert!(self.write_ptr <= CAPACITY);
    }

    /// Record that `n` bytes were just drained from the head. Resets both
    /// cursors to zero once the buffer is fully drained so the next fill
    /// gets the whole capacity back.
    pub fn commit_read(&mut self, n: usize) {
        self.read_ptr += n;
        debug_assert!(self.read_ptr <= self.write_ptr);

        if self.read_ptr == self.write_ptr {
            self.read_ptr = 0;
            self.write_ptr = 0;
        }
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let buf = Buffer::new();
        assert!(buf.is_empty());
        assert!(!buf.is_full());
        assert_eq!(buf.readable().len(), 0);
    }

    #[test]
    fn fill_then_drain_resets_cursors() {
        let mut buf = Buffer::new();
        buf.writable_mut()[..5].copy_from_slice(b"hello");
        buf.commit_write(5);
        assert_eq!(buf.readable(), b"hello");

        buf.commit_read(5);
        assert!(buf.is_empty());
        assert_eq!(buf.writable_mut().len(), CAPACITY);
    }

    #[test]
    fn partial_drain_keeps_remainder() {
        let mut buf = Buffer::new();
        buf.writable_mut()[..5].copy_from_slice(b"hello");
        buf.commit_write(5);
        buf.commit_read(2);
        assert_eq!(buf.readable(), b"llo");
        assert!(!buf.is_empty());
    }

    #[test]
    fn fills_to_capacity() {
        let mut buf = Buffer::new();
        buf.commit_write(CAPACITY);
        assert!(buf.is_full());
        assert_eq!(buf.writable_mut().len(), 0);
    }
}
