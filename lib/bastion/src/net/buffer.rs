use slice_deque::SliceDeque;
use std::io;

type ByteDeque = SliceDeque<u8>;

// Buffer size set to be a multiple of the virtual memory page mirroring unit.
const BUF_SIZE_INCREMENT: usize = 65536;

/// Outcome of draining a readable socket into the buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Ingress {
    /// Bytes appended to the buffer by this drain.
    pub received: usize,
    /// The reader signalled end-of-stream (the peer closed its end).
    pub closed: bool,
}

/// A contiguous FIFO byte queue for the inbound stream. Data is appended at
/// the tail as it arrives off the socket and consumed from the head as frames
/// are assembled.
pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        if size % BUF_SIZE_INCREMENT != 0 {
            panic!(
                "Buffer size must be divisible by {}, got {}",
                BUF_SIZE_INCREMENT, size
            );
        }

        let mut data = ByteDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Consume `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.data.len());
        unsafe { self.data.move_head(count as isize) }
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    #[inline]
    pub fn clear(&mut self) {
        unsafe { self.data.move_head(self.len() as isize) };
    }

    /// Drain the supplied reader into the buffer until it would block, the
    /// stream ends, or the buffer is full. `WouldBlock` and `Interrupted` are
    /// folded into a normal return; any other error is propagated.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<Ingress> {
        let mut received = 0;

        while self.data.len() < self.size {
            unsafe {
                match reader.read(self.data.tail_head_slice()) {
                    Ok(0) => return Ok(Ingress { received, closed: true }),
                    Ok(count) => {
                        self.data.move_tail(count as isize);
                        received += count;
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(Ingress { received, closed: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
    }

    impl MockChannel {
        pub fn new(data: Vec<u8>, chunk: usize) -> MockChannel {
            MockChannel { data, cursor: 0, chunk }
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    #[test]
    fn test_ingress_drains_to_would_block() {
        let mock_data: Vec<_> = (0..BUF_SIZE_INCREMENT / 2).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500);

        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        let outcome = buffer.ingress(&mut channel).unwrap();

        assert_eq!(outcome.received, mock_data.len());
        assert!(!outcome.closed);
        assert_eq!(buffer.read_slice(), &mock_data[..]);
    }

    #[test]
    fn test_ingress_reports_eof() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        // An exhausted cursor returns Ok(0), the end-of-stream signal.
        let outcome = buffer.ingress(io::Cursor::new(vec![1, 2, 3])).unwrap();

        assert!(outcome.closed);
        assert_eq!(outcome.received, 3);
        assert_eq!(buffer.read_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_ingress_stops_when_full() {
        let mock_data: Vec<_> = (0..BUF_SIZE_INCREMENT * 2).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data, 4096);

        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        let outcome = buffer.ingress(&mut channel).unwrap();

        assert_eq!(outcome.received, BUF_SIZE_INCREMENT);
        assert!(!outcome.closed);
        assert_eq!(buffer.free_capacity(), 0);
    }

    #[test]
    fn test_consume_advances_head() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        buffer.ingress(io::Cursor::new(vec![9, 8, 7, 6])).unwrap();

        buffer.consume(2);

        assert_eq!(buffer.read_slice(), &[7, 6]);
        assert_eq!(buffer.len(), 2);

        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    #[should_panic(expected = "Buffer size must be divisible by 65536, got 100000")]
    fn test_fail_on_incorrect_increment() {
        let _ = Buffer::new(100000);
    }
}
