use std::io;

// Buffer sizes must be a multiple of the increment.
const BUF_SIZE_INCREMENT: usize = 1024;

/// A fixed-capacity buffered FIFO byte queue. Data is appended at the tail
/// and consumed from the head; consumed bytes are compacted away so the
/// writable region is always the contiguous span after the tail.
pub struct Buffer {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
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

        Buffer {
            data: vec![0u8; size].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Total capacity of the buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Consume `count` bytes from the head, compacting the remainder to the
    /// front of the storage.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        debug_assert!(self.head + count <= self.tail);

        self.head += count;

        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        } else if self.head > 0 {
            self.data.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.head = 0;
        }
    }

    /// Advance the tail over bytes produced into the write slice.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        debug_assert!(self.tail + count <= self.data.len());
        self.tail += count;
    }

    /// Slice containing data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    #[inline]
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Slice containing free capacity to be written.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.tail..]
    }

    /// Write the contents of the buffer to the supplied writer, advancing the
    /// read offset. Returns the total written once the buffer is empty; a
    /// would-block error propagates out with the cursor already advanced over
    /// everything the writer took.
    #[inline]
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.len();

        while self.len() > 0 {
            let write_count = writer.write(self.read_slice())?;

            if write_count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.move_head(write_count);
        }

        Ok(orig_len)
    }

    /// Read in data from the supplied reader to the buffer. Returns `Ok` only
    /// when the reader reports end of stream; a would-block error propagates
    /// out, and filling the buffer to capacity is an overrun error.
    #[inline]
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let orig_capacity = self.free_capacity();

        while self.len() < self.capacity() {
            let read_count = reader.read(self.write_slice())?;

            if read_count == 0 {
                return Ok(orig_capacity - self.free_capacity());
            }

            self.move_tail(read_count);
        }

        Err(io::Error::new(io::ErrorKind::Other, "Buffer overrun"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;
    use std::io::Cursor;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        pub fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }

        pub fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
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

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            unimplemented!()
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..BUF_SIZE_INCREMENT / 2).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        let result = buffer.ingress(&mut channel);

        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(buffer.len(), mock_data.len());
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        channel.clear();
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.len(), 0);
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        let mut zero_vec = vec![];

        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        // The buffer has to have at least some data to trigger the zero write error
        buffer.write_slice()[0] = 1;
        buffer.move_tail(1);

        let result = buffer.egress(&mut zero_vec[..]);

        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_ingress_buffer_overrun() {
        let mock_data: Vec<_> = (0..BUF_SIZE_INCREMENT * 2).map(|item| item as u8).collect();

        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        let result = buffer.ingress(&mock_data[..]);

        assert!(result.is_err());

        let err = result.err().unwrap();

        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert_eq!(err.to_string(), "Buffer overrun")
    }

    #[test]
    fn test_ingress_eof_reports_received() {
        let mut cursor = Cursor::new(vec![1, 2, 3]);
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        let received = buffer.ingress(&mut cursor).unwrap();

        assert_eq!(received, 3);
        assert_eq!(buffer.read_slice(), &[1, 2, 3]);

        let mut sink = Cursor::new(Vec::<u8>::new());

        buffer.egress(&mut sink).unwrap();

        assert!(buffer.is_empty());
        assert_eq!(&sink.get_ref()[..], &[1, 2, 3]);
    }

    #[test]
    fn test_partial_consume_compacts() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        buffer.write_slice()[..5].copy_from_slice(b"ab\r\nc");
        buffer.move_tail(5);

        buffer.move_head(4);

        assert_eq!(buffer.read_slice(), b"c");
        assert_eq!(buffer.free_capacity(), BUF_SIZE_INCREMENT - 1);
        // The writable region starts right after the compacted remainder.
        assert_eq!(buffer.write_slice().len(), BUF_SIZE_INCREMENT - 1);
    }

    #[test]
    #[should_panic(expected = "Buffer size must be divisible by 1024, got 1000")]
    fn test_fail_on_incorrect_increment() {
        let _ = Buffer::new(1000);
    }
}
