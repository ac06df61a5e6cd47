use std::io;

/// A fixed-capacity FIFO byte buffer. Data is appended at the tail and
/// consumed from the head; the backing storage is compacted when the
/// write cursor reaches the end.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    tail: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        Buffer {
            data: vec![0; size],
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

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.data.len() - self.len()
    }

    /// Consume `count` bytes from the head.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        self.head += count;
        debug_assert!(self.head <= self.tail);

        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Commit `count` bytes previously written into `write_slice`.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        self.tail += count;
        debug_assert!(self.tail <= self.data.len());
    }

    /// Slice containing buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Slice containing free capacity to be written. Compacts first so
    /// the full free capacity is reachable.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        self.compact();
        &mut self.data[self.tail..]
    }

    #[inline]
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Read from the supplied reader until it would block, hits its end,
    /// or the buffer is full. A return of zero with free capacity left
    /// is how callers observe peer shutdown on a readable socket.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut total = 0usize;

        while self.free_capacity() > 0 {
            match reader.read(self.write_slice()) {
                Ok(0) => return Ok(total),
                Ok(count) => {
                    self.move_tail(count);
                    total += count;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }

    /// Write buffered data to the supplied writer until it would block or
    /// the buffer drains.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut total = 0usize;

        while !self.is_empty() {
            match writer.write(self.read_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.move_head(count);
                    total += count;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }

    #[inline]
    fn compact(&mut self) {
        if self.head > 0 {
            self.data.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.head = 0;
        }
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
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }

        fn clear(&mut self) {
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
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..2048).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::new(4096);

        let count = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        channel.clear();
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert!(buffer.is_empty());
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn test_ingress_stops_when_full() {
        let mock_data = vec![7u8; 100];
        let mut channel = MockChannel::new(mock_data, 10, 0);

        let mut buffer = Buffer::new(64);

        let count = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, 64);
        assert_eq!(buffer.free_capacity(), 0);
    }

    #[test]
    fn test_ingress_zero_on_eof() {
        let mut buffer = Buffer::new(64);

        assert_eq!(buffer.ingress(io::empty()).unwrap(), 0);
        assert_eq!(buffer.free_capacity(), 64);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        let mut sink = [0u8; 0];
        let mut buffer = Buffer::new(64);

        buffer.write_slice()[0] = 1;
        buffer.move_tail(1);

        let result = buffer.egress(&mut sink[..]);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_compaction_recovers_capacity() {
        let mut buffer = Buffer::new(8);

        buffer.ingress(Cursor::new(vec![1, 2, 3, 4, 5, 6, 7, 8])).ok();
        buffer.move_head(6);

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.write_slice().len(), 6);

        buffer.write_slice()[..2].copy_from_slice(&[9, 10]);
        buffer.move_tail(2);

        assert_eq!(buffer.read_slice(), &[7, 8, 9, 10]);
    }

    #[test]
    fn test_no_err() {
        let mut cursor = Cursor::new(vec![1, 2, 3]);
        let mut buffer = Buffer::new(64);

        buffer.ingress(&mut cursor).unwrap();

        assert_eq!(buffer.read_slice(), &[1, 2, 3]);

        let mut out = Vec::new();

        buffer.egress(&mut out).unwrap();

        assert!(buffer.is_empty());
        assert_eq!(&out[..], &[1, 2, 3]);
    }
}
