use slice_deque::SliceDeque;
use std::io;

type ByteDeque = SliceDeque<u8>;

// Frames are at most 512 bytes, so buffers are sized in page increments.
const BUF_SIZE_INCREMENT: usize = 4096;

/// A fixed-capacity, double ended and buffered FIFO byte queue. Data is
/// appended at the tail and read from the head.
pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        if size == 0 || size % BUF_SIZE_INCREMENT != 0 {
            panic!(
                "Buffer size must be a non-zero multiple of {}, got {}",
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

    /// Advance the head, discarding consumed data.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    /// Advance the tail, committing written data.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        unsafe { self.data.move_tail(count as isize) }
    }

    /// Slice containing data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    #[inline]
    pub fn clear(&mut self) {
        unsafe { self.data.move_head(self.len() as isize) };
    }

    /// Slice containing free capacity to be written.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        let free = self.free_capacity();
        unsafe { &mut self.data.tail_head_slice()[..free] }
    }

    /// Write the contents of the buffer to the supplied writer, advancing the
    /// head past everything the writer accepted.
    #[inline]
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.data.len();

        while self.data.len() > 0 {
            let write_count = writer.write(&self.data)?;

            if write_count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.move_head(write_count);
        }

        Ok(orig_len - self.data.len())
    }

    /// Read data from the supplied reader into the buffer until the reader
    /// blocks, the reader is exhausted or the buffer is full. A reader that
    /// returns 0 bytes signals EOF, reported as `UnexpectedEof`. A full
    /// buffer is not an error; the bytes ingested so far are returned and the
    /// caller is expected to drain frames before reading on.
    #[inline]
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let orig_len = self.data.len();

        while self.data.len() < self.size {
            let free = self.size - self.data.len();

            unsafe {
                let read_count = reader.read(&mut self.data.tail_head_slice()[..free])?;

                if read_count == 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }

                self.data.move_tail(read_count as isize);
            }
        }

        Ok(self.data.len() - orig_len)
    }

    /// Mutable slice containing data.
    #[allow(dead_code)]
    #[inline]
    pub(crate) fn data_slice(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }
}
