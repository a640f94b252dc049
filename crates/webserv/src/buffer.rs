// src/buffer.rs
use crate::syscalls;
use std::io;
use std::os::fd::RawFd;

const DEFAULT_CAPACITY: usize = 1024;
const SCRATCH_SIZE: usize = 65536;

/// Growable byte buffer with independent read and write cursors.
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0      <=       read_pos    <=    write_pos    <=     capacity
/// ```
///
/// The backing storage never shrinks. When a write needs more room than the
/// writable tail offers, readable bytes are first shifted back to offset 0;
/// the allocation only grows if that still is not enough.
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// The readable region.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Mark `len` readable bytes as consumed.
    pub fn retrieve(&mut self, len: usize) {
        debug_assert!(
            len <= self.readable_bytes(),
            "retrieve({}) past readable region ({})",
            len,
            self.readable_bytes()
        );
        let len = len.min(self.readable_bytes());
        self.read_pos += len;
        if self.read_pos == self.write_pos {
            // Nothing left to read: rewind so the whole allocation is writable again.
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Consume everything up to `offset` bytes past the read cursor.
    pub fn retrieve_until(&mut self, offset: usize) {
        self.retrieve(offset);
    }

    pub fn retrieve_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    #[inline]
    fn has_written(&mut self, len: usize) {
        debug_assert!(len <= self.writable_bytes());
        self.write_pos += len;
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len {
            self.buf.resize(self.write_pos + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }

    /// Scatter-read from `fd` into the writable tail plus a 64 KiB stack scratch
    /// area, so a single syscall can take more than the tail currently holds.
    ///
    /// `Ok(0)` means the peer shut down its side.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let writable = self.writable_bytes();
        let n = {
            let tail = &mut self.buf[self.write_pos..];
            syscalls::readv(fd, &mut [tail, &mut scratch[..]])?
        };
        if n <= writable {
            self.has_written(n);
        } else {
            self.write_pos = self.buf.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable region to `fd` once. Whatever the kernel did not
    /// take stays buffered for the next write-readiness event.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = syscalls::write_nonblocking(fd, self.peek())?;
        self.retrieve(n);
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl io::Write for Buffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.append(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
