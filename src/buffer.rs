// Copyright 2020 Joyent, Inc.

//! A growable byte buffer with separate read and write cursors.
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |                   |     (CONTENT)    |                  |
//! +-------------------+------------------+------------------+
//! |                   |                  |                  |
//! 0      <=      read_index   <=   write_index    <=     capacity
//! ```
//!
//! A fixed prepend reserve is kept in front of the readable region whenever
//! the buffer is compacted, so a length header can be written after the
//! payload it describes has already been encoded.

use std::io::{self, IoSliceMut, Read, Write};

use byteorder::ByteOrder;
use thiserror::Error;

/// Default prepend reserve, enough for a 64-bit length prefix.
pub const CHEAP_PREPEND: usize = 8;

/// Default initial capacity of the writable region.
pub const INITIAL_SIZE: usize = 1024;

/// Size of the stack scratch area used by `read_from`.
const EXTRA_BUF_SIZE: usize = 65536;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("cannot retrieve {wanted} bytes, only {readable} readable")]
    Retrieve { wanted: usize, readable: usize },
    #[error("cannot prepend {wanted} bytes, only {prependable} prependable")]
    Prepend { wanted: usize, prependable: usize },
    #[error("cannot commit {wanted} written bytes, only {writable} writable")]
    Commit { wanted: usize, writable: usize },
}

/// Placement of the cursors after making room for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub capacity: usize,
    pub read_index: usize,
    pub write_index: usize,
}

/// Decide how to make `needed` bytes writable.
///
/// Returns the current layout unchanged when the bytes already fit, a layout
/// with the readable bytes slid back to `reserve` when reclaiming prependable
/// space is enough, and otherwise a larger capacity holding the readable
/// bytes at `reserve`. Capacity at least doubles on reallocation.
pub fn plan_growth(
    capacity: usize,
    read_index: usize,
    write_index: usize,
    reserve: usize,
    needed: usize,
) -> Layout {
    let readable = write_index - read_index;
    let writable = capacity - write_index;

    if writable >= needed {
        return Layout {
            capacity,
            read_index,
            write_index,
        };
    }

    let reclaimable = read_index.saturating_sub(reserve);
    if writable + reclaimable >= needed {
        return Layout {
            capacity,
            read_index: reserve,
            write_index: reserve + readable,
        };
    }

    let capacity = (reserve + readable + needed).max(capacity * 2);
    Layout {
        capacity,
        read_index: reserve,
        write_index: reserve + readable,
    }
}

#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    read_index: usize,
    write_index: usize,
    reserve: usize,
}

macro_rules! ordered_int_accessors {
    ($ty:ty, $len:expr, $write:ident, $read:ident,
     $append:ident, $prepend:ident, $peek:ident, $take:ident) => {
        pub fn $append<B: ByteOrder>(&mut self, x: $ty) {
            let mut raw = [0u8; $len];
            B::$write(&mut raw, x);
            self.append(&raw);
        }

        pub fn $prepend<B: ByteOrder>(&mut self, x: $ty) -> Result<(), RangeError> {
            let mut raw = [0u8; $len];
            B::$write(&mut raw, x);
            self.prepend(&raw)
        }

        pub fn $peek<B: ByteOrder>(&self) -> Result<$ty, RangeError> {
            self.check_readable($len)?;
            Ok(B::$read(&self.peek()[..$len]))
        }

        pub fn $take<B: ByteOrder>(&mut self) -> Result<$ty, RangeError> {
            let x = self.$peek::<B>()?;
            self.retrieve($len)?;
            Ok(x)
        }
    };
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_reserve(CHEAP_PREPEND, INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer::with_reserve(CHEAP_PREPEND, initial)
    }

    /// Create a buffer keeping `reserve` bytes of prepend space in front of
    /// an `initial` sized writable region.
    pub fn with_reserve(reserve: usize, initial: usize) -> Buffer {
        Buffer {
            buf: vec![0; reserve + initial],
            read_index: reserve,
            write_index: reserve,
            reserve,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_index == self.write_index
    }

    /// The readable region. Does not move the read cursor.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_index..self.write_index]
    }

    pub fn retrieve(&mut self, n: usize) -> Result<(), RangeError> {
        self.check_readable(n)?;
        if n < self.readable_bytes() {
            self.read_index += n;
        } else {
            self.retrieve_all();
        }
        Ok(())
    }

    /// Retrieve everything before `marker`, an offset into `peek()` such as
    /// the one returned by `find_crlf`.
    pub fn retrieve_until(&mut self, marker: usize) -> Result<(), RangeError> {
        self.retrieve(marker)
    }

    pub fn retrieve_all(&mut self) {
        self.read_index = self.reserve;
        self.write_index = self.reserve;
    }

    /// Copy out and retrieve `n` readable bytes.
    pub fn retrieve_as_vec(&mut self, n: usize) -> Result<Vec<u8>, RangeError> {
        self.check_readable(n)?;
        let out = self.peek()[..n].to_vec();
        self.retrieve(n)?;
        Ok(out)
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let end = self.write_index + data.len();
        self.buf[self.write_index..end].copy_from_slice(data);
        self.write_index = end;
    }

    /// Write `data` immediately in front of the readable region.
    pub fn prepend(&mut self, data: &[u8]) -> Result<(), RangeError> {
        if data.len() > self.prependable_bytes() {
            return Err(RangeError::Prepend {
                wanted: data.len(),
                prependable: self.prependable_bytes(),
            });
        }
        let start = self.read_index - data.len();
        self.buf[start..self.read_index].copy_from_slice(data);
        self.read_index = start;
        Ok(())
    }

    /// Make room for at least `n` bytes past the write cursor.
    pub fn ensure_writable(&mut self, n: usize) {
        let layout = plan_growth(
            self.buf.len(),
            self.read_index,
            self.write_index,
            self.reserve,
            n,
        );
        self.relayout(layout);
    }

    /// The writable region; commit what was filled with `has_written`.
    pub fn begin_write(&mut self) -> &mut [u8] {
        &mut self.buf[self.write_index..]
    }

    pub fn has_written(&mut self, n: usize) -> Result<(), RangeError> {
        if n > self.writable_bytes() {
            return Err(RangeError::Commit {
                wanted: n,
                writable: self.writable_bytes(),
            });
        }
        self.write_index += n;
        Ok(())
    }

    /// Drop the last `n` appended bytes.
    pub fn unwrite(&mut self, n: usize) -> Result<(), RangeError> {
        self.check_readable(n)?;
        self.write_index -= n;
        Ok(())
    }

    pub fn append_u8(&mut self, x: u8) {
        self.append(&[x]);
    }

    pub fn append_i8(&mut self, x: i8) {
        self.append(&x.to_be_bytes());
    }

    pub fn prepend_u8(&mut self, x: u8) -> Result<(), RangeError> {
        self.prepend(&[x])
    }

    pub fn prepend_i8(&mut self, x: i8) -> Result<(), RangeError> {
        self.prepend(&x.to_be_bytes())
    }

    pub fn peek_u8(&self) -> Result<u8, RangeError> {
        self.check_readable(1)?;
        Ok(self.peek()[0])
    }

    pub fn peek_i8(&self) -> Result<i8, RangeError> {
        Ok(self.peek_u8()? as i8)
    }

    pub fn read_u8(&mut self) -> Result<u8, RangeError> {
        let x = self.peek_u8()?;
        self.retrieve(1)?;
        Ok(x)
    }

    pub fn read_i8(&mut self) -> Result<i8, RangeError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn retrieve_int8(&mut self) -> Result<(), RangeError> {
        self.retrieve(1)
    }

    ordered_int_accessors!(u16, 2, write_u16, read_u16,
        append_u16, prepend_u16, peek_u16, read_u16);
    ordered_int_accessors!(u32, 4, write_u32, read_u32,
        append_u32, prepend_u32, peek_u32, read_u32);
    ordered_int_accessors!(u64, 8, write_u64, read_u64,
        append_u64, prepend_u64, peek_u64, read_u64);
    ordered_int_accessors!(i16, 2, write_i16, read_i16,
        append_i16, prepend_i16, peek_i16, read_i16);
    ordered_int_accessors!(i32, 4, write_i32, read_i32,
        append_i32, prepend_i32, peek_i32, read_i32);
    ordered_int_accessors!(i64, 8, write_i64, read_i64,
        append_i64, prepend_i64, peek_i64, read_i64);

    pub fn retrieve_int16(&mut self) -> Result<(), RangeError> {
        self.retrieve(2)
    }

    pub fn retrieve_int32(&mut self) -> Result<(), RangeError> {
        self.retrieve(4)
    }

    pub fn retrieve_int64(&mut self) -> Result<(), RangeError> {
        self.retrieve(8)
    }

    /// Offset of the first `\r\n` in the readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// Offset of the first `\n` in the readable region.
    pub fn find_eol(&self) -> Option<usize> {
        self.peek().iter().position(|&b| b == b'\n')
    }

    /// Reallocate to the prepend reserve plus the readable bytes plus
    /// `reserve` writable bytes.
    pub fn shrink(&mut self, reserve: usize) {
        let readable = self.readable_bytes();
        let mut buf = vec![0; self.reserve + readable + reserve];
        buf[self.reserve..self.reserve + readable].copy_from_slice(self.peek());
        self.buf = buf;
        self.read_index = self.reserve;
        self.write_index = self.reserve + readable;
    }

    /// Perform one read from `src` straight into the buffer.
    ///
    /// The writable region and a stack scratch area are handed to a single
    /// vectored read, so a large receive queue can be drained without growing
    /// the buffer up front. Bytes that landed in the scratch area are appended
    /// afterwards. `Ok(0)` means the peer shut down its side.
    pub fn read_from<R: Read + ?Sized>(&mut self, src: &mut R) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();
        let n = {
            let (_, tail) = self.buf.split_at_mut(self.write_index);
            if writable < EXTRA_BUF_SIZE {
                let mut iov = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra)];
                src.read_vectored(&mut iov)?
            } else {
                src.read(tail)?
            }
        };

        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    fn check_readable(&self, n: usize) -> Result<(), RangeError> {
        if n > self.readable_bytes() {
            Err(RangeError::Retrieve {
                wanted: n,
                readable: self.readable_bytes(),
            })
        } else {
            Ok(())
        }
    }

    fn relayout(&mut self, layout: Layout) {
        let readable = self.readable_bytes();
        if layout.capacity != self.buf.len() {
            let mut buf = vec![0; layout.capacity];
            buf[layout.read_index..layout.read_index + readable]
                .copy_from_slice(self.peek());
            self.buf = buf;
        } else if layout.read_index != self.read_index {
            self.buf
                .copy_within(self.read_index..self.write_index, layout.read_index);
        }
        self.read_index = layout.read_index;
        self.write_index = layout.write_index;
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Write for Buffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.append(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
