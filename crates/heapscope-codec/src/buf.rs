//! Bounded little-endian byte cursors.
//!
//! [`WriteBuf`] owns a fixed window and signals `Overflow(pos)` when an
//! operation would run past its end; [`ReadBuf`] borrows a window and
//! signals `Underflow(pos)`. Both advance their position on every
//! operation.
//!
//! The variable-length integer (`vint`) is a single tag byte: values
//! 0..=252 carry the payload in-band, 253/254/255 announce a following
//! little-endian `u16`/`u32`/`u64`.

use heapscope_error::{HeapscopeError, Result};

const VINT_U16: u8 = 253;
const VINT_U32: u8 = 254;
const VINT_U64: u8 = 255;

/// A bounded write cursor over an owned byte window.
#[derive(Debug)]
pub struct WriteBuf {
    bytes: Vec<u8>,
    pos: usize,
    pos_end: usize,
}

impl WriteBuf {
    /// A zeroed window of `len` bytes with the cursor at 0.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
            pos: 0,
            pos_end: len,
        }
    }

    /// Current cursor position.
    #[must_use]
    pub const fn pos(&self) -> usize {
        self.pos
    }

    /// Bytes still writable before `pos_end`.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.pos_end - self.pos
    }

    /// Current end bound.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.pos_end
    }

    /// Tighten (or restore) the end bound. Used to enforce per-event size
    /// caps: the caller saves `end()`, clamps, encodes, then restores.
    ///
    /// # Panics
    /// If `end` exceeds the underlying window.
    pub fn set_end(&mut self, end: usize) {
        assert!(end <= self.bytes.len(), "end bound outside window");
        self.pos_end = end;
    }

    /// Everything written so far.
    #[must_use]
    pub fn written(&self) -> &[u8] {
        &self.bytes[..self.pos]
    }

    /// Rewind to an earlier position (aborting a partially written event).
    ///
    /// # Panics
    /// If `pos` is ahead of the cursor.
    pub fn rewind_to(&mut self, pos: usize) {
        assert!(pos <= self.pos, "rewind target ahead of cursor");
        self.pos = pos;
    }

    /// Reset to an empty window of the same size.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.pos_end = self.bytes.len();
    }

    fn claim(&mut self, n: usize) -> Result<&mut [u8]> {
        if self.pos + n > self.pos_end {
            return Err(HeapscopeError::Overflow { pos: self.pos });
        }
        let slice = &mut self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn put_u8(&mut self, v: u8) -> Result<()> {
        self.claim(1)?[0] = v;
        Ok(())
    }

    pub fn put_u16(&mut self, v: u16) -> Result<()> {
        self.claim(2)?.copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    pub fn put_u32(&mut self, v: u32) -> Result<()> {
        self.claim(4)?.copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    pub fn put_u64(&mut self, v: u64) -> Result<()> {
        self.claim(8)?.copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    /// Write a variable-length integer with the smallest encoding.
    pub fn put_vint(&mut self, v: u64) -> Result<()> {
        if v < u64::from(VINT_U16) {
            #[allow(clippy::cast_possible_truncation)]
            self.put_u8(v as u8)
        } else if v <= u64::from(u16::MAX) {
            self.put_u8(VINT_U16)?;
            #[allow(clippy::cast_possible_truncation)]
            self.put_u16(v as u16)
        } else if v <= u64::from(u32::MAX) {
            self.put_u8(VINT_U32)?;
            #[allow(clippy::cast_possible_truncation)]
            self.put_u32(v as u32)
        } else {
            self.put_u8(VINT_U64)?;
            self.put_u64(v)
        }
    }

    /// Write a NUL-terminated string. The string must not contain NUL.
    pub fn put_str(&mut self, s: &str) -> Result<()> {
        let dst = self.claim(s.len() + 1)?;
        dst[..s.len()].copy_from_slice(s.as_bytes());
        dst[s.len()] = 0;
        Ok(())
    }

    /// Overwrite two bytes at an already-written position (backpatching).
    pub fn patch_u16(&mut self, at: usize, v: u16) -> Result<()> {
        self.patch(at, &v.to_le_bytes())
    }

    /// Overwrite four bytes at an already-written position.
    pub fn patch_u32(&mut self, at: usize, v: u32) -> Result<()> {
        self.patch(at, &v.to_le_bytes())
    }

    /// Overwrite eight bytes at an already-written position.
    pub fn patch_u64(&mut self, at: usize, v: u64) -> Result<()> {
        self.patch(at, &v.to_le_bytes())
    }

    fn patch(&mut self, at: usize, src: &[u8]) -> Result<()> {
        if at + src.len() > self.pos {
            return Err(HeapscopeError::Overflow { pos: at });
        }
        self.bytes[at..at + src.len()].copy_from_slice(src);
        Ok(())
    }
}

/// A bounded read cursor over a borrowed byte window.
#[derive(Debug)]
pub struct ReadBuf<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ReadBuf<'a> {
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Current cursor position.
    #[must_use]
    pub const fn pos(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Whether the window is drained.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(HeapscopeError::Underflow { pos: self.pos });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    /// Read a variable-length integer.
    pub fn get_vint(&mut self) -> Result<u64> {
        match self.get_u8()? {
            VINT_U16 => Ok(u64::from(self.get_u16()?)),
            VINT_U32 => Ok(u64::from(self.get_u32()?)),
            VINT_U64 => self.get_u64(),
            tag => Ok(u64::from(tag)),
        }
    }

    /// Read a NUL-terminated UTF-8 string, consuming the terminator.
    pub fn get_str(&mut self) -> Result<&'a str> {
        let window = &self.bytes[self.pos..];
        let nul = window
            .iter()
            .position(|&b| b == 0)
            .ok_or(HeapscopeError::Underflow { pos: self.pos })?;
        let raw = &window[..nul];
        let s = std::str::from_utf8(raw)
            .map_err(|_| HeapscopeError::bad_format("string is not valid UTF-8"))?;
        self.pos += nul + 1;
        Ok(s)
    }

    /// Split off the next `len` bytes as their own cursor, advancing past
    /// them.
    pub fn sub_buf(&mut self, len: usize) -> Result<ReadBuf<'a>> {
        Ok(ReadBuf::new(self.take(len)?))
    }
}
