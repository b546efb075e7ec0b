// Positioned byte stream over mapped trace files, plus its writing twin

use super::types::PackedLayout;
use memmap2::Mmap;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// Memory-map a trace file for reading.
pub fn map_file(path: &Path) -> io::Result<Mmap> {
    let file = File::open(path)?;
    // SAFETY: trace files are not modified while being read
    unsafe { Mmap::map(&file) }
}

/// Seekable reader over an in-memory or memory-mapped byte buffer.
///
/// Reads never fail: a read running past the end returns `None` and raises
/// the end-of-stream flag, which stays up until the next seek.
pub struct ByteStream<B> {
    buf: B,
    pos: usize,
    eof: bool,
}

impl<B: AsRef<[u8]>> ByteStream<B> {
    pub fn new(buf: B) -> Self {
        Self {
            buf,
            pos: 0,
            eof: false,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pos(&self) -> u64 {
        self.pos as u64
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Move to an absolute offset. Offsets past the end leave the stream at
    /// end-of-stream.
    pub fn seek(&mut self, offset: u64) {
        let len = self.len();
        match usize::try_from(offset) {
            Ok(offset) if offset <= len => {
                self.pos = offset;
                self.eof = false;
            }
            _ => {
                self.pos = len;
                self.eof = true;
            }
        }
    }

    /// Move `back` bytes before the end. Going before the start leaves the
    /// stream at end-of-stream.
    pub fn seek_from_end(&mut self, back: u64) {
        let len = self.len() as u64;
        match len.checked_sub(back) {
            Some(offset) => self.seek(offset),
            None => {
                self.pos = self.len();
                self.eof = true;
            }
        }
    }

    pub fn read_bytes(&mut self, count: usize) -> Option<&[u8]> {
        if self.eof {
            return None;
        }

        let end = match self.pos.checked_add(count) {
            Some(end) if end <= self.len() => end,
            _ => {
                self.pos = self.len();
                self.eof = true;
                return None;
            }
        };

        let start = self.pos;
        self.pos = end;
        Some(&self.buf.as_ref()[start..end])
    }

    pub fn skip(&mut self, count: usize) -> Option<()> {
        self.read_bytes(count).map(|_| ())
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.read_array::<1>().map(|b| b[0])
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    /// Read a u64 length followed by that many bytes.
    pub fn read_prefixed_bytes(&mut self) -> Option<Vec<u8>> {
        let length = usize::try_from(self.read_u64()?).ok()?;
        self.read_bytes(length).map(<[u8]>::to_vec)
    }

    /// Read a u64 item count followed by that many items. Items decoded
    /// before the stream ran out are kept.
    pub fn read_sequence<T>(&mut self, mut item: impl FnMut(&mut Self) -> Option<T>) -> Vec<T> {
        let Some(count) = self.read_u64() else {
            return Vec::new();
        };

        let mut items = Vec::new();
        for _ in 0..count {
            match item(self) {
                Some(value) => items.push(value),
                None => break,
            }
        }
        items
    }

    /// Read a packed on-disk layout.
    pub fn read_layout<T: PackedLayout>(&mut self) -> Option<T> {
        let bytes = self.read_bytes(std::mem::size_of::<T>())?;
        // SAFETY: the slice holds size_of::<T>() bytes and PackedLayout types
        // accept any bit pattern.
        Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) })
    }
}

/// Little-endian writer matching `ByteStream`'s encoding.
pub struct StreamWriter<W> {
    inner: W,
    position: u64,
}

impl<W: Write> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, position: 0 }
    }

    /// Bytes written so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> io::Result<()> {
        self.write_bytes(&[value])
    }

    pub fn write_u16(&mut self, value: u16) -> io::Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> io::Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> io::Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_prefixed_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_u64(bytes.len() as u64)?;
        self.write_bytes(bytes)
    }

    pub fn write_sequence<T>(
        &mut self,
        items: &[T],
        mut item: impl FnMut(&mut Self, &T) -> io::Result<()>,
    ) -> io::Result<()> {
        self.write_u64(items.len() as u64)?;
        for value in items {
            item(self, value)?;
        }
        Ok(())
    }

    pub fn write_zeros(&mut self, count: usize) -> io::Result<()> {
        self.write_bytes(&vec![0u8; count])
    }

    pub fn write_layout<T: PackedLayout>(&mut self, value: &T) -> io::Result<()> {
        // SAFETY: PackedLayout types are packed integer structs without
        // padding, so all size_of::<T>() bytes are initialized.
        let bytes = unsafe {
            std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
        };
        self.write_bytes(bytes)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
