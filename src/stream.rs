//! Buffered byte stream over a codestream.
//!
//! All multi-byte reads are big-endian, following the codestream
//! convention regardless of host endianness.

use crate::error::{CodecError, Result};
use std::io::Read;

enum Source<'a> {
    /// Fully byte-addressable source; seeks are O(1).
    Slice(&'a [u8]),
    /// Non-seekable transport. Bytes are pulled on demand; `seek`
    /// fails with `Unseekable`.
    Transport(Box<dyn Read + 'a>, Vec<u8>, bool),
}

pub struct ByteStream<'a> {
    source: Source<'a>,
    pos: usize,
}

impl<'a> ByteStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            source: Source::Slice(data),
            pos: 0,
        }
    }

    pub fn from_transport(reader: Box<dyn Read + 'a>) -> Self {
        Self {
            source: Source::Transport(reader, Vec::new(), false),
            pos: 0,
        }
    }

    /// Current byte offset from the start of the codestream.
    pub fn tell(&self) -> u64 {
        self.pos as u64
    }

    pub fn bytes_left(&mut self) -> u64 {
        match &mut self.source {
            Source::Slice(data) => (data.len() - self.pos) as u64,
            Source::Transport(reader, buf, eof) => {
                if !*eof {
                    // A transport only knows its remaining length once
                    // drained; pull everything that is left.
                    let mut rest = Vec::new();
                    if reader.read_to_end(&mut rest).is_ok() {
                        buf.extend_from_slice(&rest);
                    }
                    *eof = true;
                }
                (buf.len() - self.pos) as u64
            }
        }
    }

    fn available(&mut self, n: usize) -> Result<&[u8]> {
        match &mut self.source {
            Source::Slice(data) => {
                if self.pos + n > data.len() {
                    return Err(CodecError::Truncated(self.pos as u64));
                }
                Ok(&data[self.pos..self.pos + n])
            }
            Source::Transport(reader, buf, eof) => {
                while buf.len() < self.pos + n && !*eof {
                    let mut chunk = [0u8; 4096];
                    match reader.read(&mut chunk) {
                        Ok(0) => *eof = true,
                        Ok(k) => buf.extend_from_slice(&chunk[..k]),
                        Err(_) => *eof = true,
                    }
                }
                if buf.len() < self.pos + n {
                    return Err(CodecError::Truncated(self.pos as u64));
                }
                Ok(&buf[self.pos..self.pos + n])
            }
        }
    }

    /// Read exactly `n` bytes. A short count surfaces as `Truncated`;
    /// no partial reads escape this boundary.
    pub fn read(&mut self, n: usize) -> Result<&[u8]> {
        let pos = self.pos;
        self.available(n)?;
        self.pos += n;
        match &self.source {
            Source::Slice(data) => Ok(&data[pos..pos + n]),
            Source::Transport(_, buf, _) => Ok(&buf[pos..pos + n]),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let b = self.read(1)?;
        Ok(b[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.read(2)?;
        Ok(((b[0] as u16) << 8) | b[1] as u16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read(4)?;
        Ok(((b[0] as u32) << 24) | ((b[1] as u32) << 16) | ((b[2] as u32) << 8) | b[3] as u32)
    }

    /// Skip forward. Skipping past the end is `Truncated`.
    pub fn skip(&mut self, n: u64) -> Result<()> {
        self.available(n as usize)?;
        self.pos += n as usize;
        Ok(())
    }

    /// Absolute seek. Only byte-addressable sources can seek.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        match &self.source {
            Source::Slice(data) => {
                if pos as usize > data.len() {
                    return Err(CodecError::Truncated(pos));
                }
                self.pos = pos as usize;
                Ok(())
            }
            Source::Transport(..) => Err(CodecError::Unseekable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_primitives() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE];
        let mut s = ByteStream::new(&data);
        assert_eq!(s.read_u16().unwrap(), 0x1234);
        assert_eq!(s.read_u32().unwrap(), 0x56789ABC);
        assert_eq!(s.tell(), 6);
        assert_eq!(s.bytes_left(), 1);
        assert_eq!(s.read_u8().unwrap(), 0xDE);
        assert_eq!(s.read_u8(), Err(CodecError::Truncated(7)));
    }

    #[test]
    fn skip_past_end_is_truncated() {
        let data = [0u8; 4];
        let mut s = ByteStream::new(&data);
        assert!(s.skip(4).is_ok());
        assert_eq!(s.skip(1), Err(CodecError::Truncated(4)));
    }

    #[test]
    fn seek_and_tell() {
        let data = [1u8, 2, 3, 4];
        let mut s = ByteStream::new(&data);
        s.seek(2).unwrap();
        assert_eq!(s.read_u8().unwrap(), 3);
        s.seek(0).unwrap();
        assert_eq!(s.read_u8().unwrap(), 1);
    }

    #[test]
    fn transport_cannot_seek() {
        let data: Vec<u8> = vec![1, 2, 3, 4];
        let mut s = ByteStream::from_transport(Box::new(std::io::Cursor::new(data)));
        assert_eq!(s.read_u16().unwrap(), 0x0102);
        assert_eq!(s.seek(0), Err(CodecError::Unseekable));
        assert_eq!(s.bytes_left(), 2);
    }
}
