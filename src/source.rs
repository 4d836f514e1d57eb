//! Seekable byte sources for replay data.
//!
//! A [`ReplaySource`] wraps either an open file or an in-memory buffer and exposes
//! the small surface the reader needs: exact reads, seeking, and a one-shot length.
//! All other components see only this contract.

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::error::Error;

#[derive(Debug)]
enum Inner {
    File(File),
    Memory(Cursor<Vec<u8>>),
}

/// A seekable source of replay bytes.
///
/// The length is computed once on first request and cached; callers can force a
/// recomputation (useful for a file that is still being written by the game).
#[derive(Debug)]
pub struct ReplaySource {
    inner: Inner,
    length: Option<u64>,
}

impl ReplaySource {
    /// Wrap an open replay file.
    pub fn from_file(file: File) -> ReplaySource {
        ReplaySource {
            inner: Inner::File(file),
            length: None,
        }
    }

    /// Wrap an in-memory replay buffer.
    pub fn from_bytes(bytes: Vec<u8>) -> ReplaySource {
        ReplaySource {
            inner: Inner::Memory(Cursor::new(bytes)),
            length: None,
        }
    }

    /// Total length of the underlying data in bytes.
    ///
    /// Computed on the first call and cached. Pass `recalculate = true` to force a
    /// fresh computation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file length cannot be determined.
    pub fn length(&mut self, recalculate: bool) -> Result<u64, Error> {
        if recalculate || self.length.is_none() {
            let length = match &self.inner {
                Inner::File(file) => file.metadata()?.len(),
                Inner::Memory(cursor) => cursor.get_ref().len() as u64,
            };
            self.length = Some(length);
        }
        // The cache was just populated above.
        Ok(self.length.unwrap_or_default())
    }

    /// Read exactly `buf.len()` bytes into `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShortRead`] if the source is exhausted before the buffer is
    /// filled, or [`Error::Io`] for any other read failure.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = match &mut self.inner {
                Inner::File(file) => file.read(&mut buf[filled..])?,
                Inner::Memory(cursor) => cursor.read(&mut buf[filled..])?,
            };
            if n == 0 {
                return Err(Error::ShortRead {
                    needed: buf.len(),
                    got: filled,
                });
            }
            filled += n;
        }
        Ok(())
    }

    /// Reposition the source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the underlying seek fails.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, Error> {
        let offset = match &mut self.inner {
            Inner::File(file) => file.seek(pos)?,
            Inner::Memory(cursor) => cursor.seek(pos)?,
        };
        Ok(offset)
    }
}
