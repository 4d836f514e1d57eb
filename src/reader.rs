//! Streaming replay reader.
//!
//! A [`Reader`] decodes the replay container on construction: it verifies the
//! fixed preamble, locates the raw event region and the trailing metadata
//! region, and ingests the payload-size descriptor that declares every
//! subsequent command's payload size.
//!
//! Events are produced by [`Reader::yield_events`], which moves the reader onto
//! a spawned task that streams typed events over an unbounded channel and hands
//! the reader back through its join handle. The byte source is owned
//! exclusively by that task for the duration of yielding.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::decode_payload;
use crate::error::Error;
use crate::events::{Command, Event};
use crate::metadata::Metadata;
use crate::source::ReplaySource;
use crate::ubjson;

/// The 11 fixed bytes that open every replay file: the outer UBJSON object
/// with its `raw` key and typed-array header (`{U\x03raw[$U#l`).
const RAW_PREAMBLE: [u8; 11] = [
    0x7B, 0x55, 0x03, 0x72, 0x61, 0x77, 0x5B, 0x24, 0x55, 0x23, 0x6C,
];

/// Total preamble length: the fixed bytes plus the big-endian u32 raw length.
const PREAMBLE_LEN: usize = 15;

/// Bytes between the end of the raw region and the metadata document: the
/// UBJSON key `U\x08metadata`.
const METADATA_KEY_LEN: u64 = 10;

/// Streaming decoder for a single replay.
#[derive(Debug)]
pub struct Reader {
    source: ReplaySource,
    include: HashSet<u8>,
    raw_start: u64,
    raw_length: u64,
    metadata_start: u64,
    metadata_length: i64,
    payload_sizes: HashMap<u8, u16>,
}

impl Reader {
    /// Open a replay: verify the preamble, locate the raw and metadata
    /// regions, and learn the payload-size table.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedPreamble`] if the preamble is short or mismatched.
    /// - [`Error::UnexpectedFirstEvent`] if the raw region does not open with
    ///   the payload-size descriptor (`0x35`).
    /// - [`Error::ShortRead`] / [`Error::Io`] for source failures.
    pub fn new(mut source: ReplaySource) -> Result<Reader, Error> {
        let length = source.length(false)?;

        let mut preamble = [0u8; PREAMBLE_LEN];
        source.read_exact(&mut preamble).map_err(|e| match e {
            Error::ShortRead { .. } => {
                Error::MalformedPreamble("file shorter than the 15-byte preamble".to_string())
            }
            other => other,
        })?;

        if preamble[..11] != RAW_PREAMBLE {
            return Err(Error::MalformedPreamble(
                preamble[..11]
                    .iter()
                    .map(|b| format!("{b:02X}"))
                    .collect::<String>(),
            ));
        }

        let raw_start = PREAMBLE_LEN as u64;
        let raw_length =
            u32::from_be_bytes([preamble[11], preamble[12], preamble[13], preamble[14]]) as u64;

        let metadata_start = raw_start + raw_length + METADATA_KEY_LEN;
        // The trailing byte is the outer object's closing brace, excluded from
        // the document.
        let metadata_length = length as i64 - metadata_start as i64 - 1;

        // The raw region must open with the payload-size descriptor.
        let mut descriptor_header = [0u8; 2];
        source.read_exact(&mut descriptor_header)?;
        if descriptor_header[0] != Command::EventPayloads.byte() {
            return Err(Error::UnexpectedFirstEvent {
                command: descriptor_header[0],
            });
        }

        let mut payload_sizes = HashMap::new();
        let descriptor_length = descriptor_header[1];
        payload_sizes.insert(Command::EventPayloads.byte(), descriptor_length as u16);

        // The descriptor length includes its own leading byte; the remainder
        // is (command, big-endian u16 size) triples.
        let mut descriptor = vec![0u8; (descriptor_length as usize).saturating_sub(1)];
        source.read_exact(&mut descriptor)?;
        for triple in descriptor.chunks_exact(3) {
            payload_sizes.insert(triple[0], u16::from_be_bytes([triple[1], triple[2]]));
        }

        let include: HashSet<u8> = Command::ALL.iter().map(|c| c.byte()).collect();

        tracing::debug!(
            raw_length,
            metadata_length,
            commands = payload_sizes.len(),
            "opened replay"
        );

        Ok(Reader {
            source,
            include,
            raw_start,
            raw_length,
            metadata_start,
            metadata_length,
            payload_sizes,
        })
    }

    /// Choose whether a command's events are decoded and emitted by
    /// [`yield_events`](Reader::yield_events). Excluded commands are skipped
    /// by their declared byte count without allocation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownCommand`] for command bytes outside the
    /// recognized set.
    pub fn set_include(&mut self, command: u8, include: bool) -> Result<(), Error> {
        if !Command::is_known_byte(command) {
            return Err(Error::UnknownCommand { command });
        }

        if include {
            self.include.insert(command);
        } else {
            self.include.remove(&command);
        }
        Ok(())
    }

    /// The learned payload-size table. Immutable after construction.
    pub fn payload_sizes(&self) -> &HashMap<u8, u16> {
        &self.payload_sizes
    }

    /// Absolute offset of the raw event region.
    pub fn raw_start(&self) -> u64 {
        self.raw_start
    }

    /// Length of the raw event region in bytes.
    pub fn raw_length(&self) -> u64 {
        self.raw_length
    }

    /// Absolute offset of the metadata document.
    pub fn metadata_start(&self) -> u64 {
        self.metadata_start
    }

    /// Length of the metadata document in bytes. Non-positive for an
    /// in-progress replay that has no metadata yet.
    pub fn metadata_length(&self) -> i64 {
        self.metadata_length
    }

    /// Stream the raw region's events over an unbounded channel.
    ///
    /// The reader moves onto a spawned task that owns the byte source for the
    /// duration and is handed back through the returned join handle. One
    /// scratch buffer per declared command is allocated up front; excluded
    /// commands advance the source by their declared size without reading.
    ///
    /// The stream terminates when the raw region is exhausted, when
    /// `stop` returns true for an emitted event, when the receiver is
    /// dropped, or -- in-band -- on the first error: an unknown command byte,
    /// a short read, or a decode failure.
    pub fn yield_events<F>(
        mut self,
        mut stop: F,
    ) -> (
        mpsc::UnboundedReceiver<Result<Event, Error>>,
        JoinHandle<Reader>,
    )
    where
        F: FnMut(&Event) -> bool + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            if let Err(e) = self.source.seek(SeekFrom::Start(self.raw_start)) {
                let _ = tx.send(Err(e));
                return self;
            }

            let mut buffers: HashMap<u8, Vec<u8>> = self
                .payload_sizes
                .iter()
                .map(|(&command, &size)| (command, vec![0u8; size as usize]))
                .collect();

            let mut position = self.raw_start;
            let end = self.raw_start + self.raw_length;
            let mut command_buf = [0u8; 1];

            while position < end {
                if let Err(e) = self.source.read_exact(&mut command_buf) {
                    let _ = tx.send(Err(e));
                    return self;
                }
                position += 1;
                let byte = command_buf[0];

                // A command absent from the descriptor has an unknowable
                // size; the stream cannot continue past it.
                let Some(buffer) = buffers.get_mut(&byte) else {
                    let _ = tx.send(Err(Error::UnknownCommand { command: byte }));
                    return self;
                };
                let size = buffer.len() as u64;

                // Commands declared in the descriptor but excluded (or not
                // recognized by this library) are skipped by size.
                if !self.include.contains(&byte) {
                    if let Err(e) = self.source.seek(SeekFrom::Current(size as i64)) {
                        let _ = tx.send(Err(e));
                        return self;
                    }
                    position += size;
                    continue;
                }

                if let Err(e) = self.source.read_exact(buffer) {
                    let _ = tx.send(Err(e));
                    return self;
                }
                position += size;

                let Some(command) = Command::from_byte(byte) else {
                    let _ = tx.send(Err(Error::UnknownCommand { command: byte }));
                    return self;
                };

                let event = match decode_payload(command, buffer) {
                    Ok(event) => event,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return self;
                    }
                };

                let stop_now = stop(&event);
                if tx.send(Ok(event)).is_err() {
                    // Receiver dropped: downstream cancelled.
                    return self;
                }
                if stop_now {
                    return self;
                }
            }

            self
        });

        (rx, handle)
    }

    /// Read the raw metadata document bytes, or `None` for an in-progress
    /// replay with no metadata yet.
    ///
    /// This is the seam for callers bringing their own UBJSON decoder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShortRead`] / [`Error::Io`] for source failures.
    pub fn read_metadata_bytes(&mut self) -> Result<Option<Bytes>, Error> {
        if self.metadata_length <= 0 {
            return Ok(None);
        }

        self.source.seek(SeekFrom::Start(self.metadata_start))?;
        let mut buf = vec![0u8; self.metadata_length as usize];
        self.source.read_exact(&mut buf)?;
        Ok(Some(Bytes::from(buf)))
    }

    /// Read and decode the trailing metadata document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Metadata`] if the document is not valid UBJSON, plus
    /// any source failure from [`read_metadata_bytes`](Reader::read_metadata_bytes).
    pub fn read_metadata(&mut self) -> Result<Option<Metadata>, Error> {
        let Some(bytes) = self.read_metadata_bytes()? else {
            return Ok(None);
        };
        let value = ubjson::decode(&bytes)?;
        Ok(Some(Metadata::from_value(&value)))
    }
}
