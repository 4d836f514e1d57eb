//! Error types for slipstream.
//!
//! This module defines the unified error enum used throughout the crate. All fallible
//! operations return `Result<T, Error>`. Reader errors terminate the event stream and
//! are surfaced to the parser, which aborts and bubbles the error to its caller.

use crate::ubjson::UbjsonError;

/// Which half of a frame update a strict-mode finalization check found missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSide {
    /// The pre-frame update (inputs and pre-simulation state).
    Pre,
    /// The post-frame update (resulting state after simulation).
    Post,
}

impl std::fmt::Display for UpdateSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateSide::Pre => write!(f, "pre"),
            UpdateSide::Post => write!(f, "post"),
        }
    }
}

/// Unified error type for all slipstream operations.
///
/// Each variant represents a distinct failure mode:
///
/// - `MalformedPreamble` -> the fixed file header did not match, or was cut short
/// - `UnknownCommand` -> a command byte absent from the learned payload-size table
/// - `UnexpectedFirstEvent` -> the raw region did not open with the payload-size descriptor
/// - `ShortRead` -> the byte source ran out mid-payload
/// - `Encoding` -> a Shift-JIS (or ASCII) string field failed to decode
/// - `MissingFrameUpdate` -> strict finalization found a player without pre or post
/// - `RollbackWindowViolation` -> strict bookend outside the maximum rollback window
/// - `UnexpectedCursor` -> live-adapter cursor discontinuity
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The 15-byte file preamble did not match the expected literal, or could not
    /// be read in full.
    #[error("replay had an invalid preamble: {0}")]
    MalformedPreamble(String),

    /// A command byte was encountered that is not present in the learned
    /// payload-size table, or was passed to an include-set operation.
    #[error("unknown command: 0x{command:02X}")]
    UnknownCommand {
        /// The unrecognized command byte.
        command: u8,
    },

    /// The first event in the raw region was not the payload-size descriptor (0x35).
    #[error("expected event payloads event, got: 0x{command:02X}")]
    UnexpectedFirstEvent {
        /// The command byte that was found instead.
        command: u8,
    },

    /// The byte source returned fewer bytes than requested.
    #[error("short read: needed {needed} bytes, got {got}")]
    ShortRead {
        /// Number of bytes requested.
        needed: usize,
        /// Number of bytes actually available.
        got: usize,
    },

    /// A Shift-JIS or ASCII string field failed to decode.
    #[error("string field failed to decode: {0}")]
    Encoding(String),

    /// Strict-mode finalization found a player with a missing frame update.
    #[error(
        "could not finalize frame {frame} of {target}: missing {side}-frame update for player {player}"
    )]
    MissingFrameUpdate {
        /// The frame that could not be finalized.
        frame: i32,
        /// The finalization target frame.
        target: i32,
        /// Which side of the update was missing.
        side: UpdateSide,
        /// Index of the player the update was missing for.
        player: u8,
    },

    /// A strict-mode frame bookend reported a finalization watermark older than the
    /// maximum rollback window allows.
    #[error("latest finalized frame should be within {window} frames of {frame}")]
    RollbackWindowViolation {
        /// The bookend's frame number.
        frame: i32,
        /// The maximum rollback window, in frames.
        window: i32,
    },

    /// A live-stream message arrived with a cursor that does not match the
    /// adapter's running cursor.
    #[error("unexpected game data cursor: expected {expected}, got {got}")]
    UnexpectedCursor {
        /// The cursor the adapter expected.
        expected: i64,
        /// The cursor the message carried.
        got: i64,
    },

    /// The trailing metadata document failed to decode.
    #[error("metadata decode failed: {0}")]
    Metadata(#[from] UbjsonError),

    /// An I/O error occurred reading the byte source.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
