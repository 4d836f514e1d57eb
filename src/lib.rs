//! slipstream: a streaming decoder and rollback-aware frame assembler for
//! Slippi (`.slp`) Melee replays.
//!
//! The pipeline has two halves. A [`Reader`] decodes the binary container --
//! preamble, payload-size descriptor, raw event region, trailing UBJSON
//! metadata -- and streams typed [`Event`]s from a spawned task. A [`Parser`]
//! consumes that stream, reassembles per-frame state with netplay rollback
//! accounting, and fans lifecycle events out to subscribers through its
//! [`Broker`]. The [`Game`] handle wires both together for on-demand use, and
//! [`live`] adapts Dolphin/console live streams onto the same reader.

pub mod broker;
pub mod codec;
pub mod error;
pub mod events;
pub mod game;
pub mod live;
pub mod metadata;
pub mod parser;
pub mod reader;
pub mod source;
pub mod ubjson;

pub use broker::{Broker, ParserEvent, ParserUpdate, Sink};
pub use error::{Error, UpdateSide};
pub use events::{Command, Event, Payload};
pub use game::{Calculator, Game};
pub use metadata::Metadata;
pub use parser::{
    FrameEntry, FrameUpdates, GameInfo, MAX_ROLLBACK_FRAMES, Parser, ParserOptions, Rollbacks,
};
pub use reader::Reader;
pub use source::ReplaySource;
