//! Fan-out broker for parser lifecycle subscriptions.
//!
//! The `Broker` keeps one sink list per lifecycle event kind and pushes
//! `Arc`-wrapped snapshots to every sink on emission. Sinks are unbounded
//! `tokio::mpsc` senders, so delivery never blocks the parser and ordering is
//! preserved per subscriber. Using `Arc` ensures that snapshots are shared
//! across subscribers without deep-cloning frame data.

use std::collections::HashMap;
use std::sync::Arc;

use async_stream::stream;
use tokio::sync::mpsc;

use crate::events::GameEndPayload;
use crate::parser::{FrameEntry, GameInfo};

/// Lifecycle events emitted by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParserEvent {
    /// Game info is complete. Precedes every other emission.
    Started,
    /// A frame's updates were received (per bookend, or per update on old
    /// replay versions).
    Frame,
    /// A frame was committed and will never be rolled back.
    FinalizedFrame,
    /// A retransmission replaced a frame; carries the losing snapshot.
    RollbackFrame,
    /// The game ended. Nothing follows.
    Ended,
}

/// The uniformly-typed value delivered to sinks.
///
/// The concrete variant is determined by the event kind the sink subscribed
/// to: `Started` delivers a [`GameInfo`] snapshot, `Frame` /
/// `FinalizedFrame` / `RollbackFrame` deliver a [`FrameEntry`] snapshot, and
/// `Ended` delivers the [`GameEndPayload`].
#[derive(Debug, Clone)]
pub enum ParserUpdate {
    GameInfo(Arc<GameInfo>),
    Frame(Arc<FrameEntry>),
    GameEnd(Arc<GameEndPayload>),
}

/// A subscriber sink: the sending half of an unbounded channel.
pub type Sink = mpsc::UnboundedSender<ParserUpdate>;

/// Fan-out broker keyed by lifecycle event kind.
///
/// Delivery guarantees: at-least-once per subscriber, per-subscriber ordering,
/// and no back-pressure on the emitter. A sink whose receiver has been dropped
/// is skipped; it never fails the parser.
#[derive(Debug, Default)]
pub struct Broker {
    sinks: HashMap<ParserEvent, Vec<Sink>>,
}

impl Broker {
    /// Create an empty broker.
    pub fn new() -> Broker {
        Broker::default()
    }

    /// Attach a sink to a lifecycle event.
    pub fn subscribe(&mut self, event: ParserEvent, sink: Sink) {
        self.sinks.entry(event).or_default().push(sink);
    }

    /// Create a channel, attach its sender to a lifecycle event, and return
    /// the receiving half.
    pub fn subscribe_channel(&mut self, event: ParserEvent) -> mpsc::UnboundedReceiver<ParserUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(event, tx);
        rx
    }

    /// Subscribe to a lifecycle event as an async stream.
    ///
    /// The stream yields every update delivered after this call and ends when
    /// the broker (and with it the sending half) is dropped.
    pub fn subscribe_stream(
        &mut self,
        event: ParserEvent,
    ) -> impl futures_core::Stream<Item = ParserUpdate> + use<> {
        let mut rx = self.subscribe_channel(event);
        stream! {
            while let Some(update) = rx.recv().await {
                yield update;
            }
        }
    }

    /// Detach one sink from a lifecycle event.
    ///
    /// The sink is matched by channel identity; the first match is removed.
    /// Detaching a sink that was never attached is a no-op.
    pub fn unsubscribe(&mut self, event: ParserEvent, sink: &Sink) {
        if let Some(sinks) = self.sinks.get_mut(&event)
            && let Some(at) = sinks.iter().position(|s| s.same_channel(sink))
        {
            sinks.remove(at);
        }
    }

    /// Detach every sink from a lifecycle event.
    pub fn unsubscribe_all(&mut self, event: ParserEvent) {
        self.sinks.remove(&event);
    }

    /// Deliver an update to every sink attached to `event`.
    ///
    /// Each send is independent: a closed receiver is logged at debug level
    /// and skipped, and no send can block the caller.
    pub fn emit(&self, event: ParserEvent, update: ParserUpdate) {
        let Some(sinks) = self.sinks.get(&event) else {
            return;
        };
        for sink in sinks {
            if sink.send(update.clone()).is_err() {
                tracing::debug!(?event, "broker emit: receiver dropped");
            }
        }
    }

    /// Number of sinks attached to a lifecycle event.
    pub fn subscriber_count(&self, event: ParserEvent) -> usize {
        self.sinks.get(&event).map(Vec::len).unwrap_or(0)
    }
}
