//! Live-stream adapters for Dolphin and console sources.
//!
//! Live connections deliver the same raw event bytes a replay file carries,
//! framed per transport: Dolphin sends JSON messages with base64 payloads over
//! ENet, consoles send length-prefixed UBJSON messages over TCP. The network
//! transports themselves live outside this crate; the adapters here decode the
//! message schemas, enforce cursor continuity, and surface raw event bytes to
//! be fed into a reader.
//!
//! Adapter errors are delivered in-band on the same channel as data events so
//! consumers can handle them at the point in the stream where they occurred.

use base64::Engine;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Error;
use crate::ubjson::{self, Value};

/// State of a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    ReconnectWait,
}

/// Address of the live source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionSettings {
    pub ip_address: String,
    pub port: u16,
}

/// Identity reported by the live source during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionDetails {
    pub console_nick: String,
    pub game_data_cursor: i64,
    pub version: String,
}

/// Events emitted by a live adapter, in arrival order.
///
/// Errors share the channel with data so a consumer sees them exactly where
/// they occurred in the stream.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The transport connected.
    Connect,
    /// A raw message arrived (also delivered in decoded form below).
    Message(DolphinMessage),
    /// The handshake completed.
    Handshake(ConnectionDetails),
    /// The connection status changed.
    StatusChange(ConnectionStatus),
    /// Raw replay event bytes, ready for a reader.
    Data(Bytes),
    /// An in-band adapter error.
    Error(Error),
}

/// Kinds of messages Dolphin sends to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DolphinMessageKind {
    ConnectReply,
    ConnectRequest,
    MenuEvent,
    GameEvent,
    StartGame,
    EndGame,
}

/// A JSON message from Dolphin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DolphinMessage {
    #[serde(rename = "type")]
    pub kind: DolphinMessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nick: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub cursor: i64,
    #[serde(default, rename = "next_cursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<i64>,
    /// Base64-encoded raw event bytes for menu/game events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

/// Adapter for a Dolphin live stream.
///
/// Feed each received JSON frame to [`receive_frame`](DolphinAdapter::receive_frame);
/// decoded events, data, and errors come back on the event channel returned by
/// [`new`](DolphinAdapter::new).
pub struct DolphinAdapter {
    settings: ConnectionSettings,
    status: ConnectionStatus,
    game_cursor: i64,
    nickname: String,
    version: String,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl DolphinAdapter {
    /// Create an adapter and the receiving half of its event channel.
    pub fn new(settings: ConnectionSettings) -> (DolphinAdapter, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = DolphinAdapter {
            settings,
            status: ConnectionStatus::Disconnected,
            game_cursor: 0,
            nickname: String::new(),
            version: String::new(),
            events: tx,
        };
        (adapter, rx)
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// The address this adapter was created for.
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Identity reported by the source so far.
    pub fn details(&self) -> ConnectionDetails {
        ConnectionDetails {
            console_nick: self.nickname.clone(),
            game_data_cursor: self.game_cursor,
            version: self.version.clone(),
        }
    }

    /// Mark the transport as connected and reset the cursor for a fresh
    /// session.
    pub fn connected(&mut self) {
        self.game_cursor = 0;
        self.emit(ConnectionEvent::Connect);
        self.set_status(ConnectionStatus::Connecting);
    }

    /// Mark the transport as disconnected.
    pub fn disconnect(&mut self) {
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Handle one raw JSON frame from the transport.
    pub fn receive_frame(&mut self, frame: &[u8]) {
        let message: DolphinMessage = match serde_json::from_slice(frame) {
            Ok(message) => message,
            Err(e) => {
                self.emit(ConnectionEvent::Error(Error::Encoding(format!(
                    "invalid dolphin message: {e}"
                ))));
                return;
            }
        };
        self.handle_message(message);
    }

    /// Handle one decoded Dolphin message.
    pub fn handle_message(&mut self, message: DolphinMessage) {
        self.emit(ConnectionEvent::Message(message.clone()));

        match message.kind {
            DolphinMessageKind::ConnectReply => {
                self.set_status(ConnectionStatus::Connected);
                self.game_cursor = message.cursor;
                self.nickname = message.nick.clone().unwrap_or_default();
                self.version = message.version.clone().unwrap_or_default();
                self.emit(ConnectionEvent::Handshake(self.details()));
            }
            DolphinMessageKind::MenuEvent | DolphinMessageKind::GameEvent => {
                let Some(payload) = message.payload.clone().filter(|p| !p.is_empty()) else {
                    // An empty payload means the stream is over.
                    self.disconnect();
                    return;
                };

                self.update_cursor(&message);

                match base64::engine::general_purpose::STANDARD.decode(&payload) {
                    Ok(data) => self.emit(ConnectionEvent::Data(Bytes::from(data))),
                    Err(e) => self.emit(ConnectionEvent::Error(Error::Encoding(format!(
                        "invalid base64 payload: {e}"
                    )))),
                }
            }
            DolphinMessageKind::StartGame | DolphinMessageKind::EndGame => {
                self.update_cursor(&message);
            }
            DolphinMessageKind::ConnectRequest => {}
        }
    }

    /// Validate cursor continuity, then advance to the message's next cursor.
    ///
    /// A mismatch is reported in-band; the running cursor still advances so
    /// a consumer that chooses to continue stays aligned with the source.
    fn update_cursor(&mut self, message: &DolphinMessage) {
        if self.game_cursor != message.cursor {
            self.emit(ConnectionEvent::Error(Error::UnexpectedCursor {
                expected: self.game_cursor,
                got: message.cursor,
            }));
        }

        self.game_cursor = message.next_cursor.unwrap_or_default();
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            self.status = status;
            self.emit(ConnectionEvent::StatusChange(status));
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("live adapter emit: receiver dropped");
        }
    }
}

/// Kinds of messages a console (Wii) sends to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleMessageKind {
    Handshake,
    Replay,
    KeepAlive,
}

impl ConsoleMessageKind {
    fn from_int(value: i64) -> Option<ConsoleMessageKind> {
        match value {
            1 => Some(ConsoleMessageKind::Handshake),
            2 => Some(ConsoleMessageKind::Replay),
            3 => Some(ConsoleMessageKind::KeepAlive),
            _ => None,
        }
    }
}

/// Payload of a console message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConsolePayload {
    pub cursor: Bytes,
    pub client_token: Bytes,
    pub pos: Bytes,
    pub next_pos: Bytes,
    /// Raw replay event bytes for replay messages.
    pub data: Bytes,
    pub nick: String,
    pub force_pos: bool,
    pub nintendont_version: String,
}

/// A decoded console message.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleMessage {
    pub kind: ConsoleMessageKind,
    pub payload: ConsolePayload,
}

/// Reassembles the console's length-prefixed UBJSON message stream.
///
/// Feed received chunks to [`receive`](ConsoleCommunication::receive); complete
/// messages accumulate and are taken with
/// [`take_messages`](ConsoleCommunication::take_messages). A partial frame
/// waits in the buffer for more bytes.
#[derive(Debug, Default)]
pub struct ConsoleCommunication {
    receive_buf: BytesMut,
    messages: Vec<ConsoleMessage>,
}

impl ConsoleCommunication {
    pub fn new() -> ConsoleCommunication {
        ConsoleCommunication::default()
    }

    /// Append received bytes and drain every complete message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Metadata`] if a complete frame does not decode as
    /// UBJSON. Messages of an unrecognized kind are skipped.
    pub fn receive(&mut self, data: &[u8]) -> Result<(), Error> {
        self.receive_buf.extend_from_slice(data);

        while self.receive_buf.len() >= 4 {
            let message_size = u32::from_be_bytes([
                self.receive_buf[0],
                self.receive_buf[1],
                self.receive_buf[2],
                self.receive_buf[3],
            ]) as usize;

            if self.receive_buf.len() < 4 + message_size {
                // Incomplete frame; wait for more bytes.
                return Ok(());
            }

            let frame = self.receive_buf.split_to(4 + message_size);
            let value = ubjson::decode(&frame[4..])?;
            match Self::parse_message(&value) {
                Some(message) => self.messages.push(message),
                None => tracing::warn!("skipping console message of unrecognized kind"),
            }
        }

        Ok(())
    }

    /// Take every fully received message, leaving the reassembly buffer
    /// untouched.
    pub fn take_messages(&mut self) -> Vec<ConsoleMessage> {
        std::mem::take(&mut self.messages)
    }

    fn parse_message(value: &Value) -> Option<ConsoleMessage> {
        let kind = ConsoleMessageKind::from_int(value.get("type")?.as_int()?)?;
        let payload = match value.get("payload") {
            Some(payload) => ConsolePayload {
                cursor: bytes_field(payload, "cursor"),
                client_token: bytes_field(payload, "clientToken"),
                pos: bytes_field(payload, "pos"),
                next_pos: bytes_field(payload, "nextPos"),
                data: bytes_field(payload, "data"),
                nick: payload
                    .get("nick")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                force_pos: payload
                    .get("forcePos")
                    .and_then(Value::as_bool)
                    .unwrap_or_default(),
                nintendont_version: payload
                    .get("nintendontVersion")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            None => ConsolePayload::default(),
        };

        Some(ConsoleMessage { kind, payload })
    }
}

/// Extract a UBJSON array-of-u8 field as bytes.
fn bytes_field(value: &Value, key: &str) -> Bytes {
    let Some(elements) = value.get(key).and_then(Value::as_array) else {
        return Bytes::new();
    };
    elements
        .iter()
        .filter_map(Value::as_int)
        .map(|n| n as u8)
        .collect::<Vec<u8>>()
        .into()
}
