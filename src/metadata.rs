//! Typed view of the trailing replay metadata document.
//!
//! The metadata block is a UBJSON object written after the raw event region.
//! Extraction is tolerant: unknown keys are ignored and missing keys default,
//! since the document is written by several producers (Dolphin, console,
//! desktop app) with varying completeness.

use std::collections::HashMap;

use crate::ubjson::Value;

/// Metadata about a replay.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Metadata {
    /// Recording start time, RFC 3339 formatted. Empty means not set.
    pub start_at: String,
    /// Last frame number of the game.
    pub last_frame: i32,
    /// Per-slot player metadata, keyed by slot index.
    pub players: HashMap<u8, PlayerMetadata>,
    /// Platform that recorded the replay (`"dolphin"`, `"console"`, ...).
    pub played_on: String,
    /// Nickname of the recording console. Empty means not set.
    pub console_nick: String,
}

/// Metadata about one player slot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlayerMetadata {
    /// Frames spent as each internal character ID, keyed by its decimal string.
    pub characters: HashMap<String, i32>,
    /// Netplay names for the player.
    pub names: Names,
}

/// Netplay names attached to a player slot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Names {
    /// Netplay display name.
    pub netplay: String,
    /// Netplay connect code.
    pub code: String,
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl Metadata {
    /// Extract a `Metadata` from a decoded UBJSON document.
    pub fn from_value(value: &Value) -> Metadata {
        let mut players = HashMap::new();
        if let Some(entries) = value.get("players").and_then(Value::as_object) {
            for (slot, player) in entries {
                let Ok(slot) = slot.parse::<u8>() else {
                    continue;
                };
                players.insert(slot, PlayerMetadata::from_value(player));
            }
        }

        Metadata {
            start_at: str_field(value, "startAt"),
            last_frame: value
                .get("lastFrame")
                .and_then(Value::as_int)
                .unwrap_or_default() as i32,
            players,
            played_on: str_field(value, "playedOn"),
            console_nick: str_field(value, "consoleNick"),
        }
    }
}

impl PlayerMetadata {
    fn from_value(value: &Value) -> PlayerMetadata {
        let mut characters = HashMap::new();
        if let Some(entries) = value.get("characters").and_then(Value::as_object) {
            for (character, frames) in entries {
                characters.insert(
                    character.clone(),
                    frames.as_int().unwrap_or_default() as i32,
                );
            }
        }

        let names = match value.get("names") {
            Some(names) => Names {
                netplay: str_field(names, "netplay"),
                code: str_field(names, "code"),
            },
            None => Names::default(),
        };

        PlayerMetadata { characters, names }
    }
}
