//! Binary decoders for Slippi event payloads.
//!
//! This module maps `(command, payload bytes)` to typed payload variants. It is
//! pure data transformation -- no file I/O, no async, no parser state. Integers
//! are big-endian; floats are IEEE-754 binary32 read from a big-endian word;
//! signed fields are two's complement.
//!
//! The byte offsets in this file follow the Slippi replay specification and are
//! authoritative: a payload shorter than an offset table requires produces
//! [`Error::ShortRead`], never a panic.

use std::collections::HashMap;

use bytes::Bytes;
use semver::Version;

use crate::error::Error;
use crate::events::{
    Command, DashbackFix, Event, EventPayloadsPayload, FrameBookendPayload, FrameStartPayload,
    FrameUpdate, GameEndMethod, GameEndPayload, GameInfoBlock, GameStartPayload, GeckoListPayload,
    HurtboxCollisionState, ItemSpawnBehavior, ItemUpdatePayload, LCancelStatus, Language,
    MessageSplitterPayload, Payload, PlayerInfo, PlayerType, PostFrameUpdatePayload,
    PreFrameUpdatePayload, ShieldDropFix, TeamId, TeamShade,
};

/// Minimum payload length for each fixed-size event, derived from the highest
/// offset its table touches.
const GAME_START_LEN: usize = 0x2BD;
const PRE_FRAME_LEN: usize = 0x3F;
const POST_FRAME_LEN: usize = 0x50;
const GAME_END_LEN: usize = 0x2;
const FRAME_START_LEN: usize = 0xC;
const ITEM_UPDATE_LEN: usize = 0x2A;
const FRAME_BOOKEND_LEN: usize = 0x8;
const MESSAGE_SPLITTER_LEN: usize = 0x204;

/// Per-slot strides inside the game start payload.
const PLAYER_BLOCK_STRIDE: usize = 0x24;
const FIX_BLOCK_STRIDE: usize = 0x8;
const NAMETAG_STRIDE: usize = 0x10;
const DISPLAY_NAME_STRIDE: usize = 0x1F;
const CONNECT_CODE_STRIDE: usize = 0xA;
const SLIPPI_UID_STRIDE: usize = 0x1D;

fn require_len(payload: &[u8], needed: usize) -> Result<(), Error> {
    if payload.len() < needed {
        return Err(Error::ShortRead {
            needed,
            got: payload.len(),
        });
    }
    Ok(())
}

// Fixed-offset readers. Callers must have checked the payload length first.

fn be_u16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn be_u32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn be_i32(b: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn be_f32(b: &[u8], at: usize) -> f32 {
    f32::from_bits(be_u32(b, at))
}

/// Truncate a byte slice at its first NUL.
fn null_terminated(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0x0) {
        Some(end) => &bytes[..end],
        None => bytes,
    }
}

/// Decode a Shift-JIS string field, truncating the decoded text at its first NUL.
///
/// Empty results are legal and represent "not set".
///
/// # Errors
///
/// Returns [`Error::Encoding`] if the bytes are not valid Shift-JIS.
fn decode_shift_jis(bytes: &[u8]) -> Result<String, Error> {
    let (decoded, _, had_errors) = encoding_rs::SHIFT_JIS.decode(bytes);
    if had_errors {
        return Err(Error::Encoding(format!(
            "invalid Shift-JIS sequence in {}-byte field",
            bytes.len()
        )));
    }
    let text = match decoded.find('\0') {
        Some(end) => &decoded[..end],
        None => &decoded,
    };
    Ok(text.to_string())
}

/// Decode a NUL-terminated ASCII string field.
///
/// # Errors
///
/// Returns [`Error::Encoding`] if the bytes before the terminator are not valid
/// ASCII/UTF-8.
fn decode_ascii(bytes: &[u8]) -> Result<String, Error> {
    let text = std::str::from_utf8(null_terminated(bytes))
        .map_err(|e| Error::Encoding(format!("invalid ASCII field: {e}")))?;
    Ok(text.to_string())
}

/// Decode one event payload.
///
/// # Arguments
///
/// * `command` - The command byte that introduced the payload.
/// * `payload` - Exactly the payload bytes declared for that command.
///
/// # Errors
///
/// Returns [`Error::ShortRead`] if the payload is shorter than the command's
/// offset table requires, or [`Error::Encoding`] if a string field fails to
/// decode.
pub fn decode_payload(command: Command, payload: &[u8]) -> Result<Event, Error> {
    let decoded = match command {
        Command::MessageSplitter => Payload::MessageSplitter(decode_message_splitter(payload)?),
        Command::EventPayloads => Payload::EventPayloads(decode_event_payloads(payload)?),
        Command::GameStart => Payload::GameStart(decode_game_start(payload)?),
        Command::PreFrameUpdate => Payload::PreFrameUpdate(decode_pre_frame(payload)?),
        Command::PostFrameUpdate => Payload::PostFrameUpdate(decode_post_frame(payload)?),
        Command::GameEnd => Payload::GameEnd(decode_game_end(payload)?),
        Command::FrameStart => Payload::FrameStart(decode_frame_start(payload)?),
        Command::ItemUpdate => Payload::ItemUpdate(decode_item_update(payload)?),
        Command::FrameBookend => Payload::FrameBookend(decode_frame_bookend(payload)?),
        Command::GeckoList => Payload::GeckoList(GeckoListPayload {
            codes: Bytes::copy_from_slice(payload),
        }),
    };

    Ok(Event {
        command,
        payload: decoded,
    })
}

fn decode_message_splitter(b: &[u8]) -> Result<MessageSplitterPayload, Error> {
    require_len(b, MESSAGE_SPLITTER_LEN)?;
    Ok(MessageSplitterPayload {
        data: Bytes::copy_from_slice(&b[0x0..0x200]),
        data_length: be_u16(b, 0x200),
        internal_command: b[0x202],
        last_message: b[0x203] != 0,
    })
}

fn decode_event_payloads(b: &[u8]) -> Result<EventPayloadsPayload, Error> {
    require_len(b, 1)?;
    let payload_size = b[0];
    let declared = payload_size as usize;
    require_len(b, declared)?;

    let mut payload_sizes = HashMap::new();
    let mut position = 1;
    // The descriptor length includes its own leading byte; the rest is
    // (command, size) triples.
    while position + 3 <= declared {
        payload_sizes.insert(b[position], be_u16(b, position + 1));
        position += 3;
    }

    Ok(EventPayloadsPayload {
        payload_size,
        payload_sizes,
    })
}

/// Decode one player slot from the game start payload.
fn decode_player_info(b: &[u8], slot: usize) -> Result<PlayerInfo, Error> {
    let info = 0x64 + PLAYER_BLOCK_STRIDE * slot;
    let fix = 0x140 + FIX_BLOCK_STRIDE * slot;
    let nametag = 0x160 + NAMETAG_STRIDE * slot;
    let display_name = 0x1A4 + DISPLAY_NAME_STRIDE * slot;
    let connect_code = 0x220 + CONNECT_CODE_STRIDE * slot;
    let slippi_uid = 0x248 + SLIPPI_UID_STRIDE * slot;

    Ok(PlayerInfo {
        index: slot as u8,
        port: slot as u8 + 1,
        character_id: b[info],
        player_type: PlayerType::from_u8(b[info + 0x1]),
        stock_start_count: b[info + 0x2],
        costume_index: b[info + 0x3],
        team_shade: TeamShade::from_u8(b[info + 0x7]),
        handicap: b[info + 0x8],
        team_id: TeamId::from_u8(b[info + 0x9]),
        player_bitfield: b[info + 0xC],
        cpu_level: b[info + 0xF],
        offense_ratio: be_f32(b, info + 0x18),
        defense_ratio: be_f32(b, info + 0x1C),
        model_scale: be_f32(b, info + 0x20),
        dashback_fix: DashbackFix::from_u32(be_u32(b, fix)),
        shield_drop_fix: ShieldDropFix::from_u32(be_u32(b, fix + 0x4)),
        nametag: decode_shift_jis(&b[nametag..nametag + NAMETAG_STRIDE])?,
        display_name: decode_shift_jis(&b[display_name..display_name + DISPLAY_NAME_STRIDE])?,
        connect_code: decode_shift_jis(&b[connect_code..connect_code + CONNECT_CODE_STRIDE])?,
        slippi_uid: decode_ascii(&b[slippi_uid..slippi_uid + SLIPPI_UID_STRIDE])?,
    })
}

fn decode_game_start(b: &[u8]) -> Result<GameStartPayload, Error> {
    require_len(b, GAME_START_LEN)?;

    let version = Version::new(b[0] as u64, b[1] as u64, b[2] as u64);

    let game_info_block = GameInfoBlock {
        game_bitfield_1: b[0x4],
        game_bitfield_2: b[0x5],
        game_bitfield_3: b[0x6],
        game_bitfield_4: b[0x7],
        bomb_rain: b[0xA],
        is_teams: b[0xC] != 0,
        item_spawn_behavior: ItemSpawnBehavior::from_i8(b[0xF] as i8),
        self_destruct_score_value: b[0x10] as i8,
        stage: be_u16(b, 0x12),
        game_timer: be_u32(b, 0x14),
        item_spawn_bitfield_1: b[0x27],
        item_spawn_bitfield_2: b[0x28],
        item_spawn_bitfield_3: b[0x29],
        item_spawn_bitfield_4: b[0x2A],
        item_spawn_bitfield_5: b[0x2B],
        damage_ratio: be_f32(b, 0x34),
    };

    let players = [
        decode_player_info(b, 0)?,
        decode_player_info(b, 1)?,
        decode_player_info(b, 2)?,
        decode_player_info(b, 3)?,
    ];

    Ok(GameStartPayload {
        version,
        game_info_block,
        players,
        random_seed: be_u32(b, 0x13C),
        pal: b[0x1A0] != 0,
        frozen_ps: b[0x1A1] != 0,
        minor_scene: b[0x1A2],
        major_scene: b[0x1A3],
        language: Language::from_u8(b[0x2BC]),
    })
}

fn decode_pre_frame(b: &[u8]) -> Result<PreFrameUpdatePayload, Error> {
    require_len(b, PRE_FRAME_LEN)?;
    Ok(PreFrameUpdatePayload {
        update: FrameUpdate {
            frame_number: be_i32(b, 0x0),
            player_index: b[0x4],
            is_follower: b[0x5] != 0,
            action_state_id: be_u16(b, 0xA),
            x_position: be_f32(b, 0xC),
            y_position: be_f32(b, 0x10),
            facing_direction: be_f32(b, 0x14),
            percent: be_f32(b, 0x3B),
        },
        random_seed: be_u32(b, 0x6),
        joystick_x: be_f32(b, 0x18),
        joystick_y: be_f32(b, 0x1C),
        c_stick_x: be_f32(b, 0x20),
        c_stick_y: be_f32(b, 0x24),
        trigger: be_f32(b, 0x28),
        processed_buttons: be_u32(b, 0x2C),
        physical_buttons: be_u16(b, 0x30),
        physical_l_trigger: be_f32(b, 0x32),
        physical_r_trigger: be_f32(b, 0x36),
        x_analog_ucf: b[0x3A],
    })
}

fn decode_post_frame(b: &[u8]) -> Result<PostFrameUpdatePayload, Error> {
    require_len(b, POST_FRAME_LEN)?;
    Ok(PostFrameUpdatePayload {
        update: FrameUpdate {
            frame_number: be_i32(b, 0x0),
            player_index: b[0x4],
            is_follower: b[0x5] != 0,
            action_state_id: be_u16(b, 0x7),
            x_position: be_f32(b, 0x9),
            y_position: be_f32(b, 0xD),
            facing_direction: be_f32(b, 0x11),
            percent: be_f32(b, 0x15),
        },
        internal_character_id: b[0x6],
        shield_size: be_f32(b, 0x19),
        last_hitting_attack_id: b[0x1D],
        current_combo_count: b[0x1E],
        last_hit_by: b[0x1F],
        stocks_remaining: b[0x20],
        action_state_frame_counter: be_f32(b, 0x21),
        state_bit_flags_1: b[0x25],
        state_bit_flags_2: b[0x26],
        state_bit_flags_3: b[0x27],
        state_bit_flags_4: b[0x28],
        state_bit_flags_5: b[0x29],
        misc_action_state: be_f32(b, 0x2A),
        airborne: b[0x2E] != 0,
        last_ground_id: be_u16(b, 0x2F),
        jumps_remaining: b[0x31],
        l_cancel_status: LCancelStatus::from_u8(b[0x32]),
        hurtbox_collision_state: HurtboxCollisionState::from_u8(b[0x33]),
        self_induced_air_x_speed: be_f32(b, 0x34),
        self_induced_y_speed: be_f32(b, 0x38),
        attack_based_x_speed: be_f32(b, 0x3C),
        attack_based_y_speed: be_f32(b, 0x40),
        self_induced_ground_x_speed: be_f32(b, 0x44),
        hitlag_frames_remaining: be_f32(b, 0x48),
        animation_index: be_u32(b, 0x4C),
    })
}

fn decode_game_end(b: &[u8]) -> Result<GameEndPayload, Error> {
    require_len(b, GAME_END_LEN)?;
    Ok(GameEndPayload {
        method: GameEndMethod::from_u8(b[0x0]),
        lras_initiator: b[0x1] as i8,
    })
}

fn decode_frame_start(b: &[u8]) -> Result<FrameStartPayload, Error> {
    require_len(b, FRAME_START_LEN)?;
    Ok(FrameStartPayload {
        frame_number: be_i32(b, 0x0),
        random_seed: be_u32(b, 0x4),
        scene_frame_counter: be_u32(b, 0x8),
    })
}

fn decode_item_update(b: &[u8]) -> Result<ItemUpdatePayload, Error> {
    require_len(b, ITEM_UPDATE_LEN)?;
    Ok(ItemUpdatePayload {
        frame_number: be_i32(b, 0x0),
        type_id: be_u16(b, 0x4),
        state: b[0x6],
        facing_direction: be_f32(b, 0x7),
        x_velocity: be_f32(b, 0xB),
        y_velocity: be_f32(b, 0xF),
        x_position: be_f32(b, 0x13),
        y_position: be_f32(b, 0x17),
        damage_taken: be_u16(b, 0x1B),
        expiration_timer: be_f32(b, 0x1D),
        spawn_id: be_u32(b, 0x21),
        samus_missile_type: b[0x25],
        peach_turnip_face: b[0x26],
        is_launched: b[0x27],
        charged_power: b[0x28],
        owner: b[0x29] as i8,
    })
}

fn decode_frame_bookend(b: &[u8]) -> Result<FrameBookendPayload, Error> {
    require_len(b, FRAME_BOOKEND_LEN)?;
    Ok(FrameBookendPayload {
        frame_number: be_i32(b, 0x0),
        latest_finalized_frame: be_i32(b, 0x4),
    })
}
