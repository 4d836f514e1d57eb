//! Typed Slippi event payloads.
//!
//! This module defines the command byte enumeration and one plain-data struct per
//! event payload. Field sets and value ranges follow the Slippi replay
//! specification; the byte-level offsets live in [`crate::codec`].

use std::collections::HashMap;

use bytes::Bytes;
use semver::Version;

/// A command byte identifying an event kind.
///
/// Recognized values are `0x10` (message splitter) and the contiguous range
/// `0x35..=0x3D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Fragment of an oversized event split across multiple messages.
    MessageSplitter = 0x10,
    /// The payload-size descriptor that opens every raw region.
    EventPayloads = 0x35,
    /// Game settings, player slots, and version.
    GameStart = 0x36,
    /// Per-player inputs and pre-simulation state for a frame.
    PreFrameUpdate = 0x37,
    /// Per-player resulting state after a frame simulates.
    PostFrameUpdate = 0x38,
    /// End-of-game marker.
    GameEnd = 0x39,
    /// Start-of-frame marker carrying the random seed.
    FrameStart = 0x3A,
    /// State of one item on one frame.
    ItemUpdate = 0x3B,
    /// End-of-frame marker reporting the finalization watermark.
    FrameBookend = 0x3C,
    /// Opaque Gecko code list.
    GeckoList = 0x3D,
}

impl Command {
    /// All recognized commands, in command-byte order.
    pub const ALL: [Command; 10] = [
        Command::MessageSplitter,
        Command::EventPayloads,
        Command::GameStart,
        Command::PreFrameUpdate,
        Command::PostFrameUpdate,
        Command::GameEnd,
        Command::FrameStart,
        Command::ItemUpdate,
        Command::FrameBookend,
        Command::GeckoList,
    ];

    /// Map a raw command byte to a `Command`, or `None` if unrecognized.
    pub fn from_byte(byte: u8) -> Option<Command> {
        match byte {
            0x10 => Some(Command::MessageSplitter),
            0x35 => Some(Command::EventPayloads),
            0x36 => Some(Command::GameStart),
            0x37 => Some(Command::PreFrameUpdate),
            0x38 => Some(Command::PostFrameUpdate),
            0x39 => Some(Command::GameEnd),
            0x3A => Some(Command::FrameStart),
            0x3B => Some(Command::ItemUpdate),
            0x3C => Some(Command::FrameBookend),
            0x3D => Some(Command::GeckoList),
            _ => None,
        }
    }

    /// The raw command byte.
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Whether a raw byte names a recognized command.
    pub fn is_known_byte(byte: u8) -> bool {
        Command::from_byte(byte).is_some()
    }
}

/// The occupancy of a player slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerType {
    Human,
    Cpu,
    Demo,
    /// The slot is unoccupied. Empty slots are filtered out of published game info.
    Empty,
    /// A value outside the documented range, preserved verbatim.
    Unknown(u8),
}

impl PlayerType {
    pub fn from_u8(value: u8) -> PlayerType {
        match value {
            0 => PlayerType::Human,
            1 => PlayerType::Cpu,
            2 => PlayerType::Demo,
            3 => PlayerType::Empty,
            other => PlayerType::Unknown(other),
        }
    }
}

/// Coloration shade for duplicate characters on one team.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeamShade {
    Normal,
    Light,
    Dark,
    Unknown(u8),
}

impl TeamShade {
    pub fn from_u8(value: u8) -> TeamShade {
        match value {
            0 => TeamShade::Normal,
            1 => TeamShade::Light,
            2 => TeamShade::Dark,
            other => TeamShade::Unknown(other),
        }
    }
}

/// Team color in teams mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeamId {
    Red,
    Blue,
    Green,
    Unknown(u8),
}

impl TeamId {
    pub fn from_u8(value: u8) -> TeamId {
        match value {
            0 => TeamId::Red,
            1 => TeamId::Blue,
            2 => TeamId::Green,
            other => TeamId::Unknown(other),
        }
    }
}

/// Controller fix applied to dashback inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DashbackFix {
    Off,
    Ucf,
    Dween,
    Unknown(u32),
}

impl DashbackFix {
    pub fn from_u32(value: u32) -> DashbackFix {
        match value {
            0 => DashbackFix::Off,
            1 => DashbackFix::Ucf,
            2 => DashbackFix::Dween,
            other => DashbackFix::Unknown(other),
        }
    }
}

/// Controller fix applied to shield-drop inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShieldDropFix {
    Off,
    Ucf,
    Dween,
    Unknown(u32),
}

impl ShieldDropFix {
    pub fn from_u32(value: u32) -> ShieldDropFix {
        match value {
            0 => ShieldDropFix::Off,
            1 => ShieldDropFix::Ucf,
            2 => ShieldDropFix::Dween,
            other => ShieldDropFix::Unknown(other),
        }
    }
}

/// Item spawn frequency selected in the game rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemSpawnBehavior {
    Off,
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
    Unknown(i8),
}

impl ItemSpawnBehavior {
    pub fn from_i8(value: i8) -> ItemSpawnBehavior {
        match value {
            -1 => ItemSpawnBehavior::Off,
            0 => ItemSpawnBehavior::VeryLow,
            1 => ItemSpawnBehavior::Low,
            2 => ItemSpawnBehavior::Medium,
            3 => ItemSpawnBehavior::High,
            4 => ItemSpawnBehavior::VeryHigh,
            other => ItemSpawnBehavior::Unknown(other),
        }
    }
}

/// In-game language option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Japanese,
    English,
    Unknown(u8),
}

impl Language {
    pub fn from_u8(value: u8) -> Language {
        match value {
            0 => Language::Japanese,
            1 => Language::English,
            other => Language::Unknown(other),
        }
    }
}

/// Outcome of an L-cancel attempt on this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LCancelStatus {
    None,
    Successful,
    Unsuccessful,
    Unknown(u8),
}

impl LCancelStatus {
    pub fn from_u8(value: u8) -> LCancelStatus {
        match value {
            0 => LCancelStatus::None,
            1 => LCancelStatus::Successful,
            2 => LCancelStatus::Unsuccessful,
            other => LCancelStatus::Unknown(other),
        }
    }
}

/// Hurtbox collision state after the frame simulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HurtboxCollisionState {
    Vulnerable,
    Invulnerable,
    Intangible,
    Unknown(u8),
}

impl HurtboxCollisionState {
    pub fn from_u8(value: u8) -> HurtboxCollisionState {
        match value {
            0 => HurtboxCollisionState::Vulnerable,
            1 => HurtboxCollisionState::Invulnerable,
            2 => HurtboxCollisionState::Intangible,
            other => HurtboxCollisionState::Unknown(other),
        }
    }
}

/// How the game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameEndMethod {
    Unresolved,
    Time,
    Game,
    Resolved,
    NoContest,
    Unknown(u8),
}

impl GameEndMethod {
    pub fn from_u8(value: u8) -> GameEndMethod {
        match value {
            0 => GameEndMethod::Unresolved,
            1 => GameEndMethod::Time,
            2 => GameEndMethod::Game,
            3 => GameEndMethod::Resolved,
            7 => GameEndMethod::NoContest,
            other => GameEndMethod::Unknown(other),
        }
    }
}

/// Information about one player slot, decoded from the game start event.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerInfo {
    /// Zero-based slot index.
    pub index: u8,
    /// One-based controller port.
    pub port: u8,
    /// External character ID.
    pub character_id: u8,
    /// Slot occupancy.
    pub player_type: PlayerType,
    /// Starting stock count.
    pub stock_start_count: u8,
    /// Costume index.
    pub costume_index: u8,
    /// Team shade for duplicate characters.
    pub team_shade: TeamShade,
    /// Handicap level.
    pub handicap: u8,
    /// Team color.
    pub team_id: TeamId,
    /// Raw per-player bitfield.
    pub player_bitfield: u8,
    /// CPU difficulty level.
    pub cpu_level: u8,
    /// Offense damage ratio.
    pub offense_ratio: f32,
    /// Defense damage ratio.
    pub defense_ratio: f32,
    /// Character model scale.
    pub model_scale: f32,
    /// Dashback controller fix.
    pub dashback_fix: DashbackFix,
    /// Shield-drop controller fix.
    pub shield_drop_fix: ShieldDropFix,
    /// In-game nametag (Shift-JIS). Empty means not set.
    pub nametag: String,
    /// Netplay display name (Shift-JIS). Empty means not set.
    pub display_name: String,
    /// Netplay connect code (Shift-JIS). Empty means not set.
    pub connect_code: String,
    /// Slippi user ID (ASCII). Empty means not set.
    pub slippi_uid: String,
}

/// The Melee game info block carried by the game start event.
#[derive(Debug, Clone, PartialEq)]
pub struct GameInfoBlock {
    pub game_bitfield_1: u8,
    pub game_bitfield_2: u8,
    pub game_bitfield_3: u8,
    pub game_bitfield_4: u8,
    pub bomb_rain: u8,
    pub is_teams: bool,
    pub item_spawn_behavior: ItemSpawnBehavior,
    pub self_destruct_score_value: i8,
    /// Stage ID.
    pub stage: u16,
    /// Game timer, in seconds.
    pub game_timer: u32,
    pub item_spawn_bitfield_1: u8,
    pub item_spawn_bitfield_2: u8,
    pub item_spawn_bitfield_3: u8,
    pub item_spawn_bitfield_4: u8,
    pub item_spawn_bitfield_5: u8,
    pub damage_ratio: f32,
}

/// Payload of the game start event (`0x36`).
#[derive(Debug, Clone, PartialEq)]
pub struct GameStartPayload {
    /// Replay format version.
    pub version: Version,
    /// Game rules block.
    pub game_info_block: GameInfoBlock,
    /// All four player slots, including empty ones.
    pub players: [PlayerInfo; 4],
    /// Initial random seed.
    pub random_seed: u32,
    /// Whether the game is PAL.
    pub pal: bool,
    /// Whether Pokemon Stadium is frozen.
    pub frozen_ps: bool,
    /// Minor scene ID.
    pub minor_scene: u8,
    /// Major scene ID. `0x8` is the in-game scene.
    pub major_scene: u8,
    /// Language option.
    pub language: Language,
}

/// Fields common to pre- and post-frame updates.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameUpdate {
    /// Frame number. `-123` is the first in-match frame.
    pub frame_number: i32,
    /// Zero-based player slot index.
    pub player_index: u8,
    /// Whether this update describes a follower (Nana).
    pub is_follower: bool,
    /// Action state ID.
    pub action_state_id: u16,
    pub x_position: f32,
    pub y_position: f32,
    pub facing_direction: f32,
    pub percent: f32,
}

/// Payload of the pre-frame update event (`0x37`).
#[derive(Debug, Clone, PartialEq)]
pub struct PreFrameUpdatePayload {
    /// Fields shared with the post-frame update.
    pub update: FrameUpdate,
    pub random_seed: u32,
    pub joystick_x: f32,
    pub joystick_y: f32,
    pub c_stick_x: f32,
    pub c_stick_y: f32,
    pub trigger: f32,
    pub processed_buttons: u32,
    pub physical_buttons: u16,
    pub physical_l_trigger: f32,
    pub physical_r_trigger: f32,
    /// UCF X-analog value.
    pub x_analog_ucf: u8,
}

/// Payload of the post-frame update event (`0x38`).
#[derive(Debug, Clone, PartialEq)]
pub struct PostFrameUpdatePayload {
    /// Fields shared with the pre-frame update.
    pub update: FrameUpdate,
    /// Internal character ID (differs from the external ID for some transforms).
    pub internal_character_id: u8,
    pub shield_size: f32,
    pub last_hitting_attack_id: u8,
    pub current_combo_count: u8,
    pub last_hit_by: u8,
    pub stocks_remaining: u8,
    pub action_state_frame_counter: f32,
    pub state_bit_flags_1: u8,
    pub state_bit_flags_2: u8,
    pub state_bit_flags_3: u8,
    pub state_bit_flags_4: u8,
    pub state_bit_flags_5: u8,
    pub misc_action_state: f32,
    pub airborne: bool,
    pub last_ground_id: u16,
    pub jumps_remaining: u8,
    pub l_cancel_status: LCancelStatus,
    pub hurtbox_collision_state: HurtboxCollisionState,
    pub self_induced_air_x_speed: f32,
    pub self_induced_y_speed: f32,
    pub attack_based_x_speed: f32,
    pub attack_based_y_speed: f32,
    pub self_induced_ground_x_speed: f32,
    pub hitlag_frames_remaining: f32,
    pub animation_index: u32,
}

/// Payload of the game end event (`0x39`).
#[derive(Debug, Clone, PartialEq)]
pub struct GameEndPayload {
    /// How the game ended.
    pub method: GameEndMethod,
    /// Player index that initiated an LRAS quit-out, or `-1`.
    pub lras_initiator: i8,
}

/// Payload of the frame start event (`0x3A`).
#[derive(Debug, Clone, PartialEq)]
pub struct FrameStartPayload {
    pub frame_number: i32,
    pub random_seed: u32,
    pub scene_frame_counter: u32,
}

/// Payload of the item update event (`0x3B`).
#[derive(Debug, Clone, PartialEq)]
pub struct ItemUpdatePayload {
    pub frame_number: i32,
    pub type_id: u16,
    pub state: u8,
    pub facing_direction: f32,
    pub x_velocity: f32,
    pub y_velocity: f32,
    pub x_position: f32,
    pub y_position: f32,
    pub damage_taken: u16,
    pub expiration_timer: f32,
    pub spawn_id: u32,
    pub samus_missile_type: u8,
    pub peach_turnip_face: u8,
    pub is_launched: u8,
    pub charged_power: u8,
    /// Owning player index, or `-1` for no owner.
    pub owner: i8,
}

/// Payload of the frame bookend event (`0x3C`).
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBookendPayload {
    /// The frame whose updates are now fully transmitted.
    pub frame_number: i32,
    /// The newest frame known to be finalized (will not be rolled back).
    pub latest_finalized_frame: i32,
}

/// Payload of the Gecko list event (`0x3D`). The code list is opaque.
#[derive(Debug, Clone, PartialEq)]
pub struct GeckoListPayload {
    pub codes: Bytes,
}

/// Payload of the message splitter event (`0x10`).
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSplitterPayload {
    /// Fixed 512-byte fragment buffer.
    pub data: Bytes,
    /// Number of meaningful bytes in `data`.
    pub data_length: u16,
    /// Command byte of the event being reassembled.
    pub internal_command: u8,
    /// Whether this fragment completes the message.
    pub last_message: bool,
}

/// Payload of the payload-size descriptor event (`0x35`).
#[derive(Debug, Clone, PartialEq)]
pub struct EventPayloadsPayload {
    /// Size of the descriptor itself, including this byte.
    pub payload_size: u8,
    /// Declared payload size for every subsequent command byte.
    pub payload_sizes: HashMap<u8, u16>,
}

/// A decoded event payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    MessageSplitter(MessageSplitterPayload),
    EventPayloads(EventPayloadsPayload),
    GameStart(GameStartPayload),
    PreFrameUpdate(PreFrameUpdatePayload),
    PostFrameUpdate(PostFrameUpdatePayload),
    GameEnd(GameEndPayload),
    FrameStart(FrameStartPayload),
    ItemUpdate(ItemUpdatePayload),
    FrameBookend(FrameBookendPayload),
    GeckoList(GeckoListPayload),
}

/// A decoded event: the command byte plus its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub command: Command,
    pub payload: Payload,
}
