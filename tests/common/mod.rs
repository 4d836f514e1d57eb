//! Shared fixture builder: synthetic replay files assembled byte by byte.
#![allow(dead_code)] // not every test binary exercises every builder method

/// Initialize the global `tracing` subscriber for test output.
///
/// Uses `try_init()` so that repeated calls across tests in the same process
/// are silent no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Declared payload sizes for the standard command set.
pub const GAME_START_SIZE: u16 = 0x2BD;
pub const PRE_FRAME_SIZE: u16 = 0x3F;
pub const POST_FRAME_SIZE: u16 = 0x50;
pub const GAME_END_SIZE: u16 = 0x2;
pub const FRAME_START_SIZE: u16 = 0xC;
pub const ITEM_UPDATE_SIZE: u16 = 0x2A;
pub const FRAME_BOOKEND_SIZE: u16 = 0x8;

const PREAMBLE: [u8; 11] = [
    0x7B, 0x55, 0x03, 0x72, 0x61, 0x77, 0x5B, 0x24, 0x55, 0x23, 0x6C,
];

/// Builds a complete replay container around a raw event region.
pub struct ReplayBuilder {
    sizes: Vec<(u8, u16)>,
    events: Vec<u8>,
    metadata: Vec<u8>,
    truncate_metadata: bool,
}

impl ReplayBuilder {
    /// A builder declaring the full standard command set.
    pub fn standard() -> ReplayBuilder {
        ReplayBuilder::with_sizes(vec![
            (0x36, GAME_START_SIZE),
            (0x37, PRE_FRAME_SIZE),
            (0x38, POST_FRAME_SIZE),
            (0x39, GAME_END_SIZE),
            (0x3A, FRAME_START_SIZE),
            (0x3B, ITEM_UPDATE_SIZE),
            (0x3C, FRAME_BOOKEND_SIZE),
        ])
    }

    /// A builder declaring only the given command sizes.
    pub fn with_sizes(sizes: Vec<(u8, u16)>) -> ReplayBuilder {
        ReplayBuilder {
            sizes,
            events: Vec::new(),
            metadata: b"{}".to_vec(),
            truncate_metadata: false,
        }
    }

    /// Append a game start event. `player_types` holds the raw type byte per
    /// slot (0 human, 1 CPU, 3 empty); the major scene is the in-game scene.
    pub fn game_start(self, version: [u8; 3], player_types: [u8; 4]) -> Self {
        self.game_start_in_scene(version, player_types, 0x8)
    }

    /// Append a game start event with an explicit major scene.
    pub fn game_start_in_scene(
        mut self,
        version: [u8; 3],
        player_types: [u8; 4],
        major_scene: u8,
    ) -> Self {
        let mut payload = vec![0u8; GAME_START_SIZE as usize];
        payload[0..3].copy_from_slice(&version);
        payload[0x12..0x14].copy_from_slice(&0x1Fu16.to_be_bytes()); // stage
        for (slot, player_type) in player_types.iter().enumerate() {
            payload[0x65 + 0x24 * slot] = *player_type;
            payload[0x64 + 0x24 * slot] = 0x14; // external character
        }
        payload[0x1A3] = major_scene;

        self.events.push(0x36);
        self.events.extend_from_slice(&payload);
        self
    }

    pub fn pre_frame(mut self, frame: i32, player: u8) -> Self {
        let mut payload = vec![0u8; PRE_FRAME_SIZE as usize];
        payload[0..4].copy_from_slice(&frame.to_be_bytes());
        payload[0x4] = player;
        self.events.push(0x37);
        self.events.extend_from_slice(&payload);
        self
    }

    pub fn post_frame(mut self, frame: i32, player: u8, internal_character: u8) -> Self {
        let mut payload = vec![0u8; POST_FRAME_SIZE as usize];
        payload[0..4].copy_from_slice(&frame.to_be_bytes());
        payload[0x4] = player;
        payload[0x6] = internal_character;
        self.events.push(0x38);
        self.events.extend_from_slice(&payload);
        self
    }

    pub fn frame_bookend(mut self, frame: i32, latest_finalized: i32) -> Self {
        self.events.push(0x3C);
        self.events.extend_from_slice(&frame.to_be_bytes());
        self.events.extend_from_slice(&latest_finalized.to_be_bytes());
        self
    }

    /// Append a fully-transmitted frame for the given players.
    pub fn full_frame(mut self, frame: i32, players: &[u8]) -> Self {
        for player in players {
            self = self.pre_frame(frame, *player);
        }
        for player in players {
            self = self.post_frame(frame, *player, 0x14);
        }
        self.frame_bookend(frame, frame)
    }

    pub fn item_update(mut self, frame: i32) -> Self {
        let mut payload = vec![0u8; ITEM_UPDATE_SIZE as usize];
        payload[0..4].copy_from_slice(&frame.to_be_bytes());
        self.events.push(0x3B);
        self.events.extend_from_slice(&payload);
        self
    }

    pub fn game_end(mut self, method: u8, lras: i8) -> Self {
        self.events.push(0x39);
        self.events.push(method);
        self.events.push(lras as u8);
        self
    }

    /// Append arbitrary bytes to the raw region.
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.events.extend_from_slice(bytes);
        self
    }

    /// Replace the metadata document (a UBJSON object, braces included).
    pub fn metadata(mut self, doc: &[u8]) -> Self {
        self.metadata = doc.to_vec();
        self
    }

    /// Drop the metadata region entirely, as an in-progress recording would.
    pub fn without_metadata(mut self) -> Self {
        self.truncate_metadata = true;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let descriptor_length = 1 + 3 * self.sizes.len();
        let raw_length = 1 + descriptor_length + self.events.len();

        let mut file = Vec::new();
        file.extend_from_slice(&PREAMBLE);
        file.extend_from_slice(&(raw_length as u32).to_be_bytes());

        file.push(0x35);
        file.push(descriptor_length as u8);
        for (command, size) in &self.sizes {
            file.push(*command);
            file.extend_from_slice(&size.to_be_bytes());
        }
        file.extend_from_slice(&self.events);

        if !self.truncate_metadata {
            file.push(b'U');
            file.push(0x08);
            file.extend_from_slice(b"metadata");
            file.extend_from_slice(&self.metadata);
            file.push(b'}');
        }
        file
    }
}
