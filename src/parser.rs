//! Rollback-aware frame assembly.
//!
//! The `Parser` is the single logical consumer of the reader's event stream. It
//! indexes pre/post updates and items by frame number, detects rollback
//! retransmissions, finalizes frames strictly in order, and fans lifecycle
//! events out through its [`Broker`].
//!
//! Netplay rollback means the same logical frame may arrive multiple times with
//! different contents; only the last transmission is canonical. The rollback
//! ledger keeps the losing copies, the live frame map keeps the winner.

use std::collections::HashMap;
use std::sync::Arc;

use semver::Version;
use tokio::sync::mpsc;

use crate::broker::{Broker, ParserEvent, ParserUpdate, Sink};
use crate::error::{Error, UpdateSide};
use crate::events::{
    Command, Event, FrameBookendPayload, FrameUpdate, GameEndPayload, GameStartPayload,
    ItemUpdatePayload, Payload, PlayerInfo, PlayerType, PostFrameUpdatePayload,
    PreFrameUpdatePayload,
};

/// The engine never rolls back further than this many frames.
pub const MAX_ROLLBACK_FRAMES: i32 = 7;

/// Sentinel frame index meaning "no frame seen yet".
const NO_FRAME: i32 = -124;

/// The first in-match frame number.
const FIRST_FRAME: i32 = -123;

/// Major scene ID of the in-game scene.
const IN_GAME_SCENE: u8 = 0x8;

/// Replays at or above this version complete game info at game start.
fn info_at_start_version() -> Version {
    Version::new(1, 6, 0)
}

/// Replays at or above this version finalize frames via bookends; older ones
/// emit every update synchronously.
fn bookend_version() -> Version {
    Version::new(2, 2, 0)
}

/// Options controlling parser behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParserOptions {
    /// In strict mode, incomplete frames and bookends outside the rollback
    /// window are errors instead of being silently tolerated.
    pub strict: bool,
}

/// Pre- and post-frame updates for one character on one frame. Either side may
/// be absent while the frame is still in flight.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameUpdates {
    pub pre: Option<PreFrameUpdatePayload>,
    pub post: Option<PostFrameUpdatePayload>,
}

/// All updates received for one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameEntry {
    /// Main characters, keyed by player index.
    pub players: HashMap<u8, FrameUpdates>,
    /// Followers (Nana), keyed by player index.
    pub followers: HashMap<u8, FrameUpdates>,
    /// Item updates in arrival order.
    pub items: Vec<ItemUpdatePayload>,
    /// Whether a bookend marked this frame's transfer complete.
    pub is_transfer_complete: bool,
}

/// General information about a game, published on `Started`.
#[derive(Debug, Clone, PartialEq)]
pub struct GameInfo {
    /// Replay format version.
    pub version: Version,
    /// Whether the game is in teams mode.
    pub teams: bool,
    /// Whether the game is PAL.
    pub pal: bool,
    /// Stage ID.
    pub stage: u16,
    /// Occupied player slots only; empty slots are filtered out.
    pub players: Vec<PlayerInfo>,
    /// Major scene ID. `0x8` is the in-game scene.
    pub major_scene: u8,
    /// Minor scene ID.
    pub minor_scene: u8,
}

/// Ledger of rollback retransmissions.
///
/// The ledger latches onto the first player index it observes and ignores the
/// others; one player's pre-frame updates are enough to witness every
/// retransmission. Only the losing copies are recorded here -- the canonical
/// copy is whatever remains in the live frame map.
#[derive(Debug, Default)]
pub struct Rollbacks {
    /// Losing frame snapshots, keyed by frame number, in retransmission order.
    pub frames: HashMap<i32, Vec<FrameEntry>>,
    /// Total number of rolled-back frames observed.
    pub count: usize,
    /// Length of each completed run of consecutive rolled-back frames.
    pub lengths: Vec<usize>,
    player_index: Option<u8>,
    last_frame_was_rollback: bool,
    current_rollback_length: usize,
}

impl Rollbacks {
    /// Record a potential rollback observation for `frame_index`.
    ///
    /// `prior` is the frame entry that existed before the incoming pre-frame
    /// update, if any. A present entry means the frame is being retransmitted:
    /// the prior copy is recorded as a losing snapshot and the current run
    /// grows. An absent entry closes any open run.
    ///
    /// Returns whether the incoming update is a rollback.
    fn check_if_rollback_frame(
        &mut self,
        frame_index: i32,
        prior: Option<&FrameEntry>,
        player_index: u8,
    ) -> bool {
        match self.player_index {
            None => self.player_index = Some(player_index),
            Some(latched) if latched != player_index => return false,
            Some(_) => {}
        }

        if let Some(prior) = prior {
            self.frames.entry(frame_index).or_default().push(prior.clone());
            self.count += 1;
            self.current_rollback_length += 1;
            self.last_frame_was_rollback = true;
        } else if self.last_frame_was_rollback {
            self.lengths.push(self.current_rollback_length);
            self.current_rollback_length = 0;
            self.last_frame_was_rollback = false;
        }

        self.last_frame_was_rollback
    }
}

/// Stateful consumer that reassembles the event stream into frames.
pub struct Parser {
    options: ParserOptions,
    frames: HashMap<i32, FrameEntry>,
    rollbacks: Rollbacks,
    game_info: Option<GameInfo>,
    game_end: Option<GameEndPayload>,
    broker: Broker,
    latest_frame_index: i32,
    last_finalized_frame: i32,
    game_info_complete: bool,
}

impl Parser {
    /// Create a parser with the given options and no subscribers.
    pub fn new(options: ParserOptions) -> Parser {
        Parser {
            options,
            frames: HashMap::new(),
            rollbacks: Rollbacks::default(),
            game_info: None,
            game_end: None,
            broker: Broker::new(),
            latest_frame_index: NO_FRAME,
            last_finalized_frame: NO_FRAME,
            game_info_complete: false,
        }
    }

    /// Reset all frame-related state. Options and subscribers are preserved.
    pub fn reset(&mut self) {
        self.frames = HashMap::new();
        self.rollbacks = Rollbacks::default();
        self.game_info = None;
        self.game_end = None;
        self.latest_frame_index = NO_FRAME;
        self.last_finalized_frame = NO_FRAME;
        self.game_info_complete = false;
    }

    /// Attach a sink to a lifecycle event.
    pub fn subscribe(&mut self, event: ParserEvent, sink: Sink) {
        self.broker.subscribe(event, sink);
    }

    /// Create a channel subscribed to a lifecycle event and return its
    /// receiving half.
    pub fn subscribe_channel(
        &mut self,
        event: ParserEvent,
    ) -> mpsc::UnboundedReceiver<ParserUpdate> {
        self.broker.subscribe_channel(event)
    }

    /// Detach one sink from a lifecycle event.
    pub fn unsubscribe(&mut self, event: ParserEvent, sink: &Sink) {
        self.broker.unsubscribe(event, sink);
    }

    /// Detach every sink from a lifecycle event.
    pub fn unsubscribe_all(&mut self, event: ParserEvent) {
        self.broker.unsubscribe_all(event);
    }

    /// The broker carrying this parser's subscriptions.
    pub fn broker_mut(&mut self) -> &mut Broker {
        &mut self.broker
    }

    /// All frames received so far, keyed by frame number.
    pub fn frames(&self) -> &HashMap<i32, FrameEntry> {
        &self.frames
    }

    /// The rollback ledger.
    pub fn rollbacks(&self) -> &Rollbacks {
        &self.rollbacks
    }

    /// The game end payload, once seen.
    pub fn game_end(&self) -> Option<&GameEndPayload> {
        self.game_end.as_ref()
    }

    /// The current game info and whether it is complete.
    ///
    /// Info exists from game start onward but may still be missing the
    /// character-mapping corrections applied during the countdown frames;
    /// `complete` reports whether those are settled.
    pub fn game_info(&self) -> (Option<&GameInfo>, bool) {
        (self.game_info.as_ref(), self.game_info_complete)
    }

    /// Whether game info is complete.
    pub fn game_info_complete(&self) -> bool {
        self.game_info_complete
    }

    /// The newest frame number seen, or `-124` if none.
    pub fn latest_frame_index(&self) -> i32 {
        self.latest_frame_index
    }

    /// The newest finalized frame number, or `-124` if none.
    pub fn last_finalized_frame(&self) -> i32 {
        self.last_finalized_frame
    }

    /// Number of playable frames parsed so far.
    pub fn playable_frame_count(&self) -> i32 {
        if self.latest_frame_index < -39 {
            return 0;
        }
        self.latest_frame_index + 39
    }

    /// The latest frame parsed, if present.
    ///
    /// The index is clamped to the first in-match frame, and steps back one
    /// frame once the game end has been seen (the final frame is cut short).
    pub fn latest_frame(&self) -> Option<&FrameEntry> {
        let mut frame_index = self.latest_frame_index.max(FIRST_FRAME);
        if self.game_end.is_some() {
            frame_index -= 1;
        }
        self.frames.get(&frame_index)
    }

    /// Consume events until the channel closes or an error arrives.
    ///
    /// On any error -- in-band from the reader, or from this parser's own
    /// handling -- the remaining in-flight events are drained from the channel
    /// before the error is returned, so an aborted parse never leaves the
    /// reader task blocked on a full queue.
    ///
    /// # Errors
    ///
    /// Returns the first reader or handling error encountered.
    pub async fn parse_replay(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<Result<Event, Error>>,
    ) -> Result<(), Error> {
        while let Some(result) = events.recv().await {
            let outcome = match result {
                Ok(event) => self.handle_event(&event),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                Self::flush(events);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drain a closed or abandoned event channel.
    fn flush(events: &mut mpsc::UnboundedReceiver<Result<Event, Error>>) {
        events.close();
        while events.try_recv().is_ok() {}
    }

    /// Apply one event to the parser state.
    ///
    /// Events that do not participate in frame assembly (frame start, gecko
    /// list, message splitter, the payload-size descriptor) are ignored.
    ///
    /// # Errors
    ///
    /// Returns strict-mode finalization and rollback-window errors.
    pub fn handle_event(&mut self, event: &Event) -> Result<(), Error> {
        match (&event.command, &event.payload) {
            (Command::GameStart, Payload::GameStart(payload)) => {
                self.handle_game_start(payload);
                Ok(())
            }
            (Command::PreFrameUpdate, Payload::PreFrameUpdate(payload)) => {
                self.handle_pre_frame(payload)
            }
            (Command::PostFrameUpdate, Payload::PostFrameUpdate(payload)) => {
                self.handle_post_frame(payload)
            }
            (Command::GameEnd, Payload::GameEnd(payload)) => self.handle_game_end(payload),
            (Command::ItemUpdate, Payload::ItemUpdate(payload)) => {
                self.handle_item_update(payload);
                Ok(())
            }
            (Command::FrameBookend, Payload::FrameBookend(payload)) => {
                self.handle_frame_bookend(payload)
            }
            _ => Ok(()),
        }
    }

    fn handle_game_start(&mut self, payload: &GameStartPayload) {
        let players: Vec<PlayerInfo> = payload
            .players
            .iter()
            .filter(|player| player.player_type != PlayerType::Empty)
            .cloned()
            .collect();

        self.game_info = Some(GameInfo {
            version: payload.version.clone(),
            teams: payload.game_info_block.is_teams,
            pal: payload.pal,
            stage: payload.game_info_block.stage,
            players,
            major_scene: payload.major_scene,
            minor_scene: payload.minor_scene,
        });

        if payload.version >= info_at_start_version() {
            self.complete_game_info();
        }
    }

    fn handle_pre_frame(&mut self, payload: &PreFrameUpdatePayload) -> Result<(), Error> {
        let FrameUpdate {
            frame_number,
            player_index,
            is_follower,
            ..
        } = payload.update;

        self.latest_frame_index = frame_number;

        if !is_follower {
            // The entry existing before this pre-frame update means the frame
            // is being retransmitted; the existing copy is the one that loses.
            let prior = self.frames.get(&frame_number).cloned();
            let is_rollback = self.rollbacks.check_if_rollback_frame(
                frame_number,
                prior.as_ref(),
                player_index,
            );
            if is_rollback && let Some(losing) = prior {
                tracing::debug!(frame = frame_number, "rollback detected");
                self.broker
                    .emit(ParserEvent::RollbackFrame, ParserUpdate::Frame(Arc::new(losing)));
            }
        }

        let entry = self.frames.entry(frame_number).or_default();
        let side = if is_follower {
            &mut entry.followers
        } else {
            &mut entry.players
        };
        side.entry(player_index).or_default().pre = Some(payload.clone());

        self.after_frame_update(frame_number)
    }

    fn handle_post_frame(&mut self, payload: &PostFrameUpdatePayload) -> Result<(), Error> {
        let FrameUpdate {
            frame_number,
            player_index,
            is_follower,
            ..
        } = payload.update;

        self.latest_frame_index = frame_number;

        let entry = self.frames.entry(frame_number).or_default();
        let side = if is_follower {
            &mut entry.followers
        } else {
            &mut entry.players
        };
        side.entry(player_index).or_default().post = Some(payload.clone());

        self.after_frame_update(frame_number)?;

        // During the countdown, the reported internal character resolves the
        // Zelda/Sheik ambiguity in the game start block.
        if frame_number <= FIRST_FRAME
            && let Some(info) = &mut self.game_info
        {
            for player in info.players.iter_mut().filter(|p| p.index == player_index) {
                match payload.internal_character_id {
                    0x7 => player.character_id = 0x13,
                    0x13 => player.character_id = 0x12,
                    _ => {}
                }
            }
        }

        if frame_number > FIRST_FRAME {
            self.complete_game_info();
        }

        Ok(())
    }

    /// Shared tail of pre- and post-frame handling: synchronous emission for
    /// replay versions that predate bookends, otherwise the frame stays marked
    /// in-flight until its bookend arrives.
    fn after_frame_update(&mut self, frame_number: i32) -> Result<(), Error> {
        let synchronous = matches!(
            &self.game_info,
            Some(info) if info.version < bookend_version()
        );

        if synchronous {
            if let Some(entry) = self.frames.get(&frame_number) {
                self.broker
                    .emit(ParserEvent::Frame, ParserUpdate::Frame(Arc::new(entry.clone())));
            }
            self.finalize_frames(frame_number - 1)
        } else {
            if let Some(entry) = self.frames.get_mut(&frame_number) {
                entry.is_transfer_complete = false;
            }
            Ok(())
        }
    }

    fn handle_item_update(&mut self, payload: &ItemUpdatePayload) {
        self.frames
            .entry(payload.frame_number)
            .or_default()
            .items
            .push(payload.clone());
    }

    fn handle_frame_bookend(&mut self, payload: &FrameBookendPayload) -> Result<(), Error> {
        let frame_number = payload.frame_number;
        let latest_finalized = payload.latest_finalized_frame;

        let entry = self.frames.entry(frame_number).or_default();
        entry.is_transfer_complete = true;
        let snapshot = entry.clone();
        self.broker
            .emit(ParserEvent::Frame, ParserUpdate::Frame(Arc::new(snapshot)));

        let in_game_scene = matches!(
            &self.game_info,
            Some(info) if info.major_scene == IN_GAME_SCENE
        );

        if in_game_scene && latest_finalized >= FIRST_FRAME {
            if self.options.strict && latest_finalized < frame_number - MAX_ROLLBACK_FRAMES {
                return Err(Error::RollbackWindowViolation {
                    frame: frame_number,
                    window: MAX_ROLLBACK_FRAMES,
                });
            }
            self.finalize_frames(latest_finalized)
        } else {
            self.finalize_frames(frame_number - MAX_ROLLBACK_FRAMES)
        }
    }

    fn handle_game_end(&mut self, payload: &GameEndPayload) -> Result<(), Error> {
        let mut result = Ok(());
        if self.latest_frame_index > NO_FRAME
            && self.latest_frame_index != self.last_finalized_frame
        {
            result = self.finalize_frames(self.latest_frame_index);
        }

        self.game_end = Some(payload.clone());
        self.broker.emit(
            ParserEvent::Ended,
            ParserUpdate::GameEnd(Arc::new(payload.clone())),
        );

        // The end event is observed even when the trailing finalization
        // failed; the failure is still reported to the caller.
        result
    }

    /// Finalize frames in order up through `target`.
    ///
    /// A missing frame halts finalization silently: the gap will be filled by
    /// a later retransmission or the replay is simply truncated. In strict
    /// mode every game-info player must have both update sides present
    /// (tolerating absent players when more than two are in the game).
    fn finalize_frames(&mut self, target: i32) -> Result<(), Error> {
        while self.last_finalized_frame < target {
            let to_finalize = self.last_finalized_frame + 1;
            let Some(frame) = self.frames.get(&to_finalize) else {
                return Ok(());
            };

            if self.options.strict
                && let Some(info) = &self.game_info
            {
                for player in &info.players {
                    match frame.players.get(&player.index) {
                        None => {
                            if info.players.len() > 2 {
                                continue;
                            }
                            return Err(Error::MissingFrameUpdate {
                                frame: to_finalize,
                                target,
                                side: UpdateSide::Pre,
                                player: player.index,
                            });
                        }
                        Some(updates) => {
                            if updates.pre.is_none() || updates.post.is_none() {
                                let side = if updates.pre.is_none() {
                                    UpdateSide::Pre
                                } else {
                                    UpdateSide::Post
                                };
                                return Err(Error::MissingFrameUpdate {
                                    frame: to_finalize,
                                    target,
                                    side,
                                    player: player.index,
                                });
                            }
                        }
                    }
                }
            }

            let snapshot = frame.clone();
            self.broker.emit(
                ParserEvent::FinalizedFrame,
                ParserUpdate::Frame(Arc::new(snapshot)),
            );
            self.last_finalized_frame = to_finalize;
        }

        Ok(())
    }

    /// Mark game info complete and announce it. Re-completion is a no-op.
    fn complete_game_info(&mut self) {
        if self.game_info_complete {
            return;
        }

        self.game_info_complete = true;
        if let Some(info) = &self.game_info {
            self.broker.emit(
                ParserEvent::Started,
                ParserUpdate::GameInfo(Arc::new(info.clone())),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{
        GameEndMethod, GameInfoBlock, ItemSpawnBehavior, Language, TeamId, TeamShade,
    };

    fn player(index: u8, player_type: PlayerType) -> PlayerInfo {
        PlayerInfo {
            index,
            port: index + 1,
            character_id: 0x14,
            player_type,
            stock_start_count: 4,
            costume_index: 0,
            team_shade: TeamShade::Normal,
            handicap: 9,
            team_id: TeamId::Red,
            player_bitfield: 0,
            cpu_level: 1,
            offense_ratio: 1.0,
            defense_ratio: 1.0,
            model_scale: 1.0,
            dashback_fix: crate::events::DashbackFix::Ucf,
            shield_drop_fix: crate::events::ShieldDropFix::Ucf,
            nametag: String::new(),
            display_name: String::new(),
            connect_code: String::new(),
            slippi_uid: String::new(),
        }
    }

    fn game_start(version: (u64, u64, u64), types: [PlayerType; 4]) -> Event {
        let players = [
            player(0, types[0]),
            player(1, types[1]),
            player(2, types[2]),
            player(3, types[3]),
        ];
        Event {
            command: Command::GameStart,
            payload: Payload::GameStart(GameStartPayload {
                version: Version::new(version.0, version.1, version.2),
                game_info_block: GameInfoBlock {
                    game_bitfield_1: 0,
                    game_bitfield_2: 0,
                    game_bitfield_3: 0,
                    game_bitfield_4: 0,
                    bomb_rain: 0,
                    is_teams: false,
                    item_spawn_behavior: ItemSpawnBehavior::Off,
                    self_destruct_score_value: -1,
                    stage: 0x1F,
                    game_timer: 480,
                    item_spawn_bitfield_1: 0,
                    item_spawn_bitfield_2: 0,
                    item_spawn_bitfield_3: 0,
                    item_spawn_bitfield_4: 0,
                    item_spawn_bitfield_5: 0,
                    damage_ratio: 1.0,
                },
                players,
                random_seed: 0,
                pal: false,
                frozen_ps: false,
                minor_scene: 0x2,
                major_scene: IN_GAME_SCENE,
                language: Language::English,
            }),
        }
    }

    fn frame_update(frame_number: i32, player_index: u8, is_follower: bool) -> FrameUpdate {
        FrameUpdate {
            frame_number,
            player_index,
            is_follower,
            action_state_id: 0x0E,
            x_position: 0.0,
            y_position: 0.0,
            facing_direction: 1.0,
            percent: 0.0,
        }
    }

    fn pre_frame(frame_number: i32, player_index: u8) -> Event {
        Event {
            command: Command::PreFrameUpdate,
            payload: Payload::PreFrameUpdate(PreFrameUpdatePayload {
                update: frame_update(frame_number, player_index, false),
                random_seed: 0,
                joystick_x: 0.0,
                joystick_y: 0.0,
                c_stick_x: 0.0,
                c_stick_y: 0.0,
                trigger: 0.0,
                processed_buttons: 0,
                physical_buttons: 0,
                physical_l_trigger: 0.0,
                physical_r_trigger: 0.0,
                x_analog_ucf: 0,
            }),
        }
    }

    fn post_frame(frame_number: i32, player_index: u8, internal_character_id: u8) -> Event {
        Event {
            command: Command::PostFrameUpdate,
            payload: Payload::PostFrameUpdate(PostFrameUpdatePayload {
                update: frame_update(frame_number, player_index, false),
                internal_character_id,
                shield_size: 60.0,
                last_hitting_attack_id: 0,
                current_combo_count: 0,
                last_hit_by: 0,
                stocks_remaining: 4,
                action_state_frame_counter: 0.0,
                state_bit_flags_1: 0,
                state_bit_flags_2: 0,
                state_bit_flags_3: 0,
                state_bit_flags_4: 0,
                state_bit_flags_5: 0,
                misc_action_state: 0.0,
                airborne: false,
                last_ground_id: 0,
                jumps_remaining: 1,
                l_cancel_status: crate::events::LCancelStatus::None,
                hurtbox_collision_state: crate::events::HurtboxCollisionState::Vulnerable,
                self_induced_air_x_speed: 0.0,
                self_induced_y_speed: 0.0,
                attack_based_x_speed: 0.0,
                attack_based_y_speed: 0.0,
                self_induced_ground_x_speed: 0.0,
                hitlag_frames_remaining: 0.0,
                animation_index: 0,
            }),
        }
    }

    fn bookend(frame_number: i32, latest_finalized_frame: i32) -> Event {
        Event {
            command: Command::FrameBookend,
            payload: Payload::FrameBookend(FrameBookendPayload {
                frame_number,
                latest_finalized_frame,
            }),
        }
    }

    fn item_update(frame_number: i32) -> Event {
        Event {
            command: Command::ItemUpdate,
            payload: Payload::ItemUpdate(ItemUpdatePayload {
                frame_number,
                type_id: 0x30,
                state: 0,
                facing_direction: 1.0,
                x_velocity: 0.0,
                y_velocity: 0.0,
                x_position: 0.0,
                y_position: 0.0,
                damage_taken: 0,
                expiration_timer: 0.0,
                spawn_id: 0,
                samus_missile_type: 0,
                peach_turnip_face: 0,
                is_launched: 0,
                charged_power: 0,
                owner: -1,
            }),
        }
    }

    fn game_end() -> Event {
        Event {
            command: Command::GameEnd,
            payload: Payload::GameEnd(GameEndPayload {
                method: GameEndMethod::Game,
                lras_initiator: -1,
            }),
        }
    }

    /// Feed a full bookended frame for players 0 and 1.
    fn feed_frame(parser: &mut Parser, n: i32) {
        parser.handle_event(&pre_frame(n, 0)).expect("pre 0");
        parser.handle_event(&pre_frame(n, 1)).expect("pre 1");
        parser.handle_event(&post_frame(n, 0, 0x14)).expect("post 0");
        parser.handle_event(&post_frame(n, 1, 0x14)).expect("post 1");
        parser.handle_event(&bookend(n, n)).expect("bookend");
    }

    fn two_player_start() -> Event {
        game_start(
            (3, 0, 0),
            [
                PlayerType::Human,
                PlayerType::Human,
                PlayerType::Empty,
                PlayerType::Empty,
            ],
        )
    }

    #[test]
    fn started_fires_at_game_start_for_modern_versions() {
        let mut parser = Parser::new(ParserOptions::default());
        let mut started = parser.subscribe_channel(ParserEvent::Started);

        parser.handle_event(&two_player_start()).expect("start");

        let update = started.try_recv().expect("Started should fire");
        match update {
            ParserUpdate::GameInfo(info) => {
                assert_eq!(info.version, Version::new(3, 0, 0));
                assert_eq!(info.players.len(), 2, "empty slots filtered");
                assert_eq!(info.stage, 0x1F);
            }
            other => panic!("expected GameInfo update, got: {other:?}"),
        }
        assert!(parser.game_info_complete());
    }

    #[test]
    fn started_waits_for_first_in_match_post_frame_on_old_versions() {
        let mut parser = Parser::new(ParserOptions::default());
        let mut started = parser.subscribe_channel(ParserEvent::Started);

        let start = game_start(
            (1, 5, 0),
            [
                PlayerType::Human,
                PlayerType::Human,
                PlayerType::Empty,
                PlayerType::Empty,
            ],
        );
        parser.handle_event(&start).expect("start");
        assert!(started.try_recv().is_err(), "not complete at game start");

        // Countdown post-frames do not complete it either.
        parser.handle_event(&post_frame(-123, 0, 0x14)).expect("post");
        assert!(started.try_recv().is_err());

        parser.handle_event(&post_frame(-122, 0, 0x14)).expect("post");
        assert!(started.try_recv().is_ok(), "complete at frame > -123");
    }

    #[test]
    fn version_1_6_0_exactly_completes_at_game_start() {
        let mut parser = Parser::new(ParserOptions::default());
        let mut started = parser.subscribe_channel(ParserEvent::Started);
        let start = game_start(
            (1, 6, 0),
            [
                PlayerType::Human,
                PlayerType::Empty,
                PlayerType::Empty,
                PlayerType::Empty,
            ],
        );
        parser.handle_event(&start).expect("start");
        assert!(started.try_recv().is_ok());
    }

    #[test]
    fn started_is_one_shot() {
        let mut parser = Parser::new(ParserOptions::default());
        let mut started = parser.subscribe_channel(ParserEvent::Started);

        parser.handle_event(&two_player_start()).expect("start");
        parser.handle_event(&post_frame(-120, 0, 0x14)).expect("post");

        assert!(started.try_recv().is_ok());
        assert!(started.try_recv().is_err(), "re-completion is a no-op");
    }

    #[test]
    fn countdown_post_frames_patch_character_mappings() {
        let mut parser = Parser::new(ParserOptions::default());
        let start = game_start(
            (1, 5, 0),
            [
                PlayerType::Human,
                PlayerType::Human,
                PlayerType::Empty,
                PlayerType::Empty,
            ],
        );
        parser.handle_event(&start).expect("start");

        // Internal 0x7 maps the slot to external 0x13; internal 0x13 to 0x12.
        parser.handle_event(&post_frame(-123, 0, 0x7)).expect("post");
        parser.handle_event(&post_frame(-123, 1, 0x13)).expect("post");

        let (info, _) = parser.game_info();
        let info = info.expect("game info");
        assert_eq!(info.players[0].character_id, 0x13);
        assert_eq!(info.players[1].character_id, 0x12);
    }

    #[test]
    fn character_patch_applies_on_countdown_frames_only() {
        let mut parser = Parser::new(ParserOptions::default());
        parser.handle_event(&two_player_start()).expect("start");

        // Countdown frames patch even on modern versions.
        parser.handle_event(&post_frame(-123, 0, 0x13)).expect("post");
        let (info, _) = parser.game_info();
        assert_eq!(info.expect("game info").players[0].character_id, 0x12);

        // An in-match Sheik transform must not rewrite the game info.
        parser.handle_event(&post_frame(10, 1, 0x7)).expect("post");
        let (info, _) = parser.game_info();
        assert_eq!(info.expect("game info").players[1].character_id, 0x14);
    }

    #[test]
    fn bookended_frame_emits_frame_then_finalized() {
        let mut parser = Parser::new(ParserOptions::default());
        let mut frames = parser.subscribe_channel(ParserEvent::Frame);
        let mut finalized = parser.subscribe_channel(ParserEvent::FinalizedFrame);

        parser.handle_event(&two_player_start()).expect("start");
        feed_frame(&mut parser, -123);

        match frames.try_recv().expect("Frame") {
            ParserUpdate::Frame(entry) => {
                assert!(entry.is_transfer_complete);
                assert!(entry.players[&0].pre.is_some());
                assert!(entry.players[&0].post.is_some());
            }
            other => panic!("expected Frame update, got: {other:?}"),
        }
        assert!(finalized.try_recv().is_ok(), "FinalizedFrame fires");
        assert_eq!(parser.last_finalized_frame(), -123);
    }

    #[test]
    fn updates_do_not_emit_frame_until_bookend_on_modern_versions() {
        let mut parser = Parser::new(ParserOptions::default());
        let mut frames = parser.subscribe_channel(ParserEvent::Frame);

        parser.handle_event(&two_player_start()).expect("start");
        parser.handle_event(&pre_frame(-123, 0)).expect("pre");
        parser.handle_event(&post_frame(-123, 0, 0x14)).expect("post");

        assert!(frames.try_recv().is_err(), "no Frame before bookend");
        parser.handle_event(&bookend(-123, -123)).expect("bookend");
        assert!(frames.try_recv().is_ok());
    }

    #[test]
    fn old_versions_emit_frames_synchronously() {
        let mut parser = Parser::new(ParserOptions::default());
        let mut frames = parser.subscribe_channel(ParserEvent::Frame);
        let mut finalized = parser.subscribe_channel(ParserEvent::FinalizedFrame);

        let start = game_start(
            (2, 1, 0),
            [
                PlayerType::Human,
                PlayerType::Human,
                PlayerType::Empty,
                PlayerType::Empty,
            ],
        );
        parser.handle_event(&start).expect("start");

        parser.handle_event(&pre_frame(-123, 0)).expect("pre");
        assert!(frames.try_recv().is_ok(), "every update emits Frame");
        parser.handle_event(&post_frame(-123, 0, 0x14)).expect("post");
        assert!(frames.try_recv().is_ok());

        // Moving to the next frame finalizes the previous one.
        parser.handle_event(&pre_frame(-122, 0)).expect("pre");
        assert!(finalized.try_recv().is_ok());
        assert_eq!(parser.last_finalized_frame(), -123);
    }

    #[test]
    fn rollback_retransmission_is_detected_and_recorded() {
        let mut parser = Parser::new(ParserOptions::default());
        let mut rollbacks = parser.subscribe_channel(ParserEvent::RollbackFrame);

        parser.handle_event(&two_player_start()).expect("start");
        feed_frame(&mut parser, -123);
        parser.handle_event(&pre_frame(-122, 0)).expect("pre");
        parser.handle_event(&post_frame(-122, 0, 0x14)).expect("post");

        assert!(rollbacks.try_recv().is_err(), "no rollback yet");

        // Frame -122 is retransmitted.
        parser.handle_event(&pre_frame(-122, 0)).expect("retransmit");

        let losing = match rollbacks.try_recv().expect("RollbackFrame") {
            ParserUpdate::Frame(entry) => entry,
            other => panic!("expected Frame update, got: {other:?}"),
        };
        // The emitted snapshot is the state before the retransmission landed.
        assert!(losing.players[&0].pre.is_some());
        assert!(losing.players[&0].post.is_some());

        assert_eq!(parser.rollbacks().count, 1);
        assert_eq!(parser.rollbacks().frames[&-122].len(), 1);

        // A non-rollback pre-frame closes the run.
        parser.handle_event(&pre_frame(-121, 0)).expect("pre");
        assert_eq!(parser.rollbacks().lengths, vec![1]);
    }

    #[test]
    fn rollback_run_lengths_sum_to_count() {
        let mut parser = Parser::new(ParserOptions::default());
        parser.handle_event(&two_player_start()).expect("start");

        // Two retransmitted frames in a row, then a break, then one more.
        for n in [-123, -122] {
            parser.handle_event(&pre_frame(n, 0)).expect("pre");
        }
        parser.handle_event(&pre_frame(-123, 0)).expect("retransmit");
        parser.handle_event(&pre_frame(-122, 0)).expect("retransmit");
        parser.handle_event(&pre_frame(-121, 0)).expect("fresh");
        parser.handle_event(&pre_frame(-121, 0)).expect("retransmit");
        parser.handle_event(&pre_frame(-120, 0)).expect("fresh");

        let rollbacks = parser.rollbacks();
        assert_eq!(rollbacks.count, 3);
        assert_eq!(rollbacks.lengths, vec![2, 1]);
        assert_eq!(rollbacks.lengths.iter().sum::<usize>(), rollbacks.count);
    }

    #[test]
    fn rollback_ledger_latches_first_player_index() {
        let mut parser = Parser::new(ParserOptions::default());
        let mut rollbacks = parser.subscribe_channel(ParserEvent::RollbackFrame);

        parser.handle_event(&two_player_start()).expect("start");
        parser.handle_event(&pre_frame(-123, 0)).expect("p0 pre");
        // Player 1's pre-frame sees an existing entry, but the ledger is
        // latched to player 0 and must not treat it as a rollback.
        parser.handle_event(&pre_frame(-123, 1)).expect("p1 pre");

        assert!(rollbacks.try_recv().is_err());
        assert_eq!(parser.rollbacks().count, 0);
    }

    #[test]
    fn follower_pre_frames_do_not_touch_the_ledger() {
        let mut parser = Parser::new(ParserOptions::default());
        parser.handle_event(&two_player_start()).expect("start");

        parser.handle_event(&pre_frame(-123, 0)).expect("pre");
        let mut follower = pre_frame(-123, 0);
        if let Payload::PreFrameUpdate(p) = &mut follower.payload {
            p.update.is_follower = true;
        }
        parser.handle_event(&follower).expect("follower pre");

        assert_eq!(parser.rollbacks().count, 0);
        let entry = &parser.frames()[&-123];
        assert!(entry.followers[&0].pre.is_some());
    }

    #[test]
    fn strict_bookend_outside_window_is_an_error() {
        let mut parser = Parser::new(ParserOptions { strict: true });
        let mut ended = parser.subscribe_channel(ParserEvent::Ended);

        parser.handle_event(&two_player_start()).expect("start");
        let err = parser
            .handle_event(&bookend(100, 50))
            .expect_err("delta 50 > 7 must fail");
        assert!(matches!(err, Error::RollbackWindowViolation { .. }));
        assert!(ended.try_recv().is_err(), "no further events");
    }

    #[test]
    fn lenient_bookend_outside_window_is_tolerated() {
        let mut parser = Parser::new(ParserOptions { strict: false });
        parser.handle_event(&two_player_start()).expect("start");
        parser
            .handle_event(&bookend(100, 50))
            .expect("lenient mode tolerates the violation");
    }

    #[test]
    fn out_of_scene_bookend_finalizes_behind_the_window() {
        let mut parser = Parser::new(ParserOptions::default());
        let mut start = two_player_start();
        if let Payload::GameStart(p) = &mut start.payload {
            p.major_scene = 0x0; // not the in-game scene
        }
        parser.handle_event(&start).expect("start");

        for n in (-123)..=(-110) {
            parser.handle_event(&pre_frame(n, 0)).expect("pre");
            parser.handle_event(&post_frame(n, 0, 0x14)).expect("post");
        }
        parser.handle_event(&bookend(-110, -110)).expect("bookend");

        // Finalization stops MAX_ROLLBACK_FRAMES behind the bookend.
        assert_eq!(parser.last_finalized_frame(), -117);
    }

    #[test]
    fn strict_missing_player_errors_with_two_players() {
        let mut parser = Parser::new(ParserOptions { strict: true });
        parser.handle_event(&two_player_start()).expect("start");

        // Player 1 never sends anything for frame -123.
        parser.handle_event(&pre_frame(-123, 0)).expect("pre");
        parser.handle_event(&post_frame(-123, 0, 0x14)).expect("post");
        let err = parser
            .handle_event(&bookend(-123, -123))
            .expect_err("missing player must fail");
        assert!(
            matches!(
                err,
                Error::MissingFrameUpdate {
                    player: 1,
                    side: UpdateSide::Pre,
                    ..
                }
            ),
            "got: {err:?}"
        );
    }

    #[test]
    fn strict_missing_post_side_names_the_side() {
        let mut parser = Parser::new(ParserOptions { strict: true });
        parser.handle_event(&two_player_start()).expect("start");

        parser.handle_event(&pre_frame(-123, 0)).expect("pre 0");
        parser.handle_event(&post_frame(-123, 0, 0x14)).expect("post 0");
        parser.handle_event(&pre_frame(-123, 1)).expect("pre 1");
        let err = parser
            .handle_event(&bookend(-123, -123))
            .expect_err("missing post must fail");
        assert!(
            matches!(
                err,
                Error::MissingFrameUpdate {
                    player: 1,
                    side: UpdateSide::Post,
                    ..
                }
            ),
            "got: {err:?}"
        );
    }

    #[test]
    fn strict_tolerates_missing_players_in_free_for_all() {
        let mut parser = Parser::new(ParserOptions { strict: true });
        let start = game_start(
            (3, 0, 0),
            [
                PlayerType::Human,
                PlayerType::Human,
                PlayerType::Human,
                PlayerType::Empty,
            ],
        );
        parser.handle_event(&start).expect("start");

        // Only players 0 and 1 report; player 2 is absent entirely.
        for index in [0, 1] {
            parser.handle_event(&pre_frame(-123, index)).expect("pre");
            parser
                .handle_event(&post_frame(-123, index, 0x14))
                .expect("post");
        }
        parser
            .handle_event(&bookend(-123, -123))
            .expect("3-player game tolerates a missing player");
        assert_eq!(parser.last_finalized_frame(), -123);
    }

    #[test]
    fn finalization_halts_at_gaps_without_error() {
        let mut parser = Parser::new(ParserOptions::default());
        let mut finalized = parser.subscribe_channel(ParserEvent::FinalizedFrame);

        parser.handle_event(&two_player_start()).expect("start");
        feed_frame(&mut parser, -123);
        assert!(finalized.try_recv().is_ok());

        // Frame -122 never arrives; -121 does and its bookend reports -121
        // final. Finalization must stop at the gap.
        parser.handle_event(&pre_frame(-121, 0)).expect("pre");
        parser.handle_event(&post_frame(-121, 0, 0x14)).expect("post");
        parser.handle_event(&bookend(-121, -121)).expect("bookend");

        assert!(finalized.try_recv().is_err(), "gap halts finalization");
        assert_eq!(parser.last_finalized_frame(), -123);
    }

    #[test]
    fn finalized_frames_are_emitted_once_in_increasing_order() {
        let mut parser = Parser::new(ParserOptions::default());
        let mut finalized = parser.subscribe_channel(ParserEvent::FinalizedFrame);

        parser.handle_event(&two_player_start()).expect("start");
        for n in (-123)..=(-120) {
            feed_frame(&mut parser, n);
        }
        // A stale bookend watermark must not re-finalize anything.
        parser.handle_event(&bookend(-119, -121)).expect("bookend");

        let mut count = 0;
        while finalized.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 4, "each frame finalized exactly once");
        assert_eq!(parser.last_finalized_frame(), -120);
    }

    #[test]
    fn game_end_finalizes_remaining_frames_and_emits_ended() {
        let mut parser = Parser::new(ParserOptions::default());
        let mut finalized = parser.subscribe_channel(ParserEvent::FinalizedFrame);
        let mut ended = parser.subscribe_channel(ParserEvent::Ended);

        parser.handle_event(&two_player_start()).expect("start");
        parser.handle_event(&pre_frame(-123, 0)).expect("pre");
        parser.handle_event(&post_frame(-123, 0, 0x14)).expect("post");
        // No bookend: the replay ends here.
        parser.handle_event(&game_end()).expect("end");

        assert!(finalized.try_recv().is_ok(), "trailing frame finalized");
        match ended.try_recv().expect("Ended") {
            ParserUpdate::GameEnd(end) => {
                assert_eq!(end.method, GameEndMethod::Game);
                assert_eq!(end.lras_initiator, -1);
            }
            other => panic!("expected GameEnd update, got: {other:?}"),
        }
        assert!(parser.game_end().is_some());
    }

    #[test]
    fn ended_is_emitted_even_when_trailing_finalization_fails() {
        let mut parser = Parser::new(ParserOptions { strict: true });
        let mut ended = parser.subscribe_channel(ParserEvent::Ended);

        parser.handle_event(&two_player_start()).expect("start");
        // Only player 0 reports; strict finalization at game end must fail.
        parser.handle_event(&pre_frame(-123, 0)).expect("pre");
        parser.handle_event(&post_frame(-123, 0, 0x14)).expect("post");

        let err = parser.handle_event(&game_end()).expect_err("strict failure");
        assert!(matches!(err, Error::MissingFrameUpdate { .. }));
        assert!(ended.try_recv().is_ok(), "Ended observed despite the error");
    }

    #[test]
    fn game_end_without_frames_does_not_finalize() {
        let mut parser = Parser::new(ParserOptions::default());
        let mut finalized = parser.subscribe_channel(ParserEvent::FinalizedFrame);
        let mut frames = parser.subscribe_channel(ParserEvent::Frame);
        let mut ended = parser.subscribe_channel(ParserEvent::Ended);

        parser.handle_event(&two_player_start()).expect("start");
        parser.handle_event(&game_end()).expect("end");

        assert!(finalized.try_recv().is_err());
        assert!(frames.try_recv().is_err());
        assert!(ended.try_recv().is_ok());
    }

    #[test]
    fn item_updates_append_in_order() {
        let mut parser = Parser::new(ParserOptions::default());
        parser.handle_event(&two_player_start()).expect("start");
        parser.handle_event(&item_update(-123)).expect("item");
        parser.handle_event(&item_update(-123)).expect("item");

        assert_eq!(parser.frames()[&-123].items.len(), 2);
    }

    #[test]
    fn playable_frame_count_is_clamped() {
        let mut parser = Parser::new(ParserOptions::default());
        assert_eq!(parser.playable_frame_count(), 0);

        parser.handle_event(&two_player_start()).expect("start");
        parser.handle_event(&pre_frame(-123, 0)).expect("pre");
        assert_eq!(parser.playable_frame_count(), 0, "countdown is unplayable");

        parser.handle_event(&pre_frame(-39, 0)).expect("pre");
        assert_eq!(parser.playable_frame_count(), 0);
        parser.handle_event(&pre_frame(100, 0)).expect("pre");
        assert_eq!(parser.playable_frame_count(), 139);
    }

    #[test]
    fn latest_frame_steps_back_after_game_end() {
        let mut parser = Parser::new(ParserOptions::default());
        parser.handle_event(&two_player_start()).expect("start");
        feed_frame(&mut parser, -123);
        feed_frame(&mut parser, -122);

        assert!(parser.latest_frame().is_some());
        parser.handle_event(&game_end()).expect("end");
        // The final frame is cut short by the end event; the previous frame
        // is the last trustworthy one.
        let latest = parser.latest_frame().expect("latest");
        assert_eq!(
            latest.players[&0].pre.as_ref().map(|p| p.update.frame_number),
            Some(-123)
        );
    }

    #[test]
    fn reset_clears_state_but_keeps_subscribers() {
        let mut parser = Parser::new(ParserOptions::default());
        let mut started = parser.subscribe_channel(ParserEvent::Started);

        parser.handle_event(&two_player_start()).expect("start");
        feed_frame(&mut parser, -123);
        assert!(started.try_recv().is_ok());

        parser.reset();
        assert!(parser.frames().is_empty());
        assert_eq!(parser.latest_frame_index(), -124);
        assert_eq!(parser.last_finalized_frame(), -124);
        assert_eq!(parser.rollbacks().count, 0);
        let (info, complete) = parser.game_info();
        assert!(info.is_none());
        assert!(!complete);

        // The same subscriber sees events from the second pass.
        parser.handle_event(&two_player_start()).expect("start");
        assert!(started.try_recv().is_ok());
    }

    #[test]
    fn reprocessing_after_reset_reproduces_state() {
        let events: Vec<Event> = {
            let mut events = vec![two_player_start()];
            for n in [-123, -122, -121] {
                events.push(pre_frame(n, 0));
                events.push(pre_frame(n, 1));
                events.push(post_frame(n, 0, 0x14));
                events.push(post_frame(n, 1, 0x14));
                events.push(bookend(n, n));
            }
            events.push(game_end());
            events
        };

        let mut parser = Parser::new(ParserOptions::default());
        for event in &events {
            parser.handle_event(event).expect("first pass");
        }
        let first_frames = parser.frames().clone();
        let first_finalized = parser.last_finalized_frame();

        parser.reset();
        for event in &events {
            parser.handle_event(event).expect("second pass");
        }

        assert_eq!(parser.frames(), &first_frames);
        assert_eq!(parser.last_finalized_frame(), first_finalized);
    }

    #[tokio::test]
    async fn parse_replay_consumes_a_channel_until_close() {
        let mut parser = Parser::new(ParserOptions::default());
        let mut ended = parser.subscribe_channel(ParserEvent::Ended);

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(Ok(two_player_start())).expect("send");
        tx.send(Ok(pre_frame(-123, 0))).expect("send");
        tx.send(Ok(post_frame(-123, 0, 0x14))).expect("send");
        tx.send(Ok(game_end())).expect("send");
        drop(tx);

        parser.parse_replay(&mut rx).await.expect("parse");
        assert!(ended.try_recv().is_ok());
    }

    #[tokio::test]
    async fn parse_replay_aborts_on_in_band_error_and_drains() {
        let mut parser = Parser::new(ParserOptions::default());

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(Ok(two_player_start())).expect("send");
        tx.send(Err(Error::UnknownCommand { command: 0x40 }))
            .expect("send");
        // Events after the error are drained, not processed.
        tx.send(Ok(pre_frame(-123, 0))).expect("send");
        drop(tx);

        let err = parser.parse_replay(&mut rx).await.expect_err("must abort");
        assert!(matches!(err, Error::UnknownCommand { command: 0x40 }));
        // Prior state remains accessible.
        let (info, _) = parser.game_info();
        assert!(info.is_some());
        // The channel was drained on abort.
        assert!(rx.try_recv().is_err());
        assert!(parser.frames().is_empty(), "post-error events not applied");
    }
}
