//! Client-side event pipeline.
//!
//! Turns server datagrams into the UI text protocol and UI key tokens into
//! a live `turn_direction`. Neither half touches a socket: [`Pipeline`]
//! consumes already-received bytes and returns lines ready to write to the
//! UI relay, and [`DirectionState`] consumes already-received UI tokens.
//! The binary owns the two live sockets and the 20ms send loop.

use std::collections::HashSet;
use std::fmt;

use glowtrail_wire::{CodecError, EventBody, NumberedEvent, ServerDatagram};

/// Maximum length, in bytes, of one line read from the UI relay socket.
pub const UI_INPUT_BUFFER_LEN: usize = 20;

/// A server malfunction the client has no recovery for: an event referred
/// to a pixel or player number the current game's NEW_GAME never
/// advertised. The session that observes this is fatally aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolViolation(&'static str);

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol violation: {}", self.0)
    }
}

impl std::error::Error for ProtocolViolation {}

/// One line of the UI text protocol, not yet LF-terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    NewGame {
        width: u32,
        height: u32,
        names: Vec<Vec<u8>>,
    },
    Pixel {
        x: u32,
        y: u32,
        name: Vec<u8>,
    },
    PlayerEliminated {
        name: Vec<u8>,
    },
}

impl UiEvent {
    pub fn to_line(&self) -> String {
        match self {
            UiEvent::NewGame {
                width,
                height,
                names,
            } => {
                let names: Vec<String> = names.iter().map(|n| lossy(n)).collect();
                format!("NEW_GAME {width} {height} {}", names.join(" "))
            }
            UiEvent::Pixel { x, y, name } => format!("PIXEL {x} {y} {}", lossy(name)),
            UiEvent::PlayerEliminated { name } => format!("PLAYER_ELIMINATED {}", lossy(name)),
        }
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Holds the state a client needs to translate a stream of server
/// datagrams into UI output: the currently installed game, per-event
/// dedup, and the running `next_expected_event` cursor.
pub struct Pipeline {
    current_game_id: Option<u32>,
    width: u32,
    height: u32,
    names: Vec<Vec<u8>>,
    max_event_number: u32,
    seen: HashSet<(u32, u32)>,
    aborted: bool,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            current_game_id: None,
            width: 0,
            height: 0,
            names: Vec::new(),
            max_event_number: 0,
            seen: HashSet::new(),
            aborted: false,
        }
    }

    /// The cursor to send back to the server: one past the highest
    /// event number observed in the current game, or `0` before any game
    /// has been installed.
    pub fn next_expected_event(&self) -> u32 {
        if self.current_game_id.is_some() {
            self.max_event_number + 1
        } else {
            0
        }
    }

    pub fn current_game_id(&self) -> Option<u32> {
        self.current_game_id
    }

    /// Decodes one received datagram and returns the UI lines it produces,
    /// in order. A malformed datagram (bad size, bad CRC partway through)
    /// yields whatever lines its well-formed prefix produced and is
    /// otherwise silently abandoned, matching the codec's own
    /// one-bad-frame-ends-the-datagram behavior. A fatal protocol
    /// violation (pixel or player number the current game never declared)
    /// aborts the pipeline: every subsequent call returns the same error.
    pub fn process_datagram(&mut self, bytes: &[u8]) -> Result<Vec<UiEvent>, ProtocolViolation> {
        if self.aborted {
            return Err(ProtocolViolation("pipeline already aborted"));
        }
        let parsed = match ServerDatagram::parse(bytes) {
            Ok(p) => p,
            Err(_) => return Ok(Vec::new()),
        };
        let game_id = parsed.game_id;
        let mut out = Vec::new();
        for event in parsed.events() {
            let event: Result<NumberedEvent, CodecError> = event;
            let Ok(event) = event else {
                break;
            };
            match self.apply_one(game_id, event) {
                Ok(Some(ui)) => out.push(ui),
                Ok(None) => {}
                Err(violation) => {
                    self.aborted = true;
                    return Err(violation);
                }
            }
        }
        Ok(out)
    }

    fn apply_one(
        &mut self,
        game_id: u32,
        event: NumberedEvent,
    ) -> Result<Option<UiEvent>, ProtocolViolation> {
        let duplicate = !self.seen.insert((game_id, event.event_number));

        match event.body {
            EventBody::NewGame {
                max_x,
                max_y,
                names,
            } => {
                if Some(game_id) != self.current_game_id {
                    self.current_game_id = Some(game_id);
                    self.width = max_x;
                    self.height = max_y;
                    self.names = names.clone();
                    self.max_event_number = event.event_number;
                } else {
                    self.max_event_number = self.max_event_number.max(event.event_number);
                }
                if duplicate {
                    return Ok(None);
                }
                Ok(Some(UiEvent::NewGame {
                    width: max_x,
                    height: max_y,
                    names,
                }))
            }
            EventBody::Pixel { player_number, x, y } => {
                if Some(game_id) != self.current_game_id {
                    return Ok(None);
                }
                self.max_event_number = self.max_event_number.max(event.event_number);
                let name = self
                    .names
                    .get(player_number as usize)
                    .ok_or(ProtocolViolation("pixel event named an unknown player"))?;
                if x >= self.width || y >= self.height {
                    return Err(ProtocolViolation("pixel event out of board bounds"));
                }
                if duplicate {
                    return Ok(None);
                }
                Ok(Some(UiEvent::Pixel {
                    x,
                    y,
                    name: name.clone(),
                }))
            }
            EventBody::PlayerEliminated { player_number } => {
                if Some(game_id) != self.current_game_id {
                    return Ok(None);
                }
                self.max_event_number = self.max_event_number.max(event.event_number);
                let name = self
                    .names
                    .get(player_number as usize)
                    .ok_or(ProtocolViolation(
                        "player_eliminated named an unknown player",
                    ))?;
                if duplicate {
                    return Ok(None);
                }
                Ok(Some(UiEvent::PlayerEliminated { name: name.clone() }))
            }
            EventBody::GameOver => {
                if Some(game_id) == self.current_game_id {
                    self.max_event_number = self.max_event_number.max(event.event_number);
                }
                Ok(None)
            }
        }
    }
}

/// Tracks the two held-key booleans and derives `turn_direction` from UI
/// key tokens, per the LEFT/RIGHT down/up truth table.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectionState {
    left_down: bool,
    right_down: bool,
    turn_direction: i8,
}

impl DirectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turn_direction(&self) -> i8 {
        self.turn_direction
    }

    /// Applies one UI token. Unrecognized tokens are ignored, per the
    /// key-interleave spec.
    pub fn apply_token(&mut self, token: &[u8]) {
        match token {
            b"LEFT_KEY_DOWN" => {
                self.left_down = true;
                self.turn_direction = -1;
            }
            b"RIGHT_KEY_DOWN" => {
                self.right_down = true;
                self.turn_direction = 1;
            }
            b"LEFT_KEY_UP" => {
                self.left_down = false;
                self.turn_direction = if self.right_down { 1 } else { 0 };
            }
            b"RIGHT_KEY_UP" => {
                self.right_down = false;
                self.turn_direction = if self.left_down { -1 } else { 0 };
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glowtrail_wire::pack_datagram;

    fn new_game(names: &[&str]) -> NumberedEvent {
        NumberedEvent {
            event_number: 0,
            body: EventBody::NewGame {
                max_x: 800,
                max_y: 800,
                names: names.iter().map(|n| n.as_bytes().to_vec()).collect(),
            },
        }
    }

    fn pixel(n: u32, player: u8, x: u32, y: u32) -> NumberedEvent {
        NumberedEvent {
            event_number: n,
            body: EventBody::Pixel {
                player_number: player,
                x,
                y,
            },
        }
    }

    #[test]
    fn new_game_installs_state_and_emits_a_line() {
        let mut pipeline = Pipeline::new();
        let (bytes, _) = pack_datagram(1, &[new_game(&["A", "B"])]);
        let lines = pipeline.process_datagram(&bytes).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].to_line(), "NEW_GAME 800 800 A B");
        assert_eq!(pipeline.current_game_id(), Some(1));
        assert_eq!(pipeline.next_expected_event(), 1);
    }

    #[test]
    fn duplicate_datagram_suppresses_ui_output_but_cursor_is_unchanged() {
        let mut pipeline = Pipeline::new();
        let events = [new_game(&["A", "B"]), pixel(1, 0, 10, 20)];
        let (bytes, _) = pack_datagram(5, &events);
        let first = pipeline.process_datagram(&bytes).unwrap();
        assert_eq!(first.len(), 2);
        let cursor_after_first = pipeline.next_expected_event();

        let second = pipeline.process_datagram(&bytes).unwrap();
        assert!(second.is_empty());
        assert_eq!(pipeline.next_expected_event(), cursor_after_first);
    }

    #[test]
    fn corrupt_crc_stops_the_datagram_but_keeps_prior_lines() {
        let mut pipeline = Pipeline::new();
        pipeline.process_datagram(&pack_datagram(9, &[new_game(&["A", "B"])]).0).unwrap();

        let events = [pixel(1, 0, 1, 1), pixel(2, 1, 2, 2), pixel(3, 0, 3, 3)];
        let (mut bytes, _) = pack_datagram(9, &events);
        // Corrupt the second event's player_number byte.
        let first_frame_len = 4 + 4 + 4 + 1 + 9 + 4;
        bytes[first_frame_len + 4 + 4] ^= 0xFF;

        let lines = pipeline.process_datagram(&bytes).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].to_line(), "PIXEL 1 1 A");
    }

    #[test]
    fn pixel_outside_the_declared_board_is_a_protocol_violation() {
        let mut pipeline = Pipeline::new();
        pipeline
            .process_datagram(&pack_datagram(1, &[new_game(&["A", "B"])]).0)
            .unwrap();
        let bad = NumberedEvent {
            event_number: 1,
            body: EventBody::Pixel {
                player_number: 0,
                x: 800,
                y: 0,
            },
        };
        let (bytes, _) = pack_datagram(1, &[bad]);
        let result = pipeline.process_datagram(&bytes);
        assert!(result.is_err());
        // The pipeline stays aborted for subsequent calls.
        assert!(pipeline.process_datagram(&bytes).is_err());
    }

    #[test]
    fn retransmitted_new_game_does_not_regress_the_cursor() {
        let mut pipeline = Pipeline::new();
        let events = [new_game(&["A", "B"]), pixel(1, 0, 10, 20), pixel(2, 1, 11, 21)];
        let (bytes, _) = pack_datagram(5, &events);
        pipeline.process_datagram(&bytes).unwrap();
        assert_eq!(pipeline.next_expected_event(), 3);

        // The server retransmits the same NEW_GAME (event 0) on its own,
        // e.g. because an earlier datagram carrying it was lost and the
        // server resent from a stale cursor view. Already having observed
        // events 1 and 2, the cursor must not walk back to 1.
        let (resend, _) = pack_datagram(5, &[new_game(&["A", "B"])]);
        let lines = pipeline.process_datagram(&resend).unwrap();
        assert!(lines.is_empty());
        assert_eq!(pipeline.next_expected_event(), 3);
    }

    #[test]
    fn events_from_a_superseded_game_are_ignored_not_fatal() {
        let mut pipeline = Pipeline::new();
        pipeline
            .process_datagram(&pack_datagram(1, &[new_game(&["A", "B"])]).0)
            .unwrap();
        // A pixel tagged with an old game id that would be out of bounds
        // for the *current* game must not abort anything: it belongs to
        // a game that is no longer current.
        let stale = pixel(9, 0, 9999, 9999);
        let (bytes, _) = pack_datagram(0, &[stale]);
        let lines = pipeline.process_datagram(&bytes).unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn key_interleave_matches_the_truth_table() {
        let mut state = DirectionState::new();
        state.apply_token(b"LEFT_KEY_DOWN");
        assert_eq!(state.turn_direction(), -1);
        state.apply_token(b"RIGHT_KEY_DOWN");
        assert_eq!(state.turn_direction(), 1);
        state.apply_token(b"LEFT_KEY_UP");
        assert_eq!(state.turn_direction(), 1);
        state.apply_token(b"RIGHT_KEY_UP");
        assert_eq!(state.turn_direction(), 0);
    }

    #[test]
    fn unknown_token_is_ignored() {
        let mut state = DirectionState::new();
        state.apply_token(b"LEFT_KEY_DOWN");
        state.apply_token(b"JUMP");
        assert_eq!(state.turn_direction(), -1);
    }
}
