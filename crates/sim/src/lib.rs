//! Deterministic game engine.
//!
//! Owns the PRNG, the board occupancy set, and snake kinematics for exactly
//! one game at a time. The engine performs no I/O and cannot fail: every
//! precondition a caller must uphold (non-empty candidate list, valid
//! player numbers) is expressed through return values (`Option`, bool)
//! rather than panics, and malformed network input never reaches here —
//! the server loop filters and validates before calling in.
//!
//! The PRNG sequence is a single running stream owned by the engine across
//! games: a `game_id` draw and the per-player spawn draws for game N+1
//! continue from wherever game N left off, matching a single global
//! generator rather than one reseeded per game.

#![deny(unsafe_code)]

use glowtrail_wire::{EventBody, MAX_DATAGRAM_SIZE, NumberedEvent};
use std::collections::HashSet;

/// Multiplier from the specified congruential generator.
const PRNG_MULTIPLIER: u64 = 279_410_273;
/// Modulus from the specified congruential generator.
const PRNG_MODULUS: u64 = 4_294_967_291;

/// The deterministic PRNG used for `game_id` and spawn placement.
///
/// `state_n = (state_{n-1} * 279410273) mod 4294967291`. Two engines seeded
/// identically and driven with an identical sequence of draws always agree.
#[derive(Debug, Clone, Copy)]
pub struct Prng {
    state: u32,
}

impl Prng {
    pub fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    /// Advances the generator and returns the new state.
    pub fn next(&mut self) -> u32 {
        self.state = ((self.state as u64 * PRNG_MULTIPLIER) % PRNG_MODULUS) as u32;
        self.state
    }
}

/// A connection-table entry offered to the engine as a game-start
/// candidate. The engine owns deduplication, ordering, and the
/// datagram-size bound; it does not know about `ready` or `has_snake` —
/// those are connection-table concepts the caller has already applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: Vec<u8>,
    pub session_id: u64,
}

/// One moving entity, identified by its stable `player_number`.
#[derive(Debug, Clone, PartialEq)]
pub struct Snake {
    pub player_number: u8,
    pub alive: bool,
    pub x: f64,
    pub y: f64,
    pub angle: f64,
    pub turn_direction: i8,
}

/// The moving parts of a game while it is actively being simulated. Split
/// out from the event log so that the log can outlive the game itself: a
/// newly joined or slow client must still be able to replay a finished
/// game's events up until the next one starts.
#[derive(Debug)]
struct RunningGame {
    board: HashSet<(u32, u32)>,
    alive_count: usize,
    snakes: Vec<Snake>,
}

/// Result of advancing the engine by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No game is running; nothing happened.
    Idle,
    /// The game is still in progress.
    Continues,
    /// `alive_count` dropped below 2; GAME_OVER was appended and the
    /// engine returned to idle. The caller is responsible for clearing
    /// `ready`/`has_snake` on its own connection-table records.
    Ended,
}

/// Threaded simulation state: PRNG, at most one in-progress game, and the
/// event log of the current (or most recently finished) game.
///
/// The log is cleared only when a *new* game actually starts, per the
/// event-log lifecycle in the data model: an idle engine still has a log
/// to serve to clients replaying the game that just ended.
pub struct Engine {
    prng: Prng,
    width: u32,
    height: u32,
    turning_speed_deg: f64,
    running: Option<RunningGame>,
    game_id: Option<u32>,
    log: Vec<NumberedEvent>,
}

impl Engine {
    pub fn new(width: u32, height: u32, turning_speed_deg: f64, seed: u32) -> Self {
        Self {
            prng: Prng::new(seed),
            width,
            height,
            turning_speed_deg,
            running: None,
            game_id: None,
            log: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// The id of the current game, or the most recently finished one if
    /// the engine is idle. `None` until the first game has ever started.
    pub fn game_id(&self) -> Option<u32> {
        self.game_id
    }

    /// The event log of the current (or most recently finished) game.
    /// Event numbers equal positions, so this can be sliced directly by
    /// a client's `next_expected_event` cursor.
    pub fn log(&self) -> &[NumberedEvent] {
        &self.log
    }

    /// Snakes of the currently running game, if any.
    pub fn snakes(&self) -> Option<&[Snake]> {
        self.running.as_ref().map(|g| g.snakes.as_slice())
    }

    /// Sets the live turn direction for a player in the running game. A
    /// no-op if no game is running, the player number is out of range, or
    /// that player's snake has already been eliminated.
    pub fn set_turn_direction(&mut self, player_number: u8, turn_direction: i8) {
        if let Some(game) = self.running.as_mut() {
            if let Some(snake) = game.snakes.get_mut(player_number as usize) {
                if snake.alive {
                    snake.turn_direction = turn_direction;
                }
            }
        }
    }

    fn append(&mut self, body: EventBody) {
        let event_number = self.log.len() as u32;
        self.log.push(NumberedEvent { event_number, body });
    }

    /// Overwrites a running snake's kinematic state. Used by scenario
    /// tests that need to pin an exact position/heading rather than rely
    /// on PRNG-determined spawn placement; not used by the tick loop.
    pub fn set_snake_state(&mut self, player_number: u8, x: f64, y: f64, angle: f64) {
        if let Some(game) = self.running.as_mut() {
            if let Some(snake) = game.snakes.get_mut(player_number as usize) {
                snake.x = x;
                snake.y = y;
                snake.angle = angle;
            }
        }
    }

    /// Attempts to start a new game from a set of ready, non-empty-name
    /// candidates. Applies, in order: duplicate-name removal (first
    /// occurrence wins), the `>= 2` qualifying-player floor, ascending
    /// `(name, session_id)` ordering, and the one-datagram name-list bound.
    ///
    /// Returns the candidates that actually received a snake, in
    /// `player_number` order, or `None` if fewer than two candidates
    /// qualified after deduplication and bounding. A candidate dropped for
    /// exceeding the datagram bound is not reported as an error: the
    /// caller's connection-table record is untouched and it may qualify
    /// for the next game.
    pub fn try_start_game(&mut self, candidates: &[Candidate]) -> Option<Vec<Candidate>> {
        let mut seen = HashSet::new();
        let mut unique: Vec<Candidate> = Vec::new();
        for c in candidates {
            if seen.insert(c.name.clone()) {
                unique.push(c.clone());
            }
        }
        if unique.len() < 2 {
            return None;
        }
        unique.sort_by(|a, b| a.name.cmp(&b.name).then(a.session_id.cmp(&b.session_id)));

        let mut included: Vec<Candidate> = Vec::new();
        let mut names: Vec<Vec<u8>> = Vec::new();
        for c in unique {
            let mut candidate_names = names.clone();
            candidate_names.push(c.name.clone());
            if new_game_datagram_size(&candidate_names) > MAX_DATAGRAM_SIZE {
                break;
            }
            names = candidate_names;
            included.push(c);
        }
        if included.len() < 2 {
            return None;
        }

        let game_id = self.prng.next();
        let mut snakes = Vec::with_capacity(included.len());
        for (player_number, _) in included.iter().enumerate() {
            let draw_x = self.prng.next();
            let draw_y = self.prng.next();
            let draw_angle = self.prng.next();
            snakes.push(Snake {
                player_number: player_number as u8,
                alive: true,
                x: (draw_x % self.width) as f64 + 0.5,
                y: (draw_y % self.height) as f64 + 0.5,
                angle: (draw_angle % 360) as f64,
                turn_direction: 0,
            });
        }

        self.game_id = Some(game_id);
        self.log.clear();
        self.running = Some(RunningGame {
            board: HashSet::new(),
            alive_count: snakes.len(),
            snakes,
        });
        self.append(EventBody::NewGame {
            max_x: self.width,
            max_y: self.height,
            names,
        });

        // Every spawned snake claims its start cell immediately, in
        // player_number order, the same way a moved snake claims a new
        // cell: a spawn landing on an already-taken cell eliminates that
        // snake on the spot instead of silently overlapping it.
        let snake_count = self.running.as_ref().unwrap().snakes.len();
        for i in 0..snake_count {
            let (x, y, player_number) = {
                let snake = &self.running.as_ref().unwrap().snakes[i];
                (snake.x.floor(), snake.y.floor(), snake.player_number)
            };
            self.place_or_eliminate(i, x, y, player_number);
        }

        Some(included)
    }

    /// Claims cell `(nx, ny)` for snake `i` if it is in bounds and
    /// unoccupied, appending PIXEL and marking the cell taken; otherwise
    /// eliminates the snake, appending PLAYER_ELIMINATED without touching
    /// the board. Shared by tick movement and spawn placement.
    fn place_or_eliminate(&mut self, i: usize, nx: f64, ny: f64, player_number: u8) {
        let in_bounds = nx >= 0.0 && ny >= 0.0 && nx < self.width as f64 && ny < self.height as f64;
        let occupied = {
            let game = self.running.as_ref().unwrap();
            in_bounds && game.board.contains(&(nx as u32, ny as u32))
        };

        if !in_bounds || occupied {
            let game = self.running.as_mut().unwrap();
            game.snakes[i].alive = false;
            game.alive_count -= 1;
            self.append(EventBody::PlayerEliminated { player_number });
        } else {
            let game = self.running.as_mut().unwrap();
            game.board.insert((nx as u32, ny as u32));
            self.append(EventBody::Pixel {
                player_number,
                x: nx as u32,
                y: ny as u32,
            });
        }
    }

    /// Advances the running game by exactly one tick.
    pub fn tick(&mut self) -> TickOutcome {
        if self.running.is_none() {
            return TickOutcome::Idle;
        }

        let snake_count = self.running.as_ref().unwrap().snakes.len();
        let indices: Vec<usize> = (0..snake_count)
            .filter(|&i| self.running.as_ref().unwrap().snakes[i].alive)
            .collect();

        for i in indices {
            let (new_pos, old_pos, player_number) = {
                let game = self.running.as_mut().unwrap();
                let snake = &mut game.snakes[i];
                snake.angle += snake.turn_direction as f64 * self.turning_speed_deg;
                let old = (snake.x.floor(), snake.y.floor());
                let radians = snake.angle.to_radians();
                snake.x += radians.cos();
                snake.y -= radians.sin();
                ((snake.x.floor(), snake.y.floor()), old, snake.player_number)
            };

            if new_pos != old_pos {
                self.place_or_eliminate(i, new_pos.0, new_pos.1, player_number);
            }

            // Stop moving the remaining snakes the instant the game is
            // decided; a snake that hasn't taken its turn yet this tick
            // never does, rather than moving on through a tick that has
            // already ended.
            if self.running.as_ref().unwrap().alive_count < 2 {
                break;
            }
        }

        let alive_count = self.running.as_ref().unwrap().alive_count;
        if alive_count < 2 {
            self.append(EventBody::GameOver);
            self.running = None;
            TickOutcome::Ended
        } else {
            TickOutcome::Continues
        }
    }
}

/// Size, in bytes, of the datagram a NEW_GAME event with this name list
/// would occupy: the `game_id` header plus one event frame carrying
/// `max_x`/`max_y` and the nul-terminated name list.
fn new_game_datagram_size(names: &[Vec<u8>]) -> usize {
    const GAME_ID_HEADER: usize = 4;
    const FRAME_OVERHEAD: usize = 4 + 4 + 1 + 4; // len + event_number + type + crc
    const FIXED_PAYLOAD: usize = 4 + 4; // max_x + max_y
    let name_bytes: usize = names.iter().map(|n| n.len() + 1).sum();
    GAME_ID_HEADER + FRAME_OVERHEAD + FIXED_PAYLOAD + name_bytes
}
