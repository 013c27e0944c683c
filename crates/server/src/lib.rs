//! Authoritative game server.
//!
//! Owns the connection table and the tick-driven [`glowtrail_sim::Engine`],
//! and mediates between the two: incoming datagrams are decoded and applied
//! to a connection-table record, connection-table state feeds game-start
//! candidates to the engine, and the engine's event log is packed back out
//! per player according to each player's own replay cursor.
//!
//! This crate performs no socket I/O itself. The binary owns the live UDP
//! socket, the scheduler, argument parsing, and logging; it calls into
//! [`Server`] with already-received bytes and an already-read clock, and
//! sends whatever [`Server::pending_sends`] returns.

#![deny(unsafe_code)]

pub mod table;

use std::net::IpAddr;

use glowtrail_sim::{Engine, TickOutcome};
use glowtrail_wire::decode_client_to_server;

pub use table::{ConnectionTable, DispatchOutcome, PendingSend, Player, canonicalize_address};

/// Default board width in pixels.
pub const DEFAULT_WIDTH: u32 = 800;
/// Default board height in pixels.
pub const DEFAULT_HEIGHT: u32 = 600;
/// Default listen port.
pub const DEFAULT_PORT: u16 = 12345;
/// Default ticks per second.
pub const DEFAULT_TICKS_PER_SEC: u32 = 50;
/// Default degrees turned per tick.
pub const DEFAULT_TURNING_SPEED_DEG: f64 = 6.0;

/// A connection is reclaimed if it has been silent this long and holds no
/// snake, per the inactivity-eviction rule.
pub const INACTIVITY_TIMEOUT_US: u64 = 2_000_000;

/// Server configuration, one field per `-W -H -p -s -t -r` command-line
/// option.
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub width: u32,
    pub height: u32,
    pub port: u16,
    pub ticks_per_sec: u32,
    pub turning_speed_deg: f64,
    pub seed: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            port: DEFAULT_PORT,
            ticks_per_sec: DEFAULT_TICKS_PER_SEC,
            turning_speed_deg: DEFAULT_TURNING_SPEED_DEG,
            seed: 1,
        }
    }
}

impl ServerConfig {
    /// Microseconds between ticks, for the absolute-deadline scheduler.
    pub fn tick_period_us(&self) -> u64 {
        1_000_000 / self.ticks_per_sec as u64
    }
}

/// Top-level server state: the engine plus the connection table, advanced
/// one datagram or one tick at a time by the caller.
pub struct Server {
    engine: Engine,
    table: ConnectionTable,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            engine: Engine::new(
                config.width,
                config.height,
                config.turning_speed_deg,
                config.seed,
            ),
            table: ConnectionTable::new(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    /// Decodes and applies one received datagram. Malformed datagrams and
    /// stale sessions are dropped silently (logged at `debug`); nothing
    /// here can fail the process.
    pub fn handle_datagram(&mut self, address: IpAddr, port: u16, bytes: &[u8], now_us: u64) {
        let datagram = match decode_client_to_server(bytes) {
            Ok(d) => d,
            Err(err) => {
                tracing::debug!(%err, "dropping malformed client datagram");
                return;
            }
        };

        match self.table.dispatch(address, port, &datagram, now_us) {
            DispatchOutcome::Stale => {
                tracing::debug!(session_id = datagram.session_id, "dropping stale session");
            }
            DispatchOutcome::Accepted {
                index,
                superseded_session,
            } => {
                if let Some(old) = superseded_session {
                    tracing::info!(
                        old_session = old,
                        new_session = datagram.session_id,
                        "session superseded"
                    );
                }
                if let Some(player_number) = self.table.player(index).player_number {
                    self.engine
                        .set_turn_direction(player_number, datagram.turn_direction);
                }
            }
        }
    }

    /// Advances the server by exactly one tick: attempts a game start if
    /// idle, otherwise runs one tick of physics, then evicts stale
    /// connections. Returns whatever the engine reports so the caller can
    /// log transitions.
    pub fn tick(&mut self, now_us: u64) -> TickOutcome {
        let outcome = if self.engine.is_running() {
            let outcome = self.engine.tick();
            if outcome == TickOutcome::Ended {
                self.table.mark_game_ended();
            }
            outcome
        } else if self.table.everyone_ready() {
            let candidates = self.table.game_start_candidates();
            if let Some(included) = self.engine.try_start_game(&candidates) {
                self.table.mark_game_started(&included);
            }
            TickOutcome::Idle
        } else {
            TickOutcome::Idle
        };
        self.table.evict(now_us);
        outcome
    }

    /// Computes, but does not send, the next datagram owed to each
    /// connected player given the engine's current log. Call
    /// [`Server::confirm_sent`] once the bytes have actually gone out.
    pub fn pending_sends(&self) -> Vec<PendingSend> {
        match self.engine.game_id() {
            Some(game_id) => self.table.pending_sends(game_id, self.engine.log()),
            None => Vec::new(),
        }
    }

    /// Advances the per-player replay cursor past a datagram that was
    /// confirmed sent. Must not be called for a send that failed or was
    /// only partially transmitted.
    pub fn confirm_sent(&mut self, pending: &PendingSend) {
        self.table.confirm_sent(pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glowtrail_wire::ClientDatagram;
    use std::net::Ipv4Addr;

    fn addr(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, n))
    }

    fn join(server: &mut Server, who: u8, session_id: u64, name: &str, now_us: u64) {
        let dg = ClientDatagram::new(session_id, 1, 0, name.as_bytes().to_vec()).unwrap();
        let bytes = dg.encode();
        server.handle_datagram(addr(who), 9000 + who as u16, &bytes, now_us);
    }

    #[test]
    fn two_ready_players_start_a_game_on_next_tick() {
        let mut server = Server::new(ServerConfig {
            seed: 77,
            ..Default::default()
        });
        join(&mut server, 1, 1, "A", 0);
        join(&mut server, 2, 1, "B", 0);
        server.tick(0);
        assert!(server.engine().is_running());
        assert_eq!(server.engine().log().len(), 1);
    }

    #[test]
    fn unready_third_player_blocks_start_even_with_two_ready() {
        let mut server = Server::new(ServerConfig {
            seed: 77,
            ..Default::default()
        });
        join(&mut server, 1, 1, "A", 0);
        join(&mut server, 2, 1, "B", 0);
        // C has joined but not turned a key yet.
        let dg = ClientDatagram::new(1, 0, 0, b"C".to_vec()).unwrap();
        server.handle_datagram(addr(3), 9003, &dg.encode(), 0);

        server.tick(0);
        assert!(!server.engine().is_running());

        // Once C also signals ready, the game starts on the next tick.
        let dg = ClientDatagram::new(1, 1, 0, b"C".to_vec()).unwrap();
        server.handle_datagram(addr(3), 9003, &dg.encode(), 0);
        server.tick(0);
        assert!(server.engine().is_running());
    }

    #[test]
    fn session_precedence_ignores_arrival_order_of_the_stale_message() {
        let mut server = Server::new(ServerConfig::default());
        join(&mut server, 1, 5, "C", 1_000);
        // A stale, lower session id arrives after the fact: must be dropped
        // without touching the active record.
        join(&mut server, 1, 2, "C", 2_000);
        assert_eq!(server.table().active_players().count(), 1);
        let p = server.table().active_players().next().unwrap();
        assert_eq!(p.session_id, 5);
        assert_eq!(p.last_receive_time_us, 1_000);
    }

    #[test]
    fn higher_session_id_supersedes_and_disconnects_the_old_record() {
        let mut server = Server::new(ServerConfig::default());
        join(&mut server, 1, 100, "C", 1_000);
        join(&mut server, 1, 200, "C", 2_000);
        let active: Vec<_> = server.table().active_players().collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, 200);
    }

    #[test]
    fn reconnect_does_not_evict_a_snake_holding_player_mid_game() {
        let mut server = Server::new(ServerConfig {
            seed: 3,
            ..Default::default()
        });
        join(&mut server, 1, 1, "A", 0);
        join(&mut server, 2, 1, "B", 0);
        server.tick(0);
        assert!(server.engine().is_running());

        // Player A reconnects with a higher session id mid-game.
        join(&mut server, 1, 2, "A", 1_000);
        server.tick(2_000);
        // The snake-holding record (now disconnected) is not evicted while
        // it still owns a snake, even though it has gone stale.
        assert_eq!(server.table().len(), 3);
    }

    #[test]
    fn inactive_observer_is_evicted_after_timeout() {
        let mut server = Server::new(ServerConfig::default());
        join(&mut server, 1, 1, "", 0);
        server.tick(INACTIVITY_TIMEOUT_US + 1);
        assert_eq!(server.table().len(), 0);
    }

    #[test]
    fn empty_name_never_becomes_ready() {
        let mut server = Server::new(ServerConfig::default());
        join(&mut server, 1, 1, "", 0);
        assert_eq!(server.table().game_start_candidates().len(), 0);
    }

    #[test]
    fn confirm_sent_is_the_only_thing_that_advances_the_cursor() {
        let mut server = Server::new(ServerConfig {
            seed: 9,
            ..Default::default()
        });
        join(&mut server, 1, 1, "A", 0);
        join(&mut server, 2, 1, "B", 0);
        server.tick(0);

        let pending = server.pending_sends();
        assert!(!pending.is_empty());
        let before = server
            .table()
            .active_players()
            .map(|p| p.next_expected_event)
            .collect::<Vec<_>>();
        assert!(before.iter().all(|&c| c == 0));

        // Computing pending sends again without confirming must not move
        // the cursor.
        let _ = server.pending_sends();
        let still_before = server
            .table()
            .active_players()
            .map(|p| p.next_expected_event)
            .collect::<Vec<_>>();
        assert_eq!(before, still_before);

        for send in &pending {
            server.confirm_sent(send);
        }
        let after = server
            .table()
            .active_players()
            .map(|p| p.next_expected_event)
            .collect::<Vec<_>>();
        assert!(after.iter().all(|&c| c > 0));
    }

    #[test]
    fn malformed_datagram_is_dropped_without_touching_the_table() {
        let mut server = Server::new(ServerConfig::default());
        server.handle_datagram(addr(1), 9001, &[0u8; 2], 0);
        assert_eq!(server.table().len(), 0);
    }
}
