//! Connection table: the set of known `(address, port, name)` identities
//! and the session-id arbitration, eviction, and datagram-cursor logic
//! that lives on top of it.

use std::cmp::Ordering;
use std::net::{IpAddr, Ipv6Addr};

use glowtrail_sim::Candidate;
use glowtrail_wire::{ClientDatagram, NumberedEvent, pack_datagram};

use crate::INACTIVITY_TIMEOUT_US;

/// Canonicalizes an IPv4-mapped IPv6 address down to its IPv4 form so a
/// client is recognized as one identity regardless of which family the
/// socket handed back for a given packet.
pub fn canonicalize_address(address: IpAddr) -> IpAddr {
    match address {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        other => other,
    }
}

/// One server-side connection record.
#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub address: IpAddr,
    pub port: u16,
    pub name: Vec<u8>,
    pub session_id: u64,
    pub last_receive_time_us: u64,
    pub ready: bool,
    pub has_snake: bool,
    pub player_number: Option<u8>,
    pub next_expected_event: u32,
    pub disconnected: bool,
}

impl Player {
    fn matches_identity(&self, address: IpAddr, port: u16, name: &[u8]) -> bool {
        self.address == address && self.port == port && self.name == name
    }
}

/// Outcome of [`ConnectionTable::dispatch`], for the caller to decide what
/// (if anything) to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The datagram was applied to an existing or newly created record at
    /// this index. `superseded_session` is set if a lower-session-id
    /// record at the same identity was disconnected to make room.
    Accepted {
        index: usize,
        superseded_session: Option<u64>,
    },
    /// The datagram's session id was lower than the active record's; it
    /// was dropped without any state change.
    Stale,
}

/// A datagram owed to one player, computed from the engine's log and that
/// player's cursor but not yet confirmed sent.
pub struct PendingSend {
    pub index: usize,
    pub address: IpAddr,
    pub port: u16,
    pub bytes: Vec<u8>,
    advance_to: u32,
}

/// Insertion-ordered set of connection records. Insertion order matters
/// because game-start player-number assignment is derived from name, then
/// session-id order, not from table position, but iteration order here is
/// still what a reader would expect from a plain connection list.
#[derive(Default)]
pub struct ConnectionTable {
    players: Vec<Player>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self { players: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn player(&self, index: usize) -> &Player {
        &self.players[index]
    }

    /// All non-disconnected records, in table order.
    pub fn active_players(&self) -> impl Iterator<Item = &Player> {
        self.players.iter().filter(|p| !p.disconnected)
    }

    fn active_index(&self, address: IpAddr, port: u16, name: &[u8]) -> Option<usize> {
        self.players
            .iter()
            .position(|p| !p.disconnected && p.matches_identity(address, port, name))
    }

    /// Applies the session-id arbitration rule from the datagram-handling
    /// design: equal session ids update in place, a higher session id
    /// disconnects the old record and creates a new one, and a lower
    /// session id is dropped untouched. There is exactly one active record
    /// per identity at any time, so these three cases are mutually
    /// exclusive outcomes of one comparison.
    pub fn dispatch(
        &mut self,
        address: IpAddr,
        port: u16,
        datagram: &ClientDatagram,
        now_us: u64,
    ) -> DispatchOutcome {
        let address = canonicalize_address(address);
        match self.active_index(address, port, &datagram.name) {
            Some(index) => {
                let stored = self.players[index].session_id;
                match datagram.session_id.cmp(&stored) {
                    Ordering::Equal => {
                        self.apply_update(index, datagram, now_us);
                        DispatchOutcome::Accepted {
                            index,
                            superseded_session: None,
                        }
                    }
                    Ordering::Greater => {
                        self.players[index].disconnected = true;
                        let new_index = self.push_new(address, port, datagram, now_us);
                        DispatchOutcome::Accepted {
                            index: new_index,
                            superseded_session: Some(stored),
                        }
                    }
                    Ordering::Less => DispatchOutcome::Stale,
                }
            }
            None => {
                let index = self.push_new(address, port, datagram, now_us);
                DispatchOutcome::Accepted {
                    index,
                    superseded_session: None,
                }
            }
        }
    }

    fn apply_update(&mut self, index: usize, datagram: &ClientDatagram, now_us: u64) {
        let p = &mut self.players[index];
        p.last_receive_time_us = now_us;
        p.next_expected_event = datagram.next_expected_event;
        if !p.has_snake && !p.name.is_empty() && datagram.turn_direction != 0 {
            p.ready = true;
        }
    }

    fn push_new(&mut self, address: IpAddr, port: u16, datagram: &ClientDatagram, now_us: u64) -> usize {
        self.players.push(Player {
            address,
            port,
            name: datagram.name.clone(),
            session_id: datagram.session_id,
            last_receive_time_us: now_us,
            ready: !datagram.name.is_empty() && datagram.turn_direction != 0,
            has_snake: false,
            player_number: None,
            next_expected_event: datagram.next_expected_event,
            disconnected: false,
        });
        self.players.len() - 1
    }

    /// Ready, named, non-disconnected records offered to the engine as
    /// game-start candidates. Observers (empty name) never qualify.
    pub fn game_start_candidates(&self) -> Vec<Candidate> {
        self.active_players()
            .filter(|p| p.ready && !p.name.is_empty())
            .map(|p| Candidate {
                name: p.name.clone(),
                session_id: p.session_id,
            })
            .collect()
    }

    /// False if any connected, named (non-observer) player has not yet
    /// signaled ready. The game waits for everyone at the table, not just
    /// the first two to turn a key.
    pub fn everyone_ready(&self) -> bool {
        self.active_players()
            .filter(|p| !p.name.is_empty())
            .all(|p| p.ready)
    }

    /// Marks the connection-table record for each included candidate as
    /// snake-holding, assigning it the `player_number` implied by its
    /// position in the engine's accepted list.
    pub fn mark_game_started(&mut self, included: &[Candidate]) {
        for (player_number, candidate) in included.iter().enumerate() {
            if let Some(p) = self
                .players
                .iter_mut()
                .find(|p| !p.disconnected && p.name == candidate.name && p.session_id == candidate.session_id)
            {
                p.has_snake = true;
                p.player_number = Some(player_number as u8);
            }
        }
    }

    /// Clears `ready` and `has_snake`/`player_number` on every record once
    /// the engine reports GAME_OVER.
    pub fn mark_game_ended(&mut self) {
        for p in &mut self.players {
            p.has_snake = false;
            p.player_number = None;
            p.ready = false;
        }
    }

    /// Reclaims connections that have gone quiet without holding a snake,
    /// or whose record was superseded by a reconnect and also holds no
    /// snake.
    pub fn evict(&mut self, now_us: u64) {
        self.players.retain(|p| {
            if p.has_snake {
                return true;
            }
            let idle = now_us.saturating_sub(p.last_receive_time_us) > INACTIVITY_TIMEOUT_US;
            !(p.disconnected || idle)
        });
    }

    /// Computes the next datagram owed to each connected player from the
    /// engine's current log and that player's cursor. Does not mutate the
    /// table; call [`ConnectionTable::confirm_sent`] once a send succeeds.
    pub fn pending_sends(&self, game_id: u32, log: &[NumberedEvent]) -> Vec<PendingSend> {
        let mut out = Vec::new();
        for (index, p) in self.players.iter().enumerate() {
            if p.disconnected {
                continue;
            }
            let cursor = p.next_expected_event as usize;
            if cursor >= log.len() {
                continue;
            }
            let (bytes, consumed) = pack_datagram(game_id, &log[cursor..]);
            if consumed == 0 {
                continue;
            }
            out.push(PendingSend {
                index,
                address: p.address,
                port: p.port,
                bytes,
                advance_to: cursor as u32 + consumed as u32,
            });
        }
        out
    }

    pub fn confirm_sent(&mut self, pending: &PendingSend) {
        if let Some(p) = self.players.get_mut(pending.index) {
            p.next_expected_event = pending.advance_to;
        }
    }
}
