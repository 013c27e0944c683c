//! Wire protocol codec.
//!
//! Defines the two datagram shapes exchanged between client and server and
//! the byte-level encode/decode logic for each. There is no serialization
//! framework underneath this: both directions use a small fixed-field,
//! big-endian layout so that every byte on the wire is accounted for and a
//! single flipped bit can only ever invalidate one event frame.
//!
//! Client -> server datagrams are a single fixed-plus-name-tail record.
//! Server -> client datagrams are a `game_id` header followed by a
//! concatenation of independently CRC-32-protected event frames, each of
//! which may be individually truncated, corrupted, or of an unrecognized
//! type without taking down the rest of the datagram (unknown types) or the
//! rest of the connection (corrupt/truncated types just end that datagram).

#![deny(unsafe_code)]

use std::fmt;

/// Maximum size, in bytes, of any datagram in either direction.
pub const MAX_DATAGRAM_SIZE: usize = 512;

/// Maximum length, in bytes, of a player name.
pub const PLAYER_NAME_MAX_LEN: usize = 64;

/// Fixed portion of a client -> server datagram: session id (8) + turn
/// direction (1) + next expected event number (4).
const CLIENT_HEADER_LEN: usize = 8 + 1 + 4;

/// Errors produced while decoding either datagram direction.
///
/// None of these are fatal to the process that observes them: a malformed
/// client datagram is dropped, and a malformed event frame ends processing
/// of the remainder of that one datagram only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes were present than the claimed length requires.
    Truncated,
    /// The CRC-32 trailer did not match the computed checksum.
    BadCrc,
    /// The event type byte did not match any known variant.
    UnknownEventType(u8),
    /// The datagram was a well-formed shape but failed a field-level
    /// constraint (name character range, turn direction range, event
    /// payload length for its declared type, and so on).
    Malformed(&'static str),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Truncated => write!(f, "truncated datagram"),
            CodecError::BadCrc => write!(f, "crc-32 mismatch"),
            CodecError::UnknownEventType(b) => write!(f, "unknown event type {b}"),
            CodecError::Malformed(reason) => write!(f, "malformed datagram: {reason}"),
        }
    }
}

impl std::error::Error for CodecError {}

fn crc32_of(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(0);
    hasher.update(bytes);
    hasher.finalize()
}

// ---------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------

/// Decoded fields of a client -> server datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDatagram {
    pub session_id: u64,
    pub turn_direction: i8,
    pub next_expected_event: u32,
    pub name: Vec<u8>,
}

impl ClientDatagram {
    /// Builds a datagram, validating the constraints the decoder also
    /// enforces so that `decode(new(..).encode())` is always the identity.
    pub fn new(
        session_id: u64,
        turn_direction: i8,
        next_expected_event: u32,
        name: Vec<u8>,
    ) -> Result<Self, CodecError> {
        if !(-1..=1).contains(&turn_direction) {
            return Err(CodecError::Malformed("turn_direction out of range"));
        }
        if name.len() > PLAYER_NAME_MAX_LEN {
            return Err(CodecError::Malformed("name too long"));
        }
        if name.iter().any(|&b| !(33..=126).contains(&b)) {
            return Err(CodecError::Malformed("name byte out of range"));
        }
        Ok(Self {
            session_id,
            turn_direction,
            next_expected_event,
            name,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CLIENT_HEADER_LEN + self.name.len());
        out.extend_from_slice(&self.session_id.to_be_bytes());
        out.push(self.turn_direction as u8);
        out.extend_from_slice(&self.next_expected_event.to_be_bytes());
        out.extend_from_slice(&self.name);
        out
    }
}

/// Decodes a client -> server datagram, enforcing the size bound and the
/// name character range before returning the fields.
pub fn decode_client_to_server(bytes: &[u8]) -> Result<ClientDatagram, CodecError> {
    if bytes.len() < CLIENT_HEADER_LEN || bytes.len() > CLIENT_HEADER_LEN + PLAYER_NAME_MAX_LEN {
        return Err(CodecError::Truncated);
    }
    let session_id = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
    let turn_direction = bytes[8] as i8;
    if !(-1..=1).contains(&turn_direction) {
        return Err(CodecError::Malformed("turn_direction out of range"));
    }
    let next_expected_event = u32::from_be_bytes(bytes[9..13].try_into().unwrap());
    let name = bytes[13..].to_vec();
    if name.iter().any(|&b| !(33..=126).contains(&b)) {
        return Err(CodecError::Malformed("name byte out of range"));
    }
    Ok(ClientDatagram {
        session_id,
        turn_direction,
        next_expected_event,
        name,
    })
}

// ---------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------

/// One of the four event kinds that may appear in an event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventBody {
    NewGame {
        max_x: u32,
        max_y: u32,
        names: Vec<Vec<u8>>,
    },
    Pixel {
        player_number: u8,
        x: u32,
        y: u32,
    },
    PlayerEliminated {
        player_number: u8,
    },
    GameOver,
}

impl EventBody {
    fn type_byte(&self) -> u8 {
        match self {
            EventBody::NewGame { .. } => 0,
            EventBody::Pixel { .. } => 1,
            EventBody::PlayerEliminated { .. } => 2,
            EventBody::GameOver => 3,
        }
    }

    fn encode_data(&self) -> Vec<u8> {
        match self {
            EventBody::NewGame { max_x, max_y, names } => {
                let mut data = Vec::new();
                data.extend_from_slice(&max_x.to_be_bytes());
                data.extend_from_slice(&max_y.to_be_bytes());
                for name in names {
                    data.extend_from_slice(name);
                    data.push(0);
                }
                data
            }
            EventBody::Pixel { player_number, x, y } => {
                let mut data = Vec::with_capacity(9);
                data.push(*player_number);
                data.extend_from_slice(&x.to_be_bytes());
                data.extend_from_slice(&y.to_be_bytes());
                data
            }
            EventBody::PlayerEliminated { player_number } => vec![*player_number],
            EventBody::GameOver => Vec::new(),
        }
    }
}

/// An event together with the log position it occupies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberedEvent {
    pub event_number: u32,
    pub body: EventBody,
}

fn encode_event(ev: &NumberedEvent) -> Vec<u8> {
    let data = ev.body.encode_data();
    let len = 5 + data.len() as u32;
    let mut frame = Vec::with_capacity(4 + len as usize + 4);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&ev.event_number.to_be_bytes());
    frame.push(ev.body.type_byte());
    frame.extend_from_slice(&data);
    let crc = crc32_of(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

/// Packs as many leading events as fit into one datagram of at most
/// [`MAX_DATAGRAM_SIZE`] bytes, always including at least the first event
/// even if it alone exceeds the budget. Returns the encoded bytes and the
/// number of events consumed from the front of `events`; callers advance
/// their per-player cursor only by that count, and only once the send of
/// the returned bytes has actually succeeded.
pub fn pack_datagram(game_id: u32, events: &[NumberedEvent]) -> (Vec<u8>, usize) {
    let mut out = Vec::with_capacity(MAX_DATAGRAM_SIZE);
    out.extend_from_slice(&game_id.to_be_bytes());
    let mut consumed = 0;
    for ev in events {
        let encoded = encode_event(ev);
        if consumed > 0 && out.len() + encoded.len() > MAX_DATAGRAM_SIZE {
            break;
        }
        out.extend_from_slice(&encoded);
        consumed += 1;
    }
    (out, consumed)
}

/// A parsed server -> client datagram header plus the remaining event
/// bytes, ready to be walked with [`ServerDatagram::events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerDatagram<'a> {
    pub game_id: u32,
    tail: &'a [u8],
}

impl<'a> ServerDatagram<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, CodecError> {
        if bytes.len() < 4 {
            return Err(CodecError::Truncated);
        }
        let game_id = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        Ok(Self {
            game_id,
            tail: &bytes[4..],
        })
    }

    pub fn events(&self) -> EventIter<'a> {
        EventIter {
            buf: self.tail,
            pos: 0,
            done: false,
        }
    }
}

/// Iterates the event frames of one server -> client datagram.
///
/// Frames whose event type is not recognized are skipped transparently
/// (tolerated, per the unknown-event-type rule) as long as their own CRC
/// validates; frames that are truncated or fail CRC end the iteration,
/// abandoning whatever bytes remain in the datagram.
pub struct EventIter<'a> {
    buf: &'a [u8],
    pos: usize,
    done: bool,
}

enum Frame {
    Known(NumberedEvent),
    Unknown,
}

impl<'a> EventIter<'a> {
    fn parse_one(&mut self) -> Result<(Frame, usize), CodecError> {
        let rest = &self.buf[self.pos..];
        if rest.len() < 4 {
            return Err(CodecError::Truncated);
        }
        let len = u32::from_be_bytes(rest[0..4].try_into().unwrap());
        if len < 5 {
            return Err(CodecError::Malformed("event len below minimum header size"));
        }
        let total = 4 + len as usize + 4;
        if rest.len() < total {
            return Err(CodecError::Truncated);
        }
        let crc_region = &rest[0..4 + len as usize];
        let stored_crc =
            u32::from_be_bytes(rest[4 + len as usize..total].try_into().unwrap());
        if crc32_of(crc_region) != stored_crc {
            return Err(CodecError::BadCrc);
        }
        let event_number = u32::from_be_bytes(rest[4..8].try_into().unwrap());
        let event_type = rest[8];
        let data = &rest[9..4 + len as usize];

        let body = match event_type {
            0 => {
                if data.len() < 8 {
                    return Err(CodecError::Malformed("new_game payload too short"));
                }
                let max_x = u32::from_be_bytes(data[0..4].try_into().unwrap());
                let max_y = u32::from_be_bytes(data[4..8].try_into().unwrap());
                let mut names = Vec::new();
                let mut start = 8;
                for (i, &b) in data[8..].iter().enumerate() {
                    if b == 0 {
                        let end = 8 + i;
                        if end == start {
                            return Err(CodecError::Malformed("empty name in new_game"));
                        }
                        names.push(data[start..end].to_vec());
                        start = end + 1;
                    }
                }
                if start != data.len() {
                    return Err(CodecError::Malformed("new_game name list not nul-terminated"));
                }
                EventBody::NewGame { max_x, max_y, names }
            }
            1 => {
                if data.len() != 9 {
                    return Err(CodecError::Malformed("pixel payload wrong size"));
                }
                EventBody::Pixel {
                    player_number: data[0],
                    x: u32::from_be_bytes(data[1..5].try_into().unwrap()),
                    y: u32::from_be_bytes(data[5..9].try_into().unwrap()),
                }
            }
            2 => {
                if data.len() != 1 {
                    return Err(CodecError::Malformed("player_eliminated payload wrong size"));
                }
                EventBody::PlayerEliminated {
                    player_number: data[0],
                }
            }
            3 => {
                if !data.is_empty() {
                    return Err(CodecError::Malformed("game_over payload must be empty"));
                }
                EventBody::GameOver
            }
            _unknown => return Ok((Frame::Unknown, total)),
        };
        Ok((Frame::Known(NumberedEvent { event_number, body }), total))
    }
}

impl<'a> Iterator for EventIter<'a> {
    type Item = Result<NumberedEvent, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.pos >= self.buf.len() {
                return None;
            }
            match self.parse_one() {
                Ok((Frame::Known(ev), consumed)) => {
                    self.pos += consumed;
                    return Some(Ok(ev));
                }
                Ok((Frame::Unknown, consumed)) => {
                    self.pos += consumed;
                    continue;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn client_datagram_round_trips() {
        let dg = ClientDatagram::new(42, -1, 7, b"alice".to_vec()).unwrap();
        let encoded = dg.encode();
        let decoded = decode_client_to_server(&encoded).unwrap();
        assert_eq!(dg, decoded);
    }

    #[test]
    fn client_datagram_empty_name_is_observer() {
        let dg = ClientDatagram::new(1, 0, 0, Vec::new()).unwrap();
        let decoded = decode_client_to_server(&dg.encode()).unwrap();
        assert!(decoded.name.is_empty());
    }

    #[test]
    fn client_datagram_rejects_bad_turn_direction() {
        assert_eq!(
            ClientDatagram::new(1, 2, 0, Vec::new()),
            Err(CodecError::Malformed("turn_direction out of range"))
        );
    }

    #[test]
    fn client_datagram_rejects_out_of_range_name_byte() {
        let mut bytes = ClientDatagram::new(1, 0, 0, b"ok".to_vec())
            .unwrap()
            .encode();
        // Inject a control character (0x01) into the name tail.
        *bytes.last_mut().unwrap() = 0x01;
        assert_eq!(
            decode_client_to_server(&bytes),
            Err(CodecError::Malformed("name byte out of range"))
        );
    }

    #[test]
    fn client_datagram_rejects_truncated() {
        assert_eq!(decode_client_to_server(&[0u8; 3]), Err(CodecError::Truncated));
    }

    #[test]
    fn client_datagram_rejects_oversize_name() {
        let name = vec![b'a'; PLAYER_NAME_MAX_LEN + 1];
        assert!(matches!(
            ClientDatagram::new(1, 0, 0, name),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn server_datagram_round_trips_multiple_events() {
        let events = vec![
            NumberedEvent {
                event_number: 0,
                body: EventBody::NewGame {
                    max_x: 800,
                    max_y: 800,
                    names: vec![b"A".to_vec(), b"B".to_vec()],
                },
            },
            pixel(1, 0, 10, 20),
            pixel(2, 1, 11, 21),
        ];
        let (bytes, consumed) = pack_datagram(99, &events);
        assert_eq!(consumed, 3);
        let parsed = ServerDatagram::parse(&bytes).unwrap();
        assert_eq!(parsed.game_id, 99);
        let decoded: Result<Vec<_>, _> = parsed.events().collect();
        assert_eq!(decoded.unwrap(), events);
    }

    #[test]
    fn pack_datagram_stops_at_size_budget_but_keeps_first_event() {
        let big_names: Vec<Vec<u8>> = (0..40).map(|i| vec![b'a' + (i % 26); 10]).collect();
        let events = vec![
            NumberedEvent {
                event_number: 0,
                body: EventBody::NewGame {
                    max_x: 1,
                    max_y: 1,
                    names: big_names,
                },
            },
            pixel(1, 0, 1, 1),
        ];
        let (bytes, consumed) = pack_datagram(1, &events);
        assert_eq!(consumed, 1);
        assert!(bytes.len() > MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn unknown_event_type_is_skipped_not_fatal() {
        let known = pixel(5, 2, 3, 4);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_be_bytes()); // game_id

        // Hand-roll one frame of an unrecognized type (200) with empty data.
        let len: u32 = 5;
        let mut unknown_frame = Vec::new();
        unknown_frame.extend_from_slice(&len.to_be_bytes());
        unknown_frame.extend_from_slice(&9u32.to_be_bytes()); // event_number
        unknown_frame.push(200); // unrecognized type
        let crc = crc32_of(&unknown_frame);
        unknown_frame.extend_from_slice(&crc.to_be_bytes());
        bytes.extend_from_slice(&unknown_frame);

        bytes.extend_from_slice(&encode_event(&known));

        let parsed = ServerDatagram::parse(&bytes).unwrap();
        let decoded: Vec<_> = parsed.events().collect::<Result<_, _>>().unwrap();
        assert_eq!(decoded, vec![known]);
    }

    #[test]
    fn crc_isolation_rejects_only_the_corrupted_event() {
        let events = vec![pixel(0, 0, 1, 1), pixel(1, 1, 2, 2), pixel(2, 0, 3, 3)];
        let (mut bytes, consumed) = pack_datagram(7, &events);
        assert_eq!(consumed, 3);

        // Corrupt a byte inside the second event's player_number field.
        let first_len = 4 + 4 + 4 + 1 + 9 + 4; // game_id + first pixel frame
        bytes[first_len + 4 + 4] ^= 0xFF; // flips the player_number byte of event 1

        let parsed = ServerDatagram::parse(&bytes).unwrap();
        let mut iter = parsed.events();
        assert_eq!(iter.next(), Some(Ok(events[0].clone())));
        assert_eq!(iter.next(), Some(Err(CodecError::BadCrc)));
        assert_eq!(iter.next(), None);

        // The third event's own bytes are untouched by the corruption and
        // decode correctly when taken in isolation.
        let (solo_bytes, _) = pack_datagram(7, &events[2..]);
        let solo = ServerDatagram::parse(&solo_bytes).unwrap();
        let solo_decoded: Vec<_> = solo.events().collect::<Result<_, _>>().unwrap();
        assert_eq!(solo_decoded, vec![events[2].clone()]);
    }

    #[test]
    fn truncated_event_frame_ends_iteration() {
        let (mut bytes, _) = pack_datagram(1, &[pixel(0, 0, 1, 1)]);
        bytes.truncate(bytes.len() - 2);
        let parsed = ServerDatagram::parse(&bytes).unwrap();
        let mut iter = parsed.events();
        assert_eq!(iter.next(), Some(Err(CodecError::Truncated)));
        assert_eq!(iter.next(), None);
    }
}
