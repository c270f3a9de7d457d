//! W3GS packet codec.
//!
//! Every packet on the TCP stream is framed as
//! `[0xF7][type:u8][length:u16_le][payload...]` where `length` covers the
//! whole four-byte header. The same framing travels over UDP for the LAN
//! discovery packets (`SEARCHGAME`, `GAMEINFO`, ...).
//!
//! Receive functions take the complete framed packet and return typed
//! values; send functions return complete framed buffers. Anything
//! malformed is a [`ProtocolError`] — the session closes the offending
//! connection and keeps running.

pub mod slot;

use crate::util::{
    extract_cstring, put_cstring, put_u16_le, put_u32_le, u16_le, u32_le, ProtocolError,
};
use slot::GameSlot;

pub const W3GS_HEADER_CONSTANT: u8 = 0xF7;

pub const W3GS_PING_FROM_HOST: u8 = 0x01;
pub const W3GS_SLOTINFOJOIN: u8 = 0x04;
pub const W3GS_REJECTJOIN: u8 = 0x05;
pub const W3GS_PLAYERINFO: u8 = 0x06;
pub const W3GS_PLAYERLEAVE_OTHERS: u8 = 0x07;
pub const W3GS_GAMELOADED_OTHERS: u8 = 0x08;
pub const W3GS_SLOTINFO: u8 = 0x09;
pub const W3GS_COUNTDOWN_START: u8 = 0x0A;
pub const W3GS_COUNTDOWN_END: u8 = 0x0B;
pub const W3GS_INCOMING_ACTION: u8 = 0x0C;
pub const W3GS_CHAT_FROM_HOST: u8 = 0x0F;
pub const W3GS_START_LAG: u8 = 0x10;
pub const W3GS_STOP_LAG: u8 = 0x11;
pub const W3GS_REQJOIN: u8 = 0x1E;
pub const W3GS_LEAVEGAME: u8 = 0x21;
pub const W3GS_GAMELOADED_SELF: u8 = 0x23;
pub const W3GS_OUTGOING_ACTION: u8 = 0x26;
pub const W3GS_OUTGOING_KEEPALIVE: u8 = 0x27;
pub const W3GS_CHAT_TO_HOST: u8 = 0x28;
pub const W3GS_SEARCHGAME: u8 = 0x2F;
pub const W3GS_GAMEINFO: u8 = 0x30;
pub const W3GS_CREATEGAME: u8 = 0x31;
pub const W3GS_REFRESHGAME: u8 = 0x32;
pub const W3GS_DECREATEGAME: u8 = 0x33;
pub const W3GS_MAPCHECK: u8 = 0x3D;
pub const W3GS_MAPSIZE: u8 = 0x42;
pub const W3GS_PONG_TO_HOST: u8 = 0x46;
pub const W3GS_INCOMING_ACTION2: u8 = 0x48;

/// Product identifier for The Frozen Throne, as it appears on the wire.
pub const PRODUCT_TFT: [u8; 4] = *b"PX3W";

pub const GAMETYPE_CUSTOM: u32 = 1;
pub const GAMETYPE_BLIZZARD: u32 = 9;

pub const REJECTJOIN_FULL: u32 = 9;
pub const REJECTJOIN_STARTED: u32 = 10;
pub const REJECTJOIN_WRONGPASSWORD: u32 = 27;

pub const PLAYERLEAVE_DISCONNECT: u32 = 1;
pub const PLAYERLEAVE_LOST: u32 = 7;
pub const PLAYERLEAVE_LOSTBUILDINGS: u32 = 8;
pub const PLAYERLEAVE_WON: u32 = 9;
pub const PLAYERLEAVE_DRAW: u32 = 10;
pub const PLAYERLEAVE_OBSERVER: u32 = 11;
pub const PLAYERLEAVE_LOBBY: u32 = 13;

/// `CHAT_TO_HOST` discriminators.
pub const CHAT_MESSAGE: u8 = 0x10;
pub const CHAT_MESSAGE_EXTRA: u8 = 0x11;
pub const CHAT_TEAMCHANGE: u8 = 0x12;
pub const CHAT_COLOURCHANGE: u8 = 0x13;
pub const CHAT_RACECHANGE: u8 = 0x14;
pub const CHAT_HANDICAPCHANGE: u8 = 0x15;
/// `CHAT_FROM_HOST` flag used once the game is running (carries extra flags).
pub const CHAT_FROM_HOST_INGAME: u8 = 0x20;

/// Hard limit on the post-id payload of a single action broadcast. Combined
/// action batches beyond this are split across `INCOMING_ACTION2` packets.
pub const ACTION_PAYLOAD_LIMIT: usize = 1452;
/// Fixed bytes of an action broadcast before the packed actions begin.
const ACTION_PACKET_OVERHEAD: usize = 6;

pub const MAX_NAME_LEN: usize = 15;

// ---------------------------------------------------------------------------
// framing

/// Checks the header byte and that the declared length matches the byte run.
/// Returns the packet type.
pub fn validate_frame(data: &[u8]) -> Result<u8, ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::Truncated { off: 0, need: 4, have: data.len() });
    }
    if data[0] != W3GS_HEADER_CONSTANT {
        return Err(ProtocolError::BadHeader(data[0]));
    }
    let declared = u16_le(data, 2)? as usize;
    if declared != data.len() {
        return Err(ProtocolError::LengthMismatch { declared, actual: data.len() });
    }
    Ok(data[1])
}

fn expect_type(data: &[u8], packet_type: u8) -> Result<(), ProtocolError> {
    let t = validate_frame(data)?;
    if t != packet_type {
        return Err(ProtocolError::UnknownType(t));
    }
    Ok(())
}

fn header(packet_type: u8) -> Vec<u8> {
    vec![W3GS_HEADER_CONSTANT, packet_type, 0, 0]
}

/// Patches the length field once the payload is complete.
fn finish(mut packet: Vec<u8>) -> Vec<u8> {
    let len = packet.len() as u16;
    packet[2..4].copy_from_slice(&len.to_le_bytes());
    packet
}

/// A 16-byte sockaddr block: AF_INET, port in network order, IPv4 address,
/// eight bytes of zero padding.
fn put_sockaddr(out: &mut Vec<u8>, port: u16, ip: u32) {
    put_u16_le(out, 2);
    out.extend_from_slice(&port.to_be_bytes());
    put_u32_le(out, ip);
    out.extend_from_slice(&[0u8; 8]);
}

/// Reads the IPv4 address out of a 16-byte sockaddr block at `off`.
fn sockaddr_ip(buf: &[u8], off: usize) -> Result<u32, ProtocolError> {
    if buf.len() < off + 16 {
        return Err(ProtocolError::Truncated { off, need: 16, have: buf.len().saturating_sub(off) });
    }
    u32_le(buf, off + 4)
}

// ---------------------------------------------------------------------------
// receive

/// Decoded `REQJOIN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingJoinRequest {
    pub host_counter: u32,
    pub entry_key: u32,
    pub name: String,
    pub internal_ip: u32,
}

pub fn receive_req_join(data: &[u8]) -> Result<IncomingJoinRequest, ProtocolError> {
    expect_type(data, W3GS_REQJOIN)?;
    let host_counter = u32_le(data, 4)?;
    let entry_key = u32_le(data, 8)?;
    let _unknown = u32_le(data, 12)?;
    let _listen_port = u16_le(data, 16)?;
    let _peer_key = u32_le(data, 18)?;
    let (name_bytes, off) = extract_cstring(data, 22)?;
    if name_bytes.is_empty() || name_bytes.len() > MAX_NAME_LEN {
        return Err(ProtocolError::BadField("player name"));
    }
    let (_unknown2, off) = extract_cstring(data, off)?;
    let internal_ip = sockaddr_ip(data, off)?;
    Ok(IncomingJoinRequest {
        host_counter,
        entry_key,
        name: String::from_utf8_lossy(name_bytes).into_owned(),
        internal_ip,
    })
}

pub fn receive_leave_game(data: &[u8]) -> Result<u32, ProtocolError> {
    expect_type(data, W3GS_LEAVEGAME)?;
    u32_le(data, 4)
}

pub fn receive_game_loaded_self(data: &[u8]) -> Result<(), ProtocolError> {
    expect_type(data, W3GS_GAMELOADED_SELF)?;
    Ok(())
}

/// One player's raw action block, queued by the session until the next
/// broadcast tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingAction {
    pub pid: u8,
    pub crc: u32,
    pub action: Vec<u8>,
}

impl IncomingAction {
    /// Bytes this action occupies inside a packed broadcast
    /// (pid + length prefix + data).
    pub fn packed_len(&self) -> usize {
        self.action.len() + 3
    }
}

pub fn receive_outgoing_action(data: &[u8], pid: u8) -> Result<IncomingAction, ProtocolError> {
    expect_type(data, W3GS_OUTGOING_ACTION)?;
    let crc = u32_le(data, 4)?;
    Ok(IncomingAction { pid, crc, action: data[8..].to_vec() })
}

pub fn receive_outgoing_keepalive(data: &[u8]) -> Result<u32, ProtocolError> {
    expect_type(data, W3GS_OUTGOING_KEEPALIVE)?;
    if data.len() < 9 {
        return Err(ProtocolError::Truncated { off: 4, need: 5, have: data.len() - 4 });
    }
    u32_le(data, 5)
}

/// Decoded `CHAT_TO_HOST`, discriminated on the flag byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingChat {
    Message { from_pid: u8, to_pids: Vec<u8>, message: String },
    MessageExtra { from_pid: u8, to_pids: Vec<u8>, extra_flags: u32, message: String },
    TeamChange { from_pid: u8, team: u8 },
    ColourChange { from_pid: u8, colour: u8 },
    RaceChange { from_pid: u8, race: u8 },
    HandicapChange { from_pid: u8, handicap: u8 },
}

pub fn receive_chat_to_host(data: &[u8]) -> Result<IncomingChat, ProtocolError> {
    expect_type(data, W3GS_CHAT_TO_HOST)?;
    if data.len() < 6 {
        return Err(ProtocolError::Truncated { off: 4, need: 2, have: data.len() - 4 });
    }
    let from_pid = data[4];
    let to_count = data[5] as usize;
    let to_end = 6 + to_count;
    let to_pids = data
        .get(6..to_end)
        .ok_or(ProtocolError::Truncated { off: 6, need: to_count, have: data.len().saturating_sub(6) })?
        .to_vec();
    let flag = *data.get(to_end).ok_or(ProtocolError::Truncated {
        off: to_end,
        need: 1,
        have: 0,
    })?;
    let tail = to_end + 1;

    let one_byte = |name| {
        data.get(tail).copied().ok_or(ProtocolError::BadField(name))
    };

    match flag {
        CHAT_MESSAGE => {
            let (msg, _) = extract_cstring(data, tail)?;
            Ok(IncomingChat::Message {
                from_pid,
                to_pids,
                message: String::from_utf8_lossy(msg).into_owned(),
            })
        }
        CHAT_MESSAGE_EXTRA => {
            let extra_flags = u32_le(data, tail)?;
            let (msg, _) = extract_cstring(data, tail + 4)?;
            Ok(IncomingChat::MessageExtra {
                from_pid,
                to_pids,
                extra_flags,
                message: String::from_utf8_lossy(msg).into_owned(),
            })
        }
        CHAT_TEAMCHANGE => Ok(IncomingChat::TeamChange { from_pid, team: one_byte("team")? }),
        CHAT_COLOURCHANGE => Ok(IncomingChat::ColourChange { from_pid, colour: one_byte("colour")? }),
        CHAT_RACECHANGE => Ok(IncomingChat::RaceChange { from_pid, race: one_byte("race")? }),
        CHAT_HANDICAPCHANGE => {
            Ok(IncomingChat::HandicapChange { from_pid, handicap: one_byte("handicap")? })
        }
        _ => Err(ProtocolError::BadField("chat flag")),
    }
}

/// Decoded `MAPSIZE` — the client's report of how much of the map it has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingMapSize {
    pub size_flag: u8,
    pub map_size: u32,
}

pub fn receive_map_size(data: &[u8]) -> Result<IncomingMapSize, ProtocolError> {
    expect_type(data, W3GS_MAPSIZE)?;
    let _unknown = u32_le(data, 4)?;
    let size_flag = *data.get(8).ok_or(ProtocolError::Truncated { off: 8, need: 1, have: 0 })?;
    let map_size = u32_le(data, 9)?;
    Ok(IncomingMapSize { size_flag, map_size })
}

pub fn receive_pong_to_host(data: &[u8]) -> Result<u32, ProtocolError> {
    expect_type(data, W3GS_PONG_TO_HOST)?;
    u32_le(data, 4)
}

/// Decoded UDP `SEARCHGAME` probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchGame {
    pub product: [u8; 4],
    pub version: u32,
}

pub fn receive_search_game(data: &[u8]) -> Result<SearchGame, ProtocolError> {
    expect_type(data, W3GS_SEARCHGAME)?;
    if data.len() < 12 {
        return Err(ProtocolError::Truncated { off: 4, need: 8, have: data.len() - 4 });
    }
    Ok(SearchGame { product: [data[4], data[5], data[6], data[7]], version: u32_le(data, 8)? })
}

// ---------------------------------------------------------------------------
// send

pub fn send_ping_from_host(ticks: u32) -> Vec<u8> {
    let mut p = header(W3GS_PING_FROM_HOST);
    put_u32_le(&mut p, ticks);
    finish(p)
}

/// The slot info block shared by `SLOTINFOJOIN` and `SLOTINFO`.
fn encode_slot_info(
    out: &mut Vec<u8>,
    slots: &[GameSlot],
    random_seed: u32,
    layout_style: u8,
    player_slots: u8,
) {
    out.push(slots.len() as u8);
    for slot in slots {
        slot.encode(out);
    }
    put_u32_le(out, random_seed);
    out.push(layout_style);
    out.push(player_slots);
}

#[allow(clippy::too_many_arguments)]
pub fn send_slot_info_join(
    pid: u8,
    port: u16,
    external_ip: u32,
    slots: &[GameSlot],
    random_seed: u32,
    layout_style: u8,
    player_slots: u8,
) -> Vec<u8> {
    let mut p = header(W3GS_SLOTINFOJOIN);
    encode_slot_info(&mut p, slots, random_seed, layout_style, player_slots);
    p.push(pid);
    put_sockaddr(&mut p, port, external_ip);
    finish(p)
}

pub fn send_reject_join(reason: u32) -> Vec<u8> {
    let mut p = header(W3GS_REJECTJOIN);
    put_u32_le(&mut p, reason);
    finish(p)
}

pub fn send_player_info(
    join_counter: u32,
    pid: u8,
    name: &str,
    external_ip: u32,
    internal_ip: u32,
) -> Vec<u8> {
    let mut p = header(W3GS_PLAYERINFO);
    put_u32_le(&mut p, join_counter);
    p.push(pid);
    put_cstring(&mut p, name.as_bytes());
    p.push(0x01);
    put_sockaddr(&mut p, 0, external_ip);
    put_sockaddr(&mut p, 0, internal_ip);
    finish(p)
}

pub fn send_player_leave_others(pid: u8, reason: u32) -> Vec<u8> {
    let mut p = header(W3GS_PLAYERLEAVE_OTHERS);
    p.push(pid);
    put_u32_le(&mut p, reason);
    finish(p)
}

pub fn send_game_loaded_others(pid: u8) -> Vec<u8> {
    let mut p = header(W3GS_GAMELOADED_OTHERS);
    p.push(pid);
    finish(p)
}

pub fn send_slot_info(
    slots: &[GameSlot],
    random_seed: u32,
    layout_style: u8,
    player_slots: u8,
) -> Vec<u8> {
    let mut p = header(W3GS_SLOTINFO);
    encode_slot_info(&mut p, slots, random_seed, layout_style, player_slots);
    finish(p)
}

pub fn send_count_down_start() -> Vec<u8> {
    finish(header(W3GS_COUNTDOWN_START))
}

pub fn send_count_down_end() -> Vec<u8> {
    finish(header(W3GS_COUNTDOWN_END))
}

fn pack_subpacket(actions: &[IncomingAction]) -> Vec<u8> {
    let mut sub = Vec::new();
    for a in actions {
        sub.push(a.pid);
        put_u16_le(&mut sub, a.action.len() as u16);
        sub.extend_from_slice(&a.action);
    }
    sub
}

pub fn send_incoming_action(actions: &[IncomingAction], send_interval: u16) -> Vec<u8> {
    let sub = pack_subpacket(actions);
    let mut p = header(W3GS_INCOMING_ACTION);
    put_u16_le(&mut p, send_interval);
    put_u16_le(&mut p, crc32fast::hash(&sub) as u16);
    p.extend_from_slice(&sub);
    finish(p)
}

pub fn send_incoming_action2(actions: &[IncomingAction]) -> Vec<u8> {
    let mut p = header(W3GS_INCOMING_ACTION2);
    p.push(0x00);
    p.extend_from_slice(&pack_subpacket(actions));
    finish(p)
}

/// Packs a batch of actions into broadcast packets, splitting on the payload
/// limit. All packets but the last are `INCOMING_ACTION2`; the last is the
/// `INCOMING_ACTION` that carries `send_interval` and advances the client
/// game clock. A packet boundary never splits a single action.
pub fn pack_actions(actions: &[IncomingAction], send_interval: u16) -> Vec<Vec<u8>> {
    let mut groups: Vec<&[IncomingAction]> = Vec::new();
    let mut start = 0;
    let mut size = ACTION_PACKET_OVERHEAD;
    for (i, a) in actions.iter().enumerate() {
        if size + a.packed_len() > ACTION_PAYLOAD_LIMIT && i > start {
            groups.push(&actions[start..i]);
            start = i;
            size = ACTION_PACKET_OVERHEAD;
        }
        size += a.packed_len();
    }
    groups.push(&actions[start..]);

    let last = groups.len() - 1;
    groups
        .iter()
        .enumerate()
        .map(|(i, g)| {
            if i == last {
                send_incoming_action(g, send_interval)
            } else {
                send_incoming_action2(g)
            }
        })
        .collect()
}

pub fn send_chat_from_host(
    from_pid: u8,
    to_pids: &[u8],
    flag: u8,
    extra_flags: Option<u32>,
    message: &str,
) -> Vec<u8> {
    let mut p = header(W3GS_CHAT_FROM_HOST);
    p.push(from_pid);
    p.push(to_pids.len() as u8);
    p.extend_from_slice(to_pids);
    p.push(flag);
    if flag == CHAT_FROM_HOST_INGAME {
        put_u32_le(&mut p, extra_flags.unwrap_or(0));
    }
    put_cstring(&mut p, message.as_bytes());
    finish(p)
}

pub fn send_start_lag(laggers: &[(u8, u32)]) -> Vec<u8> {
    let mut p = header(W3GS_START_LAG);
    p.push(laggers.len() as u8);
    for &(pid, ticks_behind) in laggers {
        p.push(pid);
        put_u32_le(&mut p, ticks_behind);
    }
    finish(p)
}

pub fn send_stop_lag(pid: u8, time_behind: u32) -> Vec<u8> {
    let mut p = header(W3GS_STOP_LAG);
    p.push(pid);
    put_u32_le(&mut p, time_behind);
    finish(p)
}

#[allow(clippy::too_many_arguments)]
pub fn send_game_info(
    war3_version: u8,
    map_game_type: u32,
    map_flags: u32,
    map_width: u16,
    map_height: u16,
    game_name: &str,
    host_name: &str,
    up_time: u32,
    map_path: &str,
    map_crc: u32,
    map_sha1: &[u8; 20],
    slots_total: u32,
    slots_open: u32,
    port: u16,
    host_counter: u32,
    entry_key: u32,
) -> Vec<u8> {
    let stat = StatString {
        game_flags: map_flags,
        map_width,
        map_height,
        map_crc,
        map_path: map_path.to_string(),
        host_name: host_name.to_string(),
        map_sha1: *map_sha1,
    };
    let mut p = header(W3GS_GAMEINFO);
    p.extend_from_slice(&PRODUCT_TFT);
    put_u32_le(&mut p, war3_version as u32);
    put_u32_le(&mut p, host_counter);
    put_u32_le(&mut p, entry_key);
    put_cstring(&mut p, game_name.as_bytes());
    p.push(0x00); // no password
    put_cstring(&mut p, &stat.encode());
    put_u32_le(&mut p, slots_total);
    put_u32_le(&mut p, map_game_type);
    p.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
    put_u32_le(&mut p, slots_open);
    put_u32_le(&mut p, up_time);
    put_u16_le(&mut p, port);
    finish(p)
}

pub fn send_create_game(war3_version: u8, host_counter: u32) -> Vec<u8> {
    let mut p = header(W3GS_CREATEGAME);
    p.extend_from_slice(&PRODUCT_TFT);
    put_u32_le(&mut p, war3_version as u32);
    put_u32_le(&mut p, host_counter);
    finish(p)
}

pub fn send_refresh_game(host_counter: u32, players: u32, player_slots: u32) -> Vec<u8> {
    let mut p = header(W3GS_REFRESHGAME);
    put_u32_le(&mut p, host_counter);
    put_u32_le(&mut p, players);
    put_u32_le(&mut p, player_slots);
    finish(p)
}

pub fn send_decreate_game(host_counter: u32) -> Vec<u8> {
    let mut p = header(W3GS_DECREATEGAME);
    put_u32_le(&mut p, host_counter);
    finish(p)
}

pub fn send_map_check(
    map_path: &str,
    map_size: u32,
    map_info: u32,
    map_crc: u32,
    map_sha1: &[u8; 20],
) -> Vec<u8> {
    let mut p = header(W3GS_MAPCHECK);
    put_cstring(&mut p, map_path.as_bytes());
    put_u32_le(&mut p, map_size);
    put_u32_le(&mut p, map_info);
    put_u32_le(&mut p, map_crc);
    p.extend_from_slice(map_sha1);
    finish(p)
}

// ---------------------------------------------------------------------------
// stat string

/// The fields packed into the masked `GAMEINFO` stat string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatString {
    pub game_flags: u32,
    pub map_width: u16,
    pub map_height: u16,
    pub map_crc: u32,
    pub map_path: String,
    pub host_name: String,
    pub map_sha1: [u8; 20],
}

impl StatString {
    /// The unmasked byte layout.
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32_le(&mut out, self.game_flags);
        out.push(0);
        put_u16_le(&mut out, self.map_width);
        put_u16_le(&mut out, self.map_height);
        put_u32_le(&mut out, self.map_crc);
        put_cstring(&mut out, self.map_path.as_bytes());
        put_cstring(&mut out, self.host_name.as_bytes());
        out.extend_from_slice(&self.map_sha1);
        out
    }

    pub fn parse(plain: &[u8]) -> Result<Self, ProtocolError> {
        let game_flags = u32_le(plain, 0)?;
        match plain.get(4).copied() {
            Some(0) => {}
            Some(_) => return Err(ProtocolError::BadField("stat string separator")),
            None => return Err(ProtocolError::Truncated { off: 4, need: 1, have: 0 }),
        }
        let map_width = u16_le(plain, 5)?;
        let map_height = u16_le(plain, 7)?;
        let map_crc = u32_le(plain, 9)?;
        let (path, off) = extract_cstring(plain, 13)?;
        let (host, off) = extract_cstring(plain, off)?;
        let sha = plain.get(off..off + 20).ok_or(ProtocolError::Truncated {
            off,
            need: 20,
            have: plain.len().saturating_sub(off),
        })?;
        let mut map_sha1 = [0u8; 20];
        map_sha1.copy_from_slice(sha);
        Ok(StatString {
            game_flags,
            map_width,
            map_height,
            map_crc,
            map_path: String::from_utf8_lossy(path).into_owned(),
            host_name: String::from_utf8_lossy(host).into_owned(),
            map_sha1,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_stat_string(&self.build())
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Self::parse(&decode_stat_string(data))
    }
}

/// Masks a byte run so it contains no NUL bytes: each group of up to seven
/// bytes is prefixed with a mask byte, even bytes are bumped to odd, and the
/// mask records which bytes were odd to begin with.
pub fn encode_stat_string(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 7 + 1);
    for chunk in data.chunks(7) {
        let mut mask = 1u8;
        for (i, &b) in chunk.iter().enumerate() {
            if b % 2 != 0 {
                mask |= 1 << (i + 1);
            }
        }
        out.push(mask);
        for &b in chunk {
            out.push(if b % 2 == 0 { b + 1 } else { b });
        }
    }
    out
}

/// Reverses [`encode_stat_string`].
pub fn decode_stat_string(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut mask = 0u8;
    for (i, &b) in data.iter().enumerate() {
        if i % 8 == 0 {
            mask = b;
        } else if mask & (1 << (i % 8)) == 0 {
            out.push(b.wrapping_sub(1));
        } else {
            out.push(b);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// client-side builders, for exercising the receive path in tests

#[cfg(test)]
pub mod client {
    use super::*;

    pub fn req_join(host_counter: u32, entry_key: u32, name: &str, internal_ip: u32) -> Vec<u8> {
        let mut p = header(W3GS_REQJOIN);
        put_u32_le(&mut p, host_counter);
        put_u32_le(&mut p, entry_key);
        put_u32_le(&mut p, 0);
        put_u16_le(&mut p, 6112);
        put_u32_le(&mut p, 0);
        put_cstring(&mut p, name.as_bytes());
        put_cstring(&mut p, b"");
        put_sockaddr(&mut p, 6112, internal_ip);
        finish(p)
    }

    pub fn leave_game(reason: u32) -> Vec<u8> {
        let mut p = header(W3GS_LEAVEGAME);
        put_u32_le(&mut p, reason);
        finish(p)
    }

    pub fn game_loaded_self() -> Vec<u8> {
        finish(header(W3GS_GAMELOADED_SELF))
    }

    pub fn outgoing_action(crc: u32, action: &[u8]) -> Vec<u8> {
        let mut p = header(W3GS_OUTGOING_ACTION);
        put_u32_le(&mut p, crc);
        p.extend_from_slice(action);
        finish(p)
    }

    pub fn outgoing_keepalive(checksum: u32) -> Vec<u8> {
        let mut p = header(W3GS_OUTGOING_KEEPALIVE);
        p.push(0);
        put_u32_le(&mut p, checksum);
        finish(p)
    }

    pub fn chat_message(from_pid: u8, to_pids: &[u8], message: &str) -> Vec<u8> {
        let mut p = header(W3GS_CHAT_TO_HOST);
        p.push(from_pid);
        p.push(to_pids.len() as u8);
        p.extend_from_slice(to_pids);
        p.push(CHAT_MESSAGE);
        put_cstring(&mut p, message.as_bytes());
        finish(p)
    }

    pub fn chat_byte_change(from_pid: u8, flag: u8, value: u8) -> Vec<u8> {
        let mut p = header(W3GS_CHAT_TO_HOST);
        p.push(from_pid);
        p.push(0);
        p.push(flag);
        p.push(value);
        finish(p)
    }

    pub fn map_size(size_flag: u8, map_size: u32) -> Vec<u8> {
        let mut p = header(W3GS_MAPSIZE);
        put_u32_le(&mut p, 1);
        p.push(size_flag);
        put_u32_le(&mut p, map_size);
        finish(p)
    }

    pub fn pong_to_host(ticks: u32) -> Vec<u8> {
        let mut p = header(W3GS_PONG_TO_HOST);
        put_u32_le(&mut p, ticks);
        finish(p)
    }

    pub fn search_game() -> Vec<u8> {
        let mut p = header(W3GS_SEARCHGAME);
        p.extend_from_slice(&PRODUCT_TFT);
        put_u32_le(&mut p, 26);
        put_u32_le(&mut p, 0);
        finish(p)
    }
}

#[cfg(test)]
mod tests {
    use super::slot::*;
    use super::*;

    #[test]
    fn test_validate_frame() {
        let p = send_count_down_start();
        assert_eq!(validate_frame(&p).unwrap(), W3GS_COUNTDOWN_START);
        assert_eq!(p.len(), 4);
    }

    #[test]
    fn test_validate_frame_rejects_bad_header() {
        let mut p = send_count_down_start();
        p[0] = 0xAA;
        assert_eq!(validate_frame(&p), Err(ProtocolError::BadHeader(0xAA)));
    }

    #[test]
    fn test_validate_frame_rejects_length_mismatch() {
        let mut p = send_ping_from_host(99);
        p.pop();
        assert!(matches!(validate_frame(&p), Err(ProtocolError::LengthMismatch { .. })));
    }

    #[test]
    fn test_ping_roundtrip() {
        let p = send_ping_from_host(0x01020304);
        assert_eq!(validate_frame(&p).unwrap(), W3GS_PING_FROM_HOST);
        assert_eq!(u32_le(&p, 4).unwrap(), 0x01020304);
    }

    #[test]
    fn test_req_join_roundtrip() {
        let p = client::req_join(7, 0xDEAD, "alice", 0x0100_007F);
        let req = receive_req_join(&p).unwrap();
        assert_eq!(
            req,
            IncomingJoinRequest {
                host_counter: 7,
                entry_key: 0xDEAD,
                name: "alice".to_string(),
                internal_ip: 0x0100_007F,
            }
        );
    }

    #[test]
    fn test_req_join_rejects_long_name() {
        let p = client::req_join(1, 1, "sixteen_chars_xx", 0);
        assert_eq!(receive_req_join(&p), Err(ProtocolError::BadField("player name")));
    }

    #[test]
    fn test_req_join_rejects_missing_nul() {
        let mut p = client::req_join(1, 1, "bob", 0);
        // cut the packet inside the sockaddr block
        p.truncate(p.len() - 10);
        let len = p.len() as u16;
        p[2..4].copy_from_slice(&len.to_le_bytes());
        assert!(receive_req_join(&p).is_err());
    }

    #[test]
    fn test_leave_game_roundtrip() {
        let p = client::leave_game(PLAYERLEAVE_LOST);
        assert_eq!(receive_leave_game(&p).unwrap(), PLAYERLEAVE_LOST);
    }

    #[test]
    fn test_game_loaded_self() {
        assert!(receive_game_loaded_self(&client::game_loaded_self()).is_ok());
    }

    #[test]
    fn test_outgoing_action_roundtrip() {
        let p = client::outgoing_action(0xAABBCCDD, &[1, 2, 3]);
        let a = receive_outgoing_action(&p, 5).unwrap();
        assert_eq!(a.pid, 5);
        assert_eq!(a.crc, 0xAABBCCDD);
        assert_eq!(a.action, vec![1, 2, 3]);
        assert_eq!(a.packed_len(), 6);
    }

    #[test]
    fn test_keepalive_roundtrip() {
        let p = client::outgoing_keepalive(0x11223344);
        assert_eq!(receive_outgoing_keepalive(&p).unwrap(), 0x11223344);
    }

    #[test]
    fn test_chat_message_roundtrip() {
        let p = client::chat_message(2, &[3, 4], "hello");
        match receive_chat_to_host(&p).unwrap() {
            IncomingChat::Message { from_pid, to_pids, message } => {
                assert_eq!(from_pid, 2);
                assert_eq!(to_pids, vec![3, 4]);
                assert_eq!(message, "hello");
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_chat_byte_changes() {
        let cases = [
            (CHAT_TEAMCHANGE, IncomingChat::TeamChange { from_pid: 2, team: 1 }),
            (CHAT_COLOURCHANGE, IncomingChat::ColourChange { from_pid: 2, colour: 1 }),
            (CHAT_RACECHANGE, IncomingChat::RaceChange { from_pid: 2, race: 1 }),
            (CHAT_HANDICAPCHANGE, IncomingChat::HandicapChange { from_pid: 2, handicap: 1 }),
        ];
        for (flag, expect) in cases {
            let p = client::chat_byte_change(2, flag, 1);
            assert_eq!(receive_chat_to_host(&p).unwrap(), expect);
        }
    }

    #[test]
    fn test_chat_rejects_unknown_flag() {
        let p = client::chat_byte_change(2, 0x77, 1);
        assert_eq!(receive_chat_to_host(&p), Err(ProtocolError::BadField("chat flag")));
    }

    #[test]
    fn test_map_size_roundtrip() {
        let p = client::map_size(1, 1573722);
        let m = receive_map_size(&p).unwrap();
        assert_eq!(m.size_flag, 1);
        assert_eq!(m.map_size, 1573722);
    }

    #[test]
    fn test_pong_roundtrip() {
        let p = client::pong_to_host(4242);
        assert_eq!(receive_pong_to_host(&p).unwrap(), 4242);
    }

    #[test]
    fn test_search_game_roundtrip() {
        let p = client::search_game();
        let s = receive_search_game(&p).unwrap();
        assert_eq!(s.product, PRODUCT_TFT);
        assert_eq!(s.version, 26);
    }

    #[test]
    fn test_reject_join_fields() {
        let p = send_reject_join(REJECTJOIN_WRONGPASSWORD);
        assert_eq!(validate_frame(&p).unwrap(), W3GS_REJECTJOIN);
        assert_eq!(u32_le(&p, 4).unwrap(), 27);
    }

    #[test]
    fn test_player_info_fields() {
        let p = send_player_info(2, 3, "bob", 0x0100_007F, 0x0101_A8C0);
        assert_eq!(validate_frame(&p).unwrap(), W3GS_PLAYERINFO);
        assert_eq!(u32_le(&p, 4).unwrap(), 2);
        assert_eq!(p[8], 3);
        let (name, off) = extract_cstring(&p, 9).unwrap();
        assert_eq!(name, b"bob");
        assert_eq!(p[off], 0x01);
        // external sockaddr: family, port, then the address
        assert_eq!(u32_le(&p, off + 1 + 4).unwrap(), 0x0100_007F);
        assert_eq!(u32_le(&p, off + 1 + 16 + 4).unwrap(), 0x0101_A8C0);
    }

    #[test]
    fn test_player_leave_fields() {
        let p = send_player_leave_others(9, PLAYERLEAVE_LOBBY);
        assert_eq!(validate_frame(&p).unwrap(), W3GS_PLAYERLEAVE_OTHERS);
        assert_eq!(p[4], 9);
        assert_eq!(u32_le(&p, 5).unwrap(), PLAYERLEAVE_LOBBY);
    }

    fn sample_slots() -> Vec<GameSlot> {
        vec![
            GameSlot::new(2, 255, SLOT_STATUS_OCCUPIED, 0, 0, 0, SLOT_RACE_RANDOM | SLOT_RACE_SELECTABLE),
            GameSlot::new(0, 255, SLOT_STATUS_OPEN, 0, 1, 1, SLOT_RACE_RANDOM | SLOT_RACE_SELECTABLE),
        ]
    }

    #[test]
    fn test_slot_info_roundtrip() {
        let slots = sample_slots();
        let p = send_slot_info(&slots, 0xCAFEBABE, 0, 2);
        assert_eq!(validate_frame(&p).unwrap(), W3GS_SLOTINFO);
        assert_eq!(p[4], 2);
        let (s0, off) = GameSlot::decode(&p, 5).unwrap();
        let (s1, off) = GameSlot::decode(&p, off).unwrap();
        assert_eq!(s0, slots[0]);
        assert_eq!(s1, slots[1]);
        assert_eq!(u32_le(&p, off).unwrap(), 0xCAFEBABE);
        assert_eq!(p[off + 4], 0); // layout style
        assert_eq!(p[off + 5], 2); // player slots
    }

    #[test]
    fn test_slot_info_join_trailer() {
        let slots = sample_slots();
        let p = send_slot_info_join(2, 6112, 0x0100_007F, &slots, 1, 0, 2);
        assert_eq!(validate_frame(&p).unwrap(), W3GS_SLOTINFOJOIN);
        // block: count + 2 slots + seed + layout + playerslots
        let block_end = 4 + 1 + 18 + 4 + 1 + 1;
        assert_eq!(p[block_end], 2); // join pid
        assert_eq!(u16_le(&p, block_end + 1).unwrap(), 2); // AF_INET
        assert_eq!(u32_le(&p, block_end + 5).unwrap(), 0x0100_007F);
        assert_eq!(p.len(), block_end + 1 + 16);
    }

    #[test]
    fn test_incoming_action_payload_size() {
        // payload after the two id bytes is 6 + sum(len + 3)
        let actions = vec![
            IncomingAction { pid: 1, crc: 0, action: vec![0xAB; 8] },
            IncomingAction { pid: 2, crc: 0, action: vec![0xCD; 5] },
        ];
        let p = send_incoming_action(&actions, 100);
        assert_eq!(p.len() - 2, 6 + (8 + 3) + (5 + 3));
        assert_eq!(u16_le(&p, 4).unwrap(), 100);
        // first packed action starts after interval + crc
        assert_eq!(p[8], 1);
        assert_eq!(u16_le(&p, 9).unwrap(), 8);
    }

    #[test]
    fn test_incoming_action_empty_batch() {
        let p = send_incoming_action(&[], 100);
        assert_eq!(p.len(), 8);
        assert_eq!(validate_frame(&p).unwrap(), W3GS_INCOMING_ACTION);
    }

    #[test]
    fn test_pack_actions_no_split_needed() {
        let actions = vec![IncomingAction { pid: 1, crc: 0, action: vec![1, 2, 3] }];
        let packets = pack_actions(&actions, 100);
        assert_eq!(packets.len(), 1);
        assert_eq!(validate_frame(&packets[0]).unwrap(), W3GS_INCOMING_ACTION);
    }

    #[test]
    fn test_pack_actions_split() {
        // seed scenario: 200 actions of 8 bytes each -> one INCOMING_ACTION2
        // with the first 131 (6 + 11*131 = 1447 <= 1452) and a final
        // INCOMING_ACTION with the remaining 69
        let actions: Vec<IncomingAction> =
            (0..200).map(|i| IncomingAction { pid: (i % 10) as u8 + 1, crc: 0, action: vec![i as u8; 8] }).collect();
        let packets = pack_actions(&actions, 100);
        assert_eq!(packets.len(), 2);
        assert_eq!(validate_frame(&packets[0]).unwrap(), W3GS_INCOMING_ACTION2);
        assert_eq!(validate_frame(&packets[1]).unwrap(), W3GS_INCOMING_ACTION);
        // 0x48: header + 0x00 + 131 whole actions
        assert_eq!(packets[0].len(), 4 + 1 + 131 * 11);
        // 0x0C: header + interval + crc + 69 whole actions
        assert_eq!(packets[1].len(), 4 + 2 + 2 + 69 * 11);
        assert_eq!(u16_le(&packets[1], 4).unwrap(), 100);
    }

    #[test]
    fn test_pack_actions_never_splits_one_action() {
        // every packet must contain whole actions only: walk the packed
        // bytes of each packet and check the length prefixes line up
        let actions: Vec<IncomingAction> =
            (0..50).map(|i| IncomingAction { pid: 1, crc: 0, action: vec![0; 40 + i % 7] }).collect();
        for p in pack_actions(&actions, 100) {
            let start = match validate_frame(&p).unwrap() {
                W3GS_INCOMING_ACTION => 8,
                W3GS_INCOMING_ACTION2 => 5,
                t => panic!("unexpected type {:#04X}", t),
            };
            let mut off = start;
            while off < p.len() {
                let len = u16_le(&p, off + 1).unwrap() as usize;
                off += 3 + len;
            }
            assert_eq!(off, p.len());
        }
    }

    #[test]
    fn test_chat_from_host_lobby() {
        let p = send_chat_from_host(1, &[2, 3], CHAT_MESSAGE, None, "hi");
        assert_eq!(validate_frame(&p).unwrap(), W3GS_CHAT_FROM_HOST);
        assert_eq!(p[4], 1);
        assert_eq!(p[5], 2);
        assert_eq!(&p[6..8], &[2, 3]);
        assert_eq!(p[8], CHAT_MESSAGE);
        let (msg, _) = extract_cstring(&p, 9).unwrap();
        assert_eq!(msg, b"hi");
    }

    #[test]
    fn test_chat_from_host_ingame_carries_extra_flags() {
        let p = send_chat_from_host(1, &[2], CHAT_FROM_HOST_INGAME, Some(0), "go");
        assert_eq!(p[7], CHAT_FROM_HOST_INGAME);
        assert_eq!(u32_le(&p, 8).unwrap(), 0);
        let (msg, _) = extract_cstring(&p, 12).unwrap();
        assert_eq!(msg, b"go");
    }

    #[test]
    fn test_start_stop_lag_fields() {
        let p = send_start_lag(&[(3, 40), (4, 12)]);
        assert_eq!(validate_frame(&p).unwrap(), W3GS_START_LAG);
        assert_eq!(p[4], 2);
        assert_eq!(p[5], 3);
        assert_eq!(u32_le(&p, 6).unwrap(), 40);
        assert_eq!(p[10], 4);
        assert_eq!(u32_le(&p, 11).unwrap(), 12);

        let p = send_stop_lag(3, 5000);
        assert_eq!(validate_frame(&p).unwrap(), W3GS_STOP_LAG);
        assert_eq!(p[4], 3);
        assert_eq!(u32_le(&p, 5).unwrap(), 5000);
    }

    #[test]
    fn test_map_check_fields() {
        let sha1 = [7u8; 20];
        let p = send_map_check("Maps\\test.w3x", 1000, 2000, 3000, &sha1);
        assert_eq!(validate_frame(&p).unwrap(), W3GS_MAPCHECK);
        let (path, off) = extract_cstring(&p, 4).unwrap();
        assert_eq!(path, b"Maps\\test.w3x");
        assert_eq!(u32_le(&p, off).unwrap(), 1000);
        assert_eq!(u32_le(&p, off + 4).unwrap(), 2000);
        assert_eq!(u32_le(&p, off + 8).unwrap(), 3000);
        assert_eq!(&p[off + 12..off + 32], &sha1);
    }

    #[test]
    fn test_stat_string_mask_roundtrip() {
        // bytes with zeros and both parities survive the mask coding
        let data: Vec<u8> = (0u8..=255).collect();
        let encoded = encode_stat_string(&data);
        assert!(!encoded.contains(&0), "encoded stat string must be NUL-free");
        assert_eq!(decode_stat_string(&encoded), data);
    }

    #[test]
    fn test_stat_string_fields_roundtrip() {
        let stat = StatString {
            game_flags: 0x0000_4803,
            map_width: 116,
            map_height: 116,
            map_crc: 0x3BCC_FA6C,
            map_path: "Maps\\(2)EchoIsles.w3x".to_string(),
            host_name: "|cFF4080C0Host".to_string(),
            map_sha1: [9u8; 20],
        };
        let decoded = StatString::decode(&stat.encode()).unwrap();
        assert_eq!(decoded, stat);
    }

    #[test]
    fn test_game_info_fields() {
        let sha1 = [3u8; 20];
        let p = send_game_info(
            26, GAMETYPE_BLIZZARD, 0x4803, 116, 116, "Local Game", "Host", 60,
            "Maps\\x.w3x", 0xAABB, &sha1, 12, 10, 6112, 1, 0xDEAD,
        );
        assert_eq!(validate_frame(&p).unwrap(), W3GS_GAMEINFO);
        assert_eq!(&p[4..8], &PRODUCT_TFT);
        assert_eq!(u32_le(&p, 8).unwrap(), 26);
        assert_eq!(u32_le(&p, 12).unwrap(), 1);
        assert_eq!(u32_le(&p, 16).unwrap(), 0xDEAD);
        let (name, off) = extract_cstring(&p, 20).unwrap();
        assert_eq!(name, b"Local Game");
        assert_eq!(p[off], 0x00);
        let (stat_encoded, off) = extract_cstring(&p, off + 1).unwrap();
        let stat = StatString::decode(stat_encoded).unwrap();
        assert_eq!(stat.game_flags, 0x4803);
        assert_eq!(stat.map_path, "Maps\\x.w3x");
        assert_eq!(stat.host_name, "Host");
        assert_eq!(stat.map_sha1, sha1);
        assert_eq!(u32_le(&p, off).unwrap(), 12); // slots total
        assert_eq!(u32_le(&p, off + 4).unwrap(), GAMETYPE_BLIZZARD);
        assert_eq!(u32_le(&p, off + 8).unwrap(), 1);
        assert_eq!(u32_le(&p, off + 12).unwrap(), 10); // slots open
        assert_eq!(u32_le(&p, off + 16).unwrap(), 60); // uptime
        assert_eq!(u16_le(&p, off + 20).unwrap(), 6112);
        assert_eq!(p.len(), off + 22);
    }

    #[test]
    fn test_udp_announce_packets() {
        let p = send_create_game(26, 7);
        assert_eq!(validate_frame(&p).unwrap(), W3GS_CREATEGAME);
        assert_eq!(&p[4..8], &PRODUCT_TFT);
        assert_eq!(u32_le(&p, 8).unwrap(), 26);
        assert_eq!(u32_le(&p, 12).unwrap(), 7);

        let p = send_refresh_game(7, 3, 12);
        assert_eq!(validate_frame(&p).unwrap(), W3GS_REFRESHGAME);
        assert_eq!(u32_le(&p, 4).unwrap(), 7);
        assert_eq!(u32_le(&p, 8).unwrap(), 3);
        assert_eq!(u32_le(&p, 12).unwrap(), 12);

        let p = send_decreate_game(7);
        assert_eq!(validate_frame(&p).unwrap(), W3GS_DECREATEGAME);
        assert_eq!(u32_le(&p, 4).unwrap(), 7);
    }

    #[test]
    fn test_countdown_packets_are_empty() {
        assert_eq!(send_count_down_start(), vec![0xF7, W3GS_COUNTDOWN_START, 4, 0]);
        assert_eq!(send_count_down_end(), vec![0xF7, W3GS_COUNTDOWN_END, 4, 0]);
    }

    #[test]
    fn test_game_loaded_others() {
        let p = send_game_loaded_others(4);
        assert_eq!(validate_frame(&p).unwrap(), W3GS_GAMELOADED_OTHERS);
        assert_eq!(p[4], 4);
    }
}
