//! Lobby population: potential players and joined players.
//!
//! A freshly accepted socket is a [`PotentialPlayer`] until its `REQJOIN`
//! arrives; the session then promotes it to a [`GamePlayer`], moving the
//! connection handle across. Neither type removes itself — deletion is
//! always a `delete_me` flag swept by the session after event dispatch.

use std::collections::VecDeque;

use crate::net::{ConnId, Connection};
use crate::protocol::PLAYERLEAVE_DISCONNECT;

/// Round-trip samples kept per player; the mean of the ring is the displayed
/// ping.
const RTT_RING_SIZE: usize = 10;

/// A connection that has not yet asked to join.
#[derive(Debug)]
pub struct PotentialPlayer {
    /// Taken on promotion to a game player; the husk is swept afterwards.
    pub conn: Option<Connection>,
    pub delete_me: bool,
    /// Set when the peer's name is on the hold list before it joins.
    pub reserved: bool,
    /// Session tick at accept, for the pre-join silence timeout.
    pub connected_ticks: u32,
}

impl PotentialPlayer {
    pub fn new(conn: Connection, connected_ticks: u32) -> Self {
        Self { conn: Some(conn), delete_me: false, reserved: false, connected_ticks }
    }

    pub fn conn_id(&self) -> Option<ConnId> {
        self.conn.as_ref().map(|c| c.id)
    }

    pub fn send(&self, data: Vec<u8>) {
        if let Some(conn) = &self.conn {
            conn.send(data);
        }
    }
}

/// A joined player.
#[derive(Debug)]
pub struct GamePlayer {
    pub conn: Connection,
    pub pid: u8,
    pub name: String,
    /// Address the client reported inside `REQJOIN`.
    pub internal_ip: u32,
    /// Address observed on accept.
    pub external_ip: u32,
    pub reserved: bool,

    pub delete_me: bool,
    /// Reason broadcast in `PLAYERLEAVE_OTHERS` once this player is swept.
    pub left_code: u32,

    /// Session tick of the last frame received, for the in-game silence
    /// timeout.
    pub last_frame_ticks: u32,
    /// Pings sent since the last pong; three in a row mean the lobby client
    /// is gone.
    pub missed_pings: u32,
    rtt_ring: VecDeque<u32>,

    /// Keepalive checksums not yet cross-checked against the other players.
    pub keep_alives: VecDeque<u32>,
    /// Count of action broadcasts this player has confirmed. Starts at the
    /// session's value at join time so a late joiner is not instantly
    /// "behind".
    pub sync_counter: u32,

    pub lagging: bool,
    pub started_lagging_ticks: u32,

    /// `MAPCHECK` went out to this player.
    pub map_check_sent: bool,
    /// The client's `MAPSIZE` report matched the hosted map.
    pub map_ok: bool,

    pub finished_loading: bool,
    pub finished_loading_ticks: u32,
}

impl GamePlayer {
    pub fn new(
        conn: Connection,
        pid: u8,
        name: String,
        internal_ip: u32,
        external_ip: u32,
        reserved: bool,
        session_sync_counter: u32,
        now_ticks: u32,
    ) -> Self {
        Self {
            conn,
            pid,
            name,
            internal_ip,
            external_ip,
            reserved,
            delete_me: false,
            left_code: PLAYERLEAVE_DISCONNECT,
            last_frame_ticks: now_ticks,
            missed_pings: 0,
            rtt_ring: VecDeque::with_capacity(RTT_RING_SIZE),
            keep_alives: VecDeque::new(),
            sync_counter: session_sync_counter,
            lagging: false,
            started_lagging_ticks: 0,
            map_check_sent: false,
            map_ok: false,
            finished_loading: false,
            finished_loading_ticks: 0,
        }
    }

    pub fn send(&self, data: Vec<u8>) {
        self.conn.send(data);
    }

    /// Flags this player for removal at the next sweep.
    pub fn mark_deleted(&mut self, left_code: u32) {
        if !self.delete_me {
            self.delete_me = true;
            self.left_code = left_code;
        }
    }

    pub fn add_rtt_sample(&mut self, sample: u32) {
        if self.rtt_ring.len() == RTT_RING_SIZE {
            self.rtt_ring.pop_front();
        }
        self.rtt_ring.push_back(sample);
    }

    /// Mean round-trip over the sample ring, if any pong arrived yet.
    pub fn rtt(&self) -> Option<u32> {
        if self.rtt_ring.is_empty() {
            return None;
        }
        let sum: u64 = self.rtt_ring.iter().map(|&s| s as u64).sum();
        Some((sum / self.rtt_ring.len() as u64) as u32)
    }
}
