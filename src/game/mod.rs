//! The game session: lobby, countdown, loading and the in-game action relay.
//!
//! One `Game` owns all slots, potential players and joined players, and is
//! driven from a single task: network events arrive through channels, timers
//! fire from a 50 ms tick. Event handlers never remove players — they set a
//! `delete_me` flag, and `update_post` sweeps flagged entries once per tick.

pub mod player;
pub mod timer;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::GameConfig;
use crate::map::Map;
use crate::net::{Announcer, ConnId, Connection, NetEvent, UdpOut};
use crate::protocol::slot::{
    GameSlot, SLOT_RACE_HUMAN, SLOT_RACE_NIGHTELF, SLOT_RACE_ORC, SLOT_RACE_RANDOM,
    SLOT_RACE_SELECTABLE, SLOT_RACE_UNDEAD, SLOT_STATUS_CLOSED, SLOT_STATUS_OCCUPIED,
    SLOT_STATUS_OPEN,
};
use crate::protocol::{self, IncomingAction, IncomingChat, IncomingJoinRequest, IncomingMapSize};
use crate::util::ipv4_to_u32;
use player::{GamePlayer, PotentialPlayer};
use timer::Timer;

/// Maximum wake interval of the top-level loop; guarantees timers fire.
const LOOP_INTERVAL_MS: u64 = 50;

const PING_INTERVAL: u32 = 5_000;
const ANNOUNCE_INTERVAL: u32 = 5_000;
const COUNTDOWN_STEP_INTERVAL: u32 = 1_000;
const LAG_SCREEN_REFRESH_INTERVAL: u32 = 10_000;
const MAP_CHECK_RETRY_INTERVAL: u32 = 10_000;

/// Seconds counted down before the game starts.
const COUNTDOWN_START_VALUE: u32 = 5;
/// Action broadcasts a player may fall behind before the lag screen opens.
const DEFAULT_SYNC_LIMIT: u32 = 32;
/// Unanswered pings before a lobby client is presumed gone.
const MAX_MISSED_PINGS: u32 = 3;
/// Connections that never send `REQJOIN` are dropped after this long.
const POTENTIAL_TIMEOUT: u32 = 10_000;
/// In-game players silent for this long are dropped.
const PLAYING_SILENCE_TIMEOUT: u32 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameState {
    Waiting,
    CountDown,
    Loading,
    Loaded,
}

pub struct Game {
    map: Map,
    config: GameConfig,
    state: GameState,

    slots: Vec<GameSlot>,
    potentials: Vec<PotentialPlayer>,
    players: Vec<GamePlayer>,
    /// Actions received since the last broadcast tick.
    actions: VecDeque<IncomingAction>,
    /// Names added with `!hold`; matching joiners may take a closed slot.
    reserved_names: Vec<String>,

    random_seed: u32,
    host_counter: u32,
    entry_key: u32,
    sync_limit: u32,
    /// Count of action broadcasts emitted; +1 per broadcast, never reset.
    sync_counter: u32,
    count_down_counter: u32,
    join_counter: u32,

    lagging: bool,
    desynced: bool,
    started_lagging_ticks: u32,
    last_lag_screen_ticks: u32,

    action_timer: Timer,
    ping_timer: Timer,
    download_timer: Timer,
    count_down_timer: Timer,
    lag_screen_reset_timer: Timer,
    announce_timer: Timer,

    host_port: u16,
    virtual_host_pid: Option<u8>,
    exiting: bool,
    slot_info_changed: bool,
    announced: bool,

    udp_pending: Vec<UdpOut>,
    start: Instant,
}

impl Game {
    pub fn new(map: Map, config: GameConfig, host_counter: u32) -> Self {
        let slots = map.slots.clone();
        let host_port = config.host_port;
        let mut game = Self {
            map,
            config,
            state: GameState::Waiting,
            slots,
            potentials: Vec::new(),
            players: Vec::new(),
            actions: VecDeque::new(),
            reserved_names: Vec::new(),
            random_seed: rand::random(),
            host_counter,
            entry_key: rand::random(),
            sync_limit: DEFAULT_SYNC_LIMIT,
            sync_counter: 0,
            count_down_counter: 0,
            join_counter: 2,
            lagging: false,
            desynced: false,
            started_lagging_ticks: 0,
            last_lag_screen_ticks: 0,
            action_timer: Timer::new(),
            ping_timer: Timer::new(),
            download_timer: Timer::new(),
            count_down_timer: Timer::new(),
            lag_screen_reset_timer: Timer::new(),
            announce_timer: Timer::new(),
            host_port,
            virtual_host_pid: None,
            exiting: false,
            slot_info_changed: false,
            announced: false,
            udp_pending: Vec::new(),
            start: Instant::now(),
        };
        game.create_virtual_host();
        tracing::info!(
            "[game] [created] name={} host_counter={} slots={} players={}",
            game.config.game_name,
            host_counter,
            game.slots.len(),
            game.map.num_players
        );
        game
    }

    /// Milliseconds since the session was created.
    pub fn ticks(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    pub fn state(&self) -> GameState {
        self.state
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting
    }

    pub fn num_players(&self) -> usize {
        self.players.len()
    }

    /// Adds a name to the hold list (`!hold`); a joiner with a held name may
    /// take a closed slot when no open slot remains.
    pub fn reserve_name(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        if !self.reserved_names.contains(&name) {
            tracing::info!("[game] [hold] name={}", name);
            self.reserved_names.push(name);
        }
    }

    // -----------------------------------------------------------------------
    // slots & pids

    fn get_sid_from_pid(&self, pid: u8) -> Option<usize> {
        self.slots.iter().position(|s| s.pid == pid && s.is_occupied())
    }

    /// First free PID in 1..=15, skipping joined players, the virtual host
    /// and any occupied slot.
    fn get_new_pid(&self) -> Option<u8> {
        (1..=15).find(|&pid| {
            self.virtual_host_pid != Some(pid)
                && !self.players.iter().any(|p| p.pid == pid)
                && !self.slots.iter().any(|s| s.is_occupied() && s.pid == pid)
        })
    }

    /// First colour not used by an occupied playing slot.
    fn get_new_colour(&self) -> Option<u8> {
        (0..=11).find(|&c| {
            !self.slots.iter().any(|s| s.is_occupied() && !s.is_observer() && s.colour == c)
        })
    }

    fn get_empty_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_open())
    }

    fn get_empty_slot_for_team(&self, team: u8) -> Option<usize> {
        self.slots.iter().position(|s| s.is_open() && s.team == team)
    }

    /// Restores a slot to its map template (or the observer template for
    /// slots past the map's own layout).
    fn open_slot(&mut self, sid: usize) {
        self.slots[sid] = if sid < self.map.slots.len() {
            self.map.slots[sid]
        } else {
            GameSlot::open_observer()
        };
    }

    fn slots_open(&self) -> u32 {
        self.slots.iter().filter(|s| s.is_open()).count() as u32
    }

    // -----------------------------------------------------------------------
    // virtual host

    /// Installs the synthetic host entry so clients always see a non-empty
    /// lobby. It holds a PID but no slot.
    fn create_virtual_host(&mut self) {
        if self.virtual_host_pid.is_some() {
            return;
        }
        let Some(pid) = self.get_new_pid() else {
            return;
        };
        self.virtual_host_pid = Some(pid);
        let info = protocol::send_player_info(1, pid, &self.config.virtual_host_name, 0, 0);
        self.send_all(info);
        tracing::debug!("[game] [virtual_host] pid={}", pid);
    }

    fn delete_virtual_host(&mut self) {
        if let Some(pid) = self.virtual_host_pid.take() {
            self.send_all(protocol::send_player_leave_others(pid, protocol::PLAYERLEAVE_LOBBY));
            tracing::debug!("[game] [virtual_host_removed] pid={}", pid);
        }
    }

    fn get_host_pid(&self) -> u8 {
        self.virtual_host_pid
            .or_else(|| self.players.first().map(|p| p.pid))
            .unwrap_or(1)
    }

    // -----------------------------------------------------------------------
    // broadcast helpers

    fn send_all(&self, data: Vec<u8>) {
        for p in &self.players {
            p.send(data.clone());
        }
    }

    fn send_all_chat(&self, message: &str) {
        if self.players.is_empty() {
            return;
        }
        let to: Vec<u8> = self.players.iter().map(|p| p.pid).collect();
        let from = self.get_host_pid();
        tracing::info!("[game] [host_chat] msg={}", message);
        let packet = match self.state {
            GameState::Waiting | GameState::CountDown => {
                protocol::send_chat_from_host(from, &to, protocol::CHAT_MESSAGE, None, message)
            }
            _ => protocol::send_chat_from_host(
                from,
                &to,
                protocol::CHAT_FROM_HOST_INGAME,
                Some(0),
                message,
            ),
        };
        self.send_all(packet);
    }

    fn send_all_slot_info(&self) {
        let packet = protocol::send_slot_info(
            &self.slots,
            self.random_seed,
            self.map.layout_style(),
            self.map.num_players as u8,
        );
        self.send_all(packet);
    }

    fn map_check_packet(&self) -> Vec<u8> {
        protocol::send_map_check(
            &self.map.path,
            self.map.size,
            self.map.info,
            self.map.crc,
            &self.map.sha1,
        )
    }

    fn game_info_packet(&self) -> Vec<u8> {
        protocol::send_game_info(
            self.config.war3_version,
            self.map.game_type(),
            self.map.game_flags(),
            self.map.width,
            self.map.height,
            &self.config.game_name,
            &self.config.virtual_host_name,
            self.ticks() / 1000,
            &self.map.path,
            self.map.crc,
            &self.map.sha1,
            self.slots.len() as u32,
            self.slots_open(),
            self.host_port,
            self.host_counter,
            self.entry_key,
        )
    }

    /// Queues a LAN occupancy refresh; sent with the next update's datagrams.
    fn queue_refresh(&mut self) {
        if self.state == GameState::Waiting {
            self.udp_pending.push(UdpOut::Broadcast(protocol::send_refresh_game(
                self.host_counter,
                self.players.len() as u32,
                self.slots.len() as u32,
            )));
        }
    }

    // -----------------------------------------------------------------------
    // event routing

    /// A freshly accepted TCP connection becomes a potential player.
    pub fn handle_connection(&mut self, conn: Connection) {
        tracing::info!("[game] [connected] conn={} peer={}", conn.id, conn.peer);
        let t = self.ticks();
        self.potentials.push(PotentialPlayer::new(conn, t));
    }

    /// One complete framed packet from a TCP peer.
    pub fn handle_frame(&mut self, conn: ConnId, data: Vec<u8>) {
        if let Some(i) = self.players.iter().position(|p| p.conn.id == conn) {
            self.handle_player_frame(i, &data);
        } else if let Some(i) = self.potentials.iter().position(|p| p.conn_id() == Some(conn)) {
            self.handle_potential_frame(i, &data);
        } else {
            tracing::debug!("[game] [orphan_frame] conn={}", conn);
        }
    }

    /// The peer's socket closed or errored.
    pub fn handle_closed(&mut self, conn: ConnId) {
        if let Some(p) = self.players.iter_mut().find(|p| p.conn.id == conn) {
            tracing::info!("[game] [disconnect] name={} pid={}", p.name, p.pid);
            p.mark_deleted(protocol::PLAYERLEAVE_DISCONNECT);
        } else if let Some(p) = self.potentials.iter_mut().find(|p| p.conn_id() == Some(conn)) {
            p.delete_me = true;
        }
    }

    /// A datagram on the discovery port. Answers `SEARCHGAME` probes with a
    /// unicast `GAMEINFO` while the lobby is open.
    pub fn handle_udp(&mut self, from: SocketAddr, data: &[u8]) -> Vec<UdpOut> {
        if self.state != GameState::Waiting {
            return Vec::new();
        }
        match protocol::receive_search_game(data) {
            Ok(probe) if probe.product == protocol::PRODUCT_TFT => {
                tracing::debug!("[udp] [search_game] from={}", from);
                vec![UdpOut::To(from, self.game_info_packet())]
            }
            Ok(probe) => {
                tracing::debug!("[udp] [wrong_product] from={} product={:?}", from, probe.product);
                Vec::new()
            }
            Err(err) => {
                tracing::debug!("[udp] [ignored] from={} err={}", from, err);
                Vec::new()
            }
        }
    }

    fn handle_potential_frame(&mut self, i: usize, data: &[u8]) {
        match protocol::validate_frame(data) {
            Ok(protocol::W3GS_REQJOIN) => match protocol::receive_req_join(data) {
                Ok(req) => self.event_player_joined(i, req),
                Err(err) => {
                    tracing::warn!("[game] [bad_reqjoin] err={}", err);
                    self.potentials[i].delete_me = true;
                }
            },
            Ok(other) => {
                // the only frame accepted before joining is REQJOIN
                tracing::warn!("[game] [potential_bad_packet] type={:#04X}", other);
                self.potentials[i].delete_me = true;
            }
            Err(err) => {
                tracing::warn!("[game] [potential_bad_frame] err={}", err);
                self.potentials[i].delete_me = true;
            }
        }
    }

    fn handle_player_frame(&mut self, i: usize, data: &[u8]) {
        let t = self.ticks();
        self.players[i].last_frame_ticks = t;
        let pid = self.players[i].pid;

        let packet_type = match protocol::validate_frame(data) {
            Ok(t) => t,
            Err(err) => {
                self.drop_for_protocol_error(i, err);
                return;
            }
        };

        let result = match packet_type {
            protocol::W3GS_LEAVEGAME => protocol::receive_leave_game(data).map(|reason| {
                self.event_player_left(i, reason);
            }),
            protocol::W3GS_GAMELOADED_SELF => protocol::receive_game_loaded_self(data).map(|_| {
                self.event_player_loaded(i);
            }),
            protocol::W3GS_OUTGOING_ACTION => {
                protocol::receive_outgoing_action(data, pid).map(|action| {
                    self.event_player_action(i, action);
                })
            }
            protocol::W3GS_OUTGOING_KEEPALIVE => {
                protocol::receive_outgoing_keepalive(data).map(|checksum| {
                    self.event_player_keep_alive(i, checksum);
                })
            }
            protocol::W3GS_CHAT_TO_HOST => protocol::receive_chat_to_host(data).map(|chat| {
                self.event_player_chat(i, chat);
            }),
            protocol::W3GS_MAPSIZE => protocol::receive_map_size(data).map(|report| {
                self.event_player_map_size(i, report);
            }),
            protocol::W3GS_PONG_TO_HOST => protocol::receive_pong_to_host(data).map(|echo| {
                self.event_player_pong(i, echo, t);
            }),
            other => Err(crate::util::ProtocolError::UnknownType(other)),
        };

        if let Err(err) = result {
            self.drop_for_protocol_error(i, err);
        }
    }

    fn drop_for_protocol_error(&mut self, i: usize, err: crate::util::ProtocolError) {
        let p = &mut self.players[i];
        tracing::warn!("[game] [protocol_error] name={} pid={} err={}", p.name, p.pid, err);
        p.mark_deleted(protocol::PLAYERLEAVE_DISCONNECT);
    }

    // -----------------------------------------------------------------------
    // join

    fn reject_potential(&mut self, i: usize, reason: u32) {
        tracing::info!("[game] [join_rejected] reason={}", reason);
        let p = &mut self.potentials[i];
        p.send(protocol::send_reject_join(reason));
        p.delete_me = true;
    }

    fn event_player_joined(&mut self, i: usize, req: IncomingJoinRequest) {
        if self.reserved_names.iter().any(|n| n.eq_ignore_ascii_case(&req.name)) {
            self.potentials[i].reserved = true;
        }
        let reserved = self.potentials[i].reserved;

        if req.host_counter != self.host_counter || req.entry_key != self.entry_key {
            tracing::info!(
                "[game] [join_bad_key] name={} host_counter={} entry_key={:#X}",
                req.name,
                req.host_counter,
                req.entry_key
            );
            self.reject_potential(i, protocol::REJECTJOIN_WRONGPASSWORD);
            return;
        }
        if self.state != GameState::Waiting {
            self.reject_potential(i, protocol::REJECTJOIN_STARTED);
            return;
        }
        let name_taken = self.players.iter().any(|p| p.name.eq_ignore_ascii_case(&req.name))
            || req.name.eq_ignore_ascii_case(&self.config.virtual_host_name);
        if name_taken {
            tracing::info!("[game] [join_name_taken] name={}", req.name);
            self.reject_potential(i, protocol::REJECTJOIN_FULL);
            return;
        }
        let sid = self.get_empty_slot().or_else(|| {
            // the hold list lets a reserved player enter through a closed slot
            if reserved {
                self.slots.iter().position(|s| s.status == SLOT_STATUS_CLOSED)
            } else {
                None
            }
        });
        let (Some(sid), Some(pid)) = (sid, self.get_new_pid()) else {
            self.reject_potential(i, protocol::REJECTJOIN_FULL);
            return;
        };

        let t = self.ticks();
        let conn = self.potentials[i]
            .conn
            .take()
            .expect("potential player delivered a frame without a connection");
        self.potentials[i].delete_me = true;

        let external_ip = match conn.peer.ip() {
            std::net::IpAddr::V4(v4) => ipv4_to_u32(v4),
            _ => 0,
        };
        let peer_port = conn.peer.port();

        // occupy the slot
        let melee = self.map.layout_style() == 0;
        let new_colour = self.get_new_colour();
        let slot = &mut self.slots[sid];
        slot.pid = pid;
        slot.download_status = 255;
        slot.status = SLOT_STATUS_OCCUPIED;
        slot.computer = 0;
        if melee && !slot.is_observer() {
            if let Some(colour) = new_colour {
                slot.colour = colour;
            }
            slot.race = SLOT_RACE_RANDOM | SLOT_RACE_SELECTABLE;
        }

        // tell everyone already here about the new player
        let info = protocol::send_player_info(
            self.join_counter,
            pid,
            &req.name,
            external_ip,
            req.internal_ip,
        );
        self.send_all(info);
        self.join_counter += 1;

        let player = GamePlayer::new(
            conn,
            pid,
            req.name.clone(),
            req.internal_ip,
            external_ip,
            reserved,
            self.sync_counter,
            t,
        );

        // the new player gets the lobby state: their slot view, the virtual
        // host, everyone already seated, and the map check
        player.send(protocol::send_slot_info_join(
            pid,
            peer_port,
            external_ip,
            &self.slots,
            self.random_seed,
            self.map.layout_style(),
            self.map.num_players as u8,
        ));
        if let Some(vh_pid) = self.virtual_host_pid {
            player.send(protocol::send_player_info(1, vh_pid, &self.config.virtual_host_name, 0, 0));
        }
        for other in &self.players {
            player.send(protocol::send_player_info(
                self.join_counter,
                other.pid,
                &other.name,
                other.external_ip,
                other.internal_ip,
            ));
        }
        player.send(self.map_check_packet());

        tracing::info!(
            "[game] [joined] name={} pid={} sid={} reserved={} peer={}",
            req.name,
            pid,
            sid,
            reserved,
            player.conn.peer
        );

        let mut player = player;
        player.map_check_sent = true;
        self.players.push(player);
        self.slot_info_changed = true;
        self.queue_refresh();
    }

    // -----------------------------------------------------------------------
    // player events

    fn event_player_left(&mut self, i: usize, reason: u32) {
        let p = &mut self.players[i];
        tracing::info!("[game] [leaving] name={} pid={} reason={}", p.name, p.pid, reason);
        p.mark_deleted(reason);
    }

    fn event_player_loaded(&mut self, i: usize) {
        if self.state != GameState::Loading || self.players[i].finished_loading {
            return;
        }
        let t = self.ticks();
        let pid = {
            let p = &mut self.players[i];
            p.finished_loading = true;
            p.finished_loading_ticks = t;
            p.pid
        };
        tracing::info!("[game] [player_loaded] pid={} ticks={}", pid, t);
        let packet = protocol::send_game_loaded_others(pid);
        for (j, p) in self.players.iter().enumerate() {
            if j != i {
                p.send(packet.clone());
            }
        }
        self.check_all_loaded();
    }

    fn check_all_loaded(&mut self) {
        if self.state != GameState::Loading
            || self.players.is_empty()
            || !self.players.iter().all(|p| p.finished_loading)
        {
            return;
        }
        let t = self.ticks();
        self.state = GameState::Loaded;
        self.action_timer.reset(t);
        self.ping_timer.reset(t);
        self.lag_screen_reset_timer.reset(t);
        for p in &self.players {
            tracing::info!(
                "[game] [load_time] name={} pid={} ms={}",
                p.name,
                p.pid,
                p.finished_loading_ticks
            );
        }
        tracing::info!("[game] [all_loaded] players={} ticks={}", self.players.len(), t);
    }

    fn event_player_action(&mut self, i: usize, action: IncomingAction) {
        if self.state != GameState::Loaded {
            return;
        }
        // an action that cannot fit a broadcast on its own is abuse
        if protocol::ACTION_PAYLOAD_LIMIT < action.packed_len() + 6 {
            let p = &mut self.players[i];
            tracing::warn!("[game] [oversized_action] name={} len={}", p.name, action.action.len());
            p.mark_deleted(protocol::PLAYERLEAVE_DISCONNECT);
            return;
        }
        self.actions.push_back(action);
    }

    fn event_player_keep_alive(&mut self, i: usize, checksum: u32) {
        {
            let p = &mut self.players[i];
            p.keep_alives.push_back(checksum);
            p.sync_counter += 1;
        }
        // cross-check one frame checksum whenever every player has one queued
        let mut desync_found = false;
        while !self.players.is_empty() && self.players.iter().all(|p| !p.keep_alives.is_empty()) {
            let first = self.players[0].keep_alives[0];
            if self.players.iter().any(|p| p.keep_alives[0] != first) {
                desync_found = true;
            }
            for p in &mut self.players {
                p.keep_alives.pop_front();
            }
        }
        if desync_found && !self.desynced {
            self.desynced = true;
            tracing::warn!("[game] [desync] sync_counter={}", self.sync_counter);
            self.send_all_chat("Warning! Desync detected!");
        }
    }

    fn event_player_pong(&mut self, i: usize, echo: u32, now: u32) {
        let p = &mut self.players[i];
        p.add_rtt_sample(now.saturating_sub(echo));
        p.missed_pings = 0;
    }

    fn event_player_map_size(&mut self, i: usize, report: IncomingMapSize) {
        if self.state != GameState::Waiting {
            return;
        }
        let (pid, name) = (self.players[i].pid, self.players[i].name.clone());
        if report.size_flag == 1 && report.map_size == self.map.size {
            self.players[i].map_ok = true;
            if let Some(sid) = self.get_sid_from_pid(pid) {
                self.slots[sid].download_status = 100;
                self.slot_info_changed = true;
            }
            tracing::info!("[game] [map_ok] name={} pid={}", name, pid);
        } else {
            // no map transfer: a client without the exact file cannot play
            tracing::warn!(
                "[game] [map_missing] name={} flag={} reported={} expected={}",
                name,
                report.size_flag,
                report.map_size,
                self.map.size
            );
            self.send_all_chat(&format!("{} does not have the map and downloads are disabled", name));
            self.players[i].mark_deleted(protocol::PLAYERLEAVE_LOBBY);
        }
    }

    fn event_player_chat(&mut self, i: usize, chat: IncomingChat) {
        match chat {
            IncomingChat::Message { from_pid, to_pids, message } => {
                if from_pid != self.players[i].pid {
                    return;
                }
                tracing::info!("[game] [chat] from={} msg={}", self.players[i].name, message);
                if let Some(command) = message.strip_prefix('!') {
                    self.handle_chat_command(i, command);
                }
                let packet = protocol::send_chat_from_host(
                    from_pid,
                    &to_pids,
                    protocol::CHAT_MESSAGE,
                    None,
                    &message,
                );
                self.relay(&to_pids, packet);
            }
            IncomingChat::MessageExtra { from_pid, to_pids, extra_flags, message } => {
                if from_pid != self.players[i].pid {
                    return;
                }
                let packet = protocol::send_chat_from_host(
                    from_pid,
                    &to_pids,
                    protocol::CHAT_FROM_HOST_INGAME,
                    Some(extra_flags),
                    &message,
                );
                self.relay(&to_pids, packet);
            }
            IncomingChat::TeamChange { team, .. } => self.event_player_change_team(i, team),
            IncomingChat::ColourChange { colour, .. } => self.event_player_change_colour(i, colour),
            IncomingChat::RaceChange { race, .. } => self.event_player_change_race(i, race),
            IncomingChat::HandicapChange { handicap, .. } => {
                self.event_player_change_handicap(i, handicap)
            }
        }
    }

    fn relay(&self, to_pids: &[u8], packet: Vec<u8>) {
        for p in &self.players {
            if to_pids.contains(&p.pid) {
                p.send(packet.clone());
            }
        }
    }

    fn handle_chat_command(&mut self, i: usize, command: &str) {
        let mut parts = command.split_whitespace();
        let cmd = parts.next().unwrap_or("").to_ascii_lowercase();
        let t = self.ticks();
        match cmd.as_str() {
            "start" if self.state == GameState::Waiting => self.start_count_down(t),
            "abort" if self.state == GameState::CountDown => {
                let name = self.players[i].name.clone();
                self.abort_count_down(&name);
            }
            "hold" => {
                for name in parts {
                    self.reserve_name(name);
                }
            }
            "open" | "close" => {
                if self.state != GameState::Waiting {
                    return;
                }
                let Some(n) = parts.next().and_then(|a| a.parse::<usize>().ok()) else {
                    return;
                };
                if n < 1 || n > self.slots.len() {
                    return;
                }
                let slot = &mut self.slots[n - 1];
                match (cmd.as_str(), slot.status) {
                    ("open", SLOT_STATUS_CLOSED) => {
                        slot.status = SLOT_STATUS_OPEN;
                        self.slot_info_changed = true;
                    }
                    ("close", SLOT_STATUS_OPEN) => {
                        slot.status = SLOT_STATUS_CLOSED;
                        self.slot_info_changed = true;
                    }
                    _ => {}
                }
            }
            "ping" => {
                let report: Vec<String> = self
                    .players
                    .iter()
                    .map(|p| {
                        let held = if p.reserved { "*" } else { "" };
                        match p.rtt() {
                            Some(ms) => format!("{}{}: {}ms", p.name, held, ms),
                            None => format!("{}{}: ?", p.name, held),
                        }
                    })
                    .collect();
                self.send_all_chat(&report.join(", "));
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // slot mutations

    fn event_player_change_team(&mut self, i: usize, team: u8) {
        if self.state != GameState::Waiting {
            return;
        }
        // melee layouts have fixed teams
        if self.map.layout_style() == 0 {
            tracing::debug!("[game] [team_change_denied] reason=fixed_teams");
            return;
        }
        if team > 12 || (team == 12 && !self.map.observers_allowed()) {
            return;
        }
        let pid = self.players[i].pid;
        let Some(cur_sid) = self.get_sid_from_pid(pid) else {
            return;
        };
        if self.slots[cur_sid].team == team {
            return;
        }
        let Some(new_sid) = self.get_empty_slot_for_team(team) else {
            tracing::debug!("[game] [team_change_denied] team={} reason=no_free_slot", team);
            return;
        };
        let old = self.slots[cur_sid];
        self.open_slot(cur_sid);
        let map_ok = self.players[i].map_ok;
        let slot = &mut self.slots[new_sid];
        slot.pid = pid;
        slot.status = SLOT_STATUS_OCCUPIED;
        slot.computer = 0;
        slot.download_status = if map_ok { 100 } else { 255 };
        slot.handicap = old.handicap;
        if slot.race & SLOT_RACE_SELECTABLE != 0 {
            slot.race = old.race;
        }
        self.slot_info_changed = true;
    }

    fn event_player_change_colour(&mut self, i: usize, colour: u8) {
        if self.state != GameState::Waiting || colour > 11 {
            return;
        }
        let pid = self.players[i].pid;
        let Some(sid) = self.get_sid_from_pid(pid) else {
            return;
        };
        if self.slots[sid].is_observer() {
            return;
        }
        let in_use = self
            .slots
            .iter()
            .any(|s| s.is_occupied() && !s.is_observer() && s.colour == colour && s.pid != pid);
        if in_use {
            tracing::debug!("[game] [colour_change_denied] colour={} reason=in_use", colour);
            return;
        }
        self.slots[sid].colour = colour;
        self.slot_info_changed = true;
    }

    fn event_player_change_race(&mut self, i: usize, race: u8) {
        if self.state != GameState::Waiting {
            return;
        }
        let valid = [
            SLOT_RACE_HUMAN,
            SLOT_RACE_ORC,
            SLOT_RACE_NIGHTELF,
            SLOT_RACE_UNDEAD,
            SLOT_RACE_RANDOM,
        ];
        if !valid.contains(&race) {
            return;
        }
        let pid = self.players[i].pid;
        let Some(sid) = self.get_sid_from_pid(pid) else {
            return;
        };
        if self.slots[sid].race & SLOT_RACE_SELECTABLE == 0 {
            tracing::debug!("[game] [race_change_denied] reason=not_selectable");
            return;
        }
        self.slots[sid].race = race | SLOT_RACE_SELECTABLE;
        self.slot_info_changed = true;
    }

    fn event_player_change_handicap(&mut self, i: usize, handicap: u8) {
        if self.state != GameState::Waiting || !matches!(handicap, 50 | 60 | 70 | 80 | 90 | 100) {
            return;
        }
        let pid = self.players[i].pid;
        let Some(sid) = self.get_sid_from_pid(pid) else {
            return;
        };
        self.slots[sid].handicap = handicap;
        self.slot_info_changed = true;
    }

    // -----------------------------------------------------------------------
    // countdown & start

    fn start_count_down(&mut self, t: u32) {
        if self.state != GameState::Waiting {
            return;
        }
        if self.players.is_empty() {
            self.send_all_chat("Cannot start: the lobby is empty");
            return;
        }
        let not_checked: Vec<String> = self
            .players
            .iter()
            .filter(|p| !p.map_ok)
            .map(|p| p.name.clone())
            .collect();
        if !not_checked.is_empty() {
            self.send_all_chat(&format!(
                "Cannot start: still waiting for a map check from {}",
                not_checked.join(", ")
            ));
            return;
        }
        tracing::info!("[game] [countdown] players={}", self.players.len());
        self.state = GameState::CountDown;
        self.count_down_counter = COUNTDOWN_START_VALUE;
        self.count_down_timer.reset(t);
        // the lobby is no longer joinable; stop advertising it
        self.udp_pending.push(UdpOut::Broadcast(protocol::send_decreate_game(self.host_counter)));
    }

    fn abort_count_down(&mut self, who: &str) {
        if self.state != GameState::CountDown {
            return;
        }
        tracing::info!("[game] [countdown_aborted] by={}", who);
        self.state = GameState::Waiting;
        self.send_all_chat(&format!("Countdown aborted by {}", who));
    }

    fn event_game_started(&mut self) {
        tracing::info!(
            "[game] [started] name={} players={} random_seed={}",
            self.config.game_name,
            self.players.len(),
            self.random_seed
        );
        self.delete_virtual_host();
        self.send_all(protocol::send_count_down_start());
        self.send_all(protocol::send_count_down_end());
        self.state = GameState::Loading;
        self.actions.clear();
    }

    // -----------------------------------------------------------------------
    // the action tick & lag screen

    fn send_all_actions(&mut self) {
        self.sync_counter += 1;
        let batch: Vec<IncomingAction> = self.actions.drain(..).collect();
        for packet in protocol::pack_actions(&batch, self.config.latency as u16) {
            self.send_all(packet);
        }
    }

    fn update_loaded(&mut self, t: u32) {
        if self.ping_timer.update(t, PING_INTERVAL) {
            self.send_all(protocol::send_ping_from_host(t));
        }

        // silence timeout: a playing client that stopped talking is gone.
        // a recent lag screen grants a grace period, since clients stay
        // quiet while it is up
        let lag_grace = self.lagging
            || (self.last_lag_screen_ticks > 0
                && t.saturating_sub(self.last_lag_screen_ticks) < PLAYING_SILENCE_TIMEOUT);
        if !lag_grace {
            for p in &mut self.players {
                if !p.delete_me && t.saturating_sub(p.last_frame_ticks) > PLAYING_SILENCE_TIMEOUT {
                    tracing::warn!("[game] [silence_timeout] name={} pid={}", p.name, p.pid);
                    p.mark_deleted(protocol::PLAYERLEAVE_DISCONNECT);
                }
            }
        }

        if !self.lagging {
            let laggers: Vec<(u8, u32)> = self
                .players
                .iter()
                .filter(|p| !p.delete_me)
                .filter_map(|p| {
                    let behind = self.sync_counter.saturating_sub(p.sync_counter);
                    (behind > self.sync_limit).then_some((p.pid, behind))
                })
                .collect();
            if !laggers.is_empty() {
                self.lagging = true;
                self.started_lagging_ticks = t;
                self.last_lag_screen_ticks = t;
                self.lag_screen_reset_timer.reset(t);
                for p in &mut self.players {
                    if laggers.iter().any(|&(pid, _)| pid == p.pid) {
                        p.lagging = true;
                        p.started_lagging_ticks = t;
                    }
                }
                tracing::warn!("[game] [lag_start] laggers={:?}", laggers);
                self.send_all(protocol::send_start_lag(&laggers));
            }
        } else {
            self.last_lag_screen_ticks = t;

            // anyone back inside the sync window leaves the lag screen
            let caught_up: Vec<(u8, u32)> = self
                .players
                .iter()
                .filter(|p| {
                    p.lagging && self.sync_counter.saturating_sub(p.sync_counter) <= self.sync_limit
                })
                .map(|p| (p.pid, t.saturating_sub(p.started_lagging_ticks)))
                .collect();
            for &(pid, behind_time) in &caught_up {
                if let Some(p) = self.players.iter_mut().find(|p| p.pid == pid) {
                    p.lagging = false;
                }
                tracing::info!("[game] [lag_stop] pid={} after_ms={}", pid, behind_time);
                self.send_all(protocol::send_stop_lag(pid, behind_time));
            }

            if t.saturating_sub(self.started_lagging_ticks) > self.config.lag_timeout {
                self.stop_laggers();
            } else if self.lag_screen_reset_timer.update(t, LAG_SCREEN_REFRESH_INTERVAL) {
                // keep the lag screen alive on clients: re-issue it for every
                // player still behind
                let still_lagging: Vec<(u8, u32)> = self
                    .players
                    .iter()
                    .filter(|p| p.lagging)
                    .map(|p| (p.pid, self.sync_counter.saturating_sub(p.sync_counter)))
                    .collect();
                for &(pid, _) in &still_lagging {
                    let since = t.saturating_sub(self.started_lagging_ticks);
                    self.send_all(protocol::send_stop_lag(pid, since));
                }
                if !still_lagging.is_empty() {
                    self.send_all(protocol::send_start_lag(&still_lagging));
                }
            }

            if !self.players.iter().any(|p| p.lagging) {
                self.lagging = false;
                self.action_timer.reset(t);
            }
        }

        // broadcasts pause while the lag screen is up
        if !self.lagging && self.action_timer.update(t, self.config.latency) {
            self.send_all_actions();
        }
    }

    /// Drops every player still behind once the configured lag timeout runs
    /// out.
    fn stop_laggers(&mut self) {
        for p in &mut self.players {
            if p.lagging && !p.delete_me {
                tracing::warn!("[game] [lagged_out] name={} pid={}", p.name, p.pid);
                p.mark_deleted(protocol::PLAYERLEAVE_DISCONNECT);
            }
        }
    }

    // -----------------------------------------------------------------------
    // the two-phase update

    /// Advances timers and periodic behaviour. Returns the datagrams the
    /// announcer should put on the wire.
    pub fn update(&mut self) -> Vec<UdpOut> {
        let t = self.ticks();
        self.update_at(t)
    }

    fn update_at(&mut self, t: u32) -> Vec<UdpOut> {
        match self.state {
            GameState::Waiting => self.update_waiting(t),
            GameState::CountDown => {
                if self.count_down_timer.update(t, COUNTDOWN_STEP_INTERVAL) {
                    if self.count_down_counter > 0 {
                        self.send_all_chat(&format!("{}. . .", self.count_down_counter));
                        self.count_down_counter -= 1;
                    } else {
                        self.event_game_started();
                    }
                }
            }
            GameState::Loading => {}
            GameState::Loaded => self.update_loaded(t),
        }
        std::mem::take(&mut self.udp_pending)
    }

    fn update_waiting(&mut self, t: u32) {
        if !self.announced {
            self.announced = true;
            let create = protocol::send_create_game(self.config.war3_version, self.host_counter);
            let info = self.game_info_packet();
            self.udp_pending.push(UdpOut::Broadcast(create));
            self.udp_pending.push(UdpOut::Broadcast(info));
            self.announce_timer.reset(t);
        } else if self.announce_timer.update(t, ANNOUNCE_INTERVAL) {
            let info = self.game_info_packet();
            self.udp_pending.push(UdpOut::Broadcast(info));
        }

        if self.ping_timer.update(t, PING_INTERVAL) {
            // count the ping as missed up front; a pong clears it
            for p in &mut self.players {
                p.missed_pings += 1;
                if p.missed_pings > MAX_MISSED_PINGS {
                    tracing::warn!("[game] [ping_timeout] name={} pid={}", p.name, p.pid);
                    p.mark_deleted(protocol::PLAYERLEAVE_DISCONNECT);
                }
            }
            self.send_all(protocol::send_ping_from_host(t));
        }

        // re-issue the map check to anyone who has not reported a match
        if self.download_timer.update(t, MAP_CHECK_RETRY_INTERVAL) {
            let packet = self.map_check_packet();
            for p in &self.players {
                if p.map_check_sent && !p.map_ok {
                    p.send(packet.clone());
                }
            }
        }

        for p in &mut self.potentials {
            if !p.delete_me && t.saturating_sub(p.connected_ticks) > POTENTIAL_TIMEOUT {
                tracing::info!("[game] [potential_timeout] conn={:?}", p.conn_id());
                p.delete_me = true;
            }
        }

        let autostart = self.config.autostart;
        if autostart > 0
            && self.players.len() as u32 >= autostart
            && self.players.iter().all(|p| p.map_ok)
        {
            tracing::info!("[game] [autostart] players={} threshold={}", self.players.len(), autostart);
            self.start_count_down(t);
        }
    }

    /// Flushes a pending `SLOTINFO` (at most one per tick) and sweeps
    /// flagged potentials and players. This is the only place entities are
    /// removed.
    pub fn update_post(&mut self) {
        if self.slot_info_changed {
            if matches!(self.state, GameState::Waiting | GameState::CountDown) {
                self.send_all_slot_info();
            }
            self.slot_info_changed = false;
        }
        self.sweep_potentials();
        self.sweep_players();
    }

    fn sweep_potentials(&mut self) {
        self.potentials.retain(|p| !p.delete_me);
    }

    fn sweep_players(&mut self) {
        if !self.players.iter().any(|p| p.delete_me) {
            return;
        }
        let t = self.ticks();
        let leavers: Vec<(u8, String, u32, bool, u32)> = self
            .players
            .iter()
            .filter(|p| p.delete_me)
            .map(|p| (p.pid, p.name.clone(), p.left_code, p.lagging, p.started_lagging_ticks))
            .collect();
        self.players.retain(|p| !p.delete_me);

        let mut aborted_by: Option<String> = None;
        for (pid, name, left_code, was_lagging, lag_start) in leavers {
            tracing::info!("[game] [player_removed] name={} pid={} reason={}", name, pid, left_code);
            if was_lagging {
                self.send_all(protocol::send_stop_lag(pid, t.saturating_sub(lag_start)));
            }
            self.send_all(protocol::send_player_leave_others(pid, left_code));
            if matches!(self.state, GameState::Waiting | GameState::CountDown) {
                if let Some(sid) = self.slots.iter().position(|s| s.is_occupied() && s.pid == pid) {
                    self.open_slot(sid);
                    self.slot_info_changed = true;
                }
                self.queue_refresh();
            }
            if self.state == GameState::CountDown {
                aborted_by = Some(name);
            }
        }

        if let Some(name) = aborted_by {
            self.abort_count_down(&name);
        }

        match self.state {
            GameState::Loading => {
                if self.players.is_empty() {
                    tracing::info!("[game] [empty] state=loading");
                    self.exiting = true;
                } else {
                    self.check_all_loaded();
                }
            }
            GameState::Loaded => {
                if self.players.is_empty() {
                    tracing::info!("[game] [empty] state=loaded");
                    self.exiting = true;
                } else if self.lagging && !self.players.iter().any(|p| p.lagging) {
                    self.lagging = false;
                    self.action_timer.reset(t);
                }
            }
            _ => {}
        }
    }

    /// Begins teardown: every player is told the lobby is gone, the LAN
    /// entry is decreated and the run loop stops after the current wake.
    pub fn shutdown(&mut self) -> Vec<UdpOut> {
        if self.exiting {
            return Vec::new();
        }
        tracing::info!("[game] [shutdown] name={}", self.config.game_name);
        self.exiting = true;
        for p in &self.players {
            p.send(protocol::send_player_leave_others(p.pid, protocol::PLAYERLEAVE_LOBBY));
        }
        vec![UdpOut::Broadcast(protocol::send_decreate_game(self.host_counter))]
    }

    // -----------------------------------------------------------------------
    // the top-level loop

    /// Drives the session: TCP accepts, per-connection frames, UDP discovery
    /// and the 50 ms timer tick, until shutdown or the game empties out.
    pub async fn run(mut self, listener: TcpListener, announcer: Announcer) -> anyhow::Result<()> {
        tracing::info!(
            "[game] [hosting] name={} port={} map={}",
            self.config.game_name,
            self.host_port,
            self.map.path
        );
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<NetEvent>();
        let mut tick = tokio::time::interval(Duration::from_millis(LOOP_INTERVAL_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut next_conn_id: ConnId = 1;
        let mut udp_buf = vec![0u8; 1500];

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn = Connection::spawn(next_conn_id, stream, peer, events_tx.clone());
                        next_conn_id += 1;
                        self.handle_connection(conn);
                    }
                    Err(err) => tracing::warn!("[game] [accept_error] err={}", err),
                },
                Some(event) = events_rx.recv() => match event {
                    NetEvent::Frame { conn, data } => self.handle_frame(conn, data),
                    NetEvent::Closed { conn } => self.handle_closed(conn),
                },
                received = announcer.socket.recv_from(&mut udp_buf) => {
                    if let Ok((n, from)) = received {
                        let replies = self.handle_udp(from, &udp_buf[..n]);
                        announcer.dispatch(&replies);
                    }
                },
                _ = tick.tick() => {
                    let datagrams = self.update();
                    announcer.dispatch(&datagrams);
                    self.update_post();
                },
                _ = tokio::signal::ctrl_c() => {
                    let datagrams = self.shutdown();
                    announcer.dispatch(&datagrams);
                },
            }
            if self.exiting {
                break;
            }
        }
        tracing::info!("[game] [stopped] name={}", self.config.game_name);
        Ok(())
    }
}
