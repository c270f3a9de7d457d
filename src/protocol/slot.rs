//! The 9-byte lobby slot record.
//!
//! Slots travel inside `SLOTINFO` / `SLOTINFOJOIN` blocks and come out of the
//! map config as `map_slot<n>` templates. The session owns all validation
//! beyond the basic enum range checks done at decode time.

use crate::util::ProtocolError;

pub const SLOT_STATUS_OPEN: u8 = 0;
pub const SLOT_STATUS_CLOSED: u8 = 1;
pub const SLOT_STATUS_OCCUPIED: u8 = 2;

pub const SLOT_RACE_HUMAN: u8 = 0x01;
pub const SLOT_RACE_ORC: u8 = 0x02;
pub const SLOT_RACE_NIGHTELF: u8 = 0x04;
pub const SLOT_RACE_UNDEAD: u8 = 0x08;
pub const SLOT_RACE_RANDOM: u8 = 0x20;
pub const SLOT_RACE_SELECTABLE: u8 = 0x40;

pub const SLOT_COMP_EASY: u8 = 0;
pub const SLOT_COMP_NORMAL: u8 = 1;
pub const SLOT_COMP_HARD: u8 = 2;

/// Team/colour value marking an observer slot.
pub const OBSERVER_TEAM: u8 = 12;

/// One lobby slot as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameSlot {
    /// 0 for empty/open/closed slots, else the occupying player's PID.
    pub pid: u8,
    /// 0-100, or 255 when unknown.
    pub download_status: u8,
    pub status: u8,
    /// 0 = human, 1 = AI.
    pub computer: u8,
    /// 0-11 for players, 12 for observers.
    pub team: u8,
    /// 0-11, unique among occupied slots; 12 for observers.
    pub colour: u8,
    /// SLOT_RACE_* bitmask.
    pub race: u8,
    /// AI difficulty, 0-2.
    pub computer_type: u8,
    /// 50/60/70/80/90/100.
    pub handicap: u8,
}

impl GameSlot {
    pub const ENCODED_LEN: usize = 9;

    pub fn new(pid: u8, download_status: u8, status: u8, computer: u8, team: u8, colour: u8, race: u8) -> Self {
        Self {
            pid,
            download_status,
            status,
            computer,
            team,
            colour,
            race,
            computer_type: SLOT_COMP_NORMAL,
            handicap: 100,
        }
    }

    pub fn from_bytes(b: [u8; 9]) -> Self {
        Self {
            pid: b[0],
            download_status: b[1],
            status: b[2],
            computer: b[3],
            team: b[4],
            colour: b[5],
            race: b[6],
            computer_type: b[7],
            handicap: b[8],
        }
    }

    /// The open observer slot template appended when the map allows
    /// observers.
    pub fn open_observer() -> Self {
        GameSlot::new(0, 255, SLOT_STATUS_OPEN, 0, OBSERVER_TEAM, OBSERVER_TEAM, SLOT_RACE_RANDOM)
    }

    pub fn is_open(&self) -> bool {
        self.status == SLOT_STATUS_OPEN
    }

    pub fn is_occupied(&self) -> bool {
        self.status == SLOT_STATUS_OCCUPIED
    }

    pub fn is_observer(&self) -> bool {
        self.team == OBSERVER_TEAM
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[
            self.pid,
            self.download_status,
            self.status,
            self.computer,
            self.team,
            self.colour,
            self.race,
            self.computer_type,
            self.handicap,
        ]);
    }

    /// Decodes 9 bytes at `off`, returning the slot and the next offset.
    pub fn decode(buf: &[u8], off: usize) -> Result<(Self, usize), ProtocolError> {
        let b = buf.get(off..off + Self::ENCODED_LEN).ok_or(ProtocolError::Truncated {
            off,
            need: Self::ENCODED_LEN,
            have: buf.len().saturating_sub(off),
        })?;
        let slot = Self::from_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8]]);
        if slot.status > SLOT_STATUS_OCCUPIED {
            return Err(ProtocolError::BadField("slot status"));
        }
        if slot.computer > 1 {
            return Err(ProtocolError::BadField("slot computer"));
        }
        if slot.team > OBSERVER_TEAM {
            return Err(ProtocolError::BadField("slot team"));
        }
        if slot.colour > OBSERVER_TEAM {
            return Err(ProtocolError::BadField("slot colour"));
        }
        Ok((slot, off + Self::ENCODED_LEN))
    }
}
