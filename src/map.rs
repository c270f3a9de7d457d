//! Map descriptor.
//!
//! A passive record parsed from the config file: checksums, dimensions,
//! options and the initial slot layout. Immutable once loaded; the session
//! copies the slot templates into its own lobby state.

use anyhow::{Context, Result};

use crate::config::Config;
use crate::protocol::slot::{GameSlot, SLOT_RACE_RANDOM, SLOT_RACE_SELECTABLE};
use crate::protocol::{GAMETYPE_BLIZZARD, GAMETYPE_CUSTOM};
use crate::util::parse_decimal_bytes;

/// Map option bits, as stored in the map's embedded header.
pub const MAPOPT_MELEE: u32 = 1 << 2;
pub const MAPOPT_FIXEDPLAYERSETTINGS: u32 = 1 << 5;
pub const MAPOPT_CUSTOMFORCES: u32 = 1 << 6;

/// Host-side game flags (not the wire mask; see [`Map::game_flags`]).
pub const MAPFLAG_TEAMSTOGETHER: u32 = 1;
pub const MAPFLAG_FIXEDTEAMS: u32 = 2;
pub const MAPFLAG_UNITSHARE: u32 = 4;
pub const MAPFLAG_RANDOMHERO: u32 = 8;
pub const MAPFLAG_RANDOMRACES: u32 = 16;

/// Clients refuse longer paths, so this is validated host-side too.
pub const MAX_MAP_PATH_LEN: usize = 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapSpeed {
    Slow,
    Normal,
    Fast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapVisibility {
    HideTerrain,
    Explored,
    AlwaysVisible,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapObservers {
    None,
    OnDefeat,
    Allowed,
    Referees,
}

#[derive(Debug, Clone)]
pub struct Map {
    pub path: String,
    pub size: u32,
    pub info: u32,
    pub crc: u32,
    pub sha1: [u8; 20],
    pub width: u16,
    pub height: u16,
    pub options: u32,
    /// Count of playable (non-observer) slots. Always equals the number of
    /// `map_slot<n>` templates found, regardless of the configured value.
    pub num_players: u32,
    pub slots: Vec<GameSlot>,
    pub speed: MapSpeed,
    pub visibility: MapVisibility,
    pub observers: MapObservers,
    pub flags: u32,
}

impl Map {
    /// Loads the descriptor from config. Returns an error when the
    /// descriptor fails validation; the session refuses to start without a
    /// valid map.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let path = cfg.get_string("map_path", "");

        let size = u32::from_le_bytes(
            parse_decimal_bytes::<4>(&cfg.get_string("map_size", "")).context("bad map_size")?,
        );
        let info = u32::from_le_bytes(
            parse_decimal_bytes::<4>(&cfg.get_string("map_info", "")).context("bad map_info")?,
        );
        let crc = u32::from_le_bytes(
            parse_decimal_bytes::<4>(&cfg.get_string("map_crc", "")).context("bad map_crc")?,
        );
        let sha1: [u8; 20] =
            parse_decimal_bytes(&cfg.get_string("map_sha1", "")).context("bad map_sha1")?;
        let width = u16::from_le_bytes(
            parse_decimal_bytes::<2>(&cfg.get_string("map_width", "")).context("bad map_width")?,
        );
        let height = u16::from_le_bytes(
            parse_decimal_bytes::<2>(&cfg.get_string("map_height", "")).context("bad map_height")?,
        );
        let options = cfg.get_int("map_options", 0) as u32;

        tracing::info!("[map] [load] path={} size={} crc={} options={:#X}", path, size, crc, options);

        let mut slots = Vec::new();
        for n in 1..=12 {
            let raw = cfg.get_string(&format!("map_slot{}", n), "");
            if raw.is_empty() {
                break;
            }
            let Ok(bytes) = parse_decimal_bytes::<9>(&raw) else {
                tracing::warn!("[map] [bad_slot] map_slot{}={}", n, raw);
                break;
            };
            slots.push(GameSlot::from_bytes(bytes));
        }

        let configured = cfg.get_int("map_numplayers", 0);
        if configured != slots.len() as i32 {
            tracing::debug!(
                "[map] [numplayers_overridden] configured={} slots={}",
                configured,
                slots.len()
            );
        }
        let num_players = slots.len() as u32;

        let speed = MapSpeed::Fast;
        let visibility = MapVisibility::Default;
        let mut observers = MapObservers::None;
        let flags = MAPFLAG_TEAMSTOGETHER | MAPFLAG_FIXEDTEAMS;

        if options & MAPOPT_MELEE != 0 {
            for (i, slot) in slots.iter_mut().enumerate() {
                slot.team = i as u8;
                slot.race = SLOT_RACE_RANDOM;
            }
            // melee lobbies always accept observers
            observers = MapObservers::Allowed;
        }

        if options & MAPOPT_FIXEDPLAYERSETTINGS == 0 {
            for slot in slots.iter_mut() {
                slot.race |= SLOT_RACE_SELECTABLE;
            }
        }

        if matches!(observers, MapObservers::Allowed | MapObservers::Referees) && slots.len() < 12 {
            tracing::info!("[map] [observer_slots] adding={}", 12 - slots.len());
            while slots.len() < 12 {
                slots.push(GameSlot::open_observer());
            }
        }

        let map = Self {
            path,
            size,
            info,
            crc,
            sha1,
            width,
            height,
            options,
            num_players,
            slots,
            speed,
            visibility,
            observers,
            flags,
        };
        map.check_valid()?;
        Ok(map)
    }

    fn check_valid(&self) -> Result<()> {
        anyhow::ensure!(!self.path.is_empty(), "map_path is empty");
        anyhow::ensure!(
            self.path.len() <= MAX_MAP_PATH_LEN,
            "map_path too long: {} bytes (max {})",
            self.path.len(),
            MAX_MAP_PATH_LEN
        );
        if self.path.contains('/') {
            tracing::warn!("[map] [path_slashes] map_path should use backslashes: {}", self.path);
        }
        anyhow::ensure!(
            self.num_players >= 1 && self.num_players <= 12,
            "map_numplayers out of range: {}",
            self.num_players
        );
        anyhow::ensure!(
            !self.slots.is_empty() && self.slots.len() <= 12,
            "map slot count out of range: {}",
            self.slots.len()
        );
        // layout style 2 (fixed player settings without custom forces) is not
        // producible by the map editor; refuse rather than advertise it
        anyhow::ensure!(
            self.options & MAPOPT_FIXEDPLAYERSETTINGS == 0 || self.options & MAPOPT_CUSTOMFORCES != 0,
            "map_options sets fixed player settings without custom forces"
        );
        Ok(())
    }

    /// The 32-bit game flags mask advertised in `GAMEINFO` and the stat
    /// string.
    pub fn game_flags(&self) -> u32 {
        let mut flags = match self.speed {
            MapSpeed::Slow => 0x0000_0000,
            MapSpeed::Normal => 0x0000_0001,
            MapSpeed::Fast => 0x0000_0002,
        };

        flags |= match self.visibility {
            MapVisibility::HideTerrain => 0x0000_0100,
            MapVisibility::Explored => 0x0000_0200,
            MapVisibility::AlwaysVisible => 0x0000_0400,
            MapVisibility::Default => 0x0000_0800,
        };

        flags |= match self.observers {
            MapObservers::None => 0,
            MapObservers::OnDefeat => 0x0000_2000,
            MapObservers::Allowed => 0x0000_3000,
            MapObservers::Referees => 0x4000_0000,
        };

        if self.flags & MAPFLAG_TEAMSTOGETHER != 0 {
            flags |= 0x0000_4000;
        }
        if self.flags & MAPFLAG_FIXEDTEAMS != 0 {
            flags |= 0x0006_0000;
        }
        if self.flags & MAPFLAG_UNITSHARE != 0 {
            flags |= 0x0100_0000;
        }
        if self.flags & MAPFLAG_RANDOMHERO != 0 {
            flags |= 0x0200_0000;
        }
        if self.flags & MAPFLAG_RANDOMRACES != 0 {
            flags |= 0x0400_0000;
        }

        flags
    }

    /// 0 = melee, 1 = custom forces, 3 = custom forces + fixed player
    /// settings. Style 2 is rejected at load.
    pub fn layout_style(&self) -> u8 {
        if self.options & MAPOPT_CUSTOMFORCES == 0 {
            return 0;
        }
        if self.options & MAPOPT_FIXEDPLAYERSETTINGS == 0 {
            return 1;
        }
        3
    }

    pub fn game_type(&self) -> u32 {
        if self.options & MAPOPT_MELEE != 0 {
            GAMETYPE_BLIZZARD
        } else {
            GAMETYPE_CUSTOM
        }
    }

    pub fn observers_allowed(&self) -> bool {
        matches!(self.observers, MapObservers::Allowed | MapObservers::Referees)
    }

    /// Map transfer is not implemented; clients must already have the file.
    pub fn map_data(&self) -> &[u8] {
        &[]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::slot::SLOT_STATUS_OPEN;

    fn base_cfg(options: u32, slots: &[&str]) -> Config {
        let mut text = format!(
            "map_path = Maps\\(2)Test.w3x\n\
             map_size = 108 67 1 0\n\
             map_info = 214 149 99 101\n\
             map_crc = 108 250 204 59\n\
             map_sha1 = 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20\n\
             map_width = 116 0\n\
             map_height = 116 0\n\
             map_options = {}\n\
             map_numplayers = {}\n",
            options,
            slots.len()
        );
        for (i, s) in slots.iter().enumerate() {
            text.push_str(&format!("map_slot{} = {}\n", i + 1, s));
        }
        Config::parse(&text)
    }

    const TWO_SLOTS: [&str; 2] = ["0 255 0 0 0 0 96 1 100", "0 255 0 0 1 1 96 1 100"];

    #[test]
    fn test_melee_load() {
        let map = Map::from_config(&base_cfg(MAPOPT_MELEE, &TWO_SLOTS)).unwrap();
        assert_eq!(map.num_players, 2);
        // observer fill brings the lobby to 12 slots
        assert_eq!(map.slots.len(), 12);
        assert_eq!(map.slots[0].team, 0);
        assert_eq!(map.slots[1].team, 1);
        // melee forces random race, then selectable is added back
        assert_eq!(map.slots[0].race, SLOT_RACE_RANDOM | SLOT_RACE_SELECTABLE);
        assert!(map.slots[11].is_observer());
        assert_eq!(map.slots[11].status, SLOT_STATUS_OPEN);
        assert_eq!(map.layout_style(), 0);
        assert_eq!(map.game_type(), GAMETYPE_BLIZZARD);
        assert_eq!(map.size, 0x0001436C);
        assert_eq!(map.width, 116);
        assert_eq!(map.sha1[0], 1);
        assert_eq!(map.sha1[19], 20);
    }

    #[test]
    fn test_custom_forces_load() {
        let map =
            Map::from_config(&base_cfg(MAPOPT_CUSTOMFORCES | MAPOPT_FIXEDPLAYERSETTINGS, &TWO_SLOTS))
                .unwrap();
        assert_eq!(map.layout_style(), 3);
        assert_eq!(map.game_type(), GAMETYPE_CUSTOM);
        // no observers: slot count equals the template count
        assert_eq!(map.slots.len(), 2);
        // fixed player settings: race left exactly as the template says
        assert_eq!(map.slots[0].race, 96);
    }

    #[test]
    fn test_custom_forces_selectable_races() {
        let map = Map::from_config(&base_cfg(MAPOPT_CUSTOMFORCES, &TWO_SLOTS)).unwrap();
        assert_eq!(map.layout_style(), 1);
        assert_ne!(map.slots[0].race & SLOT_RACE_SELECTABLE, 0);
    }

    #[test]
    fn test_layout_two_is_rejected() {
        assert!(Map::from_config(&base_cfg(MAPOPT_FIXEDPLAYERSETTINGS, &TWO_SLOTS)).is_err());
    }

    #[test]
    fn test_no_slots_is_rejected() {
        assert!(Map::from_config(&base_cfg(MAPOPT_MELEE, &[])).is_err());
    }

    #[test]
    fn test_bad_sha1_is_rejected() {
        let mut text = String::from(
            "map_path = Maps\\x.w3x\nmap_size = 1 0 0 0\nmap_info = 1 0 0 0\n\
             map_crc = 1 0 0 0\nmap_sha1 = 1 2 3\nmap_width = 1 0\nmap_height = 1 0\n",
        );
        text.push_str("map_slot1 = 0 255 0 0 0 0 32 1 100\n");
        assert!(Map::from_config(&Config::parse(&text)).is_err());
    }

    #[test]
    fn test_long_path_is_rejected() {
        let long = "x".repeat(MAX_MAP_PATH_LEN + 1);
        let mut cfg_text = format!("map_path = {}\n", long);
        cfg_text.push_str(
            "map_size = 1 0 0 0\nmap_info = 1 0 0 0\nmap_crc = 1 0 0 0\n\
             map_sha1 = 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20\n\
             map_width = 1 0\nmap_height = 1 0\nmap_slot1 = 0 255 0 0 0 0 32 1 100\n",
        );
        assert!(Map::from_config(&Config::parse(&cfg_text)).is_err());
    }

    #[test]
    fn test_game_flags_melee() {
        let map = Map::from_config(&base_cfg(MAPOPT_MELEE, &TWO_SLOTS)).unwrap();
        // fast speed | default visibility | observers allowed |
        // teams together | fixed teams
        assert_eq!(map.game_flags(), 0x2 | 0x800 | 0x3000 | 0x4000 | 0x60000);
    }

    #[test]
    fn test_game_flags_no_observers() {
        let map = Map::from_config(&base_cfg(MAPOPT_CUSTOMFORCES, &TWO_SLOTS)).unwrap();
        assert_eq!(map.game_flags() & 0x3000, 0);
        assert!(!map.observers_allowed());
    }

    #[test]
    fn test_map_data_is_stubbed_empty() {
        let map = Map::from_config(&base_cfg(MAPOPT_MELEE, &TWO_SLOTS)).unwrap();
        assert!(map.map_data().is_empty());
    }

    #[test]
    fn test_truncated_slot_template_stops_the_scan() {
        let mut text = String::from(
            "map_path = Maps\\x.w3x\nmap_size = 1 0 0 0\nmap_info = 1 0 0 0\n\
             map_crc = 1 0 0 0\nmap_sha1 = 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20\n\
             map_width = 1 0\nmap_height = 1 0\n",
        );
        text.push_str("map_slot1 = 0 255 0 0 0 0 32 1 100\n");
        text.push_str("map_slot2 = 0 255 0\n"); // malformed
        text.push_str("map_slot3 = 0 255 0 0 2 2 32 1 100\n");
        let map = Map::from_config(&Config::parse(&text)).unwrap();
        assert_eq!(map.num_players, 1);
    }
}
