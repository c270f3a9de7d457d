//! Warhost - W3GS LAN game host
//!
//! Hosts a multiplayer lobby for Warcraft III over the native LAN protocol:
//! UDP discovery broadcasts, TCP lobby management, and the authoritative
//! action relay once the game is running.

/// Host configuration (key = value files)
pub mod config;
/// Game session state machine and top-level loop
pub mod game;
/// Map descriptor parsed from config
pub mod map;
/// Socket plumbing: connection actors and the UDP announcer
pub mod net;
/// W3GS packet codec
pub mod protocol;
/// Byte buffer utilities
pub mod util;
