//! natkeeper - NAPT state manager
//!
//! Keeps the live mapping between internal (IP, port / ICMP id) tuples and the
//! external ports / identifiers a software router translates them to, tracks
//! TCP peers per mapping and expires stale state from a background reaper.

pub mod config;
pub mod dataplane;
pub mod error;
pub mod telemetry;

pub use error::{Error, Result};
