//! Shared support primitives for the server: logging plumbing, wall-clock
//! helpers and the frame integrity checksum.

pub mod checksum;
pub mod logging;
pub mod time;
