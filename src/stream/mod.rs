//! Media path from the capture pipeline to every live session.
//!
//! - `sample`: encoded samples and the gate that filters them
//! - `fanout`: per-session distribution with independent sequencing

pub mod fanout;
pub mod sample;

pub use fanout::*;
pub use sample::*;

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time in 100 ns units since the Unix epoch.
pub fn now_100ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_nanos() / 100) as u64)
        .unwrap_or(0)
}
