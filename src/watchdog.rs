//! Out-of-band loop watchdog.
//!
//! The control loop stamps a [`LoopHeartbeat`] at the end of every tick. A
//! separate task polls it with [`enforce`] and writes a hardware stop straight
//! to the chassis when the stamp is older than [`LOOP_STALL_MS`], so a hung
//! loop cannot leave the last drive command in force.

use crate::chassis::{self, ChassisPort};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::error;

pub use crate::engine::LOOP_STALL_MS;

#[derive(Debug)]
pub struct LoopHeartbeat {
    last_beat_ms: AtomicU64,
    tripped: AtomicBool,
}

impl LoopHeartbeat {
    pub const fn new(now_ms: u64) -> Self {
        Self {
            last_beat_ms: AtomicU64::new(now_ms),
            tripped: AtomicBool::new(false),
        }
    }

    /// Called by the control loop once per completed tick. Re-arms the trip.
    pub fn beat(&self, now_ms: u64) {
        self.last_beat_ms.store(now_ms, Ordering::Release);
        self.tripped.store(false, Ordering::Release);
    }

    pub fn last_beat_ms(&self) -> u64 {
        self.last_beat_ms.load(Ordering::Acquire)
    }

    pub fn is_stalled(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_beat_ms()) > LOOP_STALL_MS
    }

    /// `true` exactly once per stall.
    pub fn trip(&self, now_ms: u64) -> bool {
        self.is_stalled(now_ms) && !self.tripped.swap(true, Ordering::AcqRel)
    }
}

/// Stop the chassis if the loop has stalled. Returns `true` when a stop was
/// written.
pub fn enforce<P: ChassisPort>(heartbeat: &LoopHeartbeat, port: &mut P, now_ms: u64) -> Result<bool, P::Error> {
    if !heartbeat.trip(now_ms) {
        return Ok(false);
    }
    error!(
        silent_ms = now_ms.saturating_sub(heartbeat.last_beat_ms()),
        "control loop hung, stopping chassis"
    );
    chassis::stop(port)?;
    Ok(true)
}
