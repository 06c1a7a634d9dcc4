use super::decoder::{DecoderStats, FrameDecoder};
use super::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A valid frame within this window means the chassis link is up.
pub const CONNECTED_WINDOW_MS: u64 = 2000;
/// Consecutive checksum failures before a stream reconfigure is considered.
pub const RESYNC_FAILURE_THRESHOLD: u32 = 4;
/// Minimum gap without a valid frame, and between two reconfigures.
pub const RESYNC_COOLDOWN_MS: u64 = 1000;

// Bits of packet 7
const BUMP_RIGHT_BIT: u8 = 0x01;
const BUMP_LEFT_BIT: u8 = 0x02;
const WHEELDROP_BITS: u8 = 0x1C;

// Bits of packet 18
const BUTTON_PLAY_BIT: u8 = 0x01;
const BUTTON_ADVANCE_BIT: u8 = 0x04;

// Host-facing masks for BUMP/CLIFF/STARTLE
pub const MASK_LEFT: u8 = 0x01;
pub const MASK_RIGHT: u8 = 0x02;
pub const MASK_FRONT_LEFT: u8 = 0x04;
pub const MASK_FRONT_RIGHT: u8 = 0x08;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorState {
    pub bump_left: bool,
    pub bump_right: bool,
    pub wheel_drops: u8,
    pub cliff_left: bool,
    pub cliff_front_left: bool,
    pub cliff_front_right: bool,
    pub cliff_right: bool,
    pub wall: bool,
    pub play_button: bool,
    pub advance_button: bool,
    pub charging_state: u8,
    pub voltage_mv: u16,
    pub charge_mah: u16,
    pub capacity_mah: u16,
}

impl SensorState {
    pub fn bump_mask(&self) -> u8 {
        let mut mask = 0;
        if self.bump_left {
            mask |= MASK_LEFT;
        }
        if self.bump_right {
            mask |= MASK_RIGHT;
        }
        mask
    }

    pub fn cliff_mask(&self) -> u8 {
        let mut mask = 0;
        if self.cliff_left {
            mask |= MASK_LEFT;
        }
        if self.cliff_right {
            mask |= MASK_RIGHT;
        }
        if self.cliff_front_left {
            mask |= MASK_FRONT_LEFT;
        }
        if self.cliff_front_right {
            mask |= MASK_FRONT_RIGHT;
        }
        mask
    }

    pub fn battery_percent(&self) -> Option<u8> {
        if self.capacity_mah == 0 {
            return None;
        }
        let pct = u32::from(self.charge_mah) * 100 / u32::from(self.capacity_mah);
        Some(pct.min(100) as u8)
    }

    /// Charging states 1..=4 are the active charging phases.
    pub fn charging(&self) -> bool {
        (1..=4).contains(&self.charging_state)
    }
}

/// Rising edges of hazard sensors accumulated since the last `take_edges`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HazardEdges {
    pub bump: u8,
    pub cliff: u8,
    pub wheel_drop: u8,
}

impl HazardEdges {
    pub fn any(self) -> bool {
        self.bump != 0 || self.cliff != 0 || self.wheel_drop != 0
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TelemetryStats {
    pub frames: u32,
    pub checksum_errors: u32,
    pub length_errors: u32,
    pub layout_errors: u32,
    pub reconfigures: u32,
}

/// Decoder plus the cached sensor picture built from valid frames.
#[derive(Debug)]
pub struct ChassisTelemetry {
    decoder: FrameDecoder,
    state: SensorState,
    created_ms: u64,
    last_valid_ms: Option<u64>,
    last_reconfigure_ms: Option<u64>,
    edges: HazardEdges,
    play_latched: bool,
    advance_latched: bool,
    pending_distance_mm: i32,
    pending_angle_deg: i32,
    layout_errors: u32,
    reconfigures: u32,
}

impl ChassisTelemetry {
    pub fn new(now_ms: u64) -> Self {
        Self {
            decoder: FrameDecoder::new(),
            state: SensorState::default(),
            created_ms: now_ms,
            last_valid_ms: None,
            last_reconfigure_ms: None,
            edges: HazardEdges::default(),
            play_latched: false,
            advance_latched: false,
            pending_distance_mm: 0,
            pending_angle_deg: 0,
            layout_errors: 0,
            reconfigures: 0,
        }
    }

    /// Feed one chassis byte. Returns `true` when it completed a frame that
    /// updated the cache.
    pub fn push_byte(&mut self, byte: u8, now_ms: u64) -> bool {
        let Some(frame) = self.decoder.push_byte(byte) else {
            return false;
        };
        match frame.packets(&SENSOR_PACKETS) {
            Some(packets) => {
                self.apply(&packets);
                self.last_valid_ms = Some(now_ms);
                true
            }
            None => {
                self.layout_errors = self.layout_errors.saturating_add(1);
                debug!(len = frame.payload().len(), "frame payload matches no known layout");
                false
            }
        }
    }

    fn apply(&mut self, packets: &SensorPackets) {
        let before = self.state;
        let mut next = self.state;

        for &(id, value) in packets {
            let byte = value as u8;
            match id {
                PKT_BUMPS_WHEELDROPS => {
                    next.bump_right = byte & BUMP_RIGHT_BIT != 0;
                    next.bump_left = byte & BUMP_LEFT_BIT != 0;
                    next.wheel_drops = (byte & WHEELDROP_BITS) >> 2;
                }
                PKT_WALL => next.wall = byte != 0,
                PKT_CLIFF_LEFT => next.cliff_left = byte != 0,
                PKT_CLIFF_FRONT_LEFT => next.cliff_front_left = byte != 0,
                PKT_CLIFF_FRONT_RIGHT => next.cliff_front_right = byte != 0,
                PKT_CLIFF_RIGHT => next.cliff_right = byte != 0,
                PKT_BUTTONS => {
                    next.play_button = byte & BUTTON_PLAY_BIT != 0;
                    next.advance_button = byte & BUTTON_ADVANCE_BIT != 0;
                }
                PKT_DISTANCE => self.pending_distance_mm += value,
                PKT_ANGLE => self.pending_angle_deg += value,
                PKT_CHARGING_STATE => next.charging_state = byte,
                PKT_VOLTAGE => next.voltage_mv = value as u16,
                PKT_BATTERY_CHARGE => next.charge_mah = value as u16,
                PKT_BATTERY_CAPACITY => next.capacity_mah = value as u16,
                _ => {}
            }
        }

        self.edges.bump |= next.bump_mask() & !before.bump_mask();
        self.edges.cliff |= next.cliff_mask() & !before.cliff_mask();
        self.edges.wheel_drop |= next.wheel_drops & !before.wheel_drops;
        self.play_latched |= next.play_button && !before.play_button;
        self.advance_latched |= next.advance_button && !before.advance_button;

        self.state = next;
    }

    pub fn state(&self) -> &SensorState {
        &self.state
    }

    pub fn is_connected(&self, now_ms: u64) -> bool {
        self.last_valid_ms
            .is_some_and(|last| now_ms.saturating_sub(last) < CONNECTED_WINDOW_MS)
    }

    pub fn take_edges(&mut self) -> HazardEdges {
        core::mem::take(&mut self.edges)
    }

    /// Distance (mm) and angle (deg) reported since the last call.
    pub fn take_motion_delta(&mut self) -> (i32, i32) {
        let delta = (self.pending_distance_mm, self.pending_angle_deg);
        self.pending_distance_mm = 0;
        self.pending_angle_deg = 0;
        delta
    }

    pub fn take_play_pressed(&mut self) -> bool {
        core::mem::take(&mut self.play_latched)
    }

    pub fn take_advance_pressed(&mut self) -> bool {
        core::mem::take(&mut self.advance_latched)
    }

    /// Decide whether the stream should be reconfigured now. Fires after a run
    /// of checksum failures with no valid frame for the cooldown window, and
    /// at most once per cooldown.
    pub fn needs_reconfigure(&mut self, now_ms: u64) -> bool {
        if self.decoder.stats().consecutive_failures < RESYNC_FAILURE_THRESHOLD {
            return false;
        }
        let last_valid = self.last_valid_ms.unwrap_or(self.created_ms);
        if now_ms.saturating_sub(last_valid) < RESYNC_COOLDOWN_MS {
            return false;
        }
        if let Some(last) = self.last_reconfigure_ms {
            if now_ms.saturating_sub(last) < RESYNC_COOLDOWN_MS {
                return false;
            }
        }
        self.last_reconfigure_ms = Some(now_ms);
        self.reconfigures = self.reconfigures.saturating_add(1);
        warn!(
            failures = self.decoder.stats().consecutive_failures,
            "chassis stream desync, reconfiguring"
        );
        true
    }

    pub fn decoder_stats(&self) -> &DecoderStats {
        self.decoder.stats()
    }

    pub fn stats(&self) -> TelemetryStats {
        let decoder = self.decoder.stats();
        TelemetryStats {
            frames: decoder.frames,
            checksum_errors: decoder.checksum_errors,
            length_errors: decoder.length_errors,
            layout_errors: self.layout_errors,
            reconfigures: self.reconfigures,
        }
    }
}
