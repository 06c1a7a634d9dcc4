//! In-process chassis model speaking the same byte protocol as the real
//! hardware. Drives the daemon when no robot is attached and backs the
//! end-to-end tests.

use super::decoder::encode_frame;
use super::*;
use alloc::collections::VecDeque;
use core::convert::Infallible;

/// The real chassis streams every 15 ms.
pub const STREAM_PERIOD_MS: u64 = 15;
const RX_BACKLOG_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OiMode {
    Off,
    Passive,
    Safe,
    Full,
}

#[derive(Debug)]
pub struct SimulatedChassis {
    mode: OiMode,
    streaming: bool,
    stream_ids: heapless::Vec<u8, 16>,
    pending: heapless::Vec<u8, 32>,
    to_host: VecDeque<u8>,
    wheels: WheelSpeeds,
    last_advance_ms: Option<u64>,
    last_frame_ms: u64,
    distance_acc_mm: f32,
    angle_acc_deg: f32,

    // Sensor inputs set by the harness
    pub bumps: u8,
    pub wheel_drops: u8,
    pub cliffs: [bool; 4],
    pub wall: bool,
    pub buttons: u8,
    pub charging_state: u8,
    pub voltage_mv: u16,
    pub charge_mah: u16,
    pub capacity_mah: u16,

    corrupt_next: bool,
    drive_commands: u32,
}

impl SimulatedChassis {
    pub fn new() -> Self {
        Self {
            mode: OiMode::Off,
            streaming: false,
            stream_ids: heapless::Vec::new(),
            pending: heapless::Vec::new(),
            to_host: VecDeque::new(),
            wheels: WheelSpeeds::STOP,
            last_advance_ms: None,
            last_frame_ms: 0,
            distance_acc_mm: 0.0,
            angle_acc_deg: 0.0,
            bumps: 0,
            wheel_drops: 0,
            cliffs: [false; 4],
            wall: false,
            buttons: 0,
            charging_state: 0,
            voltage_mv: 16_200,
            charge_mah: 2_400,
            capacity_mah: 3_000,
            corrupt_next: false,
            drive_commands: 0,
        }
    }

    pub fn mode(&self) -> OiMode {
        self.mode
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn wheels(&self) -> WheelSpeeds {
        self.wheels
    }

    pub fn drive_commands(&self) -> u32 {
        self.drive_commands
    }

    /// Flip one payload byte of the next emitted frame.
    pub fn corrupt_next_frame(&mut self) {
        self.corrupt_next = true;
    }

    pub fn set_bumper(&mut self, left: bool, right: bool) {
        self.bumps = u8::from(right) | (u8::from(left) << 1);
    }

    /// Advance simulated time: integrate wheel motion and emit stream frames.
    pub fn advance(&mut self, now_ms: u64) {
        let dt_ms = self
            .last_advance_ms
            .map_or(0, |last| now_ms.saturating_sub(last));
        self.last_advance_ms = Some(now_ms);

        let dt = dt_ms as f32 / 1000.0;
        let right = f32::from(self.wheels.right_mm_s);
        let left = f32::from(self.wheels.left_mm_s);
        self.distance_acc_mm += (right + left) / 2.0 * dt;
        let wz = (right - left) / 1000.0 / TRACK_WIDTH_M;
        self.angle_acc_deg += wz.to_degrees() * dt;

        if self.streaming && now_ms.saturating_sub(self.last_frame_ms) >= STREAM_PERIOD_MS {
            self.last_frame_ms = now_ms;
            self.emit_frame();
        }
    }

    fn take_whole(acc: &mut f32) -> i16 {
        let whole = acc.trunc();
        *acc -= whole;
        whole as i16
    }

    fn emit_frame(&mut self) {
        let distance = Self::take_whole(&mut self.distance_acc_mm);
        let angle = Self::take_whole(&mut self.angle_acc_deg);

        let mut payload = alloc::vec::Vec::new();
        for &id in &self.stream_ids {
            payload.push(id);
            match id {
                PKT_BUMPS_WHEELDROPS => payload.push(self.bumps | (self.wheel_drops << 2)),
                PKT_WALL => payload.push(u8::from(self.wall)),
                PKT_CLIFF_LEFT => payload.push(u8::from(self.cliffs[0])),
                PKT_CLIFF_FRONT_LEFT => payload.push(u8::from(self.cliffs[1])),
                PKT_CLIFF_FRONT_RIGHT => payload.push(u8::from(self.cliffs[2])),
                PKT_CLIFF_RIGHT => payload.push(u8::from(self.cliffs[3])),
                PKT_BUTTONS => payload.push(self.buttons),
                PKT_DISTANCE => payload.extend_from_slice(&distance.to_be_bytes()),
                PKT_ANGLE => payload.extend_from_slice(&angle.to_be_bytes()),
                PKT_CHARGING_STATE => payload.push(self.charging_state),
                PKT_VOLTAGE => payload.extend_from_slice(&self.voltage_mv.to_be_bytes()),
                PKT_BATTERY_CHARGE => payload.extend_from_slice(&self.charge_mah.to_be_bytes()),
                PKT_BATTERY_CAPACITY => {
                    payload.extend_from_slice(&self.capacity_mah.to_be_bytes());
                }
                _ => {
                    payload.pop();
                }
            }
        }
        if payload.is_empty() {
            return;
        }

        let mut frame = encode_frame(&payload);
        if core::mem::take(&mut self.corrupt_next) {
            frame[2] ^= 0x5A;
        }
        if self.to_host.len() + frame.len() <= RX_BACKLOG_LIMIT {
            self.to_host.extend(frame);
        }
    }

    fn handle_byte(&mut self, byte: u8) {
        if self.pending.push(byte).is_err() {
            self.pending.clear();
            return;
        }
        let needed = match self.pending[0] {
            OI_START | OI_SAFE | OI_FULL => 1,
            OI_DRIVE_DIRECT => 5,
            OI_PAUSE_RESUME_STREAM => 2,
            OI_STREAM => match self.pending.get(1) {
                Some(&n) => 2 + usize::from(n),
                None => 2,
            },
            // Unknown opcode: drop it
            _ => {
                self.pending.clear();
                return;
            }
        };
        if self.pending.len() < needed {
            return;
        }

        let cmd = core::mem::take(&mut self.pending);
        match cmd[0] {
            OI_START => self.mode = OiMode::Passive,
            OI_SAFE if self.mode != OiMode::Off => self.mode = OiMode::Safe,
            OI_FULL if self.mode != OiMode::Off => self.mode = OiMode::Full,
            OI_DRIVE_DIRECT if matches!(self.mode, OiMode::Safe | OiMode::Full) => {
                self.wheels = WheelSpeeds {
                    right_mm_s: i16::from_be_bytes([cmd[1], cmd[2]]),
                    left_mm_s: i16::from_be_bytes([cmd[3], cmd[4]]),
                };
                self.drive_commands = self.drive_commands.wrapping_add(1);
            }
            OI_STREAM if self.mode != OiMode::Off => {
                self.stream_ids.clear();
                let _ = self.stream_ids.extend_from_slice(&cmd[2..]);
                self.streaming = true;
            }
            OI_PAUSE_RESUME_STREAM if self.mode != OiMode::Off => {
                self.streaming = cmd[1] != 0 && !self.stream_ids.is_empty();
            }
            _ => {}
        }
    }
}

impl Default for SimulatedChassis {
    fn default() -> Self {
        Self::new()
    }
}

impl ChassisPort for SimulatedChassis {
    type Error = Infallible;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.to_host.pop_front().ok_or(nb::Error::WouldBlock)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        for &b in bytes {
            self.handle_byte(b);
        }
        Ok(())
    }
}
