//! Chassis-facing binary interface.
//!
//! The chassis speaks an Open Interface style protocol: single-byte opcodes
//! followed by fixed-size big-endian arguments outbound, and checksummed
//! sensor stream frames inbound (see [`decoder`]).

pub mod decoder;
pub mod sensors;
pub mod sim;

pub use decoder::{Frame, FrameDecoder, SensorPackets};
pub use sensors::{ChassisTelemetry, HazardEdges, SensorState};
pub use sim::SimulatedChassis;

use heapless::Vec;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// Open Interface opcodes
pub const OI_START: u8 = 128;
pub const OI_SAFE: u8 = 131;
pub const OI_FULL: u8 = 132;
pub const OI_DRIVE_DIRECT: u8 = 145;
pub const OI_STREAM: u8 = 148;
pub const OI_PAUSE_RESUME_STREAM: u8 = 150;

// Sensor packet ids
pub const PKT_BUMPS_WHEELDROPS: u8 = 7;
pub const PKT_WALL: u8 = 8;
pub const PKT_CLIFF_LEFT: u8 = 9;
pub const PKT_CLIFF_FRONT_LEFT: u8 = 10;
pub const PKT_CLIFF_FRONT_RIGHT: u8 = 11;
pub const PKT_CLIFF_RIGHT: u8 = 12;
pub const PKT_BUTTONS: u8 = 18;
pub const PKT_DISTANCE: u8 = 19;
pub const PKT_ANGLE: u8 = 20;
pub const PKT_CHARGING_STATE: u8 = 21;
pub const PKT_VOLTAGE: u8 = 22;
pub const PKT_BATTERY_CHARGE: u8 = 25;
pub const PKT_BATTERY_CAPACITY: u8 = 26;

/// Packets declared in the stream configuration, in request order.
pub const SENSOR_PACKETS: [u8; 13] = [
    PKT_BUMPS_WHEELDROPS,
    PKT_WALL,
    PKT_CLIFF_LEFT,
    PKT_CLIFF_FRONT_LEFT,
    PKT_CLIFF_FRONT_RIGHT,
    PKT_CLIFF_RIGHT,
    PKT_BUTTONS,
    PKT_DISTANCE,
    PKT_ANGLE,
    PKT_CHARGING_STATE,
    PKT_VOLTAGE,
    PKT_BATTERY_CHARGE,
    PKT_BATTERY_CAPACITY,
];

/// Data bytes carried by a packet id, `None` for ids we never request.
pub const fn packet_size(id: u8) -> Option<usize> {
    match id {
        PKT_BUMPS_WHEELDROPS | PKT_WALL | PKT_CLIFF_LEFT | PKT_CLIFF_FRONT_LEFT
        | PKT_CLIFF_FRONT_RIGHT | PKT_CLIFF_RIGHT | PKT_BUTTONS | PKT_CHARGING_STATE => Some(1),
        PKT_DISTANCE | PKT_ANGLE | PKT_VOLTAGE | PKT_BATTERY_CHARGE | PKT_BATTERY_CAPACITY => {
            Some(2)
        }
        _ => None,
    }
}

/// Distance and angle are two's-complement; everything else is unsigned.
pub const fn packet_is_signed(id: u8) -> bool {
    matches!(id, PKT_DISTANCE | PKT_ANGLE)
}

/// Wheel base of the chassis, used to split a twist into wheel speeds.
pub const TRACK_WIDTH_M: f32 = 0.258;
pub const MAX_WHEEL_MM_S: i16 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WheelSpeeds {
    pub right_mm_s: i16,
    pub left_mm_s: i16,
}

impl WheelSpeeds {
    pub const STOP: WheelSpeeds = WheelSpeeds { right_mm_s: 0, left_mm_s: 0 };

    /// Differential-drive split of a body twist, clamped to the chassis limit.
    pub fn from_twist(vx_m_s: f32, wz_rad_s: f32) -> Self {
        let half = wz_rad_s * TRACK_WIDTH_M / 2.0;
        let to_mm = |v: f32| {
            let limit = f32::from(MAX_WHEEL_MM_S);
            (v * 1000.0).round().clamp(-limit, limit) as i16
        };
        Self {
            right_mm_s: to_mm(vx_m_s + half),
            left_mm_s: to_mm(vx_m_s - half),
        }
    }
}

pub fn encode_drive_direct(speeds: WheelSpeeds) -> [u8; 5] {
    let [rh, rl] = speeds.right_mm_s.to_be_bytes();
    let [lh, ll] = speeds.left_mm_s.to_be_bytes();
    [OI_DRIVE_DIRECT, rh, rl, lh, ll]
}

/// `STREAM n ids...` for the packets we decode.
pub fn encode_stream_request() -> Vec<u8, 16> {
    let mut cmd = Vec::new();
    let _ = cmd.push(OI_STREAM);
    let _ = cmd.push(SENSOR_PACKETS.len() as u8);
    let _ = cmd.extend_from_slice(&SENSOR_PACKETS);
    cmd
}

pub fn encode_stream_enable(enabled: bool) -> [u8; 2] {
    [OI_PAUSE_RESUME_STREAM, u8::from(enabled)]
}

/// Byte-level link to the chassis. Reads never block: `WouldBlock` means the
/// receive side is drained for now.
pub trait ChassisPort {
    type Error: core::fmt::Debug;

    fn read(&mut self) -> nb::Result<u8, Self::Error>;
    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;
}

/// A port shared between the control loop and an out-of-band writer such as
/// the loop watchdog. Each read or write holds the lock for that call only.
#[derive(Debug)]
pub struct SharedChassis<P> {
    inner: Arc<Mutex<P>>,
}

impl<P> SharedChassis<P> {
    pub fn new(port: P) -> Self {
        Self {
            inner: Arc::new(Mutex::new(port)),
        }
    }

    /// A writer that never blocks on the loop dying mid-call: a poisoned
    /// lock still hands out the port.
    pub fn lock(&self) -> MutexGuard<'_, P> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P> Clone for SharedChassis<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: ChassisPort> ChassisPort for SharedChassis<P> {
    type Error = P::Error;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.lock().read()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        self.lock().write(bytes)
    }
}

/// Take full control: START then FULL.
pub fn take_control<P: ChassisPort>(port: &mut P) -> Result<(), P::Error> {
    port.write(&[OI_START])?;
    port.write(&[OI_FULL])
}

/// The chassis drops back to passive after a power blip; FULL restores
/// drive authority without touching the stream.
pub fn reassert_full<P: ChassisPort>(port: &mut P) -> Result<(), P::Error> {
    port.write(&[OI_FULL])
}

/// Pause the stream, redeclare the packet list, resume. Used at bring-up and
/// to recover from a chassis-side desync.
pub fn configure_stream<P: ChassisPort>(port: &mut P) -> Result<(), P::Error> {
    port.write(&encode_stream_enable(false))?;
    port.write(&encode_stream_request())?;
    port.write(&encode_stream_enable(true))
}

pub fn drive<P: ChassisPort>(port: &mut P, speeds: WheelSpeeds) -> Result<(), P::Error> {
    port.write(&encode_drive_direct(speeds))
}

pub fn stop<P: ChassisPort>(port: &mut P) -> Result<(), P::Error> {
    drive(port, WheelSpeeds::STOP)
}
