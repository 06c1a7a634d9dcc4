#![allow(dead_code)]

use brainstem::chassis::decoder::encode_frame;
use brainstem::chassis::{ChassisPort, OI_DRIVE_DIRECT, SENSOR_PACKETS};
use brainstem::engine::Engine;
use brainstem::params::ParamSet;
use std::collections::VecDeque;
use std::convert::Infallible;

/// Chassis double: tests queue bytes for the engine to read and inspect
/// everything it wrote.
#[derive(Debug, Default)]
pub struct RecordingChassis {
    pub rx: VecDeque<u8>,
    pub written: Vec<u8>,
}

impl RecordingChassis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    pub fn queue_frame(&mut self, payload: &[u8]) {
        self.queue(&encode_frame(payload));
    }

    /// Right/left speeds of the most recent DRIVE_DIRECT written.
    pub fn last_drive(&self) -> Option<(i16, i16)> {
        let start = self.written.windows(5).rposition(|w| w[0] == OI_DRIVE_DIRECT)?;
        let cmd = &self.written[start..start + 5];
        Some((
            i16::from_be_bytes([cmd[1], cmd[2]]),
            i16::from_be_bytes([cmd[3], cmd[4]]),
        ))
    }
}

impl ChassisPort for RecordingChassis {
    type Error = Infallible;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        self.written.extend_from_slice(bytes);
        Ok(())
    }
}

/// Inputs for one sensor frame.
#[derive(Debug, Clone, Copy)]
pub struct Sensors {
    pub bumps_wheeldrops: u8,
    pub cliffs: [u8; 4],
    pub buttons: u8,
    pub distance_mm: i16,
    pub angle_deg: i16,
    pub charging_state: u8,
    pub voltage_mv: u16,
    pub charge_mah: u16,
    pub capacity_mah: u16,
}

impl Default for Sensors {
    fn default() -> Self {
        Self {
            bumps_wheeldrops: 0,
            cliffs: [0; 4],
            buttons: 0,
            distance_mm: 0,
            angle_deg: 0,
            charging_state: 0,
            voltage_mv: 15_000,
            charge_mah: 1_500,
            capacity_mah: 3_000,
        }
    }
}

impl Sensors {
    fn value_bytes(&self, id: u8) -> Vec<u8> {
        match id {
            7 => vec![self.bumps_wheeldrops],
            8 => vec![0],
            9..=12 => vec![self.cliffs[usize::from(id - 9)]],
            18 => vec![self.buttons],
            19 => self.distance_mm.to_be_bytes().to_vec(),
            20 => self.angle_deg.to_be_bytes().to_vec(),
            21 => vec![self.charging_state],
            22 => self.voltage_mv.to_be_bytes().to_vec(),
            25 => self.charge_mah.to_be_bytes().to_vec(),
            26 => self.capacity_mah.to_be_bytes().to_vec(),
            _ => Vec::new(),
        }
    }

    /// `id value` pairs for every requested packet, as the stream sends them.
    pub fn id_prefixed(&self) -> Vec<u8> {
        SENSOR_PACKETS
            .iter()
            .flat_map(|&id| std::iter::once(id).chain(self.value_bytes(id)))
            .collect()
    }

    /// Values only, in request order.
    pub fn values_only(&self) -> Vec<u8> {
        SENSOR_PACKETS.iter().flat_map(|&id| self.value_bytes(id)).collect()
    }
}

/// Strip the `,eid=<n>` suffix.
pub fn body(line: &str) -> &str {
    line.rsplit_once(",eid=").map_or(line, |(body, _)| body)
}

pub fn eid(line: &str) -> u32 {
    line.rsplit_once(",eid=")
        .and_then(|(_, eid)| eid.parse().ok())
        .expect("line carries an eid")
}

pub fn drain<C: ChassisPort>(engine: &mut Engine<C>) -> Vec<String> {
    engine.take_outbound().iter().map(|line| line.to_string()).collect()
}

pub fn bodies<C: ChassisPort>(engine: &mut Engine<C>) -> Vec<String> {
    drain(engine).iter().map(|line| body(line).to_string()).collect()
}

pub fn engine_with(params: ParamSet) -> Engine<RecordingChassis> {
    Engine::new(RecordingChassis::new(), params, 0).expect("engine starts")
}

/// An engine whose host link is already up (a PING at t=0), outbox drained.
pub fn linked_engine(params: ParamSet) -> Engine<RecordingChassis> {
    let mut engine = engine_with(params);
    engine.feed_host(b"PING,0\n", 0);
    engine.take_outbound();
    engine
}

pub fn send<C: ChassisPort>(engine: &mut Engine<C>, line: &str, now_ms: u64) {
    engine.feed_host(line.as_bytes(), now_ms);
    engine.feed_host(b"\n", now_ms);
}
