//! Sensor stream frame assembly.
//!
//! Frame shape: `HEADER LEN PAYLOAD[LEN] CHECKSUM`. A frame is valid when the
//! byte sum of the whole frame is `0x00` mod 256 (two's-complement checksum)
//! or `0xFF` (ones'-complement), since different chassis firmware revisions
//! emit one or the other.

use super::{packet_is_signed, packet_size, SENSOR_PACKETS};
use heapless::Vec;
use static_assertions::const_assert;

pub const STREAM_HEADER: u8 = 19;
pub const MAX_PAYLOAD: usize = 64;

/// Decoded `(packet id, value)` pairs from one frame.
pub type SensorPackets = Vec<(u8, i32), 16>;

const fn id_prefixed_len(ids: &[u8]) -> usize {
    let mut total = 0;
    let mut i = 0;
    while i < ids.len() {
        total += 1 + match packet_size(ids[i]) {
            Some(size) => size,
            None => 0,
        };
        i += 1;
    }
    total
}

const_assert!(id_prefixed_len(&SENSOR_PACKETS) <= MAX_PAYLOAD);
const_assert!(SENSOR_PACKETS.len() <= 16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitHeader,
    WaitLen,
    ReadPayload { len: u8 },
    WaitChecksum,
}

/// A checksum-valid frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Vec<u8, MAX_PAYLOAD>,
}

impl Frame {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Interpret the payload against the requested packet list.
    pub fn packets(&self, requested: &[u8]) -> Option<SensorPackets> {
        decode_packets(&self.payload, requested)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames: u32,
    pub checksum_errors: u32,
    pub length_errors: u32,
    /// Checksum failures since the last valid frame.
    pub consecutive_failures: u32,
}

#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    payload: Vec<u8, MAX_PAYLOAD>,
    sum: u8,
    stats: DecoderStats,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: State::WaitHeader,
            payload: Vec::new(),
            sum: 0,
            stats: DecoderStats::default(),
        }
    }

    /// Feed one byte. Returns a frame once its checksum byte verifies.
    pub fn push_byte(&mut self, byte: u8) -> Option<Frame> {
        match self.state {
            State::WaitHeader => {
                if byte == STREAM_HEADER {
                    self.sum = byte;
                    self.payload.clear();
                    self.state = State::WaitLen;
                }
                None
            }
            State::WaitLen => {
                if byte == 0 || usize::from(byte) > MAX_PAYLOAD {
                    self.stats.length_errors = self.stats.length_errors.saturating_add(1);
                    self.state = State::WaitHeader;
                    return None;
                }
                self.sum = self.sum.wrapping_add(byte);
                self.state = State::ReadPayload { len: byte };
                None
            }
            State::ReadPayload { len } => {
                self.sum = self.sum.wrapping_add(byte);
                // Capacity was checked against MAX_PAYLOAD on the length byte
                let _ = self.payload.push(byte);
                if self.payload.len() == usize::from(len) {
                    self.state = State::WaitChecksum;
                }
                None
            }
            State::WaitChecksum => {
                self.state = State::WaitHeader;
                let total = self.sum.wrapping_add(byte);
                if total == 0x00 || total == 0xFF {
                    self.stats.frames = self.stats.frames.wrapping_add(1);
                    self.stats.consecutive_failures = 0;
                    Some(Frame {
                        payload: core::mem::take(&mut self.payload),
                    })
                } else {
                    self.stats.checksum_errors = self.stats.checksum_errors.saturating_add(1);
                    self.stats.consecutive_failures =
                        self.stats.consecutive_failures.saturating_add(1);
                    self.payload.clear();
                    None
                }
            }
        }
    }

    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::WaitHeader
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn read_value(id: u8, bytes: &[u8]) -> i32 {
    match bytes {
        [b] => i32::from(*b),
        [hi, lo] if packet_is_signed(id) => i32::from(i16::from_be_bytes([*hi, *lo])),
        [hi, lo] => i32::from(u16::from_be_bytes([*hi, *lo])),
        _ => 0,
    }
}

/// Values only, in request order.
fn decode_values_only(payload: &[u8], requested: &[u8]) -> Option<SensorPackets> {
    let expected: usize = requested.iter().map(|&id| packet_size(id).unwrap_or(0)).sum();
    if payload.len() != expected {
        return None;
    }
    let mut out = SensorPackets::new();
    let mut at = 0;
    for &id in requested {
        let size = packet_size(id)?;
        out.push((id, read_value(id, &payload[at..at + size]))).ok()?;
        at += size;
    }
    Some(out)
}

/// `id value` pairs in request order.
fn decode_id_prefixed(payload: &[u8], requested: &[u8]) -> Option<SensorPackets> {
    if payload.len() != id_prefixed_len(requested) {
        return None;
    }
    let mut out = SensorPackets::new();
    let mut at = 0;
    for &id in requested {
        if payload[at] != id {
            return None;
        }
        let size = packet_size(id)?;
        out.push((id, read_value(id, &payload[at + 1..at + 1 + size]))).ok()?;
        at += 1 + size;
    }
    Some(out)
}

/// Any known `id value` pairs, in any order, covering the whole payload.
fn decode_generic_pairs(payload: &[u8]) -> Option<SensorPackets> {
    let mut out = SensorPackets::new();
    let mut at = 0;
    while at < payload.len() {
        let id = payload[at];
        let size = packet_size(id)?;
        let value = payload.get(at + 1..at + 1 + size)?;
        out.push((id, read_value(id, value))).ok()?;
        at += 1 + size;
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Try each supported payload layout in turn and take the first that fits.
pub fn decode_packets(payload: &[u8], requested: &[u8]) -> Option<SensorPackets> {
    decode_values_only(payload, requested)
        .or_else(|| decode_id_prefixed(payload, requested))
        .or_else(|| decode_generic_pairs(payload))
}

/// Build a frame around `payload` with a two's-complement checksum.
pub fn encode_frame(payload: &[u8]) -> alloc::vec::Vec<u8> {
    let mut frame = alloc::vec::Vec::with_capacity(payload.len() + 3);
    frame.push(STREAM_HEADER);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    let sum = frame.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    frame.push(sum.wrapping_neg());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(decoder: &mut FrameDecoder, bytes: &[u8]) -> alloc::vec::Vec<Frame> {
        bytes.iter().filter_map(|&b| decoder.push_byte(b)).collect()
    }

    #[test]
    fn test_twos_complement_frame_accepted() {
        let mut decoder = FrameDecoder::new();
        let frames = feed(&mut decoder, &encode_frame(&[7, 0x01]));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &[7, 0x01]);
    }

    #[test]
    fn test_ones_complement_frame_accepted() {
        let mut decoder = FrameDecoder::new();
        let mut frame = encode_frame(&[7, 0x02]);
        let last = frame.len() - 1;
        frame[last] = frame[last].wrapping_sub(1);
        assert_eq!(feed(&mut decoder, &frame).len(), 1);
        assert_eq!(decoder.stats().checksum_errors, 0);
    }

    #[test]
    fn test_zero_length_resyncs() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = alloc::vec![STREAM_HEADER, 0];
        bytes.extend(encode_frame(&[8, 1]));
        let frames = feed(&mut decoder, &bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.stats().length_errors, 1);
    }

    #[test]
    fn test_signed_distance_decoded() {
        let packets = decode_packets(&[19, 0xFF, 0xF6], &[19]).unwrap();
        assert_eq!(packets[0], (19, -10));
    }
}
