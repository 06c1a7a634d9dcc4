mod common;

use brainstem::chassis::decoder::*;
use brainstem::chassis::sensors::*;
use brainstem::chassis::*;
use common::*;

fn feed(telemetry: &mut ChassisTelemetry, bytes: &[u8], now_ms: u64) -> usize {
    bytes
        .iter()
        .filter(|&&b| telemetry.push_byte(b, now_ms))
        .count()
}

fn bumped_left() -> Sensors {
    Sensors {
        bumps_wheeldrops: 0x02,
        ..Sensors::default()
    }
}

fn bumped_right() -> Sensors {
    Sensors {
        bumps_wheeldrops: 0x01,
        ..Sensors::default()
    }
}

#[test]
fn test_corrupted_byte_leaves_cache_untouched() {
    let mut telemetry = ChassisTelemetry::new(0);
    assert_eq!(feed(&mut telemetry, &encode_frame(&bumped_left().id_prefixed()), 10), 1);
    let cached = *telemetry.state();
    assert!(cached.bump_left);
    assert!(!cached.bump_right);

    // bumps byte 0x01 -> 0x03 shifts the sum by two, so neither checksum
    // convention accepts it
    let good = encode_frame(&bumped_right().id_prefixed());
    let mut corrupted = good.clone();
    corrupted[3] ^= 0x02;
    assert_eq!(feed(&mut telemetry, &corrupted, 20), 0);
    assert_eq!(*telemetry.state(), cached);
    assert_eq!(telemetry.stats().checksum_errors, 1);

    assert_eq!(feed(&mut telemetry, &good, 30), 1);
    assert!(telemetry.state().bump_right);
    assert!(!telemetry.state().bump_left);
    assert_eq!(telemetry.stats().checksum_errors, 1);
}

#[test]
fn test_frame_right_after_a_bad_one_is_not_lost() {
    let mut decoder = FrameDecoder::new();
    let mut bad = encode_frame(&[7, 0x01]);
    bad[3] = bad[3].wrapping_add(7);
    let mut stream = bad;
    stream.extend(encode_frame(&[7, 0x02]));

    let frames: Vec<Frame> = stream.iter().filter_map(|&b| decoder.push_byte(b)).collect();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].payload(), &[7, 0x02]);
    assert_eq!(decoder.stats().checksum_errors, 1);
    assert_eq!(decoder.stats().consecutive_failures, 0);
}

#[test]
fn test_garbage_between_frames_is_skipped() {
    let mut decoder = FrameDecoder::new();
    let mut stream = vec![0x00, 0xAA, 0x55];
    stream.extend(encode_frame(&[8, 1]));
    stream.extend([0x42, 0x99]);
    stream.extend(encode_frame(&[8, 0]));

    let frames: Vec<Frame> = stream.iter().filter_map(|&b| decoder.push_byte(b)).collect();
    assert_eq!(frames.len(), 2);
    assert!(decoder.is_idle());
}

#[test]
fn test_oversized_length_rejected() {
    let mut decoder = FrameDecoder::new();
    let mut stream = vec![STREAM_HEADER, (MAX_PAYLOAD + 1) as u8];
    stream.extend(encode_frame(&[8, 1]));
    let frames: Vec<Frame> = stream.iter().filter_map(|&b| decoder.push_byte(b)).collect();
    assert_eq!(frames.len(), 1);
    assert_eq!(decoder.stats().length_errors, 1);
}

#[test]
fn test_all_payload_layouts_decode() {
    let sensors = Sensors {
        bumps_wheeldrops: 0x03,
        distance_mm: -42,
        angle_deg: 15,
        voltage_mv: 14_400,
        ..Sensors::default()
    };

    let values = decode_packets(&sensors.values_only(), &SENSOR_PACKETS).unwrap();
    let prefixed = decode_packets(&sensors.id_prefixed(), &SENSOR_PACKETS).unwrap();
    assert_eq!(values, prefixed);
    assert!(values.contains(&(PKT_DISTANCE, -42)));
    assert!(values.contains(&(PKT_ANGLE, 15)));
    assert!(values.contains(&(PKT_VOLTAGE, 14_400)));

    // Generic pairs: any subset, any order
    let generic = decode_packets(&[22, 0x38, 0x40, 7, 0x01], &SENSOR_PACKETS).unwrap();
    assert_eq!(generic.as_slice(), &[(22u8, 14_400i32), (7, 1)]);

    // Unknown id in generic form
    assert!(decode_packets(&[99, 1], &SENSOR_PACKETS).is_none());
}

#[test]
fn test_values_only_frame_updates_cache() {
    let mut telemetry = ChassisTelemetry::new(0);
    let sensors = Sensors {
        cliffs: [1, 0, 0, 1],
        charging_state: 2,
        charge_mah: 2_250,
        capacity_mah: 3_000,
        ..Sensors::default()
    };
    assert_eq!(feed(&mut telemetry, &encode_frame(&sensors.values_only()), 5), 1);

    let state = telemetry.state();
    assert_eq!(state.cliff_mask(), MASK_LEFT | MASK_RIGHT);
    assert_eq!(state.battery_percent(), Some(75));
    assert!(state.charging());
}

#[test]
fn test_hazard_edges_and_button_latches() {
    let mut telemetry = ChassisTelemetry::new(0);
    let pressed = Sensors {
        bumps_wheeldrops: 0x02 | 0x04,
        buttons: 0x01,
        ..Sensors::default()
    };
    feed(&mut telemetry, &encode_frame(&pressed.id_prefixed()), 10);
    feed(&mut telemetry, &encode_frame(&pressed.id_prefixed()), 25);

    // Held sensors produce a single rising edge
    let edges = telemetry.take_edges();
    assert_eq!(edges.bump, MASK_LEFT);
    assert_eq!(edges.wheel_drop, 0x01);
    assert!(!telemetry.take_edges().any());

    assert!(telemetry.take_play_pressed());
    assert!(!telemetry.take_play_pressed());
    assert!(!telemetry.take_advance_pressed());
}

#[test]
fn test_motion_deltas_accumulate_until_taken() {
    let mut telemetry = ChassisTelemetry::new(0);
    for _ in 0..3 {
        let moving = Sensors {
            distance_mm: 10,
            angle_deg: -2,
            ..Sensors::default()
        };
        feed(&mut telemetry, &encode_frame(&moving.id_prefixed()), 10);
    }
    assert_eq!(telemetry.take_motion_delta(), (30, -6));
    assert_eq!(telemetry.take_motion_delta(), (0, 0));
}

#[test]
fn test_liveness_window() {
    let mut telemetry = ChassisTelemetry::new(0);
    assert!(!telemetry.is_connected(0));
    feed(&mut telemetry, &encode_frame(&Sensors::default().id_prefixed()), 1_000);
    assert!(telemetry.is_connected(1_000));
    assert!(telemetry.is_connected(2_999));
    assert!(!telemetry.is_connected(3_000));
}

#[test]
fn test_reconfigure_after_sustained_desync() {
    let mut telemetry = ChassisTelemetry::new(0);
    let mut bad = encode_frame(&[7, 0]);
    let last = bad.len() - 1;
    bad[last] = bad[last].wrapping_add(5);
    for _ in 0..RESYNC_FAILURE_THRESHOLD {
        feed(&mut telemetry, &bad, 100);
    }

    // Failures alone are not enough inside the cooldown
    assert!(!telemetry.needs_reconfigure(500));
    assert!(telemetry.needs_reconfigure(1_000));
    // Rate limited
    assert!(!telemetry.needs_reconfigure(1_500));
    assert!(telemetry.needs_reconfigure(2_000));
    assert_eq!(telemetry.stats().reconfigures, 2);

    // A good frame clears the failure run
    feed(&mut telemetry, &encode_frame(&Sensors::default().id_prefixed()), 2_100);
    assert!(!telemetry.needs_reconfigure(5_000));
}

#[test]
fn test_engine_reissues_stream_handshake_on_desync() {
    let mut engine = engine_with(Default::default());
    let bring_up = engine.chassis().written.len();

    let mut bad = encode_frame(&[7, 0]);
    let last = bad.len() - 1;
    bad[last] ^= 0x10;
    for _ in 0..RESYNC_FAILURE_THRESHOLD {
        engine.chassis_mut().queue(&bad);
    }
    let mut now = 20;
    while now <= 1_200 {
        engine.tick(now);
        now += 20;
    }

    let written = &engine.chassis().written[bring_up..];
    let mut handshake = encode_stream_enable(false).to_vec();
    handshake.extend(encode_stream_request());
    handshake.extend(encode_stream_enable(true));
    let found = written.windows(handshake.len()).filter(|w| *w == handshake.as_slice()).count();
    assert_eq!(found, 1);
    assert_eq!(engine.telemetry().stats().reconfigures, 1);
}
