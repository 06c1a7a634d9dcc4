mod common;

use brainstem::params::{ParamKey, ParamSet};
use brainstem::protocol::*;
use common::*;

#[test]
fn test_set_then_get_round_trips_every_key() {
    let mut engine = linked_engine(ParamSet::default());
    let cases = [
        ("soft_stop_m", "0.45"),
        ("hard_stop_m", "0.05"),
        ("watchdog_ms", "750"),
        ("odom_hz", "5"),
        ("slew_v", "1.5"),
        ("slew_w", "3"),
        ("tx_bytes_per_s", "2000"),
        ("max_line_len", "128"),
        ("log_level", "3"),
    ];

    for (key, value) in cases {
        send(&mut engine, &format!("SET,{},{}", key, value), 10);
        assert_eq!(bodies(&mut engine), vec![format!("ACK,{},{}", key, value)]);

        send(&mut engine, &format!("GET,{}", key), 10);
        assert_eq!(bodies(&mut engine), vec![format!("ACK,{},{}", key, value)]);
    }
    assert_eq!(engine.params().watchdog_ms, 750);
    assert_eq!(engine.params().max_line_len(), 128);
}

#[test]
fn test_set_rejections() {
    let mut engine = linked_engine(ParamSet::default());

    send(&mut engine, "SET,warp_factor,9", 10);
    assert_eq!(bodies(&mut engine), vec!["ERR,param,warp_factor"]);

    send(&mut engine, "GET,warp_factor", 10);
    assert_eq!(bodies(&mut engine), vec!["ERR,param,warp_factor"]);

    send(&mut engine, "SET,odom_hz,fast", 10);
    assert_eq!(bodies(&mut engine), vec!["ERR,parse,num"]);

    send(&mut engine, "SET,watchdog_ms,5", 10);
    assert_eq!(bodies(&mut engine), vec!["ERR,param,watchdog_ms"]);

    // Nothing changed
    assert_eq!(engine.params(), &ParamSet::default());
}

#[test]
fn test_malformed_lines_get_one_error_each() {
    let mut engine = linked_engine(ParamSet::default());

    send(&mut engine, "FOO,1", 10);
    assert_eq!(bodies(&mut engine), vec!["ERR,cmd,FOO"]);

    send(&mut engine, "TWIST,0.1,0.2", 10);
    assert_eq!(bodies(&mut engine), vec!["ERR,parse,arity"]);

    send(&mut engine, "PING,abc", 10);
    assert_eq!(bodies(&mut engine), vec!["ERR,parse,num"]);

    send(&mut engine, "PING", 10);
    assert_eq!(bodies(&mut engine), vec!["ERR,parse,arity"]);

    send(&mut engine, "RANGE,-1,2", 10);
    assert_eq!(bodies(&mut engine), vec!["ERR,parse,num"]);

    send(&mut engine, "STATS,now", 10);
    assert_eq!(bodies(&mut engine), vec!["ERR,parse,arity"]);

    assert_eq!(engine.protocol_stats().parse_errors, 6);
}

#[test]
fn test_checksum_validated_when_present() {
    let mut engine = linked_engine(ParamSet::default());

    send(&mut engine, &append_checksum("PING,9"), 10);
    assert_eq!(bodies(&mut engine), vec!["PONG,9"]);

    let good = xor_checksum(b"PING,9");
    send(&mut engine, &format!("PING,9*{:02X}", good ^ 0x01), 10);
    assert_eq!(bodies(&mut engine), vec!["ERR,crc"]);
    assert_eq!(engine.protocol_stats().crc_errors, 1);

    // A malformed suffix is a checksum failure too
    send(&mut engine, "PING,9*Z", 10);
    assert_eq!(bodies(&mut engine), vec!["ERR,crc"]);
}

#[test]
fn test_overflowing_line_never_reaches_dispatcher() {
    let mut params = ParamSet::default();
    params.max_line_len = 32;
    let mut engine = linked_engine(params);

    // Would be a valid PING if it were dispatched
    let long = format!("PING,{}", "1".repeat(40));
    send(&mut engine, &long, 10);
    assert_eq!(bodies(&mut engine), vec!["ERR,parse,overflow"]);
    assert_eq!(engine.protocol_stats().overflows, 1);

    // The assembler recovers on the next terminator
    send(&mut engine, "PING,5", 20);
    assert_eq!(bodies(&mut engine), vec!["PONG,5"]);
    assert_eq!(engine.protocol_stats().overflows, 1);
}

#[test]
fn test_split_and_batched_lines() {
    let mut engine = linked_engine(ParamSet::default());
    engine.feed_host(b"PI", 10);
    engine.feed_host(b"NG,1\r\nPING,2\nPING,3\r", 10);
    assert_eq!(bodies(&mut engine), vec!["PONG,1", "PONG,2", "PONG,3"]);
}

#[test]
fn test_get_event_replays_or_reports_missing() {
    let mut engine = linked_engine(ParamSet::default());
    send(&mut engine, "PING,77", 10);
    let pong = drain(&mut engine).remove(0);
    let pong_eid = eid(&pong);

    send(&mut engine, &format!("GET,evt,{}", pong_eid), 20);
    assert_eq!(drain(&mut engine), vec![pong]);

    send(&mut engine, "GET,evt,999999", 30);
    assert_eq!(bodies(&mut engine), vec!["ERR,evt,missing"]);
}

#[test]
fn test_led_pause_resume() {
    let mut engine = linked_engine(ParamSet::default());

    send(&mut engine, "LED,5", 10);
    assert_eq!(bodies(&mut engine), vec!["ACK,led,5"]);
    assert_eq!(engine.led_mask(), 5);

    send(&mut engine, "LED,300", 10);
    assert_eq!(bodies(&mut engine), vec!["ERR,parse,num"]);

    // Silent effects
    send(&mut engine, "PAUSE", 10);
    assert!(drain(&mut engine).is_empty());
    assert!(engine.outbound().is_paused());

    send(&mut engine, "RESUME", 10);
    assert!(drain(&mut engine).is_empty());
    assert!(!engine.outbound().is_paused());
}

#[test]
fn test_stats_reports_counters() {
    let mut engine = linked_engine(ParamSet::default());
    send(&mut engine, "PING,1*00", 10);
    engine.take_outbound();

    send(&mut engine, "STATS", 20);
    let stats = bodies(&mut engine).remove(0);
    let last_eid = engine.outbound().last_eid();
    assert_eq!(
        stats,
        format!(
            "STATS,drops=0,paused=0,overflows=0,crc=1,frame_errs=0,eid={}",
            last_eid - 1
        )
    );
}

#[test]
fn test_parse_line_grammar() {
    assert_eq!(
        parse_line("TWIST,0.25,-1.5,42"),
        Ok(Command::Twist { vx: 0.25, wz: -1.5, seq: 42 })
    );
    assert_eq!(parse_line("SAFE,0"), Ok(Command::Safe { enabled: false }));
    assert_eq!(parse_line("SAFE,2"), Err(ParseError::Number));
    assert_eq!(parse_line("RANGE,0.5,3"), Ok(Command::Range { meters: 0.5, id: 3 }));
    assert_eq!(
        parse_line("GET,evt,12"),
        Ok(Command::Get(GetTarget::Event(12)))
    );
    assert_eq!(
        parse_line("GET,slew_v"),
        Ok(Command::Get(GetTarget::Param(ParamKey::SlewV)))
    );
    assert_eq!(parse_line("REPLAY,7"), Ok(Command::Replay { since_eid: 7 }));
    assert_eq!(parse_line("TWIST,nan,0,1"), Err(ParseError::Number));
    assert_eq!(parse_line("PING,1\u{e9}"), Err(ParseError::Ascii));
}

#[test]
fn test_non_ascii_bytes_rejected_on_the_wire() {
    let mut engine = linked_engine(ParamSet::default());
    engine.feed_host(b"PING,\xff1\n", 10);
    assert_eq!(bodies(&mut engine), vec!["ERR,parse,ascii"]);
}

#[test]
fn test_non_ascii_bytes_count_once_toward_line_cap() {
    let mut engine = linked_engine(ParamSet::default());
    send(&mut engine, "SET,max_line_len,16", 5);
    bodies(&mut engine);

    // 11 bytes before the terminator, under the 16 byte cap
    engine.feed_host(b"PING,\xe9\xe9\xe9\xe9\xe91\n", 10);
    assert_eq!(bodies(&mut engine), vec!["ERR,parse,ascii"]);
    assert_eq!(engine.protocol_stats().overflows, 0);
}
