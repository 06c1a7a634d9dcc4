//! The single owned control context.
//!
//! `Engine` holds every piece of mutable state: parameters, the host protocol
//! engine, the outbound scheduler, the chassis link and its sensor cache, and
//! the motion arbiter. Host bytes go in through [`Engine::feed_host`], time
//! advances through [`Engine::tick`], and host-bound lines come out of
//! [`Engine::take_outbound`]. Within a tick, chassis input is handled before
//! arbitration, and arbitration before telemetry publication.

use crate::chassis::sensors::{MASK_LEFT, MASK_RIGHT};
use crate::chassis::{self, ChassisPort, ChassisTelemetry, HazardEdges, SensorState, WheelSpeeds};
use crate::isr::BumperFlag;
use crate::motion::{MotionArbiter, MotionState, Twist};
use crate::odometry::Odometry;
use crate::outbound::{EdgePublisher, OutboundScheduler, Priority};
use crate::params::{ParamError, ParamKey, ParamSet, ParamValue};
use crate::protocol::{Command, GetTarget, OutLine, ProtocolEngine, ProtocolStats};
use crate::watchdog::LoopHeartbeat;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt::{self, Write};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const PROTO_VERSION: &str = "1.0";
pub const BUILD: &str = match option_env!("BRAINSTEM_BUILD") {
    Some(build) => build,
    None => env!("CARGO_PKG_VERSION"),
};

/// Host silence after which ownership reverts to the autonomous behavior.
pub const HOST_SILENCE_MS: u64 = 2000;
/// A gap between ticks longer than this forces a hardware stop, from the
/// next tick or from the out-of-band watchdog, whichever runs first.
pub const LOOP_STALL_MS: u64 = 100;
pub const DEFAULT_TICK_MS: u64 = 20;
pub const TIME_PERIOD_MS: u64 = 1000;
pub const BAT_PERIOD_MS: u64 = 5000;
const MAX_CHASSIS_BYTES_PER_TICK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Autonomous,
    Forebrain,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Autonomous => "AUTONOMOUS",
            Mode::Forebrain => "FOREBRAIN",
        }
    }
}

/// Fallback driver used while no host owns the link. Its output goes through
/// the same arbitration as host twists.
pub trait AutonomousBehavior {
    /// A host took over: stop polling sensors.
    fn suspend(&mut self) {}
    /// The host went away.
    fn resume(&mut self, _now_ms: u64) {}
    fn step(&mut self, now_ms: u64, sensors: &SensorState) -> Twist;
}

/// Sits still. The default until a real behavior is plugged in.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stationary;

impl AutonomousBehavior for Stationary {
    fn step(&mut self, _now_ms: u64, _sensors: &SensorState) -> Twist {
        Twist::ZERO
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid parameters: {0}")]
    Params(#[from] ParamError),
    #[error("chassis bring-up failed: {0}")]
    Chassis(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub ticks: u64,
    pub loop_stalls: u32,
    pub hazards: u32,
    pub chassis_write_errors: u32,
    pub chassis_read_errors: u32,
    pub mode_changes: u32,
}

pub struct Engine<C: ChassisPort> {
    params: ParamSet,
    protocol: ProtocolEngine,
    outbound: OutboundScheduler,
    chassis: C,
    telemetry: ChassisTelemetry,
    motion: MotionArbiter,
    odometry: Odometry,
    autonomy: Box<dyn AutonomousBehavior + Send>,
    external_bumper: Option<&'static BumperFlag>,
    heartbeat: Option<Arc<LoopHeartbeat>>,

    mode: Mode,
    last_host_byte_ms: Option<u64>,
    last_tick_ms: Option<u64>,
    chassis_was_connected: bool,
    state_edge: EdgePublisher<MotionState>,

    next_odom_ms: u64,
    next_time_ms: u64,
    next_bat_ms: u64,
    seq: u32,
    odom_seq: u32,
    led_mask: u8,
    stats: EngineStats,
}

impl<C: ChassisPort> Engine<C> {
    /// Validate `params` and bring the chassis up: START, FULL, then the
    /// sensor stream declaration.
    pub fn new(mut port: C, params: ParamSet, now_ms: u64) -> Result<Self, EngineError> {
        params.validate()?;
        chassis::take_control(&mut port)
            .and_then(|()| chassis::configure_stream(&mut port))
            .map_err(|e| EngineError::Chassis(alloc::format!("{:?}", e)))?;
        info!(build = BUILD, "brainstem up, chassis configured");

        Ok(Self {
            outbound: OutboundScheduler::new(params.tx_bytes_per_s, now_ms),
            params,
            protocol: ProtocolEngine::new(),
            chassis: port,
            telemetry: ChassisTelemetry::new(now_ms),
            motion: MotionArbiter::new(),
            odometry: Odometry::new(),
            autonomy: Box::new(Stationary),
            external_bumper: None,
            heartbeat: None,
            mode: Mode::Autonomous,
            last_host_byte_ms: None,
            last_tick_ms: None,
            chassis_was_connected: false,
            state_edge: EdgePublisher::new(),
            next_odom_ms: now_ms,
            next_time_ms: now_ms,
            next_bat_ms: now_ms,
            seq: 0,
            odom_seq: 0,
            led_mask: 0,
            stats: EngineStats::default(),
        })
    }

    pub fn with_autonomy(mut self, behavior: impl AutonomousBehavior + Send + 'static) -> Self {
        self.autonomy = Box::new(behavior);
        self
    }

    /// Wire up the flag set by the external bumper interrupt.
    pub fn with_external_bumper(mut self, flag: &'static BumperFlag) -> Self {
        self.external_bumper = Some(flag);
        self
    }

    /// Stamp `heartbeat` at the end of every tick for an out-of-band watchdog.
    pub fn with_heartbeat(mut self, heartbeat: Arc<LoopHeartbeat>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    // ---- host input ----

    /// Feed raw bytes received from the host.
    pub fn feed_host(&mut self, bytes: &[u8], now_ms: u64) {
        for &byte in bytes {
            self.last_host_byte_ms = Some(now_ms);
            let Some(result) = self.protocol.push_byte(byte, self.params.max_line_len()) else {
                continue;
            };
            match result {
                Ok(command) => {
                    if self.mode == Mode::Autonomous {
                        self.enter_forebrain(now_ms);
                    }
                    self.dispatch(command, now_ms);
                }
                Err(err) => {
                    debug!(%err, "rejected host line");
                    let reply = err.reply();
                    self.outbound.send(Priority::P0, &reply, now_ms);
                }
            }
        }
    }

    fn dispatch(&mut self, command: Command, now_ms: u64) {
        match command {
            Command::Twist { vx, wz, seq } => {
                self.motion.set_twist(vx, wz, seq, now_ms);
            }
            Command::Safe { enabled } => {
                if self.motion.set_safe(enabled) {
                    let estop = self.motion.estop_active();
                    if estop {
                        self.stop_chassis();
                    }
                    warn!(estop, "e-stop changed by host");
                    let seq = self.next_seq();
                    self.publish(Priority::P0, now_ms, format_args!("ESTOP,{},{}", u8::from(estop), seq));
                }
                self.publish(Priority::P0, now_ms, format_args!("ACK,safe,{}", u8::from(enabled)));
            }
            Command::Ping { seq } => {
                self.publish(Priority::P0, now_ms, format_args!("PONG,{}", seq));
            }
            Command::Range { meters, id } => {
                if let Some(min) = self.motion.update_range(meters, id, now_ms) {
                    let seq = self.next_seq();
                    self.publish(
                        Priority::P1,
                        now_ms,
                        format_args!("RGMIN,{:.3},{},{}", min.meters, min.id, seq),
                    );
                }
            }
            Command::Set { key, value } => self.handle_set(key, value, now_ms),
            Command::Get(GetTarget::Param(key)) => {
                let value = self.params.get(key);
                self.publish(Priority::P0, now_ms, format_args!("ACK,{},{}", key, value));
            }
            Command::Get(GetTarget::Event(eid)) => {
                if !self.outbound.replay_one(eid) {
                    self.publish(Priority::P0, now_ms, format_args!("ERR,evt,missing"));
                }
            }
            Command::Led { mask } => {
                self.led_mask = mask;
                self.publish(Priority::P0, now_ms, format_args!("ACK,led,{}", mask));
            }
            Command::Pause => self.outbound.pause(),
            Command::Resume => self.outbound.resume(),
            Command::Replay { since_eid } => {
                let count = self.outbound.replay_since(since_eid);
                debug!(since_eid, count, "replay");
            }
            Command::Stats => {
                let out = *self.outbound.stats();
                let frames = self.telemetry.stats();
                let proto = *self.protocol.stats();
                let eid = self.outbound.last_eid();
                self.publish(
                    Priority::P0,
                    now_ms,
                    format_args!(
                        "STATS,drops={},paused={},overflows={},crc={},frame_errs={},eid={}",
                        out.dropped,
                        out.suppressed_paused,
                        proto.overflows,
                        proto.crc_errors,
                        frames.checksum_errors.saturating_add(frames.length_errors),
                        eid
                    ),
                );
            }
        }
    }

    fn handle_set(&mut self, key: ParamKey, value: ParamValue, now_ms: u64) {
        match self.params.set(key, value) {
            Ok(stored) => {
                match key {
                    ParamKey::TxBytesPerS => self.outbound.set_rate(self.params.tx_bytes_per_s, now_ms),
                    ParamKey::OdomHz => self.next_odom_ms = now_ms,
                    _ => {}
                }
                info!(%key, %stored, "parameter updated");
                self.publish(Priority::P0, now_ms, format_args!("ACK,{},{}", key, stored));
            }
            Err(err) => {
                let reply = crate::protocol::ParseError::from(err).reply();
                self.outbound.send(Priority::P0, &reply, now_ms);
            }
        }
    }

    // ---- control loop ----

    /// Run one control tick at `now_ms`.
    pub fn tick(&mut self, now_ms: u64) {
        self.stats.ticks += 1;

        let gap = self
            .last_tick_ms
            .map_or(DEFAULT_TICK_MS, |last| now_ms.saturating_sub(last));
        self.last_tick_ms = Some(now_ms);
        if gap > LOOP_STALL_MS {
            self.stats.loop_stalls = self.stats.loop_stalls.saturating_add(1);
            warn!(gap_ms = gap, "control loop stalled, forcing stop");
            self.motion.zero_actual();
            self.stop_chassis();
        }
        let dt_s = gap.min(LOOP_STALL_MS) as f32 / 1000.0;

        // Chassis input and hazards
        let external_bump = self.external_bumper.is_some_and(|flag| flag.take());
        self.drain_chassis(now_ms);
        let (distance_mm, angle_deg) = self.telemetry.take_motion_delta();
        self.odometry.integrate(distance_mm, angle_deg);
        let mut edges = self.telemetry.take_edges();
        if external_bump {
            edges.bump |= MASK_LEFT | MASK_RIGHT;
        }
        self.handle_hazards(edges, now_ms);
        if self.telemetry.take_play_pressed() {
            info!("play button pressed");
        }
        if self.telemetry.take_advance_pressed() {
            info!("advance button pressed");
        }

        let reverted = self.update_mode(now_ms);
        self.maintain_chassis_link(now_ms);

        // Arbitration. The tick that hands the link back to the behavior
        // commands zero; the behavior drives from the next one.
        let fallback = match self.mode {
            Mode::Autonomous if !reverted => self.autonomy.step(now_ms, self.telemetry.state()),
            Mode::Autonomous | Mode::Forebrain => Twist::ZERO,
        };
        let actions = self.motion.tick(now_ms, dt_s, &self.params, fallback);
        if let Some(since) = actions.went_stale {
            self.publish(Priority::P0, now_ms, format_args!("STALE,twist,{}", since));
        }
        if let Some(reading) = actions.range_startle {
            warn!(meters = reading.meters, id = reading.id, "range below hard stop");
            let seq = self.next_seq();
            self.publish(Priority::P0, now_ms, format_args!("STARTLE,range_min,0,{}", seq));
        }

        let actual = self.motion.actual();
        let speeds = WheelSpeeds::from_twist(actual.vx, actual.wz);
        if let Err(e) = chassis::drive(&mut self.chassis, speeds) {
            self.note_write_error(&e);
        }

        self.publish_telemetry(now_ms);
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.beat(now_ms);
        }
    }

    fn drain_chassis(&mut self, now_ms: u64) {
        for _ in 0..MAX_CHASSIS_BYTES_PER_TICK {
            match self.chassis.read() {
                Ok(byte) => {
                    self.telemetry.push_byte(byte, now_ms);
                }
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => {
                    self.stats.chassis_read_errors = self.stats.chassis_read_errors.saturating_add(1);
                    warn!(error = ?e, "chassis read failed");
                    break;
                }
            }
        }
    }

    fn handle_hazards(&mut self, edges: HazardEdges, now_ms: u64) {
        if !edges.any() {
            return;
        }
        self.stats.hazards = self.stats.hazards.saturating_add(1);
        self.motion.recoil(now_ms);
        self.stop_chassis();

        if edges.bump != 0 {
            let seq = self.next_seq();
            self.publish(Priority::P0, now_ms, format_args!("BUMP,1,{},{}", edges.bump, seq));
            self.publish(Priority::P0, now_ms, format_args!("STARTLE,bump,{},{}", edges.bump, seq));
        }
        if edges.cliff != 0 {
            let seq = self.next_seq();
            self.publish(Priority::P0, now_ms, format_args!("CLIFF,1,{},{}", edges.cliff, seq));
            self.publish(Priority::P0, now_ms, format_args!("STARTLE,cliff,{},{}", edges.cliff, seq));
        }
        if edges.wheel_drop != 0 {
            let seq = self.next_seq();
            self.publish(
                Priority::P0,
                now_ms,
                format_args!("STARTLE,wheeldrop,{},{}", edges.wheel_drop, seq),
            );
        }
        warn!(bump = edges.bump, cliff = edges.cliff, wheel_drop = edges.wheel_drop, "hazard, recoiling");
    }

    /// Returns `true` on the tick that reverts to AUTONOMOUS.
    fn update_mode(&mut self, now_ms: u64) -> bool {
        if self.mode != Mode::Forebrain {
            return false;
        }
        let silent_for = self
            .last_host_byte_ms
            .map_or(u64::MAX, |last| now_ms.saturating_sub(last));
        if silent_for >= HOST_SILENCE_MS {
            self.enter_autonomous(now_ms);
            return true;
        }
        false
    }

    fn enter_forebrain(&mut self, now_ms: u64) {
        if self.mode == Mode::Forebrain {
            return;
        }
        self.mode = Mode::Forebrain;
        self.stats.mode_changes = self.stats.mode_changes.saturating_add(1);
        self.stop_chassis();
        self.autonomy.suspend();
        self.motion.link_up();
        self.next_odom_ms = now_ms;
        self.next_time_ms = now_ms;
        info!("host link up, entering FOREBRAIN");

        self.publish(
            Priority::P0,
            now_ms,
            format_args!("HELLO,proto={},build={}", PROTO_VERSION, BUILD),
        );
        let seq = self.next_seq();
        self.publish(Priority::P0, now_ms, format_args!("LINK,1,{}", seq));
        self.publish(Priority::P0, now_ms, format_args!("STATE,{}", Mode::Forebrain.as_str()));
    }

    fn enter_autonomous(&mut self, now_ms: u64) {
        if self.mode == Mode::Autonomous {
            return;
        }
        self.mode = Mode::Autonomous;
        self.stats.mode_changes = self.stats.mode_changes.saturating_add(1);
        self.motion.link_down();
        self.stop_chassis();
        info!("host silent, reverting to AUTONOMOUS");

        let seq = self.next_seq();
        self.publish(Priority::P0, now_ms, format_args!("LINK,0,{}", seq));
        self.publish(Priority::P0, now_ms, format_args!("STATE,{}", Mode::Autonomous.as_str()));
        self.autonomy.resume(now_ms);
    }

    fn maintain_chassis_link(&mut self, now_ms: u64) {
        if self.telemetry.needs_reconfigure(now_ms) {
            if let Err(e) = chassis::configure_stream(&mut self.chassis) {
                self.note_write_error(&e);
            }
        }
        let connected = self.telemetry.is_connected(now_ms);
        if connected && !self.chassis_was_connected {
            info!("chassis link up");
            if let Err(e) = chassis::reassert_full(&mut self.chassis) {
                self.note_write_error(&e);
            }
        } else if !connected && self.chassis_was_connected {
            warn!("chassis link lost");
        }
        self.chassis_was_connected = connected;
    }

    fn publish_telemetry(&mut self, now_ms: u64) {
        let state = self.motion.state(now_ms);
        if self.state_edge.changed(state) {
            self.publish(Priority::P0, now_ms, format_args!("STATE,{}", state));
        }

        if self.mode == Mode::Forebrain {
            if self.params.odom_hz > 0 && now_ms >= self.next_odom_ms {
                self.next_odom_ms = now_ms + 1000 / u64::from(self.params.odom_hz);
                let pose = self.odometry.pose();
                let actual = self.motion.actual();
                self.odom_seq = self.odom_seq.wrapping_add(1);
                let seq = self.odom_seq;
                self.publish(
                    Priority::P1,
                    now_ms,
                    format_args!(
                        "ODOM,{:.3},{:.3},{:.3},{:.3},{:.3},{}",
                        pose.x, pose.y, pose.theta, actual.vx, actual.wz, seq
                    ),
                );
            }
            if now_ms >= self.next_time_ms {
                self.next_time_ms = now_ms + TIME_PERIOD_MS;
                self.publish(Priority::P2, now_ms, format_args!("TIME,{}", now_ms));
            }
        }

        if self.chassis_was_connected && now_ms >= self.next_bat_ms {
            self.next_bat_ms = now_ms + BAT_PERIOD_MS;
            let sensors = *self.telemetry.state();
            self.publish(
                Priority::P2,
                now_ms,
                format_args!(
                    "BAT,{},{},{}",
                    sensors.voltage_mv,
                    sensors.battery_percent().unwrap_or(0),
                    u8::from(sensors.charging())
                ),
            );
        }
    }

    // ---- helpers ----

    fn publish(&mut self, priority: Priority, now_ms: u64, args: fmt::Arguments<'_>) -> Option<u32> {
        let mut body = OutLine::new();
        if body.write_fmt(args).is_err() {
            warn!("outbound body exceeds line capacity");
            return None;
        }
        self.outbound.send(priority, &body, now_ms)
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn stop_chassis(&mut self) {
        if let Err(e) = chassis::stop(&mut self.chassis) {
            self.note_write_error(&e);
        }
    }

    fn note_write_error(&mut self, error: &C::Error) {
        self.stats.chassis_write_errors = self.stats.chassis_write_errors.saturating_add(1);
        warn!(?error, "chassis write failed");
    }

    /// Zero the output and stop the wheels, e.g. on shutdown.
    pub fn halt(&mut self) {
        self.motion.zero_actual();
        self.stop_chassis();
    }

    // ---- accessors ----

    /// Drain lines queued for the host since the last call, in eid order.
    pub fn take_outbound(&mut self) -> alloc::vec::Vec<OutLine> {
        self.outbound.take_outbound()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn params(&self) -> &ParamSet {
        &self.params
    }

    pub fn motion(&self) -> &MotionArbiter {
        &self.motion
    }

    pub fn outbound(&self) -> &OutboundScheduler {
        &self.outbound
    }

    pub fn protocol_stats(&self) -> &ProtocolStats {
        self.protocol.stats()
    }

    pub fn telemetry(&self) -> &ChassisTelemetry {
        &self.telemetry
    }

    pub fn odometry(&self) -> &Odometry {
        &self.odometry
    }

    pub fn chassis(&self) -> &C {
        &self.chassis
    }

    pub fn chassis_mut(&mut self) -> &mut C {
        &mut self.chassis
    }

    pub fn led_mask(&self) -> u8 {
        self.led_mask
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }
}
