//! Motion arbitration and the safety state machine.
//!
//! Every tick the arbiter turns the current target (host twist, or the
//! autonomous behavior's twist while the link is down) into a goal, layers the
//! safety overrides on top, and slews the actual output toward that goal.
//! Override order, strongest first: e-stop, reflex, hesitation, range guard.

use crate::params::ParamSet;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Forced stop after a hazard.
pub const REFLEX_MS: u64 = 250;
/// Zero-authority cool-down that follows the reflex window.
pub const HESITATE_MS: u64 = 250;
/// Distinct range sensor ids tracked at once.
pub const RANGE_SLOTS: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Twist {
    pub vx: f32,
    pub wz: f32,
}

impl Twist {
    pub const ZERO: Twist = Twist { vx: 0.0, wz: 0.0 };

    pub fn new(vx: f32, wz: f32) -> Self {
        Self { vx, wz }
    }

    pub fn is_zero(self) -> bool {
        self.vx == 0.0 && self.wz == 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TwistCommand {
    pub twist: Twist,
    pub seq: u32,
    pub received_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionState {
    LinkDown,
    Estop,
    Reflex,
    Stale,
    Teleop,
    Idle,
}

impl MotionState {
    pub fn as_str(self) -> &'static str {
        match self {
            MotionState::LinkDown => "LINKDOWN",
            MotionState::Estop => "ESTOP",
            MotionState::Reflex => "REFLEX",
            MotionState::Stale => "STALE",
            MotionState::Teleop => "TELEOP",
            MotionState::Idle => "IDLE",
        }
    }
}

impl core::fmt::Display for MotionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeReading {
    pub meters: f32,
    pub id: u16,
}

/// Latest reading per sensor id, with the minimum kept current on update.
#[derive(Debug, Default)]
pub struct RangeTable {
    slots: Vec<(RangeReading, u64), RANGE_SLOTS>,
    min: Option<RangeReading>,
}

impl RangeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a reading. Returns the new minimum when it changed.
    pub fn update(&mut self, reading: RangeReading, now_ms: u64) -> Option<RangeReading> {
        if let Some(slot) = self.slots.iter_mut().find(|(r, _)| r.id == reading.id) {
            *slot = (reading, now_ms);
        } else if let Err(entry) = self.slots.push((reading, now_ms)) {
            // Table full: the slot updated longest ago gives way
            if let Some(oldest) = self.slots.iter_mut().min_by_key(|(_, at)| *at) {
                *oldest = entry;
            }
        }

        let previous = self.min;
        self.min = match previous {
            // Cheap path: a lower reading, or the current minimum improving
            Some(min) if reading.meters <= min.meters => Some(reading),
            Some(min) if min.id != reading.id && self.slots.iter().any(|(r, _)| r.id == min.id) => {
                Some(min)
            }
            _ => self.scan_min(),
        };
        (self.min != previous).then_some(self.min).flatten()
    }

    fn scan_min(&self) -> Option<RangeReading> {
        self.slots
            .iter()
            .map(|(r, _)| *r)
            .min_by(|a, b| a.meters.total_cmp(&b.meters))
    }

    pub fn min(&self) -> Option<RangeReading> {
        self.min
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// What the engine has to publish as a result of one arbitration tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotionActions {
    /// The twist just went stale; milliseconds since the last one.
    pub went_stale: Option<u64>,
    /// The range guard fired a reflex on this reading.
    pub range_startle: Option<RangeReading>,
}

#[derive(Debug)]
pub struct MotionArbiter {
    twist: Option<TwistCommand>,
    stale_marked: bool,
    link_up: bool,
    estop: bool,
    safety_enabled: bool,
    reflex_until: u64,
    hesitate_until: u64,
    ranges: RangeTable,
    range_latched: bool,
    goal: Twist,
    actual: Twist,
}

impl MotionArbiter {
    pub fn new() -> Self {
        Self {
            twist: None,
            stale_marked: false,
            link_up: false,
            estop: false,
            safety_enabled: true,
            reflex_until: 0,
            hesitate_until: 0,
            ranges: RangeTable::new(),
            range_latched: false,
            goal: Twist::ZERO,
            actual: Twist::ZERO,
        }
    }

    pub fn set_twist(&mut self, vx: f32, wz: f32, seq: u32, now_ms: u64) {
        self.twist = Some(TwistCommand {
            twist: Twist::new(vx, wz),
            seq,
            received_ms: now_ms,
        });
        self.stale_marked = false;
    }

    pub fn clear_twist(&mut self) {
        self.twist = None;
        self.stale_marked = false;
    }

    /// `SAFE,1` arms the safety layer and releases the e-stop; `SAFE,0`
    /// disarms it and holds the robot in e-stop. Returns `true` when the
    /// effective e-stop changed.
    pub fn set_safe(&mut self, enabled: bool) -> bool {
        let before = self.estop_active();
        self.safety_enabled = enabled;
        self.estop = !enabled;
        if self.estop_active() {
            self.zero_actual();
        }
        before != self.estop_active()
    }

    pub fn estop_active(&self) -> bool {
        self.estop || !self.safety_enabled
    }

    pub fn safety_enabled(&self) -> bool {
        self.safety_enabled
    }

    /// Start a reflex window followed by a hesitation window.
    pub fn recoil(&mut self, now_ms: u64) {
        self.reflex_until = now_ms + REFLEX_MS;
        self.hesitate_until = self.reflex_until + HESITATE_MS;
        self.zero_actual();
        debug!(until = self.hesitate_until, "recoil");
    }

    pub fn in_reflex(&self, now_ms: u64) -> bool {
        now_ms < self.reflex_until
    }

    pub fn in_hesitation(&self, now_ms: u64) -> bool {
        !self.in_reflex(now_ms) && now_ms < self.hesitate_until
    }

    pub fn link_up(&mut self) {
        self.link_up = true;
        self.clear_twist();
        self.goal = Twist::ZERO;
        self.zero_actual();
        info!("motion: host link up");
    }

    pub fn link_down(&mut self) {
        self.link_up = false;
        self.clear_twist();
        self.goal = Twist::ZERO;
        self.zero_actual();
        info!("motion: host link down");
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up
    }

    pub fn update_range(&mut self, meters: f32, id: u16, now_ms: u64) -> Option<RangeReading> {
        self.ranges.update(RangeReading { meters, id }, now_ms)
    }

    pub fn ranges(&self) -> &RangeTable {
        &self.ranges
    }

    pub fn zero_actual(&mut self) {
        self.actual = Twist::ZERO;
    }

    /// Run one arbitration step. `fallback` is the autonomous behavior's
    /// target, used while no host owns the link.
    pub fn tick(&mut self, now_ms: u64, dt_s: f32, params: &ParamSet, fallback: Twist) -> MotionActions {
        let mut actions = MotionActions::default();

        // The staleness watchdog is armed by the first twist after link-up
        let mut goal = match (self.link_up, self.twist) {
            (false, _) => fallback,
            (true, None) => Twist::ZERO,
            (true, Some(cmd)) => {
                let since = now_ms.saturating_sub(cmd.received_ms);
                if since >= u64::from(params.watchdog_ms) {
                    if !self.stale_marked {
                        self.stale_marked = true;
                        actions.went_stale = Some(since);
                        debug!(since_ms = since, "twist stale");
                    }
                    Twist::ZERO
                } else {
                    cmd.twist
                }
            }
        };

        match self.ranges.min() {
            Some(min) if min.meters < params.hard_stop_m => {
                if goal.vx > 0.0 && !self.range_latched && !self.estop_active() {
                    self.range_latched = true;
                    actions.range_startle = Some(min);
                    self.recoil(now_ms);
                }
            }
            _ => self.range_latched = false,
        }

        if self.estop_active() || self.in_reflex(now_ms) {
            self.goal = Twist::ZERO;
            self.zero_actual();
            return actions;
        }

        if self.in_hesitation(now_ms) {
            goal = Twist::ZERO;
        } else {
            goal.vx = Self::range_guard(goal.vx, self.ranges.min(), params);
        }

        self.goal = goal;
        self.actual.vx = slew(self.actual.vx, goal.vx, params.slew_v * dt_s);
        self.actual.wz = slew(self.actual.wz, goal.wz, params.slew_w * dt_s);
        actions
    }

    /// Forward speed allowed at the current minimum range.
    fn range_guard(vx: f32, min: Option<RangeReading>, params: &ParamSet) -> f32 {
        let Some(min) = min else {
            return vx;
        };
        if vx <= 0.0 {
            return vx;
        }
        if min.meters < params.hard_stop_m {
            return 0.0;
        }
        let span = params.soft_stop_m - params.hard_stop_m;
        if span > 0.0 && min.meters < params.soft_stop_m {
            return vx * ((min.meters - params.hard_stop_m) / span).clamp(0.0, 1.0);
        }
        vx
    }

    pub fn state(&self, now_ms: u64) -> MotionState {
        if !self.link_up {
            MotionState::LinkDown
        } else if self.estop_active() {
            MotionState::Estop
        } else if self.in_reflex(now_ms) {
            MotionState::Reflex
        } else if self.stale_marked {
            MotionState::Stale
        } else if self.twist.is_some_and(|cmd| !cmd.twist.is_zero()) {
            MotionState::Teleop
        } else {
            MotionState::Idle
        }
    }

    pub fn actual(&self) -> Twist {
        self.actual
    }

    pub fn goal(&self) -> Twist {
        self.goal
    }

    pub fn twist(&self) -> Option<&TwistCommand> {
        self.twist.as_ref()
    }
}

impl Default for MotionArbiter {
    fn default() -> Self {
        Self::new()
    }
}

fn slew(current: f32, target: f32, max_step: f32) -> f32 {
    let delta = (target - current).clamp(-max_step, max_step);
    current + delta
}
