//! # Brainstem
//!
//! Control core for a small differential-drive robot. It sits between an
//! upstream host ("forebrain") speaking a line protocol and a chassis speaking
//! a binary opcode and sensor-stream interface, and drives the robot on its own
//! when no host is connected.
//!
//! ## Features
//!
//! - **Host line protocol**: CR/LF framed ASCII commands with optional `*HH`
//!   checksums, typed into an exhaustive [`Command`] enum
//! - **Outbound scheduling**: event ids, a token-bucket byte budget for
//!   best-effort telemetry and a replay ring for re-delivery
//! - **Chassis telemetry**: checksummed frame decoding with resync and
//!   desync recovery, cached sensor state and dead reckoning
//! - **Motion arbitration**: e-stop, reflex and hesitation windows, range
//!   guard and slew limiting, plus host/autonomous mode switching
//! - **Deterministic time**: every timed behavior runs off millisecond
//!   timestamps passed in by the caller
//!
//! ## Quick Start
//!
//! ```rust
//! use brainstem::{Engine, ParamSet, SimulatedChassis};
//!
//! let mut engine = Engine::new(SimulatedChassis::new(), ParamSet::default(), 0)?;
//!
//! engine.feed_host(b"PING,1\n", 0);
//! engine.tick(20);
//!
//! for line in engine.take_outbound() {
//!     println!("{}", line);
//! }
//! # Ok::<(), brainstem::EngineError>(())
//! ```
//!
//! ## Architecture
//!
//! - [`engine`] - Owned control context, dispatcher and control tick
//! - [`protocol`] - Host line assembly and command parsing
//! - [`outbound`] - Event ids, transmit budget and replay ring
//! - [`params`] - Runtime-tunable parameter table
//! - [`chassis`] - Chassis port, opcodes and sensor stream decoding
//! - [`motion`] - Motion arbitration and safety state machine
//! - [`odometry`] - Dead-reckoning pose
//! - [`isr`] - Flag shared with the external bumper interrupt
//! - [`watchdog`] - Out-of-band stop for a hung control loop

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

extern crate alloc;

pub mod chassis;
pub mod engine;
pub mod isr;
pub mod motion;
pub mod odometry;
pub mod outbound;
pub mod params;
pub mod protocol;
pub mod watchdog;

pub use chassis::{ChassisPort, SensorState, SharedChassis, SimulatedChassis};
pub use engine::{AutonomousBehavior, Engine, EngineError, Mode};
pub use motion::{MotionState, Twist};
pub use outbound::{ParsedLine, Priority};
pub use params::{ParamKey, ParamSet, ParamValue};
pub use protocol::{Command, ParseError};
pub use watchdog::LoopHeartbeat;
