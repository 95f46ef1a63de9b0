//! Core library for the arena match clock.
//!
//! The crate keeps the match timing state machine, the remote countdown
//! display protocol and the lighting effect engine in lockstep. Each module
//! owns one subsystem; [`MatchController`] in [`arena`] wires them together
//! behind the operations an operator console calls.

pub mod arena;
pub mod clock;
pub mod config;
pub mod display;
pub mod effects;
pub mod error;
pub mod lighting;
pub mod robots;
pub mod task;

pub use arena::{MatchController, MatchEndCallback};
pub use clock::{Killswitch, MatchClock, MatchSnapshot, MatchState, MAX_REMAINING};
pub use config::{AppConfig, ClockConfig, DisplayConfig, LightingConfig};
pub use display::{ClockPacket, RemoteClockClient, RemoteCommand};
pub use effects::{ChaseParams, Effect, EffectEngine, EffectHandle, EffectProgram, TeamColor};
pub use error::{ArenaError, Result};
pub use lighting::{Color, FixtureState, FrameBuffer, LightingTransport};
pub use robots::{RobotDirectory, RobotInfo, RobotLimits, StaticRobotDirectory};
pub use task::{CancelToken, Completion, DeferredTrigger};
