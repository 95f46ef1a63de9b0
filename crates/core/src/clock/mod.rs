//! Match timing state machine.
//!
//! [`MatchClock`] is plain data: every operation takes the current
//! [`Instant`] explicitly and never sleeps or spawns anything, which keeps it
//! deterministic under test. Locking, the expiry monitor and the lead-time
//! timer live in [`crate::arena`].

use std::{
    fmt,
    time::{Duration, Instant},
};

use crate::{display::MAX_TIME_MS, ArenaError, ClockConfig, Result};

/// Most time an operator can put on the clock; the display cannot show more.
pub const MAX_REMAINING: Duration = Duration::from_millis(MAX_TIME_MS);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MatchState {
    #[default]
    Idle,
    /// Lead-time window between a start/resume request and the countdown.
    Starting,
    Counting,
    Paused,
}

impl fmt::Display for MatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchState::Idle => "idle",
            MatchState::Starting => "starting",
            MatchState::Counting => "counting",
            MatchState::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Whether robots may drive. The numeric value is what the drive packets
/// carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Killswitch {
    Disabled = 0,
    Enabled = 2,
}

impl Killswitch {
    pub fn value(self) -> u8 {
        self as u8
    }
}

/// Point-in-time view of the clock for operators and collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchSnapshot {
    pub state: MatchState,
    pub remaining: Duration,
    pub killswitch: Killswitch,
}

#[derive(Debug, Clone)]
pub struct MatchClock {
    state: MatchState,
    /// Authoritative while not counting.
    remaining: Duration,
    counting_started_at: Option<Instant>,
    /// Authoritative while counting.
    counting_ends_at: Option<Instant>,
    match_duration: Duration,
    lead_time: Duration,
    add_time_while_counting: bool,
    generation: u64,
}

impl MatchClock {
    pub fn new(match_duration: Duration, lead_time: Duration) -> Self {
        Self {
            state: MatchState::Idle,
            remaining: match_duration,
            counting_started_at: None,
            counting_ends_at: None,
            match_duration,
            lead_time,
            add_time_while_counting: false,
            generation: 0,
        }
    }

    pub fn from_config(config: &ClockConfig) -> Self {
        let mut clock = Self::new(config.match_duration(), config.lead_time());
        clock.add_time_while_counting = config.add_time_while_counting;
        clock
    }

    pub fn state(&self) -> MatchState {
        self.state
    }

    pub fn match_duration(&self) -> Duration {
        self.match_duration
    }

    pub fn lead_time(&self) -> Duration {
        self.lead_time
    }

    /// Bumped on every transition; lets deferred work detect that the state
    /// it was scheduled for has moved on.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn counting_started_at(&self) -> Option<Instant> {
        self.counting_started_at
    }

    pub fn counting_ends_at(&self) -> Option<Instant> {
        self.counting_ends_at
    }

    /// Time left on the clock, clamped at zero.
    pub fn remaining(&self, now: Instant) -> Duration {
        match (self.state, self.counting_ends_at) {
            (MatchState::Counting, Some(ends)) => ends.saturating_duration_since(now),
            _ => self.remaining,
        }
    }

    pub fn snapshot(&self, now: Instant) -> MatchSnapshot {
        let killswitch = if self.state == MatchState::Counting {
            Killswitch::Enabled
        } else {
            Killswitch::Disabled
        };
        MatchSnapshot {
            state: self.state,
            remaining: self.remaining(now),
            killswitch,
        }
    }

    /// `Idle -> Starting` with a full match on the clock. Returns the
    /// generation the deferred [`MatchClock::begin_counting`] must present.
    pub fn start(&mut self) -> Result<u64> {
        self.require("start", |state| state == MatchState::Idle)?;
        self.remaining = self.match_duration;
        Ok(self.transition(MatchState::Starting))
    }

    /// Ends the lead-time window. Returns the time put on the clock, or
    /// `None` if `generation` is stale and nothing changed.
    pub fn begin_counting(&mut self, now: Instant, generation: u64) -> Option<Duration> {
        if self.state != MatchState::Starting || self.generation != generation {
            return None;
        }
        self.counting_started_at = Some(now);
        self.counting_ends_at = Some(deadline(now, self.remaining));
        self.transition(MatchState::Counting);
        Some(self.remaining)
    }

    /// `Counting -> Paused`; returns the remaining time that was frozen.
    pub fn pause(&mut self, now: Instant) -> Result<Duration> {
        self.require("pause", |state| state == MatchState::Counting)?;
        self.remaining = self.remaining(now);
        self.clear_counting();
        self.transition(MatchState::Paused);
        Ok(self.remaining)
    }

    /// `Paused -> Starting`; counting resumes after another lead time.
    pub fn resume(&mut self) -> Result<u64> {
        self.require("resume", |state| state == MatchState::Paused)?;
        Ok(self.transition(MatchState::Starting))
    }

    /// Replaces the remaining time. Only legal while paused unless the clock
    /// was configured to also allow it while starting or counting, in which
    /// case a running countdown is re-targeted immediately.
    pub fn add_time(&mut self, now: Instant, new_remaining: Duration) -> Result<()> {
        let while_counting = self.add_time_while_counting;
        self.require("add time", |state| match state {
            MatchState::Paused => true,
            MatchState::Starting | MatchState::Counting => while_counting,
            MatchState::Idle => false,
        })?;
        if new_remaining > MAX_REMAINING {
            return Err(ArenaError::TimeOutOfRange {
                requested_ms: u64::try_from(new_remaining.as_millis()).unwrap_or(u64::MAX),
                max_ms: MAX_TIME_MS,
            });
        }
        self.remaining = new_remaining;
        if self.state == MatchState::Counting {
            self.counting_ends_at = Some(deadline(now, new_remaining));
        }
        Ok(())
    }

    /// Early finish from `Counting` or `Paused`. Returns the time that was
    /// left on the clock.
    pub fn knockout(&mut self, now: Instant) -> Result<Duration> {
        self.require("knock out", |state| {
            matches!(state, MatchState::Counting | MatchState::Paused)
        })?;
        self.finish(now)
    }

    /// Ends the match from any running state. Returns the time that was left
    /// on the clock.
    pub fn declare_winner(&mut self, now: Instant) -> Result<Duration> {
        self.require("declare a winner", |state| state != MatchState::Idle)?;
        self.finish(now)
    }

    /// Natural expiry check. Returns `true` exactly once per expired match.
    pub fn poll_expiry(&mut self, now: Instant) -> bool {
        match (self.state, self.counting_ends_at) {
            (MatchState::Counting, Some(ends)) if now >= ends => {
                self.reset();
                true
            }
            _ => false,
        }
    }

    /// Back to `Idle` with a full match on the clock.
    pub fn reset(&mut self) {
        self.remaining = self.match_duration;
        self.clear_counting();
        self.transition(MatchState::Idle);
    }

    fn finish(&mut self, now: Instant) -> Result<Duration> {
        self.remaining = self.remaining(now);
        self.clear_counting();
        self.transition(MatchState::Idle);
        Ok(self.remaining)
    }

    fn require(&self, operation: &'static str, allowed: impl Fn(MatchState) -> bool) -> Result<()> {
        if allowed(self.state) {
            Ok(())
        } else {
            Err(ArenaError::InvalidTransition {
                operation,
                state: self.state,
            })
        }
    }

    fn clear_counting(&mut self) {
        self.counting_started_at = None;
        self.counting_ends_at = None;
    }

    fn transition(&mut self, next: MatchState) -> u64 {
        self.state = next;
        self.generation += 1;
        self.generation
    }
}

fn deadline(now: Instant, remaining: Duration) -> Instant {
    now.checked_add(remaining)
        .or_else(|| now.checked_add(MAX_REMAINING))
        .unwrap_or(now)
}
