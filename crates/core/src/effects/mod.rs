//! Lighting effect catalogue.
//!
//! Every effect expands into an [`EffectProgram`], a flat list of [`Step`]s
//! that the [`EffectEngine`] plays back on a single background task.
//! Composite effects such as [`Effect::Celebrate`] are just longer programs,
//! so each part stays individually cancellable.

mod engine;
pub mod render;

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    lighting::{Color, FixtureState},
    ArenaError,
};

pub use engine::{EffectEngine, EffectHandle};

/// Beats in the 3-2-1 countdown flash.
pub const COUNTDOWN_BEATS: u32 = 3;
pub const COUNTDOWN_ON: Duration = Duration::from_millis(500);
pub const COUNTDOWN_OFF: Duration = Duration::from_millis(500);
/// Total time the countdown flash takes before the final white.
pub const COUNTDOWN_LENGTH: Duration =
    Duration::from_millis(COUNTDOWN_BEATS as u64 * 1_000);

pub const DEFAULT_FADE: Duration = Duration::from_secs(1);
const CHASE_GAP: Duration = Duration::from_secs(1);
const CELEBRATE_HOLD: Duration = Duration::from_secs(1);
const CELEBRATE_BEATS: u32 = 6;
const CELEBRATE_BEAT: Duration = Duration::from_millis(150);

/// Team colours used for winner celebrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamColor {
    Blue,
    Orange,
    Yellow,
    Green,
}

impl TeamColor {
    pub fn color(self) -> Color {
        match self {
            TeamColor::Blue => Color::rgb(0, 0, 255),
            TeamColor::Orange => Color::rgb(255, 30, 0).with_amber(255),
            TeamColor::Yellow => Color::rgb(255, 255, 0).with_amber(255),
            TeamColor::Green => Color::rgb(0, 255, 0),
        }
    }
}

impl fmt::Display for TeamColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TeamColor::Blue => "blue",
            TeamColor::Orange => "orange",
            TeamColor::Yellow => "yellow",
            TeamColor::Green => "green",
        };
        f.write_str(name)
    }
}

impl FromStr for TeamColor {
    type Err = ArenaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blue" => Ok(TeamColor::Blue),
            "orange" => Ok(TeamColor::Orange),
            "yellow" => Ok(TeamColor::Yellow),
            "green" => Ok(TeamColor::Green),
            _ => Err(ArenaError::UnknownTeam(s.to_string())),
        }
    }
}

/// Rotating pulse across the four fixtures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChaseParams {
    pub color: Color,
    /// `None` keeps the chase running until it is superseded.
    pub duration: Option<Duration>,
    pub period: Duration,
    pub step: Duration,
}

impl Default for ChaseParams {
    fn default() -> Self {
        Self {
            color: Color::FULL_WHITE,
            duration: Some(Duration::from_secs(5)),
            period: Duration::from_millis(450),
            step: Duration::from_millis(20),
        }
    }
}

/// Named effects the rest of the system asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Colour sweep after an initial dark delay; loops forever.
    Idle { delay: Duration },
    Chase(ChaseParams),
    /// Three on/off beats in `color`, ending on solid full white.
    CountdownFlash { color: Color },
    FadeOut { duration: Duration },
    /// Solid blue until superseded.
    Pause,
    Celebrate { team: TeamColor },
    Off,
}

impl Effect {
    pub fn name(&self) -> &'static str {
        match self {
            Effect::Idle { .. } => "idle",
            Effect::Chase(_) => "chase",
            Effect::CountdownFlash { .. } => "countdown_flash",
            Effect::FadeOut { .. } => "fade_out",
            Effect::Pause => "pause",
            Effect::Celebrate { .. } => "celebrate",
            Effect::Off => "off",
        }
    }

    pub fn steps(&self) -> Vec<Step> {
        match self {
            Effect::Idle { delay } => vec![Step::Sweep { delay: *delay }],
            Effect::Chase(params) => vec![Step::Chase(*params)],
            Effect::CountdownFlash { color } => vec![
                Step::Flash {
                    color: *color,
                    beats: COUNTDOWN_BEATS,
                    on: COUNTDOWN_ON,
                    off: COUNTDOWN_OFF,
                },
                Step::Solid(FixtureState::armed(Color::FULL_WHITE)),
            ],
            Effect::FadeOut { duration } => vec![Step::FadeOut(*duration)],
            Effect::Pause => vec![Step::Solid(FixtureState::armed(Color::BLUE))],
            Effect::Celebrate { team } => {
                let color = team.color();
                vec![
                    Step::FadeOut(DEFAULT_FADE),
                    Step::Hold(CELEBRATE_HOLD),
                    Step::Flash {
                        color,
                        beats: CELEBRATE_BEATS,
                        on: CELEBRATE_BEAT,
                        off: CELEBRATE_BEAT,
                    },
                    Step::Solid(FixtureState::armed(
                        Color::rgb(255, 255, 255).with_amber(color.amber),
                    )),
                    Step::Chase(ChaseParams {
                        color,
                        duration: None,
                        ..ChaseParams::default()
                    }),
                ]
            }
            Effect::Off => vec![Step::Off],
        }
    }
}

/// Smallest unit of work the engine executes. Cancellation is observed
/// between steps and at every animation tick inside them.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Leave the current frame as it is for a while.
    Hold(Duration),
    Solid(FixtureState),
    /// On/off beats. A half-beat always runs to the end once started.
    Flash {
        color: Color,
        beats: u32,
        on: Duration,
        off: Duration,
    },
    Chase(ChaseParams),
    /// Ramp every dimmer down from full, then leave the rig armed and dark.
    FadeOut(Duration),
    Sweep { delay: Duration },
    Off,
}

/// Ordered steps played back by one effect task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectProgram {
    names: Vec<&'static str>,
    steps: Vec<Step>,
}

impl EffectProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, effect: Effect) -> Self {
        self.names.push(effect.name());
        self.steps.extend(effect.steps());
        self
    }

    pub fn then_hold(mut self, duration: Duration) -> Self {
        if !duration.is_zero() {
            self.names.push("hold");
            self.steps.push(Step::Hold(duration));
        }
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Short label for logs, e.g. `fade_out>chase>countdown_flash`.
    pub fn describe(&self) -> String {
        self.names.join(">")
    }

    /// Lead-in played between a start/resume request and the countdown
    /// running. The countdown flash is placed so it ends as the lead time
    /// runs out; the time before it is filled with a fade and white chase
    /// (`with_chase`) or by holding whatever is currently shown.
    pub fn lead_in(lead_time: Duration, with_chase: bool) -> Self {
        let before = lead_time.saturating_sub(COUNTDOWN_LENGTH);
        let mut program = Self::new();

        if with_chase {
            let fade = before.min(DEFAULT_FADE);
            if !fade.is_zero() {
                program = program.then(Effect::FadeOut { duration: fade });
            }
            let rest = before - fade;
            let chase = rest.saturating_sub(CHASE_GAP);
            if chase >= render::FADE_WINDOW * 2 {
                program = program
                    .then(Effect::Chase(ChaseParams {
                        duration: Some(chase),
                        ..ChaseParams::default()
                    }))
                    .then_hold(rest - chase);
            } else {
                program = program.then_hold(rest);
            }
        } else {
            program = program.then_hold(before);
        }

        program.then(Effect::CountdownFlash { color: Color::RED })
    }

    /// Fade to dark, then go back to the idle sweep.
    pub fn end_of_match(idle_delay: Duration) -> Self {
        Self::new()
            .then(Effect::FadeOut {
                duration: DEFAULT_FADE,
            })
            .then(Effect::Idle { delay: idle_delay })
    }
}

impl From<Effect> for EffectProgram {
    fn from(effect: Effect) -> Self {
        Self::new().then(effect)
    }
}
