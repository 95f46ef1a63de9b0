//! Pure frame math for the animated effects.

use std::{f32::consts::PI, time::Duration};

use crate::lighting::{Color, FixtureState, Frame, CHANNELS, FIXTURE_COUNT};

use super::ChaseParams;

/// Length of the chase fade-in and fade-out ramps.
pub const FADE_WINDOW: Duration = Duration::from_millis(500);

/// Half-rectified sine pulse for fixture `index` at `t`; neighbouring
/// fixtures are a quarter period apart so the pulse rotates around the rig.
pub fn chase_brightness(t: Duration, period: Duration, index: usize) -> f32 {
    let period = period.as_secs_f32().max(f32::EPSILON);
    let phase = 2.0 * PI * t.as_secs_f32() / period + index as f32 * PI / 2.0;
    let sine = (phase.sin() + 1.0) / 2.0;
    (2.0 * sine - 1.0).max(0.0)
}

/// Linear fade-in over the first [`FADE_WINDOW`] and fade-out over the last
/// one. `remaining` is `None` for a chase with no end.
pub fn chase_envelope(elapsed: Duration, remaining: Option<Duration>) -> f32 {
    let window = FADE_WINDOW.as_secs_f32();
    if elapsed < FADE_WINDOW {
        return elapsed.as_secs_f32() / window;
    }
    match remaining {
        Some(left) if left < FADE_WINDOW => left.as_secs_f32() / window,
        _ => 1.0,
    }
}

pub fn chase_frame(params: &ChaseParams, elapsed: Duration, remaining: Option<Duration>) -> Frame {
    let scale = chase_envelope(elapsed, remaining);
    let mut frame = [0u8; CHANNELS];
    for index in 0..FIXTURE_COUNT {
        let brightness = chase_brightness(elapsed, params.period, index);
        let dimmer = (255.0 * scale * brightness).clamp(0.0, 255.0) as u8;
        FixtureState::armed(params.color)
            .with_dimmer(dimmer)
            .write_into(&mut frame, index);
    }
    frame
}

/// Master level `elapsed` into a linear fade from full to dark.
pub fn fade_level(elapsed: Duration, duration: Duration) -> u8 {
    if duration.is_zero() || elapsed >= duration {
        return 0;
    }
    let progress = elapsed.as_secs_f32() / duration.as_secs_f32();
    (255.0 - 255.0 * progress).clamp(0.0, 255.0) as u8
}

/// One leg of the idle colour sweep. Each leg is 256 steps long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepSegment {
    /// Red fades in from dark; only played once, before the loop.
    RedRise,
    RedToGreen,
    GreenToBlue,
    BlueToUv,
    UvToRed,
}

impl SweepSegment {
    pub const LOOP: [SweepSegment; 4] = [
        SweepSegment::RedToGreen,
        SweepSegment::GreenToBlue,
        SweepSegment::BlueToUv,
        SweepSegment::UvToRed,
    ];

    pub fn color_at(self, step: u8) -> Color {
        let rest = u8::MAX - step;
        match self {
            SweepSegment::RedRise => Color::rgb(step, 0, 0),
            SweepSegment::RedToGreen => Color::rgb(rest, step, 0),
            SweepSegment::GreenToBlue => Color::rgb(0, rest, step),
            // UV emitters run at half scale.
            SweepSegment::BlueToUv => Color::rgb(0, 0, rest).with_uv(step / 2),
            SweepSegment::UvToRed => Color::rgb(step, 0, 0).with_uv(rest / 2),
        }
    }
}
