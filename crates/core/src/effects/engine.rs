use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::{Duration, Instant},
};

use super::{
    render::{chase_frame, fade_level, SweepSegment},
    ChaseParams, EffectProgram, Step,
};
use crate::{
    lighting::{channel, Color, FixtureState, FrameBuffer, FIXTURE_CHANNELS, FIXTURE_COUNT},
    task::{CancelToken, Completion},
    ArenaError, Result,
};

const FADE_STEP: Duration = Duration::from_millis(10);
const SWEEP_STEP: Duration = Duration::from_millis(20);
const CHASE_SETTLE: Duration = Duration::from_millis(50);

/// Handle to one running (or finished) effect task.
#[derive(Debug, Clone)]
pub struct EffectHandle {
    id: u64,
    label: Arc<str>,
    token: CancelToken,
    done: Completion,
}

impl EffectHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Asks the task to stop at its next cancellation point.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_complete()
    }

    /// Waits for the task to exit. Returns `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.done.wait_timeout(timeout)
    }
}

/// Runs at most one effect at a time over the shared [`FrameBuffer`].
///
/// Starting an effect first cancels the active one and waits (bounded by
/// `cancel_timeout`) for it to exit, so the old task's last frame is written
/// before the new task's first.
#[derive(Debug)]
pub struct EffectEngine {
    frame: Arc<FrameBuffer>,
    cancel_timeout: Duration,
    active: Mutex<Option<EffectHandle>>,
    next_id: AtomicU64,
}

impl EffectEngine {
    pub fn new(frame: Arc<FrameBuffer>, cancel_timeout: Duration) -> Self {
        Self {
            frame,
            cancel_timeout,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn frame(&self) -> &Arc<FrameBuffer> {
        &self.frame
    }

    pub fn cancel_timeout(&self) -> Duration {
        self.cancel_timeout
    }

    /// Replaces the active effect with `program`.
    pub fn run(&self, program: impl Into<EffectProgram>) -> Result<EffectHandle> {
        let mut active = self.lock_active()?;
        self.replace(&mut active, program.into())
    }

    /// Like [`EffectEngine::run`], but only if `current` still holds once
    /// the engine is locked. A request that lost a race with a newer one
    /// returns `None` and leaves the active effect alone.
    pub fn run_if(
        &self,
        program: impl Into<EffectProgram>,
        current: impl FnOnce() -> bool,
    ) -> Result<Option<EffectHandle>> {
        let mut active = self.lock_active()?;
        if !current() {
            return Ok(None);
        }
        self.replace(&mut active, program.into()).map(Some)
    }

    /// Cancels the active effect, if any, without starting another.
    pub fn cancel_active(&self) -> Result<()> {
        let mut active = self.lock_active()?;
        if let Some(previous) = active.take() {
            self.retire(&previous);
        }
        Ok(())
    }

    pub fn active(&self) -> Result<Option<EffectHandle>> {
        Ok(self.lock_active()?.clone())
    }

    fn replace(
        &self,
        active: &mut Option<EffectHandle>,
        program: EffectProgram,
    ) -> Result<EffectHandle> {
        if let Some(previous) = active.take() {
            self.retire(&previous);
        }

        let handle = EffectHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            label: program.describe().into(),
            token: CancelToken::new(),
            done: Completion::new(),
        };
        let worker = handle.clone();
        let frame = Arc::clone(&self.frame);
        thread::Builder::new()
            .name(format!("effect-{}", handle.id))
            .spawn(move || {
                let _done = worker.done.guard();
                play(&frame, &worker, &program);
            })?;

        tracing::debug!(effect = handle.id, label = handle.label(), "effect started");
        *active = Some(handle.clone());
        Ok(handle)
    }

    fn retire(&self, previous: &EffectHandle) {
        previous.cancel();
        if !previous.wait(self.cancel_timeout) {
            tracing::warn!(
                effect = previous.id,
                label = previous.label(),
                timeout_ms = self.cancel_timeout.as_millis() as u64,
                "effect did not stop in time; starting the next one anyway"
            );
        }
    }

    fn lock_active(&self) -> Result<MutexGuard<'_, Option<EffectHandle>>> {
        self.active
            .lock()
            .map_err(|_| ArenaError::msg("effect engine has been poisoned"))
    }
}

impl Drop for EffectEngine {
    fn drop(&mut self) {
        let active = match self.active.get_mut() {
            Ok(active) => active.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = active {
            handle.cancel();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Cancelled,
}

fn play(frame: &FrameBuffer, handle: &EffectHandle, program: &EffectProgram) {
    for step in program.steps() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_step(frame, &handle.token, step)))
            .unwrap_or_else(|_| Err(ArenaError::msg("effect step panicked")));
        match outcome {
            Ok(Flow::Continue) => {}
            Ok(Flow::Cancelled) => {
                tracing::debug!(effect = handle.id, label = handle.label(), "effect cancelled");
                return;
            }
            Err(err) => {
                tracing::warn!(effect = handle.id, label = handle.label(), %err, "effect failed; switching lights off");
                if let Err(err) = frame.blackout() {
                    tracing::warn!(%err, "could not switch lights off");
                }
                return;
            }
        }
    }
    tracing::debug!(effect = handle.id, label = handle.label(), "effect finished");
}

fn run_step(frame: &FrameBuffer, token: &CancelToken, step: &Step) -> Result<Flow> {
    if token.is_cancelled() {
        return Ok(Flow::Cancelled);
    }
    match step {
        Step::Hold(duration) => Ok(sleep(token, *duration)),
        Step::Solid(state) => {
            frame.write_fixture(*state)?;
            Ok(Flow::Continue)
        }
        Step::Flash {
            color,
            beats,
            on,
            off,
        } => flash(frame, token, *color, *beats, *on, *off),
        Step::Chase(params) => chase(frame, token, params),
        Step::FadeOut(duration) => fade_out(frame, token, *duration),
        Step::Sweep { delay } => sweep(frame, token, *delay),
        Step::Off => {
            frame.blackout()?;
            Ok(Flow::Continue)
        }
    }
}

fn sleep(token: &CancelToken, duration: Duration) -> Flow {
    if token.sleep(duration) {
        Flow::Continue
    } else {
        Flow::Cancelled
    }
}

fn flash(
    frame: &FrameBuffer,
    token: &CancelToken,
    color: Color,
    beats: u32,
    on: Duration,
    off: Duration,
) -> Result<Flow> {
    for _ in 0..beats {
        if token.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        frame.write_fixture(FixtureState::armed(color))?;
        thread::sleep(on);

        if token.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        frame.write_fixture(FixtureState::armed(Color::BLACK))?;
        thread::sleep(off);
    }
    Ok(Flow::Continue)
}

fn chase(frame: &FrameBuffer, token: &CancelToken, params: &ChaseParams) -> Result<Flow> {
    frame.blackout()?;
    if sleep(token, CHASE_SETTLE) == Flow::Cancelled {
        return Ok(Flow::Cancelled);
    }

    let started = Instant::now();
    let ends = params
        .duration
        .map(|duration| started + duration.saturating_sub(CHASE_SETTLE));
    loop {
        let now = Instant::now();
        let remaining = match ends {
            Some(end) if now >= end => break,
            Some(end) => Some(end - now),
            None => None,
        };

        frame.write_frame(&chase_frame(params, now - started, remaining))?;
        if sleep(token, params.step) == Flow::Cancelled {
            return Ok(Flow::Cancelled);
        }
    }

    frame.blackout()?;
    Ok(Flow::Continue)
}

fn fade_out(frame: &FrameBuffer, token: &CancelToken, duration: Duration) -> Result<Flow> {
    let mut current = frame.snapshot()?;
    let started = Instant::now();
    loop {
        let elapsed = started.elapsed();
        if elapsed >= duration {
            break;
        }
        let level = fade_level(elapsed, duration);
        for index in 0..FIXTURE_COUNT {
            current[index * FIXTURE_CHANNELS + channel::DIMMER] = level;
        }
        frame.write_frame(&current)?;
        if sleep(token, FADE_STEP) == Flow::Cancelled {
            return Ok(Flow::Cancelled);
        }
    }

    frame.write_fixture(FixtureState::armed(Color::BLACK))?;
    Ok(Flow::Continue)
}

fn sweep(frame: &FrameBuffer, token: &CancelToken, delay: Duration) -> Result<Flow> {
    if sleep(token, delay) == Flow::Cancelled {
        return Ok(Flow::Cancelled);
    }
    if sweep_segment(frame, token, SweepSegment::RedRise)? == Flow::Cancelled {
        return Ok(Flow::Cancelled);
    }
    loop {
        for segment in SweepSegment::LOOP {
            if sweep_segment(frame, token, segment)? == Flow::Cancelled {
                return Ok(Flow::Cancelled);
            }
        }
    }
}

fn sweep_segment(frame: &FrameBuffer, token: &CancelToken, segment: SweepSegment) -> Result<Flow> {
    for step in 0..=u8::MAX {
        if token.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        frame.write_fixture(FixtureState::armed(segment.color_at(step)))?;
        if sleep(token, SWEEP_STEP) == Flow::Cancelled {
            return Ok(Flow::Cancelled);
        }
    }
    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        effects::{Effect, TeamColor},
        lighting::{testing::RecordingTransport, CHANNELS},
    };

    fn engine(transport: &RecordingTransport, cancel_timeout: Duration) -> EffectEngine {
        let frame = FrameBuffer::new(transport.clone(), 1, Duration::from_millis(1));
        EffectEngine::new(Arc::new(frame), cancel_timeout)
    }

    #[test]
    fn off_writes_a_dark_frame_and_finishes() {
        let transport = RecordingTransport::default();
        let engine = engine(&transport, Duration::from_secs(1));

        let handle = engine.run(Effect::Off).unwrap();

        assert!(handle.wait(Duration::from_secs(2)));
        assert_eq!(handle.label(), "off");
        assert_eq!(transport.frames().last().unwrap().1, [0u8; CHANNELS]);
    }

    #[test]
    fn new_effect_preempts_running_idle() {
        let transport = RecordingTransport::default();
        let engine = engine(&transport, Duration::from_secs(1));

        let idle = engine
            .run(Effect::Idle {
                delay: Duration::ZERO,
            })
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        let pause = engine.run(Effect::Pause).unwrap();

        assert!(idle.is_finished());
        assert!(pause.wait(Duration::from_secs(2)));
        assert_ne!(idle.id(), pause.id());

        let last = transport.frames().last().unwrap().1;
        assert_eq!(&last[..8], &FixtureState::armed(Color::BLUE).channels());
        assert_eq!(engine.active().unwrap().unwrap().id(), pause.id());
    }

    #[test]
    fn old_frames_never_follow_new_ones() {
        let transport = RecordingTransport::default();
        let engine = engine(&transport, Duration::from_secs(1));

        engine
            .run(Effect::Idle {
                delay: Duration::ZERO,
            })
            .unwrap();
        thread::sleep(Duration::from_millis(60));
        let handoff = transport.frames().len();
        let pause = engine.run(Effect::Pause).unwrap();
        pause.wait(Duration::from_secs(2));

        let frames = transport.frames();
        let blue = FixtureState::armed(Color::BLUE).channels();
        assert!(frames.len() > handoff);
        let after: Vec<_> = frames[handoff..]
            .iter()
            .skip_while(|(_, frame)| frame[..8] != blue)
            .collect();
        assert!(after.iter().all(|(_, frame)| frame[..8] == blue));
    }

    #[test]
    fn finite_chase_ends_dark() {
        let transport = RecordingTransport::default();
        let engine = engine(&transport, Duration::from_secs(1));

        let handle = engine
            .run(Effect::Chase(ChaseParams {
                duration: Some(Duration::from_millis(250)),
                period: Duration::from_millis(100),
                ..ChaseParams::default()
            }))
            .unwrap();

        assert!(handle.wait(Duration::from_secs(2)));
        let frames = transport.frames();
        assert!(frames.len() > 3);
        assert_eq!(frames.last().unwrap().1, [0u8; CHANNELS]);
    }

    #[test]
    fn fade_out_leaves_rig_armed_and_dark() {
        let transport = RecordingTransport::default();
        let engine = engine(&transport, Duration::from_secs(1));
        engine
            .frame()
            .write_fixture(FixtureState::armed(Color::RED))
            .unwrap();

        let handle = engine
            .run(Effect::FadeOut {
                duration: Duration::from_millis(100),
            })
            .unwrap();
        assert!(handle.wait(Duration::from_secs(2)));

        let frames = transport.frames();
        let dimmers: Vec<u8> = frames.iter().map(|(_, f)| f[channel::DIMMER]).collect();
        assert!(dimmers.windows(2).take(dimmers.len() - 2).all(|w| w[0] >= w[1]));
        let last = frames.last().unwrap().1;
        assert_eq!(&last[..8], &[0, 0, 0, 0, 0, 0, 255, 255]);
    }

    #[test]
    fn stuck_effect_does_not_block_handoff() {
        let transport = RecordingTransport::default();
        let engine = engine(&transport, Duration::from_millis(50));

        let stuck = EffectProgram {
            names: vec!["flash"],
            steps: vec![Step::Flash {
                color: Color::RED,
                beats: 1,
                on: Duration::from_millis(400),
                off: Duration::ZERO,
            }],
        };
        let slow = engine.run(stuck).unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        let next = engine.run(Effect::Off).unwrap();

        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(!slow.is_finished());
        assert!(next.wait(Duration::from_secs(2)));
        assert!(slow.wait(Duration::from_secs(2)));
    }

    #[test]
    fn celebrate_can_be_superseded_mid_chain() {
        let transport = RecordingTransport::default();
        let engine = engine(&transport, Duration::from_secs(1));

        let celebrate = engine
            .run(Effect::Celebrate {
                team: TeamColor::Green,
            })
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        engine.cancel_active().unwrap();

        assert!(celebrate.is_finished());
        assert!(engine.active().unwrap().is_none());
    }

    #[test]
    fn crashed_effect_falls_back_to_off() {
        let transport = RecordingTransport::crashing_once();
        let engine = engine(&transport, Duration::from_secs(1));

        let idle = engine
            .run(Effect::Idle {
                delay: Duration::ZERO,
            })
            .unwrap();

        assert!(idle.wait(Duration::from_secs(2)));
        let frames = transport.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1, [0u8; CHANNELS]);
        assert_eq!(engine.frame().snapshot().unwrap(), [0u8; CHANNELS]);
    }

    #[test]
    fn dropping_the_engine_stops_the_active_effect() {
        let transport = RecordingTransport::default();
        let engine = engine(&transport, Duration::from_secs(1));
        let idle = engine
            .run(Effect::Idle {
                delay: Duration::ZERO,
            })
            .unwrap();
        thread::sleep(Duration::from_millis(60));

        drop(engine);

        assert!(idle.wait(Duration::from_secs(1)));
        let settled = transport.frames().len();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(transport.frames().len(), settled);
    }

    #[test]
    fn run_if_leaves_the_active_effect_when_stale() {
        let transport = RecordingTransport::default();
        let engine = engine(&transport, Duration::from_secs(1));
        let pause = engine.run(Effect::Pause).unwrap();

        let skipped = engine.run_if(Effect::Off, || false).unwrap();
        assert!(skipped.is_none());
        assert_eq!(engine.active().unwrap().unwrap().id(), pause.id());

        let off = engine.run_if(Effect::Off, || true).unwrap().unwrap();
        assert_eq!(engine.active().unwrap().unwrap().id(), off.id());
    }
}
