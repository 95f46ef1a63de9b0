//! Match orchestration.
//!
//! [`MatchController`] owns the [`MatchClock`] behind a single mutex and
//! turns each operator command into a clock transition, a lighting program
//! and a remote display notification. A monitor thread polls the clock for
//! natural expiry, and lead-in timers move `Starting` matches to `Counting`.
//!
//! Every transition that changes the lights claims a new lighting epoch under
//! the clock lock. The effect engine drops a request whose epoch has been
//! superseded, so a slow caller cannot put stale lights over a newer match.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, Weak},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    clock::{MatchClock, MatchSnapshot, MatchState},
    display::{RemoteClockClient, RemoteCommand},
    effects::{Effect, EffectEngine, EffectProgram, TeamColor},
    lighting::FrameBuffer,
    task::{CancelToken, DeferredTrigger},
    AppConfig, ArenaError, ClockConfig, Result,
};

/// Called from the monitor thread when the countdown runs out. Must return
/// quickly.
pub type MatchEndCallback = Arc<dyn Fn() + Send + Sync>;

struct ClockSlot {
    clock: MatchClock,
    lead_in: Option<DeferredTrigger>,
    lighting_epoch: u64,
    stopped: bool,
}

impl ClockSlot {
    fn claim_lights(&mut self) -> u64 {
        self.lighting_epoch += 1;
        self.lighting_epoch
    }
}

struct Shared {
    slot: Mutex<ClockSlot>,
    effects: EffectEngine,
    /// Released by [`MatchController::stop`].
    display: Mutex<Option<RemoteClockClient>>,
    display_target: SocketAddr,
    clock_config: ClockConfig,
    idle_delay: Duration,
    on_match_end: Mutex<Option<MatchEndCallback>>,
}

/// Public face of the match: start, pause, resume, add time, knock out,
/// declare a winner and shut down.
pub struct MatchController {
    shared: Arc<Shared>,
    shutdown: CancelToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl MatchController {
    /// Builds the lighting output and display client from `config`.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let frame = Arc::new(FrameBuffer::from_config(&config.lighting)?);
        let effects = EffectEngine::new(frame, config.lighting.cancel_timeout());
        let display = RemoteClockClient::from_config(&config.display)?;
        Self::new(config, effects, display)
    }

    /// Puts the lights into the idle sweep and starts the expiry monitor.
    pub fn new(config: &AppConfig, effects: EffectEngine, display: RemoteClockClient) -> Result<Self> {
        let shared = Arc::new(Shared {
            slot: Mutex::new(ClockSlot {
                clock: MatchClock::from_config(&config.clock),
                lead_in: None,
                lighting_epoch: 0,
                stopped: false,
            }),
            effects,
            display_target: display.target(),
            display: Mutex::new(Some(display)),
            clock_config: config.clock.clone(),
            idle_delay: config.lighting.idle_delay(),
            on_match_end: Mutex::new(None),
        });
        shared.run_effect(
            0,
            Effect::Idle {
                delay: shared.idle_delay,
            },
        );

        let shutdown = CancelToken::new();
        let monitor = {
            let shared = Arc::downgrade(&shared);
            let shutdown = shutdown.clone();
            let tick = config.clock.monitor_tick();
            thread::Builder::new()
                .name("match-monitor".to_string())
                .spawn(move || watch_expiry(shared, shutdown, tick))?
        };

        tracing::info!(
            match_ms = config.clock.match_duration_ms,
            lead_ms = config.clock.lead_time_ms,
            display = %shared.display_target,
            "match controller ready"
        );
        Ok(Self {
            shared,
            shutdown,
            monitor: Mutex::new(Some(monitor)),
        })
    }

    /// Registers the callback fired when a match runs out of time.
    pub fn set_on_match_end<F>(&self, callback: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut slot = self
            .shared
            .on_match_end
            .lock()
            .map_err(|_| ArenaError::msg("match end callback has been poisoned"))?;
        *slot = Some(Arc::new(callback));
        Ok(())
    }

    pub fn snapshot(&self) -> Result<MatchSnapshot> {
        Ok(self.shared.lock_slot()?.clock.snapshot(Instant::now()))
    }

    pub fn state(&self) -> Result<MatchState> {
        Ok(self.shared.lock_slot()?.clock.state())
    }

    pub fn effects(&self) -> &EffectEngine {
        &self.shared.effects
    }

    /// Begins the lead-in for a fresh, full-length match.
    pub fn start(&self) -> Result<()> {
        let lead_time = self.shared.clock_config.lead_time();
        let epoch = {
            let mut slot = self.shared.lock_running()?;
            let generation = rejected(slot.clock.start())?;
            match self.shared.schedule_lead_in(generation, lead_time) {
                Ok(trigger) => slot.lead_in = Some(trigger),
                Err(err) => {
                    slot.clock.reset();
                    return Err(err);
                }
            }
            tracing::info!(generation, lead_ms = lead_time.as_millis() as u64, "match starting");
            slot.claim_lights()
        };

        self.shared
            .run_effect(epoch, EffectProgram::lead_in(lead_time, true));
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let (epoch, remaining) = {
            let mut slot = self.shared.lock_running()?;
            let remaining = rejected(slot.clock.pause(Instant::now()))?;
            (slot.claim_lights(), remaining)
        };
        tracing::info!(remaining_ms = remaining.as_millis() as u64, "match paused");

        self.shared.run_effect(epoch, Effect::Pause);
        self.shared.notify_padded(RemoteCommand::Pause, remaining);
        Ok(())
    }

    /// Begins another lead-in; the countdown continues from where it was
    /// paused.
    pub fn resume(&self) -> Result<()> {
        let lead_time = self.shared.clock_config.lead_time();
        let (epoch, remaining) = {
            let mut slot = self.shared.lock_running()?;
            let generation = rejected(slot.clock.resume())?;
            match self.shared.schedule_lead_in(generation, lead_time) {
                Ok(trigger) => slot.lead_in = Some(trigger),
                Err(err) => {
                    // Put the match back where it was; the next resume retries.
                    let now = Instant::now();
                    if slot.clock.begin_counting(now, generation).is_some() {
                        slot.clock.pause(now)?;
                    }
                    return Err(err);
                }
            }
            (slot.claim_lights(), slot.clock.remaining(Instant::now()))
        };
        tracing::info!(remaining_ms = remaining.as_millis() as u64, "match resuming");

        self.shared
            .run_effect(epoch, EffectProgram::lead_in(lead_time, false));
        self.shared.notify_padded(RemoteCommand::Resume, remaining);
        Ok(())
    }

    /// Sets the time left on the clock to exactly `remaining`.
    pub fn add_time(&self, remaining: Duration) -> Result<()> {
        {
            let mut slot = self.shared.lock_running()?;
            rejected(slot.clock.add_time(Instant::now(), remaining))?;
        }
        tracing::info!(remaining_ms = remaining.as_millis() as u64, "match time changed");

        self.shared.send_display(RemoteCommand::AddTime, remaining);
        Ok(())
    }

    /// Ends the match early and returns the lights to idle.
    pub fn knockout(&self) -> Result<()> {
        let (epoch, remaining) = {
            let mut slot = self.shared.lock_running()?;
            let remaining = rejected(slot.clock.knockout(Instant::now()))?;
            cancel_lead_in(&mut slot);
            (slot.claim_lights(), remaining)
        };
        tracing::info!(remaining_ms = remaining.as_millis() as u64, "match ended by knockout");

        self.shared.notify_padded(RemoteCommand::End, remaining);
        self.shared
            .run_effect(epoch, EffectProgram::end_of_match(self.shared.idle_delay));
        Ok(())
    }

    pub fn declare_winner(&self, team: TeamColor) -> Result<()> {
        let (epoch, remaining) = {
            let mut slot = self.shared.lock_running()?;
            let remaining = rejected(slot.clock.declare_winner(Instant::now()))?;
            cancel_lead_in(&mut slot);
            (slot.claim_lights(), remaining)
        };
        tracing::info!(%team, "winner declared");

        self.shared.run_effect(epoch, Effect::Celebrate { team });
        self.shared.notify_padded(RemoteCommand::End, remaining);
        Ok(())
    }

    /// Stops the monitor, resets the clock, switches the lights off, resets
    /// the remote display and releases its socket. Match operations fail with
    /// [`ArenaError::Stopped`] afterwards. Safe to call more than once.
    pub fn stop(&self) -> Result<()> {
        self.shutdown.cancel();
        let monitor = self
            .monitor
            .lock()
            .map_err(|_| ArenaError::msg("match monitor handle has been poisoned"))?
            .take();
        let Some(monitor) = monitor else {
            return Ok(());
        };
        if monitor.join().is_err() {
            tracing::warn!("match monitor panicked");
        }

        {
            let mut slot = self.shared.lock_slot()?;
            slot.stopped = true;
            slot.claim_lights();
            cancel_lead_in(&mut slot);
            slot.clock.reset();
        }

        let off = self.shared.effects.run(Effect::Off)?;
        off.wait(self.shared.effects.cancel_timeout());
        self.shared.send_display(RemoteCommand::Reset, Duration::ZERO);
        self.shared.release_display();
        tracing::info!("match controller stopped");
        Ok(())
    }
}

impl Drop for MatchController {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Ok(mut slot) = self.shared.lock_slot() {
            cancel_lead_in(&mut slot);
        }
        if let Err(err) = self.shared.effects.cancel_active() {
            tracing::warn!(%err, "could not stop the lighting effect");
        }
    }
}

impl std::fmt::Debug for MatchController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchController")
            .field("display", &self.shared.display_target)
            .finish()
    }
}

impl Shared {
    fn lock_slot(&self) -> Result<MutexGuard<'_, ClockSlot>> {
        self.slot
            .lock()
            .map_err(|_| ArenaError::msg("match clock has been poisoned"))
    }

    fn lock_running(&self) -> Result<MutexGuard<'_, ClockSlot>> {
        let slot = self.lock_slot()?;
        if slot.stopped {
            tracing::warn!("operation after stop rejected");
            return Err(ArenaError::Stopped);
        }
        Ok(slot)
    }

    fn schedule_lead_in(self: &Arc<Self>, generation: u64, lead_time: Duration) -> Result<DeferredTrigger> {
        let shared = Arc::downgrade(self);
        DeferredTrigger::schedule(lead_time, move || {
            if let Some(shared) = shared.upgrade() {
                shared.begin_counting(generation);
            }
        })
    }

    fn begin_counting(&self, generation: u64) {
        let remaining = match self.lock_slot() {
            Ok(mut slot) => match slot.clock.begin_counting(Instant::now(), generation) {
                Some(remaining) => {
                    slot.lead_in = None;
                    remaining
                }
                None => {
                    tracing::debug!(generation, "stale lead-in discarded");
                    return;
                }
            },
            Err(err) => {
                tracing::warn!(%err, "could not begin counting");
                return;
            }
        };
        tracing::info!(remaining_ms = remaining.as_millis() as u64, "countdown running");

        // The display runs its own lead-in before counting down.
        self.send_display(
            RemoteCommand::Start,
            remaining.saturating_add(self.clock_config.lead_time()),
        );
    }

    fn check_expiry(&self) {
        let epoch = match self.lock_slot() {
            Ok(mut slot) => {
                if !slot.clock.poll_expiry(Instant::now()) {
                    return;
                }
                slot.claim_lights()
            }
            Err(err) => {
                tracing::warn!(%err, "could not check match expiry");
                return;
            }
        };
        tracing::info!("match time expired");

        let callback = match self.on_match_end.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => {
                tracing::warn!("match end callback has been poisoned");
                None
            }
        };
        if let Some(callback) = callback {
            callback();
        }
        self.run_effect(epoch, EffectProgram::end_of_match(self.idle_delay));
    }

    /// Starts `program` unless a later transition has claimed the lights.
    fn run_effect(&self, epoch: u64, program: impl Into<EffectProgram>) {
        let current = || match self.lock_slot() {
            Ok(slot) => slot.lighting_epoch == epoch,
            Err(_) => false,
        };
        match self.effects.run_if(program, current) {
            Ok(Some(_)) => {}
            Ok(None) => tracing::debug!(epoch, "stale lighting request dropped"),
            Err(err) => tracing::warn!(%err, "could not start lighting effect"),
        }
    }

    fn notify_padded(&self, command: RemoteCommand, remaining: Duration) {
        self.send_display(command, remaining.saturating_add(self.clock_config.display_pad()));
    }

    fn send_display(&self, command: RemoteCommand, time: Duration) {
        match self.display.lock() {
            Ok(display) => match display.as_ref() {
                Some(display) => display.send(command, time),
                None => tracing::debug!(%command, "display released; command not sent"),
            },
            Err(_) => tracing::warn!("remote display client has been poisoned"),
        }
    }

    fn release_display(&self) {
        match self.display.lock() {
            Ok(mut display) => drop(display.take()),
            Err(_) => tracing::warn!("remote display client has been poisoned"),
        }
    }
}

fn watch_expiry(shared: Weak<Shared>, shutdown: CancelToken, tick: Duration) {
    while shutdown.sleep(tick) {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.check_expiry();
    }
    tracing::debug!("match monitor exited");
}

fn cancel_lead_in(slot: &mut ClockSlot) {
    if let Some(trigger) = slot.lead_in.take() {
        trigger.cancel();
    }
}

/// Logs a rejected transition before handing it back to the caller.
fn rejected<T>(result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        tracing::warn!(%err, "operation rejected");
    }
    result
}
