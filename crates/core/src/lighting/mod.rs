//! DMX output for the arena lighting rig.
//!
//! The rig is four identical 8-channel fixtures patched one after another at
//! the start of a single 512-slot universe. Every frame goes through a
//! [`FrameBuffer`], which owns the channel array, serialises writers and
//! keeps consecutive transmissions at least `min_interval` apart.

mod artnet;

use std::{
    sync::{Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::{LightingConfig, Result};

pub use artnet::{encode_art_dmx, ArtNetTransport, ARTNET_PORT};

/// Slots in one DMX universe.
pub const CHANNELS: usize = 512;
pub const FIXTURE_CHANNELS: usize = 8;
pub const FIXTURE_COUNT: usize = 4;

/// A complete universe worth of channel values.
pub type Frame = [u8; CHANNELS];

/// Channel offsets inside one fixture.
pub mod channel {
    pub const RED: usize = 0;
    pub const GREEN: usize = 1;
    pub const BLUE: usize = 2;
    pub const WHITE: usize = 3;
    pub const AMBER: usize = 4;
    pub const UV: usize = 5;
    /// Percentage of time on; 255 disables strobing.
    pub const STROBE: usize = 6;
    pub const DIMMER: usize = 7;
}

/// Emitter levels of a single fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub white: u8,
    pub amber: u8,
    pub uv: u8,
}

impl Color {
    pub const BLACK: Self = Self::rgb(0, 0, 0);
    pub const RED: Self = Self::rgb(255, 0, 0);
    pub const BLUE: Self = Self::rgb(0, 0, 255);
    /// All three primaries plus the white emitter.
    pub const FULL_WHITE: Self = Self::rgb(255, 255, 255).with_white(255);

    pub const fn rgb(red: u8, green: u8, blue: u8) -> Self {
        Self {
            red,
            green,
            blue,
            white: 0,
            amber: 0,
            uv: 0,
        }
    }

    pub const fn with_white(mut self, white: u8) -> Self {
        self.white = white;
        self
    }

    pub const fn with_amber(mut self, amber: u8) -> Self {
        self.amber = amber;
        self
    }

    pub const fn with_uv(mut self, uv: u8) -> Self {
        self.uv = uv;
        self
    }
}

/// Full channel state of a single fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FixtureState {
    pub color: Color,
    pub strobe: u8,
    pub dimmer: u8,
}

impl FixtureState {
    pub const DARK: Self = Self {
        color: Color::BLACK,
        strobe: 0,
        dimmer: 0,
    };

    /// Steady output (strobe disabled) at full master level.
    pub const fn armed(color: Color) -> Self {
        Self {
            color,
            strobe: u8::MAX,
            dimmer: u8::MAX,
        }
    }

    pub const fn with_dimmer(mut self, dimmer: u8) -> Self {
        self.dimmer = dimmer;
        self
    }

    pub fn channels(&self) -> [u8; FIXTURE_CHANNELS] {
        let mut out = [0u8; FIXTURE_CHANNELS];
        out[channel::RED] = self.color.red;
        out[channel::GREEN] = self.color.green;
        out[channel::BLUE] = self.color.blue;
        out[channel::WHITE] = self.color.white;
        out[channel::AMBER] = self.color.amber;
        out[channel::UV] = self.color.uv;
        out[channel::STROBE] = self.strobe;
        out[channel::DIMMER] = self.dimmer;
        out
    }

    /// Places this fixture's channels into `frame` at fixture slot `index`.
    pub fn write_into(&self, frame: &mut Frame, index: usize) {
        let offset = index * FIXTURE_CHANNELS;
        frame[offset..offset + FIXTURE_CHANNELS].copy_from_slice(&self.channels());
    }
}

/// Tiles the first fixture's worth of `values` across every fixture and
/// zero-fills the rest of the universe.
pub fn replicate(values: &[u8]) -> Frame {
    let mut fixture = [0u8; FIXTURE_CHANNELS];
    let len = values.len().min(FIXTURE_CHANNELS);
    fixture[..len].copy_from_slice(&values[..len]);

    let mut frame = [0u8; CHANNELS];
    for slot in frame[..FIXTURE_CHANNELS * FIXTURE_COUNT].chunks_exact_mut(FIXTURE_CHANNELS) {
        slot.copy_from_slice(&fixture);
    }
    frame
}

/// Physical side of the output driver.
pub trait LightingTransport: Send {
    fn send_frame(&mut self, universe: u16, frame: &Frame) -> Result<()>;
}

/// Transport used when no lighting node is configured.
#[derive(Debug, Default)]
pub struct NullTransport;

impl LightingTransport for NullTransport {
    fn send_frame(&mut self, universe: u16, frame: &Frame) -> Result<()> {
        tracing::trace!(universe, head = ?&frame[..FIXTURE_CHANNELS], "dmx frame (no transport)");
        Ok(())
    }
}

struct OutputState {
    channels: Frame,
    last_write: Option<Instant>,
    transport: Box<dyn LightingTransport>,
}

/// Throttled, mutually exclusive writer over the universe.
pub struct FrameBuffer {
    universe: u16,
    min_interval: Duration,
    state: Mutex<OutputState>,
}

impl FrameBuffer {
    /// Default spacing between two transmitted frames (50 Hz).
    pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(20);

    pub fn new<T>(transport: T, universe: u16, min_interval: Duration) -> Self
    where
        T: LightingTransport + 'static,
    {
        Self {
            universe,
            min_interval,
            state: Mutex::new(OutputState {
                channels: [0u8; CHANNELS],
                last_write: None,
                transport: Box::new(transport),
            }),
        }
    }

    /// Builds the buffer for the configured transport, falling back to the
    /// null transport when no Art-Net target is given.
    pub fn from_config(config: &LightingConfig) -> Result<Self> {
        let buffer = match &config.artnet_target {
            Some(target) => Self::new(
                ArtNetTransport::connect(target)?,
                config.universe,
                config.min_interval(),
            ),
            None => Self::new(NullTransport, config.universe, config.min_interval()),
        };
        Ok(buffer)
    }

    pub fn universe(&self) -> u16 {
        self.universe
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Writes a frame. With `replicate`, the first fixture's channels are
    /// copied to every fixture; otherwise `values` is the whole universe.
    ///
    /// Blocks until `min_interval` has passed since the previous write.
    /// Transport failures are logged and dropped.
    pub fn write(&self, values: &[u8], replicate: bool) -> Result<()> {
        let frame = if replicate {
            self::replicate(values)
        } else {
            let mut frame = [0u8; CHANNELS];
            let len = values.len().min(CHANNELS);
            frame[..len].copy_from_slice(&values[..len]);
            frame
        };

        let mut state = self.lock_state();
        if let Some(last) = state.last_write {
            let since = last.elapsed();
            if since < self.min_interval {
                thread::sleep(self.min_interval - since);
            }
        }

        state.channels = frame;
        let universe = self.universe;
        let OutputState {
            channels,
            transport,
            ..
        } = &mut *state;
        if let Err(err) = transport.send_frame(universe, channels) {
            tracing::warn!(universe, %err, "dmx frame dropped");
        }
        state.last_write = Some(Instant::now());
        Ok(())
    }

    /// Shows one state on every fixture.
    pub fn write_fixture(&self, fixture: FixtureState) -> Result<()> {
        self.write(&fixture.channels(), true)
    }

    pub fn write_frame(&self, frame: &Frame) -> Result<()> {
        self.write(frame, false)
    }

    pub fn blackout(&self) -> Result<()> {
        self.write(&[0u8; CHANNELS], false)
    }

    /// Copy of the most recently written frame.
    pub fn snapshot(&self) -> Result<Frame> {
        Ok(self.lock_state().channels)
    }

    /// A writer that panicked mid-frame leaves the lock poisoned. The channel
    /// array is always whole, so the output carries on with it.
    fn lock_state(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(universe = self.universe, "lighting output recovered after a panic");
            self.state.clear_poison();
            poisoned.into_inner()
        })
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("universe", &self.universe)
            .field("min_interval", &self.min_interval)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    };
    use std::time::Instant;

    use super::{Frame, LightingTransport};
    use crate::{ArenaError, Result};

    /// Transport that keeps every frame together with its send time.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingTransport {
        pub(crate) frames: Arc<Mutex<Vec<(Instant, Frame)>>>,
        pub(crate) fail: bool,
        /// Panics on the next send, once.
        pub(crate) crash: Arc<AtomicBool>,
    }

    impl RecordingTransport {
        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub(crate) fn crashing_once() -> Self {
            Self {
                crash: Arc::new(AtomicBool::new(true)),
                ..Self::default()
            }
        }

        pub(crate) fn frames(&self) -> Vec<(Instant, Frame)> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl LightingTransport for RecordingTransport {
        fn send_frame(&mut self, _universe: u16, frame: &Frame) -> Result<()> {
            if self.crash.swap(false, Ordering::SeqCst) {
                panic!("dmx node driver crashed");
            }
            self.frames.lock().unwrap().push((Instant::now(), *frame));
            if self.fail {
                return Err(ArenaError::msg("node unreachable"));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::testing::RecordingTransport;
    use super::*;

    #[test]
    fn replicates_first_fixture_across_rig() {
        let frame = replicate(&[1, 2, 3, 4, 5, 6, 7, 8, 99, 99]);

        for fixture in 0..FIXTURE_COUNT {
            let offset = fixture * FIXTURE_CHANNELS;
            assert_eq!(&frame[offset..offset + 8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        }
        assert!(frame[FIXTURE_COUNT * FIXTURE_CHANNELS..].iter().all(|&v| v == 0));
    }

    #[test]
    fn short_input_is_zero_padded() {
        let frame = replicate(&[10, 20]);
        assert_eq!(&frame[..8], &[10, 20, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&frame[8..16], &[10, 20, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn fixture_channels_follow_patch_layout() {
        let state = FixtureState::armed(Color::rgb(1, 2, 3).with_white(4).with_amber(5).with_uv(6));
        assert_eq!(state.channels(), [1, 2, 3, 4, 5, 6, 255, 255]);

        let mut frame = [0u8; CHANNELS];
        state.with_dimmer(9).write_into(&mut frame, 2);
        assert_eq!(&frame[16..24], &[1, 2, 3, 4, 5, 6, 255, 9]);
        assert!(frame[..16].iter().all(|&v| v == 0));
    }

    #[test]
    fn unreplicated_write_keeps_full_frame() {
        let transport = RecordingTransport::default();
        let buffer = FrameBuffer::new(transport.clone(), 1, Duration::ZERO);
        let mut frame = [0u8; CHANNELS];
        frame[511] = 42;
        frame[9] = 7;

        buffer.write_frame(&frame).unwrap();

        assert_eq!(buffer.snapshot().unwrap(), frame);
        assert_eq!(transport.frames()[0].1, frame);
    }

    #[test]
    fn transport_failures_are_swallowed() {
        let transport = RecordingTransport::failing();
        let buffer = FrameBuffer::new(transport.clone(), 1, Duration::ZERO);

        buffer.write_fixture(FixtureState::armed(Color::RED)).unwrap();

        assert_eq!(transport.frames().len(), 1);
        assert_eq!(buffer.snapshot().unwrap()[channel::RED], 255);
    }

    #[test]
    fn concurrent_bursts_respect_min_interval() {
        let transport = RecordingTransport::default();
        let buffer = Arc::new(FrameBuffer::new(
            transport.clone(),
            1,
            Duration::from_millis(20),
        ));

        let writers: Vec<_> = (0..3u8)
            .map(|id| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for step in 0..4u8 {
                        buffer.write(&[id, step], true).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let frames = transport.frames();
        assert_eq!(frames.len(), 12);
        for pair in frames.windows(2) {
            let gap = pair[1].0.duration_since(pair[0].0);
            assert!(gap >= Duration::from_millis(20), "frames {gap:?} apart");
        }
    }

    #[test]
    fn output_survives_a_panicking_transport() {
        let transport = RecordingTransport::crashing_once();
        let buffer = Arc::new(FrameBuffer::new(transport.clone(), 1, Duration::ZERO));

        let writer = Arc::clone(&buffer);
        let crashed = thread::spawn(move || writer.write(&[1, 2, 3], true)).join();
        assert!(crashed.is_err());

        buffer.blackout().unwrap();
        assert_eq!(buffer.snapshot().unwrap(), [0u8; CHANNELS]);
        assert_eq!(transport.frames().last().unwrap().1, [0u8; CHANNELS]);
    }
}
