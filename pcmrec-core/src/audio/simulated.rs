//! Software capture backends.
//!
//! - [`SimulatedCapture::manual`] completes transfers only when the paired
//!   [`SimulatedCaptureHandle`] is pumped. Deterministic; used by tests.
//! - [`SimulatedCapture::tone`] runs a paced generator thread producing a sine
//!   at the selected sample rate, for hosts without capture hardware.

use std::f32::consts::TAU;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{CaptureHardware, RecordingSource, TransferEngine, TransferOutcome};
use crate::buffering::{CHUNK_SIZE, FRAME_SIZE};
use crate::error::{RecorderError, Result};

/// Rate reported for the digital input, which dictates its own clock.
pub const DIGITAL_INPUT_RATE: u32 = 48_000;

const GENERATOR_PERIOD: Duration = Duration::from_millis(10);

type EngineSlot = Arc<Mutex<Option<Arc<TransferEngine>>>>;

pub struct SimulatedCapture {
    engine: EngineSlot,
    rate: Arc<AtomicU32>,
    source: RecordingSource,
    tone: Option<ToneConfig>,
    generator: Option<Generator>,
    fail_open: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Copy)]
struct ToneConfig {
    frequency_hz: f32,
    amplitude: i16,
}

struct Generator {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Test-side control of a manual [`SimulatedCapture`].
#[derive(Clone)]
pub struct SimulatedCaptureHandle {
    engine: EngineSlot,
    rate: Arc<AtomicU32>,
    fail_open: Arc<AtomicBool>,
}

impl SimulatedCapture {
    pub fn manual() -> (Self, SimulatedCaptureHandle) {
        let capture = Self::build(None);
        let handle = SimulatedCaptureHandle {
            engine: Arc::clone(&capture.engine),
            rate: Arc::clone(&capture.rate),
            fail_open: Arc::clone(&capture.fail_open),
        };
        (capture, handle)
    }

    pub fn tone(frequency_hz: f32, amplitude: i16) -> Self {
        Self::build(Some(ToneConfig {
            frequency_hz,
            amplitude,
        }))
    }

    fn build(tone: Option<ToneConfig>) -> Self {
        Self {
            engine: Arc::new(Mutex::new(None)),
            rate: Arc::new(AtomicU32::new(44_100)),
            source: RecordingSource::default(),
            tone,
            generator: None,
            fail_open: Arc::new(AtomicBool::new(false)),
        }
    }

    fn stop_generator(&mut self) {
        if let Some(generator) = self.generator.take() {
            generator.running.store(false, Ordering::Release);
            let _ = generator.handle.join();
        }
    }

    fn spawn_generator(&mut self, engine: Arc<TransferEngine>, tone: ToneConfig) -> Result<()> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let rate = Arc::clone(&self.rate);
        let handle = thread::Builder::new()
            .name("pcmrec-tone".into())
            .spawn(move || run_generator(engine, tone, rate, flag))
            .map_err(RecorderError::Io)?;
        self.generator = Some(Generator { running, handle });
        Ok(())
    }
}

impl CaptureHardware for SimulatedCapture {
    fn open(&mut self, engine: Arc<TransferEngine>) -> Result<()> {
        self.stop_generator();
        if self.fail_open.load(Ordering::Acquire) {
            return Err(RecorderError::AudioDevice("simulated open failure".into()));
        }
        *self.engine.lock() = Some(Arc::clone(&engine));
        if let Some(tone) = self.tone {
            self.spawn_generator(engine, tone)?;
        }
        info!(source = ?self.source, "simulated capture opened");
        Ok(())
    }

    fn select_source(&mut self, source: RecordingSource, requested_rate: u32) -> Result<u32> {
        let rate = match source {
            RecordingSource::Digital => DIGITAL_INPUT_RATE,
            RecordingSource::Microphone | RecordingSource::LineIn => requested_rate,
        };
        self.source = source;
        self.rate.store(rate, Ordering::Release);
        Ok(rate)
    }

    fn close(&mut self) {
        self.stop_generator();
        self.engine.lock().take();
        debug!("simulated capture closed");
    }
}

impl Drop for SimulatedCapture {
    fn drop(&mut self) {
        self.stop_generator();
    }
}

fn run_generator(
    engine: Arc<TransferEngine>,
    tone: ToneConfig,
    rate: Arc<AtomicU32>,
    running: Arc<AtomicBool>,
) {
    let mut phase = 0f32;
    let mut block: Vec<i16> = Vec::new();
    while running.load(Ordering::Acquire) {
        let sample_rate = rate.load(Ordering::Acquire).max(1);
        let frames = (sample_rate as u64 * GENERATOR_PERIOD.as_millis() as u64 / 1000) as usize;
        let step = TAU * tone.frequency_hz / sample_rate as f32;
        block.clear();
        for _ in 0..frames {
            let value = (phase.sin() * tone.amplitude as f32) as i16;
            block.push(value);
            block.push(value);
            phase = (phase + step) % TAU;
        }
        engine.write_samples(&block);
        thread::sleep(GENERATOR_PERIOD);
    }
}

impl SimulatedCaptureHandle {
    /// Engine currently attached, if the recorder has been initialized.
    pub fn engine(&self) -> Option<Arc<TransferEngine>> {
        self.engine.lock().clone()
    }

    /// Rate last selected by the recorder.
    pub fn sample_rate(&self) -> u32 {
        self.rate.load(Ordering::Acquire)
    }

    /// Make the next `open` fail.
    pub fn fail_next_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::Release);
    }

    /// Complete `chunks` transfers with every sample set to `value`.
    ///
    /// Returns the number of chunks committed to the ring.
    pub fn pump(&self, chunks: usize, value: i16) -> usize {
        self.pump_with(chunks, |_| (value, value))
    }

    /// Complete `chunks` transfers, generating each frame from its index
    /// within the chunk.
    pub fn pump_with<F>(&self, chunks: usize, mut frame: F) -> usize
    where
        F: FnMut(usize) -> (i16, i16),
    {
        let Some(engine) = self.engine() else {
            return 0;
        };
        let mut committed = 0;
        for _ in 0..chunks {
            let outcome = engine.transfer_block(|buf| {
                for (idx, dst) in buf.chunks_exact_mut(FRAME_SIZE).enumerate() {
                    let (left, right) = frame(idx);
                    dst[..2].copy_from_slice(&left.to_ne_bytes());
                    dst[2..].copy_from_slice(&right.to_ne_bytes());
                }
            });
            match outcome {
                TransferOutcome::Rearmed | TransferOutcome::Halted => committed += 1,
                TransferOutcome::Overrun | TransferOutcome::Ignored => break,
            }
        }
        committed
    }

    /// Frames per chunk, for building test signals.
    pub fn frames_per_chunk(&self) -> usize {
        CHUNK_SIZE / FRAME_SIZE
    }

    /// Report one failed transfer.
    pub fn transfer_error(&self) -> Option<TransferOutcome> {
        self.engine().map(|engine| engine.on_transfer_error())
    }

    /// Report an unrecoverable hardware failure.
    pub fn fatal_error(&self) {
        if let Some(engine) = self.engine() {
            engine.on_fatal_error();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::TransferStats;
    use crate::buffering::ChunkRing;

    fn open_manual(chunks: usize) -> (SimulatedCapture, SimulatedCaptureHandle, Arc<TransferEngine>) {
        let (mut capture, handle) = SimulatedCapture::manual();
        let ring = Arc::new(ChunkRing::with_chunks(chunks).unwrap());
        let engine = Arc::new(TransferEngine::new(ring, Arc::new(TransferStats::default())));
        capture.open(Arc::clone(&engine)).unwrap();
        (capture, handle, engine)
    }

    #[test]
    fn pump_commits_chunks_while_running() {
        let (_capture, handle, engine) = open_manual(8);
        assert_eq!(handle.pump(3, 10), 0, "halted engine ignores transfers");
        engine.start();
        assert_eq!(handle.pump(3, 10), 3);
        assert_eq!(engine.ring().write_cursor(), 3);
    }

    #[test]
    fn pump_stops_at_overrun() {
        let (_capture, handle, engine) = open_manual(4);
        engine.start();
        assert_eq!(handle.pump(10, 1), 3);
        assert!(engine.halted());
    }

    #[test]
    fn digital_source_dictates_rate() {
        let (mut capture, handle) = SimulatedCapture::manual();
        assert_eq!(
            capture.select_source(RecordingSource::Digital, 44_100).unwrap(),
            DIGITAL_INPUT_RATE
        );
        assert_eq!(capture.select_source(RecordingSource::LineIn, 22_050).unwrap(), 22_050);
        assert_eq!(handle.sample_rate(), 22_050);
    }

    #[test]
    fn open_failure_can_be_injected() {
        let (mut capture, handle) = SimulatedCapture::manual();
        handle.fail_next_open(true);
        let ring = Arc::new(ChunkRing::with_chunks(4).unwrap());
        let engine = Arc::new(TransferEngine::new(ring, Arc::new(TransferStats::default())));
        assert!(capture.open(engine).is_err());
        assert!(handle.engine().is_none());
    }

    #[test]
    fn tone_generator_fills_ring() {
        let mut capture = SimulatedCapture::tone(440.0, 8_000);
        capture.select_source(RecordingSource::LineIn, 44_100).unwrap();
        let ring = Arc::new(ChunkRing::with_chunks(64).unwrap());
        let engine = Arc::new(TransferEngine::new(Arc::clone(&ring), Arc::new(TransferStats::default())));
        engine.start();
        capture.open(Arc::clone(&engine)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while ring.write_cursor() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        capture.close();
        assert!(ring.write_cursor() > 0, "generator never completed a chunk");
    }
}
