//! `PcmRecorder`: the control surface clients hold.
//!
//! ## Lifecycle
//!
//! ```text
//! PcmRecorder::spawn()
//!     └─► init(offset)          → ring sized, producer free-running
//!         └─► configure(...)    → source, rate, pre-roll
//!             └─► start(file)   → pre-roll retained, file open, Recording
//!                 ├─► pause() / resume()
//!                 ├─► new_file(file)
//!                 └─► stop()    → flushed, header patched, Idle
//!     └─► close()               → producer disabled
//! ```
//!
//! Every call blocks until the worker has finished the transition. A call
//! returns `Err` only when the worker is gone; recording failures show up in
//! [`PcmRecorder::status`] and on the status event channel.
//!
//! ## Threading
//!
//! Capture backends such as `cpal::Stream` are `!Send`, so the hardware is
//! built by a factory closure *inside* the worker thread and never crosses a
//! thread boundary. A sync oneshot channel propagates factory errors back to
//! `spawn()`.

pub mod clock;
pub mod control;
pub mod worker;

use std::sync::{atomic::Ordering, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    audio::{CaptureHardware, RecordingSource},
    buffering::{chunk::ChannelPeaks, CHUNK_SIZE, FRAME_SIZE},
    error::{RecorderError, Result},
    ipc::events::{RecorderState, RecorderStatusEvent, StatusFlags},
    storage::RecordingStorage,
};
use clock::Clock;
use control::{Command, ControlChannel};
use worker::{RecorderDiagnostics, RecorderWorker, SharedStatus, WorkerContext};

pub use worker::DiagnosticsSnapshot;

/// Broadcast channel capacity for status events.
const BROADCAST_CAP: usize = 64;

/// Configuration for `PcmRecorder`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderConfig {
    /// Total recording memory in bytes. The ring gets whatever is left after
    /// the init offset and a small guard. Default: 32 MiB.
    pub buffer_bytes: usize,
    /// Non-forced drains write once free chunks drop to this many. Default: 250.
    pub write_threshold_chunks: usize,
    /// Periodic drain tick. Default: 25 ms.
    pub drain_interval_ms: u64,
    /// Longest wait for the producer to acknowledge a halt. Default: 2 s.
    pub halt_timeout_ms: u64,
    /// Command queue depth. Default: 16.
    pub command_queue_depth: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: 32 * 1024 * 1024,
            write_threshold_chunks: 250,
            drain_interval_ms: 25,
            halt_timeout_ms: 2_000,
            command_queue_depth: 16,
        }
    }
}

impl RecorderConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms.max(1))
    }

    pub fn halt_timeout(&self) -> Duration {
        Duration::from_millis(self.halt_timeout_ms)
    }
}

/// Requested pre-roll, in chunks and in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreRoll {
    pub chunks: usize,
    pub duration: Duration,
}

impl PreRoll {
    /// Pre-roll for `seconds` of audio at `sample_rate`.
    ///
    /// One extra chunk covers the partial chunk in flight. The result never
    /// exceeds `num_chunks - write_threshold` (floored at zero) so pre-roll
    /// cannot eat the room the writer needs; when clamped, the duration is
    /// recomputed from the chunk count.
    pub fn compute(
        sample_rate: u32,
        seconds: u32,
        num_chunks: usize,
        write_threshold: usize,
    ) -> Self {
        if seconds == 0 || sample_rate == 0 {
            return Self::default();
        }
        let bytes = u64::from(sample_rate) * FRAME_SIZE as u64 * u64::from(seconds);
        let chunks = usize::try_from(bytes / CHUNK_SIZE as u64)
            .unwrap_or(usize::MAX)
            .saturating_add(1);
        let limit = num_chunks.saturating_sub(write_threshold);
        if chunks >= limit {
            return Self {
                chunks: limit,
                duration: Self::duration_of(limit, sample_rate),
            };
        }
        Self {
            chunks,
            duration: Duration::from_secs(u64::from(seconds)),
        }
    }

    /// Playback time of `chunks` full chunks at `sample_rate`.
    pub fn duration_of(chunks: usize, sample_rate: u32) -> Duration {
        if sample_rate == 0 {
            return Duration::ZERO;
        }
        let bytes = chunks as u128 * CHUNK_SIZE as u128;
        let bytes_per_second = u128::from(sample_rate) * FRAME_SIZE as u128;
        let nanos = bytes * 1_000_000_000 / bytes_per_second;
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// The recorder handle.
///
/// `PcmRecorder` is `Send + Sync`. Submissions are serialized internally, so
/// several threads may share one handle, though one control owner is the
/// intended use.
pub struct PcmRecorder {
    control: Arc<ControlChannel>,
    /// Held across post-and-wait so no command kind is posted twice before
    /// its acknowledgement.
    submit_lock: Mutex<()>,
    status: Arc<SharedStatus>,
    clock: Arc<dyn Clock>,
    status_tx: broadcast::Sender<RecorderStatusEvent>,
    diagnostics: Arc<RecorderDiagnostics>,
    worker: Option<JoinHandle<()>>,
}

impl PcmRecorder {
    /// Spawn the worker thread. `hardware` runs on that thread.
    ///
    /// Blocks until the hardware backend has been built (or failed).
    pub fn spawn<S, H, F>(
        config: RecorderConfig,
        storage: S,
        clock: Arc<dyn Clock>,
        hardware: F,
    ) -> Result<Self>
    where
        S: RecordingStorage + 'static,
        H: CaptureHardware + 'static,
        F: FnOnce() -> Result<H> + Send + 'static,
    {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (control, commands) = control::channel(config.command_queue_depth);
        let status = Arc::new(SharedStatus::default());
        let diagnostics = Arc::new(RecorderDiagnostics::default());

        let ctx = WorkerContext {
            config,
            storage: Box::new(storage),
            clock: Arc::clone(&clock),
            status: Arc::clone(&status),
            diagnostics: Arc::clone(&diagnostics),
            status_tx: status_tx.clone(),
        };

        // Sync oneshot: the worker reports whether the hardware could be built.
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        let worker = thread::Builder::new()
            .name("pcmrec".into())
            .spawn(move || {
                // ── Build hardware (must happen on THIS thread) ──
                let hardware = match hardware() {
                    Ok(h) => {
                        let _ = ready_tx.send(Ok(()));
                        h
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                RecorderWorker::new(ctx, hardware).run(commands);
            })
            .map_err(RecorderError::Io)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(RecorderError::Other(anyhow::anyhow!(
                    "recorder worker died during startup"
                )));
            }
        }

        info!("recorder spawned");
        Ok(Self {
            control,
            submit_lock: Mutex::new(()),
            status,
            clock,
            status_tx,
            diagnostics,
            worker: Some(worker),
        })
    }

    fn submit<F>(&self, command: Command, stage: F) -> Result<()>
    where
        F: FnOnce(&mut control::StagedArgs),
    {
        let _guard = self.submit_lock.lock();
        self.control.submit(command, stage)
    }

    /// Size the ring from the recording memory after `buffer_offset` and
    /// start the producer free-running. Clears the error flag.
    pub fn init(&self, buffer_offset: usize) -> Result<()> {
        self.submit(Command::Init, |args| args.buffer_offset = buffer_offset)
    }

    /// Stop any session and release the producer permanently.
    pub fn close(&self) -> Result<()> {
        self.submit(Command::Close, |_| {})
    }

    /// Select input, sample rate and pre-roll. Ignored while recording.
    pub fn configure(
        &self,
        sample_rate: u32,
        source: RecordingSource,
        prerecord_secs: u32,
    ) -> Result<()> {
        self.submit(Command::Configure, |args| {
            args.sample_rate = sample_rate;
            args.source = source;
            args.prerecord_secs = prerecord_secs;
        })
    }

    pub fn start(&self, filename: &str) -> Result<()> {
        self.submit(Command::Start, |args| args.filename = filename.to_string())
    }

    pub fn stop(&self) -> Result<()> {
        if !self.status.recording.load(Ordering::Acquire) {
            return Ok(());
        }
        self.submit(Command::Stop, |_| {})
    }

    pub fn pause(&self) -> Result<()> {
        let flags = self.status();
        if !flags.recording {
            warn!("pause when not recording");
            return Ok(());
        }
        if flags.paused {
            warn!("pause when paused");
            return Ok(());
        }
        self.submit(Command::Pause, |_| {})
    }

    pub fn resume(&self) -> Result<()> {
        if !self.status.paused.load(Ordering::Acquire) {
            warn!("resume when not paused");
            return Ok(());
        }
        self.submit(Command::Resume, |_| {})
    }

    /// Close the current file and continue into `filename`.
    pub fn new_file(&self, filename: &str) -> Result<()> {
        self.submit(Command::NewFile, |args| args.filename = filename.to_string())
    }

    pub fn status(&self) -> StatusFlags {
        self.status.flags()
    }

    pub fn state(&self) -> RecorderState {
        self.status.state()
    }

    /// Recorded time excluding pauses; zero when not recording.
    pub fn elapsed(&self) -> Duration {
        self.status.elapsed(self.clock.now())
    }

    /// Logical bytes captured into the current file, pre-roll included.
    pub fn bytes_recorded(&self) -> u64 {
        self.status.bytes_recorded()
    }

    /// Peaks since the previous call. Resets the meter.
    pub fn peaks(&self) -> ChannelPeaks {
        self.status.peaks.take()
    }

    /// Sample rate the hardware delivers for the configured source.
    pub fn sample_rate(&self) -> u32 {
        self.status.sample_rate.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.status.initialized.load(Ordering::Acquire)
    }

    /// Subscribe to live status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<RecorderStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Snapshot of worker and producer counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }
}

impl Drop for PcmRecorder {
    fn drop(&mut self) {
        if self.control.post(Command::Shutdown).is_err() {
            warn!("recorder worker already gone");
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("recorder worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_ring_clamps_preroll_to_zero() {
        // 44.1 kHz, 5 s → 108 chunks requested, but 100 − 250 < 0.
        let preroll = PreRoll::compute(44_100, 5, 100, 250);
        assert_eq!(preroll.chunks, 0);
        assert_eq!(preroll.duration, Duration::ZERO);
    }

    #[test]
    fn preroll_rounds_up_one_chunk() {
        let preroll = PreRoll::compute(44_100, 5, 4_000, 250);
        assert_eq!(preroll.chunks, 44_100 * 5 * 4 / CHUNK_SIZE + 1);
        assert_eq!(preroll.duration, Duration::from_secs(5));
    }

    #[test]
    fn clamped_preroll_recomputes_duration() {
        let preroll = PreRoll::compute(48_000, 30, 400, 250);
        assert_eq!(preroll.chunks, 150);
        let expected = 150.0 * CHUNK_SIZE as f64 / (48_000.0 * 4.0);
        approx::assert_abs_diff_eq!(preroll.duration.as_secs_f64(), expected, epsilon = 1e-6);
    }

    #[test]
    fn zero_seconds_means_no_preroll() {
        assert_eq!(PreRoll::compute(44_100, 0, 4_000, 250), PreRoll::default());
    }

    #[test]
    fn config_defaults_and_camel_case() {
        let config = RecorderConfig::default();
        assert_eq!(config.drain_interval(), Duration::from_millis(25));
        assert_eq!(config.buffer_bytes / CHUNK_SIZE, 4_096);

        let json = serde_json::to_value(&config).expect("serialize config");
        assert_eq!(json["writeThresholdChunks"], 250);

        let partial: RecorderConfig =
            serde_json::from_str(r#"{"haltTimeoutMs": 10}"#).expect("deserialize partial config");
        assert_eq!(partial.halt_timeout(), Duration::from_millis(10));
        assert_eq!(partial.command_queue_depth, 16);
    }
}
