//! The recorder worker thread.
//!
//! ## State machine
//!
//! ```text
//!            init                start                 pause
//!  (closed) ──────► Idle ─────────────────► Recording ───────► Paused
//!                    ▲                        │    ▲  resume     │
//!                    │        stop            │    └─────────────┘
//!                    └──── Stopping ◄─────────┴──────────────────┘
//! ```
//!
//! The worker is the only writer of the normalize and flush cursors, the
//! session, and the open file. It wakes on every command and on a fixed
//! drain tick. Faults latched by the producer (overrun, hardware failure)
//! are observed before each command and on each tick.

use std::io;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::control::{Command, ControlReceiver, StagedArgs};
use super::{PreRoll, RecorderConfig};
use crate::audio::{CaptureHardware, ProducerFault, RecordingSource, TransferEngine, TransferStats};
use crate::buffering::{peak::PeakMeter, ChunkRing, CHUNK_SIZE};
use crate::error::RecorderError;
use crate::ipc::events::{RecorderState, RecorderStatusEvent, StatusFlags};
use crate::storage::{wav::RecordingFileSink, RecordingStorage};

/// Poll interval while waiting for the producer to acknowledge a halt.
const HALT_POLL: Duration = Duration::from_millis(1);

const DEFAULT_SAMPLE_RATE: u32 = 44_100;

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Scalars published by the worker for lock-free reads from any thread.
///
/// Readers may observe a mix of old and new values across fields; every
/// consumer of this struct is display or polling code that tolerates that.
#[derive(Debug, Default)]
pub(crate) struct SharedStatus {
    pub recording: AtomicBool,
    pub paused: AtomicBool,
    pub error: AtomicBool,
    pub stopping: AtomicBool,
    pub initialized: AtomicBool,
    pub sample_rate: AtomicU32,
    start_tick_ns: AtomicU64,
    pause_tick_ns: AtomicU64,
    bytes_recorded: AtomicU64,
    pub peaks: PeakMeter,
}

impl SharedStatus {
    pub fn flags(&self) -> StatusFlags {
        StatusFlags {
            recording: self.recording.load(Ordering::Acquire),
            paused: self.paused.load(Ordering::Acquire),
            error: self.error.load(Ordering::Acquire),
        }
    }

    pub fn state(&self) -> RecorderState {
        let flags = self.flags();
        if self.stopping.load(Ordering::Acquire) {
            RecorderState::Stopping
        } else if flags.recording && flags.paused {
            RecorderState::Paused
        } else if flags.recording {
            RecorderState::Recording
        } else if flags.error {
            RecorderState::Error
        } else {
            RecorderState::Idle
        }
    }

    /// Recording time, excluding pauses. Zero when no session exists.
    pub fn elapsed(&self, now: Duration) -> Duration {
        if !self.recording.load(Ordering::Acquire) {
            return Duration::ZERO;
        }
        let start = Duration::from_nanos(self.start_tick_ns.load(Ordering::Acquire));
        if self.paused.load(Ordering::Acquire) {
            let paused_at = Duration::from_nanos(self.pause_tick_ns.load(Ordering::Acquire));
            paused_at.saturating_sub(start)
        } else {
            now.saturating_sub(start)
        }
    }

    /// Logical bytes captured for the current file. Zero when no session exists.
    pub fn bytes_recorded(&self) -> u64 {
        if self.recording.load(Ordering::Acquire) {
            self.bytes_recorded.load(Ordering::Acquire)
        } else {
            0
        }
    }

    fn set_start_tick(&self, tick: Duration) {
        self.start_tick_ns.store(nanos(tick), Ordering::Release);
    }

    fn set_pause_tick(&self, tick: Duration) {
        self.pause_tick_ns.store(nanos(tick), Ordering::Release);
    }

    fn set_bytes_recorded(&self, bytes: u64) {
        self.bytes_recorded.store(bytes, Ordering::Release);
    }

    fn clear_session(&self) {
        self.recording.store(false, Ordering::Release);
        self.paused.store(false, Ordering::Release);
        self.stopping.store(false, Ordering::Release);
        self.start_tick_ns.store(0, Ordering::Release);
        self.pause_tick_ns.store(0, Ordering::Release);
        self.bytes_recorded.store(0, Ordering::Release);
    }
}

/// Worker counters. Transfer counters are shared with the producer.
#[derive(Debug, Default)]
pub struct RecorderDiagnostics {
    pub chunks_normalized: AtomicUsize,
    pub chunks_flushed: AtomicUsize,
    pub bytes_written: AtomicU64,
    pub overruns: AtomicUsize,
    pub storage_errors: AtomicUsize,
    pub drain_passes: AtomicUsize,
    pub transfer: Arc<TransferStats>,
}

impl RecorderDiagnostics {
    pub fn reset(&self) {
        self.chunks_normalized.store(0, Ordering::Relaxed);
        self.chunks_flushed.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.overruns.store(0, Ordering::Relaxed);
        self.storage_errors.store(0, Ordering::Relaxed);
        self.drain_passes.store(0, Ordering::Relaxed);
        self.transfer.reset();
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            chunks_normalized: self.chunks_normalized.load(Ordering::Relaxed),
            chunks_flushed: self.chunks_flushed.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            drain_passes: self.drain_passes.load(Ordering::Relaxed),
            transfers: self.transfer.transfers.load(Ordering::Relaxed),
            transfer_errors: self.transfer.transfer_errors.load(Ordering::Relaxed),
            dropped_callbacks: self.transfer.dropped_callbacks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub chunks_normalized: usize,
    pub chunks_flushed: usize,
    pub bytes_written: u64,
    pub overruns: usize,
    pub storage_errors: usize,
    pub drain_passes: usize,
    pub transfers: usize,
    pub transfer_errors: usize,
    pub dropped_callbacks: usize,
}

/// Everything the worker needs besides the hardware, which is built on the
/// worker thread itself.
pub(crate) struct WorkerContext {
    pub config: RecorderConfig,
    pub storage: Box<dyn RecordingStorage>,
    pub clock: Arc<dyn Clock>,
    pub status: Arc<SharedStatus>,
    pub diagnostics: Arc<RecorderDiagnostics>,
    pub status_tx: broadcast::Sender<RecorderStatusEvent>,
}

#[derive(Debug, Clone, Copy)]
struct RecordingOptions {
    sample_rate: u32,
    source: RecordingSource,
    prerecord_secs: u32,
    preroll: PreRoll,
}

struct RecordingSession {
    filename: String,
    paused: bool,
    stopping: bool,
    start_tick: Duration,
    pause_tick: Duration,
    bytes_recorded: u64,
}

impl RecordingSession {
    /// Captured chunks count towards `bytes_recorded` only while this holds.
    fn is_capturing(&self) -> bool {
        !self.paused && !self.stopping
    }
}

pub(crate) struct RecorderWorker<H: CaptureHardware> {
    config: RecorderConfig,
    hardware: H,
    storage: Box<dyn RecordingStorage>,
    clock: Arc<dyn Clock>,
    status: Arc<SharedStatus>,
    diagnostics: Arc<RecorderDiagnostics>,
    status_tx: broadcast::Sender<RecorderStatusEvent>,
    seq: u64,
    engine: Option<Arc<TransferEngine>>,
    options: RecordingOptions,
    session: Option<RecordingSession>,
    sink: Option<RecordingFileSink>,
    /// File abandoned after a write failure. Finalized on the next start, init or close.
    stale_sink: Option<RecordingFileSink>,
    seen_transfer_errors: usize,
}

impl<H: CaptureHardware> RecorderWorker<H> {
    pub(crate) fn new(ctx: WorkerContext, hardware: H) -> Self {
        ctx.status
            .sample_rate
            .store(DEFAULT_SAMPLE_RATE, Ordering::Release);
        Self {
            config: ctx.config,
            hardware,
            storage: ctx.storage,
            clock: ctx.clock,
            status: ctx.status,
            diagnostics: ctx.diagnostics,
            status_tx: ctx.status_tx,
            seq: 0,
            engine: None,
            options: RecordingOptions {
                sample_rate: DEFAULT_SAMPLE_RATE,
                source: RecordingSource::default(),
                prerecord_secs: 0,
                preroll: PreRoll::default(),
            },
            session: None,
            sink: None,
            stale_sink: None,
            seen_transfer_errors: 0,
        }
    }

    /// Serve commands until `Shutdown`, draining on every tick.
    pub(crate) fn run(mut self, commands: ControlReceiver) {
        info!("recorder worker started");
        let interval = self.config.drain_interval();
        let mut next_tick = Instant::now() + interval;
        loop {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            if let Some(command) = commands.recv_timeout(timeout) {
                self.observe_faults();
                self.handle(command, commands.staged());
                commands.complete(command);
                if command == Command::Shutdown {
                    break;
                }
            }
            // A busy command stream must not starve the drain.
            if Instant::now() >= next_tick {
                self.tick();
                next_tick = Instant::now() + interval;
            }
        }
        info!("recorder worker stopped");
    }

    fn handle(&mut self, command: Command, args: StagedArgs) {
        debug!(command = command.name(), "command received");
        match command {
            Command::Init => self.init(args.buffer_offset),
            Command::Close | Command::Shutdown => self.close(),
            Command::Configure => {
                self.configure(args.sample_rate, args.source, args.prerecord_secs)
            }
            Command::Start => self.start(args.filename),
            Command::Stop => self.stop(),
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::NewFile => self.new_file(args.filename),
        }
    }

    fn tick(&mut self) {
        self.observe_faults();
        self.drain(false);
    }

    // ── Transitions ──────────────────────────────────────────────────────

    fn init(&mut self, buffer_offset: usize) {
        if self.session.is_some() {
            warn!("init while recording ignored");
            return;
        }
        self.release_engine();
        self.finalize_stale_sink();
        self.diagnostics.reset();
        self.seen_transfer_errors = 0;
        self.status.clear_session();
        self.status.error.store(false, Ordering::Release);
        self.status.initialized.store(false, Ordering::Release);
        self.status.peaks.reset();

        let ring = match ChunkRing::from_buffer(self.config.buffer_bytes, buffer_offset) {
            Ok(ring) => Arc::new(ring),
            Err(e) => {
                self.raise_error(format!("init failed: {e}"));
                return;
            }
        };
        let num_chunks = ring.capacity();
        let engine = Arc::new(TransferEngine::new(
            ring,
            Arc::clone(&self.diagnostics.transfer),
        ));
        if let Err(e) = self.hardware.open(Arc::clone(&engine)) {
            engine.disable();
            self.raise_error(format!("capture open failed: {e}"));
            return;
        }
        // The producer free-runs from here on so pre-roll and meters work before start.
        engine.start();
        self.engine = Some(engine);
        self.options.preroll = PreRoll::compute(
            self.options.sample_rate,
            self.options.prerecord_secs,
            num_chunks,
            self.config.write_threshold_chunks,
        );
        self.status.initialized.store(true, Ordering::Release);
        info!(
            num_chunks,
            buffer_kib = num_chunks * CHUNK_SIZE / 1024,
            preroll_chunks = self.options.preroll.chunks,
            "recorder initialized"
        );
        self.publish(None);
    }

    fn configure(&mut self, sample_rate: u32, source: RecordingSource, prerecord_secs: u32) {
        if self.session.is_some() {
            warn!("configure while recording ignored");
            return;
        }
        let actual = match self.hardware.select_source(source, sample_rate) {
            Ok(rate) => rate,
            Err(e) => {
                self.raise_error(format!("cannot select {source:?}: {e}"));
                return;
            }
        };
        if actual != sample_rate {
            info!(requested = sample_rate, actual, "source dictates sample rate");
        }
        let preroll = PreRoll::compute(
            actual,
            prerecord_secs,
            self.num_chunks(),
            self.config.write_threshold_chunks,
        );
        self.options = RecordingOptions {
            sample_rate: actual,
            source,
            prerecord_secs,
            preroll,
        };
        self.status.sample_rate.store(actual, Ordering::Release);
        info!(
            sample_rate = actual,
            source = ?self.options.source,
            preroll_chunks = preroll.chunks,
            preroll_ms = preroll.duration.as_millis() as u64,
            "recording options set"
        );
    }

    fn start(&mut self, filename: String) {
        if self.session.is_some() {
            warn!(file = %filename, "start while already recording ignored");
            return;
        }
        let Some(engine) = self.engine.clone() else {
            warn!(file = %filename, "start before init ignored");
            return;
        };
        self.finalize_stale_sink();
        if engine.halted() && !engine.is_disabled() {
            debug!("producer halted outside a session; re-arming");
            self.restart_producer();
        }

        let rate = self.options.sample_rate;
        let sink = match RecordingFileSink::create(self.storage.as_mut(), &filename, rate) {
            Ok(sink) => sink,
            Err(e) => {
                self.diagnostics.storage_errors.fetch_add(1, Ordering::Relaxed);
                self.raise_error(format!("cannot create {filename}: {e}"));
                return;
            }
        };

        let ring = engine.ring();
        let (normalized, _) = ring.normalize_pending();
        self.diagnostics
            .chunks_normalized
            .fetch_add(normalized, Ordering::Relaxed);
        let requested = self.options.preroll;
        let chunks = ring.retain_preroll(requested.chunks);
        let preroll = if chunks < requested.chunks {
            PreRoll::duration_of(chunks, rate)
        } else {
            requested.duration
        };

        let start_tick = self.clock.now().saturating_sub(preroll);
        let bytes_recorded = (chunks * CHUNK_SIZE) as u64;
        self.status.peaks.reset();
        self.status.set_start_tick(start_tick);
        self.status.set_pause_tick(Duration::ZERO);
        self.status.set_bytes_recorded(bytes_recorded);
        self.status.paused.store(false, Ordering::Release);
        self.status.stopping.store(false, Ordering::Release);
        self.status.recording.store(true, Ordering::Release);

        info!(
            file = %filename,
            sample_rate = rate,
            preroll_chunks = chunks,
            preroll_ms = preroll.as_millis() as u64,
            "recording started"
        );
        self.session = Some(RecordingSession {
            filename,
            paused: false,
            stopping: false,
            start_tick,
            pause_tick: Duration::ZERO,
            bytes_recorded,
        });
        self.sink = Some(sink);
        self.publish(None);
    }

    fn stop(&mut self) {
        if self.session.is_none() {
            debug!("stop while idle");
            return;
        }
        self.stop_session(true, None);
    }

    fn pause(&mut self) {
        match &self.session {
            None => {
                warn!("pause while not recording ignored");
                return;
            }
            Some(session) if session.paused => {
                warn!("pause while paused ignored");
                return;
            }
            Some(_) => {}
        }
        self.halt_producer();
        let now = self.clock.now();
        if let Some(session) = self.session.as_mut() {
            session.paused = true;
            session.pause_tick = now;
        }
        self.status.set_pause_tick(now);
        self.status.paused.store(true, Ordering::Release);
        if !self.drain(true) {
            return;
        }
        info!("recording paused");
        self.publish(None);
    }

    fn resume(&mut self) {
        let now = self.clock.now();
        let Some(session) = self.session.as_mut().filter(|s| s.paused) else {
            warn!("resume while not paused ignored");
            return;
        };
        // Shift the start forward so elapsed time excludes the pause.
        session.start_tick += now.saturating_sub(session.pause_tick);
        session.paused = false;
        self.status.set_start_tick(session.start_tick);
        self.status.paused.store(false, Ordering::Release);
        if let Some(engine) = &self.engine {
            engine.start();
        }
        info!("recording resumed");
        self.publish(None);
    }

    fn new_file(&mut self, filename: String) {
        let now = self.clock.now();
        let Some(session) = self.session.as_mut() else {
            warn!(file = %filename, "new file while not recording ignored");
            return;
        };
        // Approximate: the flush below delays the first bytes of the new file.
        session.start_tick = now;
        session.bytes_recorded = 0;
        if session.paused {
            session.pause_tick = now;
            self.status.set_pause_tick(now);
        }
        self.status.set_start_tick(now);
        self.status.set_bytes_recorded(0);

        if !self.drain(true) {
            return;
        }
        if let Some(sink) = self.sink.take() {
            self.close_sink(sink);
        }

        let rate = self.options.sample_rate;
        match RecordingFileSink::create(self.storage.as_mut(), &filename, rate) {
            Ok(sink) => {
                info!(file = %filename, "switched to new file");
                self.sink = Some(sink);
                if let Some(session) = self.session.as_mut() {
                    session.filename = filename;
                }
                self.publish(None);
            }
            Err(e) => {
                self.diagnostics.storage_errors.fetch_add(1, Ordering::Relaxed);
                self.raise_error(format!("cannot create {filename}: {e}"));
                self.stop();
            }
        }
    }

    fn close(&mut self) {
        if self.session.is_some() {
            self.stop_session(false, None);
        }
        self.finalize_stale_sink();
        self.release_engine();
        self.status.initialized.store(false, Ordering::Release);
        info!("recorder closed");
        self.publish(None);
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    /// Halt (unless paused), flush, close the file and end the session.
    fn stop_session(&mut self, restart: bool, detail: Option<String>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.stopping = true;
        let paused = session.paused;
        self.status.stopping.store(true, Ordering::Release);
        self.publish(None);

        if !paused {
            self.halt_producer();
        }
        if !self.drain(true) {
            return;
        }
        if let Some(sink) = self.sink.take() {
            self.close_sink(sink);
        }
        let filename = self.end_session();
        if restart {
            self.restart_producer();
        }
        info!(file = filename.as_deref().unwrap_or(""), "recording stopped");
        self.publish(detail);
    }

    /// Ask the producer to halt after its in-flight transfer and wait for it.
    fn halt_producer(&self) {
        let Some(engine) = &self.engine else {
            return;
        };
        engine.stop_after_current();
        let deadline = Instant::now() + self.config.halt_timeout();
        while !engine.halted() {
            if Instant::now() >= deadline {
                warn!(
                    timeout_ms = self.config.halt_timeout_ms,
                    "producer did not acknowledge halt; forcing"
                );
                engine.force_halt();
                break;
            }
            thread::sleep(HALT_POLL);
        }
    }

    fn restart_producer(&self) {
        if let Some(engine) = &self.engine {
            engine.force_halt();
            if !engine.start() {
                warn!("producer disabled; not restarting");
            }
        }
    }

    fn release_engine(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.disable();
            self.hardware.close();
        }
    }

    fn end_session(&mut self) -> Option<String> {
        let session = self.session.take()?;
        self.status.clear_session();
        Some(session.filename)
    }

    fn close_sink(&mut self, sink: RecordingFileSink) {
        let name = sink.name().to_string();
        let bytes = sink.data_bytes();
        match sink.close() {
            Ok(()) => info!(file = %name, bytes, "recording file closed"),
            Err(e) => {
                self.diagnostics.storage_errors.fetch_add(1, Ordering::Relaxed);
                self.raise_error(format!("cannot finalize {name}: {e}"));
            }
        }
    }

    fn finalize_stale_sink(&mut self) {
        if let Some(stale) = self.stale_sink.take() {
            let name = stale.name().to_string();
            match stale.close() {
                Ok(()) => debug!(file = %name, "stale recording file finalized"),
                Err(e) => warn!(file = %name, "stale recording file could not be finalized: {e}"),
            }
        }
    }

    /// Give up on the session after a failed write. The file is kept as a
    /// stale handle and the producer goes back to free-running.
    fn abandon_session(&mut self, detail: String) {
        self.diagnostics.storage_errors.fetch_add(1, Ordering::Relaxed);
        error!(%detail, "storage failure; recording abandoned");
        if let Some(engine) = &self.engine {
            engine.force_halt();
            engine.ring().discard_normalized();
        }
        self.stale_sink = self.sink.take();
        self.status.error.store(true, Ordering::Release);
        self.end_session();
        self.restart_producer();
        self.publish(Some(detail));
    }

    fn raise_error(&mut self, detail: String) {
        error!(%detail, "recorder error");
        self.status.error.store(true, Ordering::Release);
        self.publish(Some(detail));
    }

    fn observe_faults(&mut self) {
        let Some(engine) = self.engine.clone() else {
            return;
        };
        let errors = self.diagnostics.transfer.transfer_errors.load(Ordering::Relaxed);
        if errors > self.seen_transfer_errors {
            warn!(
                new = errors - self.seen_transfer_errors,
                total = errors,
                "capture transfer errors"
            );
            self.seen_transfer_errors = errors;
        }

        match engine.take_fault() {
            None => {}
            Some(ProducerFault::Overrun) => {
                self.diagnostics.overruns.fetch_add(1, Ordering::Relaxed);
                if self.session.is_some() {
                    error!(
                        write = engine.ring().write_cursor(),
                        flush = engine.ring().flush_cursor(),
                        "ring overrun; stopping recording"
                    );
                    self.status.error.store(true, Ordering::Release);
                    self.stop_session(true, Some(RecorderError::Overrun.to_string()));
                } else {
                    warn!("ring overrun while idle; restarting producer");
                    self.drain(false);
                    self.restart_producer();
                }
            }
            Some(ProducerFault::Hardware) => {
                let detail = "capture hardware failed".to_string();
                error!("{detail}");
                self.status.error.store(true, Ordering::Release);
                if self.session.is_some() {
                    self.stop_session(true, Some(detail));
                } else {
                    self.restart_producer();
                    self.publish(Some(detail));
                }
            }
        }
    }

    /// Normalize everything captured, then persist what is ready.
    ///
    /// Non-forced passes only write once free space drops to the threshold,
    /// and discard instead of writing while no session is capturing.
    /// Returns `false` if a write failed and the session was abandoned.
    fn drain(&mut self, forced: bool) -> bool {
        let Some(engine) = self.engine.clone() else {
            return true;
        };
        let ring = engine.ring();
        self.diagnostics.drain_passes.fetch_add(1, Ordering::Relaxed);

        let (normalized, peaks) = ring.normalize_pending();
        if normalized > 0 {
            self.status.peaks.record(peaks);
            self.diagnostics
                .chunks_normalized
                .fetch_add(normalized, Ordering::Relaxed);
            if let Some(session) = self.session.as_mut().filter(|s| s.is_capturing()) {
                session.bytes_recorded += (normalized * CHUNK_SIZE) as u64;
                self.status.set_bytes_recorded(session.bytes_recorded);
            }
        }

        let capturing = self
            .session
            .as_ref()
            .is_some_and(RecordingSession::is_capturing);
        if !capturing && !forced {
            ring.discard_normalized();
            return true;
        }

        let ready = ring.ready_for_flush();
        if ready == 0 || (!forced && ring.free_chunks() > self.config.write_threshold_chunks) {
            return true;
        }
        let Some(sink) = self.sink.as_mut() else {
            ring.discard_normalized();
            return true;
        };

        debug!(chunks = ready, forced, flush = ring.flush_cursor(), "writing chunks");
        let mut flushed = 0;
        let result = flush_ready(ring, sink, ready, &mut flushed);
        let name = sink.name().to_string();
        self.diagnostics
            .chunks_flushed
            .fetch_add(flushed, Ordering::Relaxed);
        self.diagnostics
            .bytes_written
            .fetch_add((flushed * CHUNK_SIZE) as u64, Ordering::Relaxed);

        match result {
            Ok(()) => true,
            Err(e) => {
                self.abandon_session(format!("write to {name} failed: {e}"));
                false
            }
        }
    }

    fn num_chunks(&self) -> usize {
        self.engine
            .as_ref()
            .map(|engine| engine.ring().capacity())
            .unwrap_or(0)
    }

    fn publish(&mut self, detail: Option<String>) {
        self.seq += 1;
        let _ = self.status_tx.send(RecorderStatusEvent {
            seq: self.seq,
            state: self.status.state(),
            flags: self.status.flags(),
            detail,
        });
    }
}

fn flush_ready(
    ring: &ChunkRing,
    sink: &mut RecordingFileSink,
    ready: usize,
    flushed: &mut usize,
) -> io::Result<()> {
    for _ in 0..ready {
        if !ring.flush_one(|bytes| sink.append(bytes))? {
            break;
        }
        *flushed += 1;
    }
    sink.sync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::{SimulatedCapture, SimulatedCaptureHandle};
    use crate::audio::TransferOutcome;
    use crate::buffering::BUFFER_GUARD_BYTES;
    use crate::engine::clock::ManualClock;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::wav::HEADER_LEN;

    struct Rig {
        worker: RecorderWorker<SimulatedCapture>,
        capture: SimulatedCaptureHandle,
        storage: MemoryStorage,
        clock: Arc<ManualClock>,
        status: Arc<SharedStatus>,
        diagnostics: Arc<RecorderDiagnostics>,
    }

    fn rig(chunks: usize, write_threshold_chunks: usize) -> Rig {
        let config = RecorderConfig {
            buffer_bytes: chunks * CHUNK_SIZE + BUFFER_GUARD_BYTES,
            write_threshold_chunks,
            halt_timeout_ms: 50,
            ..RecorderConfig::default()
        };
        let (hardware, capture) = SimulatedCapture::manual();
        let storage = MemoryStorage::new();
        let clock = Arc::new(ManualClock::new(Duration::from_secs(100)));
        let status = Arc::new(SharedStatus::default());
        let diagnostics = Arc::new(RecorderDiagnostics::default());
        let (status_tx, _) = broadcast::channel(64);
        let worker = RecorderWorker::new(
            WorkerContext {
                config,
                storage: Box::new(storage.clone()),
                clock: clock.clone(),
                status: Arc::clone(&status),
                diagnostics: Arc::clone(&diagnostics),
                status_tx,
            },
            hardware,
        );
        Rig {
            worker,
            capture,
            storage,
            clock,
            status,
            diagnostics,
        }
    }

    fn data_len(bytes: &[u8]) -> u32 {
        u32::from_le_bytes(bytes[40..44].try_into().unwrap())
    }

    impl Rig {
        fn send(&mut self, command: Command, stage: impl FnOnce(&mut StagedArgs)) {
            let mut args = StagedArgs::default();
            stage(&mut args);
            self.worker.observe_faults();
            self.worker.handle(command, args);
        }

        fn init(&mut self) {
            self.send(Command::Init, |_| {});
        }

        fn configure(&mut self, rate: u32, prerecord_secs: u32) {
            self.send(Command::Configure, |a| {
                a.sample_rate = rate;
                a.source = RecordingSource::LineIn;
                a.prerecord_secs = prerecord_secs;
            });
        }

        fn start(&mut self, name: &str) {
            self.send(Command::Start, |a| a.filename = name.into());
        }
    }

    #[test]
    fn idle_ticks_discard_but_preroll_survives() {
        let mut rig = rig(16, 0);
        rig.configure(44_100, 1);
        rig.init();
        assert_eq!(rig.worker.options.preroll.chunks, 16);

        assert_eq!(rig.capture.pump(5, 300), 5);
        rig.worker.tick();
        let ring = Arc::clone(rig.worker.engine.as_ref().unwrap().ring());
        assert_eq!(ring.pending_for_flush(), 0, "idle drain fakes buffer clearing");
        assert!(rig.status.peaks.take().left >= 300);

        rig.start("pre.wav");
        assert!(rig.status.flags().recording);
        assert_eq!(ring.ready_for_flush(), 5);
        assert_eq!(rig.status.bytes_recorded(), 5 * CHUNK_SIZE as u64);
        let expected = PreRoll::duration_of(5, 44_100);
        assert_eq!(rig.status.elapsed(rig.clock.now()), expected);
    }

    #[test]
    fn writes_wait_for_low_water_mark() {
        let mut rig = rig(16, 4);
        rig.init();
        rig.start("t.wav");

        assert_eq!(rig.capture.pump(10, 1), 10);
        rig.worker.tick();
        assert_eq!(rig.diagnostics.snapshot().chunks_flushed, 0);
        assert_eq!(rig.status.bytes_recorded(), 10 * CHUNK_SIZE as u64);

        assert_eq!(rig.capture.pump(2, 1), 2);
        rig.worker.tick();
        assert_eq!(rig.diagnostics.snapshot().chunks_flushed, 12);
        assert_eq!(
            rig.storage.file("t.wav").unwrap().len(),
            HEADER_LEN + 12 * CHUNK_SIZE
        );
    }

    #[test]
    fn overrun_stops_session_and_keeps_captured_chunks() {
        let mut rig = rig(8, 0);
        rig.init();
        rig.start("o.wav");
        assert_eq!(rig.capture.pump(10, 7), 7);

        rig.worker.tick();
        let flags = rig.status.flags();
        assert!(flags.error);
        assert!(!flags.recording);
        assert_eq!(rig.diagnostics.snapshot().overruns, 1);

        let bytes = rig.storage.file("o.wav").unwrap();
        assert_eq!(data_len(&bytes), (7 * CHUNK_SIZE) as u32);
        let engine = rig.worker.engine.as_ref().unwrap();
        assert!(!engine.halted(), "producer free-runs again after the stop");
    }

    #[test]
    fn hardware_fault_stops_session_and_producer_free_runs_again() {
        let mut rig = rig(16, 0);
        rig.init();
        rig.start("a.wav");
        assert_eq!(rig.capture.pump(2, 1), 2);

        rig.capture.fatal_error();
        rig.worker.tick();
        let flags = rig.status.flags();
        assert!(flags.error);
        assert!(!flags.recording);
        assert_eq!(
            data_len(&rig.storage.file("a.wav").unwrap()),
            (2 * CHUNK_SIZE) as u32
        );
        assert!(!rig.worker.engine.as_ref().unwrap().halted());

        rig.start("b.wav");
        assert!(rig.status.flags().recording);
        assert_eq!(rig.capture.pump(3, 500), 3);
        rig.worker.tick();
        rig.send(Command::Stop, |_| {});
        assert_eq!(
            data_len(&rig.storage.file("b.wav").unwrap()),
            (3 * CHUNK_SIZE) as u32
        );
        assert!(rig.status.peaks.take().left >= 500);
    }

    #[test]
    fn hardware_fault_while_idle_keeps_meters_running() {
        let mut rig = rig(16, 0);
        rig.init();
        rig.capture.fatal_error();
        assert!(rig.worker.engine.as_ref().unwrap().halted());

        rig.worker.tick();
        assert_eq!(rig.status.state(), RecorderState::Error);
        assert_eq!(rig.capture.pump(2, 900), 2);
        rig.worker.tick();
        assert!(rig.status.peaks.take().left >= 900);
    }

    #[test]
    fn transient_transfer_error_keeps_recording() {
        let mut rig = rig(16, 0);
        rig.init();
        rig.start("t.wav");
        rig.capture.pump(2, 1);

        assert_eq!(rig.capture.transfer_error(), Some(TransferOutcome::Rearmed));
        rig.worker.tick();
        let flags = rig.status.flags();
        assert!(flags.recording);
        assert!(!flags.error);

        rig.capture.pump(1, 1);
        rig.send(Command::Stop, |_| {});
        assert_eq!(
            data_len(&rig.storage.file("t.wav").unwrap()),
            (3 * CHUNK_SIZE) as u32
        );
        assert_eq!(rig.diagnostics.snapshot().transfer_errors, 1);
    }

    #[test]
    fn write_failure_abandons_session_and_finalizes_stale_file_later() {
        let mut rig = rig(16, 0);
        rig.init();
        rig.storage
            .set_capacity(Some((HEADER_LEN + CHUNK_SIZE + 8) as u64));
        rig.start("a.wav");
        rig.capture.pump(3, 1);

        rig.send(Command::Stop, |_| {});
        let flags = rig.status.flags();
        assert!(flags.error);
        assert!(!flags.recording);
        assert!(rig.worker.stale_sink.is_some());
        assert_eq!(rig.diagnostics.snapshot().storage_errors, 1);

        rig.storage.set_capacity(None);
        rig.start("b.wav");
        assert!(rig.worker.stale_sink.is_none());
        let a = rig.storage.file("a.wav").unwrap();
        assert_eq!(data_len(&a), CHUNK_SIZE as u32);
        assert!(rig.status.flags().error, "error stays set until init");

        rig.send(Command::Stop, |_| {});
        rig.init();
        assert!(!rig.status.flags().error);
    }

    #[test]
    fn misuse_commands_are_no_ops() {
        let mut rig = rig(16, 0);
        rig.send(Command::Start, |a| a.filename = "early.wav".into());
        assert_eq!(rig.storage.create_count(), 0);

        rig.init();
        rig.send(Command::Pause, |_| {});
        rig.send(Command::Resume, |_| {});
        rig.send(Command::Stop, |_| {});
        rig.send(Command::NewFile, |a| a.filename = "x.wav".into());
        assert_eq!(rig.storage.create_count(), 0);
        assert_eq!(rig.status.state(), RecorderState::Idle);

        rig.start("one.wav");
        rig.start("two.wav");
        assert_eq!(rig.storage.file_names(), vec!["one.wav".to_string()]);
    }

    #[test]
    fn pause_flushes_and_halts_producer() {
        let mut rig = rig(16, 0);
        rig.init();
        rig.start("p.wav");
        rig.capture.pump(3, 1);

        rig.send(Command::Pause, |_| {});
        assert_eq!(rig.status.state(), RecorderState::Paused);
        assert!(rig.worker.engine.as_ref().unwrap().halted());
        assert_eq!(rig.diagnostics.snapshot().chunks_flushed, 3);
        assert_eq!(rig.capture.pump(2, 1), 0, "halted producer accepts nothing");

        rig.clock.advance(Duration::from_secs(4));
        rig.send(Command::Resume, |_| {});
        assert_eq!(rig.status.state(), RecorderState::Recording);
        assert_eq!(rig.capture.pump(2, 1), 2);
    }

    #[test]
    fn new_file_while_paused_keeps_paused_and_resets_elapsed() {
        let mut rig = rig(16, 0);
        rig.init();
        rig.start("first.wav");
        rig.capture.pump(2, 1);
        rig.clock.advance(Duration::from_secs(3));
        rig.send(Command::Pause, |_| {});
        rig.clock.advance(Duration::from_secs(2));

        rig.send(Command::NewFile, |a| a.filename = "second.wav".into());
        let flags = rig.status.flags();
        assert!(flags.recording && flags.paused);
        assert_eq!(rig.status.elapsed(rig.clock.now()), Duration::ZERO);
        assert_eq!(rig.status.bytes_recorded(), 0);
        let first = rig.storage.file("first.wav").unwrap();
        assert_eq!(data_len(&first), (2 * CHUNK_SIZE) as u32);

        rig.clock.advance(Duration::from_secs(5));
        rig.send(Command::Resume, |_| {});
        rig.clock.advance(Duration::from_secs(1));
        assert_eq!(rig.status.elapsed(rig.clock.now()), Duration::from_secs(1));
    }

    #[test]
    fn failed_new_file_falls_back_to_stop() {
        let mut rig = rig(16, 0);
        rig.init();
        rig.start("keep.wav");
        rig.capture.pump(1, 1);
        rig.storage.fail_creates(true);

        rig.send(Command::NewFile, |a| a.filename = "nope.wav".into());
        let flags = rig.status.flags();
        assert!(flags.error);
        assert!(!flags.recording);
        let keep = rig.storage.file("keep.wav").unwrap();
        assert_eq!(data_len(&keep), CHUNK_SIZE as u32);
    }

    #[test]
    fn close_disables_producer() {
        let mut rig = rig(16, 0);
        rig.init();
        rig.start("c.wav");
        rig.capture.pump(1, 1);
        let engine = Arc::clone(rig.worker.engine.as_ref().unwrap());

        rig.send(Command::Close, |_| {});
        assert!(engine.is_disabled());
        assert!(rig.capture.engine().is_none());
        assert!(!rig.status.initialized.load(Ordering::Acquire));
        assert_eq!(
            data_len(&rig.storage.file("c.wav").unwrap()),
            CHUNK_SIZE as u32
        );
    }
}
