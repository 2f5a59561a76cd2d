//! Capture producer: the transfer engine shared with the hardware callback.
//!
//! # Callback contract
//!
//! The hardware side runs at interrupt priority (or on an OS audio thread).
//! It **must not**:
//! - Allocate heap memory
//! - Block on a mutex or condvar
//! - Perform I/O or log
//!
//! `TransferEngine` satisfies that by using `try_lock` only. On each completed
//! transfer the callback calls [`TransferEngine::on_transfer_complete`], which
//! commits the chunk via `ChunkRing::advance_write` and either re-arms the next
//! slot, halts on request, or halts on overrun. A bad transfer calls
//! [`TransferEngine::on_transfer_error`] and the same slot is re-armed.
//!
//! The worker never touches hardware registers; it only flips the engine
//! between running and halted and observes faults on its next tick.

pub mod simulated;

#[cfg(feature = "audio-cpal")]
pub mod capture;

use std::sync::{
    atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::buffering::{chunk::encode_native, ChunkRing, CHUNK_SIZE};
use crate::error::Result;

/// Input routed into the capture path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingSource {
    #[default]
    Microphone,
    LineIn,
    /// S/PDIF-style digital input; the sample rate follows the source.
    Digital,
}

/// Platform side of the capture producer.
///
/// Implementations are constructed on the worker thread and never leave it,
/// so they need not be `Send` (cpal streams are not).
pub trait CaptureHardware {
    /// Route capture into `engine` and begin delivering transfers.
    ///
    /// Called on init. Any previously opened engine is replaced.
    fn open(&mut self, engine: Arc<TransferEngine>) -> Result<()>;

    /// Select the capture input. Returns the sample rate the hardware will
    /// actually deliver, which may differ from `requested_rate`.
    fn select_source(&mut self, source: RecordingSource, requested_rate: u32) -> Result<u32>;

    /// Stop delivering transfers and release the interrupt source.
    fn close(&mut self);
}

/// Outcome of one completed or failed transfer, reported to the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Next slot armed; keep transferring.
    Rearmed,
    /// Halt request honoured; stop transferring.
    Halted,
    /// Ring is full; the chunk was dropped and transfers stopped.
    Overrun,
    /// Engine not running; the transfer was ignored.
    Ignored,
}

/// Fault latched by the producer for the worker to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerFault {
    Overrun,
    Hardware,
}

const FAULT_NONE: u8 = 0;
const FAULT_OVERRUN: u8 = 1;
const FAULT_HARDWARE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferState {
    /// Interrupt source released; only a new engine can run again.
    Disabled,
    Halted,
    Running,
    /// Halt after the in-flight transfer completes.
    Stopping,
}

struct Transfer {
    state: TransferState,
    /// Bytes committed to the in-flight slot by streaming producers.
    fill: usize,
}

/// Counters that outlive any single engine; shared with diagnostics.
#[derive(Debug, Default)]
pub struct TransferStats {
    pub transfers: AtomicUsize,
    pub transfer_errors: AtomicUsize,
    pub dropped_callbacks: AtomicUsize,
}

impl TransferStats {
    pub fn reset(&self) {
        self.transfers.store(0, Ordering::Relaxed);
        self.transfer_errors.store(0, Ordering::Relaxed);
        self.dropped_callbacks.store(0, Ordering::Relaxed);
    }
}

/// One capture channel feeding one [`ChunkRing`].
pub struct TransferEngine {
    ring: Arc<ChunkRing>,
    transfer: Mutex<Transfer>,
    /// Mirrors `state ∈ {Halted, Disabled}` for lock-free polling.
    halted: AtomicBool,
    fault: AtomicU8,
    stats: Arc<TransferStats>,
}

impl TransferEngine {
    pub fn new(ring: Arc<ChunkRing>, stats: Arc<TransferStats>) -> Self {
        Self {
            ring,
            transfer: Mutex::new(Transfer {
                state: TransferState::Halted,
                fill: 0,
            }),
            halted: AtomicBool::new(true),
            fault: AtomicU8::new(FAULT_NONE),
            stats,
        }
    }

    pub fn ring(&self) -> &Arc<ChunkRing> {
        &self.ring
    }

    // ── Worker side ──────────────────────────────────────────────────────

    /// Arm transfers into the slot at the write cursor. Clears pre-roll history.
    ///
    /// Returns `false` if the engine has been disabled.
    pub fn start(&self) -> bool {
        let mut t = self.transfer.lock();
        if t.state == TransferState::Disabled {
            return false;
        }
        self.ring.reset_buffered();
        t.fill = 0;
        t.state = TransferState::Running;
        self.halted.store(false, Ordering::Release);
        true
    }

    /// Ask the producer to halt once the in-flight transfer completes.
    ///
    /// A transfer is in flight once bytes have been committed to the target
    /// slot; with nothing committed the engine halts immediately.
    pub fn stop_after_current(&self) {
        let mut t = self.transfer.lock();
        if t.state != TransferState::Running {
            return;
        }
        if t.fill == 0 {
            self.halt_locked(&mut t);
        } else {
            t.state = TransferState::Stopping;
        }
    }

    /// Abandon the in-flight transfer and halt now.
    pub fn force_halt(&self) {
        let mut t = self.transfer.lock();
        if t.state != TransferState::Disabled {
            t.fill = 0;
            self.halt_locked(&mut t);
        }
    }

    /// Release the engine permanently.
    pub fn disable(&self) {
        let mut t = self.transfer.lock();
        t.state = TransferState::Disabled;
        t.fill = 0;
        self.halted.store(true, Ordering::Release);
    }

    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn is_disabled(&self) -> bool {
        self.transfer.lock().state == TransferState::Disabled
    }

    /// Take the latched fault, if any.
    pub fn take_fault(&self) -> Option<ProducerFault> {
        match self.fault.swap(FAULT_NONE, Ordering::AcqRel) {
            FAULT_OVERRUN => Some(ProducerFault::Overrun),
            FAULT_HARDWARE => Some(ProducerFault::Hardware),
            _ => None,
        }
    }

    fn halt_locked(&self, t: &mut Transfer) {
        t.state = TransferState::Halted;
        self.halted.store(true, Ordering::Release);
    }

    // ── Producer side ────────────────────────────────────────────────────

    /// The hardware filled the target slot: commit it and re-arm.
    pub fn on_transfer_complete(&self) -> TransferOutcome {
        let Some(mut t) = self.transfer.try_lock() else {
            self.stats.dropped_callbacks.fetch_add(1, Ordering::Relaxed);
            return TransferOutcome::Ignored;
        };
        self.complete_locked(&mut t)
    }

    /// A transfer failed. The same slot is re-armed unless a halt is pending.
    pub fn on_transfer_error(&self) -> TransferOutcome {
        self.stats.transfer_errors.fetch_add(1, Ordering::Relaxed);
        let Some(mut t) = self.transfer.try_lock() else {
            self.stats.dropped_callbacks.fetch_add(1, Ordering::Relaxed);
            return TransferOutcome::Ignored;
        };
        t.fill = 0;
        match t.state {
            TransferState::Running => TransferOutcome::Rearmed,
            TransferState::Stopping => {
                self.halt_locked(&mut t);
                TransferOutcome::Halted
            }
            TransferState::Halted | TransferState::Disabled => TransferOutcome::Ignored,
        }
    }

    /// The hardware cannot continue. Halts and latches a fault for the worker.
    pub fn on_fatal_error(&self) {
        self.stats.transfer_errors.fetch_add(1, Ordering::Relaxed);
        self.fault.store(FAULT_HARDWARE, Ordering::Release);
        if let Some(mut t) = self.transfer.try_lock() {
            if t.state != TransferState::Disabled {
                t.fill = 0;
                self.halt_locked(&mut t);
            }
        }
    }

    /// Let a block-transfer producer fill the target slot directly, then
    /// commit it. `fill` receives the whole chunk.
    pub fn transfer_block<F>(&self, fill: F) -> TransferOutcome
    where
        F: FnOnce(&mut [u8]),
    {
        let Some(mut t) = self.transfer.try_lock() else {
            self.stats.dropped_callbacks.fetch_add(1, Ordering::Relaxed);
            return TransferOutcome::Ignored;
        };
        if !matches!(t.state, TransferState::Running | TransferState::Stopping) {
            return TransferOutcome::Ignored;
        }
        {
            let Some(mut slot) = self.ring.try_lock_target() else {
                self.stats.dropped_callbacks.fetch_add(1, Ordering::Relaxed);
                return TransferOutcome::Ignored;
            };
            fill(&mut slot[..]);
        }
        self.complete_locked(&mut t)
    }

    /// Stream interleaved stereo samples into the ring, completing a
    /// transfer each time a slot fills. Used by callback-driven backends
    /// that deliver arbitrary block sizes.
    ///
    /// Returns the number of samples accepted; the rest are dropped when the
    /// engine halts part-way.
    pub fn write_samples(&self, mut samples: &[i16]) -> usize {
        let Some(mut t) = self.transfer.try_lock() else {
            self.stats.dropped_callbacks.fetch_add(1, Ordering::Relaxed);
            return 0;
        };
        let mut accepted = 0;
        while !samples.is_empty()
            && matches!(t.state, TransferState::Running | TransferState::Stopping)
        {
            let written = {
                let Some(mut slot) = self.ring.try_lock_target() else {
                    self.stats.dropped_callbacks.fetch_add(1, Ordering::Relaxed);
                    break;
                };
                encode_native(samples, &mut slot[t.fill..])
            };
            t.fill += written * 2;
            accepted += written;
            samples = &samples[written..];
            if t.fill >= CHUNK_SIZE && self.complete_locked(&mut t) != TransferOutcome::Rearmed {
                break;
            }
        }
        accepted
    }

    fn complete_locked(&self, t: &mut Transfer) -> TransferOutcome {
        match t.state {
            TransferState::Running | TransferState::Stopping => {}
            TransferState::Halted | TransferState::Disabled => return TransferOutcome::Ignored,
        }
        t.fill = 0;
        self.stats.transfers.fetch_add(1, Ordering::Relaxed);
        if !self.ring.advance_write() {
            self.fault.store(FAULT_OVERRUN, Ordering::Release);
            self.halt_locked(t);
            return TransferOutcome::Overrun;
        }
        if t.state == TransferState::Stopping {
            self.halt_locked(t);
            return TransferOutcome::Halted;
        }
        TransferOutcome::Rearmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(chunks: usize) -> TransferEngine {
        let ring = Arc::new(ChunkRing::with_chunks(chunks).unwrap());
        TransferEngine::new(ring, Arc::new(TransferStats::default()))
    }

    #[test]
    fn new_engine_is_halted_until_started() {
        let e = engine(4);
        assert!(e.halted());
        assert_eq!(e.transfer_block(|_| {}), TransferOutcome::Ignored);
        assert!(e.start());
        assert!(!e.halted());
        assert_eq!(e.transfer_block(|_| {}), TransferOutcome::Rearmed);
        assert_eq!(e.ring().write_cursor(), 1);
    }

    #[test]
    fn idle_engine_halts_immediately_on_request() {
        let e = engine(4);
        e.start();
        e.stop_after_current();
        assert!(e.halted());
    }

    #[test]
    fn streaming_producer_finishes_in_flight_chunk_before_halting() {
        let e = engine(4);
        e.start();
        let half = vec![1i16; CHUNK_SIZE / 4];
        assert_eq!(e.write_samples(&half), half.len());
        e.stop_after_current();
        assert!(!e.halted());

        assert_eq!(e.write_samples(&half), half.len());
        assert!(e.halted());
        assert_eq!(e.ring().write_cursor(), 1);
        assert_eq!(e.write_samples(&half), 0);
    }

    #[test]
    fn streaming_spans_multiple_slots() {
        let e = engine(8);
        e.start();
        let samples = vec![5i16; CHUNK_SIZE / 2 * 3 + 10];
        assert_eq!(e.write_samples(&samples), samples.len());
        assert_eq!(e.ring().write_cursor(), 3);
    }

    #[test]
    fn overrun_halts_and_latches_fault() {
        let e = engine(4);
        e.start();
        for _ in 0..3 {
            assert_eq!(e.transfer_block(|_| {}), TransferOutcome::Rearmed);
        }
        assert_eq!(e.transfer_block(|_| {}), TransferOutcome::Overrun);
        assert!(e.halted());
        assert_eq!(e.take_fault(), Some(ProducerFault::Overrun));
        assert_eq!(e.take_fault(), None);
        assert_eq!(e.ring().pending_for_flush(), 3);
    }

    #[test]
    fn transfer_error_rearms_same_slot() {
        let stats = Arc::new(TransferStats::default());
        let ring = Arc::new(ChunkRing::with_chunks(4).unwrap());
        let e = TransferEngine::new(Arc::clone(&ring), Arc::clone(&stats));
        e.start();
        assert_eq!(e.on_transfer_error(), TransferOutcome::Rearmed);
        assert_eq!(ring.write_cursor(), 0);
        assert_eq!(stats.transfer_errors.load(Ordering::Relaxed), 1);
        assert!(!e.halted());
    }

    #[test]
    fn fatal_error_halts_and_latches() {
        let e = engine(4);
        e.start();
        e.on_fatal_error();
        assert!(e.halted());
        assert_eq!(e.take_fault(), Some(ProducerFault::Hardware));
    }

    #[test]
    fn disabled_engine_cannot_restart() {
        let e = engine(4);
        e.start();
        e.disable();
        assert!(e.is_disabled());
        assert!(!e.start());
        assert!(e.halted());
    }
}
