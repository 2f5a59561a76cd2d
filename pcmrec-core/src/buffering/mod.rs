//! Fixed-size circular buffer of fixed-size chunks.
//!
//! ```text
//!        flush            normalize           write
//!          │                  │                 │
//!  ... ────▼──────────────────▼─────────────────▼────── ...
//!          [ normalized, waiting for storage ][ raw ][ in flight ]
//! ```
//!
//! Three cursors advance modulo `capacity()`:
//!
//! - `write` is owned by the capture producer and advanced once a chunk's
//!   contents are fully committed.
//! - `normalize` is owned by the worker; chunks behind it are little-endian
//!   and have been peak-scanned.
//! - `flush` is owned by the worker; chunks behind it have been persisted
//!   (or discarded while no session is active).
//!
//! `flush` never passes `normalize`, which never passes `write`. The producer
//! refuses to advance `write` onto `flush`, so occupancy tops out at N−1.
//!
//! Each slot sits behind its own mutex. The producer only ever `try_lock`s the
//! in-flight slot; the worker only locks slots strictly behind `write`, so the
//! two sides never contend on the same slot in normal operation.

pub mod chunk;
pub mod peak;

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{RecorderError, Result};
use chunk::{normalize_in_place, ChannelPeaks};

/// Bytes per interleaved stereo 16-bit frame.
pub const FRAME_SIZE: usize = 4;

/// Bytes per chunk (one capture transfer, one ring slot). Multiple of `FRAME_SIZE`.
pub const CHUNK_SIZE: usize = 8192;

/// Bytes held back from the end of the recording buffer.
pub const BUFFER_GUARD_BYTES: usize = 16;

/// A ring needs at least two slots so the producer has somewhere to advance to.
pub const MIN_CHUNKS: usize = 2;

const _: () = assert!(CHUNK_SIZE % FRAME_SIZE == 0);

pub struct ChunkRing {
    slots: Box<[Mutex<Box<[u8]>>]>,
    write: AtomicUsize,
    normalize: AtomicUsize,
    flush: AtomicUsize,
    /// Valid chunks captured since the producer was last started, saturating at N.
    buffered: AtomicUsize,
}

impl ChunkRing {
    /// Allocate a ring of exactly `num_chunks` slots.
    pub fn with_chunks(num_chunks: usize) -> Result<Self> {
        if num_chunks < MIN_CHUNKS {
            return Err(RecorderError::BufferTooSmall {
                bytes: num_chunks * CHUNK_SIZE,
                min_chunks: MIN_CHUNKS,
            });
        }
        let slots = (0..num_chunks)
            .map(|_| Mutex::new(vec![0u8; CHUNK_SIZE].into_boxed_slice()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            slots,
            write: AtomicUsize::new(0),
            normalize: AtomicUsize::new(0),
            flush: AtomicUsize::new(0),
            buffered: AtomicUsize::new(0),
        })
    }

    /// Size the ring from the recording memory left after `buffer_offset`.
    pub fn from_buffer(total_bytes: usize, buffer_offset: usize) -> Result<Self> {
        let usable = total_bytes
            .saturating_sub(buffer_offset)
            .saturating_sub(BUFFER_GUARD_BYTES);
        let num_chunks = usable / CHUNK_SIZE;
        if num_chunks < MIN_CHUNKS {
            return Err(RecorderError::BufferTooSmall {
                bytes: usable,
                min_chunks: MIN_CHUNKS,
            });
        }
        Self::with_chunks(num_chunks)
    }

    /// Number of slots (N).
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn write_cursor(&self) -> usize {
        self.write.load(Ordering::Acquire)
    }

    pub fn normalize_cursor(&self) -> usize {
        self.normalize.load(Ordering::Acquire)
    }

    pub fn flush_cursor(&self) -> usize {
        self.flush.load(Ordering::Acquire)
    }

    pub fn buffered_chunks(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Forget pre-roll history. Called whenever the producer (re)starts.
    pub fn reset_buffered(&self) {
        self.buffered.store(0, Ordering::Relaxed);
    }

    /// Return every cursor to slot 0. Only valid while the producer is halted.
    pub fn reset(&self) {
        self.write.store(0, Ordering::Release);
        self.normalize.store(0, Ordering::Release);
        self.flush.store(0, Ordering::Release);
        self.buffered.store(0, Ordering::Relaxed);
    }

    fn distance(&self, ahead: usize, behind: usize) -> usize {
        let n = self.capacity();
        (ahead + n - behind) % n
    }

    /// Chunks captured but not yet normalized.
    pub fn pending_for_normalize(&self) -> usize {
        self.distance(self.write_cursor(), self.normalize_cursor())
    }

    /// Chunks captured but not yet consumed by flush.
    pub fn pending_for_flush(&self) -> usize {
        self.distance(self.write_cursor(), self.flush_cursor())
    }

    /// Normalized chunks waiting for storage.
    pub fn ready_for_flush(&self) -> usize {
        self.distance(self.normalize_cursor(), self.flush_cursor())
    }

    /// Slots the producer may still fill before catching the flush cursor.
    pub fn free_chunks(&self) -> usize {
        self.capacity() - self.pending_for_flush()
    }

    // ── Producer side ────────────────────────────────────────────────────

    /// Non-blocking access to the slot at the write cursor.
    pub fn try_lock_target(&self) -> Option<MutexGuard<'_, Box<[u8]>>> {
        self.slots[self.write.load(Ordering::Relaxed)].try_lock()
    }

    /// Commit the in-flight chunk and move the write cursor to the next slot.
    ///
    /// Returns `false` without moving when the next slot is the flush cursor:
    /// that is an overrun and the producer must stop.
    pub fn advance_write(&self) -> bool {
        let n = self.capacity();
        let next = (self.write.load(Ordering::Relaxed) + 1) % n;
        let buffered = self.buffered.load(Ordering::Relaxed);
        if buffered < n {
            self.buffered.store(buffered + 1, Ordering::Relaxed);
        }
        if next == self.flush.load(Ordering::Acquire) {
            return false;
        }
        self.write.store(next, Ordering::Release);
        true
    }

    // ── Worker side ──────────────────────────────────────────────────────

    /// Normalize every chunk between the normalize and write cursors.
    ///
    /// Returns the number of chunks processed and their combined peaks.
    pub fn normalize_pending(&self) -> (usize, ChannelPeaks) {
        let n = self.capacity();
        let target = self.write_cursor();
        let mut cursor = self.normalize_cursor();
        let mut count = 0;
        let mut peaks = ChannelPeaks::default();
        while cursor != target {
            let mut slot = self.slots[cursor].lock();
            peaks = peaks.merge(normalize_in_place(&mut slot[..]));
            drop(slot);
            cursor = (cursor + 1) % n;
            self.normalize.store(cursor, Ordering::Release);
            count += 1;
        }
        (count, peaks)
    }

    /// Hand the oldest normalized chunk to `write`, advancing the flush cursor
    /// only if it succeeds.
    ///
    /// Returns `Ok(false)` when nothing is ready.
    pub fn flush_one<F>(&self, write: F) -> io::Result<bool>
    where
        F: FnOnce(&[u8]) -> io::Result<()>,
    {
        let cursor = self.flush_cursor();
        if cursor == self.normalize_cursor() {
            return Ok(false);
        }
        {
            let slot = self.slots[cursor].lock();
            write(&slot[..])?;
        }
        self.flush
            .store((cursor + 1) % self.capacity(), Ordering::Release);
        Ok(true)
    }

    /// Drop everything already normalized without persisting it.
    pub fn discard_normalized(&self) {
        self.flush.store(self.normalize_cursor(), Ordering::Release);
    }

    /// Pull the flush cursor back so up to `chunks` already-captured,
    /// already-normalized chunks are persisted with the next session.
    ///
    /// The request is clamped to the chunks still valid since the producer
    /// started and to N−1 total occupancy. Returns the number retained.
    pub fn retain_preroll(&self, chunks: usize) -> usize {
        let n = self.capacity();
        let raw = self.pending_for_normalize();
        let valid = self.buffered_chunks().saturating_sub(raw);
        let room = (n - 1).saturating_sub(raw);
        let retained = chunks.min(valid).min(room);
        let normalize = self.normalize_cursor();
        self.flush
            .store((normalize + n - retained) % n, Ordering::Release);
        retained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill_and_advance(ring: &ChunkRing, value: i16) -> bool {
        {
            let mut slot = ring.try_lock_target().expect("target slot free");
            let samples = vec![value; CHUNK_SIZE / 2];
            chunk::encode_native(&samples, &mut slot[..]);
        }
        ring.advance_write()
    }

    #[test]
    fn capacity_is_derived_from_buffer_size() {
        let ring = ChunkRing::from_buffer(10 * CHUNK_SIZE + BUFFER_GUARD_BYTES, 0).unwrap();
        assert_eq!(ring.capacity(), 10);

        let ring = ChunkRing::from_buffer(10 * CHUNK_SIZE + BUFFER_GUARD_BYTES, 1).unwrap();
        assert_eq!(ring.capacity(), 9);
    }

    #[test]
    fn tiny_buffer_is_rejected() {
        let err = ChunkRing::from_buffer(CHUNK_SIZE, 0);
        assert!(matches!(err, Err(RecorderError::BufferTooSmall { .. })));
        assert!(ChunkRing::with_chunks(1).is_err());
    }

    #[test]
    fn cursors_wrap_modulo_capacity() {
        let ring = ChunkRing::with_chunks(4).unwrap();
        for _ in 0..3 {
            assert!(fill_and_advance(&ring, 1));
        }
        assert_eq!(ring.pending_for_normalize(), 3);
        ring.normalize_pending();
        while ring.flush_one(|_| Ok(())).unwrap() {}
        assert_eq!(ring.flush_cursor(), 3);

        assert!(fill_and_advance(&ring, 1));
        assert_eq!(ring.write_cursor(), 0);
        assert_eq!(ring.pending_for_flush(), 1);
        assert_eq!(ring.pending_for_normalize(), 1);
    }

    #[test]
    fn advance_refuses_to_catch_flush_cursor() {
        let ring = ChunkRing::with_chunks(8).unwrap();
        let mut accepted = 0;
        for _ in 0..20 {
            if fill_and_advance(&ring, 3) {
                accepted += 1;
            }
            assert!(ring.pending_for_flush() <= ring.capacity() - 1);
        }
        assert_eq!(accepted, 7);
        assert_eq!(ring.free_chunks(), 1);
    }

    #[test]
    fn normalize_reports_peaks_and_count() {
        let ring = ChunkRing::with_chunks(4).unwrap();
        fill_and_advance(&ring, -900);
        fill_and_advance(&ring, 400);
        let (count, peaks) = ring.normalize_pending();
        assert_eq!(count, 2);
        assert_eq!(peaks, ChannelPeaks { left: 900, right: 900 });
        assert_eq!(ring.ready_for_flush(), 2);
        assert_eq!(ring.normalize_pending().0, 0);
    }

    #[test]
    fn failed_flush_keeps_cursor() {
        let ring = ChunkRing::with_chunks(4).unwrap();
        fill_and_advance(&ring, 1);
        ring.normalize_pending();
        let err = ring.flush_one(|_| Err(io::Error::other("disk full")));
        assert!(err.is_err());
        assert_eq!(ring.flush_cursor(), 0);
        assert!(ring.flush_one(|bytes| {
            assert_eq!(bytes.len(), CHUNK_SIZE);
            Ok(())
        })
        .unwrap());
        assert_eq!(ring.flush_cursor(), 1);
    }

    #[test]
    fn preroll_is_bounded_by_buffered_chunks() {
        let ring = ChunkRing::with_chunks(16).unwrap();
        for _ in 0..5 {
            fill_and_advance(&ring, 2);
        }
        ring.normalize_pending();
        ring.discard_normalized();
        assert_eq!(ring.pending_for_flush(), 0);

        assert_eq!(ring.retain_preroll(12), 5);
        assert_eq!(ring.flush_cursor(), 0);
        assert_eq!(ring.ready_for_flush(), 5);
    }

    #[test]
    fn preroll_never_fills_the_whole_ring() {
        let ring = ChunkRing::with_chunks(4).unwrap();
        for _ in 0..10 {
            fill_and_advance(&ring, 2);
            ring.normalize_pending();
            ring.discard_normalized();
        }
        assert_eq!(ring.buffered_chunks(), 4);
        assert_eq!(ring.retain_preroll(100), 3);
        assert_eq!(ring.pending_for_flush(), 3);
    }

    #[test]
    fn preroll_skips_chunks_not_yet_normalized() {
        let ring = ChunkRing::with_chunks(8).unwrap();
        for _ in 0..3 {
            fill_and_advance(&ring, 2);
        }
        ring.normalize_pending();
        ring.discard_normalized();
        fill_and_advance(&ring, 2);
        // 4 buffered, 1 still raw: only 3 may be pulled back behind normalize.
        assert_eq!(ring.retain_preroll(4), 3);
        assert_eq!(ring.flush_cursor(), 0);
    }
}
