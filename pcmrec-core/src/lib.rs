//! # pcmrec-core
//!
//! Real-time PCM recording pipeline.
//!
//! ## Architecture
//!
//! ```text
//! Capture hardware ─► TransferEngine ─► ChunkRing (write cursor)
//!                                           │
//!                              RecorderWorker (normalize + flush)
//!                                           │
//!                                  RecordingFileSink ─► storage
//!
//! Client threads ─► ControlChannel ─► RecorderWorker state machine
//! ```
//!
//! The capture callback never allocates or blocks. All file I/O happens on
//! the worker thread.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod storage;

// Convenience re-exports for downstream crates
pub use audio::{
    simulated::{SimulatedCapture, SimulatedCaptureHandle},
    CaptureHardware, RecordingSource, TransferEngine,
};
pub use buffering::{chunk::ChannelPeaks, ChunkRing, CHUNK_SIZE, FRAME_SIZE};
pub use engine::{
    clock::{Clock, ManualClock, MonotonicClock},
    DiagnosticsSnapshot, PcmRecorder, PreRoll, RecorderConfig,
};
pub use error::{RecorderError, Result};
pub use ipc::events::{RecorderState, RecorderStatusEvent, StatusFlags};
pub use storage::{memory::MemoryStorage, wav::RecordingFileSink, FsStorage, RecordingStorage};

#[cfg(feature = "audio-cpal")]
pub use audio::capture::{list_input_devices, CpalCapture};
