use thiserror::Error;

/// All errors produced by pcmrec-core.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("recording buffer too small: {bytes} bytes holds fewer than {min_chunks} chunks")]
    BufferTooSmall { bytes: usize, min_chunks: usize },

    #[error("ring overrun: storage cannot keep up with capture")]
    Overrun,

    #[error("recorder worker is gone")]
    WorkerGone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RecorderError>;
