//! Streaming WAV container on top of `hound`.
//!
//! Creating a sink writes a 44-byte canonical PCM header (16-bit stereo)
//! with both length fields zeroed. Every `sync` and the final `close`
//! rewrite the RIFF and data lengths from the bytes appended so far, so a
//! file cut short by a crash still parses up to its last sync.

use std::io::{self, Seek, SeekFrom, Write};

use hound::{SampleFormat, WavSpec, WavWriter};

use super::{RecordingStorage, StorageFile};
use crate::buffering::FRAME_SIZE;

pub const HEADER_LEN: usize = 44;
pub const CHANNELS: u16 = 2;
pub const BITS_PER_SAMPLE: u16 = 16;

const SAMPLE_BYTES: usize = 2;

pub fn wav_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: CHANNELS,
        sample_rate,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: SampleFormat::Int,
    }
}

/// Storage handle whose `flush` reaches stable storage, so the writer's
/// header updates are synced along with the payload.
struct SyncingFile(Box<dyn StorageFile>);

impl Write for SyncingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.sync()
    }
}

impl Seek for SyncingFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}

fn into_io(err: hound::Error) -> io::Error {
    match err {
        hound::Error::IoError(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// One open recording file.
pub struct RecordingFileSink {
    writer: WavWriter<SyncingFile>,
    name: String,
    data_bytes: u64,
}

impl RecordingFileSink {
    /// Create `name` through `storage` and write the placeholder header.
    pub fn create(
        storage: &mut dyn RecordingStorage,
        name: &str,
        sample_rate: u32,
    ) -> io::Result<Self> {
        let file = storage.create(name)?;
        let writer = WavWriter::new(SyncingFile(file), wav_spec(sample_rate)).map_err(into_io)?;
        Ok(Self {
            writer,
            name: name.to_string(),
            data_bytes: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload bytes appended so far.
    pub fn data_bytes(&self) -> u64 {
        self.data_bytes
    }

    /// Append little-endian interleaved frames. A trailing partial frame is
    /// not written. Either all frames land or an error is returned.
    pub fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        let whole = bytes.len() - bytes.len() % FRAME_SIZE;
        if whole == 0 {
            return Ok(());
        }
        let samples = u32::try_from(whole / SAMPLE_BYTES)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "append too large"))?;
        let mut out = self.writer.get_i16_writer(samples);
        for sample in bytes[..whole].chunks_exact(SAMPLE_BYTES) {
            out.write_sample(i16::from_le_bytes([sample[0], sample[1]]));
        }
        out.flush().map_err(into_io)?;
        self.data_bytes += whole as u64;
        Ok(())
    }

    /// Patch the lengths for what has been appended and sync the file.
    pub fn sync(&mut self) -> io::Result<()> {
        self.writer.flush().map_err(into_io)
    }

    /// Patch both length fields from the final byte count and sync.
    pub fn close(self) -> io::Result<()> {
        self.writer.finalize().map_err(into_io)
    }
}
