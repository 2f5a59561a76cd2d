//! Per-chunk sample handling: hardware-order encoding on the producer side,
//! little-endian normalization plus peak detection on the worker side.

use super::FRAME_SIZE;

/// Bytes per sample (16-bit PCM).
const SAMPLE_BYTES: usize = 2;

/// Running maximum absolute sample magnitude per channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelPeaks {
    pub left: u16,
    pub right: u16,
}

impl ChannelPeaks {
    pub fn merge(self, other: ChannelPeaks) -> Self {
        Self {
            left: self.left.max(other.left),
            right: self.right.max(other.right),
        }
    }
}

/// Convert every interleaved stereo sample in `chunk` from hardware (native)
/// byte order to little-endian in place, returning the chunk's peaks.
///
/// A trailing partial frame is left untouched.
pub fn normalize_in_place(chunk: &mut [u8]) -> ChannelPeaks {
    let mut peaks = ChannelPeaks::default();
    for frame in chunk.chunks_exact_mut(FRAME_SIZE) {
        let (left, right) = frame.split_at_mut(SAMPLE_BYTES);
        peaks.left = peaks.left.max(sample_to_le(left));
        peaks.right = peaks.right.max(sample_to_le(right));
    }
    peaks
}

fn sample_to_le(bytes: &mut [u8]) -> u16 {
    let value = i16::from_ne_bytes([bytes[0], bytes[1]]);
    bytes.copy_from_slice(&value.to_le_bytes());
    value.unsigned_abs()
}

/// Write interleaved samples into `out` in hardware (native) byte order, the
/// layout a capture transfer leaves in a ring slot.
///
/// Returns the number of samples written; stops at whichever side runs out.
pub fn encode_native(samples: &[i16], out: &mut [u8]) -> usize {
    let mut written = 0;
    for (sample, dst) in samples.iter().zip(out.chunks_exact_mut(SAMPLE_BYTES)) {
        dst.copy_from_slice(&sample.to_ne_bytes());
        written += 1;
    }
    written
}
