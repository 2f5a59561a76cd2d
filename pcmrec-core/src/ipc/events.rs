//! Status events published by the recorder.
//!
//! Subscribers get one [`RecorderStatusEvent`] per state transition and per
//! error. The flag set mirrors what [`crate::PcmRecorder::status`] returns.

use serde::{Deserialize, Serialize};

/// Lifecycle state as seen from outside the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    /// No session. The producer may still be free-running for pre-roll and metering.
    Idle,
    Recording,
    Paused,
    /// Waiting for the producer to finish its in-flight transfer.
    Stopping,
    /// Sticky until the next init.
    Error,
}

/// Status flags readable by any thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusFlags {
    pub recording: bool,
    pub paused: bool,
    pub error: bool,
}

impl StatusFlags {
    pub const RECORD: u32 = 1;
    pub const PAUSE: u32 = 2;
    pub const ERROR: u32 = 4;

    /// Packed representation, one bit per flag.
    pub fn bits(self) -> u32 {
        let mut bits = 0;
        if self.recording {
            bits |= Self::RECORD;
        }
        if self.paused {
            bits |= Self::PAUSE;
        }
        if self.error {
            bits |= Self::ERROR;
        }
        bits
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStatusEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub state: RecorderState,
    pub flags: StatusFlags,
    /// Optional human-readable detail (e.g. the failing file name).
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_with_camel_case_and_lowercase_state() {
        let event = RecorderStatusEvent {
            seq: 4,
            state: RecorderState::Paused,
            flags: StatusFlags {
                recording: true,
                paused: true,
                error: false,
            },
            detail: Some("take2.wav".into()),
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["state"], "paused");
        assert_eq!(json["flags"]["recording"], true);
        assert_eq!(json["flags"]["paused"], true);
        assert_eq!(json["detail"], "take2.wav");

        let round_trip: RecorderStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.state, RecorderState::Paused);
        assert_eq!(round_trip.flags, event.flags);
    }

    #[test]
    fn state_rejects_non_lowercase_values() {
        let err = serde_json::from_str::<RecorderState>(r#""Recording""#);
        assert!(err.is_err(), "expected invalid casing to fail");
    }

    #[test]
    fn flag_bits_pack_one_bit_per_flag() {
        let flags = StatusFlags {
            recording: true,
            paused: false,
            error: true,
        };
        assert_eq!(flags.bits(), StatusFlags::RECORD | StatusFlags::ERROR);
        assert_eq!(StatusFlags::default().bits(), 0);
    }
}
