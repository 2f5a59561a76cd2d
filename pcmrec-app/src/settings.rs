//! Persistent host settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use pcmrec_core::{buffering::BUFFER_GUARD_BYTES, RecorderConfig, RecordingSource, CHUNK_SIZE};
use serde::{Deserialize, Serialize};

/// Rates the recorder offers; anything else snaps to the closest one.
pub const SUPPORTED_SAMPLE_RATES: [u32; 9] = [
    8_000, 11_025, 16_000, 22_050, 32_000, 44_100, 48_000, 88_200, 96_000,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    /// Relative recording names resolve under this directory.
    pub recordings_dir: Option<PathBuf>,
    pub sample_rate: u32,
    pub source: RecordingSource,
    pub prerecord_seconds: u32,
    /// Frequency of the built-in test tone used when no capture device is compiled in.
    pub tone_frequency_hz: f32,
    pub recorder: RecorderConfig,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            recordings_dir: None,
            sample_rate: 44_100,
            source: RecordingSource::Microphone,
            prerecord_seconds: 0,
            tone_frequency_hz: 440.0,
            recorder: RecorderConfig::default(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.sample_rate = normalize_sample_rate(self.sample_rate);
        self.prerecord_seconds = self.prerecord_seconds.min(30);
        if !self.tone_frequency_hz.is_finite() {
            self.tone_frequency_hz = 440.0;
        }
        self.tone_frequency_hz = self.tone_frequency_hz.clamp(20.0, 20_000.0);
        self.preferred_input_device = self
            .preferred_input_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        self.recordings_dir = self
            .recordings_dir
            .take()
            .filter(|d| !d.as_os_str().is_empty());

        let recorder = &mut self.recorder;
        recorder.buffer_bytes = recorder
            .buffer_bytes
            .clamp(4 * CHUNK_SIZE + BUFFER_GUARD_BYTES, 1 << 30);
        recorder.drain_interval_ms = recorder.drain_interval_ms.clamp(5, 1_000);
        recorder.halt_timeout_ms = recorder.halt_timeout_ms.clamp(10, 30_000);
        recorder.command_queue_depth = recorder.command_queue_depth.clamp(1, 256);
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.recordings_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

pub fn normalize_sample_rate(raw: u32) -> u32 {
    SUPPORTED_SAMPLE_RATES
        .iter()
        .copied()
        .min_by_key(|rate| rate.abs_diff(raw))
        .unwrap_or(44_100)
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pcmrec")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("pcmrec")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_rate_snaps_to_supported() {
        assert_eq!(normalize_sample_rate(44_000), 44_100);
        assert_eq!(normalize_sample_rate(47_000), 48_000);
        assert_eq!(normalize_sample_rate(0), 8_000);
        assert_eq!(normalize_sample_rate(1_000_000), 96_000);
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut settings = AppSettings {
            preferred_input_device: Some("   ".into()),
            prerecord_seconds: 600,
            tone_frequency_hz: f32::NAN,
            ..AppSettings::default()
        };
        settings.recorder.command_queue_depth = 0;
        settings.recorder.buffer_bytes = 10;
        settings.normalize();

        assert!(settings.preferred_input_device.is_none());
        assert_eq!(settings.prerecord_seconds, 30);
        assert_eq!(settings.tone_frequency_hz, 440.0);
        assert_eq!(settings.recorder.command_queue_depth, 1);
        assert!(settings.recorder.buffer_bytes >= 4 * CHUNK_SIZE);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"sampleRate": 48000, "source": "linein"}"#).unwrap();

        let settings = load_settings(&path);
        assert_eq!(settings.sample_rate, 48_000);
        assert_eq!(settings.source, RecordingSource::LineIn);
        assert_eq!(settings.recorder, RecorderConfig::default());
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = AppSettings {
            prerecord_seconds: 5,
            recordings_dir: Some(dir.path().to_path_buf()),
            ..AppSettings::default()
        };
        save_settings(&path, &settings).unwrap();

        let loaded = load_settings(&path);
        assert_eq!(loaded.prerecord_seconds, 5);
        assert_eq!(loaded.recordings_dir(), dir.path());
    }

    #[test]
    fn unreadable_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();
        assert_eq!(load_settings(&path).sample_rate, 44_100);
    }
}
