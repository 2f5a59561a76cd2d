//! cpal-backed capture.
//!
//! The cpal input callback stands in for the transfer-complete interrupt: it
//! converts whatever the device delivers to interleaved stereo `i16` and
//! streams it into the [`TransferEngine`], which completes a transfer each
//! time a ring slot fills.
//!
//! `cpal::Stream` is `!Send`; `CpalCapture` is therefore built on the
//! recorder worker thread (see `PcmRecorder::spawn`) and never leaves it.

use std::sync::Arc;

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, SampleFormat, Stream, StreamConfig, StreamError,
};
use tracing::{error, info, warn};

use super::{CaptureHardware, RecordingSource, TransferEngine};
use crate::error::{RecorderError, Result};

pub struct CpalCapture {
    preferred_device: Option<String>,
    engine: Option<Arc<TransferEngine>>,
    stream: Option<Stream>,
    sample_rate: u32,
}

impl CpalCapture {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self {
            preferred_device,
            engine: None,
            stream: None,
            sample_rate: 0,
        }
    }

    fn select_device(&self) -> Result<Device> {
        let host = cpal::default_host();
        if let Some(preferred) = self.preferred_device.as_deref() {
            match host.input_devices() {
                Ok(mut devices) => {
                    if let Some(device) = devices.find(|d| {
                        d.name().map(|name| name == preferred).unwrap_or(false)
                    }) {
                        return Ok(device);
                    }
                    warn!("preferred input device '{}' not found, falling back", preferred);
                }
                Err(e) => warn!("failed to list input devices: {e}"),
            }
        }
        host.default_input_device()
            .ok_or(RecorderError::NoDefaultInputDevice)
    }

    fn build_stream(&mut self) -> Result<()> {
        self.stream = None;
        let Some(engine) = self.engine.clone() else {
            return Ok(());
        };
        let device = self.select_device()?;
        let supported = device
            .default_input_config()
            .map_err(|e| RecorderError::AudioDevice(e.to_string()))?;
        let channels = supported.channels() as usize;
        let config: StreamConfig = supported.config();
        self.sample_rate = config.sample_rate.0;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            sample_rate = self.sample_rate,
            channels,
            "opening input stream"
        );

        let fault_engine = Arc::clone(&engine);
        let on_error = move |err: StreamError| match err {
            StreamError::DeviceNotAvailable => fault_engine.on_fatal_error(),
            _ => {
                fault_engine.on_transfer_error();
            }
        };

        let stream = match supported.sample_format() {
            SampleFormat::I16 => {
                let mut stereo: Vec<i16> = Vec::with_capacity(8192);
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        to_stereo(data, channels, &mut stereo, |s| s);
                        engine.write_samples(&stereo);
                    },
                    on_error,
                    None,
                )
            }
            SampleFormat::F32 => {
                let mut stereo: Vec<i16> = Vec::with_capacity(8192);
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        to_stereo(data, channels, &mut stereo, |s| {
                            (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
                        });
                        engine.write_samples(&stereo);
                    },
                    on_error,
                    None,
                )
            }
            fmt => {
                return Err(RecorderError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| RecorderError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| RecorderError::AudioStream(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }
}

/// Interleave the first two channels (duplicating mono) into `out`.
fn to_stereo<T: Copy>(data: &[T], channels: usize, out: &mut Vec<i16>, convert: impl Fn(T) -> i16) {
    out.clear();
    if channels == 0 {
        return;
    }
    for frame in data.chunks_exact(channels) {
        let left = convert(frame[0]);
        let right = if channels > 1 { convert(frame[1]) } else { left };
        out.push(left);
        out.push(right);
    }
}

impl CaptureHardware for CpalCapture {
    fn open(&mut self, engine: Arc<TransferEngine>) -> Result<()> {
        self.engine = Some(engine);
        self.build_stream()
    }

    fn select_source(&mut self, source: RecordingSource, requested_rate: u32) -> Result<u32> {
        if source == RecordingSource::Digital {
            return Err(RecorderError::AudioDevice(
                "digital input is not available through cpal".into(),
            ));
        }
        if self.stream.is_none() {
            self.build_stream()?;
        }
        if self.sample_rate != 0 && self.sample_rate != requested_rate {
            warn!(
                requested_rate,
                device_rate = self.sample_rate,
                "device rate differs from requested rate, recording at device rate"
            );
        }
        Ok(if self.sample_rate == 0 {
            requested_rate
        } else {
            self.sample_rate
        })
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                error!("failed to pause input stream: {e}");
            }
        }
        self.engine = None;
    }
}

/// Names of the input devices the host reports.
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.input_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(e) => {
            warn!("failed to enumerate input devices: {e}");
            Vec::new()
        }
    }
}
