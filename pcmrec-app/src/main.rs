//! pcmrec console host.
//!
//! Loads settings, spawns the recorder worker on the configured capture
//! backend and reads commands from stdin until `quit` or end of input.
//!
//! Usage: `pcmrec [settings.json]`

mod commands;
mod settings;
mod state;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use pcmrec_core::{FsStorage, MonotonicClock, PcmRecorder, RecorderStatusEvent};
use settings::{default_settings_path, load_settings, save_settings, AppSettings};
use state::AppState;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn spawn_recorder(settings: &AppSettings) -> anyhow::Result<PcmRecorder> {
    let storage = FsStorage::new(settings.recordings_dir());
    let clock = Arc::new(MonotonicClock::new());

    #[cfg(feature = "audio-cpal")]
    let recorder = {
        let preferred = settings.preferred_input_device.clone();
        PcmRecorder::spawn(settings.recorder.clone(), storage, clock, move || {
            Ok(pcmrec_core::CpalCapture::new(preferred))
        })
    };
    #[cfg(not(feature = "audio-cpal"))]
    let recorder = {
        let frequency = settings.tone_frequency_hz;
        PcmRecorder::spawn(settings.recorder.clone(), storage, clock, move || {
            Ok(pcmrec_core::SimulatedCapture::tone(frequency, 8_000))
        })
    };

    recorder.context("failed to start recorder worker")
}

/// Log every status event until the recorder goes away.
fn spawn_event_logger(mut events: broadcast::Receiver<RecorderStatusEvent>) {
    let spawned = thread::Builder::new()
        .name("pcmrec-events".into())
        .spawn(move || loop {
            match events.blocking_recv() {
                Ok(event) => match &event.detail {
                    Some(detail) => warn!(seq = event.seq, state = ?event.state, detail = %detail, "recorder status"),
                    None => info!(seq = event.seq, state = ?event.state, "recorder status"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "status events dropped"),
                Err(RecvError::Closed) => break,
            }
        });
    if let Err(e) = spawned {
        warn!("status event logger unavailable: {e}");
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pcmrec=info")),
        )
        .init();

    let settings_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_settings_path);
    let settings = load_settings(&settings_path);
    if !settings_path.exists() {
        if let Err(e) = save_settings(&settings_path, &settings) {
            warn!(path = %settings_path.display(), "could not write default settings: {e}");
        }
    }
    info!(
        path = %settings_path.display(),
        recordings = %settings.recordings_dir().display(),
        "settings loaded"
    );

    let recorder = spawn_recorder(&settings)?;
    spawn_event_logger(recorder.subscribe_status());
    recorder.init(0).context("recorder init failed")?;
    recorder.configure(
        settings.sample_rate,
        settings.source,
        settings.prerecord_seconds,
    )?;

    let state = AppState::new(recorder, settings, Some(settings_path));
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    writeln!(stdout, "{}", commands::HELP)?;

    for line in stdin.lock().lines() {
        let line = line?;
        let command = match commands::parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                writeln!(stdout, "{message}")?;
                continue;
            }
        };
        match commands::execute(&state, &command, &mut stdout) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => writeln!(stdout, "error: {e:#}")?,
        }
        stdout.flush()?;
    }

    state.recorder.stop()?;
    state.recorder.close()?;
    info!("recorder closed");
    Ok(())
}
