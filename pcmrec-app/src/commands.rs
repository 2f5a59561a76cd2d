//! Console command handlers.
//!
//! One line of input maps to one [`ConsoleCommand`]; [`execute`] runs it
//! against the shared [`AppState`] and writes a human-readable reply.

use std::io::Write;

use pcmrec_core::{DiagnosticsSnapshot, RecorderState, RecordingSource, StatusFlags};
use serde::Serialize;
use tracing::info;

use crate::state::AppState;

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Start(String),
    Stop,
    Pause,
    Resume,
    NewFile(String),
    Status,
    Peaks,
    Devices,
    Diagnostics,
    /// Sample rate, input and pre-roll seconds. Missing fields keep their value.
    Configure {
        sample_rate: Option<u32>,
        source: Option<RecordingSource>,
        prerecord_seconds: Option<u32>,
    },
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  start <file>                  begin recording into <file>
  stop                          finish the current file
  pause | resume                suspend or continue capture
  new <file>                    close the current file and continue into <file>
  config [rate] [source] [pre]  set sample rate, input (mic|line|digital), pre-roll seconds
  status | peaks | diag         show recorder state, channel peaks or counters
  devices                       list capture devices
  help | quit";

/// Snapshot printed by `status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub state: RecorderState,
    pub flags: StatusFlags,
    /// `flags` packed as record=1, pause=2, error=4.
    pub flag_bits: u32,
    pub elapsed_ms: u64,
    pub bytes_recorded: u64,
    pub sample_rate: u32,
    pub initialized: bool,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();

    let command = match verb.to_ascii_lowercase().as_str() {
        "start" | "record" => ConsoleCommand::Start(filename_arg(verb, &rest)?),
        "stop" => ConsoleCommand::Stop,
        "pause" => ConsoleCommand::Pause,
        "resume" => ConsoleCommand::Resume,
        "new" | "newfile" => ConsoleCommand::NewFile(filename_arg(verb, &rest)?),
        "status" => ConsoleCommand::Status,
        "peaks" => ConsoleCommand::Peaks,
        "devices" => ConsoleCommand::Devices,
        "diag" | "diagnostics" => ConsoleCommand::Diagnostics,
        "config" => parse_configure(&rest)?,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command '{other}' (try 'help')")),
    };
    Ok(Some(command))
}

fn filename_arg(verb: &str, rest: &[&str]) -> Result<String, String> {
    if rest.is_empty() {
        return Err(format!("{verb} needs a file name"));
    }
    Ok(rest.join(" "))
}

fn parse_source(raw: &str) -> Option<RecordingSource> {
    match raw.to_ascii_lowercase().as_str() {
        "mic" | "microphone" => Some(RecordingSource::Microphone),
        "line" | "linein" => Some(RecordingSource::LineIn),
        "digital" | "spdif" => Some(RecordingSource::Digital),
        _ => None,
    }
}

fn parse_configure(args: &[&str]) -> Result<ConsoleCommand, String> {
    let mut sample_rate = None;
    let mut source = None;
    let mut prerecord_seconds = None;
    for arg in args {
        if let Some(parsed) = parse_source(arg) {
            source = Some(parsed);
        } else if let Some(secs) = arg.strip_suffix('s') {
            prerecord_seconds = Some(
                secs.parse()
                    .map_err(|_| format!("bad pre-roll '{arg}'"))?,
            );
        } else {
            sample_rate = Some(arg.parse().map_err(|_| format!("bad config value '{arg}'"))?);
        }
    }
    Ok(ConsoleCommand::Configure {
        sample_rate,
        source,
        prerecord_seconds,
    })
}

pub fn status_report(state: &AppState) -> StatusReport {
    let recorder = &state.recorder;
    let flags = recorder.status();
    StatusReport {
        state: recorder.state(),
        flags,
        flag_bits: flags.bits(),
        elapsed_ms: u64::try_from(recorder.elapsed().as_millis()).unwrap_or(u64::MAX),
        bytes_recorded: recorder.bytes_recorded(),
        sample_rate: recorder.sample_rate(),
        initialized: recorder.is_initialized(),
    }
}

fn list_devices() -> Vec<String> {
    #[cfg(feature = "audio-cpal")]
    {
        pcmrec_core::list_input_devices()
    }
    #[cfg(not(feature = "audio-cpal"))]
    {
        vec!["simulated tone".to_string()]
    }
}

/// Run `command`. Returns `false` once the console should exit.
pub fn execute(
    state: &AppState,
    command: &ConsoleCommand,
    out: &mut impl Write,
) -> anyhow::Result<bool> {
    let recorder = &state.recorder;
    match command {
        ConsoleCommand::Start(file) => {
            recorder.start(file)?;
            if recorder.status().recording {
                writeln!(out, "recording to {file}")?;
            } else {
                writeln!(out, "could not start recording to {file}")?;
            }
        }
        ConsoleCommand::Stop => {
            recorder.stop()?;
            let diag = recorder.diagnostics_snapshot();
            info!(
                chunks_flushed = diag.chunks_flushed,
                bytes_written = diag.bytes_written,
                overruns = diag.overruns,
                "diagnostics snapshot on stop"
            );
            writeln!(out, "stopped")?;
        }
        ConsoleCommand::Pause => {
            recorder.pause()?;
            writeln!(out, "{}", state_label(recorder.state()))?;
        }
        ConsoleCommand::Resume => {
            recorder.resume()?;
            writeln!(out, "{}", state_label(recorder.state()))?;
        }
        ConsoleCommand::NewFile(file) => {
            recorder.new_file(file)?;
            if recorder.status().recording {
                writeln!(out, "continuing into {file}")?;
            } else {
                writeln!(out, "could not open {file}; recording stopped")?;
            }
        }
        ConsoleCommand::Status => {
            writeln!(out, "{}", serde_json::to_string_pretty(&status_report(state))?)?;
        }
        ConsoleCommand::Peaks => {
            let peaks = recorder.peaks();
            writeln!(out, "L {:>5}  R {:>5}", peaks.left, peaks.right)?;
        }
        ConsoleCommand::Devices => {
            for name in list_devices() {
                writeln!(out, "{name}")?;
            }
        }
        ConsoleCommand::Diagnostics => {
            let diag: DiagnosticsSnapshot = recorder.diagnostics_snapshot();
            writeln!(out, "{}", serde_json::to_string_pretty(&diag)?)?;
        }
        ConsoleCommand::Configure {
            sample_rate,
            source,
            prerecord_seconds,
        } => {
            if recorder.status().recording {
                writeln!(out, "stop recording before changing the configuration")?;
                return Ok(true);
            }
            let settings = state.update_settings(|s| {
                if let Some(rate) = sample_rate {
                    s.sample_rate = *rate;
                }
                if let Some(src) = source {
                    s.source = *src;
                }
                if let Some(secs) = prerecord_seconds {
                    s.prerecord_seconds = *secs;
                }
            })?;
            writeln!(
                out,
                "{} Hz requested ({} Hz delivered), {:?}, pre-roll {} s",
                settings.sample_rate,
                recorder.sample_rate(),
                settings.source,
                settings.prerecord_seconds
            )?;
        }
        ConsoleCommand::Help => writeln!(out, "{HELP}")?,
        ConsoleCommand::Quit => return Ok(false),
    }
    Ok(true)
}

fn state_label(state: RecorderState) -> &'static str {
    match state {
        RecorderState::Idle => "idle",
        RecorderState::Recording => "recording",
        RecorderState::Paused => "paused",
        RecorderState::Stopping => "stopping",
        RecorderState::Error => "error",
    }
}
