//! Command queue between client threads and the recorder worker.
//!
//! Commands carry only an identifier; arguments are staged in
//! [`StagedArgs`] before posting. Each command kind has its own
//! [`CompletionLatch`]: the client posts, then blocks on the latch until the
//! worker has finished the transition. A client must not post a second
//! command of the same kind before the first is acknowledged;
//! `PcmRecorder` serializes submissions to guarantee that.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

use crate::audio::RecordingSource;
use crate::error::{RecorderError, Result};

/// How often a blocked client re-checks that the worker is still alive.
const LIVENESS_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Init,
    Close,
    Configure,
    Start,
    Stop,
    Pause,
    Resume,
    NewFile,
    Shutdown,
}

impl Command {
    pub const ALL: [Command; 9] = [
        Command::Init,
        Command::Close,
        Command::Configure,
        Command::Start,
        Command::Stop,
        Command::Pause,
        Command::Resume,
        Command::NewFile,
        Command::Shutdown,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Init => "init",
            Command::Close => "close",
            Command::Configure => "configure",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::NewFile => "new_file",
            Command::Shutdown => "shutdown",
        }
    }
}

/// Arguments written by the client before posting a command.
#[derive(Debug, Clone, Default)]
pub struct StagedArgs {
    pub buffer_offset: usize,
    pub sample_rate: u32,
    pub source: RecordingSource,
    pub prerecord_secs: u32,
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum LatchState {
    #[default]
    Pending,
    Done,
    /// The worker went away without handling the command.
    Abandoned,
}

#[derive(Default)]
pub struct CompletionLatch {
    state: Mutex<LatchState>,
    signal: Condvar,
}

impl CompletionLatch {
    fn arm(&self) {
        *self.state.lock() = LatchState::Pending;
    }

    pub fn signal(&self) {
        let mut state = self.state.lock();
        *state = LatchState::Done;
        self.signal.notify_all();
    }

    /// Release a waiter whose command will never be handled. An
    /// acknowledgement that already landed is kept.
    fn abandon(&self) {
        let mut state = self.state.lock();
        if *state == LatchState::Pending {
            *state = LatchState::Abandoned;
        }
        self.signal.notify_all();
    }

    /// Block until acknowledged. Returns `false` if the worker died first.
    fn wait(&self, alive: &AtomicBool) -> bool {
        let mut state = self.state.lock();
        loop {
            match *state {
                LatchState::Done => return true,
                LatchState::Abandoned => return false,
                LatchState::Pending if !alive.load(Ordering::Acquire) => return false,
                LatchState::Pending => {
                    self.signal.wait_for(&mut state, LIVENESS_POLL);
                }
            }
        }
    }
}

/// Client half, shared by every thread holding the recorder.
pub struct ControlChannel {
    tx: Sender<Command>,
    latches: [CompletionLatch; Command::ALL.len()],
    staged: Mutex<StagedArgs>,
    alive: AtomicBool,
}

/// Worker half.
pub struct ControlReceiver {
    rx: Receiver<Command>,
    channel: Arc<ControlChannel>,
}

pub fn channel(depth: usize) -> (Arc<ControlChannel>, ControlReceiver) {
    let (tx, rx) = bounded(depth.max(1));
    let channel = Arc::new(ControlChannel {
        tx,
        latches: Default::default(),
        staged: Mutex::new(StagedArgs::default()),
        alive: AtomicBool::new(true),
    });
    let receiver = ControlReceiver {
        rx,
        channel: Arc::clone(&channel),
    };
    (channel, receiver)
}

impl ControlChannel {
    /// Stage arguments, post `command`, and block until the worker acknowledges.
    pub fn submit<F>(&self, command: Command, stage: F) -> Result<()>
    where
        F: FnOnce(&mut StagedArgs),
    {
        if !self.is_alive() {
            return Err(RecorderError::WorkerGone);
        }
        stage(&mut self.staged.lock());
        let latch = &self.latches[command.index()];
        latch.arm();
        self.tx
            .send(command)
            .map_err(|_| RecorderError::WorkerGone)?;
        if latch.wait(&self.alive) {
            Ok(())
        } else {
            Err(RecorderError::WorkerGone)
        }
    }

    /// Post without waiting for acknowledgement.
    pub fn post(&self, command: Command) -> Result<()> {
        self.tx
            .try_send(command)
            .map_err(|_| RecorderError::WorkerGone)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl ControlReceiver {
    /// Next command, or `None` when `timeout` elapses first.
    ///
    /// A disconnected queue reads as `Shutdown`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Command> {
        match self.rx.recv_timeout(timeout) {
            Ok(command) => Some(command),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Command::Shutdown),
        }
    }

    /// Snapshot of the arguments staged for the command being processed.
    pub fn staged(&self) -> StagedArgs {
        self.channel.staged.lock().clone()
    }

    pub fn complete(&self, command: Command) {
        self.channel.latches[command.index()].signal();
    }
}

impl Drop for ControlReceiver {
    fn drop(&mut self) {
        self.channel.alive.store(false, Ordering::Release);
        for latch in &self.channel.latches {
            latch.abandon();
        }
    }
}
