//! Full-rate output path.
//!
//! [`EncoderSupervisor`] keeps a compressed output stream alive from a
//! sequence of raw frames. The encoder itself is an external child process
//! (see [`FfmpegEncoderSpawner`]) that reads raw RGB24 frames on stdin.
//!
//! Failure policy:
//! - a write failure or an unexpected child exit marks the supervisor as
//!   needing a restart; the failed frame is dropped, never retried
//! - the next frame spawns a fresh process (handles are never reused)
//! - no frames are buffered across a restart
//!
//! With a [`ShutdownSignal`] attached, triggering it kills the live child so
//! a write blocked on a stalled encoder fails instead of hanging the loop.

mod encoder;

use anyhow::Result;
use std::fmt;
use std::time::Duration;

use crate::frame::{Frame, StreamFormat};
use crate::shutdown::{HookId, ShutdownSignal};

pub use encoder::{encoder_args, FfmpegEncoderSpawner};

/// Bounded wait for the child to exit on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded wait when discarding a failed child.
const DISCARD_TIMEOUT: Duration = Duration::from_secs(1);

/// How a child encoder exited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncoderExit {
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
}

impl fmt::Display for EncoderExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// A running encoder that accepts raw frames.
pub trait EncoderProcess {
    /// Write one raw frame. Blocks under back-pressure from the encoder.
    fn write_frame(&mut self, pixels: &[u8]) -> Result<()>;

    /// Non-blocking liveness check. `Some` once the process has exited.
    fn try_exit(&mut self) -> Result<Option<EncoderExit>>;

    /// A callback that kills the process from another thread, unblocking a
    /// pending [`EncoderProcess::write_frame`].
    fn kill_switch(&self) -> Option<Box<dyn Fn() + Send>> {
        None
    }

    /// Close the input and wait up to `timeout` for the process to exit,
    /// killing it afterwards.
    fn finish(self: Box<Self>, timeout: Duration) -> Result<()>;
}

/// Starts encoder processes.
pub trait EncoderSpawner: Send {
    fn spawn(&mut self, format: &StreamFormat, destination: &str)
        -> Result<Box<dyn EncoderProcess>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncoderState {
    /// No process was ever started.
    Idle,
    Running,
    /// The last process failed; the next frame spawns a new one.
    NeedsRestart,
}

#[derive(Clone, Debug, Default)]
pub struct EncoderStats {
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub spawns: u64,
    pub restarts: u64,
}

pub struct EncoderSupervisor {
    camera_id: String,
    destination: String,
    spawner: Box<dyn EncoderSpawner>,
    process: Option<Box<dyn EncoderProcess>>,
    format: Option<StreamFormat>,
    state: EncoderState,
    shutdown: Option<ShutdownSignal>,
    kill_hook: Option<HookId>,
    stats: EncoderStats,
}

impl EncoderSupervisor {
    pub fn new(
        camera_id: impl Into<String>,
        destination: impl Into<String>,
        spawner: Box<dyn EncoderSpawner>,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            destination: destination.into(),
            spawner,
            process: None,
            format: None,
            state: EncoderState::Idle,
            shutdown: None,
            kill_hook: None,
            stats: EncoderStats::default(),
        }
    }

    /// Kill the running encoder when `shutdown` is triggered.
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats.clone()
    }

    /// Forward one frame, starting or restarting the encoder as needed.
    ///
    /// Returns `true` when the frame reached the encoder.
    pub fn submit(&mut self, frame: &Frame, format: StreamFormat) -> bool {
        self.check_liveness();

        if self.process.is_some() && self.format != Some(format) {
            log::info!(
                "camera={} source format changed; restarting encoder",
                self.camera_id
            );
            self.discard(DISCARD_TIMEOUT);
            self.state = EncoderState::NeedsRestart;
        }

        if self.process.is_none() && !self.start(format) {
            self.stats.frames_dropped += 1;
            return false;
        }

        let Some(process) = self.process.as_mut() else {
            self.stats.frames_dropped += 1;
            return false;
        };
        match process.write_frame(frame.pixels()) {
            Ok(()) => {
                self.stats.frames_written += 1;
                true
            }
            Err(err) => {
                if self.is_shutting_down() {
                    log::info!("camera={} encoder write interrupted by shutdown", self.camera_id);
                } else {
                    log::error!(
                        "camera={} encoder write failed: {:#}; restarting on next frame",
                        self.camera_id,
                        err
                    );
                }
                self.discard(DISCARD_TIMEOUT);
                self.state = EncoderState::NeedsRestart;
                self.stats.frames_dropped += 1;
                false
            }
        }
    }

    /// Close the encoder input and wait (bounded) for it to exit.
    pub fn shutdown(&mut self) {
        if self.process.is_some() {
            log::info!("camera={} stopping encoder", self.camera_id);
            self.discard(DEFAULT_SHUTDOWN_TIMEOUT);
        }
        self.state = EncoderState::Idle;
    }

    fn start(&mut self, format: StreamFormat) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        let restarting = self.state == EncoderState::NeedsRestart;
        log::info!(
            "camera={} starting encoder {}x{} @ {}fps -> {}",
            self.camera_id,
            format.width,
            format.height,
            format.rounded_rate(),
            crate::ingest::redact_locator(&self.destination)
        );
        match self.spawner.spawn(&format, &self.destination) {
            Ok(process) => {
                if let (Some(shutdown), Some(kill)) = (self.shutdown.as_ref(), process.kill_switch())
                {
                    self.kill_hook = shutdown.on_trigger(kill);
                }
                self.process = Some(process);
                self.format = Some(format);
                self.state = EncoderState::Running;
                self.stats.spawns += 1;
                if restarting {
                    self.stats.restarts += 1;
                }
                true
            }
            Err(err) => {
                log::error!("camera={} failed to start encoder: {:#}", self.camera_id, err);
                self.state = EncoderState::NeedsRestart;
                false
            }
        }
    }

    fn check_liveness(&mut self) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        match process.try_exit() {
            Ok(None) => {}
            Ok(Some(exit)) => {
                log::error!(
                    "camera={} encoder exited ({}); restarting",
                    self.camera_id,
                    exit
                );
                self.discard(DISCARD_TIMEOUT);
                self.state = EncoderState::NeedsRestart;
            }
            Err(err) => {
                log::error!(
                    "camera={} encoder liveness check failed: {:#}; restarting",
                    self.camera_id,
                    err
                );
                self.discard(DISCARD_TIMEOUT);
                self.state = EncoderState::NeedsRestart;
            }
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown
            .as_ref()
            .map_or(false, ShutdownSignal::is_triggered)
    }

    fn discard(&mut self, timeout: Duration) {
        if let (Some(shutdown), Some(hook)) = (self.shutdown.as_ref(), self.kill_hook.take()) {
            shutdown.remove_hook(hook);
        }
        if let Some(process) = self.process.take() {
            if let Err(err) = process.finish(timeout) {
                log::warn!("camera={} encoder cleanup: {:#}", self.camera_id, err);
            }
        }
    }
}

impl Drop for EncoderSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
