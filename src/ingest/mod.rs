//! Frame ingestion.
//!
//! A [`SourceConnection`] owns the lifecycle of one ingestion handle against a
//! source locator (local file or network stream):
//! - connect / reconnect with a fixed delay between attempts
//! - end-of-media handling (file sources seek back to the start and loop forever)
//! - pacing of file sources to their native frame rate
//!
//! Decoding is delegated to a [`Capture`] produced by a [`CaptureOpener`]:
//! - `stub://` locators open a synthetic clip (always available)
//! - everything else goes through FFmpeg (feature: ingest-ffmpeg)
//!
//! Failures never escape this module as errors. `connect()` returns `false`,
//! `read_frame()` returns [`ReadOutcome::Failed`], and the owning loop decides
//! when to call [`SourceConnection::reconnect_loop`].

#[cfg(feature = "ingest-ffmpeg")]
mod ffmpeg;
pub mod synthetic;

use anyhow::{anyhow, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::frame::{Frame, StreamFormat};
use crate::shutdown::ShutdownSignal;

pub use synthetic::SyntheticOpener;

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Longest a single stream read may block before it is reported as failed.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// An open decode handle.
///
/// Implementations produce packed RGB24 frames matching [`Capture::format`].
pub trait Capture {
    fn format(&self) -> StreamFormat;

    /// Read the next frame. `Ok(None)` means end of media.
    fn read(&mut self) -> Result<Option<Vec<u8>>>;

    /// Seek back to the first frame.
    fn rewind(&mut self) -> Result<()>;
}

/// Opens decode handles against a locator. One opener per connection.
pub trait CaptureOpener: Send {
    fn open(&mut self, locator: &str) -> Result<Box<dyn Capture>>;
}

/// Whether the locator is a seekable local resource or a live stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    FileBacked,
    StreamBacked,
}

impl SourceKind {
    /// Derive the kind from the locator: existing regular files and synthetic
    /// clips are file-backed, everything else is a stream.
    pub fn from_locator(locator: &str) -> Self {
        if let Some(rest) = locator.strip_prefix(synthetic::SCHEME) {
            return if synthetic::is_live(rest) {
                SourceKind::StreamBacked
            } else {
                SourceKind::FileBacked
            };
        }
        if !locator.contains("://") && Path::new(locator).is_file() {
            SourceKind::FileBacked
        } else {
            SourceKind::StreamBacked
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// A file source hit end of media and could not seek back.
    Exhausted,
}

/// Result of a single read attempt.
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    /// End of a file source; the position was reset and the caller should read again.
    Retry,
    /// The handle is gone or broken; the caller should reconnect.
    Failed,
}

/// Settings for one source connection.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub camera_id: String,
    pub locator: String,
    pub reconnect_delay: Duration,
}

impl SourceConfig {
    pub fn new(camera_id: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            locator: locator.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// Counters for a source connection.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub connect_attempts: u64,
    pub reconnects: u64,
    pub loop_arounds: u64,
}

/// One ingestion handle and its connection state machine.
pub struct SourceConnection {
    config: SourceConfig,
    camera_id: Arc<str>,
    kind: SourceKind,
    state: ConnectionState,
    format: Option<StreamFormat>,
    opener: Box<dyn CaptureOpener>,
    capture: Option<Box<dyn Capture>>,
    shutdown: ShutdownSignal,
    sequence: u64,
    next_due: Option<Instant>,
    stats: SourceStats,
}

impl SourceConnection {
    /// Create a connection using the backend the locator calls for.
    pub fn new(config: SourceConfig, shutdown: ShutdownSignal) -> Self {
        let kind = SourceKind::from_locator(&config.locator);
        let opener = default_opener(&config.locator, &shutdown);
        Self::with_opener(config, kind, opener, shutdown)
    }

    /// Create a connection with an explicit kind and backend.
    pub fn with_opener(
        config: SourceConfig,
        kind: SourceKind,
        opener: Box<dyn CaptureOpener>,
        shutdown: ShutdownSignal,
    ) -> Self {
        log::info!(
            "camera={} source initialised ({:?}) for {}",
            config.camera_id,
            kind,
            redact_locator(&config.locator)
        );
        let camera_id: Arc<str> = Arc::from(config.camera_id.as_str());
        Self {
            config,
            camera_id,
            kind,
            state: ConnectionState::Disconnected,
            format: None,
            opener,
            capture: None,
            shutdown,
            sequence: 0,
            next_due: None,
            stats: SourceStats::default(),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Format negotiated by the most recent successful connect.
    pub fn format(&self) -> Option<StreamFormat> {
        self.format
    }

    pub fn stats(&self) -> SourceStats {
        self.stats.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_running()
    }

    /// Open the handle. Returns `false` on failure; never errors.
    pub fn connect(&mut self) -> bool {
        self.release();
        self.state = ConnectionState::Connecting;
        self.stats.connect_attempts += 1;
        log::info!(
            "camera={} connecting to {}",
            self.camera_id,
            redact_locator(&self.config.locator)
        );

        match self.opener.open(&self.config.locator) {
            Ok(capture) => {
                let format = capture.format();
                log::info!(
                    "camera={} connected ({}x{} @ {:.2}fps)",
                    self.camera_id,
                    format.width,
                    format.height,
                    format.frame_rate
                );
                self.format = Some(format);
                self.capture = Some(capture);
                self.next_due = None;
                self.state = ConnectionState::Connected;
                true
            }
            Err(err) => {
                log::error!(
                    "camera={} failed to open source {}: {:#}",
                    self.camera_id,
                    redact_locator(&self.config.locator),
                    err
                );
                self.state = ConnectionState::Disconnected;
                false
            }
        }
    }

    /// Read the next frame, blocking until one is available or the read fails.
    pub fn read_frame(&mut self) -> ReadOutcome {
        if self.shutdown.is_triggered() {
            return ReadOutcome::Failed;
        }
        if self.capture.is_none() {
            self.state = ConnectionState::Disconnected;
            return ReadOutcome::Failed;
        }

        // File frames carry their scheduled instant; stream frames are
        // stamped once the read returns.
        let scheduled = match self.kind {
            SourceKind::FileBacked => match self.pace() {
                Some(due) => Some(due),
                None => return ReadOutcome::Failed,
            },
            SourceKind::StreamBacked => None,
        };

        let Some(capture) = self.capture.as_mut() else {
            return ReadOutcome::Failed;
        };
        match capture.read() {
            Ok(Some(pixels)) => {
                let presented_at = scheduled.unwrap_or_else(Instant::now);
                let format = capture.format();
                self.sequence += 1;
                self.stats.frames_captured += 1;
                if self.kind == SourceKind::FileBacked {
                    self.schedule_after(presented_at, format.frame_rate);
                }
                ReadOutcome::Frame(Frame::new(
                    pixels,
                    format.width,
                    format.height,
                    self.camera_id.clone(),
                    self.sequence,
                    presented_at,
                ))
            }
            Ok(None) => self.end_of_media(),
            Err(err) => {
                if self.shutdown.is_running() {
                    log::error!("camera={} source read failed: {:#}", self.camera_id, err);
                }
                self.release();
                self.state = ConnectionState::Disconnected;
                ReadOutcome::Failed
            }
        }
    }

    /// Block until a connect succeeds, sleeping `reconnect_delay` before each
    /// attempt. Returns `false` if shutdown was requested first.
    pub fn reconnect_loop(&mut self) -> bool {
        while self.shutdown.is_running() {
            log::warn!(
                "camera={} connection lost; retrying in {:.1}s",
                self.camera_id,
                self.config.reconnect_delay.as_secs_f64()
            );
            if self.shutdown.wait(self.config.reconnect_delay) {
                break;
            }
            if self.connect() {
                self.stats.reconnects += 1;
                return true;
            }
        }
        false
    }

    /// Stop the connection: clears the shared running flag and releases the handle.
    pub fn stop(&mut self) {
        self.shutdown.trigger();
        self.release();
        self.state = ConnectionState::Disconnected;
        log::info!("camera={} source stopped", self.camera_id);
    }

    fn release(&mut self) {
        self.capture = None;
        self.next_due = None;
    }

    fn end_of_media(&mut self) -> ReadOutcome {
        match self.kind {
            SourceKind::FileBacked => {
                let rewound = match self.capture.as_mut() {
                    Some(capture) => capture.rewind(),
                    None => Err(anyhow!("no open handle")),
                };
                match rewound {
                    Ok(()) => {
                        self.stats.loop_arounds += 1;
                        log::info!("camera={} end of file reached; looping", self.camera_id);
                        ReadOutcome::Retry
                    }
                    Err(err) => {
                        log::error!(
                            "camera={} failed to seek to start of file: {:#}",
                            self.camera_id,
                            err
                        );
                        self.release();
                        self.state = ConnectionState::Exhausted;
                        ReadOutcome::Failed
                    }
                }
            }
            SourceKind::StreamBacked => {
                log::error!("camera={} stream ended", self.camera_id);
                self.release();
                self.state = ConnectionState::Disconnected;
                ReadOutcome::Failed
            }
        }
    }

    /// Wait until the next frame of a file source is due. Returns the due
    /// instant, or `None` when shutdown interrupted the wait.
    fn pace(&mut self) -> Option<Instant> {
        let now = Instant::now();
        let due = match self.next_due {
            Some(due) if due > now => {
                if self.shutdown.wait(due - now) {
                    return None;
                }
                due
            }
            Some(due) => due,
            None => now,
        };
        Some(due)
    }

    fn schedule_after(&mut self, presented_at: Instant, frame_rate: f64) {
        let interval = Duration::from_secs_f64(1.0 / frame_rate);
        let next = presented_at + interval;
        // Fall back onto the wall clock when decoding lags by more than a frame.
        let now = Instant::now();
        self.next_due = Some(if next + interval < now { now } else { next });
    }
}

/// Hide credentials in a locator before it is logged.
pub fn redact_locator(locator: &str) -> String {
    match url::Url::parse(locator) {
        Ok(mut parsed) if parsed.password().is_some() || !parsed.username().is_empty() => {
            let _ = parsed.set_username("***");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        _ => locator.to_string(),
    }
}

fn default_opener(locator: &str, shutdown: &ShutdownSignal) -> Box<dyn CaptureOpener> {
    if locator.starts_with(synthetic::SCHEME) {
        return Box::new(SyntheticOpener::new());
    }
    #[cfg(feature = "ingest-ffmpeg")]
    {
        Box::new(ffmpeg::FfmpegOpener::new(
            shutdown.clone(),
            DEFAULT_STALL_TIMEOUT,
        ))
    }
    #[cfg(not(feature = "ingest-ffmpeg"))]
    {
        let _ = shutdown;
        Box::new(UnsupportedOpener)
    }
}

#[cfg(not(feature = "ingest-ffmpeg"))]
struct UnsupportedOpener;

#[cfg(not(feature = "ingest-ffmpeg"))]
impl CaptureOpener for UnsupportedOpener {
    fn open(&mut self, _locator: &str) -> Result<Box<dyn Capture>> {
        Err(anyhow!(
            "decoding files and network streams requires the ingest-ffmpeg feature"
        ))
    }
}
