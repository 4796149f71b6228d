//! Frame distribution loops.
//!
//! Two independent loops run on their own threads, each with its own
//! [`SourceConnection`] against the same locator:
//! - full-rate: every frame goes to the [`EncoderSupervisor`]
//! - sampled: frames accepted by the [`SamplingClock`] are JPEG encoded and
//!   sent through [`InferenceDispatch`]
//!
//! Nothing is shared between the loops except the [`ShutdownSignal`].

use anyhow::{anyhow, Context, Result};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{InferenceSettings, RelayConfig};
use crate::detect::{
    DetectionClient, DetectionSink, DispatchStats, HttpDetectionClient, InferenceDispatch, Sample,
};
use crate::frame::StreamFormat;
use crate::ingest::{ReadOutcome, SourceConfig, SourceConnection, SourceStats};
use crate::output::{EncoderStats, EncoderSupervisor, EncoderSpawner, FfmpegEncoderSpawner};
use crate::sampling::SamplingClock;
use crate::shutdown::ShutdownSignal;

pub const FULL_RATE_THREAD: &str = "relay-full-rate";
pub const SAMPLED_THREAD: &str = "relay-sampled";

/// Open the detection client and wait for the service to become ready.
///
/// Returns `None` (inference disabled for the process lifetime) when no
/// address is configured or the service is not ready in time.
pub fn connect_detection_client(settings: &InferenceSettings) -> Option<Box<dyn DetectionClient>> {
    let address = settings.service_url.as_deref()?;
    let client = match HttpDetectionClient::new(address, settings.request_timeout) {
        Ok(client) => client,
        Err(err) => {
            log::warn!("inference disabled: {:#}", err);
            return None;
        }
    };
    match client.wait_ready(settings.ready_timeout) {
        Ok(()) => Some(Box::new(client)),
        Err(err) => {
            log::warn!("inference disabled: {:#}", err);
            None
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FullRateReport {
    pub frames_read: u64,
    pub frames_forwarded: u64,
    pub source: SourceStats,
    pub encoder: Option<EncoderStats>,
}

#[derive(Clone, Debug, Default)]
pub struct SampledReport {
    pub frames_read: u64,
    pub samples: u64,
    pub encode_failures: u64,
    pub source: SourceStats,
    pub dispatch: DispatchStats,
}

#[derive(Clone, Debug, Default)]
pub struct PipelineReport {
    pub full_rate: Option<FullRateReport>,
    pub sampled: Option<SampledReport>,
}

/// Reads every frame and forwards it to the encoder, if one is configured.
pub struct FullRateLoop {
    source: SourceConnection,
    encoder: Option<EncoderSupervisor>,
    shutdown: ShutdownSignal,
    progress_interval: Duration,
    report: FullRateReport,
}

impl FullRateLoop {
    pub fn new(
        source: SourceConnection,
        encoder: Option<EncoderSupervisor>,
        shutdown: ShutdownSignal,
        progress_interval: Duration,
    ) -> Self {
        Self {
            source,
            encoder,
            shutdown,
            progress_interval,
            report: FullRateReport::default(),
        }
    }

    /// Run until shutdown, then stop the encoder.
    pub fn run(mut self) -> FullRateReport {
        if self.source.connect() || self.source.reconnect_loop() {
            let mut last_progress = Instant::now();
            while self.shutdown.is_running() {
                match self.source.read_frame() {
                    ReadOutcome::Frame(frame) => {
                        self.report.frames_read += 1;
                        let forwarded = match self.encoder.as_mut() {
                            Some(encoder) => {
                                let rate = self.source.format().map(|format| format.frame_rate);
                                let format = StreamFormat::new(frame.width, frame.height, rate);
                                encoder.submit(&frame, format)
                            }
                            None => true,
                        };
                        if forwarded {
                            self.report.frames_forwarded += 1;
                        }
                        if last_progress.elapsed() >= self.progress_interval {
                            self.log_progress();
                            last_progress = Instant::now();
                        }
                    }
                    ReadOutcome::Retry => continue,
                    ReadOutcome::Failed => {
                        if !self.source.reconnect_loop() {
                            break;
                        }
                    }
                }
            }
        }

        if let Some(encoder) = self.encoder.as_mut() {
            encoder.shutdown();
            self.report.encoder = Some(encoder.stats());
        }
        self.report.source = self.source.stats();
        log::info!(
            "camera={} full-rate loop stopped after {} frames",
            self.source.camera_id(),
            self.report.frames_read
        );
        self.report
    }

    fn log_progress(&self) {
        let source = self.source.stats();
        match self.encoder.as_ref() {
            Some(encoder) => {
                let stats = encoder.stats();
                log::info!(
                    "camera={} frames={} forwarded={} dropped={} encoder_restarts={} reconnects={}",
                    self.source.camera_id(),
                    self.report.frames_read,
                    self.report.frames_forwarded,
                    stats.frames_dropped,
                    stats.restarts,
                    source.reconnects
                );
            }
            None => log::info!(
                "camera={} frames={} reconnects={} loop_arounds={}",
                self.source.camera_id(),
                self.report.frames_read,
                source.reconnects,
                source.loop_arounds
            ),
        }
    }
}

/// Reads every frame, encodes and dispatches the ones the clock accepts.
pub struct SampledLoop {
    source: SourceConnection,
    clock: SamplingClock,
    dispatch: InferenceDispatch,
    jpeg_quality: u8,
    shutdown: ShutdownSignal,
    report: SampledReport,
}

impl SampledLoop {
    pub fn new(
        source: SourceConnection,
        clock: SamplingClock,
        dispatch: InferenceDispatch,
        jpeg_quality: u8,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            source,
            clock,
            dispatch,
            jpeg_quality,
            shutdown,
            report: SampledReport::default(),
        }
    }

    pub fn run(mut self) -> SampledReport {
        if self.source.connect() || self.source.reconnect_loop() {
            while self.shutdown.is_running() {
                match self.source.read_frame() {
                    ReadOutcome::Frame(frame) => {
                        self.report.frames_read += 1;
                        if !self.clock.is_due(frame.capture_instant()) {
                            continue;
                        }
                        match Sample::encode(&frame, self.jpeg_quality) {
                            Ok(sample) => {
                                self.clock.mark_emitted(frame.capture_instant());
                                self.report.samples += 1;
                                self.dispatch.dispatch(&sample);
                            }
                            Err(err) => {
                                self.report.encode_failures += 1;
                                log::warn!(
                                    "camera={} skipping sample {}: {:#}",
                                    self.source.camera_id(),
                                    frame.sequence(),
                                    err
                                );
                            }
                        }
                    }
                    ReadOutcome::Retry => continue,
                    ReadOutcome::Failed => {
                        if !self.source.reconnect_loop() {
                            break;
                        }
                    }
                }
            }
        }

        self.report.source = self.source.stats();
        self.report.dispatch = self.dispatch.stats();
        log::info!(
            "camera={} sampled loop stopped after {} samples ({} failed)",
            self.source.camera_id(),
            self.report.samples,
            self.report.dispatch.failed
        );
        self.report
    }
}

/// Wires a [`RelayConfig`] into running loops.
pub struct Pipeline {
    config: RelayConfig,
    encoder: Option<Box<dyn EncoderSpawner>>,
    detector: Option<Box<dyn DetectionClient>>,
    sink: Option<DetectionSink>,
}

impl Pipeline {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            encoder: None,
            detector: None,
            sink: None,
        }
    }

    /// Replace the default `ffmpeg` child-process spawner.
    pub fn with_encoder_spawner(mut self, spawner: Box<dyn EncoderSpawner>) -> Self {
        self.encoder = Some(spawner);
        self
    }

    /// Enable the sampled loop with a connected client.
    pub fn with_detection_client(mut self, client: Box<dyn DetectionClient>) -> Self {
        self.detector = Some(client);
        self
    }

    pub fn with_detection_sink(mut self, sink: DetectionSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn spawn(self) -> Result<PipelineHandle> {
        let shutdown = ShutdownSignal::new();
        let config = self.config;
        let source_config = config.source_config();

        let encoder = config.output.url.clone().map(|destination| {
            let spawner: Box<dyn EncoderSpawner> = match self.encoder {
                Some(spawner) => spawner,
                None => Box::new(FfmpegEncoderSpawner::new(config.output.encoder_bin.clone())),
            };
            (destination, spawner)
        });
        if encoder.is_none() {
            log::info!(
                "camera={} no output destination configured; running ingest only",
                config.camera_id
            );
        }

        let dispatch = self.detector.map(|client| {
            let dispatch = InferenceDispatch::new(config.camera_id.clone(), client);
            match self.sink {
                Some(sink) => dispatch.with_sink(sink),
                None => dispatch,
            }
        });
        let clock = match dispatch {
            Some(_) => Some(SamplingClock::from_rate(config.inference.fps)?),
            None => {
                log::info!("camera={} inference disabled", config.camera_id);
                None
            }
        };

        let full_rate = {
            let shutdown = shutdown.clone();
            let source_config = source_config.clone();
            let camera_id = config.camera_id.clone();
            let progress_interval = config.progress_interval;
            std::thread::Builder::new()
                .name(FULL_RATE_THREAD.to_string())
                .spawn(move || {
                    let source = open_source(source_config, &shutdown);
                    let encoder = encoder.map(|(destination, spawner)| {
                        EncoderSupervisor::new(camera_id, destination, spawner)
                            .with_shutdown(shutdown.clone())
                    });
                    FullRateLoop::new(source, encoder, shutdown, progress_interval).run()
                })
                .context("spawn full-rate loop")?
        };

        let sampled = match (dispatch, clock) {
            (Some(dispatch), Some(clock)) => {
                let thread_shutdown = shutdown.clone();
                let jpeg_quality = config.inference.jpeg_quality;
                let spawned = std::thread::Builder::new()
                    .name(SAMPLED_THREAD.to_string())
                    .spawn(move || {
                        let source = open_source(source_config, &thread_shutdown);
                        SampledLoop::new(source, clock, dispatch, jpeg_quality, thread_shutdown)
                            .run()
                    });
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        shutdown.trigger();
                        let _ = full_rate.join();
                        return Err(err).context("spawn sampled loop");
                    }
                }
            }
            _ => None,
        };

        log::info!(
            "camera={} pipeline started (output: {}, inference: {})",
            config.camera_id,
            if config.output_enabled() { "on" } else { "off" },
            if sampled.is_some() { "on" } else { "off" }
        );
        Ok(PipelineHandle {
            shutdown,
            full_rate: Some(full_rate),
            sampled,
        })
    }
}

fn open_source(config: SourceConfig, shutdown: &ShutdownSignal) -> SourceConnection {
    SourceConnection::new(config, shutdown.clone())
}

/// Running loops. Dropping the handle without calling `stop` leaves them running.
pub struct PipelineHandle {
    shutdown: ShutdownSignal,
    full_rate: Option<JoinHandle<FullRateReport>>,
    sampled: Option<JoinHandle<SampledReport>>,
}

impl PipelineHandle {
    pub fn is_sampling(&self) -> bool {
        self.sampled.is_some()
    }

    /// Signal both loops and wait for them to finish.
    pub fn stop(mut self) -> Result<PipelineReport> {
        self.shutdown.trigger();
        let mut report = PipelineReport::default();
        if let Some(join) = self.full_rate.take() {
            report.full_rate = Some(
                join.join()
                    .map_err(|_| anyhow!("full-rate loop thread panicked"))?,
            );
        }
        if let Some(join) = self.sampled.take() {
            report.sampled = Some(
                join.join()
                    .map_err(|_| anyhow!("sampled loop thread panicked"))?,
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SourceKind;
    use crate::output::{EncoderExit, EncoderProcess};
    use std::sync::{Arc, Mutex};

    struct CountingSpawner(Arc<Mutex<Vec<(u32, u32)>>>);

    struct CountingProcess;

    impl EncoderSpawner for CountingSpawner {
        fn spawn(
            &mut self,
            format: &StreamFormat,
            _destination: &str,
        ) -> Result<Box<dyn EncoderProcess>> {
            self.0.lock().unwrap().push((format.width, format.height));
            Ok(Box::new(CountingProcess))
        }
    }

    impl EncoderProcess for CountingProcess {
        fn write_frame(&mut self, _pixels: &[u8]) -> Result<()> {
            Ok(())
        }

        fn try_exit(&mut self) -> Result<Option<EncoderExit>> {
            Ok(None)
        }

        fn finish(self: Box<Self>, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn full_rate_loop_starts_encoder_at_source_size() {
        let shutdown = ShutdownSignal::new();
        let spawns = Arc::new(Mutex::new(Vec::new()));
        let source = SourceConnection::new(
            SourceConfig::new("cam1", "stub://front?frames=4&fps=200&width=8&height=6"),
            shutdown.clone(),
        );
        assert_eq!(source.kind(), SourceKind::FileBacked);
        let encoder = EncoderSupervisor::new(
            "cam1",
            "rtsp://mediamtx:8554/cam1",
            Box::new(CountingSpawner(spawns.clone())),
        );
        let stopper = {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                shutdown.trigger();
            })
        };
        let report =
            FullRateLoop::new(source, Some(encoder), shutdown, Duration::from_secs(60)).run();
        stopper.join().unwrap();

        assert!(report.frames_read >= 4, "read {} frames", report.frames_read);
        assert_eq!(report.frames_forwarded, report.frames_read);
        assert!(report.source.loop_arounds >= 1);
        assert_eq!(spawns.lock().unwrap().as_slice(), [(8, 6)]);
        assert_eq!(report.encoder.map(|stats| stats.spawns), Some(1));
    }

    #[test]
    fn stopped_before_start_reads_nothing() {
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        let source = SourceConnection::new(SourceConfig::new("cam1", "stub://front"), shutdown.clone());
        let report = FullRateLoop::new(source, None, shutdown, Duration::from_secs(60)).run();
        assert_eq!(report.frames_read, 0);
    }
}
