use super::client::DetectionClient;
use super::result::Detection;
use super::sample::Sample;

/// Receives every successful detection result.
pub type DetectionSink = Box<dyn FnMut(&Sample, &[Detection]) + Send>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub failed: u64,
    pub detections: u64,
}

/// Sends samples to the detection service one at a time.
///
/// A failed call drops the sample; nothing is retried or queued.
pub struct InferenceDispatch {
    camera_id: String,
    client: Box<dyn DetectionClient>,
    sink: Option<DetectionSink>,
    stats: DispatchStats,
}

impl InferenceDispatch {
    pub fn new(camera_id: impl Into<String>, client: Box<dyn DetectionClient>) -> Self {
        Self {
            camera_id: camera_id.into(),
            client,
            sink: None,
            stats: DispatchStats::default(),
        }
    }

    pub fn with_sink(mut self, sink: DetectionSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Returns true when the service answered.
    pub fn dispatch(&mut self, sample: &Sample) -> bool {
        match self.client.detect(&sample.jpeg, &self.camera_id) {
            Ok(detections) => {
                self.stats.dispatched += 1;
                self.stats.detections += detections.len() as u64;
                if !detections.is_empty() {
                    log::info!(
                        "[{}] frame {}: {} detection(s)",
                        self.camera_id,
                        sample.sequence,
                        detections.len()
                    );
                }
                if let Some(sink) = self.sink.as_mut() {
                    sink(sample, &detections);
                }
                true
            }
            Err(err) => {
                self.stats.failed += 1;
                log::error!(
                    "[{}] detection failed for frame {}: {:#}",
                    self.camera_id,
                    sample.sequence,
                    err
                );
                false
            }
        }
    }
}
