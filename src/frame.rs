//! Captured frames.
//!
//! - `Frame`: owned RGB24 pixel buffer plus capture metadata. Immutable once produced.
//! - `StreamFormat`: geometry and rate negotiated when a source connects.
//!
//! Frames are never shared between distribution loops: each loop owns its own
//! source connection and therefore its own frame instances.

use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// Frame rate used when a source reports 0 or nothing at all.
pub const DEFAULT_FRAME_RATE: f64 = 30.0;

/// Bytes per pixel of the RGB24 layout every backend normalizes to.
pub const BYTES_PER_PIXEL: usize = 3;

/// Geometry and rate negotiated at connect time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
}

impl StreamFormat {
    /// Build a format, substituting [`DEFAULT_FRAME_RATE`] for an unusable rate.
    pub fn new(width: u32, height: u32, reported_rate: Option<f64>) -> Self {
        let frame_rate = match reported_rate {
            Some(rate) if rate.is_finite() && rate > 0.0 => rate,
            _ => DEFAULT_FRAME_RATE,
        };
        Self {
            width,
            height,
            frame_rate,
        }
    }

    /// Size in bytes of one packed RGB24 frame.
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }

    /// Frame rate rounded for consumers that need an integer rate (encoder `-r`).
    pub fn rounded_rate(&self) -> u32 {
        (self.frame_rate.round() as u32).max(1)
    }
}

/// A decoded frame. Pixel data is private and only readable by reference.
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    camera_id: Arc<str>,
    sequence: u64,
    captured_at: SystemTime,
    /// Monotonic capture instant. For paced file sources this is the frame's
    /// scheduled presentation time.
    capture_instant: Instant,
}

impl Frame {
    /// Create a frame. Called by the ingestion layer.
    pub(crate) fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        camera_id: Arc<str>,
        sequence: u64,
        capture_instant: Instant,
    ) -> Self {
        Self {
            pixels,
            width,
            height,
            camera_id,
            sequence,
            captured_at: SystemTime::now(),
            capture_instant,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Capture sequence number, strictly increasing per source connection.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn capture_instant(&self) -> Instant {
        self.capture_instant
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("camera_id", &self.camera_id)
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}
