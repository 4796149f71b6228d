//! Synthetic clip source (`stub://`).
//!
//! Generates a deterministic finite clip so the pipeline can run without a
//! decoder or a camera. Query parameters:
//! - `frames` (default 60): clip length
//! - `fps` (default 20): reported frame rate
//! - `width`/`height` (default 64x48)
//! - `fail_first` (default 0): number of opens that fail before one succeeds
//! - `live` (default off): behave as a stream (end of clip is a read failure)

use anyhow::{anyhow, Context, Result};
use url::Url;

use super::{Capture, CaptureOpener};
use crate::frame::StreamFormat;

pub const SCHEME: &str = "stub://";

const DEFAULT_FRAMES: u64 = 60;
const DEFAULT_FPS: f64 = 20.0;
const DEFAULT_WIDTH: u32 = 64;
const DEFAULT_HEIGHT: u32 = 48;

#[derive(Clone, Debug, PartialEq)]
struct ClipSpec {
    frames: u64,
    fps: f64,
    width: u32,
    height: u32,
    fail_first: u32,
}

impl ClipSpec {
    fn parse(locator: &str) -> Result<Self> {
        let url = Url::parse(locator).context("parse stub locator")?;
        let mut spec = ClipSpec {
            frames: DEFAULT_FRAMES,
            fps: DEFAULT_FPS,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fail_first: 0,
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "frames" => spec.frames = parse_param(&key, &value)?,
                "fps" => spec.fps = parse_param(&key, &value)?,
                "width" => spec.width = parse_param(&key, &value)?,
                "height" => spec.height = parse_param(&key, &value)?,
                "fail_first" => spec.fail_first = parse_param(&key, &value)?,
                _ => {}
            }
        }
        if spec.width == 0 || spec.height == 0 {
            return Err(anyhow!("stub clip dimensions must be non-zero"));
        }
        Ok(spec)
    }
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("invalid stub parameter {}={}", key, value))
}

/// Whether the part of a `stub://` locator after the scheme asks for a live stream.
pub(crate) fn is_live(rest: &str) -> bool {
    rest.split_once('?')
        .map(|(_, query)| {
            query
                .split('&')
                .any(|pair| matches!(pair, "live" | "live=1" | "live=true"))
        })
        .unwrap_or(false)
}

/// Opens synthetic clips. Counts opens so `fail_first` spans reconnects.
#[derive(Debug, Default)]
pub struct SyntheticOpener {
    opens: u32,
}

impl SyntheticOpener {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureOpener for SyntheticOpener {
    fn open(&mut self, locator: &str) -> Result<Box<dyn Capture>> {
        let spec = ClipSpec::parse(locator)?;
        self.opens += 1;
        if self.opens <= spec.fail_first {
            return Err(anyhow!(
                "synthetic source refused connection ({} of {})",
                self.opens,
                spec.fail_first
            ));
        }
        Ok(Box::new(SyntheticCapture {
            format: StreamFormat::new(spec.width, spec.height, Some(spec.fps)),
            spec,
            position: 0,
        }))
    }
}

struct SyntheticCapture {
    spec: ClipSpec,
    format: StreamFormat,
    position: u64,
}

impl Capture for SyntheticCapture {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn read(&mut self) -> Result<Option<Vec<u8>>> {
        if self.position >= self.spec.frames {
            return Ok(None);
        }
        let pixels = clip_pixels(&self.format, self.position);
        self.position += 1;
        Ok(Some(pixels))
    }

    fn rewind(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }
}

/// Pixels of frame `index` of a synthetic clip. A moving gradient, so every
/// frame position within the clip is distinguishable.
pub fn clip_pixels(format: &StreamFormat, index: u64) -> Vec<u8> {
    let mut pixels = vec![0u8; format.frame_bytes()];
    for (i, pixel) in pixels.iter_mut().enumerate() {
        *pixel = ((i as u64 + index * 7) % 256) as u8;
    }
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clip_parameters() -> Result<()> {
        let spec = ClipSpec::parse("stub://front?frames=5&fps=12.5&width=8&height=4&fail_first=2")?;
        assert_eq!(spec.frames, 5);
        assert_eq!(spec.fps, 12.5);
        assert_eq!((spec.width, spec.height), (8, 4));
        assert_eq!(spec.fail_first, 2);
        Ok(())
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(ClipSpec::parse("stub://front?frames=many").is_err());
        assert!(ClipSpec::parse("stub://front?width=0").is_err());
    }

    #[test]
    fn clip_ends_and_rewinds_to_first_frame() -> Result<()> {
        let mut opener = SyntheticOpener::new();
        let mut capture = opener.open("stub://front?frames=2&width=2&height=2")?;
        let first = capture.read()?.expect("first frame");
        let second = capture.read()?.expect("second frame");
        assert_ne!(first, second);
        assert!(capture.read()?.is_none());

        capture.rewind()?;
        assert_eq!(capture.read()?, Some(first));
        Ok(())
    }

    #[test]
    fn fail_first_spans_opens() {
        let mut opener = SyntheticOpener::new();
        let locator = "stub://front?fail_first=2";
        assert!(opener.open(locator).is_err());
        assert!(opener.open(locator).is_err());
        assert!(opener.open(locator).is_ok());
    }

    #[test]
    fn live_flag_is_detected() {
        assert!(is_live("cam?live=1"));
        assert!(is_live("cam?frames=3&live"));
        assert!(!is_live("cam?frames=3"));
        assert!(!is_live("cam"));
    }
}
