//! FFmpeg decode backend for local files and network streams.
//!
//! Frames are decoded in-memory and scaled to packed RGB24. The demuxer runs
//! with an interrupt callback so that a read blocked on the network returns an
//! error once shutdown is requested or the read stalls past its timeout.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Capture, CaptureOpener};
use crate::frame::{StreamFormat, BYTES_PER_PIXEL};
use crate::shutdown::ShutdownSignal;

pub(crate) struct FfmpegOpener {
    shutdown: ShutdownSignal,
    stall_timeout: Duration,
}

impl FfmpegOpener {
    pub(crate) fn new(shutdown: ShutdownSignal, stall_timeout: Duration) -> Self {
        Self {
            shutdown,
            stall_timeout,
        }
    }
}

impl CaptureOpener for FfmpegOpener {
    fn open(&mut self, locator: &str) -> Result<Box<dyn Capture>> {
        let capture = FfmpegCapture::open(locator, self.shutdown.clone(), self.stall_timeout)?;
        Ok(Box::new(capture))
    }
}

/// Deadline shared with the interrupt callback.
struct ReadDeadline {
    origin: Instant,
    deadline_ms: AtomicU64,
}

impl ReadDeadline {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            deadline_ms: AtomicU64::new(u64::MAX),
        }
    }

    fn arm(&self, timeout: Duration) {
        let deadline = self.origin.elapsed() + timeout;
        self.deadline_ms
            .store(deadline.as_millis() as u64, Ordering::Relaxed);
    }

    fn expired(&self) -> bool {
        self.origin.elapsed().as_millis() as u64 > self.deadline_ms.load(Ordering::Relaxed)
    }
}

struct FfmpegCapture {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    format: StreamFormat,
    deadline: Arc<ReadDeadline>,
    stall_timeout: Duration,
    draining: bool,
}

impl FfmpegCapture {
    fn open(locator: &str, shutdown: ShutdownSignal, stall_timeout: Duration) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;

        let deadline = Arc::new(ReadDeadline::new());
        deadline.arm(stall_timeout);
        let interrupt_deadline = deadline.clone();
        let input = ffmpeg::format::input_with_interrupt(&locator, move || {
            shutdown.is_triggered() || interrupt_deadline.expired()
        })
        .with_context(|| format!("failed to open input '{}' with ffmpeg", locator))?;

        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("input has no video track"))?;
        let stream_index = input_stream.index();
        let reported_rate = f64::from(input_stream.avg_frame_rate());
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        let format = StreamFormat::new(decoder.width(), decoder.height(), Some(reported_rate));

        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler,
            format,
            deadline,
            stall_timeout,
            draining: false,
        })
    }

    fn convert(&mut self, decoded: &ffmpeg::frame::Video) -> Result<Vec<u8>> {
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .context("scale frame to RGB")?;
        frame_to_pixels(&rgb_frame)
    }
}

impl Capture for FfmpegCapture {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn read(&mut self) -> Result<Option<Vec<u8>>> {
        self.deadline.arm(self.stall_timeout);
        let mut decoded = ffmpeg::frame::Video::empty();

        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.convert(&decoded).map(Some);
            }
            if self.draining {
                return Ok(None);
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    self.decoder
                        .send_packet(&packet)
                        .context("send packet to ffmpeg decoder")?;
                }
                Err(ffmpeg::Error::Eof) => {
                    self.decoder
                        .send_eof()
                        .context("flush ffmpeg decoder at end of input")?;
                    self.draining = true;
                }
                Err(err) => return Err(err).context("read packet from input"),
            }
        }
    }

    fn rewind(&mut self) -> Result<()> {
        self.deadline.arm(self.stall_timeout);
        self.input.seek(0, ..).context("seek input to start")?;
        self.decoder.flush();
        self.draining = false;
        Ok(())
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<Vec<u8>> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let row_bytes = width * BYTES_PER_PIXEL;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok(data
            .get(..row_bytes * height)
            .context("ffmpeg frame is shorter than its geometry")?
            .to_vec());
    }

    let mut pixels = Vec::with_capacity(row_bytes * height);
    for row in 0..height {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok(pixels)
}
