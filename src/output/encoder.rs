//! External encoder child process.
//!
//! Spawns `ffmpeg` (or a compatible binary) reading raw RGB24 frames from
//! stdin and publishing H.264 to the destination locator.

use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{EncoderExit, EncoderProcess, EncoderSpawner};
use crate::frame::StreamFormat;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Command-line arguments for an encoder publishing `format` to `destination`.
pub fn encoder_args(format: &StreamFormat, destination: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-y",
        "-f",
        "rawvideo",
        "-vcodec",
        "rawvideo",
        "-pix_fmt",
        "rgb24",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push("-s".to_string());
    args.push(format!("{}x{}", format.width, format.height));
    args.push("-r".to_string());
    args.push(format.rounded_rate().to_string());
    args.extend(
        ["-i", "-", "-c:v", "libx264", "-preset", "ultrafast"]
            .iter()
            .map(|s| s.to_string()),
    );
    if destination.starts_with("rtsp://") || destination.starts_with("rtsps://") {
        args.push("-f".to_string());
        args.push("rtsp".to_string());
    }
    args.push(destination.to_string());
    args
}

#[derive(Clone, Debug)]
pub struct FfmpegEncoderSpawner {
    binary: String,
}

impl FfmpegEncoderSpawner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for FfmpegEncoderSpawner {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl EncoderSpawner for FfmpegEncoderSpawner {
    fn spawn(
        &mut self,
        format: &StreamFormat,
        destination: &str,
    ) -> Result<Box<dyn EncoderProcess>> {
        let mut child = Command::new(&self.binary)
            .args(encoder_args(format, destination))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn encoder '{}'", self.binary))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("encoder stdin was not captured"))?;
        log::debug!("encoder pid {} started", child.id());
        Ok(Box::new(ChildEncoder {
            child: Arc::new(Mutex::new(child)),
            stdin: Some(stdin),
        }))
    }
}

/// The child sits behind a mutex so a kill from the shutdown path can reach
/// it while the owning thread is blocked writing to stdin.
struct ChildEncoder {
    child: Arc<Mutex<Child>>,
    stdin: Option<ChildStdin>,
}

impl ChildEncoder {
    fn child(&self) -> MutexGuard<'_, Child> {
        match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn poll(&self) -> Result<Option<ExitStatus>> {
        self.child().try_wait().context("poll encoder status")
    }
}

impl EncoderProcess for ChildEncoder {
    fn write_frame(&mut self, pixels: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder input already closed"))?;
        stdin.write_all(pixels).context("write frame to encoder")
    }

    fn try_exit(&mut self) -> Result<Option<EncoderExit>> {
        let status = self.poll()?;
        Ok(status.map(|status| EncoderExit {
            code: status.code(),
        }))
    }

    fn kill_switch(&self) -> Option<Box<dyn Fn() + Send>> {
        let child = Arc::clone(&self.child);
        Some(Box::new(move || {
            if let Ok(mut child) = child.lock() {
                if let Ok(None) = child.try_wait() {
                    log::info!("killing encoder pid {} on shutdown", child.id());
                    let _ = child.kill();
                }
            }
        }))
    }

    fn finish(mut self: Box<Self>, timeout: Duration) -> Result<()> {
        // Dropping stdin closes the pipe, which ends the encoder's input.
        drop(self.stdin.take());

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.poll()? {
                log::debug!("encoder exited: {}", status);
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }

        log::warn!(
            "encoder did not exit within {:.1}s; killing",
            timeout.as_secs_f64()
        );
        let mut child = self.child();
        child.kill().context("kill encoder")?;
        child.wait().context("reap encoder")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_describe_raw_input_and_destination() {
        let format = StreamFormat::new(640, 480, Some(20.0));
        let args = encoder_args(&format, "rtsp://mediamtx:8554/cam1");
        let joined = args.join(" ");
        assert!(joined.contains("-pix_fmt rgb24"));
        assert!(joined.contains("-s 640x480"));
        assert!(joined.contains("-r 20"));
        assert!(joined.contains("-i -"));
        assert!(joined.ends_with("-f rtsp rtsp://mediamtx:8554/cam1"));
    }

    #[test]
    fn file_destination_lets_encoder_pick_muxer() {
        let format = StreamFormat::new(2, 2, None);
        let args = encoder_args(&format, "/tmp/out.mkv");
        assert!(!args.iter().any(|a| a == "rtsp"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mkv"));
        assert!(args.join(" ").contains("-r 30"));
    }

    #[test]
    fn missing_binary_fails_to_spawn() {
        let mut spawner = FfmpegEncoderSpawner::new("/nonexistent/encoder-binary");
        let format = StreamFormat::new(2, 2, None);
        assert!(spawner.spawn(&format, "/tmp/out.mkv").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn exited_child_is_reported_and_rejects_writes() -> Result<()> {
        let mut spawner = FfmpegEncoderSpawner::new("true");
        let format = StreamFormat::new(2, 2, None);
        let mut process = spawner.spawn(&format, "/tmp/unused.mkv")?;

        let deadline = Instant::now() + Duration::from_secs(5);
        let exit = loop {
            if let Some(exit) = process.try_exit()? {
                break exit;
            }
            assert!(Instant::now() < deadline, "child never exited");
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(exit.code, Some(0));

        // The read end is gone, so a large write hits a broken pipe.
        assert!(process.write_frame(&vec![0u8; 1 << 20]).is_err());
        process.finish(Duration::from_secs(1))?;
        Ok(())
    }

    #[cfg(unix)]
    fn stalled_encoder_script(dir: &std::path::Path) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("stalled-encoder.sh");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn kill_switch_unblocks_stalled_write() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let script = stalled_encoder_script(dir.path());
        let mut spawner = FfmpegEncoderSpawner::new(script.to_string_lossy());
        let format = StreamFormat::new(640, 480, None);
        let mut process = spawner.spawn(&format, "/tmp/unused.mkv")?;
        let kill = process.kill_switch().expect("child encoders can be killed");

        let killer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            kill();
        });
        let started = Instant::now();
        // Larger than a pipe buffer, so the write blocks until the kill.
        assert!(process.write_frame(&vec![0u8; format.frame_bytes()]).is_err());
        assert!(started.elapsed() < Duration::from_secs(10));
        killer.join().unwrap();

        assert!(process.try_exit()?.is_some());
        process.finish(Duration::from_secs(1))?;
        Ok(())
    }
}
