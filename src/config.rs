use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::detect::{DEFAULT_JPEG_QUALITY, DEFAULT_READY_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
use crate::ingest::{SourceConfig, DEFAULT_RECONNECT_DELAY};
use crate::sampling::SamplingClock;

pub const CONFIG_PATH_ENV: &str = "CAMERA_RELAY_CONFIG";

const DEFAULT_CAMERA_ID: &str = "default_camera";
const DEFAULT_ENCODER_BIN: &str = "ffmpeg";
const DEFAULT_INFERENCE_FPS: f64 = 5.0;
const DEFAULT_PROGRESS_LOG_SECS: f64 = 5.0;

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    camera_id: Option<String>,
    source: Option<SourceConfigFile>,
    output: Option<OutputConfigFile>,
    inference: Option<InferenceConfigFile>,
    progress_log_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    reconnect_delay_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    url: Option<String>,
    encoder_bin: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct InferenceConfigFile {
    service_url: Option<String>,
    fps: Option<f64>,
    jpeg_quality: Option<u8>,
    ready_timeout_secs: Option<f64>,
    request_timeout_secs: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub camera_id: String,
    pub source: SourceSettings,
    pub output: OutputSettings,
    pub inference: InferenceSettings,
    /// Interval between progress log lines from the full-rate loop.
    pub progress_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub url: String,
    pub reconnect_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    /// Re-streaming destination; `None` disables the full-rate encoder.
    pub url: Option<String>,
    pub encoder_bin: String,
}

#[derive(Debug, Clone)]
pub struct InferenceSettings {
    /// Detection service address; `None` disables inference dispatch.
    pub service_url: Option<String>,
    pub fps: f64,
    pub jpeg_quality: u8,
    pub ready_timeout: Duration,
    pub request_timeout: Duration,
}

impl RelayConfig {
    /// Load from the file named by `CAMERA_RELAY_CONFIG` (if set), then
    /// apply environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|path| !path.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Result<Self> {
        let camera_id = file
            .camera_id
            .unwrap_or_else(|| DEFAULT_CAMERA_ID.to_string());
        let source = SourceSettings {
            url: file
                .source
                .as_ref()
                .and_then(|source| source.url.clone())
                .unwrap_or_default(),
            reconnect_delay: match file.source.and_then(|s| s.reconnect_delay_secs) {
                Some(secs) => seconds("source.reconnect_delay_secs", secs)?,
                None => DEFAULT_RECONNECT_DELAY,
            },
        };
        let output = OutputSettings {
            url: file.output.as_ref().and_then(|output| output.url.clone()),
            encoder_bin: file
                .output
                .and_then(|output| output.encoder_bin)
                .unwrap_or_else(|| DEFAULT_ENCODER_BIN.to_string()),
        };
        let inference_file = file.inference.unwrap_or_default();
        let inference = InferenceSettings {
            service_url: inference_file.service_url,
            fps: inference_file.fps.unwrap_or(DEFAULT_INFERENCE_FPS),
            jpeg_quality: inference_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            ready_timeout: match inference_file.ready_timeout_secs {
                Some(secs) => seconds("inference.ready_timeout_secs", secs)?,
                None => DEFAULT_READY_TIMEOUT,
            },
            request_timeout: match inference_file.request_timeout_secs {
                Some(secs) => seconds("inference.request_timeout_secs", secs)?,
                None => DEFAULT_REQUEST_TIMEOUT,
            },
        };
        let progress_interval = seconds(
            "progress_log_secs",
            file.progress_log_secs.unwrap_or(DEFAULT_PROGRESS_LOG_SECS),
        )?;
        Ok(Self {
            camera_id,
            source,
            output,
            inference,
            progress_interval,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(camera_id) = env_value("CAMERA_ID") {
            self.camera_id = camera_id;
        }
        if let Some(url) = env_value("SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(url) = env_value("RTSP_OUT_URL") {
            self.output.url = Some(url);
        }
        if let Some(url) = env_value("INFERENCE_SERVICE_URL") {
            self.inference.service_url = Some(url);
        }
        if let Some(bin) = env_value("ENCODER_BIN") {
            self.output.encoder_bin = bin;
        }
        if let Some(fps) = env_value("INFERENCE_FPS") {
            self.inference.fps = fps
                .parse()
                .map_err(|_| anyhow!("INFERENCE_FPS must be a number"))?;
        }
        if let Some(quality) = env_value("JPEG_QUALITY") {
            self.inference.jpeg_quality = quality
                .parse()
                .map_err(|_| anyhow!("JPEG_QUALITY must be an integer between 1 and 100"))?;
        }
        if let Some(delay) = env_seconds("RECONNECT_DELAY_SECS")? {
            self.source.reconnect_delay = delay;
        }
        if let Some(timeout) = env_seconds("INFERENCE_READY_TIMEOUT_SECS")? {
            self.inference.ready_timeout = timeout;
        }
        if let Some(timeout) = env_seconds("INFERENCE_TIMEOUT_SECS")? {
            self.inference.request_timeout = timeout;
        }
        if let Some(interval) = env_seconds("PROGRESS_LOG_SECS")? {
            self.progress_interval = interval;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.source.url = self.source.url.trim().to_string();
        if self.source.url.is_empty() {
            return Err(anyhow!("SOURCE_URL is required"));
        }
        self.camera_id = self.camera_id.trim().to_string();
        if self.camera_id.is_empty() {
            return Err(anyhow!("camera id must not be empty"));
        }
        if !self.inference.fps.is_finite() || self.inference.fps <= 0.0 {
            return Err(anyhow!(
                "inference fps must be greater than zero, got {}",
                self.inference.fps
            ));
        }
        SamplingClock::from_rate(self.inference.fps)?;
        if !(1..=100).contains(&self.inference.jpeg_quality) {
            return Err(anyhow!(
                "JPEG quality must be between 1 and 100, got {}",
                self.inference.jpeg_quality
            ));
        }
        if self.inference.request_timeout.is_zero() {
            return Err(anyhow!("inference request timeout must be greater than zero"));
        }
        if self.progress_interval.is_zero() {
            return Err(anyhow!("progress log interval must be greater than zero"));
        }
        self.output.url = self.output.url.take().filter(|url| !url.trim().is_empty());
        self.inference.service_url = self
            .inference
            .service_url
            .take()
            .filter(|url| !url.trim().is_empty());
        Ok(())
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig::new(self.camera_id.clone(), self.source.url.clone())
            .with_reconnect_delay(self.source.reconnect_delay)
    }

    pub fn output_enabled(&self) -> bool {
        self.output.url.is_some()
    }

    pub fn inference_enabled(&self) -> bool {
        self.inference.service_url.is_some()
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_seconds(key: &str) -> Result<Option<Duration>> {
    match env_value(key) {
        Some(raw) => {
            let secs: f64 = raw
                .parse()
                .map_err(|_| anyhow!("{} must be a number of seconds", key))?;
            seconds(key, secs).map(Some)
        }
        None => Ok(None),
    }
}

fn seconds(name: &str, secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(anyhow!("{} must be a non-negative number of seconds", name));
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_defaults_are_filled_in() -> Result<()> {
        let cfg = RelayConfig::from_file(RelayConfigFile::default())?;
        assert_eq!(cfg.camera_id, "default_camera");
        assert_eq!(cfg.inference.fps, 5.0);
        assert_eq!(cfg.inference.jpeg_quality, 85);
        assert_eq!(cfg.source.reconnect_delay, Duration::from_secs(5));
        assert_eq!(cfg.inference.ready_timeout, Duration::from_secs(10));
        assert_eq!(cfg.output.encoder_bin, "ffmpeg");
        assert!(cfg.output.url.is_none());
        Ok(())
    }

    #[test]
    fn validate_requires_source() -> Result<()> {
        let mut cfg = RelayConfig::from_file(RelayConfigFile::default())?;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("SOURCE_URL"));
        Ok(())
    }

    #[test]
    fn validate_rejects_bad_rates() -> Result<()> {
        let mut cfg = RelayConfig::from_file(RelayConfigFile::default())?;
        cfg.source.url = "stub://cam".to_string();
        cfg.inference.fps = 0.0;
        assert!(cfg.validate().is_err());
        cfg.inference.fps = 1e-30;
        assert!(cfg.validate().is_err());
        cfg.inference.fps = 5.0;
        cfg.inference.jpeg_quality = 0;
        assert!(cfg.validate().is_err());
        cfg.inference.jpeg_quality = 90;
        cfg.validate()?;
        Ok(())
    }

    #[test]
    fn negative_seconds_are_rejected() {
        assert!(seconds("delay", -1.0).is_err());
        assert!(seconds("delay", f64::NAN).is_err());
        assert_eq!(seconds("delay", 0.5).ok(), Some(Duration::from_millis(500)));
    }
}
