//! Detection service client.
//!
//! The service accepts a JPEG body on `POST /v1/detect` (camera id in the
//! `X-Camera-Id` header) and answers with a JSON list of detections.
//! `GET /health` answers 2xx once the service is ready.

use anyhow::{anyhow, Context, Result};
use std::time::{Duration, Instant};
use url::Url;

use super::result::{DetectResponse, Detection};

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);
const CAMERA_ID_HEADER: &str = "X-Camera-Id";

/// Synchronous call into the detection collaborator.
pub trait DetectionClient: Send {
    fn detect(&mut self, image: &[u8], camera_id: &str) -> Result<Vec<Detection>>;
}

pub struct HttpDetectionClient {
    base: Url,
    agent: ureq::Agent,
}

impl HttpDetectionClient {
    /// `address` may omit the scheme (`inference-service:50051`).
    pub fn new(address: &str, request_timeout: Duration) -> Result<Self> {
        let base = normalize_address(address)?;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(request_timeout)
            .timeout(request_timeout)
            .build();
        log::info!("detection client targeting {}", base);
        Ok(Self { base, agent })
    }

    /// Poll the health endpoint until it answers or `timeout` expires.
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let health = self.base.join("health").context("build health url")?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self
                .agent
                .get(health.as_str())
                .timeout(remaining.max(Duration::from_millis(1)))
                .call()
            {
                Ok(_) => {
                    log::info!("detection service ready at {}", self.base);
                    return Ok(());
                }
                Err(err) => log::debug!("detection service not ready: {}", err),
            }
            if Instant::now() + READY_POLL_INTERVAL >= deadline {
                return Err(anyhow!(
                    "detection service at {} not ready within {:.1}s",
                    self.base,
                    timeout.as_secs_f64()
                ));
            }
            std::thread::sleep(READY_POLL_INTERVAL);
        }
    }
}

impl DetectionClient for HttpDetectionClient {
    fn detect(&mut self, image: &[u8], camera_id: &str) -> Result<Vec<Detection>> {
        let url = self.base.join("v1/detect").context("build detect url")?;
        let response = self
            .agent
            .post(url.as_str())
            .set("Content-Type", "image/jpeg")
            .set(CAMERA_ID_HEADER, camera_id)
            .send_bytes(image)
            .map_err(|err| match err {
                ureq::Error::Status(code, response) => anyhow!(
                    "detection service returned status {} ({})",
                    code,
                    response.status_text()
                ),
                ureq::Error::Transport(transport) => {
                    anyhow!("detection service unreachable: {}", transport)
                }
            })?;
        let body: DetectResponse = serde_json::from_reader(response.into_reader())
            .context("decode detection response")?;
        Ok(body.detections)
    }
}

fn normalize_address(address: &str) -> Result<Url> {
    let address = address.trim();
    if address.is_empty() {
        return Err(anyhow!("detection service address is empty"));
    }
    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };
    let mut url = Url::parse(&with_scheme)
        .with_context(|| format!("invalid detection service address '{}'", address))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(anyhow!(
                "unsupported detection service scheme '{}'; expected http(s)",
                other
            ))
        }
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
