//! camera_relay - Single-camera ingestion daemon.
//!
//! This daemon:
//! 1. Loads configuration (JSON file + environment)
//! 2. Connects to the detection service, if configured
//! 3. Runs the full-rate re-streaming loop and the sampled inference loop
//! 4. Stops both loops on Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use camera_relay::ingest::redact_locator;
use camera_relay::pipeline::connect_detection_client;
use camera_relay::{Pipeline, RelayConfig};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Relay one camera to a re-streaming encoder and a detection service"
)]
struct Args {
    /// JSON config file. Environment variables override its values.
    #[arg(long, env = "CAMERA_RELAY_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match RelayConfig::load_from(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            log::error!("configuration error: {:#}", err);
            std::process::exit(1);
        }
    };

    log::info!("camera_relay starting");
    log::info!("  Camera: {}", config.camera_id);
    log::info!("  Source: {}", redact_locator(&config.source.url));
    log::info!(
        "  Output: {}",
        config
            .output
            .url
            .as_deref()
            .map(redact_locator)
            .unwrap_or_else(|| "disabled".to_string())
    );
    log::info!(
        "  Inference: {} @ {} fps",
        config
            .inference
            .service_url
            .as_deref()
            .unwrap_or("disabled"),
        config.inference.fps
    );

    let mut pipeline = Pipeline::new(config.clone());
    if let Some(client) = connect_detection_client(&config.inference) {
        pipeline = pipeline.with_detection_client(client);
    }
    let handle = pipeline.spawn()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("camera_relay waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping pipeline...");
    let report = handle.stop()?;

    if let Some(full_rate) = report.full_rate {
        log::info!(
            "full-rate: {} frames read, {} forwarded, {} reconnects",
            full_rate.frames_read,
            full_rate.frames_forwarded,
            full_rate.source.reconnects
        );
    }
    if let Some(sampled) = report.sampled {
        log::info!(
            "sampled: {} samples, {} dispatched, {} failed, {} detections",
            sampled.samples,
            sampled.dispatch.dispatched,
            sampled.dispatch.failed,
            sampled.dispatch.detections
        );
    }
    Ok(())
}
