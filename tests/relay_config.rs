use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use camera_relay::config::RelayConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAMERA_RELAY_CONFIG",
        "CAMERA_ID",
        "SOURCE_URL",
        "RTSP_OUT_URL",
        "INFERENCE_SERVICE_URL",
        "INFERENCE_FPS",
        "RECONNECT_DELAY_SECS",
        "JPEG_QUALITY",
        "ENCODER_BIN",
        "INFERENCE_READY_TIMEOUT_SECS",
        "INFERENCE_TIMEOUT_SECS",
        "PROGRESS_LOG_SECS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "camera_id": "front_door",
        "source": {
            "url": "rtsp://camera-1/stream",
            "reconnect_delay_secs": 2
        },
        "output": {
            "url": "rtsp://mediamtx:8554/front_door",
            "encoder_bin": "/usr/local/bin/ffmpeg"
        },
        "inference": {
            "service_url": "inference-service:50051",
            "fps": 2,
            "jpeg_quality": 70,
            "ready_timeout_secs": 3,
            "request_timeout_secs": 1.5
        },
        "progress_log_secs": 30
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("CAMERA_RELAY_CONFIG", file.path());
    std::env::set_var("CAMERA_ID", "rear_gate");
    std::env::set_var("INFERENCE_FPS", "10");
    std::env::set_var("RECONNECT_DELAY_SECS", "0.5");
    // Blank values do not override.
    std::env::set_var("RTSP_OUT_URL", "   ");

    let cfg = RelayConfig::load().expect("load config");

    assert_eq!(cfg.camera_id, "rear_gate");
    assert_eq!(cfg.source.url, "rtsp://camera-1/stream");
    assert_eq!(cfg.source.reconnect_delay, Duration::from_millis(500));
    assert_eq!(
        cfg.output.url.as_deref(),
        Some("rtsp://mediamtx:8554/front_door")
    );
    assert_eq!(cfg.output.encoder_bin, "/usr/local/bin/ffmpeg");
    assert_eq!(
        cfg.inference.service_url.as_deref(),
        Some("inference-service:50051")
    );
    assert_eq!(cfg.inference.fps, 10.0);
    assert_eq!(cfg.inference.jpeg_quality, 70);
    assert_eq!(cfg.inference.ready_timeout, Duration::from_secs(3));
    assert_eq!(cfg.inference.request_timeout, Duration::from_millis(1500));
    assert_eq!(cfg.progress_interval, Duration::from_secs(30));
    assert!(cfg.output_enabled());
    assert!(cfg.inference_enabled());

    let source = cfg.source_config();
    assert_eq!(source.camera_id, "rear_gate");
    assert_eq!(source.reconnect_delay, Duration::from_millis(500));

    clear_env();
}

#[test]
fn env_only_config_uses_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SOURCE_URL", "/videos/parking.mp4");

    let cfg = RelayConfig::load().expect("load config");
    assert_eq!(cfg.camera_id, "default_camera");
    assert_eq!(cfg.source.url, "/videos/parking.mp4");
    assert_eq!(cfg.source.reconnect_delay, Duration::from_secs(5));
    assert_eq!(cfg.inference.fps, 5.0);
    assert_eq!(cfg.inference.jpeg_quality, 85);
    assert_eq!(cfg.inference.ready_timeout, Duration::from_secs(10));
    assert_eq!(cfg.inference.request_timeout, Duration::from_secs(5));
    assert_eq!(cfg.progress_interval, Duration::from_secs(5));
    assert_eq!(cfg.output.encoder_bin, "ffmpeg");
    assert!(!cfg.output_enabled());
    assert!(!cfg.inference_enabled());

    clear_env();
}

#[test]
fn missing_source_is_fatal() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMERA_ID", "cam1");
    let err = RelayConfig::load().unwrap_err();
    assert!(err.to_string().contains("SOURCE_URL"), "{err}");

    clear_env();
}

#[test]
fn invalid_numbers_are_fatal() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SOURCE_URL", "stub://cam");
    std::env::set_var("INFERENCE_FPS", "fast");
    assert!(RelayConfig::load().is_err());

    std::env::set_var("INFERENCE_FPS", "0");
    assert!(RelayConfig::load().is_err());

    std::env::set_var("INFERENCE_FPS", "1e-30");
    assert!(RelayConfig::load().is_err());

    std::env::set_var("INFERENCE_FPS", "5");
    std::env::set_var("JPEG_QUALITY", "101");
    assert!(RelayConfig::load().is_err());

    std::env::remove_var("JPEG_QUALITY");
    std::env::set_var("RECONNECT_DELAY_SECS", "-1");
    assert!(RelayConfig::load().is_err());

    clear_env();
}

#[test]
fn unreadable_config_file_is_reported() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ not json").expect("write config");
    std::env::set_var("CAMERA_RELAY_CONFIG", file.path());
    std::env::set_var("SOURCE_URL", "stub://cam");

    let err = RelayConfig::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"), "{err}");

    clear_env();
}
