//! Inference path: JPEG samples, the detection client seam and dispatch.

mod client;
mod dispatch;
mod result;
mod sample;

pub use client::{
    DetectionClient, HttpDetectionClient, DEFAULT_READY_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};
pub use dispatch::{DetectionSink, DispatchStats, InferenceDispatch};
pub use result::{DetectResponse, Detection};
pub use sample::{encode_jpeg, Sample, DEFAULT_JPEG_QUALITY};
