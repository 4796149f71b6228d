//! Camera Relay
//!
//! Edge ingestion for one camera: pulls frames from a file or network
//! stream, keeps the connection alive across failures and fans the frames
//! out to two independent consumers.
//!
//! # Architecture
//!
//! ```text
//! SourceConnection ──► FullRateLoop ──► EncoderSupervisor ──► ffmpeg ──► RTSP
//! SourceConnection ──► SampledLoop  ──► SamplingClock ──► JPEG ──► InferenceDispatch
//! ```
//!
//! Each loop owns its own connection to the source, so a slow consumer never
//! starves the other. Three failure domains recover on their own:
//! - source disconnects: [`SourceConnection::reconnect_loop`]
//! - encoder crashes: [`EncoderSupervisor`] respawns on the next frame
//! - detection service errors: the sample is logged and dropped
//!
//! # Module Structure
//!
//! - `config`: file + environment configuration
//! - `frame`: owned RGB24 frames and negotiated stream format
//! - `ingest`: source connection state machine and decode backends
//! - `sampling`: time-based rate limiter for the inference path
//! - `output`: encoder child-process supervision
//! - `detect`: detection client, result types and dispatch
//! - `pipeline`: the two distribution loops and their threads

pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod output;
pub mod pipeline;
pub mod sampling;
pub mod shutdown;

pub use config::RelayConfig;
pub use detect::{Detection, DetectionClient, HttpDetectionClient, InferenceDispatch, Sample};
pub use frame::{Frame, StreamFormat};
pub use ingest::{ConnectionState, ReadOutcome, SourceConfig, SourceConnection, SourceKind};
pub use output::{EncoderState, EncoderSupervisor};
pub use pipeline::{Pipeline, PipelineHandle, PipelineReport};
pub use sampling::SamplingClock;
pub use shutdown::ShutdownSignal;
