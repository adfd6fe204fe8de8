//! attendly-core: face-recognition attendance engine.
//!
//! Frames go through detection (SCRFD) and embedding (ArcFace) via ONNX
//! Runtime, are matched against an in-memory gallery, and feed a
//! per-identity session tracker that emits at most one attendance record
//! per identity per day to an event sink.

pub mod config;
pub mod detector;
pub mod dispatch;
pub mod encoder;
pub mod gallery;
pub mod matcher;
pub mod pipeline;
pub mod processor;
pub mod report;
pub mod sink;
pub mod tracker;
pub mod types;

pub use config::{ConfigError, PipelineConfig, RetryPolicy};
pub use dispatch::{spawn_dispatcher, SinkHandle};
pub use gallery::{Gallery, GalleryError};
pub use pipeline::{Clock, FrameSource, CAPTURE_ERROR_BACKOFF, Pipeline, RawFrame, SourceError, StepOutcome, SystemClock};
pub use sink::{DateRange, EventSink, SinkError, SinkEvent};
pub use types::{
    AttendanceRecord, AttendanceStatus, BoundingBox, DistanceMetric, Embedding, FrameRef, Identity,
    IdentityId, MatchDecision, MatchResult,
};
