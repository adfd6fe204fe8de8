//! The capture-and-process loop: frame source → processor → tracker → sink.
//!
//! Single producer, single consumer. The pipeline owns the tracker, so
//! session updates are serialised; sink writes are handed off to the
//! dispatcher thread and never stall capture.

use crate::config::{ConfigError, PipelineConfig};
use crate::dispatch::SinkHandle;
use crate::processor::{FrameProcessor, FrameSampler};
use crate::sink::SinkEvent;
use crate::tracker::SessionTracker;
use crate::types::FrameRef;
use chrono::NaiveDateTime;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Pause after a failed grab so a broken camera does not spin the loop.
pub const CAPTURE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum SourceError {
    /// The frame arrived but is not worth processing (e.g. too dark).
    #[error("unusable frame: {0}")]
    Unusable(String),
    #[error(transparent)]
    Device(Box<dyn std::error::Error + Send + Sync>),
}

/// An owned grayscale frame from a source.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// A live frame producer, such as a camera. Dropping it releases the device.
pub trait FrameSource: Send {
    /// Next frame; `Ok(None)` once the source has ended for good.
    fn grab(&mut self) -> Result<Option<RawFrame>, SourceError>;
}

/// Wall clock used to stamp frames and drive timeouts.
pub trait Clock: Send {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// What one [`Pipeline::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Frame processed; `faces` match results fed to the tracker.
    Processed { faces: usize },
    /// Frame arrived before the sampling interval elapsed and was discarded.
    Dropped,
    /// Frame could not be captured and was skipped.
    CaptureFailed,
    /// Detector failed on the frame and it was skipped.
    DetectFailed,
    /// The source ended and has been released.
    Ended,
    /// No source attached.
    Detached,
}

pub struct Pipeline {
    processor: FrameProcessor,
    tracker: SessionTracker,
    sampler: FrameSampler,
    sink: SinkHandle,
    clock: Box<dyn Clock>,
    source: Option<Box<dyn FrameSource>>,
}

impl Pipeline {
    pub fn new(
        processor: FrameProcessor,
        config: &PipelineConfig,
        sink: SinkHandle,
        clock: Box<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            processor,
            tracker: SessionTracker::new(config)?,
            sampler: FrameSampler::new(config.sample_interval),
            sink,
            clock,
            source: None,
        })
    }

    /// Start reading from `source`, releasing any previous one. Open
    /// sessions carry over to the new source.
    pub fn attach(&mut self, source: Box<dyn FrameSource>) {
        self.release_source();
        self.source = Some(source);
        tracing::info!("frame source attached");
    }

    /// Drop the current source, releasing the device, and close every open
    /// session at its last sighting. No timeouts run while detached.
    pub fn detach(&mut self) {
        self.release_source();
        let events = self.tracker.close_all();
        self.emit(events);
    }

    fn release_source(&mut self) {
        if self.source.take().is_some() {
            tracing::info!("frame source released");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.source.is_some()
    }

    pub fn processor_mut(&mut self) -> &mut FrameProcessor {
        &mut self.processor
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    /// One capture cycle. Timeouts are evaluated on every cycle, including
    /// dropped and failed ones.
    pub fn step(&mut self) -> StepOutcome {
        let Some(source) = self.source.as_mut() else {
            return StepOutcome::Detached;
        };
        let grabbed = source.grab();
        let now = self.clock.now();

        let outcome = match grabbed {
            Ok(None) => {
                tracing::info!("frame source ended");
                self.detach();
                StepOutcome::Ended
            }
            Err(SourceError::Unusable(reason)) => {
                tracing::debug!(%reason, "frame skipped");
                StepOutcome::CaptureFailed
            }
            Err(err) => {
                tracing::warn!(error = %err, "frame capture failed; skipping");
                StepOutcome::CaptureFailed
            }
            Ok(Some(_)) if !self.sampler.admit(now) => StepOutcome::Dropped,
            Ok(Some(frame)) => {
                let view = FrameRef::new(&frame.data, frame.width, frame.height);
                match self.processor.process(&view, now) {
                    Ok(results) => {
                        for result in &results {
                            let events = self.tracker.observe(result);
                            self.emit(events);
                        }
                        StepOutcome::Processed { faces: results.len() }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "face detection failed; skipping frame");
                        StepOutcome::DetectFailed
                    }
                }
            }
        };

        let events = self.tracker.evaluate(now);
        self.emit(events);
        outcome
    }

    /// Loop until `stop` is set or the source ends. The source is released
    /// and open sessions closed on every exit path, including a panic
    /// inside a step.
    pub fn run(&mut self, stop: &AtomicBool) {
        let guard = Attached(self);
        while !stop.load(Ordering::Relaxed) {
            match guard.0.step() {
                StepOutcome::Ended | StepOutcome::Detached => break,
                StepOutcome::CaptureFailed => std::thread::sleep(CAPTURE_ERROR_BACKOFF),
                _ => {}
            }
        }
    }

    fn emit(&self, events: Vec<SinkEvent>) {
        for event in events {
            self.sink.submit(event);
        }
    }
}

/// Detaches the source when dropped.
struct Attached<'a>(&'a mut Pipeline);

impl Drop for Attached<'_> {
    fn drop(&mut self) {
        self.0.detach();
    }
}
