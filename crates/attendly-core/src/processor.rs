//! Per-frame detect → encode → match.

use crate::config::{ConfigError, PipelineConfig};
use crate::detector::{DetectError, FaceDetector};
use crate::encoder::{EncodeError, FaceEncoder};
use crate::matcher::Matcher;
use crate::types::{Embedding, FrameRef, MatchResult, Probe};
use chrono::NaiveDateTime;
use std::time::Duration;

/// Resolves every face in a frame to an identity or "unknown".
pub struct FrameProcessor {
    detector: Box<dyn FaceDetector>,
    encoder: Box<dyn FaceEncoder>,
    matcher: Box<dyn Matcher>,
    max_faces: usize,
}

impl FrameProcessor {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        encoder: Box<dyn FaceEncoder>,
        matcher: Box<dyn Matcher>,
        config: &PipelineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            detector,
            encoder,
            matcher,
            max_faces: config.max_faces_per_frame,
        })
    }

    /// Match every detected face, in detector order.
    ///
    /// A detector failure fails the whole frame; a face that cannot be
    /// encoded is skipped and the rest of the frame is still processed.
    pub fn process(
        &mut self,
        frame: &FrameRef<'_>,
        timestamp: NaiveDateTime,
    ) -> Result<Vec<MatchResult>, DetectError> {
        let faces = self.detector.detect(frame)?;
        if faces.len() > self.max_faces {
            tracing::debug!(detected = faces.len(), limit = self.max_faces, "face limit reached");
        }

        let mut results = Vec::with_capacity(faces.len().min(self.max_faces));
        for (index, region) in faces.into_iter().take(self.max_faces).enumerate() {
            let embedding = match self.encoder.encode(frame, &region) {
                Ok(e) => e,
                Err(EncodeError::EncodingFailed(reason)) => {
                    tracing::debug!(index, %reason, "skipping unencodable face");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(index, error = %err, "embedding failed; skipping face");
                    continue;
                }
            };

            let outcome = self.matcher.compare(&embedding);
            tracing::debug!(index, decision = ?outcome.decision, distance = ?outcome.distance, "face resolved");
            results.push(MatchResult {
                probe: Probe {
                    embedding,
                    captured_at: timestamp,
                    region,
                },
                decision: outcome.decision,
                distance: outcome.distance,
                decided_at: timestamp,
            });
        }
        Ok(results)
    }

    /// Detect and encode without matching. Used for enrollment; returns the
    /// embedding of the most confident encodable face.
    pub fn best_embedding(&mut self, frame: &FrameRef<'_>) -> Result<Option<Embedding>, DetectError> {
        let mut faces = self.detector.detect(frame)?;
        faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        for region in faces {
            match self.encoder.encode(frame, &region) {
                Ok(e) => return Ok(Some(e)),
                Err(err) => tracing::debug!(error = %err, "enrollment face not encodable"),
            }
        }
        Ok(None)
    }
}

/// Admits at most one frame per `interval`; the rest are dropped by the caller.
#[derive(Debug, Clone)]
pub struct FrameSampler {
    interval: Duration,
    last: Option<NaiveDateTime>,
}

impl FrameSampler {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// Returns true if a frame captured at `at` should be processed.
    pub fn admit(&mut self, at: NaiveDateTime) -> bool {
        let due = match self.last {
            None => true,
            // A clock step backwards re-arms the sampler.
            Some(last) => (at - last).to_std().map_or(true, |elapsed| elapsed >= self.interval),
        };
        if due {
            self.last = Some(at);
        }
        due
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    //! Scripted capabilities shared by processor and pipeline tests.

    use super::*;
    use crate::types::BoundingBox;
    use std::collections::VecDeque;

    /// Returns queued detections, one entry per call; no faces once exhausted.
    pub struct ScriptedDetector {
        pub script: VecDeque<Result<Vec<BoundingBox>, DetectError>>,
    }

    impl FaceDetector for ScriptedDetector {
        fn detect(&mut self, _frame: &FrameRef<'_>) -> Result<Vec<BoundingBox>, DetectError> {
            self.script.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    /// Maps a region's x coordinate to an embedding; unlisted regions fail encoding.
    pub struct TableEncoder {
        pub table: Vec<(f32, Embedding)>,
    }

    impl FaceEncoder for TableEncoder {
        fn encode(&mut self, _frame: &FrameRef<'_>, region: &BoundingBox) -> Result<Embedding, EncodeError> {
            self.table
                .iter()
                .find(|(x, _)| (*x - region.x).abs() < 1e-3)
                .map(|(_, e)| e.clone())
                .ok_or_else(|| EncodeError::EncodingFailed(format!("no face at x={}", region.x)))
        }
    }

    pub fn face_at(x: f32) -> BoundingBox {
        BoundingBox { x, y: 0.0, width: 60.0, height: 60.0, confidence: 0.9 }
    }
}
