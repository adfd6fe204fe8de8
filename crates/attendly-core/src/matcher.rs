//! Probe-to-gallery matching.

use crate::config::{ConfigError, PipelineConfig};
use crate::gallery::Gallery;
use crate::types::{DistanceMetric, Embedding, MatchDecision, MatchOutcome};
use std::sync::Arc;

/// Scores closer than this are treated as a tie.
const TIE_EPSILON: f32 = 1e-6;

/// Strategy for resolving a probe embedding to a gallery identity.
///
/// Implementations must never guess: anything other than a single clear
/// winner within tolerance is reported as `Unknown` or `Ambiguous`.
pub trait Matcher: Send + Sync {
    fn compare(&self, probe: &Embedding) -> MatchOutcome;
}

/// Exhaustive scan over every reference of every identity.
///
/// An identity's score is its minimum distance across its references.
/// Linear in gallery size × references, fine for galleries in the tens of
/// thousands at per-frame rates.
pub struct LinearMatcher {
    gallery: Arc<Gallery>,
    metric: DistanceMetric,
    tolerance: f32,
}

impl LinearMatcher {
    pub fn new(gallery: Arc<Gallery>, config: &PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            gallery,
            metric: config.metric,
            tolerance: config.tolerance,
        })
    }
}

impl Matcher for LinearMatcher {
    fn compare(&self, probe: &Embedding) -> MatchOutcome {
        if let Some(dim) = self.gallery.dimension() {
            if probe.dim() != dim {
                tracing::warn!(probe_dim = probe.dim(), gallery_dim = dim, "probe dimension mismatch");
                return MatchOutcome::unknown(None);
            }
        }

        let snapshot = self.gallery.snapshot();
        let scores: Vec<(usize, f32)> = snapshot
            .iter()
            .enumerate()
            .filter_map(|(i, identity)| {
                let score = identity
                    .references
                    .iter()
                    .map(|r| self.metric.distance(probe, r))
                    .filter(|d| d.is_finite())
                    .fold(f32::INFINITY, f32::min);
                score.is_finite().then_some((i, score))
            })
            .collect();

        let best_score = scores.iter().map(|&(_, s)| s).fold(f32::INFINITY, f32::min);
        let leaders: Vec<usize> = scores
            .iter()
            .filter(|&&(_, s)| s - best_score <= TIE_EPSILON)
            .map(|&(i, _)| i)
            .collect();

        if leaders.is_empty() {
            return MatchOutcome::unknown(None);
        }
        if best_score > self.tolerance {
            tracing::debug!(distance = best_score, tolerance = self.tolerance, "no match within tolerance");
            return MatchOutcome::unknown(Some(best_score));
        }
        if leaders.len() > 1 {
            let candidates: Vec<_> = leaders.iter().map(|&i| snapshot[i].id.clone()).collect();
            tracing::debug!(?candidates, distance = best_score, "ambiguous match");
            return MatchOutcome {
                decision: MatchDecision::Ambiguous { candidates },
                distance: Some(best_score),
            };
        }

        let winner = &snapshot[leaders[0]];
        MatchOutcome {
            decision: MatchDecision::Matched {
                identity_id: winner.id.clone(),
                name: winner.name.clone(),
            },
            distance: Some(best_score),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn matcher(gallery: &Arc<Gallery>, metric: DistanceMetric, tolerance: f32) -> LinearMatcher {
        let config = PipelineConfig { tolerance, metric, ..Default::default() };
        LinearMatcher::new(Arc::clone(gallery), &config).unwrap()
    }

    #[test]
    fn test_ties_are_measured_from_the_overall_best() {
        let gallery = Arc::new(Gallery::new());
        gallery.add("A", "Alice", vec![emb(&[0.1])]).unwrap();
        gallery.add("B", "Bob", vec![emb(&[0.0999993])]).unwrap();
        gallery.add("C", "Carol", vec![emb(&[0.0999986])]).unwrap();

        // A is 1.4e-6 behind the best, B only 0.7e-6.
        let outcome = matcher(&gallery, DistanceMetric::Euclidean, 0.5).compare(&emb(&[0.0]));
        match outcome.decision {
            MatchDecision::Ambiguous { candidates } => assert_eq!(candidates, vec!["B", "C"]),
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    fn matched_id(outcome: &MatchOutcome) -> Option<&str> {
        match &outcome.decision {
            MatchDecision::Matched { identity_id, .. } => Some(identity_id),
            _ => None,
        }
    }

    #[test]
    fn test_self_match_and_far_probe() {
        let gallery = Arc::new(Gallery::new());
        let a = emb(&[0.2, 0.4, 0.1, 0.9]);
        gallery.add("A", "Alice", vec![a.clone()]).unwrap();
        let m = matcher(&gallery, DistanceMetric::Euclidean, 0.5);

        let hit = m.compare(&a);
        assert_eq!(matched_id(&hit), Some("A"));
        assert!(hit.distance.unwrap().abs() < 1e-6);

        let far = m.compare(&emb(&[9.0, -7.0, 5.0, -3.0]));
        assert_eq!(far.decision, MatchDecision::Unknown);
        assert!(far.distance.unwrap() > 0.5);
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let gallery = Arc::new(Gallery::new());
        let m = matcher(&gallery, DistanceMetric::Cosine, 0.6);
        assert_eq!(m.compare(&emb(&[1.0, 0.0])), MatchOutcome::unknown(None));
    }

    #[test]
    fn test_picks_global_minimum_across_references() {
        let gallery = Arc::new(Gallery::new());
        gallery
            .add("A", "Alice", vec![emb(&[0.0, 1.0]), emb(&[0.9, 0.1])])
            .unwrap();
        gallery.add("B", "Bob", vec![emb(&[0.7, 0.3])]).unwrap();
        let m = matcher(&gallery, DistanceMetric::Euclidean, 0.5);

        // A's second reference is closer than B's only reference.
        let outcome = m.compare(&emb(&[1.0, 0.0]));
        assert_eq!(matched_id(&outcome), Some("A"));
    }

    #[test]
    fn test_tie_is_ambiguous() {
        let gallery = Arc::new(Gallery::new());
        gallery.add("A", "Alice", vec![emb(&[1.0, 0.0])]).unwrap();
        gallery.add("B", "Bob", vec![emb(&[-1.0, 0.0])]).unwrap();
        let m = matcher(&gallery, DistanceMetric::Euclidean, 2.0);

        let outcome = m.compare(&emb(&[0.0, 1.0]));
        match outcome.decision {
            MatchDecision::Ambiguous { candidates } => assert_eq!(candidates, vec!["A", "B"]),
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn test_tie_beyond_tolerance_is_unknown() {
        let gallery = Arc::new(Gallery::new());
        gallery.add("A", "Alice", vec![emb(&[1.0, 0.0])]).unwrap();
        gallery.add("B", "Bob", vec![emb(&[-1.0, 0.0])]).unwrap();
        let m = matcher(&gallery, DistanceMetric::Euclidean, 0.5);
        assert_eq!(m.compare(&emb(&[0.0, 1.0])).decision, MatchDecision::Unknown);
    }

    #[test]
    fn test_removed_identity_never_matches() {
        let gallery = Arc::new(Gallery::new());
        gallery.add("A", "Alice", vec![emb(&[1.0, 0.0])]).unwrap();
        let m = matcher(&gallery, DistanceMetric::Cosine, 0.6);
        assert_eq!(matched_id(&m.compare(&emb(&[1.0, 0.0]))), Some("A"));

        gallery.remove("A").unwrap();
        assert_eq!(m.compare(&emb(&[1.0, 0.0])).decision, MatchDecision::Unknown);
    }

    #[test]
    fn test_dimension_mismatch_is_unknown() {
        let gallery = Arc::new(Gallery::new());
        gallery.add("A", "Alice", vec![emb(&[1.0, 0.0])]).unwrap();
        let m = matcher(&gallery, DistanceMetric::Cosine, 0.6);
        assert_eq!(m.compare(&emb(&[1.0, 0.0, 0.0])), MatchOutcome::unknown(None));
    }

    #[test]
    fn test_cosine_tolerance_boundary() {
        let gallery = Arc::new(Gallery::new());
        gallery.add("A", "Alice", vec![emb(&[1.0, 0.0])]).unwrap();
        // Orthogonal probe: cosine distance exactly 1.0.
        let strict = matcher(&gallery, DistanceMetric::Cosine, 0.6);
        assert_eq!(strict.compare(&emb(&[0.0, 1.0])).decision, MatchDecision::Unknown);
        let loose = matcher(&gallery, DistanceMetric::Cosine, 1.0);
        assert_eq!(matched_id(&loose.compare(&emb(&[0.0, 1.0]))), Some("A"));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let gallery = Arc::new(Gallery::new());
        let config = PipelineConfig { tolerance: f32::NAN, ..Default::default() };
        assert!(LinearMatcher::new(gallery, &config).is_err());
    }
}
