use crate::registry::RegistryCache;
use serde::{Deserialize, Serialize};

/// Cosine similarity cutoff the bundled ArcFace encoder is calibrated for.
pub const ARCFACE_COSINE_THRESHOLD: f32 = 0.40;

/// Default Euclidean distance cutoff for a positive match.
///
/// ArcFace signatures are unit vectors, so this is [`ARCFACE_COSINE_THRESHOLD`]
/// expressed as a distance: `sqrt(2 - 2 * 0.40)`. A candidate matches only when its
/// nearest reference is strictly closer than this.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 1.095_445;

/// Euclidean distance between two unit vectors whose cosine similarity is `cos`.
pub fn unit_distance_for_cosine(cos: f32) -> f32 {
    (2.0 - 2.0 * cos).max(0.0).sqrt()
}

/// Name reported when the nearest reference is not close enough.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Location of a detected face in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceLocation {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
}

impl FaceLocation {
    /// Scale the box by `factor`, e.g. to map a location found on a
    /// downscaled frame back onto the full-resolution frame.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
        }
    }
}

/// Fixed-length face signature produced by an extractor.
///
/// Immutable once built; the dimensionality is whatever the extractor emits
/// (128 for dlib-style encoders, 512 for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceSignature {
    values: Vec<f32>,
}

impl FaceSignature {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance to `other`.
    ///
    /// Signatures of different dimensionality are incomparable and yield
    /// `f32::INFINITY`, which the matcher skips.
    pub fn distance(&self, other: &FaceSignature) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for FaceSignature {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// A known person and their enrolled reference signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub signatures: Vec<FaceSignature>,
}

/// Outcome of matching one candidate signature against the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Name of the matched identity; `None` when unmatched.
    pub name: Option<String>,
    /// Distance to the nearest reference (`f32::INFINITY` if there was none).
    pub distance: f32,
}

impl MatchResult {
    pub fn unmatched(distance: f32) -> Self {
        Self {
            matched: false,
            name: None,
            distance,
        }
    }

    /// Name to announce: the matched identity, or `unknown` otherwise.
    pub fn display_name<'a>(&'a self, unknown: &'a str) -> &'a str {
        match (&self.name, self.matched) {
            (Some(name), true) => name,
            _ => unknown,
        }
    }
}

/// Strategy for comparing a candidate signature against the registry.
pub trait Matcher {
    fn compare(&self, candidate: &FaceSignature, cache: &RegistryCache, threshold: f32) -> MatchResult;
}

/// Exhaustive nearest-neighbour matcher over Euclidean distance.
///
/// Every reference of every identity is visited. Ties on the minimum keep
/// the earliest reference in cache order.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, candidate: &FaceSignature, cache: &RegistryCache, threshold: f32) -> MatchResult {
        let mut best_distance = f32::INFINITY;
        let mut best_name: Option<&str> = None;

        for identity in cache.identities() {
            for reference in &identity.signatures {
                let distance = candidate.distance(reference);
                // NaN and infinity never win; strict `<` keeps the first of equals.
                if distance.is_finite() && distance < best_distance {
                    best_distance = distance;
                    best_name = Some(&identity.name);
                }
            }
        }

        match best_name {
            Some(name) if best_distance < threshold => MatchResult {
                matched: true,
                name: Some(name.to_string()),
                distance: best_distance,
            },
            _ => MatchResult::unmatched(best_distance),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(values: &[f32]) -> FaceSignature {
        FaceSignature::new(values.to_vec())
    }

    fn cache(entries: &[(&str, &[&[f32]])]) -> RegistryCache {
        let identities = entries
            .iter()
            .map(|(name, refs)| Identity {
                name: name.to_string(),
                signatures: refs.iter().map(|v| sig(v)).collect(),
            })
            .collect();
        RegistryCache::from_identities(identities).unwrap()
    }

    #[test]
    fn test_distance_identical() {
        let a = sig(&[0.1, 0.2, 0.3]);
        assert_eq!(a.distance(&a.clone()), 0.0);
    }

    #[test]
    fn test_distance_pythagorean() {
        let a = sig(&[0.0, 0.0]);
        let b = sig(&[3.0, 4.0]);
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_dimension_mismatch_is_infinite() {
        let a = sig(&[0.0, 0.0]);
        let b = sig(&[0.0, 0.0, 0.0]);
        assert_eq!(a.distance(&b), f32::INFINITY);
    }

    #[test]
    fn test_matcher_empty_registry_never_matches() {
        let empty = RegistryCache::default();
        let candidate = sig(&[0.0, 0.0]);
        for threshold in [0.0, 0.6, 10.0, f32::INFINITY] {
            let result = EuclideanMatcher.compare(&candidate, &empty, threshold);
            assert!(!result.matched);
            assert!(result.name.is_none());
        }
    }

    #[test]
    fn test_matcher_identity_without_signatures_never_matches() {
        let registry = cache(&[("Alice", &[])]);
        let result = EuclideanMatcher.compare(&sig(&[0.0]), &registry, 10.0);
        assert!(!result.matched);
        assert_eq!(result.distance, f32::INFINITY);
    }

    #[test]
    fn test_matcher_exact_candidate_matches_with_zero_distance() {
        let registry = cache(&[("Alice", &[&[0.5, 0.25, -0.1]]), ("Bob", &[&[0.9, 0.9, 0.9]])]);
        let result = EuclideanMatcher.compare(&sig(&[0.5, 0.25, -0.1]), &registry, 0.01);
        assert!(result.matched);
        assert_eq!(result.name.as_deref(), Some("Alice"));
        assert_eq!(result.distance, 0.0);
    }

    #[test]
    fn test_matcher_boundary_distance_is_unmatched() {
        let registry = cache(&[("Alice", &[&[0.0, 0.0]])]);
        let candidate = sig(&[0.6, 0.0]);
        let result = EuclideanMatcher.compare(&candidate, &registry, 0.6);
        assert_eq!(result.distance, 0.6);
        assert!(!result.matched);
        assert!(result.name.is_none());
    }

    #[test]
    fn test_matcher_picks_nearest_across_identities() {
        let registry = cache(&[
            ("Alice", &[&[1.0, 0.0], &[0.9, 0.1]]),
            ("Bob", &[&[0.0, 1.0], &[0.1, 0.2]]),
        ]);
        let result = EuclideanMatcher.compare(&sig(&[0.1, 0.25]), &registry, 0.6);
        assert!(result.matched);
        assert_eq!(result.name.as_deref(), Some("Bob"));
        assert!((result.distance - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_matcher_tie_prefers_first_identity() {
        let registry = cache(&[("First", &[&[1.0, 0.0]]), ("Second", &[&[-1.0, 0.0]])]);
        let result = EuclideanMatcher.compare(&sig(&[0.0, 0.0]), &registry, 2.0);
        assert!(result.matched);
        assert_eq!(result.name.as_deref(), Some("First"));
    }

    #[test]
    fn test_matcher_far_candidate_reports_distance_without_name() {
        let registry = cache(&[("Alice", &[&[0.0, 0.0]])]);
        let result = EuclideanMatcher.compare(&sig(&[3.0, 4.0]), &registry, 0.6);
        assert!(!result.matched);
        assert!(result.name.is_none());
        assert!((result.distance - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_matcher_skips_incomparable_references() {
        let registry = cache(&[("Alice", &[&[0.0, 0.0]])]);
        let result = EuclideanMatcher.compare(&sig(&[0.0, 0.0, 0.0]), &registry, 0.6);
        assert!(!result.matched);
        assert_eq!(result.distance, f32::INFINITY);
    }

    /// Two 512-d unit vectors with the given cosine similarity.
    fn unit_pair(cos: f32) -> (FaceSignature, FaceSignature) {
        let mut a = vec![0.0; 512];
        let mut b = vec![0.0; 512];
        a[0] = 1.0;
        b[0] = cos;
        b[1] = (1.0 - cos * cos).sqrt();
        (FaceSignature::new(a), FaceSignature::new(b))
    }

    #[test]
    fn test_default_threshold_is_arcface_cosine_cutoff() {
        let expected = unit_distance_for_cosine(ARCFACE_COSINE_THRESHOLD);
        assert!((DEFAULT_MATCH_THRESHOLD - expected).abs() < 1e-5);
        assert_eq!(unit_distance_for_cosine(1.0), 0.0);
        assert!((unit_distance_for_cosine(0.0) - 2.0f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_default_threshold_accepts_typical_genuine_arcface_pair() {
        for (cos, genuine) in [(0.8, true), (0.6, true), (0.45, true), (0.3, false), (0.0, false)] {
            let (reference, candidate) = unit_pair(cos);
            let registry = RegistryCache::from_identities(vec![Identity {
                name: "Alice".into(),
                signatures: vec![reference],
            }])
            .unwrap();
            let result = EuclideanMatcher.compare(&candidate, &registry, DEFAULT_MATCH_THRESHOLD);
            assert_eq!(result.matched, genuine, "cos {cos} gave distance {}", result.distance);
        }
    }

    #[test]
    fn test_display_name_falls_back_to_unknown() {
        let unmatched = MatchResult::unmatched(1.2);
        assert_eq!(unmatched.display_name(UNKNOWN_NAME), "Unknown");
        let matched = MatchResult {
            matched: true,
            name: Some("Alice".into()),
            distance: 0.1,
        };
        assert_eq!(matched.display_name(UNKNOWN_NAME), "Alice");
    }

    #[test]
    fn test_face_location_scaled() {
        let loc = FaceLocation { x: 10.0, y: 5.0, width: 20.0, height: 30.0, confidence: 0.9 };
        let big = loc.scaled(4.0);
        assert_eq!((big.x, big.y, big.width, big.height), (40.0, 20.0, 80.0, 120.0));
        assert_eq!(big.confidence, 0.9);
    }
}
