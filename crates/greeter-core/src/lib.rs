//! greeter-core - Face signatures, identity registry and matching.
//!
//! Face location and encoding run through ONNX Runtime (SCRFD + ArcFace)
//! behind the [`FaceExtractor`] trait; matching is exhaustive Euclidean
//! nearest-neighbour over an immutable [`RegistryCache`] snapshot.

pub mod detector;
pub mod extract;
pub mod recognizer;
pub mod registry;
pub mod types;

pub use extract::{ExtractError, FaceExtractor, Identification, Identifier, OnnxExtractor};
pub use registry::{
    open_registry, IdentityRegistry, JsonFileRegistry, RegistryCache, RegistryError, SqliteRegistry,
};
pub use types::{
    unit_distance_for_cosine, EuclideanMatcher, FaceLocation, FaceSignature, Identity, MatchResult,
    Matcher, ARCFACE_COSINE_THRESHOLD, DEFAULT_MATCH_THRESHOLD, UNKNOWN_NAME,
};
