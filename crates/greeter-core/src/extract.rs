//! Face-signature extraction and the per-frame identification step.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::registry::RegistryCache;
use crate::types::{FaceLocation, FaceSignature, MatchResult, Matcher};
use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("extractor returned {signatures} signatures for {faces} faces")]
    CountMismatch { faces: usize, signatures: usize },
}

/// Turns an image into face locations and one signature per location.
pub trait FaceExtractor {
    /// Locate faces, in the extractor's own preferred order.
    fn locate_faces(&mut self, image: &RgbImage) -> Result<Vec<FaceLocation>, ExtractError>;

    /// Encode one signature per location, preserving order.
    fn encode_faces(
        &mut self,
        image: &RgbImage,
        faces: &[FaceLocation],
    ) -> Result<Vec<FaceSignature>, ExtractError>;
}

/// SCRFD detection + ArcFace encoding.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    /// Load both models; fails fast if either file is missing.
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, ExtractError> {
        let detector = FaceDetector::load(scrfd_path)?;
        let recognizer = FaceRecognizer::load(arcface_path)?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceExtractor for OnnxExtractor {
    fn locate_faces(&mut self, image: &RgbImage) -> Result<Vec<FaceLocation>, ExtractError> {
        Ok(self.detector.detect(image)?)
    }

    fn encode_faces(
        &mut self,
        image: &RgbImage,
        faces: &[FaceLocation],
    ) -> Result<Vec<FaceSignature>, ExtractError> {
        faces
            .iter()
            .map(|face| self.recognizer.extract(image, face).map_err(ExtractError::from))
            .collect()
    }
}

/// The face that decided an identification, with its match result.
#[derive(Debug, Clone)]
pub struct Identification {
    /// Location in full-frame coordinates.
    pub location: FaceLocation,
    /// Faces found in the frame, including the deciding one.
    pub faces_found: usize,
    pub result: MatchResult,
}

/// Extraction + matching for one frame.
///
/// Frames are shrunk by `downscale` before extraction to bound per-tick cost.
pub struct Identifier<E, M> {
    extractor: E,
    matcher: M,
    threshold: f32,
    downscale: u32,
}

impl<E: FaceExtractor, M: Matcher> Identifier<E, M> {
    pub fn new(extractor: E, matcher: M, threshold: f32) -> Self {
        Self {
            extractor,
            matcher,
            threshold,
            downscale: 1,
        }
    }

    /// Shrink frames by `factor` (clamped to at least 1) before extraction.
    pub fn with_downscale(mut self, factor: u32) -> Self {
        self.downscale = factor.max(1);
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Identify the first face in `frame`.
    ///
    /// Faces are evaluated in the extractor's order and the first one to
    /// produce a match result decides, matched or not. Returns `None` when
    /// the frame holds no face.
    pub fn identify_first(
        &mut self,
        frame: &RgbImage,
        cache: &RegistryCache,
    ) -> Result<Option<Identification>, ExtractError> {
        let small;
        let image = if self.downscale > 1 {
            small = shrink(frame, self.downscale);
            &small
        } else {
            frame
        };

        let faces = self.extractor.locate_faces(image)?;
        if faces.is_empty() {
            return Ok(None);
        }

        let signatures = self.extractor.encode_faces(image, &faces)?;
        if signatures.len() != faces.len() {
            return Err(ExtractError::CountMismatch {
                faces: faces.len(),
                signatures: signatures.len(),
            });
        }

        let faces_found = faces.len();
        let Some((location, signature)) = faces.into_iter().zip(signatures).next() else {
            return Ok(None);
        };
        let result = self.matcher.compare(&signature, cache, self.threshold);

        Ok(Some(Identification {
            location: location.scaled(self.downscale as f32),
            faces_found,
            result,
        }))
    }
}

/// Resize `frame` down by an integer `factor`, never below 1x1.
fn shrink(frame: &RgbImage, factor: u32) -> RgbImage {
    let width = (frame.width() / factor).max(1);
    let height = (frame.height() / factor).max(1);
    imageops::resize(frame, width, height, FilterType::Triangle)
}
