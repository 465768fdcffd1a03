//! Test doubles for the station pipeline.

use crate::dispatch::{Notifier, NotifyError};
use crate::sampler::FrameSource;
use greeter_core::{
    ExtractError, FaceExtractor, FaceLocation, FaceSignature, MatchResult, Matcher, RegistryCache,
};
use greeter_hw::{CameraError, Frame};
use image::{Rgb, RgbImage};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

/// Shared call counter readable from the test thread.
pub type Counter = Arc<AtomicUsize>;

pub fn count(counter: &Counter) -> usize {
    counter.load(Ordering::SeqCst)
}

fn bump(counter: &Counter) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// Spin until `cond` holds, failing the test after a few seconds.
fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting on worker");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// A small frame whose top-left red value selects a scripted face (0 = none).
pub fn frame(sequence: u32, face: u8) -> Frame {
    Frame {
        image: RgbImage::from_pixel(4, 4, Rgb([face, 0, 0])),
        timestamp: std::time::Instant::now(),
        sequence,
    }
}

/// Replays a fixed list of capture results, then reports `NoFrameYet`.
pub struct ScriptedSource {
    script: VecDeque<Result<Frame, CameraError>>,
}

impl ScriptedSource {
    pub fn new(script: Vec<Result<Frame, CameraError>>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl FrameSource for ScriptedSource {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        self.script.pop_front().unwrap_or(Err(CameraError::NoFrameYet))
    }
}

/// Maps the frame's face marker to a signature; one face per marked frame.
pub struct MarkerExtractor {
    signatures: HashMap<u8, FaceSignature>,
    pub locate_calls: Counter,
}

impl MarkerExtractor {
    pub fn new(signatures: &[(u8, Vec<f32>)]) -> Self {
        Self {
            signatures: signatures
                .iter()
                .map(|(marker, values)| (*marker, FaceSignature::new(values.clone())))
                .collect(),
            locate_calls: Counter::default(),
        }
    }

    fn marker(image: &RgbImage) -> u8 {
        image.get_pixel(0, 0)[0]
    }
}

impl FaceExtractor for MarkerExtractor {
    fn locate_faces(&mut self, image: &RgbImage) -> Result<Vec<FaceLocation>, ExtractError> {
        bump(&self.locate_calls);
        if Self::marker(image) == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![FaceLocation {
            x: 0.0,
            y: 0.0,
            width: 4.0,
            height: 4.0,
            confidence: 0.99,
        }])
    }

    fn encode_faces(
        &mut self,
        image: &RgbImage,
        faces: &[FaceLocation],
    ) -> Result<Vec<FaceSignature>, ExtractError> {
        let signature = self
            .signatures
            .get(&Self::marker(image))
            .cloned()
            .unwrap_or_else(|| FaceSignature::new(vec![100.0, 100.0]));
        Ok(faces.iter().map(|_| signature.clone()).collect())
    }
}

/// Wraps a matcher and counts invocations.
pub struct CountingMatcher<M> {
    inner: M,
    pub calls: Counter,
}

impl<M> CountingMatcher<M> {
    pub fn new(inner: M) -> Self {
        Self {
            inner,
            calls: Counter::default(),
        }
    }
}

impl<M: Matcher> Matcher for CountingMatcher<M> {
    fn compare(&self, candidate: &FaceSignature, cache: &RegistryCache, threshold: f32) -> MatchResult {
        bump(&self.calls);
        self.inner.compare(candidate, cache, threshold)
    }
}

/// Records every announced name.
pub struct RecordingNotifier {
    seen: Arc<Mutex<Vec<String>>>,
}

impl RecordingNotifier {
    pub fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (Self { seen: seen.clone() }, seen)
    }
}

impl Notifier for RecordingNotifier {
    fn announce(&mut self, name: &str) -> Result<(), NotifyError> {
        self.seen.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

/// Extractor that finds no faces and blocks in `locate_faces` until released.
pub struct GatedExtractor {
    started: Counter,
    release: std_mpsc::Receiver<()>,
}

/// Test-side handle of a [`GatedExtractor`].
pub struct ExtractorGate {
    started: Counter,
    release: std_mpsc::Sender<()>,
}

impl GatedExtractor {
    pub fn new() -> (Self, ExtractorGate) {
        let started = Counter::default();
        let (release_tx, release_rx) = std_mpsc::channel();
        (
            Self {
                started: started.clone(),
                release: release_rx,
            },
            ExtractorGate {
                started,
                release: release_tx,
            },
        )
    }
}

impl FaceExtractor for GatedExtractor {
    fn locate_faces(&mut self, _image: &RgbImage) -> Result<Vec<FaceLocation>, ExtractError> {
        bump(&self.started);
        let _ = self.release.recv();
        Ok(Vec::new())
    }

    fn encode_faces(
        &mut self,
        _image: &RgbImage,
        _faces: &[FaceLocation],
    ) -> Result<Vec<FaceSignature>, ExtractError> {
        Ok(Vec::new())
    }
}

impl ExtractorGate {
    /// Frames the extractor has started on.
    pub fn started(&self) -> usize {
        count(&self.started)
    }

    pub fn wait_started(&self) {
        wait_for(|| self.started() > 0);
    }

    pub fn release(&self, frames: usize) {
        for _ in 0..frames {
            let _ = self.release.send(());
        }
    }
}

/// Notifier that reports each name, then blocks until released.
pub struct GatedNotifier {
    started: std_mpsc::Sender<String>,
    release: std_mpsc::Receiver<()>,
}

impl GatedNotifier {
    /// Returns the notifier, the receiver of started names and the release sender.
    pub fn new() -> (Self, std_mpsc::Receiver<String>, std_mpsc::Sender<()>) {
        let (started_tx, started_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        (
            Self {
                started: started_tx,
                release: release_rx,
            },
            started_rx,
            release_tx,
        )
    }
}

impl Notifier for GatedNotifier {
    fn announce(&mut self, name: &str) -> Result<(), NotifyError> {
        let _ = self.started.send(name.to_string());
        let _ = self.release.recv();
        Ok(())
    }
}
