//! The kiosk station: one sampler, one session, one dispatcher.
//!
//! Everything here runs on the scheduler thread; face extraction runs on the
//! identification worker and greetings on the notification worker. The
//! capture timer calls
//! [`Station::on_capture_tick`], the check timer calls
//! [`Station::on_check_tick`] while a session runs, and operator commands
//! arrive through [`Station::verify`], [`Station::cancel`] and
//! [`Station::reload`].

use crate::dispatch::NotificationDispatcher;
use crate::identify::IdentificationWorker;
use crate::sampler::{CameraState, FrameSampler, FrameSource};
use crate::session::{SessionError, TickOutcome, VerificationSession};
use greeter_core::{IdentityRegistry, RegistryCache, RegistryError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StationError {
    #[error("no camera available")]
    NoCamera,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub struct Station<S> {
    sampler: FrameSampler<S>,
    session: VerificationSession,
    worker: IdentificationWorker,
    registry: Box<dyn IdentityRegistry>,
    cache: Arc<RegistryCache>,
    dispatcher: NotificationDispatcher,
    max_session: Option<Duration>,
}

impl<S: FrameSource> Station<S> {
    /// Assemble a station. `cache` must already be loaded from `registry`.
    pub fn new(
        sampler: FrameSampler<S>,
        session: VerificationSession,
        worker: IdentificationWorker,
        registry: Box<dyn IdentityRegistry>,
        cache: RegistryCache,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        Self {
            sampler,
            session,
            worker,
            registry,
            cache: Arc::new(cache),
            dispatcher,
            max_session: None,
        }
    }

    /// Cancel sessions that run longer than `limit` without resolving.
    pub fn with_max_session(mut self, limit: Option<Duration>) -> Self {
        self.max_session = limit;
        self
    }

    pub fn session_running(&self) -> bool {
        self.session.is_running()
    }

    pub fn camera_state(&self) -> CameraState {
        self.sampler.camera_state()
    }

    /// Capture timer: refresh the buffered frame.
    pub fn on_capture_tick(&mut self) {
        self.sampler.capture();
    }

    /// Check timer: advance the running session, if any.
    pub fn on_check_tick(&mut self) -> TickOutcome {
        if let (Some(limit), Some(elapsed)) = (self.max_session, self.session.elapsed()) {
            if elapsed >= limit {
                tracing::info!(limit_secs = limit.as_secs(), "verification session timed out");
                self.session.cancel();
                return TickOutcome::Inactive;
            }
        }

        let frame = self.sampler.current_frame().map(|f| &f.image);
        self.session.tick(frame, &self.worker, &self.dispatcher)
    }

    /// The "verify" trigger.
    pub fn verify(&mut self) -> Result<(), StationError> {
        if self.sampler.camera_state() == CameraState::Unavailable {
            return Err(StationError::NoCamera);
        }
        self.session.start(self.cache.clone())?;
        Ok(())
    }

    pub fn cancel(&mut self) -> bool {
        self.session.cancel()
    }

    /// Replace the registry snapshot. A running session keeps the snapshot
    /// it started with. On failure the current snapshot stays in place.
    pub fn reload(&mut self) -> Result<usize, StationError> {
        let cache = RegistryCache::load(self.registry.as_ref())?;
        let count = cache.len();
        self.cache = Arc::new(cache);
        Ok(count)
    }

    /// Operator-facing status document.
    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.sampler.camera_state().as_str(),
            "session": self.session.state().as_str(),
            "identities": self.cache.len(),
            "signatures": self.cache.signature_count(),
            "threshold": self.worker.threshold(),
            "notifications": self.dispatcher.submitted(),
        })
    }

    /// Stop verifying, then stop both workers. Queued greetings are still spoken.
    pub fn shutdown(mut self) {
        self.session.cancel();
        self.worker.shutdown();
        self.dispatcher.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::testing::{
        count, frame, Counter, CountingMatcher, MarkerExtractor, RecordingNotifier, ScriptedSource,
    };
    use greeter_core::{EuclideanMatcher, FaceSignature, Identifier, JsonFileRegistry};
    use greeter_hw::{CameraError, Frame};
    use std::sync::Mutex;

    const FACE: u8 = 1;

    type TestStation = Station<ScriptedSource>;

    struct Harness {
        station: TestStation,
        seen: Arc<Mutex<Vec<String>>>,
        matcher_calls: Counter,
        locate_calls: Counter,
        _dir: tempfile::TempDir,
    }

    /// Registry `{"Alice": [v1]}` with v1 = [0, 0]; `candidate` is what a marked frame encodes to.
    fn harness(frames: Vec<Result<Frame, CameraError>>, candidate: Vec<f32>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileRegistry::new(dir.path().join("identities.json"));
        store.add_signature("Alice", &FaceSignature::new(vec![0.0, 0.0])).unwrap();
        let cache = RegistryCache::load(&store).unwrap();

        let extractor = MarkerExtractor::new(&[(FACE, candidate)]);
        let locate_calls = extractor.locate_calls.clone();
        let matcher = CountingMatcher::new(EuclideanMatcher);
        let matcher_calls = matcher.calls.clone();

        let identifier = Identifier::new(extractor, matcher, 0.6);
        let worker = IdentificationWorker::spawn(identifier, Duration::from_millis(33)).unwrap();

        let (notifier, seen) = RecordingNotifier::new();
        let station = Station::new(
            FrameSampler::new(ScriptedSource::new(frames)),
            VerificationSession::new(Duration::from_millis(33), "Unknown"),
            worker,
            Box::new(store),
            cache,
            NotificationDispatcher::spawn(Box::new(notifier)).unwrap(),
        );

        Harness {
            station,
            seen,
            matcher_calls,
            locate_calls,
            _dir: dir,
        }
    }

    /// One capture followed by one check, like the two timers interleaving.
    /// The worker is allowed to finish before the next step, so a submitted
    /// frame's result is collected on the following tick.
    fn step(station: &mut TestStation) -> TickOutcome {
        station.on_capture_tick();
        let outcome = station.on_check_tick();
        station.worker.wait_idle();
        outcome
    }

    /// Ten face-less frames, then frames with a face.
    fn stream_with_face_at_11() -> Vec<Result<Frame, CameraError>> {
        (1..=14)
            .map(|seq| Ok(frame(seq, if seq >= 11 { FACE } else { 0 })))
            .collect()
    }

    #[test]
    fn test_end_to_end_known_face() {
        let mut h = harness(stream_with_face_at_11(), vec![0.1, 0.2]);
        h.station.verify().unwrap();

        let mut resolved_at = None;
        for wall_tick in 1..=14u64 {
            if let TickOutcome::Resolved(resolution) = step(&mut h.station) {
                assert_eq!(resolution.name, "Alice");
                assert!(resolution.result.matched);
                assert_eq!(resolution.tick, wall_tick);
                resolved_at = Some(wall_tick);
            }
        }

        // Frames go out on ticks 1, 3, 5, 7, 9, 11; the sixth holds the face
        // and its result is collected on tick 12.
        assert_eq!(resolved_at, Some(12));
        assert_eq!(count(&h.locate_calls), 6);
        assert_eq!(count(&h.matcher_calls), 1);
        assert_eq!(h.station.session.state(), SessionState::Resolved);

        h.station.shutdown();
        assert_eq!(*h.seen.lock().unwrap(), vec!["Alice".to_string()]);
    }

    #[test]
    fn test_end_to_end_unknown_face() {
        let frames = (1..=4).map(|seq| Ok(frame(seq, FACE))).collect();
        let mut h = harness(frames, vec![3.0, 4.0]);
        h.station.verify().unwrap();

        assert!(matches!(step(&mut h.station), TickOutcome::Submitted));
        let outcome = step(&mut h.station);
        let TickOutcome::Resolved(resolution) = outcome else {
            panic!("expected resolution, got {outcome:?}");
        };
        assert_eq!(resolution.name, "Unknown");
        assert!(!resolution.result.matched);
        assert!(resolution.result.distance > 0.6);
        assert_eq!(h.station.session.state(), SessionState::Resolved);

        for _ in 0..2 {
            assert!(matches!(step(&mut h.station), TickOutcome::Inactive));
        }

        h.station.shutdown();
        assert_eq!(*h.seen.lock().unwrap(), vec!["Unknown".to_string()]);
    }

    #[test]
    fn test_verify_while_running_rejected() {
        let mut h = harness(Vec::new(), vec![0.0, 0.0]);
        h.station.verify().unwrap();
        assert!(matches!(
            h.station.verify(),
            Err(StationError::Session(SessionError::AlreadyRunning))
        ));
        assert!(h.station.session_running());
    }

    #[test]
    fn test_verify_without_camera_rejected() {
        let mut h = harness(
            vec![Err(CameraError::DeviceUnavailable("gone".into()))],
            vec![0.0, 0.0],
        );
        h.station.on_capture_tick();
        assert_eq!(h.station.camera_state(), CameraState::Unavailable);
        assert!(matches!(h.station.verify(), Err(StationError::NoCamera)));
        assert!(!h.station.session_running());
    }

    #[test]
    fn test_idle_station_does_no_work() {
        let frames = (1..=5).map(|seq| Ok(frame(seq, FACE))).collect();
        let mut h = harness(frames, vec![0.0, 0.0]);
        for _ in 0..5 {
            assert!(matches!(step(&mut h.station), TickOutcome::Inactive));
        }
        assert_eq!(count(&h.locate_calls), 0);
        assert_eq!(h.station.dispatcher.submitted(), 0);
    }

    #[test]
    fn test_cancel_then_faces_never_notify() {
        let frames = (1..=8).map(|seq| Ok(frame(seq, if seq > 2 { FACE } else { 0 }))).collect();
        let mut h = harness(frames, vec![0.0, 0.0]);
        h.station.verify().unwrap();
        step(&mut h.station);
        assert!(h.station.cancel());
        for _ in 0..6 {
            assert!(matches!(step(&mut h.station), TickOutcome::Inactive));
        }

        h.station.shutdown();
        assert!(h.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_max_session_duration_cancels() {
        let mut h = harness(Vec::new(), vec![0.0, 0.0]);
        h.station = h.station.with_max_session(Some(Duration::ZERO));
        h.station.verify().unwrap();
        assert!(matches!(h.station.on_check_tick(), TickOutcome::Inactive));
        assert_eq!(h.station.session.state(), SessionState::Cancelled);
        assert_eq!(h.station.dispatcher.submitted(), 0);
    }

    #[test]
    fn test_reload_applies_to_next_session() {
        let frames = (1..=4).map(|seq| Ok(frame(seq, FACE))).collect();
        let mut h = harness(frames, vec![5.0, 5.0]);

        h.station.verify().unwrap();
        // Enroll the candidate while the session runs; the running session must not see it.
        let store = JsonFileRegistry::new(h._dir.path().join("identities.json"));
        store.add_signature("Bob", &FaceSignature::new(vec![5.0, 5.0])).unwrap();
        assert_eq!(h.station.reload().unwrap(), 2);

        step(&mut h.station);
        let TickOutcome::Resolved(first) = step(&mut h.station) else {
            panic!("expected resolution");
        };
        assert_eq!(first.name, "Unknown");

        h.station.verify().unwrap();
        step(&mut h.station);
        let TickOutcome::Resolved(second) = step(&mut h.station) else {
            panic!("expected resolution");
        };
        assert_eq!(second.name, "Bob");
    }

    #[test]
    fn test_failed_reload_keeps_snapshot() {
        let mut h = harness(Vec::new(), vec![0.0, 0.0]);
        std::fs::write(h._dir.path().join("identities.json"), "{ not json").unwrap();
        assert!(matches!(
            h.station.reload(),
            Err(StationError::Registry(RegistryError::MalformedRecord { .. }))
        ));
        assert_eq!(h.station.status()["identities"], 1);
    }

    #[test]
    fn test_stale_frame_is_not_verified() {
        let mut old = frame(1, FACE);
        old.timestamp = std::time::Instant::now() - Duration::from_secs(5);
        let mut h = harness(Vec::new(), vec![0.0, 0.0]);
        h.station.sampler = FrameSampler::new(ScriptedSource::new(vec![Ok(old)]))
            .with_max_age(Some(Duration::from_secs(1)));
        h.station.verify().unwrap();
        assert!(matches!(step(&mut h.station), TickOutcome::NoFrame));
        assert_eq!(count(&h.locate_calls), 0);
    }

    #[test]
    fn test_status_document() {
        let h = harness(Vec::new(), vec![0.0, 0.0]);
        let status = h.station.status();
        assert_eq!(status["camera"], "streaming");
        assert_eq!(status["session"], "idle");
        assert_eq!(status["identities"], 1);
        assert_eq!(status["notifications"], 0);
    }
}
