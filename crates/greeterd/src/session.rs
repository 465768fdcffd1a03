//! Verification session state machine.
//!
//! `Idle -> Running -> {Resolved, Cancelled}`; a resolved or cancelled
//! session counts as idle again and may be restarted. While running, the
//! session owns its periodic check, the registry snapshot it started with
//! and at most one frame in flight on the identification worker.

use crate::dispatch::NotificationDispatcher;
use crate::identify::{IdentificationWorker, JobStatus, PendingIdentification};
use greeter_core::{Identification, MatchResult, RegistryCache};
use image::RgbImage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Resolved,
    Cancelled,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Resolved => "resolved",
            SessionState::Cancelled => "cancelled",
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("verification session already running")]
    AlreadyRunning,
}

/// The periodic check of a running session.
struct CheckSchedule {
    started: Instant,
    ticks: u64,
    /// Frames are submitted on every other tick, starting with the first.
    process_next: bool,
    cache: Arc<RegistryCache>,
    in_flight: Option<PendingIdentification>,
}

/// How a session resolved.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Announced name: the identity, or the unknown sentinel.
    pub name: String,
    pub result: MatchResult,
    /// Scheduler tick (1-based) on which the session resolved.
    pub tick: u64,
    /// Whether the dispatcher accepted the notification.
    pub notified: bool,
}

#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// No session is running; nothing happened.
    Inactive,
    /// Off-beat tick, skipped to bound CPU cost.
    Skipped,
    /// No frame buffered.
    NoFrame,
    /// Frame handed to the identification worker.
    Submitted,
    /// The worker is still busy; nothing submitted.
    Pending,
    /// A processed frame held no face.
    NoFace,
    /// Extraction failed on a frame; the session keeps running.
    ExtractFailed,
    Resolved(Resolution),
}

pub struct VerificationSession {
    state: SessionState,
    schedule: Option<CheckSchedule>,
    check_interval: Duration,
    unknown_name: String,
}

impl VerificationSession {
    pub fn new(check_interval: Duration, unknown_name: impl Into<String>) -> Self {
        Self {
            state: SessionState::Idle,
            schedule: None,
            check_interval,
            unknown_name: unknown_name.into(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.schedule.is_some()
    }

    /// Time since the running session started.
    pub fn elapsed(&self) -> Option<Duration> {
        self.schedule.as_ref().map(|s| s.started.elapsed())
    }

    /// Start verifying against `cache`. Rejected without any state change
    /// while a session is already running.
    pub fn start(&mut self, cache: Arc<RegistryCache>) -> Result<(), SessionError> {
        if self.is_running() {
            return Err(SessionError::AlreadyRunning);
        }

        tracing::info!(
            identities = cache.len(),
            interval_ms = self.check_interval.as_millis() as u64,
            "verification session started"
        );
        self.schedule = Some(CheckSchedule {
            started: Instant::now(),
            ticks: 0,
            process_next: true,
            cache,
            in_flight: None,
        });
        self.state = SessionState::Running;
        Ok(())
    }

    /// Stop a running session without notifying anyone. A frame still on
    /// the worker is abandoned.
    ///
    /// Returns `false` (and does nothing) if no session was running.
    pub fn cancel(&mut self) -> bool {
        let Some(schedule) = self.schedule.take() else {
            return false;
        };
        tracing::info!(ticks = schedule.ticks, "verification session cancelled");
        self.state = SessionState::Cancelled;
        true
    }

    /// One periodic check.
    ///
    /// Collects the result of the frame in flight, if it is ready, then on
    /// every other tick submits the current frame. The first result with a
    /// face decides: the check is cancelled, the session resolves, and the
    /// resolved name is handed to `dispatcher` exactly once.
    pub fn tick(
        &mut self,
        frame: Option<&RgbImage>,
        worker: &IdentificationWorker,
        dispatcher: &NotificationDispatcher,
    ) -> TickOutcome {
        let Some(schedule) = self.schedule.as_mut() else {
            return TickOutcome::Inactive;
        };

        schedule.ticks += 1;
        let tick = schedule.ticks;
        let process = schedule.process_next;
        schedule.process_next = !process;

        let mut collected = None;
        if let Some(pending) = schedule.in_flight.as_mut() {
            let status = pending.poll();
            if matches!(status, JobStatus::Running) {
                return TickOutcome::Pending;
            }
            schedule.in_flight = None;
            match status {
                JobStatus::Done(Ok(Some(identification))) => {
                    return self.resolve(identification, tick, dispatcher);
                }
                JobStatus::Done(Ok(None)) => {
                    tracing::debug!(tick, "no face in frame");
                    collected = Some(TickOutcome::NoFace);
                }
                JobStatus::Done(Err(e)) => {
                    tracing::warn!(tick, error = %e, "face extraction failed; retrying");
                    collected = Some(TickOutcome::ExtractFailed);
                }
                JobStatus::Lost | JobStatus::Running => {
                    tracing::warn!(tick, "frame lost by identification worker; retrying");
                    collected = Some(TickOutcome::ExtractFailed);
                }
            }
        }

        if !process {
            return collected.unwrap_or(TickOutcome::Skipped);
        }
        let Some(frame) = frame else {
            tracing::trace!(tick, "no frame buffered");
            return collected.unwrap_or(TickOutcome::NoFrame);
        };

        match worker.submit(frame, schedule.cache.clone()) {
            Some(pending) => {
                schedule.in_flight = Some(pending);
                TickOutcome::Submitted
            }
            None => collected.unwrap_or(TickOutcome::Pending),
        }
    }

    fn resolve(
        &mut self,
        identification: Identification,
        tick: u64,
        dispatcher: &NotificationDispatcher,
    ) -> TickOutcome {
        self.schedule = None;
        self.state = SessionState::Resolved;

        let result = identification.result;
        let name = result.display_name(&self.unknown_name).to_string();
        let notified = dispatcher.submit(&name);

        tracing::info!(
            name = %name,
            matched = result.matched,
            distance = result.distance,
            faces = identification.faces_found,
            tick,
            "verification session resolved"
        );
        if !notified {
            tracing::warn!(name = %name, "verification resolved but greeting was not delivered");
        }

        TickOutcome::Resolved(Resolution {
            name,
            result,
            tick,
            notified,
        })
    }
}
