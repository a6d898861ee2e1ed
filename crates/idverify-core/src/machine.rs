//! The verification session state machine.
//!
//! One reference subject is compared against one live face per session:
//!
//! ```text
//! AwaitingReference -> ReferencePending -> Armed -> Comparing -> ResultShown
//!        ^                    |              |                        |
//!        +--------------------+--------------+------------------------+
//!          no face / error        read timeout          restart delay
//! ```
//!
//! The machine is not thread-safe. Every input (frames, engine
//! completions, timer firings, references) must be delivered from a single
//! task. The [`orchestrator`](crate::orchestrator) provides that task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::capture::CaptureError;
use crate::config::VerifyConfig;
use crate::engine::{FaceEngine, FeatureResponse};
use crate::geometry::{CaptureGeometry, Size};
use crate::overlay::map_to_view;
use crate::presentation::{Cue, PresentationSink, Prompt, Verdict};
use crate::reference::ReferenceSubject;
use crate::timers::{Scheduler, TimerKind};
use crate::tracker::RequestTracker;
use crate::types::{Feature, Image, Rect, RequestTag, Subject, TrackId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    AwaitingReference,
    /// Reference submitted, its feature extraction in flight.
    ReferencePending,
    /// Reference feature ready, waiting for a live match.
    Armed,
    Comparing,
    ResultShown,
}

/// Timing and threshold parameters of the machine.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineSettings {
    pub similarity_threshold: f32,
    pub read_timeout: Duration,
    pub restart_delay: Duration,
    pub prompt_interval: Duration,
    /// Longest wait for the reference feature before the session is dropped.
    pub reference_timeout: Duration,
    /// Preview view size; overlay rectangles are mapped into it when known.
    pub view: Option<Size>,
}

impl MachineSettings {
    pub fn from_config(config: &VerifyConfig) -> Self {
        Self {
            similarity_threshold: config.similarity_threshold,
            read_timeout: config.read_timeout(),
            restart_delay: config.restart_delay(),
            prompt_interval: config.prompt_interval(),
            reference_timeout: config.request_timeout().unwrap_or(config.read_timeout()),
            view: config.capture.view_size(),
        }
    }
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self::from_config(&VerifyConfig::default())
    }
}

struct LiveObservation {
    track_id: TrackId,
    rect: Rect,
    feature: Option<Feature>,
}

struct VerificationSession {
    /// Correlates log lines of one session.
    id: Uuid,
    /// Carried in request tags to discard late results.
    seq: u64,
    subject: ReferenceSubject,
    reference_feature: Option<Feature>,
    live: Option<LiveObservation>,
    /// Every live feature extracted this session, by track.
    live_features: HashMap<TrackId, Feature>,
}

pub struct VerificationMachine<E, P, S> {
    engine: E,
    sink: P,
    scheduler: S,
    tracker: Arc<RequestTracker>,
    settings: MachineSettings,
    state: MachineState,
    session: Option<VerificationSession>,
    next_seq: u64,
    engine_ready: bool,
    geometry: Option<CaptureGeometry>,
    overlay_visible: bool,
    /// Open while a new reference is welcome. Shared with the card reader.
    reference_gate: Arc<AtomicBool>,
}

impl<E, P, S> VerificationMachine<E, P, S>
where
    E: FaceEngine,
    P: PresentationSink,
    S: Scheduler,
{
    pub fn new(
        engine: E,
        sink: P,
        scheduler: S,
        tracker: Arc<RequestTracker>,
        settings: MachineSettings,
    ) -> Self {
        Self {
            engine,
            sink,
            scheduler,
            tracker,
            settings,
            state: MachineState::AwaitingReference,
            session: None,
            next_seq: 1,
            engine_ready: false,
            geometry: None,
            overlay_visible: false,
            reference_gate: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }

    pub fn reference_gate(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reference_gate)
    }

    pub fn accepting_reference(&self) -> bool {
        self.reference_gate.load(Ordering::SeqCst)
    }

    pub fn has_reference_feature(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.reference_feature.is_some())
    }

    /// Tracking identity and rectangle of the current live face.
    pub fn live_face(&self) -> Option<(TrackId, Rect)> {
        let live = self.session.as_ref()?.live.as_ref()?;
        Some((live.track_id, live.rect))
    }

    pub fn geometry(&self) -> Option<&CaptureGeometry> {
        self.geometry.as_ref()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn sink(&self) -> &P {
        &self.sink
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    /// Engine activation finished. Only a ready engine accepts references.
    pub fn set_engine_ready(&mut self, ready: bool) {
        self.engine_ready = ready;
        if ready {
            tracing::info!("engine ready");
            if self.state == MachineState::AwaitingReference {
                self.enter_idle();
            }
        } else {
            tracing::error!("engine unavailable, verification disabled");
            self.reference_gate.store(false, Ordering::SeqCst);
        }
    }

    /// Start a session for `subject`. Replaces any session in progress.
    pub fn submit_reference(&mut self, subject: ReferenceSubject) {
        if !self.engine_ready {
            tracing::warn!(name = %subject.display_name, "reference ignored: engine not ready");
            return;
        }
        if let Some(old) = self.session.take() {
            tracing::info!(session = %old.id, "session replaced by new reference");
        }
        self.scheduler.cancel(TimerKind::ReadTimeout);
        self.scheduler.cancel(TimerKind::Restart);
        self.scheduler.cancel(TimerKind::Prompt);
        self.scheduler.cancel(TimerKind::ReferencePending);
        self.tracker.clear_all();
        self.reference_gate.store(false, Ordering::SeqCst);

        let seq = self.next_seq;
        self.next_seq += 1;
        let id = Uuid::new_v4();
        tracing::info!(session = %id, name = %subject.display_name, "reference submitted");

        let face = match self.engine.detect_faces(&subject.image) {
            Ok(faces) => faces.into_iter().next(),
            Err(e) => {
                tracing::warn!(session = %id, error = %e, "reference face detection failed");
                None
            }
        };
        let Some(face) = face else {
            tracing::warn!(session = %id, "no face in reference image");
            self.tracker.mark_failed(Subject::Reference);
            self.enter_idle();
            return;
        };

        let image = subject.image.clone();
        self.session = Some(VerificationSession {
            id,
            seq,
            subject,
            reference_feature: None,
            live: None,
            live_features: HashMap::new(),
        });
        self.state = MachineState::ReferencePending;
        self.tracker.mark_searching(Subject::Reference);
        self.scheduler
            .schedule(TimerKind::ReferencePending, self.settings.reference_timeout);
        self.engine
            .request_feature(image, face, RequestTag::reference(seq));
    }

    /// Process one live frame: update the overlay and request extraction
    /// for the most prominent face when the session needs it.
    pub fn on_frame(&mut self, image: Image) {
        if !self.engine_ready {
            return;
        }
        if !image.is_complete() {
            tracing::debug!(?image, "skipping incomplete frame");
            return;
        }

        let face = match self.engine.detect_faces(&image) {
            Ok(faces) => faces.into_iter().next(),
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed, frame skipped");
                return;
            }
        };

        let Some(face) = face else {
            self.clear_overlay();
            return;
        };
        let rect = match (self.geometry.as_ref(), self.settings.view) {
            (Some(geometry), Some(view)) => map_to_view(face.rect, geometry, view),
            _ => face.rect,
        };
        self.sink.update_overlay(Some(rect));
        self.overlay_visible = true;

        if !matches!(
            self.state,
            MachineState::ReferencePending | MachineState::Armed
        ) {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let returning = match session.live.as_mut() {
            Some(live) if live.track_id == face.track_id => {
                live.rect = face.rect;
                if live.feature.is_some() {
                    return;
                }
                false
            }
            _ => {
                // A face seen earlier in the session keeps its feature.
                let feature = session.live_features.get(&face.track_id).cloned();
                let returning = feature.is_some();
                tracing::debug!(session = %session.id, track_id = face.track_id, returning, "new live face");
                session.live = Some(LiveObservation {
                    track_id: face.track_id,
                    rect: face.rect,
                    feature,
                });
                returning
            }
        };
        let (session_id, seq) = (session.id, session.seq);

        if returning {
            self.try_compare();
        } else if self.tracker.try_begin(Subject::Live(face.track_id)) {
            tracing::debug!(session = %session_id, track_id = face.track_id, "requesting live feature");
            let tag = RequestTag::live(seq, face.track_id);
            self.engine.request_feature(image, face, tag);
        }
    }

    /// Route an extraction completion.
    pub fn on_feature(&mut self, response: FeatureResponse) {
        let FeatureResponse { tag, result } = response;
        let Some(session) = self.session.as_mut() else {
            tracing::debug!(?tag, "discarding result: no active session");
            return;
        };
        if tag.session != session.seq {
            tracing::debug!(?tag, current = session.seq, "discarding result from earlier session");
            return;
        }
        let session_id = session.id;

        match (tag.subject, result) {
            (Subject::Reference, Ok(feature)) => {
                if self.state != MachineState::ReferencePending {
                    return;
                }
                tracing::info!(session = %session_id, "reference feature ready");
                session.reference_feature = Some(feature);
                self.scheduler.cancel(TimerKind::ReferencePending);
                self.scheduler.cancel(TimerKind::Restart);
                self.scheduler
                    .schedule(TimerKind::ReadTimeout, self.settings.read_timeout);
                self.state = MachineState::Armed;
                self.sink.show_reference(&session.subject);
                self.try_compare();
            }
            (Subject::Reference, Err(e)) => {
                if self.state != MachineState::ReferencePending {
                    return;
                }
                tracing::warn!(session = %session_id, error = %e, "reference extraction failed");
                self.scheduler.cancel(TimerKind::ReferencePending);
                self.tracker.mark_failed(Subject::Reference);
                self.session = None;
                self.enter_idle();
            }
            (Subject::Live(track_id), Ok(feature)) => {
                session.live_features.insert(track_id, feature.clone());
                match session.live.as_mut() {
                    Some(live) if live.track_id == track_id => {
                        tracing::debug!(session = %session_id, track_id, "live feature ready");
                        live.feature = Some(feature);
                    }
                    _ => {
                        tracing::debug!(session = %session_id, track_id, "feature kept for a face out of view");
                        return;
                    }
                }
                self.try_compare();
            }
            (Subject::Live(track_id), Err(e)) => {
                tracing::debug!(session = %session_id, track_id, error = %e, "live extraction failed");
                self.tracker.mark_failed(Subject::Live(track_id));
            }
        }
    }

    /// Handle a timer that the scheduler has already claimed.
    pub fn on_timer(&mut self, kind: TimerKind) {
        match (kind, self.state) {
            (TimerKind::ReadTimeout, MachineState::Armed) => {
                if let Some(session) = &self.session {
                    tracing::info!(session = %session.id, "no live match in time, session abandoned");
                }
                self.end_session();
                self.enter_idle();
            }
            (TimerKind::ReferencePending, MachineState::ReferencePending) => {
                if let Some(session) = &self.session {
                    tracing::warn!(session = %session.id, "reference extraction unanswered, session dropped");
                }
                self.tracker.mark_failed(Subject::Reference);
                self.session = None;
                self.enter_idle();
            }
            (TimerKind::Restart, MachineState::ResultShown) => {
                self.enter_idle();
            }
            (TimerKind::Prompt, MachineState::Armed) => {
                if !self.live_feature_ready() {
                    self.sink.play_cue(Cue::LookAtScreen);
                    self.scheduler
                        .schedule(TimerKind::Prompt, self.settings.prompt_interval);
                }
            }
            (kind, state) => {
                tracing::debug!(?kind, ?state, "timer ignored in current state");
            }
        }
    }

    pub fn on_capture_opened(&mut self, geometry: CaptureGeometry) {
        tracing::info!(
            camera_id = geometry.camera_id,
            size = %geometry.size,
            orientation = geometry.orientation,
            "capture opened"
        );
        self.geometry = Some(geometry);
    }

    pub fn on_orientation_changed(&mut self, camera_id: usize, orientation: u32) {
        match self.geometry.as_mut() {
            Some(geometry) if geometry.camera_id == camera_id => {
                geometry.orientation = orientation;
            }
            _ => tracing::debug!(camera_id, "orientation change for a closed device"),
        }
    }

    pub fn on_capture_closed(&mut self) {
        tracing::info!("capture closed");
        self.geometry = None;
        self.clear_overlay();
    }

    pub fn on_capture_error(&mut self, error: &CaptureError) {
        tracing::error!(error = %error, "capture failed");
        self.clear_overlay();
    }

    fn live_feature_ready(&self) -> bool {
        self.session
            .as_ref()
            .and_then(|s| s.live.as_ref())
            .is_some_and(|l| l.feature.is_some())
    }

    /// Compare once both sides are present. Otherwise keep prompting.
    fn try_compare(&mut self) {
        if self.state != MachineState::Armed {
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let Some(reference) = session.reference_feature.as_ref() else {
            return;
        };
        let Some(live) = session.live.as_ref().and_then(|l| l.feature.as_ref()) else {
            if !self.scheduler.is_pending(TimerKind::Prompt) {
                self.sink.show_prompt(Prompt::LookAtCamera);
                self.scheduler
                    .schedule(TimerKind::Prompt, self.settings.prompt_interval);
            }
            return;
        };

        self.scheduler.cancel(TimerKind::Prompt);
        self.state = MachineState::Comparing;
        self.sink.show_prompt(Prompt::Comparing);

        let score = match self.engine.compare_features(reference, live) {
            Ok(score) => score,
            Err(e) => {
                tracing::warn!(session = %session.id, error = %e, "comparison failed, treating as mismatch");
                0.0
            }
        };
        let verdict = if score > self.settings.similarity_threshold {
            Verdict::Success
        } else {
            Verdict::Failure
        };
        tracing::info!(
            session = %session.id,
            score,
            threshold = self.settings.similarity_threshold,
            ?verdict,
            "comparison finished"
        );

        let display_name = session.subject.display_name.clone();
        self.sink.play_cue(match verdict {
            Verdict::Success => Cue::CompareSuccess,
            Verdict::Failure => Cue::CompareFail,
        });
        self.sink.show_prompt(Prompt::Result {
            verdict,
            display_name,
        });

        self.end_session();
        self.scheduler
            .schedule(TimerKind::Restart, self.settings.restart_delay);
        self.state = MachineState::ResultShown;
        self.reference_gate.store(true, Ordering::SeqCst);
    }

    fn end_session(&mut self) {
        self.scheduler.cancel(TimerKind::ReadTimeout);
        self.scheduler.cancel(TimerKind::Prompt);
        self.scheduler.cancel(TimerKind::ReferencePending);
        self.tracker.clear_all();
        self.session = None;
    }

    fn enter_idle(&mut self) {
        self.state = MachineState::AwaitingReference;
        self.sink.show_prompt(Prompt::SubmitReference);
        if self.engine_ready {
            self.reference_gate.store(true, Ordering::SeqCst);
        }
    }

    fn clear_overlay(&mut self) {
        if self.overlay_visible {
            self.sink.update_overlay(None);
            self.overlay_visible = false;
        }
    }
}
