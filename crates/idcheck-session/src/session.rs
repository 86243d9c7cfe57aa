//! Owned per-frame state for one capture session.
//!
//! All frame-derived state (tracker histories, liveness, the selfie match)
//! is updated inside [`CaptureSession::tick`], so each frame's updates are
//! complete before the next frame is looked at.

use std::time::Instant;

use chrono::NaiveDate;
use image::DynamicImage;
use serde::Serialize;
use thiserror::Error;

use idcheck_core::liveness::LivenessEvent;
use idcheck_core::tracker::TrackerUpdate;
use idcheck_core::{
    Checklist, ExtractedIdData, FaceDescriptor, FaceEmbeddingService, FrameTracker,
    LivenessMachine, LivenessState, ManualEntry, VerificationResult,
};

use crate::attempt::{AttemptToken, Attempts};
use crate::camera::CaptureError;
use crate::config::SessionConfig;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error("stale attempt {stale} (current is {current})")]
    StaleAttempt { stale: u64, current: u64 },
    #[error("document already attached for this attempt")]
    DocumentAlreadyAttached,
    #[error("no document attached for this attempt")]
    NoDocument,
    #[error("capture already running")]
    AlreadyCapturing,
    #[error("failed to spawn session thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("session thread exited")]
    ChannelClosed,
}

/// Result of one call to [`CaptureSession::tick`].
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Too soon after the previous detection; nothing changed.
    Throttled,
    Processed {
        tracker: TrackerUpdate,
        liveness: LivenessState,
        event: LivenessEvent,
        /// Present on the tick that took the selfie.
        verification: Option<VerificationResult>,
    },
}

/// What the session knows about the current attempt's document.
struct DocumentSlot {
    generation: u64,
    data: ExtractedIdData,
    reference: Option<FaceDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub attempt: u64,
    pub capturing: bool,
    pub frames: u64,
    pub tracker: Option<TrackerUpdate>,
    pub liveness: LivenessState,
    pub document_attached: bool,
    pub reference_available: bool,
    pub result: Option<VerificationResult>,
}

pub struct CaptureSession {
    config: SessionConfig,
    attempts: Attempts,
    tracker: FrameTracker,
    liveness: LivenessMachine,
    embedding: FaceEmbeddingService,
    document: Option<DocumentSlot>,
    last_update: Option<TrackerUpdate>,
    result: Option<VerificationResult>,
    frames: u64,
}

impl CaptureSession {
    pub fn new(config: SessionConfig, embedding: FaceEmbeddingService) -> Self {
        Self {
            tracker: FrameTracker::new(config.tracker),
            liveness: LivenessMachine::new(config.liveness),
            config,
            attempts: Attempts::new(),
            embedding,
            document: None,
            last_update: None,
            result: None,
            frames: 0,
        }
    }

    pub fn attempts(&self) -> &Attempts {
        &self.attempts
    }

    /// Start over: new attempt generation, every history cleared.
    pub fn begin_attempt(&mut self) -> AttemptToken {
        let token = self.attempts.begin();
        self.document = None;
        self.reset_frame_state();
        tracing::info!(attempt = token.generation(), "session reset for new attempt");
        token
    }

    /// Clear everything derived from frames, keeping the attached document.
    /// Used when the camera is restarted within the same attempt.
    pub fn reset_frame_state(&mut self) {
        self.tracker.reset();
        self.liveness.reset();
        self.last_update = None;
        self.result = None;
        self.frames = 0;
    }

    fn check_current(&self, token: &AttemptToken) -> Result<(), SessionError> {
        if token.is_current() {
            Ok(())
        } else {
            Err(SessionError::StaleAttempt {
                stale: token.generation(),
                current: self.attempts.current(),
            })
        }
    }

    /// Attach the extracted document for `token`'s attempt and compute the
    /// reference descriptor from its face image. Happens once per attempt;
    /// returns whether a reference face was found.
    pub fn attach_document(
        &mut self,
        token: &AttemptToken,
        data: ExtractedIdData,
    ) -> Result<bool, SessionError> {
        if let Err(e) = self.check_current(token) {
            tracing::warn!(error = %e, "discarding stale document");
            return Err(e);
        }
        if self
            .document
            .as_ref()
            .is_some_and(|d| d.generation == token.generation())
        {
            return Err(SessionError::DocumentAlreadyAttached);
        }

        let reference = match data.face_image.as_ref() {
            Some(image) => match self.embedding.analyze_reference(image) {
                Ok(found) => found.map(|a| a.descriptor),
                Err(e) => {
                    tracing::warn!(error = %e, "reference face analysis failed");
                    None
                }
            },
            None => None,
        };
        let found = reference.is_some();
        tracing::info!(
            attempt = token.generation(),
            reference = found,
            confidence = data.confidence,
            "document attached"
        );
        self.document = Some(DocumentSlot {
            generation: token.generation(),
            data,
            reference,
        });
        Ok(found)
    }

    /// Replace the attached document's fields with a user correction.
    ///
    /// The document image is unchanged, so the reference descriptor is kept,
    /// and a finished challenge stays finished.
    pub fn correct_document(
        &mut self,
        token: &AttemptToken,
        entry: ManualEntry,
    ) -> Result<(), SessionError> {
        self.check_current(token)?;
        let slot = self
            .document
            .as_mut()
            .filter(|d| d.generation == token.generation())
            .ok_or(SessionError::NoDocument)?;
        let face_image = slot.data.face_image.take();
        slot.data = ExtractedIdData::from_manual(entry, face_image);
        tracing::info!(
            attempt = token.generation(),
            liveness = ?self.liveness.state(),
            "document corrected by hand"
        );
        Ok(())
    }

    pub fn document(&self) -> Option<&ExtractedIdData> {
        self.document.as_ref().map(|d| &d.data)
    }

    pub fn reference(&self) -> Option<&FaceDescriptor> {
        self.document.as_ref().and_then(|d| d.reference.as_ref())
    }

    /// Begin the head-turn challenge.
    pub fn start_challenge(&mut self, now: Instant) -> bool {
        self.liveness.start(now)
    }

    pub fn liveness_state(&self) -> LivenessState {
        self.liveness.state()
    }

    pub fn result(&self) -> Option<&VerificationResult> {
        self.result.as_ref()
    }

    /// Process one frame.
    pub fn tick(&mut self, now: Instant, frame: &DynamicImage) -> TickOutcome {
        if !self.tracker.should_sample(now) {
            return TickOutcome::Throttled;
        }
        self.frames += 1;

        let detection = match self.embedding.detect_live(frame) {
            Ok(face) => face,
            Err(e) => {
                tracing::warn!(error = %e, "live detection failed");
                None
            }
        };
        let tracker = self.tracker.observe(
            now,
            detection.as_ref().map(|f| &f.bbox),
            frame.width(),
            frame.height(),
        );
        self.last_update = Some(tracker);

        if self.config.auto_start
            && tracker.ready
            && self.liveness.state() == LivenessState::Ready
            && self.liveness.start(now)
        {
            tracing::debug!("challenge auto-started");
        }

        let event = self
            .liveness
            .observe(now, detection.as_ref().map(|f| &f.landmarks));

        let verification = if event == LivenessEvent::CaptureDue {
            let result = self.verify_selfie(frame);
            self.liveness.complete_verification(result.is_match);
            self.result = Some(result.clone());
            Some(result)
        } else {
            None
        };

        TickOutcome::Processed {
            tracker,
            liveness: self.liveness.state(),
            event,
            verification,
        }
    }

    fn verify_selfie(&mut self, frame: &DynamicImage) -> VerificationResult {
        match self.embedding.analyze_live(frame) {
            Ok(Some(selfie)) => {
                self.config
                    .policy
                    .decide(self.reference(), &selfie.descriptor, true)
            }
            Ok(None) => {
                tracing::warn!("no face in selfie frame");
                VerificationResult::no_face()
            }
            Err(e) => {
                tracing::warn!(error = %e, "selfie analysis failed");
                VerificationResult::no_face()
            }
        }
    }

    /// Checklist for the attached document and the latest result.
    pub fn checklist(&self, today: NaiveDate) -> Option<Checklist> {
        let document = self.document()?;
        let result = self.result.as_ref()?;
        Some(Checklist::evaluate(document, result, today))
    }

    pub fn snapshot(&self, capturing: bool) -> SessionSnapshot {
        SessionSnapshot {
            attempt: self.attempts.current(),
            capturing,
            frames: self.frames,
            tracker: self.last_update,
            liveness: self.liveness.state(),
            document_attached: self.document.is_some(),
            reference_available: self.reference().is_some(),
            result: self.result.clone(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::time::Duration;

    fn session(model: YawModel) -> CaptureSession {
        CaptureSession::new(
            SessionConfig::default(),
            FaceEmbeddingService::new(Box::new(model)),
        )
    }

    fn document() -> ExtractedIdData {
        ExtractedIdData {
            document_number: "12345678Z".into(),
            first_name: "Ana".into(),
            last_name: "Martinez".into(),
            confidence: 0.9,
            face_image: Some(document_photo()),
            ..Default::default()
        }
    }

    /// Yaw script: hold center until ready (the challenge auto-starts at
    /// 1 s), turn right, come back toward center (completes the left turn
    /// relative to the new center), then hold past the verify delay.
    fn challenge_script() -> Vec<f32> {
        let mut script = vec![0.0; 12];
        script.extend([-0.4, -0.4, -0.4]);
        script.extend([-0.1, -0.1]);
        script.extend([0.3, 0.3]);
        script.extend([0.0; 8]);
        script
    }

    /// Run `frames` at 100 ms spacing; returns the verification, if any.
    fn play(session: &mut CaptureSession, t0: Instant, frames: &[DynamicImage]) -> Option<VerificationResult> {
        let mut verification = None;
        for (i, frame) in frames.iter().enumerate() {
            let now = t0 + Duration::from_millis(100 * i as u64);
            if let TickOutcome::Processed {
                verification: Some(v),
                ..
            } = session.tick(now, frame)
            {
                verification = Some(v);
            }
        }
        verification
    }

    #[test]
    fn full_challenge_matches_document() {
        let mut s = session(YawModel::new(0.0, 0.3));
        let token = s.begin_attempt();
        assert!(s.attach_document(&token, document()).unwrap());

        let frames: Vec<_> = challenge_script().into_iter().map(frame).collect();
        let result = play(&mut s, Instant::now(), &frames).expect("selfie taken");

        assert!(result.face_detected);
        assert!(result.liveness_verified);
        assert!(result.is_match);
        assert!((result.face_match_score - 0.7).abs() < 1e-6);
        assert_eq!(s.liveness_state(), LivenessState::Done);

        let today = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        assert!(s.checklist(today).unwrap().fully_verified());
    }

    #[test]
    fn mismatch_sends_liveness_back_to_ready() {
        let mut s = session(YawModel::new(0.0, 0.9));
        let token = s.begin_attempt();
        s.attach_document(&token, document()).unwrap();

        let frames: Vec<_> = challenge_script().into_iter().map(frame).collect();
        let result = play(&mut s, Instant::now(), &frames).unwrap();
        assert!(!result.is_match);
        assert_ne!(s.liveness_state(), LivenessState::Done);
        assert_ne!(s.liveness_state(), LivenessState::Verifying);
    }

    #[test]
    fn no_document_face_relies_on_liveness() {
        let mut model = YawModel::new(0.0, 0.9);
        model.document_has_face = false;
        let mut s = session(model);
        let token = s.begin_attempt();
        assert!(!s.attach_document(&token, document()).unwrap());

        let frames: Vec<_> = challenge_script().into_iter().map(frame).collect();
        let result = play(&mut s, Instant::now(), &frames).unwrap();
        assert!(result.is_match);
        assert_eq!(result.face_match_score, 0.0);
    }

    #[test]
    fn throttle_skips_fast_frames() {
        let mut s = session(YawModel::new(0.0, 0.0));
        let t0 = Instant::now();
        assert!(matches!(s.tick(t0, &frame(0.0)), TickOutcome::Processed { .. }));
        assert_eq!(
            s.tick(t0 + Duration::from_millis(50), &frame(0.0)),
            TickOutcome::Throttled
        );
        assert_eq!(s.snapshot(true).frames, 1);
    }

    #[test]
    fn stale_document_is_discarded() {
        let mut s = session(YawModel::new(0.0, 0.0));
        let old = s.begin_attempt();
        let current = s.begin_attempt();
        assert!(matches!(
            s.attach_document(&old, document()),
            Err(SessionError::StaleAttempt { stale: 1, current: 2 })
        ));
        assert!(s.document().is_none());
        s.attach_document(&current, document()).unwrap();
        assert!(matches!(
            s.attach_document(&current, document()),
            Err(SessionError::DocumentAlreadyAttached)
        ));
    }

    fn correction() -> ManualEntry {
        ManualEntry {
            document_type: idcheck_core::DocumentType::NationalId,
            document_number: " 87654321x ".into(),
            first_name: "Lucia".into(),
            last_name: "Garcia".into(),
            date_of_birth: NaiveDate::from_ymd_opt(1980, 1, 1),
            expiration_date: None,
            nationality: "esp".into(),
            sex: idcheck_core::Sex::F,
        }
    }

    #[test]
    fn correction_after_challenge_keeps_verdict() {
        let mut s = session(YawModel::new(0.0, 0.3));
        let token = s.begin_attempt();
        let mut unread = document();
        unread.document_number.clear();
        unread.confidence = 0.0;
        s.attach_document(&token, unread).unwrap();

        let frames: Vec<_> = challenge_script().into_iter().map(frame).collect();
        play(&mut s, Instant::now(), &frames).unwrap();
        assert_eq!(s.liveness_state(), LivenessState::Done);
        let reference = s.reference().cloned();

        s.correct_document(&token, correction()).unwrap();
        let doc = s.document().unwrap();
        assert_eq!(doc.document_number, "87654321X");
        assert_eq!(doc.confidence, 1.0);
        assert!(doc.face_image.is_some());
        assert_eq!(s.reference().cloned(), reference);
        assert_eq!(s.liveness_state(), LivenessState::Done);
        assert!(s.result().unwrap().is_match);

        let today = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        assert!(s.checklist(today).unwrap().fully_verified());
    }

    #[test]
    fn correction_needs_current_attached_document() {
        let mut s = session(YawModel::new(0.0, 0.0));
        let old = s.begin_attempt();
        assert!(matches!(
            s.correct_document(&old, correction()),
            Err(SessionError::NoDocument)
        ));
        s.attach_document(&old, document()).unwrap();
        s.begin_attempt();
        assert!(matches!(
            s.correct_document(&old, correction()),
            Err(SessionError::StaleAttempt { .. })
        ));
    }

    #[test]
    fn new_attempt_clears_frame_state() {
        let mut s = session(YawModel::new(0.0, 0.3));
        let token = s.begin_attempt();
        s.attach_document(&token, document()).unwrap();
        let frames: Vec<_> = vec![0.0; 12].into_iter().map(frame).collect();
        let t0 = Instant::now();
        play(&mut s, t0, &frames);
        assert_eq!(s.liveness_state(), LivenessState::TurnRight);

        s.begin_attempt();
        let snap = s.snapshot(false);
        assert_eq!(snap.liveness, LivenessState::Ready);
        assert_eq!(snap.tracker, None);
        assert!(!snap.document_attached);
        assert_eq!(snap.frames, 0);
        // throttle history is gone too
        assert!(matches!(
            s.tick(t0 + Duration::from_millis(1150), &empty_frame()),
            TickOutcome::Processed { .. }
        ));
    }

    #[test]
    fn manual_start_without_auto_start() {
        let config = SessionConfig {
            auto_start: false,
            ..SessionConfig::default()
        };
        let mut s = CaptureSession::new(
            config,
            FaceEmbeddingService::new(Box::new(YawModel::new(0.0, 0.0))),
        );
        let frames: Vec<_> = vec![0.0; 12].into_iter().map(frame).collect();
        let t0 = Instant::now();
        play(&mut s, t0, &frames);
        assert_eq!(s.liveness_state(), LivenessState::Ready);
        assert!(s.start_challenge(t0 + Duration::from_millis(1200)));
        assert_eq!(s.liveness_state(), LivenessState::TurnRight);
    }
}
