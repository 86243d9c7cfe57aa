//! Active liveness detection via a head-turn challenge.
//!
//! The subject is asked to turn right, then left. Progress is measured from
//! the five-point landmarks the detector already produces: the nose tip's
//! horizontal offset from the eye midpoint, divided by the inter-eye
//! distance. The ratio does not depend on how far the subject sits from the
//! camera.
//!
//! Angles are relative to a center reference taken from the first usable
//! frame of each turn, so the subject's resting pose counts as center.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs and still images held in front of the
//!   camera (they cannot turn on request).
//! - **Does not block:** Video replay of a subject performing the same
//!   turns, 3D masks, or adversarial displays.

use std::time::{Duration, Instant};


use crate::types::{Landmarks, LivenessState};

/// Relative angle a turn must exceed to count.
pub const TURN_THRESHOLD: f32 = 0.25;

/// Sign of the relative angle a physical right turn produces. The preview is
/// mirrored, so a right turn moves the nose to the left of the eye midpoint
/// in image coordinates.
pub const RIGHT_TURN_DIRECTION: f32 = -1.0;

/// Eyes closer than this (pixels) give no usable angle.
const MIN_INTER_EYE_DISTANCE: f32 = 1.0;

/// Head yaw as a unitless ratio: `(nose_x - eye_mid_x) / inter_eye_distance`.
pub fn head_angle(landmarks: &Landmarks) -> Option<f32> {
    let (lx, _) = landmarks.left_eye();
    let (rx, _) = landmarks.right_eye();
    let (nx, _) = landmarks.nose_tip();
    let inter_eye = (rx - lx).abs();
    if inter_eye < MIN_INTER_EYE_DISTANCE || !nx.is_finite() {
        return None;
    }
    let mid = (lx + rx) / 2.0;
    Some((nx - mid) / inter_eye)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessConfig {
    pub turn_threshold: f32,
    /// Pause between the left turn and the selfie capture.
    pub verify_delay: Duration,
    /// A turn not completed within this time sends the machine back to READY.
    pub turn_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            turn_threshold: TURN_THRESHOLD,
            verify_delay: Duration::from_millis(500),
            turn_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    Right,
    Left,
}

/// What a call to [`LivenessMachine::observe`] did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LivenessEvent {
    Idle,
    /// Center reference captured for the current turn.
    CenterCaptured { angle: f32 },
    /// Relative angle measured; the turn is still in progress.
    Progress { relative: f32 },
    TurnCompleted(Turn),
    /// The verify delay elapsed: take the selfie now.
    CaptureDue,
    TimedOut(Turn),
}

#[derive(Debug, Clone)]
pub struct LivenessMachine {
    config: LivenessConfig,
    state: LivenessState,
    center: Option<f32>,
    turn_started: Option<Instant>,
    verify_at: Option<Instant>,
}

impl LivenessMachine {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            state: LivenessState::Ready,
            center: None,
            turn_started: None,
            verify_at: None,
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    pub fn center_reference(&self) -> Option<f32> {
        self.center
    }

    /// READY → TURN_RIGHT. Ignored in any other state.
    pub fn start(&mut self, now: Instant) -> bool {
        if self.state != LivenessState::Ready {
            return false;
        }
        self.enter_turn(LivenessState::TurnRight, now);
        tracing::info!("liveness: challenge started");
        true
    }

    fn enter_turn(&mut self, state: LivenessState, now: Instant) {
        self.state = state;
        self.center = None;
        self.turn_started = Some(now);
        self.verify_at = None;
    }

    fn current_turn(&self) -> Option<Turn> {
        match self.state {
            LivenessState::TurnRight => Some(Turn::Right),
            LivenessState::TurnLeft => Some(Turn::Left),
            _ => None,
        }
    }

    /// Feed one frame's landmarks (`None` when no face was found).
    pub fn observe(&mut self, now: Instant, landmarks: Option<&Landmarks>) -> LivenessEvent {
        let Some(turn) = self.current_turn() else {
            return LivenessEvent::Idle;
        };

        if let Some(at) = self.verify_at {
            if now >= at {
                self.state = LivenessState::Verifying;
                self.verify_at = None;
                tracing::info!("liveness: turns complete, verifying");
                return LivenessEvent::CaptureDue;
            }
            return LivenessEvent::Idle;
        }

        if let Some(started) = self.turn_started {
            if now.saturating_duration_since(started) >= self.config.turn_timeout {
                tracing::warn!(?turn, "liveness: turn timed out");
                self.reset();
                return LivenessEvent::TimedOut(turn);
            }
        }

        let Some(angle) = landmarks.and_then(head_angle) else {
            return LivenessEvent::Idle;
        };
        let Some(center) = self.center else {
            self.center = Some(angle);
            tracing::debug!(?turn, angle, "liveness: center reference captured");
            return LivenessEvent::CenterCaptured { angle };
        };

        let relative = angle - center;
        let direction = match turn {
            Turn::Right => RIGHT_TURN_DIRECTION,
            Turn::Left => -RIGHT_TURN_DIRECTION,
        };
        if relative * direction <= self.config.turn_threshold {
            return LivenessEvent::Progress { relative };
        }

        tracing::info!(?turn, relative, "liveness: turn completed");
        match turn {
            Turn::Right => self.enter_turn(LivenessState::TurnLeft, now),
            Turn::Left => self.verify_at = Some(now + self.config.verify_delay),
        }
        LivenessEvent::TurnCompleted(turn)
    }

    /// Outcome of the selfie match: VERIFYING → DONE on success, back to
    /// READY on failure. Returns the new state.
    pub fn complete_verification(&mut self, success: bool) -> LivenessState {
        if self.state != LivenessState::Verifying {
            return self.state;
        }
        if success {
            self.state = LivenessState::Done;
            self.turn_started = None;
            tracing::info!("liveness: verified");
        } else {
            tracing::warn!("liveness: verification failed, back to ready");
            self.reset();
        }
        self.state
    }

    /// Back to READY with no center reference or pending timers.
    pub fn reset(&mut self) {
        self.state = LivenessState::Ready;
        self.center = None;
        self.turn_started = None;
        self.verify_at = None;
    }
}

impl Default for LivenessMachine {
    fn default() -> Self {
        Self::new(LivenessConfig::default())
    }
}
