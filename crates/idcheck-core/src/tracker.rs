//! Per-frame face tracking with smoothing and debouncing.
//!
//! Raw detections are noisy. The tracker keeps the last few samples and only
//! lets consumers see:
//! - the mean position over those samples,
//! - a status that changes only when a majority of recent ticks agree,
//! - a "ready" flag latched with asymmetric time hysteresis.
//!
//! Time is injected (`Instant`) so every rule can be driven from tests.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::types::{BoundingBox, FacePosition, SmoothedFacePosition};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    /// Minimum time between two detections.
    pub min_interval: Duration,
    /// Samples kept for position averaging and status voting.
    pub history_len: usize,
    /// Allowed offset of the face center from the frame center, per axis.
    pub center_tolerance: f32,
    /// Accepted face width relative to frame width.
    pub min_size: f32,
    pub max_size: f32,
    /// How long OK must hold before `ready` turns on.
    pub ready_rise: Duration,
    /// How long not-OK must hold before `ready` turns off.
    pub ready_fall: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            history_len: 5,
            center_tolerance: 0.18,
            min_size: 0.22,
            max_size: 0.65,
            ready_rise: Duration::from_millis(800),
            ready_fall: Duration::from_millis(1200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaceStatus {
    Ok,
    PositionBad,
    SizeBad,
    #[default]
    NoFace,
}

/// Boolean latch with separate rise and fall delays.
#[derive(Debug, Clone)]
pub struct ReadyLatch {
    rise: Duration,
    fall: Duration,
    ready: bool,
    good_since: Option<Instant>,
    bad_since: Option<Instant>,
}

impl ReadyLatch {
    pub fn new(rise: Duration, fall: Duration) -> Self {
        Self {
            rise,
            fall,
            ready: false,
            good_since: None,
            bad_since: None,
        }
    }

    /// Feed the current condition and return the latched value.
    pub fn update(&mut self, now: Instant, good: bool) -> bool {
        if good {
            self.bad_since = None;
            let since = *self.good_since.get_or_insert(now);
            if !self.ready && now.saturating_duration_since(since) >= self.rise {
                self.ready = true;
            }
        } else {
            self.good_since = None;
            let since = *self.bad_since.get_or_insert(now);
            if self.ready && now.saturating_duration_since(since) >= self.fall {
                self.ready = false;
            }
        }
        self.ready
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn reset(&mut self) {
        self.ready = false;
        self.good_since = None;
        self.bad_since = None;
    }
}

/// What consumers see after a sampled tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerUpdate {
    pub status: FaceStatus,
    pub position: Option<SmoothedFacePosition>,
    pub ready: bool,
}

pub struct FrameTracker {
    config: TrackerConfig,
    last_sample: Option<Instant>,
    positions: VecDeque<FacePosition>,
    votes: VecDeque<FaceStatus>,
    status: FaceStatus,
    smoothed: Option<SmoothedFacePosition>,
    latch: ReadyLatch,
}

impl FrameTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            latch: ReadyLatch::new(config.ready_rise, config.ready_fall),
            config,
            last_sample: None,
            positions: VecDeque::with_capacity(config.history_len),
            votes: VecDeque::with_capacity(config.history_len),
            status: FaceStatus::NoFace,
            smoothed: None,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Throttle: whether enough time has passed to run detection again.
    pub fn should_sample(&self, now: Instant) -> bool {
        self.last_sample
            .map_or(true, |last| now.saturating_duration_since(last) >= self.config.min_interval)
    }

    /// Record one detection result (`None` = no face) for a frame of the
    /// given pixel size.
    pub fn observe(
        &mut self,
        now: Instant,
        face: Option<&BoundingBox>,
        frame_width: u32,
        frame_height: u32,
    ) -> TrackerUpdate {
        self.last_sample = Some(now);

        let classification = match face {
            Some(bbox) if frame_width > 0 && frame_height > 0 => {
                let position = normalize_position(bbox, frame_width, frame_height);
                push_bounded(&mut self.positions, position, self.config.history_len);
                let mean = mean_position(&self.positions);
                self.smoothed = Some(mean);
                self.classify(&mean)
            }
            _ => FaceStatus::NoFace,
        };

        push_bounded(&mut self.votes, classification, self.config.history_len);
        if let Some(winner) = majority(&self.votes, self.config.history_len) {
            if winner != self.status {
                tracing::debug!(from = ?self.status, to = ?winner, "tracker status changed");
                self.status = winner;
            }
        }

        self.latch.update(now, self.status == FaceStatus::Ok);
        self.update()
    }

    /// Current externally visible state.
    pub fn update(&self) -> TrackerUpdate {
        TrackerUpdate {
            status: self.status,
            position: self.smoothed,
            ready: self.latch.is_ready(),
        }
    }

    pub fn status(&self) -> FaceStatus {
        self.status
    }

    pub fn smoothed_position(&self) -> Option<SmoothedFacePosition> {
        self.smoothed
    }

    pub fn is_ready(&self) -> bool {
        self.latch.is_ready()
    }

    fn classify(&self, position: &FacePosition) -> FaceStatus {
        let tol = self.config.center_tolerance;
        if (position.x - 0.5).abs() > tol || (position.y - 0.5).abs() > tol {
            FaceStatus::PositionBad
        } else if position.size < self.config.min_size || position.size > self.config.max_size {
            FaceStatus::SizeBad
        } else {
            FaceStatus::Ok
        }
    }

    /// Drop every history and the latch. Used when an attempt restarts.
    pub fn reset(&mut self) {
        self.last_sample = None;
        self.positions.clear();
        self.votes.clear();
        self.status = FaceStatus::NoFace;
        self.smoothed = None;
        self.latch.reset();
    }
}

fn push_bounded<T>(buf: &mut VecDeque<T>, value: T, cap: usize) {
    if buf.len() == cap {
        buf.pop_front();
    }
    buf.push_back(value);
}

pub fn normalize_position(bbox: &BoundingBox, frame_width: u32, frame_height: u32) -> FacePosition {
    let (cx, cy) = bbox.center();
    FacePosition {
        x: (cx / frame_width as f32).clamp(0.0, 1.0),
        y: (cy / frame_height as f32).clamp(0.0, 1.0),
        size: (bbox.width / frame_width as f32).clamp(0.0, 1.0),
    }
}

fn mean_position(samples: &VecDeque<FacePosition>) -> FacePosition {
    let n = samples.len().max(1) as f32;
    let (x, y, size) = samples
        .iter()
        .fold((0.0, 0.0, 0.0), |(x, y, s), p| (x + p.x, y + p.y, s + p.size));
    FacePosition {
        x: x / n,
        y: y / n,
        size: size / n,
    }
}

/// Status holding a strict majority of a full window, if any.
fn majority(votes: &VecDeque<FaceStatus>, window: usize) -> Option<FaceStatus> {
    let needed = window / 2 + 1;
    [
        FaceStatus::Ok,
        FaceStatus::PositionBad,
        FaceStatus::SizeBad,
        FaceStatus::NoFace,
    ]
    .into_iter()
    .find(|candidate| votes.iter().filter(|v| *v == candidate).count() >= needed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 640;
    const H: u32 = 480;

    /// Centered face, 40% of frame width.
    fn good_box() -> BoundingBox {
        BoundingBox {
            x: 192.0,
            y: 144.0,
            width: 256.0,
            height: 192.0,
            confidence: 0.9,
        }
    }

    /// Same size, pushed into the top-left corner.
    fn off_center_box() -> BoundingBox {
        BoundingBox {
            x: 0.0,
            y: 0.0,
            ..good_box()
        }
    }

    fn at(t0: Instant, ms: u64) -> Instant {
        t0 + Duration::from_millis(ms)
    }

    #[test]
    fn throttles_detection() {
        let t0 = Instant::now();
        let mut tracker = FrameTracker::new(TrackerConfig::default());
        assert!(tracker.should_sample(t0));
        tracker.observe(t0, Some(&good_box()), W, H);
        assert!(!tracker.should_sample(at(t0, 99)));
        assert!(tracker.should_sample(at(t0, 100)));
    }

    #[test]
    fn position_is_mean_of_last_five() {
        let t0 = Instant::now();
        let mut tracker = FrameTracker::new(TrackerConfig::default());
        for i in 0..6u64 {
            let bbox = BoundingBox {
                x: 100.0 + 10.0 * i as f32,
                ..good_box()
            };
            tracker.observe(at(t0, i * 100), Some(&bbox), W, H);
        }
        // samples 1..=5: x offsets 110..150, mean 130
        let expected_cx = (130.0 + 128.0) / W as f32;
        let pos = tracker.smoothed_position().unwrap();
        assert!((pos.x - expected_cx).abs() < 1e-5);
        assert!((pos.size - 0.4).abs() < 1e-5);
    }

    #[test]
    fn classifies_size_and_position() {
        let t0 = Instant::now();
        let mut small = FrameTracker::new(TrackerConfig::default());
        let tiny = BoundingBox {
            x: 300.0,
            y: 220.0,
            width: 40.0,
            height: 40.0,
            confidence: 0.9,
        };
        let mut off = FrameTracker::new(TrackerConfig::default());
        for i in 0..5 {
            small.observe(at(t0, i * 100), Some(&tiny), W, H);
            off.observe(at(t0, i * 100), Some(&off_center_box()), W, H);
        }
        assert_eq!(small.status(), FaceStatus::SizeBad);
        assert_eq!(off.status(), FaceStatus::PositionBad);
    }

    #[test]
    fn single_outlier_does_not_flip_status() {
        let t0 = Instant::now();
        let mut tracker = FrameTracker::new(TrackerConfig::default());
        for i in 0..4 {
            tracker.observe(at(t0, i * 100), Some(&good_box()), W, H);
        }
        assert_eq!(tracker.status(), FaceStatus::Ok);
        let update = tracker.observe(at(t0, 400), None, W, H);
        assert_eq!(update.status, FaceStatus::Ok);
        // still OK with the outlier in the middle of the window
        let update = tracker.observe(at(t0, 500), Some(&good_box()), W, H);
        assert_eq!(update.status, FaceStatus::Ok);
    }

    #[test]
    fn sustained_absence_flips_to_no_face() {
        let t0 = Instant::now();
        let mut tracker = FrameTracker::new(TrackerConfig::default());
        for i in 0..5 {
            tracker.observe(at(t0, i * 100), Some(&good_box()), W, H);
        }
        tracker.observe(at(t0, 500), None, W, H);
        tracker.observe(at(t0, 600), None, W, H);
        assert_eq!(tracker.status(), FaceStatus::Ok);
        tracker.observe(at(t0, 700), None, W, H);
        assert_eq!(tracker.status(), FaceStatus::NoFace);
    }

    #[test]
    fn ready_needs_continuous_ok_and_falls_slowly() {
        let t0 = Instant::now();
        let mut tracker = FrameTracker::new(TrackerConfig::default());
        // status turns OK on the third sample (t = 200 ms)
        for ms in (0..=900).step_by(100) {
            let update = tracker.observe(at(t0, ms), Some(&good_box()), W, H);
            assert!(!update.ready, "ready too early at {ms} ms");
        }
        assert!(tracker.observe(at(t0, 1000), Some(&good_box()), W, H).ready);

        // face lost from 1100 ms; visible status goes bad at 1300 ms
        for ms in (1100..=2400).step_by(100) {
            let update = tracker.observe(at(t0, ms), None, W, H);
            assert!(update.ready, "ready dropped too early at {ms} ms");
        }
        assert!(!tracker.observe(at(t0, 2500), None, W, H).ready);
    }

    #[test]
    fn fast_oscillation_never_becomes_ready() {
        let t0 = Instant::now();
        let mut tracker = FrameTracker::new(TrackerConfig::default());
        // 300 ms good, 300 ms bad, for ten seconds
        for tick in 0..100u64 {
            let face = if (tick / 3) % 2 == 0 {
                Some(good_box())
            } else {
                None
            };
            let update = tracker.observe(at(t0, tick * 100), face.as_ref(), W, H);
            assert!(!update.ready, "became ready at tick {tick}");
        }
    }

    #[test]
    fn latch_in_isolation() {
        let t0 = Instant::now();
        let mut latch = ReadyLatch::new(Duration::from_millis(800), Duration::from_millis(1200));
        assert!(!latch.update(t0, true));
        assert!(!latch.update(at(t0, 799), true));
        assert!(latch.update(at(t0, 800), true));
        assert!(latch.update(at(t0, 900), false));
        // a good blip restarts the fall timer
        assert!(latch.update(at(t0, 1500), true));
        assert!(latch.update(at(t0, 1600), false));
        assert!(latch.update(at(t0, 2799), false));
        assert!(!latch.update(at(t0, 2800), false));
    }

    #[test]
    fn reset_clears_everything() {
        let t0 = Instant::now();
        let mut tracker = FrameTracker::new(TrackerConfig::default());
        for ms in (0..=1200).step_by(100) {
            tracker.observe(at(t0, ms), Some(&good_box()), W, H);
        }
        assert!(tracker.is_ready());
        tracker.reset();
        let update = tracker.update();
        assert_eq!(update.status, FaceStatus::NoFace);
        assert_eq!(update.position, None);
        assert!(!update.ready);
        assert!(tracker.should_sample(at(t0, 1200)));
    }
}
