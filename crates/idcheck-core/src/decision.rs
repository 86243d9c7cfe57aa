//! Face match decision and the aggregate verification checklist.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::{ExtractedIdData, FaceDescriptor, VerificationResult};

/// Euclidean distance below which two descriptors are the same person.
/// Tuned for the embedding model in use.
pub const MATCH_DISTANCE_THRESHOLD: f32 = 0.6;

/// Minimum extraction confidence for the document check to pass.
pub const MIN_DOCUMENT_CONFIDENCE: f32 = 0.3;

/// Checks that must pass before a user override is accepted.
pub const OVERRIDE_MIN_PASSED: usize = 3;

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Distance mapped to a similarity score in [0, 1].
pub fn similarity_score(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    pub distance_threshold: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            distance_threshold: MATCH_DISTANCE_THRESHOLD,
        }
    }
}

impl MatchPolicy {
    /// Compare the document face with the selfie.
    ///
    /// Without a document descriptor the comparison cannot run and a
    /// completed liveness challenge is accepted on its own. That leniency is
    /// deliberate: many document photos are too small or washed out to
    /// detect.
    pub fn decide(
        &self,
        id_descriptor: Option<&FaceDescriptor>,
        selfie: &FaceDescriptor,
        liveness_verified: bool,
    ) -> VerificationResult {
        let Some(reference) = id_descriptor else {
            tracing::info!(liveness_verified, "no document face, match decided by liveness");
            return VerificationResult {
                face_detected: true,
                liveness_verified,
                face_match_score: 0.0,
                is_match: liveness_verified,
                message: if liveness_verified {
                    "Liveness verified; document face unavailable for comparison".to_string()
                } else {
                    "Liveness not verified; document face unavailable for comparison".to_string()
                },
            };
        };

        let distance = euclidean_distance(reference.values(), selfie.values());
        let score = similarity_score(distance);
        let is_match = distance < self.distance_threshold;
        tracing::info!(
            distance,
            score,
            threshold = self.distance_threshold,
            is_match,
            "face match computed"
        );

        let message = match (is_match, liveness_verified) {
            (true, true) => "Face matches the document".to_string(),
            (true, false) => "Face matches the document but liveness was not verified".to_string(),
            (false, _) => format!("Face does not match the document (distance {distance:.3})"),
        };
        VerificationResult {
            face_detected: true,
            liveness_verified,
            face_match_score: score,
            is_match,
            message,
        }
    }
}

impl VerificationResult {
    /// No face in the selfie. A structured non-match, not an error.
    pub fn no_face() -> Self {
        Self {
            face_detected: false,
            liveness_verified: false,
            face_match_score: 0.0,
            is_match: false,
            message: "No face detected".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckItem {
    pub label: String,
    pub passed: bool,
    pub detail: String,
}

impl CheckItem {
    fn new(label: &str, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            label: label.to_string(),
            passed,
            detail: detail.into(),
        }
    }
}

/// Per-check breakdown for display and for gating downstream permissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checklist {
    pub items: Vec<CheckItem>,
}

impl Checklist {
    pub fn evaluate(id: &ExtractedIdData, result: &VerificationResult, today: NaiveDate) -> Self {
        let document = CheckItem::new(
            "Document read",
            id.confidence > MIN_DOCUMENT_CONFIDENCE,
            format!("confidence {:.2}", id.confidence),
        );

        let names = if id.has_names() {
            CheckItem::new(
                "Name present",
                true,
                format!("{} {}", id.first_name, id.last_name),
            )
        } else {
            CheckItem::new("Name present", false, "first or last name missing")
        };

        let expiry = match (id.is_expired(today), id.expiration_date) {
            (Some(false), Some(date)) => CheckItem::new("Document valid", true, format!("expires {date}")),
            (Some(true), Some(date)) => {
                CheckItem::new("Document valid", false, format!("expired on {date}"))
            }
            _ => CheckItem::new("Document valid", true, "expiry date not read"),
        };

        let liveness = CheckItem::new(
            "Liveness",
            result.liveness_verified,
            if result.liveness_verified {
                "head-turn challenge completed"
            } else {
                "head-turn challenge not completed"
            },
        );

        let face = if !result.face_detected {
            CheckItem::new("Face match", false, "no face detected")
        } else if result.is_match && result.face_match_score == 0.0 {
            CheckItem::new("Face match", true, "comparison unavailable")
        } else {
            CheckItem::new(
                "Face match",
                result.is_match,
                format!("score {:.2}", result.face_match_score),
            )
        };

        Self {
            items: vec![document, names, expiry, liveness, face],
        }
    }

    pub fn passed_count(&self) -> usize {
        self.items.iter().filter(|i| i.passed).count()
    }

    pub fn fully_verified(&self) -> bool {
        self.passed_count() == self.items.len()
    }

    /// Proceeding needs every check, or enough of them plus an explicit
    /// user override.
    pub fn may_proceed(&self, user_override: bool) -> bool {
        self.fully_verified() || (user_override && self.passed_count() >= OVERRIDE_MIN_PASSED)
    }
}
