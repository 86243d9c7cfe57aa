//! Shared data model for the verification pipeline.

use chrono::NaiveDate;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Length of a face descriptor produced by the embedding model.
pub const DESCRIPTOR_DIM: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    NationalId,
    ResidencePermit,
    Passport,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Sex {
    M,
    F,
    #[default]
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl Sex {
    /// Parse a single-letter sex marker. Anything but `M`/`F` is unknown.
    pub fn from_marker(marker: &str) -> Self {
        match marker.trim().to_ascii_uppercase().as_str() {
            "M" => Sex::M,
            "F" => Sex::F,
            _ => Sex::Unknown,
        }
    }
}

/// Fields tracked for provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdField {
    DocumentType,
    DocumentNumber,
    FirstName,
    LastName,
    DateOfBirth,
    ExpirationDate,
    Nationality,
    Sex,
}

/// Which extraction strategy produced a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    Remote,
    LocalOcr,
    Mrz,
    Manual,
}

/// Structured fields read from an identity document.
///
/// Emitted once per capture attempt. The only way to change it afterwards is
/// [`ExtractedIdData::from_manual`], which replaces it wholesale.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedIdData {
    pub document_type: DocumentType,
    pub document_number: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
    pub nationality: String,
    pub sex: Sex,
    /// Source document image, kept as the face-match reference.
    #[serde(skip)]
    pub face_image: Option<DynamicImage>,
    pub confidence: f32,
    pub raw_text: String,
    pub provenance: BTreeMap<IdField, Strategy>,
}

impl ExtractedIdData {
    /// True when no strategy produced a document number and the caller has to
    /// fall back to the manual form.
    pub fn needs_manual_entry(&self) -> bool {
        self.document_number.is_empty()
    }

    pub fn has_names(&self) -> bool {
        !self.first_name.is_empty() && !self.last_name.is_empty()
    }

    /// `None` when the expiration date was not read.
    pub fn is_expired(&self, today: NaiveDate) -> Option<bool> {
        self.expiration_date.map(|exp| exp < today)
    }
}

/// User-provided document fields. Always authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ManualEntry {
    pub document_type: DocumentType,
    pub document_number: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
    pub nationality: String,
    pub sex: Sex,
}

impl ExtractedIdData {
    /// Build the record from a manual correction.
    ///
    /// The previous extraction is discarded except for the document image,
    /// which is still the face reference.
    pub fn from_manual(entry: ManualEntry, face_image: Option<DynamicImage>) -> Self {
        let provenance = [
            IdField::DocumentType,
            IdField::DocumentNumber,
            IdField::FirstName,
            IdField::LastName,
            IdField::DateOfBirth,
            IdField::ExpirationDate,
            IdField::Nationality,
            IdField::Sex,
        ]
        .into_iter()
        .map(|field| (field, Strategy::Manual))
        .collect();

        Self {
            document_type: entry.document_type,
            document_number: entry.document_number.trim().to_uppercase(),
            first_name: entry.first_name.trim().to_string(),
            last_name: entry.last_name.trim().to_string(),
            date_of_birth: entry.date_of_birth,
            expiration_date: entry.expiration_date,
            nationality: entry.nationality.trim().to_uppercase(),
            sex: entry.sex,
            face_image,
            confidence: 1.0,
            raw_text: String::new(),
            provenance,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum DescriptorError {
    #[error("invalid descriptor dimension: {0} (expected 128)")]
    InvalidDim(usize),
    #[error("invalid descriptor value (NaN/Inf)")]
    InvalidValue,
}

/// Identity embedding of one face plus the detector score at capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDescriptor {
    values: Vec<f32>,
    pub detection_score: f32,
}

impl FaceDescriptor {
    pub fn new(values: Vec<f32>, detection_score: f32) -> Result<Self, DescriptorError> {
        if values.len() != DESCRIPTOR_DIM {
            return Err(DescriptorError::InvalidDim(values.len()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DescriptorError::InvalidValue);
        }
        Ok(Self {
            values,
            detection_score,
        })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Euclidean distance to another descriptor.
    pub fn distance(&self, other: &FaceDescriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

/// Face box in pixel coordinates of the analysed image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Five-point facial landmarks in pixel coordinates:
/// left eye, right eye, nose tip, left mouth corner, right mouth corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmarks(pub [(f32, f32); 5]);

impl Landmarks {
    pub fn left_eye(&self) -> (f32, f32) {
        self.0[0]
    }

    pub fn right_eye(&self) -> (f32, f32) {
        self.0[1]
    }

    pub fn nose_tip(&self) -> (f32, f32) {
        self.0[2]
    }
}

/// A detected face before descriptor extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub landmarks: Landmarks,
}

impl DetectedFace {
    pub fn score(&self) -> f32 {
        self.bbox.confidence
    }
}

/// Face-box center and relative width, all in [0,1] of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct FacePosition {
    pub x: f32,
    pub y: f32,
    pub size: f32,
}

/// Mean of the last few [`FacePosition`] samples.
pub type SmoothedFacePosition = FacePosition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LivenessState {
    #[default]
    Ready,
    TurnRight,
    TurnLeft,
    Verifying,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub face_detected: bool,
    pub liveness_verified: bool,
    pub face_match_score: f32,
    pub is_match: bool,
    pub message: String,
}
