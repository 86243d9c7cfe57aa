//! Document field extraction.
//!
//! Strategies run strictly in priority order: remote vision model, then local
//! OCR parsed by layout rules, then the MRZ parser over the same OCR text.
//! Each contribution is folded into the accumulated result with fill-gaps
//! semantics, so a lower-priority strategy never overwrites a field a higher
//! one already produced. A manual entry replaces the lot (see
//! [`ExtractedIdData::from_manual`]).

pub mod mrz;
pub mod ocr;
pub mod remote;
pub mod rules;
pub mod text;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::normalize::preprocess_for_ocr;
use crate::types::{DocumentType, ExtractedIdData, IdField, Sex, Strategy};

pub use ocr::{OcrError, OcrOutput, TesseractCli, TextRecognizer};
pub use remote::{HttpVisionClient, RemoteError, VisionFields, VisionService};

/// Remote service confidence tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

impl ConfidenceTier {
    pub fn base(self) -> f32 {
        match self {
            ConfidenceTier::High => 0.9,
            ConfidenceTier::Medium => 0.7,
            ConfidenceTier::Low => 0.5,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Some(ConfidenceTier::High),
            "medium" => Some(ConfidenceTier::Medium),
            "low" => Some(ConfidenceTier::Low),
            _ => None,
        }
    }
}

const MISSING_DOCUMENT_NUMBER: f32 = 0.5;
const MISSING_NAME: f32 = 0.8;

/// Scale a strategy's base confidence down for each missing required field.
pub fn score_confidence(base: f32, data: &PartialIdData) -> f32 {
    let mut confidence = base.clamp(0.0, 1.0);
    if data.document_number.is_none() {
        confidence *= MISSING_DOCUMENT_NUMBER;
    }
    if data.first_name.is_none() {
        confidence *= MISSING_NAME;
    }
    if data.last_name.is_none() {
        confidence *= MISSING_NAME;
    }
    confidence
}

/// One strategy's view of the document; every field optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialIdData {
    pub document_type: Option<DocumentType>,
    pub document_number: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
    pub nationality: Option<String>,
    pub sex: Option<Sex>,
}

fn fill<T>(
    slot: &mut Option<T>,
    value: Option<T>,
    field: IdField,
    strategy: Strategy,
    provenance: &mut BTreeMap<IdField, Strategy>,
) -> bool {
    match (slot.is_none(), value) {
        (true, Some(v)) => {
            *slot = Some(v);
            provenance.insert(field, strategy);
            true
        }
        _ => false,
    }
}

impl PartialIdData {
    /// Copy fields from `other` into empty slots only. Returns the fields
    /// that were filled.
    pub fn fill_gaps(
        &mut self,
        other: PartialIdData,
        strategy: Strategy,
        provenance: &mut BTreeMap<IdField, Strategy>,
    ) -> Vec<IdField> {
        let mut filled = Vec::new();
        let mut record = |done: bool, field: IdField| {
            if done {
                filled.push(field);
            }
        };
        record(
            fill(&mut self.document_type, other.document_type, IdField::DocumentType, strategy, provenance),
            IdField::DocumentType,
        );
        record(
            fill(&mut self.document_number, other.document_number, IdField::DocumentNumber, strategy, provenance),
            IdField::DocumentNumber,
        );
        record(
            fill(&mut self.first_name, other.first_name, IdField::FirstName, strategy, provenance),
            IdField::FirstName,
        );
        record(
            fill(&mut self.last_name, other.last_name, IdField::LastName, strategy, provenance),
            IdField::LastName,
        );
        record(
            fill(&mut self.date_of_birth, other.date_of_birth, IdField::DateOfBirth, strategy, provenance),
            IdField::DateOfBirth,
        );
        record(
            fill(&mut self.expiration_date, other.expiration_date, IdField::ExpirationDate, strategy, provenance),
            IdField::ExpirationDate,
        );
        record(
            fill(&mut self.nationality, other.nationality, IdField::Nationality, strategy, provenance),
            IdField::Nationality,
        );
        record(
            fill(&mut self.sex, other.sex, IdField::Sex, strategy, provenance),
            IdField::Sex,
        );
        filled
    }
}

/// Output of a single strategy.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub strategy: Strategy,
    pub data: PartialIdData,
    /// Confidence this strategy warrants before missing-field penalties.
    pub base_confidence: f32,
    pub raw_text: String,
}

/// Fold state for the fallback chain.
#[derive(Debug, Default)]
struct Accumulator {
    data: PartialIdData,
    provenance: BTreeMap<IdField, Strategy>,
    /// Base confidence of whichever strategy supplied the document number.
    primary_base: Option<f32>,
    raw_text: Vec<String>,
}

impl Accumulator {
    fn absorb(&mut self, contribution: Contribution) {
        let Contribution {
            strategy,
            data,
            base_confidence,
            raw_text,
        } = contribution;
        let filled = self.data.fill_gaps(data, strategy, &mut self.provenance);
        if filled.contains(&IdField::DocumentNumber) {
            self.primary_base = Some(base_confidence);
        }
        tracing::debug!(?strategy, ?filled, "extraction: merged contribution");
        if !raw_text.is_empty() {
            self.raw_text.push(raw_text);
        }
    }

    fn has_document_number(&self) -> bool {
        self.data.document_number.is_some()
    }

    fn finish(self, image: &DynamicImage, config: &ExtractorConfig) -> ExtractedIdData {
        let confidence = match self.primary_base {
            Some(base) if self.has_document_number() => score_confidence(base, &self.data),
            _ => 0.0,
        };
        let data = self.data;
        let document_type = data.document_type.unwrap_or_default();
        let nationality = data.nationality.unwrap_or_else(|| {
            if document_type == DocumentType::NationalId {
                config.default_nationality.clone()
            } else {
                String::new()
            }
        });

        ExtractedIdData {
            document_type,
            document_number: data.document_number.unwrap_or_default(),
            first_name: data.first_name.unwrap_or_default(),
            last_name: data.last_name.unwrap_or_default(),
            date_of_birth: data.date_of_birth,
            expiration_date: data.expiration_date,
            nationality,
            sex: data.sex.unwrap_or_default(),
            face_image: Some(image.clone()),
            confidence,
            raw_text: self.raw_text.join("\n"),
            provenance: self.provenance,
        }
    }
}

/// Local OCR confidence never counts for more than the remote "medium" tier.
const LOCAL_OCR_MAX_BASE: f32 = 0.7;

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Nationality assumed for national IDs that don't print one we can read.
    pub default_nationality: String,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            default_nationality: "ESP".to_string(),
        }
    }
}

/// Runs the extraction fallback chain.
#[derive(Clone, Default)]
pub struct FieldExtractor {
    remote: Option<Arc<dyn VisionService>>,
    ocr: Option<Arc<dyn TextRecognizer>>,
    config: ExtractorConfig,
}

impl FieldExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self {
            remote: None,
            ocr: None,
            config,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn VisionService>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn TextRecognizer>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    /// Extract fields from a normalized document image.
    ///
    /// Never fails: strategy errors fall through to the next strategy, and
    /// total failure comes back with `confidence == 0` and an empty document
    /// number for the caller to route to manual entry.
    pub async fn extract(&self, image: &DynamicImage, today: NaiveDate) -> ExtractedIdData {
        let mut acc = Accumulator::default();

        if let Some(remote) = &self.remote {
            if let Some(contribution) = run_remote(remote.as_ref(), image).await {
                acc.absorb(contribution);
            }
        }

        if !acc.has_document_number() {
            if let Some(ocr) = &self.ocr {
                for contribution in run_local(Arc::clone(ocr), image, today).await {
                    acc.absorb(contribution);
                }
            }
        }

        let result = acc.finish(image, &self.config);
        if result.needs_manual_entry() {
            tracing::warn!("extraction: no document number from any strategy, manual entry needed");
        } else {
            tracing::info!(
                document_type = ?result.document_type,
                confidence = result.confidence,
                provenance = ?result.provenance,
                "extraction complete"
            );
        }
        result
    }
}

async fn run_remote(remote: &dyn VisionService, image: &DynamicImage) -> Option<Contribution> {
    let jpeg = match remote::encode_jpeg(image) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "remote extraction: image encoding failed");
            return None;
        }
    };
    match remote.extract_fields(&jpeg).await {
        Ok(fields) => {
            let raw_text = serde_json::to_string(&fields).unwrap_or_default();
            let (data, tier) = fields.into_partial();
            Some(Contribution {
                strategy: Strategy::Remote,
                data,
                base_confidence: tier.base(),
                raw_text,
            })
        }
        Err(e) => {
            tracing::warn!(error = %e, "remote extraction failed, falling back to local OCR");
            None
        }
    }
}

async fn recognize_blocking(
    ocr: Arc<dyn TextRecognizer>,
    image: DynamicImage,
) -> Result<OcrOutput, OcrError> {
    tokio::task::spawn_blocking(move || ocr.recognize(&image))
        .await
        .map_err(|e| OcrError::Task(e.to_string()))?
}

fn yields_document_number(output: &OcrOutput, today: NaiveDate) -> bool {
    rules::parse(&output.text, today).document_number.is_some()
        || mrz::parse(&output.text, today).document_number.is_some()
}

/// Local OCR, preprocessed image first, raw image only if that didn't
/// already find a document number. The run with higher recognition
/// confidence wins.
async fn run_local(
    ocr: Arc<dyn TextRecognizer>,
    image: &DynamicImage,
    today: NaiveDate,
) -> Vec<Contribution> {
    let preprocessed = recognize_blocking(Arc::clone(&ocr), preprocess_for_ocr(image)).await;
    let mut best = match preprocessed {
        Ok(output) => Some(output),
        Err(e) => {
            tracing::warn!(error = %e, "local OCR on preprocessed image failed");
            None
        }
    };

    if !best.as_ref().is_some_and(|o| yields_document_number(o, today)) {
        match recognize_blocking(ocr, image.clone()).await {
            Ok(raw) => {
                tracing::debug!(
                    preprocessed = best.as_ref().map(|o| o.confidence),
                    raw = raw.confidence,
                    "local OCR: second pass on raw image"
                );
                if best.as_ref().map_or(true, |b| raw.confidence > b.confidence) {
                    best = Some(raw);
                }
            }
            Err(e) => tracing::warn!(error = %e, "local OCR on raw image failed"),
        }
    }

    let Some(output) = best else {
        return Vec::new();
    };
    contributions_from_text(&output, today)
}

/// Rule-based then MRZ parsing of one OCR output. The MRZ reading is no
/// more trustworthy than the recognition run it came from.
pub fn contributions_from_text(output: &OcrOutput, today: NaiveDate) -> Vec<Contribution> {
    vec![
        Contribution {
            strategy: Strategy::LocalOcr,
            data: rules::parse(&output.text, today),
            base_confidence: output.confidence.min(LOCAL_OCR_MAX_BASE),
            raw_text: output.text.clone(),
        },
        Contribution {
            strategy: Strategy::Mrz,
            data: mrz::parse(&output.text, today),
            base_confidence: output.confidence.min(ConfidenceTier::Low.base()),
            raw_text: String::new(),
        },
    ]
}
