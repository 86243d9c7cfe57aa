//! Remote vision-language extraction.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::text::{document_number_shape, parse_loose_date, title_case};
use super::{ConfidenceTier, PartialIdData};
use crate::types::{DocumentType, Sex};

/// Instructions sent with every request. The service must answer with a
/// single JSON object using exactly these keys.
pub const SCHEMA_PROMPT: &str = "\
Read the identity document in the image and answer with one JSON object and nothing else.
Keys: documentType (NATIONAL_ID | RESIDENCE_PERMIT | PASSPORT | UNKNOWN), documentNumber,
firstName, lastName, dateOfBirth (YYYY-MM-DD), expirationDate (YYYY-MM-DD),
nationality (ISO 3166 alpha-3), sex (M | F), confidence (high | medium | low),
readableFields (array of the keys you could actually read).
Use null for anything you cannot read. Do not guess.";

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("service returned {status}: {body}")]
    Server { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Remote field-extraction backend.
#[async_trait]
pub trait VisionService: Send + Sync {
    /// Extract fields from a JPEG-encoded document image.
    async fn extract_fields(&self, jpeg: &[u8]) -> Result<VisionFields, RemoteError>;
}

/// Fields as returned by the service, unvalidated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisionFields {
    pub document_type: Option<String>,
    pub document_number: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<String>,
    pub expiration_date: Option<String>,
    pub nationality: Option<String>,
    pub sex: Option<String>,
    pub confidence: Option<String>,
    pub readable_fields: Vec<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("null"))
}

fn parse_document_type(raw: &str) -> DocumentType {
    match raw.trim().to_ascii_uppercase().replace([' ', '-'], "_").as_str() {
        "NATIONAL_ID" => DocumentType::NationalId,
        "RESIDENCE_PERMIT" => DocumentType::ResidencePermit,
        "PASSPORT" => DocumentType::Passport,
        _ => DocumentType::Unknown,
    }
}

/// Validate a document number against the shape its type requires.
fn validate_document_number(raw: &str, declared: DocumentType) -> Option<(String, DocumentType)> {
    let number: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase();
    let shape = document_number_shape(&number);
    match (declared, shape) {
        (DocumentType::NationalId, Some(DocumentType::NationalId))
        | (DocumentType::ResidencePermit, Some(DocumentType::ResidencePermit)) => {
            Some((number, declared))
        }
        (DocumentType::Unknown, Some(inferred)) => Some((number, inferred)),
        (DocumentType::Passport, _) if (6..=9).contains(&number.len()) => {
            Some((number, DocumentType::Passport))
        }
        _ => None,
    }
}

impl VisionFields {
    /// Validate and normalize into a partial record plus the reported tier.
    /// A missing or unknown tier counts as low.
    pub fn into_partial(self) -> (PartialIdData, ConfidenceTier) {
        let tier = self
            .confidence
            .as_deref()
            .and_then(ConfidenceTier::parse)
            .unwrap_or(ConfidenceTier::Low);

        let declared = non_empty(self.document_type)
            .map(|t| parse_document_type(&t))
            .unwrap_or_default();
        let number = non_empty(self.document_number)
            .and_then(|n| validate_document_number(&n, declared));
        if number.is_none() && declared != DocumentType::Unknown {
            tracing::debug!(?declared, "remote: document number missing or malformed");
        }

        let document_type = match (&number, declared) {
            (Some((_, t)), _) => Some(*t),
            (None, DocumentType::Unknown) => None,
            (None, t) => Some(t),
        };

        let partial = PartialIdData {
            document_type,
            document_number: number.map(|(n, _)| n),
            first_name: non_empty(self.first_name).map(|n| title_case(&n)),
            last_name: non_empty(self.last_name).map(|n| title_case(&n)),
            date_of_birth: non_empty(self.date_of_birth).and_then(|d| parse_loose_date(&d)),
            expiration_date: non_empty(self.expiration_date).and_then(|d| parse_loose_date(&d)),
            nationality: non_empty(self.nationality)
                .map(|n| n.to_ascii_uppercase())
                .filter(|n| n.len() == 3 && n.bytes().all(|b| b.is_ascii_uppercase())),
            sex: non_empty(self.sex)
                .map(|s| Sex::from_marker(&s))
                .filter(|s| *s != Sex::Unknown),
        };
        (partial, tier)
    }
}

/// Pull the first JSON object out of a response body. Models like to wrap
/// their answer in prose or code fences.
pub fn parse_payload(body: &str) -> Result<VisionFields, RemoteError> {
    let start = body
        .find('{')
        .ok_or_else(|| RemoteError::Malformed("no JSON object in response".into()))?;
    let end = body
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| RemoteError::Malformed("unterminated JSON object".into()))?;
    let fields: VisionFields = serde_json::from_str(&body[start..=end])
        .map_err(|e| RemoteError::Malformed(e.to_string()))?;
    if fields == VisionFields::default() {
        return Err(RemoteError::Malformed("response carries no fields".into()));
    }
    Ok(fields)
}

/// Encode an image as JPEG for upload.
pub fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>, RemoteError> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.to_rgb8()).write_to(&mut buf, ImageFormat::Jpeg)?;
    Ok(buf.into_inner())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtractionRequest<'a> {
    model: &'a str,
    instructions: &'a str,
    image: ImagePayload,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImagePayload {
    media_type: &'static str,
    data: String,
}

/// HTTP client for a JSON vision-extraction endpoint.
pub struct HttpVisionClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl HttpVisionClient {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        model: String,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }
}

#[async_trait]
impl VisionService for HttpVisionClient {
    async fn extract_fields(&self, jpeg: &[u8]) -> Result<VisionFields, RemoteError> {
        let request = ExtractionRequest {
            model: &self.model,
            instructions: SCHEMA_PROMPT,
            image: ImagePayload {
                media_type: "image/jpeg",
                data: base64::engine::general_purpose::STANDARD.encode(jpeg),
            },
        };

        tracing::info!(endpoint = %self.endpoint, bytes = jpeg.len(), "remote extraction request");
        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder.send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(RemoteError::Server {
                status: status.as_u16(),
                body,
            });
        }

        let fields = parse_payload(&body)?;
        tracing::debug!(
            readable = ?fields.readable_fields,
            tier = ?fields.confidence,
            "remote extraction response"
        );
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn payload_inside_code_fence() {
        let body = "Here you go:\n```json\n{\"documentNumber\": \"12345678Z\", \"confidence\": \"high\"}\n```";
        let fields = parse_payload(body).unwrap();
        assert_eq!(fields.document_number.as_deref(), Some("12345678Z"));
        assert_eq!(fields.confidence.as_deref(), Some("high"));
    }

    #[test]
    fn payload_without_json_is_malformed() {
        assert!(matches!(
            parse_payload("sorry, I can't read that"),
            Err(RemoteError::Malformed(_))
        ));
        assert!(matches!(parse_payload("{}"), Err(RemoteError::Malformed(_))));
        assert!(matches!(
            parse_payload("{\"documentNumber\": 12}"),
            Err(RemoteError::Malformed(_))
        ));
    }

    #[test]
    fn into_partial_normalizes() {
        let fields = VisionFields {
            document_type: Some("national id".into()),
            document_number: Some("12345678-z".into()),
            first_name: Some("ANA MARÍA".into()),
            last_name: Some("null".into()),
            date_of_birth: Some("1980-01-01".into()),
            expiration_date: Some("01/01/2031".into()),
            nationality: Some("esp".into()),
            sex: Some("f".into()),
            confidence: Some("Medium".into()),
            readable_fields: vec![],
        };
        let (partial, tier) = fields.into_partial();
        assert_eq!(tier, ConfidenceTier::Medium);
        assert_eq!(partial.document_type, Some(DocumentType::NationalId));
        assert_eq!(partial.document_number.as_deref(), Some("12345678Z"));
        assert_eq!(partial.first_name.as_deref(), Some("Ana María"));
        assert_eq!(partial.last_name, None);
        assert_eq!(partial.date_of_birth, NaiveDate::from_ymd_opt(1980, 1, 1));
        assert_eq!(partial.expiration_date, NaiveDate::from_ymd_opt(2031, 1, 1));
        assert_eq!(partial.nationality.as_deref(), Some("ESP"));
        assert_eq!(partial.sex, Some(Sex::F));
    }

    #[test]
    fn into_partial_rejects_wrong_shape_for_type() {
        let fields = VisionFields {
            document_type: Some("NATIONAL_ID".into()),
            document_number: Some("X1234567L".into()),
            ..Default::default()
        };
        let (partial, tier) = fields.into_partial();
        assert_eq!(partial.document_number, None);
        assert_eq!(partial.document_type, Some(DocumentType::NationalId));
        assert_eq!(tier, ConfidenceTier::Low);
    }

    #[test]
    fn unknown_type_is_inferred_from_shape() {
        let fields = VisionFields {
            document_number: Some("X1234567L".into()),
            confidence: Some("high".into()),
            ..Default::default()
        };
        let (partial, _) = fields.into_partial();
        assert_eq!(partial.document_type, Some(DocumentType::ResidencePermit));
    }

    #[test]
    fn jpeg_encoding_handles_gray_images() {
        let gray = DynamicImage::ImageLuma8(image::GrayImage::new(8, 8));
        let bytes = encode_jpeg(&gray).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
