//! `idcheck extract`: normalize a document image and read its fields.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use image::DynamicImage;
use serde::Serialize;

use idcheck_core::extract::{HttpVisionClient, TesseractCli};
use idcheck_core::normalize::{self, GuideRect};
use idcheck_core::{ExtractedIdData, ExtractorConfig, FieldExtractor, ManualEntry};
use idcheck_session::Config;

/// How the document image was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// A camera frame framed by the on-screen guide.
    Capture,
    /// A file picked by the user.
    Upload,
}

/// Read and normalize a document image from disk.
pub fn load_document(path: &Path, source: Source) -> Result<DynamicImage> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let image = normalize::load_image(&bytes)
        .with_context(|| format!("unusable document image {}", path.display()))?;
    let normalized = match source {
        Source::Capture => normalize::crop_to_guide(&image, &GuideRect::default(), None)?,
        Source::Upload => normalize::crop_upload(&image)?,
    };
    tracing::info!(
        width = normalized.width(),
        height = normalized.height(),
        ?source,
        "document normalized"
    );
    Ok(normalized)
}

/// Build the extraction chain from configuration: remote service when an
/// endpoint is set, then local OCR.
pub fn build_extractor(config: &Config) -> Result<FieldExtractor> {
    let ocr = TesseractCli {
        binary: config.tesseract_binary.clone(),
        languages: config.ocr_languages.clone(),
    };
    let mut extractor = FieldExtractor::new(ExtractorConfig {
        default_nationality: config.default_nationality.clone(),
    })
    .with_ocr(Arc::new(ocr));

    if let Some(endpoint) = &config.remote_endpoint {
        let client = HttpVisionClient::new(
            endpoint.clone(),
            config.remote_api_key.clone(),
            config.remote_model.clone(),
            config.remote_timeout(),
        )
        .context("failed to build remote extraction client")?;
        extractor = extractor.with_remote(Arc::new(client));
        tracing::info!(endpoint = %endpoint, "remote extraction enabled");
    }
    Ok(extractor)
}

fn load_manual(path: &Path) -> Result<ManualEntry> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid manual entry {}", path.display()))
}

/// Produce the document record: manual fields when given, extraction otherwise.
pub async fn read_document(
    config: &Config,
    image: DynamicImage,
    manual: Option<&Path>,
    today: NaiveDate,
) -> Result<ExtractedIdData> {
    if let Some(path) = manual {
        let entry = load_manual(path)?;
        tracing::info!("using manually entered document fields");
        return Ok(ExtractedIdData::from_manual(entry, Some(image)));
    }
    let extractor = build_extractor(config)?;
    Ok(extractor.extract(&image, today).await)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtractReport<'a> {
    document: &'a ExtractedIdData,
    needs_manual_entry: bool,
    expired: Option<bool>,
}

pub async fn run(
    config: &Config,
    path: &Path,
    source: Source,
    manual: Option<&Path>,
    today: NaiveDate,
) -> Result<()> {
    let image = load_document(path, source)?;
    let document = read_document(config, image, manual, today).await?;
    let report = ExtractReport {
        document: &document,
        needs_manual_entry: document.needs_manual_entry(),
        expired: document.is_expired(today),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn upload_is_trimmed_and_capture_follows_guide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("card.png");
        RgbImage::new(1586, 1000).save(&path).unwrap();

        let upload = load_document(&path, Source::Upload).unwrap();
        assert!(upload.width() < 1586 && upload.height() < 1000);

        let capture = load_document(&path, Source::Capture).unwrap();
        assert!(capture.width() < 1586 && capture.height() < 1000);
    }

    #[test]
    fn unreadable_document_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.png");
        let err = load_document(&path, Source::Upload).unwrap_err();
        assert!(err.to_string().contains("missing.png"));
    }

    #[tokio::test]
    async fn manual_entry_replaces_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manual.json");
        std::fs::write(
            &path,
            r#"{"documentType":"NATIONAL_ID","documentNumber":" 12345678z ","firstName":"Ana",
                "lastName":"Martinez","dateOfBirth":"1990-01-31","expirationDate":null,
                "nationality":"esp","sex":"F"}"#,
        )
        .unwrap();

        let config = Config::from_env();
        let image = DynamicImage::ImageRgb8(RgbImage::new(10, 10));
        let today = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let data = read_document(&config, image, Some(&path), today)
            .await
            .unwrap();
        assert_eq!(data.document_number, "12345678Z");
        assert_eq!(data.nationality, "ESP");
        assert_eq!(data.confidence, 1.0);
        assert!(data.face_image.is_some());
    }
}
