//! Local OCR backend.

use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use image::{DynamicImage, ImageFormat};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OcrError {
    #[error("failed to start OCR engine {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },
    #[error("OCR engine I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("OCR engine exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("OCR task failed: {0}")]
    Task(String),
}

/// Recognized text, one line per detected text line, and the mean word
/// confidence in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutput {
    pub text: String,
    pub confidence: f32,
}

/// Blocking text recognition. Callers on an async runtime should move this
/// onto a blocking thread.
pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, image: &DynamicImage) -> Result<OcrOutput, OcrError>;
}

/// Tesseract driven through its command-line interface.
#[derive(Debug, Clone)]
pub struct TesseractCli {
    pub binary: PathBuf,
    /// Language packs, `+`-joined as tesseract expects (`spa+eng`).
    pub languages: String,
}

impl Default for TesseractCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tesseract"),
            languages: "spa+eng".to_string(),
        }
    }
}

impl TextRecognizer for TesseractCli {
    fn recognize(&self, image: &DynamicImage) -> Result<OcrOutput, OcrError> {
        let mut png = Cursor::new(Vec::new());
        image.write_to(&mut png, ImageFormat::Png)?;

        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout", "-l", &self.languages, "tsv"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| OcrError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(png.get_ref())?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(OcrError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let parsed = parse_tsv(&String::from_utf8_lossy(&output.stdout));
        tracing::debug!(
            lines = parsed.text.lines().count(),
            confidence = parsed.confidence,
            "tesseract finished"
        );
        Ok(parsed)
    }
}

/// Rebuild lines from tesseract's TSV output.
///
/// Columns: level, page, block, par, line, word, left, top, width, height,
/// conf, text. Only word rows (non-negative confidence, non-empty text)
/// count.
pub fn parse_tsv(tsv: &str) -> OcrOutput {
    let mut lines: Vec<((u32, u32, u32, u32), Vec<String>)> = Vec::new();
    let mut conf_sum = 0.0f32;
    let mut words = 0usize;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 {
            continue;
        }
        let word = cols[11].trim();
        let conf: f32 = match cols[10].trim().parse() {
            Ok(c) if c >= 0.0 => c,
            _ => continue,
        };
        if word.is_empty() {
            continue;
        }
        let key = (
            cols[1].parse().unwrap_or(0),
            cols[2].parse().unwrap_or(0),
            cols[3].parse().unwrap_or(0),
            cols[4].parse().unwrap_or(0),
        );
        match lines.last_mut() {
            Some((k, ws)) if *k == key => ws.push(word.to_string()),
            _ => lines.push((key, vec![word.to_string()])),
        }
        conf_sum += conf;
        words += 1;
    }

    let text = lines
        .into_iter()
        .map(|(_, ws)| ws.join(" "))
        .collect::<Vec<_>>()
        .join("\n");
    let confidence = if words == 0 {
        0.0
    } else {
        (conf_sum / words as f32 / 100.0).clamp(0.0, 1.0)
    };
    OcrOutput { text, confidence }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    fn row(block: u32, line: u32, word: u32, conf: &str, text: &str) -> String {
        format!("5\t1\t{block}\t1\t{line}\t{word}\t0\t0\t10\t10\t{conf}\t{text}")
    }

    #[test]
    fn groups_words_into_lines() {
        let tsv = [
            HEADER.to_string(),
            "4\t1\t1\t1\t1\t0\t0\t0\t100\t10\t-1\t".to_string(),
            row(1, 1, 1, "90", "APELLIDOS"),
            row(1, 2, 1, "80", "MARTÍNEZ"),
            row(1, 2, 2, "70", "GARCÍA"),
            row(2, 1, 1, "60", "12345678Z"),
        ]
        .join("\n");
        let out = parse_tsv(&tsv);
        assert_eq!(out.text, "APELLIDOS\nMARTÍNEZ GARCÍA\n12345678Z");
        assert!((out.confidence - 0.75).abs() < 1e-6);
    }

    #[test]
    fn empty_output_has_zero_confidence() {
        let out = parse_tsv(HEADER);
        assert_eq!(out.text, "");
        assert_eq!(out.confidence, 0.0);
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let ocr = TesseractCli {
            binary: PathBuf::from("/nonexistent/tesseract-idcheck"),
            ..Default::default()
        };
        let image = DynamicImage::ImageLuma8(image::GrayImage::new(4, 4));
        assert!(matches!(ocr.recognize(&image), Err(OcrError::Spawn { .. })));
    }
}
