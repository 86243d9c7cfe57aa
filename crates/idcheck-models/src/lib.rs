//! Model manifest and on-disk integrity checks.
//!
//! The manifest is a TOML file listing every model the face pipeline needs:
//!
//! ```toml
//! [[model]]
//! role = "detector"
//! name = "face_detector.onnx"
//! url = "https://example.org/face_detector.onnx"
//! sha256 = "<64 hex chars>"
//! size_display = "2 MB"
//! ```

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Manifest file name looked up inside the model directory.
pub const MANIFEST_FILE: &str = "models.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    Detector,
    Embedder,
}

/// Model file descriptor: role, file name, download URL, SHA-256, display size.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelFile {
    pub role: ModelRole,
    pub name: String,
    pub url: String,
    pub sha256: String,
    #[serde(default)]
    pub size_display: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Manifest {
    #[serde(rename = "model")]
    pub models: Vec<ModelFile>,
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("manifest has no {0:?} model")]
    MissingRole(ModelRole),
    #[error("manifest lists {0} twice")]
    Duplicate(String),
    #[error("manifest checksum for {name} is not a SHA-256 hex digest")]
    BadChecksum { name: String },
}

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: String, path: PathBuf },

    #[error("failed to open model file: {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read model file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: String,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

impl Manifest {
    pub fn from_toml_str(raw: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = toml::from_str(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        let mut seen = HashSet::new();
        for model in &self.models {
            if !seen.insert(model.name.as_str()) {
                return Err(ManifestError::Duplicate(model.name.clone()));
            }
            let sha = &model.sha256;
            if sha.len() != 64 || !sha.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ManifestError::BadChecksum {
                    name: model.name.clone(),
                });
            }
        }
        for role in [ModelRole::Detector, ModelRole::Embedder] {
            self.model(role)?;
        }
        Ok(())
    }

    pub fn model(&self, role: ModelRole) -> Result<&ModelFile, ManifestError> {
        self.models
            .iter()
            .find(|m| m.role == role)
            .ok_or(ManifestError::MissingRole(role))
    }

    /// On-disk path of the model serving `role` inside `model_dir`.
    pub fn path_for(&self, role: ModelRole, model_dir: &Path) -> Result<PathBuf, ManifestError> {
        Ok(model_dir.join(&self.model(role)?.name))
    }
}

/// Determine the model directory.
///
/// When running as root (UID 0), defaults to `/var/lib/idcheck/models` (system-wide).
/// Otherwise defaults to `$XDG_DATA_HOME/idcheck/models` (~/.local/share/idcheck/models).
pub fn default_model_dir() -> PathBuf {
    if is_root() {
        PathBuf::from("/var/lib/idcheck/models")
    } else {
        let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            format!("{home}/.local/share")
        });
        PathBuf::from(data_home).join("idcheck/models")
    }
}

fn is_root() -> bool {
    // SAFETY: geteuid is always safe to call.
    unsafe { libc::geteuid() == 0 }
}

/// Compute SHA-256 hex digest of a file.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let mut file = fs::File::open(path).map_err(|source| ModelIntegrityError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|source| ModelIntegrityError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn verify_file_sha256(
    name: &str,
    path: &Path,
    expected_sha256: &str,
) -> Result<(), ModelIntegrityError> {
    if !path.exists() {
        return Err(ModelIntegrityError::MissingModel {
            name: name.to_string(),
            path: path.to_path_buf(),
        });
    }

    let digest = sha256_file_hex(path)?;
    if !digest.eq_ignore_ascii_case(expected_sha256) {
        return Err(ModelIntegrityError::ChecksumMismatch {
            name: name.to_string(),
            path: path.to_path_buf(),
            expected: expected_sha256.to_string(),
            got: digest,
        });
    }

    Ok(())
}

pub fn verify_models_dir(manifest: &Manifest, model_dir: &Path) -> Result<(), ModelIntegrityError> {
    for model in &manifest.models {
        let path = model_dir.join(&model.name);
        verify_file_sha256(&model.name, &path, &model.sha256)?;
    }

    Ok(())
}
