//! `idcheck setup`: downloads the ONNX models listed in the model manifest.

use anyhow::{bail, Context, Result};
use idcheck_models::{sha256_file_hex, Manifest, ModelFile, MANIFEST_FILE};
use std::fs;
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// File writer that hashes everything written through it and prints
/// progress in 10% steps when the total size is known.
struct HashingWriter {
    file: fs::File,
    hasher: Sha256,
    written: u64,
    expected_len: Option<u64>,
    last_decile: u64,
}

impl HashingWriter {
    fn new(file: fs::File, expected_len: Option<u64>) -> Self {
        Self {
            file,
            hasher: Sha256::new(),
            written: 0,
            expected_len: expected_len.filter(|&len| len > 0),
            last_decile: 0,
        }
    }

    fn finish(mut self) -> io::Result<(String, u64)> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok((format!("{:x}", self.hasher.finalize()), self.written))
    }
}

impl Write for HashingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        if let Some(len) = self.expected_len {
            let decile = (self.written * 10) / len;
            if decile > self.last_decile {
                print!("  {}%\r", (decile * 10).min(100));
                io::stdout().flush().ok();
                self.last_decile = decile;
            }
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Stream `body` into `<dest>.part`, then move it into place only when its
/// digest matches the manifest entry. Returns the number of bytes written.
fn install_from_reader(
    model: &ModelFile,
    mut body: impl Read,
    content_length: Option<u64>,
    dest: &Path,
) -> Result<u64> {
    let tmp_path = part_path(dest);
    let file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;
    let mut writer = HashingWriter::new(file, content_length);

    let streamed = io::copy(&mut body, &mut writer).and_then(|_| writer.finish());
    let (digest, total) = match streamed {
        Ok(done) => done,
        Err(e) => {
            fs::remove_file(&tmp_path).ok();
            return Err(e).with_context(|| format!("failed to write {}", tmp_path.display()));
        }
    };

    if !digest.eq_ignore_ascii_case(&model.sha256) {
        fs::remove_file(&tmp_path).ok();
        bail!(
            "checksum mismatch for {} (role {:?}):\n  expected: {}\n  got:      {}",
            model.name,
            model.role,
            model.sha256,
            digest
        );
    }

    fs::rename(&tmp_path, dest).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            tmp_path.display(),
            dest.display()
        )
    })?;
    Ok(total)
}

/// Fetch one manifest entry over HTTP and install it.
fn download_model(model: &ModelFile, dest: &Path) -> Result<()> {
    match &model.size_display {
        Some(size) => println!("  {:?} model {} ({size})", model.role, model.name),
        None => println!("  {:?} model {}", model.role, model.name),
    }

    let resp = ureq::get(&model.url)
        .call()
        .with_context(|| format!("failed to download {}", model.url))?;
    let content_length = resp
        .headers()
        .get("Content-Length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let total = install_from_reader(model, resp.into_body().into_reader(), content_length, dest)?;
    println!("  {} verified", model.name);
    tracing::info!(model = %model.name, role = ?model.role, bytes = total, "model installed");
    Ok(())
}

/// True when `dest` already holds the expected file.
fn already_present(model: &ModelFile, dest: &Path) -> bool {
    if !dest.exists() {
        return false;
    }
    match sha256_file_hex(dest) {
        Ok(digest) if digest.eq_ignore_ascii_case(&model.sha256) => {
            println!("  {} already present (checksum ok)", model.name);
            true
        }
        Ok(_) => {
            println!("  {} exists but checksum differs, re-downloading", model.name);
            false
        }
        Err(_) => {
            println!("  {} exists but unreadable, re-downloading", model.name);
            false
        }
    }
}

/// Run the setup command: download and verify the models in the manifest.
///
/// A manifest given with `--manifest` is copied into the model directory so
/// later runs find it next to the models.
pub fn run(model_dir: PathBuf, manifest_path: Option<PathBuf>) -> Result<()> {
    println!("Model directory: {}", model_dir.display());

    fs::create_dir_all(&model_dir)
        .with_context(|| format!("failed to create directory {}", model_dir.display()))?;

    let installed_manifest = model_dir.join(MANIFEST_FILE);
    let source = manifest_path.unwrap_or_else(|| installed_manifest.clone());
    let manifest = Manifest::load(&source)
        .with_context(|| format!("cannot use model manifest {}", source.display()))?;

    let mut downloaded = 0;
    let mut skipped = 0;

    for model in &manifest.models {
        let dest = model_dir.join(&model.name);
        if already_present(model, &dest) {
            skipped += 1;
            continue;
        }
        download_model(model, &dest)?;
        downloaded += 1;
    }

    if source != installed_manifest {
        fs::copy(&source, &installed_manifest).with_context(|| {
            format!(
                "failed to copy manifest to {}",
                installed_manifest.display()
            )
        })?;
    }

    println!();
    if downloaded > 0 {
        println!("Setup complete: {downloaded} model(s) downloaded, {skipped} already present.");
    } else {
        println!("All models already present. Nothing to download.");
    }

    Ok(())
}
