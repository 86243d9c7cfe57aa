//! `idcheck verify`: run the head-turn challenge over a recorded frame
//! sequence and match the selfie against the document photo.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Serialize;

use idcheck_core::embedding::OnnxFaceModel;
use idcheck_core::{
    Checklist, ExtractedIdData, FaceEmbeddingService, LivenessState, VerificationResult,
};
use idcheck_models::{Manifest, ModelRole};
use idcheck_session::{
    ActiveCapture, CaptureSession, Config, ImageSequence, SessionSnapshot, TickOutcome,
};

use crate::document::{self, Source};

/// Load and integrity-check the face models named in the manifest.
pub fn load_embedding(config: &Config) -> Result<FaceEmbeddingService> {
    let manifest_path = config.manifest_path();
    let manifest = Manifest::load(&manifest_path)
        .with_context(|| format!("no usable model manifest at {}", manifest_path.display()))?;
    idcheck_models::verify_models_dir(&manifest, &config.model_dir)
        .context("model check failed, run `idcheck setup`")?;

    let detector = manifest.path_for(ModelRole::Detector, &config.model_dir)?;
    let embedder = manifest.path_for(ModelRole::Embedder, &config.model_dir)?;
    let model = OnnxFaceModel::load(&detector, &embedder)?;
    tracing::info!(
        detector = %detector.display(),
        embedder = %embedder.display(),
        "face models loaded"
    );
    Ok(FaceEmbeddingService::new(Box::new(model)))
}

/// Replay `frames` through `session`, stamping frame `i` at `i * spacing`.
/// Stops once the challenge is verified.
pub fn replay(
    session: &mut CaptureSession,
    capture: &mut ActiveCapture,
    spacing: Duration,
) -> Result<SessionSnapshot> {
    let t0 = Instant::now();
    let mut index: u32 = 0;
    while let Some(frame) = capture.next_frame()? {
        let now = t0 + spacing * index;
        index += 1;
        if let TickOutcome::Processed {
            event,
            verification,
            ..
        } = session.tick(now, &frame)
        {
            tracing::debug!(frame = index, ?event, "frame processed");
            if let Some(result) = verification {
                tracing::info!(
                    frame = index,
                    is_match = result.is_match,
                    score = result.face_match_score,
                    "selfie verified"
                );
            }
        }
        if session.liveness_state() == LivenessState::Done {
            break;
        }
    }
    Ok(session.snapshot(false))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyReport<'a> {
    document: &'a ExtractedIdData,
    result: &'a VerificationResult,
    challenge_completed: bool,
    checklist: &'a Checklist,
    passed: usize,
    fully_verified: bool,
    may_proceed: bool,
}

pub struct VerifyArgs<'a> {
    pub document: &'a Path,
    pub source: Source,
    pub frames: &'a Path,
    pub manual: Option<&'a Path>,
    pub fps: u32,
    pub accept_partial: bool,
}

/// Run verification and print the report. Returns whether the user may proceed.
pub async fn run(config: &Config, args: VerifyArgs<'_>, today: NaiveDate) -> Result<bool> {
    if args.fps == 0 {
        bail!("--fps must be at least 1");
    }
    let image = document::load_document(args.document, args.source)?;
    let data = document::read_document(config, image, args.manual, today).await?;
    if data.needs_manual_entry() {
        tracing::warn!("document number not read, pass --manual with the document fields");
    }

    let mut session = CaptureSession::new(config.session, load_embedding(config)?);
    let token = session.begin_attempt();
    let reference = session.attach_document(&token, data)?;
    if !reference {
        tracing::warn!("no face found on the document, matching will rely on liveness only");
    }

    let mut capture = ActiveCapture::acquire(Box::new(ImageSequence::new(args.frames)))
        .map_err(|(_, e)| e)
        .with_context(|| format!("cannot open frames in {}", args.frames.display()))?;
    let snapshot = replay(
        &mut session,
        &mut capture,
        Duration::from_secs(1) / args.fps,
    )?;
    capture.release();

    let challenge_completed = snapshot.liveness == LivenessState::Done;
    let result = session
        .result()
        .cloned()
        .unwrap_or_else(VerificationResult::no_face);
    let document = session
        .document()
        .context("document missing from session")?;
    let checklist = Checklist::evaluate(document, &result, today);
    let may_proceed = checklist.may_proceed(args.accept_partial);

    let report = VerifyReport {
        document,
        result: &result,
        challenge_completed,
        checklist: &checklist,
        passed: checklist.passed_count(),
        fully_verified: checklist.fully_verified(),
        may_proceed,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(may_proceed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use idcheck_core::embedding::{DetectOptions, FaceInference, InferenceError};
    use idcheck_core::DetectedFace;
    use idcheck_session::SessionConfig;
    use image::{DynamicImage, RgbImage};

    struct NoFaces;

    impl FaceInference for NoFaces {
        fn detect(
            &mut self,
            _image: &DynamicImage,
            _options: &DetectOptions,
        ) -> Result<Vec<DetectedFace>, InferenceError> {
            Ok(Vec::new())
        }

        fn describe(
            &mut self,
            _image: &DynamicImage,
            _face: &DetectedFace,
        ) -> Result<Vec<f32>, InferenceError> {
            Err(InferenceError::InferenceFailed("no face".into()))
        }
    }

    #[test]
    fn replay_stamps_frames_and_stops_at_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            RgbImage::new(64, 48)
                .save(dir.path().join(format!("{i:03}.png")))
                .unwrap();
        }
        let mut session = CaptureSession::new(
            SessionConfig::default(),
            FaceEmbeddingService::new(Box::new(NoFaces)),
        );
        let mut capture =
            ActiveCapture::acquire(Box::new(ImageSequence::new(dir.path()))).ok().unwrap();

        // 50 ms spacing against the 100 ms detection throttle: every other frame runs
        let snapshot = replay(&mut session, &mut capture, Duration::from_millis(50)).unwrap();
        assert_eq!(snapshot.frames, 2);
        assert_eq!(snapshot.liveness, LivenessState::Ready);
        assert!(session.result().is_none());
    }
}
