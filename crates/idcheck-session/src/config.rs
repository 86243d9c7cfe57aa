use std::path::PathBuf;
use std::time::Duration;

use idcheck_core::{LivenessConfig, MatchPolicy, TrackerConfig};

/// Per-frame behaviour of a capture session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    pub tracker: TrackerConfig,
    pub liveness: LivenessConfig,
    pub policy: MatchPolicy,
    /// Start the head-turn challenge as soon as the tracker reports ready.
    pub auto_start: bool,
    /// Pause between frame polls on the session thread.
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            liveness: LivenessConfig::default(),
            policy: MatchPolicy::default(),
            auto_start: true,
            poll_interval: Duration::from_millis(33),
        }
    }
}

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the ONNX models and their manifest.
    pub model_dir: PathBuf,
    /// Remote extraction endpoint. Remote extraction is skipped when unset.
    pub remote_endpoint: Option<String>,
    /// Bearer token for the remote endpoint.
    pub remote_api_key: Option<String>,
    /// Model name sent with each remote request.
    pub remote_model: String,
    /// Timeout in seconds for one remote extraction call.
    pub remote_timeout_secs: u64,
    /// Path or name of the tesseract binary.
    pub tesseract_binary: PathBuf,
    /// Tesseract language packs, `+`-joined.
    pub ocr_languages: String,
    /// Nationality assumed for national IDs that don't print one.
    pub default_nationality: String,
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from `IDCHECK_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("IDCHECK_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| idcheck_models::default_model_dir());

        let defaults = SessionConfig::default();
        let tracker = TrackerConfig {
            min_interval: Duration::from_millis(env_u64(
                "IDCHECK_DETECT_INTERVAL_MS",
                defaults.tracker.min_interval.as_millis() as u64,
            )),
            history_len: env_usize("IDCHECK_SMOOTHING_WINDOW", defaults.tracker.history_len).max(1),
            center_tolerance: env_f32(
                "IDCHECK_CENTER_TOLERANCE",
                defaults.tracker.center_tolerance,
            ),
            min_size: env_f32("IDCHECK_MIN_FACE_SIZE", defaults.tracker.min_size),
            max_size: env_f32("IDCHECK_MAX_FACE_SIZE", defaults.tracker.max_size),
            ready_rise: Duration::from_millis(env_u64(
                "IDCHECK_READY_RISE_MS",
                defaults.tracker.ready_rise.as_millis() as u64,
            )),
            ready_fall: Duration::from_millis(env_u64(
                "IDCHECK_READY_FALL_MS",
                defaults.tracker.ready_fall.as_millis() as u64,
            )),
        };
        let liveness = LivenessConfig {
            turn_threshold: env_f32("IDCHECK_TURN_THRESHOLD", defaults.liveness.turn_threshold),
            verify_delay: Duration::from_millis(env_u64(
                "IDCHECK_VERIFY_DELAY_MS",
                defaults.liveness.verify_delay.as_millis() as u64,
            )),
            turn_timeout: Duration::from_secs(env_u64(
                "IDCHECK_TURN_TIMEOUT_SECS",
                defaults.liveness.turn_timeout.as_secs(),
            )),
        };
        let policy = MatchPolicy {
            distance_threshold: env_f32(
                "IDCHECK_MATCH_DISTANCE",
                defaults.policy.distance_threshold,
            ),
        };

        Self {
            model_dir,
            remote_endpoint: std::env::var("IDCHECK_REMOTE_ENDPOINT")
                .ok()
                .filter(|v| !v.is_empty()),
            remote_api_key: std::env::var("IDCHECK_REMOTE_API_KEY")
                .ok()
                .filter(|v| !v.is_empty()),
            remote_model: std::env::var("IDCHECK_REMOTE_MODEL")
                .unwrap_or_else(|_| "document-vision".to_string()),
            remote_timeout_secs: env_u64("IDCHECK_REMOTE_TIMEOUT_SECS", 30),
            tesseract_binary: std::env::var("IDCHECK_TESSERACT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("tesseract")),
            ocr_languages: std::env::var("IDCHECK_OCR_LANGUAGES")
                .unwrap_or_else(|_| "spa+eng".to_string()),
            default_nationality: std::env::var("IDCHECK_DEFAULT_NATIONALITY")
                .unwrap_or_else(|_| "ESP".to_string()),
            session: SessionConfig {
                tracker,
                liveness,
                policy,
                auto_start: std::env::var("IDCHECK_AUTO_START")
                    .map(|v| v != "0")
                    .unwrap_or(true),
                poll_interval: Duration::from_millis(env_u64(
                    "IDCHECK_POLL_INTERVAL_MS",
                    defaults.poll_interval.as_millis() as u64,
                )),
            },
        }
    }

    /// Path to the model manifest.
    pub fn manifest_path(&self) -> PathBuf {
        self.model_dir.join(idcheck_models::MANIFEST_FILE)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_helpers_fall_back_on_garbage() {
        std::env::set_var("IDCHECK_TEST_GARBAGE_F32", "not-a-number");
        assert_eq!(env_f32("IDCHECK_TEST_GARBAGE_F32", 0.6), 0.6);
        std::env::set_var("IDCHECK_TEST_U64", "250");
        assert_eq!(env_u64("IDCHECK_TEST_U64", 100), 250);
        assert_eq!(env_usize("IDCHECK_TEST_UNSET_USIZE", 5), 5);
    }

    #[test]
    fn session_defaults_match_component_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.tracker.min_interval, Duration::from_millis(100));
        assert_eq!(config.tracker.history_len, 5);
        assert_eq!(config.liveness.verify_delay, Duration::from_millis(500));
        assert_eq!(config.policy.distance_threshold, 0.6);
        assert!(config.auto_start);
    }
}
