pub mod decision;
pub mod embedding;
pub mod extract;
pub mod liveness;
pub mod normalize;
pub mod tracker;
pub mod types;

pub use decision::{Checklist, CheckItem, MatchPolicy};
pub use embedding::{DetectOptions, FaceAnalysis, FaceEmbeddingService, FaceInference, InferenceError};
pub use extract::{ExtractorConfig, FieldExtractor};
pub use liveness::{LivenessConfig, LivenessEvent, LivenessMachine};
pub use normalize::NormalizeError;
pub use tracker::{FaceStatus, FrameTracker, TrackerConfig, TrackerUpdate};
pub use types::{
    BoundingBox, DetectedFace, DocumentType, ExtractedIdData, FaceDescriptor, FacePosition,
    Landmarks, LivenessState, ManualEntry, Sex, SmoothedFacePosition, VerificationResult,
};
