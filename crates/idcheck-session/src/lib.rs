pub mod attempt;
pub mod camera;
pub mod config;
pub mod engine;
pub mod session;

pub use attempt::{AttemptToken, Attempts};
pub use camera::{ActiveCapture, CaptureError, FrameSource, ImageSequence};
pub use config::{Config, SessionConfig};
pub use engine::{spawn_session, SessionHandle};
pub use session::{CaptureSession, SessionError, SessionSnapshot, TickOutcome};
