//! Session thread for live cameras.
//!
//! [`spawn_session`] moves a [`CaptureSession`] and its frame source onto a
//! dedicated thread that polls frames in real time; applications drive it
//! through the cloneable [`SessionHandle`]. Offline replays with synthetic
//! timestamps call [`CaptureSession::tick`] directly instead.

use std::time::Instant;

use chrono::NaiveDate;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};

use idcheck_core::{Checklist, ExtractedIdData, FaceEmbeddingService, LivenessState, ManualEntry};

use crate::attempt::AttemptToken;
use crate::camera::{ActiveCapture, CaptureError, FrameSource};
use crate::config::SessionConfig;
use crate::session::{CaptureSession, SessionError, SessionSnapshot, TickOutcome};

/// Messages sent from handles to the session thread.
enum SessionRequest {
    BeginAttempt {
        reply: oneshot::Sender<AttemptToken>,
    },
    AttachDocument {
        token: AttemptToken,
        data: Box<ExtractedIdData>,
        reply: oneshot::Sender<Result<bool, SessionError>>,
    },
    CorrectDocument {
        token: AttemptToken,
        entry: Box<ManualEntry>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    StartCapture {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    StopCapture {
        reply: oneshot::Sender<()>,
    },
    StartChallenge {
        reply: oneshot::Sender<bool>,
    },
    Checklist {
        today: NaiveDate,
        reply: oneshot::Sender<Option<Checklist>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the session thread.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionRequest>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionRequest,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)
    }

    /// Start a new attempt. Results tied to earlier tokens are discarded.
    pub async fn begin_attempt(&self) -> Result<AttemptToken, SessionError> {
        self.request(|reply| SessionRequest::BeginAttempt { reply })
            .await
    }

    /// Hand over extracted document data for `token`'s attempt. Returns
    /// whether a reference face was found on the document.
    pub async fn attach_document(
        &self,
        token: AttemptToken,
        data: ExtractedIdData,
    ) -> Result<bool, SessionError> {
        self.request(|reply| SessionRequest::AttachDocument {
            token,
            data: Box::new(data),
            reply,
        })
        .await?
    }

    /// Replace the attached document with user-entered fields. Liveness and
    /// any verification already made are kept.
    pub async fn correct_document(
        &self,
        token: AttemptToken,
        entry: ManualEntry,
    ) -> Result<(), SessionError> {
        self.request(|reply| SessionRequest::CorrectDocument {
            token,
            entry: Box::new(entry),
            reply,
        })
        .await?
    }

    /// Open the frame source and start polling.
    pub async fn start_capture(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionRequest::StartCapture { reply })
            .await?
    }

    /// Stop polling and release the frame source.
    pub async fn stop_capture(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionRequest::StopCapture { reply })
            .await
    }

    /// Begin the head-turn challenge without waiting for auto-start.
    pub async fn start_challenge(&self) -> Result<bool, SessionError> {
        self.request(|reply| SessionRequest::StartChallenge { reply })
            .await
    }

    pub async fn checklist(&self, today: NaiveDate) -> Result<Option<Checklist>, SessionError> {
        self.request(|reply| SessionRequest::Checklist { today, reply })
            .await
    }

    /// Release the frame source and stop the session thread.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionRequest::Shutdown { reply })
            .await
    }

    /// Latest published state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified after every processed frame and request.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }
}

/// Everything owned by the session thread.
struct Worker {
    session: CaptureSession,
    idle: Option<Box<dyn FrameSource>>,
    active: Option<ActiveCapture>,
    published: watch::Sender<SessionSnapshot>,
}

impl Worker {
    fn publish(&self) {
        self.published
            .send_replace(self.session.snapshot(self.active.is_some()));
    }

    fn start_capture(&mut self) -> Result<(), SessionError> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyCapturing);
        }
        let source = self
            .idle
            .take()
            .ok_or_else(|| CaptureError::Unavailable("no frame source".into()))?;
        match ActiveCapture::acquire(source) {
            Ok(capture) => {
                self.session.reset_frame_state();
                self.active = Some(capture);
                Ok(())
            }
            Err((source, e)) => {
                tracing::warn!(error = %e, "failed to open frame source");
                self.idle = Some(source);
                Err(e.into())
            }
        }
    }

    fn stop_capture(&mut self) {
        if let Some(capture) = self.active.take() {
            self.idle = capture.release();
        }
    }

    /// Returns false when the thread should exit.
    fn handle(&mut self, req: SessionRequest) -> bool {
        match req {
            SessionRequest::BeginAttempt { reply } => {
                let _ = reply.send(self.session.begin_attempt());
            }
            SessionRequest::AttachDocument { token, data, reply } => {
                let _ = reply.send(self.session.attach_document(&token, *data));
            }
            SessionRequest::CorrectDocument { token, entry, reply } => {
                let _ = reply.send(self.session.correct_document(&token, *entry));
            }
            SessionRequest::StartCapture { reply } => {
                let _ = reply.send(self.start_capture());
            }
            SessionRequest::StopCapture { reply } => {
                self.stop_capture();
                let _ = reply.send(());
            }
            SessionRequest::StartChallenge { reply } => {
                let _ = reply.send(self.session.start_challenge(Instant::now()));
            }
            SessionRequest::Checklist { today, reply } => {
                let _ = reply.send(self.session.checklist(today));
            }
            SessionRequest::Shutdown { reply } => {
                self.stop_capture();
                self.publish();
                let _ = reply.send(());
                return false;
            }
        }
        self.publish();
        true
    }

    /// Pull and process one frame from the active source.
    fn poll_frame(&mut self) {
        let Some(capture) = self.active.as_mut() else {
            return;
        };
        match capture.next_frame() {
            Ok(Some(frame)) => {
                let outcome = self.session.tick(Instant::now(), &frame);
                if let TickOutcome::Processed {
                    verification: Some(result),
                    ..
                } = &outcome
                {
                    tracing::info!(
                        is_match = result.is_match,
                        score = result.face_match_score,
                        "selfie verified"
                    );
                }
                if self.session.liveness_state() == LivenessState::Done {
                    self.stop_capture();
                }
            }
            Ok(None) => {
                tracing::info!("frame stream ended");
                self.stop_capture();
            }
            Err(e) => {
                tracing::warn!(error = %e, "frame read failed");
                self.stop_capture();
            }
        }
        self.publish();
    }
}

/// Spawn the capture session on a dedicated OS thread.
///
/// The thread blocks on requests while idle. While capturing it drains
/// pending requests between frames, then processes one frame per
/// `poll_interval`. The frame source is closed on stop, on end of stream,
/// once the challenge is verified, and when the last handle goes away.
pub fn spawn_session(
    source: Box<dyn FrameSource>,
    embedding: FaceEmbeddingService,
    config: SessionConfig,
) -> Result<SessionHandle, SessionError> {
    let (tx, mut rx) = mpsc::channel::<SessionRequest>(8);
    let session = CaptureSession::new(config, embedding);
    let (published, snapshot) = watch::channel(session.snapshot(false));
    let poll_interval = config.poll_interval;

    let mut worker = Worker {
        session,
        idle: Some(source),
        active: None,
        published,
    };

    std::thread::Builder::new()
        .name("idcheck-session".into())
        .spawn(move || {
            tracing::info!("session thread started");
            loop {
                let req = if worker.active.is_some() {
                    match rx.try_recv() {
                        Ok(req) => Some(req),
                        Err(TryRecvError::Empty) => None,
                        Err(TryRecvError::Disconnected) => break,
                    }
                } else {
                    match rx.blocking_recv() {
                        Some(req) => Some(req),
                        None => break,
                    }
                };

                match req {
                    Some(req) => {
                        if !worker.handle(req) {
                            break;
                        }
                    }
                    None => {
                        worker.poll_frame();
                        std::thread::sleep(poll_interval);
                    }
                }
            }
            worker.stop_capture();
            tracing::info!("session thread exiting");
        })
        .map_err(SessionError::Spawn)?;

    Ok(SessionHandle { tx, snapshot })
}
