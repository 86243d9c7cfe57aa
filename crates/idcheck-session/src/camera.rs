//! Frame sources and scoped acquisition.

use std::path::{Path, PathBuf};

use image::DynamicImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("frame source is not open")]
    NotOpen,
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode frame {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// A live video feed. `open`/`close` bracket use of the underlying device.
pub trait FrameSource: Send {
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Next frame, or `None` once the stream has ended.
    fn next_frame(&mut self) -> Result<Option<DynamicImage>, CaptureError>;

    /// Release the device. Must be safe to call more than once.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// An open frame source. The source is closed when the guard is dropped or
/// released, whichever happens first.
pub struct ActiveCapture {
    source: Option<Box<dyn FrameSource>>,
}

impl ActiveCapture {
    /// Open `source`. On failure the source is handed back with the error.
    pub fn acquire(
        mut source: Box<dyn FrameSource>,
    ) -> Result<Self, (Box<dyn FrameSource>, CaptureError)> {
        match source.open() {
            Ok(()) => {
                tracing::info!("capture started");
                Ok(Self {
                    source: Some(source),
                })
            }
            Err(e) => {
                source.close();
                Err((source, e))
            }
        }
    }

    pub fn next_frame(&mut self) -> Result<Option<DynamicImage>, CaptureError> {
        match self.source.as_mut() {
            Some(source) => source.next_frame(),
            None => Err(CaptureError::NotOpen),
        }
    }

    /// Close the source and give it back for a later capture.
    pub fn release(mut self) -> Option<Box<dyn FrameSource>> {
        let mut source = self.source.take()?;
        source.close();
        tracing::info!("capture stopped");
        Some(source)
    }
}

impl Drop for ActiveCapture {
    fn drop(&mut self) {
        if let Some(source) = self.source.as_mut() {
            source.close();
            tracing::info!("capture released on drop");
        }
    }
}

fn is_frame_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg" | "bmp"))
        .unwrap_or(false)
}

/// Replays a directory of still frames in file-name order.
pub struct ImageSequence {
    dir: PathBuf,
    frames: Vec<PathBuf>,
    cursor: usize,
    open: bool,
}

impl ImageSequence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            frames: Vec::new(),
            cursor: 0,
            open: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FrameSource for ImageSequence {
    fn open(&mut self) -> Result<(), CaptureError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| CaptureError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut frames = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| CaptureError::Io {
                    path: self.dir.clone(),
                    source,
                })?
                .path();
            if is_frame_file(&path) {
                frames.push(path);
            }
        }
        if frames.is_empty() {
            return Err(CaptureError::Unavailable(format!(
                "no frames in {}",
                self.dir.display()
            )));
        }
        frames.sort();
        tracing::info!(dir = %self.dir.display(), frames = frames.len(), "frame sequence opened");
        self.frames = frames;
        self.cursor = 0;
        self.open = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<DynamicImage>, CaptureError> {
        if !self.open {
            return Err(CaptureError::NotOpen);
        }
        let Some(path) = self.frames.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        image::open(path)
            .map(Some)
            .map_err(|source| CaptureError::Decode {
                path: path.clone(),
                source,
            })
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// In-memory source that reports its open state through shared flags.
    pub struct MemorySource {
        pub frames: VecDeque<DynamicImage>,
        pub open: Arc<AtomicBool>,
        pub opens: Arc<AtomicUsize>,
        pub fail_open: bool,
    }

    impl MemorySource {
        pub fn new(frames: Vec<DynamicImage>) -> Self {
            Self {
                frames: frames.into(),
                open: Arc::new(AtomicBool::new(false)),
                opens: Arc::new(AtomicUsize::new(0)),
                fail_open: false,
            }
        }
    }

    impl FrameSource for MemorySource {
        fn open(&mut self) -> Result<(), CaptureError> {
            if self.fail_open {
                return Err(CaptureError::PermissionDenied);
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Option<DynamicImage>, CaptureError> {
            if !self.open.load(Ordering::SeqCst) {
                return Err(CaptureError::NotOpen);
            }
            Ok(self.frames.pop_front())
        }

        fn close(&mut self) {
            self.open.store(false, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemorySource;
    use super::*;
    use image::RgbImage;
    use std::sync::atomic::Ordering;

    #[test]
    fn guard_closes_on_drop() {
        let source = MemorySource::new(vec![]);
        let open = source.open.clone();
        {
            let _capture = ActiveCapture::acquire(Box::new(source)).ok().unwrap();
            assert!(open.load(Ordering::SeqCst));
        }
        assert!(!open.load(Ordering::SeqCst));
    }

    #[test]
    fn release_returns_closed_source() {
        let source = MemorySource::new(vec![]);
        let capture = ActiveCapture::acquire(Box::new(source)).ok().unwrap();
        let source = capture.release().unwrap();
        assert!(!source.is_open());
    }

    #[test]
    fn failed_open_hands_source_back() {
        let mut source = MemorySource::new(vec![]);
        source.fail_open = true;
        let (source, err) = ActiveCapture::acquire(Box::new(source)).err().unwrap();
        assert!(matches!(err, CaptureError::PermissionDenied));
        assert!(!source.is_open());
    }

    #[test]
    fn sequence_replays_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for (name, width) in [("002.png", 2), ("001.png", 1), ("003.png", 3)] {
            RgbImage::new(width, 1).save(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut seq = ImageSequence::new(dir.path());
        assert!(matches!(seq.next_frame(), Err(CaptureError::NotOpen)));
        seq.open().unwrap();
        assert_eq!(seq.len(), 3);
        let widths: Vec<u32> = std::iter::from_fn(|| seq.next_frame().unwrap())
            .map(|f| f.width())
            .collect();
        assert_eq!(widths, vec![1, 2, 3]);
    }

    #[test]
    fn empty_directory_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = ImageSequence::new(dir.path());
        assert!(matches!(seq.open(), Err(CaptureError::Unavailable(_))));
    }
}
