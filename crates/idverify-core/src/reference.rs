//! Reference (ID-card) input: decoding the card photo and polling the reader.

use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

use crate::types::{Image, PixelFormat};

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("failed to read reference image {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode reference image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("reference image too small: {width}x{height}")]
    TooSmall { width: u32, height: u32 },
    #[error("card reader error: {0}")]
    Reader(String),
    #[error("failed to spawn reader thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// The identity under verification, as read from an ID card.
#[derive(Debug, Clone)]
pub struct ReferenceSubject {
    pub display_name: String,
    /// Card photo, BGR24 with a width that is a multiple of 4.
    pub image: Image,
}

impl ReferenceSubject {
    pub fn new(display_name: impl Into<String>, image: Image) -> Self {
        Self {
            display_name: display_name.into(),
            image,
        }
    }

    /// Decode an encoded photo (JPEG, PNG, BMP, ...).
    pub fn decode(display_name: impl Into<String>, bytes: &[u8]) -> Result<Self, ReferenceError> {
        let rgb = image::load_from_memory(bytes)?.to_rgb8();
        Self::from_rgb(display_name, &rgb)
    }

    pub fn load(display_name: impl Into<String>, path: &Path) -> Result<Self, ReferenceError> {
        let bytes = std::fs::read(path).map_err(|source| ReferenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::decode(display_name, &bytes)
    }

    /// Crop the width down to a multiple of 4 and convert to BGR24.
    pub fn from_rgb(display_name: impl Into<String>, rgb: &RgbImage) -> Result<Self, ReferenceError> {
        let width = rgb.width() & !3;
        let height = rgb.height();
        if width == 0 || height == 0 {
            return Err(ReferenceError::TooSmall {
                width: rgb.width(),
                height,
            });
        }

        let mut bgr = Vec::with_capacity(PixelFormat::Bgr24.buffer_len(width, height));
        for y in 0..height {
            for x in 0..width {
                let [r, g, b] = rgb.get_pixel(x, y).0;
                bgr.extend_from_slice(&[b, g, r]);
            }
        }

        Ok(Self::new(
            display_name,
            Image::new(bgr, width, height, PixelFormat::Bgr24),
        ))
    }
}

/// ID-card reader hardware.
pub trait CardReader: Send + 'static {
    /// Try to read a card. `Ok(None)` means no card is present.
    fn read(&mut self) -> Result<Option<ReferenceSubject>, ReferenceError>;
}

/// Background thread polling a [`CardReader`].
///
/// Polling only happens while `gate` is open. The loop closes the gate as
/// soon as a card is read; the verification machine reopens it when the
/// session it started is over.
pub struct ReaderLoop {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ReaderLoop {
    pub fn spawn<C, F>(
        mut reader: C,
        gate: Arc<AtomicBool>,
        poll_interval: Duration,
        deliver: F,
    ) -> Result<Self, ReferenceError>
    where
        C: CardReader,
        F: Fn(ReferenceSubject) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("idverify-reader".into())
            .spawn(move || {
                tracing::info!("card reader thread started");
                while !stop_flag.load(Ordering::SeqCst) {
                    if gate.load(Ordering::SeqCst) {
                        match reader.read() {
                            Ok(Some(subject)) => {
                                gate.store(false, Ordering::SeqCst);
                                tracing::info!(name = %subject.display_name, "card read");
                                deliver(subject);
                            }
                            Ok(None) => {}
                            Err(e) => tracing::warn!(error = %e, "card read failed"),
                        }
                    }
                    std::thread::sleep(poll_interval);
                }
                tracing::info!("card reader thread exiting");
            })
            .map_err(ReferenceError::Spawn)?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stop polling and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("card reader thread panicked");
            }
        }
    }
}

impl Drop for ReaderLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;
    use std::sync::mpsc;

    fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_converts_to_bgr() {
        let subject = ReferenceSubject::decode("A", &png_bytes(8, 2, [10, 20, 30])).unwrap();
        assert_eq!(subject.display_name, "A");
        assert_eq!(subject.image.format, PixelFormat::Bgr24);
        assert_eq!((subject.image.width, subject.image.height), (8, 2));
        assert_eq!(&subject.image.data[..3], &[30, 20, 10]);
        assert!(subject.image.is_complete());
    }

    #[test]
    fn test_width_is_aligned_to_four() {
        let subject = ReferenceSubject::decode("A", &png_bytes(10, 3, [0, 0, 0])).unwrap();
        assert_eq!(subject.image.width, 8);
        assert_eq!(subject.image.data.len(), 8 * 3 * 3);
    }

    #[test]
    fn test_narrow_image_is_rejected() {
        let err = ReferenceSubject::decode("A", &png_bytes(3, 3, [0, 0, 0])).unwrap_err();
        assert!(matches!(err, ReferenceError::TooSmall { width: 3, height: 3 }));
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        let err = ReferenceSubject::decode("A", b"not an image").unwrap_err();
        assert!(matches!(err, ReferenceError::Decode(_)));
    }

    #[test]
    fn test_missing_file() {
        let path = std::env::temp_dir().join("idverify-reference-missing.png");
        let err = ReferenceSubject::load("A", &path).unwrap_err();
        assert!(matches!(err, ReferenceError::Io { .. }));
    }

    struct AlwaysCard;

    impl CardReader for AlwaysCard {
        fn read(&mut self) -> Result<Option<ReferenceSubject>, ReferenceError> {
            let image = Image::new(vec![0u8; 12], 4, 1, PixelFormat::Bgr24);
            Ok(Some(ReferenceSubject::new("A", image)))
        }
    }

    #[test]
    fn test_reader_closes_gate_after_each_card() {
        let gate = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();
        let reader = ReaderLoop::spawn(
            AlwaysCard,
            Arc::clone(&gate),
            Duration::from_millis(5),
            move |s| {
                let _ = tx.send(s.display_name);
            },
        )
        .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "A");
        assert!(!gate.load(Ordering::SeqCst));
        // Gate stays closed: no second card.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        gate.store(true, Ordering::SeqCst);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "A");

        reader.stop();
    }
}
