use serde::Serialize;
use std::sync::Arc;

/// Short-lived face identity assigned by the detection engine.
pub type TrackId = i32;

/// Pixel layout of an [`Image`] buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PixelFormat {
    /// Camera preview layout: full-resolution Y plane followed by interleaved VU.
    Nv21,
    /// Packed 8-bit blue, green, red. Used for decoded reference images.
    Bgr24,
}

impl PixelFormat {
    /// Number of bytes a complete `width` × `height` buffer occupies.
    pub fn buffer_len(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Nv21 => pixels * 3 / 2,
            PixelFormat::Bgr24 => pixels * 3,
        }
    }
}

/// An immutable, cheaply cloneable pixel buffer.
#[derive(Clone)]
pub struct Image {
    pub data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Image {
    pub fn new(data: impl Into<Arc<[u8]>>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            format,
        }
    }

    /// Whether the buffer holds at least a full frame for its dimensions.
    pub fn is_complete(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() >= self.format.buffer_len(self.width, self.height)
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Image({}x{} {:?}, {} bytes)",
            self.width,
            self.height,
            self.format,
            self.data.len()
        )
    }
}

/// Axis-aligned rectangle in pixel coordinates (right/bottom exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }
}

/// A face reported by the engine's detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedFace {
    pub track_id: TrackId,
    pub rect: Rect,
}

/// Opaque biometric descriptor produced by the engine.
///
/// Only the engine that produced it knows how to interpret the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Feature(Arc<[u8]>);

impl Feature {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Feature({} bytes)", self.0.len())
    }
}

/// Whose feature an extraction request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    /// The reference (ID-card) image. Never collides with a live track.
    Reference,
    /// A live face, keyed by the detector's tracking identity.
    Live(TrackId),
}

/// Correlation value threaded through an asynchronous extraction request.
///
/// `session` identifies the verification session that issued the request so
/// that late results from an earlier session can be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestTag {
    pub session: u64,
    pub subject: Subject,
}

impl RequestTag {
    pub fn reference(session: u64) -> Self {
        Self {
            session,
            subject: Subject::Reference,
        }
    }

    pub fn live(session: u64, track_id: TrackId) -> Self {
        Self {
            session,
            subject: Subject::Live(track_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nv21_buffer_len() {
        assert_eq!(PixelFormat::Nv21.buffer_len(640, 480), 460_800);
        assert_eq!(PixelFormat::Bgr24.buffer_len(4, 2), 24);
    }

    #[test]
    fn test_truncated_image_is_incomplete() {
        let full = Image::new(vec![0u8; 6], 2, 2, PixelFormat::Nv21);
        assert!(full.is_complete());

        let short = Image::new(vec![0u8; 5], 2, 2, PixelFormat::Nv21);
        assert!(!short.is_complete());

        let empty = Image::new(Vec::new(), 0, 0, PixelFormat::Nv21);
        assert!(!empty.is_complete());
    }

    #[test]
    fn test_reference_tag_never_equals_live_tag() {
        assert_ne!(RequestTag::reference(1), RequestTag::live(1, -2));
        assert_ne!(RequestTag::live(1, 3), RequestTag::live(2, 3));
    }
}
