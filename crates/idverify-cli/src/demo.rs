//! Stand-ins for the hardware and the vendor engine, so `idverify run`
//! works on any machine.
//!
//! The synthetic camera renders a stylized face drifting across a dark
//! background. The demo recognizer finds it by brightness and describes it
//! with a coarse luma grid; good enough to tell the synthetic face from
//! anything else, useless for real faces.

use idverify_core::{
    CameraDriver, CaptureError, CardReader, Cue, DetectedFace, DeviceInfo, EngineError, Facing,
    Feature, FrameStream, Image, PixelFormat, PresentationSink, Prompt, Recognizer, Rect,
    ReferenceError, ReferenceSubject, Size, TrackId, Verdict,
};
use image::{Rgb, RgbImage};
use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const BACKGROUND: u8 = 30;
const SKIN: u8 = 230;
const FEATURE: u8 = 60;
const BRIGHT_THRESHOLD: u8 = 200;
const GRID: u32 = 8;

/// Luma of the synthetic face at `(x, y)` inside a `side`-pixel square.
fn face_luma(x: u32, y: u32, side: u32) -> u8 {
    let eye_radius = side / 10;
    let eye_y = side * 35 / 100;
    for eye_x in [side * 3 / 10, side * 7 / 10] {
        if x.abs_diff(eye_x) <= eye_radius && y.abs_diff(eye_y) <= eye_radius {
            return FEATURE;
        }
    }
    let mouth = (side * 7 / 10..side * 78 / 100, side * 3 / 10..side * 7 / 10);
    if mouth.0.contains(&y) && mouth.1.contains(&x) {
        return FEATURE;
    }
    SKIN
}

fn draw_face(luma: &mut [u8], stride: u32, x0: u32, y0: u32, side: u32) {
    for y in 0..side {
        let row = ((y0 + y) * stride + x0) as usize;
        for x in 0..side {
            luma[row + x as usize] = face_luma(x, y, side);
        }
    }
}

/// The card photo matching the synthetic camera's face.
pub fn synthetic_reference() -> RgbImage {
    let side = 120;
    let margin = 20;
    RgbImage::from_fn(side + 2 * margin, side + 2 * margin, |x, y| {
        let inside = (margin..margin + side).contains(&x) && (margin..margin + side).contains(&y);
        let v = if inside {
            face_luma(x - margin, y - margin, side)
        } else {
            BACKGROUND
        };
        Rgb([v, v, v])
    })
}

/// Two virtual devices: 0 faces back, 1 faces front.
pub struct SyntheticCamera {
    devices: Vec<DeviceInfo>,
    frame_interval: Duration,
}

impl SyntheticCamera {
    pub fn new(fps: u32) -> Self {
        let sizes = vec![
            Size::new(320, 240),
            Size::new(640, 480),
            Size::new(1280, 720),
        ];
        Self {
            devices: vec![
                DeviceInfo {
                    facing: Facing::Back,
                    sensor_orientation: 90,
                    supported_sizes: sizes.clone(),
                    default_size: Size::new(640, 480),
                },
                DeviceInfo {
                    facing: Facing::Front,
                    sensor_orientation: 270,
                    supported_sizes: sizes,
                    default_size: Size::new(640, 480),
                },
            ],
            frame_interval: Duration::from_millis(1000 / u64::from(fps.max(1))),
        }
    }
}

impl CameraDriver for SyntheticCamera {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device_info(&self, camera_id: usize) -> Result<DeviceInfo, CaptureError> {
        self.devices
            .get(camera_id)
            .cloned()
            .ok_or_else(|| CaptureError::Driver(format!("no synthetic device {camera_id}")))
    }

    fn open(&self, _camera_id: usize, size: Size) -> Result<Box<dyn FrameStream>, CaptureError> {
        if size.width < 16 || size.height < 16 {
            return Err(CaptureError::Driver(format!("unsupported size {size}")));
        }
        Ok(Box::new(SyntheticStream {
            size,
            interval: self.frame_interval,
            index: 0,
        }))
    }
}

struct SyntheticStream {
    size: Size,
    interval: Duration,
    index: u32,
}

impl FrameStream for SyntheticStream {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        std::thread::sleep(self.interval);

        let Size { width, height } = self.size;
        let mut frame = vec![128u8; PixelFormat::Nv21.buffer_len(width, height)];
        let (luma, _chroma) = frame.split_at_mut((width * height) as usize);
        luma.fill(BACKGROUND);

        let side = height / 3;
        let x0 = (self.index * 4) % (width - side);
        draw_face(luma, width, x0, (height - side) / 2, side);
        self.index = self.index.wrapping_add(1);

        Ok(Some(frame))
    }
}

/// Brightness-based detector with a luma-grid descriptor.
pub struct DemoRecognizer {
    next_track: AtomicI32,
    current: Mutex<Option<TrackId>>,
}

impl DemoRecognizer {
    pub fn new() -> Self {
        Self {
            next_track: AtomicI32::new(1),
            current: Mutex::new(None),
        }
    }
}

impl Default for DemoRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

fn luma_plane(image: &Image) -> Cow<'_, [u8]> {
    let pixels = (image.width * image.height) as usize;
    match image.format {
        PixelFormat::Nv21 => Cow::Borrowed(&image.data[..pixels]),
        PixelFormat::Bgr24 => Cow::Owned(
            image
                .data
                .chunks_exact(3)
                .map(|p| ((p[0] as u32 * 29 + p[1] as u32 * 150 + p[2] as u32 * 77) >> 8) as u8)
                .collect(),
        ),
    }
}

fn bright_bounds(luma: &[u8], width: u32, height: u32) -> Option<Rect> {
    let (mut left, mut top, mut right, mut bottom) = (u32::MAX, u32::MAX, 0, 0);
    let mut count = 0u32;
    for y in (0..height).step_by(2) {
        for x in (0..width).step_by(2) {
            if luma[(y * width + x) as usize] >= BRIGHT_THRESHOLD {
                left = left.min(x);
                top = top.min(y);
                right = right.max(x + 1);
                bottom = bottom.max(y + 1);
                count += 1;
            }
        }
    }
    // At least 1% of the sampled pixels.
    (count * 400 >= width * height)
        .then(|| Rect::new(left as i32, top as i32, right as i32, bottom as i32))
}

impl Recognizer for DemoRecognizer {
    fn activate(&self) -> Result<(), EngineError> {
        tracing::info!("demo recognizer activated");
        Ok(())
    }

    fn detect_faces(&self, image: &Image) -> Result<Vec<DetectedFace>, EngineError> {
        if !image.is_complete() {
            return Err(EngineError::Detection(-1));
        }
        let rect = bright_bounds(&luma_plane(image), image.width, image.height);

        // Card photos do not take part in live tracking.
        if image.format == PixelFormat::Bgr24 {
            return Ok(rect
                .map(|rect| DetectedFace { track_id: 0, rect })
                .into_iter()
                .collect());
        }

        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        let Some(rect) = rect else {
            *current = None;
            return Ok(vec![]);
        };
        let track_id =
            *current.get_or_insert_with(|| self.next_track.fetch_add(1, Ordering::SeqCst));
        Ok(vec![DetectedFace { track_id, rect }])
    }

    fn extract_feature(&self, image: &Image, face: &DetectedFace) -> Result<Feature, EngineError> {
        let rect = face.rect;
        if rect.is_empty() {
            return Err(EngineError::NoFaceDetected);
        }
        let luma = luma_plane(image);
        let (w, h) = (rect.width() as u32, rect.height() as u32);

        let mut descriptor = Vec::with_capacity((GRID * GRID) as usize);
        for gy in 0..GRID {
            for gx in 0..GRID {
                let (x_start, x_end) = (w * gx / GRID, (w * (gx + 1) / GRID).max(w * gx / GRID + 1));
                let (y_start, y_end) = (h * gy / GRID, (h * (gy + 1) / GRID).max(h * gy / GRID + 1));
                let mut sum = 0u64;
                let mut n = 0u64;
                for y in y_start..y_end.min(h) {
                    for x in x_start..x_end.min(w) {
                        let px = (rect.top as u32 + y) * image.width + rect.left as u32 + x;
                        if let Some(&v) = luma.get(px as usize) {
                            sum += u64::from(v);
                            n += 1;
                        }
                    }
                }
                descriptor.push(if n == 0 { 0 } else { (sum / n) as u8 });
            }
        }
        Ok(Feature::new(descriptor))
    }

    /// Pearson correlation of the two grids, clamped to `[0, 1]`.
    fn compare_features(&self, reference: &Feature, live: &Feature) -> Result<f32, EngineError> {
        let (a, b) = (reference.as_bytes(), live.as_bytes());
        if a.len() != b.len() || a.is_empty() {
            return Err(EngineError::Comparison(format!(
                "descriptor length mismatch: {} vs {}",
                a.len(),
                b.len()
            )));
        }
        let mean = |v: &[u8]| v.iter().map(|&x| f32::from(x)).sum::<f32>() / v.len() as f32;
        let (ma, mb) = (mean(a), mean(b));
        let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
        for (&x, &y) in a.iter().zip(b) {
            let (dx, dy) = (f32::from(x) - ma, f32::from(y) - mb);
            dot += dx * dy;
            na += dx * dx;
            nb += dy * dy;
        }
        if na == 0.0 || nb == 0.0 {
            return Ok(0.0);
        }
        Ok((dot / (na.sqrt() * nb.sqrt())).clamp(0.0, 1.0))
    }
}

/// Prints prompts for the user and logs everything else.
#[derive(Default)]
pub struct ConsoleSink;

impl PresentationSink for ConsoleSink {
    fn show_prompt(&mut self, prompt: Prompt) {
        tracing::debug!(?prompt, "prompt");
        match prompt {
            Prompt::SubmitReference => println!("Please present an ID card."),
            Prompt::LookAtCamera => println!("Please look at the camera."),
            Prompt::Comparing => println!("Comparing..."),
            Prompt::Result {
                verdict: Verdict::Success,
                display_name,
            } => println!("Verified: {display_name}"),
            Prompt::Result {
                verdict: Verdict::Failure,
                display_name,
            } => println!("Not verified: {display_name}. Please try again."),
        }
    }

    fn update_overlay(&mut self, rect: Option<Rect>) {
        tracing::trace!(?rect, "overlay");
    }

    fn play_cue(&mut self, cue: Cue) {
        match cue {
            Cue::LookAtScreen => tracing::debug!(?cue, "cue"),
            Cue::CompareSuccess | Cue::CompareFail => tracing::info!(?cue, "cue"),
        }
    }

    fn show_reference(&mut self, subject: &ReferenceSubject) {
        tracing::info!(
            name = %subject.display_name,
            width = subject.image.width,
            height = subject.image.height,
            "reference photo ready"
        );
    }
}

/// Card reader serving a photo from disk, or the synthetic card photo.
pub struct DemoCardReader {
    name: String,
    path: Option<PathBuf>,
    once: bool,
    delivered: bool,
}

impl DemoCardReader {
    pub fn new(name: String, path: Option<PathBuf>, once: bool) -> Self {
        Self {
            name,
            path,
            once,
            delivered: false,
        }
    }
}

impl CardReader for DemoCardReader {
    fn read(&mut self) -> Result<Option<ReferenceSubject>, ReferenceError> {
        if self.once && self.delivered {
            return Ok(None);
        }
        let subject = match &self.path {
            Some(path) if !path.is_file() => {
                return Err(ReferenceError::Reader(format!(
                    "no card photo at {}",
                    path.display()
                )));
            }
            Some(path) => ReferenceSubject::load(self.name.clone(), path)?,
            None => ReferenceSubject::from_rgb(self.name.clone(), &synthetic_reference())?,
        };
        self.delivered = true;
        Ok(Some(subject))
    }
}
