//! Capture geometry negotiation.
//!
//! Two decisions are made once per camera open: which of the device's
//! supported capture sizes best fits the preview view, and how many degrees
//! the preview must be rotated for display. Overlay placement relies on the
//! orientation matching the actual pixel layout, so both follow the device
//! conventions exactly.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Width × height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl std::str::FromStr for Size {
    type Err = String;

    /// Parse `WIDTHxHEIGHT`, e.g. `1280x720`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{s}'"))?;
        let width = w.parse().map_err(|_| format!("invalid width in '{s}'"))?;
        let height = h.parse().map_err(|_| format!("invalid height in '{s}'"))?;
        Ok(Self { width, height })
    }
}

/// Which way the camera faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Front,
    Back,
}

/// Negotiated capture parameters for an open device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CaptureGeometry {
    pub camera_id: usize,
    pub facing: Facing,
    pub size: Size,
    /// Clockwise display rotation in degrees; always one of 0, 90, 180, 270.
    pub orientation: u32,
    /// Device (preview) mirror.
    pub mirror: bool,
    /// Extra horizontal mirror applied when drawing overlays.
    pub mirror_horizontal: bool,
    /// Extra vertical mirror applied when drawing overlays.
    pub mirror_vertical: bool,
}

/// Truncate an additional rotation to a multiple of 90 degrees.
pub fn normalize_additional_rotation(degrees: i32) -> i32 {
    degrees / 90 * 90
}

/// Convert display rotation steps (0..=3, quarter turns) to degrees.
pub fn rotation_steps_to_degrees(steps: u32) -> i32 {
    match steps {
        0 => 0,
        1 => 90,
        2 => 180,
        3 => 270,
        other => (other % 4) as i32 * 90,
    }
}

/// Derive the display orientation for a device.
///
/// `device_rotation` is in quarter-turn steps, `additional_rotation` in
/// degrees (truncated to a multiple of 90) and `sensor_orientation` is the
/// fixed mounting angle of the sensor. Front-facing devices compensate for
/// the mirrored preview.
pub fn display_orientation(
    facing: Facing,
    sensor_orientation: u32,
    device_rotation: u32,
    additional_rotation: i32,
) -> u32 {
    let degrees =
        rotation_steps_to_degrees(device_rotation) + normalize_additional_rotation(additional_rotation);
    let sensor = sensor_orientation as i32;

    let result = match facing {
        Facing::Front => {
            let combined = (sensor + degrees).rem_euclid(360);
            (360 - combined) % 360
        }
        Facing::Back => (sensor - degrees + 360).rem_euclid(360),
    };
    result as u32
}

/// Pick the capture size that best fits the preview view.
///
/// Candidates are sorted by width then height, both descending. An explicitly
/// requested size wins when the device supports it. Otherwise the candidate
/// whose aspect ratio is closest to the view's (normalized to ≤ 1) is chosen,
/// with ties going to the earlier (larger) candidate. The aspect compared is
/// height/width when `additional_rotation` is a multiple of 180, width/height
/// otherwise. With no usable candidates `fallback` is returned.
pub fn negotiate_size(
    supported: &[Size],
    view: Option<Size>,
    requested: Option<Size>,
    additional_rotation: i32,
    fallback: Size,
) -> Size {
    let mut sizes: Vec<Size> = supported
        .iter()
        .copied()
        .filter(|s| !s.is_degenerate())
        .collect();
    if sizes.is_empty() {
        return fallback;
    }

    sizes.sort_by(|a, b| match b.width.cmp(&a.width) {
        Ordering::Equal => b.height.cmp(&a.height),
        other => other,
    });

    if let Some(requested) = requested {
        if sizes.contains(&requested) {
            return requested;
        }
    }

    let largest = sizes[0];
    let mut target = match view {
        Some(v) if !v.is_degenerate() => v.width as f32 / v.height as f32,
        _ => largest.width as f32 / largest.height as f32,
    };
    if target > 1.0 {
        target = 1.0 / target;
    }

    let normal_rotation = normalize_additional_rotation(additional_rotation) % 180 == 0;
    let aspect = |s: Size| {
        if normal_rotation {
            s.height as f32 / s.width as f32
        } else {
            s.width as f32 / s.height as f32
        }
    };

    let mut best = largest;
    for &candidate in &sizes[1..] {
        if (aspect(candidate) - target).abs() < (aspect(best) - target).abs() {
            best = candidate;
        }
    }
    best
}
