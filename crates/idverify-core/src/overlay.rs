//! Mapping of detector rectangles into preview-view coordinates.

use crate::geometry::{CaptureGeometry, Facing, Size};
use crate::types::Rect;

/// Map a face rectangle from capture pixels into the preview view.
///
/// The rectangle is scaled per axis, rotated by the display orientation,
/// mirrored for front-facing devices and finally flipped by the device and
/// draw mirror flags.
pub fn map_to_view(rect: Rect, geometry: &CaptureGeometry, view: Size) -> Rect {
    let preview = geometry.size;
    if preview.width == 0 || preview.height == 0 {
        return rect;
    }
    let canvas_w = view.width as f32;
    let canvas_h = view.height as f32;

    let (h_ratio, v_ratio) = if geometry.orientation % 180 == 0 {
        (
            canvas_w / preview.width as f32,
            canvas_h / preview.height as f32,
        )
    } else {
        (
            canvas_h / preview.width as f32,
            canvas_w / preview.height as f32,
        )
    };

    let left = (rect.left as f32 * h_ratio) as i32;
    let right = (rect.right as f32 * h_ratio) as i32;
    let top = (rect.top as f32 * v_ratio) as i32;
    let bottom = (rect.bottom as f32 * v_ratio) as i32;

    let cw = view.width as i32;
    let ch = view.height as i32;
    let front = geometry.facing == Facing::Front;

    let mut mapped = match geometry.orientation {
        90 => {
            let (t, b) = if front {
                (ch - right, ch - left)
            } else {
                (left, right)
            };
            Rect::new(cw - bottom, t, cw - top, b)
        }
        180 => {
            let (l, r) = if front {
                (left, right)
            } else {
                (cw - right, cw - left)
            };
            Rect::new(l, ch - bottom, r, ch - top)
        }
        270 => {
            let (t, b) = if front {
                (left, right)
            } else {
                (ch - right, ch - left)
            };
            Rect::new(top, t, bottom, b)
        }
        _ => {
            let (l, r) = if front {
                (cw - right, cw - left)
            } else {
                (left, right)
            };
            Rect::new(l, top, r, bottom)
        }
    };

    if geometry.mirror {
        mapped = flip_horizontal(mapped, cw);
    }
    if geometry.mirror_horizontal {
        mapped = flip_horizontal(mapped, cw);
    }
    if geometry.mirror_vertical {
        mapped = Rect::new(mapped.left, ch - mapped.bottom, mapped.right, ch - mapped.top);
    }
    mapped
}

fn flip_horizontal(rect: Rect, canvas_width: i32) -> Rect {
    Rect::new(
        canvas_width - rect.right,
        rect.top,
        canvas_width - rect.left,
        rect.bottom,
    )
}
