//! Coordinate mapping from normalized image space to PDF point space.
//!
//! The recognition service reports each item's box in the unit square with
//! the origin at the bottom-left, independent of the raster's resolution.
//! Mapping onto a page is therefore a plain scale by the page's displayed
//! width and height in points; DPI never enters the transform.
//!
//! Pages with a `/Rotate` entry are displayed rotated, so the rectangle is
//! first computed in displayed space and then carried back into the page's
//! unrotated user space by [`PageGeometry::to_user_space`].

use serde::{Deserialize, Serialize};

/// A rectangle in the unit square, origin bottom-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl NormalizedBox {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    /// Clamp both corners into `[0,1]²`.
    ///
    /// Returns `None` when a coordinate is not finite or the clamped box has
    /// no area.
    pub fn clamped(&self) -> Option<NormalizedBox> {
        if ![self.x, self.y, self.w, self.h].iter().all(|v| v.is_finite()) {
            return None;
        }
        let x0 = self.x.clamp(0.0, 1.0);
        let y0 = self.y.clamp(0.0, 1.0);
        let x1 = (self.x + self.w).clamp(0.0, 1.0);
        let y1 = (self.y + self.h).clamp(0.0, 1.0);

        let w = x1 - x0;
        let h = y1 - y0;
        if w <= 0.0 || h <= 0.0 {
            return None;
        }
        Some(NormalizedBox::new(x0, y0, w, h))
    }
}

/// An absolute rectangle on a page, in points, origin bottom-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Map a normalized box onto a `page_width` × `page_height` point space.
///
/// Degenerate boxes (zero width or height after clamping) yield `None`.
pub fn map_to_page(bbox: &NormalizedBox, page_width: f64, page_height: f64) -> Option<PageRect> {
    let b = bbox.clamped()?;
    Some(PageRect {
        x: b.x * page_width,
        y: b.y * page_height,
        width: b.w * page_width,
        height: b.h * page_height,
    })
}

/// `true` when the raster's aspect ratio matches the page's within `tolerance`
/// (relative). Unknown pixel dimensions (zero) always pass.
pub fn aspect_ratio_consistent(
    pixel_width: u32,
    pixel_height: u32,
    page_width: f64,
    page_height: f64,
    tolerance: f64,
) -> bool {
    if pixel_width == 0 || pixel_height == 0 || page_width <= 0.0 || page_height <= 0.0 {
        return true;
    }
    let raster = pixel_width as f64 / pixel_height as f64;
    let page = page_width / page_height;
    ((raster - page) / page).abs() <= tolerance
}

/// Clockwise display rotation of a page (the PDF `/Rotate` entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PageRotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl PageRotation {
    /// Normalise any multiple of 90 degrees; other values fall back to `None`.
    pub fn from_degrees(degrees: i32) -> Self {
        match degrees.rem_euclid(360) {
            90 => PageRotation::Cw90,
            180 => PageRotation::Cw180,
            270 => PageRotation::Cw270,
            _ => PageRotation::None,
        }
    }

    pub fn degrees(&self) -> i32 {
        match self {
            PageRotation::None => 0,
            PageRotation::Cw90 => 90,
            PageRotation::Cw180 => 180,
            PageRotation::Cw270 => 270,
        }
    }
}

/// Size and orientation of a destination page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageGeometry {
    /// Displayed width in points (after rotation).
    pub width: f64,
    /// Displayed height in points (after rotation).
    pub height: f64,
    pub rotation: PageRotation,
}

impl PageGeometry {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            rotation: PageRotation::None,
        }
    }

    pub fn with_rotation(mut self, rotation: PageRotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Map a normalized box into displayed page space.
    pub fn map(&self, bbox: &NormalizedBox) -> Option<PageRect> {
        map_to_page(bbox, self.width, self.height)
    }

    /// Carry a displayed-space point back into unrotated user space.
    pub fn to_user_space(&self, x: f64, y: f64) -> (f64, f64) {
        match self.rotation {
            PageRotation::None => (x, y),
            // Displayed width is the user height and vice versa.
            PageRotation::Cw90 => (self.height - y, x),
            PageRotation::Cw180 => (self.width - x, self.height - y),
            PageRotation::Cw270 => (y, self.width - x),
        }
    }

    /// Counter-clockwise rotation (degrees, user space) that makes a text run
    /// read left-to-right in the displayed orientation.
    pub fn text_rotation_ccw(&self) -> f64 {
        match self.rotation {
            PageRotation::None => 0.0,
            PageRotation::Cw90 => 90.0,
            PageRotation::Cw180 => 180.0,
            PageRotation::Cw270 => 270.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < EPS
    }

    #[test]
    fn maps_by_page_size_only() {
        let r = map_to_page(&NormalizedBox::new(0.1, 0.2, 0.5, 0.05), 612.0, 792.0).unwrap();
        assert!(close(r.x, 61.2));
        assert!(close(r.y, 158.4));
        assert!(close(r.width, 306.0));
        assert!(close(r.height, 39.6));
    }

    #[test]
    fn degenerate_boxes_are_dropped() {
        assert!(map_to_page(&NormalizedBox::new(0.1, 0.1, 0.0, 0.2), 100.0, 100.0).is_none());
        assert!(map_to_page(&NormalizedBox::new(0.1, 0.1, 0.2, 0.0), 100.0, 100.0).is_none());
        assert!(map_to_page(&NormalizedBox::new(1.2, 0.1, 0.2, 0.2), 100.0, 100.0).is_none());
        assert!(map_to_page(&NormalizedBox::new(f64::NAN, 0.1, 0.2, 0.2), 100.0, 100.0).is_none());
    }

    #[test]
    fn out_of_range_boxes_are_clamped() {
        let r = map_to_page(&NormalizedBox::new(-0.1, 0.9, 0.3, 0.3), 200.0, 100.0).unwrap();
        assert!(close(r.x, 0.0));
        assert!(close(r.width, 0.2 * 200.0));
        assert!(close(r.y, 90.0));
        assert!(close(r.height, 10.0));
    }

    #[test]
    fn mapped_rect_stays_inside_page() {
        let (wp, hp) = (595.0, 842.0);
        let steps = [0.0, 0.013, 0.25, 0.5, 0.77, 0.999, 1.0];
        for &x in &steps {
            for &y in &steps {
                for &w in &steps {
                    for &h in &steps {
                        let b = NormalizedBox::new(x, y, w, h);
                        if let Some(r) = map_to_page(&b, wp, hp) {
                            assert!(r.x >= 0.0 && r.y >= 0.0, "{b:?} → {r:?}");
                            assert!(r.x + r.width <= wp + EPS, "{b:?} → {r:?}");
                            assert!(r.y + r.height <= hp + EPS, "{b:?} → {r:?}");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn aspect_ratio_check() {
        // A4 at 300 DPI: 2480 × 3508 px, 595.28 × 841.89 pt
        assert!(aspect_ratio_consistent(2480, 3508, 595.28, 841.89, 0.02));
        // Landscape raster on a portrait page.
        assert!(!aspect_ratio_consistent(3508, 2480, 595.28, 841.89, 0.02));
        // Unknown pixel size passes.
        assert!(aspect_ratio_consistent(0, 0, 595.28, 841.89, 0.02));
    }

    #[test]
    fn rotation_normalises_degrees() {
        assert_eq!(PageRotation::from_degrees(-90), PageRotation::Cw270);
        assert_eq!(PageRotation::from_degrees(450), PageRotation::Cw90);
        assert_eq!(PageRotation::from_degrees(45), PageRotation::None);
        assert_eq!(PageRotation::Cw180.degrees(), 180);
    }

    #[test]
    fn user_space_corners_for_rotated_pages() {
        // Displayed 792 × 612 (a portrait letter page rotated by 90°).
        let g = PageGeometry::new(792.0, 612.0).with_rotation(PageRotation::Cw90);
        // Displayed top-left comes from user bottom-left.
        assert_eq!(g.to_user_space(0.0, 612.0), (0.0, 0.0));
        // Displayed top-right comes from user top-left.
        assert_eq!(g.to_user_space(792.0, 612.0), (0.0, 792.0));

        let g = PageGeometry::new(612.0, 792.0).with_rotation(PageRotation::Cw180);
        assert_eq!(g.to_user_space(0.0, 0.0), (612.0, 792.0));

        let g = PageGeometry::new(792.0, 612.0).with_rotation(PageRotation::Cw270);
        // Displayed bottom-left comes from user top-left (0, 792).
        assert_eq!(g.to_user_space(0.0, 0.0), (0.0, 792.0));
        assert_eq!(g.text_rotation_ccw(), 270.0);

        let g = PageGeometry::new(612.0, 792.0);
        assert_eq!(g.to_user_space(10.0, 20.0), (10.0, 20.0));
    }
}
