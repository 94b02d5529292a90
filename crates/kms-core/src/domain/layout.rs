//! Screen layout domain entity.
//!
//! Every device's screen is placed in one shared coordinate space (the
//! "layout space").  Offsets are non-negative pixels; the user arranges the
//! rectangles in an editor and the result is validated here, once, when the
//! set is loaded.  Nothing downstream re-checks geometry at runtime.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::device::DeviceId;

/// Smallest accepted screen dimension, in pixels.
pub const MIN_DIMENSION: u32 = 480;
/// Largest accepted screen dimension, in pixels.
pub const MAX_DIMENSION: u32 = 7680;
/// Largest accepted far edge (`x + width`, `y + height`) in layout space.
pub const MAX_EXTENT: i32 = 1 << 20;
pub const MIN_DPI_SCALE: f64 = 0.5;
pub const MAX_DPI_SCALE: f64 = 4.0;

/// Errors raised while loading a layout set.
#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("layout for {device_id} has invalid size {width}x{height}; each side must be {min}..={max}", min = MIN_DIMENSION, max = MAX_DIMENSION)]
    InvalidDimension {
        device_id: DeviceId,
        width: u32,
        height: u32,
    },

    #[error("layout for {device_id} has negative offset ({x}, {y})")]
    NegativeOffset { device_id: DeviceId, x: i32, y: i32 },

    #[error("layout for {device_id} at ({x}, {y}) extends past {max} pixels", max = MAX_EXTENT)]
    OutOfRange { device_id: DeviceId, x: i32, y: i32 },

    #[error("layout for {device_id} has dpi scale {scale}; expected {min}..={max}", min = MIN_DPI_SCALE, max = MAX_DPI_SCALE)]
    InvalidDpiScale { device_id: DeviceId, scale: f64 },

    #[error("device {0} has more than one layout")]
    DuplicateDevice(DeviceId),

    #[error("layouts for {a} and {b} overlap")]
    Overlap { a: DeviceId, b: DeviceId },

    #[error("no layout for device {0}")]
    UnknownDevice(DeviceId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Orientation {
    #[default]
    Landscape,
    Portrait,
}

/// Spatial placement of one device's screen in layout space.
///
/// `width` and `height` are the dimensions as placed, so a portrait screen
/// is simply taller than it is wide; `orientation` is carried for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layout {
    pub device_id: DeviceId,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_dpi_scale")]
    pub dpi_scale: f64,
    #[serde(default)]
    pub orientation: Orientation,
}

fn default_dpi_scale() -> f64 {
    1.0
}

impl Layout {
    /// Creates a landscape layout with a dpi scale of 1.0.
    pub fn new(device_id: DeviceId, x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            device_id,
            x,
            y,
            width,
            height,
            dpi_scale: 1.0,
            orientation: Orientation::Landscape,
        }
    }

    pub fn with_dpi_scale(mut self, dpi_scale: f64) -> Self {
        self.dpi_scale = dpi_scale;
        self
    }

    /// Returns the rightmost X coordinate (exclusive).
    pub fn right(&self) -> i32 {
        self.x.saturating_add(i32::try_from(self.width).unwrap_or(i32::MAX))
    }

    /// Returns the bottommost Y coordinate (exclusive).
    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(i32::try_from(self.height).unwrap_or(i32::MAX))
    }

    /// Returns `true` if this region shares area with `other`.
    ///
    /// Rectangles that only touch along an edge do not overlap.
    pub fn overlaps(&self, other: &Layout) -> bool {
        self.x < other.right()
            && self.right() > other.x
            && self.y < other.bottom()
            && self.bottom() > other.y
    }

    /// Converts a layout-space point into this screen's local coordinates.
    pub fn to_local(&self, x: i32, y: i32) -> (i32, i32) {
        (x.saturating_sub(self.x), y.saturating_sub(self.y))
    }

    /// Clamps a point to this screen's bounds, edges included.
    pub fn clamp(&self, x: i32, y: i32) -> (i32, i32) {
        (x.clamp(self.x, self.right()), y.clamp(self.y, self.bottom()))
    }

    fn validate(&self) -> Result<(), GeometryError> {
        let valid_side = |v: u32| (MIN_DIMENSION..=MAX_DIMENSION).contains(&v);
        if !valid_side(self.width) || !valid_side(self.height) {
            return Err(GeometryError::InvalidDimension {
                device_id: self.device_id,
                width: self.width,
                height: self.height,
            });
        }
        if self.x < 0 || self.y < 0 {
            return Err(GeometryError::NegativeOffset {
                device_id: self.device_id,
                x: self.x,
                y: self.y,
            });
        }
        let far_x = i64::from(self.x) + i64::from(self.width);
        let far_y = i64::from(self.y) + i64::from(self.height);
        if far_x > i64::from(MAX_EXTENT) || far_y > i64::from(MAX_EXTENT) {
            return Err(GeometryError::OutOfRange {
                device_id: self.device_id,
                x: self.x,
                y: self.y,
            });
        }
        if !self.dpi_scale.is_finite() || !(MIN_DPI_SCALE..=MAX_DPI_SCALE).contains(&self.dpi_scale) {
            return Err(GeometryError::InvalidDpiScale {
                device_id: self.device_id,
                scale: self.dpi_scale,
            });
        }
        Ok(())
    }
}

/// A validated set of layouts, at most one per device.
///
/// Layouts are kept sorted by device id so iteration order, and therefore
/// every decision derived from it, is deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayoutSet {
    layouts: Vec<Layout>,
}

impl LayoutSet {
    /// Validates and stores `layouts`.
    ///
    /// # Errors
    ///
    /// Returns the first [`GeometryError`] found: an invalid size, negative
    /// or too distant offset, or out-of-range dpi scale on any layout; a device listed twice;
    /// or two layouts that overlap.
    pub fn new(mut layouts: Vec<Layout>) -> Result<Self, GeometryError> {
        let mut seen = HashSet::with_capacity(layouts.len());
        for layout in &layouts {
            layout.validate()?;
            if !seen.insert(layout.device_id) {
                return Err(GeometryError::DuplicateDevice(layout.device_id));
            }
        }

        layouts.sort_by_key(|l| l.device_id);

        for (i, a) in layouts.iter().enumerate() {
            for b in &layouts[i + 1..] {
                if a.overlaps(b) {
                    return Err(GeometryError::Overlap {
                        a: a.device_id,
                        b: b.device_id,
                    });
                }
            }
        }

        Ok(Self { layouts })
    }

    pub fn get(&self, device_id: DeviceId) -> Option<&Layout> {
        self.layouts.iter().find(|l| l.device_id == device_id)
    }

    pub fn contains_device(&self, device_id: DeviceId) -> bool {
        self.get(device_id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Layout> {
        self.layouts.iter()
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// Returns the layouts as a plain list, e.g. for persisting.
    pub fn to_vec(&self) -> Vec<Layout> {
        self.layouts.clone()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn make_layout(x: i32, y: i32, w: u32, h: u32) -> Layout {
        Layout::new(Uuid::new_v4(), x, y, w, h)
    }

    // ── Region helpers ────────────────────────────────────────────────────────

    #[test]
    fn test_right_returns_x_plus_width() {
        let layout = make_layout(100, 0, 1920, 1080);
        assert_eq!(layout.right(), 2020);
    }

    #[test]
    fn test_bottom_returns_y_plus_height() {
        let layout = make_layout(0, 50, 1920, 1080);
        assert_eq!(layout.bottom(), 1130);
    }

    #[test]
    fn test_overlaps_when_regions_share_area() {
        let a = make_layout(0, 0, 1000, 1000);
        let b = make_layout(500, 500, 1000, 1000);
        assert!(a.overlaps(&b));
    }

    #[test]
    fn test_does_not_overlap_when_touching_along_edge() {
        let a = make_layout(0, 0, 1920, 1080);
        let b = make_layout(1920, 0, 1920, 1080);
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn test_clamp_keeps_point_within_inclusive_bounds() {
        let layout = make_layout(0, 0, 1920, 1080);
        assert_eq!(layout.clamp(2500, -40), (1920, 0));
        assert_eq!(layout.clamp(10, 20), (10, 20));
    }

    #[test]
    fn test_to_local_subtracts_offset() {
        let layout = make_layout(1920, 200, 2560, 1440);
        assert_eq!(layout.to_local(1930, 210), (10, 10));
    }

    // ── LayoutSet::new validation ─────────────────────────────────────────────

    #[test]
    fn test_layout_set_accepts_side_by_side_screens() {
        // Arrange
        let a = make_layout(0, 0, 1920, 1080);
        let b = make_layout(1920, 0, 1920, 1080);

        // Act
        let set = LayoutSet::new(vec![a, b]).unwrap();

        // Assert
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_layout_set_rejects_zero_width() {
        // Arrange
        let bad = make_layout(0, 0, 0, 1080);
        let id = bad.device_id;

        // Act
        let result = LayoutSet::new(vec![bad]);

        // Assert
        assert_eq!(
            result,
            Err(GeometryError::InvalidDimension {
                device_id: id,
                width: 0,
                height: 1080,
            })
        );
    }

    #[test]
    fn test_layout_set_rejects_height_below_minimum() {
        let bad = make_layout(0, 0, 1920, 479);
        assert!(matches!(
            LayoutSet::new(vec![bad]),
            Err(GeometryError::InvalidDimension { .. })
        ));
    }

    #[test]
    fn test_layout_set_rejects_negative_offset() {
        let bad = make_layout(-10, 0, 1920, 1080);
        assert!(matches!(
            LayoutSet::new(vec![bad]),
            Err(GeometryError::NegativeOffset { x: -10, .. })
        ));
    }

    #[test]
    fn test_layout_set_rejects_offset_near_integer_limit() {
        // Arrange
        let far = make_layout(i32::MAX - 100, 0, 1920, 1080);
        let set = vec![make_layout(0, 0, 1920, 1080), far.clone()];

        // Act
        let result = LayoutSet::new(set);

        // Assert
        assert_eq!(
            result,
            Err(GeometryError::OutOfRange {
                device_id: far.device_id,
                x: i32::MAX - 100,
                y: 0,
            })
        );
    }

    #[test]
    fn test_layout_set_accepts_screen_ending_exactly_at_extent() {
        let edge = make_layout(MAX_EXTENT - 1920, MAX_EXTENT - 1080, 1920, 1080);
        assert!(LayoutSet::new(vec![edge]).is_ok());
    }

    #[test]
    fn test_region_helpers_saturate_instead_of_overflowing() {
        let unchecked = make_layout(i32::MAX - 100, 0, 1920, 1080);
        assert_eq!(unchecked.right(), i32::MAX);
        assert_eq!(unchecked.to_local(i32::MIN, 0), (i32::MIN, 0));
    }

    #[test]
    fn test_layout_set_rejects_out_of_range_dpi() {
        let bad = make_layout(0, 0, 1920, 1080).with_dpi_scale(4.5);
        assert!(matches!(
            LayoutSet::new(vec![bad]),
            Err(GeometryError::InvalidDpiScale { .. })
        ));
    }

    #[test]
    fn test_layout_set_rejects_nan_dpi() {
        let bad = make_layout(0, 0, 1920, 1080).with_dpi_scale(f64::NAN);
        assert!(matches!(
            LayoutSet::new(vec![bad]),
            Err(GeometryError::InvalidDpiScale { .. })
        ));
    }

    #[test]
    fn test_layout_set_rejects_duplicate_device() {
        // Arrange
        let a = make_layout(0, 0, 1920, 1080);
        let mut b = make_layout(1920, 0, 1920, 1080);
        b.device_id = a.device_id;

        // Act / Assert
        assert_eq!(
            LayoutSet::new(vec![a.clone(), b]),
            Err(GeometryError::DuplicateDevice(a.device_id))
        );
    }

    #[test]
    fn test_layout_set_rejects_overlapping_screens() {
        let a = make_layout(0, 0, 1920, 1080);
        let b = make_layout(1000, 0, 1920, 1080);
        assert!(matches!(
            LayoutSet::new(vec![a, b]),
            Err(GeometryError::Overlap { .. })
        ));
    }

    #[test]
    fn test_layout_set_get_finds_by_device_id() {
        let a = make_layout(0, 0, 1920, 1080);
        let id = a.device_id;
        let set = LayoutSet::new(vec![a.clone()]).unwrap();
        assert_eq!(set.get(id), Some(&a));
        assert!(set.get(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_layout_deserializes_with_defaults_for_dpi_and_orientation() {
        // Arrange
        let id = Uuid::new_v4();
        let json = format!(r#"{{"deviceId":"{id}","x":0,"y":0,"width":1920,"height":1080}}"#);

        // Act
        let layout: Layout = serde_json::from_str(&json).unwrap();

        // Assert
        assert_eq!(layout.dpi_scale, 1.0);
        assert_eq!(layout.orientation, Orientation::Landscape);
    }
}
