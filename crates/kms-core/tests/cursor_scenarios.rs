//! Cursor transition scenarios exercised through the public kms-core API.

use std::time::{Duration, Instant};

use kms_core::{CursorConfig, CursorMapper, CursorMapping, Edge, Layout, LayoutSet};
use uuid::Uuid;

fn id(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

// ── Reference scenarios ───────────────────────────────────────────────────────

#[test]
fn test_scenario_a_equal_screens_side_by_side() {
    // Arrange
    let layouts = LayoutSet::new(vec![
        Layout::new(id(0xA), 0, 0, 1920, 1080),
        Layout::new(id(0xB), 1920, 0, 1920, 1080),
    ])
    .unwrap();
    let mut mapper = CursorMapper::default();

    // Act
    let out = mapper.map(&layouts, id(0xA), 1925, 540, Instant::now()).unwrap();

    // Assert
    assert_eq!(
        out,
        CursorMapping {
            target: id(0xB),
            x: 1920,
            y: 540,
            transitioned: true,
            edge: Some(Edge::Right),
        }
    );
}

#[test]
fn test_scenario_b_larger_offset_neighbour_bottom_right_corner() {
    // Arrange
    let layouts = LayoutSet::new(vec![
        Layout::new(id(0xA), 0, 0, 1920, 1080),
        Layout::new(id(0xB), 1920, 200, 2560, 1440),
    ])
    .unwrap();
    let mut mapper = CursorMapper::default();

    // Act
    let out = mapper.map(&layouts, id(0xA), 1925, 1080, Instant::now()).unwrap();

    // Assert: the corner resolves horizontally; y maps 100% down A onto 100% of B
    assert!(out.transitioned);
    assert_eq!(out.edge, Some(Edge::Right));
    assert_eq!((out.target, out.x, out.y), (id(0xB), 1920, 1640));
}

// ── Corner and tie-break policy ───────────────────────────────────────────────

#[test]
fn test_corner_with_neighbours_right_and_below_goes_right() {
    // Arrange
    let layouts = LayoutSet::new(vec![
        Layout::new(id(1), 0, 0, 1920, 1080),
        Layout::new(id(2), 1920, 0, 1920, 1080),
        Layout::new(id(3), 0, 1080, 1920, 1080),
    ])
    .unwrap();
    let mut mapper = CursorMapper::default();

    // Act
    let out = mapper.map(&layouts, id(1), 1919, 1079, Instant::now()).unwrap();

    // Assert
    assert_eq!(out.target, id(2));
    assert_eq!(out.edge, Some(Edge::Right));
}

#[test]
fn test_corner_without_horizontal_neighbour_falls_through_to_vertical() {
    let layouts = LayoutSet::new(vec![
        Layout::new(id(1), 0, 0, 1920, 1080),
        Layout::new(id(3), 0, 1080, 1920, 1080),
    ])
    .unwrap();
    let mut mapper = CursorMapper::default();

    let out = mapper.map(&layouts, id(1), 1919, 1079, Instant::now()).unwrap();

    assert_eq!(out.target, id(3));
    assert_eq!(out.edge, Some(Edge::Bottom));
    assert_eq!((out.x, out.y), (1919, 1080));
}

#[test]
fn test_pointer_on_shared_boundary_prefers_screen_containing_it() {
    // Arrange: two stacked neighbours at equal gap, sharing the line y = 1080
    let layouts = LayoutSet::new(vec![
        Layout::new(id(9), 0, 0, 1920, 2160),
        Layout::new(id(3), 1920, 0, 1920, 1080),
        Layout::new(id(4), 1920, 1080, 1920, 1080),
    ])
    .unwrap();
    let mut mapper = CursorMapper::default();

    // Act: y = 1080 is outside id(3) (bottom is exclusive) and inside id(4)
    let first = mapper.map(&layouts, id(9), 1920, 1080, Instant::now()).unwrap();
    let again = CursorMapper::default()
        .map(&layouts, id(9), 1920, 1080, Instant::now())
        .unwrap();

    // Assert
    assert_eq!(first.target, id(4));
    assert_eq!(first, again);
}

#[test]
fn test_equal_gap_without_containing_screen_breaks_tie_by_device_id() {
    // Arrange: two neighbours to the right, pointer level with neither
    let layouts = LayoutSet::new(vec![
        Layout::new(id(9), 0, 0, 1920, 2000),
        Layout::new(id(5), 1920, 0, 1920, 600),
        Layout::new(id(2), 1920, 1400, 1920, 600),
    ])
    .unwrap();
    let mut mapper = CursorMapper::default();

    // Act
    let out = mapper.map(&layouts, id(9), 1919, 1000, Instant::now()).unwrap();

    // Assert
    assert_eq!(out.target, id(2));
}

// ── Determinism and debounce ──────────────────────────────────────────────────

#[test]
fn test_identical_inputs_yield_identical_outputs() {
    let layouts = LayoutSet::new(vec![
        Layout::new(id(1), 0, 0, 1920, 1080).with_dpi_scale(1.5),
        Layout::new(id(2), 1920, 300, 2560, 1440),
        Layout::new(id(3), 0, 1080, 1920, 1080),
    ])
    .unwrap();
    let now = Instant::now();

    let samples = [(1925, 700), (1000, 1079), (500, 500), (-3, 40)];
    for (x, y) in samples {
        let a = CursorMapper::default().map(&layouts, id(1), x, y, now).unwrap();
        let b = CursorMapper::default().map(&layouts, id(1), x, y, now).unwrap();
        assert_eq!(a, b, "sample ({x}, {y})");
    }
}

#[test]
fn test_custom_cooldown_is_honoured() {
    // Arrange
    let layouts = LayoutSet::new(vec![
        Layout::new(id(1), 0, 0, 1920, 1080),
        Layout::new(id(2), 1920, 0, 1920, 1080),
    ])
    .unwrap();
    let mut mapper = CursorMapper::new(CursorConfig {
        edge_threshold: 5,
        cooldown: Duration::from_millis(250),
    });
    let t0 = Instant::now();
    assert!(mapper.map(&layouts, id(1), 1920, 10, t0).unwrap().transitioned);

    // Act
    let blocked = mapper
        .map(&layouts, id(2), 1920, 10, t0 + Duration::from_millis(200))
        .unwrap();
    let allowed = mapper
        .map(&layouts, id(2), 1920, 10, t0 + Duration::from_millis(260))
        .unwrap();

    // Assert
    assert!(!blocked.transitioned);
    assert!(allowed.transitioned);
    assert_eq!(allowed.target, id(1));
}

// ── DPI correction ────────────────────────────────────────────────────────────

#[test]
fn test_dpi_ratio_scales_entry_offset() {
    // Arrange: source at 1.0, target at 2.0; halfway down the source
    let layouts = LayoutSet::new(vec![
        Layout::new(id(1), 0, 0, 1920, 1080),
        Layout::new(id(2), 1920, 0, 1920, 1080).with_dpi_scale(2.0),
    ])
    .unwrap();
    let mut mapper = CursorMapper::default();

    // Act
    let out = mapper.map(&layouts, id(1), 1919, 540, Instant::now()).unwrap();

    // Assert: 0.5 × 1080 × (1.0 / 2.0)
    assert_eq!((out.x, out.y), (1920, 270));
}

#[test]
fn test_dpi_ratio_result_is_clamped_to_target_bounds() {
    let layouts = LayoutSet::new(vec![
        Layout::new(id(1), 0, 0, 1920, 1080).with_dpi_scale(2.0),
        Layout::new(id(2), 1920, 0, 1920, 1080),
    ])
    .unwrap();
    let mut mapper = CursorMapper::default();

    let out = mapper.map(&layouts, id(1), 1919, 900, Instant::now()).unwrap();

    assert_eq!((out.x, out.y), (1920, 1080));
}
