//! Multi-monitor cursor transition geometry.
//!
//! [`CursorMapper`] answers one question for every raw pointer sample on the
//! master: does the pointer stay on the device that currently owns it, or has
//! it crossed onto an adjacent screen, and if so, where does it enter?
//!
//! # How a transition is decided (for beginners)
//!
//! 1. The sample is tested against the owning screen's four edges with a
//!    small pixel threshold so that overshoot still counts as "at the edge".
//! 2. Edges are tried in the order Right, Left, Bottom, Top.  Left/right
//!    (horizontal movement) therefore beats top/bottom when the pointer sits
//!    in a corner.  If the preferred edge has no neighbour the next edge in
//!    the list is tried, so a corner still reaches a screen that is only
//!    adjacent vertically.
//! 3. For the crossed edge every layout on the far side whose perpendicular
//!    range overlaps the source is a candidate.  The nearest one wins; ties go
//!    to the screen whose range contains the pointer, then to the lowest id.
//! 4. The entry point keeps the pointer's relative position along the edge,
//!    corrected by the ratio of the two screens' DPI scales, and is clamped to
//!    the target's bounds.
//! 5. After a transition no other transition happens for a short cooldown so
//!    a pointer resting on a shared boundary cannot bounce back and forth.
//!
//! The mapper is pure: no I/O, no clock reads.  Callers pass `now` in.

use std::time::{Duration, Instant};

use tracing::debug;

use super::device::DeviceId;
use super::layout::{GeometryError, Layout, LayoutSet};

/// Pixel distance from an edge within which the pointer counts as crossing it.
pub const DEFAULT_EDGE_THRESHOLD: u32 = 5;

/// Minimum time between two transitions.
pub const DEFAULT_TRANSITION_COOLDOWN: Duration = Duration::from_millis(100);

/// The four edges of a screen, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    Right,
    Left,
    Bottom,
    Top,
}

impl Edge {
    const PRIORITY: [Edge; 4] = [Edge::Right, Edge::Left, Edge::Bottom, Edge::Top];

    /// `true` for Left/Right, where the pointer moves along the x axis.
    pub fn is_horizontal(self) -> bool {
        matches!(self, Edge::Right | Edge::Left)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorConfig {
    pub edge_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            edge_threshold: DEFAULT_EDGE_THRESHOLD,
            cooldown: DEFAULT_TRANSITION_COOLDOWN,
        }
    }
}

/// Result of mapping one pointer sample.
///
/// `x`/`y` are layout-space coordinates on `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorMapping {
    pub target: DeviceId,
    pub x: i32,
    pub y: i32,
    pub transitioned: bool,
    /// The edge of the source screen that was crossed, when `transitioned`.
    pub edge: Option<Edge>,
}

/// Decides edge transitions between adjacent screens.
#[derive(Debug, Clone, Default)]
pub struct CursorMapper {
    config: CursorConfig,
    last_transition: Option<Instant>,
}

impl CursorMapper {
    pub fn new(config: CursorConfig) -> Self {
        Self {
            config,
            last_transition: None,
        }
    }

    pub fn config(&self) -> &CursorConfig {
        &self.config
    }

    /// Returns `true` while a recent transition blocks the next one.
    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.last_transition
            .is_some_and(|at| now.saturating_duration_since(at) < self.config.cooldown)
    }

    /// Forgets the last transition, e.g. after the layout set is replaced.
    pub fn reset(&mut self) {
        self.last_transition = None;
    }

    /// Maps a raw layout-space sample `(x, y)` taken while `owner` holds the pointer.
    ///
    /// Without a transition the result is `owner` and the sample clamped to
    /// the owner's bounds.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::UnknownDevice`] if `owner` has no layout.
    pub fn map(
        &mut self,
        layouts: &LayoutSet,
        owner: DeviceId,
        x: i32,
        y: i32,
        now: Instant,
    ) -> Result<CursorMapping, GeometryError> {
        let source = layouts
            .get(owner)
            .ok_or(GeometryError::UnknownDevice(owner))?;

        if !self.in_cooldown(now) {
            if let Some(mapping) = self.find_transition(layouts, source, x, y) {
                self.last_transition = Some(now);
                return Ok(mapping);
            }
        }

        let (cx, cy) = source.clamp(x, y);
        Ok(CursorMapping {
            target: owner,
            x: cx,
            y: cy,
            transitioned: false,
            edge: None,
        })
    }

    fn find_transition(
        &self,
        layouts: &LayoutSet,
        source: &Layout,
        x: i32,
        y: i32,
    ) -> Option<CursorMapping> {
        let t = i32::try_from(self.config.edge_threshold).unwrap_or(i32::MAX);

        for edge in Edge::PRIORITY {
            let at_edge = match edge {
                Edge::Right => x >= source.right().saturating_sub(t),
                Edge::Left => x <= source.x.saturating_add(t),
                Edge::Bottom => y >= source.bottom().saturating_sub(t),
                Edge::Top => y <= source.y.saturating_add(t),
            };
            if !at_edge {
                continue;
            }

            let Some(target) = nearest_neighbour(layouts, source, edge, x, y) else {
                continue;
            };

            let (entry_x, entry_y) = entry_point(source, target, edge, x, y);
            debug!(
                from = %source.device_id,
                to = %target.device_id,
                ?edge,
                entry_x,
                entry_y,
                "pointer crossed screen edge"
            );
            return Some(CursorMapping {
                target: target.device_id,
                x: entry_x,
                y: entry_y,
                transitioned: true,
                edge: Some(edge),
            });
        }

        None
    }
}

// ── Geometry helpers ──────────────────────────────────────────────────────────

/// Start and length of a layout along the axis perpendicular to `edge`.
fn perpendicular_span(layout: &Layout, edge: Edge) -> (i32, i32) {
    if edge.is_horizontal() {
        (layout.y, layout.height as i32)
    } else {
        (layout.x, layout.width as i32)
    }
}

/// Gap between `source` and `candidate` across `edge`, or `None` if the
/// candidate is not on the far side of that edge.
fn gap_across(source: &Layout, candidate: &Layout, edge: Edge) -> Option<i32> {
    let gap = match edge {
        Edge::Right => candidate.x - source.right(),
        Edge::Left => source.x - candidate.right(),
        Edge::Bottom => candidate.y - source.bottom(),
        Edge::Top => source.y - candidate.bottom(),
    };
    (gap >= 0).then_some(gap)
}

fn nearest_neighbour<'a>(
    layouts: &'a LayoutSet,
    source: &Layout,
    edge: Edge,
    x: i32,
    y: i32,
) -> Option<&'a Layout> {
    let (src_start, src_len) = perpendicular_span(source, edge);
    let pointer = if edge.is_horizontal() { y } else { x };

    layouts
        .iter()
        .filter(|l| l.device_id != source.device_id)
        .filter_map(|candidate| {
            let gap = gap_across(source, candidate, edge)?;
            let (start, len) = perpendicular_span(candidate, edge);
            let overlaps = start < src_start + src_len && start + len > src_start;
            if !overlaps {
                return None;
            }
            let contains = (start..start + len).contains(&pointer);
            Some(((gap, !contains, candidate.device_id), candidate))
        })
        .min_by_key(|(key, _)| *key)
        .map(|(_, candidate)| candidate)
}

fn entry_point(source: &Layout, target: &Layout, edge: Edge, x: i32, y: i32) -> (i32, i32) {
    let (src_start, src_len) = perpendicular_span(source, edge);
    let (dst_start, dst_len) = perpendicular_span(target, edge);
    let pointer = if edge.is_horizontal() { y } else { x };

    // Raw samples are unbounded; widen before subtracting.
    let ratio = ((i64::from(pointer) - i64::from(src_start)) as f64 / f64::from(src_len)).clamp(0.0, 1.0);
    let offset = (ratio * f64::from(dst_len) * source.dpi_scale / target.dpi_scale).round() as i32;
    let along = (dst_start + offset).clamp(dst_start, dst_start + dst_len);

    match edge {
        Edge::Right => (target.x, along),
        Edge::Left => (target.right(), along),
        Edge::Bottom => (along, target.y),
        Edge::Top => (along, target.bottom()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
