//! Virtual screen space
//!
//! The controller's screen sits at the origin of a virtual coordinate space.
//! Each node's screen is a rectangle adjacent to it on the node's configured
//! side. Crossing the shared boundary moves the cursor into the neighbour's
//! local coordinates: the coordinate along the edge is scaled to the target
//! edge length, the other coordinate lands on the facing edge.

use crate::protocol::ScreenEdge;

/// Size of one screen in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenRect {
    pub width: u32,
    pub height: u32,
}

impl ScreenRect {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn max_x(&self) -> i32 {
        self.width.saturating_sub(1) as i32
    }

    pub fn max_y(&self) -> i32 {
        self.height.saturating_sub(1) as i32
    }

    pub fn centre(&self) -> (i32, i32) {
        ((self.width / 2) as i32, (self.height / 2) as i32)
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        (0..=self.max_x()).contains(&x) && (0..=self.max_y()).contains(&y)
    }

    pub fn clamp(&self, x: i32, y: i32) -> (i32, i32) {
        (x.clamp(0, self.max_x()), y.clamp(0, self.max_y()))
    }

    /// Length of an edge in pixels
    pub fn edge_len(&self, edge: ScreenEdge) -> u32 {
        if edge.is_vertical() {
            self.height
        } else {
            self.width
        }
    }

    /// Point on `edge` at `along`, moved `inset` pixels into the screen
    pub fn point_on_edge(&self, edge: ScreenEdge, along: i32, inset: i32) -> (i32, i32) {
        let point = match edge {
            ScreenEdge::Left => (inset, along),
            ScreenEdge::Right => (self.max_x() - inset, along),
            ScreenEdge::Top => (along, inset),
            ScreenEdge::Bottom => (along, self.max_y() - inset),
        };
        self.clamp(point.0, point.1)
    }
}

/// Scale a coordinate along an edge of `from_len` pixels onto one of
/// `to_len` pixels. First and last pixels map onto each other.
pub fn scale_along(along: i32, from_len: u32, to_len: u32) -> i32 {
    let to_max = i64::from(to_len.saturating_sub(1));
    let from_max = i64::from(from_len.saturating_sub(1));
    if from_max == 0 {
        return 0;
    }
    let along = i64::from(along).clamp(0, from_max);
    let scaled = (along * to_max + from_max / 2) / from_max;
    scaled as i32
}

/// Where the cursor enters a neighbour after leaving `from` through
/// `exit_edge` at `along`. Returns the neighbour's entry edge and the point
/// on it.
pub fn entry_point(
    exit_edge: ScreenEdge,
    along: i32,
    from: ScreenRect,
    to: ScreenRect,
) -> (ScreenEdge, (i32, i32)) {
    let entry_edge = exit_edge.opposite();
    let scaled = scale_along(along, from.edge_len(exit_edge), to.edge_len(entry_edge));
    (entry_edge, to.point_on_edge(entry_edge, scaled, 0))
}

/// Where the cursor lands back on the controller when it leaves a node
/// through `node_edge` at `along`. The point is `inset` pixels inside the
/// controller screen so it does not sit on the edge it just came through.
pub fn return_point(
    node_edge: ScreenEdge,
    along: i32,
    node: ScreenRect,
    controller: ScreenRect,
    inset: i32,
) -> (i32, i32) {
    let controller_edge = node_edge.opposite();
    let scaled = scale_along(along, node.edge_len(node_edge), controller.edge_len(controller_edge));
    controller.point_on_edge(controller_edge, scaled, inset)
}
