//! Edge detection for a consumer's read position.

use backfill_core::Edge;

/// Which edge, if any, a read at `offset` into a window of `window_len`
/// items has come within `prefetch_distance` of.
///
/// An empty window always reports [`Edge::End`]: nothing has been loaded,
/// so the only useful fetch is the next page. When a window is small enough
/// that both edges are in range, `End` wins. Offsets past the window are
/// treated as the last item.
pub fn detect_boundary(window_len: usize, offset: usize, prefetch_distance: usize) -> Option<Edge> {
    if window_len == 0 {
        return Some(Edge::End);
    }
    let last = window_len - 1;
    let offset = offset.min(last);

    if last - offset <= prefetch_distance {
        Some(Edge::End)
    } else if offset <= prefetch_distance {
        Some(Edge::Start)
    } else {
        None
    }
}
