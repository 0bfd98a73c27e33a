//! Ring math for the Chang–Roberts election. The ring is the group view's
//! uuids sorted descending and treated cyclically; the leader is the ring
//! maximum. The election state machine itself lives in the server, which
//! owns the transport; this module keeps the pure parts testable.

use uuid::Uuid;

use crate::message::GroupView;

/// The node a given member forwards election messages to: the next uuid in
/// descending cyclic order. `None` when the view holds nobody else.
pub fn neighbor(view: &GroupView, id: Uuid) -> Option<Uuid> {
    let mut ring = Vec::from_iter(view.keys().copied());
    ring.sort_unstable_by(|a, b| b.cmp(a));
    if ring.len() < 2 {
        return None;
    }
    let position = ring.iter().position(|&member| member == id)?;
    Some(ring[(position + 1) % ring.len()])
}

/// The ring maximum, i.e. who the membership says should lead.
pub fn ring_max(view: &GroupView) -> Option<Uuid> {
    view.keys().next_back().copied()
}

pub fn is_ring_max(view: &GroupView, id: Uuid) -> bool {
    ring_max(view) == Some(id)
}
