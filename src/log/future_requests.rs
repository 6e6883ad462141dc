//! Holding area for requests addressed to views not yet installed
//!
//! Sequencer message handlers apply one uniform policy: a message for a
//! future view is held here, released in arrival order when that view
//! installs, and dropped with a warning when a superseding view installs
//! first.

use std::collections::HashMap;
use tracing::warn;

/// On-hold requests, keyed by the view they wait for
pub struct FutureRequests<T> {
    next_view_id: u16,
    onhold: HashMap<u16, Vec<T>>,
}

impl<T> FutureRequests<T> {
    pub fn new() -> Self {
        Self {
            next_view_id: 0,
            onhold: HashMap::new(),
        }
    }

    /// Hold `request` until `view_id` installs. Requests for views that
    /// already installed are dropped with a warning; the caller should
    /// have treated them as current or stale.
    pub fn on_hold_request(&mut self, view_id: u16, request: T) {
        if view_id < self.next_view_id {
            warn!(
                view_id,
                next_view_id = self.next_view_id,
                "Dropping on-hold request for an already-installed view"
            );
            return;
        }
        self.onhold.entry(view_id).or_default().push(request);
    }

    /// A view installed. Requests waiting for it move to `ready_requests`
    /// in arrival order; requests for superseded views are dropped with a
    /// warning.
    ///
    /// Passing `None` asserts that nothing can be waiting (used by nodes
    /// outside the view): panics if requests were held for it.
    pub fn on_new_view(&mut self, view_id: u16, mut ready_requests: Option<&mut Vec<T>>) {
        let superseded: Vec<u16> = self
            .onhold
            .keys()
            .copied()
            .filter(|&held_view| held_view < view_id)
            .collect();
        for held_view in superseded {
            if let Some(dropped) = self.onhold.remove(&held_view) {
                warn!(
                    view_id = held_view,
                    dropped = dropped.len(),
                    "View superseded without installing; dropping held requests"
                );
            }
        }
        if let Some(held) = self.onhold.remove(&view_id) {
            match ready_requests.as_deref_mut() {
                Some(ready) => ready.extend(held),
                None => panic!("requests on hold for view {view_id} with no consumer"),
            }
        }
        self.next_view_id = view_id + 1;
    }

    pub fn onhold_count(&self) -> usize {
        self.onhold.values().map(Vec::len).sum()
    }
}

impl<T> Default for FutureRequests<T> {
    fn default() -> Self {
        Self::new()
    }
}
