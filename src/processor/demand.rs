//! Demand accounting and credit arithmetic for the link processor.
//!
//! Downstream demand follows the reactive-streams convention: `u64::MAX`
//! means unbounded. While demand is unbounded the link is kept topped up to
//! the configured prefetch instead.

use std::collections::VecDeque;

/// Demand value meaning "deliver everything".
pub const UNBOUNDED: u64 = u64::MAX;

/// Number of credits a link should hold for the given demand.
pub(crate) fn effective_demand(requested: u64, prefetch: u32) -> u32 {
    if requested == UNBOUNDED {
        prefetch
    } else {
        u32::try_from(requested).unwrap_or(u32::MAX)
    }
}

/// Credits to add so the link holds exactly the effective demand.
///
/// Never negative: a link already holding enough credit gets zero.
pub(crate) fn credits_to_add(requested: u64, prefetch: u32, link_credits: u32) -> u32 {
    effective_demand(requested, prefetch).saturating_sub(link_credits)
}

/// Outstanding demand plus messages that arrived before demand did.
///
/// Messages are released strictly in arrival order and only while demand is
/// positive, so deliveries never exceed cumulative requests.
#[derive(Debug)]
pub(super) struct DemandLedger<T> {
    requested: u64,
    held: VecDeque<T>,
}

impl<T> Default for DemandLedger<T> {
    fn default() -> Self {
        Self {
            requested: 0,
            held: VecDeque::new(),
        }
    }
}

impl<T> DemandLedger<T> {
    /// Add `n` to outstanding demand. Saturates into unbounded.
    pub(super) fn request(&mut self, n: u64) {
        self.requested = self.requested.saturating_add(n);
    }

    /// Queue an item received from the link.
    pub(super) fn offer(&mut self, item: T) { self.held.push_back(item); }

    /// Pop the next item if demand allows, consuming one unit of demand.
    pub(super) fn next_deliverable(&mut self) -> Option<T> {
        if self.requested == 0 {
            return None;
        }
        let item = self.held.pop_front()?;
        if self.requested != UNBOUNDED {
            self.requested -= 1;
        }
        Some(item)
    }

    /// Outstanding demand.
    pub(super) fn requested(&self) -> u64 { self.requested }

    /// Number of items waiting for demand.
    pub(super) fn held(&self) -> usize { self.held.len() }

    /// Drop any items still waiting for demand.
    pub(super) fn clear(&mut self) { self.held.clear(); }
}
