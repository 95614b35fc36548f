//! Target selection for distributed work

use serde::{Deserialize, Serialize};

use crate::protocol::Address;

/// Strategy used to pick the node that should run a work item
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    /// Node with the most free slots in the work's pool
    #[default]
    MaxFree,
    /// This node while it has a free slot, otherwise `MaxFree`
    LocalFirst,
}

impl Selector {
    /// Pick a target from `(address, free slots)` candidates.
    ///
    /// Falls back to `local` when no candidate has capacity, so the local
    /// engine gets to reject or queue the work.
    pub fn select(&self, local: &Address, candidates: &[(Address, u64)]) -> Address {
        if *self == Selector::LocalFirst
            && candidates.iter().any(|(a, free)| a == local && *free > 0)
        {
            return local.clone();
        }

        candidates
            .iter()
            .filter(|(_, free)| *free > 0)
            .max_by(|(a, fa), (b, fb)| {
                fa.cmp(fb)
                    .then_with(|| (a == local).cmp(&(b == local)))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|(a, _)| a.clone())
            .unwrap_or_else(|| local.clone())
    }
}
