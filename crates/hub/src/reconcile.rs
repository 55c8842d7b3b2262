//! Ping inbox and the reconciliation pass that folds it into the registry.

use std::collections::{BTreeSet, HashSet};

use crate::registry::{DeviceRegistry, Upsert};

/// Addresses reported since the last tick. Duplicates collapse on insert.
#[derive(Debug, Default)]
pub struct PingInbox {
    addresses: BTreeSet<String>,
}

impl PingInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a liveness report. Returns `false` for blank addresses and for
    /// addresses already queued this tick.
    pub fn report(&mut self, address: &str) -> bool {
        let address = address.trim();
        if address.is_empty() {
            return false;
        }
        self.addresses.insert(address.to_string())
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Take every queued address, leaving the inbox empty.
    pub fn drain(&mut self) -> Vec<String> {
        std::mem::take(&mut self.addresses).into_iter().collect()
    }
}

/// What one reconciliation pass did to the registry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub refreshed: Vec<u64>,
    pub created: Vec<u64>,
}

/// Apply a batch of reported addresses at time `now`. Each distinct address
/// is reconciled once, no matter how often it appears in the batch.
pub fn reconcile<I>(registry: &mut DeviceRegistry, addresses: I, now: i64) -> Reconciliation
where
    I: IntoIterator<Item = String>,
{
    let mut outcome = Reconciliation::default();
    let mut handled: HashSet<String> = HashSet::new();

    for address in addresses {
        if !handled.insert(address.clone()) {
            continue;
        }
        match registry.upsert_by_address(&address, now) {
            Upsert::Refreshed(id) => outcome.refreshed.push(id),
            Upsert::Created(id) => outcome.created.push(id),
        }
    }

    outcome
}

// ===========================================================================
// Tests
// ===========================================================================
