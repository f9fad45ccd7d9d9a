use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::models::ledger::ReminderKind;

type ClaimKey = (String, ReminderKind, String);

/// In-flight (user, kind, key) deliveries of this process. Holding a claim
/// means no other run may deliver the same reminder until it is dropped.
#[derive(Debug, Clone, Default)]
pub struct DeliveryClaims {
    held: Arc<Mutex<HashSet<ClaimKey>>>,
}

/// Released on drop.
#[derive(Debug)]
pub struct Claim {
    held: Arc<Mutex<HashSet<ClaimKey>>>,
    key: ClaimKey,
}

impl DeliveryClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when another task holds the same triple.
    pub fn try_claim(&self, user_id: &str, kind: ReminderKind, dedup_key: &str) -> Option<Claim> {
        let key = (user_id.to_string(), kind, dedup_key.to_string());
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !held.insert(key.clone()) {
            return None;
        }
        Some(Claim {
            held: self.held.clone(),
            key,
        })
    }

    pub fn in_flight(&self) -> usize {
        self.held.lock().map(|held| held.len()).unwrap_or(0)
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.key);
    }
}
