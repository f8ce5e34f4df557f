//! Idempotency ledger shared by every runner in a process.
//!
//! A key is reserved before a side effect is dispatched and confirmed once the
//! effect is known to have happened. A confirmed key is never dispatched again.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    InFlight { action_id: Uuid },
    Unknown { action_id: Uuid },
    Confirmed { action_id: Uuid, proof: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// The caller now owns the key and may dispatch.
    Fresh,
    /// The effect already happened; replay the recorded result.
    AlreadyConfirmed { action_id: Uuid, proof: Option<String> },
    /// Another attempt holds the key or its outcome is still unresolved.
    Busy { action_id: Uuid },
}

#[derive(Debug, Default)]
pub struct IdempotencyLedger {
    entries: Mutex<HashMap<String, Entry>>,
}

impl IdempotencyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&self, key: &str, action_id: Uuid) -> Reservation {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(Entry::Confirmed { action_id, proof }) => Reservation::AlreadyConfirmed {
                action_id: *action_id,
                proof: proof.clone(),
            },
            Some(Entry::InFlight { action_id: holder }) | Some(Entry::Unknown { action_id: holder })
                if *holder != action_id =>
            {
                Reservation::Busy { action_id: *holder }
            }
            _ => {
                entries.insert(key.to_string(), Entry::InFlight { action_id });
                Reservation::Fresh
            }
        }
    }

    pub fn confirm(&self, key: &str, action_id: Uuid, proof: Option<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), Entry::Confirmed { action_id, proof });
    }

    /// Outcome is unknown; keep the key blocked until verification resolves it.
    pub fn mark_unknown(&self, key: &str, action_id: Uuid) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(entries.get(key), Some(Entry::Confirmed { .. })) {
            entries.insert(key.to_string(), Entry::Unknown { action_id });
        }
    }

    /// The effect definitely did not happen; free the key for a retry.
    pub fn release(&self, key: &str, action_id: Uuid) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let held = matches!(
            entries.get(key),
            Some(Entry::InFlight { action_id: holder }) | Some(Entry::Unknown { action_id: holder })
                if *holder == action_id
        );
        if held {
            entries.remove(key);
        }
    }

    pub fn is_confirmed(&self, key: &str) -> bool {
        matches!(
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key),
            Some(Entry::Confirmed { .. })
        )
    }
}
