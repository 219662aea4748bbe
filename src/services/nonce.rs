//! Per-account order nonces.
//!
//! An order is only admissible while its nonce equals the account's current
//! value; the value advances on every successful first admission, retiring
//! any other intents signed under the old nonce.

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use ethers::types::U256;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceRecord {
    pub account_id: u128,
    pub nonce: U256,
    /// Last time this account's nonce moved (unix seconds)
    pub last_seen: u64,
}

pub type NonceSnapshot = Vec<NonceRecord>;

/// Registry of account nonces, shared across engines.
#[derive(Default)]
pub struct NonceRegistry {
    records: DashMap<u128, NonceRecord>,
    dirty: AtomicBool,
}

impl NonceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current nonce for the account; zero for accounts never seen.
    pub fn current(&self, account_id: u128) -> U256 {
        self.records
            .get(&account_id)
            .map(|r| r.nonce)
            .unwrap_or_default()
    }

    /// Whether the submitted nonce equals the account's current value.
    pub fn matches(&self, account_id: u128, nonce: U256) -> bool {
        self.current(account_id) == nonce
    }

    /// Advance the account's nonce by one.
    pub fn increment(&self, account_id: u128) {
        let now = chrono::Utc::now().timestamp() as u64;
        self.records
            .entry(account_id)
            .and_modify(|r| {
                r.nonce += U256::one();
                r.last_seen = now;
            })
            .or_insert_with(|| NonceRecord {
                account_id,
                nonce: U256::one(),
                last_seen: now,
            });
        self.dirty.store(true, Ordering::Release);
    }

    /// True once per mutation batch; used to skip no-op persistence flushes.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn snapshot(&self) -> NonceSnapshot {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    pub fn restore(&self, snapshot: NonceSnapshot) {
        for record in snapshot {
            self.records.insert(record.account_id, record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_accounts_start_at_zero() {
        let registry = NonceRegistry::new();
        assert_eq!(registry.current(1), U256::zero());
        assert!(registry.matches(1, U256::zero()));
        assert!(!registry.matches(1, U256::one()));
    }

    #[test]
    fn increment_advances_by_one() {
        let registry = NonceRegistry::new();
        registry.increment(1);
        registry.increment(1);
        assert_eq!(registry.current(1), U256::from(2));
        // Other accounts are unaffected
        assert_eq!(registry.current(2), U256::zero());
    }

    #[test]
    fn dirty_flag_is_consumed_once() {
        let registry = NonceRegistry::new();
        assert!(!registry.take_dirty());
        registry.increment(1);
        assert!(registry.take_dirty());
        assert!(!registry.take_dirty());
    }

    #[test]
    fn snapshot_restore_round_trips() {
        let registry = NonceRegistry::new();
        registry.increment(1);
        registry.increment(7);
        registry.increment(7);

        let restored = NonceRegistry::new();
        restored.restore(registry.snapshot());
        assert_eq!(restored.current(1), U256::one());
        assert_eq!(restored.current(7), U256::from(2));
    }
}
