//! Referrer credit counters.
//!
//! All writes to `credited_referrals` go through here. The credit for a
//! confirmed edge is applied by [`RewardAccumulator::credit_confirmation`],
//! which delegates to the store's combined swap-and-credit so the reward and
//! the `confirmed` state are written together or not at all.

use std::sync::Arc;

use crate::model::{EdgeState, User, UserId};
use crate::storage::{Credit, ReferralStore, StorageError};

#[derive(Clone)]
pub struct RewardAccumulator {
    store: Arc<dyn ReferralStore>,
    per_referral: u64,
}

impl RewardAccumulator {
    pub fn new(store: Arc<dyn ReferralStore>, per_referral: u64) -> Self {
        Self {
            store,
            per_referral,
        }
    }

    /// Credits granted for each confirmed edge.
    pub fn per_referral(&self) -> u64 {
        self.per_referral
    }

    /// Add `amount` to the referrer's counter. Atomic per referrer, so
    /// concurrent grants never lose updates.
    pub fn grant(&self, referrer: UserId, amount: u64) -> Result<u64, StorageError> {
        self.store.increment_credited(referrer, amount)
    }

    pub fn current_count(&self, referrer: UserId) -> Result<u64, StorageError> {
        self.store
            .get_user(referrer)?
            .map(|u| u.credited_referrals)
            .ok_or_else(|| StorageError::NotFound(format!("user {referrer}")))
    }

    /// Confirm the referee's edge from `expected` and credit its referrer.
    /// `None` when another writer already moved the edge.
    pub(crate) fn credit_confirmation(
        &self,
        referee: UserId,
        expected: EdgeState,
        at: u64,
    ) -> Result<Option<Credit>, StorageError> {
        self.store
            .confirm_edge_and_credit(referee, expected, self.per_referral, at)
    }

    pub fn leaderboard(&self, limit: usize) -> Result<Vec<User>, StorageError> {
        self.store.top_referrers(limit)
    }
}
