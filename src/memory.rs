//! In-process [`ReferralStore`] for embedding and tests.
//!
//! One mutex guards all maps, so every trait method is atomic with respect to
//! every other, matching what the SQLite backend gets from transactions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::model::{
    EdgeState, LedgerStats, ReferralEdge, RejectReason, Subscription, User, UserId,
};
use crate::storage::{Credit, ReferralStore, StorageError};

/// Observations kept per user; older ones are dropped.
const CHECK_HISTORY_CAP: usize = 64;

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, User>,
    edges: HashMap<UserId, ReferralEdge>,
    checks: HashMap<UserId, VecDeque<bool>>,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Poisoned)
    }
}

fn user_mut(inner: &mut Inner, id: UserId) -> Result<&mut User, StorageError> {
    inner
        .users
        .get_mut(&id)
        .ok_or_else(|| StorageError::NotFound(format!("user {id}")))
}

fn sorted(mut edges: Vec<ReferralEdge>) -> Vec<ReferralEdge> {
    edges.sort_by_key(|e| (e.created_at, e.referee_id));
    edges
}

impl ReferralStore for MemoryStorage {
    fn get_user(&self, id: UserId) -> Result<Option<User>, StorageError> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    fn insert_user(&self, user: &User) -> Result<bool, StorageError> {
        let mut inner = self.lock()?;
        if inner.users.contains_key(&user.id) {
            return Ok(false);
        }
        inner.users.insert(user.id, user.clone());
        Ok(true)
    }

    fn set_subscribed(&self, id: UserId, status: Subscription) -> Result<(), StorageError> {
        user_mut(&mut *self.lock()?, id)?.subscribed = status;
        Ok(())
    }

    fn set_banned(&self, id: UserId, banned: bool) -> Result<(), StorageError> {
        user_mut(&mut *self.lock()?, id)?.banned = banned;
        Ok(())
    }

    fn increment_credited(&self, id: UserId, amount: u64) -> Result<u64, StorageError> {
        let mut inner = self.lock()?;
        let user = user_mut(&mut inner, id)?;
        user.credited_referrals = user.credited_referrals.saturating_add(amount);
        Ok(user.credited_referrals)
    }

    fn top_referrers(&self, limit: usize) -> Result<Vec<User>, StorageError> {
        let inner = self.lock()?;
        let mut users: Vec<User> = inner
            .users
            .values()
            .filter(|u| !u.banned && u.credited_referrals > 0)
            .cloned()
            .collect();
        users.sort_by(|a, b| {
            b.credited_referrals
                .cmp(&a.credited_referrals)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        users.truncate(limit);
        Ok(users)
    }

    fn insert_edge(&self, edge: &ReferralEdge) -> Result<bool, StorageError> {
        if edge.referee_id == edge.referrer_id {
            return Err(StorageError::Corrupt(format!(
                "self referral edge for {}",
                edge.referee_id
            )));
        }
        let mut inner = self.lock()?;
        if inner.edges.contains_key(&edge.referee_id) {
            return Ok(false);
        }
        let referee = user_mut(&mut inner, edge.referee_id)?;
        if referee.referred_by.is_some() {
            return Err(StorageError::NotFound(format!(
                "referee {} (or already linked)",
                edge.referee_id
            )));
        }
        referee.referred_by = Some(edge.referrer_id);
        inner.edges.insert(edge.referee_id, edge.clone());
        Ok(true)
    }

    fn get_edge(&self, referee: UserId) -> Result<Option<ReferralEdge>, StorageError> {
        Ok(self.lock()?.edges.get(&referee).cloned())
    }

    fn compare_and_set_edge(
        &self,
        referee: UserId,
        expected: EdgeState,
        next: EdgeState,
        reason: Option<RejectReason>,
        at: u64,
    ) -> Result<bool, StorageError> {
        let mut inner = self.lock()?;
        let Some(edge) = inner.edges.get_mut(&referee) else {
            return Ok(false);
        };
        if edge.state != expected {
            return Ok(false);
        }
        edge.state = next;
        edge.reject_reason = reason;
        edge.updated_at = at;
        if next == EdgeState::Confirmed {
            edge.confirmed_at = Some(at);
        }
        Ok(true)
    }

    fn confirm_edge_and_credit(
        &self,
        referee: UserId,
        expected: EdgeState,
        amount: u64,
        at: u64,
    ) -> Result<Option<Credit>, StorageError> {
        let mut inner = self.lock()?;
        let referrer_id = match inner.edges.get(&referee) {
            Some(edge) if edge.state == expected => edge.referrer_id,
            _ => return Ok(None),
        };
        // Credit first so a missing referrer leaves the edge untouched.
        let referrer = inner.users.get_mut(&referrer_id).ok_or_else(|| {
            StorageError::NotFound(format!("referrer {referrer_id} of {referee}"))
        })?;
        referrer.credited_referrals = referrer.credited_referrals.saturating_add(amount);
        let new_count = referrer.credited_referrals;

        if let Some(edge) = inner.edges.get_mut(&referee) {
            edge.state = EdgeState::Confirmed;
            edge.reject_reason = None;
            edge.confirmed_at = Some(at);
            edge.updated_at = at;
        }
        Ok(Some(Credit {
            referrer_id,
            new_count,
        }))
    }

    fn list_edges(&self, state: Option<EdgeState>) -> Result<Vec<ReferralEdge>, StorageError> {
        let inner = self.lock()?;
        Ok(sorted(
            inner
                .edges
                .values()
                .filter(|e| state.map_or(true, |s| e.state == s))
                .cloned()
                .collect(),
        ))
    }

    fn edges_for_referrer(&self, referrer: UserId) -> Result<Vec<ReferralEdge>, StorageError> {
        let inner = self.lock()?;
        Ok(sorted(
            inner
                .edges
                .values()
                .filter(|e| e.referrer_id == referrer)
                .cloned()
                .collect(),
        ))
    }

    fn pending_created_before(&self, cutoff: u64) -> Result<Vec<ReferralEdge>, StorageError> {
        let inner = self.lock()?;
        Ok(sorted(
            inner
                .edges
                .values()
                .filter(|e| e.state == EdgeState::Pending && e.created_at <= cutoff)
                .cloned()
                .collect(),
        ))
    }

    fn record_check(&self, id: UserId, subscribed: bool, _at: u64) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let history = inner.checks.entry(id).or_default();
        history.push_front(subscribed);
        history.truncate(CHECK_HISTORY_CAP);
        Ok(())
    }

    fn recent_checks(&self, id: UserId, limit: usize) -> Result<Vec<bool>, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .checks
            .get(&id)
            .map(|h| h.iter().take(limit).copied().collect())
            .unwrap_or_default())
    }

    fn purge_user(&self, id: UserId, at: u64) -> Result<bool, StorageError> {
        let mut inner = self.lock()?;
        inner.edges.remove(&id);
        for edge in inner.edges.values_mut() {
            if edge.referrer_id == id && edge.state != EdgeState::Confirmed {
                edge.state = EdgeState::Rejected;
                edge.reject_reason = Some(RejectReason::ReferrerRemoved);
                edge.updated_at = at;
            }
        }
        inner.checks.remove(&id);
        Ok(inner.users.remove(&id).is_some())
    }

    fn stats(&self) -> Result<LedgerStats, StorageError> {
        let inner = self.lock()?;
        let mut stats = LedgerStats {
            users: inner.users.len() as u64,
            banned_users: inner.users.values().filter(|u| u.banned).count() as u64,
            total_credited: inner.users.values().map(|u| u.credited_referrals).sum(),
            ..LedgerStats::default()
        };
        for edge in inner.edges.values() {
            match edge.state {
                EdgeState::Pending => stats.pending += 1,
                EdgeState::Confirmed => stats.confirmed += 1,
                EdgeState::Rejected => stats.rejected += 1,
            }
        }
        Ok(stats)
    }
}
