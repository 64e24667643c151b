//! Referral edges and their guarded state transitions.
//!
//! One edge per referee, first touch wins. Every state change is a
//! compare-and-set keyed by the state the caller observed, so replaying an
//! event after it succeeded observes `InvalidTransition` and writes nothing.

use std::sync::Arc;

use crate::model::{now_secs, EdgeState, ReferralEdge, RejectReason, UserId};
use crate::reward::RewardAccumulator;
use crate::storage::{Credit, ReferralStore, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(ReferralEdge),
    /// The referee already has an edge; it is returned unchanged.
    AlreadyExists(ReferralEdge),
    SelfReferral,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Ok {
        from: EdgeState,
        to: EdgeState,
        /// Set when the transition confirmed the edge.
        credit: Option<Credit>,
    },
    NotFound,
    InvalidTransition {
        current: EdgeState,
    },
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn ReferralStore>,
    rewards: RewardAccumulator,
    allow_recovery: bool,
}

impl Ledger {
    pub fn new(store: Arc<dyn ReferralStore>, rewards: RewardAccumulator, allow_recovery: bool) -> Self {
        Self {
            store,
            rewards,
            allow_recovery,
        }
    }

    pub fn allow_recovery(&self) -> bool {
        self.allow_recovery
    }

    pub fn get(&self, referee: UserId) -> Result<Option<ReferralEdge>, StorageError> {
        self.store.get_edge(referee)
    }

    pub fn try_create_edge(
        &self,
        referrer: UserId,
        referee: UserId,
    ) -> Result<CreateOutcome, StorageError> {
        if referrer == referee {
            return Ok(CreateOutcome::SelfReferral);
        }
        let edge = ReferralEdge::pending(referrer, referee, now_secs());
        if self.store.insert_edge(&edge)? {
            return Ok(CreateOutcome::Created(edge));
        }
        let existing = self
            .store
            .get_edge(referee)?
            .ok_or_else(|| StorageError::NotFound(format!("edge for {referee} after conflict")))?;
        Ok(CreateOutcome::AlreadyExists(existing))
    }

    /// Move the referee's edge to `next`.
    ///
    /// `reason` is recorded for `rejected`; a rejection without a reason is
    /// never recoverable. Confirming also grants the referrer's credit in the
    /// same store write.
    pub fn transition(
        &self,
        referee: UserId,
        next: EdgeState,
        reason: Option<RejectReason>,
    ) -> Result<TransitionOutcome, StorageError> {
        self.transition_at(referee, next, reason, now_secs())
    }

    pub fn transition_at(
        &self,
        referee: UserId,
        next: EdgeState,
        reason: Option<RejectReason>,
        at: u64,
    ) -> Result<TransitionOutcome, StorageError> {
        // Each lost race means the edge moved forward, and the state graph is
        // acyclic, so this settles within a couple of rounds.
        loop {
            let Some(edge) = self.store.get_edge(referee)? else {
                return Ok(TransitionOutcome::NotFound);
            };
            if !edge.can_transition_to(next, self.allow_recovery) {
                return Ok(TransitionOutcome::InvalidTransition {
                    current: edge.state,
                });
            }

            let applied = match next {
                EdgeState::Confirmed => self
                    .rewards
                    .credit_confirmation(referee, edge.state, at)?
                    .map(Some),
                EdgeState::Rejected => self
                    .store
                    .compare_and_set_edge(referee, edge.state, next, reason, at)?
                    .then_some(None),
                EdgeState::Pending => None,
            };

            if let Some(credit) = applied {
                return Ok(TransitionOutcome::Ok {
                    from: edge.state,
                    to: next,
                    credit,
                });
            }
        }
    }

    pub fn edges_for_referrer(&self, referrer: UserId) -> Result<Vec<ReferralEdge>, StorageError> {
        self.store.edges_for_referrer(referrer)
    }

    pub fn list(&self, state: Option<EdgeState>) -> Result<Vec<ReferralEdge>, StorageError> {
        self.store.list_edges(state)
    }

    /// Pending edges whose grace window has elapsed at `now`.
    pub fn overdue(&self, now: u64, grace_period_secs: u64) -> Result<Vec<ReferralEdge>, StorageError> {
        self.store
            .pending_created_before(now.saturating_sub(grace_period_secs))
    }
}
