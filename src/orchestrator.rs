//! Attribution orchestrator: the referral state machine.
//!
//! Inbound events (a join with an optional invite code, a subscription
//! change, a recheck request) are handled under a per-user lock so events
//! for one referee apply in arrival order. Platform checks run before the
//! lock is taken; only their boolean result is used inside it.
//!
//! Every event either moves an edge or is logged as a no-op with its reason.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::InviteCodec;
use crate::gate::{SubscriptionChecker, SubscriptionGate, Verdict};
use crate::identity::IdentityStore;
use crate::ledger::{CreateOutcome, Ledger, TransitionOutcome};
use crate::locks::KeyedLocks;
use crate::logging;
use crate::model::{now_secs, EdgeState, LedgerStats, ReferralEdge, RejectReason, User, UserId};
use crate::reward::RewardAccumulator;
use crate::rlog;
use crate::storage::{ReferralStore, StorageError};

/// Fewer observations than this are never judged suspicious.
const MIN_OBSERVATIONS_FOR_SUSPICION: usize = 4;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum EngineError {
    Storage(StorageError),
    /// An event referenced a user that was never created.
    NotFound(UserId),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Storage(e) => write!(f, "{e}"),
            EngineError::NotFound(id) => write!(f, "user {id} referenced before creation"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        EngineError::Storage(e)
    }
}

// ---------------------------------------------------------------------------
// Events and outcomes
// ---------------------------------------------------------------------------

/// Inbound platform event, as replayed from a JSON-lines log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReferralEvent {
    Joined {
        user: UserId,
        #[serde(default)]
        code: Option<String>,
    },
    Subscription {
        user: UserId,
        subscribed: bool,
    },
    Recheck {
        user: UserId,
    },
}

impl ReferralEvent {
    /// The user whose lock the event is handled under.
    pub fn user(&self) -> UserId {
        match self {
            ReferralEvent::Joined { user, .. }
            | ReferralEvent::Subscription { user, .. }
            | ReferralEvent::Recheck { user } => *user,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JoinOutcome {
    /// No invite code was presented.
    NoReferral { created: bool },
    /// A new edge was recorded; `state` is where it stands after the
    /// optional verify-on-join check.
    Attributed {
        referrer: UserId,
        state: EdgeState,
        credited: Option<u64>,
    },
    InvalidCode { reason: String },
    SelfReferral,
    UnknownReferrer { referrer: UserId },
    ReferrerBanned { referrer: UserId },
    Banned,
    /// The user already has an edge; first touch wins.
    AlreadyExists { referrer: UserId },
    /// The user existed before this join and was never referred.
    NotFirstContact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubscriptionOutcome {
    Credited {
        referrer: UserId,
        count: u64,
        /// The edge had been rejected as expired and was recovered.
        recovered: bool,
    },
    StillPending { referrer: UserId },
    Rejected { referrer: UserId, reason: RejectReason },
    AlreadyConfirmed { referrer: UserId },
    /// The edge is in a state this observation cannot move.
    Unchanged { state: EdgeState },
    NoEdge,
    Banned,
    CheckUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EventOutcome {
    Join(JoinOutcome),
    Subscription(SubscriptionOutcome),
}

/// Totals for one pass over overdue pending edges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub confirmed: usize,
    pub rejected: usize,
    pub unavailable: usize,
    pub unchanged: usize,
    /// Edges whose recheck hit a storage error; retried next pass.
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AttributionPolicy {
    pub grace_period_secs: u64,
    pub allow_recovery: bool,
    pub verify_on_join: bool,
    pub reward_per_referral: u64,
    pub suspicious_window: usize,
    pub suspicious_flips: usize,
}

impl Default for AttributionPolicy {
    fn default() -> Self {
        Self {
            grace_period_secs: 86_400,
            allow_recovery: true,
            verify_on_join: true,
            reward_per_referral: 1,
            suspicious_window: 10,
            suspicious_flips: 3,
        }
    }
}

pub struct Orchestrator<C> {
    store: Arc<dyn ReferralStore>,
    identities: IdentityStore,
    ledger: Ledger,
    rewards: RewardAccumulator,
    gate: SubscriptionGate<C>,
    locks: KeyedLocks,
    policy: AttributionPolicy,
}

impl<C: SubscriptionChecker> Orchestrator<C> {
    pub fn new(
        store: Arc<dyn ReferralStore>,
        codec: InviteCodec,
        gate: SubscriptionGate<C>,
        policy: AttributionPolicy,
    ) -> Self {
        let identities = IdentityStore::new(store.clone(), codec);
        let rewards = RewardAccumulator::new(store.clone(), policy.reward_per_referral);
        let ledger = Ledger::new(store.clone(), rewards.clone(), policy.allow_recovery);
        Self {
            store,
            identities,
            ledger,
            rewards,
            gate,
            locks: KeyedLocks::new(),
            policy,
        }
    }

    pub fn identities(&self) -> &IdentityStore {
        &self.identities
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn rewards(&self) -> &RewardAccumulator {
        &self.rewards
    }

    pub fn gate(&self) -> &SubscriptionGate<C> {
        &self.gate
    }

    pub fn policy(&self) -> &AttributionPolicy {
        &self.policy
    }

    pub fn invite_code(&self, user: UserId) -> String {
        self.identities.codec().encode(user)
    }

    pub async fn handle(&self, event: ReferralEvent) -> Result<EventOutcome, EngineError> {
        match event {
            ReferralEvent::Joined { user, code } => self
                .on_join(user, code.as_deref())
                .await
                .map(EventOutcome::Join),
            ReferralEvent::Subscription { user, subscribed } => self
                .on_subscription_event(user, subscribed)
                .await
                .map(EventOutcome::Subscription),
            ReferralEvent::Recheck { user } => {
                self.recheck(user).await.map(EventOutcome::Subscription)
            }
        }
    }

    /// A user contacted the bot, possibly through someone's invite link.
    pub async fn on_join(
        &self,
        user: UserId,
        code: Option<&str>,
    ) -> Result<JoinOutcome, EngineError> {
        let edge = {
            let _guard = self.locks.lock(user).await;
            match self.attribute(user, code)? {
                Ok(edge) => edge,
                Err(outcome) => return Ok(outcome),
            }
        };
        rlog!(
            "join: {} attributed to {} (pending)",
            logging::user(user),
            logging::user(edge.referrer_id)
        );

        let mut state = EdgeState::Pending;
        let mut credited = None;
        if self.policy.verify_on_join {
            match self.recheck(user).await? {
                SubscriptionOutcome::Credited { count, .. } => {
                    state = EdgeState::Confirmed;
                    credited = Some(count);
                }
                SubscriptionOutcome::Rejected { .. } => state = EdgeState::Rejected,
                _ => {}
            }
        }
        Ok(JoinOutcome::Attributed {
            referrer: edge.referrer_id,
            state,
            credited,
        })
    }

    /// Register the user and try to create its edge. Runs under the user's
    /// lock. `Err` carries the final outcome when no edge was created.
    fn attribute(
        &self,
        user: UserId,
        code: Option<&str>,
    ) -> Result<Result<ReferralEdge, JoinOutcome>, EngineError> {
        let registration = self.identities.get_or_create(user)?;
        if registration.created {
            rlog!(
                "join: registered {} with code {}",
                logging::user(user),
                logging::code(&registration.user.invite_code)
            );
        }
        if registration.user.banned {
            rlog!("join: ignoring banned {}", logging::user(user));
            return Ok(Err(JoinOutcome::Banned));
        }
        let Some(raw) = code else {
            return Ok(Err(JoinOutcome::NoReferral {
                created: registration.created,
            }));
        };

        let referrer = match self.identities.codec().decode(raw) {
            Ok(id) => id,
            Err(e) => {
                rlog!(
                    "join: {} presented invalid code {}: {}",
                    logging::user(user),
                    logging::code(raw),
                    e
                );
                return Ok(Err(JoinOutcome::InvalidCode {
                    reason: e.to_string(),
                }));
            }
        };
        if referrer == user {
            rlog!("join: {} used their own code", logging::user(user));
            return Ok(Err(JoinOutcome::SelfReferral));
        }

        if !registration.created {
            return Ok(Err(match self.ledger.get(user)? {
                Some(edge) => {
                    rlog!(
                        "join: {} already referred by {}, ignoring code from {}",
                        logging::user(user),
                        logging::user(edge.referrer_id),
                        logging::user(referrer)
                    );
                    JoinOutcome::AlreadyExists {
                        referrer: edge.referrer_id,
                    }
                }
                None => {
                    rlog!(
                        "join: {} is not on first contact, ignoring code from {}",
                        logging::user(user),
                        logging::user(referrer)
                    );
                    JoinOutcome::NotFirstContact
                }
            }));
        }

        match self.identities.get(referrer)? {
            None => {
                rlog!(
                    "join: {} presented code of unknown {}",
                    logging::user(user),
                    logging::user(referrer)
                );
                return Ok(Err(JoinOutcome::UnknownReferrer { referrer }));
            }
            Some(r) if r.banned => {
                rlog!(
                    "join: {} presented code of banned {}",
                    logging::user(user),
                    logging::user(referrer)
                );
                return Ok(Err(JoinOutcome::ReferrerBanned { referrer }));
            }
            Some(_) => {}
        }

        match self.ledger.try_create_edge(referrer, user)? {
            CreateOutcome::Created(edge) => Ok(Ok(edge)),
            CreateOutcome::AlreadyExists(edge) => {
                rlog!(
                    "join: {} already has an edge from {}",
                    logging::user(user),
                    logging::user(edge.referrer_id)
                );
                Ok(Err(JoinOutcome::AlreadyExists {
                    referrer: edge.referrer_id,
                }))
            }
            CreateOutcome::SelfReferral => Ok(Err(JoinOutcome::SelfReferral)),
        }
    }

    /// The platform reported a membership change for `user`.
    pub async fn on_subscription_event(
        &self,
        user: UserId,
        subscribed: bool,
    ) -> Result<SubscriptionOutcome, EngineError> {
        self.gate.observe(user, subscribed);
        self.apply_observation(user, subscribed, now_secs()).await
    }

    /// Ask the platform for the user's current status and apply it.
    ///
    /// An unavailable check leaves everything as it was.
    pub async fn recheck(&self, user: UserId) -> Result<SubscriptionOutcome, EngineError> {
        self.recheck_at(user, now_secs()).await
    }

    async fn recheck_at(&self, user: UserId, now: u64) -> Result<SubscriptionOutcome, EngineError> {
        if self.identities.get(user)?.is_none() {
            rlog!("recheck: {} does not exist", logging::user(user));
            return Err(EngineError::NotFound(user));
        }
        let Some(subscribed) = self.gate.check_fresh(user).await.as_bool() else {
            rlog!(
                "recheck: status of {} unknown, leaving edge as is",
                logging::user(user)
            );
            return Ok(SubscriptionOutcome::CheckUnavailable);
        };
        self.apply_observation(user, subscribed, now).await
    }

    async fn apply_observation(
        &self,
        user: UserId,
        subscribed: bool,
        now: u64,
    ) -> Result<SubscriptionOutcome, EngineError> {
        let _guard = self.locks.lock(user).await;

        let Some(record) = self.identities.get(user)? else {
            rlog!(
                "subscription: event for {} before creation",
                logging::user(user)
            );
            return Err(EngineError::NotFound(user));
        };
        if record.banned {
            rlog!(
                "subscription: ignoring event for banned {}",
                logging::user(user)
            );
            return Ok(SubscriptionOutcome::Banned);
        }
        self.identities.set_subscribed(user, subscribed)?;
        self.store.record_check(user, subscribed, now)?;

        let Some(edge) = self.ledger.get(user)? else {
            rlog!(
                "subscription: {} has no referral edge, nothing to do",
                logging::user(user)
            );
            return Ok(SubscriptionOutcome::NoEdge);
        };
        let referrer = edge.referrer_id;

        match (edge.state, subscribed) {
            (EdgeState::Confirmed, _) => {
                rlog!(
                    "subscription: {} already confirmed for {}, ignoring",
                    logging::user(user),
                    logging::user(referrer)
                );
                Ok(SubscriptionOutcome::AlreadyConfirmed { referrer })
            }
            (EdgeState::Pending, false) => {
                if edge.grace_elapsed(now, self.policy.grace_period_secs) {
                    self.reject(&edge, RejectReason::Expired, now)
                } else {
                    rlog!(
                        "subscription: {} not subscribed yet, still pending",
                        logging::user(user)
                    );
                    Ok(SubscriptionOutcome::StillPending { referrer })
                }
            }
            (EdgeState::Rejected, false) => {
                rlog!(
                    "subscription: {} unsubscribed, edge already rejected",
                    logging::user(user)
                );
                Ok(SubscriptionOutcome::Unchanged {
                    state: EdgeState::Rejected,
                })
            }
            (state, true) => {
                if self.is_suspicious(user)? {
                    if state == EdgeState::Pending {
                        return self.reject(&edge, RejectReason::Suspicious, now);
                    }
                    rlog!(
                        "subscription: not recovering rejected edge of suspicious {}",
                        logging::user(user)
                    );
                    return Ok(SubscriptionOutcome::Unchanged { state });
                }
                self.confirm(&edge, now)
            }
        }
    }

    fn confirm(&self, edge: &ReferralEdge, now: u64) -> Result<SubscriptionOutcome, EngineError> {
        let referee = edge.referee_id;
        let referrer = edge.referrer_id;
        match self
            .ledger
            .transition_at(referee, EdgeState::Confirmed, None, now)?
        {
            TransitionOutcome::Ok {
                from,
                credit: Some(credit),
                ..
            } => {
                rlog!(
                    "subscription: {} confirmed, {} now has {} credited referral(s)",
                    logging::user(referee),
                    logging::user(credit.referrer_id),
                    credit.new_count
                );
                Ok(SubscriptionOutcome::Credited {
                    referrer: credit.referrer_id,
                    count: credit.new_count,
                    recovered: from == EdgeState::Rejected,
                })
            }
            TransitionOutcome::Ok { .. } => Ok(SubscriptionOutcome::AlreadyConfirmed { referrer }),
            TransitionOutcome::NotFound => Ok(SubscriptionOutcome::NoEdge),
            TransitionOutcome::InvalidTransition { current } => {
                rlog!(
                    "subscription: {} subscribed but edge is {} ({}), not crediting",
                    logging::user(referee),
                    current,
                    edge.reject_reason.map_or("no reason", |r| r.as_str())
                );
                Ok(match current {
                    EdgeState::Confirmed => SubscriptionOutcome::AlreadyConfirmed { referrer },
                    state => SubscriptionOutcome::Unchanged { state },
                })
            }
        }
    }

    fn reject(
        &self,
        edge: &ReferralEdge,
        reason: RejectReason,
        now: u64,
    ) -> Result<SubscriptionOutcome, EngineError> {
        let referee = edge.referee_id;
        let referrer = edge.referrer_id;
        match self
            .ledger
            .transition_at(referee, EdgeState::Rejected, Some(reason), now)?
        {
            TransitionOutcome::Ok { .. } => {
                rlog!(
                    "subscription: edge {} -> {} rejected ({})",
                    logging::user(referrer),
                    logging::user(referee),
                    reason
                );
                Ok(SubscriptionOutcome::Rejected { referrer, reason })
            }
            TransitionOutcome::NotFound => Ok(SubscriptionOutcome::NoEdge),
            TransitionOutcome::InvalidTransition { current } => {
                rlog!(
                    "subscription: cannot reject {} edge of {}",
                    current,
                    logging::user(referee)
                );
                Ok(match current {
                    EdgeState::Confirmed => SubscriptionOutcome::AlreadyConfirmed { referrer },
                    state => SubscriptionOutcome::Unchanged { state },
                })
            }
        }
    }

    /// Frequent subscribe/unsubscribe flips among the latest observations.
    fn is_suspicious(&self, user: UserId) -> Result<bool, EngineError> {
        let recent = self
            .store
            .recent_checks(user, self.policy.suspicious_window)?;
        if recent.len() < MIN_OBSERVATIONS_FOR_SUSPICION {
            return Ok(false);
        }
        let flips = recent.windows(2).filter(|w| w[0] != w[1]).count();
        if flips >= self.policy.suspicious_flips {
            rlog!(
                "subscription: {} flipped {} times in {} observations",
                logging::user(user),
                flips,
                recent.len()
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Administrative rejection of the referee's edge.
    pub async fn veto(&self, referee: UserId) -> Result<TransitionOutcome, EngineError> {
        let _guard = self.locks.lock(referee).await;
        let outcome =
            self.ledger
                .transition(referee, EdgeState::Rejected, Some(RejectReason::Vetoed))?;
        match &outcome {
            TransitionOutcome::Ok { from, .. } => {
                rlog!("veto: edge of {} rejected from {}", logging::user(referee), from)
            }
            TransitionOutcome::NotFound => {
                rlog!("veto: {} has no edge", logging::user(referee))
            }
            TransitionOutcome::InvalidTransition { current } => {
                rlog!(
                    "veto: edge of {} is {}, cannot veto",
                    logging::user(referee),
                    current
                )
            }
        }
        Ok(outcome)
    }

    pub async fn set_banned(&self, user: UserId, banned: bool) -> Result<(), EngineError> {
        let _guard = self.locks.lock(user).await;
        if self.identities.get(user)?.is_none() {
            return Err(EngineError::NotFound(user));
        }
        self.identities.set_banned(user, banned)?;
        rlog!(
            "admin: {} {}",
            logging::user(user),
            if banned { "banned" } else { "unbanned" }
        );
        Ok(())
    }

    /// Delete the user, its edge as referee and its check history.
    ///
    /// Referrals the user made that are still open are rejected as
    /// `referrer_removed`; confirmed ones keep their state.
    pub async fn purge(&self, user: UserId) -> Result<bool, EngineError> {
        let _guard = self.locks.lock(user).await;
        let removed = self.identities.purge(user)?;
        self.gate.forget(user);
        if removed {
            rlog!("admin: purged {}", logging::user(user));
        }
        Ok(removed)
    }

    /// Current subscription verdict, served from the gate cache unless
    /// `force` is set. Nothing is recorded and no edge moves.
    pub async fn subscription_status(
        &self,
        user: UserId,
        force: bool,
    ) -> Result<Verdict, EngineError> {
        if self.identities.get(user)?.is_none() {
            return Err(EngineError::NotFound(user));
        }
        Ok(if force {
            self.gate.check_fresh(user).await
        } else {
            self.gate.check(user).await
        })
    }

    /// Edges created with `referrer`'s invite code, oldest first.
    pub fn referrals(&self, referrer: UserId) -> Result<Vec<ReferralEdge>, EngineError> {
        Ok(self.ledger.edges_for_referrer(referrer)?)
    }

    pub fn top(&self, limit: usize) -> Result<Vec<User>, EngineError> {
        Ok(self.rewards.leaderboard(limit)?)
    }

    pub fn stats(&self) -> Result<LedgerStats, EngineError> {
        Ok(self.store.stats()?)
    }

    /// Re-check every pending edge whose grace window has run out.
    pub async fn expire_pending(&self) -> Result<SweepReport, EngineError> {
        self.expire_pending_at(now_secs()).await
    }

    pub async fn expire_pending_at(&self, now: u64) -> Result<SweepReport, EngineError> {
        let overdue = self
            .ledger
            .overdue(now, self.policy.grace_period_secs)?;
        let mut report = SweepReport {
            examined: overdue.len(),
            ..SweepReport::default()
        };
        for edge in overdue {
            match self.recheck_at(edge.referee_id, now).await {
                Ok(SubscriptionOutcome::Credited { .. }) => report.confirmed += 1,
                Ok(SubscriptionOutcome::Rejected { .. }) => report.rejected += 1,
                Ok(SubscriptionOutcome::CheckUnavailable) => report.unavailable += 1,
                Ok(_) => report.unchanged += 1,
                // A referee purged mid-sweep; its edge went with it.
                Err(EngineError::NotFound(_)) => report.unchanged += 1,
                Err(e) => {
                    rlog!(
                        "sweep: recheck of {} failed, skipping: {}",
                        logging::user(edge.referee_id),
                        e
                    );
                    report.failed += 1;
                }
            }
        }
        rlog!(
            "sweep: examined {} overdue edge(s): {} confirmed, {} rejected, {} unavailable, {} failed",
            report.examined,
            report.confirmed,
            report.rejected,
            report.unavailable,
            report.failed
        );
        Ok(report)
    }
}
