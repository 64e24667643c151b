//! Core records: users, referral edges and their states.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// External platform identity of a user. Immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(UserId)
    }
}

impl UserId {
    /// SQLite stores integers as i64; ids above `i64::MAX` keep their bits.
    pub(crate) fn to_sql(self) -> i64 {
        self.0 as i64
    }

    pub(crate) fn from_sql(v: i64) -> Self {
        UserId(v as u64)
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Cached result of the last subscription observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subscription {
    #[default]
    Unknown,
    Subscribed,
    Unsubscribed,
}

impl Subscription {
    pub fn from_observed(subscribed: bool) -> Self {
        if subscribed {
            Subscription::Subscribed
        } else {
            Subscription::Unsubscribed
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Subscription::Unknown => None,
            Subscription::Subscribed => Some(true),
            Subscription::Unsubscribed => Some(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub invite_code: String,
    pub referred_by: Option<UserId>,
    pub subscribed: Subscription,
    pub credited_referrals: u64,
    pub banned: bool,
    pub created_at: u64,
}

impl User {
    pub fn new(id: UserId, invite_code: String, created_at: u64) -> Self {
        Self {
            id,
            invite_code,
            referred_by: None,
            subscribed: Subscription::Unknown,
            credited_referrals: 0,
            banned: false,
            created_at,
        }
    }
}

/// Lifecycle state of a referral edge.
///
/// ```text
/// pending ──gate true──▶ confirmed (terminal, reward granted)
///    │
///    └──gate false + grace elapsed / veto / suspicious──▶ rejected
///                                                          │
///            (expired only, when recovery is allowed) ─────┘──▶ confirmed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeState {
    Pending,
    Confirmed,
    Rejected,
}

impl EdgeState {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeState::Pending => "pending",
            EdgeState::Confirmed => "confirmed",
            EdgeState::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EdgeState::Pending),
            "confirmed" => Some(EdgeState::Confirmed),
            "rejected" => Some(EdgeState::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for EdgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an edge ended up `rejected`. Only `Expired` is recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Grace window elapsed while the referee was not subscribed.
    Expired,
    /// Administrative veto.
    Vetoed,
    /// Subscription flip pattern flagged by the anti-cheat check.
    Suspicious,
    /// The referrer was purged before the edge was confirmed.
    ReferrerRemoved,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::Expired => "expired",
            RejectReason::Vetoed => "vetoed",
            RejectReason::Suspicious => "suspicious",
            RejectReason::ReferrerRemoved => "referrer_removed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "expired" => Some(RejectReason::Expired),
            "vetoed" => Some(RejectReason::Vetoed),
            "suspicious" => Some(RejectReason::Suspicious),
            "referrer_removed" => Some(RejectReason::ReferrerRemoved),
            _ => None,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Referrer → referee relationship. At most one per referee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralEdge {
    pub referee_id: UserId,
    pub referrer_id: UserId,
    pub state: EdgeState,
    pub reject_reason: Option<RejectReason>,
    pub created_at: u64,
    pub confirmed_at: Option<u64>,
    pub updated_at: u64,
}

impl ReferralEdge {
    pub fn pending(referrer_id: UserId, referee_id: UserId, created_at: u64) -> Self {
        Self {
            referee_id,
            referrer_id,
            state: EdgeState::Pending,
            reject_reason: None,
            created_at,
            confirmed_at: None,
            updated_at: created_at,
        }
    }

    /// Whether the state machine admits `self.state → next`.
    ///
    /// `confirmed` never moves. `rejected → confirmed` is only admitted for
    /// an `expired` rejection and only when `allow_recovery` is set.
    pub fn can_transition_to(&self, next: EdgeState, allow_recovery: bool) -> bool {
        match (self.state, next) {
            (EdgeState::Pending, EdgeState::Confirmed) => true,
            (EdgeState::Pending, EdgeState::Rejected) => true,
            (EdgeState::Rejected, EdgeState::Confirmed) => {
                allow_recovery && self.reject_reason == Some(RejectReason::Expired)
            }
            _ => false,
        }
    }

    /// Whether the grace window has run out at `now`.
    pub fn grace_elapsed(&self, now: u64, grace_period_secs: u64) -> bool {
        now >= self.created_at.saturating_add(grace_period_secs)
    }
}

/// Aggregate counters for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub users: u64,
    pub banned_users: u64,
    pub pending: u64,
    pub confirmed: u64,
    pub rejected: u64,
    pub total_credited: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(state: EdgeState, reason: Option<RejectReason>) -> ReferralEdge {
        ReferralEdge {
            state,
            reject_reason: reason,
            ..ReferralEdge::pending(UserId(1), UserId(2), 100)
        }
    }

    #[test]
    fn confirmed_is_terminal() {
        let e = edge(EdgeState::Confirmed, None);
        for next in [EdgeState::Pending, EdgeState::Rejected, EdgeState::Confirmed] {
            assert!(!e.can_transition_to(next, true));
        }
    }

    #[test]
    fn nothing_returns_to_pending() {
        assert!(!edge(EdgeState::Pending, None).can_transition_to(EdgeState::Pending, true));
        let rejected = edge(EdgeState::Rejected, Some(RejectReason::Expired));
        assert!(!rejected.can_transition_to(EdgeState::Pending, true));
    }

    #[test]
    fn recovery_only_from_expired_and_only_when_allowed() {
        let expired = edge(EdgeState::Rejected, Some(RejectReason::Expired));
        assert!(expired.can_transition_to(EdgeState::Confirmed, true));
        assert!(!expired.can_transition_to(EdgeState::Confirmed, false));

        let vetoed = edge(EdgeState::Rejected, Some(RejectReason::Vetoed));
        assert!(!vetoed.can_transition_to(EdgeState::Confirmed, true));
        let suspicious = edge(EdgeState::Rejected, Some(RejectReason::Suspicious));
        assert!(!suspicious.can_transition_to(EdgeState::Confirmed, true));
        let orphaned = edge(EdgeState::Rejected, Some(RejectReason::ReferrerRemoved));
        assert!(!orphaned.can_transition_to(EdgeState::Confirmed, true));
    }

    #[test]
    fn grace_window_boundary() {
        let e = edge(EdgeState::Pending, None);
        assert!(!e.grace_elapsed(199, 100));
        assert!(e.grace_elapsed(200, 100));
        assert!(edge(EdgeState::Pending, None).grace_elapsed(u64::MAX, u64::MAX));
    }

    #[test]
    fn user_id_survives_sql_conversion() {
        let big = UserId(u64::MAX - 3);
        assert_eq!(UserId::from_sql(big.to_sql()), big);
        assert_eq!(" 42 ".parse::<UserId>().unwrap(), UserId(42));
    }
}
