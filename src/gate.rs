//! Subscription gate: "is this user currently subscribed to the channel?"
//!
//! The platform call is abstracted as [`SubscriptionChecker`]. The gate wraps
//! it with retries (exponential backoff) and a short-lived result cache, and
//! reduces the outcome to a [`Verdict`]. A failed check is `Unknown`, never
//! `NotSubscribed`, so a flaky platform cannot reject a referral.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::logging;
use crate::model::{Subscription, UserId};
use crate::rlog;
use crate::storage::ReferralStore;

/// Failure of the external subscription check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    /// Transient: timeouts, rate limits, network errors.
    Unavailable(String),
    /// The platform refused the query (e.g. bot not admin in the channel).
    Denied(String),
}

impl std::fmt::Display for CheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckError::Unavailable(msg) => write!(f, "subscription check unavailable: {msg}"),
            CheckError::Denied(msg) => write!(f, "subscription check denied: {msg}"),
        }
    }
}

impl std::error::Error for CheckError {}

/// External platform call. Implementations must not hold engine locks.
pub trait SubscriptionChecker: Send + Sync {
    fn is_subscribed(
        &self,
        user: UserId,
        channel_id: &str,
    ) -> impl Future<Output = Result<bool, CheckError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Subscribed,
    NotSubscribed,
    /// Every attempt failed; the caller must not act on it.
    Unknown,
}

impl Verdict {
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Verdict::Subscribed => Some(true),
            Verdict::NotSubscribed => Some(false),
            Verdict::Unknown => None,
        }
    }
}

impl From<bool> for Verdict {
    fn from(subscribed: bool) -> Self {
        if subscribed {
            Verdict::Subscribed
        } else {
            Verdict::NotSubscribed
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base × 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Recent verdicts keyed by user.
struct CheckCache {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<UserId, (Instant, bool)>,
}

impl CheckCache {
    fn get(&self, user: UserId, now: Instant) -> Option<bool> {
        self.entries
            .get(&user)
            .filter(|(at, _)| now.duration_since(*at) < self.ttl)
            .map(|(_, subscribed)| *subscribed)
    }

    fn put(&mut self, user: UserId, subscribed: bool, now: Instant) {
        if self.capacity == 0 || self.ttl.is_zero() {
            return;
        }
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&user) {
            // Drop the oldest fifth in one pass rather than one entry per insert.
            let mut by_age: Vec<(UserId, Instant)> =
                self.entries.iter().map(|(k, (at, _))| (*k, *at)).collect();
            by_age.sort_by_key(|(_, at)| *at);
            let evict = (self.entries.len() / 5).max(1);
            for (key, _) in by_age.into_iter().take(evict) {
                self.entries.remove(&key);
            }
        }
        self.entries.insert(user, (now, subscribed));
    }
}

pub struct SubscriptionGate<C> {
    checker: C,
    channel_id: String,
    retry: RetryPolicy,
    cache: Mutex<CheckCache>,
}

impl<C: SubscriptionChecker> SubscriptionGate<C> {
    pub fn new(
        checker: C,
        channel_id: impl Into<String>,
        retry: RetryPolicy,
        cache_ttl: Duration,
        cache_capacity: usize,
    ) -> Self {
        Self {
            checker,
            channel_id: channel_id.into(),
            retry,
            cache: Mutex::new(CheckCache {
                ttl: cache_ttl,
                capacity: cache_capacity,
                entries: HashMap::new(),
            }),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn checker(&self) -> &C {
        &self.checker
    }

    fn cache(&self) -> MutexGuard<'_, CheckCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Verdict from cache when fresh, otherwise from the platform.
    pub async fn check(&self, user: UserId) -> Verdict {
        let cached = self.cache().get(user, Instant::now());
        if let Some(subscribed) = cached {
            return Verdict::from(subscribed);
        }
        self.check_fresh(user).await
    }

    /// Always ask the platform. Used before confirming a referral.
    pub async fn check_fresh(&self, user: UserId) -> Verdict {
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            match self.checker.is_subscribed(user, &self.channel_id).await {
                Ok(subscribed) => {
                    self.observe(user, subscribed);
                    return Verdict::from(subscribed);
                }
                Err(CheckError::Denied(msg)) => {
                    rlog!(
                        "gate: check for {} denied by platform: {}",
                        logging::user(user),
                        msg
                    );
                    return Verdict::Unknown;
                }
                Err(e) if attempt < attempts => {
                    let delay = self.retry.delay_for(attempt);
                    rlog!(
                        "gate: check for {} failed (attempt {}/{}), retrying in {}ms: {}",
                        logging::user(user),
                        attempt,
                        attempts,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    rlog!(
                        "gate: check for {} unavailable after {} attempt(s): {}",
                        logging::user(user),
                        attempts,
                        e
                    );
                }
            }
        }
        Verdict::Unknown
    }

    /// Record a value pushed by the platform (membership update event).
    pub fn observe(&self, user: UserId, subscribed: bool) {
        self.cache().put(user, subscribed, Instant::now());
    }

    pub fn forget(&self, user: UserId) {
        self.cache().entries.remove(&user);
    }

    pub fn cached_entries(&self) -> usize {
        self.cache().entries.len()
    }
}

/// Answers from the last subscription status recorded in the store.
///
/// For operator tooling that has no platform connection. A user with no
/// recorded status is refused outright rather than retried, so nothing is
/// decided on it.
pub struct StoredStatusChecker {
    store: Arc<dyn ReferralStore>,
}

impl StoredStatusChecker {
    pub fn new(store: Arc<dyn ReferralStore>) -> Self {
        Self { store }
    }
}

impl SubscriptionChecker for StoredStatusChecker {
    async fn is_subscribed(&self, user: UserId, _channel_id: &str) -> Result<bool, CheckError> {
        let user_row = self
            .store
            .get_user(user)
            .map_err(|e| CheckError::Unavailable(e.to_string()))?;
        match user_row.map(|u| u.subscribed) {
            Some(Subscription::Subscribed) => Ok(true),
            Some(Subscription::Unsubscribed) => Ok(false),
            Some(Subscription::Unknown) => Err(CheckError::Denied(format!(
                "no recorded status for {user}"
            ))),
            None => Err(CheckError::Unavailable(format!("unknown user {user}"))),
        }
    }
}
