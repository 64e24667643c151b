//! Persistence for users, referral edges and subscription observations.
//!
//! [`ReferralStore`] is the contract the engine needs from a backend. Each
//! method is individually atomic; the guarded writes (`insert_edge`,
//! `compare_and_set_edge`, `confirm_edge_and_credit`) are what make event
//! handling idempotent. [`SqliteStorage`] is the durable backend;
//! [`MemoryStorage`](crate::memory::MemoryStorage) implements the same
//! contract in process.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{
    EdgeState, LedgerStats, ReferralEdge, RejectReason, Subscription, User, UserId,
};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    NotFound(String),
    /// A connection or map lock was poisoned by a panicking holder.
    Poisoned,
    /// A stored value could not be interpreted.
    Corrupt(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Io(e) => write!(f, "io error: {e}"),
            StorageError::NotFound(msg) => write!(f, "not found: {msg}"),
            StorageError::Poisoned => write!(f, "storage lock poisoned"),
            StorageError::Corrupt(msg) => write!(f, "corrupt record: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

/// Result of a successful `expected → confirmed` swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credit {
    pub referrer_id: UserId,
    /// Referrer's `credited_referrals` after the grant.
    pub new_count: u64,
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

pub trait ReferralStore: Send + Sync {
    fn get_user(&self, id: UserId) -> Result<Option<User>, StorageError>;

    /// Insert if absent. Returns `false` when the id already existed.
    fn insert_user(&self, user: &User) -> Result<bool, StorageError>;

    fn set_subscribed(&self, id: UserId, status: Subscription) -> Result<(), StorageError>;

    fn set_banned(&self, id: UserId, banned: bool) -> Result<(), StorageError>;

    /// Atomic add. Returns the new count.
    fn increment_credited(&self, id: UserId, amount: u64) -> Result<u64, StorageError>;

    /// Non-banned users with at least one credit, highest first.
    fn top_referrers(&self, limit: usize) -> Result<Vec<User>, StorageError>;

    /// Insert if the referee has no edge yet, recording `referred_by` on the
    /// referee in the same step. Returns `false` when an edge already existed.
    fn insert_edge(&self, edge: &ReferralEdge) -> Result<bool, StorageError>;

    fn get_edge(&self, referee: UserId) -> Result<Option<ReferralEdge>, StorageError>;

    /// Write `next` only if the edge is currently in `expected`.
    fn compare_and_set_edge(
        &self,
        referee: UserId,
        expected: EdgeState,
        next: EdgeState,
        reason: Option<RejectReason>,
        at: u64,
    ) -> Result<bool, StorageError>;

    /// Swap `expected → confirmed` and credit the referrer with `amount` as
    /// one atomic step. `None` when the edge was not in `expected`.
    fn confirm_edge_and_credit(
        &self,
        referee: UserId,
        expected: EdgeState,
        amount: u64,
        at: u64,
    ) -> Result<Option<Credit>, StorageError>;

    fn list_edges(&self, state: Option<EdgeState>) -> Result<Vec<ReferralEdge>, StorageError>;

    fn edges_for_referrer(&self, referrer: UserId) -> Result<Vec<ReferralEdge>, StorageError>;

    /// Pending edges created at or before `cutoff`, oldest first.
    fn pending_created_before(&self, cutoff: u64) -> Result<Vec<ReferralEdge>, StorageError>;

    fn record_check(&self, id: UserId, subscribed: bool, at: u64) -> Result<(), StorageError>;

    /// Most recent observations first.
    fn recent_checks(&self, id: UserId, limit: usize) -> Result<Vec<bool>, StorageError>;

    /// Delete the user, its edge as referee and its check history. Edges the
    /// user created as referrer that are not confirmed become
    /// `rejected (referrer_removed)` in the same write.
    fn purge_user(&self, id: UserId, at: u64) -> Result<bool, StorageError>;

    fn stats(&self) -> Result<LedgerStats, StorageError>;
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

const USER_COLUMNS: &str =
    "user_id, invite_code, referred_by, subscribed, credited_referrals, is_banned, created_at";

const EDGE_COLUMNS: &str =
    "referee_id, referrer_id, state, reject_reason, created_at, confirmed_at, updated_at";

fn subscription_to_sql(status: Subscription) -> Option<i32> {
    status.as_bool().map(i32::from)
}

fn subscription_from_sql(v: Option<i32>) -> Subscription {
    match v {
        None => Subscription::Unknown,
        Some(0) => Subscription::Unsubscribed,
        Some(_) => Subscription::Subscribed,
    }
}

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: UserId::from_sql(row.get(0)?),
        invite_code: row.get(1)?,
        referred_by: row.get::<_, Option<i64>>(2)?.map(UserId::from_sql),
        subscribed: subscription_from_sql(row.get(3)?),
        credited_referrals: row.get::<_, i64>(4)? as u64,
        banned: row.get::<_, i32>(5)? != 0,
        created_at: row.get::<_, i64>(6)? as u64,
    })
}

/// Raw edge columns; state strings are validated in [`RawEdge::into_edge`].
struct RawEdge {
    referee_id: i64,
    referrer_id: i64,
    state: String,
    reject_reason: Option<String>,
    created_at: i64,
    confirmed_at: Option<i64>,
    updated_at: i64,
}

fn map_raw_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEdge> {
    Ok(RawEdge {
        referee_id: row.get(0)?,
        referrer_id: row.get(1)?,
        state: row.get(2)?,
        reject_reason: row.get(3)?,
        created_at: row.get(4)?,
        confirmed_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

impl RawEdge {
    fn into_edge(self) -> Result<ReferralEdge, StorageError> {
        let state = EdgeState::parse(&self.state).ok_or_else(|| {
            StorageError::Corrupt(format!("edge {} has state {:?}", self.referee_id, self.state))
        })?;
        let reject_reason = match self.reject_reason.as_deref() {
            None => None,
            Some(s) => Some(RejectReason::parse(s).ok_or_else(|| {
                StorageError::Corrupt(format!("edge {} has reason {s:?}", self.referee_id))
            })?),
        };
        Ok(ReferralEdge {
            referee_id: UserId::from_sql(self.referee_id),
            referrer_id: UserId::from_sql(self.referrer_id),
            state,
            reject_reason,
            created_at: self.created_at as u64,
            confirmed_at: self.confirmed_at.map(|t| t as u64),
            updated_at: self.updated_at as u64,
        })
    }
}

impl SqliteStorage {
    /// Open or create a database file. Creates the schema if needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.create_schema()?;
        Ok(storage)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                user_id             INTEGER PRIMARY KEY,
                invite_code         TEXT NOT NULL UNIQUE,
                referred_by         INTEGER,
                subscribed          INTEGER,
                credited_referrals  INTEGER NOT NULL DEFAULT 0,
                is_banned           INTEGER NOT NULL DEFAULT 0,
                created_at          INTEGER NOT NULL,
                CHECK (referred_by IS NULL OR referred_by != user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_users_credited
                ON users(is_banned, credited_referrals);

            CREATE TABLE IF NOT EXISTS referral_edges (
                referee_id      INTEGER PRIMARY KEY,
                referrer_id     INTEGER NOT NULL,
                state           TEXT NOT NULL DEFAULT 'pending',
                reject_reason   TEXT,
                created_at      INTEGER NOT NULL,
                confirmed_at    INTEGER,
                updated_at      INTEGER NOT NULL,
                CHECK (referrer_id != referee_id)
            );

            CREATE INDEX IF NOT EXISTS idx_edges_referrer
                ON referral_edges(referrer_id, state);
            CREATE INDEX IF NOT EXISTS idx_edges_state
                ON referral_edges(state, created_at);

            CREATE TABLE IF NOT EXISTS subscription_checks (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id     INTEGER NOT NULL,
                subscribed  INTEGER NOT NULL,
                checked_at  INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_checks_user
                ON subscription_checks(user_id, id);
            ",
        )?;
        Ok(())
    }

    fn query_edges(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::types::ToSql],
    ) -> Result<Vec<ReferralEdge>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, map_raw_edge)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?.into_edge()?);
        }
        Ok(result)
    }
}

impl ReferralStore for SqliteStorage {
    fn get_user(&self, id: UserId) -> Result<Option<User>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"))?;
        let row = stmt.query_row(params![id.to_sql()], map_user).optional()?;
        Ok(row)
    }

    fn insert_user(&self, user: &User) -> Result<bool, StorageError> {
        let affected = self.conn()?.execute(
            "INSERT INTO users
             (user_id, invite_code, referred_by, subscribed, credited_referrals, is_banned, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id) DO NOTHING",
            params![
                user.id.to_sql(),
                user.invite_code,
                user.referred_by.map(UserId::to_sql),
                subscription_to_sql(user.subscribed),
                user.credited_referrals as i64,
                user.banned as i32,
                user.created_at as i64,
            ],
        )?;
        Ok(affected > 0)
    }

    fn set_subscribed(&self, id: UserId, status: Subscription) -> Result<(), StorageError> {
        let affected = self.conn()?.execute(
            "UPDATE users SET subscribed = ?1 WHERE user_id = ?2",
            params![subscription_to_sql(status), id.to_sql()],
        )?;
        if affected == 0 {
            return Err(StorageError::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    fn set_banned(&self, id: UserId, banned: bool) -> Result<(), StorageError> {
        let affected = self.conn()?.execute(
            "UPDATE users SET is_banned = ?1 WHERE user_id = ?2",
            params![banned as i32, id.to_sql()],
        )?;
        if affected == 0 {
            return Err(StorageError::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    fn increment_credited(&self, id: UserId, amount: u64) -> Result<u64, StorageError> {
        let conn = self.conn()?;
        let count: Option<i64> = conn
            .query_row(
                "UPDATE users SET credited_referrals = credited_referrals + ?1
                 WHERE user_id = ?2 RETURNING credited_referrals",
                params![amount as i64, id.to_sql()],
                |row| row.get(0),
            )
            .optional()?;
        count
            .map(|c| c as u64)
            .ok_or_else(|| StorageError::NotFound(format!("user {id}")))
    }

    fn top_referrers(&self, limit: usize) -> Result<Vec<User>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE is_banned = 0 AND credited_referrals > 0
             ORDER BY credited_referrals DESC, created_at ASC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], map_user)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn insert_edge(&self, edge: &ReferralEdge) -> Result<bool, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let affected = tx.execute(
            // Only the referee key may conflict; CHECK violations must still fail.
            "INSERT INTO referral_edges
             (referee_id, referrer_id, state, reject_reason, created_at, confirmed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(referee_id) DO NOTHING",
            params![
                edge.referee_id.to_sql(),
                edge.referrer_id.to_sql(),
                edge.state.as_str(),
                edge.reject_reason.map(RejectReason::as_str),
                edge.created_at as i64,
                edge.confirmed_at.map(|t| t as i64),
                edge.updated_at as i64,
            ],
        )?;
        if affected == 0 {
            return Ok(false);
        }
        let linked = tx.execute(
            "UPDATE users SET referred_by = ?1 WHERE user_id = ?2 AND referred_by IS NULL",
            params![edge.referrer_id.to_sql(), edge.referee_id.to_sql()],
        )?;
        if linked == 0 {
            // Dropping `tx` rolls the edge back.
            return Err(StorageError::NotFound(format!(
                "referee {} (or already linked)",
                edge.referee_id
            )));
        }
        tx.commit()?;
        Ok(true)
    }

    fn get_edge(&self, referee: UserId) -> Result<Option<ReferralEdge>, StorageError> {
        let raw = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {EDGE_COLUMNS} FROM referral_edges WHERE referee_id = ?1"
            ))?;
            let raw = stmt.query_row(params![referee.to_sql()], map_raw_edge).optional()?;
            raw
        };
        raw.map(RawEdge::into_edge).transpose()
    }

    fn compare_and_set_edge(
        &self,
        referee: UserId,
        expected: EdgeState,
        next: EdgeState,
        reason: Option<RejectReason>,
        at: u64,
    ) -> Result<bool, StorageError> {
        let affected = self.conn()?.execute(
            "UPDATE referral_edges
             SET state = ?1, reject_reason = ?2, updated_at = ?3,
                 confirmed_at = CASE WHEN ?1 = 'confirmed' THEN ?3 ELSE confirmed_at END
             WHERE referee_id = ?4 AND state = ?5",
            params![
                next.as_str(),
                reason.map(RejectReason::as_str),
                at as i64,
                referee.to_sql(),
                expected.as_str(),
            ],
        )?;
        Ok(affected > 0)
    }

    fn confirm_edge_and_credit(
        &self,
        referee: UserId,
        expected: EdgeState,
        amount: u64,
        at: u64,
    ) -> Result<Option<Credit>, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let referrer: Option<i64> = tx
            .query_row(
                "UPDATE referral_edges
                 SET state = 'confirmed', reject_reason = NULL, confirmed_at = ?1, updated_at = ?1
                 WHERE referee_id = ?2 AND state = ?3
                 RETURNING referrer_id",
                params![at as i64, referee.to_sql(), expected.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(referrer) = referrer else {
            return Ok(None);
        };
        let new_count: Option<i64> = tx
            .query_row(
                "UPDATE users SET credited_referrals = credited_referrals + ?1
                 WHERE user_id = ?2 RETURNING credited_referrals",
                params![amount as i64, referrer],
                |row| row.get(0),
            )
            .optional()?;
        let Some(new_count) = new_count else {
            return Err(StorageError::NotFound(format!(
                "referrer {} of {referee}",
                UserId::from_sql(referrer)
            )));
        };
        tx.commit()?;
        Ok(Some(Credit {
            referrer_id: UserId::from_sql(referrer),
            new_count: new_count as u64,
        }))
    }

    fn list_edges(&self, state: Option<EdgeState>) -> Result<Vec<ReferralEdge>, StorageError> {
        match state {
            Some(s) => self.query_edges(
                &format!(
                    "SELECT {EDGE_COLUMNS} FROM referral_edges WHERE state = ?1 ORDER BY created_at"
                ),
                params![s.as_str()],
            ),
            None => self.query_edges(
                &format!("SELECT {EDGE_COLUMNS} FROM referral_edges ORDER BY created_at"),
                params![],
            ),
        }
    }

    fn edges_for_referrer(&self, referrer: UserId) -> Result<Vec<ReferralEdge>, StorageError> {
        self.query_edges(
            &format!(
                "SELECT {EDGE_COLUMNS} FROM referral_edges WHERE referrer_id = ?1 ORDER BY created_at"
            ),
            params![referrer.to_sql()],
        )
    }

    fn pending_created_before(&self, cutoff: u64) -> Result<Vec<ReferralEdge>, StorageError> {
        self.query_edges(
            &format!(
                "SELECT {EDGE_COLUMNS} FROM referral_edges
                 WHERE state = 'pending' AND created_at <= ?1
                 ORDER BY created_at"
            ),
            params![cutoff.min(i64::MAX as u64) as i64],
        )
    }

    fn record_check(&self, id: UserId, subscribed: bool, at: u64) -> Result<(), StorageError> {
        self.conn()?.execute(
            "INSERT INTO subscription_checks (user_id, subscribed, checked_at) VALUES (?1, ?2, ?3)",
            params![id.to_sql(), subscribed as i32, at as i64],
        )?;
        Ok(())
    }

    fn recent_checks(&self, id: UserId, limit: usize) -> Result<Vec<bool>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT subscribed FROM subscription_checks
             WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![id.to_sql(), limit as i64], |row| {
            row.get::<_, i32>(0)
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row? != 0);
        }
        Ok(result)
    }

    fn purge_user(&self, id: UserId, at: u64) -> Result<bool, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM referral_edges WHERE referee_id = ?1",
            params![id.to_sql()],
        )?;
        tx.execute(
            "UPDATE referral_edges SET state = 'rejected', reject_reason = ?1, updated_at = ?2
             WHERE referrer_id = ?3 AND state != 'confirmed'",
            params![
                RejectReason::ReferrerRemoved.as_str(),
                at as i64,
                id.to_sql()
            ],
        )?;
        tx.execute(
            "DELETE FROM subscription_checks WHERE user_id = ?1",
            params![id.to_sql()],
        )?;
        let affected = tx.execute("DELETE FROM users WHERE user_id = ?1", params![id.to_sql()])?;
        tx.commit()?;
        Ok(affected > 0)
    }

    fn stats(&self) -> Result<LedgerStats, StorageError> {
        let conn = self.conn()?;
        let (users, banned_users, total_credited): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(is_banned), 0), COALESCE(SUM(credited_referrals), 0)
             FROM users",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let mut stats = LedgerStats {
            users: users as u64,
            banned_users: banned_users as u64,
            total_credited: total_credited as u64,
            ..LedgerStats::default()
        };
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM referral_edges GROUP BY state")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (state, count) = row?;
            match EdgeState::parse(&state) {
                Some(EdgeState::Pending) => stats.pending = count as u64,
                Some(EdgeState::Confirmed) => stats.confirmed = count as u64,
                Some(EdgeState::Rejected) => stats.rejected = count as u64,
                None => return Err(StorageError::Corrupt(format!("edge state {state:?}"))),
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_storage() -> SqliteStorage {
        SqliteStorage::open_in_memory().unwrap()
    }

    fn user(id: u64) -> User {
        User::new(UserId(id), format!("code-{id}"), 1_000)
    }

    #[test]
    fn test_user_insert_is_idempotent() {
        let storage = test_storage();
        assert!(storage.insert_user(&user(1)).unwrap());
        assert!(!storage.insert_user(&user(1)).unwrap());

        let loaded = storage.get_user(UserId(1)).unwrap().unwrap();
        assert_eq!(loaded.invite_code, "code-1");
        assert_eq!(loaded.subscribed, Subscription::Unknown);
        assert_eq!(loaded.credited_referrals, 0);
        assert!(storage.get_user(UserId(2)).unwrap().is_none());
    }

    #[test]
    fn test_subscription_tri_state_round_trips() {
        let storage = test_storage();
        storage.insert_user(&user(5)).unwrap();
        for status in [
            Subscription::Subscribed,
            Subscription::Unsubscribed,
            Subscription::Unknown,
        ] {
            storage.set_subscribed(UserId(5), status).unwrap();
            assert_eq!(storage.get_user(UserId(5)).unwrap().unwrap().subscribed, status);
        }
    }

    #[test]
    fn test_updates_on_missing_user_are_not_found() {
        let storage = test_storage();
        assert!(matches!(
            storage.set_subscribed(UserId(9), Subscription::Subscribed),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.increment_credited(UserId(9), 1),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.set_banned(UserId(9), true),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_edge_is_unique_per_referee() {
        let storage = test_storage();
        for id in [1, 2, 3] {
            storage.insert_user(&user(id)).unwrap();
        }
        assert!(storage
            .insert_edge(&ReferralEdge::pending(UserId(1), UserId(3), 10))
            .unwrap());
        assert!(!storage
            .insert_edge(&ReferralEdge::pending(UserId(2), UserId(3), 11))
            .unwrap());

        let edge = storage.get_edge(UserId(3)).unwrap().unwrap();
        assert_eq!(edge.referrer_id, UserId(1));
        assert_eq!(edge.state, EdgeState::Pending);
        let referee = storage.get_user(UserId(3)).unwrap().unwrap();
        assert_eq!(referee.referred_by, Some(UserId(1)));
    }

    #[test]
    fn test_self_edge_violates_schema() {
        let storage = test_storage();
        storage.insert_user(&user(4)).unwrap();
        assert!(storage
            .insert_edge(&ReferralEdge::pending(UserId(4), UserId(4), 10))
            .is_err());
        assert!(storage.get_edge(UserId(4)).unwrap().is_none());
    }

    #[test]
    fn test_edge_for_unknown_referee_rolls_back() {
        let storage = test_storage();
        storage.insert_user(&user(1)).unwrap();
        assert!(storage
            .insert_edge(&ReferralEdge::pending(UserId(1), UserId(77), 10))
            .is_err());
        assert!(storage.get_edge(UserId(77)).unwrap().is_none());
    }

    #[test]
    fn test_compare_and_set_is_guarded() {
        let storage = test_storage();
        storage.insert_user(&user(1)).unwrap();
        storage.insert_user(&user(2)).unwrap();
        storage
            .insert_edge(&ReferralEdge::pending(UserId(1), UserId(2), 10))
            .unwrap();

        assert!(storage
            .compare_and_set_edge(
                UserId(2),
                EdgeState::Pending,
                EdgeState::Rejected,
                Some(RejectReason::Expired),
                20
            )
            .unwrap());
        // Stale expectation loses.
        assert!(!storage
            .compare_and_set_edge(UserId(2), EdgeState::Pending, EdgeState::Rejected, None, 21)
            .unwrap());

        let edge = storage.get_edge(UserId(2)).unwrap().unwrap();
        assert_eq!(edge.state, EdgeState::Rejected);
        assert_eq!(edge.reject_reason, Some(RejectReason::Expired));
        assert_eq!(edge.updated_at, 20);
        assert_eq!(edge.confirmed_at, None);
    }

    #[test]
    fn test_confirm_and_credit_happens_once() {
        let storage = test_storage();
        storage.insert_user(&user(1)).unwrap();
        storage.insert_user(&user(2)).unwrap();
        storage
            .insert_edge(&ReferralEdge::pending(UserId(1), UserId(2), 10))
            .unwrap();

        let credit = storage
            .confirm_edge_and_credit(UserId(2), EdgeState::Pending, 1, 30)
            .unwrap();
        assert_eq!(
            credit,
            Some(Credit {
                referrer_id: UserId(1),
                new_count: 1
            })
        );
        assert_eq!(
            storage
                .confirm_edge_and_credit(UserId(2), EdgeState::Pending, 1, 31)
                .unwrap(),
            None
        );

        let edge = storage.get_edge(UserId(2)).unwrap().unwrap();
        assert_eq!(edge.state, EdgeState::Confirmed);
        assert_eq!(edge.confirmed_at, Some(30));
        assert_eq!(
            storage.get_user(UserId(1)).unwrap().unwrap().credited_referrals,
            1
        );
    }

    #[test]
    fn test_recent_checks_newest_first() {
        let storage = test_storage();
        storage.record_check(UserId(8), true, 1).unwrap();
        storage.record_check(UserId(8), false, 2).unwrap();
        storage.record_check(UserId(8), true, 3).unwrap();
        assert_eq!(
            storage.recent_checks(UserId(8), 2).unwrap(),
            vec![true, false]
        );
    }

    #[test]
    fn test_leaderboard_skips_banned_and_zero() {
        let storage = test_storage();
        for id in 1..=4 {
            storage.insert_user(&user(id)).unwrap();
        }
        storage.increment_credited(UserId(1), 3).unwrap();
        storage.increment_credited(UserId(2), 5).unwrap();
        storage.increment_credited(UserId(3), 9).unwrap();
        storage.set_banned(UserId(3), true).unwrap();

        let top: Vec<UserId> = storage
            .top_referrers(10)
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(top, vec![UserId(2), UserId(1)]);
    }

    #[test]
    fn test_purge_closes_open_edges_of_referrer() {
        let storage = test_storage();
        for id in 1..=4 {
            storage.insert_user(&user(id)).unwrap();
        }
        storage
            .insert_edge(&ReferralEdge::pending(UserId(1), UserId(2), 10))
            .unwrap();
        storage
            .insert_edge(&ReferralEdge::pending(UserId(2), UserId(3), 10))
            .unwrap();
        storage
            .insert_edge(&ReferralEdge::pending(UserId(2), UserId(4), 10))
            .unwrap();
        storage
            .confirm_edge_and_credit(UserId(4), EdgeState::Pending, 1, 11)
            .unwrap()
            .unwrap();
        storage.record_check(UserId(2), true, 11).unwrap();

        assert!(storage.purge_user(UserId(2), 20).unwrap());
        assert!(storage.get_user(UserId(2)).unwrap().is_none());
        assert!(storage.get_edge(UserId(2)).unwrap().is_none());
        assert!(storage.recent_checks(UserId(2), 10).unwrap().is_empty());

        let orphaned = storage.get_edge(UserId(3)).unwrap().unwrap();
        assert_eq!(orphaned.state, EdgeState::Rejected);
        assert_eq!(orphaned.reject_reason, Some(RejectReason::ReferrerRemoved));
        assert_eq!(orphaned.updated_at, 20);
        assert_eq!(
            storage.get_edge(UserId(4)).unwrap().unwrap().state,
            EdgeState::Confirmed
        );
        assert!(!storage.purge_user(UserId(2), 21).unwrap());
    }

    #[test]
    fn test_stats_counts_states() {
        let storage = test_storage();
        for id in 1..=4 {
            storage.insert_user(&user(id)).unwrap();
        }
        for referee in 2..=4 {
            storage
                .insert_edge(&ReferralEdge::pending(UserId(1), UserId(referee), 10))
                .unwrap();
        }
        storage
            .confirm_edge_and_credit(UserId(2), EdgeState::Pending, 1, 20)
            .unwrap();
        storage
            .compare_and_set_edge(
                UserId(3),
                EdgeState::Pending,
                EdgeState::Rejected,
                Some(RejectReason::Vetoed),
                20,
            )
            .unwrap();
        storage.set_banned(UserId(4), true).unwrap();

        let stats = storage.stats().unwrap();
        assert_eq!(
            stats,
            LedgerStats {
                users: 4,
                banned_users: 1,
                pending: 1,
                confirmed: 1,
                rejected: 1,
                total_credited: 1,
            }
        );
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("refgate.db");
        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.insert_user(&user(1)).unwrap();
            storage.increment_credited(UserId(1), 2).unwrap();
        }
        let reopened = SqliteStorage::open(&path).unwrap();
        assert_eq!(
            reopened.get_user(UserId(1)).unwrap().unwrap().credited_referrals,
            2
        );
    }
}
