//! User identity records.
//!
//! [`IdentityStore::get_or_create`] is the only path that creates a user and
//! therefore the only path that assigns an invite code. Codes come from the
//! [`InviteCodec`], so two users can never share one.

use std::sync::Arc;

use crate::codec::InviteCodec;
use crate::model::{now_secs, Subscription, User, UserId};
use crate::storage::{ReferralStore, StorageError};

/// Result of [`IdentityStore::get_or_create`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub user: User,
    /// Whether this call created the record (first contact).
    pub created: bool,
}

#[derive(Clone)]
pub struct IdentityStore {
    store: Arc<dyn ReferralStore>,
    codec: InviteCodec,
}

impl IdentityStore {
    pub fn new(store: Arc<dyn ReferralStore>, codec: InviteCodec) -> Self {
        Self { store, codec }
    }

    pub fn codec(&self) -> &InviteCodec {
        &self.codec
    }

    pub fn get(&self, id: UserId) -> Result<Option<User>, StorageError> {
        self.store.get_user(id)
    }

    /// Return the existing record or create one with a fresh invite code.
    ///
    /// Concurrent first contacts for the same id are resolved by the store's
    /// insert-if-absent: exactly one caller sees `created == true`.
    pub fn get_or_create(&self, id: UserId) -> Result<Registration, StorageError> {
        if let Some(user) = self.store.get_user(id)? {
            return Ok(Registration {
                user,
                created: false,
            });
        }
        let fresh = User::new(id, self.codec.encode(id), now_secs());
        let created = self.store.insert_user(&fresh)?;
        let user = if created {
            fresh
        } else {
            self.store
                .get_user(id)?
                .ok_or_else(|| StorageError::NotFound(format!("user {id} vanished after insert")))?
        };
        Ok(Registration { user, created })
    }

    pub fn set_subscribed(&self, id: UserId, subscribed: bool) -> Result<(), StorageError> {
        self.store
            .set_subscribed(id, Subscription::from_observed(subscribed))
    }

    pub fn set_banned(&self, id: UserId, banned: bool) -> Result<(), StorageError> {
        self.store.set_banned(id, banned)
    }

    /// Atomic read-modify-write of `credited_referrals`.
    pub fn increment_credited(&self, id: UserId, n: u64) -> Result<u64, StorageError> {
        self.store.increment_credited(id, n)
    }

    pub fn purge(&self, id: UserId) -> Result<bool, StorageError> {
        self.store.purge_user(id, now_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use crate::storage::SqliteStorage;

    fn identities(store: Arc<dyn ReferralStore>) -> IdentityStore {
        IdentityStore::new(store, InviteCodec::new("identity-tests"))
    }

    #[test]
    fn test_first_contact_creates_with_code() {
        let ids = identities(Arc::new(SqliteStorage::open_in_memory().unwrap()));
        let first = ids.get_or_create(UserId(10)).unwrap();
        assert!(first.created);
        assert_eq!(
            ids.codec().decode(&first.user.invite_code),
            Ok(UserId(10))
        );
        assert_eq!(first.user.subscribed, Subscription::Unknown);

        let again = ids.get_or_create(UserId(10)).unwrap();
        assert!(!again.created);
        assert_eq!(again.user.invite_code, first.user.invite_code);
    }

    #[test]
    fn test_distinct_users_get_distinct_codes() {
        let ids = identities(Arc::new(MemoryStorage::new()));
        let a = ids.get_or_create(UserId(1)).unwrap().user.invite_code;
        let b = ids.get_or_create(UserId(2)).unwrap().user.invite_code;
        assert_ne!(a, b);
    }

    #[test]
    fn test_updates_before_creation_are_not_found() {
        let ids = identities(Arc::new(MemoryStorage::new()));
        assert!(matches!(
            ids.set_subscribed(UserId(3), true),
            Err(StorageError::NotFound(_))
        ));
        ids.get_or_create(UserId(3)).unwrap();
        ids.set_subscribed(UserId(3), true).unwrap();
        assert_eq!(
            ids.get(UserId(3)).unwrap().unwrap().subscribed,
            Subscription::Subscribed
        );
    }

    #[test]
    fn test_increment_accumulates() {
        let ids = identities(Arc::new(SqliteStorage::open_in_memory().unwrap()));
        ids.get_or_create(UserId(4)).unwrap();
        assert_eq!(ids.increment_credited(UserId(4), 2).unwrap(), 2);
        assert_eq!(ids.increment_credited(UserId(4), 3).unwrap(), 5);
    }
}
