//! Client-side cache of looked-up users, in the `users` partition.

use dc_proto::User;

use crate::{
    db::Store,
    error::{Result, StoreError},
};

pub const USERS_PARTITION: &str = "users";

/// Outcome of caching a lookup result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Added(u64),
    /// Already cached with the same key.
    Unchanged(u64),
}

pub struct UserStore<'a> {
    store: &'a Store,
}

impl<'a> UserStore<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Cache `user`. A username already present with a different public key
    /// is refused with [`StoreError::KeyConflict`].
    pub fn add(&self, user: &User) -> Result<CacheOutcome> {
        self.store.with_transaction(|tx| {
            if let Some((id, existing)) =
                tx.scan::<User>(USERS_PARTITION, |u| u.username == user.username)?
            {
                if existing.public_key.trim() == user.public_key.trim() {
                    return Ok(CacheOutcome::Unchanged(id));
                }
                return Err(StoreError::KeyConflict { username: user.username.clone() });
            }
            let id = tx.append(USERS_PARTITION, &serde_json::to_vec(user)?)?;
            tracing::debug!(target: "dc_store", username = %user.username, id, "user cached");
            Ok(CacheOutcome::Added(id))
        })
    }

    pub fn get(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .store
            .scan::<User>(USERS_PARTITION, |u| u.username == username)?
            .map(|(_, u)| u))
    }

    pub fn list(&self) -> Result<Vec<User>> {
        Ok(self
            .store
            .list::<User>(USERS_PARTITION)?
            .into_iter()
            .map(|(_, u)| u)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, key: &str) -> User {
        User { id: 0, username: name.into(), public_key: key.into() }
    }

    #[test]
    fn add_then_get() {
        let store = Store::open_in_memory().unwrap();
        let users = UserStore::new(&store);
        assert_eq!(users.add(&user("bob", "K1")).unwrap(), CacheOutcome::Added(1));
        assert_eq!(users.get("bob").unwrap().unwrap().public_key, "K1");
        assert!(users.get("carol").unwrap().is_none());
    }

    #[test]
    fn same_key_is_a_noop_and_changed_key_is_refused() {
        let store = Store::open_in_memory().unwrap();
        let users = UserStore::new(&store);
        users.add(&user("bob", "K1")).unwrap();
        assert_eq!(users.add(&user("bob", "K1")).unwrap(), CacheOutcome::Unchanged(1));
        assert!(matches!(
            users.add(&user("bob", "K2")),
            Err(StoreError::KeyConflict { .. })
        ));
        assert_eq!(users.list().unwrap().len(), 1);
    }
}
