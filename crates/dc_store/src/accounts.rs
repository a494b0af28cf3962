//! Server-side account records, in the `users` partition of the server
//! store.
//!
//! Usernames are unique. Uniqueness is checked by a full scan inside the
//! insert transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dc_proto::User;

use crate::{
    db::Store,
    error::{Result, StoreError},
    users::USERS_PARTITION,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    /// Armored public key.
    pub public_key: String,
    /// Hex ServerProof submitted at registration.
    pub password_proof: String,
    /// Name under which the encrypted private key backup is stored.
    pub key_file: String,
    pub blocks: u64,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn to_user(&self, id: u64) -> User {
        User {
            id,
            username: self.username.clone(),
            public_key: self.public_key.clone(),
        }
    }
}

/// Result of charging an account for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charge {
    Charged { remaining: u64 },
    Insufficient { available: u64 },
}

pub struct AccountStore<'a> {
    store: &'a Store,
}

impl<'a> AccountStore<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn create(&self, account: &Account) -> Result<u64> {
        self.store.with_transaction(|tx| {
            if tx
                .scan::<Account>(USERS_PARTITION, |a| a.username == account.username)?
                .is_some()
            {
                return Err(StoreError::UserExists(account.username.clone()));
            }
            tx.append(USERS_PARTITION, &serde_json::to_vec(account)?)
        })
    }

    pub fn get(&self, username: &str) -> Result<Option<(u64, Account)>> {
        self.store
            .scan::<Account>(USERS_PARTITION, |a| a.username == username)
    }

    /// Drop `username`'s account. Returns whether it existed.
    pub fn remove(&self, username: &str) -> Result<bool> {
        self.store.with_transaction(|tx| {
            match tx.scan::<Account>(USERS_PARTITION, |a| a.username == username)? {
                Some((id, _)) => tx.delete(USERS_PARTITION, id),
                None => Ok(false),
            }
        })
    }

    /// Deduct `cost` blocks from `username` if the balance allows it.
    pub fn charge(&self, username: &str, cost: u64) -> Result<Charge> {
        self.store.with_transaction(|tx| {
            let (id, _) = tx
                .scan::<Account>(USERS_PARTITION, |a| a.username == username)?
                .ok_or_else(|| StoreError::NotFound(username.to_string()))?;
            tx.update_record::<Account, _>(USERS_PARTITION, id, |account| {
                if account.blocks < cost {
                    return Ok(Charge::Insufficient { available: account.blocks });
                }
                account.blocks -= cost;
                Ok(Charge::Charged { remaining: account.blocks })
            })
        })
    }

    /// Return `amount` blocks to `username`, e.g. after a charged delivery
    /// could not be handed over.
    pub fn credit(&self, username: &str, amount: u64) -> Result<u64> {
        self.store.with_transaction(|tx| {
            let (id, _) = tx
                .scan::<Account>(USERS_PARTITION, |a| a.username == username)?
                .ok_or_else(|| StoreError::NotFound(username.to_string()))?;
            tx.update_record::<Account, _>(USERS_PARTITION, id, |account| {
                account.blocks = account.blocks.saturating_add(amount);
                Ok(account.blocks)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(name: &str, blocks: u64) -> Account {
        Account {
            username: name.into(),
            public_key: "KEY".into(),
            password_proof: "00".repeat(16),
            key_file: name.into(),
            blocks,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let accounts = AccountStore::new(&store);
        assert_eq!(accounts.create(&account("alice", 10)).unwrap(), 1);
        assert!(matches!(
            accounts.create(&account("alice", 10)),
            Err(StoreError::UserExists(name)) if name == "alice"
        ));
        assert_eq!(accounts.create(&account("bob", 10)).unwrap(), 2);
    }

    #[test]
    fn charge_deducts_until_insufficient() {
        let store = Store::open_in_memory().unwrap();
        let accounts = AccountStore::new(&store);
        accounts.create(&account("alice", 3)).unwrap();
        assert_eq!(accounts.charge("alice", 2).unwrap(), Charge::Charged { remaining: 1 });
        assert_eq!(accounts.charge("alice", 2).unwrap(), Charge::Insufficient { available: 1 });
        assert_eq!(accounts.get("alice").unwrap().unwrap().1.blocks, 1);
        assert!(matches!(accounts.charge("nobody", 1), Err(StoreError::NotFound(_))));
        assert_eq!(accounts.credit("alice", 2).unwrap(), 3);
    }

    #[test]
    fn removed_account_frees_the_name() {
        let store = Store::open_in_memory().unwrap();
        let accounts = AccountStore::new(&store);
        accounts.create(&account("alice", 10)).unwrap();
        assert!(accounts.remove("alice").unwrap());
        assert!(accounts.get("alice").unwrap().is_none());
        assert!(!accounts.remove("alice").unwrap());
        assert_eq!(accounts.create(&account("alice", 10)).unwrap(), 2);
    }
}
