//! dc_store - Local storage for Darklock Courier
//!
//! One SQLite file per process holds named partitions of sequenced records:
//! - `users`           - cached user records (client) or accounts (server)
//! - `thread:<peer>`   - messages exchanged with one peer
//!
//! Lookups by field are linear scans over a partition.

pub mod accounts;
pub mod db;
pub mod error;
pub mod threads;
pub mod users;

pub use accounts::{Account, AccountStore, Charge};
pub use db::{Store, Txn};
pub use error::StoreError;
pub use threads::ThreadStore;
pub use users::{CacheOutcome, UserStore};
