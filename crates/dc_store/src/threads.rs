//! Per-peer message threads.
//!
//! Each conversation lives in its own partition named `thread:<peer>`. The
//! prefix keeps thread partitions apart from `users`, so a peer may be
//! called anything a username allows.

use std::ops::ControlFlow;

use dc_proto::{Message, MessageStatus};

use crate::{
    db::Store,
    error::{Result, StoreError},
};

pub const THREAD_PREFIX: &str = "thread:";

pub fn thread_partition(peer: &str) -> String {
    format!("{THREAD_PREFIX}{peer}")
}

pub struct ThreadStore<'a> {
    store: &'a Store,
}

impl<'a> ThreadStore<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Append `message` to the thread with `peer`. The allocated ID is
    /// written into `message.id` before it is stored.
    pub fn add(&self, peer: &str, message: &mut Message) -> Result<u64> {
        let partition = thread_partition(peer);
        self.store.with_transaction(|tx| {
            tx.create_partition_if_absent(&partition)?;
            let id = tx.next_sequence(&partition)?;
            message.id = id;
            tx.put(&partition, id, &serde_json::to_vec(message)?)?;
            Ok(id)
        })
    }

    pub fn get(&self, peer: &str, id: u64) -> Result<Option<Message>> {
        self.store.get_record(&thread_partition(peer), id)
    }

    /// Set the status of one message, returning the previous status.
    pub fn set_status(&self, peer: &str, id: u64, status: MessageStatus) -> Result<MessageStatus> {
        self.store
            .update_record::<Message, _>(&thread_partition(peer), id, |m| {
                let previous = m.status;
                m.status = status;
                Ok(previous)
            })
    }

    /// Failed messages to `peer`, oldest first.
    pub fn failed_for(&self, peer: &str) -> Result<Vec<Message>> {
        Ok(self
            .list(peer)?
            .into_iter()
            .filter(|m| m.status == MessageStatus::Failed)
            .collect())
    }

    /// Failed messages across all threads.
    pub fn count_failed(&self) -> Result<u64> {
        self.store.read(|tx| {
            let mut count = 0u64;
            for partition in tx.partitions_with_prefix(THREAD_PREFIX)? {
                tx.for_each(&partition, |_, bytes| {
                    let m: Message = serde_json::from_slice(bytes)?;
                    if m.status == MessageStatus::Failed {
                        count += 1;
                    }
                    Ok(ControlFlow::Continue(()))
                })?;
            }
            Ok(count)
        })
    }

    /// The whole thread with `peer` in ID order.
    pub fn list(&self, peer: &str) -> Result<Vec<Message>> {
        Ok(self
            .store
            .list::<Message>(&thread_partition(peer))?
            .into_iter()
            .map(|(_, m)| m)
            .collect())
    }

    pub fn peers(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .partitions_with_prefix(THREAD_PREFIX)?
            .into_iter()
            .filter_map(|p| p.strip_prefix(THREAD_PREFIX).map(str::to_string))
            .collect())
    }

    /// Like [`ThreadStore::get`] but a missing message is an error.
    pub fn require(&self, peer: &str, id: u64) -> Result<Message> {
        self.get(peer, id)?
            .ok_or_else(|| StoreError::NotFound(format!("message {id} to {peer}")))
    }
}
