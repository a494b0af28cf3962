//! Client events and the presentation-facing notifier.
//!
//! Protocol handlers never call into the UI directly. They push typed
//! [`ClientEvent`]s onto an unbounded channel; the presentation layer
//! drains it and maps each event onto its [`Notifier`] with [`dispatch`].
//! Thread redraws go through a [`RefreshCoalescer`] instead, so a burst of
//! changes to one conversation becomes a single redraw.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use dc_proto::MessageStatus;

use crate::error::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Page {
    Login,
    Register,
    Inbox,
}

impl Page {
    pub fn name(self) -> &'static str {
        match self {
            Page::Login => "login",
            Page::Register => "register",
            Page::Inbox => "inbox",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    Registered { username: String },
    RegisterFailed { reason: DomainError },
    LoggedIn { username: String, blocks: u64, failed_messages: u64 },
    LoginFailed { reason: DomainError },
    UserAdded { username: String, fingerprint: String },
    MessageReceived { from: String, id: u64 },
    MessageStatusChanged { to: String, id: u64, status: MessageStatus },
    BlocksUpdated { blocks: u64 },
    Error(DomainError),
    Navigate { page: Page },
    Disconnected { reason: String },
}

/// Presentation callbacks. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify_error(&self, error: &DomainError);
    fn notify_navigate(&self, page: Page);
    fn notify_contacts_changed(&self);
    fn notify_thread_changed(&self, peer: &str);

    /// Free-form status line. Default: ignored.
    fn notify_status(&self, _text: &str) {}
}

/// Map one event onto the notifier.
pub fn dispatch(event: &ClientEvent, notifier: &dyn Notifier) {
    match event {
        ClientEvent::Registered { username } => {
            notifier.notify_status(&format!("registered {username}; log in to continue"));
            notifier.notify_navigate(Page::Login);
        }
        ClientEvent::RegisterFailed { reason } => notifier.notify_error(reason),
        ClientEvent::LoggedIn { username, blocks, failed_messages } => {
            notifier.notify_status(&format!(
                "logged in as {username} ({blocks} blocks, {failed_messages} failed messages)"
            ));
            notifier.notify_navigate(Page::Inbox);
            notifier.notify_contacts_changed();
        }
        ClientEvent::LoginFailed { reason } => notifier.notify_error(reason),
        ClientEvent::UserAdded { .. } => notifier.notify_contacts_changed(),
        ClientEvent::MessageReceived { from, .. } => {
            notifier.notify_status(&format!("new message from {from}"));
            notifier.notify_contacts_changed();
        }
        ClientEvent::MessageStatusChanged { to, id, status } => {
            notifier.notify_status(&format!("message {id} to {to}: {}", status.as_str()));
        }
        ClientEvent::BlocksUpdated { blocks } => {
            notifier.notify_status(&format!("{blocks} blocks remaining"));
        }
        ClientEvent::Error(err) => notifier.notify_error(err),
        ClientEvent::Navigate { page } => notifier.notify_navigate(*page),
        ClientEvent::Disconnected { reason } => {
            notifier.notify_status(&format!("disconnected: {reason}"));
        }
    }
}

/// At most one pending redraw per conversation.
///
/// `request` marks a peer dirty and wakes the consumer; `next_batch` waits
/// for at least one dirty peer and takes them all. Requests that arrive
/// while a batch is being drawn land in the next batch, never lost and
/// never drawn from stale state.
#[derive(Default)]
pub struct RefreshCoalescer {
    pending: Mutex<BTreeSet<String>>,
    notify: Notify,
}

impl RefreshCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when a redraw for `peer` was already pending.
    pub fn request(&self, peer: &str) -> bool {
        let inserted = self.pending.lock().insert(peer.to_string());
        if inserted {
            self.notify.notify_one();
        }
        inserted
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending.lock()).into_iter().collect()
    }

    pub async fn next_batch(&self) -> Vec<String> {
        loop {
            let batch = self.take();
            if !batch.is_empty() {
                return batch;
            }
            self.notify.notified().await;
        }
    }
}
