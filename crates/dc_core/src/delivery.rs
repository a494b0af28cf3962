//! Outbound delivery and the failed-message retry queue.
//!
//! Each outbound message is stored as `Pending` in the recipient's thread
//! before it is sent. The server's `SendMessageResult` moves it to `Sent`
//! or `Failed`.
//!
//! `FailedMessageCount` in the session gates retries: when it is non-zero,
//! a send to R first resends every `Failed` message to R, oldest first.
//! The counter goes up on `Pending → Failed` and down on `Failed → Sent`,
//! and on nothing else.

use chrono::{DateTime, Utc};
use serde::Serialize;

use dc_crypto::{seal, PublicKey};
use dc_proto::{
    records::{IncomingMessage, SendMessageResult, SendMessageTo},
    validate_username, ClientPacket, Message, MessageStatus,
};
use dc_store::{ThreadStore, UserStore};

use crate::client::ClientRouter;
use crate::error::{DomainError, Result, SuggestedAction};
use crate::events::ClientEvent;

/// One message of a thread, opened for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadEntry {
    pub id: u64,
    pub from: String,
    pub to: String,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    /// `None` when the body cannot be opened with the session key.
    pub text: Option<String>,
}

impl ClientRouter {
    /// Seal `text` to `to`, store it as `Pending` and send it, after first
    /// resending any failed messages to the same peer.
    pub(crate) async fn send_message(&mut self, to: &str, text: &str) -> Result<()> {
        let me = self.require_user()?;
        let own_key = self
            .session
            .private_key()
            .map(|k| k.public_key())
            .ok_or_else(|| DomainError::return_to_login("private key not loaded; log in again"))?;

        let recipient = UserStore::new(&self.ctx.store).get(to)?.ok_or_else(|| {
            DomainError::new(
                format!("unknown recipient {to}; look them up first"),
                SuggestedAction::LookupRecipient,
            )
        })?;
        let recipient_key = PublicKey::from_armored(&recipient.public_key).map_err(|e| {
            DomainError::new(format!("cached key for {to} is unusable: {e}"), SuggestedAction::LookupRecipient)
        })?;

        if self.session.failed_message_count() > 0 {
            self.resend_failed(to).await?;
        }

        let mut message = Message::new(me, to, seal::seal(&recipient_key, text.as_bytes())?);
        message.sender_copy = Some(seal::seal(&own_key, text.as_bytes())?);
        let id = ThreadStore::new(&self.ctx.store).add(to, &mut message)?;

        tracing::debug!(target: "dc_core", to, id, "sending message");
        self.send_packet(ClientPacket::SendMessageTo(SendMessageTo { message: message.for_wire() }))
            .await?;
        self.request_redraw_if_selected(to);
        Ok(())
    }

    /// Resend `Failed` messages to `to` in ID order. Messages already resent
    /// and still awaiting their ack are skipped. Returns how many were sent.
    pub(crate) async fn resend_failed(&mut self, to: &str) -> Result<usize> {
        let failed = ThreadStore::new(&self.ctx.store).failed_for(to)?;
        let mut resent = 0;
        for message in failed {
            if !self.session.mark_resend(to, message.id) {
                continue;
            }
            tracing::debug!(target: "dc_core", to, id = message.id, "resending failed message");
            self.send_packet(ClientPacket::SendMessageTo(SendMessageTo { message: message.for_wire() }))
                .await?;
            resent += 1;
        }
        if resent > 0 {
            tracing::info!(target: "dc_core", event = "retry", to, resent);
        }
        Ok(resent)
    }

    pub(crate) fn on_send_result(&mut self, r: SendMessageResult) -> Result<()> {
        self.session.clear_resend(&r.to, r.id);
        let threads = ThreadStore::new(&self.ctx.store);
        let Some(message) = threads.get(&r.to, r.id)? else {
            tracing::warn!(target: "dc_core", to = %r.to, id = r.id, "ack for an unknown message");
            return Ok(());
        };
        let previous = message.status;
        let Some(next) = previous.after_ack(r.success) else {
            tracing::debug!(target: "dc_core", to = %r.to, id = r.id, "ack for a sent message ignored");
            return Ok(());
        };
        if next != previous {
            threads.set_status(&r.to, r.id, next)?;
        }

        match (previous, next) {
            (MessageStatus::Pending, MessageStatus::Failed) => self.session.record_failure(),
            (MessageStatus::Failed, MessageStatus::Sent) => {
                if !self.session.record_recovery() {
                    tracing::warn!(target: "dc_core", to = %r.to, id = r.id, "recovered a message the counter did not track");
                }
            }
            _ => {}
        }

        if r.success {
            tracing::debug!(target: "dc_core", to = %r.to, id = r.id, "message delivered");
        } else {
            tracing::info!(target: "dc_core", event = "send_failed", to = %r.to, id = r.id, reason = %r.message);
        }
        self.emit(ClientEvent::MessageStatusChanged { to: r.to.clone(), id: r.id, status: next });
        self.request_redraw_if_selected(&r.to);
        Ok(())
    }

    pub(crate) fn on_incoming(&mut self, incoming: IncomingMessage) -> Result<()> {
        let IncomingMessage { mut message, from } = incoming;
        let from = if from.is_empty() { message.from.clone() } else { from };
        if let Err(e) = validate_username(&from) {
            tracing::warn!(target: "dc_core", error = %e, "incoming message with invalid sender dropped");
            return Ok(());
        }

        message.from = from.clone();
        message.status = MessageStatus::Sent;
        message.sender_copy = None;
        let id = ThreadStore::new(&self.ctx.store).add(&from, &mut message)?;

        tracing::debug!(target: "dc_core", from = %from, id, "message received");
        self.emit(ClientEvent::MessageReceived { from: from.clone(), id });
        self.request_redraw_if_selected(&from);
        Ok(())
    }

    /// Rebuild `FailedMessageCount` from the store at login. `Pending`
    /// messages left by an earlier connection can no longer be acked, so
    /// they are marked `Failed` first.
    pub(crate) fn restore_failed_count(&mut self) -> Result<u64> {
        let threads = ThreadStore::new(&self.ctx.store);
        for peer in threads.peers()? {
            for message in threads.list(&peer)? {
                if message.status == MessageStatus::Pending {
                    threads.set_status(&peer, message.id, MessageStatus::Failed)?;
                }
            }
        }
        let count = threads.count_failed()?;
        self.session.set_failed_message_count(count);
        Ok(count)
    }

    /// The thread with `peer`, with bodies opened where possible.
    pub(crate) fn read_thread(&self, peer: &str) -> Result<Vec<ThreadEntry>> {
        let me = self.require_user()?;
        let key = self.session.private_key();
        let entries = ThreadStore::new(&self.ctx.store)
            .list(peer)?
            .into_iter()
            .map(|m| {
                let sealed = if m.from == me { m.sender_copy.as_deref() } else { Some(m.body.as_slice()) };
                let text = match (key, sealed) {
                    (Some(key), Some(sealed)) => seal::open(key, sealed)
                        .ok()
                        .map(|plain| String::from_utf8_lossy(&plain).into_owned()),
                    _ => None,
                };
                ThreadEntry {
                    id: m.id,
                    from: m.from,
                    to: m.to,
                    status: m.status,
                    timestamp: m.timestamp,
                    text,
                }
            })
            .collect();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use dc_crypto::PrivateKey;
    use dc_proto::{Frame, User};
    use dc_store::Store;

    use super::*;
    use crate::client::ClientContext;
    use crate::error::CourierError;
    use crate::keyfile::MemoryKeyFileStore;

    struct Harness {
        router: ClientRouter,
        wire: mpsc::Receiver<Frame>,
        bob: PrivateKey,
    }

    fn logged_in_alice() -> Harness {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (ctx, _events) = ClientContext::new(store, Arc::new(MemoryKeyFileStore::new()));
        let (tx, wire) = mpsc::channel(16);
        let mut router = ClientRouter::new(ctx, tx);
        router.session.authenticate("alice".into(), 10, 1);
        router.session.set_private_key(PrivateKey::generate());

        let bob = PrivateKey::generate();
        UserStore::new(&router.ctx.store)
            .add(&User { id: 0, username: "bob".into(), public_key: bob.public_key().to_armored() })
            .unwrap();
        Harness { router, wire, bob }
    }

    fn sent(wire: &mut mpsc::Receiver<Frame>) -> Message {
        match ClientPacket::from_frame(&wire.try_recv().unwrap()).unwrap() {
            ClientPacket::SendMessageTo(SendMessageTo { message }) => message,
            other => panic!("unexpected packet {other:?}"),
        }
    }

    fn ack(id: u64, success: bool) -> SendMessageResult {
        SendMessageResult { success, message: String::new(), id, to: "bob".into() }
    }

    #[tokio::test]
    async fn unknown_recipient_asks_for_a_lookup() {
        let mut h = logged_in_alice();
        let err = h.router.send_message("carol", "hi").await.unwrap_err();
        assert!(matches!(
            err,
            CourierError::Domain(DomainError { suggested_action: SuggestedAction::LookupRecipient, .. })
        ));
        assert!(h.wire.try_recv().is_err());
    }

    #[tokio::test]
    async fn wire_copy_opens_for_the_recipient_only() {
        let mut h = logged_in_alice();
        h.router.send_message("bob", "hello bob").await.unwrap();
        let m = sent(&mut h.wire);
        assert_eq!(m.id, 1);
        assert_eq!(m.status, MessageStatus::Pending);
        assert!(m.sender_copy.is_none());
        assert_eq!(&seal::open(&h.bob, &m.body).unwrap()[..], b"hello bob");

        let thread = h.router.read_thread("bob").unwrap();
        assert_eq!(thread[0].text.as_deref(), Some("hello bob"));
    }

    #[tokio::test]
    async fn failed_messages_are_resent_first_and_counted_back_down() {
        let mut h = logged_in_alice();
        h.router.send_message("bob", "one").await.unwrap();
        h.router.send_message("bob", "two").await.unwrap();
        sent(&mut h.wire);
        sent(&mut h.wire);
        h.router.on_send_result(ack(1, false)).unwrap();
        h.router.on_send_result(ack(2, false)).unwrap();
        assert_eq!(h.router.session.failed_message_count(), 2);

        h.router.send_message("bob", "three").await.unwrap();
        let order: Vec<u64> = (0..3).map(|_| sent(&mut h.wire).id).collect();
        assert_eq!(order, vec![1, 2, 3]);

        h.router.on_send_result(ack(1, true)).unwrap();
        h.router.on_send_result(ack(2, true)).unwrap();
        h.router.on_send_result(ack(3, true)).unwrap();
        assert_eq!(h.router.session.failed_message_count(), 0);
        let statuses: Vec<_> = h.router.read_thread("bob").unwrap().into_iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![MessageStatus::Sent; 3]);
    }

    #[tokio::test]
    async fn resend_in_flight_is_not_duplicated() {
        let mut h = logged_in_alice();
        h.router.send_message("bob", "one").await.unwrap();
        sent(&mut h.wire);
        h.router.on_send_result(ack(1, false)).unwrap();

        h.router.send_message("bob", "two").await.unwrap();
        h.router.send_message("bob", "three").await.unwrap();
        let ids: Vec<u64> = std::iter::from_fn(|| h.wire.try_recv().ok())
            .map(|f| match ClientPacket::from_frame(&f).unwrap() {
                ClientPacket::SendMessageTo(s) => s.message.id,
                _ => 0,
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failed_resend_stays_failed_without_recounting() {
        let mut h = logged_in_alice();
        h.router.send_message("bob", "one").await.unwrap();
        h.router.on_send_result(ack(1, false)).unwrap();
        h.router.on_send_result(ack(1, false)).unwrap();
        assert_eq!(h.router.session.failed_message_count(), 1);

        h.router.on_send_result(ack(1, true)).unwrap();
        h.router.on_send_result(ack(1, true)).unwrap();
        assert_eq!(h.router.session.failed_message_count(), 0);
    }

    #[tokio::test]
    async fn unknown_ack_is_ignored() {
        let mut h = logged_in_alice();
        h.router.on_send_result(ack(42, false)).unwrap();
        assert_eq!(h.router.session.failed_message_count(), 0);
    }

    #[test]
    fn incoming_messages_land_in_the_senders_thread() {
        let mut h = logged_in_alice();
        let alice_pub = h.router.session.private_key().unwrap().public_key();
        let mut m = Message::new("bob", "alice", seal::seal(&alice_pub, b"hi alice").unwrap());
        m.id = 77;
        h.router.on_incoming(IncomingMessage { message: m, from: "bob".into() }).unwrap();

        let thread = h.router.read_thread("bob").unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].id, 1);
        assert_eq!(thread[0].status, MessageStatus::Sent);
        assert_eq!(thread[0].text.as_deref(), Some("hi alice"));
    }

    #[tokio::test]
    async fn leftover_pending_messages_count_as_failed_at_login() {
        let mut h = logged_in_alice();
        h.router.send_message("bob", "one").await.unwrap();
        h.router.send_message("bob", "two").await.unwrap();
        h.router.on_send_result(ack(2, true)).unwrap();

        assert_eq!(h.router.restore_failed_count().unwrap(), 1);
        assert_eq!(h.router.session.failed_message_count(), 1);
        let first = ThreadStore::new(&h.router.ctx.store).require("bob", 1).unwrap();
        assert_eq!(first.status, MessageStatus::Failed);
    }
}
