//! Per-connection client session.
//!
//! Owned by the connection task; nothing else touches it. The decrypted
//! private key lives here and nowhere else.

use std::collections::HashSet;

use serde::Serialize;
use zeroize::Zeroizing;

use dc_crypto::{LocalKey, PrivateKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Transport up, not logged in.
    Connected,
    Authenticated,
    Closed,
}

/// Login sent, result not yet received.
pub(crate) struct PendingLogin {
    pub username: String,
    pub local_key: LocalKey,
}

/// Register sent, result not yet received. The protected key is only
/// written to disk once the server accepts the name.
pub(crate) struct PendingRegister {
    pub username: String,
    pub key_file: Vec<u8>,
}

/// Read-only view for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub user: Option<String>,
    pub failed_message_count: u64,
    pub blocks: u64,
    pub msg_cost: u64,
    pub has_private_key: bool,
    pub selected_peer: Option<String>,
}

pub struct Session {
    state: SessionState,
    user: Option<String>,
    private_key: Option<PrivateKey>,
    pub(crate) pending_login: Option<PendingLogin>,
    pub(crate) pending_register: Option<PendingRegister>,
    failed_message_count: u64,
    /// Messages resent and awaiting their ack, as `(peer, id)`.
    in_flight_resends: HashSet<(String, u64)>,
    blocks: u64,
    msg_cost: u64,
    selected_peer: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Connected,
            user: None,
            private_key: None,
            pending_login: None,
            pending_register: None,
            failed_message_count: 0,
            in_flight_resends: HashSet::new(),
            blocks: 0,
            msg_cost: 0,
            selected_peer: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn private_key(&self) -> Option<&PrivateKey> {
        self.private_key.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    /// Connected → Authenticated. Identity is set once per session; a
    /// second call is ignored and returns `false`.
    pub fn authenticate(&mut self, user: String, blocks: u64, msg_cost: u64) -> bool {
        if self.state != SessionState::Connected || self.user.is_some() {
            return false;
        }
        self.state = SessionState::Authenticated;
        self.user = Some(user);
        self.blocks = blocks;
        self.msg_cost = msg_cost;
        true
    }

    /// Install the decrypted private key. Only once, only after login.
    pub fn set_private_key(&mut self, key: PrivateKey) -> bool {
        if !self.is_authenticated() || self.private_key.is_some() {
            return false;
        }
        self.private_key = Some(key);
        true
    }

    /// Any state → Closed. Clears identity and key material.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.user = None;
        self.private_key = None;
        self.pending_login = None;
        self.pending_register = None;
        self.in_flight_resends.clear();
    }

    pub fn failed_message_count(&self) -> u64 {
        self.failed_message_count
    }

    pub fn set_failed_message_count(&mut self, count: u64) {
        self.failed_message_count = count;
    }

    /// A message newly reached `Failed`.
    pub fn record_failure(&mut self) {
        self.failed_message_count += 1;
    }

    /// A `Failed` message reached `Sent`. Returns `false` (and leaves the
    /// counter at zero) if there was nothing to decrement.
    pub fn record_recovery(&mut self) -> bool {
        match self.failed_message_count.checked_sub(1) {
            Some(n) => {
                self.failed_message_count = n;
                true
            }
            None => false,
        }
    }

    pub(crate) fn mark_resend(&mut self, peer: &str, id: u64) -> bool {
        self.in_flight_resends.insert((peer.to_string(), id))
    }

    pub(crate) fn clear_resend(&mut self, peer: &str, id: u64) {
        self.in_flight_resends.remove(&(peer.to_string(), id));
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn set_blocks(&mut self, blocks: u64) {
        self.blocks = blocks;
    }

    pub fn selected_peer(&self) -> Option<&str> {
        self.selected_peer.as_deref()
    }

    pub fn select_peer(&mut self, peer: Option<String>) {
        self.selected_peer = peer;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            user: self.user.clone(),
            failed_message_count: self.failed_message_count,
            blocks: self.blocks,
            msg_cost: self.msg_cost,
            has_private_key: self.private_key.is_some(),
            selected_peer: self.selected_peer.clone(),
        }
    }
}

/// Password held for the length of one command.
pub type Password = Zeroizing<String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_set_once() {
        let mut s = Session::new();
        assert!(!s.set_private_key(PrivateKey::generate()));
        assert!(s.authenticate("alice".into(), 10, 1));
        assert!(!s.authenticate("mallory".into(), 10, 1));
        assert_eq!(s.user(), Some("alice"));
        assert!(s.set_private_key(PrivateKey::generate()));
        assert!(!s.set_private_key(PrivateKey::generate()));
    }

    #[test]
    fn close_clears_secrets() {
        let mut s = Session::new();
        s.authenticate("alice".into(), 10, 1);
        s.set_private_key(PrivateKey::generate());
        s.close();
        let snap = s.snapshot();
        assert_eq!(snap.state, SessionState::Closed);
        assert_eq!(snap.user, None);
        assert!(!snap.has_private_key);
        assert!(!s.authenticate("alice".into(), 10, 1));
    }

    #[test]
    fn counter_never_goes_negative() {
        let mut s = Session::new();
        assert!(!s.record_recovery());
        assert_eq!(s.failed_message_count(), 0);
        s.record_failure();
        s.record_failure();
        assert!(s.record_recovery());
        assert!(s.record_recovery());
        assert!(!s.record_recovery());
        assert_eq!(s.failed_message_count(), 0);
    }
}
