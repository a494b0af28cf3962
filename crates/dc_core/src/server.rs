//! Relay server.
//!
//! Each connection gets its own [`ServerRouter`] and I/O tasks. The
//! [`Registry`] maps a logged-in username to the outbound queue of the one
//! connection that owns it, which is how messages are forwarded.
//! Forwarding never blocks on the recipient: a full or closed queue fails
//! the delivery and the sender's charge is refunded.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use dc_crypto::{PublicKey, ServerProof};
use dc_proto::{
    records::{
        BlockAllowanceUpdate, IncomingMessage, LoginRequest, LoginResult, LookupUser, Pong,
        RegisterRequest, RegisterResult, SendMessageResult, SendMessageTo, UserResult,
    },
    validate_username, ClientPacket, Frame, MessageStatus, ServerPacket, PROTOCOL_VERSION,
};
use dc_store::{Account, AccountStore, Charge, Store, StoreError};

use crate::config::{ServerConfig, TimeoutConfig};
use crate::error::{CourierError, Result};
use crate::keyfile::KeyFileStore;
use crate::tls::HANDSHAKE_TIMEOUT;
use crate::transport::spawn_io;

/// Logged-in users and their connections' outbound queues.
#[derive(Default)]
pub struct Registry {
    online: Mutex<HashMap<String, (u64, mpsc::Sender<Frame>)>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `username` to connection `conn_id`. Fails if another
    /// connection already holds it.
    pub fn claim(&self, username: &str, conn_id: u64, tx: mpsc::Sender<Frame>) -> bool {
        let mut online = self.online.lock();
        if online.contains_key(username) {
            return false;
        }
        online.insert(username.to_string(), (conn_id, tx));
        true
    }

    /// Remove `username` if `conn_id` still owns it.
    pub fn release(&self, username: &str, conn_id: u64) {
        let mut online = self.online.lock();
        if matches!(online.get(username), Some((owner, _)) if *owner == conn_id) {
            online.remove(username);
        }
    }

    pub fn sender_for(&self, username: &str) -> Option<mpsc::Sender<Frame>> {
        self.online.lock().get(username).map(|(_, tx)| tx.clone())
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.online.lock().contains_key(username)
    }
}

/// State shared by every connection.
pub struct ServerContext {
    pub store: Arc<Store>,
    /// Backup of each account's encrypted private key.
    pub keys: Arc<dyn KeyFileStore>,
    pub registry: Registry,
    pub initial_blocks: u64,
    pub msg_cost: u64,
    next_conn_id: AtomicU64,
}

impl ServerContext {
    pub fn new(store: Arc<Store>, keys: Arc<dyn KeyFileStore>, config: &ServerConfig) -> Self {
        Self {
            store,
            keys,
            registry: Registry::new(),
            initial_blocks: config.initial_blocks,
            msg_cost: config.msg_cost,
            next_conn_id: AtomicU64::new(1),
        }
    }

    fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct ServerRouter {
    ctx: Arc<ServerContext>,
    conn_id: u64,
    outbound: mpsc::Sender<Frame>,
    user: Option<String>,
}

impl ServerRouter {
    pub fn new(ctx: Arc<ServerContext>, outbound: mpsc::Sender<Frame>) -> Self {
        let conn_id = ctx.next_conn_id();
        Self { ctx, conn_id, outbound, user: None }
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    async fn reply(&self, packet: ServerPacket) -> Result<()> {
        let frame = packet.to_frame()?;
        self.outbound.send(frame).await.map_err(|_| CourierError::Closed)
    }

    /// Handle one client frame. Frames that do not decode are logged and
    /// dropped; the connection carries on.
    pub async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        let packet = match ClientPacket::from_frame(&frame) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(target: "dc_core", conn = self.conn_id, opcode = frame.opcode, error = %e, "dropping frame");
                return Ok(());
            }
        };
        match packet {
            ClientPacket::Register(req) => {
                let result = self.register(req).await?;
                self.reply(ServerPacket::RegisterResult(result)).await
            }
            ClientPacket::Login(req) => {
                let result = self.login(req)?;
                self.reply(ServerPacket::LoginResult(result)).await
            }
            ClientPacket::LookupUser(req) => {
                let result = self.lookup(req)?;
                self.reply(ServerPacket::UserResult(result)).await
            }
            ClientPacket::SendMessageTo(req) => self.relay(req).await,
            ClientPacket::Ping(p) => self.reply(ServerPacket::Pong(Pong { nonce: p.nonce })).await,
        }
    }

    async fn register(&mut self, req: RegisterRequest) -> Result<RegisterResult> {
        let refuse = |message: &str| RegisterResult { success: false, message: message.to_string() };
        if self.user.is_some() {
            return Ok(refuse("already logged in"));
        }
        if let Err(m) = validate_username(&req.username) {
            return Ok(refuse(&m));
        }
        let Ok(proof) = ServerProof::from_hex(&req.server_proof) else {
            return Ok(refuse("malformed password proof"));
        };
        if PublicKey::from_armored(&req.armored_public_key).is_err() {
            return Ok(refuse("malformed public key"));
        }
        let blob = match STANDARD.decode(&req.encrypted_private_key) {
            Ok(b) if !b.is_empty() => b,
            _ => return Ok(refuse("malformed private key backup")),
        };

        let account = Account {
            username: req.username.clone(),
            public_key: req.armored_public_key,
            password_proof: proof.to_hex(),
            key_file: req.username.clone(),
            blocks: self.ctx.initial_blocks,
            created_at: Utc::now(),
        };
        match AccountStore::new(&self.ctx.store).create(&account) {
            Ok(_) => {}
            Err(StoreError::UserExists(_)) => return Ok(refuse("username already taken")),
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = self.ctx.keys.write_file(&blob, &account.key_file).await {
            tracing::error!(target: "dc_core", username = %account.username, error = %e, "failed to store key backup");
            AccountStore::new(&self.ctx.store).remove(&account.username)?;
            return Ok(refuse("could not store key backup"));
        }

        tracing::info!(target: "dc_core", event = "registered", username = %account.username, conn = self.conn_id);
        Ok(RegisterResult { success: true, message: "registered".into() })
    }

    fn login(&mut self, req: LoginRequest) -> Result<LoginResult> {
        let refuse = |message: &str| LoginResult {
            username: req.username.clone(),
            success: false,
            message: message.to_string(),
            ..Default::default()
        };
        if self.user.is_some() {
            return Ok(refuse("already logged in"));
        }
        if req.version != PROTOCOL_VERSION {
            return Ok(refuse(&format!(
                "unsupported protocol version {:?}; this server speaks {PROTOCOL_VERSION}",
                req.version
            )));
        }
        let Some((_, account)) = AccountStore::new(&self.ctx.store).get(&req.username)? else {
            return Ok(refuse("invalid username or password"));
        };
        let proven = match (ServerProof::from_hex(&req.server_proof), ServerProof::from_hex(&account.password_proof)) {
            (Ok(given), Ok(stored)) => stored.matches(&given),
            _ => false,
        };
        if !proven {
            tracing::info!(target: "dc_core", event = "login_failed", username = %req.username, conn = self.conn_id);
            return Ok(refuse("invalid username or password"));
        }
        if !self.ctx.registry.claim(&account.username, self.conn_id, self.outbound.clone()) {
            return Ok(refuse("already logged in on another connection"));
        }

        self.user = Some(account.username.clone());
        tracing::info!(target: "dc_core", event = "logged_in", username = %account.username, conn = self.conn_id);
        Ok(LoginResult {
            username: account.username,
            success: true,
            message: "welcome".into(),
            block_allowance: account.blocks,
            msg_cost: self.ctx.msg_cost,
        })
    }

    fn lookup(&self, req: LookupUser) -> Result<UserResult> {
        if self.user.is_none() {
            return Ok(UserResult { success: false, message: "log in first".into(), user: None });
        }
        Ok(match AccountStore::new(&self.ctx.store).get(&req.username)? {
            Some((id, account)) => UserResult {
                success: true,
                message: String::new(),
                user: Some(account.to_user(id)),
            },
            None => UserResult {
                success: false,
                message: format!("no such user: {}", req.username),
                user: None,
            },
        })
    }

    async fn relay(&mut self, req: SendMessageTo) -> Result<()> {
        let SendMessageTo { mut message } = req;
        let id = message.id;
        let to = message.to.clone();
        let result = |success: bool, text: &str| SendMessageResult {
            success,
            message: text.to_string(),
            id,
            to: to.clone(),
        };

        let Some(from) = self.user.clone() else {
            return self.reply(ServerPacket::SendMessageResult(result(false, "log in first"))).await;
        };
        if AccountStore::new(&self.ctx.store).get(&to)?.is_none() {
            return self.reply(ServerPacket::SendMessageResult(result(false, "no such user"))).await;
        }
        let Some(recipient) = self.ctx.registry.sender_for(&to) else {
            tracing::debug!(target: "dc_core", from = %from, to = %to, id, "recipient offline");
            return self.reply(ServerPacket::SendMessageResult(result(false, "recipient is offline"))).await;
        };

        let accounts = AccountStore::new(&self.ctx.store);
        let cost = self.ctx.msg_cost;
        let mut remaining = match accounts.charge(&from, cost)? {
            Charge::Charged { remaining } => remaining,
            Charge::Insufficient { available } => {
                tracing::info!(target: "dc_core", from = %from, available, cost, "insufficient blocks");
                return self.reply(ServerPacket::SendMessageResult(result(false, "insufficient blocks"))).await;
            }
        };

        message.from = from.clone();
        message.status = MessageStatus::Sent;
        message.sender_copy = None;
        let frame = ServerPacket::IncomingMessage(IncomingMessage { message, from: from.clone() }).to_frame()?;
        let delivered = recipient.try_send(frame).is_ok();
        if !delivered {
            remaining = accounts.credit(&from, cost)?;
            tracing::warn!(target: "dc_core", from = %from, to = %to, id, "recipient queue unavailable, charge refunded");
        } else {
            tracing::debug!(target: "dc_core", from = %from, to = %to, id, "message relayed");
        }

        let text = if delivered { "delivered" } else { "recipient is unavailable" };
        self.reply(ServerPacket::SendMessageResult(result(delivered, text))).await?;
        self.reply(ServerPacket::BlockAllowanceUpdate(BlockAllowanceUpdate { blocks: remaining })).await
    }

    /// Release the username this connection holds, if any.
    pub fn close(&mut self) {
        if let Some(user) = self.user.take() {
            self.ctx.registry.release(&user, self.conn_id);
            tracing::info!(target: "dc_core", event = "logged_out", username = %user, conn = self.conn_id);
        }
    }
}

/// Serve one established (already TLS-wrapped) connection to completion.
pub async fn serve_connection<S>(ctx: Arc<ServerContext>, stream: S, timeouts: &TimeoutConfig, peer: String)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut conn = spawn_io(stream, timeouts);
    let mut router = ServerRouter::new(ctx, conn.outbound.clone());
    tracing::debug!(target: "dc_core", conn = router.conn_id, peer = %peer, "connection opened");

    let reason = loop {
        match conn.inbound.recv().await {
            None => break CourierError::Closed,
            Some(Err(e)) => break e,
            Some(Ok(frame)) => {
                if let Err(e) = router.handle_frame(frame).await {
                    if e.is_connection_fatal() {
                        break e;
                    }
                    tracing::error!(target: "dc_core", conn = router.conn_id, error = %e, "request failed");
                }
            }
        }
    };

    router.close();
    conn.close();
    tracing::debug!(target: "dc_core", conn = router.conn_id, peer = %peer, reason = %reason, "connection closed");
}

pub struct CourierServer {
    ctx: Arc<ServerContext>,
    acceptor: TlsAcceptor,
    timeouts: TimeoutConfig,
}

impl CourierServer {
    pub fn new(ctx: Arc<ServerContext>, acceptor: TlsAcceptor, timeouts: TimeoutConfig) -> Self {
        Self { ctx, acceptor, timeouts }
    }

    /// Accept connections until the listener fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!(target: "dc_core", addr = %listener.local_addr()?, "listening");
        loop {
            let (tcp, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(target: "dc_core", error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let server = Arc::clone(&self);
            tokio::spawn(async move { server.handle_tcp(tcp, addr).await });
        }
    }

    async fn handle_tcp(&self, tcp: tokio::net::TcpStream, addr: SocketAddr) {
        let _ = tcp.set_nodelay(true);
        let tls = match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(tcp)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                tracing::warn!(target: "dc_core", peer = %addr, error = %e, "TLS handshake failed");
                return;
            }
            Err(_) => {
                tracing::warn!(target: "dc_core", peer = %addr, "TLS handshake timed out");
                return;
            }
        };
        serve_connection(Arc::clone(&self.ctx), tls, &self.timeouts, addr.to_string()).await;
    }
}

#[cfg(test)]
mod tests {
    use dc_crypto::{PasswordMaterial, PrivateKey};
    use dc_proto::{records::Ping, Message};

    use super::*;
    use crate::keyfile::MemoryKeyFileStore;

    fn context(msg_cost: u64, initial_blocks: u64) -> Arc<ServerContext> {
        let config = ServerConfig { msg_cost, initial_blocks, ..Default::default() };
        Arc::new(ServerContext::new(
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(MemoryKeyFileStore::new()),
            &config,
        ))
    }

    fn router(ctx: &Arc<ServerContext>) -> (ServerRouter, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(16);
        (ServerRouter::new(Arc::clone(ctx), tx), rx)
    }

    fn next(rx: &mut mpsc::Receiver<Frame>) -> ServerPacket {
        ServerPacket::from_frame(&rx.try_recv().unwrap()).unwrap()
    }

    fn register_request(username: &str, password: &str) -> RegisterRequest {
        let material = PasswordMaterial::derive(password);
        let key = PrivateKey::generate();
        RegisterRequest {
            username: username.into(),
            server_proof: material.server_proof.to_hex(),
            encrypted_private_key: STANDARD.encode(key.protect(&material.local_key).unwrap()),
            armored_public_key: key.public_key().to_armored(),
        }
    }

    fn login_request(username: &str, password: &str) -> LoginRequest {
        LoginRequest {
            username: username.into(),
            server_proof: PasswordMaterial::derive(password).server_proof.to_hex(),
            version: PROTOCOL_VERSION.into(),
        }
    }

    async fn signed_up(ctx: &Arc<ServerContext>, username: &str) -> (ServerRouter, mpsc::Receiver<Frame>) {
        let (mut r, mut rx) = router(ctx);
        assert!(r.register(register_request(username, "pw")).await.unwrap().success);
        assert!(r.login(login_request(username, "pw")).unwrap().success);
        while rx.try_recv().is_ok() {}
        (r, rx)
    }

    fn to(recipient: &str, id: u64) -> SendMessageTo {
        let mut message = Message::new("spoofed", recipient, vec![1, 2, 3]);
        message.id = id;
        SendMessageTo { message }
    }

    #[tokio::test]
    async fn register_stores_proof_and_key_backup() {
        let ctx = context(1, 100);
        let (mut r, _rx) = router(&ctx);
        assert!(r.register(register_request("alice", "pw1")).await.unwrap().success);

        let (_, account) = AccountStore::new(&ctx.store).get("alice").unwrap().unwrap();
        assert_eq!(account.password_proof, PasswordMaterial::derive("pw1").server_proof.to_hex());
        assert_eq!(account.blocks, 100);
        assert!(ctx.keys.load_file("alice").await.is_ok());

        let again = r.register(register_request("alice", "pw2")).await.unwrap();
        assert!(!again.success);
    }

    struct UnwritableKeys;

    #[async_trait::async_trait]
    impl KeyFileStore for UnwritableKeys {
        async fn load_file(&self, name: &str) -> Result<Vec<u8>> {
            Err(CourierError::KeyFile(format!("no key file for {name}")))
        }

        async fn write_file(&self, _bytes: &[u8], _name: &str) -> Result<()> {
            Err(CourierError::KeyFile("disk full".into()))
        }
    }

    #[tokio::test]
    async fn failed_key_backup_refuses_and_rolls_back_the_account() {
        let config = ServerConfig { msg_cost: 1, initial_blocks: 100, ..Default::default() };
        let ctx = Arc::new(ServerContext::new(
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(UnwritableKeys),
            &config,
        ));
        let (mut r, _rx) = router(&ctx);

        let result = r.register(register_request("alice", "pw1")).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.message, "could not store key backup");
        assert!(AccountStore::new(&ctx.store).get("alice").unwrap().is_none());
        assert!(!r.login(login_request("alice", "pw1")).unwrap().success);
    }

    #[tokio::test]
    async fn login_checks_proof_and_version() {
        let ctx = context(1, 100);
        let (mut r, _rx) = router(&ctx);
        r.register(register_request("alice", "pw1")).await.unwrap();

        assert!(!r.login(login_request("alice", "pw2")).unwrap().success);
        let mut old = login_request("alice", "pw1");
        old.version = "0".into();
        assert!(!r.login(old).unwrap().success);

        let ok = r.login(login_request("alice", "pw1")).unwrap();
        assert!(ok.success);
        assert_eq!((ok.block_allowance, ok.msg_cost), (100, 1));
        assert!(ctx.registry.is_online("alice"));
    }

    #[tokio::test]
    async fn second_login_for_the_same_user_is_refused() {
        let ctx = context(1, 100);
        let (_first, _rx1) = signed_up(&ctx, "alice").await;
        let (mut second, _rx2) = router(&ctx);
        assert!(!second.login(login_request("alice", "pw")).unwrap().success);
    }

    #[tokio::test]
    async fn close_releases_only_the_owner() {
        let ctx = context(1, 100);
        let (mut alice, _rx) = signed_up(&ctx, "alice").await;
        let (mut other, _rx2) = router(&ctx);
        other.close();
        assert!(ctx.registry.is_online("alice"));
        alice.close();
        assert!(!ctx.registry.is_online("alice"));
    }

    #[tokio::test]
    async fn lookup_requires_login() {
        let ctx = context(1, 100);
        let (_alice, _rx) = signed_up(&ctx, "alice").await;
        let (anon, _rx2) = router(&ctx);
        assert!(!anon.lookup(LookupUser { username: "alice".into() }).unwrap().success);
    }

    #[tokio::test]
    async fn relay_charges_and_forwards_with_the_real_sender() {
        let ctx = context(2, 5);
        let (mut alice, mut alice_rx) = signed_up(&ctx, "alice").await;
        let (_bob, mut bob_rx) = signed_up(&ctx, "bob").await;

        alice.relay(to("bob", 7)).await.unwrap();
        match next(&mut bob_rx) {
            ServerPacket::IncomingMessage(m) => {
                assert_eq!(m.from, "alice");
                assert_eq!(m.message.from, "alice");
                assert_eq!(m.message.body, vec![1, 2, 3]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            next(&mut alice_rx),
            ServerPacket::SendMessageResult(SendMessageResult {
                success: true,
                message: "delivered".into(),
                id: 7,
                to: "bob".into()
            })
        );
        assert_eq!(next(&mut alice_rx), ServerPacket::BlockAllowanceUpdate(BlockAllowanceUpdate { blocks: 3 }));
    }

    #[tokio::test]
    async fn offline_recipient_fails_without_charge() {
        let ctx = context(1, 5);
        let (mut alice, mut alice_rx) = signed_up(&ctx, "alice").await;
        let (mut bob, _bob_rx) = signed_up(&ctx, "bob").await;
        bob.close();

        alice.relay(to("bob", 1)).await.unwrap();
        match next(&mut alice_rx) {
            ServerPacket::SendMessageResult(r) => assert!(!r.success && r.id == 1),
            other => panic!("unexpected {other:?}"),
        }
        let (_, account) = AccountStore::new(&ctx.store).get("alice").unwrap().unwrap();
        assert_eq!(account.blocks, 5);
    }

    #[tokio::test]
    async fn insufficient_blocks_refuse_the_send() {
        let ctx = context(3, 2);
        let (mut alice, mut alice_rx) = signed_up(&ctx, "alice").await;
        let (_bob, mut bob_rx) = signed_up(&ctx, "bob").await;

        alice.relay(to("bob", 1)).await.unwrap();
        assert!(matches!(next(&mut alice_rx), ServerPacket::SendMessageResult(r) if !r.success));
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_recipient_queue_refunds_the_charge() {
        let ctx = context(1, 5);
        let (mut alice, mut alice_rx) = signed_up(&ctx, "alice").await;
        let (full_tx, _full_rx) = mpsc::channel(1);
        full_tx.try_send(Frame::new(0, Vec::new())).unwrap();
        assert!(ctx.registry.claim("carol", 999, full_tx));
        AccountStore::new(&ctx.store)
            .create(&Account {
                username: "carol".into(),
                public_key: PrivateKey::generate().public_key().to_armored(),
                password_proof: String::new(),
                key_file: "carol".into(),
                blocks: 0,
                created_at: Utc::now(),
            })
            .unwrap();

        alice.relay(to("carol", 4)).await.unwrap();
        assert!(matches!(next(&mut alice_rx), ServerPacket::SendMessageResult(r) if !r.success));
        assert_eq!(next(&mut alice_rx), ServerPacket::BlockAllowanceUpdate(BlockAllowanceUpdate { blocks: 5 }));
    }

    #[tokio::test]
    async fn unknown_opcode_keeps_the_connection() {
        let ctx = context(1, 5);
        let (mut r, mut rx) = router(&ctx);
        r.handle_frame(Frame::new(0x42, b"{}".to_vec())).await.unwrap();
        r.handle_frame(ClientPacket::Ping(Ping { nonce: 9 }).to_frame().unwrap()).await.unwrap();
        assert_eq!(next(&mut rx), ServerPacket::Pong(Pong { nonce: 9 }));
    }
}
