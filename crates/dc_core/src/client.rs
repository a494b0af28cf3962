//! Client command router.
//!
//! One [`ClientRouter`] per connection. It owns the [`Session`] and handles
//! two inputs strictly one at a time: commands from the application and
//! frames from the server. Results reach the application as
//! [`ClientEvent`]s; only snapshot and thread reads answer directly.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use dc_crypto::PublicKey;
use dc_proto::{
    records::{BlockAllowanceUpdate, LoginResult, LookupUser, Ping, RegisterResult, UserResult},
    validate_username, ClientPacket, Frame, ServerPacket,
};
use dc_store::{CacheOutcome, Store, StoreError, UserStore};

use crate::config::TimeoutConfig;
use crate::delivery::ThreadEntry;
use crate::error::{CourierError, DomainError, Result, SuggestedAction};
use crate::events::{ClientEvent, Page, RefreshCoalescer};
use crate::identity;
use crate::keyfile::KeyFileStore;
use crate::session::{Password, PendingLogin, PendingRegister, Session, SessionSnapshot};
use crate::transport::{spawn_io, Connection};

const COMMAND_CAPACITY: usize = 32;

pub enum Command {
    Register { username: String, password: Password },
    Login { username: String, password: Password },
    LookupUser { username: String },
    SendMessage { to: String, text: String },
    SelectPeer { peer: Option<String> },
    ReadThread {
        peer: String,
        reply: oneshot::Sender<std::result::Result<Vec<ThreadEntry>, DomainError>>,
    },
    Snapshot { reply: oneshot::Sender<SessionSnapshot> },
    Disconnect,
}

/// Everything a router needs besides its connection.
#[derive(Clone)]
pub struct ClientContext {
    pub store: Arc<Store>,
    pub keyfiles: Arc<dyn KeyFileStore>,
    pub events: mpsc::UnboundedSender<ClientEvent>,
    pub refresh: Arc<RefreshCoalescer>,
}

impl ClientContext {
    pub fn new(
        store: Arc<Store>,
        keyfiles: Arc<dyn KeyFileStore>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let ctx = Self {
            store,
            keyfiles,
            events,
            refresh: Arc::new(RefreshCoalescer::new()),
        };
        (ctx, rx)
    }
}

pub struct ClientRouter {
    pub(crate) ctx: ClientContext,
    pub(crate) session: Session,
    outbound: mpsc::Sender<Frame>,
    ping_nonce: u64,
}

impl ClientRouter {
    pub fn new(ctx: ClientContext, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            ctx,
            session: Session::new(),
            outbound,
            ping_nonce: 0,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        // A dropped receiver only means nobody is listening.
        let _ = self.ctx.events.send(event);
    }

    pub(crate) fn request_redraw_if_selected(&self, peer: &str) {
        if self.session.selected_peer() == Some(peer) {
            self.ctx.refresh.request(peer);
        }
    }

    pub(crate) async fn send_packet(&self, packet: ClientPacket) -> Result<()> {
        let frame = packet.to_frame()?;
        self.outbound.send(frame).await.map_err(|_| CourierError::Closed)
    }

    pub(crate) fn require_user(&self) -> std::result::Result<String, DomainError> {
        match self.session.user() {
            Some(user) if self.session.is_authenticated() => Ok(user.to_string()),
            _ => Err(DomainError::return_to_login("log in first")),
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    /// Handle one application command. `Ok(false)` means stop.
    pub async fn handle_command(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::Register { username, password } => self.register(&username, &password).await?,
            Command::Login { username, password } => self.login(&username, &password).await?,
            Command::LookupUser { username } => {
                self.require_user()?;
                validate_username(&username)
                    .map_err(|m| DomainError::new(m, SuggestedAction::Continue))?;
                self.send_packet(ClientPacket::LookupUser(LookupUser { username })).await?;
            }
            Command::SendMessage { to, text } => self.send_message(&to, &text).await?,
            Command::SelectPeer { peer } => {
                if let Some(p) = &peer {
                    self.ctx.refresh.request(p);
                }
                self.session.select_peer(peer);
            }
            Command::ReadThread { peer, reply } => {
                let _ = reply.send(self.read_thread(&peer).map_err(DomainError::from));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.session.snapshot());
            }
            Command::Disconnect => return Ok(false),
        }
        Ok(true)
    }

    async fn register(&mut self, username: &str, password: &str) -> Result<()> {
        if self.session.is_authenticated() {
            return Err(DomainError::new("already logged in", SuggestedAction::Continue).into());
        }
        let registration = match identity::prepare_registration(username, password) {
            Ok(r) => r,
            Err(CourierError::Domain(reason)) => {
                self.emit(ClientEvent::RegisterFailed { reason });
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.session.pending_register = Some(PendingRegister {
            username: username.to_string(),
            key_file: registration.key_file,
        });
        self.send_packet(ClientPacket::Register(registration.request)).await
    }

    async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        if self.session.is_authenticated() {
            return Err(DomainError::new("already logged in", SuggestedAction::Continue).into());
        }
        let (request, local_key) = identity::prepare_login(username, password);
        self.session.pending_login = Some(PendingLogin {
            username: username.to_string(),
            local_key,
        });
        self.send_packet(ClientPacket::Login(request)).await
    }

    // ── Frames ───────────────────────────────────────────────────────────────

    /// Handle one frame from the server. Undecodable frames are logged and
    /// dropped.
    pub async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        let packet = match ServerPacket::from_frame(&frame) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(target: "dc_core", opcode = frame.opcode, error = %e, "dropping frame");
                return Ok(());
            }
        };
        tracing::trace!(target: "dc_core", opcode = %packet.opcode(), "frame received");
        match packet {
            ServerPacket::RegisterResult(r) => self.on_register_result(r).await,
            ServerPacket::LoginResult(r) => self.on_login_result(r).await?,
            ServerPacket::UserResult(r) => self.on_user_result(r)?,
            ServerPacket::SendMessageResult(r) => self.on_send_result(r)?,
            ServerPacket::IncomingMessage(m) => self.on_incoming(m)?,
            ServerPacket::BlockAllowanceUpdate(BlockAllowanceUpdate { blocks }) => {
                self.session.set_blocks(blocks);
                self.emit(ClientEvent::BlocksUpdated { blocks });
            }
            ServerPacket::Pong(p) => {
                tracing::trace!(target: "dc_core", nonce = p.nonce, "pong");
            }
        }
        Ok(())
    }

    async fn on_register_result(&mut self, r: RegisterResult) {
        let Some(pending) = self.session.pending_register.take() else {
            tracing::warn!(target: "dc_core", success = r.success, "register result without a pending registration");
            return;
        };
        if !r.success {
            tracing::info!(target: "dc_core", event = "register_failed", reason = %r.message);
            self.emit(ClientEvent::RegisterFailed { reason: DomainError::return_to_login(r.message) });
            return;
        }
        let username = pending.username;
        if let Err(e) = identity::store_key_file(self.ctx.keyfiles.as_ref(), &username, &pending.key_file).await {
            tracing::error!(target: "dc_core", username = %username, error = %e, "failed to write key file");
            self.emit(ClientEvent::RegisterFailed {
                reason: DomainError::new(
                    format!("account {username} was created but its key file could not be saved: {e}"),
                    SuggestedAction::Continue,
                ),
            });
            return;
        }
        tracing::info!(target: "dc_core", event = "registered", username = %username);
        self.emit(ClientEvent::Registered { username });
    }

    async fn on_login_result(&mut self, r: LoginResult) -> Result<()> {
        let pending = self.session.pending_login.take();
        if !r.success {
            tracing::info!(target: "dc_core", event = "login_failed", reason = %r.message);
            self.emit(ClientEvent::LoginFailed { reason: DomainError::return_to_login(r.message) });
            return Ok(());
        }
        let Some(pending) = pending else {
            tracing::warn!(target: "dc_core", "login result without a pending login");
            return Ok(());
        };
        let username = if r.username.is_empty() { pending.username.clone() } else { r.username };
        if !self.session.authenticate(username.clone(), r.block_allowance, r.msg_cost) {
            tracing::warn!(target: "dc_core", username = %username, "session already authenticated");
            return Ok(());
        }

        // The session stays authenticated even if the key cannot be loaded;
        // sending and reading then fail with their own errors.
        match identity::load_private_key(self.ctx.keyfiles.as_ref(), &pending.username, &pending.local_key).await {
            Ok(key) => {
                self.session.set_private_key(key);
            }
            Err(e) => self.emit(ClientEvent::Error(e)),
        }

        let failed = self.restore_failed_count()?;
        tracing::info!(target: "dc_core", event = "logged_in", username = %username, failed);
        self.emit(ClientEvent::LoggedIn {
            username,
            blocks: r.block_allowance,
            failed_messages: failed,
        });
        Ok(())
    }

    fn on_user_result(&mut self, r: UserResult) -> Result<()> {
        let user = match (r.success, r.user) {
            (true, Some(user)) => user,
            _ => {
                let message = if r.message.is_empty() { "user not found".to_string() } else { r.message };
                self.emit(ClientEvent::Error(DomainError::new(message, SuggestedAction::Continue)));
                return Ok(());
            }
        };
        if let Err(e) = validate_username(&user.username) {
            tracing::warn!(target: "dc_core", error = %e, "lookup returned an invalid username");
            return Ok(());
        }
        let key = match PublicKey::from_armored(&user.public_key) {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!(target: "dc_core", username = %user.username, error = %e, "lookup returned an invalid key");
                self.emit(ClientEvent::Error(DomainError::new(
                    format!("{} has an invalid public key", user.username),
                    SuggestedAction::Continue,
                )));
                return Ok(());
            }
        };

        match UserStore::new(&self.ctx.store).add(&user) {
            Ok(CacheOutcome::Added(_)) => {
                tracing::info!(target: "dc_core", event = "user_added", username = %user.username);
                self.emit(ClientEvent::UserAdded {
                    username: user.username,
                    fingerprint: key.fingerprint(),
                });
            }
            Ok(CacheOutcome::Unchanged(_)) => {
                tracing::debug!(target: "dc_core", username = %user.username, "user already cached");
            }
            Err(StoreError::KeyConflict { username }) => {
                tracing::warn!(target: "dc_core", username = %username, "public key changed; keeping cached key");
                self.emit(ClientEvent::Error(DomainError::new(
                    format!("the public key for {username} has changed; the cached key was kept"),
                    SuggestedAction::Continue,
                )));
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    // ── Run loop ─────────────────────────────────────────────────────────────

    fn absorb(&self, err: CourierError) -> Option<CourierError> {
        if err.is_connection_fatal() {
            return Some(err);
        }
        match err {
            CourierError::Domain(d) => {
                tracing::debug!(target: "dc_core", error = %d, "domain error");
                self.emit(ClientEvent::Error(d));
            }
            other => {
                tracing::warn!(target: "dc_core", error = %other, "command failed");
                self.emit(ClientEvent::Error(other.into()));
            }
        }
        None
    }

    async fn send_ping(&mut self) -> Result<()> {
        self.ping_nonce += 1;
        self.send_packet(ClientPacket::Ping(Ping { nonce: self.ping_nonce })).await
    }

    /// Drive the session until the connection fails or the application
    /// disconnects.
    pub async fn run(mut self, mut conn: Connection, mut commands: mpsc::Receiver<Command>, heartbeat: Duration) {
        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                item = conn.inbound.recv() => match item {
                    None => break CourierError::Closed,
                    Some(Err(e)) => break e,
                    Some(Ok(frame)) => {
                        if let Err(e) = self.handle_frame(frame).await {
                            if let Some(fatal) = self.absorb(e) {
                                break fatal;
                            }
                        }
                    }
                },
                cmd = commands.recv() => match cmd {
                    None => break CourierError::Closed,
                    Some(cmd) => match self.handle_command(cmd).await {
                        Ok(true) => {}
                        Ok(false) => break CourierError::Closed,
                        Err(e) => {
                            if let Some(fatal) = self.absorb(e) {
                                break fatal;
                            }
                        }
                    },
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.send_ping().await {
                        if let Some(fatal) = self.absorb(e) {
                            break fatal;
                        }
                    }
                }
            }
        };

        self.session.close();
        conn.close();
        tracing::info!(target: "dc_core", event = "disconnected", reason = %reason);
        self.emit(ClientEvent::Disconnected { reason: reason.to_string() });
        self.emit(ClientEvent::Navigate { page: Page::Login });
    }
}

/// Cloneable front for the router task.
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<Command>,
}

impl ClientHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).await.map_err(|_| CourierError::Closed)
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<()> {
        self.send(Command::Register {
            username: username.to_string(),
            password: Password::new(password.to_string()),
        })
        .await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        self.send(Command::Login {
            username: username.to_string(),
            password: Password::new(password.to_string()),
        })
        .await
    }

    pub async fn lookup_user(&self, username: &str) -> Result<()> {
        self.send(Command::LookupUser { username: username.to_string() }).await
    }

    pub async fn send_message(&self, to: &str, text: &str) -> Result<()> {
        self.send(Command::SendMessage { to: to.to_string(), text: text.to_string() }).await
    }

    pub async fn select_peer(&self, peer: Option<&str>) -> Result<()> {
        self.send(Command::SelectPeer { peer: peer.map(str::to_string) }).await
    }

    pub async fn read_thread(&self, peer: &str) -> Result<Vec<ThreadEntry>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ReadThread { peer: peer.to_string(), reply }).await?;
        Ok(rx.await.map_err(|_| CourierError::Closed)??)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| CourierError::Closed)
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect).await
    }
}

pub struct ClientRuntime {
    pub handle: ClientHandle,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
    pub refresh: Arc<RefreshCoalescer>,
    pub task: JoinHandle<()>,
}

/// Start a client session over an established stream.
pub fn spawn_client<S>(
    stream: S,
    store: Arc<Store>,
    keyfiles: Arc<dyn KeyFileStore>,
    timeouts: &TimeoutConfig,
) -> ClientRuntime
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let conn = spawn_io(stream, timeouts);
    let (ctx, events) = ClientContext::new(store, keyfiles);
    let refresh = Arc::clone(&ctx.refresh);
    let router = ClientRouter::new(ctx, conn.outbound.clone());
    let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
    let task = tokio::spawn(router.run(conn, rx, timeouts.heartbeat_interval()));
    ClientRuntime {
        handle: ClientHandle { tx },
        events,
        refresh,
        task,
    }
}

#[cfg(test)]
mod tests {
    use dc_store::Store;

    use super::*;
    use crate::keyfile::MemoryKeyFileStore;

    fn router() -> (ClientRouter, mpsc::UnboundedReceiver<ClientEvent>, mpsc::Receiver<Frame>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (ctx, events) = ClientContext::new(store, Arc::new(MemoryKeyFileStore::new()));
        let (tx, wire) = mpsc::channel(16);
        (ClientRouter::new(ctx, tx), events, wire)
    }

    fn register_result(success: bool, message: &str) -> Frame {
        ServerPacket::RegisterResult(RegisterResult { success, message: message.into() })
            .to_frame()
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_opcode_is_dropped_and_later_frames_still_apply() {
        let (mut router, mut events, _wire) = router();
        router.session.authenticate("alice".into(), 10, 1);

        router.handle_frame(Frame::new(0x7f, b"{}".to_vec())).await.unwrap();
        let update = ServerPacket::BlockAllowanceUpdate(BlockAllowanceUpdate { blocks: 4 });
        router.handle_frame(update.to_frame().unwrap()).await.unwrap();

        assert_eq!(router.session.blocks(), 4);
        assert!(matches!(events.try_recv().unwrap(), ClientEvent::BlocksUpdated { blocks: 4 }));
        assert!(router.session.is_authenticated());
    }

    #[tokio::test]
    async fn key_file_is_written_only_when_the_server_accepts() {
        let (mut router, mut events, _wire) = router();

        router.register("alice", "pw1").await.unwrap();
        assert!(router.ctx.keyfiles.load_file("alice").await.is_err());
        router.handle_frame(register_result(false, "username already taken")).await.unwrap();
        assert!(matches!(events.try_recv().unwrap(), ClientEvent::RegisterFailed { .. }));
        assert!(router.ctx.keyfiles.load_file("alice").await.is_err());

        router.register("alice", "pw1").await.unwrap();
        router.handle_frame(register_result(true, "registered")).await.unwrap();
        assert!(matches!(events.try_recv().unwrap(), ClientEvent::Registered { .. }));
        let (_, local_key) = identity::prepare_login("alice", "pw1");
        assert!(identity::load_private_key(router.ctx.keyfiles.as_ref(), "alice", &local_key).await.is_ok());
    }
}
