//! dc_core - Darklock Courier sessions, routing and delivery
//!
//! # Module layout
//! - `transport` - reader/writer tasks around any async stream
//! - `session`   - per-connection client session state
//! - `client`    - client command router, handle and runtime
//! - `delivery`  - outbound send, acks, incoming messages, failed retry
//! - `identity`  - registration and login key handling
//! - `keyfile`   - where encrypted private keys are kept
//! - `server`    - relay server: registry, per-connection router, accept loop
//! - `tls`       - rustls acceptor/connector setup
//! - `events`    - client events, notifier seam, redraw coalescing
//! - `config`    - client and server configuration
//! - `paths`     - platform data directories
//! - `error`     - error taxonomy and `DomainError`

pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod identity;
pub mod keyfile;
pub mod paths;
pub mod server;
pub mod session;
pub mod tls;
pub mod transport;

pub use client::{spawn_client, ClientContext, ClientHandle, ClientRouter, ClientRuntime, Command};
pub use config::{ClientConfig, ServerConfig, TimeoutConfig};
pub use delivery::ThreadEntry;
pub use error::{CourierError, DomainError, Result, SuggestedAction};
pub use events::{dispatch, ClientEvent, Notifier, Page, RefreshCoalescer};
pub use keyfile::{DirKeyFileStore, KeyFileStore, MemoryKeyFileStore};
pub use server::{serve_connection, CourierServer, Registry, ServerContext, ServerRouter};
pub use session::{Session, SessionSnapshot, SessionState};
