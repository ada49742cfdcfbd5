//! Daemon: one long-lived server per project, and its clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           checkd server                 │
//! │  - analysis state in memory             │
//! │  - watcher (incremental rechecks)       │
//! │  - saved state (snapshot / restore)     │
//! └─────────────────────────────────────────┘
//!           ▲
//!           │ .checkd/server.sock (length-prefixed JSON)
//!           ▼
//! ┌─────────────────────────────────────────┐
//! │           checkd CLI / clients          │
//! │  - one-shot requests                    │
//! │  - persistent diagnostic subscribers    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Processes rendezvous through the files in [`paths`]: the lock file
//! guarantees a single server per project, the socket carries the
//! [`protocol`].

pub mod client;
pub mod lock;
pub mod paths;
pub mod protocol;
pub mod registry;
pub mod saved_state;
pub mod server;

pub use client::{connect, DaemonClient};
pub use protocol::{Request, Response, ServerStatus};
pub use registry::{ClientId, ConnectionHandle, ConnectionState};
pub use server::{run, Server};
