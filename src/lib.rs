//! # Ghost Server
//!
//! Real-time session server that relays "ghost" state (position, view
//! angles, cosmetics) between game clients and coordinates group countdowns
//! before timed runs.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       GHOST SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/            - Shared primitives                       │
//! │  └── rng.rs       - Xorshift128+ heartbeat tokens           │
//! │                                                             │
//! │  network/         - Session engine                          │
//! │  ├── protocol.rs  - Binary wire messages                    │
//! │  ├── framing.rs   - TCP length-prefix framing               │
//! │  ├── session.rs   - Session records and registry            │
//! │  ├── admission.rs - Bans, whitelist, accepting flags        │
//! │  ├── server.rs    - Engine state, config, operator surface  │
//! │  ├── dispatch.rs  - Per-message handling                    │
//! │  ├── heartbeat.rs - Liveness challenges, UDP keep-alive     │
//! │  ├── countdown.rs - Group countdown                         │
//! │  ├── command.rs   - Cross-thread command queue              │
//! │  ├── events.rs    - Operator event stream                   │
//! │  └── event_loop.rs- Loop thread and connection tasks        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Threading
//!
//! The engine is single-writer: only the loop thread touches
//! [`GhostServer`](network::GhostServer). Other threads submit closures with
//! [`ServerHandle::schedule`](network::ServerHandle::schedule) or
//! [`ServerHandle::request`](network::ServerHandle::request); they run
//! between ticks in submission order.
//!
//! ```no_run
//! use ghost_server::network::{start_server, ServerConfig};
//!
//! # async fn run() -> Result<(), ghost_server::network::ServerError> {
//! let handle = start_server(ServerConfig::default())?;
//! let online = handle.request(|server| server.sessions()).await?;
//! println!("{} connected", online.len());
//! handle.stop();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod network;

// Re-export commonly used types
pub use network::{start_server, GhostServer, ServerConfig, ServerError, ServerEvent, ServerHandle};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default TCP/UDP port.
pub const DEFAULT_PORT: u16 = 53000;
