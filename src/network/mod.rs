//! Network Layer
//!
//! Session engine for ghost synchronization over TCP and UDP.
//! All engine state lives in [`GhostServer`] on the event loop thread;
//! everything else talks to it through [`ServerHandle`].

pub mod admission;
pub mod command;
pub mod countdown;
pub mod dispatch;
pub mod event_loop;
pub mod events;
pub mod framing;
pub mod heartbeat;
pub mod protocol;
pub mod server;
pub mod session;

pub use admission::{
    parse_ip, AddressParseError, AdmissionError, Category, WhitelistEntry, WhitelistKind,
};
pub use command::{Command, CommandQueue};
pub use countdown::{validate_duration, CountdownError};
pub use dispatch::DispatchError;
pub use event_loop::{start_server, HandshakeError, ServerHandle};
pub use events::ServerEvent;
pub use protocol::{ClientMessage, Handshake, ProtocolError, ServerMessage, SessionId};
pub use server::{GhostServer, ServerConfig, ServerError};
pub use session::{SessionSummary, TransportError};
