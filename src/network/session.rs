//! Session Registry
//!
//! One [`Session`] per admitted client, kept in a [`SessionRegistry`] that is
//! owned and mutated exclusively by the event loop. Ids are handed out in
//! increasing order, so the `BTreeMap` iterates in join order.
//!
//! Each session's TCP stream is represented by a [`SessionLink`]: a bounded
//! channel feeding the connection's writer task, plus the abort handle of its
//! reader task. Sends never block the loop; a full or closed channel is a
//! [`TransportError`] and the caller evicts the session.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::AbortHandle;

use crate::network::protocol::{Color, GhostState, Handshake, PeerInfo, SessionId};

/// Failure to hand a message to a session's TCP writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The writer task is gone (connection closed or failed).
    #[error("connection closed")]
    Closed,
    /// The peer stopped draining its stream and the outbound queue is full.
    #[error("outbound queue full")]
    Backlogged,
}

/// Owned handle to a session's TCP stream.
#[derive(Debug)]
pub struct SessionLink {
    outbound: mpsc::Sender<Vec<u8>>,
    reader: Option<AbortHandle>,
    writer: Option<AbortHandle>,
}

impl SessionLink {
    /// Wrap a writer-task channel and the abort handles of the connection's
    /// reader and writer tasks.
    pub fn new(
        outbound: mpsc::Sender<Vec<u8>>,
        reader: Option<AbortHandle>,
        writer: Option<AbortHandle>,
    ) -> Self {
        Self {
            outbound,
            reader,
            writer,
        }
    }

    /// A link not backed by a socket. The receiver yields every payload
    /// sent through the link.
    pub fn detached(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx, None, None), rx)
    }

    /// Queue a payload for the writer task.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.outbound.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Backlogged,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Close the link. Stops the reader; the writer flushes what is queued
    /// and then shuts the stream down once the last sender is dropped. Each
    /// write is bounded by the writer's own deadline.
    pub fn close(self) {
        if let Some(reader) = self.reader {
            reader.abort();
        }
    }

    /// Tear the link down without flushing. Used for links that already
    /// failed, where queued frames would never drain.
    pub fn abort(self) {
        if let Some(reader) = self.reader {
            reader.abort();
        }
        if let Some(writer) = self.writer {
            writer.abort();
        }
    }
}

/// Server-side record of one connected client.
#[derive(Debug)]
pub struct Session {
    /// Unique id, never reused during a server run.
    pub id: SessionId,
    /// Peer address. Fixed for the session's lifetime.
    pub remote_ip: IpAddr,
    /// Last UDP port seen from this peer (initially the announced one).
    pub udp_port: u16,
    /// Display name.
    pub name: String,
    /// Latest ghost state.
    pub ghost: GhostState,
    /// Model name.
    pub model: String,
    /// Current level.
    pub level: String,
    /// Ghost color.
    pub color: Color,
    /// Session opted out of UDP.
    pub reliable_only: bool,
    /// Observer flag.
    pub spectator: bool,
    /// Token of the outstanding heartbeat challenge.
    pub heartbeat_token: u32,
    /// Current challenge has been answered.
    pub heartbeat_echoed: bool,
    /// Previous challenge went unanswered.
    pub missed_last_heartbeat: bool,
    link: SessionLink,
}

impl Session {
    /// Build a session from an accepted handshake.
    ///
    /// The heartbeat state starts as "echoed" so the first challenge is sent
    /// on the next beat rather than counted as missed.
    pub fn new(id: SessionId, remote_ip: IpAddr, handshake: Handshake, link: SessionLink) -> Self {
        Self {
            id,
            remote_ip,
            udp_port: handshake.udp_port,
            name: handshake.name,
            ghost: handshake.ghost,
            model: handshake.model,
            level: handshake.level,
            color: handshake.color,
            reliable_only: handshake.reliable_only,
            spectator: handshake.spectator,
            heartbeat_token: 0,
            heartbeat_echoed: true,
            missed_last_heartbeat: false,
            link,
        }
    }

    /// Queue a payload on this session's TCP stream.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.link.send(payload)
    }

    /// Whether periodic updates and keep-alives go over UDP.
    pub fn uses_datagrams(&self) -> bool {
        !self.reliable_only && self.udp_port != 0
    }

    /// "player" or "spectator".
    pub fn kind(&self) -> &'static str {
        if self.spectator {
            "spectator"
        } else {
            "player"
        }
    }

    /// Roster / connect-broadcast entry.
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            name: self.name.clone(),
            ghost: self.ghost,
            model: self.model.clone(),
            level: self.level.clone(),
            color: self.color,
            spectator: self.spectator,
        }
    }

    /// Read-only snapshot for front ends.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            name: self.name.clone(),
            ip: self.remote_ip,
            udp_port: self.udp_port,
            level: self.level.clone(),
            model: self.model.clone(),
            spectator: self.spectator,
            reliable_only: self.reliable_only,
        }
    }

    /// Consume the session and close its stream.
    pub fn close(self) {
        self.link.close();
    }

    /// Consume the session and drop its stream without flushing.
    pub fn abort(self) {
        self.link.abort();
    }
}

/// Snapshot of a session, safe to hand to another thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    /// Session id.
    pub id: SessionId,
    /// Display name.
    pub name: String,
    /// Peer address.
    pub ip: IpAddr,
    /// Last UDP port.
    pub udp_port: u16,
    /// Current level.
    pub level: String,
    /// Model name.
    pub model: String,
    /// Observer flag.
    pub spectator: bool,
    /// Opted out of UDP.
    pub reliable_only: bool,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<3} {} @ {}:{}", self.id, self.name, self.ip, self.udp_port)
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// All connected sessions, in join order.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, Session>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session.
    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    /// Remove a session, returning it so the caller can close it.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    /// Look up a session.
    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Look up a session mutably.
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Whether any session is connected from this address.
    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        self.sessions.values().any(|s| s.remote_ip == ip)
    }

    /// Ids of every session, in join order. Scans that may evict iterate
    /// over this snapshot rather than the map itself.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Iterate sessions in join order.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Ids of sessions with exactly this name.
    pub fn find_by_name(&self, name: &str) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.name == name)
            .map(|s| s.id)
            .collect()
    }

    /// Ids of sessions connected from this address.
    pub fn find_by_ip(&self, ip: IpAddr) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.remote_ip == ip)
            .map(|s| s.id)
            .collect()
    }

    /// Roster entries for every session.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.sessions.values().map(Session::peer_info).collect()
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is connected.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
