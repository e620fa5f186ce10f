//! Message Dispatcher
//!
//! Routes one decoded client message, from either transport, to its effect
//! on engine state. Relayed messages are forwarded as the exact bytes the
//! sender produced.

use std::net::IpAddr;

#[cfg(feature = "debug-tracing")]
use tracing::trace;

use crate::network::protocol::{
    ClientMessage, CountdownPhase, ProtocolError, ServerMessage, SessionId, SERVER_ID,
};
use crate::network::server::GhostServer;

/// Reasons an inbound packet is dropped. None of them evict the sender.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Packet could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Claimed sender id has no session.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// Claimed sender id belongs to a session at another address.
    #[error("session {claimed} does not belong to {from}")]
    Impersonation {
        /// Sender id found in the packet.
        claimed: SessionId,
        /// Address the packet actually came from.
        from: IpAddr,
    },
}

/// What remains to do once the sender's own state has been updated.
enum Followup {
    Done,
    Reply(Vec<u8>),
    Forward,
    Leave,
}

impl GhostServer {
    /// Handle one inbound message.
    ///
    /// `udp_port` is the source port when the packet arrived by datagram and
    /// `None` for TCP. A datagram from a session's address refreshes the
    /// port ghost updates are sent to.
    pub fn dispatch(
        &mut self,
        bytes: &[u8],
        from_ip: IpAddr,
        udp_port: Option<u16>,
    ) -> Result<(), DispatchError> {
        let message = ClientMessage::decode(bytes)?;
        let id = message.sender();

        #[cfg(feature = "debug-tracing")]
        trace!(
            session = id,
            tag = ?message.tag(),
            len = bytes.len(),
            udp = udp_port.is_some(),
            "inbound packet"
        );

        let session = self
            .sessions
            .get_mut(id)
            .ok_or(DispatchError::UnknownSession(id))?;
        if session.remote_ip != from_ip {
            return Err(DispatchError::Impersonation {
                claimed: id,
                from: from_ip,
            });
        }
        if let Some(port) = udp_port {
            session.udp_port = port;
        }

        let followup = match message {
            ClientMessage::None { .. } | ClientMessage::StopServer { .. } => Followup::Done,
            ClientMessage::Ping { .. } => Followup::Reply(ServerMessage::Pong.encode()),
            ClientMessage::Disconnect { .. } => Followup::Leave,
            ClientMessage::MapChange { level, .. } => {
                self.events.emit(format!("{} is now on {}", session.name, level));
                session.level = level;
                Followup::Forward
            }
            ClientMessage::HeartBeat { token, .. } => {
                if token == session.heartbeat_token {
                    session.heartbeat_echoed = true;
                }
                Followup::Done
            }
            ClientMessage::Message { text, .. } => {
                self.events.emit(format!("[message] {}: {}", session.name, text));
                Followup::Forward
            }
            ClientMessage::Countdown { .. } => Followup::Reply(
                ServerMessage::Countdown {
                    id: SERVER_ID,
                    phase: CountdownPhase::Acknowledge,
                }
                .encode(),
            ),
            ClientMessage::Update { ghost, .. } => {
                session.ghost = ghost;
                Followup::Done
            }
            ClientMessage::SpeedrunFinish { .. } => Followup::Forward,
            ClientMessage::ModelChange { model, .. } => {
                session.model = model;
                Followup::Forward
            }
            ClientMessage::ColorChange { color, .. } => {
                session.color = color;
                Followup::Forward
            }
        };

        match followup {
            Followup::Done => {}
            Followup::Reply(payload) => self.send_to(id, payload),
            Followup::Forward => self.fan_out(Some(id), bytes),
            Followup::Leave => {
                self.disconnect(id, "requested");
            }
        }
        self.reap_dead();
        Ok(())
    }
}
