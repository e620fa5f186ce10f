//! Heartbeat Supervisor
//!
//! Every heartbeat interval each session is challenged over TCP with a fresh
//! random token and must echo it before the next-but-one beat. A session
//! that leaves two consecutive challenges unanswered is evicted.
//!
//! Separately, a token-0 heartbeat is sent by UDP every keep-alive interval
//! to keep NAT mappings open. Those are never answered or checked.

use tracing::debug;

use crate::network::protocol::{ServerMessage, SessionId};
use crate::network::server::{queue_datagram, GhostServer};

impl GhostServer {
    /// Run one heartbeat beat over every session.
    pub fn heartbeat_pass(&mut self) {
        let mut expired: Vec<SessionId> = Vec::new();
        let mut challenges = Vec::new();

        for id in self.sessions.ids() {
            let Some(session) = self.sessions.get_mut(id) else {
                continue;
            };
            if !session.heartbeat_echoed && session.missed_last_heartbeat {
                expired.push(id);
                continue;
            }
            let token = self.rng.next_token();
            session.missed_last_heartbeat = !session.heartbeat_echoed;
            session.heartbeat_echoed = false;
            session.heartbeat_token = token;
            challenges.push((id, ServerMessage::HeartBeat { id, token }.encode()));
        }

        for id in expired {
            debug!(session = id, "heartbeat timeout");
            self.disconnect(id, "missed two heartbeats");
        }
        for (id, payload) in challenges {
            self.send_to(id, payload);
        }
        self.reap_dead();
    }

    /// Send the UDP keep-alive to every session that accepts datagrams.
    pub fn send_keepalives(&self) {
        for session in self.sessions.iter().filter(|s| s.uses_datagrams()) {
            let payload = ServerMessage::HeartBeat {
                id: session.id,
                token: 0,
            }
            .encode();
            queue_datagram(&self.datagrams, session, payload);
        }
    }
}
