//! Cross-Thread Command Queue
//!
//! The only way for code outside the event loop to touch engine state.
//! Any thread may submit a [`Command`]; the loop takes the whole queue
//! between ticks and runs each command exactly once, in submission order.

use std::sync::{Arc, Mutex, PoisonError};

use crate::network::server::GhostServer;

/// Deferred mutation of engine state, run on the event loop thread.
pub type Command = Box<dyn FnOnce(&mut GhostServer) + Send + 'static>;

#[derive(Default)]
struct Pending {
    commands: Vec<Command>,
    closed: bool,
}

/// Mutex-protected list of pending commands. Cloning shares the queue.
#[derive(Clone, Default)]
pub struct CommandQueue {
    pending: Arc<Mutex<Pending>>,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("pending", &self.len())
            .finish()
    }
}

impl CommandQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command. Returns false, dropping the command, once the
    /// queue has been closed.
    pub fn submit(&self, command: Command) -> bool {
        let mut pending = self.lock();
        if pending.closed {
            return false;
        }
        pending.commands.push(command);
        true
    }

    /// Remove and return every pending command, oldest first.
    pub fn take_all(&self) -> Vec<Command> {
        std::mem::take(&mut self.lock().commands)
    }

    /// Refuse further commands and drop the ones still pending.
    pub fn close(&self) {
        let dropped = {
            let mut pending = self.lock();
            pending.closed = true;
            std::mem::take(&mut pending.commands)
        };
        drop(dropped);
    }

    /// Run every pending command against `server`. Commands submitted while
    /// this runs wait for the next drain.
    pub fn run_pending(&self, server: &mut GhostServer) -> usize {
        let commands = self.take_all();
        let count = commands.len();
        for command in commands {
            command(server);
        }
        count
    }

    /// Number of pending commands.
    pub fn len(&self) -> usize {
        self.lock().commands.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Pushes and takes cannot leave the list half-updated, so a poisoned
    // lock is still usable.
    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::server::ServerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_commands_run_once_in_order() {
        let queue = CommandQueue::new();
        let (mut server, _udp) = GhostServer::detached(ServerConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let log = log.clone();
            queue.submit(Box::new(move |_server: &mut GhostServer| {
                log.lock().unwrap().push(i);
            }));
        }
        assert_eq!(queue.len(), 5);

        assert_eq!(queue.run_pending(&mut server), 5);
        assert_eq!(queue.run_pending(&mut server), 0);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_commands_mutate_engine() {
        let queue = CommandQueue::new();
        let (mut server, _udp) = GhostServer::detached(ServerConfig::default());
        let ip = "10.1.2.3".parse().unwrap();
        queue.submit(Box::new(move |server: &mut GhostServer| {
            server.ban(ip);
        }));
        queue.run_pending(&mut server);
        assert_eq!(server.bans(), vec![ip]);
    }

    #[test]
    fn test_closed_queue_rejects_and_drops() {
        let queue = CommandQueue::new();
        let marker = Arc::new(());
        let held = marker.clone();
        assert!(queue.submit(Box::new(move |_: &mut GhostServer| drop(held))));
        assert_eq!(Arc::strong_count(&marker), 2);

        queue.close();
        assert_eq!(Arc::strong_count(&marker), 1);
        assert!(!queue.submit(Box::new(|_: &mut GhostServer| {})));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_submit_from_many_threads() {
        let queue = CommandQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = queue.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let counter = counter.clone();
                        queue.submit(Box::new(move |_: &mut GhostServer| {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let (mut server, _udp) = GhostServer::detached(ServerConfig::default());
        assert_eq!(queue.run_pending(&mut server), 800);
        assert_eq!(counter.load(Ordering::SeqCst), 800);
    }
}
