//! The delivery contract every transport implements, plus an in-process
//! bus used when several characters share one process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::CoordError;
use crate::protocol::Message;
use crate::types::{PeerId, Target};

/// Everything a transport hands to the registered handler.
#[derive(Clone, Debug)]
pub enum Inbound {
    Mail { from: PeerId, message: Message },
    Command { from: PeerId, command: String },
    PeerJoined(PeerId),
    PeerLeft(PeerId),
}

/// Fire-and-forget, at-most-once, unordered delivery between named
/// processes. A broadcast also reaches the sender.
pub trait Mailbox: Send + Sync {
    fn local_peer_id(&self) -> &PeerId;

    fn send(&self, target: &Target, message: Message) -> Result<(), CoordError>;

    /// Ask the process called `name` (case-insensitive) to execute
    /// `command` in its game client.
    fn relay_command(&self, name: &str, command: &str) -> Result<(), CoordError>;

    fn reachable_peers(&self) -> Vec<PeerId>;

    fn shutdown(&self);
}

pub struct LocalBus {
    endpoints: RwLock<HashMap<PeerId, mpsc::Sender<Inbound>>>,
    // lower-cased names whose inbound traffic is silently lost
    dropping: RwLock<HashSet<String>>,
    capacity: usize,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            endpoints: RwLock::new(HashMap::new()),
            dropping: RwLock::new(HashSet::new()),
            capacity: capacity.max(1),
        })
    }

    /// Claim `name` on the bus. Fails if the name (compared
    /// case-insensitively) is already taken.
    pub fn register(
        self: &Arc<Self>,
        name: &str,
    ) -> Result<(Arc<BusMailbox>, mpsc::Receiver<Inbound>), CoordError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoordError::TransportUnavailable(
                "cannot register an empty name".into(),
            ));
        }
        let local = PeerId::new(name);
        let (tx, rx) = mpsc::channel(self.capacity);

        let existing: Vec<(PeerId, mpsc::Sender<Inbound>)> = {
            let mut endpoints = self.endpoints.write();
            if endpoints.keys().any(|pid| pid.matches(name)) {
                return Err(CoordError::DuplicatePeerName(name.to_owned()));
            }
            let existing = endpoints
                .iter()
                .map(|(pid, tx)| (pid.clone(), tx.clone()))
                .collect();
            endpoints.insert(local.clone(), tx.clone());
            existing
        };

        for (pid, peer_tx) in &existing {
            Self::push(peer_tx, pid, Inbound::PeerJoined(local.clone()));
            Self::push(&tx, &local, Inbound::PeerJoined(pid.clone()));
        }

        tracing::info!(peer = %local, "registered on local bus");

        let mailbox = Arc::new(BusMailbox {
            bus: Arc::clone(self),
            local,
            closed: AtomicBool::new(false),
        });
        Ok((mailbox, rx))
    }

    /// Simulate a lossy link: while set, everything addressed to `name`
    /// is discarded.
    pub fn set_dropping(&self, name: &str, dropping: bool) {
        let key = name.to_ascii_lowercase();
        let mut set = self.dropping.write();
        if dropping {
            set.insert(key);
        } else {
            set.remove(&key);
        }
    }

    pub fn registered(&self) -> Vec<PeerId> {
        self.endpoints.read().keys().cloned().collect()
    }

    fn unregister(&self, local: &PeerId) {
        let remaining: Vec<(PeerId, mpsc::Sender<Inbound>)> = {
            let mut endpoints = self.endpoints.write();
            if endpoints.remove(local).is_none() {
                return;
            }
            endpoints
                .iter()
                .map(|(pid, tx)| (pid.clone(), tx.clone()))
                .collect()
        };
        for (pid, tx) in &remaining {
            Self::push(tx, pid, Inbound::PeerLeft(local.clone()));
        }
        tracing::info!(peer = %local, "left local bus");
    }

    fn find(&self, name: &str) -> Option<(PeerId, mpsc::Sender<Inbound>)> {
        self.endpoints
            .read()
            .iter()
            .find(|(pid, _)| pid.matches(name))
            .map(|(pid, tx)| (pid.clone(), tx.clone()))
    }

    fn deliver(&self, to: &PeerId, tx: &mpsc::Sender<Inbound>, event: Inbound) {
        if self.dropping.read().contains(&to.as_str().to_ascii_lowercase()) {
            tracing::debug!(peer = %to, "dropping delivery on lossy link");
            return;
        }
        Self::push(tx, to, event);
    }

    fn push(tx: &mpsc::Sender<Inbound>, to: &PeerId, event: Inbound) {
        if let Err(e) = tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!(peer = %to, "inbound queue full, message dropped");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::debug!(peer = %to, "inbound queue closed, message dropped");
                }
            }
        }
    }
}

pub struct BusMailbox {
    bus: Arc<LocalBus>,
    local: PeerId,
    closed: AtomicBool,
}

impl Mailbox for BusMailbox {
    fn local_peer_id(&self) -> &PeerId {
        &self.local
    }

    fn send(&self, target: &Target, message: Message) -> Result<(), CoordError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(CoordError::TransportUnavailable("mailbox closed".into()));
        }
        match target {
            Target::Broadcast => {
                let targets: Vec<(PeerId, mpsc::Sender<Inbound>)> = self
                    .bus
                    .endpoints
                    .read()
                    .iter()
                    .map(|(pid, tx)| (pid.clone(), tx.clone()))
                    .collect();
                for (pid, tx) in &targets {
                    self.bus.deliver(
                        pid,
                        tx,
                        Inbound::Mail {
                            from: self.local.clone(),
                            message: message.clone(),
                        },
                    );
                }
            }
            Target::ToPeer(peer) => {
                let (pid, tx) = self
                    .bus
                    .find(peer.as_str())
                    .ok_or_else(|| CoordError::PeerNotFound(peer.to_string()))?;
                self.bus.deliver(
                    &pid,
                    &tx,
                    Inbound::Mail {
                        from: self.local.clone(),
                        message,
                    },
                );
            }
        }
        Ok(())
    }

    fn relay_command(&self, name: &str, command: &str) -> Result<(), CoordError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(CoordError::TransportUnavailable("mailbox closed".into()));
        }
        let (pid, tx) = self
            .bus
            .find(name)
            .ok_or_else(|| CoordError::PeerNotFound(name.to_owned()))?;
        self.bus.deliver(
            &pid,
            &tx,
            Inbound::Command {
                from: self.local.clone(),
                command: command.to_owned(),
            },
        );
        Ok(())
    }

    fn reachable_peers(&self) -> Vec<PeerId> {
        self.bus
            .registered()
            .into_iter()
            .filter(|pid| *pid != self.local)
            .collect()
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            self.bus.unregister(&self.local);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::Receiver<Inbound>) -> Vec<Inbound> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let bus = LocalBus::new(16);
        let _alice = bus.register("Alice").unwrap();
        let err = bus.register("alice").err().unwrap();
        assert!(matches!(err, CoordError::DuplicatePeerName(_)));
        assert!(err.is_fatal());
        assert!(bus.register("  ").is_err());
    }

    #[test]
    fn test_join_events_both_directions() {
        let bus = LocalBus::new(16);
        let (_a, mut a_rx) = bus.register("Alice").unwrap();
        let (_b, mut b_rx) = bus.register("Bob").unwrap();

        let a_events = drain(&mut a_rx);
        assert!(matches!(&a_events[..], [Inbound::PeerJoined(p)] if p.as_str() == "Bob"));
        let b_events = drain(&mut b_rx);
        assert!(matches!(&b_events[..], [Inbound::PeerJoined(p)] if p.as_str() == "Alice"));
    }

    #[test]
    fn test_broadcast_reaches_sender() {
        let bus = LocalBus::new(16);
        let (a, mut a_rx) = bus.register("Alice").unwrap();
        let (_b, mut b_rx) = bus.register("Bob").unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        a.send(
            &Target::Broadcast,
            Message::RequestData {
                from: "Alice".into(),
            },
        )
        .unwrap();

        for rx in [&mut a_rx, &mut b_rx] {
            let events = drain(rx);
            assert!(matches!(
                &events[..],
                [Inbound::Mail { from, message: Message::RequestData { .. } }] if from.as_str() == "Alice"
            ));
        }
    }

    #[test]
    fn test_point_to_point_case_insensitive() {
        let bus = LocalBus::new(16);
        let (a, _a_rx) = bus.register("Alice").unwrap();
        let (_b, mut b_rx) = bus.register("Bob").unwrap();
        drain(&mut b_rx);

        a.send(&Target::ToPeer(PeerId::new("BOB")), Message::Shutdown)
            .unwrap();
        a.relay_command("bob", "/sit").unwrap();

        let events = drain(&mut b_rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], Inbound::Command { command, .. } if command == "/sit"));

        let err = a
            .send(&Target::ToPeer(PeerId::new("Ghost")), Message::Shutdown)
            .unwrap_err();
        assert!(matches!(err, CoordError::PeerNotFound(_)));
    }

    #[test]
    fn test_lossy_link_drops_silently() {
        let bus = LocalBus::new(16);
        let (a, _a_rx) = bus.register("Alice").unwrap();
        let (_b, mut b_rx) = bus.register("Bob").unwrap();
        drain(&mut b_rx);

        bus.set_dropping("Bob", true);
        assert!(a.relay_command("Bob", "/sit").is_ok());
        assert!(drain(&mut b_rx).is_empty());

        bus.set_dropping("Bob", false);
        a.relay_command("Bob", "/stand").unwrap();
        assert_eq!(drain(&mut b_rx).len(), 1);
    }

    #[test]
    fn test_shutdown_announces_leave_and_frees_name() {
        let bus = LocalBus::new(16);
        let (a, mut a_rx) = bus.register("Alice").unwrap();
        let (b, _b_rx) = bus.register("Bob").unwrap();
        drain(&mut a_rx);
        assert_eq!(a.reachable_peers(), vec![PeerId::new("Bob")]);

        b.shutdown();
        b.shutdown();
        let events = drain(&mut a_rx);
        assert!(matches!(&events[..], [Inbound::PeerLeft(p)] if p.as_str() == "Bob"));
        assert!(b.send(&Target::Broadcast, Message::Shutdown).is_err());
        assert!(a.reachable_peers().is_empty());

        assert!(bus.register("Bob").is_ok());
    }
}
