use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::CoordError;
use crate::messaging::{or_unknown, status_from_report};
use crate::protocol::PeerReport;
use crate::types::{PeerId, PeerStatus};

#[derive(Clone, Debug)]
pub enum RegistryEvent {
    Discovered(PeerId),
    Updated(PeerStatus),
}

/// Exported form of one registry entry, with `"---"` for unknown fields.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PeerStatusRecord {
    pub name: String,
    pub class: String,
    pub level: String,
    pub ac: String,
    pub max_hp: String,
    pub max_mana: String,
    pub max_endurance: String,
    pub zone: String,
    pub stale: bool,
}

impl From<&PeerStatus> for PeerStatusRecord {
    fn from(s: &PeerStatus) -> Self {
        Self {
            name: s.name.as_str().to_owned(),
            class: or_unknown(s.class.as_ref()),
            level: or_unknown(s.level.as_ref()),
            ac: or_unknown(s.ac.as_ref()),
            max_hp: or_unknown(s.max_hp.as_ref()),
            max_mana: or_unknown(s.max_mana.as_ref()),
            max_endurance: or_unknown(s.max_endurance.as_ref()),
            zone: or_unknown(s.zone.as_ref()),
            stale: s.stale,
        }
    }
}

/// Master-side table of the last status each peer reported. Entries are
/// only ever replaced, never expired.
pub struct PeerRegistry {
    local_peer_id: PeerId,
    peers: RwLock<HashMap<PeerId, PeerStatus>>,
    pub event_tx: broadcast::Sender<RegistryEvent>,
}

impl PeerRegistry {
    pub fn new(local_peer_id: PeerId) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            local_peer_id,
            peers: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Record a newly discovered peer with every field unknown. Does
    /// nothing if the peer is already known.
    pub fn ensure_stub(&self, peer_id: &PeerId) -> bool {
        let inserted = {
            let mut peers = self.peers.write();
            if peers.contains_key(peer_id) {
                false
            } else {
                peers.insert(peer_id.clone(), PeerStatus::stub(peer_id.clone()));
                true
            }
        };
        if inserted {
            tracing::debug!(peer = %peer_id, "peer discovered");
            let _ = self.event_tx.send(RegistryEvent::Discovered(peer_id.clone()));
        }
        inserted
    }

    /// Apply a `PeerData` reply from `sender`. The entry is overwritten
    /// as a whole, but only once the reply carries a known class; until
    /// then the peer stays a stub.
    pub fn apply_report(&self, sender: &PeerId, report: &PeerReport) -> bool {
        let mut status = status_from_report(report);
        if !sender.matches(status.name.as_str()) {
            tracing::warn!(peer = %sender, reported = %status.name, "PeerData name differs from sender");
        }
        status.name = sender.clone();

        if status.class.is_none() {
            self.ensure_stub(sender);
            return false;
        }

        self.replace(status);
        true
    }

    /// Insert the local snapshot directly, without a round trip.
    pub fn insert_local(&self, status: PeerStatus) {
        self.replace(status);
    }

    fn replace(&self, status: PeerStatus) {
        self.peers.write().insert(status.name.clone(), status.clone());
        let _ = self.event_tx.send(RegistryEvent::Updated(status));
    }

    pub fn get(&self, name: &str) -> Option<PeerStatus> {
        self.peers
            .read()
            .values()
            .find(|s| s.name.matches(name))
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.peers.read().keys().any(|pid| pid.matches(name))
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Point-in-time copy of every entry, ordered by name.
    pub fn snapshot(&self) -> Vec<PeerStatus> {
        let mut all: Vec<PeerStatus> = self.peers.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn export(&self) -> BTreeMap<String, PeerStatusRecord> {
        self.peers
            .read()
            .values()
            .map(|s| (s.name.as_str().to_owned(), PeerStatusRecord::from(s)))
            .collect()
    }

    pub fn export_json(&self) -> Result<String, CoordError> {
        Ok(serde_json::to_string_pretty(&self.export())?)
    }
}
