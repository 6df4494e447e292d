//! Request/reply bridge for "who is in this leader's group". Replies land
//! in a response slot from the handler task; the caller polls the slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::CoordError;
use crate::game::{GameClient, roster};
use crate::mailbox::Mailbox;
use crate::protocol::Message;
use crate::types::{PeerId, Target};
use crate::wait::{WaitOutcome, wait_until};

struct Slot {
    query_id: u64,
    response: Option<Vec<String>>,
}

/// One slot per leader (case-insensitive). A slot only accepts the reply
/// to the query currently outstanding for that leader, and is emptied
/// when read.
#[derive(Default)]
pub struct ResponseSlots {
    slots: Mutex<HashMap<String, Slot>>,
}

impl ResponseSlots {
    fn key(leader: &str) -> String {
        leader.trim().to_ascii_lowercase()
    }

    pub fn begin(&self, leader: &str, query_id: u64) {
        self.slots.lock().insert(
            Self::key(leader),
            Slot {
                query_id,
                response: None,
            },
        );
    }

    /// Store a reply. Returns false if nobody is waiting for it.
    pub fn fill(&self, character: &str, query_id: u64, members: Vec<String>) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(&Self::key(character)) {
            Some(slot) if slot.query_id == query_id => {
                slot.response = Some(members);
                true
            }
            _ => false,
        }
    }

    pub fn take(&self, leader: &str, query_id: u64) -> Option<Vec<String>> {
        let mut slots = self.slots.lock();
        let key = Self::key(leader);
        let ready = matches!(
            slots.get(&key),
            Some(slot) if slot.query_id == query_id && slot.response.is_some()
        );
        if ready {
            slots.remove(&key).and_then(|slot| slot.response)
        } else {
            None
        }
    }

    pub fn abandon(&self, leader: &str, query_id: u64) {
        let mut slots = self.slots.lock();
        let key = Self::key(leader);
        if slots.get(&key).is_some_and(|slot| slot.query_id == query_id) {
            slots.remove(&key);
        }
    }

    pub fn pending(&self) -> usize {
        self.slots.lock().len()
    }
}

pub struct GroupQuery {
    local_peer_id: PeerId,
    mailbox: Arc<dyn Mailbox>,
    game: Arc<dyn GameClient>,
    slots: ResponseSlots,
    next_query_id: AtomicU64,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl GroupQuery {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        game: Arc<dyn GameClient>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            local_peer_id: mailbox.local_peer_id().clone(),
            mailbox,
            game,
            slots: ResponseSlots::default(),
            next_query_id: AtomicU64::new(1),
            poll_interval,
            cancel,
        }
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Current members of `leader`'s group. Answered from the local
    /// roster when `leader` is this process, otherwise by broadcasting a
    /// `QueryGroup` and polling for the matching `GroupData`.
    pub async fn query_group_members(
        &self,
        leader: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, CoordError> {
        if self.local_peer_id.matches(leader) {
            return Ok(roster(self.game.as_ref()));
        }

        let query_id = self.next_query_id.fetch_add(1, Ordering::Relaxed);
        self.slots.begin(leader, query_id);

        let sent = self.mailbox.send(
            &Target::Broadcast,
            Message::QueryGroup {
                target: leader.to_owned(),
                query_id,
            },
        );
        if let Err(e) = sent {
            tracing::warn!(leader, error = %e, "group query broadcast failed");
        }

        let start = Instant::now();
        let mut result = None;
        let outcome = wait_until(
            || {
                result = self.slots.take(leader, query_id);
                std::future::ready(result.is_some())
            },
            self.poll_interval,
            timeout,
            &self.cancel,
        )
        .await;

        match outcome {
            WaitOutcome::Satisfied => Ok(result.unwrap_or_default()),
            WaitOutcome::TimedOut => {
                self.slots.abandon(leader, query_id);
                let elapsed_ms = start.elapsed().as_millis() as u64;
                tracing::warn!(leader, elapsed_ms, "group query timed out");
                Err(CoordError::Timeout {
                    operation: format!("group query for {leader}"),
                    elapsed_ms,
                })
            }
            WaitOutcome::Cancelled => {
                self.slots.abandon(leader, query_id);
                Err(CoordError::Cancelled)
            }
        }
    }

    /// Handler side: a `GroupData` reply arrived.
    pub fn handle_group_data(&self, character: &str, members: Vec<String>, query_id: u64) {
        if !self.slots.fill(character, query_id, members) {
            tracing::debug!(character, query_id, "discarding unsolicited group data");
        }
    }

    /// Handler side: answer a `QueryGroup` if it is addressed to us.
    pub fn answer_query(&self, from: &PeerId, target: &str, query_id: u64) {
        if *from == self.local_peer_id || !self.local_peer_id.matches(target) {
            return;
        }
        let reply = Message::GroupData {
            character: self.local_peer_id.as_str().to_owned(),
            members: roster(self.game.as_ref()),
            query_id,
        };
        if let Err(e) = self.mailbox.send(&Target::ToPeer(from.clone()), reply) {
            tracing::warn!(peer = %from, error = %e, "failed to answer group query");
        }
    }
}
