//! Simulated game world shared by several characters, for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::GROUP_SLOTS;
use crate::game::GameClient;
use crate::types::CharacterStatus;

#[derive(Default)]
struct WorldState {
    // lower-cased name -> group id
    membership: HashMap<String, u32>,
    // group id -> display names, leader first
    groups: HashMap<u32, Vec<String>>,
    next_group: u32,
    commands: HashMap<String, Vec<String>>,
    unresponsive: HashSet<String>,
    statuses: HashMap<String, CharacterStatus>,
}

impl WorldState {
    fn leave(&mut self, name: &str) {
        if let Some(id) = self.membership.remove(&name.to_ascii_lowercase())
            && let Some(members) = self.groups.get_mut(&id)
        {
            members.retain(|m| !m.eq_ignore_ascii_case(name));
            if members.is_empty() {
                self.groups.remove(&id);
            }
        }
    }

    fn invite(&mut self, leader: &str, invitee: &str) {
        let key = invitee.to_ascii_lowercase();
        if self.unresponsive.contains(&key) || self.membership.contains_key(&key) {
            return;
        }
        let id = match self.membership.get(&leader.to_ascii_lowercase()) {
            Some(id) => *id,
            None => {
                let id = self.next_group;
                self.next_group += 1;
                self.groups.insert(id, vec![leader.to_owned()]);
                self.membership.insert(leader.to_ascii_lowercase(), id);
                id
            }
        };
        if let Some(members) = self.groups.get_mut(&id)
            && members.len() < GROUP_SLOTS
        {
            members.push(invitee.to_owned());
            self.membership.insert(key, id);
        }
    }
}

#[derive(Clone, Default)]
pub struct SimWorld {
    state: Arc<Mutex<WorldState>>,
}

impl SimWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `names` into a fresh group, first name leading.
    pub fn set_group(&self, names: &[&str]) {
        let mut state = self.state.lock();
        for name in names {
            state.leave(name);
        }
        let id = state.next_group;
        state.next_group += 1;
        state
            .groups
            .insert(id, names.iter().map(|n| n.to_string()).collect());
        for name in names {
            state.membership.insert(name.to_ascii_lowercase(), id);
        }
    }

    pub fn set_unresponsive(&self, name: &str) {
        self.state.lock().unresponsive.insert(name.to_ascii_lowercase());
    }

    pub fn set_status(&self, name: &str, status: CharacterStatus) {
        self.state
            .lock()
            .statuses
            .insert(name.to_ascii_lowercase(), status);
    }

    pub fn group_of(&self, name: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .membership
            .get(&name.to_ascii_lowercase())
            .and_then(|id| state.groups.get(id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn commands_of(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .commands
            .get(&name.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_commands(&self) -> usize {
        self.state.lock().commands.values().map(Vec::len).sum()
    }

    pub fn client(&self, name: &str) -> Arc<dyn GameClient> {
        Arc::new(SimClient {
            world: self.clone(),
            name: name.to_owned(),
        })
    }
}

struct SimClient {
    world: SimWorld,
    name: String,
}

impl GameClient for SimClient {
    fn character_status(&self) -> Option<CharacterStatus> {
        self.world
            .state
            .lock()
            .statuses
            .get(&self.name.to_ascii_lowercase())
            .cloned()
    }

    fn group_slots(&self) -> Vec<Option<String>> {
        let mut slots: Vec<Option<String>> =
            self.world.group_of(&self.name).into_iter().map(Some).collect();
        if !slots.is_empty() {
            slots.resize(GROUP_SLOTS, None);
        }
        slots
    }

    fn execute(&self, command: &str) {
        let mut state = self.world.state.lock();
        state
            .commands
            .entry(self.name.to_ascii_lowercase())
            .or_default()
            .push(command.to_owned());

        let mut parts = command.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("/disband"), _) => state.leave(&self.name),
            (Some("/invite"), Some(who)) => state.invite(&self.name, who),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invite_and_disband() {
        let world = SimWorld::new();
        let alice = world.client("Alice");

        alice.execute("/invite Bob");
        assert_eq!(world.group_of("Bob"), vec!["Alice", "Bob"]);

        world.client("Bob").execute("/disband");
        assert!(world.group_of("Bob").is_empty());
        assert_eq!(world.group_of("Alice"), vec!["Alice"]);
    }

    #[test]
    fn test_invite_ignored_when_grouped_or_unresponsive() {
        let world = SimWorld::new();
        world.set_group(&["Dave", "Eve"]);
        world.set_unresponsive("Carol");

        let alice = world.client("Alice");
        alice.execute("/invite Eve");
        alice.execute("/invite Carol");
        assert!(world.group_of("Alice").is_empty());
        assert_eq!(world.commands_of("alice").len(), 2);
    }

    #[test]
    fn test_slots_padded_to_group_size() {
        let world = SimWorld::new();
        world.set_group(&["Alice", "Bob"]);
        let slots = world.client("Bob").group_slots();
        assert_eq!(slots.len(), GROUP_SLOTS);
        assert_eq!(slots[1].as_deref(), Some("Bob"));
        assert!(world.client("Zed").group_slots().is_empty());
    }
}
