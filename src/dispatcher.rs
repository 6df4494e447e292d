use std::sync::Arc;

use crate::error::CoordError;
use crate::game::GameClient;
use crate::mailbox::Mailbox;
use crate::types::PeerId;

/// Game commands issued during group formation.
pub mod commands {
    pub const RAID_DISBAND: &str = "/raiddisband";
    pub const DISBAND: &str = "/disband";

    pub fn invite(name: &str) -> String {
        format!("/invite {name}")
    }

    pub fn set_role(name: &str, code: u8) -> String {
        format!("/grouproles set {name} {code}")
    }
}

/// Runs a command as a named character, locally when that character is
/// this process and through the mailbox otherwise.
pub struct CommandDispatcher {
    local_peer_id: PeerId,
    mailbox: Arc<dyn Mailbox>,
    game: Arc<dyn GameClient>,
}

impl CommandDispatcher {
    pub fn new(mailbox: Arc<dyn Mailbox>, game: Arc<dyn GameClient>) -> Self {
        Self {
            local_peer_id: mailbox.local_peer_id().clone(),
            mailbox,
            game,
        }
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    pub fn send_command_to_character(&self, name: &str, command: &str) -> Result<(), CoordError> {
        if self.local_peer_id.matches(name) {
            tracing::debug!(character = name, command, "executing locally");
            self.game.execute(command);
            return Ok(());
        }
        tracing::debug!(character = name, command, "relaying command");
        self.mailbox.relay_command(name, command)
    }
}
