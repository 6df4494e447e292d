use crate::config::GROUP_SLOTS;
use crate::types::CharacterStatus;

/// The running game client of the local character. Implementations wrap
/// whatever scripting hooks the host game exposes.
pub trait GameClient: Send + Sync {
    /// Current status of the local character, or `None` while the game
    /// has not loaded it.
    fn character_status(&self) -> Option<CharacterStatus>;

    /// Raw member slots of the local character's group. Slot order is the
    /// game's; empty slots are `None`.
    fn group_slots(&self) -> Vec<Option<String>>;

    /// Run a game command (e.g. `/invite Bob`) as the local character.
    fn execute(&self, command: &str);
}

/// Names in the first `GROUP_SLOTS` slots, skipping empty ones.
pub fn roster(game: &dyn GameClient) -> Vec<String> {
    game.group_slots()
        .into_iter()
        .take(GROUP_SLOTS)
        .flatten()
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty())
        .collect()
}
