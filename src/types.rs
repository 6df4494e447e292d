use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identity of a character process. Equality is exact; the group
/// protocol compares names with [`PeerId::matches`].
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, name: &str) -> bool {
        same_name(&self.0, name)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub fn same_name(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// What a character reports about itself. `None` means the game has not
/// loaded the value yet.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CharacterStatus {
    pub class: Option<String>,
    pub level: Option<String>,
    pub ac: Option<String>,
    pub max_hp: Option<String>,
    pub max_mana: Option<String>,
    pub max_endurance: Option<String>,
    pub zone: Option<String>,
}

/// Master-side snapshot of one peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerStatus {
    pub name: PeerId,
    pub class: Option<String>,
    pub level: Option<String>,
    pub ac: Option<String>,
    pub max_hp: Option<String>,
    pub max_mana: Option<String>,
    pub max_endurance: Option<String>,
    pub zone: Option<String>,
    pub stale: bool,
}

impl PeerStatus {
    pub fn stub(name: PeerId) -> Self {
        Self {
            name,
            class: None,
            level: None,
            ac: None,
            max_hp: None,
            max_mana: None,
            max_endurance: None,
            zone: None,
            stale: true,
        }
    }

    pub fn from_report(name: PeerId, status: CharacterStatus) -> Self {
        Self {
            name,
            class: status.class,
            level: status.level,
            ac: status.ac,
            max_hp: status.max_hp,
            max_mana: status.max_mana,
            max_endurance: status.max_endurance,
            zone: status.zone,
            stale: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum RoleKind {
    None,
    Leader,
    MainTank,
    MainAssist,
    Puller,
    MarkNpc,
    MasterLooter,
}

impl RoleKind {
    /// Numeric code used by the remote "set role" command.
    pub fn code(self) -> Option<u8> {
        match self {
            Self::MainTank => Some(1),
            Self::MainAssist => Some(2),
            Self::Puller => Some(3),
            Self::MarkNpc => Some(4),
            Self::MasterLooter => Some(5),
            Self::None | Self::Leader => None,
        }
    }

    /// At most one member of a group may hold a unique role.
    pub fn is_unique(self) -> bool {
        self.code().is_some()
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GroupMember {
    pub name: String,
    #[serde(default)]
    pub roles: BTreeSet<RoleKind>,
}

impl GroupMember {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: BTreeSet::new(),
        }
    }

    pub fn with_role(mut self, role: RoleKind) -> Self {
        if role != RoleKind::None {
            self.roles.insert(role);
        }
        self
    }

    pub fn has_role(&self, role: RoleKind) -> bool {
        self.roles.contains(&role)
    }

    /// Roles that translate into a "set role" command, in code order.
    pub fn role_codes(&self) -> Vec<u8> {
        self.roles.iter().filter_map(|r| r.code()).collect()
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GroupSpec {
    pub name: String,
    pub members: Vec<GroupMember>,
}

impl GroupSpec {
    pub fn new(name: impl Into<String>, members: Vec<GroupMember>) -> Self {
        Self {
            name: name.into(),
            members,
        }
    }

    /// First member holding `Leader` or `MainTank`, else the first member.
    pub fn leader(&self) -> Option<&GroupMember> {
        self.members
            .iter()
            .find(|m| m.has_role(RoleKind::Leader) || m.has_role(RoleKind::MainTank))
            .or_else(|| self.members.first())
    }

    pub fn member(&self, name: &str) -> Option<&GroupMember> {
        self.members.iter().find(|m| same_name(&m.name, name))
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.name.clone()).collect()
    }

    /// Give `role` to `member`. Unique roles are taken away from whoever
    /// held them before. Returns false if `member` is not in the group.
    pub fn assign_role(&mut self, member: &str, role: RoleKind) -> bool {
        if role == RoleKind::None || self.member(member).is_none() {
            return false;
        }
        for m in &mut self.members {
            if same_name(&m.name, member) {
                m.roles.insert(role);
            } else if role.is_unique() {
                m.roles.remove(&role);
            }
        }
        true
    }

    pub fn clear_role(&mut self, member: &str, role: RoleKind) {
        if let Some(m) = self.members.iter_mut().find(|m| same_name(&m.name, member)) {
            m.roles.remove(&role);
        }
    }
}

/// A named, ordered list of group references formed together.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GroupSetSpec {
    pub name: String,
    pub groups: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Target {
    Broadcast,
    ToPeer(PeerId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_basics() {
        let id = PeerId::new("Alice");
        assert_eq!(id.as_str(), "Alice");
        assert_eq!(format!("{id}"), "Alice");
        assert!(id.matches("alice"));
        assert!(!id.matches("alicia"));
        assert_ne!(id, PeerId::new("alice"));

        let from_str: PeerId = "Bob".into();
        let from_string: PeerId = String::from("Bob").into();
        assert_eq!(from_str, from_string);
    }

    #[test]
    fn test_role_codes() {
        assert_eq!(RoleKind::MainTank.code(), Some(1));
        assert_eq!(RoleKind::MainAssist.code(), Some(2));
        assert_eq!(RoleKind::Puller.code(), Some(3));
        assert_eq!(RoleKind::MarkNpc.code(), Some(4));
        assert_eq!(RoleKind::MasterLooter.code(), Some(5));
        assert_eq!(RoleKind::Leader.code(), None);
        assert_eq!(RoleKind::None.code(), None);
        assert!(!RoleKind::Leader.is_unique());
    }

    #[test]
    fn test_leader_selection() {
        let group = GroupSpec::new(
            "g",
            vec![
                GroupMember::new("Alice"),
                GroupMember::new("Bob").with_role(RoleKind::MainTank),
                GroupMember::new("Carol").with_role(RoleKind::Leader),
            ],
        );
        assert_eq!(group.leader().unwrap().name, "Bob");

        let group = GroupSpec::new(
            "g",
            vec![GroupMember::new("Alice"), GroupMember::new("Bob")],
        );
        assert_eq!(group.leader().unwrap().name, "Alice");

        assert!(GroupSpec::new("empty", vec![]).leader().is_none());
    }

    #[test]
    fn test_unique_role_moves_between_members() {
        let mut group = GroupSpec::new(
            "g",
            vec![
                GroupMember::new("Xena"),
                GroupMember::new("Yuri").with_role(RoleKind::MainTank),
            ],
        );
        assert!(group.assign_role("xena", RoleKind::MainTank));
        assert!(group.member("Xena").unwrap().has_role(RoleKind::MainTank));
        assert!(!group.member("Yuri").unwrap().has_role(RoleKind::MainTank));
    }

    #[test]
    fn test_leader_role_is_not_exclusive() {
        let mut group = GroupSpec::new(
            "g",
            vec![
                GroupMember::new("A").with_role(RoleKind::Leader),
                GroupMember::new("B"),
            ],
        );
        group.assign_role("B", RoleKind::Leader);
        assert!(group.member("A").unwrap().has_role(RoleKind::Leader));
        assert!(group.member("B").unwrap().has_role(RoleKind::Leader));

        assert!(!group.assign_role("Nobody", RoleKind::Puller));
        assert!(!group.assign_role("A", RoleKind::None));

        group.clear_role("A", RoleKind::Leader);
        assert!(!group.member("A").unwrap().has_role(RoleKind::Leader));
    }

    #[test]
    fn test_member_role_codes_sorted() {
        let member = GroupMember::new("A")
            .with_role(RoleKind::MasterLooter)
            .with_role(RoleKind::Leader)
            .with_role(RoleKind::MainAssist);
        assert_eq!(member.role_codes(), vec![2, 5]);
    }

    #[test]
    fn test_peer_status_stub() {
        let stub = PeerStatus::stub(PeerId::new("p"));
        assert!(stub.stale);
        assert!(stub.class.is_none() && stub.zone.is_none());

        let status = PeerStatus::from_report(
            PeerId::new("p"),
            CharacterStatus {
                class: Some("Cleric".into()),
                ..CharacterStatus::default()
            },
        );
        assert!(!status.stale);
        assert_eq!(status.class.as_deref(), Some("Cleric"));
    }
}
