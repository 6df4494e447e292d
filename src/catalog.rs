use serde::{Deserialize, Serialize};

use crate::error::CoordError;
use crate::types::{GroupSetSpec, GroupSpec, RoleKind, same_name};

/// Saved group definitions and the sets that reference them by name.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GroupCatalog {
    #[serde(default)]
    pub groups: Vec<GroupSpec>,
    #[serde(default)]
    pub sets: Vec<GroupSetSpec>,
}

impl GroupCatalog {
    pub fn from_json(json: &str) -> Result<Self, CoordError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, CoordError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Insert or replace a group by name.
    pub fn upsert_group(&mut self, group: GroupSpec) {
        match self.groups.iter_mut().find(|g| same_name(&g.name, &group.name)) {
            Some(existing) => *existing = group,
            None => self.groups.push(group),
        }
    }

    pub fn upsert_set(&mut self, set: GroupSetSpec) {
        match self.sets.iter_mut().find(|s| same_name(&s.name, &set.name)) {
            Some(existing) => *existing = set,
            None => self.sets.push(set),
        }
    }

    pub fn group(&self, name: &str) -> Result<&GroupSpec, CoordError> {
        self.groups
            .iter()
            .find(|g| same_name(&g.name, name))
            .ok_or_else(|| CoordError::GroupNotFound(name.to_owned()))
    }

    /// The groups a set references, in set order. Fails on the first
    /// reference that does not resolve.
    pub fn resolve_set(&self, name: &str) -> Result<Vec<GroupSpec>, CoordError> {
        let set = self
            .sets
            .iter()
            .find(|s| same_name(&s.name, name))
            .ok_or_else(|| CoordError::GroupSetNotFound(name.to_owned()))?;
        set.groups
            .iter()
            .map(|g| self.group(g).cloned())
            .collect()
    }

    pub fn assign_role(&mut self, group: &str, member: &str, role: RoleKind) -> Result<bool, CoordError> {
        let spec = self
            .groups
            .iter_mut()
            .find(|g| same_name(&g.name, group))
            .ok_or_else(|| CoordError::GroupNotFound(group.to_owned()))?;
        Ok(spec.assign_role(member, role))
    }
}
