use serde::Serialize;

use crate::types::{GroupMember, same_name};

/// Membership changes needed to turn a leader's actual group into the
/// desired one. Names keep the spelling of the list they came from.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct GroupChangePlan {
    pub to_invite: Vec<String>,
    pub to_remove: Vec<String>,
    pub already_correct: Vec<String>,
}

impl GroupChangePlan {
    pub fn is_noop(&self) -> bool {
        self.to_invite.is_empty() && self.to_remove.is_empty()
    }

    pub fn total_changes(&self) -> usize {
        self.to_invite.len() + self.to_remove.len()
    }
}

fn contains(names: &[String], name: &str) -> bool {
    names.iter().any(|n| same_name(n, name))
}

pub fn diff(desired: &[GroupMember], actual: &[String]) -> GroupChangePlan {
    let mut plan = GroupChangePlan::default();

    for member in desired {
        let bucket = if contains(actual, &member.name) {
            &mut plan.already_correct
        } else {
            &mut plan.to_invite
        };
        if !contains(bucket, &member.name) {
            bucket.push(member.name.clone());
        }
    }

    for name in actual {
        let wanted = desired.iter().any(|m| same_name(&m.name, name));
        if !wanted && !contains(&plan.to_remove, name) {
            plan.to_remove.push(name.clone());
        }
    }

    plan
}

/// Desired names that do not appear in `actual`.
pub fn missing_members(desired: &[GroupMember], actual: &[String]) -> Vec<String> {
    diff(desired, actual).to_invite
}
