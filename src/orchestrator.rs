//! Drives a leader's group toward a desired roster: analyze, disband,
//! invite, wait, verify with retries, then hand out roles.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::FormationOptions;
use crate::diff::{GroupChangePlan, diff, missing_members};
use crate::dispatcher::{CommandDispatcher, commands};
use crate::group_query::GroupQuery;
use crate::types::{GroupSpec, same_name};
use crate::wait::{WaitOutcome, sleep_cancellable, wait_until};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FormationPhase {
    Analyze,
    RemoveUnwanted,
    DisbandNew,
    Invite,
    WaitForJoin,
    Verify,
    Retry,
    AssignRoles,
    Done,
}

impl fmt::Display for FormationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Analyze => "analyze",
            Self::RemoveUnwanted => "remove_unwanted",
            Self::DisbandNew => "disband_new",
            Self::Invite => "invite",
            Self::WaitForJoin => "wait_for_join",
            Self::Verify => "verify",
            Self::Retry => "retry",
            Self::AssignRoles => "assign_roles",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum FormationOutcome {
    Success,
    Partial,
    Failure,
}

#[derive(Clone, Debug, Serialize)]
pub struct FormationResult {
    pub group: String,
    pub leader: Option<String>,
    pub outcome: FormationOutcome,
    /// Invites plus removals the initial analysis called for.
    pub changes: usize,
    pub joined: Vec<String>,
    pub missing: Vec<String>,
    pub message: String,
}

impl FormationResult {
    /// Partial formation still counts as success.
    pub fn succeeded(&self) -> bool {
        self.outcome != FormationOutcome::Failure
    }

    fn empty_group(group: &GroupSpec) -> Self {
        Self {
            group: group.name.clone(),
            leader: None,
            outcome: FormationOutcome::Failure,
            changes: 0,
            joined: Vec::new(),
            missing: Vec::new(),
            message: "Group has no members".into(),
        }
    }

    fn already_formed(group: &GroupSpec, leader: &str) -> Self {
        Self {
            group: group.name.clone(),
            leader: Some(leader.to_owned()),
            outcome: FormationOutcome::Success,
            changes: 0,
            joined: group.member_names(),
            missing: Vec::new(),
            message: "Group already formed".into(),
        }
    }

    fn cancelled(group: &GroupSpec, leader: &str, changes: usize, missing: Vec<String>) -> Self {
        let joined = joined_members(group, &missing);
        Self {
            group: group.name.clone(),
            leader: Some(leader.to_owned()),
            outcome: FormationOutcome::Failure,
            changes,
            joined,
            missing,
            message: "Formation cancelled".into(),
        }
    }

    fn summarize(group: &GroupSpec, leader: &str, changes: usize, missing: Vec<String>) -> Self {
        let joined = joined_members(group, &missing);
        let total = group.members.len();
        let (outcome, message) = if missing.is_empty() {
            (FormationOutcome::Success, "Group formed successfully".to_owned())
        } else if !joined.is_empty() {
            (
                FormationOutcome::Partial,
                format!(
                    "Group formed with {}/{} members (missing: {})",
                    joined.len(),
                    total,
                    missing.join(", ")
                ),
            )
        } else {
            (
                FormationOutcome::Failure,
                format!("Failed to form group (missing: {})", missing.join(", ")),
            )
        };
        Self {
            group: group.name.clone(),
            leader: Some(leader.to_owned()),
            outcome,
            changes,
            joined,
            missing,
            message,
        }
    }
}

fn joined_members(group: &GroupSpec, missing: &[String]) -> Vec<String> {
    group
        .members
        .iter()
        .filter(|m| !missing.iter().any(|n| same_name(n, &m.name)))
        .map(|m| m.name.clone())
        .collect()
}

/// Case-insensitive union preserving first-seen order and spelling.
fn union_names<'a>(lists: impl IntoIterator<Item = &'a [String]>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for list in lists {
        for name in list {
            if seen.insert(name.to_ascii_lowercase()) {
                out.push(name.clone());
            }
        }
    }
    out
}

struct ActiveGroup<'a> {
    index: usize,
    spec: &'a GroupSpec,
    leader: String,
    plan: GroupChangePlan,
}

impl ActiveGroup<'_> {
    /// Invitees other than the leader; the leader is never disbanded or
    /// invited.
    fn invitees(&self) -> Vec<String> {
        self.plan
            .to_invite
            .iter()
            .filter(|n| !same_name(n, &self.leader))
            .cloned()
            .collect()
    }
}

pub struct GroupFormer {
    query: Arc<GroupQuery>,
    dispatcher: Arc<CommandDispatcher>,
    options: FormationOptions,
    cancel: CancellationToken,
}

impl GroupFormer {
    pub fn new(
        query: Arc<GroupQuery>,
        dispatcher: Arc<CommandDispatcher>,
        options: FormationOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            query,
            dispatcher,
            options,
            cancel,
        }
    }

    pub fn options(&self) -> &FormationOptions {
        &self.options
    }

    /// Current members of `leader`'s group; a query that fails reads as
    /// an empty group. An ungrouped leader reports no roster but still
    /// stands in its own group.
    async fn actual_members(&self, leader: &str) -> Vec<String> {
        match self
            .query
            .query_group_members(leader, self.options.query_timeout())
            .await
        {
            Ok(members) if members.is_empty() => vec![leader.to_owned()],
            Ok(members) => members,
            Err(e) => {
                tracing::warn!(leader, error = %e, "group query failed, assuming no members");
                Vec::new()
            }
        }
    }

    /// Desired members currently absent from the leader's group.
    async fn verify(&self, group: &GroupSpec, leader: &str) -> Vec<String> {
        let actual = self.actual_members(leader).await;
        missing_members(&group.members, &actual)
    }

    fn dispatch(&self, character: &str, command: &str) {
        if let Err(e) = self.dispatcher.send_command_to_character(character, command) {
            tracing::warn!(character, command, error = %e, "command dispatch failed");
        }
    }

    fn disband_all(&self, names: &[String]) {
        for name in names {
            if !self.options.keep_raid {
                self.dispatch(name, commands::RAID_DISBAND);
            }
            self.dispatch(name, commands::DISBAND);
        }
    }

    fn invite_all(&self, leader: &str, names: &[String]) {
        for name in names.iter().filter(|n| !same_name(n, leader)) {
            self.dispatch(leader, &commands::invite(name));
        }
    }

    async fn settle(&self, duration: std::time::Duration) -> bool {
        sleep_cancellable(duration, &self.cancel).await
    }

    async fn analyze<'a>(&self, index: usize, group: &'a GroupSpec) -> Result<ActiveGroup<'a>, FormationResult> {
        let Some(leader) = group.leader().map(|m| m.name.clone()) else {
            return Err(FormationResult::empty_group(group));
        };
        tracing::debug!(group = %group.name, %leader, phase = %FormationPhase::Analyze, "analyzing");

        let actual = self.actual_members(&leader).await;
        if self.cancel.is_cancelled() {
            return Err(FormationResult::cancelled(group, &leader, 0, group.member_names()));
        }
        let plan = diff(&group.members, &actual);
        if plan.is_noop() {
            tracing::info!(group = %group.name, %leader, "group already formed");
            return Err(FormationResult::already_formed(group, &leader));
        }

        tracing::info!(
            group = %group.name,
            %leader,
            invite = ?plan.to_invite,
            remove = ?plan.to_remove,
            "group needs changes"
        );
        Ok(ActiveGroup {
            index,
            spec: group,
            leader,
            plan,
        })
    }

    /// Poll every active group until all of them verify or the join wait
    /// runs out.
    async fn wait_for_join(&self, groups: &[ActiveGroup<'_>]) -> bool {
        let outcome = wait_until(
            || async move {
                for g in groups {
                    if !self.verify(g.spec, &g.leader).await.is_empty() {
                        return false;
                    }
                }
                true
            },
            self.options.join_poll_interval(),
            self.options.max_join_wait(),
            &self.cancel,
        )
        .await;
        outcome == WaitOutcome::Satisfied
    }

    /// Verify once, then disband and re-invite whoever is still missing,
    /// up to `max_retries` times. Returns the final missing list. An early
    /// success during the join wait is only a hint: if this confirmation
    /// fails, the retries run as usual.
    async fn verify_and_retry(&self, group: &ActiveGroup<'_>, early_success: bool) -> Vec<String> {
        let name = &group.spec.name;
        let leader = group.leader.as_str();

        tracing::debug!(group = %name, phase = %FormationPhase::Verify, early_success, "verifying");
        let mut missing = self.verify(group.spec, leader).await;

        for attempt in 1..=self.options.max_retries {
            if missing.is_empty() || self.cancel.is_cancelled() {
                break;
            }
            let targets: Vec<String> = missing
                .iter()
                .filter(|n| !same_name(n, leader))
                .cloned()
                .collect();
            if targets.is_empty() {
                break;
            }

            tracing::info!(group = %name, attempt, missing = ?targets, phase = %FormationPhase::Retry, "retrying");
            self.disband_all(&targets);
            if !self.settle(self.options.settle_delay()).await {
                break;
            }
            self.invite_all(leader, &targets);
            if !self.settle(self.options.retry_invite_delay()).await {
                break;
            }
            missing = self.verify(group.spec, leader).await;
        }

        missing
    }

    async fn assign_roles(&self, group: &ActiveGroup<'_>, missing: &[String]) {
        tracing::debug!(group = %group.spec.name, phase = %FormationPhase::AssignRoles, "assigning roles");
        let mut first = true;
        for member in &group.spec.members {
            if missing.iter().any(|n| same_name(n, &member.name)) {
                continue;
            }
            for code in member.role_codes() {
                if !first && !self.settle(self.options.role_delay()).await {
                    return;
                }
                first = false;
                self.dispatch(&group.leader, &commands::set_role(&member.name, code));
            }
        }
    }

    async fn finish(&self, group: &ActiveGroup<'_>, early_success: bool) -> FormationResult {
        let changes = group.plan.total_changes();
        let missing = self.verify_and_retry(group, early_success).await;
        if self.cancel.is_cancelled() {
            return FormationResult::cancelled(group.spec, &group.leader, changes, missing);
        }

        self.assign_roles(group, &missing).await;

        let result = FormationResult::summarize(group.spec, &group.leader, changes, missing);
        tracing::info!(
            group = %result.group,
            outcome = ?result.outcome,
            phase = %FormationPhase::Done,
            "{}",
            result.message
        );
        result
    }

    fn cancelled_before_verify(&self, group: &ActiveGroup<'_>) -> FormationResult {
        FormationResult::cancelled(
            group.spec,
            &group.leader,
            group.plan.total_changes(),
            group.plan.to_invite.clone(),
        )
    }

    pub async fn form_group(&self, group: &GroupSpec) -> FormationResult {
        let active = match self.analyze(0, group).await {
            Ok(active) => active,
            Err(done) => return done,
        };
        let leader = active.leader.clone();

        if !active.plan.to_remove.is_empty() {
            tracing::debug!(group = %group.name, phase = %FormationPhase::RemoveUnwanted, "removing unwanted members");
            self.disband_all(&active.plan.to_remove);
            if !self.settle(self.options.settle_delay()).await {
                return self.cancelled_before_verify(&active);
            }
        }

        let invitees = active.invitees();
        if !invitees.is_empty() {
            tracing::debug!(group = %group.name, phase = %FormationPhase::DisbandNew, "clearing invitees");
            self.disband_all(&invitees);
            if !self.settle(self.options.settle_delay()).await {
                return self.cancelled_before_verify(&active);
            }
        }

        if invitees.is_empty() {
            // nobody was invited, so there is nothing to wait for
            return self.finish(&active, false).await;
        }

        tracing::debug!(group = %group.name, phase = %FormationPhase::Invite, "inviting");
        self.invite_all(&leader, &invitees);

        tracing::debug!(group = %group.name, phase = %FormationPhase::WaitForJoin, "waiting for joins");
        let early_success = self.wait_for_join(std::slice::from_ref(&active)).await;

        self.finish(&active, early_success).await
    }

    /// Form several groups at once. Disbands and invites are batched
    /// across the set; verification, retries and roles run per group.
    /// Results come back in the order of `groups`.
    pub async fn form_group_set(&self, groups: &[GroupSpec]) -> Vec<FormationResult> {
        let mut results: Vec<Option<FormationResult>> = vec![None; groups.len()];
        let mut active = Vec::new();

        for (index, group) in groups.iter().enumerate() {
            match self.analyze(index, group).await {
                Ok(a) => active.push(a),
                Err(done) => results[index] = Some(done),
            }
        }

        if !active.is_empty() {
            let invitees: Vec<Vec<String>> = active.iter().map(ActiveGroup::invitees).collect();
            let to_disband = union_names(
                active
                    .iter()
                    .map(|a| a.plan.to_remove.as_slice())
                    .chain(invitees.iter().map(Vec::as_slice)),
            );

            tracing::info!(groups = active.len(), disband = ?to_disband, "batched disband pass");
            self.disband_all(&to_disband);
            let settled = to_disband.is_empty() || self.settle(self.options.settle_delay()).await;

            if settled {
                for (a, names) in active.iter().zip(&invitees) {
                    self.invite_all(&a.leader, names);
                }
                let early_success = self.wait_for_join(&active).await;
                for a in &active {
                    results[a.index] = Some(self.finish(a, early_success).await);
                }
            } else {
                for a in &active {
                    results[a.index] = Some(self.cancelled_before_verify(a));
                }
            }
        }

        results.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_names_dedupes_case_insensitively() {
        let a = vec!["Bob".to_string(), "Carol".to_string()];
        let b = vec!["bob".to_string(), "Dave".to_string()];
        assert_eq!(
            union_names([a.as_slice(), b.as_slice()]),
            vec!["Bob", "Carol", "Dave"]
        );
    }

    #[test]
    fn test_summary_messages() {
        use crate::types::GroupMember;

        let group = GroupSpec::new(
            "g",
            vec![
                GroupMember::new("Alice"),
                GroupMember::new("Bob"),
                GroupMember::new("Carol"),
            ],
        );

        let ok = FormationResult::summarize(&group, "Alice", 1, vec![]);
        assert_eq!(ok.outcome, FormationOutcome::Success);
        assert_eq!(ok.message, "Group formed successfully");

        let partial = FormationResult::summarize(&group, "Alice", 1, vec!["Carol".into()]);
        assert_eq!(partial.outcome, FormationOutcome::Partial);
        assert!(partial.succeeded());
        assert_eq!(partial.message, "Group formed with 2/3 members (missing: Carol)");
        assert_eq!(partial.joined, vec!["Alice", "Bob"]);

        let failed = FormationResult::summarize(
            &group,
            "Alice",
            3,
            vec!["Alice".into(), "Bob".into(), "Carol".into()],
        );
        assert_eq!(failed.outcome, FormationOutcome::Failure);
        assert!(!failed.succeeded());
        assert_eq!(failed.message, "Failed to form group (missing: Alice, Bob, Carol)");
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(FormationPhase::WaitForJoin.to_string(), "wait_for_join");
        assert_eq!(FormationPhase::Done.to_string(), "done");
    }
}
