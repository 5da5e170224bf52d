//! In-memory managers that record every call.
//!
//! They enforce the same contract as the provider: mutations are atomic,
//! revoking an absent rule and granting a duplicate rule both fail, and
//! unknown ids fail fetches.

use crate::{
    diff::EqualityPolicy,
    ip_permission::{IpPermission, IpPermissionEquality},
    security_group::{Direction, SecurityGroupInfo, SecurityGroupManager},
    target_group::{TargetDescription, TargetEquality, TargetManager},
};
use ahash::AHashMap as HashMap;
use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// An operation that can be made to fail.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Fetch,
    Revoke,
    Grant,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Fetch(Vec<String>),
    Revoke {
        id: String,
        direction: Direction,
        permissions: Vec<IpPermission>,
    },
    Grant {
        id: String,
        direction: Direction,
        permissions: Vec<IpPermission>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct FakeSecurityGroupManager {
    state: Arc<Mutex<SecurityGroups>>,
}

#[derive(Debug, Default)]
struct SecurityGroups {
    groups: HashMap<String, SecurityGroupInfo>,
    calls: Vec<Call>,
    failures: HashMap<Op, String>,
    exclusive_slots: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetCall {
    List(Vec<String>),
    Register(String, Vec<TargetDescription>),
    Deregister(String, Vec<TargetDescription>),
}

#[derive(Clone, Debug, Default)]
pub struct FakeTargetManager {
    state: Arc<Mutex<TargetGroups>>,
}

#[derive(Debug, Default)]
struct TargetGroups {
    groups: HashMap<String, Vec<TargetDescription>>,
    calls: Vec<TargetCall>,
    failures: HashMap<Op, String>,
}

// === impl FakeSecurityGroupManager ===

impl FakeSecurityGroupManager {
    pub fn with_group(self, id: impl Into<String>, ingress: Vec<IpPermission>) -> Self {
        let id = id.into();
        self.insert(SecurityGroupInfo {
            id,
            ingress,
            ..Default::default()
        });
        self
    }

    /// Rejects a grant whose protocol and port range are already occupied by
    /// a rule for a different peer.
    pub fn with_exclusive_slots(self) -> Self {
        self.state.lock().exclusive_slots = true;
        self
    }

    pub fn insert(&self, info: SecurityGroupInfo) {
        self.state.lock().groups.insert(info.id.clone(), info);
    }

    /// Replaces a group's ingress rules without recording a call, as an
    /// out-of-band change would.
    pub fn set_ingress(&self, id: &str, ingress: Vec<IpPermission>) {
        if let Some(group) = self.state.lock().groups.get_mut(id) {
            group.ingress = ingress;
        }
    }

    pub fn ingress(&self, id: &str) -> Vec<IpPermission> {
        self.rules(id, Direction::Ingress)
    }

    pub fn egress(&self, id: &str) -> Vec<IpPermission> {
        self.rules(id, Direction::Egress)
    }

    fn rules(&self, id: &str, direction: Direction) -> Vec<IpPermission> {
        self.state
            .lock()
            .groups
            .get(id)
            .map(|group| group.rules(direction).clone())
            .unwrap_or_default()
    }

    /// Makes the next call of `op` fail with `message`.
    pub fn fail_next(&self, op: Op, message: impl Into<String>) {
        self.state.lock().failures.insert(op, message.into());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Recorded revoke and grant calls, in order.
    pub fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, Call::Fetch(_)))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn revoke(&self, id: &str, direction: Direction, permissions: Vec<IpPermission>) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Revoke {
            id: id.to_string(),
            direction,
            permissions: permissions.clone(),
        });
        state.take_failure(Op::Revoke)?;

        let group = state.group_mut(id)?;
        let mut remaining = group.rules(direction).clone();
        for permission in &permissions {
            let idx = remaining
                .iter()
                .position(|rule| IpPermissionEquality.equivalent(rule, permission))
                .ok_or_else(|| {
                    anyhow!("InvalidPermission.NotFound: {permission} is not present on {id}")
                })?;
            remaining.remove(idx);
        }
        *group.rules_mut(direction) = remaining;
        Ok(())
    }

    fn grant(&self, id: &str, direction: Direction, permissions: Vec<IpPermission>) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Grant {
            id: id.to_string(),
            direction,
            permissions: permissions.clone(),
        });
        state.take_failure(Op::Grant)?;

        let exclusive = state.exclusive_slots;
        let group = state.group_mut(id)?;
        let mut rules = group.rules(direction).clone();
        for permission in permissions {
            if rules
                .iter()
                .any(|rule| IpPermissionEquality.equivalent(rule, &permission))
            {
                bail!("InvalidPermission.Duplicate: {permission} already exists on {id}");
            }
            if exclusive
                && rules.iter().any(|rule| {
                    rule.protocol == permission.protocol && rule.ports == permission.ports
                })
            {
                bail!("InvalidPermission.Conflict: {permission} overlaps a rule on {id}");
            }
            rules.push(permission);
        }
        *group.rules_mut(direction) = rules;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SecurityGroupManager for FakeSecurityGroupManager {
    async fn fetch_sg_infos_by_id(
        &self,
        ids: &[&str],
    ) -> Result<HashMap<String, SecurityGroupInfo>> {
        let mut state = self.state.lock();
        state
            .calls
            .push(Call::Fetch(ids.iter().map(|id| id.to_string()).collect()));
        state.take_failure(Op::Fetch)?;

        ids.iter()
            .map(|&id| -> Result<(String, SecurityGroupInfo)> {
                let info = state
                    .groups
                    .get(id)
                    .cloned()
                    .ok_or_else(|| anyhow!("InvalidGroup.NotFound: {id}"))?;
                Ok((id.to_string(), info))
            })
            .collect()
    }

    async fn authorize_sg_ingress(&self, id: &str, permissions: Vec<IpPermission>) -> Result<()> {
        self.grant(id, Direction::Ingress, permissions)
    }

    async fn revoke_sg_ingress(&self, id: &str, permissions: Vec<IpPermission>) -> Result<()> {
        self.revoke(id, Direction::Ingress, permissions)
    }

    async fn authorize_sg_egress(&self, id: &str, permissions: Vec<IpPermission>) -> Result<()> {
        self.grant(id, Direction::Egress, permissions)
    }

    async fn revoke_sg_egress(&self, id: &str, permissions: Vec<IpPermission>) -> Result<()> {
        self.revoke(id, Direction::Egress, permissions)
    }
}

// === impl SecurityGroups ===

impl SecurityGroups {
    fn take_failure(&mut self, op: Op) -> Result<()> {
        match self.failures.remove(&op) {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }

    fn group_mut(&mut self, id: &str) -> Result<&mut SecurityGroupInfo> {
        self.groups
            .get_mut(id)
            .ok_or_else(|| anyhow!("InvalidGroup.NotFound: {id}"))
    }
}

impl SecurityGroupInfo {
    fn rules(&self, direction: Direction) -> &Vec<IpPermission> {
        match direction {
            Direction::Ingress => &self.ingress,
            Direction::Egress => &self.egress,
        }
    }

    fn rules_mut(&mut self, direction: Direction) -> &mut Vec<IpPermission> {
        match direction {
            Direction::Ingress => &mut self.ingress,
            Direction::Egress => &mut self.egress,
        }
    }
}

// === impl FakeTargetManager ===

impl FakeTargetManager {
    pub fn with_group(self, tg_arn: impl Into<String>, targets: Vec<TargetDescription>) -> Self {
        self.state.lock().groups.insert(tg_arn.into(), targets);
        self
    }

    pub fn targets(&self, tg_arn: &str) -> Vec<TargetDescription> {
        self.state
            .lock()
            .groups
            .get(tg_arn)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_next(&self, op: Op, message: impl Into<String>) {
        self.state.lock().failures.insert(op, message.into());
    }

    pub fn calls(&self) -> Vec<TargetCall> {
        self.state.lock().calls.clone()
    }
}

#[async_trait::async_trait]
impl TargetManager for FakeTargetManager {
    async fn list_targets(
        &self,
        tg_arns: &[&str],
    ) -> Result<HashMap<String, Vec<TargetDescription>>> {
        let mut state = self.state.lock();
        state
            .calls
            .push(TargetCall::List(tg_arns.iter().map(|a| a.to_string()).collect()));
        if let Some(message) = state.failures.remove(&Op::Fetch) {
            bail!(message);
        }

        tg_arns
            .iter()
            .map(|&arn| -> Result<(String, Vec<TargetDescription>)> {
                let targets = state
                    .groups
                    .get(arn)
                    .cloned()
                    .ok_or_else(|| anyhow!("TargetGroupNotFound: {arn}"))?;
                Ok((arn.to_string(), targets))
            })
            .collect()
    }

    async fn register_targets(&self, tg_arn: &str, targets: Vec<TargetDescription>) -> Result<()> {
        let mut state = self.state.lock();
        state
            .calls
            .push(TargetCall::Register(tg_arn.to_string(), targets.clone()));
        if let Some(message) = state.failures.remove(&Op::Grant) {
            bail!(message);
        }

        let registered = state
            .groups
            .get_mut(tg_arn)
            .ok_or_else(|| anyhow!("TargetGroupNotFound: {tg_arn}"))?;
        let mut updated = registered.clone();
        for target in targets {
            if updated
                .iter()
                .any(|t| TargetEquality.equivalent(t, &target))
            {
                bail!("DuplicateTarget: {target} is already registered with {tg_arn}");
            }
            updated.push(target);
        }
        *registered = updated;
        Ok(())
    }

    async fn deregister_targets(
        &self,
        tg_arn: &str,
        targets: Vec<TargetDescription>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state
            .calls
            .push(TargetCall::Deregister(tg_arn.to_string(), targets.clone()));
        if let Some(message) = state.failures.remove(&Op::Revoke) {
            bail!(message);
        }

        let registered = state
            .groups
            .get_mut(tg_arn)
            .ok_or_else(|| anyhow!("TargetGroupNotFound: {tg_arn}"))?;
        let mut remaining = registered.clone();
        for target in &targets {
            let idx = remaining
                .iter()
                .position(|t| TargetEquality.equivalent(t, target))
                .ok_or_else(|| {
                    anyhow!("InvalidTarget: {target} is not registered with {tg_arn}")
                })?;
            remaining.remove(idx);
        }
        *registered = remaining;
        Ok(())
    }
}
