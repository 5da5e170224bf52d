//! Target registration backed by the ELBv2 API.

use ahash::AHashMap as HashMap;
use anyhow::{Context, Result};
use lb_controller_core::target_group::{TargetDescription as Target, TargetManager};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetDescription {
    pub id: String,
    pub port: Option<i32>,
    pub availability_zone: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetHealth {
    pub state: Option<String>,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetHealthDescription {
    pub target: TargetDescription,
    pub target_health: Option<TargetHealth>,
}

/// The subset of the ELBv2 API needed to manage target registration.
#[async_trait::async_trait]
pub trait Elbv2Client: Send + Sync {
    async fn describe_target_health(&self, tg_arn: &str) -> Result<Vec<TargetHealthDescription>>;

    async fn register_targets(&self, tg_arn: &str, targets: Vec<TargetDescription>) -> Result<()>;

    async fn deregister_targets(&self, tg_arn: &str, targets: Vec<TargetDescription>)
        -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct Elbv2TargetManager<C> {
    client: C,
}

// === impl Elbv2TargetManager ===

impl<C> Elbv2TargetManager<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl<C: Elbv2Client> TargetManager for Elbv2TargetManager<C> {
    async fn list_targets(&self, tg_arns: &[&str]) -> Result<HashMap<String, Vec<Target>>> {
        let mut targets = HashMap::with_capacity(tg_arns.len());
        for &tg_arn in tg_arns {
            let descriptions = self.client.describe_target_health(tg_arn).await?;
            let registered = descriptions
                .into_iter()
                .map(|TargetHealthDescription { target, .. }| from_wire(target))
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("invalid target in {tg_arn}"))?;
            tracing::trace!(%tg_arn, targets = registered.len(), "Described target health");
            targets.insert(tg_arn.to_string(), registered);
        }
        Ok(targets)
    }

    async fn register_targets(&self, tg_arn: &str, targets: Vec<Target>) -> Result<()> {
        tracing::debug!(%tg_arn, targets = targets.len(), "Registering targets");
        let targets = targets.into_iter().map(to_wire).collect();
        self.client.register_targets(tg_arn, targets).await
    }

    async fn deregister_targets(&self, tg_arn: &str, targets: Vec<Target>) -> Result<()> {
        tracing::debug!(%tg_arn, targets = targets.len(), "Deregistering targets");
        let targets = targets.into_iter().map(to_wire).collect();
        self.client.deregister_targets(tg_arn, targets).await
    }
}

fn from_wire(target: TargetDescription) -> Result<Target> {
    let TargetDescription {
        id,
        port,
        availability_zone,
    } = target;
    let port = port
        .map(u16::try_from)
        .transpose()
        .with_context(|| format!("invalid port for target {id}"))?;
    Ok(Target {
        availability_zone,
        ..Target::new(id, port)
    })
}

fn to_wire(target: Target) -> TargetDescription {
    TargetDescription {
        id: target.id,
        port: target.port.map(i32::from),
        availability_zone: target.availability_zone,
    }
}
