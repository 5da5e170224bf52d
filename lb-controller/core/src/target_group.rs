//! Target registration, reconciled with the same protocol as security group
//! rules: deregistration happens before registration, and only selected
//! targets are ever deregistered.

use crate::{
    diff::EqualityPolicy,
    labels::Labels,
    reconcile::{Error, Labeled, ReconcileOptions, Reconciler, ResourceManager},
};
use ahash::AHashMap as HashMap;
use anyhow::Result;
use std::fmt;

/// A target registered with a target group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetDescription {
    /// An instance id, IP address or lambda ARN.
    pub id: String,
    pub port: Option<u16>,
    pub availability_zone: Option<String>,
    pub labels: Labels,
}

/// Compares targets by id and port.
#[derive(Copy, Clone, Debug, Default)]
pub struct TargetEquality;

#[async_trait::async_trait]
pub trait TargetManager: Send + Sync {
    async fn list_targets(&self, tg_arns: &[&str])
        -> Result<HashMap<String, Vec<TargetDescription>>>;

    async fn register_targets(&self, tg_arn: &str, targets: Vec<TargetDescription>) -> Result<()>;

    async fn deregister_targets(&self, tg_arn: &str, targets: Vec<TargetDescription>)
        -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct Targets<M>(M);

#[derive(Clone, Debug)]
pub struct TargetGroupReconciler<M> {
    inner: Reconciler<Targets<M>, TargetEquality>,
}

// === impl TargetDescription ===

impl TargetDescription {
    pub fn new(id: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            id: id.into(),
            port,
            availability_zone: None,
            labels: Labels::default(),
        }
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }
}

impl Labeled for TargetDescription {
    fn labels(&self) -> &Labels {
        &self.labels
    }
}

impl fmt::Display for TargetDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.id, port),
            None => f.write_str(&self.id),
        }
    }
}

impl EqualityPolicy<TargetDescription> for TargetEquality {
    fn equivalent(&self, a: &TargetDescription, b: &TargetDescription) -> bool {
        a.id == b.id && a.port == b.port
    }
}

// === impl Targets ===

#[async_trait::async_trait]
impl<M: TargetManager> ResourceManager for Targets<M> {
    type Entry = TargetDescription;

    async fn fetch_state(&self, ids: &[&str]) -> Result<HashMap<String, Vec<TargetDescription>>> {
        self.0.list_targets(ids).await
    }

    async fn revoke(&self, id: &str, entries: Vec<TargetDescription>) -> Result<()> {
        self.0.deregister_targets(id, entries).await
    }

    async fn grant(&self, id: &str, entries: Vec<TargetDescription>) -> Result<()> {
        self.0.register_targets(id, entries).await
    }
}

// === impl TargetGroupReconciler ===

impl<M: TargetManager> TargetGroupReconciler<M> {
    pub fn new(manager: M) -> Self {
        Self {
            inner: Reconciler::new(Targets(manager), TargetEquality),
        }
    }

    pub async fn reconcile_targets(
        &self,
        tg_arn: &str,
        desired: &[TargetDescription],
        options: ReconcileOptions,
    ) -> Result<(), Error> {
        self.inner.reconcile(tg_arn, desired, options).await
    }
}
