use crate::{
    ip_permission::{IpPermission, IpPermissionEquality},
    reconcile::{Error, ReconcileOptions, Reconciler, ResourceManager},
};
use ahash::AHashMap as HashMap;
use anyhow::Result;


/// The rules attached to a security group, as last reported by the provider.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecurityGroupInfo {
    pub id: String,
    pub ingress: Vec<IpPermission>,
    pub egress: Vec<IpPermission>,
    pub tags: HashMap<String, String>,
}

/// Which rule set of a security group an operation targets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ingress,
    Egress,
}

/// Reads and mutates security group rules on the provider.
#[async_trait::async_trait]
pub trait SecurityGroupManager: Send + Sync {
    /// Fetches the current state of every listed group. Unknown ids fail the
    /// whole call.
    async fn fetch_sg_infos_by_id(&self, ids: &[&str])
        -> Result<HashMap<String, SecurityGroupInfo>>;

    async fn authorize_sg_ingress(&self, id: &str, permissions: Vec<IpPermission>) -> Result<()>;

    async fn revoke_sg_ingress(&self, id: &str, permissions: Vec<IpPermission>) -> Result<()>;

    async fn authorize_sg_egress(&self, id: &str, permissions: Vec<IpPermission>) -> Result<()>;

    async fn revoke_sg_egress(&self, id: &str, permissions: Vec<IpPermission>) -> Result<()>;
}

/// Exposes one direction of a [`SecurityGroupManager`] as a
/// [`ResourceManager`].
#[derive(Clone, Debug)]
pub struct Rules<M> {
    manager: M,
    direction: Direction,
}

/// Reconciles security group rules toward a desired set.
#[derive(Clone, Debug)]
pub struct SecurityGroupReconciler<M> {
    ingress: Reconciler<Rules<M>, IpPermissionEquality>,
    egress: Reconciler<Rules<M>, IpPermissionEquality>,
}

// === impl Rules ===

#[async_trait::async_trait]
impl<M: SecurityGroupManager> ResourceManager for Rules<M> {
    type Entry = IpPermission;

    async fn fetch_state(&self, ids: &[&str]) -> Result<HashMap<String, Vec<IpPermission>>> {
        let infos = self.manager.fetch_sg_infos_by_id(ids).await?;
        Ok(infos
            .into_iter()
            .map(|(id, info)| {
                let rules = match self.direction {
                    Direction::Ingress => info.ingress,
                    Direction::Egress => info.egress,
                };
                (id, rules)
            })
            .collect())
    }

    async fn revoke(&self, id: &str, entries: Vec<IpPermission>) -> Result<()> {
        match self.direction {
            Direction::Ingress => self.manager.revoke_sg_ingress(id, entries).await,
            Direction::Egress => self.manager.revoke_sg_egress(id, entries).await,
        }
    }

    async fn grant(&self, id: &str, entries: Vec<IpPermission>) -> Result<()> {
        match self.direction {
            Direction::Ingress => self.manager.authorize_sg_ingress(id, entries).await,
            Direction::Egress => self.manager.authorize_sg_egress(id, entries).await,
        }
    }
}

// === impl SecurityGroupReconciler ===

impl<M: SecurityGroupManager + Clone> SecurityGroupReconciler<M> {
    pub fn new(manager: M) -> Self {
        Self {
            ingress: Reconciler::new(
                Rules {
                    manager: manager.clone(),
                    direction: Direction::Ingress,
                },
                IpPermissionEquality,
            ),
            egress: Reconciler::new(
                Rules {
                    manager,
                    direction: Direction::Egress,
                },
                IpPermissionEquality,
            ),
        }
    }

    /// Converges the ingress rules of `sg_id` toward `desired`.
    ///
    /// Only rules selected by `options.selector` may be revoked; every desired
    /// rule that is missing is granted.
    pub async fn reconcile_ingress(
        &self,
        sg_id: &str,
        desired: &[IpPermission],
        options: ReconcileOptions,
    ) -> Result<(), Error> {
        self.ingress.reconcile(sg_id, desired, options).await
    }

    /// Converges the egress rules of `sg_id` toward `desired`.
    pub async fn reconcile_egress(
        &self,
        sg_id: &str,
        desired: &[IpPermission],
        options: ReconcileOptions,
    ) -> Result<(), Error> {
        self.egress.reconcile(sg_id, desired, options).await
    }
}
