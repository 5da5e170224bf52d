use crate::scheduler::Reconcile;
use lb_controller_core::{
    security_group::{SecurityGroupManager, SecurityGroupReconciler},
    Error, IpPermission, ReconcileOptions, Selector,
};
use tokio_util::sync::CancellationToken;

/// The rules a security group should carry, and which of its current rules
/// this controller owns.
#[derive(Clone, Debug, Default)]
pub struct DesiredRules {
    pub permissions: Vec<IpPermission>,
    pub selector: Selector,
}

/// Computes the desired ingress rules of a security group.
#[async_trait::async_trait]
pub trait DesiredIngress: Send + Sync + 'static {
    async fn desired_ingress(&self, sg_id: &str) -> anyhow::Result<DesiredRules>;
}

/// Reconciles a security group's ingress rules each time its id is scheduled.
pub struct IngressSync<M, D> {
    reconciler: SecurityGroupReconciler<M>,
    desired: D,
}

// === impl IngressSync ===

impl<M, D> IngressSync<M, D>
where
    M: SecurityGroupManager + Clone,
{
    pub fn new(manager: M, desired: D) -> Self {
        Self {
            reconciler: SecurityGroupReconciler::new(manager),
            desired,
        }
    }
}

#[async_trait::async_trait]
impl<M, D> Reconcile for IngressSync<M, D>
where
    M: SecurityGroupManager + Clone + 'static,
    D: DesiredIngress,
{
    type Key = String;

    async fn reconcile(&self, sg_id: &String, cancel: CancellationToken) -> Result<(), Error> {
        let DesiredRules {
            permissions,
            selector,
        } = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            desired = self.desired.desired_ingress(sg_id) => desired.map_err(Error::Fetch)?,
        };

        let options = ReconcileOptions { selector, cancel };
        self.reconciler
            .reconcile_ingress(sg_id, &permissions, options)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use ahash::AHashMap as HashMap;
    use lb_controller_core::{
        fake::{Call, FakeSecurityGroupManager},
        security_group::Direction,
        PortRange, Protocol,
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Static(HashMap<String, DesiredRules>);

    #[async_trait::async_trait]
    impl DesiredIngress for Static {
        async fn desired_ingress(&self, sg_id: &str) -> anyhow::Result<DesiredRules> {
            self.0
                .get(sg_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no desired state for {sg_id}"))
        }
    }

    fn tcp(port: u16, cidr: &str) -> IpPermission {
        IpPermission::cidr(
            Protocol::Tcp,
            Some(PortRange::single(port)),
            cidr.parse().unwrap(),
        )
    }

    fn owned(permission: IpPermission) -> IpPermission {
        permission
            .with_description("owner=lbc")
            .with_labels(Some(("owner", "lbc")).into_iter().collect())
    }

    #[tokio::test]
    async fn applies_desired_rules() {
        let manager = FakeSecurityGroupManager::default()
            .with_group("sg-1", vec![owned(tcp(80, "0.0.0.0/0")), tcp(22, "10.0.0.0/8")]);
        let desired = Static(
            Some((
                "sg-1".to_string(),
                DesiredRules {
                    permissions: vec![owned(tcp(443, "0.0.0.0/0"))],
                    selector: "owner=lbc".parse().unwrap(),
                },
            ))
            .into_iter()
            .collect(),
        );
        let sync = IngressSync::new(manager.clone(), desired);

        sync.reconcile(&"sg-1".to_string(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            manager.ingress("sg-1"),
            vec![tcp(22, "10.0.0.0/8"), owned(tcp(443, "0.0.0.0/0"))]
        );
    }

    #[tokio::test]
    async fn unknown_desired_state_is_a_fetch_error() {
        let manager = FakeSecurityGroupManager::default().with_group("sg-1", vec![]);
        let sync = IngressSync::new(manager.clone(), Static(HashMap::new()));

        let error = sync
            .reconcile(&"sg-1".to_string(), CancellationToken::new())
            .await
            .expect_err("no desired state");
        assert!(matches!(error, Error::Fetch(_)), "{error:?}");
        assert!(manager.calls().is_empty());
    }

    #[tokio::test]
    async fn runs_under_the_scheduler() {
        let manager = FakeSecurityGroupManager::default().with_group("sg-1", vec![]);
        let desired = Static(
            Some((
                "sg-1".to_string(),
                DesiredRules {
                    permissions: vec![tcp(443, "10.0.0.0/8")],
                    ..Default::default()
                },
            ))
            .into_iter()
            .collect(),
        );
        let scheduler = Scheduler::new("ingress", IngressSync::new(manager.clone(), desired), 1);
        let queue = scheduler.queue();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(shutdown.clone()));

        queue.enqueue("sg-1".to_string());
        while manager.mutations().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(
            manager.mutations(),
            vec![Call::Grant {
                id: "sg-1".to_string(),
                direction: Direction::Ingress,
                permissions: vec![tcp(443, "10.0.0.0/8")],
            }]
        );
    }
}
