use super::*;
use crate::{
    fake::{Call, FakeSecurityGroupManager, Op},
    ip_permission::{IpPermission, IpPermissionEquality, PortRange, Protocol},
    security_group::SecurityGroupReconciler,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::sync::Arc;
use tokio::sync::Notify;

fn tcp(port: u16, cidr: &str) -> IpPermission {
    IpPermission::cidr(
        Protocol::Tcp,
        Some(PortRange::single(port)),
        cidr.parse().unwrap(),
    )
}

fn owned(permission: IpPermission) -> IpPermission {
    permission.with_labels(Some(("owner", "lbc")).into_iter().collect())
}

#[rstest]
#[case::converged(
    vec![tcp(80, "10.0.0.0/8")],
    vec![tcp(80, "10.0.0.0/8")],
    Selector::everything(),
    vec![],
    vec![],
)]
#[case::replace(
    vec![tcp(443, "0.0.0.0/0")],
    vec![tcp(443, "10.0.0.0/8")],
    Selector::everything(),
    vec![tcp(443, "0.0.0.0/0")],
    vec![tcp(443, "10.0.0.0/8")],
)]
#[case::empty_observed(
    vec![],
    vec![tcp(80, "10.0.0.0/8"), tcp(443, "10.0.0.0/8")],
    Selector::everything(),
    vec![],
    vec![tcp(80, "10.0.0.0/8"), tcp(443, "10.0.0.0/8")],
)]
#[case::empty_desired(
    vec![tcp(80, "10.0.0.0/8")],
    vec![],
    Selector::everything(),
    vec![tcp(80, "10.0.0.0/8")],
    vec![],
)]
#[case::unselected_kept(
    vec![owned(tcp(80, "10.0.0.0/8")), tcp(22, "0.0.0.0/0")],
    vec![],
    "owner=lbc".parse().unwrap(),
    vec![owned(tcp(80, "10.0.0.0/8"))],
    vec![],
)]
#[case::unselected_desired_is_not_regranted(
    vec![tcp(22, "0.0.0.0/0")],
    vec![owned(tcp(22, "0.0.0.0/0"))],
    "owner=lbc".parse().unwrap(),
    vec![],
    vec![],
)]
fn computes_plan(
    #[case] observed: Vec<IpPermission>,
    #[case] desired: Vec<IpPermission>,
    #[case] selector: Selector,
    #[case] revoke: Vec<IpPermission>,
    #[case] grant: Vec<IpPermission>,
) {
    let plan = Plan::compute(&observed, &desired, &selector, &IpPermissionEquality);
    assert_eq!(plan.is_empty(), revoke.is_empty() && grant.is_empty());
    assert_eq!(plan, Plan { revoke, grant });
}

#[test]
fn revoke_never_overlaps_desired() {
    let observed = vec![tcp(22, "0.0.0.0/0"), tcp(80, "10.0.0.0/8"), tcp(443, "0.0.0.0/0")];
    let desired = vec![tcp(80, "10.0.0.0/8"), tcp(443, "10.0.0.0/8")];
    let Plan { revoke, grant } = Plan::compute(
        &observed,
        &desired,
        &Selector::everything(),
        &IpPermissionEquality,
    );

    for r in &revoke {
        assert!(!desired
            .iter()
            .any(|d| IpPermissionEquality.equivalent(r, d)));
    }
    for g in &grant {
        assert!(!observed
            .iter()
            .any(|o| IpPermissionEquality.equivalent(g, o)));
    }
}

#[test]
fn error_messages_are_transparent() {
    let error = Error::Grant(anyhow!("InvalidPermission.Duplicate"));
    assert_eq!(error.to_string(), "InvalidPermission.Duplicate");
    assert!(!error.is_cancelled());
    assert!(Error::Cancelled.is_cancelled());
}

#[tokio::test]
async fn cancelled_before_start_touches_nothing() {
    let manager =
        FakeSecurityGroupManager::default().with_group("sg-1", vec![tcp(22, "0.0.0.0/0")]);
    let reconciler = SecurityGroupReconciler::new(manager.clone());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let error = reconciler
        .reconcile_ingress(
            "sg-1",
            &[tcp(443, "10.0.0.0/8")],
            ReconcileOptions::default().with_cancel(cancel),
        )
        .await
        .expect_err("pass must be cancelled");
    assert!(error.is_cancelled(), "{error:?}");
    assert!(manager.calls().is_empty());
}

#[tokio::test]
async fn fetch_error_is_not_cancellation() {
    let manager =
        FakeSecurityGroupManager::default().with_group("sg-1", vec![tcp(22, "0.0.0.0/0")]);
    manager.fail_next(Op::Fetch, "Throttling");
    let reconciler = SecurityGroupReconciler::new(manager.clone());

    let error = reconciler
        .reconcile_ingress("sg-1", &[], ReconcileOptions::default())
        .await
        .expect_err("fetch must fail");
    assert!(matches!(error, Error::Fetch(_)));
    assert_eq!(manager.calls(), vec![Call::Fetch(vec!["sg-1".to_string()])]);
}

/// A manager whose revoke never completes until the pass is cancelled.
#[derive(Clone, Default)]
struct StalledRevoke {
    observed: Vec<IpPermission>,
    revoking: Arc<Notify>,
    granted: Arc<Mutex<Vec<IpPermission>>>,
}

#[async_trait::async_trait]
impl ResourceManager for StalledRevoke {
    type Entry = IpPermission;

    async fn fetch_state(&self, ids: &[&str]) -> Result<HashMap<String, Vec<IpPermission>>> {
        Ok(ids
            .iter()
            .map(|id| (id.to_string(), self.observed.clone()))
            .collect())
    }

    async fn revoke(&self, _: &str, _: Vec<IpPermission>) -> Result<()> {
        self.revoking.notify_one();
        std::future::pending().await
    }

    async fn grant(&self, _: &str, entries: Vec<IpPermission>) -> Result<()> {
        self.granted.lock().extend(entries);
        Ok(())
    }
}

#[tokio::test]
async fn cancellation_interrupts_inflight_call() {
    let manager = StalledRevoke {
        observed: vec![tcp(22, "0.0.0.0/0")],
        ..Default::default()
    };
    let reconciler = Reconciler::new(manager.clone(), IpPermissionEquality);
    let cancel = CancellationToken::new();

    let pass = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            reconciler
                .reconcile(
                    "sg-1",
                    &[tcp(443, "10.0.0.0/8")],
                    ReconcileOptions::default().with_cancel(cancel),
                )
                .await
        }
    });

    manager.revoking.notified().await;
    cancel.cancel();

    let error = pass
        .await
        .expect("task must not panic")
        .expect_err("pass must be cancelled");
    assert!(error.is_cancelled(), "{error:?}");
    assert!(
        manager.granted.lock().is_empty(),
        "grant must not follow a cancelled revoke"
    );
}
