#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod diff;
pub mod fake;
pub mod ip_permission;
pub mod labels;
pub mod reconcile;
pub mod security_group;
pub mod target_group;

pub use self::{
    diff::{diff, EqualityPolicy},
    ip_permission::{IpPermission, IpPermissionEquality, Peer, PortRange, Protocol},
    labels::{Labels, Selector},
    reconcile::{Error, Labeled, Plan, ReconcileOptions, Reconciler, ResourceManager},
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};

/// The label key used to mark rules as owned by this controller.
pub const MANAGED_BY_LABEL: &str = "elbv2.k8s.aws/managed-by";
