//! Process configuration and the reconcile scheduler.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use lb_controller_core as core;

mod args;
pub mod config;
pub mod metrics;
pub mod scheduler;
pub mod sync;

pub use self::{
    args::Args,
    config::{CloudConfig, Config, ControllerConfig, ThrottleConfig, ThrottleRule},
    metrics::ReconcileMetrics,
    scheduler::{Backoff, Queue, Reconcile, Scheduler},
    sync::{DesiredIngress, DesiredRules, IngressSync},
};
