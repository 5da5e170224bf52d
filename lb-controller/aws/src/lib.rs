//! Cloud-backed resource managers.
//!
//! Each manager adapts a narrow client trait, shaped after the provider's
//! API, to the corresponding core manager trait. Building the client,
//! including credentials, throttling and transport retries, is left to the
//! caller.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ec2;
pub mod elbv2;

pub use self::{
    ec2::{Ec2Client, Ec2SecurityGroupManager},
    elbv2::{Elbv2Client, Elbv2TargetManager},
};
