#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Controllers that converge the cluster toward the environments users have
//! requested.
//!
//! The environment controller owns one workload and one service per request.
//! The gateway controller owns the shared ingress and publishes a route for
//! every port of every environment's service. The two never call each other:
//! the gateway learns about service changes only by watching them.

mod backoff;
mod controller;
pub mod env;
mod error;
pub mod gateway;
mod metrics;

#[cfg(test)]
mod tests;

pub use self::{
    controller::{run, Outcome, Reconcile},
    env::{EnvConfig, EnvReconciler},
    error::Error,
    gateway::{GatewayReconciler, TrackedGateways},
    metrics::ControllerMetrics,
};
