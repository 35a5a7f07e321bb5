#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Cluster-independent types for ephemeral environments: the requested
//! environment, the policy that admits it, its lease, the ownership labels
//! that mark objects as ours, and the pure functions that derive service
//! ports and gateway routes.

pub mod allowlist;
pub mod lease;
pub mod lifecycle;
pub mod ownership;
pub mod ports;
pub mod routes;
pub mod spec;

pub use self::{
    allowlist::{Allowlist, Forbidden},
    lease::Lease,
    lifecycle::{Phase, WorkloadAction, WorkloadState},
    ownership::{Conflict, Kind, Ownership},
    ports::ServicePort,
    routes::Rule,
    spec::{EnvSpec, Fingerprint},
};

pub const SYSTEM_NAME: &str = "ephemerator";
