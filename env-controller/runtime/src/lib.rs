#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use ephemerator_controller_core as core;
pub use ephemerator_controller_k8s_api as k8s;
pub use ephemerator_controller_k8s_env as env;

mod args;

pub use self::args::Args;
