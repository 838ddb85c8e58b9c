//! kubelift library
//!
//! Provision a single-node virtual machine (or run directly against this
//! host) and install a working Kubernetes control plane onto it.
//!
//! The [`driver`] layer presents one lifecycle contract over hypervisor
//! backends; the [`bootstrapper`] layer installs and manages the cluster
//! through a [`runner::CommandRunner`] built from whatever the driver
//! produced. The CLI, config writing, and terminal I/O live outside this
//! crate: callers hand in a resolved [`bootstrapper::KubernetesConfig`]
//! and a persisted configuration map, and get status/log/address strings
//! back.

pub mod assets;
pub mod bootstrapper;
pub mod certs;
pub mod config;
pub mod constants;
pub mod download;
pub mod driver;
pub mod images;
pub mod retry;
pub mod runner;

#[cfg(test)]
pub(crate) mod testutil;
