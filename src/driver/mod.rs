//! Uniform lifecycle contract over hypervisor backends.
//!
//! Each backend keeps its own state record; there is no shared base struct
//! with optional fields. Backends are dispatched by [`DriverKind`].

pub mod kvm;
pub mod none;
pub mod qemu;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::constants::LocalPaths;

pub use kvm::KvmDriver;
pub use none::NoneDriver;
pub use qemu::QemuDriver;

/// Backend identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverKind {
    /// Type-2 hypervisor booting a synthesized disk with extracted
    /// kernel/initrd.
    Qemu,
    /// Native OS virtualization API, driven through libvirt.
    Kvm,
    /// No driver: the controlling host is the instance.
    None,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Qemu => write!(f, "qemu"),
            DriverKind::Kvm => write!(f, "kvm"),
            DriverKind::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "qemu" => Ok(DriverKind::Qemu),
            "kvm" => Ok(DriverKind::Kvm),
            "none" => Ok(DriverKind::None),
            _ => Err(format!(
                "Unknown driver '{}'. Valid options: qemu, kvm, none",
                s
            )),
        }
    }
}

/// Lifecycle state of a managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Running,
    Stopped,
    Error,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Running => write!(f, "Running"),
            InstanceState::Stopped => write!(f, "Stopped"),
            InstanceState::Error => write!(f, "Error"),
        }
    }
}

/// Resource shape shared by the VM backends.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub cpus: u32,
    pub memory_mb: u64,
    pub disk_size_mb: u64,
    /// Boot image template the instance disk is synthesized from.
    pub boot_image: PathBuf,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_mb: 2048,
            disk_size_mb: 20_000,
            boot_image: PathBuf::new(),
        }
    }
}

/// Lifecycle contract every backend implements.
///
/// `kill` and `remove` are reachable from any state and tolerate partial or
/// unknown state; `state` reports `Stopped` for an instance whose record or
/// process is simply gone, so idempotent teardown treats "never existed"
/// and "vanished" uniformly.
#[async_trait]
pub trait Driver: Send + Sync {
    fn driver_name(&self) -> DriverKind;

    /// Profile name identifying the managed instance.
    fn profile(&self) -> &str;

    async fn create(&mut self) -> Result<()>;
    async fn start(&mut self) -> Result<()>;
    async fn stop(&mut self) -> Result<()>;

    async fn restart(&mut self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    async fn kill(&mut self) -> Result<()>;
    async fn remove(&mut self) -> Result<()>;
    async fn state(&self) -> Result<InstanceState>;

    /// Network address of the running instance.
    async fn ip(&self) -> Result<String>;

    /// Hostname for the SSH endpoint; available once started.
    fn ssh_hostname(&self) -> Result<String>;

    fn ssh_port(&self) -> u16 {
        22
    }

    fn ssh_key_path(&self) -> PathBuf;

    fn ssh_username(&self) -> &str;
}

/// Build a driver for the requested backend.
pub fn new_driver(
    kind: DriverKind,
    profile: &str,
    config: MachineConfig,
    paths: &LocalPaths,
) -> Box<dyn Driver> {
    match kind {
        DriverKind::Qemu => Box::new(QemuDriver::new(profile, config, paths)),
        DriverKind::Kvm => Box::new(KvmDriver::new(profile, config, paths)),
        DriverKind::None => Box::new(NoneDriver::new(profile)),
    }
}
