//! Cluster installation orchestration.
//!
//! Two interchangeable strategies implement the same contract: a standard
//! cluster-init tool ([`kubeadm::KubeadmBootstrapper`]) and a from-scratch
//! embedded control plane ([`localkube::LocalkubeBootstrapper`]). Both are
//! built around a [`CommandRunner`] and never touch the driver directly.

pub mod kubeadm;
pub mod localkube;
pub mod versions;

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::assets::{self, Addon, CopyableFile};
use crate::config::ConfigMap;
use crate::constants::{self, LocalPaths};
use crate::driver::{Driver, DriverKind};
use crate::runner::{CommandRunner, ExecRunner, SshRunner};

pub use kubeadm::KubeadmBootstrapper;
pub use localkube::LocalkubeBootstrapper;
pub use versions::ExtraOption;

pub const DEFAULT_KUBERNETES_VERSION: &str = "v1.9.0";

/// Desired state of the cluster. Never mutated by a bootstrapper; every
/// call receives its own copy.
#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    pub kubernetes_version: String,
    pub node_ip: String,
    pub node_name: String,
    pub api_server_name: String,
    pub dns_domain: String,
    pub service_cidr: String,
    pub container_runtime: String,
    pub feature_gates: String,
    pub extra_options: Vec<ExtraOption>,
    pub should_load_cached_images: bool,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            kubernetes_version: DEFAULT_KUBERNETES_VERSION.to_string(),
            node_ip: String::new(),
            node_name: constants::DEFAULT_PROFILE.to_string(),
            api_server_name: constants::API_SERVER_NAME.to_string(),
            dns_domain: constants::CLUSTER_DNS_DOMAIN.to_string(),
            service_cidr: constants::DEFAULT_SERVICE_CIDR.to_string(),
            container_runtime: String::new(),
            feature_gates: String::new(),
            extra_options: Vec::new(),
            should_load_cached_images: false,
        }
    }
}

/// Installation strategy contract.
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    /// Probe the cluster service. Returns exactly "Running" or "Stopped";
    /// anything else the probe prints is an error, never a default.
    async fn get_cluster_status(&self) -> Result<String>;

    /// Cluster service logs: a streaming session when `follow`, a bounded
    /// snapshot otherwise.
    async fn get_cluster_logs(&self, follow: bool) -> Result<String>;

    async fn start_cluster(&self, cfg: &KubernetesConfig) -> Result<()>;

    /// Restore the previously-generated configuration and restart; never
    /// regenerates config.
    async fn restart_cluster(&self, cfg: &KubernetesConfig) -> Result<()>;

    /// Idempotent convergence entry point: render configs, resolve
    /// binaries, push assets, start the service.
    async fn update_cluster(&self, cfg: &KubernetesConfig) -> Result<()>;

    async fn setup_certs(&self, cfg: &KubernetesConfig) -> Result<()>;
}

/// Strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapperKind {
    Kubeadm,
    Localkube,
}

impl fmt::Display for BootstrapperKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapperKind::Kubeadm => write!(f, "kubeadm"),
            BootstrapperKind::Localkube => write!(f, "localkube"),
        }
    }
}

impl std::str::FromStr for BootstrapperKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kubeadm" => Ok(BootstrapperKind::Kubeadm),
            "localkube" => Ok(BootstrapperKind::Localkube),
            _ => Err(format!(
                "Unknown bootstrapper '{}'. Valid options: kubeadm, localkube",
                s
            )),
        }
    }
}

/// Build the command runner matching the chosen driver: direct exec for
/// the "none" driver, SSH for everything else.
pub fn runner_for(driver: &dyn Driver) -> Result<Arc<dyn CommandRunner>> {
    if driver.driver_name() == DriverKind::None {
        return Ok(Arc::new(ExecRunner));
    }
    let host = driver.ssh_hostname()?;
    Ok(Arc::new(SshRunner::new(
        &host,
        driver.ssh_port(),
        driver.ssh_username(),
        Some(driver.ssh_key_path()),
    )))
}

/// Build a bootstrapper for the requested strategy.
pub fn new_bootstrapper(
    kind: BootstrapperKind,
    runner: Arc<dyn CommandRunner>,
    paths: LocalPaths,
    addons: Vec<Addon>,
    config_map: ConfigMap,
) -> Box<dyn Bootstrapper> {
    match kind {
        BootstrapperKind::Kubeadm => Box::new(KubeadmBootstrapper::new(
            runner, paths, addons, config_map,
        )),
        BootstrapperKind::Localkube => Box::new(LocalkubeBootstrapper::new(
            runner, paths, addons, config_map,
        )),
    }
}

/// Probe command for a systemd unit, collapsing its state to the two
/// recognized words.
pub(crate) fn status_probe_command(unit: &str) -> String {
    format!(
        r#"sudo systemctl is-active {} &>/dev/null && echo "Running" || echo "Stopped""#,
        unit
    )
}

/// Map probe output onto the closed status vocabulary.
pub(crate) fn parse_cluster_status(raw: &str) -> Result<String> {
    let status = raw.trim();
    if status == "Running" || status == "Stopped" {
        Ok(status.to_string())
    } else {
        bail!("unrecognized cluster status output: {:?}", raw.trim());
    }
}

pub(crate) fn logs_command(unit: &str, follow: bool) -> String {
    if follow {
        format!("sudo journalctl -f -u {}", unit)
    } else {
        format!("sudo journalctl -u {}", unit)
    }
}

/// The enable/start sequence both strategies issue after pushing assets.
pub(crate) fn systemd_start_command(unit: &str) -> String {
    format!(
        "sudo systemctl daemon-reload && sudo systemctl enable {unit} && sudo systemctl start {unit}",
        unit = unit
    )
}

/// Assemble the full asset list from the state-dir trees plus every
/// registered addon whose resolved enabled state is true.
///
/// `exclude` names an addon the strategy is authoritative over and ships
/// its own equivalent of.
pub(crate) fn collect_addons(
    paths: &LocalPaths,
    addons: &[Addon],
    config_map: &ConfigMap,
    exclude: Option<&str>,
) -> Result<Vec<CopyableFile>> {
    let mut files = Vec::new();
    assets::add_state_dir_assets(paths, &mut files)?;
    for addon in addons {
        if exclude == Some(addon.name()) {
            continue;
        }
        if addon.is_enabled(config_map) {
            files.extend(addon.assets.iter().cloned());
        }
    }
    Ok(files)
}
