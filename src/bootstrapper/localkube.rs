//! From-scratch embedded control plane strategy.
//!
//! A single localkube binary carries the whole control plane; installing a
//! cluster means shipping that binary, a systemd unit whose flags encode
//! the [`KubernetesConfig`], and the addon manifests. Unlike kubeadm this
//! strategy has no DNS of its own, so the generic kube-dns addon ships
//! whenever it is enabled.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::versions;
use super::{Bootstrapper, KubernetesConfig};
use crate::assets::{Addon, CopyableFile};
use crate::certs;
use crate::config::ConfigMap;
use crate::constants::{self, LocalPaths};
use crate::download::cached_fetch;
use crate::images;
use crate::retry::retry_after;
use crate::runner::CommandRunner;

const LOCALKUBE_BINARY_DIR: &str = "/usr/local/bin";
const LOCALKUBE_BINARY: &str = "localkube";

const KUBECTL: &str = "sudo /usr/bin/kubectl --kubeconfig=/etc/kubernetes/admin.conf";

const CONVERGE_ATTEMPTS: usize = 100;
const CONVERGE_DELAY: Duration = Duration::from_millis(500);

pub struct LocalkubeBootstrapper {
    runner: Arc<dyn CommandRunner>,
    paths: LocalPaths,
    addons: Vec<Addon>,
    config_map: ConfigMap,
}

impl LocalkubeBootstrapper {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        paths: LocalPaths,
        addons: Vec<Addon>,
        config_map: ConfigMap,
    ) -> Self {
        Self {
            runner,
            paths,
            addons,
            config_map,
        }
    }

    /// Block until the probe reports Running.
    async fn wait_for_running(&self) -> Result<()> {
        let runner = &*self.runner;
        retry_after(CONVERGE_ATTEMPTS, CONVERGE_DELAY, || async move {
            let status = runner
                .combined_output(&super::status_probe_command(LOCALKUBE_BINARY))
                .await?;
            let status = super::parse_cluster_status(&status)?;
            if status == "Running" {
                Ok(())
            } else {
                anyhow::bail!("cluster is {}", status)
            }
        })
        .await
        .context("waiting for localkube to report Running")
    }

    /// The data-plane can be stale relative to a restarted control plane;
    /// force the proxy pods, if any, to resynchronize.
    async fn restart_kube_proxy(&self) -> Result<()> {
        let cmd = format!(
            "{} delete pods -n kube-system -l k8s-app=kube-proxy --ignore-not-found=true",
            KUBECTL
        );
        let runner = &*self.runner;
        retry_after(CONVERGE_ATTEMPTS, CONVERGE_DELAY, || {
            let cmd = cmd.clone();
            async move {
                runner.combined_output(&cmd).await?;
                Ok(())
            }
        })
        .await
        .context("restarting kube-proxy")
    }
}

#[async_trait]
impl Bootstrapper for LocalkubeBootstrapper {
    async fn get_cluster_status(&self) -> Result<String> {
        let status = self
            .runner
            .combined_output(&super::status_probe_command(LOCALKUBE_BINARY))
            .await
            .context("getting status")?;
        super::parse_cluster_status(&status)
    }

    async fn get_cluster_logs(&self, follow: bool) -> Result<String> {
        let cmd = super::logs_command(LOCALKUBE_BINARY, follow);
        if follow {
            self.runner.run(&cmd).await.context("getting shell")?;
            return Ok(String::new());
        }
        self.runner
            .combined_output(&cmd)
            .await
            .context("getting cluster logs")
    }

    async fn start_cluster(&self, _cfg: &KubernetesConfig) -> Result<()> {
        self.runner
            .run(&super::systemd_start_command(LOCALKUBE_BINARY))
            .await
            .context("starting localkube")?;
        self.wait_for_running().await
    }

    async fn restart_cluster(&self, _cfg: &KubernetesConfig) -> Result<()> {
        // The unit on the instance is the previously-generated config;
        // restart replays it rather than rendering a new one.
        self.runner
            .run("sudo systemctl restart localkube")
            .await
            .context("restarting localkube")?;
        self.wait_for_running().await?;
        self.restart_kube_proxy().await
    }

    async fn update_cluster(&self, cfg: &KubernetesConfig) -> Result<()> {
        if cfg.should_load_cached_images {
            let runner = Arc::clone(&self.runner);
            let image_list = constants::kubeadm_cached_images(&cfg.kubernetes_version);
            let cache_dir = self.paths.image_cache_dir();
            tokio::spawn(async move {
                if let Err(e) = images::load_images(runner.as_ref(), &image_list, &cache_dir).await
                {
                    warn!("image preload failed: {:#}", e);
                }
            });
        }

        let unit = localkube_systemd_unit(cfg).context("generating localkube unit")?;

        let url = constants::localkube_release_url(&cfg.kubernetes_version);
        let checksum_url = format!("{}.sha256", url);
        let binary_path = cached_fetch(
            LOCALKUBE_BINARY,
            &cfg.kubernetes_version,
            &url,
            Some(&checksum_url),
            &self.paths,
        )
        .await
        .context("downloading localkube")?;

        let mut files = vec![
            CopyableFile::from_file(
                binary_path,
                LOCALKUBE_BINARY_DIR,
                LOCALKUBE_BINARY,
                "0777",
            )
            .context("making localkube asset")?,
            CopyableFile::from_memory(
                unit.into_bytes(),
                constants::LOCALKUBE_SERVICE_FILE,
                "0640",
            ),
        ];

        // Generic addon path: no exclusions, kube-dns included when on.
        files.extend(
            super::collect_addons(&self.paths, &self.addons, &self.config_map, None)
                .context("adding addons to copyable files")?,
        );

        for file in &files {
            self.runner
                .copy(file)
                .await
                .with_context(|| format!("transferring localkube file {}", file.target_path()))?;
        }

        self.runner
            .run(&super::systemd_start_command(LOCALKUBE_BINARY))
            .await
            .context("starting localkube")?;
        Ok(())
    }

    async fn setup_certs(&self, cfg: &KubernetesConfig) -> Result<()> {
        certs::setup_certs(self.runner.as_ref(), cfg, &self.paths).await
    }
}

/// Command-line flags encoding the cluster's desired state.
pub fn localkube_flags(cfg: &KubernetesConfig) -> Result<String> {
    // Version is validated even though localkube embeds its own components.
    versions::parse_kubernetes_version(&cfg.kubernetes_version)
        .context("parsing kubernetes version")?;

    let mut flags = format!(
        "--logtostderr=true --generate-certs=false --node-ip={ip} \
         --service-cluster-ip-range={cidr} --dns-domain={domain} --apiserver-name={api}",
        ip = cfg.node_ip,
        cidr = cfg.service_cidr,
        domain = cfg.dns_domain,
        api = cfg.api_server_name,
    );
    if !cfg.container_runtime.is_empty() {
        let _ = write!(flags, " --container-runtime={}", cfg.container_runtime);
    }
    if !cfg.feature_gates.is_empty() {
        let _ = write!(flags, " --feature-gates={}", cfg.feature_gates);
    }
    for opt in &cfg.extra_options {
        let _ = write!(
            flags,
            " --extra-config={}.{}={}",
            opt.component, opt.key, opt.value
        );
    }
    Ok(flags)
}

/// Render the localkube systemd unit around the computed flags.
pub fn localkube_systemd_unit(cfg: &KubernetesConfig) -> Result<String> {
    let flags = localkube_flags(cfg)?;
    Ok(format!(
        "\
[Unit]
Description=Localkube
Documentation=https://github.com/kubelift/kubelift

[Service]
ExecStart={}/{} {}
Restart=always
RestartSec=3

[Install]
WantedBy=multi-user.target
",
        LOCALKUBE_BINARY_DIR, LOCALKUBE_BINARY, flags
    ))
}
