//! Cluster installation via the standard cluster-init tool.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::versions::{self, KUBELET};
use super::{Bootstrapper, KubernetesConfig};
use crate::assets::{self, Addon, CopyableFile};
use crate::certs;
use crate::config::ConfigMap;
use crate::constants::{self, LocalPaths};
use crate::download::cached_fetch;
use crate::images;
use crate::retry::retry_after;
use crate::runner::CommandRunner;

const KUBECTL: &str = "sudo /usr/bin/kubectl --kubeconfig=/etc/kubernetes/admin.conf";

const CONVERGE_ATTEMPTS: usize = 100;
const CONVERGE_DELAY: Duration = Duration::from_millis(500);

/// The kubelet unit itself is static; the computed flags live in the
/// systemd drop-in next to it.
const KUBELET_SERVICE: &str = "\
[Unit]
Description=kubelet: The Kubernetes Node Agent
Documentation=http://kubernetes.io/docs/

[Service]
ExecStart=/usr/bin/kubelet
Restart=always
StartLimitInterval=0
RestartSec=10

[Install]
WantedBy=multi-user.target
";

pub struct KubeadmBootstrapper {
    runner: Arc<dyn CommandRunner>,
    paths: LocalPaths,
    addons: Vec<Addon>,
    config_map: ConfigMap,
}

impl KubeadmBootstrapper {
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

    /// Fetch one release binary through the cache and push it to /usr/bin.
    async fn fetch_and_push_binary(&self, binary: &str, version: &str) -> Result<()> {
        let url = constants::kubernetes_release_url(binary, version);
        let checksum_url = constants::kubernetes_release_checksum_url(binary, version);
        let path = cached_fetch(binary, version, &url, Some(&checksum_url), &self.paths)
            .await
            .with_context(|| format!("downloading {}", binary))?;
        let file = CopyableFile::from_file(path, "/usr/bin", binary, "0641")
            .context("making new file asset")?;
        self.runner
            .copy(&file)
            .await
            .with_context(|| format!("transferring {} binary", binary))?;
        Ok(())
    }

    /// Allow workloads on the single node by clearing its control-plane
    /// taints. Retried because the API server may still be coming up.
    async fn unmark_master(&self, node_name: &str) -> Result<()> {
        let cmd = format!(
            r#"{} patch node {} -p '{{"spec":{{"taints":[]}}}}'"#,
            KUBECTL, node_name
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
        .context("timed out waiting to unmark master")
    }

    /// Grant kube-system service accounts cluster-admin so the bundled
    /// addons can run. Retried like the unmark step; an already-present
    /// binding counts as success.
    async fn elevate_kube_system_privileges(&self) -> Result<()> {
        let cmd = format!(
            "{} create clusterrolebinding kube-system-cluster-admin \
             --clusterrole=cluster-admin --serviceaccount=kube-system:default",
            KUBECTL
        );
        let runner = &*self.runner;
        retry_after(CONVERGE_ATTEMPTS, CONVERGE_DELAY, || {
            let cmd = cmd.clone();
            async move {
                match runner.combined_output(&cmd).await {
                    Ok(_) => Ok(()),
                    Err(e) if e.to_string().contains("already exists") => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
        })
        .await
        .context("timed out waiting to elevate kube-system RBAC privileges")
    }

    /// A restart can leave kube-proxy stale relative to the restored
    /// control plane; deleting its pods makes the DaemonSet resynchronize.
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
impl Bootstrapper for KubeadmBootstrapper {
    async fn get_cluster_status(&self) -> Result<String> {
        let status = self
            .runner
            .combined_output(&super::status_probe_command("kubelet"))
            .await
            .context("getting status")?;
        super::parse_cluster_status(&status)
    }

    async fn get_cluster_logs(&self, follow: bool) -> Result<String> {
        let cmd = super::logs_command("kubelet", follow);
        if follow {
            // Streaming session: output goes straight to the caller's
            // stdio until the session ends.
            self.runner.run(&cmd).await.context("getting shell")?;
            return Ok(String::new());
        }
        self.runner
            .combined_output(&cmd)
            .await
            .context("getting cluster logs")
    }

    async fn start_cluster(&self, cfg: &KubernetesConfig) -> Result<()> {
        // Preflight checks are skipped: the addon manifests this crate
        // drops into the manifests directory are not kubeadm's own.
        let init = format!(
            "sudo /usr/bin/kubeadm init --config {} --skip-preflight-checks",
            constants::KUBEADM_CONFIG_FILE
        );
        self.runner
            .run(&init)
            .await
            .with_context(|| format!("kubeadm init error running command: {}", init))?;

        self.unmark_master(&cfg.node_name).await?;
        self.elevate_kube_system_privileges().await?;
        Ok(())
    }

    async fn restart_cluster(&self, _cfg: &KubernetesConfig) -> Result<()> {
        // Replay the control-plane phases from the config already on the
        // instance instead of regenerating it.
        let c = constants::KUBEADM_CONFIG_FILE;
        let restore = format!(
            "sudo /usr/bin/kubeadm alpha phase certs all --config {c} && \
             sudo /usr/bin/kubeadm alpha phase kubeconfig all --config {c} && \
             sudo /usr/bin/kubeadm alpha phase controlplane all --config {c} && \
             sudo /usr/bin/kubeadm alpha phase etcd local --config {c}",
        );
        self.runner
            .run(&restore)
            .await
            .with_context(|| format!("running cmd: {}", restore))?;

        self.restart_kube_proxy().await
    }

    async fn update_cluster(&self, cfg: &KubernetesConfig) -> Result<()> {
        if cfg.should_load_cached_images {
            // Best effort, detached from the critical path; failure is
            // logged and intentionally lost.
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

        let kubeadm_cfg = generate_kubeadm_config(cfg).context("generating kubeadm cfg")?;
        let kubelet_cfg = new_kubelet_config(cfg).context("generating kubelet config")?;

        let mut files = vec![
            CopyableFile::from_memory(
                KUBELET_SERVICE.as_bytes().to_vec(),
                constants::KUBELET_SERVICE_FILE,
                "0640",
            ),
            CopyableFile::from_memory(
                kubelet_cfg.into_bytes(),
                constants::KUBELET_SYSTEMD_CONF_FILE,
                "0640",
            ),
            CopyableFile::from_memory(
                kubeadm_cfg.into_bytes(),
                constants::KUBEADM_CONFIG_FILE,
                "0640",
            ),
        ];

        // Both binaries resolve concurrently; a single failure fails the
        // whole update, wrapped with which binary it was.
        tokio::try_join!(
            self.fetch_and_push_binary("kubelet", &cfg.kubernetes_version),
            self.fetch_and_push_binary("kubeadm", &cfg.kubernetes_version),
        )
        .context("downloading binaries")?;

        files.extend(
            super::collect_addons(
                &self.paths,
                &self.addons,
                &self.config_map,
                // kubeadm ships its own DNS; the generic addon stays home.
                Some(assets::KUBE_DNS_ADDON),
            )
            .context("adding addons to copyable files")?,
        );

        for file in &files {
            self.runner
                .copy(file)
                .await
                .with_context(|| format!("transferring kubeadm file {}", file.target_path()))?;
        }

        self.runner
            .run(&super::systemd_start_command("kubelet"))
            .await
            .context("starting kubelet")?;
        Ok(())
    }

    async fn setup_certs(&self, cfg: &KubernetesConfig) -> Result<()> {
        certs::setup_certs(self.runner.as_ref(), cfg, &self.paths).await
    }
}

/// Render the kubelet systemd drop-in from the resolved flag set.
pub fn new_kubelet_config(cfg: &KubernetesConfig) -> Result<String> {
    let version = versions::parse_kubernetes_version(&cfg.kubernetes_version)
        .context("parsing kubernetes version")?;

    let mut extra_opts =
        versions::extra_config_for_component(KUBELET, &cfg.extra_options, &version)
            .context("generating extra configuration for kubelet")?;
    versions::set_container_runtime(&mut extra_opts, &cfg.container_runtime);
    let mut extra_flags = versions::convert_to_flags(&extra_opts);
    if !cfg.feature_gates.is_empty() {
        let _ = write!(extra_flags, " --feature-gates={}", cfg.feature_gates);
    }

    Ok(format!(
        "\
[Service]
ExecStart=
ExecStart=/usr/bin/kubelet {}

[Install]
",
        extra_flags
    ))
}

/// Render the kubeadm master configuration.
pub fn generate_kubeadm_config(cfg: &KubernetesConfig) -> Result<String> {
    let version = versions::parse_kubernetes_version(&cfg.kubernetes_version)
        .context("parsing kubernetes version")?;

    let extra_component_config =
        versions::new_component_extra_args(&cfg.extra_options, &version, &cfg.feature_gates)
            .context("generating extra component config for kubeadm")?;

    let mut out = String::new();
    let _ = write!(
        out,
        "\
apiVersion: kubeadm.k8s.io/v1alpha1
kind: MasterConfiguration
api:
  advertiseAddress: {ip}
  bindPort: {port}
kubernetesVersion: {version}
certificatesDir: {cert_dir}
networking:
  serviceSubnet: {cidr}
etcd:
  dataDir: /data
nodeName: {node}
",
        ip = cfg.node_ip,
        port = constants::API_SERVER_PORT,
        version = cfg.kubernetes_version,
        cert_dir = constants::REMOTE_CERT_PATH,
        cidr = cfg.service_cidr,
        node = cfg.node_name,
    );
    for component in &extra_component_config {
        let _ = writeln!(out, "{}:", component.kubeadm_config_key);
        for (key, value) in &component.options {
            let _ = writeln!(out, "  {}: \"{}\"", key, value);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrapper::ExtraOption;
    use crate::testutil::FakeRunner;
    use serde_json::json;

    fn bootstrapper_with(
        runner: FakeRunner,
        paths: LocalPaths,
        addons: Vec<Addon>,
        config_map: ConfigMap,
    ) -> KubeadmBootstrapper {
        KubeadmBootstrapper::new(Arc::new(runner), paths, addons, config_map)
    }

    fn test_config() -> KubernetesConfig {
        KubernetesConfig {
            node_ip: "192.168.64.4".to_string(),
            node_name: "kubelift".to_string(),
            ..KubernetesConfig::default()
        }
    }

    fn seed_binary_cache(paths: &LocalPaths, version: &str) {
        let cache = paths.binary_cache_dir(version);
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("kubelet"), b"kubelet-bin").unwrap();
        std::fs::write(cache.join("kubeadm"), b"kubeadm-bin").unwrap();
    }

    fn memory_addon(name: &str, enabled: bool) -> Addon {
        let file = CopyableFile::from_memory(
            b"manifest".to_vec(),
            &format!("{}/{}.yaml", constants::ADDONS_PATH, name),
            "0640",
        );
        Addon::new(name, enabled, vec![file])
    }

    #[tokio::test]
    async fn cluster_status_maps_the_two_recognized_outputs() {
        let dir = tempfile::tempdir().unwrap();
        for (probe_output, expected) in [("Running\n", "Running"), ("Stopped\n", "Stopped")] {
            let runner = FakeRunner::new();
            runner.expect(&crate::bootstrapper::status_probe_command("kubelet"), probe_output);
            let k = bootstrapper_with(
                runner,
                LocalPaths::with_root(dir.path()),
                vec![],
                ConfigMap::new(),
            );
            assert_eq!(k.get_cluster_status().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn unrecognized_status_output_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new();
        runner.expect(
            &crate::bootstrapper::status_probe_command("kubelet"),
            "degraded\n",
        );
        let k = bootstrapper_with(
            runner,
            LocalPaths::with_root(dir.path()),
            vec![],
            ConfigMap::new(),
        );
        let err = k.get_cluster_status().await.unwrap_err();
        assert!(err.to_string().contains("unrecognized cluster status"));
    }

    #[tokio::test]
    async fn logs_snapshot_and_streaming_use_journalctl() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new();
        runner.expect("sudo journalctl -u kubelet", "some log lines");
        let k = bootstrapper_with(
            runner,
            LocalPaths::with_root(dir.path()),
            vec![],
            ConfigMap::new(),
        );
        assert_eq!(k.get_cluster_logs(false).await.unwrap(), "some log lines");
    }

    #[tokio::test]
    async fn following_logs_opens_a_streaming_session() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let k = KubeadmBootstrapper::new(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            LocalPaths::with_root(dir.path()),
            vec![],
            ConfigMap::new(),
        );
        k.get_cluster_logs(true).await.unwrap();
        assert!(runner.ran_command_containing("journalctl -f -u kubelet"));
    }

    #[test]
    fn kubelet_config_defaults_only_path_for_empty_runtime() {
        let cfg = test_config();
        let rendered = new_kubelet_config(&cfg).unwrap();
        assert!(rendered.contains("--cgroup-driver=cgroupfs"));
        assert!(rendered.contains("--kubeconfig=/etc/kubernetes/kubelet.conf"));
        assert!(rendered.contains("--fail-swap-on=false"));
        // Empty runtime means the defaults table alone decides.
        assert!(!rendered.contains("container-runtime=remote"));
    }

    #[test]
    fn kubelet_config_maps_crio_to_the_remote_runtime() {
        let cfg = KubernetesConfig {
            container_runtime: "crio".to_string(),
            ..test_config()
        };
        let rendered = new_kubelet_config(&cfg).unwrap();
        assert!(rendered.contains("--container-runtime=remote"));
        assert!(rendered.contains("--container-runtime-endpoint=/var/run/crio.sock"));
    }

    #[test]
    fn kubelet_config_appends_feature_gates() {
        let cfg = KubernetesConfig {
            feature_gates: "StreamingProxyRedirects=true".to_string(),
            ..test_config()
        };
        let rendered = new_kubelet_config(&cfg).unwrap();
        assert!(rendered.contains("--feature-gates=StreamingProxyRedirects=true"));
    }

    #[test]
    fn kubeadm_config_renders_cluster_identity_and_extra_args() {
        let cfg = KubernetesConfig {
            extra_options: vec![ExtraOption::new("apiserver", "v", "9")],
            ..test_config()
        };
        let rendered = generate_kubeadm_config(&cfg).unwrap();
        assert!(rendered.contains("advertiseAddress: 192.168.64.4"));
        assert!(rendered.contains("kubernetesVersion: v1.9.0"));
        assert!(rendered.contains("nodeName: kubelift"));
        assert!(rendered.contains("apiServerExtraArgs:"));
        assert!(rendered.contains("  v: \"9\""));
    }

    #[test]
    fn kubeadm_config_rejects_unknown_components() {
        let cfg = KubernetesConfig {
            extra_options: vec![ExtraOption::new("etcd", "x", "y")],
            ..test_config()
        };
        assert!(generate_kubeadm_config(&cfg).is_err());
    }

    #[tokio::test]
    async fn update_cluster_pushes_configs_binaries_and_addons() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LocalPaths::with_root(dir.path());
        let cfg = test_config();
        seed_binary_cache(&paths, &cfg.kubernetes_version);

        let addons = vec![memory_addon("kube-dns", true), memory_addon("dashboard", true)];
        let runner = Arc::new(FakeRunner::new());
        let k = KubeadmBootstrapper::new(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            paths,
            addons,
            ConfigMap::new(),
        );

        k.update_cluster(&cfg).await.unwrap();

        let copied = runner.copied_files();
        assert!(copied.contains(&"/usr/bin/kubelet".to_string()));
        assert!(copied.contains(&"/usr/bin/kubeadm".to_string()));
        assert!(copied.contains(&constants::KUBELET_SERVICE_FILE.to_string()));
        assert!(copied.contains(&constants::KUBELET_SYSTEMD_CONF_FILE.to_string()));
        assert!(copied.contains(&constants::KUBEADM_CONFIG_FILE.to_string()));
        assert!(copied.contains(&format!("{}/dashboard.yaml", constants::ADDONS_PATH)));
        // kubeadm is authoritative over DNS: kube-dns never ships here,
        // even though its enabled flag is true.
        assert!(!copied.contains(&format!("{}/kube-dns.yaml", constants::ADDONS_PATH)));

        assert!(runner.ran_command_containing("sudo systemctl start kubelet"));
    }

    #[tokio::test]
    async fn update_cluster_respects_addon_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LocalPaths::with_root(dir.path());
        let cfg = test_config();
        seed_binary_cache(&paths, &cfg.kubernetes_version);

        let addons = vec![memory_addon("dashboard", true), memory_addon("heapster", false)];
        let mut config_map = ConfigMap::new();
        config_map.insert("dashboard".to_string(), json!(false));
        config_map.insert("heapster".to_string(), json!(true));

        let runner = Arc::new(FakeRunner::new());
        let k = KubeadmBootstrapper::new(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            paths,
            addons,
            config_map,
        );
        k.update_cluster(&cfg).await.unwrap();

        let copied = runner.copied_files();
        assert!(!copied.contains(&format!("{}/dashboard.yaml", constants::ADDONS_PATH)));
        assert!(copied.contains(&format!("{}/heapster.yaml", constants::ADDONS_PATH)));
    }

    #[tokio::test]
    async fn update_cluster_fails_when_service_start_fails() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LocalPaths::with_root(dir.path());
        let cfg = test_config();
        seed_binary_cache(&paths, &cfg.kubernetes_version);

        let runner = FakeRunner::new();
        runner.fail_matching("systemctl start kubelet");
        let k = bootstrapper_with(runner, paths, vec![], ConfigMap::new());

        let err = k.update_cluster(&cfg).await.unwrap_err();
        assert!(err.to_string().contains("starting kubelet"));
    }

    #[tokio::test]
    async fn restart_restores_existing_config_and_resyncs_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let k = KubeadmBootstrapper::new(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            LocalPaths::with_root(dir.path()),
            vec![],
            ConfigMap::new(),
        );

        k.restart_cluster(&test_config()).await.unwrap();

        assert!(runner.ran_command_containing("kubeadm alpha phase controlplane all"));
        // No regeneration: the config referenced is the one on the instance.
        assert!(runner.ran_command_containing(constants::KUBEADM_CONFIG_FILE));

        // The data plane is resynchronized only after the restore.
        let cmds = runner.commands();
        let restore = cmds
            .iter()
            .position(|c| c.contains("alpha phase"))
            .unwrap();
        let proxy = cmds
            .iter()
            .position(|c| c.contains("delete pods -n kube-system -l k8s-app=kube-proxy"))
            .unwrap();
        assert!(restore < proxy);
    }
}
