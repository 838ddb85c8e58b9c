//! File payloads pushed onto the instance, and the addon registry.
//!
//! A [`CopyableFile`] pairs a payload (on-disk file or in-memory bytes) with
//! a target directory, file name, and permission string. Permission strings
//! are normalized to 4-character octal at construction, so writers never see
//! a bare "640".

use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::{self, ConfigMap};
use crate::constants::{self, LocalPaths};

/// Where a payload's bytes come from.
#[derive(Debug, Clone)]
pub enum AssetSource {
    /// Read from the local filesystem at copy time.
    File(PathBuf),
    /// Generated in-process, e.g. a rendered template.
    Memory(Vec<u8>),
}

/// A single file to be placed on the instance.
#[derive(Debug, Clone)]
pub struct CopyableFile {
    source: AssetSource,
    target_dir: String,
    target_name: String,
    permissions: String,
}

impl CopyableFile {
    /// Payload backed by a local file. Fails if the file does not exist.
    pub fn from_file(
        path: impl Into<PathBuf>,
        target_dir: &str,
        target_name: &str,
        permissions: &str,
    ) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            bail!("asset source {} does not exist", path.display());
        }
        Ok(Self {
            source: AssetSource::File(path),
            target_dir: target_dir.to_string(),
            target_name: target_name.to_string(),
            permissions: normalize_permissions(permissions),
        })
    }

    /// Payload generated in-process, addressed by its full target path.
    pub fn from_memory(data: impl Into<Vec<u8>>, target_path: &str, permissions: &str) -> Self {
        let path = Path::new(target_path);
        let target_dir = path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        let target_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            source: AssetSource::Memory(data.into()),
            target_dir,
            target_name,
            permissions: normalize_permissions(permissions),
        }
    }

    pub fn target_dir(&self) -> &str {
        &self.target_dir
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Full target path on the instance.
    pub fn target_path(&self) -> String {
        format!(
            "{}/{}",
            self.target_dir.trim_end_matches('/'),
            self.target_name
        )
    }

    /// Normalized 4-character octal permission string.
    pub fn permissions(&self) -> &str {
        &self.permissions
    }

    /// Resolve the payload bytes.
    pub fn contents(&self) -> Result<Vec<u8>> {
        match &self.source {
            AssetSource::File(path) => std::fs::read(path)
                .with_context(|| format!("reading asset source {}", path.display())),
            AssetSource::Memory(data) => Ok(data.clone()),
        }
    }
}

/// Restore the leading zero an octal format strips from 3-digit modes.
fn normalize_permissions(perm: &str) -> String {
    if perm.len() == 3 {
        format!("0{}", perm)
    } else {
        perm.to_string()
    }
}

/// Add the two state-dir trees to `files`.
///
/// `<root>/addons` is flattened into the fixed remote addons directory;
/// `<root>/files` is mirrored to absolute remote paths following its
/// relative structure. Only leaf files are emitted, each with its source
/// mode reformatted to 4-digit octal.
pub fn add_state_dir_assets(paths: &LocalPaths, files: &mut Vec<CopyableFile>) -> Result<()> {
    add_dir_to_assets(&paths.addons_dir(), Some(constants::ADDONS_PATH), files)
        .context("adding addons dir to assets")?;
    add_dir_to_assets(&paths.files_dir(), None, files).context("adding files dir to assets")?;
    Ok(())
}

/// Walk `base` and append one file asset per leaf file.
///
/// With `vm_dir` set, every file lands in that directory (flattened).
/// Without it, files map to `/<relative parent>/<name>`. An absent `base`
/// contributes nothing.
fn add_dir_to_assets(
    base: &Path,
    vm_dir: Option<&str>,
    files: &mut Vec<CopyableFile>,
) -> Result<()> {
    if !base.is_dir() {
        return Ok(());
    }
    walk_dir(base, base, vm_dir, files)
}

fn walk_dir(
    base: &Path,
    dir: &Path,
    vm_dir: Option<&str>,
    files: &mut Vec<CopyableFile>,
) -> Result<()> {
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("reading dir {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_dir(base, &path, vm_dir, files)?;
            continue;
        }

        let target_dir = match vm_dir {
            Some(d) => d.to_string(),
            None => {
                let rel = path
                    .strip_prefix(base)
                    .with_context(|| format!("relativizing {}", path.display()))?;
                match rel.parent() {
                    Some(parent) if parent != Path::new("") => {
                        format!("/{}", parent.to_string_lossy())
                    }
                    _ => "/".to_string(),
                }
            }
        };

        let mode = entry.metadata()?.permissions().mode() & 0o777;
        let perm = format!("{:o}", mode);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        files.push(CopyableFile::from_file(&path, &target_dir, &name, &perm)?);
    }
    Ok(())
}

/// A named, independently switchable bundle of manifests.
///
/// Addons are immutable after registration; the effective enabled state is
/// recomputed on every query from the persisted configuration map.
#[derive(Debug, Clone)]
pub struct Addon {
    name: String,
    enabled_by_default: bool,
    pub assets: Vec<CopyableFile>,
}

impl Addon {
    pub fn new(name: &str, enabled_by_default: bool, assets: Vec<CopyableFile>) -> Self {
        Self {
            name: name.to_string(),
            enabled_by_default,
            assets,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stored boolean override wins; absent or unparseable falls back to
    /// the compile-time default.
    pub fn is_enabled(&self, config: &ConfigMap) -> bool {
        config::get_bool(config, &self.name).unwrap_or(self.enabled_by_default)
    }
}

/// Manifest payload bytes supplied by the embedding layer, keyed by the
/// bundle-relative source path (e.g. `dashboard/dashboard-dp.yaml`).
pub type AddonPayloads = HashMap<String, Vec<u8>>;

/// Addon name whose DNS manifests conflict with kubeadm's bundled DNS.
pub const KUBE_DNS_ADDON: &str = "kube-dns";

struct AddonSpec {
    name: &'static str,
    enabled: bool,
    manifests: &'static [&'static str],
}

/// Compile-time addon table. Only the payload bytes come from outside.
const ADDON_SPECS: &[AddonSpec] = &[
    AddonSpec {
        name: "addon-manager",
        enabled: true,
        manifests: &["addon-manager.yaml"],
    },
    AddonSpec {
        name: "dashboard",
        enabled: true,
        manifests: &["dashboard/dashboard-dp.yaml", "dashboard/dashboard-svc.yaml"],
    },
    AddonSpec {
        name: "default-storageclass",
        enabled: true,
        manifests: &["storageclass/storageclass.yaml"],
    },
    AddonSpec {
        name: "storage-provisioner",
        enabled: true,
        manifests: &["storage-provisioner/storage-provisioner.yaml"],
    },
    AddonSpec {
        name: "kube-dns",
        enabled: true,
        manifests: &[
            "kube-dns/kube-dns-controller.yaml",
            "kube-dns/kube-dns-cm.yaml",
            "kube-dns/kube-dns-svc.yaml",
        ],
    },
    AddonSpec {
        name: "coredns",
        enabled: false,
        manifests: &[
            "coredns/coreDNS-controller.yaml",
            "coredns/coreDNS-configmap.yaml",
            "coredns/coreDNS-svc.yaml",
            "coredns/coreDNS-crbinding.yaml",
            "coredns/coreDNS-sa.yaml",
            "coredns/coreDNS-clusterrole.yaml",
        ],
    },
    AddonSpec {
        name: "heapster",
        enabled: false,
        manifests: &[
            "heapster/influx-grafana-rc.yaml",
            "heapster/grafana-svc.yaml",
            "heapster/influxdb-svc.yaml",
            "heapster/heapster-rc.yaml",
            "heapster/heapster-svc.yaml",
        ],
    },
    AddonSpec {
        name: "efk",
        enabled: false,
        manifests: &[
            "efk/elasticsearch-rc.yaml",
            "efk/elasticsearch-svc.yaml",
            "efk/fluentd-es-rc.yaml",
            "efk/fluentd-es-configmap.yaml",
            "efk/kibana-rc.yaml",
            "efk/kibana-svc.yaml",
        ],
    },
    AddonSpec {
        name: "ingress",
        enabled: false,
        manifests: &[
            "ingress/ingress-configmap.yaml",
            "ingress/ingress-rc.yaml",
            "ingress/ingress-svc.yaml",
        ],
    },
    AddonSpec {
        name: "registry",
        enabled: false,
        manifests: &["registry/registry-rc.yaml", "registry/registry-svc.yaml"],
    },
    AddonSpec {
        name: "registry-creds",
        enabled: false,
        manifests: &["registry-creds/registry-creds-rc.yaml"],
    },
    AddonSpec {
        name: "freshpod",
        enabled: false,
        manifests: &["freshpod/freshpod-rc.yaml"],
    },
];

/// Build the registered addon set from the supplied payloads.
///
/// Every manifest named in the table must have a payload; a missing entry
/// is a registration error, not a silently thinner addon. The addon-manager
/// manifest lands in the static-pod manifests directory, everything else in
/// the addons directory.
pub fn default_addons(payloads: &AddonPayloads) -> Result<Vec<Addon>> {
    let mut addons = Vec::with_capacity(ADDON_SPECS.len());
    for spec in ADDON_SPECS {
        let mut assets = Vec::with_capacity(spec.manifests.len());
        for manifest in spec.manifests {
            let data = payloads
                .get(*manifest)
                .with_context(|| format!("addon {}: payload {} not supplied", spec.name, manifest))?;
            let file_name = Path::new(manifest)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| manifest.to_string());
            let target_dir = if spec.name == "addon-manager" {
                constants::MANIFESTS_PATH
            } else {
                constants::ADDONS_PATH
            };
            assets.push(CopyableFile::from_memory(
                data.clone(),
                &format!("{}/{}", target_dir, file_name),
                "0640",
            ));
        }
        addons.push(Addon::new(spec.name, spec.enabled, assets));
    }
    Ok(addons)
}
