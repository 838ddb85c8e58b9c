//! Fixed remote filesystem layout, local cache layout, and release URLs.

use std::path::PathBuf;

/// Profile name used when the caller does not supply one.
pub const DEFAULT_PROFILE: &str = "kubelift";

/// Remote directory that addon manifests are flattened into.
pub const ADDONS_PATH: &str = "/etc/kubernetes/addons";

/// Remote path of the kubelet systemd unit.
pub const KUBELET_SERVICE_FILE: &str = "/lib/systemd/system/kubelet.service";

/// Remote path of the kubelet systemd drop-in carrying the computed flags.
pub const KUBELET_SYSTEMD_CONF_FILE: &str =
    "/etc/systemd/system/kubelet.service.d/10-kubeadm.conf";

/// Remote path of the rendered kubeadm configuration.
pub const KUBEADM_CONFIG_FILE: &str = "/var/lib/kubeadm.yaml";

/// Remote path of the localkube systemd unit.
pub const LOCALKUBE_SERVICE_FILE: &str = "/lib/systemd/system/localkube.service";

/// Remote directory the certificate bundle is pushed into.
pub const REMOTE_CERT_PATH: &str = "/var/lib/localkube/certs";

/// Remote directory for static pod manifests.
pub const MANIFESTS_PATH: &str = "/etc/kubernetes/manifests";

pub const API_SERVER_PORT: u16 = 8443;
pub const API_SERVER_NAME: &str = "kubelift";
pub const CA_NAME: &str = "kubeliftCA";
pub const CLUSTER_DNS_DOMAIN: &str = "cluster.local";
pub const DEFAULT_SERVICE_CIDR: &str = "10.96.0.0/12";

/// SSH user baked into the boot image.
pub const SSH_USER: &str = "docker";

/// URL of a released Kubernetes binary for the given version.
pub fn kubernetes_release_url(binary: &str, version: &str) -> String {
    format!(
        "https://storage.googleapis.com/kubernetes-release/release/{}/bin/linux/amd64/{}",
        version, binary
    )
}

/// URL of the published SHA-256 checksum for a released binary.
pub fn kubernetes_release_checksum_url(binary: &str, version: &str) -> String {
    format!("{}.sha256", kubernetes_release_url(binary, version))
}

/// URL of a released localkube binary for the given version.
pub fn localkube_release_url(version: &str) -> String {
    format!(
        "https://storage.googleapis.com/kubelift/k8sReleases/{}/localkube-linux-amd64",
        version
    )
}

/// Control-plane images preloaded onto the instance when image caching is on.
pub fn kubeadm_cached_images(version: &str) -> Vec<String> {
    let mut images: Vec<String> = [
        "gcr.io/google_containers/kube-proxy-amd64",
        "gcr.io/google_containers/kube-scheduler-amd64",
        "gcr.io/google_containers/kube-controller-manager-amd64",
        "gcr.io/google_containers/kube-apiserver-amd64",
    ]
    .iter()
    .map(|img| format!("{}:{}", img, version))
    .collect();
    images.extend(
        [
            "gcr.io/google_containers/etcd-amd64:3.1.10",
            "gcr.io/google_containers/pause-amd64:3.0",
            "gcr.io/google_containers/k8s-dns-kube-dns-amd64:1.14.7",
            "gcr.io/google_containers/k8s-dns-dnsmasq-nanny-amd64:1.14.7",
            "gcr.io/google_containers/k8s-dns-sidecar-amd64:1.14.7",
        ]
        .iter()
        .map(|img| img.to_string()),
    );
    images
}

/// Host-side state directory layout.
///
/// Injected into every component that touches local state so tests can pin
/// the root to a scratch directory instead of the user's home.
#[derive(Debug, Clone)]
pub struct LocalPaths {
    root: PathBuf,
}

impl LocalPaths {
    /// State directory under the user's home (`~/.kubelift`).
    pub fn new() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            root: home.join(".kubelift"),
        }
    }

    /// State directory rooted at an explicit path.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Per-profile machine store: `<root>/machines/<profile>`.
    pub fn machine_dir(&self, profile: &str) -> PathBuf {
        self.root.join("machines").join(profile)
    }

    /// Version-keyed binary cache: `<root>/cache/<version>`.
    pub fn binary_cache_dir(&self, version: &str) -> PathBuf {
        self.root.join("cache").join(version)
    }

    /// Cached image tarballs: `<root>/cache/images`.
    pub fn image_cache_dir(&self) -> PathBuf {
        self.root.join("cache").join("images")
    }

    /// User-managed addon manifests mirrored into the remote addons dir.
    pub fn addons_dir(&self) -> PathBuf {
        self.root.join("addons")
    }

    /// Generic file-drop root mirrored to absolute remote paths.
    pub fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    /// Persisted configuration map.
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config").join("config.json")
    }

    /// A certificate or key at the state-dir root (e.g. `ca.crt`).
    pub fn cert_file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Default for LocalPaths {
    fn default() -> Self {
        Self::new()
    }
}
