//! Version-aware component flag resolution.
//!
//! A table of versioned default options is filtered by target version and
//! merged with user overrides. Defaults may never silently collide: two
//! rules assigning different values to the same flag for the same
//! component and version are a hard error. Only explicit user overrides
//! win over defaults.

use anyhow::{Context, Result, bail};
use semver::Version;
use std::collections::BTreeMap;
use tracing::info;

// Components configurable through extra options.
pub const KUBELET: &str = "kubelet";
pub const APISERVER: &str = "apiserver";
pub const SCHEDULER: &str = "scheduler";
pub const CONTROLLER_MANAGER: &str = "controller-manager";

/// A user-supplied (component, key, value) flag override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraOption {
    pub component: String,
    pub key: String,
    pub value: String,
}

impl ExtraOption {
    pub fn new(component: &str, key: &str, value: &str) -> Self {
        Self {
            component: component.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// A default flag bound to an inclusive version range.
///
/// Both bounds optional: absent bounds apply the flag to all versions, and
/// equal bounds pin it to exactly one version.
#[derive(Debug, Clone)]
pub struct VersionedExtraOption {
    pub option: ExtraOption,
    pub less_than_or_equal: Option<Version>,
    pub greater_than_or_equal: Option<Version>,
}

impl VersionedExtraOption {
    /// A default applied to every version.
    pub fn unversioned(component: &str, key: &str, value: &str) -> Self {
        Self {
            option: ExtraOption::new(component, key, value),
            less_than_or_equal: None,
            greater_than_or_equal: None,
        }
    }

    pub fn since(component: &str, key: &str, value: &str, gte: Version) -> Self {
        Self {
            option: ExtraOption::new(component, key, value),
            less_than_or_equal: None,
            greater_than_or_equal: Some(gte),
        }
    }
}

/// The built-in default-flags table.
fn version_specific_opts() -> Vec<VersionedExtraOption> {
    let v = |s: &str| Version::parse(s).expect("static version");
    vec![
        VersionedExtraOption::since(KUBELET, "fail-swap-on", "false", v("1.8.0-alpha.0")),
        // Kubeconfig args
        VersionedExtraOption::unversioned(KUBELET, "kubeconfig", "/etc/kubernetes/kubelet.conf"),
        VersionedExtraOption::unversioned(
            KUBELET,
            "bootstrap-kubeconfig",
            "/etc/kubernetes/bootstrap-kubelet.conf",
        ),
        VersionedExtraOption::unversioned(KUBELET, "require-kubeconfig", "true"),
        // System pods args
        VersionedExtraOption::unversioned(
            KUBELET,
            "pod-manifest-path",
            "/etc/kubernetes/manifests",
        ),
        VersionedExtraOption::unversioned(KUBELET, "allow-privileged", "true"),
        // Network args
        VersionedExtraOption::unversioned(KUBELET, "cluster-dns", "10.96.0.10"),
        VersionedExtraOption::unversioned(KUBELET, "cluster-domain", "cluster.local"),
        // Auth args
        VersionedExtraOption::unversioned(KUBELET, "authorization-mode", "Webhook"),
        VersionedExtraOption::unversioned(
            KUBELET,
            "client-ca-file",
            "/var/lib/localkube/certs/ca.crt",
        ),
        // Cgroup args
        VersionedExtraOption::unversioned(KUBELET, "cadvisor-port", "0"),
        VersionedExtraOption::unversioned(KUBELET, "cgroup-driver", "cgroupfs"),
    ]
}

/// Strip the conventional leading `v` and parse as semver.
pub fn parse_kubernetes_version(version: &str) -> Result<Version> {
    let stripped = version.strip_prefix('v').unwrap_or(version);
    Version::parse(stripped)
        .with_context(|| format!("parsing kubernetes version {}", version))
}

pub fn version_is_between(version: &Version, gte: Option<&Version>, lte: Option<&Version>) -> bool {
    if let Some(gte) = gte
        && version < gte
    {
        return false;
    }
    if let Some(lte) = lte
        && version > lte
    {
        return false;
    }
    true
}

/// Defaults for one component at one version, from the built-in table.
///
/// Overlapping rules that agree merge; rules that disagree fail rather
/// than letting the last writer win.
pub fn default_options_for_component_and_version(
    component: &str,
    version: &Version,
) -> Result<BTreeMap<String, String>> {
    default_options_from_table(&version_specific_opts(), component, version)
}

fn default_options_from_table(
    table: &[VersionedExtraOption],
    component: &str,
    version: &Version,
) -> Result<BTreeMap<String, String>> {
    let mut versioned_opts = BTreeMap::new();
    for rule in table {
        if rule.option.component != component
            || !version_is_between(
                version,
                rule.greater_than_or_equal.as_ref(),
                rule.less_than_or_equal.as_ref(),
            )
        {
            continue;
        }
        if let Some(existing) = versioned_opts.get(&rule.option.key)
            && existing != &rule.option.value
        {
            bail!(
                "conflicting defaults for {}: flag {}={} already set to {}",
                component,
                rule.option.key,
                rule.option.value,
                existing
            );
        }
        versioned_opts.insert(rule.option.key.clone(), rule.option.value.clone());
    }
    Ok(versioned_opts)
}

/// Flag map for a component: version-filtered defaults, then user
/// overrides applied key-by-key. Shadowing a default is logged, not an
/// error.
pub fn extra_config_for_component(
    component: &str,
    opts: &[ExtraOption],
    version: &Version,
) -> Result<BTreeMap<String, String>> {
    let mut versioned_opts = default_options_for_component_and_version(component, version)
        .with_context(|| format!("setting version specific options for {}", component))?;

    for opt in opts {
        if opt.component == component {
            if let Some(existing) = versioned_opts.get(&opt.key) {
                info!(
                    "overwriting default {}={} with user provided {}={} for component {}",
                    opt.key, existing, opt.key, opt.value, component
                );
            }
            versioned_opts.insert(opt.key.clone(), opt.value.clone());
        }
    }
    Ok(versioned_opts)
}

/// A component's extra args keyed the way the kubeadm config spells it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentExtraArgs {
    pub kubeadm_config_key: String,
    pub options: BTreeMap<String, String>,
}

/// The kubelet is configured through systemd, not the kubeadm config, so
/// its key is empty.
fn component_to_kubeadm_config_key(component: &str) -> Option<&'static str> {
    match component {
        APISERVER => Some("apiServerExtraArgs"),
        CONTROLLER_MANAGER => Some("controllerManagerExtraArgs"),
        SCHEDULER => Some("schedulerExtraArgs"),
        KUBELET => Some(""),
        _ => None,
    }
}

const KNOWN_COMPONENTS: &[&str] = &[APISERVER, CONTROLLER_MANAGER, KUBELET, SCHEDULER];

/// Per-component extra args for the kubeadm config.
///
/// Rejects any override naming an unknown component before any config is
/// generated. A non-empty feature-gate string is injected into every
/// component that accepts one.
pub fn new_component_extra_args(
    opts: &[ExtraOption],
    version: &Version,
    feature_gates: &str,
) -> Result<Vec<ComponentExtraArgs>> {
    for opt in opts {
        if component_to_kubeadm_config_key(&opt.component).is_none() {
            bail!(
                "unknown component {}. Valid components are {:?}",
                opt.component,
                KNOWN_COMPONENTS
            );
        }
    }

    let mut kubeadm_extra_args = Vec::new();
    for component in KNOWN_COMPONENTS {
        let key = component_to_kubeadm_config_key(component).expect("known component");
        if key.is_empty() {
            continue;
        }
        let mut extra_config = extra_config_for_component(component, opts, version)
            .with_context(|| format!("getting kubeadm extra args for {}", component))?;
        if !feature_gates.is_empty() {
            extra_config.insert("feature-gates".to_string(), feature_gates.to_string());
        }
        if !extra_config.is_empty() {
            kubeadm_extra_args.push(ComponentExtraArgs {
                kubeadm_config_key: key.to_string(),
                options: extra_config,
            });
        }
    }

    Ok(kubeadm_extra_args)
}

/// Render a flag map as `--key=value` pairs, sorted for determinism.
pub fn convert_to_flags(opts: &BTreeMap<String, String>) -> String {
    opts.iter()
        .map(|(k, v)| format!("--{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Possibly set the container runtime flags, if the extra-config options
/// have not already pinned them. Known runtimes get a working default set.
pub fn set_container_runtime(cfg: &mut BTreeMap<String, String>, runtime: &str) {
    if cfg.contains_key("container-runtime") {
        info!("container runtime already set through extra options, ignoring runtime flag");
        return;
    }
    if runtime.is_empty() {
        info!("container runtime flag provided with no value, using defaults");
        return;
    }
    match runtime {
        "crio" | "cri-o" => {
            cfg.insert("container-runtime".into(), "remote".into());
            cfg.insert(
                "container-runtime-endpoint".into(),
                "/var/run/crio.sock".into(),
            );
            cfg.insert("image-service-endpoint".into(), "/var/run/crio.sock".into());
            cfg.insert("runtime-request-timeout".into(), "15m".into());
        }
        other => {
            cfg.insert("container-runtime".into(), other.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn parses_versions_with_and_without_prefix() {
        assert_eq!(parse_kubernetes_version("v1.9.0").unwrap(), v("1.9.0"));
        assert_eq!(parse_kubernetes_version("1.8.0").unwrap(), v("1.8.0"));
        assert!(parse_kubernetes_version("not-a-version").is_err());
    }

    #[test]
    fn version_between_honors_optional_bounds() {
        let target = v("1.8.0");
        assert!(version_is_between(&target, None, None));
        assert!(version_is_between(&target, Some(&v("1.8.0")), Some(&v("1.8.0"))));
        assert!(version_is_between(&target, Some(&v("1.7.0")), None));
        assert!(!version_is_between(&target, Some(&v("1.9.0")), None));
        assert!(!version_is_between(&target, None, Some(&v("1.7.0"))));
    }

    #[test]
    fn kubelet_defaults_include_fail_swap_on_since_1_8() {
        let defaults =
            default_options_for_component_and_version(KUBELET, &v("1.9.0")).unwrap();
        assert_eq!(defaults.get("fail-swap-on").map(String::as_str), Some("false"));
        assert_eq!(
            defaults.get("cgroup-driver").map(String::as_str),
            Some("cgroupfs")
        );

        let defaults =
            default_options_for_component_and_version(KUBELET, &v("1.7.0")).unwrap();
        assert!(!defaults.contains_key("fail-swap-on"));
    }

    #[test]
    fn conflicting_defaults_in_overlapping_ranges_fail() {
        let table = vec![
            VersionedExtraOption::since(KUBELET, "cgroup-driver", "cgroupfs", v("1.7.0")),
            VersionedExtraOption::since(KUBELET, "cgroup-driver", "systemd", v("1.8.0")),
        ];
        let err = default_options_from_table(&table, KUBELET, &v("1.9.0")).unwrap_err();
        assert!(err.to_string().contains("cgroup-driver"));
    }

    #[test]
    fn agreeing_or_disjoint_defaults_merge() {
        let table = vec![
            VersionedExtraOption::since(KUBELET, "cgroup-driver", "cgroupfs", v("1.7.0")),
            VersionedExtraOption::since(KUBELET, "cgroup-driver", "cgroupfs", v("1.8.0")),
            VersionedExtraOption {
                option: ExtraOption::new(KUBELET, "cadvisor-port", "0"),
                less_than_or_equal: Some(v("1.7.0")),
                greater_than_or_equal: None,
            },
        ];
        let merged = default_options_from_table(&table, KUBELET, &v("1.9.0")).unwrap();
        assert_eq!(merged.get("cgroup-driver").map(String::as_str), Some("cgroupfs"));
        // The bounded rule fell outside the target version.
        assert!(!merged.contains_key("cadvisor-port"));
    }

    #[test]
    fn user_override_lands_even_without_a_default() {
        let opts = vec![ExtraOption::new(APISERVER, "x", "y")];
        let config = extra_config_for_component(APISERVER, &opts, &v("1.8.0")).unwrap();
        assert_eq!(config.get("x").map(String::as_str), Some("y"));
    }

    #[test]
    fn user_override_shadows_a_default() {
        let opts = vec![ExtraOption::new(KUBELET, "cgroup-driver", "systemd")];
        let config = extra_config_for_component(KUBELET, &opts, &v("1.9.0")).unwrap();
        assert_eq!(config.get("cgroup-driver").map(String::as_str), Some("systemd"));
    }

    #[test]
    fn unknown_component_is_rejected_up_front() {
        let opts = vec![ExtraOption::new("not-a-component", "x", "y")];
        let err = new_component_extra_args(&opts, &v("1.9.0"), "").unwrap_err();
        assert!(err.to_string().contains("unknown component"));
    }

    #[test]
    fn feature_gates_are_injected_per_component() {
        let opts = vec![ExtraOption::new(APISERVER, "x", "y")];
        let args = new_component_extra_args(&opts, &v("1.9.0"), "StreamingProxyRedirects=true")
            .unwrap();
        // Every emitted component carries the synthetic flag.
        assert!(!args.is_empty());
        for component in &args {
            assert_eq!(
                component.options.get("feature-gates").map(String::as_str),
                Some("StreamingProxyRedirects=true")
            );
        }
        let apiserver = args
            .iter()
            .find(|a| a.kubeadm_config_key == "apiServerExtraArgs")
            .unwrap();
        assert_eq!(apiserver.options.get("x").map(String::as_str), Some("y"));
    }

    #[test]
    fn kubelet_never_appears_in_kubeadm_args() {
        let opts = vec![ExtraOption::new(KUBELET, "cgroup-driver", "systemd")];
        let args = new_component_extra_args(&opts, &v("1.9.0"), "").unwrap();
        assert!(args.iter().all(|a| !a.kubeadm_config_key.is_empty()));
    }

    #[test]
    fn flags_render_sorted_and_prefixed() {
        let mut opts = BTreeMap::new();
        opts.insert("b-flag".to_string(), "2".to_string());
        opts.insert("a-flag".to_string(), "1".to_string());
        assert_eq!(convert_to_flags(&opts), "--a-flag=1 --b-flag=2");
    }

    #[test]
    fn container_runtime_mapping() {
        // Empty runtime leaves the defaults-only path untouched.
        let mut cfg = BTreeMap::new();
        set_container_runtime(&mut cfg, "");
        assert!(cfg.is_empty());

        // crio maps to the remote runtime triple.
        let mut cfg = BTreeMap::new();
        set_container_runtime(&mut cfg, "crio");
        assert_eq!(cfg.get("container-runtime").map(String::as_str), Some("remote"));
        assert_eq!(
            cfg.get("container-runtime-endpoint").map(String::as_str),
            Some("/var/run/crio.sock")
        );

        // Other runtimes pass through.
        let mut cfg = BTreeMap::new();
        set_container_runtime(&mut cfg, "rkt");
        assert_eq!(cfg.get("container-runtime").map(String::as_str), Some("rkt"));

        // An explicit extra-option wins over the runtime flag.
        let mut cfg = BTreeMap::new();
        cfg.insert("container-runtime".to_string(), "docker".to_string());
        set_container_runtime(&mut cfg, "crio");
        assert_eq!(cfg.get("container-runtime").map(String::as_str), Some("docker"));
        assert!(!cfg.contains_key("container-runtime-endpoint"));
    }
}
