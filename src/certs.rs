//! Shared certificate provisioning.
//!
//! Both bootstrap strategies push the same bundle: a CA pair and an API
//! server pair signed by it, generated host-side under the local state dir
//! and copied into the fixed remote certificate directory.

use anyhow::{Context, Result, bail};
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SanType};
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::info;

use crate::assets::CopyableFile;
use crate::bootstrapper::KubernetesConfig;
use crate::constants::{self, LocalPaths};
use crate::runner::CommandRunner;

/// Files produced under the state dir and transferred to the instance.
pub const CERTS: &[&str] = &["ca.crt", "ca.key", "apiserver.crt", "apiserver.key"];

/// Generate any missing certificates and push the bundle to the instance.
pub async fn setup_certs(
    runner: &dyn CommandRunner,
    cfg: &KubernetesConfig,
    paths: &LocalPaths,
) -> Result<()> {
    generate_certs(cfg, paths).context("generating certs")?;

    for name in CERTS {
        let file = CopyableFile::from_file(
            paths.cert_file(name),
            constants::REMOTE_CERT_PATH,
            name,
            "0644",
        )
        .with_context(|| format!("making cert asset {}", name))?;
        runner
            .copy(&file)
            .await
            .with_context(|| format!("transferring cert {}", name))?;
    }
    Ok(())
}

/// Ensure the CA and API server pairs exist under the state dir.
///
/// An existing CA is reused so certificates stay stable across restarts;
/// the server certificate is regenerated each call since its SANs follow
/// the configured node IP.
fn generate_certs(cfg: &KubernetesConfig, paths: &LocalPaths) -> Result<()> {
    std::fs::create_dir_all(paths.root())
        .with_context(|| format!("creating state dir {}", paths.root().display()))?;

    let ca_cert_path = paths.cert_file("ca.crt");
    let ca_key_path = paths.cert_file("ca.key");

    let ca_key = if ca_cert_path.is_file() && ca_key_path.is_file() {
        info!("reusing existing CA at {}", ca_cert_path.display());
        let pem = std::fs::read_to_string(&ca_key_path)
            .with_context(|| format!("reading {}", ca_key_path.display()))?;
        KeyPair::from_pem(&pem).context("parsing existing CA key")?
    } else {
        let key = KeyPair::generate().context("generating CA key")?;
        let cert = ca_params()?
            .self_signed(&key)
            .context("self-signing CA cert")?;
        write_pem(&ca_cert_path, &cert.pem())?;
        write_pem(&ca_key_path, &key.serialize_pem())?;
        key
    };

    // Rebuild the CA certificate object from the stored key for signing.
    let ca_cert = ca_params()?
        .self_signed(&ca_key)
        .context("rebuilding CA cert for signing")?;

    let service_ip = service_cluster_ip(&cfg.service_cidr)
        .with_context(|| format!("deriving service IP from {}", cfg.service_cidr))?;

    let mut params = CertificateParams::new(vec![
        format!("kubernetes.default.svc.{}", cfg.dns_domain),
        "kubernetes.default.svc".to_string(),
        "kubernetes.default".to_string(),
        "kubernetes".to_string(),
        "localhost".to_string(),
        cfg.api_server_name.clone(),
    ])
    .context("building server cert params")?;
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, &cfg.api_server_name);
    let node_ip: Ipv4Addr = cfg
        .node_ip
        .parse()
        .with_context(|| format!("parsing node IP {}", cfg.node_ip))?;
    params.subject_alt_names.push(SanType::IpAddress(node_ip.into()));
    params
        .subject_alt_names
        .push(SanType::IpAddress(service_ip.into()));

    let server_key = KeyPair::generate().context("generating apiserver key")?;
    let server_cert = params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .context("signing apiserver cert")?;

    write_pem(&paths.cert_file("apiserver.crt"), &server_cert.pem())?;
    write_pem(&paths.cert_file("apiserver.key"), &server_key.serialize_pem())?;
    Ok(())
}

fn ca_params() -> Result<CertificateParams> {
    let mut params = CertificateParams::new(vec![]).context("building CA params")?;
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, constants::CA_NAME);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    Ok(params)
}

fn write_pem(path: &Path, pem: &str) -> Result<()> {
    std::fs::write(path, pem).with_context(|| format!("writing {}", path.display()))
}

/// First usable address of the service CIDR (e.g. 10.96.0.0/12 -> 10.96.0.1),
/// which the API server claims as its in-cluster address.
fn service_cluster_ip(cidr: &str) -> Result<Ipv4Addr> {
    let (addr, prefix) = match cidr.split_once('/') {
        Some(parts) => parts,
        None => bail!("{} is not in CIDR notation", cidr),
    };
    let addr: Ipv4Addr = addr
        .parse()
        .with_context(|| format!("parsing network {}", addr))?;
    let prefix: u32 = prefix
        .parse()
        .with_context(|| format!("parsing prefix length {}", prefix))?;
    if prefix == 0 || prefix > 30 {
        bail!("prefix /{} leaves no room for a service IP", prefix);
    }
    let mask = u32::MAX << (32 - prefix);
    let network = u32::from(addr) & mask;
    Ok(Ipv4Addr::from(network + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeRunner;

    fn test_config() -> KubernetesConfig {
        KubernetesConfig {
            node_ip: "192.168.64.4".to_string(),
            ..KubernetesConfig::default()
        }
    }

    #[test]
    fn service_ip_is_first_usable_address() {
        assert_eq!(
            service_cluster_ip("10.96.0.0/12").unwrap(),
            Ipv4Addr::new(10, 96, 0, 1)
        );
        assert_eq!(
            service_cluster_ip("10.0.0.0/24").unwrap(),
            Ipv4Addr::new(10, 0, 0, 1)
        );
        assert!(service_cluster_ip("10.0.0.0").is_err());
        assert!(service_cluster_ip("10.0.0.0/31").is_err());
    }

    #[tokio::test]
    async fn setup_certs_pushes_the_full_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LocalPaths::with_root(dir.path());
        let runner = FakeRunner::new();

        setup_certs(&runner, &test_config(), &paths).await.unwrap();

        for name in CERTS {
            assert!(paths.cert_file(name).is_file(), "{} not generated", name);
            let remote = format!("{}/{}", constants::REMOTE_CERT_PATH, name);
            assert!(
                runner.copied_file(&remote).is_some(),
                "{} not transferred",
                remote
            );
        }
    }

    #[tokio::test]
    async fn existing_ca_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LocalPaths::with_root(dir.path());
        let runner = FakeRunner::new();

        setup_certs(&runner, &test_config(), &paths).await.unwrap();
        let ca_before = std::fs::read(paths.cert_file("ca.crt")).unwrap();
        let key_before = std::fs::read(paths.cert_file("ca.key")).unwrap();

        setup_certs(&runner, &test_config(), &paths).await.unwrap();
        assert_eq!(std::fs::read(paths.cert_file("ca.crt")).unwrap(), ca_before);
        assert_eq!(std::fs::read(paths.cert_file("ca.key")).unwrap(), key_before);
    }
}
