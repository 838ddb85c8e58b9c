//! Type-2 hypervisor backend.
//!
//! Boots a disk synthesized once at create time from a boot image template,
//! with the kernel and initrd extracted alongside it. The hypervisor runs
//! as a host process tracked through a JSON machine record; IP discovery
//! polls the host DHCP lease table for the instance's generated MAC.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use super::{Driver, DriverKind, InstanceState, MachineConfig};
use crate::constants::{self, LocalPaths};
use crate::retry::retry_after;
use crate::runner::{CommandRunner, SshRunner};

const MACHINE_FILE: &str = "qemu.json";
const KERNEL_FILE: &str = "vmlinuz";
const INITRD_FILE: &str = "initrd";

/// Host DHCP lease table polled for the instance address.
const LEASES_FILE: &str = "/var/db/dhcpd_leases";

/// Host exports table NFS shares are registered in.
const EXPORTS_FILE: &str = "/etc/exports";

const IP_ATTEMPTS: usize = 30;
const IP_DELAY: Duration = Duration::from_secs(2);

const PERM_ERR: &str = "kubelift needs to run with elevated permissions. \
     Please run the following command, then try again: \
     sudo chown root:wheel kubelift && sudo chmod u+s kubelift";

/// Kernel command line for the boot image.
const BOOT_CMDLINE: &str =
    "loglevel=3 user=docker console=ttyS0 noembed nomodeset norestore base";

/// On-disk record of the spawned hypervisor process.
#[derive(Debug, Serialize, Deserialize)]
struct MachineRecord {
    pid: u32,
    mac_address: String,
}

pub struct QemuDriver {
    profile: String,
    config: MachineConfig,
    store: PathBuf,
    nfs_shares: Vec<String>,
    nfs_shares_root: String,
    ip_address: Option<String>,
}

impl QemuDriver {
    pub fn new(profile: &str, config: MachineConfig, paths: &LocalPaths) -> Self {
        Self {
            profile: profile.to_string(),
            config,
            store: paths.machine_dir(profile),
            nfs_shares: Vec::new(),
            nfs_shares_root: "/nfsshares".to_string(),
            ip_address: None,
        }
    }

    /// Host directories to export into the guest over NFS.
    pub fn with_nfs_shares(mut self, shares: Vec<String>, root: &str) -> Self {
        self.nfs_shares = shares;
        self.nfs_shares_root = root.to_string();
        self
    }

    fn disk_path(&self) -> PathBuf {
        self.store.join(format!("{}.rawdisk", self.profile))
    }

    fn machine_file(&self) -> PathBuf {
        self.store.join(MACHINE_FILE)
    }

    /// Backends needing elevated privileges fail fast, before any resource
    /// is allocated, with the remediation spelled out.
    fn preflight(&self) -> Result<()> {
        if unsafe { libc::geteuid() } != 0 {
            bail!("{}", PERM_ERR);
        }
        Ok(())
    }

    /// Synthesize the instance disk and boot media from the template.
    ///
    /// Runs once: an existing disk is never recreated, so guest state
    /// survives stop/start cycles.
    async fn synthesize_boot_media(&self) -> Result<()> {
        if self.disk_path().is_file() {
            return Ok(());
        }
        if !self.config.boot_image.is_file() {
            bail!(
                "boot image {} does not exist",
                self.config.boot_image.display()
            );
        }

        let disk = std::fs::File::create(self.disk_path())
            .with_context(|| format!("creating disk {}", self.disk_path().display()))?;
        disk.set_len(self.config.disk_size_mb * 1024 * 1024)
            .context("sizing disk image")?;

        // Pull the kernel and initrd out of the boot image so the
        // hypervisor can direct-boot them.
        for (path_in_image, dest) in [("boot/vmlinuz", KERNEL_FILE), ("boot/initrd", INITRD_FILE)] {
            let output = Command::new("bsdtar")
                .arg("-x")
                .arg("-f")
                .arg(&self.config.boot_image)
                .arg("-C")
                .arg(&self.store)
                .arg("-s")
                .arg(format!("|^{}$|{}|", path_in_image, dest))
                .arg(path_in_image)
                .output()
                .await
                .context("running bsdtar")?;
            if !output.status.success() {
                bail!(
                    "extracting {} from {}: {}",
                    path_in_image,
                    self.config.boot_image.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }
        Ok(())
    }

    fn read_record(&self) -> Option<MachineRecord> {
        let content = std::fs::read_to_string(self.machine_file()).ok()?;
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("garbled machine record for {}: {}", self.profile, e);
                None
            }
        }
    }

    async fn signal(&self, sig: &str) -> Result<()> {
        let record = match self.read_record() {
            Some(r) => r,
            None => return Ok(()),
        };
        let output = Command::new("kill")
            .arg("-s")
            .arg(sig)
            .arg(record.pid.to_string())
            .output()
            .await
            .context("running kill")?;
        if !output.status.success() {
            bail!(
                "sending {} to pid {}: {}",
                sig,
                record.pid,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn ssh_runner(&self) -> Result<SshRunner> {
        let host = self.ssh_hostname()?;
        Ok(SshRunner::new(
            &host,
            self.ssh_port(),
            self.ssh_username(),
            Some(self.ssh_key_path()),
        ))
    }

    /// Export each share to the instance and mount it inside the guest.
    /// Only called once the instance is confirmed reachable.
    async fn setup_nfs_shares(&self) -> Result<()> {
        let ip = self
            .ip_address
            .clone()
            .context("setting up NFS shares before the instance has an address")?;

        // The server address, as seen from the guest, is the host end of
        // the SSH connection.
        let mut mount_script =
            String::from("set -e\nHOST_IP=$(echo $SSH_CONNECTION | cut -d' ' -f1)\n");
        for share in &self.nfs_shares {
            let export_line = format!("{} {} -alldirs -mapall=root", share, ip);
            add_export(
                Path::new(EXPORTS_FILE),
                &export_identifier(&self.profile, share),
                &export_line,
            )?;
            mount_script.push_str(&format!(
                "sudo mkdir -p {root}{share}\nsudo mount -t nfs -o noacl,async $HOST_IP:{share} {root}{share}\n",
                root = self.nfs_shares_root,
                share = share,
            ));
        }

        reload_exports().await?;

        let runner = self.ssh_runner()?;
        runner
            .run(&mount_script)
            .await
            .context("mounting NFS shares in the guest")?;
        Ok(())
    }

    /// Unregister every share, reporting per-share failures without
    /// aborting the rest. Returns the failures for aggregation.
    async fn cleanup_nfs_exports(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if self.nfs_shares.is_empty() {
            return failures;
        }
        for share in &self.nfs_shares {
            if let Err(e) = remove_export(
                Path::new(EXPORTS_FILE),
                &export_identifier(&self.profile, share),
            ) {
                warn!("removing NFS export {}: {:#}", share, e);
                failures.push(format!("export {}: {:#}", share, e));
            }
        }
        if let Err(e) = reload_exports().await {
            warn!("reloading NFS exports: {:#}", e);
            failures.push(format!("reloading exports: {:#}", e));
        }
        failures
    }
}

#[async_trait]
impl Driver for QemuDriver {
    fn driver_name(&self) -> DriverKind {
        DriverKind::Qemu
    }

    fn profile(&self) -> &str {
        &self.profile
    }

    async fn create(&mut self) -> Result<()> {
        self.preflight()?;
        tokio::fs::create_dir_all(&self.store)
            .await
            .with_context(|| format!("creating machine store {}", self.store.display()))?;
        self.synthesize_boot_media()
            .await
            .context("synthesizing boot media")?;
        self.start().await
    }

    async fn start(&mut self) -> Result<()> {
        let mac = generate_mac(&self.profile);
        info!("starting {} with MAC {}", self.profile, mac);

        let child = Command::new("qemu-system-x86_64")
            .arg("-m")
            .arg(self.config.memory_mb.to_string())
            .arg("-smp")
            .arg(self.config.cpus.to_string())
            .arg("-kernel")
            .arg(self.store.join(KERNEL_FILE))
            .arg("-initrd")
            .arg(self.store.join(INITRD_FILE))
            .arg("-append")
            .arg(format!("{} host={}", BOOT_CMDLINE, self.profile))
            .arg("-drive")
            .arg(format!(
                "file={},format=raw,if=virtio",
                self.disk_path().display()
            ))
            .arg("-netdev")
            .arg("bridge,id=net0")
            .arg("-device")
            .arg(format!("virtio-net-pci,netdev=net0,mac={}", mac))
            .arg("-serial")
            .arg(format!("file:{}", self.store.join("console.log").display()))
            .arg("-display")
            .arg("none")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("spawning qemu-system-x86_64")?;

        let pid = child.id().context("hypervisor exited immediately")?;
        let record = MachineRecord {
            pid,
            mac_address: mac.clone(),
        };
        std::fs::write(self.machine_file(), serde_json::to_string_pretty(&record)?)
            .with_context(|| format!("writing {}", self.machine_file().display()))?;

        // The lease shows up only after the guest's DHCP handshake; poll
        // with bounded attempts instead of a single lookup.
        let lease_mac = trim_mac(&mac);
        let ip = retry_after(IP_ATTEMPTS, IP_DELAY, || {
            let lease_mac = lease_mac.clone();
            async move {
                let contents = std::fs::read_to_string(LEASES_FILE)
                    .with_context(|| format!("reading {}", LEASES_FILE))?;
                parse_leases(&contents, &lease_mac)
                    .with_context(|| format!("no lease for {}", lease_mac))
            }
        })
        .await
        .map_err(|e| anyhow::anyhow!("IP address never found in dhcp leases: {:#}", e))?;
        info!("instance {} is at {}", self.profile, ip);
        self.ip_address = Some(ip);

        if !self.nfs_shares.is_empty() {
            info!("setting up NFS mounts");
            self.setup_nfs_shares().await.context("NFS setup failed")?;
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.cleanup_nfs_exports().await;
        self.signal("TERM").await
    }

    async fn kill(&mut self) -> Result<()> {
        self.signal("KILL").await
    }

    async fn remove(&mut self) -> Result<()> {
        let mut failures = Vec::new();

        // Best-effort state read; a failing read must not block teardown.
        match self.state().await {
            Ok(InstanceState::Running) => {
                if let Err(e) = self.kill().await {
                    failures.push(format!("killing instance: {:#}", e));
                }
            }
            Ok(_) => {}
            Err(e) => info!("error checking state during remove, continuing: {:#}", e),
        }

        if self.store.is_dir()
            && let Err(e) = std::fs::remove_dir_all(&self.store)
        {
            failures.push(format!("deleting machine store: {}", e));
        }

        failures.extend(self.cleanup_nfs_exports().await);

        if failures.is_empty() {
            Ok(())
        } else {
            bail!("removing {}: {}", self.profile, failures.join("; "))
        }
    }

    async fn state(&self) -> Result<InstanceState> {
        // A missing or garbled record reads as Stopped so teardown can
        // treat "never existed" and "vanished" the same way.
        let record = match self.read_record() {
            Some(r) => r,
            None => return Ok(InstanceState::Stopped),
        };
        let alive = Command::new("ps")
            .arg("-p")
            .arg(record.pid.to_string())
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);
        if alive {
            Ok(InstanceState::Running)
        } else {
            Ok(InstanceState::Stopped)
        }
    }

    async fn ip(&self) -> Result<String> {
        self.ip_address
            .clone()
            .context("instance has no address; was it started?")
    }

    fn ssh_hostname(&self) -> Result<String> {
        self.ip_address
            .clone()
            .context("instance has no address; was it started?")
    }

    fn ssh_key_path(&self) -> PathBuf {
        self.store.join("id_rsa")
    }

    fn ssh_username(&self) -> &str {
        constants::SSH_USER
    }
}

/// Stable MAC derived from the profile name, in the locally-administered
/// 52:54:00 range.
fn generate_mac(profile: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(profile.as_bytes());
    let digest = hasher.finalize();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", digest[0], digest[1], digest[2])
}

/// The lease table stores MAC octets without leading zeros.
fn trim_mac(mac: &str) -> String {
    mac.split(':')
        .map(|octet| octet.trim_start_matches('0'))
        .map(|octet| if octet.is_empty() { "0" } else { octet })
        .collect::<Vec<_>>()
        .join(":")
}

/// Scan the lease table for the entry matching `mac`.
///
/// Entries are brace-delimited blocks of `key=value` lines; `ip_address`
/// precedes `hw_address` within a block.
fn parse_leases(contents: &str, mac: &str) -> Option<String> {
    let mut current_ip: Option<&str> = None;
    for line in contents.lines() {
        let line = line.trim();
        if line == "{" {
            current_ip = None;
        } else if let Some(ip) = line.strip_prefix("ip_address=") {
            current_ip = Some(ip);
        } else if let Some(hw) = line.strip_prefix("hw_address=") {
            // hw_address=1,52:54:0:ab:c:1 — the leading field is the type.
            let hw_mac = hw.split_once(',').map(|(_, m)| m).unwrap_or(hw);
            if hw_mac == mac {
                return current_ip.map(|ip| ip.to_string());
            }
        }
    }
    None
}

fn export_identifier(profile: &str, share: &str) -> String {
    format!("kubelift-qemu {}-{}", profile, share)
}

/// Register an export line under a marker comment, skipping identifiers
/// that are already present.
fn add_export(exports_file: &Path, id: &str, line: &str) -> Result<()> {
    let existing = std::fs::read_to_string(exports_file).unwrap_or_default();
    if existing.contains(id) {
        info!("NFS export already registered, skipping: {}", id);
        return Ok(());
    }
    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&format!("# {}\n{}\n", id, line));
    std::fs::write(exports_file, updated)
        .with_context(|| format!("writing {}", exports_file.display()))
}

/// Drop the marker comment and its export line.
fn remove_export(exports_file: &Path, id: &str) -> Result<()> {
    let existing = match std::fs::read_to_string(exports_file) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("reading {}", exports_file.display()));
        }
    };
    let marker = format!("# {}", id);
    let mut updated = String::new();
    let mut skip_next = false;
    for line in existing.lines() {
        if skip_next {
            skip_next = false;
            continue;
        }
        if line == marker {
            skip_next = true;
            continue;
        }
        updated.push_str(line);
        updated.push('\n');
    }
    std::fs::write(exports_file, updated)
        .with_context(|| format!("writing {}", exports_file.display()))
}

async fn reload_exports() -> Result<()> {
    let output = Command::new("exportfs")
        .arg("-ra")
        .output()
        .await
        .context("running exportfs")?;
    if !output.status.success() {
        bail!(
            "reloading exports: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_driver(dir: &Path) -> QemuDriver {
        QemuDriver::new(
            "testprofile",
            MachineConfig::default(),
            &LocalPaths::with_root(dir),
        )
    }

    #[tokio::test]
    async fn state_is_stopped_without_a_machine_record() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        assert_eq!(driver.state().await.unwrap(), InstanceState::Stopped);
    }

    #[tokio::test]
    async fn state_is_stopped_when_the_process_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(dir.path());
        std::fs::create_dir_all(&driver.store).unwrap();
        // A pid near the kernel maximum is not going to exist.
        std::fs::write(
            driver.machine_file(),
            r#"{"pid": 4194000, "mac_address": "52:54:00:aa:bb:cc"}"#,
        )
        .unwrap();
        assert_eq!(driver.state().await.unwrap(), InstanceState::Stopped);
    }

    #[tokio::test]
    async fn remove_on_a_never_created_profile_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = test_driver(dir.path());
        driver.remove().await.unwrap();
        // And again: remove stays idempotent.
        driver.remove().await.unwrap();
    }

    #[tokio::test]
    async fn create_fails_fast_without_privileges() {
        if unsafe { libc::geteuid() } == 0 {
            return; // preflight passes for root; nothing to assert
        }
        let dir = tempfile::tempdir().unwrap();
        let mut driver = test_driver(dir.path());
        let err = driver.create().await.unwrap_err();
        assert!(err.to_string().contains("elevated permissions"));
        // Fail-fast: nothing was allocated.
        assert!(!driver.store.exists());
    }

    #[test]
    fn generated_mac_is_stable_and_locally_administered() {
        let mac = generate_mac("testprofile");
        assert_eq!(mac, generate_mac("testprofile"));
        assert!(mac.starts_with("52:54:00:"));
        assert_ne!(mac, generate_mac("otherprofile"));
    }

    #[test]
    fn trim_mac_strips_leading_zeros_per_octet() {
        assert_eq!(trim_mac("52:54:00:ab:0c:01"), "52:54:0:ab:c:1");
        assert_eq!(trim_mac("00:00:00:00:00:00"), "0:0:0:0:0:0");
    }

    #[test]
    fn parse_leases_matches_on_hw_address() {
        let leases = "\
{
\tname=other
\tip_address=192.168.64.2
\thw_address=1,aa:bb:cc:dd:ee:ff
}
{
\tname=testprofile
\tip_address=192.168.64.5
\thw_address=1,52:54:0:ab:c:1
}
";
        assert_eq!(
            parse_leases(leases, "52:54:0:ab:c:1").as_deref(),
            Some("192.168.64.5")
        );
        assert_eq!(parse_leases(leases, "52:54:0:ff:ff:ff"), None);
    }

    #[test]
    fn exports_roundtrip_add_then_remove() {
        let dir = tempfile::tempdir().unwrap();
        let exports = dir.path().join("exports");
        std::fs::write(&exports, "/existing 10.0.0.1 -alldirs\n").unwrap();

        let id = export_identifier("testprofile", "/Users/dev");
        add_export(&exports, &id, "/Users/dev 192.168.64.5 -alldirs -mapall=root").unwrap();
        let contents = std::fs::read_to_string(&exports).unwrap();
        assert!(contents.contains(&format!("# {}", id)));
        assert!(contents.contains("/Users/dev 192.168.64.5"));

        // Re-adding the same identifier is a no-op.
        add_export(&exports, &id, "/Users/dev 192.168.64.5 -alldirs -mapall=root").unwrap();
        let contents2 = std::fs::read_to_string(&exports).unwrap();
        assert_eq!(contents, contents2);

        remove_export(&exports, &id).unwrap();
        let contents = std::fs::read_to_string(&exports).unwrap();
        assert!(!contents.contains("kubelift-qemu"));
        assert!(contents.contains("/existing 10.0.0.1"));
    }

    #[test]
    fn remove_export_tolerates_a_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        remove_export(&dir.path().join("exports"), "kubelift-qemu x-/y").unwrap();
    }
}
