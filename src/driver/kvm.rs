//! Native hypervisor backend, driven through the libvirt CLI.
//!
//! The domain is defined from a rendered XML description and managed with
//! `virsh`; IP discovery polls the domain's DHCP lease via `domifaddr`.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::info;

use super::{Driver, DriverKind, InstanceState, MachineConfig};
use crate::constants::{self, LocalPaths};
use crate::retry::retry_after;

const IP_ATTEMPTS: usize = 30;
const IP_DELAY: Duration = Duration::from_secs(2);

pub struct KvmDriver {
    profile: String,
    config: MachineConfig,
    store: PathBuf,
    network: String,
    ip_address: Option<String>,
}

impl KvmDriver {
    pub fn new(profile: &str, config: MachineConfig, paths: &LocalPaths) -> Self {
        Self {
            profile: profile.to_string(),
            config,
            store: paths.machine_dir(profile),
            network: "default".to_string(),
            ip_address: None,
        }
    }

    /// Attach the domain to a non-default libvirt network.
    pub fn with_network(mut self, network: &str) -> Self {
        self.network = network.to_string();
        self
    }

    fn domain_name(&self) -> String {
        format!("kubelift-{}", self.profile)
    }

    fn disk_path(&self) -> PathBuf {
        self.store.join(format!("{}.rawdisk", self.profile))
    }

    /// Fail fast with the remediation if libvirt is not usable, before any
    /// domain or disk is allocated.
    async fn preflight(&self) -> Result<()> {
        let output = Command::new("virsh")
            .arg("--connect")
            .arg("qemu:///system")
            .arg("version")
            .output()
            .await;
        let ok = matches!(&output, Ok(o) if o.status.success());
        if !ok {
            bail!(
                "cannot talk to libvirt at qemu:///system. Please run the following \
                 command, then log out and back in: sudo usermod -aG libvirt $USER"
            );
        }
        Ok(())
    }

    async fn virsh(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("virsh")
            .arg("--connect")
            .arg("qemu:///system")
            .args(args)
            .output()
            .await
            .context("running virsh")?;
        if !output.status.success() {
            bail!(
                "virsh {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn domain_xml(&self) -> String {
        format!(
            r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MiB'>{memory}</memory>
  <vcpu>{cpus}</vcpu>
  <os>
    <type>hvm</type>
    <boot dev='hd'/>
  </os>
  <features><acpi/><apic/><pae/></features>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='raw' cache='default' io='threads'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <source network='{network}'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'><target port='0'/></serial>
    <console type='pty'><target type='serial' port='0'/></console>
  </devices>
</domain>
"#,
            name = self.domain_name(),
            memory = self.config.memory_mb,
            cpus = self.config.cpus,
            disk = self.disk_path().display(),
            network = self.network,
        )
    }

    /// Synthesize the domain disk from the boot image template; never
    /// recreated once present.
    fn synthesize_disk(&self) -> Result<()> {
        if self.disk_path().is_file() {
            return Ok(());
        }
        if !self.config.boot_image.is_file() {
            bail!(
                "boot image {} does not exist",
                self.config.boot_image.display()
            );
        }
        std::fs::copy(&self.config.boot_image, self.disk_path())
            .with_context(|| format!("seeding disk from {}", self.config.boot_image.display()))?;
        let disk = std::fs::OpenOptions::new()
            .write(true)
            .open(self.disk_path())
            .context("opening disk image")?;
        disk.set_len(self.config.disk_size_mb * 1024 * 1024)
            .context("sizing disk image")?;
        Ok(())
    }

    /// `domifaddr` prints a table; the address column is CIDR-formed.
    fn parse_domifaddr(output: &str) -> Option<String> {
        for line in output.lines().skip(2) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if let Some(addr) = fields.get(3) {
                let ip = addr.split('/').next().unwrap_or(addr);
                if !ip.is_empty() {
                    return Some(ip.to_string());
                }
            }
        }
        None
    }
}

#[async_trait]
impl Driver for KvmDriver {
    fn driver_name(&self) -> DriverKind {
        DriverKind::Kvm
    }

    fn profile(&self) -> &str {
        &self.profile
    }

    async fn create(&mut self) -> Result<()> {
        self.preflight().await?;
        tokio::fs::create_dir_all(&self.store)
            .await
            .with_context(|| format!("creating machine store {}", self.store.display()))?;
        self.synthesize_disk().context("synthesizing domain disk")?;

        let xml_path = self.store.join("domain.xml");
        std::fs::write(&xml_path, self.domain_xml())
            .with_context(|| format!("writing {}", xml_path.display()))?;
        self.virsh(&["define", &xml_path.to_string_lossy()])
            .await
            .context("defining domain")?;
        self.start().await
    }

    async fn start(&mut self) -> Result<()> {
        let name = self.domain_name();
        info!("starting domain {}", name);
        // Already-running is fine; start is called after create too.
        match self.virsh(&["start", &name]).await {
            Ok(_) => {}
            Err(e) if e.to_string().contains("already active") => {}
            Err(e) => return Err(e).context("starting domain"),
        }

        let this = &*self;
        let ip = retry_after(IP_ATTEMPTS, IP_DELAY, || {
            let name = this.domain_name();
            async move {
                let output = this.virsh(&["domifaddr", &name]).await?;
                Self::parse_domifaddr(&output)
                    .with_context(|| format!("no address reported for {}", name))
            }
        })
        .await
        .map_err(|e| anyhow::anyhow!("IP address never reported by libvirt: {:#}", e))?;
        info!("domain {} is at {}", name, ip);
        self.ip_address = Some(ip);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.virsh(&["shutdown", &self.domain_name()])
            .await
            .context("shutting down domain")?;
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.virsh(&["destroy", &self.domain_name()])
            .await
            .context("destroying domain")?;
        Ok(())
    }

    async fn remove(&mut self) -> Result<()> {
        let mut failures = Vec::new();

        // Destroy is expected to fail on a domain that is not running;
        // only undefine failures matter for a domain that exists.
        let _ = self.virsh(&["destroy", &self.domain_name()]).await;
        if let Err(e) = self.virsh(&["undefine", &self.domain_name()]).await {
            // A domain that was never defined is already removed.
            if !e.to_string().contains("failed to get domain") {
                failures.push(format!("undefining domain: {:#}", e));
            }
        }

        if self.store.is_dir()
            && let Err(e) = std::fs::remove_dir_all(&self.store)
        {
            failures.push(format!("deleting machine store: {}", e));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            bail!("removing {}: {}", self.profile, failures.join("; "))
        }
    }

    async fn state(&self) -> Result<InstanceState> {
        // A domain libvirt has never heard of reads as Stopped.
        let output = match self.virsh(&["domstate", &self.domain_name()]).await {
            Ok(o) => o,
            Err(_) => return Ok(InstanceState::Stopped),
        };
        match output.trim() {
            "running" => Ok(InstanceState::Running),
            "shut off" | "paused" | "in shutdown" => Ok(InstanceState::Stopped),
            "" => Ok(InstanceState::Stopped),
            _ => Ok(InstanceState::Error),
        }
    }

    async fn ip(&self) -> Result<String> {
        self.ip_address
            .clone()
            .context("domain has no address; was it started?")
    }

    fn ssh_hostname(&self) -> Result<String> {
        self.ip_address
            .clone()
            .context("domain has no address; was it started?")
    }

    fn ssh_key_path(&self) -> PathBuf {
        self.store.join("id_rsa")
    }

    fn ssh_username(&self) -> &str {
        constants::SSH_USER
    }
}
