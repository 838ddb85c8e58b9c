//! "No driver" backend: the controlling host is the instance.
//!
//! The entire lifecycle short-circuits. Selecting this backend forces the
//! direct-exec command runner; nothing here ever opens an SSH session.

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;

use super::{Driver, DriverKind, InstanceState};

pub struct NoneDriver {
    profile: String,
}

impl NoneDriver {
    pub fn new(profile: &str) -> Self {
        Self {
            profile: profile.to_string(),
        }
    }
}

#[async_trait]
impl Driver for NoneDriver {
    fn driver_name(&self) -> DriverKind {
        DriverKind::None
    }

    fn profile(&self) -> &str {
        &self.profile
    }

    async fn create(&mut self) -> Result<()> {
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        Ok(())
    }

    async fn remove(&mut self) -> Result<()> {
        Ok(())
    }

    async fn state(&self) -> Result<InstanceState> {
        Ok(InstanceState::Running)
    }

    async fn ip(&self) -> Result<String> {
        Ok("127.0.0.1".to_string())
    }

    fn ssh_hostname(&self) -> Result<String> {
        Ok("127.0.0.1".to_string())
    }

    fn ssh_key_path(&self) -> PathBuf {
        PathBuf::new()
    }

    fn ssh_username(&self) -> &str {
        ""
    }
}
