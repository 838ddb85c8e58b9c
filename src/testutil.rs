//! Test doubles shared across module tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::assets::CopyableFile;
use crate::runner::{CommandRunner, RunnerError};

/// In-memory [`CommandRunner`]: records every command and copied file,
/// serves canned outputs, and injects failures on demand.
#[derive(Default)]
pub struct FakeRunner {
    outputs: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<String>>,
    commands: Mutex<Vec<String>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `output` for `cmd`.
    pub fn expect(&self, cmd: &str, output: &str) {
        self.outputs
            .lock()
            .unwrap()
            .insert(cmd.to_string(), output.to_string());
    }

    /// Make any command containing `fragment` fail with a nonzero exit.
    pub fn fail_matching(&self, fragment: &str) {
        self.failing.lock().unwrap().insert(fragment.to_string());
    }

    /// Every command issued, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn ran_command_containing(&self, fragment: &str) -> bool {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.contains(fragment))
    }

    /// Contents copied to `target_path`, if any.
    pub fn copied_file(&self, target_path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(target_path).cloned()
    }

    /// Target paths of every copied file.
    pub fn copied_files(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.lock().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }

    fn check(&self, cmd: &str) -> Result<String, RunnerError> {
        self.commands.lock().unwrap().push(cmd.to_string());
        for fragment in self.failing.lock().unwrap().iter() {
            if cmd.contains(fragment) {
                return Err(RunnerError::Command {
                    cmd: cmd.to_string(),
                    code: 1,
                    output: format!("injected failure for {}", fragment),
                });
            }
        }
        Ok(self
            .outputs
            .lock()
            .unwrap()
            .get(cmd)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, cmd: &str) -> Result<(), RunnerError> {
        self.check(cmd).map(|_| ())
    }

    async fn combined_output(&self, cmd: &str) -> Result<String, RunnerError> {
        self.check(cmd)
    }

    async fn copy(&self, file: &CopyableFile) -> Result<(), RunnerError> {
        let contents = file.contents().map_err(|e| RunnerError::Asset {
            path: file.target_path(),
            reason: format!("{:#}", e),
        })?;
        self.files
            .lock()
            .unwrap()
            .insert(file.target_path(), contents);
        Ok(())
    }
}
