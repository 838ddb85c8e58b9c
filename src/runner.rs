//! Command execution on the local host or inside the instance over SSH.
//!
//! Both runners are stateless capability objects bound at construction to
//! their transport. They are safe for concurrent use, but two commands
//! issued concurrently on the same runner are unordered relative to each
//! other unless the caller serializes them.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::assets::CopyableFile;

/// The ssh client reports transport-level failures (connection refused,
/// timeout, auth) with this exit status, distinct from any remote exit.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// Non-interactive options shared by every ssh invocation. Instance host
/// keys change on every fresh boot, so strict checking is off and nothing
/// is written to known_hosts.
const SSH_OPTS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=ERROR",
    "-o",
    "BatchMode=yes",
    "-o",
    "ConnectTimeout=5",
];

/// Failure classes a caller must be able to tell apart.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The instance could not be reached at all.
    #[error("could not reach instance: {0}")]
    Transport(String),

    /// The command reached its target and exited non-zero. Carries the
    /// literal command text for diagnosability.
    #[error("command `{cmd}` failed (exit {code}): {output}")]
    Command {
        cmd: String,
        code: i32,
        output: String,
    },

    /// The payload itself could not be resolved or written.
    #[error("asset {path}: {reason}")]
    Asset { path: String, reason: String },
}

/// Executes shell commands and places files, locally or remotely.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `cmd`, streaming output to the caller's stdio.
    async fn run(&self, cmd: &str) -> Result<(), RunnerError>;

    /// Run `cmd` and capture combined stdout and stderr.
    async fn combined_output(&self, cmd: &str) -> Result<String, RunnerError>;

    /// Place `file` at its target path, creating the directory if absent.
    /// Overwrites on repeat; never appends.
    async fn copy(&self, file: &CopyableFile) -> Result<(), RunnerError>;
}

/// Runs commands as child processes of this host.
///
/// Used only when the "none" driver is selected; the instance *is* the
/// controlling host.
#[derive(Debug, Default)]
pub struct ExecRunner;

#[async_trait]
impl CommandRunner for ExecRunner {
    async fn run(&self, cmd: &str) -> Result<(), RunnerError> {
        let status = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .status()
            .await
            .map_err(|e| RunnerError::Transport(format!("spawning `sh -c`: {}", e)))?;
        if status.success() {
            Ok(())
        } else {
            Err(RunnerError::Command {
                cmd: cmd.to_string(),
                code: status.code().unwrap_or(-1),
                output: String::new(),
            })
        }
    }

    async fn combined_output(&self, cmd: &str) -> Result<String, RunnerError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .output()
            .await
            .map_err(|e| RunnerError::Transport(format!("spawning `sh -c`: {}", e)))?;
        let combined = combine(&output.stdout, &output.stderr);
        if output.status.success() {
            Ok(combined)
        } else {
            Err(RunnerError::Command {
                cmd: cmd.to_string(),
                code: output.status.code().unwrap_or(-1),
                output: combined,
            })
        }
    }

    async fn copy(&self, file: &CopyableFile) -> Result<(), RunnerError> {
        let contents = file.contents().map_err(|e| RunnerError::Asset {
            path: file.target_path(),
            reason: format!("{:#}", e),
        })?;
        let asset_err = |e: std::io::Error| RunnerError::Asset {
            path: file.target_path(),
            reason: e.to_string(),
        };

        tokio::fs::create_dir_all(file.target_dir())
            .await
            .map_err(asset_err)?;
        let target = file.target_path();
        tokio::fs::write(&target, &contents).await.map_err(asset_err)?;

        let mode = u32::from_str_radix(file.permissions(), 8).map_err(|e| RunnerError::Asset {
            path: target.clone(),
            reason: format!("bad permission string {}: {}", file.permissions(), e),
        })?;
        let perms = std::os::unix::fs::PermissionsExt::from_mode(mode);
        tokio::fs::set_permissions(&target, perms)
            .await
            .map_err(asset_err)?;
        Ok(())
    }
}

/// Runs commands inside the instance through the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshRunner {
    host: String,
    port: u16,
    username: String,
    key_path: Option<PathBuf>,
}

impl SshRunner {
    pub fn new(host: &str, port: u16, username: &str, key_path: Option<PathBuf>) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            key_path,
        }
    }

    fn ssh_args(&self, cmd: &str) -> Vec<String> {
        let mut args: Vec<String> = SSH_OPTS.iter().map(|s| s.to_string()).collect();
        args.push("-p".to_string());
        args.push(self.port.to_string());
        if let Some(key) = &self.key_path {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().into_owned());
        }
        args.push(format!("{}@{}", self.username, self.host));
        args.push(cmd.to_string());
        args
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, cmd: &str) -> Result<(), RunnerError> {
        let status = Command::new("ssh")
            .args(self.ssh_args(cmd))
            .status()
            .await
            .map_err(|e| RunnerError::Transport(format!("spawning ssh: {}", e)))?;
        match status.code() {
            Some(0) => Ok(()),
            code => Err(classify_ssh_exit(cmd, code.unwrap_or(-1), String::new())),
        }
    }

    async fn combined_output(&self, cmd: &str) -> Result<String, RunnerError> {
        let output = Command::new("ssh")
            .args(self.ssh_args(cmd))
            .output()
            .await
            .map_err(|e| RunnerError::Transport(format!("spawning ssh: {}", e)))?;
        let combined = combine(&output.stdout, &output.stderr);
        if output.status.success() {
            Ok(combined)
        } else {
            Err(classify_ssh_exit(
                cmd,
                output.status.code().unwrap_or(-1),
                combined,
            ))
        }
    }

    async fn copy(&self, file: &CopyableFile) -> Result<(), RunnerError> {
        let contents = file.contents().map_err(|e| RunnerError::Asset {
            path: file.target_path(),
            reason: format!("{:#}", e),
        })?;

        let cmd = format!(
            "sudo mkdir -p {dir} && sudo tee {path} > /dev/null && sudo chmod {perm} {path}",
            dir = file.target_dir(),
            path = file.target_path(),
            perm = file.permissions(),
        );

        let mut child = Command::new("ssh")
            .args(self.ssh_args(&cmd))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RunnerError::Transport(format!("spawning ssh: {}", e)))?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin.write_all(&contents).await.map_err(|e| {
            RunnerError::Transport(format!("writing payload over ssh stdin: {}", e))
        })?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RunnerError::Transport(format!("waiting for ssh: {}", e)))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify_ssh_exit(
                &cmd,
                output.status.code().unwrap_or(-1),
                combine(&output.stdout, &output.stderr),
            ))
        }
    }
}

/// ssh multiplexes "could not connect" and "remote command failed" onto its
/// exit status; 255 is the client's own transport failure.
fn classify_ssh_exit(cmd: &str, code: i32, output: String) -> RunnerError {
    if code == SSH_TRANSPORT_EXIT {
        RunnerError::Transport(format!("ssh transport failure: {}", output.trim()))
    } else {
        RunnerError::Command {
            cmd: cmd.to_string(),
            code,
            output,
        }
    }
}

fn combine(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(stderr));
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn exec_runner_runs_and_captures() {
        let runner = ExecRunner;
        runner.run("true").await.unwrap();

        let out = runner.combined_output("echo hello").await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn exec_runner_reports_exit_code_and_command() {
        let runner = ExecRunner;
        let err = runner.combined_output("echo oops >&2; exit 3").await.unwrap_err();
        match err {
            RunnerError::Command { cmd, code, output } => {
                assert_eq!(code, 3);
                assert!(cmd.contains("exit 3"));
                assert!(output.contains("oops"));
            }
            other => panic!("expected Command error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn exec_runner_copy_writes_permissions_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let target_dir = dir.path().join("etc").join("kubernetes");
        let target_dir_str = target_dir.to_string_lossy().into_owned();

        let runner = ExecRunner;
        let file = CopyableFile::from_memory(
            b"first".to_vec(),
            &format!("{}/config.yaml", target_dir_str),
            "640",
        );
        runner.copy(&file).await.unwrap();

        let written = target_dir.join("config.yaml");
        assert_eq!(std::fs::read(&written).unwrap(), b"first");
        let mode = std::fs::metadata(&written).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);

        // Copying again with identical coordinates overwrites, not appends.
        let file = CopyableFile::from_memory(
            b"second".to_vec(),
            &format!("{}/config.yaml", target_dir_str),
            "0640",
        );
        runner.copy(&file).await.unwrap();
        assert_eq!(std::fs::read(&written).unwrap(), b"second");
    }

    #[test]
    fn ssh_exit_255_is_a_transport_error() {
        let err = classify_ssh_exit("uptime", 255, "connection refused".to_string());
        assert!(matches!(err, RunnerError::Transport(_)));

        let err = classify_ssh_exit("uptime", 1, String::new());
        match err {
            RunnerError::Command { cmd, code, .. } => {
                assert_eq!(cmd, "uptime");
                assert_eq!(code, 1);
            }
            other => panic!("expected Command error, got {:?}", other),
        }
    }

    #[test]
    fn ssh_args_carry_endpoint_coordinates() {
        let runner = SshRunner::new("192.168.64.5", 22, "docker", Some("/tmp/id_rsa".into()));
        let args = runner.ssh_args("uptime");
        assert!(args.contains(&"-p".to_string()));
        assert!(args.contains(&"22".to_string()));
        assert!(args.contains(&"-i".to_string()));
        assert!(args.contains(&"docker@192.168.64.5".to_string()));
        assert_eq!(args.last().unwrap(), "uptime");
    }
}
