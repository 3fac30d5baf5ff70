//! Remote command execution on agent machines.
//!
//! Shells out to `ssh` and `scp` through `tokio::process::Command`; keys must
//! already be set up for the configured user. A local target runs the same
//! commands through `sh -c` and copies with `cp`.

use crate::config::SimulatorProperties;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

/// Errors from remote command execution.
#[derive(Debug, Error)]
pub enum SshError {
    /// The command could not be started.
    #[error("ssh spawn error: {0}")]
    Spawn(#[from] std::io::Error),

    /// The command returned a non-zero exit code.
    #[error("command failed on {host}: exit={exit_code}, stderr={stderr}")]
    CommandFailed {
        /// Target host.
        host: String,
        /// Exit code.
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// A copy from the remote machine failed.
    #[error("scp failed: {0}")]
    ScpFailed(String),
}

/// Output of a finished command.
#[derive(Debug, Clone)]
pub struct SshResult {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code (0 = success).
    pub exit_code: i32,
}

impl SshResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A machine commands are run on.
#[derive(Debug, Clone)]
pub struct SshTarget {
    host: String,
    user: String,
    options: Vec<String>,
    local: bool,
}

impl SshTarget {
    /// Target reached over SSH with the user and options from `properties`.
    /// With the local provider, commands run on this machine instead.
    pub fn new(host: impl Into<String>, properties: &SimulatorProperties) -> Self {
        Self {
            host: host.into(),
            user: properties.ssh_user.clone(),
            options: properties.ssh_options.clone(),
            local: properties.is_local(),
        }
    }

    /// Target that runs every command on this machine.
    pub fn local() -> Self {
        Self {
            host: "localhost".to_string(),
            user: String::new(),
            options: Vec::new(),
            local: true,
        }
    }

    /// Host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// True if commands run on this machine.
    pub fn is_local(&self) -> bool {
        self.local
    }

    fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Execute a command.
    ///
    /// Returns the raw result including exit code, stdout, and stderr.
    /// Does NOT fail on non-zero exit; use `exec_ok` for that.
    pub async fn exec(&self, cmd: &str) -> Result<SshResult, SshError> {
        tracing::debug!("[{}] {}", self.host, cmd);
        let output = if self.local {
            Command::new("sh").args(["-c", cmd]).output().await?
        } else {
            Command::new("ssh")
                .args(&self.options)
                .arg(self.login())
                .arg(cmd)
                .output()
                .await?
        };

        Ok(SshResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Execute a command, failing on non-zero exit.
    pub async fn exec_ok(&self, cmd: &str) -> Result<SshResult, SshError> {
        let result = self.exec(cmd).await?;
        if !result.success() {
            return Err(SshError::CommandFailed {
                host: self.host.clone(),
                exit_code: result.exit_code,
                stderr: result.stderr.clone(),
            });
        }
        Ok(result)
    }

    /// Recursively copy a remote directory into `local`.
    pub async fn scp_dir_from(&self, remote: &str, local: &Path) -> Result<(), SshError> {
        let output = if self.local {
            Command::new("cp")
                .arg("-r")
                .arg(remote)
                .arg(local)
                .output()
                .await?
        } else {
            Command::new("scp")
                .args(&self.options)
                .arg("-r")
                .arg(format!("{}:{}", self.login(), remote))
                .arg(local)
                .output()
                .await?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SshError::ScpFailed(format!(
                "copy from {}:{} failed: {}",
                self.host,
                remote,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_exec_captures_output() {
        let target = SshTarget::local();
        let result = target.exec("echo hello; echo oops >&2; exit 3").await.unwrap();
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.stderr.trim(), "oops");
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn exec_ok_fails_on_non_zero_exit() {
        let target = SshTarget::local();
        assert!(target.exec_ok("true").await.is_ok());
        match target.exec_ok("exit 7").await {
            Err(SshError::CommandFailed { host, exit_code, .. }) => {
                assert_eq!(host, "localhost");
                assert_eq!(exit_code, 7);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_copy_of_directory() {
        let source = tempfile::tempdir().unwrap();
        std::fs::create_dir(source.path().join("suite1")).unwrap();
        std::fs::write(source.path().join("suite1/worker.log"), "ok").unwrap();
        let dest = tempfile::tempdir().unwrap();

        let target = SshTarget::local();
        let remote = source.path().join("suite1");
        target
            .scp_dir_from(remote.to_str().unwrap(), dest.path())
            .await
            .unwrap();
        let copied = std::fs::read_to_string(dest.path().join("suite1/worker.log")).unwrap();
        assert_eq!(copied, "ok");

        assert!(matches!(
            target.scp_dir_from("/nonexistent/dir", dest.path()).await,
            Err(SshError::ScpFailed(_))
        ));
    }

    #[test]
    fn properties_select_the_target_kind() {
        let mut properties = SimulatorProperties::default();
        properties.ssh_user = "sim".into();
        let remote = SshTarget::new("10.0.0.5", &properties);
        assert!(!remote.is_local());
        assert_eq!(remote.login(), "sim@10.0.0.5");

        properties.cloud_provider = crate::config::PROVIDER_LOCAL.into();
        assert!(SshTarget::new("localhost", &properties).is_local());
    }
}
