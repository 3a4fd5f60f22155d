//! Thin wrapper over the `ssh`/`scp` binaries. No SSH protocol is
//! implemented here — the operator's own `ssh` client carries whatever
//! agent/host-key configuration they already trust.

use anyhow::{bail, Result};
use tokio::process::Command;

const REMOTE_BIN_PATH: &str = "/opt/fintask/bin/fintask-worker";
const REMOTE_CONFIG_PATH: &str = "/etc/fintask/fintask.yaml";
const REMOTE_PID_FILE: &str = "/var/run/fintask-worker.pid";
const REMOTE_LOG_FILE: &str = "/var/log/fintask/worker.log";

/// One resolved SSH destination: host, user, optional key, port.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub host: String,
    pub user: String,
    pub key_path: Option<String>,
    pub port: u16,
}

impl RemoteTarget {
    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Output of a remote command, captured rather than streamed, so callers
/// can decide what to print and what exit code to surface.
pub struct RemoteOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs `ssh`/`scp` against one [`RemoteTarget`] at a time. Each method
/// corresponds to one deployer verb (`deploy`, `start`, `stop`, `restart`,
/// `status`, `logs`).
pub struct SshRunner;

impl SshRunner {
    fn ssh_command(target: &RemoteTarget) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-p").arg(target.port.to_string());
        if let Some(key) = &target.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg("-o").arg("BatchMode=yes");
        cmd.arg(target.destination());
        cmd
    }

    async fn run_remote(target: &RemoteTarget, remote_command: &str) -> Result<RemoteOutput> {
        let output = Self::ssh_command(target).arg(remote_command).output().await?;
        Ok(RemoteOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Copies `local_binary` and `local_config` to the host via `scp`,
    /// then ensures the remote directories exist.
    pub async fn deploy(target: &RemoteTarget, local_binary: &str, local_config: &str) -> Result<RemoteOutput> {
        let mkdir = Self::run_remote(
            target,
            &format!(
                "mkdir -p {} {} {}",
                parent_dir(REMOTE_BIN_PATH),
                parent_dir(REMOTE_CONFIG_PATH),
                parent_dir(REMOTE_LOG_FILE),
            ),
        )
        .await?;
        if !mkdir.success {
            bail!("failed to prepare remote directories on {}: {}", target.host, mkdir.stderr);
        }

        Self::scp_to(target, local_binary, REMOTE_BIN_PATH).await?;
        Self::scp_to(target, local_config, REMOTE_CONFIG_PATH).await?;

        Self::run_remote(target, &format!("chmod +x {REMOTE_BIN_PATH}")).await
    }

    async fn scp_to(target: &RemoteTarget, local_path: &str, remote_path: &str) -> Result<()> {
        let mut cmd = Command::new("scp");
        cmd.arg("-P").arg(target.port.to_string());
        if let Some(key) = &target.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(local_path);
        cmd.arg(format!("{}:{remote_path}", target.destination()));

        let status = cmd.status().await?;
        if !status.success() {
            bail!("scp of {local_path} to {}:{remote_path} failed", target.host);
        }
        Ok(())
    }

    /// Starts the worker in the background, recording its PID.
    pub async fn start(target: &RemoteTarget) -> Result<RemoteOutput> {
        let command = format!(
            "nohup {REMOTE_BIN_PATH} --config {REMOTE_CONFIG_PATH} >> {REMOTE_LOG_FILE} 2>&1 & echo $! > {REMOTE_PID_FILE}"
        );
        Self::run_remote(target, &command).await
    }

    /// Sends `SIGTERM` to the recorded PID, letting the worker drain and
    /// unregister on its own.
    pub async fn stop(target: &RemoteTarget) -> Result<RemoteOutput> {
        let command = format!("kill $(cat {REMOTE_PID_FILE} 2>/dev/null) 2>&1 || echo 'not running'");
        Self::run_remote(target, &command).await
    }

    pub async fn restart(target: &RemoteTarget) -> Result<RemoteOutput> {
        let stop_result = Self::stop(target).await?;
        if !stop_result.success {
            return Ok(stop_result);
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        Self::start(target).await
    }

    /// Reports whether the recorded PID is alive.
    pub async fn status(target: &RemoteTarget) -> Result<RemoteOutput> {
        let command = format!(
            "if kill -0 $(cat {REMOTE_PID_FILE} 2>/dev/null) 2>/dev/null; then echo running; else echo stopped; fi"
        );
        Self::run_remote(target, &command).await
    }

    /// Tails the last `lines` lines of the worker's log file.
    pub async fn logs(target: &RemoteTarget, lines: u32) -> Result<RemoteOutput> {
        let command = format!("tail -n {lines} {REMOTE_LOG_FILE}");
        Self::run_remote(target, &command).await
    }
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) if idx > 0 => &path[..idx],
        _ => "/",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_dir_strips_file_name() {
        assert_eq!(parent_dir("/opt/fintask/bin/fintask-worker"), "/opt/fintask/bin");
        assert_eq!(parent_dir("/etc/fintask/fintask.yaml"), "/etc/fintask");
    }

    #[test]
    fn destination_combines_user_and_host() {
        let target = RemoteTarget {
            host: "10.0.0.1".to_string(),
            user: "deploy".to_string(),
            key_path: None,
            port: 22,
        };
        assert_eq!(target.destination(), "deploy@10.0.0.1");
    }
}
