use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::direct::ASKPASS_VALUE_VAR;
use super::{
    ExecOptions, OutputMode, RemoteRunner, RunContext, SSH_BASE_OPTIONS, join_commands,
    log_check_results, run_child,
};
use crate::config::SshConfig;
use crate::config::loader::{
    ENV_PASSPHRASE_CONTROL_PLANE, ENV_PASSPHRASE_ETCD, ENV_PASSPHRASE_FALLBACK,
};
use crate::error::RemoteError;
use crate::utils::{local, shell_escape};

/// Agent socket inside the helper container
pub const AGENT_SOCKET: &str = "/tmp/certrenew-agent.sock";
/// Marks that an agent is already listening on [`AGENT_SOCKET`]
pub const AGENT_SENTINEL: &str = "/tmp/agent_ready";
const ASKPASS_PATH: &str = "/tmp/certrenew-askpass";

const FAST_PATH_TIMEOUT: Duration = Duration::from_secs(3);
const AGENT_INIT_TIMEOUT: Duration = Duration::from_secs(10);

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Runs `ssh` inside a long-running helper container via `docker exec`
pub struct DockerSshRunner {
    container: String,
    options: ExecOptions,
    env: EnvLookup,
    state: Mutex<Option<DockerState>>,
}

struct DockerState {
    user: String,
    key_path: PathBuf,
}

impl DockerSshRunner {
    pub fn new(container: impl Into<String>, options: ExecOptions) -> Self {
        Self::with_env(container, options, |key| std::env::var(key).ok())
    }

    /// Same as [`DockerSshRunner::new`] with an explicit passphrase environment
    pub fn with_env<F>(container: impl Into<String>, options: ExecOptions, env: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            container: container.into(),
            options,
            env: Box::new(env),
            state: Mutex::new(None),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    async fn agent_has_keys(&self) -> bool {
        let socket_env = format!("SSH_AUTH_SOCK={}", AGENT_SOCKET);
        let args = [
            "exec",
            "-e",
            socket_env.as_str(),
            self.container.as_str(),
            "ssh-add",
            "-l",
        ];
        let check = local::execute("docker", &args);
        matches!(
            tokio::time::timeout(FAST_PATH_TIMEOUT, check).await,
            Ok(Ok(output)) if output.status.success()
        )
    }

    async fn agent_running(&self) -> bool {
        let args = ["exec", self.container.as_str(), "test", "-f", AGENT_SENTINEL];
        let check = local::execute("docker", &args);
        matches!(
            tokio::time::timeout(FAST_PATH_TIMEOUT, check).await,
            Ok(Ok(output)) if output.status.success()
        )
    }

    async fn load_key(&self, key_path: &Path, passphrase: Option<String>) -> Result<(), RemoteError> {
        let agent_ready = self.agent_running().await;
        let script = build_agent_script(key_path, agent_ready, passphrase.is_some());

        let mut cmd = Command::new("docker");
        cmd.args(["exec", "-i", "-e"])
            .arg(format!("SSH_AUTH_SOCK={}", AGENT_SOCKET));
        let interactive = passphrase.is_none();
        if let Some(passphrase) = passphrase {
            // `-e NAME` forwards the value from the docker client's environment
            cmd.args(["-e", ASKPASS_VALUE_VAR])
                .env(ASKPASS_VALUE_VAR, passphrase)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped());
        } else {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        }
        cmd.args([self.container.as_str(), "sh", "-c", script.as_str()])
            .kill_on_drop(true);

        let result = if interactive {
            cmd.output().await
        } else {
            tokio::time::timeout(AGENT_INIT_TIMEOUT, cmd.output())
                .await
                .map_err(|_| RemoteError::Agent("timed out adding key in container".to_string()))?
        };
        let output =
            result.map_err(|e| RemoteError::Agent(format!("running docker exec: {}", e)))?;

        if !output.status.success() {
            return Err(RemoteError::Agent(format!(
                "initializing ssh-agent in container {}: {}",
                self.container,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn run(
        &self,
        ctx: &RunContext,
        node: &str,
        commands: &[String],
        mode: OutputMode,
    ) -> Result<String, RemoteError> {
        let script = join_commands(commands)?;
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(RemoteError::NotInitialized)?;

        debug!(node, container = %self.container, "running remote command in container");
        let mut cmd = Command::new("docker");
        cmd.args(build_exec_args(&self.container, &state.user, node, &script));
        let output = run_child(ctx, node, cmd, mode).await?;
        log_check_results(&self.options, node, &script, &output);
        Ok(output)
    }
}

#[async_trait]
impl RemoteRunner for DockerSshRunner {
    async fn init_ssh_config(&self, ssh: &SshConfig) -> Result<(), RemoteError> {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_mut()
            && state.key_path == ssh.key_path
        {
            state.user = ssh.user.clone();
            return Ok(());
        }

        if !local::check_command_exists("docker") {
            return Err(RemoteError::BinaryNotFound("docker"));
        }
        std::fs::metadata(&ssh.key_path).map_err(|source| RemoteError::KeyNotFound {
            path: ssh.key_path.clone(),
            source,
        })?;

        if self.agent_has_keys().await {
            debug!(container = %self.container, "ssh-agent in container already has keys loaded");
        } else {
            let passphrase = ssh
                .passphrase
                .clone()
                .or_else(|| passphrase_from_env(&ssh.key_path, &self.env));
            self.load_key(&ssh.key_path, passphrase).await?;
            info!(container = %self.container, key = %ssh.key_path.display(), "✓ SSH key loaded into container agent");
        }

        *guard = Some(DockerState {
            user: ssh.user.clone(),
            key_path: ssh.key_path.clone(),
        });
        Ok(())
    }

    async fn run_command(
        &self,
        ctx: &RunContext,
        node: &str,
        commands: &[String],
    ) -> Result<(), RemoteError> {
        self.run(ctx, node, commands, self.options.mode_for_run())
            .await
            .map(|_| ())
    }

    async fn run_command_with_output(
        &self,
        ctx: &RunContext,
        node: &str,
        commands: &[String],
    ) -> Result<String, RemoteError> {
        self.run(ctx, node, commands, OutputMode::Capture).await
    }
}

/// Passphrase for a key from the environment, chosen by whether the key looks like an etcd key
pub(crate) fn passphrase_from_env<F>(key_path: &Path, env: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let is_etcd_key = key_path
        .to_string_lossy()
        .to_ascii_lowercase()
        .contains("etcd");
    let role_var = if is_etcd_key {
        ENV_PASSPHRASE_ETCD
    } else {
        ENV_PASSPHRASE_CONTROL_PLANE
    };
    env(role_var)
        .filter(|v| !v.is_empty())
        .or_else(|| env(ENV_PASSPHRASE_FALLBACK).filter(|v| !v.is_empty()))
}

fn build_exec_args(container: &str, user: &str, node: &str, script: &str) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        "-i".to_string(),
        "-e".to_string(),
        format!("SSH_AUTH_SOCK={}", AGENT_SOCKET),
        container.to_string(),
        "ssh".to_string(),
    ];
    args.extend(SSH_BASE_OPTIONS.iter().map(|s| s.to_string()));
    args.push(format!("{}@{}", user, node));
    args.push(script.to_string());
    args
}

/// Shell run inside the container to start the agent (unless running) and add the key
///
/// With a passphrase the key is added through an askpass helper that reads
/// the value from its environment.
fn build_agent_script(key_path: &Path, agent_ready: bool, with_passphrase: bool) -> String {
    let key = shell_escape(&key_path.display().to_string());
    let mut lines = vec!["set -e".to_string()];
    if !agent_ready {
        lines.push(format!("rm -f {}", AGENT_SOCKET));
        lines.push(format!("ssh-agent -a {} > /dev/null", AGENT_SOCKET));
    }
    if with_passphrase {
        lines.push(format!(
            "printf '%s\\n' '#!/bin/sh' 'echo \"${}\"' > {}",
            ASKPASS_VALUE_VAR, ASKPASS_PATH
        ));
        lines.push(format!("chmod 700 {}", ASKPASS_PATH));
        lines.push(format!("trap 'rm -f {}' EXIT", ASKPASS_PATH));
        lines.push(format!(
            "SSH_ASKPASS={} SSH_ASKPASS_REQUIRE=force DISPLAY=:0 ssh-add {} < /dev/null",
            ASKPASS_PATH, key
        ));
    } else {
        lines.push(format!("ssh-add {}", key));
    }
    if !agent_ready {
        lines.push(format!("touch {}", AGENT_SENTINEL));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passphrase_from_env_prefers_role() {
        let env = |key: &str| match key {
            ENV_PASSPHRASE_ETCD => Some("etcd-pass".to_string()),
            ENV_PASSPHRASE_FALLBACK => Some("shared".to_string()),
            _ => None,
        };
        assert_eq!(
            passphrase_from_env(Path::new("/keys/etcd_id_rsa"), env).as_deref(),
            Some("etcd-pass")
        );
        assert_eq!(
            passphrase_from_env(Path::new("/keys/cp_id_rsa"), env).as_deref(),
            Some("shared")
        );
        assert_eq!(passphrase_from_env(Path::new("/keys/cp"), |_: &str| None), None);
    }

    #[test]
    fn test_exec_args() {
        let args = build_exec_args("eksa-tools", "ec2-user", "10.0.0.5", "sudo true");
        assert_eq!(args[0], "exec");
        assert_eq!(args[3], format!("SSH_AUTH_SOCK={}", AGENT_SOCKET));
        assert_eq!(args[4], "eksa-tools");
        assert_eq!(args[5], "ssh");
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert_eq!(args[args.len() - 2], "ec2-user@10.0.0.5");
        assert_eq!(args[args.len() - 1], "sudo true");
    }

    #[test]
    fn test_agent_script_first_start() {
        let script = build_agent_script(Path::new("/keys/id"), false, true);
        assert!(script.contains(&format!("ssh-agent -a {}", AGENT_SOCKET)));
        assert!(script.contains("SSH_ASKPASS_REQUIRE=force"));
        assert!(script.contains(&format!("touch {}", AGENT_SENTINEL)));
        assert!(!script.contains("secret"));
    }

    #[test]
    fn test_agent_script_reuses_running_agent() {
        let script = build_agent_script(Path::new("/keys/id"), true, false);
        assert!(!script.contains("ssh-agent -a"));
        assert!(!script.contains("touch"));
        assert!(script.ends_with("ssh-add /keys/id"));
    }

    #[tokio::test]
    async fn test_run_before_init_fails() {
        let runner = DockerSshRunner::with_env("tools", ExecOptions::default(), |_| None);
        let err = runner
            .run_command(&RunContext::new(), "10.0.0.1", &["true".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::NotInitialized));
    }

    #[tokio::test]
    async fn test_agent_checks_report_absent_container() {
        let runner = DockerSshRunner::with_env(
            "certrenew-test-no-such-container",
            ExecOptions::default(),
            |_| None,
        );
        assert!(!runner.agent_has_keys().await);
        assert!(!runner.agent_running().await);
    }
}
