use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    ExecOptions, OutputMode, RemoteRunner, RunContext, SSH_BASE_OPTIONS, join_commands,
    log_check_results, run_child,
};
use crate::config::SshConfig;
use crate::error::RemoteError;
use crate::utils::local;

/// Environment variable carrying the passphrase to the askpass helper
pub(crate) const ASKPASS_VALUE_VAR: &str = "CERTRENEW_ASKPASS_VALUE";

/// Runs the system `ssh` client from this process
pub struct DirectSshRunner {
    options: ExecOptions,
    state: Mutex<Option<DirectState>>,
}

struct DirectState {
    user: String,
    key_path: PathBuf,
    auth: DirectAuth,
}

enum DirectAuth {
    /// Unencrypted key passed with `-i`
    KeyFile,
    /// Passphrase protected key loaded into a private agent
    Agent(LocalAgent),
}

/// ssh-agent started for this process; killed on drop
pub(crate) struct LocalAgent {
    socket: String,
    pid: String,
}

impl Drop for LocalAgent {
    fn drop(&mut self) {
        let _ = std::process::Command::new("ssh-agent")
            .arg("-k")
            .env("SSH_AUTH_SOCK", &self.socket)
            .env("SSH_AGENT_PID", &self.pid)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

impl DirectSshRunner {
    pub fn new(options: ExecOptions) -> Self {
        Self {
            options,
            state: Mutex::new(None),
        }
    }

    fn command(&self, state: &DirectState, node: &str, script: &str) -> Command {
        let mut cmd = Command::new("ssh");
        let identity = match state.auth {
            DirectAuth::KeyFile => Some(state.key_path.as_path()),
            DirectAuth::Agent(_) => None,
        };
        cmd.args(build_ssh_args(&state.user, identity, node, script));
        if let DirectAuth::Agent(agent) = &state.auth {
            cmd.env("SSH_AUTH_SOCK", &agent.socket);
        }
        cmd
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

        debug!(node, user = %state.user, "running remote command");
        let output = run_child(ctx, node, self.command(state, node, &script), mode).await?;
        log_check_results(&self.options, node, &script, &output);
        Ok(output)
    }
}

#[async_trait]
impl RemoteRunner for DirectSshRunner {
    async fn init_ssh_config(&self, ssh: &SshConfig) -> Result<(), RemoteError> {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_ref()
            && state.key_path == ssh.key_path
            && state.user == ssh.user
        {
            return Ok(());
        }

        for binary in ["ssh", "ssh-keygen"] {
            if !local::check_command_exists(binary) {
                return Err(RemoteError::BinaryNotFound(binary));
            }
        }
        std::fs::metadata(&ssh.key_path).map_err(|source| RemoteError::KeyNotFound {
            path: ssh.key_path.clone(),
            source,
        })?;

        let auth = if key_is_unencrypted(&ssh.key_path).await {
            DirectAuth::KeyFile
        } else {
            info!(key = %ssh.key_path.display(), "SSH key is passphrase protected, loading it into ssh-agent");
            DirectAuth::Agent(start_agent(&ssh.key_path, ssh.passphrase.as_deref()).await?)
        };

        // Drops any agent from the previous credentials
        *guard = Some(DirectState {
            user: ssh.user.clone(),
            key_path: ssh.key_path.clone(),
            auth,
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

/// `identity` is passed with `-i` unless the key lives in an agent
fn build_ssh_args(user: &str, identity: Option<&Path>, node: &str, script: &str) -> Vec<String> {
    let mut args: Vec<String> = SSH_BASE_OPTIONS.iter().map(|s| s.to_string()).collect();
    if let Some(key_path) = identity {
        args.extend([
            "-i".to_string(),
            key_path.display().to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
        ]);
    }
    args.push(format!("{}@{}", user, node));
    args.push(script.to_string());
    args
}

/// An empty passphrase opens unencrypted keys only
async fn key_is_unencrypted(key_path: &Path) -> bool {
    let key = key_path.display().to_string();
    match local::execute("ssh-keygen", &["-y", "-P", "", "-f", &key]).await {
        Ok(output) => output.status.success(),
        Err(e) => {
            debug!(error = %e, "ssh-keygen passphrase check failed");
            false
        }
    }
}

async fn start_agent(key_path: &Path, passphrase: Option<&str>) -> Result<LocalAgent, RemoteError> {
    for binary in ["ssh-agent", "ssh-add"] {
        if !local::check_command_exists(binary) {
            return Err(RemoteError::BinaryNotFound(binary));
        }
    }

    let output = local::execute("ssh-agent", &["-s"])
        .await
        .map_err(|e| RemoteError::Agent(format!("{:#}", e)))?;
    if !output.status.success() {
        return Err(RemoteError::Agent(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    let (socket, pid) = parse_agent_env(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| RemoteError::Agent("unexpected ssh-agent output".to_string()))?;
    let agent = LocalAgent { socket, pid };

    let mut add = Command::new("ssh-add");
    add.arg(key_path).env("SSH_AUTH_SOCK", &agent.socket);

    // Keep the helper alive until ssh-add exits
    let _askpass = match passphrase {
        Some(passphrase) => {
            let helper = write_askpass_helper()?;
            add.env("SSH_ASKPASS", &*helper)
                .env("SSH_ASKPASS_REQUIRE", "force")
                .env("DISPLAY", ":0")
                .env(ASKPASS_VALUE_VAR, passphrase)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped());
            Some(helper)
        }
        None => {
            warn!(key = %key_path.display(), "No passphrase configured, ssh-add will prompt");
            add.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            None
        }
    };

    let result = add
        .output()
        .await
        .map_err(|e| RemoteError::Agent(format!("running ssh-add: {}", e)))?;
    if !result.status.success() {
        return Err(RemoteError::Agent(format!(
            "ssh-add {}: {}",
            key_path.display(),
            String::from_utf8_lossy(&result.stderr).trim()
        )));
    }
    Ok(agent)
}

/// Script that prints the passphrase from its environment, never from disk
fn write_askpass_helper() -> Result<tempfile::TempPath, RemoteError> {
    let file = tempfile::Builder::new()
        .prefix("certrenew-askpass")
        .tempfile()
        .map_err(|e| RemoteError::Agent(format!("creating askpass helper: {}", e)))?;
    let path = file.into_temp_path();
    let script = format!("#!/bin/sh\necho \"${}\"\n", ASKPASS_VALUE_VAR);
    std::fs::write(&path, script)
        .map_err(|e| RemoteError::Agent(format!("writing askpass helper: {}", e)))?;
    local::set_permissions(&path, 0o700)
        .map_err(|e| RemoteError::Agent(format!("{:#}", e)))?;
    Ok(path)
}

/// Socket and pid from the Bourne shell output of `ssh-agent -s`
pub(crate) fn parse_agent_env(output: &str) -> Option<(String, String)> {
    let mut socket = None;
    let mut pid = None;
    for statement in output.split([';', '\n']) {
        let statement = statement.trim();
        if let Some(value) = statement.strip_prefix("SSH_AUTH_SOCK=") {
            socket = Some(value.to_string());
        } else if let Some(value) = statement.strip_prefix("SSH_AGENT_PID=") {
            pid = Some(value.to_string());
        }
    }
    Some((socket?, pid?))
}
