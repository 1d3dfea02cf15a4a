//! Remote command execution over SSH
//!
//! Commands are POSIX shell fragments run on a named node. Two backends drive
//! the system OpenSSH client: [`DirectSshRunner`] runs `ssh` from this process
//! and [`DockerSshRunner`] runs it inside a helper container that has network
//! reach to the nodes. Every call is raced against a [`RunContext`] so a
//! cancelled run returns promptly.

mod context;
pub mod direct;
pub mod docker;

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::config::SshConfig;
use crate::error::RemoteError;

pub use context::{CancelReason, RunContext};
pub use direct::DirectSshRunner;
pub use docker::DockerSshRunner;

/// Options passed to every ssh invocation
pub(crate) const SSH_BASE_OPTIONS: [&str; 6] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "ConnectTimeout=30", // 30 second timeout for initial connections
    "-o",
    "BatchMode=yes",
];

const CHECK_EXPIRATION_MARKER: &str = "certs check-expiration";

/// Executes shell commands on cluster nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    /// Prepare credentials for the nodes that follow
    ///
    /// Calling again with the same key is a no-op.
    async fn init_ssh_config(&self, ssh: &SshConfig) -> Result<(), RemoteError>;

    /// Run `commands` joined with `&&` on `node`
    async fn run_command(
        &self,
        ctx: &RunContext,
        node: &str,
        commands: &[String],
    ) -> Result<(), RemoteError>;

    /// Run `commands` on `node` and return trimmed stdout
    async fn run_command_with_output(
        &self,
        ctx: &RunContext,
        node: &str,
        commands: &[String],
    ) -> Result<String, RemoteError>;
}

/// Executor settings fixed at construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// 0 captures output, 1 also surfaces certificate checks, 2+ streams remote output
    pub verbosity: u8,
}

impl ExecOptions {
    pub fn new(verbosity: u8) -> Self {
        Self { verbosity }
    }

    pub fn streams_output(&self) -> bool {
        self.verbosity >= 2
    }

    pub fn shows_check_results(&self) -> bool {
        self.verbosity >= 1
    }

    pub(crate) fn mode_for_run(&self) -> OutputMode {
        if self.streams_output() {
            OutputMode::Stream
        } else {
            OutputMode::Capture
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputMode {
    Capture,
    Stream,
}

pub(crate) fn join_commands(commands: &[String]) -> Result<String, RemoteError> {
    if commands.is_empty() || commands.iter().all(|c| c.trim().is_empty()) {
        return Err(RemoteError::NoCommand);
    }
    Ok(commands.join(" && "))
}

/// Spawn `cmd` and wait for it unless `ctx` finishes first
///
/// The child is killed when the wait is abandoned. ssh reserves exit status 255
/// for its own failures, which are reported as connection errors.
pub(crate) async fn run_child(
    ctx: &RunContext,
    node: &str,
    mut cmd: Command,
    mode: OutputMode,
) -> Result<String, RemoteError> {
    if let Some(reason) = ctx.err() {
        return Err(RemoteError::Cancelled {
            node: node.to_string(),
            reason,
        });
    }

    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    match mode {
        OutputMode::Capture => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        OutputMode::Stream => {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
    }
    cmd.stdin(Stdio::null()).kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| RemoteError::Spawn {
        program: program.clone(),
        source,
    })?;

    let mut task = tokio::spawn(child.wait_with_output());
    let joined = tokio::select! {
        reason = ctx.done() => {
            task.abort();
            return Err(RemoteError::Cancelled {
                node: node.to_string(),
                reason,
            });
        }
        joined = &mut task => joined,
    };

    let output = joined
        .map_err(std::io::Error::other)
        .and_then(|result| result)
        .map_err(|source| RemoteError::Spawn { program, source })?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let combined = match (stdout.is_empty(), stderr.is_empty()) {
        (false, false) => format!("{}\n{}", stdout, stderr),
        (false, true) => stdout,
        _ => stderr,
    };

    match output.status.code() {
        Some(255) => Err(RemoteError::Connect {
            node: node.to_string(),
            output: combined,
        }),
        code => Err(RemoteError::Exit {
            node: node.to_string(),
            code: code.unwrap_or(-1),
            output: combined,
        }),
    }
}

/// Surface `kubeadm certs check-expiration` results line by line
pub(crate) fn log_check_results(options: &ExecOptions, node: &str, script: &str, output: &str) {
    if !options.shows_check_results() || !script.contains(CHECK_EXPIRATION_MARKER) {
        return;
    }
    info!(node, "Certificate check results");
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        info!("{}", line);
    }
}
