//! Error types shared across the renewal workflow
//!
//! Each seam of the workflow has its own typed error so callers can tell a
//! validation problem from a connectivity problem from a failed remote step.
//! The strategies and the orchestrator wrap these in `anyhow` context chains.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::ssh::CancelReason;

/// Failures produced while loading or validating a renewal configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid component {0:?}, must be either \"etcd\" or \"control-plane\"")]
    InvalidComponent(String),

    #[error("unsupported os {0:?}, must be one of ubuntu, rhel, bottlerocket")]
    UnsupportedOs(String),

    #[error("clusterName is required")]
    MissingClusterName,

    #[error("os is required")]
    MissingOs,

    #[error("at least one control plane node is required")]
    MissingControlPlaneNodes,

    #[error("sshUser is required for {section} nodes")]
    MissingSshUser { section: &'static str },

    #[error("sshKey is required for {section} nodes")]
    MissingSshKey { section: &'static str },

    #[error("ssh key {}: {source}", path.display())]
    SshKeyNotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("component \"etcd\" selected but no etcd nodes are configured")]
    NoEtcdNodes,

    #[error("validating etcd config: {0}")]
    EtcdSection(Box<ConfigError>),

    #[error("reading config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parsing config file: {0}")]
    Parse(String),
}

/// Failures from the remote command executor
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("no command provided")]
    NoCommand,

    #[error("ssh configuration has not been initialized")]
    NotInitialized,

    #[error("{0} binary not found in PATH")]
    BinaryNotFound(&'static str),

    #[error("ssh key {}: {source}", path.display())]
    KeyNotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("initializing ssh-agent: {0}")]
    Agent(String),

    #[error("failed to connect to node {node}: {output}")]
    Connect { node: String, output: String },

    #[error("creating session with {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("command on node {node} exited with status {code}: {output}")]
    Exit {
        node: String,
        code: i32,
        output: String,
    },

    #[error("cancelling command on node {node}: {reason}")]
    Cancelled { node: String, reason: CancelReason },
}

impl RemoteError {
    /// Remote output captured before the failure, if any
    pub fn output(&self) -> Option<&str> {
        match self {
            RemoteError::Connect { output, .. } | RemoteError::Exit { output, .. } => {
                Some(output.as_str()).filter(|o| !o.is_empty())
            }
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RemoteError::Cancelled { .. })
    }
}

/// Failures from the cluster API capability
#[derive(Debug, Error)]
pub enum ClusterApiError {
    #[error("kubernetes API server is not reachable: {0}")]
    Unreachable(String),

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("kubectl {action} failed: {output}")]
    Command { action: String, output: String },

    #[error("kubectl {action}: {reason}")]
    Cancelled {
        action: String,
        reason: CancelReason,
    },

    #[error("running kubectl: {0}")]
    Io(#[from] io::Error),

    #[error("decoding kubectl output: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClusterApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterApiError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterApiError::AlreadyExists { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_output() {
        let err = RemoteError::Exit {
            node: "10.0.0.1".to_string(),
            code: 1,
            output: "kubeadm: command not found".to_string(),
        };
        assert_eq!(err.output(), Some("kubeadm: command not found"));
        assert!(err.to_string().contains("10.0.0.1"));
        assert!(err.to_string().contains("status 1"));

        let empty = RemoteError::Exit {
            node: "n".to_string(),
            code: 2,
            output: String::new(),
        };
        assert_eq!(empty.output(), None);
        assert_eq!(RemoteError::NoCommand.output(), None);
    }

    #[test]
    fn test_etcd_section_wraps_message() {
        let err = ConfigError::EtcdSection(Box::new(ConfigError::MissingSshUser { section: "etcd" }));
        assert_eq!(
            err.to_string(),
            "validating etcd config: sshUser is required for etcd nodes"
        );
    }
}
