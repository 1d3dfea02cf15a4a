// Certrenew Core Library
// Renewal workflow, OS command strategies and remote command execution

pub mod cluster;
pub mod config;
pub mod error;
pub mod renewer;
pub mod ssh;
pub mod staging;
pub mod strategy;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used items
pub use config::{Component, NodeConfig, OsFamily, RenewalConfig, SshConfig};
pub use error::{ClusterApiError, ConfigError, RemoteError};
pub use renewer::{Renewer, RenewerOptions, RetryPolicy};
pub use ssh::{DirectSshRunner, DockerSshRunner, ExecOptions, RemoteRunner, RunContext};
