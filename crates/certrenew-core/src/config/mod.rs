//! Renewal configuration model
//!
//! The configuration names the cluster, the control-plane and external etcd
//! nodes, their operating system family and the SSH credentials used to reach
//! them. It is loaded once by the CLI and only read by the workflow.

pub mod loader;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;

pub use loader::{inject_env_passphrases, load_config, load_config_with_env, parse_config, validate_config};

pub const COMPONENT_ETCD: &str = "etcd";
pub const COMPONENT_CONTROL_PLANE: &str = "control-plane";

/// Operating system family of the cluster nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsFamily {
    Ubuntu,
    Rhel,
    Bottlerocket,
}

impl OsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Ubuntu => "ubuntu",
            OsFamily::Rhel => "rhel",
            OsFamily::Bottlerocket => "bottlerocket",
        }
    }

    /// Immutable hosts have no writable root and no renewal binaries installed
    pub fn is_immutable(&self) -> bool {
        matches!(self, OsFamily::Bottlerocket)
    }

    /// Family named by a node's `osImage`, e.g. `Ubuntu 22.04.4 LTS`
    pub fn from_os_image(os_image: &str) -> Option<Self> {
        let image = os_image.to_ascii_lowercase();
        if image.contains("bottlerocket") {
            Some(OsFamily::Bottlerocket)
        } else if image.contains("ubuntu") {
            Some(OsFamily::Ubuntu)
        } else if image.contains("rhel") || image.contains("red hat") {
            Some(OsFamily::Rhel)
        } else {
            None
        }
    }

    /// Login user baked into the family's images; RHEL images have none
    pub fn default_ssh_user(&self) -> Option<&'static str> {
        match self {
            OsFamily::Ubuntu => Some("ubuntu"),
            OsFamily::Bottlerocket => Some("ec2-user"),
            OsFamily::Rhel => None,
        }
    }
}

impl FromStr for OsFamily {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ubuntu" => Ok(OsFamily::Ubuntu),
            "rhel" | "redhat" => Ok(OsFamily::Rhel),
            "bottlerocket" => Ok(OsFamily::Bottlerocket),
            _ => Err(ConfigError::UnsupportedOs(s.to_string())),
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which node roles a run should renew
///
/// The empty selector means both etcd and control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Component {
    #[default]
    All,
    Etcd,
    ControlPlane,
}

impl Component {
    pub fn parse(selector: &str) -> Result<Self, ConfigError> {
        match selector {
            "" => Ok(Component::All),
            COMPONENT_ETCD => Ok(Component::Etcd),
            COMPONENT_CONTROL_PLANE => Ok(Component::ControlPlane),
            other => Err(ConfigError::InvalidComponent(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::All => "",
            Component::Etcd => COMPONENT_ETCD,
            Component::ControlPlane => COMPONENT_CONTROL_PLANE,
        }
    }

    pub fn includes_etcd(&self) -> bool {
        matches!(self, Component::All | Component::Etcd)
    }

    pub fn includes_control_plane(&self) -> bool {
        matches!(self, Component::All | Component::ControlPlane)
    }

    /// True when only the control plane is renewed, so etcd material must come from elsewhere
    pub fn is_control_plane_only(&self) -> bool {
        matches!(self, Component::ControlPlane)
    }
}

impl FromStr for Component {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Component::parse(s)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::All => f.write_str("all"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// SSH credential bundle for one node role
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SshConfig {
    pub user: String,
    pub key_path: PathBuf,
    pub passphrase: Option<String>,
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("user", &self.user)
            .field("key_path", &self.key_path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Nodes of one role together with how to reach them
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub nodes: Vec<String>,
    pub os: Option<OsFamily>,
    pub ssh: SshConfig,
}

impl NodeConfig {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes that will be contacted need a username and a key path
    pub fn validate_credentials(&self, section: &'static str) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Ok(());
        }
        if self.ssh.user.trim().is_empty() {
            return Err(ConfigError::MissingSshUser { section });
        }
        if self.ssh.key_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingSshKey { section });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenewalConfig {
    pub cluster_name: String,
    /// Top-level override applied to both node roles
    pub os: Option<OsFamily>,
    pub control_plane: NodeConfig,
    pub etcd: NodeConfig,
}

impl RenewalConfig {
    pub fn has_external_etcd(&self) -> bool {
        !self.etcd.nodes.is_empty()
    }

    /// OS family used to pick the command strategy
    pub fn os_family(&self) -> Option<OsFamily> {
        self.os.or(self.control_plane.os).or(self.etcd.os)
    }
}
