use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use yaml_rust::{Yaml, YamlLoader};

use super::{Component, NodeConfig, OsFamily, RenewalConfig, SshConfig};
use crate::error::ConfigError;

pub const ENV_PASSPHRASE_CONTROL_PLANE: &str = "CERTRENEW_SSH_KEY_PASSPHRASE_CP";
pub const ENV_PASSPHRASE_ETCD: &str = "CERTRENEW_SSH_KEY_PASSPHRASE_ETCD";
pub const ENV_PASSPHRASE_FALLBACK: &str = "CERTRENEW_SSH_KEY_PASSPHRASE";

/// Load a renewal configuration from a YAML file, taking passphrases from the process environment
pub fn load_config(path: &Path) -> Result<RenewalConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Same as [`load_config`] with an explicit environment lookup
pub fn load_config_with_env<F>(path: &Path, env: F) -> Result<RenewalConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut cfg = parse_config(&contents)?;
    inject_env_passphrases(&mut cfg, env);
    debug!(path = %path.display(), cluster = %cfg.cluster_name, "loaded renewal config");
    Ok(cfg)
}

/// Parse the YAML text of a renewal configuration
///
/// Only the shape is checked here. Required fields are enforced by [`validate_config`].
pub fn parse_config(contents: &str) -> Result<RenewalConfig, ConfigError> {
    let docs = YamlLoader::load_from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let root = match docs.into_iter().next() {
        Some(doc @ Yaml::Hash(_)) => doc,
        Some(Yaml::Null) | None => return Ok(RenewalConfig::default()),
        Some(_) => {
            return Err(ConfigError::Parse(
                "top level must be a mapping".to_string(),
            ));
        }
    };

    Ok(RenewalConfig {
        cluster_name: scalar_to_string(&root["clusterName"]).unwrap_or_default(),
        os: parse_os(&root["os"])?,
        control_plane: parse_node_config(&root["controlPlane"], "controlPlane")?,
        etcd: parse_node_config(&root["etcd"], "etcd")?,
    })
}

fn parse_node_config(node: &Yaml, section: &str) -> Result<NodeConfig, ConfigError> {
    match node {
        Yaml::BadValue | Yaml::Null => return Ok(NodeConfig::default()),
        Yaml::Hash(_) => {}
        _ => {
            return Err(ConfigError::Parse(format!("{} must be a mapping", section)));
        }
    }

    let nodes = match &node["nodes"] {
        Yaml::Array(items) => items
            .iter()
            .map(|item| {
                scalar_to_string(item).ok_or_else(|| {
                    ConfigError::Parse(format!("{}.nodes entries must be scalars", section))
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        Yaml::BadValue | Yaml::Null => Vec::new(),
        _ => {
            return Err(ConfigError::Parse(format!("{}.nodes must be a list", section)));
        }
    };

    let ssh = &node["ssh"];
    Ok(NodeConfig {
        nodes: nodes.into_iter().filter(|n| !n.trim().is_empty()).collect(),
        os: parse_os(&node["os"])?,
        ssh: SshConfig {
            user: scalar_to_string(&ssh["sshUser"]).unwrap_or_default(),
            key_path: scalar_to_string(&ssh["sshKey"])
                .map(PathBuf::from)
                .unwrap_or_default(),
            passphrase: scalar_to_string(&ssh["sshPasswd"]).filter(|p| !p.is_empty()),
        },
    })
}

fn parse_os(value: &Yaml) -> Result<Option<OsFamily>, ConfigError> {
    match scalar_to_string(value) {
        Some(os) if !os.trim().is_empty() => os.parse().map(Some),
        _ => Ok(None),
    }
}

/// YAML scalars are read as text regardless of how the parser typed them
fn scalar_to_string(value: &Yaml) -> Option<String> {
    match value {
        Yaml::String(s) => Some(s.clone()),
        Yaml::Integer(i) => Some(i.to_string()),
        Yaml::Real(r) => Some(r.clone()),
        Yaml::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Fill in missing key passphrases from the environment
///
/// Role specific variables win over the shared fallback. A passphrase already
/// present in the file is never replaced.
pub fn inject_env_passphrases<F>(cfg: &mut RenewalConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |role_var: &str| {
        env(role_var)
            .filter(|v| !v.is_empty())
            .or_else(|| env(ENV_PASSPHRASE_FALLBACK).filter(|v| !v.is_empty()))
    };

    if cfg.control_plane.ssh.passphrase.is_none() {
        cfg.control_plane.ssh.passphrase = lookup(ENV_PASSPHRASE_CONTROL_PLANE);
    }
    if cfg.etcd.ssh.passphrase.is_none() {
        cfg.etcd.ssh.passphrase = lookup(ENV_PASSPHRASE_ETCD);
    }
}

/// Validate a configuration against the component selected on the command line
pub fn validate_config(cfg: &RenewalConfig, component: &str) -> Result<Component, ConfigError> {
    let component = Component::parse(component)?;

    if cfg.cluster_name.trim().is_empty() {
        return Err(ConfigError::MissingClusterName);
    }
    if cfg.os_family().is_none() {
        return Err(ConfigError::MissingOs);
    }
    if cfg.control_plane.is_empty() {
        return Err(ConfigError::MissingControlPlaneNodes);
    }

    validate_node_config(&cfg.control_plane, "control-plane")?;
    if !cfg.etcd.is_empty() {
        validate_node_config(&cfg.etcd, "etcd")
            .map_err(|e| ConfigError::EtcdSection(Box::new(e)))?;
    }

    if component == Component::Etcd && !cfg.has_external_etcd() {
        return Err(ConfigError::NoEtcdNodes);
    }

    Ok(component)
}

fn validate_node_config(node: &NodeConfig, section: &'static str) -> Result<(), ConfigError> {
    node.validate_credentials(section)?;
    fs::metadata(&node.ssh.key_path).map_err(|source| ConfigError::SshKeyNotFound {
        path: node.ssh.key_path.clone(),
        source,
    })?;
    Ok(())
}
