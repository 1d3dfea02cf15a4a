//! Node discovery from Cluster API machines

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use super::{ClusterApi, Machine};
use crate::config::{OsFamily, RenewalConfig, SshConfig};
use crate::ssh::RunContext;

pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";
pub const EXTERNAL_ETCD_LABEL: &str = "cluster.x-k8s.io/etcd-cluster";

fn with_label<'a>(machines: &'a [Machine], label: &'a str) -> impl Iterator<Item = &'a Machine> {
    machines.iter().filter(move |m| m.has_label(label))
}

fn addresses_with_label(machines: &[Machine], label: &str) -> Vec<String> {
    with_label(machines, label)
        .filter_map(|m| match m.node_address() {
            Some(address) => Some(address.to_string()),
            None => {
                debug!(machine = %m.name, "skipping machine without an address");
                None
            }
        })
        .collect()
}

/// OS of the first control-plane machine that reports one
fn detect_os(machines: &[Machine]) -> Option<OsFamily> {
    let image = with_label(machines, CONTROL_PLANE_LABEL).find_map(|m| m.os_image.as_deref())?;
    let os = OsFamily::from_os_image(image);
    if os.is_none() {
        warn!(os_image = image, "⚠ Could not detect OS family from node image");
    }
    os
}

fn default_user(ssh: &mut SshConfig, os: Option<OsFamily>, section: &str) {
    if !ssh.user.is_empty() {
        return;
    }
    if let Some(user) = os.and_then(|os| os.default_ssh_user()) {
        info!(section, user, "Using default SSH user for the node OS");
        ssh.user = user.to_string();
    }
}

/// Fill empty node lists from the cluster's machines
///
/// Skipped entirely when control-plane nodes are already configured. Besides
/// the addresses, a missing OS is taken from the first control-plane node's
/// image, empty SSH users get the OS default, and discovered etcd nodes
/// without credentials of their own reuse the control-plane ones.
pub async fn populate_config(
    ctx: &RunContext,
    cfg: &mut RenewalConfig,
    api: &dyn ClusterApi,
) -> Result<()> {
    if !cfg.control_plane.nodes.is_empty() {
        return Ok(());
    }

    let machines = api
        .list_machines(ctx, &cfg.cluster_name)
        .await
        .context("cluster is not reachable")?;
    let control_plane = addresses_with_label(&machines, CONTROL_PLANE_LABEL);
    if control_plane.is_empty() {
        bail!("no control plane IPs found for cluster {}", cfg.cluster_name);
    }
    let etcd = addresses_with_label(&machines, EXTERNAL_ETCD_LABEL);

    info!(
        control_plane = control_plane.len(),
        etcd = etcd.len(),
        "Discovered cluster nodes"
    );

    if cfg.os_family().is_none()
        && let Some(os) = detect_os(&machines)
    {
        info!(os = %os, "Detected node OS from the cluster");
        cfg.os = Some(os);
    }
    let os = cfg.os_family();

    cfg.control_plane.nodes = control_plane;
    default_user(&mut cfg.control_plane.ssh, os, "control-plane");

    if !etcd.is_empty() {
        cfg.etcd.nodes = etcd;
        let shared = &cfg.control_plane.ssh;
        let ssh = &mut cfg.etcd.ssh;
        if ssh.key_path.as_os_str().is_empty() {
            ssh.key_path = shared.key_path.clone();
            if ssh.passphrase.is_none() {
                ssh.passphrase = shared.passphrase.clone();
            }
        }
        if ssh.user.is_empty() {
            ssh.user = shared.user.clone();
        }
    }
    Ok(())
}
