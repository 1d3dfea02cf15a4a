//! Per-OS renewal strategies
//!
//! A strategy is chosen once from the configured OS family and drives the
//! remote steps for a single node. Nodes are handed to it one at a time by
//! the renewer.

pub mod commands;
mod immutable;
mod linux;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tracing::error;

use crate::config::{Component, OsFamily, RenewalConfig};
use crate::ssh::{ExecOptions, RemoteRunner, RunContext};
use crate::staging::BackupWorkspace;

pub use commands::CertificatePaths;
pub use immutable::ImmutableStrategy;
pub use linux::LinuxStrategy;

#[async_trait]
pub trait OsStrategy: Send + Sync {
    /// Back up, renew, validate and restart the control plane on `node`
    ///
    /// With external etcd the etcd client pair must already be staged in `ws`.
    async fn renew_control_plane_certs(
        &self,
        ctx: &RunContext,
        runner: &dyn RemoteRunner,
        node: &str,
        cfg: &RenewalConfig,
        component: Component,
        ws: &BackupWorkspace,
    ) -> Result<()>;

    /// Renew etcd member certificates on `node` and stage its client pair in `ws`
    async fn renew_etcd_certs(
        &self,
        ctx: &RunContext,
        runner: &dyn RemoteRunner,
        node: &str,
        ws: &BackupWorkspace,
    ) -> Result<()>;
}

/// Strategy for `os`
pub fn build_strategy(os: OsFamily, options: ExecOptions) -> Box<dyn OsStrategy> {
    match os {
        OsFamily::Ubuntu | OsFamily::Rhel => Box::new(LinuxStrategy::new(os)),
        OsFamily::Bottlerocket => Box::new(ImmutableStrategy::new(options)),
    }
}

/// Run one step, logging which step failed on which node
pub(crate) async fn run_step(
    ctx: &RunContext,
    runner: &dyn RemoteRunner,
    node: &str,
    commands: &[String],
    step: &'static str,
) -> Result<()> {
    if let Err(e) = runner.run_command(ctx, node, commands).await {
        error!(node, step, "✗ Step failed");
        return Err(anyhow::Error::new(e).context(step));
    }
    Ok(())
}

/// Fail before touching the node when external etcd is used but no client pair is staged
pub(crate) fn ensure_etcd_client_staged(
    cfg: &RenewalConfig,
    node: &str,
    ws: &BackupWorkspace,
) -> Result<()> {
    if cfg.has_external_etcd() && !ws.has_etcd_client_pair() {
        bail!(
            "etcd client certificate is not staged for control plane node {}; renew etcd first or populate the certificate cache",
            node
        );
    }
    Ok(())
}
