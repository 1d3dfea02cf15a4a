use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, error, info};

use super::commands::linux::{
    LinuxCertTransport, LinuxControlPlaneCommandBuilder, LinuxEtcdCommandBuilder,
};
use super::commands::{CertificatePaths, backup_timestamp};
use super::{OsStrategy, ensure_etcd_client_staged, run_step};
use crate::config::{Component, OsFamily, RenewalConfig};
use crate::ssh::{RemoteRunner, RunContext};
use crate::staging::{self, BackupWorkspace};

/// Ubuntu and RHEL nodes with kubeadm and etcdadm installed on the host
pub struct LinuxStrategy {
    os: OsFamily,
    paths: CertificatePaths,
    transport: LinuxCertTransport,
}

impl LinuxStrategy {
    pub fn new(os: OsFamily) -> Self {
        Self::with_paths(os, CertificatePaths::LINUX)
    }

    pub fn with_paths(os: OsFamily, paths: CertificatePaths) -> Self {
        Self {
            os,
            paths,
            transport: LinuxCertTransport::new(paths),
        }
    }
}

#[async_trait]
impl OsStrategy for LinuxStrategy {
    async fn renew_control_plane_certs(
        &self,
        ctx: &RunContext,
        runner: &dyn RemoteRunner,
        node: &str,
        cfg: &RenewalConfig,
        component: Component,
        ws: &BackupWorkspace,
    ) -> Result<()> {
        debug!(node, os = %self.os, "Processing control plane node");
        ensure_etcd_client_staged(cfg, node, ws)?;

        let external_etcd = cfg.has_external_etcd();
        let cmds = LinuxControlPlaneCommandBuilder::new(
            self.paths,
            backup_timestamp(),
            component,
            external_etcd,
        )
        .build();

        run_step(ctx, runner, node, &cmds.backup, "backup certs").await?;
        if external_etcd {
            staging::transfer_certs_to_control_plane(ctx, runner, &self.transport, node, ws)
                .await
                .inspect_err(|_| error!(node, "✗ Failed to transfer etcd client certificates"))
                .context("transfer certificates to control plane node")?;
        }
        run_step(ctx, runner, node, &cmds.renew, "renew certs").await?;
        if external_etcd {
            run_step(ctx, runner, node, &cmds.install_etcd_client, "install etcd client certs")
                .await?;
        }
        run_step(ctx, runner, node, &cmds.validate, "validate certs").await?;
        run_step(ctx, runner, node, &cmds.restart, "restart pods").await?;

        info!(node, "✓ Renewed certificates for control plane node");
        Ok(())
    }

    async fn renew_etcd_certs(
        &self,
        ctx: &RunContext,
        runner: &dyn RemoteRunner,
        node: &str,
        ws: &BackupWorkspace,
    ) -> Result<()> {
        debug!(node, os = %self.os, "Processing etcd node");
        let cmds = LinuxEtcdCommandBuilder::new(self.paths, backup_timestamp()).build();

        run_step(ctx, runner, node, &cmds.backup, "backup certs").await?;
        run_step(ctx, runner, node, &cmds.renew, "renew certs").await?;
        run_step(ctx, runner, node, &cmds.validate, "validate certs").await?;

        staging::copy_etcd_certs(ctx, runner, &self.transport, node, ws)
            .await
            .inspect_err(|_| error!(node, "✗ Failed to copy certificates from node"))
            .context("copy certs")?;

        info!(node, "✓ Renewed certificates for etcd node");
        Ok(())
    }
}
