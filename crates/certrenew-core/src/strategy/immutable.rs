use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, error, info};

use super::commands::sheltie::{
    BottlerocketCertTransport, BottlerocketControlPlaneCommandBuilder,
    BottlerocketEtcdCommandBuilder,
};
use super::commands::{CertificatePaths, backup_timestamp};
use super::{OsStrategy, ensure_etcd_client_staged, run_step};
use crate::config::{Component, RenewalConfig};
use crate::ssh::{ExecOptions, RemoteRunner, RunContext};
use crate::staging::{self, BackupWorkspace};

/// Bottlerocket nodes: privileged steps run under `sheltie`, tools come from the bootstrap image
pub struct ImmutableStrategy {
    paths: CertificatePaths,
    options: ExecOptions,
    transport: BottlerocketCertTransport,
}

impl ImmutableStrategy {
    pub fn new(options: ExecOptions) -> Self {
        Self {
            paths: CertificatePaths::BOTTLEROCKET,
            options,
            transport: BottlerocketCertTransport,
        }
    }
}

#[async_trait]
impl OsStrategy for ImmutableStrategy {
    async fn renew_control_plane_certs(
        &self,
        ctx: &RunContext,
        runner: &dyn RemoteRunner,
        node: &str,
        cfg: &RenewalConfig,
        component: Component,
        ws: &BackupWorkspace,
    ) -> Result<()> {
        debug!(node, "Processing control plane node");
        ensure_etcd_client_staged(cfg, node, ws)?;

        let external_etcd = cfg.has_external_etcd();
        if external_etcd {
            staging::transfer_certs_to_control_plane(ctx, runner, &self.transport, node, ws)
                .await
                .inspect_err(|_| error!(node, "✗ Failed to transfer etcd client certificates"))
                .context("transfer certificates to control plane node")?;
        }

        let cmds = BottlerocketControlPlaneCommandBuilder::new(
            self.paths,
            backup_timestamp(),
            component,
            external_etcd,
        )
        .build();
        run_step(
            ctx,
            runner,
            node,
            &cmds.renew_session().into_commands(),
            "renew control plane node certificates",
        )
        .await?;

        // A failed check does not fail the node
        if self.options.shows_check_results() {
            match runner
                .run_command_with_output(ctx, node, &cmds.check_session().into_commands())
                .await
            {
                Ok(_) => debug!(node, "Certificate check completed"),
                Err(e) => {
                    info!(node, error = %e, "Certificate check failed");
                    if let Some(output) = e.output() {
                        for line in output.lines().filter(|l| !l.is_empty()) {
                            info!(node, "  {}", line);
                        }
                    }
                }
            }
        }

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
        debug!(node, "Processing etcd node");
        let cmds = BottlerocketEtcdCommandBuilder::new(self.paths, backup_timestamp()).build();

        run_step(ctx, runner, node, &cmds.renew_session().into_commands(), "renew certs").await?;
        run_step(
            ctx,
            runner,
            node,
            &cmds.copy_session().into_commands(),
            "copy certificates to admin container",
        )
        .await?;

        debug!(node, "Copying certificates from node");
        staging::copy_etcd_certs(ctx, runner, &self.transport, node, ws)
            .await
            .inspect_err(|_| error!(node, "✗ Failed to copy certificates from node"))
            .context("copy certs")?;

        run_step(
            ctx,
            runner,
            node,
            &cmds.cleanup_session().into_commands(),
            "cleanup temporary files",
        )
        .await?;

        info!(node, "✓ Renewed certificates for etcd node");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, OsFamily};
    use crate::error::RemoteError;
    use crate::ssh::MockRemoteRunner;
    use crate::staging::EtcdClientPair;
    use crate::test_support::{RecordingRunner, TEST_CERT, TEST_KEY};

    fn config(etcd_nodes: &[&str]) -> RenewalConfig {
        RenewalConfig {
            cluster_name: "demo".to_string(),
            os: Some(OsFamily::Bottlerocket),
            control_plane: NodeConfig {
                nodes: vec!["10.0.0.1".to_string()],
                ..Default::default()
            },
            etcd: NodeConfig {
                nodes: etcd_nodes.iter().map(|n| n.to_string()).collect(),
                ..Default::default()
            },
        }
    }

    fn staged_workspace(tmp: &tempfile::TempDir) -> BackupWorkspace {
        let ws = BackupWorkspace::at(tmp.path().join("ws")).unwrap();
        ws.store_etcd_client_pair(&EtcdClientPair {
            cert: TEST_CERT.to_string(),
            key: TEST_KEY.to_string(),
        })
        .unwrap();
        ws
    }

    #[tokio::test]
    async fn test_control_plane_single_session() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = BackupWorkspace::at(tmp.path().join("ws")).unwrap();
        let runner = RecordingRunner::new();

        ImmutableStrategy::new(ExecOptions::default())
            .renew_control_plane_certs(&RunContext::new(), &runner, "10.0.0.1", &config(&[]), Component::All, &ws)
            .await
            .unwrap();

        let scripts = runner.scripts();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].starts_with("sudo sheltie << 'EOF'"));
        assert!(scripts[0].contains("certs renew all"));
        assert!(scripts[0].contains("static-pods.$pod.enabled=true"));
    }

    #[tokio::test]
    async fn test_control_plane_only_transfers_then_renews() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = staged_workspace(&tmp);
        let runner = RecordingRunner::new();

        ImmutableStrategy::new(ExecOptions::default())
            .renew_control_plane_certs(
                &RunContext::new(),
                &runner,
                "10.0.0.1",
                &config(&["10.0.0.10"]),
                Component::ControlPlane,
                &ws,
            )
            .await
            .unwrap();

        let scripts = runner.scripts();
        assert_eq!(scripts.len(), 2);
        assert!(scripts[0].contains("base64 -d > /tmp/etcd-client-certs/apiserver-etcd-client.crt"));
        assert!(scripts[1].contains("server-etcd-client.crt"));
        assert!(!scripts[1].contains("renew all"));
    }

    #[tokio::test]
    async fn test_missing_pair_is_fatal_without_commands() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = BackupWorkspace::at(tmp.path().join("ws")).unwrap();
        let runner = RecordingRunner::new();

        let err = ImmutableStrategy::new(ExecOptions::default())
            .renew_control_plane_certs(
                &RunContext::new(),
                &runner,
                "10.0.0.1",
                &config(&["10.0.0.10"]),
                Component::ControlPlane,
                &ws,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("etcd client certificate"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_check_is_tolerated() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = BackupWorkspace::at(tmp.path().join("ws")).unwrap();

        let mut runner = MockRemoteRunner::new();
        runner.expect_run_command().times(1).returning(|_, _, _| Ok(()));
        runner
            .expect_run_command_with_output()
            .withf(|_, _, cmds| cmds[0].contains("certs check-expiration"))
            .times(1)
            .returning(|_, node, _| {
                Err(RemoteError::Exit {
                    node: node.to_string(),
                    code: 1,
                    output: "open /etc/kubernetes/admin.conf: no such file".to_string(),
                })
            });

        ImmutableStrategy::new(ExecOptions::new(1))
            .renew_control_plane_certs(&RunContext::new(), &runner, "10.0.0.1", &config(&[]), Component::All, &ws)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_etcd_sessions_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = BackupWorkspace::at(tmp.path().join("ws")).unwrap();
        let runner = RecordingRunner::new();

        ImmutableStrategy::new(ExecOptions::default())
            .renew_etcd_certs(&RunContext::new(), &runner, "10.0.0.10", &ws)
            .await
            .unwrap();

        let scripts = runner.scripts();
        assert_eq!(scripts.len(), 6);
        assert!(scripts[0].contains("etcdadm join phase certificates"));
        assert!(scripts[1].contains("admin/rootfs/tmp/etcd-client-certs"));
        assert_eq!(scripts[2], "ls -l /tmp/etcd-client-certs");
        assert_eq!(scripts[3], "sudo cat /tmp/etcd-client-certs/apiserver-etcd-client.crt");
        assert_eq!(scripts[4], "sudo cat /tmp/etcd-client-certs/apiserver-etcd-client.key");
        assert!(scripts[5].contains("rm -rf"));
        assert_eq!(ws.load_etcd_client_pair().unwrap().key, TEST_KEY);
    }

    #[tokio::test]
    async fn test_etcd_renew_failure_skips_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = BackupWorkspace::at(tmp.path().join("ws")).unwrap();
        let runner = RecordingRunner::failing_on("etcdadm");

        let err = ImmutableStrategy::new(ExecOptions::default())
            .renew_etcd_certs(&RunContext::new(), &runner, "10.0.0.10", &ws)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).starts_with("renew certs: "));
        assert_eq!(runner.scripts().len(), 1);
        assert!(!ws.has_etcd_client_pair());
    }
}
