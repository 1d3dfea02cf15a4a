//! Renewal orchestrator
//!
//! One run validates the component selector, checks the API server, backs up
//! the bootstrap configuration, then renews etcd and the control plane node
//! by node. The first node failure stops the run and keeps the backup
//! workspace on disk for manual recovery; nothing is rolled back.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, warn};

use crate::cluster::{self, ClusterApi};
use crate::config::{Component, RenewalConfig};
use crate::ssh::{RemoteRunner, RunContext};
use crate::staging::{BackupWorkspace, CertCache};
use crate::strategy::OsStrategy;

/// How often and how patiently the API server is checked before renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// `attempts` checks with no pause between them
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenewerOptions {
    /// Parent of the per-run `certificate_backup_<timestamp>` directory
    pub backup_root: PathBuf,
    pub cache: CertCache,
    pub retry: RetryPolicy,
}

pub struct Renewer {
    runner: Arc<dyn RemoteRunner>,
    strategy: Box<dyn OsStrategy>,
    cluster: Arc<dyn ClusterApi>,
    options: RenewerOptions,
}

impl Renewer {
    pub fn new(
        runner: Arc<dyn RemoteRunner>,
        strategy: Box<dyn OsStrategy>,
        cluster: Arc<dyn ClusterApi>,
        options: RenewerOptions,
    ) -> Self {
        Self {
            runner,
            strategy,
            cluster,
            options,
        }
    }

    /// Renew the components named by `selector` (`""`, `"etcd"` or `"control-plane"`)
    pub async fn renew_certificates(
        &self,
        ctx: &RunContext,
        cfg: &RenewalConfig,
        selector: &str,
    ) -> Result<()> {
        let component = Component::parse(selector)?;
        let process_etcd = component.includes_etcd() && cfg.has_external_etcd();
        let process_control_plane = component.includes_control_plane();

        if process_control_plane && cfg.control_plane.nodes.is_empty() {
            bail!("no control plane nodes configured for cluster {}", cfg.cluster_name);
        }
        if process_etcd {
            cfg.etcd
                .validate_credentials("etcd")
                .context("validating etcd config")?;
        }
        if process_control_plane {
            cfg.control_plane.validate_credentials("control-plane")?;
        }
        if !process_etcd && !process_control_plane {
            info!(component = %component, "No etcd nodes configured, nothing to renew");
            return Ok(());
        }

        let ws = BackupWorkspace::create(&self.options.backup_root)?;
        info!(path = %ws.path().display(), "Created backup workspace");

        if let Err(e) = self
            .run_phases(ctx, cfg, component, process_etcd, process_control_plane, &ws)
            .await
        {
            warn!(path = %ws.path().display(), "⚠ Renewal failed, backup workspace kept for manual recovery");
            return Err(e);
        }

        info!("Cleaning up temporary files");
        ws.remove().context("cleaning up backup workspace")?;
        info!("✓ Certificate renewal completed");
        Ok(())
    }

    async fn run_phases(
        &self,
        ctx: &RunContext,
        cfg: &RenewalConfig,
        component: Component,
        process_etcd: bool,
        process_control_plane: bool,
        ws: &BackupWorkspace,
    ) -> Result<()> {
        if let Err(e) = self.check_api_reachability(ctx).await {
            if ctx.err().is_some() {
                return Err(e);
            }
            warn!(error = %e, "⚠ API server unreachable, proceeding with caution");
        }

        self.backup_cluster_config(ctx, ws).await;

        if process_etcd {
            self.renew_etcd(ctx, cfg, ws).await?;
        }
        if process_control_plane {
            self.renew_control_plane(ctx, cfg, component, ws).await?;
        }
        Ok(())
    }

    async fn check_api_reachability(&self, ctx: &RunContext) -> Result<()> {
        info!("Checking if Kubernetes API server is reachable...");
        let attempts = self.options.retry.attempts.max(1);
        for attempt in 1..=attempts {
            match self.cluster.check_reachable(ctx).await {
                Ok(()) => {
                    info!("✓ API server is reachable");
                    return Ok(());
                }
                Err(e) => debug!(attempt, error = %e, "API server not reachable, retrying..."),
            }
            if attempt < attempts {
                ctx.sleep(self.options.retry.delay)
                    .await
                    .map_err(|reason| anyhow!("waiting for API server: {}", reason))?;
            }
        }
        bail!("Kubernetes API server is not reachable after {} attempts", attempts)
    }

    async fn backup_cluster_config(&self, ctx: &RunContext, ws: &BackupWorkspace) {
        info!("Attempting to backup kubeadm-config ConfigMap...");
        match self.cluster.backup_bootstrap_config(ctx, ws.path()).await {
            Ok(path) => info!(path = %path.display(), "kubeadm-config backed up successfully"),
            Err(e) => warn!(error = %e, "⚠ Could not backup kubeadm-config, continuing without backup"),
        }
    }

    async fn renew_etcd(&self, ctx: &RunContext, cfg: &RenewalConfig, ws: &BackupWorkspace) -> Result<()> {
        info!("✓ Starting etcd certificate renewal process");
        self.runner
            .init_ssh_config(&cfg.etcd.ssh)
            .await
            .context("initializing SSH config for etcd")?;

        for node in &cfg.etcd.nodes {
            self.strategy
                .renew_etcd_certs(ctx, self.runner.as_ref(), node, ws)
                .await
                .with_context(|| format!("renewing certificates for etcd node {}", node))?;
        }

        self.options
            .cache
            .save(ws, &cfg.cluster_name)
            .context("caching renewed etcd client certificate")?;

        if let Err(e) =
            cluster::update_apiserver_etcd_client_secret(ctx, self.cluster.as_ref(), &cfg.cluster_name, ws)
                .await
        {
            warn!(error = %format!("{:#}", e), "⚠ Failed to update apiserver-etcd-client secret");
            info!("You may need to manually update the secret after the API server is reachable");
            info!(
                command = %format!(
                    "kubectl edit secret {} -n {}",
                    cluster::apiserver_etcd_client_secret_name(&cfg.cluster_name),
                    cluster::SYSTEM_NAMESPACE
                ),
                "Use kubectl edit secret to update the secret"
            );
        }

        info!("✓ Etcd certificate renewal process completed successfully.");
        Ok(())
    }

    async fn renew_control_plane(
        &self,
        ctx: &RunContext,
        cfg: &RenewalConfig,
        component: Component,
        ws: &BackupWorkspace,
    ) -> Result<()> {
        info!("✓ Starting control plane certificate renewal process");

        // Without an etcd phase in this run the client pair comes from the cache
        if component.is_control_plane_only() && cfg.has_external_etcd() {
            self.options
                .cache
                .load(ws, &cfg.cluster_name)
                .context("missing etcd client certificate for control plane renewal")?;
        }

        self.runner
            .init_ssh_config(&cfg.control_plane.ssh)
            .await
            .context("initializing SSH config for control-plane")?;

        for node in &cfg.control_plane.nodes {
            self.strategy
                .renew_control_plane_certs(ctx, self.runner.as_ref(), node, cfg, component, ws)
                .await
                .with_context(|| format!("renewing certificates for control-plane node {}", node))?;
        }

        info!("✓ Control plane certificate renewal process completed successfully.");
        Ok(())
    }
}
