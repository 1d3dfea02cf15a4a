//! `certrenew renew certificates`

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use certrenew_core::cluster::{KubectlClient, populate_config};
use certrenew_core::config::{load_config, validate_config};
use certrenew_core::staging::CertCache;
use certrenew_core::strategy::build_strategy;
use certrenew_core::utils::local;
use certrenew_core::{
    DirectSshRunner, DockerSshRunner, ExecOptions, RemoteRunner, Renewer, RenewerOptions,
    RetryPolicy, RunContext,
};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::cli_types::{RenewCertificatesArgs, SshMode};

pub const CERT_CACHE_DIR_ENV: &str = "CERTRENEW_CERT_CACHE_DIR";

pub async fn renew_certificates(ctx: &RunContext, args: RenewCertificatesArgs) -> Result<()> {
    let env = |key: &str| std::env::var(key).ok();

    let mut cfg = load_config(&args.config)?;

    let kubeconfig = resolve_kubeconfig(args.kubeconfig.as_deref(), &cfg.cluster_name, env);
    let kubeconfig_copy = private_kubeconfig_copy(&kubeconfig)?;
    let cluster = Arc::new(KubectlClient::new(kubeconfig_copy.path()));

    populate_config(ctx, &mut cfg, cluster.as_ref()).await?;
    validate_config(&cfg, &args.component)?;
    let os = cfg
        .os_family()
        .ok_or_else(|| anyhow!("os is required in the config"))?;

    let options = ExecOptions::new(args.verbosity);
    let runner: Arc<dyn RemoteRunner> = match args.ssh_mode {
        SshMode::Direct => Arc::new(DirectSshRunner::new(options)),
        SshMode::Docker => {
            let container = args
                .ssh_container
                .context("--ssh-container is required with --ssh-mode docker")?;
            Arc::new(DockerSshRunner::new(container, options))
        }
    };

    let home = local::get_home_dir()?;
    let cache_dir = resolve_cache_dir(args.cert_cache_dir.as_deref(), env, Path::new(&home));
    debug!(path = %cache_dir.display(), "using certificate cache");

    let renewer = Renewer::new(
        runner,
        build_strategy(os, options),
        cluster,
        RenewerOptions {
            backup_root: args.backup_root,
            cache: CertCache::new(cache_dir),
            retry: RetryPolicy::default(),
        },
    );

    let run_ctx = match args.timeout {
        Some(secs) => ctx.with_timeout(Duration::from_secs(secs)),
        None => ctx.clone(),
    };
    info!(cluster = %cfg.cluster_name, os = %os, "Starting certificate renewal");
    renewer
        .renew_certificates(&run_ctx, &cfg, &args.component)
        .await
}

/// Flag, then `KUBECONFIG`, then the cluster's own kubeconfig in the working directory
pub fn resolve_kubeconfig<F>(flag: Option<&Path>, cluster_name: &str, env: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = flag {
        return path.to_path_buf();
    }
    if let Some(path) = env("KUBECONFIG").filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    Path::new(cluster_name).join(format!("{}-eks-a-cluster.kubeconfig", cluster_name))
}

/// Flag, then `CERTRENEW_CERT_CACHE_DIR`, then under the home directory
pub fn resolve_cache_dir<F>(flag: Option<&Path>, env: F, home: &Path) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = flag {
        return path.to_path_buf();
    }
    match env(CERT_CACHE_DIR_ENV).filter(|p| !p.is_empty()) {
        Some(path) => PathBuf::from(path),
        None => CertCache::default_dir(home),
    }
}

/// Owner-only copy of the kubeconfig, deleted when dropped
fn private_kubeconfig_copy(source: &Path) -> Result<NamedTempFile> {
    let contents = std::fs::read(source)
        .with_context(|| format!("failed to read kubeconfig {}", source.display()))?;
    let mut copy = tempfile::Builder::new()
        .prefix("certrenew-kubeconfig-")
        .tempfile()
        .context("failed to copy kubeconfig")?;
    copy.write_all(&contents).context("failed to copy kubeconfig")?;
    copy.flush()?;
    debug!(source = %source.display(), copy = %copy.path().display(), "using private kubeconfig copy");
    Ok(copy)
}
