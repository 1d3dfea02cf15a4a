//! Certificate staging and hand-off
//!
//! A run stages the etcd client certificate pair in its [`BackupWorkspace`].
//! After an etcd renewal the pair is also written to the [`CertCache`] so a
//! later control-plane-only run can pick it up without touching etcd again.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ssh::{RemoteRunner, RunContext};
use crate::utils::local;

pub const ETCD_CLIENT_CERTS_DIR: &str = "etcd-client-certs";
pub const ETCD_CLIENT_CERT: &str = "apiserver-etcd-client.crt";
pub const ETCD_CLIENT_KEY: &str = "apiserver-etcd-client.key";
const CACHE_METADATA: &str = "metadata.json";

/// The client certificate the API server uses to reach external etcd
#[derive(Clone, PartialEq, Eq)]
pub struct EtcdClientPair {
    pub cert: String,
    pub key: String,
}

impl fmt::Debug for EtcdClientPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdClientPair")
            .field("cert_len", &self.cert.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

impl EtcdClientPair {
    fn ensure_not_empty(&self) -> Result<()> {
        if self.cert.trim().is_empty() {
            bail!("certificate file is empty");
        }
        if self.key.trim().is_empty() {
            bail!("key file is empty");
        }
        Ok(())
    }

    /// Base64 of the certificate and key, safe to embed in a quoted shell word
    pub fn to_base64(&self) -> (String, String) {
        (STANDARD.encode(&self.cert), STANDARD.encode(&self.key))
    }
}

/// Per-run local directory for staged certificates and the bootstrap config backup
///
/// Removed on success, kept on failure for manual recovery.
#[derive(Debug, Clone)]
pub struct BackupWorkspace {
    root: PathBuf,
}

impl BackupWorkspace {
    /// Create `certificate_backup_<timestamp>` under `parent`
    pub fn create(parent: &Path) -> Result<Self> {
        let name = format!("certificate_backup_{}", Local::now().format("%Y%m%d_%H%M%S"));
        Self::at(parent.join(name))
    }

    /// Use `root` as the workspace, creating it if needed
    pub fn at(root: PathBuf) -> Result<Self> {
        let ws = Self { root };
        local::create_private_dir(ws.etcd_certs_dir()).context("creating backup directory")?;
        debug!(path = %ws.root.display(), "backup workspace ready");
        Ok(ws)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn etcd_certs_dir(&self) -> PathBuf {
        self.root.join(ETCD_CLIENT_CERTS_DIR)
    }

    pub fn cert_path(&self) -> PathBuf {
        self.etcd_certs_dir().join(ETCD_CLIENT_CERT)
    }

    pub fn key_path(&self) -> PathBuf {
        self.etcd_certs_dir().join(ETCD_CLIENT_KEY)
    }

    pub fn has_etcd_client_pair(&self) -> bool {
        self.cert_path().is_file() && self.key_path().is_file()
    }

    pub fn store_etcd_client_pair(&self, pair: &EtcdClientPair) -> Result<()> {
        pair.ensure_not_empty()?;
        write_pair(&self.etcd_certs_dir(), pair)
    }

    pub fn load_etcd_client_pair(&self) -> Result<EtcdClientPair> {
        read_pair(&self.etcd_certs_dir())
    }

    /// Remove the workspace, including entries left read-only
    pub fn remove(&self) -> Result<()> {
        debug!(path = %self.root.display(), "Cleaning up directory");
        local::make_writable_recursive(&self.root).context("changing permissions")?;
        local::remove_dir_all(&self.root)
    }
}

fn write_pair(dir: &Path, pair: &EtcdClientPair) -> Result<()> {
    local::create_private_dir(dir)?;
    local::write_private_file(dir.join(ETCD_CLIENT_CERT), pair.cert.as_bytes())
        .context("write certificate file")?;
    local::write_private_file(dir.join(ETCD_CLIENT_KEY), pair.key.as_bytes())
        .context("write key file")?;
    Ok(())
}

fn read_pair(dir: &Path) -> Result<EtcdClientPair> {
    let pair = EtcdClientPair {
        cert: local::read_file(dir.join(ETCD_CLIENT_CERT)).context("read certificate file")?,
        key: local::read_file(dir.join(ETCD_CLIENT_KEY)).context("read key file")?,
    };
    pair.ensure_not_empty()?;
    Ok(pair)
}

/// OS specific commands used to move the etcd client pair to and from nodes
pub trait CertTransport: Send + Sync {
    /// Write the base64 encoded pair to the node's transfer location, owner-only
    fn transfer_commands(&self, cert_b64: &str, key_b64: &str) -> Vec<String>;

    /// Run before reading the renewed pair; may be empty
    fn prepare_read_commands(&self) -> Vec<String>;

    fn read_cert_command(&self) -> String;

    fn read_key_command(&self) -> String;
}

/// Push the staged etcd client pair to a control-plane node
pub async fn transfer_certs_to_control_plane(
    ctx: &RunContext,
    runner: &dyn RemoteRunner,
    transport: &dyn CertTransport,
    node: &str,
    ws: &BackupWorkspace,
) -> Result<()> {
    debug!(node, "Transferring certificates to control plane node");
    let pair = ws.load_etcd_client_pair()?;
    let (cert_b64, key_b64) = pair.to_base64();

    runner
        .run_command(ctx, node, &transport.transfer_commands(&cert_b64, &key_b64))
        .await
        .context("transfer certificates")?;

    debug!(node, "External certificates transferred to control plane node");
    Ok(())
}

/// Read the renewed etcd client pair from an etcd node into the workspace
pub async fn copy_etcd_certs(
    ctx: &RunContext,
    runner: &dyn RemoteRunner,
    transport: &dyn CertTransport,
    node: &str,
    ws: &BackupWorkspace,
) -> Result<EtcdClientPair> {
    debug!(node, path = %ws.path().display(), "Reading certificate from etcd node");

    let prepare = transport.prepare_read_commands();
    if !prepare.is_empty() {
        runner
            .run_command(ctx, node, &prepare)
            .await
            .context("list certificate files")?;
    }

    let cert = runner
        .run_command_with_output(ctx, node, &[transport.read_cert_command()])
        .await
        .context("read certificate file")?;
    if cert.trim().is_empty() {
        bail!("certificate file is empty");
    }

    let key = runner
        .run_command_with_output(ctx, node, &[transport.read_key_command()])
        .await
        .context("read key file")?;
    if key.trim().is_empty() {
        bail!("key file is empty");
    }

    let pair = EtcdClientPair { cert, key };
    ws.store_etcd_client_pair(&pair)?;
    debug!(path = %ws.etcd_certs_dir().display(), "Copied etcd client certs");
    Ok(pair)
}

/// What was cached and when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// RFC 3339
    pub renewed_at: String,
    pub cluster_name: String,
}

impl CacheMetadata {
    fn age(&self) -> Option<chrono::Duration> {
        DateTime::parse_from_rfc3339(&self.renewed_at)
            .ok()
            .map(|at| Utc::now().signed_duration_since(at.with_timezone(&Utc)))
    }
}

/// Cross-run store for the most recently renewed etcd client pair
///
/// The latest save always wins. Loading reports the age of the entry and
/// whether it came from another cluster but never rejects it.
#[derive(Debug, Clone)]
pub struct CertCache {
    dir: PathBuf,
}

impl CertCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<home>/.certrenew/certificates/etcd-certs`
    pub fn default_dir(home: &Path) -> PathBuf {
        home.join(".certrenew").join("certificates").join("etcd-certs")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy the workspace pair into the cache
    pub fn save(&self, ws: &BackupWorkspace, cluster_name: &str) -> Result<()> {
        let pair = ws.load_etcd_client_pair()?;
        write_pair(&self.dir, &pair).context("save certificates to persistent storage")?;

        let metadata = CacheMetadata {
            renewed_at: Utc::now().to_rfc3339(),
            cluster_name: cluster_name.to_string(),
        };
        let json = serde_json::to_vec_pretty(&metadata)?;
        local::write_private_file(self.dir.join(CACHE_METADATA), &json)?;

        info!(path = %self.dir.display(), "✓ Saved etcd client certificates for later control plane renewals");
        Ok(())
    }

    /// Copy the cached pair into the workspace
    pub fn load(&self, ws: &BackupWorkspace, cluster_name: &str) -> Result<Option<CacheMetadata>> {
        if !self.dir.join(ETCD_CLIENT_CERT).is_file() || !self.dir.join(ETCD_CLIENT_KEY).is_file() {
            bail!(
                "no etcd certificates found in persistent storage ({}). Please run etcd certificate renewal first",
                self.dir.display()
            );
        }

        let pair = read_pair(&self.dir).context("loading certificates from persistent storage")?;
        ws.store_etcd_client_pair(&pair)?;

        let metadata = self.read_metadata();
        match &metadata {
            Some(meta) => {
                if let Some(age) = meta.age() {
                    info!(renewed_at = %meta.renewed_at, age_hours = age.num_hours(), "Using cached etcd client certificates");
                }
                if meta.cluster_name != cluster_name {
                    warn!(
                        cached = %meta.cluster_name,
                        current = %cluster_name,
                        "⚠ Cached etcd client certificates were saved for a different cluster"
                    );
                }
            }
            None => warn!(path = %self.dir.display(), "⚠ Cached etcd client certificates have no metadata, age unknown"),
        }
        Ok(metadata)
    }

    fn read_metadata(&self) -> Option<CacheMetadata> {
        let raw = std::fs::read(self.dir.join(CACHE_METADATA)).ok()?;
        serde_json::from_slice(&raw)
            .map_err(|e| debug!(error = %e, "ignoring unreadable cache metadata"))
            .ok()
    }
}
