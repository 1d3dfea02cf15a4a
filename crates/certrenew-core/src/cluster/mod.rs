//! Cluster API capability
//!
//! The renewal workflow needs only a handful of cluster operations: a
//! reachability check, a backup of the bootstrap configuration, TLS secret
//! get/create/patch with namespace existence, and machine listing for node
//! discovery. [`ClusterApi`] names exactly those; [`KubectlClient`] implements
//! them with `kubectl`.

pub mod discovery;
pub mod kubectl;
pub mod secret;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::error::ClusterApiError;
use crate::ssh::RunContext;

pub use discovery::populate_config;
pub use kubectl::KubectlClient;
pub use secret::{apiserver_etcd_client_secret_name, update_apiserver_etcd_client_secret};

/// Namespace holding the cluster's management objects
pub const SYSTEM_NAMESPACE: &str = "eksa-system";
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

/// A `kubernetes.io/tls` secret with decoded PEM data
#[derive(Clone, PartialEq, Eq)]
pub struct TlsSecret {
    pub name: String,
    pub namespace: String,
    pub cert: String,
    pub key: String,
}

impl fmt::Debug for TlsSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSecret")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineAddress {
    /// `ExternalIP`, `InternalIP`, `Hostname`, ...
    pub kind: String,
    pub address: String,
}

/// The parts of a Cluster API `Machine` used for node discovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Machine {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub addresses: Vec<MachineAddress>,
    /// `status.nodeInfo.osImage` once the node has joined
    pub os_image: Option<String>,
}

impl Machine {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains_key(label)
    }

    /// `ExternalIP`, else `InternalIP`
    pub fn node_address(&self) -> Option<&str> {
        ["ExternalIP", "InternalIP"].iter().find_map(|kind| {
            self.addresses
                .iter()
                .find(|a| a.kind == *kind && !a.address.is_empty())
                .map(|a| a.address.as_str())
        })
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn check_reachable(&self, ctx: &RunContext) -> Result<(), ClusterApiError>;

    /// Write the bootstrap configuration into `dest_dir`, returning the file written
    async fn backup_bootstrap_config(
        &self,
        ctx: &RunContext,
        dest_dir: &Path,
    ) -> Result<PathBuf, ClusterApiError>;

    async fn namespace_exists(&self, ctx: &RunContext, namespace: &str) -> Result<bool, ClusterApiError>;

    async fn create_namespace(&self, ctx: &RunContext, namespace: &str) -> Result<(), ClusterApiError>;

    async fn get_secret(
        &self,
        ctx: &RunContext,
        namespace: &str,
        name: &str,
    ) -> Result<TlsSecret, ClusterApiError>;

    async fn create_secret(&self, ctx: &RunContext, secret: &TlsSecret) -> Result<(), ClusterApiError>;

    /// Merge the secret's `tls.crt` and `tls.key` into the existing object's data
    ///
    /// Labels, annotations, owner references and other data keys are left as they are.
    async fn patch_secret_data(&self, ctx: &RunContext, secret: &TlsSecret) -> Result<(), ClusterApiError>;

    /// Cluster API machines labelled with `cluster_name`
    async fn list_machines(
        &self,
        ctx: &RunContext,
        cluster_name: &str,
    ) -> Result<Vec<Machine>, ClusterApiError>;
}
