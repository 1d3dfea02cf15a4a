use anyhow::{Context, Result};
use tracing::info;

use super::{ClusterApi, SYSTEM_NAMESPACE, TlsSecret};
use crate::ssh::RunContext;
use crate::staging::BackupWorkspace;

/// `<cluster>-apiserver-etcd-client`
pub fn apiserver_etcd_client_secret_name(cluster_name: &str) -> String {
    format!("{}-apiserver-etcd-client", cluster_name)
}

/// Create the namespace unless it exists; losing a creation race is fine
pub async fn ensure_namespace(ctx: &RunContext, api: &dyn ClusterApi, namespace: &str) -> Result<()> {
    if api
        .namespace_exists(ctx, namespace)
        .await
        .with_context(|| format!("checking namespace {}", namespace))?
    {
        return Ok(());
    }
    match api.create_namespace(ctx, namespace).await {
        Ok(()) => {
            info!(name = namespace, "Created namespace");
            Ok(())
        }
        Err(e) if e.is_already_exists() => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to create namespace {}", namespace)),
    }
}

/// Write the staged etcd client pair into the cluster's TLS secret
///
/// An existing secret has its certificate and key overwritten in place; a
/// missing one is created.
pub async fn update_apiserver_etcd_client_secret(
    ctx: &RunContext,
    api: &dyn ClusterApi,
    cluster_name: &str,
    ws: &BackupWorkspace,
) -> Result<()> {
    info!(cluster = cluster_name, "Updating apiserver-etcd-client secret");
    let pair = ws.load_etcd_client_pair()?;
    ensure_namespace(ctx, api, SYSTEM_NAMESPACE).await?;

    let name = apiserver_etcd_client_secret_name(cluster_name);
    let desired = TlsSecret {
        name: name.clone(),
        namespace: SYSTEM_NAMESPACE.to_string(),
        cert: pair.cert,
        key: pair.key,
    };

    match api.get_secret(ctx, SYSTEM_NAMESPACE, &name).await {
        Ok(_) => {
            api.patch_secret_data(ctx, &desired)
                .await
                .with_context(|| format!("failed to update secret {}", name))?;
            info!(name = %name, "✓ Successfully updated secret");
        }
        Err(e) if e.is_not_found() => {
            api.create_secret(ctx, &desired)
                .await
                .with_context(|| format!("failed to create secret {}", name))?;
            info!(name = %name, "✓ Successfully created secret");
        }
        Err(e) => return Err(e).with_context(|| format!("failed to get secret {}", name)),
    }
    Ok(())
}
