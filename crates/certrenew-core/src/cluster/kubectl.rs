use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{ClusterApi, Machine, MachineAddress, SYSTEM_NAMESPACE, TLS_SECRET_TYPE, TlsSecret};
use crate::error::ClusterApiError;
use crate::ssh::RunContext;
use crate::utils::local;

const BOOTSTRAP_CONFIG_FILE: &str = "kubeadm-config.yaml";
const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// [`ClusterApi`] backed by the `kubectl` binary and an explicit kubeconfig
#[derive(Debug, Clone)]
pub struct KubectlClient {
    binary: PathBuf,
    kubeconfig: PathBuf,
    request_timeout: String,
}

impl KubectlClient {
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            binary: PathBuf::from("kubectl"),
            kubeconfig: kubeconfig.into(),
            request_timeout: "2m".to_string(),
        }
    }

    /// Use the kubectl at `binary` instead of the one on `PATH`
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }

    fn args<'a>(&'a self, kubeconfig: &'a str, args: &[&'a str]) -> Vec<&'a str> {
        let mut all = vec!["--kubeconfig", kubeconfig];
        all.extend_from_slice(args);
        all
    }

    /// Run kubectl, stopping early if `ctx` ends
    async fn run(
        &self,
        ctx: &RunContext,
        action: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<Vec<u8>, ClusterApiError> {
        if let Some(reason) = ctx.err() {
            return Err(ClusterApiError::Cancelled {
                action: action.to_string(),
                reason,
            });
        }

        let binary = self.binary.display().to_string();
        let kubeconfig = self.kubeconfig.display().to_string();
        let full_args = self.args(&kubeconfig, args);
        debug!(action, "running kubectl");

        let result: anyhow::Result<Output> = tokio::select! {
            result = async {
                match stdin {
                    Some(input) => local::execute_with_stdin(&binary, &full_args, input).await,
                    None => local::execute(&binary, &full_args).await,
                }
            } => result,
            reason = ctx.done() => {
                return Err(ClusterApiError::Cancelled { action: action.to_string(), reason });
            }
        };

        let output = result.map_err(|e| ClusterApiError::Command {
            action: action.to_string(),
            output: format!("{:#}", e),
        })?;
        if !output.status.success() {
            return Err(ClusterApiError::Command {
                action: action.to_string(),
                output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// Map kubectl's `(NotFound)` / `(AlreadyExists)` reasons to typed errors
fn classify(err: ClusterApiError, kind: &'static str, name: &str) -> ClusterApiError {
    if let ClusterApiError::Command { output, .. } = &err {
        if output.contains("(NotFound)") {
            return ClusterApiError::NotFound {
                kind,
                name: name.to_string(),
            };
        }
        if output.contains("(AlreadyExists)") {
            return ClusterApiError::AlreadyExists {
                kind,
                name: name.to_string(),
            };
        }
    }
    err
}

pub(crate) fn secret_manifest(secret: &TlsSecret) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": secret.name,
            "namespace": secret.namespace,
        },
        "type": TLS_SECRET_TYPE,
        "data": {
            "tls.crt": STANDARD.encode(&secret.cert),
            "tls.key": STANDARD.encode(&secret.key),
        },
    })
}

/// JSON merge patch touching only `data.tls.crt` and `data.tls.key`
pub(crate) fn secret_data_patch(secret: &TlsSecret) -> serde_json::Value {
    json!({
        "data": {
            "tls.crt": STANDARD.encode(&secret.cert),
            "tls.key": STANDARD.encode(&secret.key),
        },
    })
}

#[derive(Debug, Deserialize)]
struct SecretObject {
    #[serde(default)]
    data: BTreeMap<String, String>,
}

fn decode_field(data: &BTreeMap<String, String>, field: &str) -> String {
    data.get(field)
        .and_then(|v| STANDARD.decode(v).ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct MachineList {
    #[serde(default)]
    items: Vec<MachineObject>,
}

#[derive(Debug, Deserialize)]
struct MachineObject {
    metadata: ObjectMeta,
    #[serde(default)]
    status: MachineStatus,
}

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MachineStatus {
    #[serde(default)]
    addresses: Vec<AddressObject>,
    #[serde(default)]
    node_info: Option<NodeInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeInfo {
    #[serde(default)]
    os_image: String,
}

#[derive(Debug, Deserialize)]
struct AddressObject {
    #[serde(rename = "type")]
    kind: String,
    address: String,
}

pub(crate) fn parse_machines(raw: &[u8]) -> Result<Vec<Machine>, ClusterApiError> {
    let list: MachineList = serde_json::from_slice(raw)?;
    Ok(list
        .items
        .into_iter()
        .map(|item| Machine {
            name: item.metadata.name,
            labels: item.metadata.labels,
            addresses: item
                .status
                .addresses
                .into_iter()
                .map(|a| MachineAddress {
                    kind: a.kind,
                    address: a.address,
                })
                .collect(),
            os_image: item
                .status
                .node_info
                .map(|info| info.os_image)
                .filter(|image| !image.is_empty()),
        })
        .collect())
}

#[async_trait]
impl ClusterApi for KubectlClient {
    async fn check_reachable(&self, ctx: &RunContext) -> Result<(), ClusterApiError> {
        let timeout = format!("--request-timeout={}", self.request_timeout);
        self.run(ctx, "version", &["version", timeout.as_str()], None)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                ClusterApiError::Command { output, .. } => ClusterApiError::Unreachable(output),
                other => other,
            })
    }

    async fn backup_bootstrap_config(
        &self,
        ctx: &RunContext,
        dest_dir: &Path,
    ) -> Result<PathBuf, ClusterApiError> {
        let raw = self
            .run(
                ctx,
                "get configmap kubeadm-config",
                &["-n", "kube-system", "get", "cm", "kubeadm-config", "-o", "yaml"],
                None,
            )
            .await?;

        let path = dest_dir.join(BOOTSTRAP_CONFIG_FILE);
        local::write_private_file(&path, &raw).map_err(|e| ClusterApiError::Command {
            action: "write kubeadm-config backup".to_string(),
            output: format!("{:#}", e),
        })?;
        Ok(path)
    }

    async fn namespace_exists(&self, ctx: &RunContext, namespace: &str) -> Result<bool, ClusterApiError> {
        match self
            .run(ctx, "get namespace", &["get", "namespace", namespace, "-o", "name"], None)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match classify(e, "namespace", namespace) {
                ClusterApiError::NotFound { .. } => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn create_namespace(&self, ctx: &RunContext, namespace: &str) -> Result<(), ClusterApiError> {
        self.run(ctx, "create namespace", &["create", "namespace", namespace], None)
            .await
            .map(|_| ())
            .map_err(|e| classify(e, "namespace", namespace))
    }

    async fn get_secret(
        &self,
        ctx: &RunContext,
        namespace: &str,
        name: &str,
    ) -> Result<TlsSecret, ClusterApiError> {
        let raw = self
            .run(ctx, "get secret", &["-n", namespace, "get", "secret", name, "-o", "json"], None)
            .await
            .map_err(|e| classify(e, "secret", name))?;
        let object: SecretObject = serde_json::from_slice(&raw)?;
        Ok(TlsSecret {
            name: name.to_string(),
            namespace: namespace.to_string(),
            cert: decode_field(&object.data, "tls.crt"),
            key: decode_field(&object.data, "tls.key"),
        })
    }

    async fn create_secret(&self, ctx: &RunContext, secret: &TlsSecret) -> Result<(), ClusterApiError> {
        let manifest = serde_json::to_vec(&secret_manifest(secret))?;
        self.run(ctx, "create secret", &["create", "-f", "-"], Some(&manifest))
            .await
            .map(|_| ())
            .map_err(|e| classify(e, "secret", &secret.name))
    }

    async fn patch_secret_data(&self, ctx: &RunContext, secret: &TlsSecret) -> Result<(), ClusterApiError> {
        let patch = secret_data_patch(secret).to_string();
        self.run(
            ctx,
            "patch secret",
            &[
                "-n",
                secret.namespace.as_str(),
                "patch",
                "secret",
                secret.name.as_str(),
                "--type=merge",
                "-p",
                patch.as_str(),
            ],
            None,
        )
        .await
        .map(|_| ())
        .map_err(|e| classify(e, "secret", &secret.name))
    }

    async fn list_machines(
        &self,
        ctx: &RunContext,
        cluster_name: &str,
    ) -> Result<Vec<Machine>, ClusterApiError> {
        let selector = format!("{}={}", CLUSTER_NAME_LABEL, cluster_name);
        let raw = self
            .run(
                ctx,
                "get machines",
                &[
                    "-n",
                    SYSTEM_NAMESPACE,
                    "get",
                    "machines.cluster.x-k8s.io",
                    "-l",
                    selector.as_str(),
                    "-o",
                    "json",
                ],
                None,
            )
            .await?;
        parse_machines(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_manifest() {
        let secret = TlsSecret {
            name: "demo-apiserver-etcd-client".to_string(),
            namespace: SYSTEM_NAMESPACE.to_string(),
            cert: "CERT".to_string(),
            key: "KEY".to_string(),
        };
        let manifest = secret_manifest(&secret);
        assert_eq!(manifest["type"], "kubernetes.io/tls");
        assert_eq!(manifest["metadata"]["namespace"], "eksa-system");
        assert_eq!(manifest["data"]["tls.crt"], STANDARD.encode("CERT"));
        assert_eq!(manifest["data"]["tls.key"], STANDARD.encode("KEY"));
    }

    /// RFC 7386 merge, as the API server applies `--type=merge`
    fn apply_merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
        match (target, patch) {
            (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
                for (key, value) in patch {
                    if value.is_null() {
                        target.remove(key);
                    } else {
                        apply_merge_patch(
                            target.entry(key.clone()).or_insert(serde_json::Value::Null),
                            value,
                        );
                    }
                }
            }
            (target, patch) => *target = patch.clone(),
        }
    }

    #[test]
    fn test_data_patch_keeps_live_metadata() {
        let secret = TlsSecret {
            name: "demo-apiserver-etcd-client".to_string(),
            namespace: SYSTEM_NAMESPACE.to_string(),
            cert: "NEWCERT".to_string(),
            key: "NEWKEY".to_string(),
        };
        let patch = secret_data_patch(&secret);
        let keys: Vec<&String> = patch.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["data"]);

        let mut live = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": "demo-apiserver-etcd-client",
                "namespace": "eksa-system",
                "labels": {"cluster.x-k8s.io/cluster-name": "demo"},
                "annotations": {"owner": "capi"},
                "ownerReferences": [{"kind": "KubeadmControlPlane", "name": "demo"}],
            },
            "type": "kubernetes.io/tls",
            "data": {
                "tls.crt": STANDARD.encode("OLD"),
                "tls.key": STANDARD.encode("OLD"),
                "ca.crt": STANDARD.encode("CA"),
            },
        });
        apply_merge_patch(&mut live, &patch);

        assert_eq!(live["metadata"]["labels"]["cluster.x-k8s.io/cluster-name"], "demo");
        assert_eq!(live["metadata"]["annotations"]["owner"], "capi");
        assert_eq!(live["metadata"]["ownerReferences"][0]["kind"], "KubeadmControlPlane");
        assert_eq!(live["data"]["ca.crt"], STANDARD.encode("CA"));
        assert_eq!(live["data"]["tls.crt"], STANDARD.encode("NEWCERT"));
        assert_eq!(live["data"]["tls.key"], STANDARD.encode("NEWKEY"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_secret_update_patches_instead_of_replacing() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("calls.log");
        let script = tmp.path().join("kubectl");
        std::fs::write(
            &script,
            format!(
                r#"#!/bin/sh
printf '%s\n' "$*" >> '{log}'
case "$*" in
  *" get secret "*)
    echo '{{"metadata":{{"name":"demo-apiserver-etcd-client","labels":{{"cluster.x-k8s.io/cluster-name":"demo"}}}},"data":{{"tls.crt":"T0xE","tls.key":"T0xE","ca.crt":"Q0E="}}}}'
    ;;
esac
exit 0
"#,
                log = log.display()
            ),
        )
        .unwrap();
        local::set_permissions(&script, 0o755).unwrap();

        let ws = crate::staging::BackupWorkspace::at(tmp.path().join("ws")).unwrap();
        ws.store_etcd_client_pair(&crate::staging::EtcdClientPair {
            cert: "NEWCERT".to_string(),
            key: "NEWKEY".to_string(),
        })
        .unwrap();

        let client = KubectlClient::new(tmp.path().join("kubeconfig")).with_binary(&script);
        super::super::update_apiserver_etcd_client_secret(&RunContext::new(), &client, "demo", &ws)
            .await
            .unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        assert!(!calls.contains(" replace "));
        assert!(!calls.contains(" create "));
        let patch_call = calls
            .lines()
            .find(|line| line.contains(" patch secret "))
            .unwrap();
        assert!(patch_call.contains("-n eksa-system patch secret demo-apiserver-etcd-client --type=merge -p "));
        let payload: serde_json::Value =
            serde_json::from_str(patch_call.split(" -p ").nth(1).unwrap()).unwrap();
        assert_eq!(
            payload,
            json!({"data": {
                "tls.crt": STANDARD.encode("NEWCERT"),
                "tls.key": STANDARD.encode("NEWKEY"),
            }})
        );
    }

    #[test]
    fn test_classify() {
        let not_found = ClusterApiError::Command {
            action: "get secret".to_string(),
            output: "Error from server (NotFound): secrets \"x\" not found".to_string(),
        };
        assert!(classify(not_found, "secret", "x").is_not_found());

        let exists = ClusterApiError::Command {
            action: "create namespace".to_string(),
            output: "Error from server (AlreadyExists): namespaces \"eksa-system\" already exists"
                .to_string(),
        };
        assert!(classify(exists, "namespace", "eksa-system").is_already_exists());

        let other = ClusterApiError::Unreachable("timeout".to_string());
        assert!(matches!(classify(other, "secret", "x"), ClusterApiError::Unreachable(_)));
    }

    #[test]
    fn test_decode_secret_fields() {
        let mut data = BTreeMap::new();
        data.insert("tls.crt".to_string(), STANDARD.encode("CERT"));
        data.insert("tls.key".to_string(), "!!not-base64".to_string());
        assert_eq!(decode_field(&data, "tls.crt"), "CERT");
        assert_eq!(decode_field(&data, "tls.key"), "");
        assert_eq!(decode_field(&data, "missing"), "");
    }

    #[test]
    fn test_parse_machines() {
        let raw = br#"{
            "items": [
                {
                    "metadata": {
                        "name": "demo-cp-abc",
                        "labels": {
                            "cluster.x-k8s.io/cluster-name": "demo",
                            "cluster.x-k8s.io/control-plane": ""
                        }
                    },
                    "status": {
                        "addresses": [
                            {"type": "InternalIP", "address": "192.168.0.10"},
                            {"type": "ExternalIP", "address": "10.0.0.1"}
                        ],
                        "nodeInfo": {"osImage": "Bottlerocket OS 1.19.2 (aws-k8s-1.28)"}
                    }
                },
                {
                    "metadata": {"name": "demo-etcd-xyz", "labels": {"cluster.x-k8s.io/etcd-cluster": "demo-etcd"}}
                }
            ]
        }"#;
        let machines = parse_machines(raw).unwrap();
        assert_eq!(machines.len(), 2);
        assert!(machines[0].has_label("cluster.x-k8s.io/control-plane"));
        assert_eq!(machines[0].node_address(), Some("10.0.0.1"));
        assert_eq!(
            machines[0].os_image.as_deref(),
            Some("Bottlerocket OS 1.19.2 (aws-k8s-1.28)")
        );
        assert!(machines[1].addresses.is_empty());
        assert_eq!(machines[1].os_image, None);
    }

    #[tokio::test]
    async fn test_cancelled_context_skips_kubectl() {
        let ctx = RunContext::new();
        ctx.cancel();
        let err = KubectlClient::new("/nonexistent/kubeconfig")
            .check_reachable(&ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterApiError::Cancelled { .. }));
    }
}
