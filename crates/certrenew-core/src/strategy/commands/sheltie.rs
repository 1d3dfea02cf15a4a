//! Bottlerocket command builders
//!
//! The host filesystem on Bottlerocket is reachable only from a `sheltie`
//! root shell, and kubeadm/etcdadm run from the bootstrap container image
//! through `ctr`. Each remote call sends one heredoc session.

use super::{CertificatePaths, NON_ETCD_CERTS, POD_SETTLE_SECS, copy_without_etcd};
use crate::config::Component;
use crate::staging::{CertTransport, ETCD_CLIENT_CERT, ETCD_CLIENT_CERTS_DIR, ETCD_CLIENT_KEY};

const BOOTSTRAP_CONTAINER: &str = "kubeadm-bootstrap";
/// `/tmp` of the admin container as seen from the host
const ADMIN_ROOTFS_TMP: &str =
    "/run/host-containerd/io.containerd.runtime.v2.task/default/admin/rootfs/tmp";
/// Name the API server uses for its etcd client pair under the kubeadm pki dir
const SERVER_ETCD_CLIENT: &str = "server-etcd-client";

/// Lines run by `sheltie` in one heredoc, stopping at the first failure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SheltieSession {
    lines: Vec<String>,
}

impl SheltieSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, lines: impl IntoIterator<Item = String>) -> Self {
        self.lines.extend(lines);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn render(&self) -> String {
        let mut script = String::from("sudo sheltie << 'EOF'\nset -e\n");
        for line in &self.lines {
            script.push_str(line);
            script.push('\n');
        }
        script.push_str("EOF");
        script
    }

    /// The session as a single remote command
    pub fn into_commands(self) -> Vec<String> {
        vec![self.render()]
    }
}

fn image_pull() -> Vec<String> {
    vec![
        format!(
            "IMAGE_ID=$(apiclient get | apiclient exec admin jq -r '.settings[\"host-containers\"][\"{}\"].source')",
            BOOTSTRAP_CONTAINER
        ),
        "ctr image pull ${IMAGE_ID}".to_string(),
    ]
}

fn bind_mount(src: &str, dst: &str) -> String {
    format!("--mount type=bind,src={},dst={},options=rbind:rw", src, dst)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BottlerocketControlPlaneCommands {
    pub backup: Vec<String>,
    pub image_pull: Vec<String>,
    pub renew: Vec<String>,
    /// Installs the transferred etcd client pair; empty without external etcd
    pub copy_certs: Vec<String>,
    pub restart: Vec<String>,
    pub check: Vec<String>,
}

impl BottlerocketControlPlaneCommands {
    pub fn renew_session(&self) -> SheltieSession {
        SheltieSession::new()
            .with(self.backup.iter().cloned())
            .with(self.image_pull.iter().cloned())
            .with(self.renew.iter().cloned())
            .with(self.copy_certs.iter().cloned())
            .with(self.restart.iter().cloned())
    }

    pub fn check_session(&self) -> SheltieSession {
        SheltieSession::new()
            .with(self.image_pull.iter().cloned())
            .with(self.check.iter().cloned())
    }
}

#[derive(Debug, Clone)]
pub struct BottlerocketControlPlaneCommandBuilder {
    paths: CertificatePaths,
    timestamp: String,
    component: Component,
    has_external_etcd: bool,
}

impl BottlerocketControlPlaneCommandBuilder {
    pub fn new(
        paths: CertificatePaths,
        timestamp: impl Into<String>,
        component: Component,
        has_external_etcd: bool,
    ) -> Self {
        Self {
            paths,
            timestamp: timestamp.into(),
            component,
            has_external_etcd,
        }
    }

    pub fn build(&self) -> BottlerocketControlPlaneCommands {
        BottlerocketControlPlaneCommands {
            backup: self.backup(),
            image_pull: image_pull(),
            renew: self.renew(),
            copy_certs: self.copy_certs(),
            restart: restart_static_pods(),
            check: vec![self.kubeadm("kubeadm-check", "certs check-expiration")],
        }
    }

    fn backup(&self) -> Vec<String> {
        let pki = self.paths.control_plane_pki();
        let dest = format!("{}.bak_{}", pki, self.timestamp);
        if self.component.is_control_plane_only() && self.has_external_etcd {
            copy_without_etcd(&pki, &dest, "")
        } else {
            vec![format!("cp -r {} {}", pki, dest)]
        }
    }

    fn kubeadm(&self, task: &str, args: &str) -> String {
        let dir = self.paths.control_plane_dir;
        format!(
            "ctr run {} {} --rm ${{IMAGE_ID}} {} /opt/bin/kubeadm {}",
            bind_mount(dir, dir),
            bind_mount(dir, "/etc/kubernetes"),
            task,
            args
        )
    }

    fn renew(&self) -> Vec<String> {
        if !self.has_external_etcd {
            return vec![self.kubeadm("kubeadm-renew", "certs renew all")];
        }

        // kubeadm would rewrite the etcd client pair with a key etcd does not trust
        let pki = self.paths.control_plane_pki();
        let mut lines = vec![
            format!("mkdir -p /tmp/{}-preserve", SERVER_ETCD_CLIENT),
            format!(
                "cp {pki}/{name}.crt {pki}/{name}.key /tmp/{name}-preserve/",
                pki = pki,
                name = SERVER_ETCD_CLIENT
            ),
        ];
        lines.extend(NON_ETCD_CERTS.iter().map(|cert| {
            self.kubeadm(&format!("kubeadm-renew-{}", cert.replace('.', "-")), &format!("certs renew {}", cert))
        }));
        lines.push(format!(
            "cp /tmp/{name}-preserve/{name}.crt /tmp/{name}-preserve/{name}.key {pki}/",
            pki = pki,
            name = SERVER_ETCD_CLIENT
        ));
        lines.push(format!("rm -rf /tmp/{}-preserve", SERVER_ETCD_CLIENT));
        lines
    }

    fn copy_certs(&self) -> Vec<String> {
        if !self.has_external_etcd {
            return Vec::new();
        }
        let pki = self.paths.control_plane_pki();
        let staged = format!("/tmp/{}", ETCD_CLIENT_CERTS_DIR);
        vec![
            format!("cp {}/{} {}/{}.crt", staged, ETCD_CLIENT_CERT, pki, SERVER_ETCD_CLIENT),
            format!("cp {}/{} {}/{}.key", staged, ETCD_CLIENT_KEY, pki, SERVER_ETCD_CLIENT),
            format!("chmod 600 {}/{}.key", pki, SERVER_ETCD_CLIENT),
            format!("rm -rf {}", staged),
        ]
    }
}

/// Toggle every static pod off and on through the settings API
fn restart_static_pods() -> Vec<String> {
    vec![
        "for pod in $(apiclient get | apiclient exec admin jq -r '.settings.kubernetes[\"static-pods\"] | keys[]'); do apiclient set kubernetes.static-pods.$pod.enabled=false; done".to_string(),
        format!("sleep {}", POD_SETTLE_SECS),
        "for pod in $(apiclient get | apiclient exec admin jq -r '.settings.kubernetes[\"static-pods\"] | keys[]'); do apiclient set kubernetes.static-pods.$pod.enabled=true; done".to_string(),
    ]
}

/// The three etcd sessions: renew, expose the pair to the admin container, clean up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BottlerocketEtcdCommands {
    pub image_pull: Vec<String>,
    pub backup: Vec<String>,
    pub renew: Vec<String>,
    pub validate: Vec<String>,
    pub copy_certs: Vec<String>,
    pub cleanup: Vec<String>,
}

impl BottlerocketEtcdCommands {
    pub fn renew_session(&self) -> SheltieSession {
        SheltieSession::new()
            .with(self.image_pull.iter().cloned())
            .with(self.backup.iter().cloned())
            .with(self.renew.iter().cloned())
            .with(self.validate.iter().cloned())
    }

    pub fn copy_session(&self) -> SheltieSession {
        SheltieSession::new().with(self.copy_certs.iter().cloned())
    }

    pub fn cleanup_session(&self) -> SheltieSession {
        SheltieSession::new().with(self.cleanup.iter().cloned())
    }
}

#[derive(Debug, Clone)]
pub struct BottlerocketEtcdCommandBuilder {
    paths: CertificatePaths,
    timestamp: String,
}

impl BottlerocketEtcdCommandBuilder {
    pub fn new(paths: CertificatePaths, timestamp: impl Into<String>) -> Self {
        Self {
            paths,
            timestamp: timestamp.into(),
        }
    }

    pub fn build(&self) -> BottlerocketEtcdCommands {
        let dir = self.paths.etcd_dir;
        let pki = self.paths.etcd_pki();
        let exposed = format!("{}/{}", ADMIN_ROOTFS_TMP, ETCD_CLIENT_CERTS_DIR);
        let mounts = format!(
            "{} {} --net-host",
            bind_mount(dir, dir),
            bind_mount(&pki, "/etc/etcd/pki")
        );

        BottlerocketEtcdCommands {
            image_pull: image_pull(),
            backup: vec![
                format!("cp -r {} {}.bak_{}", pki, pki, self.timestamp),
                format!(
                    "rm -f {p}/apiserver-etcd-client.* {p}/etcdctl-etcd-client.* {p}/peer.* {p}/server.*",
                    p = pki
                ),
            ],
            renew: vec![format!(
                "ctr run {} --rm ${{IMAGE_ID}} etcdadm-renew /opt/bin/etcdadm join phase certificates http://localhost:2379 --init-system=kubelet",
                mounts
            )],
            validate: vec![format!(
                "ctr run {} --rm ${{IMAGE_ID}} etcdctl-check /opt/bin/etcdctl --cacert=/etc/etcd/pki/ca.crt --cert=/etc/etcd/pki/etcdctl-etcd-client.crt --key=/etc/etcd/pki/etcdctl-etcd-client.key endpoint health",
                mounts
            )],
            copy_certs: vec![
                format!("mkdir -p {}", exposed),
                format!("cp {}/{} {}/", pki, ETCD_CLIENT_CERT, exposed),
                format!("cp {}/{} {}/", pki, ETCD_CLIENT_KEY, exposed),
                format!("chmod 600 {}/{}", exposed, ETCD_CLIENT_KEY),
            ],
            cleanup: vec![format!("rm -rf {}", exposed)],
        }
    }
}

/// Moves the etcd client pair on Bottlerocket nodes
///
/// Writes go to the host through `sheltie`; reads come from the admin
/// container `/tmp`, where the etcd copy session leaves the pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct BottlerocketCertTransport;

impl BottlerocketCertTransport {
    fn staged_dir() -> String {
        format!("/tmp/{}", ETCD_CLIENT_CERTS_DIR)
    }
}

impl CertTransport for BottlerocketCertTransport {
    fn transfer_commands(&self, cert_b64: &str, key_b64: &str) -> Vec<String> {
        let dir = Self::staged_dir();
        SheltieSession::new()
            .with([
                "umask 077".to_string(),
                format!("mkdir -p {}", dir),
                format!("rm -f {}/{} {}/{}", dir, ETCD_CLIENT_CERT, dir, ETCD_CLIENT_KEY),
                format!("echo '{}' | base64 -d > {}/{}", cert_b64, dir, ETCD_CLIENT_CERT),
                format!("echo '{}' | base64 -d > {}/{}", key_b64, dir, ETCD_CLIENT_KEY),
                format!("chmod 600 {}/{} {}/{}", dir, ETCD_CLIENT_CERT, dir, ETCD_CLIENT_KEY),
            ])
            .into_commands()
    }

    fn prepare_read_commands(&self) -> Vec<String> {
        vec![format!("ls -l {}", Self::staged_dir())]
    }

    fn read_cert_command(&self) -> String {
        format!("sudo cat {}/{}", Self::staged_dir(), ETCD_CLIENT_CERT)
    }

    fn read_key_command(&self) -> String {
        format!("sudo cat {}/{}", Self::staged_dir(), ETCD_CLIENT_KEY)
    }
}
