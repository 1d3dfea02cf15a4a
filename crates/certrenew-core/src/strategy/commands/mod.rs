//! Shell command builders for each renewal step
//!
//! Builders are plain values: they take the paths and flags of one node
//! operation and return the exact command lines to send, so each fragment can
//! be checked on its own.

pub mod linux;
pub mod sheltie;

use chrono::Local;

/// Certificates renewed when the etcd client pair is managed outside kubeadm
pub const NON_ETCD_CERTS: [&str; 6] = [
    "admin.conf",
    "apiserver",
    "apiserver-kubelet-client",
    "controller-manager.conf",
    "front-proxy-client",
    "scheduler.conf",
];

/// Seconds the kubelet gets to notice static pod manifests are gone
pub const POD_SETTLE_SECS: u32 = 20;

/// Where a node OS keeps control-plane and etcd material
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertificatePaths {
    pub control_plane_dir: &'static str,
    pub etcd_dir: &'static str,
}

impl CertificatePaths {
    pub const LINUX: CertificatePaths = CertificatePaths {
        control_plane_dir: "/etc/kubernetes",
        etcd_dir: "/etc/etcd",
    };

    pub const BOTTLEROCKET: CertificatePaths = CertificatePaths {
        control_plane_dir: "/var/lib/kubeadm",
        etcd_dir: "/var/lib/etcd",
    };

    pub fn control_plane_pki(&self) -> String {
        format!("{}/pki", self.control_plane_dir)
    }

    pub fn etcd_pki(&self) -> String {
        format!("{}/pki", self.etcd_dir)
    }
}

/// Suffix for on-node backup directories
pub fn backup_timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Copy every file under `src` except the `etcd` subtree into `dest`
pub(crate) fn copy_without_etcd(src: &str, dest: &str, sudo: &str) -> Vec<String> {
    vec![
        format!("{sudo}mkdir -p {dest}"),
        format!("cd {src}"),
        format!(
            "{sudo}find . -path ./etcd -prune -o -type f -exec cp --parents {{}} {dest}/ \\;"
        ),
    ]
}
