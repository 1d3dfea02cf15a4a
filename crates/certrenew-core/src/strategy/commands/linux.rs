use super::{CertificatePaths, NON_ETCD_CERTS, POD_SETTLE_SECS, copy_without_etcd};
use crate::config::Component;
use crate::staging::{CertTransport, ETCD_CLIENT_CERT, ETCD_CLIENT_KEY};

const TRANSFER_DIR: &str = "/tmp";

/// Command lines for one control-plane node, one field per step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinuxControlPlaneCommands {
    pub backup: Vec<String>,
    pub renew: Vec<String>,
    /// Empty without external etcd
    pub install_etcd_client: Vec<String>,
    pub validate: Vec<String>,
    pub restart: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LinuxControlPlaneCommandBuilder {
    paths: CertificatePaths,
    timestamp: String,
    component: Component,
    has_external_etcd: bool,
}

impl LinuxControlPlaneCommandBuilder {
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

    pub fn build(&self) -> LinuxControlPlaneCommands {
        LinuxControlPlaneCommands {
            backup: self.backup(),
            renew: self.renew(),
            install_etcd_client: self.install_etcd_client(),
            validate: vec!["sudo kubeadm certs check-expiration".to_string()],
            restart: self.restart(),
        }
    }

    fn backup(&self) -> Vec<String> {
        let pki = self.paths.control_plane_pki();
        let dest = format!("{}.bak_{}", pki, self.timestamp);
        if self.component.is_control_plane_only() && self.has_external_etcd {
            copy_without_etcd(&pki, &dest, "sudo ")
        } else {
            vec![format!("sudo cp -r {} {}", pki, dest)]
        }
    }

    fn renew(&self) -> Vec<String> {
        if self.has_external_etcd {
            NON_ETCD_CERTS
                .iter()
                .map(|cert| format!("sudo kubeadm certs renew {}", cert))
                .collect()
        } else {
            vec!["sudo kubeadm certs renew all".to_string()]
        }
    }

    fn install_etcd_client(&self) -> Vec<String> {
        if !self.has_external_etcd {
            return Vec::new();
        }
        let pki = self.paths.control_plane_pki();
        vec![
            format!("sudo cp {}/{} {}/{}", TRANSFER_DIR, ETCD_CLIENT_CERT, pki, ETCD_CLIENT_CERT),
            format!("sudo cp {}/{} {}/{}", TRANSFER_DIR, ETCD_CLIENT_KEY, pki, ETCD_CLIENT_KEY),
            format!("sudo chmod 600 {}/{}", pki, ETCD_CLIENT_KEY),
            format!(
                "sudo rm -f {}/{} {}/{}",
                TRANSFER_DIR, ETCD_CLIENT_CERT, TRANSFER_DIR, ETCD_CLIENT_KEY
            ),
        ]
    }

    /// The kubelet restarts static pods whose manifests disappear and come back
    fn restart(&self) -> Vec<String> {
        let manifests = format!("{}/manifests", self.paths.control_plane_dir);
        let parked = format!("/tmp/manifests.bak_{}", self.timestamp);
        vec![
            format!("sudo mkdir -p {}", parked),
            format!("sudo mv {}/*.yaml {}/", manifests, parked),
            format!("sleep {}", POD_SETTLE_SECS),
            format!("sudo mv {}/*.yaml {}/", parked, manifests),
            format!("sudo rmdir {}", parked),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinuxEtcdCommands {
    pub backup: Vec<String>,
    pub renew: Vec<String>,
    pub validate: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LinuxEtcdCommandBuilder {
    paths: CertificatePaths,
    timestamp: String,
}

impl LinuxEtcdCommandBuilder {
    pub fn new(paths: CertificatePaths, timestamp: impl Into<String>) -> Self {
        Self {
            paths,
            timestamp: timestamp.into(),
        }
    }

    pub fn build(&self) -> LinuxEtcdCommands {
        let pki = self.paths.etcd_pki();
        LinuxEtcdCommands {
            // etcdadm only regenerates certificates that are missing
            backup: vec![
                format!("cd {}", self.paths.etcd_dir),
                format!("sudo cp -r pki pki.bak_{}", self.timestamp),
                "sudo rm -f pki/apiserver-etcd-client.* pki/etcdctl-etcd-client.* pki/peer.* pki/server.*"
                    .to_string(),
            ],
            renew: vec![
                "sudo etcdadm join phase certificates http://localhost:2379 --init-system=kubelet"
                    .to_string(),
            ],
            validate: vec![format!(
                "sudo ETCDCTL_API=3 etcdctl --cacert={pki}/ca.crt --cert={pki}/etcdctl-etcd-client.crt --key={pki}/etcdctl-etcd-client.key endpoint health"
            )],
        }
    }
}

/// Moves the etcd client pair through `/tmp` on Linux nodes
#[derive(Debug, Clone, Copy)]
pub struct LinuxCertTransport {
    paths: CertificatePaths,
}

impl LinuxCertTransport {
    pub fn new(paths: CertificatePaths) -> Self {
        Self { paths }
    }
}

fn private_write(content_b64: &str, file: &str) -> String {
    format!(
        "echo '{}' | base64 -d | sudo sh -c 'umask 077 && cat > {}/{}'",
        content_b64, TRANSFER_DIR, file
    )
}

impl CertTransport for LinuxCertTransport {
    fn transfer_commands(&self, cert_b64: &str, key_b64: &str) -> Vec<String> {
        // Files are created owner-only; an existing file would keep its old mode
        vec![
            format!(
                "sudo rm -f {}/{} {}/{}",
                TRANSFER_DIR, ETCD_CLIENT_CERT, TRANSFER_DIR, ETCD_CLIENT_KEY
            ),
            private_write(cert_b64, ETCD_CLIENT_CERT),
            private_write(key_b64, ETCD_CLIENT_KEY),
        ]
    }

    fn prepare_read_commands(&self) -> Vec<String> {
        Vec::new()
    }

    fn read_cert_command(&self) -> String {
        format!("sudo cat {}/{}", self.paths.etcd_pki(), ETCD_CLIENT_CERT)
    }

    fn read_key_command(&self) -> String {
        format!("sudo cat {}/{}", self.paths.etcd_pki(), ETCD_CLIENT_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: &str = "20250101_120000";

    #[test]
    fn test_control_plane_without_external_etcd() {
        let cmds = LinuxControlPlaneCommandBuilder::new(CertificatePaths::LINUX, TS, Component::All, false)
            .build();
        assert_eq!(
            cmds.backup,
            vec!["sudo cp -r /etc/kubernetes/pki /etc/kubernetes/pki.bak_20250101_120000"]
        );
        assert_eq!(cmds.renew, vec!["sudo kubeadm certs renew all"]);
        assert!(cmds.install_etcd_client.is_empty());
        assert_eq!(cmds.validate, vec!["sudo kubeadm certs check-expiration"]);
        assert_eq!(cmds.restart[1], "sudo mv /etc/kubernetes/manifests/*.yaml /tmp/manifests.bak_20250101_120000/");
        assert_eq!(cmds.restart[2], "sleep 20");
        assert_eq!(cmds.restart[3], "sudo mv /tmp/manifests.bak_20250101_120000/*.yaml /etc/kubernetes/manifests/");
    }

    #[test]
    fn test_control_plane_only_with_external_etcd() {
        let cmds = LinuxControlPlaneCommandBuilder::new(
            CertificatePaths::LINUX,
            TS,
            Component::ControlPlane,
            true,
        )
        .build();
        assert!(cmds.backup.iter().any(|c| c.contains("-path ./etcd -prune")));
        assert_eq!(cmds.renew.len(), NON_ETCD_CERTS.len());
        assert!(cmds.renew.iter().all(|c| !c.ends_with(" all")));
        assert!(!cmds.renew.iter().any(|c| c.contains("apiserver-etcd-client")));
        assert_eq!(
            cmds.install_etcd_client[0],
            "sudo cp /tmp/apiserver-etcd-client.crt /etc/kubernetes/pki/apiserver-etcd-client.crt"
        );
    }

    #[test]
    fn test_full_run_with_external_etcd_backs_up_everything() {
        let cmds = LinuxControlPlaneCommandBuilder::new(CertificatePaths::LINUX, TS, Component::All, true)
            .build();
        assert_eq!(cmds.backup.len(), 1);
        assert!(cmds.backup[0].starts_with("sudo cp -r /etc/kubernetes/pki "));
        assert!(!cmds.install_etcd_client.is_empty());
    }

    #[test]
    fn test_etcd_commands() {
        let cmds = LinuxEtcdCommandBuilder::new(CertificatePaths::LINUX, TS).build();
        assert_eq!(cmds.backup[0], "cd /etc/etcd");
        assert_eq!(cmds.backup[1], "sudo cp -r pki pki.bak_20250101_120000");
        assert!(cmds.renew[0].contains("etcdadm join phase certificates"));
        assert!(cmds.validate[0].contains("--cacert=/etc/etcd/pki/ca.crt"));
        assert!(cmds.validate[0].ends_with("endpoint health"));
    }

    #[test]
    fn test_transport() {
        let transport = LinuxCertTransport::new(CertificatePaths::LINUX);
        let cmds = transport.transfer_commands("Y2VydA==", "a2V5");
        assert_eq!(
            cmds[0],
            "sudo rm -f /tmp/apiserver-etcd-client.crt /tmp/apiserver-etcd-client.key"
        );
        assert_eq!(
            cmds[1],
            "echo 'Y2VydA==' | base64 -d | sudo sh -c 'umask 077 && cat > /tmp/apiserver-etcd-client.crt'"
        );
        assert_eq!(
            cmds[2],
            "echo 'a2V5' | base64 -d | sudo sh -c 'umask 077 && cat > /tmp/apiserver-etcd-client.key'"
        );
        assert!(cmds.iter().all(|c| !c.contains("tee")));
        assert!(transport.prepare_read_commands().is_empty());
        assert_eq!(
            transport.read_cert_command(),
            "sudo cat /etc/etcd/pki/apiserver-etcd-client.crt"
        );
        assert_eq!(
            transport.read_key_command(),
            "sudo cat /etc/etcd/pki/apiserver-etcd-client.key"
        );
    }
}
