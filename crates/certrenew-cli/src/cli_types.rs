// CLI types for certrenew

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "certrenew")]
#[command(about = "Renew control plane and external etcd certificates over SSH", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn verbosity(&self) -> u8 {
        match &self.command {
            Commands::Renew {
                command: RenewCommands::Certificates(args),
            } => args.verbosity,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Renew cluster resources
    Renew {
        #[command(subcommand)]
        command: RenewCommands,
    },
}

#[derive(Subcommand)]
pub enum RenewCommands {
    /// Renew external etcd and control plane certificates
    Certificates(RenewCertificatesArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RenewCertificatesArgs {
    /// Config file containing node and SSH information
    #[arg(long, short = 'f')]
    pub config: PathBuf,
    /// Component to renew certificates for (etcd or control-plane). If not specified, renews both.
    #[arg(long, short = 'c', default_value = "")]
    pub component: String,
    /// Set the verbosity level (1 shows certificate checks, 2 streams remote output)
    #[arg(long, short = 'v', default_value_t = 0)]
    pub verbosity: u8,
    /// How to reach the nodes
    #[arg(long, value_enum, default_value_t = SshMode::Direct)]
    pub ssh_mode: SshMode,
    /// Container to run ssh in (required with --ssh-mode docker)
    #[arg(long, required_if_eq("ssh_mode", "docker"))]
    pub ssh_container: Option<String>,
    /// Kubeconfig of the cluster (defaults to KUBECONFIG, then <cluster>/<cluster>-eks-a-cluster.kubeconfig)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,
    /// Directory holding the etcd client certificate between runs
    #[arg(long)]
    pub cert_cache_dir: Option<PathBuf>,
    /// Where the per-run backup directory is created
    #[arg(long, default_value = ".")]
    pub backup_root: PathBuf,
    /// Abort the run after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshMode {
    /// Run ssh from this machine
    Direct,
    /// Run ssh inside a running container via docker exec
    Docker,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renew_args(argv: &[&str]) -> RenewCertificatesArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Commands::Renew {
                command: RenewCommands::Certificates(args),
            } => args,
        }
    }

    #[test]
    fn test_defaults() {
        let args = renew_args(&["certrenew", "renew", "certificates", "-f", "cfg.yaml"]);
        assert_eq!(args.config, PathBuf::from("cfg.yaml"));
        assert_eq!(args.component, "");
        assert_eq!(args.verbosity, 0);
        assert_eq!(args.ssh_mode, SshMode::Direct);
        assert_eq!(args.backup_root, PathBuf::from("."));
        assert!(args.timeout.is_none());
    }

    #[test]
    fn test_all_flags() {
        let args = renew_args(&[
            "certrenew",
            "renew",
            "certificates",
            "--config",
            "cfg.yaml",
            "-c",
            "etcd",
            "-v",
            "2",
            "--ssh-mode",
            "docker",
            "--ssh-container",
            "tools",
            "--kubeconfig",
            "kc",
            "--cert-cache-dir",
            "/cache",
            "--timeout",
            "600",
        ]);
        assert_eq!(args.component, "etcd");
        assert_eq!(args.verbosity, 2);
        assert_eq!(args.ssh_mode, SshMode::Docker);
        assert_eq!(args.ssh_container.as_deref(), Some("tools"));
        assert_eq!(args.kubeconfig, Some(PathBuf::from("kc")));
        assert_eq!(args.cert_cache_dir, Some(PathBuf::from("/cache")));
        assert_eq!(args.timeout, Some(600));
    }

    #[test]
    fn test_config_is_required() {
        assert!(Cli::try_parse_from(["certrenew", "renew", "certificates"]).is_err());
    }

    #[test]
    fn test_docker_mode_needs_container() {
        let result = Cli::try_parse_from([
            "certrenew",
            "renew",
            "certificates",
            "-f",
            "cfg.yaml",
            "--ssh-mode",
            "docker",
        ]);
        assert!(result.is_err());
    }
}
