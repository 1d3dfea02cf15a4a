use std::fs;
use std::path::Path;

use certrenew_core::config::{load_config_with_env, validate_config};
use certrenew_core::{Component, ConfigError, OsFamily};

fn write_config(dir: &Path, key: &Path, extra: &str) -> std::path::PathBuf {
    let yaml = format!(
        "clusterName: prod\n\
os: bottlerocket\n\
controlPlane:\n  nodes:\n    - 10.0.0.1\n    - 10.0.0.2\n  ssh:\n    sshUser: ec2-user\n    sshKey: {key}\n\
etcd:\n  nodes:\n    - 10.0.0.10\n  ssh:\n    sshUser: ec2-user\n    sshKey: {key}\n{extra}",
        key = key.display(),
        extra = extra
    );
    let path = dir.join("config.yaml");
    fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn test_load_and_validate_full_config() {
    let tmp = tempfile::tempdir().unwrap();
    let key = tmp.path().join("id_rsa");
    fs::write(&key, "key").unwrap();
    let path = write_config(tmp.path(), &key, "");

    let env = |name: &str| match name {
        "CERTRENEW_SSH_KEY_PASSPHRASE_ETCD" => Some("etcd-secret".to_string()),
        _ => None,
    };
    let cfg = load_config_with_env(&path, env).unwrap();

    assert_eq!(cfg.cluster_name, "prod");
    assert_eq!(cfg.os_family(), Some(OsFamily::Bottlerocket));
    assert_eq!(cfg.control_plane.nodes, vec!["10.0.0.1", "10.0.0.2"]);
    assert!(cfg.has_external_etcd());
    assert_eq!(cfg.etcd.ssh.passphrase.as_deref(), Some("etcd-secret"));
    assert_eq!(cfg.control_plane.ssh.passphrase, None);

    assert_eq!(validate_config(&cfg, "").unwrap(), Component::All);
    assert_eq!(validate_config(&cfg, "etcd").unwrap(), Component::Etcd);
}

#[test]
fn test_missing_key_file_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_config(tmp.path(), &tmp.path().join("absent"), "");
    let cfg = load_config_with_env(&path, |_| None).unwrap();

    let err = validate_config(&cfg, "control-plane").unwrap_err();
    assert!(matches!(err, ConfigError::SshKeyNotFound { .. }));
}

#[test]
fn test_unknown_component_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let key = tmp.path().join("id_rsa");
    fs::write(&key, "key").unwrap();
    let cfg = load_config_with_env(&write_config(tmp.path(), &key, ""), |_| None).unwrap();

    let err = validate_config(&cfg, "worker").unwrap_err();
    assert_eq!(
        err.to_string(),
        "invalid component \"worker\", must be either \"etcd\" or \"control-plane\""
    );
}

#[test]
fn test_malformed_yaml() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("bad.yaml");
    fs::write(&path, "clusterName: foo: bar").unwrap();

    let err = load_config_with_env(&path, |_| None).unwrap_err();
    assert!(err.to_string().contains("parsing config file"));
}

#[test]
fn test_missing_file() {
    let tmp = tempfile::tempdir().unwrap();
    let err = load_config_with_env(&tmp.path().join("nope.yaml"), |_| None).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}
