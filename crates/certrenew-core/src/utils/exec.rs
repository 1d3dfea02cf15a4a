use anyhow::{Context, Result};
use std::path::Path;
use std::process::{Output, Stdio};

/// Local command execution and filesystem helpers
pub mod local {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::process::Command;

    pub async fn execute(program: &str, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdout(Stdio::piped()); // Capture stdout for parsing
        cmd.stderr(Stdio::piped()); // Capture stderr for error messages
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        cmd.output()
            .await
            .with_context(|| format!("Failed to execute command: {}", program))
    }

    /// Execute a command feeding `input` on stdin
    pub async fn execute_with_stdin(program: &str, args: &[&str], input: &[u8]) -> Result<Output> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to execute command: {}", program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input)
                .await
                .with_context(|| format!("Failed to write stdin for: {}", program))?;
            // Close stdin so the child sees EOF
            drop(stdin);
        }

        child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for command: {}", program))
    }

    /// Check if a command exists using native Rust (which crate)
    pub fn check_command_exists(command: &str) -> bool {
        which::which(command).is_ok()
    }

    pub fn read_file(path: impl AsRef<Path>) -> Result<String> {
        let path_ref = path.as_ref();
        std::fs::read_to_string(path_ref)
            .with_context(|| format!("Failed to read file: {}", path_ref.display()))
    }

    /// Write a file readable only by the owner
    pub fn write_private_file(path: impl AsRef<Path>, contents: &[u8]) -> Result<()> {
        let path_ref = path.as_ref();
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(path_ref)
            .with_context(|| format!("Failed to open file: {}", path_ref.display()))?;
        std::io::Write::write_all(&mut file, contents)
            .with_context(|| format!("Failed to write file: {}", path_ref.display()))?;

        // mode() only applies on creation
        set_permissions(path_ref, 0o600)
    }

    /// Create a directory and its parents, restricting the leaf to the owner
    pub fn create_private_dir(path: impl AsRef<Path>) -> Result<()> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)
            .with_context(|| format!("Failed to create directory: {}", path_ref.display()))?;
        set_permissions(path_ref, 0o700)
    }

    /// Set file permissions (no-op off unix)
    pub fn set_permissions(path: impl AsRef<Path>, mode: u32) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let path_ref = path.as_ref();
            std::fs::set_permissions(path_ref, std::fs::Permissions::from_mode(mode))
                .with_context(|| format!("Failed to set permissions for: {}", path_ref.display()))?;
        }
        #[cfg(not(unix))]
        let _ = (path, mode);
        Ok(())
    }

    /// Make every entry under `path` owner-writable so it can be removed
    pub fn make_writable_recursive(path: impl AsRef<Path>) -> Result<()> {
        let path_ref = path.as_ref();
        let metadata = std::fs::symlink_metadata(path_ref)
            .with_context(|| format!("Failed to stat: {}", path_ref.display()))?;
        if metadata.file_type().is_symlink() {
            return Ok(());
        }

        let mut permissions = metadata.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = permissions.mode() | 0o700;
            permissions.set_mode(mode);
        }
        #[cfg(not(unix))]
        permissions.set_readonly(false);
        std::fs::set_permissions(path_ref, permissions)
            .with_context(|| format!("Failed to set permissions for: {}", path_ref.display()))?;

        if metadata.is_dir() {
            let dir = std::fs::read_dir(path_ref)
                .with_context(|| format!("Failed to read directory: {}", path_ref.display()))?;
            for entry in dir {
                let entry = entry?;
                make_writable_recursive(entry.path())?;
            }
        }
        Ok(())
    }

    /// Remove a directory and all its contents using native Rust
    pub fn remove_dir_all(path: impl AsRef<Path>) -> Result<()> {
        let path_ref = path.as_ref();
        std::fs::remove_dir_all(path_ref)
            .with_context(|| format!("Failed to remove directory: {}", path_ref.display()))
    }

    /// Get the current user's home directory using native Rust
    pub fn get_home_dir() -> Result<String> {
        std::env::var("HOME")
            .or_else(|_| -> Result<String, std::env::VarError> {
                // Fallback to using whoami crate
                let username = whoami::username();
                if cfg!(target_os = "macos") {
                    Ok(format!("/Users/{}", username))
                } else {
                    Ok(format!("/home/{}", username))
                }
            })
            .with_context(|| "Failed to get home directory")
    }
}

/// Quote a value for a POSIX shell
pub fn shell_escape(s: &str) -> String {
    // Simple escaping - wrap in single quotes and escape single quotes
    if s.is_empty() {
        return "''".to_string();
    }

    // If string contains no special characters, return as-is
    if s.chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '/' | '.' | ':' | '=' | ','))
    {
        return s.to_string();
    }

    // Escape single quotes by ending quote, adding escaped quote, starting new quote
    let escaped = s.replace('\'', "'\"'\"'");
    format!("'{}'", escaped)
}
