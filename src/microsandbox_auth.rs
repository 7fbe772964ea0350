use crate::errors::{Result, SandboxError};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable the microsandbox client reads its key from
pub const API_KEY_VAR: &str = "MSB_API_KEY";

/// `~/.microsandbox/server.key`
fn server_key_path() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());

    PathBuf::from(home).join(".microsandbox").join("server.key")
}

fn read_server_key(path: &Path) -> Result<String> {
    let key = std::fs::read_to_string(path).map_err(|e| {
        SandboxError::Provisioning(format!(
            "microsandbox server key not readable at {}: {}. Is the server running?",
            path.display(),
            e
        ))
    })?;
    let key = key.trim();
    if key.is_empty() {
        return Err(SandboxError::Provisioning(format!(
            "microsandbox server key at {} is empty",
            path.display()
        )));
    }
    Ok(key.to_string())
}

/// Export the local server key for the client unless one is already configured
pub fn setup_auth() -> Result<()> {
    if std::env::var(API_KEY_VAR).is_ok_and(|v| !v.trim().is_empty()) {
        return Ok(());
    }
    let path = server_key_path();
    let key = read_server_key(&path)?;
    debug!("[MICROSANDBOX] Using server key from {}", path.display());
    std::env::set_var(API_KEY_VAR, key);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_server_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.key");

        let err = read_server_key(&path).unwrap_err();
        assert!(matches!(err, SandboxError::Provisioning(_)));

        std::fs::write(&path, "  \n").unwrap();
        assert!(read_server_key(&path).is_err());

        std::fs::write(&path, "abc123\n").unwrap();
        assert_eq!(read_server_key(&path).unwrap(), "abc123");
    }
}
