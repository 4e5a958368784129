//! Server-side configuration, read from `/etc/openerp/<context>.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Directory holding named server contexts.
pub const CONFIG_DIR: &str = "/etc/openerp";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for `data.redb` and `data.sqlite`.
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// HMAC secret shared with the login service that issues tokens.
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Gap-free lock wait in milliseconds. 0 fails at once.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,

    /// Check the permissions carried by the caller's token against each
    /// operation. When off, every authenticated caller may do everything.
    #[serde(default = "default_true")]
    pub enforce_permissions: bool,
}

fn default_lock_wait_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            lock_wait_ms: default_lock_wait_ms(),
            enforce_permissions: true,
        }
    }
}

impl SequenceConfig {
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

/// `openerpd` configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub storage: StorageConfig,

    pub jwt: JwtConfig,

    #[serde(default)]
    pub sequence: SequenceConfig,
}

impl ServerConfig {
    /// A bare context name maps to `/etc/openerp/<name>.toml`; anything that
    /// looks like a path is used as is.
    pub fn resolve_path(name_or_path: &str) -> PathBuf {
        if name_or_path.contains('/') || name_or_path.contains('.') {
            PathBuf::from(name_or_path)
        } else {
            Path::new(CONFIG_DIR).join(format!("{name_or_path}.toml"))
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
        let config: ServerConfig = toml::from_str(&content)?;
        if config.storage.data_dir.trim().is_empty() {
            anyhow::bail!("Storage data_dir is empty in configuration.");
        }
        if config.jwt.secret.is_empty() {
            anyhow::bail!("JWT secret is empty in configuration.");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path() {
        assert_eq!(
            ServerConfig::resolve_path("cn-stage"),
            PathBuf::from("/etc/openerp/cn-stage.toml")
        );
        assert_eq!(
            ServerConfig::resolve_path("./local.toml"),
            PathBuf::from("./local.toml")
        );
    }

    #[test]
    fn test_load_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.toml");
        std::fs::write(&path, "[storage]\ndata_dir = \"/var/lib/openerp\"\n\n[jwt]\nsecret = \"s3cret\"\n").unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.storage.data_dir, "/var/lib/openerp");
        assert_eq!(config.jwt.secret, "s3cret");
        assert_eq!(config.sequence.lock_wait(), Duration::from_secs(5));
        assert!(config.sequence.enforce_permissions);
    }

    #[test]
    fn test_load_sequence_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.toml");
        std::fs::write(
            &path,
            "[storage]\ndata_dir = \"d\"\n\n[jwt]\nsecret = \"s3cret\"\n\n[sequence]\nlock_wait_ms = 0\nenforce_permissions = false\n",
        )
        .unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.sequence.lock_wait(), Duration::ZERO);
        assert!(!config.sequence.enforce_permissions);
    }

    #[test]
    fn test_empty_data_dir_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[storage]\ndata_dir = \"\"\n\n[jwt]\nsecret = \"s3cret\"\n").unwrap();
        assert!(ServerConfig::load(&path).is_err());
    }

    #[test]
    fn test_jwt_secret_required() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nojwt.toml");
        std::fs::write(&path, "[storage]\ndata_dir = \"d\"\n").unwrap();
        assert!(ServerConfig::load(&path).is_err());

        std::fs::write(&path, "[storage]\ndata_dir = \"d\"\n\n[jwt]\nsecret = \"\"\n").unwrap();
        let err = ServerConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("JWT secret"));
    }
}
