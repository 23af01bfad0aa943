//! kitebroker configuration.
//!
//! Stored as TOML at `$KITEBROKER_CONFIG`, or by default:
//! - Linux: `~/.config/kitebroker/kitebroker.toml`
//! - Windows: `%APPDATA%/kitebroker/kitebroker.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use kitebroker_api::ClientConfig;
use serde::{Deserialize, Serialize};

const CONFIG_ENV: &str = "KITEBROKER_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// kiteworks hostname, without scheme.
    #[serde(default)]
    pub server: String,

    /// Acting user.
    #[serde(default)]
    pub username: String,

    /// OAuth application id.
    #[serde(default)]
    pub application_id: String,

    #[serde(default)]
    pub client_secret: String,

    /// Enables unattended signature grants when set.
    #[serde(default)]
    pub signature_secret: String,

    /// Defaults to the server's callback page.
    #[serde(default)]
    pub redirect_uri: String,

    /// Proxy for every request; the environment's proxy is never used.
    #[serde(default)]
    pub proxy: String,

    #[serde(default = "default_true")]
    pub verify_ssl: bool,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Upload chunk size in MiB (1 to 68).
    #[serde(default = "default_chunk_mib")]
    pub chunk_size_mib: u64,

    /// Concurrent API calls.
    #[serde(default = "default_limit")]
    pub call_limit: i64,

    /// Concurrent transfers.
    #[serde(default = "default_limit")]
    pub transfer_limit: i64,

    /// Token and upload-resume database. Empty keeps everything in memory.
    #[serde(default = "default_database")]
    pub database: String,

    /// Passphrase for values encrypted in the database.
    #[serde(default)]
    pub database_key: String,
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    12
}

fn default_request_timeout() -> u64 {
    300
}

fn default_retries() -> u32 {
    3
}

fn default_chunk_mib() -> u64 {
    68
}

fn default_limit() -> i64 {
    4
}

fn default_database() -> String {
    config_dir()
        .map(|d| d.join("kitebroker.db").display().to_string())
        .unwrap_or_default()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: String::new(),
            username: String::new(),
            application_id: String::new(),
            client_secret: String::new(),
            signature_secret: String::new(),
            redirect_uri: String::new(),
            proxy: String::new(),
            verify_ssl: true,
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            retries: default_retries(),
            chunk_size_mib: default_chunk_mib(),
            call_limit: default_limit(),
            transfer_limit: default_limit(),
            database: default_database(),
            database_key: String::new(),
        }
    }
}

impl Settings {
    /// Loads settings from disk, writing a default file if none exists.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let settings = Settings::default();
            settings.save_to(path)?;
            tracing::info!(path = %path.display(), "wrote default configuration");
            Ok(settings)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Holds secrets.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Checks the fields a client cannot do without.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("server", &self.server),
            ("username", &self.username),
            ("application_id", &self.application_id),
            ("client_secret", &self.client_secret),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("`{name}` is not set in the configuration");
            }
        }
        Ok(())
    }

    pub fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = ClientConfig::new(
            self.server.trim(),
            self.application_id.trim(),
            &self.client_secret,
        )?
        .with_retries(self.retries)
        .with_max_chunk_size(self.chunk_size_mib.saturating_mul(1 << 20));

        if !self.signature_secret.is_empty() {
            config = config.with_signature_secret(&self.signature_secret)?;
        }
        if !self.redirect_uri.is_empty() {
            config.redirect_uri = self.redirect_uri.clone();
        }
        config.proxy = (!self.proxy.is_empty()).then(|| self.proxy.clone());
        config.verify_ssl = self.verify_ssl;
        config.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        config.request_timeout = Duration::from_secs(self.request_timeout_secs);
        Ok(config)
    }
}

fn config_path() -> anyhow::Result<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(config_dir()?.join("kitebroker.toml"))
}

fn config_dir() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("kitebroker"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home).join(".config").join("kitebroker"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_gets_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            server = "kw.example.com"
            username = "alice@example.com"
            retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(settings.server, "kw.example.com");
        assert_eq!(settings.retries, 5);
        assert!(settings.verify_ssl);
        assert_eq!(settings.chunk_size_mib, 68);
        assert_eq!(settings.call_limit, 4);
    }

    #[test]
    fn missing_file_is_created_private() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("kitebroker.toml");
        let settings = Settings::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(settings.request_timeout_secs, 300);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let again = Settings::load_from(&path).unwrap();
        assert_eq!(again.database, settings.database);
    }

    #[test]
    fn validate_names_the_missing_field() {
        let settings = Settings {
            server: "kw.example.com".into(),
            ..Settings::default()
        };
        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("username"), "{err}");
    }

    #[test]
    fn client_config_conversion() {
        let settings = Settings {
            server: " kw.example.com ".into(),
            application_id: "app".into(),
            client_secret: "s3cret".into(),
            proxy: "http://proxy.local:3128".into(),
            chunk_size_mib: 500,
            request_timeout_secs: 30,
            ..Settings::default()
        };
        let config = settings.client_config().unwrap();
        assert_eq!(config.server, "kw.example.com");
        assert_eq!(config.client_secret().unwrap(), "s3cret");
        assert_eq!(config.proxy.as_deref(), Some("http://proxy.local:3128"));
        assert_eq!(config.max_chunk_size(), 68 << 20);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(!config.has_signature_secret());
    }
}
