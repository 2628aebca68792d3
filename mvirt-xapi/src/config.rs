//! Adapter configuration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::credentials::CredentialStore;
use crate::error::{Result, XapiError};
use crate::pool::{ConnectRequest, ConnectionSettings};

fn default_api_version() -> String {
    "1.0".to_string()
}

fn default_originator() -> String {
    "mvirt-xapi".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_task_timeout_secs() -> u64 {
    3600
}

fn default_migrate_timeout_secs() -> u64 {
    4 * 3600
}

fn default_wait_secs() -> u64 {
    600
}

fn default_retries() -> u32 {
    1
}

fn default_retry_interval_ms() -> u64 {
    200
}

fn default_true() -> bool {
    true
}

/// Connection and timing settings for one managed pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XapiConfig {
    #[serde(default)]
    pub pool_id: String,
    #[serde(default)]
    pub host_uuid: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub username: String,
    /// Oldest first; the last entry is the newest password.
    #[serde(default)]
    pub passwords: Vec<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_originator")]
    pub originator: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_migrate_timeout_secs")]
    pub migrate_timeout_secs: u64,
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
}

impl Default for XapiConfig {
    fn default() -> Self {
        Self {
            pool_id: String::new(),
            host_uuid: String::new(),
            address: String::new(),
            username: String::new(),
            passwords: Vec::new(),
            api_version: default_api_version(),
            originator: default_originator(),
            poll_interval_ms: default_poll_interval_ms(),
            task_timeout_secs: default_task_timeout_secs(),
            migrate_timeout_secs: default_migrate_timeout_secs(),
            wait_secs: default_wait_secs(),
            retries: default_retries(),
            retry_interval_ms: default_retry_interval_ms(),
            accept_invalid_certs: default_true(),
        }
    }
}

impl XapiConfig {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            XapiError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            XapiError::Configuration(format!("failed to parse {}: {e}", path.display()))
        })
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("pool_id", self.pool_id.trim().is_empty()),
            ("host_uuid", self.host_uuid.trim().is_empty()),
            ("address", self.address.trim().is_empty()),
            ("username", self.username.trim().is_empty()),
            ("passwords", self.passwords.is_empty()),
        ];
        if let Some((name, _)) = required.iter().find(|(_, missing)| *missing) {
            return Err(XapiError::Configuration(format!("{name} is required")));
        }
        if self.poll_interval_ms == 0 {
            return Err(XapiError::Configuration(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn migrate_timeout(&self) -> Duration {
        Duration::from_secs(self.migrate_timeout_secs)
    }

    pub fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            wait: Duration::from_secs(self.wait_secs),
            retries: self.retries,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            api_version: self.api_version.clone(),
            originator: self.originator.clone(),
        }
    }

    pub fn credential_store(&self) -> CredentialStore {
        CredentialStore::new(self.username.clone(), self.passwords.iter().cloned())
    }

    pub fn connect_request(&self, credentials: Arc<CredentialStore>) -> ConnectRequest {
        ConnectRequest {
            host_uuid: self.host_uuid.clone(),
            pool_id: self.pool_id.clone(),
            address: self.address.clone(),
            credentials,
            settings: self.settings(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: XapiConfig = serde_json::from_str(
            r#"{"pool_id":"p","host_uuid":"h","address":"10.0.0.1","username":"root","passwords":["a"]}"#,
        )
        .unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.task_timeout(), Duration::from_secs(3600));
        assert_eq!(config.api_version, "1.0");
        assert!(config.accept_invalid_certs);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_names_missing_field() {
        let config = XapiConfig {
            pool_id: "p".into(),
            host_uuid: "h".into(),
            address: "10.0.0.1".into(),
            username: "root".into(),
            ..Default::default()
        };
        match config.validate() {
            Err(XapiError::Configuration(msg)) => assert!(msg.contains("passwords")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_blank_identifiers() {
        let base = XapiConfig {
            pool_id: "p".into(),
            host_uuid: "h".into(),
            address: "10.0.0.1".into(),
            username: "root".into(),
            passwords: vec!["a".into()],
            ..Default::default()
        };
        assert!(base.validate().is_ok());

        let blank_pool = XapiConfig {
            pool_id: "   ".into(),
            ..base.clone()
        };
        assert!(matches!(
            blank_pool.validate(),
            Err(XapiError::Configuration(msg)) if msg.contains("pool_id")
        ));

        let blank_address = XapiConfig {
            address: "\t".into(),
            ..base
        };
        assert!(matches!(
            blank_address.validate(),
            Err(XapiError::Configuration(msg)) if msg.contains("address")
        ));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"pool_id":"p","host_uuid":"h","address":"a","username":"u","passwords":["x","y"],"retries":3}}"#
        )
        .unwrap();

        let config = XapiConfig::load(file.path()).unwrap();
        assert_eq!(config.retries, 3);
        let store = config.credential_store();
        assert_eq!(store.len(), 2);
        assert_eq!(store.current_head().unwrap().expose(), "x");
    }

    #[test]
    fn load_reports_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            XapiConfig::load(file.path()),
            Err(XapiError::Configuration(_))
        ));
    }
}
