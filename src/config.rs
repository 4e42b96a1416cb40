//! Session configuration with builder pattern

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hyperv::HYPERV_NAMESPACE;
use crate::wmi::Credentials;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub namespace: String,
    /// Remote host; `None` connects to the local machine
    pub server: Option<String>,
    pub credentials: Option<Credentials>,
    pub poll_interval_ms: u64,
    /// Upper bound on a single job wait; `None` waits indefinitely
    pub job_timeout_secs: Option<u64>,
}

/// Default delay between job status polls
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            namespace: HYPERV_NAMESPACE.to_string(),
            server: None,
            credentials: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            job_timeout_secs: None,
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.namespace.is_empty() {
            return Err(crate::Error::Config("namespace cannot be empty".into()));
        }
        if self.server.as_deref() == Some("") {
            return Err(crate::Error::Config("server cannot be empty; omit it for the local machine".into()));
        }
        if let Some(creds) = &self.credentials {
            if creds.user.is_empty() {
                return Err(crate::Error::Config("credentials require a user name".into()));
            }
            if self.server.is_none() {
                return Err(crate::Error::Config("credentials cannot be used for local connections".into()));
            }
        }
        if self.job_timeout_secs == Some(0) {
            return Err(crate::Error::Config("job_timeout_secs must be at least 1".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.config.server = Some(server.into());
        self
    }

    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some(Credentials {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn job_timeout_secs(mut self, secs: u64) -> Self {
        self.config.job_timeout_secs = Some(secs);
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }

    pub fn build_validated(self) -> crate::Result<SessionConfig> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_builder() {
        let config = SessionConfig::builder()
            .server("hv01")
            .credentials("admin", "pw")
            .poll_interval_ms(250)
            .job_timeout_secs(60)
            .build();

        assert_eq!(config.namespace, r"root\virtualization\v2");
        assert_eq!(config.server.as_deref(), Some("hv01"));
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.job_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_config_validation() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(SessionConfig::builder().namespace("").build().validate().is_err());
        assert!(SessionConfig::builder().credentials("admin", "pw").build().validate().is_err());
        assert!(SessionConfig::builder().server("").build().validate().is_err());
        assert!(SessionConfig::builder().job_timeout_secs(0).build_validated().is_err());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"namespace": "root\\cimv2", "poll_interval_ms": 10}}"#).unwrap();

        let config = SessionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.namespace, r"root\cimv2");
        assert_eq!(config.poll_interval_ms, 10);
        assert_eq!(config.job_timeout_secs, None);
    }

    #[test]
    fn test_config_serialization() {
        let config = SessionConfig::builder().server("hv01").credentials("admin", "pw").build();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, config);
    }
}
