//! Session configuration
//!
//! Keys follow the camelCase names recognised by the presentation layer
//! (`debounceMs`, `maxRetries`, ...). Invalid values are a contract violation
//! and refuse session construction.

use crate::autosave::Backoff;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Policy when an AI request of the same kind is still pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssistPolicy {
    /// Abandon the pending request and issue the new one
    #[default]
    CancelPrevious,
    /// Refuse the new request
    RejectNew,
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Quiet period after the last edit before autosave fires
    pub debounce_ms: u64,
    /// Retries after the first failed save before giving up
    pub max_retries: u32,
    /// First backoff delay; doubles per failure
    pub backoff_base_ms: u64,
    /// Upper bound of a single backoff delay
    pub backoff_max_ms: u64,
    /// Upper bound of every network call
    pub operation_timeout_ms: u64,
    /// Largest accepted upload
    pub max_upload_size_bytes: u64,
    /// Upload MIME allow-list
    pub allowed_mime_types: BTreeSet<String>,
    /// Same-kind AI request policy
    pub ai_concurrency_policy: AssistPolicy,
    /// Save automatically after the debounce window
    pub autosave: bool,
    /// Accept AI assist requests
    pub enable_ai: bool,
    /// Accept uploads
    pub enable_upload: bool,
    /// Finished requests, tasks and journal entries kept per session
    pub history_limit: usize,
}

impl SessionConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// Returns `ConfigError` if the TOML is malformed or a value is out of range
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or is invalid
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// With debounce window
    #[inline]
    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = duration_ms(debounce);
        self
    }

    /// With max retries
    #[inline]
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// With backoff base delay
    #[inline]
    #[must_use]
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base_ms = duration_ms(base);
        self
    }

    /// With network operation timeout
    #[inline]
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = duration_ms(timeout);
        self
    }

    /// With max upload size
    #[inline]
    #[must_use]
    pub fn with_max_upload_size(mut self, bytes: u64) -> Self {
        self.max_upload_size_bytes = bytes;
        self
    }

    /// With MIME allow-list
    #[must_use]
    pub fn with_allowed_mime_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_mime_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// With AI concurrency policy
    #[inline]
    #[must_use]
    pub fn with_assist_policy(mut self, policy: AssistPolicy) -> Self {
        self.ai_concurrency_policy = policy;
        self
    }

    /// With autosave on or off
    #[inline]
    #[must_use]
    pub fn with_autosave(mut self, enabled: bool) -> Self {
        self.autosave = enabled;
        self
    }

    /// With history limit
    #[inline]
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Check every value against its contract
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_base_ms == 0 {
            return Err(ConfigError::invalid("backoffBaseMs", "must be greater than zero"));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError::invalid(
                "backoffMaxMs",
                format!("must be at least backoffBaseMs ({})", self.backoff_base_ms),
            ));
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "operationTimeoutMs",
                "must be greater than zero",
            ));
        }
        if self.max_upload_size_bytes == 0 {
            return Err(ConfigError::invalid(
                "maxUploadSizeBytes",
                "must be greater than zero",
            ));
        }
        if self.enable_upload && self.allowed_mime_types.is_empty() {
            return Err(ConfigError::invalid(
                "allowedMimeTypes",
                "must not be empty while uploads are enabled",
            ));
        }
        if let Some(bad) = self.allowed_mime_types.iter().find(|m| !m.contains('/')) {
            return Err(ConfigError::invalid(
                "allowedMimeTypes",
                format!("'{bad}' is not a type/subtype pair"),
            ));
        }
        if self.history_limit == 0 {
            return Err(ConfigError::invalid("historyLimit", "must be greater than zero"));
        }
        Ok(())
    }

    /// Debounce window
    #[inline]
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Network operation timeout
    #[inline]
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Backoff delay before retry number `attempt` (1-based)
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        Backoff::new(self.backoff_base_ms, self.backoff_max_ms).delay(attempt)
    }

    /// Check a MIME type against the allow-list (case-insensitive)
    #[must_use]
    pub fn is_mime_allowed(&self, mime_type: &str) -> bool {
        let normalized = mime_type.trim().to_ascii_lowercase();
        self.allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&normalized))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            max_retries: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            operation_timeout_ms: 30_000,
            max_upload_size_bytes: 10 * 1024 * 1024,
            allowed_mime_types: [
                "image/png",
                "image/jpeg",
                "image/gif",
                "image/webp",
                "image/svg+xml",
                "image/avif",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            ai_concurrency_policy: AssistPolicy::CancelPrevious,
            autosave: true,
            enable_ai: true,
            enable_upload: true,
            history_limit: 64,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_config_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.debounce(), Duration::from_secs(2));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.max_upload_size_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let config = SessionConfig::default();
        assert_eq!(config.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn parses_camel_case_toml() {
        let config = SessionConfig::from_toml_str(
            r#"
            debounceMs = 500
            maxRetries = 2
            aiConcurrencyPolicy = "reject-new"
            allowedMimeTypes = ["image/png"]
            "#,
        )
        .unwrap();

        assert_eq!(config.debounce_ms, 500);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.ai_concurrency_policy, AssistPolicy::RejectNew);
        assert!(config.is_mime_allowed("IMAGE/PNG"));
        assert!(!config.is_mime_allowed("image/jpeg"));
        // untouched keys keep defaults
        assert_eq!(config.backoff_base_ms, 1_000);
    }

    #[test]
    fn rejects_invalid_values() {
        let err = SessionConfig::new()
            .with_allowed_mime_types(Vec::<String>::new())
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "allowedMimeTypes",
                ..
            }
        ));

        let err = SessionConfig::from_toml_str("backoffBaseMs = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "backoffBaseMs", .. }));

        assert!(matches!(
            SessionConfig::from_toml_str("debounceMs = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn uploads_disabled_allows_empty_allow_list() {
        let mut config = SessionConfig::new().with_allowed_mime_types(Vec::<String>::new());
        config.enable_upload = false;
        assert!(config.validate().is_ok());
    }

    proptest! {
        #[test]
        fn backoff_never_exceeds_cap(attempt in 0u32..200, base in 1u64..5_000) {
            let mut config = SessionConfig::default();
            config.backoff_base_ms = base;
            let delay = config.backoff_delay(attempt);
            prop_assert!(delay <= Duration::from_millis(config.backoff_max_ms));
            prop_assert!(delay >= Duration::from_millis(base.min(config.backoff_max_ms)));
        }
    }
}
