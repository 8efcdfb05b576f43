//! Runtime configuration and the host facts captured at session start.
//!
//! [`RuntimeConfig`] is plain data: it can be built in code with the `with_*`
//! methods or deserialized from any serde format. [`LocaleSnapshot`] is taken
//! once when a session starts and never changes afterwards.

use crate::runtime::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Interval between graveyard sweeps when nothing else is configured.
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 10_000;

/// Device class reported to scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormFactor {
    #[default]
    Phone,
    Tablet,
}

impl FormFactor {
    pub fn as_str(self) -> &'static str {
        match self {
            FormFactor::Phone => "phone",
            FormFactor::Tablet => "tablet",
        }
    }
}

/// Configuration for a single engine session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Entry script loaded with `require` once the engine is initialized
    pub script_path: Option<String>,

    /// Directory holding bundled scripts and assets; must exist when set
    pub asset_root: Option<PathBuf>,

    /// Period of the graveyard sweep, in milliseconds
    pub cleanup_interval_ms: u64,

    /// Size of the request worker pool (None = one ad-hoc thread per request)
    pub worker_threads: Option<usize>,

    /// Locale tag override, e.g. "de_DE" (None = read from the environment)
    pub locale: Option<String>,

    /// Time zone override, e.g. "Europe/Berlin" (None = read from `TZ`)
    pub timezone: Option<String>,

    /// Display density handed to the engine
    pub density: f32,

    pub form_factor: FormFactor,

    /// Pause before initializing the engine, in milliseconds
    pub startup_delay_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            script_path: None,
            asset_root: None,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            worker_threads: None,
            locale: None,
            timezone: None,
            density: 1.0,
            form_factor: FormFactor::Phone,
            startup_delay_ms: 0,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script_path(mut self, path: impl Into<String>) -> Self {
        self.script_path = Some(path.into());
        self
    }

    pub fn with_asset_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.asset_root = Some(root.into());
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval_ms = duration_to_millis(interval);
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    pub fn with_locale(mut self, tag: impl Into<String>) -> Self {
        self.locale = Some(tag.into());
        self
    }

    pub fn with_timezone(mut self, zone: impl Into<String>) -> Self {
        self.timezone = Some(zone.into());
        self
    }

    pub fn with_density(mut self, density: f32) -> Self {
        self.density = density;
        self
    }

    pub fn with_form_factor(mut self, form_factor: FormFactor) -> Self {
        self.form_factor = form_factor;
        self
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay_ms = duration_to_millis(delay);
        self
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    /// Reject configurations a session cannot be created from.
    pub fn validate(&self) -> Result<()> {
        if let Some(root) = &self.asset_root {
            if !root.is_dir() {
                return Err(RuntimeError::MissingResource(format!(
                    "asset root '{}' is not a directory",
                    root.display()
                )));
            }
        }

        if let Some(path) = &self.script_path {
            if path.trim().is_empty() {
                return Err(RuntimeError::InvalidConfig(
                    "script_path cannot be empty".to_string(),
                ));
            }
        }

        if self.cleanup_interval_ms == 0 {
            return Err(RuntimeError::InvalidConfig(
                "cleanup_interval_ms must be positive".to_string(),
            ));
        }

        if self.worker_threads == Some(0) {
            return Err(RuntimeError::InvalidConfig(
                "worker_threads must be positive when set".to_string(),
            ));
        }

        if !(self.density.is_finite() && self.density > 0.0) {
            return Err(RuntimeError::InvalidConfig(format!(
                "density must be a positive number, got {}",
                self.density
            )));
        }

        Ok(())
    }
}

fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Locale and time zone as seen by the host when the session started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocaleSnapshot {
    /// Language plus optional country, e.g. "de_DE" or "fr"
    pub locale: String,
    pub language: String,
    pub timezone: String,
}

impl LocaleSnapshot {
    /// Resolve the snapshot from config overrides, falling back to the
    /// process environment.
    pub fn capture(config: &RuntimeConfig) -> Self {
        let tag = config
            .locale
            .clone()
            .or_else(|| non_empty_env("LC_ALL"))
            .or_else(|| non_empty_env("LANG"))
            .unwrap_or_default();
        let timezone = config
            .timezone
            .clone()
            .or_else(|| non_empty_env("TZ"))
            .unwrap_or_else(|| "UTC".to_string());
        Self::from_tag(&tag, timezone)
    }

    /// Parse a POSIX or BCP 47 style tag ("de_DE.UTF-8", "en-US", "C").
    pub fn from_tag(tag: &str, timezone: impl Into<String>) -> Self {
        let base = tag
            .split(['.', '@'])
            .next()
            .unwrap_or_default()
            .trim()
            .replace('-', "_");

        let (language, country) = match base.split_once('_') {
            Some((language, country)) => (language.to_lowercase(), country.to_uppercase()),
            None => (base.to_lowercase(), String::new()),
        };
        let language = match language.as_str() {
            "" | "c" | "posix" => "en".to_string(),
            _ => language,
        };

        let locale = if country.is_empty() {
            language.clone()
        } else {
            format!("{language}_{country}")
        };

        Self {
            locale,
            language,
            timezone: timezone.into(),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.script_path.is_none());
        assert!(config.asset_root.is_none());
        assert_eq!(config.cleanup_interval(), Duration::from_secs(10));
        assert!(config.worker_threads.is_none());
        assert_eq!(config.density, 1.0);
        assert_eq!(config.form_factor, FormFactor::Phone);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = RuntimeConfig::new()
            .with_script_path("main.js")
            .with_cleanup_interval(Duration::from_millis(250))
            .with_worker_threads(4)
            .with_locale("de_DE")
            .with_timezone("Europe/Berlin")
            .with_form_factor(FormFactor::Tablet);

        assert_eq!(config.script_path.as_deref(), Some("main.js"));
        assert_eq!(config.cleanup_interval_ms, 250);
        assert_eq!(config.worker_threads, Some(4));
        assert_eq!(config.form_factor.as_str(), "tablet");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_asset_root() {
        let config = RuntimeConfig::new().with_asset_root("/definitely/not/here/jsloop");
        assert!(matches!(
            config.validate(),
            Err(RuntimeError::MissingResource(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            RuntimeConfig::new().with_script_path("  "),
            RuntimeConfig::new().with_cleanup_interval(Duration::ZERO),
            RuntimeConfig::new().with_worker_threads(0),
            RuntimeConfig::new().with_density(0.0),
            RuntimeConfig::new().with_density(f32::NAN),
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(RuntimeError::InvalidConfig(_))),
                "{config:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{ "script_path": "app.js", "form_factor": "tablet", "worker_threads": 2 }"#,
        )
        .unwrap();
        assert_eq!(config.script_path.as_deref(), Some("app.js"));
        assert_eq!(config.form_factor, FormFactor::Tablet);
        assert_eq!(config.worker_threads, Some(2));
        assert_eq!(config.cleanup_interval_ms, DEFAULT_CLEANUP_INTERVAL_MS);
    }

    #[test]
    fn test_locale_from_posix_tag() {
        let snapshot = LocaleSnapshot::from_tag("de_DE.UTF-8", "Europe/Berlin");
        assert_eq!(snapshot.locale, "de_DE");
        assert_eq!(snapshot.language, "de");
        assert_eq!(snapshot.timezone, "Europe/Berlin");
    }

    #[test]
    fn test_locale_without_country() {
        let snapshot = LocaleSnapshot::from_tag("fr", "UTC");
        assert_eq!(snapshot.locale, "fr");
        assert_eq!(snapshot.language, "fr");

        let snapshot = LocaleSnapshot::from_tag("en-us", "UTC");
        assert_eq!(snapshot.locale, "en_US");

        let snapshot = LocaleSnapshot::from_tag("C", "UTC");
        assert_eq!(snapshot.locale, "en");
    }

    #[test]
    fn test_capture_prefers_overrides() {
        let config = RuntimeConfig::new()
            .with_locale("it_IT")
            .with_timezone("Europe/Rome");
        let snapshot = LocaleSnapshot::capture(&config);
        assert_eq!(snapshot.locale, "it_IT");
        assert_eq!(snapshot.timezone, "Europe/Rome");
    }
}
