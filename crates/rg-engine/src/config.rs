//! Process configuration, threshold versions and explicit capabilities.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rg_core::{content_fingerprint, ProductCategory, ThresholdSet, ThresholdVersion, DEFAULT_MAX_CONTACTS};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const ENV_THRESHOLD_VERSION: &str = "env";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// A dependency that is either usable or explicitly absent with a reason.
#[derive(Debug, Clone, PartialEq)]
pub enum Capability<T> {
    Available(T),
    Unavailable(ConfigError),
}

impl<T> Capability<T> {
    pub fn as_ref(&self) -> Capability<&T> {
        match self {
            Capability::Available(value) => Capability::Available(value),
            Capability::Unavailable(err) => Capability::Unavailable(err.clone()),
        }
    }

    pub fn require(&self) -> Result<&T, ConfigError> {
        match self {
            Capability::Available(value) => Ok(value),
            Capability::Unavailable(err) => Err(err.clone()),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Capability::Available(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub database_url: String,
    pub service_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookSettings {
    pub url: String,
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub store: Capability<StoreSettings>,
    pub webhook: Capability<WebhookSettings>,
    /// Receiver side only needs the shared secret.
    pub webhook_secret: Option<String>,
    pub cron_secret: Option<String>,
    pub threshold_overrides: ThresholdSet,
    pub threshold_version: Option<String>,
    pub rate_source: String,
    pub max_contacts: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub run_lock_enabled: bool,
    pub scheduler_enabled: bool,
    pub engine_cron: String,
    pub workspace_root: PathBuf,
    pub web_port: u16,
}

fn flag(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(
    var: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match non_empty(value) {
        Some(raw) => raw.parse::<T>().map_err(|err| ConfigError::Invalid {
            var,
            reason: err.to_string(),
        }),
        None => Ok(default),
    }
}

/// Environment variable carrying the override for a product threshold.
pub fn threshold_env_var(product: ProductCategory) -> String {
    product.threshold_key().to_ascii_uppercase()
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = non_empty(lookup("DATABASE_URL"));
        let service_key =
            non_empty(lookup("SUPABASE_SERVICE_ROLE_KEY")).or(non_empty(lookup("RG_STORE_KEY")));
        let store = match (database_url, service_key) {
            (Some(database_url), Some(service_key)) => Capability::Available(StoreSettings {
                database_url,
                service_key,
            }),
            (None, _) => Capability::Unavailable(ConfigError::Missing("DATABASE_URL")),
            (_, None) => Capability::Unavailable(ConfigError::Missing("SUPABASE_SERVICE_ROLE_KEY")),
        };

        let webhook_secret = non_empty(lookup("ROSIE_WEBHOOK_SECRET"));
        let webhook = match (non_empty(lookup("ROSIE_WEBHOOK_URL")), webhook_secret.clone()) {
            (Some(url), Some(secret)) => Capability::Available(WebhookSettings { url, secret }),
            (None, _) => Capability::Unavailable(ConfigError::Missing("ROSIE_WEBHOOK_URL")),
            (_, None) => Capability::Unavailable(ConfigError::Missing("ROSIE_WEBHOOK_SECRET")),
        };

        let mut threshold_overrides = ThresholdSet::new();
        for product in ProductCategory::ALL {
            if let Some(raw) = non_empty(lookup(&threshold_env_var(product))) {
                threshold_overrides.insert(product.threshold_key(), JsonValue::String(raw));
            }
        }

        let max_contacts: usize = parse_var(
            "RG_MAX_CONTACTS",
            lookup("RG_MAX_CONTACTS"),
            DEFAULT_MAX_CONTACTS,
        )?;
        if max_contacts == 0 {
            return Err(ConfigError::Invalid {
                var: "RG_MAX_CONTACTS",
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            store,
            webhook,
            webhook_secret,
            cron_secret: non_empty(lookup("CRON_SECRET")),
            threshold_overrides,
            threshold_version: non_empty(lookup("RG_THRESHOLD_VERSION")),
            rate_source: non_empty(lookup("RG_RATE_SOURCE")).unwrap_or_else(|| "jitter".into()),
            max_contacts: max_contacts.min(DEFAULT_MAX_CONTACTS),
            http_timeout_secs: parse_var(
                "RG_HTTP_TIMEOUT_SECS",
                lookup("RG_HTTP_TIMEOUT_SECS"),
                10,
            )?,
            user_agent: non_empty(lookup("RG_USER_AGENT"))
                .unwrap_or_else(|| "rate-guardian/0.1".into()),
            run_lock_enabled: flag(lookup("RG_RUN_LOCK_ENABLED")),
            scheduler_enabled: flag(lookup("RG_SCHEDULER_ENABLED")),
            engine_cron: non_empty(lookup("RG_ENGINE_CRON"))
                .unwrap_or_else(|| "0 */15 * * * *".into()),
            workspace_root: non_empty(lookup("RG_WORKSPACE_ROOT"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            web_port: parse_var("RG_WEB_PORT", lookup("RG_WEB_PORT"), 8000)?,
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ThresholdRulesFile {
    #[serde(default)]
    versions: Vec<ThresholdVersionRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct ThresholdVersionRule {
    id: String,
    version_name: String,
    #[serde(default)]
    thresholds: ThresholdSet,
}

/// The threshold version in effect for a process, with overrides applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveThresholds {
    pub version: ThresholdVersion,
    pub thresholds: ThresholdSet,
}

/// Threshold versions known to this deployment, loaded from `rules/thresholds.yaml`.
#[derive(Debug, Clone, Default)]
pub struct ThresholdRegistry {
    versions: Vec<ThresholdVersionRule>,
}

impl ThresholdRegistry {
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("thresholds.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let parsed: ThresholdRulesFile = serde_yaml::from_str(text)?;
        Ok(Self {
            versions: parsed.versions,
        })
    }

    pub fn version_names(&self) -> Vec<&str> {
        self.versions.iter().map(|v| v.version_name.as_str()).collect()
    }

    /// Resolve the active version. Overrides win over file values; when any
    /// override is present the version id gains a suffix derived from the
    /// override values so classification hashes change with them.
    pub fn active(
        &self,
        version_name: Option<&str>,
        overrides: &ThresholdSet,
    ) -> Result<ActiveThresholds, ConfigError> {
        let base = match version_name {
            Some(name) => Some(
                self.versions
                    .iter()
                    .find(|v| v.version_name == name || v.id == name)
                    .ok_or_else(|| ConfigError::Invalid {
                        var: "RG_THRESHOLD_VERSION",
                        reason: format!("unknown threshold version {name}"),
                    })?,
            ),
            None => self.versions.first(),
        };

        let (mut version, mut thresholds) = match base {
            Some(rule) => (
                ThresholdVersion {
                    id: rule.id.clone(),
                    version_name: rule.version_name.clone(),
                },
                rule.thresholds.clone(),
            ),
            None => (
                ThresholdVersion {
                    id: ENV_THRESHOLD_VERSION.into(),
                    version_name: ENV_THRESHOLD_VERSION.into(),
                },
                ThresholdSet::new(),
            ),
        };

        if !overrides.0.is_empty() {
            let flattened: BTreeMap<&str, String> = overrides
                .0
                .iter()
                .map(|(k, v)| (k.as_str(), v.to_string()))
                .collect();
            let parts: Vec<String> = flattened.iter().map(|(k, v)| format!("{k}={v}")).collect();
            let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
            let digest = content_fingerprint(&parts);
            version.id = format!("{}+env.{}", version.id, &digest[..8]);
            for (key, value) in &overrides.0 {
                thresholds.insert(key, value.clone());
            }
        }

        Ok(ActiveThresholds {
            version,
            thresholds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const RULES: &str = r#"
versions:
  - id: tv-2026-01
    version_name: v1
    thresholds:
      trigger_threshold_30yr: 50
      trigger_threshold_15yr: 40
  - id: tv-2026-03
    version_name: v2
    thresholds:
      trigger_threshold_30yr: 45
"#;

    #[test]
    fn defaults_apply_when_optional_vars_are_absent() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.max_contacts, 50);
        assert_eq!(config.http_timeout_secs, 10);
        assert_eq!(config.rate_source, "jitter");
        assert_eq!(config.engine_cron, "0 */15 * * * *");
        assert_eq!(config.web_port, 8000);
        assert!(!config.run_lock_enabled);
        assert_eq!(
            config.store,
            Capability::Unavailable(ConfigError::Missing("DATABASE_URL"))
        );
        assert_eq!(
            config.webhook,
            Capability::Unavailable(ConfigError::Missing("ROSIE_WEBHOOK_URL"))
        );
    }

    #[test]
    fn missing_secret_keeps_webhook_unavailable() {
        let config =
            EngineConfig::from_lookup(lookup(&[("ROSIE_WEBHOOK_URL", "https://hook.test")])).unwrap();
        assert_eq!(
            config.webhook.require().unwrap_err(),
            ConfigError::Missing("ROSIE_WEBHOOK_SECRET")
        );
    }

    #[test]
    fn complete_configuration_is_available() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/rg"),
            ("RG_STORE_KEY", "service"),
            ("ROSIE_WEBHOOK_URL", "https://hook.test"),
            ("ROSIE_WEBHOOK_SECRET", "s"),
            ("TRIGGER_THRESHOLD_JUMBO", "75"),
            ("RG_MAX_CONTACTS", "500"),
            ("RG_RUN_LOCK_ENABLED", "true"),
        ]))
        .unwrap();
        assert!(config.store.is_available());
        assert_eq!(config.webhook.require().unwrap().secret, "s");
        assert_eq!(
            config.threshold_overrides.threshold_bps("trigger_threshold_jumbo"),
            75.0
        );
        assert_eq!(config.max_contacts, 50);
        assert!(config.run_lock_enabled);
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("RG_HTTP_TIMEOUT_SECS", "soon")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "RG_HTTP_TIMEOUT_SECS",
                ..
            }
        ));
    }

    #[test]
    fn registry_picks_named_or_first_version() {
        let registry = ThresholdRegistry::from_yaml(RULES).unwrap();
        assert_eq!(registry.version_names(), vec!["v1", "v2"]);

        let first = registry.active(None, &ThresholdSet::new()).unwrap();
        assert_eq!(first.version.id, "tv-2026-01");
        assert_eq!(first.thresholds.threshold_bps("trigger_threshold_15yr"), 40.0);

        let named = registry.active(Some("v2"), &ThresholdSet::new()).unwrap();
        assert_eq!(named.version.version_name, "v2");
        assert_eq!(named.thresholds.threshold_bps("trigger_threshold_30yr"), 45.0);

        assert!(registry.active(Some("v9"), &ThresholdSet::new()).is_err());
    }

    #[test]
    fn overrides_layer_on_top_and_change_version_id() {
        let registry = ThresholdRegistry::from_yaml(RULES).unwrap();
        let overrides = ThresholdSet::new().with("trigger_threshold_30yr", "60");
        let active = registry.active(Some("v1"), &overrides).unwrap();
        assert_eq!(active.thresholds.threshold_bps("trigger_threshold_30yr"), 60.0);
        assert_eq!(active.thresholds.threshold_bps("trigger_threshold_15yr"), 40.0);
        assert!(active.version.id.starts_with("tv-2026-01+env."));

        let again = registry.active(Some("v1"), &overrides).unwrap();
        assert_eq!(active.version.id, again.version.id);
    }

    #[test]
    fn empty_registry_falls_back_to_env_version() {
        let active = ThresholdRegistry::default()
            .active(None, &ThresholdSet::new())
            .unwrap();
        assert_eq!(active.version.id, ENV_THRESHOLD_VERSION);
        assert_eq!(active.thresholds.threshold_bps("trigger_threshold_30yr"), 50.0);
    }

    #[test]
    fn workspace_rules_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("rules")).unwrap();
        std::fs::write(dir.path().join("rules/thresholds.yaml"), RULES).unwrap();
        let registry = ThresholdRegistry::from_workspace_root(dir.path()).unwrap();
        assert_eq!(registry.version_names().len(), 2);

        let empty = tempfile::tempdir().unwrap();
        assert!(ThresholdRegistry::from_workspace_root(empty.path())
            .unwrap()
            .version_names()
            .is_empty());
    }
}
