//! TOML-based sync configuration.
//!
//! # Responsibility
//! - Bind each side to a source id and list reference.
//! - Carry tunables for linking, conflict resolution, removal and retries.
//! - Describe deployments that reconcile several list pairs in one store.
//!
//! # Invariants
//! - Every field of a pair except the two sides has a default.
//! - Pair ids are unique within a deployment.
//! - `validate()` runs on every load path; an invalid config never reaches
//!   the engine.

use crate::model::item::Side;
use crate::repo::DEFAULT_PAIR_ID;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

/// One side's binding to a source collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideConfig {
    pub source_id: String,
    pub list_ref: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkingConfig {
    #[serde(default = "default_true")]
    pub fuzzy_matching: bool,
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,
    /// Duplicate-name groups larger than this are deferred as ambiguous.
    #[serde(default = "default_max_duplicate_group")]
    pub max_duplicate_group: usize,
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            fuzzy_matching: default_true(),
            fuzzy_threshold: default_fuzzy_threshold(),
            max_duplicate_group: default_max_duplicate_group(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Later modification wins; ties go to the authority side.
    #[default]
    Recency,
    /// The authority side always wins.
    Authority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictConfig {
    #[serde(default)]
    pub strategy: ConflictStrategy,
    #[serde(default = "default_authority")]
    pub authority: Side,
    /// Modification times closer than this are treated as simultaneous.
    #[serde(default = "default_tolerance_ms")]
    pub tolerance_ms: u64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::default(),
            authority: default_authority(),
            tolerance_ms: default_tolerance_ms(),
        }
    }
}

/// What to do on a counterpart that cannot hard delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalFallback {
    /// Call the collaborator's completion operation and tombstone the item.
    #[default]
    Complete,
    /// Leave the counterpart untouched and only drop the link.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemovalConfig {
    #[serde(default)]
    pub fallback: RemovalFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

/// Complete configuration of one reconciled list pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Scope of this pair's rows in a shared store.
    #[serde(default = "default_pair_id")]
    pub pair_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub side_a: SideConfig,
    pub side_b: SideConfig,
    #[serde(default)]
    pub linking: LinkingConfig,
    #[serde(default)]
    pub conflict: ConflictConfig,
    #[serde(default)]
    pub removal: RemovalConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default)]
    pub log_level: Option<String>,
}

impl SyncConfig {
    /// Builds a config with defaults for everything but the sides.
    pub fn new(side_a: SideConfig, side_b: SideConfig) -> Self {
        Self {
            pair_id: default_pair_id(),
            enabled: true,
            side_a,
            side_b,
            linking: LinkingConfig::default(),
            conflict: ConflictConfig::default(),
            removal: RemovalConfig::default(),
            retry: RetryConfig::default(),
            store_path: None,
            log_level: None,
        }
    }

    pub fn side(&self, side: Side) -> &SideConfig {
        match side {
            Side::A => &self.side_a,
            Side::B => &self.side_b,
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_source_id(&self.pair_id) {
            return Err(ConfigError::Invalid(format!(
                "pair_id `{}` must match [a-z0-9_-]+",
                self.pair_id
            )));
        }
        for (label, side) in [("side_a", &self.side_a), ("side_b", &self.side_b)] {
            if !is_valid_source_id(&side.source_id) {
                return Err(ConfigError::Invalid(format!(
                    "{label}.source_id `{}` must match [a-z0-9_-]+",
                    side.source_id
                )));
            }
            if side.list_ref.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{label}.list_ref must not be empty"
                )));
            }
        }
        if self.side_a.source_id == self.side_b.source_id
            && self.side_a.list_ref == self.side_b.list_ref
        {
            return Err(ConfigError::Invalid(
                "side_a and side_b must not point at the same list".to_string(),
            ));
        }

        let threshold = self.linking.fuzzy_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "linking.fuzzy_threshold must be in (0, 1], got {threshold}"
            )));
        }
        if self.linking.max_duplicate_group == 0 {
            return Err(ConfigError::Invalid(
                "linking.max_duplicate_group must be at least 1".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "retry.backoff_multiplier must be at least 1".to_string(),
            ));
        }
        if self.retry.call_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "retry.call_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Deployment reconciling several list pairs against one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairsConfig {
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default)]
    pub log_level: Option<String>,
    pub pairs: Vec<SyncConfig>,
}

impl PairsConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn enabled_pairs(&self) -> impl Iterator<Item = &SyncConfig> {
        self.pairs.iter().filter(|pair| pair.enabled)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pairs.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one list pair must be configured".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for (index, pair) in self.pairs.iter().enumerate() {
            pair.validate().map_err(|err| match err {
                ConfigError::Invalid(message) => {
                    ConfigError::Invalid(format!("pairs[{index}]: {message}"))
                }
                other => other,
            })?;
            if !seen.insert(pair.pair_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "pair_id `{}` is configured more than once",
                    pair.pair_id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Io { path: PathBuf, message: String },
    Parse(String),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, message } => {
                write!(f, "failed to read config `{}`: {message}", path.display())
            }
            Self::Parse(message) => write!(f, "invalid config syntax: {message}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {}

fn is_valid_source_id(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn default_pair_id() -> String {
    DEFAULT_PAIR_ID.to_string()
}

fn default_true() -> bool {
    true
}

fn default_fuzzy_threshold() -> f64 {
    0.85
}

fn default_max_duplicate_group() -> usize {
    25
}

fn default_authority() -> Side {
    Side::A
}

fn default_tolerance_ms() -> u64 {
    60_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> u32 {
    2
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, ConflictStrategy, PairsConfig, RemovalFallback, SyncConfig};
    use crate::model::item::Side;
use crate::repo::DEFAULT_PAIR_ID;

    const MINIMAL: &str = r#"
[side_a]
source_id = "paprika"
list_ref = "Groceries"

[side_b]
source_id = "skylight"
list_ref = "Shopping"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = SyncConfig::from_toml_str(MINIMAL).expect("minimal config should parse");
        assert_eq!(config.side(Side::A).source_id, "paprika");
        assert_eq!(config.side(Side::B).list_ref, "Shopping");
        assert!(config.linking.fuzzy_matching);
        assert!((config.linking.fuzzy_threshold - 0.85).abs() < f64::EPSILON);
        assert_eq!(config.linking.max_duplicate_group, 25);
        assert_eq!(config.conflict.strategy, ConflictStrategy::Recency);
        assert_eq!(config.conflict.authority, Side::A);
        assert_eq!(config.conflict.tolerance_ms, 60_000);
        assert_eq!(config.pair_id, "default");
        assert!(config.enabled);
        assert_eq!(config.removal.fallback, RemovalFallback::Complete);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn parses_overrides() {
        let input = format!(
            "{MINIMAL}
[conflict]
strategy = \"authority\"
authority = \"b\"
tolerance_ms = 0

[removal]
fallback = \"ignore\"

[retry]
max_attempts = 5
"
        );
        let config = SyncConfig::from_toml_str(&input).expect("override config should parse");
        assert_eq!(config.conflict.strategy, ConflictStrategy::Authority);
        assert_eq!(config.conflict.authority, Side::B);
        assert_eq!(config.conflict.tolerance_ms, 0);
        assert_eq!(config.removal.fallback, RemovalFallback::Ignore);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, 500);
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let input = format!("{MINIMAL}\n[linking]\nfuzzy_threshold = 1.5\n");
        let err = SyncConfig::from_toml_str(&input).expect_err("threshold must be rejected");
        assert!(matches!(err, ConfigError::Invalid(message) if message.contains("fuzzy_threshold")));
    }

    #[test]
    fn rejects_invalid_source_id() {
        let input = MINIMAL.replace("\"paprika\"", "\"Paprika App\"");
        let err = SyncConfig::from_toml_str(&input).expect_err("source id must be rejected");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_side_is_a_parse_error() {
        let err = SyncConfig::from_toml_str("[side_a]\nsource_id = \"a\"\nlist_ref = \"x\"\n")
            .expect_err("side_b is required");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn serializes_back_to_toml() {
        let config = SyncConfig::from_toml_str(MINIMAL).expect("minimal config should parse");
        let text = config.to_toml_string().expect("config should serialize");
        let reparsed = SyncConfig::from_toml_str(&text).expect("serialized config should parse");
        assert_eq!(reparsed, config);
    }

    const PAIRS: &str = r#"
store_path = "state/listsync.db"

[[pairs]]
pair_id = "groceries"
[pairs.side_a]
source_id = "paprika"
list_ref = "Groceries"
[pairs.side_b]
source_id = "skylight"
list_ref = "Shopping"

[[pairs]]
pair_id = "hardware"
enabled = false
[pairs.side_a]
source_id = "paprika"
list_ref = "Hardware"
[pairs.side_b]
source_id = "skylight"
list_ref = "DIY"
"#;

    #[test]
    fn pairs_config_lists_enabled_pairs() {
        let config = PairsConfig::from_toml_str(PAIRS).expect("pairs config should parse");
        assert_eq!(config.pairs.len(), 2);
        let enabled: Vec<&str> = config
            .enabled_pairs()
            .map(|pair| pair.pair_id.as_str())
            .collect();
        assert_eq!(enabled, vec!["groceries"]);
    }

    #[test]
    fn pairs_config_rejects_repeated_pair_id() {
        let input = PAIRS.replace("\"hardware\"", "\"groceries\"");
        let err = PairsConfig::from_toml_str(&input).expect_err("repeated pair id must be rejected");
        assert!(matches!(err, ConfigError::Invalid(message) if message.contains("groceries")));
    }

    #[test]
    fn pairs_config_needs_a_pair() {
        let err = PairsConfig::from_toml_str("pairs = []\n").expect_err("empty pairs must be rejected");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
