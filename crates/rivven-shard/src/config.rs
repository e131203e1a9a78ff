//! Migration configuration
//!
//! A migration is described by a single YAML document:
//!
//! ```yaml
//! source_db: shard_1
//! target_db: shard_1_new
//! sharding_key: tenant_id
//! sharding_value: 42
//!
//! joined_tables:
//!   orders_link:
//!     - table_name: orders
//!       join_column: link_id
//! ignored_tables: ["^_.*_gho$"]
//! primary_key_tables: [tenants]
//!
//! cutover_lock:
//!   uri: ${LOCK_URI}
//!   payload: shard-42
//! cutover_unlock:
//!   uri: ${UNLOCK_URI:-http://localhost:8000/unlock}
//! ```
//!
//! `${VAR}` and `${VAR:-default}` references are expanded from the
//! environment before parsing. The database rewrite map is never read from
//! the file; it always maps `source_db` to `target_db`.

use crate::error::{Result, ShardError};
use crate::filter::JoinTable;
use crate::throttle::ThrottleConfig;
use crate::webhook::HttpCallback;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Settings for migrating one shard from `source_db` to `target_db`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingConfig {
    /// Database holding the shard today
    pub source_db: String,

    /// Database the shard moves to
    pub target_db: String,

    /// Column that identifies shard ownership of a row
    pub sharding_key: String,

    /// Value of `sharding_key` being migrated
    #[serde(default)]
    pub sharding_value: Option<i64>,

    /// Tables without a sharding key, keyed by table name, with the sharded
    /// tables that reference them
    #[serde(default)]
    pub joined_tables: HashMap<String, Vec<JoinTable>>,

    /// Regex patterns of tables never copied
    #[serde(default)]
    pub ignored_tables: Vec<String>,

    /// Tables skipped by the verifier
    #[serde(default)]
    pub ignored_verification_tables: Vec<String>,

    /// Tables whose primary key is the sharding value, copied under the lock
    #[serde(default)]
    pub primary_key_tables: Vec<String>,

    /// Source table name -> target table name
    #[serde(default)]
    pub table_rewrites: HashMap<String, String>,

    /// Always `{source_db: target_db}`
    #[serde(skip)]
    pub database_rewrites: HashMap<String, String>,

    /// Replica lag throttling; none disables throttling
    #[serde(default)]
    pub throttle: Option<ThrottleConfig>,

    /// Webhook that write-locks the source shard
    #[serde(default)]
    pub cutover_lock: HttpCallback,

    /// Webhook that releases the write lock
    #[serde(default)]
    pub cutover_unlock: HttpCallback,

    /// Notified when a migration aborts
    #[serde(default)]
    pub error_callback: Option<HttpCallback>,

    /// Rows per copy/verify batch
    #[serde(default = "default_batch_size")]
    pub data_iteration_batch_size: u64,

    /// Read attempts before a row read is considered failed
    #[serde(default = "default_read_retries")]
    pub db_read_retries: u32,

    /// Parallel table copies
    #[serde(default = "default_data_iteration_concurrency")]
    pub data_iteration_concurrency: usize,

    /// Parallel verifier workers (0 = same as `data_iteration_concurrency`)
    #[serde(default)]
    pub verifier_iteration_concurrency: usize,
}

fn default_batch_size() -> u64 {
    200
}

fn default_read_retries() -> u32 {
    5
}

fn default_data_iteration_concurrency() -> usize {
    4
}

impl ShardingConfig {
    /// Minimal configuration; webhooks and table sets are left empty.
    pub fn new(
        source_db: impl Into<String>,
        target_db: impl Into<String>,
        sharding_key: impl Into<String>,
        sharding_value: i64,
    ) -> Self {
        let mut config = Self {
            source_db: source_db.into(),
            target_db: target_db.into(),
            sharding_key: sharding_key.into(),
            sharding_value: Some(sharding_value),
            joined_tables: HashMap::new(),
            ignored_tables: Vec::new(),
            ignored_verification_tables: Vec::new(),
            primary_key_tables: Vec::new(),
            table_rewrites: HashMap::new(),
            database_rewrites: HashMap::new(),
            throttle: None,
            cutover_lock: HttpCallback::default(),
            cutover_unlock: HttpCallback::default(),
            error_callback: None,
            data_iteration_batch_size: default_batch_size(),
            db_read_retries: default_read_retries(),
            data_iteration_concurrency: default_data_iteration_concurrency(),
            verifier_iteration_concurrency: 0,
        };
        config.derive_database_rewrites();
        config
    }

    /// Load, expand and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_yaml(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document after environment expansion. Not validated.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let mut config: Self = serde_yaml::from_str(&expanded)?;
        config.derive_database_rewrites();
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    fn derive_database_rewrites(&mut self) {
        self.database_rewrites = HashMap::from([(self.source_db.clone(), self.target_db.clone())]);
    }

    /// Verifier worker count, falling back to the copy concurrency.
    pub fn verifier_concurrency(&self) -> usize {
        if self.verifier_iteration_concurrency == 0 {
            self.data_iteration_concurrency
        } else {
            self.verifier_iteration_concurrency
        }
    }

    /// Report the first inconsistency found. Nothing is corrected.
    pub fn validate(&self) -> Result<()> {
        if self.source_db.trim().is_empty() {
            return Err(ShardError::validation("source_db is required"));
        }
        if self.target_db.trim().is_empty() {
            return Err(ShardError::validation("target_db is required"));
        }
        if self.sharding_key.trim().is_empty() {
            return Err(ShardError::validation("sharding_key is required"));
        }
        match self.sharding_value {
            None => return Err(ShardError::validation("sharding_value is required")),
            Some(value) if value < 0 => {
                return Err(ShardError::validation(format!(
                    "sharding_value must be non-negative, got {}",
                    value
                )))
            }
            Some(_) => {}
        }
        if self.data_iteration_batch_size == 0 {
            return Err(ShardError::validation(
                "data_iteration_batch_size must be greater than 0",
            ));
        }
        if self.data_iteration_concurrency == 0 {
            return Err(ShardError::validation(
                "data_iteration_concurrency must be greater than 0",
            ));
        }

        for (table, joins) in &self.joined_tables {
            if joins.is_empty() {
                return Err(ShardError::validation(format!(
                    "joined table '{}' has no referencing tables",
                    table
                )));
            }
            if let Some(join) = joins
                .iter()
                .find(|j| j.table_name.is_empty() || j.join_column.is_empty())
            {
                return Err(ShardError::validation(format!(
                    "joined table '{}' has an incomplete join {:?}",
                    table, join
                )));
            }
        }

        let expected = HashMap::from([(self.source_db.clone(), self.target_db.clone())]);
        if self.database_rewrites != expected {
            return Err(ShardError::validation(format!(
                "database_rewrites must map exactly {} to {}, got {:?}",
                self.source_db, self.target_db, self.database_rewrites
            )));
        }

        self.cutover_lock.validate("cutover_lock")?;
        self.cutover_unlock.validate("cutover_unlock")?;
        if let Some(callback) = &self.error_callback {
            callback.validate("error_callback")?;
        }
        if let Some(throttle) = &self.throttle {
            throttle.validate()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> ShardingConfig {
        let mut config = ShardingConfig::new("shard_1", "shard_1_new", "tenant_id", 42);
        config.cutover_lock = HttpCallback::new("http://localhost:8000/lock");
        config.cutover_unlock = HttpCallback::new("http://localhost:8000/unlock");
        config
    }

    #[test]
    fn test_defaults_from_yaml() {
        let yaml = r#"
source_db: shard_1
target_db: shard_1_new
sharding_key: tenant_id
sharding_value: 42
cutover_lock:
  uri: http://localhost:8000/lock
cutover_unlock:
  uri: http://localhost:8000/unlock
"#;
        let config = ShardingConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.data_iteration_batch_size, 200);
        assert_eq!(config.db_read_retries, 5);
        assert_eq!(config.data_iteration_concurrency, 4);
        assert_eq!(config.verifier_concurrency(), 4);
        assert!(config.throttle.is_none());
        assert_eq!(
            config.database_rewrites.get("shard_1").map(String::as_str),
            Some("shard_1_new")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_database_rewrites_ignored_in_file() {
        let yaml = r#"
source_db: a
target_db: b
sharding_key: k
sharding_value: 1
database_rewrites:
  a: c
"#;
        let config = ShardingConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.database_rewrites.len(), 1);
        assert_eq!(config.database_rewrites["a"], "b");
    }

    #[test]
    fn test_joined_tables_yaml() {
        let yaml = r#"
source_db: a
target_db: b
sharding_key: k
sharding_value: 1
joined_tables:
  orders_link:
    - table_name: orders
      join_column: link_id
"#;
        let config = ShardingConfig::from_yaml(yaml).unwrap();
        let joins = &config.joined_tables["orders_link"];
        assert_eq!(joins[0].table_name, "orders");
        assert_eq!(joins[0].join_column, "link_id");
    }

    #[test]
    fn test_missing_sharding_value_is_unset() {
        let yaml = r#"
source_db: shard_1
target_db: shard_1_new
sharding_key: tenant_id
cutover_lock:
  uri: http://localhost:8000/lock
cutover_unlock:
  uri: http://localhost:8000/unlock
"#;
        let config = ShardingConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.sharding_value, None);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sharding_value is required"));
    }

    #[test]
    fn test_verifier_concurrency_override() {
        let mut config = valid();
        config.verifier_iteration_concurrency = 16;
        assert_eq!(config.verifier_concurrency(), 16);
    }

    #[test]
    fn test_validate_rejects() {
        let cases: Vec<(&str, Box<dyn Fn(&mut ShardingConfig)>)> = vec![
            ("sharding_key", Box::new(|c: &mut ShardingConfig| c.sharding_key.clear())),
            (
                "sharding_value is required",
                Box::new(|c: &mut ShardingConfig| c.sharding_value = None),
            ),
            (
                "sharding_value must be non-negative",
                Box::new(|c: &mut ShardingConfig| c.sharding_value = Some(-3)),
            ),
            ("source_db", Box::new(|c: &mut ShardingConfig| c.source_db.clear())),
            ("data_iteration_batch_size", Box::new(|c: &mut ShardingConfig| c.data_iteration_batch_size = 0)),
            ("data_iteration_concurrency", Box::new(|c: &mut ShardingConfig| c.data_iteration_concurrency = 0)),
            ("cutover_lock", Box::new(|c: &mut ShardingConfig| c.cutover_lock = HttpCallback::default())),
            (
                "cutover_unlock",
                Box::new(|c: &mut ShardingConfig| c.cutover_unlock = HttpCallback::new("ftp://x/unlock")),
            ),
            (
                "error_callback",
                Box::new(|c: &mut ShardingConfig| c.error_callback = Some(HttpCallback::new("nope"))),
            ),
            (
                "database_rewrites",
                Box::new(|c: &mut ShardingConfig| {
                    c.database_rewrites.insert("other".into(), "x".into());
                }),
            ),
            (
                "max_lag_secs",
                Box::new(|c: &mut ShardingConfig| {
                    c.throttle = Some(ThrottleConfig {
                        max_lag_secs: 0,
                        ..Default::default()
                    })
                }),
            ),
        ];

        for (needle, mutate) in cases {
            let mut config = valid();
            mutate(&mut config);
            let err = config.validate().unwrap_err();
            assert!(
                err.to_string().contains(needle),
                "expected '{}' in '{}'",
                needle,
                err
            );
        }
    }

    #[test]
    fn test_from_file_expands_env() {
        std::env::set_var("RIVVEN_SHARD_TEST_LOCK", "http://lock.local/lock");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
source_db: shard_1
target_db: shard_1_new
sharding_key: tenant_id
sharding_value: 7
cutover_lock:
  uri: ${{RIVVEN_SHARD_TEST_LOCK}}
cutover_unlock:
  uri: ${{RIVVEN_SHARD_TEST_UNLOCK_UNSET:-http://lock.local/unlock}}
"#
        )
        .unwrap();

        let config = ShardingConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cutover_lock.uri, "http://lock.local/lock");
        assert_eq!(config.cutover_unlock.uri, "http://lock.local/unlock");
    }

    #[test]
    fn test_from_file_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "source_db: a\ntarget_db: b\nsharding_key: k\n").unwrap();

        let err = ShardingConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ShardError::Validation(_)));
    }
}
