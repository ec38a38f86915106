//! Engine tuning, as read from the server's configuration file.
//!
//! Every field has a default, so an empty file is a valid configuration.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use sketching::LogLevel;

use crate::prelude::*;

fn default_group_nesting_limit() -> Option<u32> {
    Some(DEFAULT_GROUP_NESTING_LIMIT)
}

fn default_group_visit_limit() -> Option<u32> {
    Some(DEFAULT_GROUP_VISIT_LIMIT)
}

fn default_group_cache_size() -> usize {
    DEFAULT_GROUP_CACHE_SIZE
}

fn default_max_selected_rules() -> usize {
    DEFAULT_MAX_SELECTED_RULES
}

fn default_result_cache_size() -> usize {
    DEFAULT_RESULT_CACHE_SIZE
}

fn default_worker_threads() -> usize {
    DEFAULT_WORKER_THREADS
}

fn default_anonymous_profile_max() -> usize {
    DEFAULT_ANON_PROFILE_MAX
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AclConfig {
    /// How deep nested groups are followed. The queried group is level one.
    /// Absent means no limit.
    #[serde(default = "default_group_nesting_limit")]
    pub group_nesting_limit: Option<u32>,
    /// How many group entries one membership check may visit.
    #[serde(default = "default_group_visit_limit")]
    pub group_visit_limit: Option<u32>,
    /// Principals kept in the group membership cache.
    #[serde(default = "default_group_cache_size")]
    pub group_cache_size: usize,
    /// Candidate rules considered for one entry before falling back to a
    /// full scan of the index.
    #[serde(default = "default_max_selected_rules")]
    pub max_selected_rules: usize,
    #[serde(default = "default_result_cache_size")]
    pub result_cache_size: usize,
    /// Defaults to twice `worker_threads`.
    #[serde(default)]
    pub context_pool_size: Option<usize>,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_anonymous_profile_max")]
    pub anonymous_profile_max: usize,
    /// Refuse every write, add and delete.
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub log_level: LogLevel,
}

impl Default for AclConfig {
    fn default() -> Self {
        AclConfig {
            group_nesting_limit: default_group_nesting_limit(),
            group_visit_limit: default_group_visit_limit(),
            group_cache_size: default_group_cache_size(),
            max_selected_rules: default_max_selected_rules(),
            result_cache_size: default_result_cache_size(),
            context_pool_size: None,
            worker_threads: default_worker_threads(),
            anonymous_profile_max: default_anonymous_profile_max(),
            read_only: false,
            log_level: LogLevel::default(),
        }
    }
}

impl AclConfig {
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, OperationError> {
        let mut f = File::open(config_path.as_ref()).map_err(|e| {
            admin_error!(path = ?config_path.as_ref(), ?e, "Unable to open config file");
            OperationError::Io(e.to_string())
        })?;

        let mut contents = String::new();
        f.read_to_string(&mut contents).map_err(|e| {
            admin_error!(?e, "Unable to read config file");
            OperationError::Io(e.to_string())
        })?;

        Self::from_toml(contents.as_str())
    }

    pub fn from_toml(contents: &str) -> Result<Self, OperationError> {
        let config: AclConfig = toml::from_str(contents).map_err(|e| {
            admin_error!(?e, "Unable to parse config");
            OperationError::InvalidConfig(e.to_string())
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), OperationError> {
        let checks = [
            (self.group_cache_size, "group_cache_size"),
            (self.max_selected_rules, "max_selected_rules"),
            (self.result_cache_size, "result_cache_size"),
            (self.worker_threads, "worker_threads"),
            (self.pool_size(), "context_pool_size"),
        ];
        for (value, name) in checks {
            if value == 0 {
                admin_error!(field = name, "Configuration value must be greater than zero");
                return Err(OperationError::InvalidConfig(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn pool_size(&self) -> usize {
        self.context_pool_size
            .unwrap_or(self.worker_threads.saturating_mul(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_empty() {
        let c = AclConfig::from_toml("").unwrap();
        assert_eq!(c, AclConfig::default());
        assert_eq!(c.group_nesting_limit, Some(5));
        assert_eq!(c.pool_size(), 16);
        assert_eq!(c.log_level, LogLevel::Info);
    }

    #[test]
    fn test_config_overrides() {
        let c = AclConfig::from_toml(
            r#"
            group_nesting_limit = 2
            context_pool_size = 3
            read_only = true
            log_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(c.group_nesting_limit, Some(2));
        assert_eq!(c.pool_size(), 3);
        assert!(c.read_only);
        assert_eq!(c.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert_eq!(
            AclConfig::from_toml("result_cache_size = 0"),
            Err(OperationError::InvalidConfig(String::new()))
        );
        assert_eq!(
            AclConfig::from_toml("no_such_field = 1"),
            Err(OperationError::InvalidConfig(String::new()))
        );
        assert!(AclConfig::new("/nonexistent/dsacl.toml").is_err());
    }
}
