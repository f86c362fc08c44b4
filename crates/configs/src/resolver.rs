//! Resolution of the four persistence settings.
//!
//! Every setting is looked up in three layers, highest first:
//! 1. the environment variable `PERSISTENCE_<SETTING_NAME>`
//! 2. the value supplied explicitly by the caller
//! 3. a built-in default
//!
//! Environment access goes through an injected lookup function so tests never
//! have to touch the real process environment. Empty strings are treated as
//! "not set" at every layer. Resolution itself never fails.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

pub const ENV_PREFIX: &str = "PERSISTENCE_";
pub const DEFAULT_TABLE_NAME: &str = "AWSLambdaPersistence";
pub const DEFAULT_KEY_FIELD_NAME: &str = "key";
pub const DEFAULT_VALUE_FIELD_NAME: &str = "value";
/// Set by the Lambda runtime; its value is the default row key.
pub const FUNCTION_NAME_VAR: &str = "AWS_LAMBDA_FUNCTION_NAME";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setting {
    TableName,
    TableKey,
    KeyFieldName,
    ValueFieldName,
}

impl Setting {
    pub const ALL: [Setting; 4] = [
        Setting::TableName,
        Setting::TableKey,
        Setting::KeyFieldName,
        Setting::ValueFieldName,
    ];

    /// Name used as constructor argument and as reserved map key.
    pub fn name(self) -> &'static str {
        match self {
            Setting::TableName => "table_name",
            Setting::TableKey => "table_key",
            Setting::KeyFieldName => "key_field_name",
            Setting::ValueFieldName => "value_field_name",
        }
    }

    pub fn env_var(self) -> String {
        format!("{ENV_PREFIX}{}", self.name().to_uppercase())
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }
}

/// Whether `key` is one of the four configuration names that can never be
/// stored as map data.
pub fn is_reserved(key: &str) -> bool {
    Setting::from_name(key).is_some()
}

/// Lookup backed by the real process environment.
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn present(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_owned)
}

/// Resolve a single setting: environment, then explicit, then default.
pub fn resolve<F>(
    setting: Setting,
    explicit: Option<&str>,
    default: Option<&str>,
    lookup: &F,
) -> Option<String>
where
    F: Fn(&str) -> Option<String> + ?Sized,
{
    present(lookup(setting.env_var().as_str()).as_deref())
        .or_else(|| present(explicit))
        .or_else(|| present(default))
}

/// Settings supplied by the caller at construction time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExplicitConfig {
    pub table_name: Option<String>,
    pub table_key: Option<String>,
    pub key_field_name: Option<String>,
    pub value_field_name: Option<String>,
}

impl ExplicitConfig {
    pub fn get(&self, setting: Setting) -> Option<&str> {
        match setting {
            Setting::TableName => self.table_name.as_deref(),
            Setting::TableKey => self.table_key.as_deref(),
            Setting::KeyFieldName => self.key_field_name.as_deref(),
            Setting::ValueFieldName => self.value_field_name.as_deref(),
        }
    }

    fn slot_mut(&mut self, setting: Setting) -> &mut Option<String> {
        match setting {
            Setting::TableName => &mut self.table_name,
            Setting::TableKey => &mut self.table_key,
            Setting::KeyFieldName => &mut self.key_field_name,
            Setting::ValueFieldName => &mut self.value_field_name,
        }
    }

    pub fn with(mut self, setting: Setting, value: impl Into<String>) -> Self {
        *self.slot_mut(setting) = Some(value.into());
        self
    }

    /// Move reserved configuration names out of an initial-data map.
    ///
    /// String values become configuration unless the same setting was already
    /// given explicitly. Non-string values are dropped with a warning. Returns
    /// the settings that were found in `data`.
    pub fn absorb_reserved(&mut self, data: &mut Map<String, Value>) -> Vec<Setting> {
        let mut found = Vec::new();
        for setting in Setting::ALL {
            let Some(value) = data.remove(setting.name()) else { continue };
            found.push(setting);
            let slot = self.slot_mut(setting);
            match value {
                Value::String(s) if slot.is_none() => *slot = Some(s),
                Value::String(_) => {}
                other => warn!(
                    setting = setting.name(),
                    value = %other,
                    "ignoring non-string configuration value in initial data"
                ),
            }
        }
        found
    }
}

/// The four operating parameters after resolution, fixed for the lifetime of
/// a map instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceConfig {
    pub table_name: String,
    /// Row key; `None` when neither the environment, the caller nor the
    /// Lambda runtime supplied one.
    pub table_key: Option<String>,
    pub key_field_name: String,
    pub value_field_name: String,
}

impl PersistenceConfig {
    pub fn resolve<F>(explicit: &ExplicitConfig, lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String> + ?Sized,
    {
        let function_name = lookup(FUNCTION_NAME_VAR);
        let pick = |setting: Setting, default: Option<&str>| {
            resolve(setting, explicit.get(setting), default, lookup)
        };
        Self {
            table_name: pick(Setting::TableName, Some(DEFAULT_TABLE_NAME))
                .unwrap_or_else(|| DEFAULT_TABLE_NAME.to_string()),
            table_key: pick(Setting::TableKey, function_name.as_deref()),
            key_field_name: pick(Setting::KeyFieldName, Some(DEFAULT_KEY_FIELD_NAME))
                .unwrap_or_else(|| DEFAULT_KEY_FIELD_NAME.to_string()),
            value_field_name: pick(Setting::ValueFieldName, Some(DEFAULT_VALUE_FIELD_NAME))
                .unwrap_or_else(|| DEFAULT_VALUE_FIELD_NAME.to_string()),
        }
    }

    pub fn from_env(explicit: &ExplicitConfig) -> Self {
        Self::resolve(explicit, &process_env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn env_var_names_are_prefixed_and_upper_cased() {
        assert_eq!(Setting::TableName.env_var(), "PERSISTENCE_TABLE_NAME");
        assert_eq!(Setting::TableKey.env_var(), "PERSISTENCE_TABLE_KEY");
        assert_eq!(Setting::KeyFieldName.env_var(), "PERSISTENCE_KEY_FIELD_NAME");
        assert_eq!(Setting::ValueFieldName.env_var(), "PERSISTENCE_VALUE_FIELD_NAME");
    }

    #[test]
    fn environment_beats_explicit_beats_default_for_every_setting() {
        for setting in Setting::ALL {
            let var = setting.env_var();
            let lookup = env(&[(var.as_str(), "from-env")]);
            assert_eq!(
                resolve(setting, Some("explicit"), Some("default"), &lookup).as_deref(),
                Some("from-env"),
                "{var}"
            );

            let empty = env(&[]);
            assert_eq!(
                resolve(setting, Some("explicit"), Some("default"), &empty).as_deref(),
                Some("explicit")
            );
            assert_eq!(resolve(setting, None, Some("default"), &empty).as_deref(), Some("default"));
            assert_eq!(resolve(setting, None, None, &empty), None);
        }
    }

    #[test]
    fn empty_values_fall_through() {
        let lookup = env(&[("PERSISTENCE_TABLE_NAME", "")]);
        assert_eq!(
            resolve(Setting::TableName, Some(""), Some("default"), &lookup).as_deref(),
            Some("default")
        );
    }

    #[test]
    fn defaults_use_function_name_as_row_key() {
        let lookup = env(&[(FUNCTION_NAME_VAR, "my-func")]);
        let cfg = PersistenceConfig::resolve(&ExplicitConfig::default(), &lookup);
        assert_eq!(
            cfg,
            PersistenceConfig {
                table_name: DEFAULT_TABLE_NAME.into(),
                table_key: Some("my-func".into()),
                key_field_name: "key".into(),
                value_field_name: "value".into(),
            }
        );
    }

    #[test]
    fn full_precedence_on_config() {
        let explicit = ExplicitConfig::default()
            .with(Setting::TableName, "explicit-table")
            .with(Setting::TableKey, "explicit-key")
            .with(Setting::KeyFieldName, "pk");
        let lookup = env(&[
            (FUNCTION_NAME_VAR, "my-func"),
            ("PERSISTENCE_TABLE_NAME", "env-table"),
            ("PERSISTENCE_VALUE_FIELD_NAME", "blob"),
        ]);
        let cfg = PersistenceConfig::resolve(&explicit, &lookup);
        assert_eq!(cfg.table_name, "env-table");
        assert_eq!(cfg.table_key.as_deref(), Some("explicit-key"));
        assert_eq!(cfg.key_field_name, "pk");
        assert_eq!(cfg.value_field_name, "blob");
    }

    #[test]
    fn missing_row_key_stays_none() {
        let cfg = PersistenceConfig::resolve(&ExplicitConfig::default(), &env(&[]));
        assert_eq!(cfg.table_key, None);
    }

    #[test]
    fn reserved_keys_are_absorbed_into_config() {
        let mut data = json!({
            "table_name": "from-data",
            "table_key": "row-1",
            "key_field_name": 7,
            "example": "v1",
        })
        .as_object()
        .cloned()
        .unwrap();
        let mut explicit = ExplicitConfig::default().with(Setting::TableKey, "explicit-row");

        let found = explicit.absorb_reserved(&mut data);

        assert_eq!(found, vec![Setting::TableName, Setting::TableKey, Setting::KeyFieldName]);
        assert_eq!(data.len(), 1);
        assert!(data.contains_key("example"));
        assert_eq!(explicit.table_name.as_deref(), Some("from-data"));
        assert_eq!(explicit.table_key.as_deref(), Some("explicit-row"));
        assert_eq!(explicit.key_field_name, None);
        assert!(Setting::ALL.iter().all(|s| !data.contains_key(s.name())));
    }

    #[test]
    fn reserved_names() {
        assert!(is_reserved("table_name"));
        assert!(is_reserved("value_field_name"));
        assert!(!is_reserved("TABLE_NAME"));
        assert!(!is_reserved("example"));
    }
}
