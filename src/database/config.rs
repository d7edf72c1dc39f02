use indexmap::IndexMap;
use once_cell::sync::Lazy;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Shared default planner configuration.
pub static DEFAULT_PLANNER_CONFIG: Lazy<PlannerConfig> = Lazy::new(PlannerConfig::default);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Knobs consumed while compiling execution plans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Upper bound on columns used for a composite group-by hash.
    #[serde(rename = "XDB_MAX_GROUP_HASH_COUNT")]
    pub max_group_hash_count: usize,
    /// `CROSS JOIN` when true, comma list when false.
    #[serde(rename = "XDB_SQL_USECROSSJOIN")]
    pub use_cross_join: bool,
    /// Steps bulk-load their target tables instead of row inserts.
    #[serde(rename = "XDB_USE_LOAD_FOR_STEP")]
    pub use_load_for_step: bool,
    /// Temp-table DDL template with `{table}` and `{columns}` slots.
    #[serde(rename = "XDB_TEMP_TABLE_DDL")]
    pub temp_table_ddl: String,
    /// Allow the physical row oid as outer-join row identity.
    #[serde(rename = "XDB_USE_OID_IN_OUTER")]
    pub use_oid_in_outer: bool,
    /// Wrap the final step in a relation subquery instead of rewriting its
    /// projection list in place.
    #[serde(rename = "xdb.transformProjections")]
    pub transform_projections: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_group_hash_count: 5,
            use_cross_join: true,
            use_load_for_step: true,
            temp_table_ddl: "CREATE TEMPORARY TABLE {table} ({columns})".to_string(),
            use_oid_in_outer: false,
            transform_projections: false,
        }
    }
}

impl PlannerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from string properties keyed by their `XDB_*` names.
    pub fn from_properties(props: &IndexMap<String, String>) -> Result<Self, ConfigError> {
        from_properties(props)
    }

    /// Render the temp-table DDL for `table` with column definitions.
    pub fn temp_table_statement(&self, table: &str, columns: &[String]) -> String {
        self.temp_table_ddl
            .replace("{table}", table)
            .replace("{columns}", &columns.join(", "))
    }
}

/// Where NULLs sort in the merge stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullOrdering {
    /// Before every value, whatever the direction.
    First,
    /// After every value, whatever the direction.
    Last,
    /// Treated as larger than every value.
    High,
    /// Treated as smaller than every value.
    Low,
}

/// Knobs consumed by the coordinator-side result merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Rows buffered per node stream.
    #[serde(rename = "XDB_COMBINED_RESULTSET_BUFFER")]
    pub buffer_size: usize,
    #[serde(rename = "XDB_SORT_NULLS")]
    pub null_ordering: NullOrdering,
    /// Ignore surrounding blanks when comparing strings.
    #[serde(rename = "XDB_TRIM_STRINGS")]
    pub trim_strings: bool,
    #[serde(rename = "XDB_CASE_SENSITIVE")]
    pub case_sensitive: bool,
    /// Longest wait for a row from one node stream.
    #[serde(rename = "XDB_MERGE_TIMEOUT_MS")]
    pub timeout_ms: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            null_ordering: NullOrdering::High,
            trim_strings: false,
            case_sensitive: true,
            timeout_ms: 30_000,
        }
    }
}

impl MergeConfig {
    pub fn from_properties(props: &IndexMap<String, String>) -> Result<Self, ConfigError> {
        let config: Self = from_properties(props)?;
        if config.buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "XDB_COMBINED_RESULTSET_BUFFER".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(config)
    }
}

/// Coerce each property string to a JSON scalar, then let serde map the keys.
/// Keys the target type does not know are ignored.
fn from_properties<T: DeserializeOwned>(props: &IndexMap<String, String>) -> Result<T, ConfigError> {
    let mut map = Map::new();
    for (key, raw) in props {
        map.insert(key.clone(), coerce(raw));
    }
    serde_json::from_value(Value::Object(map)).map_err(|e| ConfigError::InvalidValue {
        key: props.keys().cloned().collect::<Vec<_>>().join(","),
        message: e.to_string(),
    })
}

fn coerce(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = trimmed.parse::<u64>() {
        return Value::from(n);
    }
    // enum values are lowercase on the wire
    if trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return Value::String(trimmed.to_ascii_lowercase());
    }
    Value::String(raw.to_string())
}
