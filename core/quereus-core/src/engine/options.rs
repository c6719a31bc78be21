//! Per-database options.
//!
//! Options are set by name with JSON values (matching how embedders pass
//! configuration) and read through typed getters.

use parking_lot::RwLock;
use serde_json::Value as JsonValue;

use crate::error::{QuereusError, QuereusResult};

/// Default nullability for columns without an explicit NULL/NOT NULL marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColumnNullability {
    Nullable,
    #[default]
    NotNull,
}

#[derive(Debug, Clone)]
struct Inner {
    runtime_stats: bool,
    validate_plan: bool,
    default_vtab_module: String,
    default_vtab_args: JsonValue,
    default_column_nullability: ColumnNullability,
    trace_plan_stack: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            runtime_stats: false,
            validate_plan: false,
            default_vtab_module: "memory".into(),
            default_vtab_args: JsonValue::Object(Default::default()),
            default_column_nullability: ColumnNullability::NotNull,
            trace_plan_stack: false,
        }
    }
}

#[derive(Default)]
pub struct Options {
    inner: RwLock<Inner>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, value: JsonValue) -> QuereusResult<()> {
        let mut inner = self.inner.write();
        match name {
            "runtime_stats" => inner.runtime_stats = expect_bool(name, &value)?,
            "validate_plan" => inner.validate_plan = expect_bool(name, &value)?,
            "trace_plan_stack" => inner.trace_plan_stack = expect_bool(name, &value)?,
            "default_vtab_module" => {
                inner.default_vtab_module = value
                    .as_str()
                    .ok_or_else(|| bad_value(name, &value))?
                    .to_string();
            }
            "default_vtab_args" => inner.default_vtab_args = value,
            "default_column_nullability" => {
                inner.default_column_nullability = match value.as_str() {
                    Some("nullable") => ColumnNullability::Nullable,
                    Some("not_null") => ColumnNullability::NotNull,
                    _ => return Err(bad_value(name, &value)),
                };
            }
            _ => {
                return Err(QuereusError::Misuse(format!("unknown option '{name}'")));
            }
        }
        Ok(())
    }

    pub fn runtime_stats(&self) -> bool {
        self.inner.read().runtime_stats
    }

    pub fn validate_plan(&self) -> bool {
        self.inner.read().validate_plan
    }

    pub fn trace_plan_stack(&self) -> bool {
        self.inner.read().trace_plan_stack
    }

    pub fn default_vtab_module(&self) -> String {
        self.inner.read().default_vtab_module.clone()
    }

    pub fn default_vtab_args(&self) -> JsonValue {
        self.inner.read().default_vtab_args.clone()
    }

    pub fn default_column_nullability(&self) -> ColumnNullability {
        self.inner.read().default_column_nullability
    }
}

fn expect_bool(name: &str, value: &JsonValue) -> QuereusResult<bool> {
    value.as_bool().ok_or_else(|| bad_value(name, value))
}

fn bad_value(name: &str, value: &JsonValue) -> QuereusError {
    QuereusError::Misuse(format!("invalid value {value} for option '{name}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let options = Options::new();
        assert!(!options.runtime_stats());
        assert!(!options.validate_plan());
        assert_eq!(options.default_vtab_module(), "memory");
        assert_eq!(
            options.default_column_nullability(),
            ColumnNullability::NotNull
        );
    }

    #[test]
    fn set_and_read_back() {
        let options = Options::new();
        options.set("runtime_stats", JsonValue::Bool(true)).unwrap();
        options
            .set("default_column_nullability", JsonValue::String("nullable".into()))
            .unwrap();
        assert!(options.runtime_stats());
        assert_eq!(
            options.default_column_nullability(),
            ColumnNullability::Nullable
        );
    }

    #[test]
    fn unknown_option_is_misuse() {
        let options = Options::new();
        assert!(matches!(
            options.set("warp_speed", JsonValue::Bool(true)),
            Err(QuereusError::Misuse(_))
        ));
    }

    #[test]
    fn wrong_type_is_misuse() {
        let options = Options::new();
        assert!(options.set("runtime_stats", JsonValue::String("yes".into())).is_err());
    }
}
