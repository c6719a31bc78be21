//! Logical column types.
//!
//! A [`LogicalType`] is what the planner and schema catalog reason about:
//! a physical class plus nullability and an optional collation. The classes
//! are deliberately wider than the runtime value kinds (BOOLEAN and NUMERIC
//! are storage classes, not value kinds).

use serde::{Deserialize, Serialize};

/// Physical class of a logical type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeClass {
    Null,
    Integer,
    Real,
    Text,
    Blob,
    Boolean,
    Numeric,
    Any,
    DateTime,
    Json,
}

impl TypeClass {
    /// Map a declared SQL type name onto a class, SQLite-affinity style.
    pub fn from_declared(name: &str) -> TypeClass {
        let upper = name.to_ascii_uppercase();
        if upper.contains("INT") {
            TypeClass::Integer
        } else if upper.contains("CHAR") || upper.contains("TEXT") || upper.contains("CLOB") {
            TypeClass::Text
        } else if upper.contains("BLOB") {
            TypeClass::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            TypeClass::Real
        } else if upper.contains("BOOL") {
            TypeClass::Boolean
        } else if upper.contains("DATE") || upper.contains("TIME") {
            TypeClass::DateTime
        } else if upper.contains("JSON") {
            TypeClass::Json
        } else if upper.contains("NUM") || upper.contains("DEC") {
            TypeClass::Numeric
        } else {
            TypeClass::Any
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            TypeClass::Integer | TypeClass::Real | TypeClass::Boolean | TypeClass::Numeric
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            TypeClass::Null => "NULL",
            TypeClass::Integer => "INTEGER",
            TypeClass::Real => "REAL",
            TypeClass::Text => "TEXT",
            TypeClass::Blob => "BLOB",
            TypeClass::Boolean => "BOOLEAN",
            TypeClass::Numeric => "NUMERIC",
            TypeClass::Any => "ANY",
            TypeClass::DateTime => "DATETIME",
            TypeClass::Json => "JSON",
        }
    }
}

/// A column's logical type: class + nullability + optional collation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalType {
    pub class: TypeClass,
    pub nullable: bool,
    pub collation: Option<String>,
}

impl LogicalType {
    pub fn new(class: TypeClass) -> Self {
        Self {
            class,
            nullable: false,
            collation: None,
        }
    }

    pub fn integer() -> Self {
        Self::new(TypeClass::Integer)
    }

    pub fn real() -> Self {
        Self::new(TypeClass::Real)
    }

    pub fn text() -> Self {
        Self::new(TypeClass::Text)
    }

    pub fn blob() -> Self {
        Self::new(TypeClass::Blob)
    }

    pub fn boolean() -> Self {
        Self::new(TypeClass::Boolean)
    }

    pub fn any() -> Self {
        Self::new(TypeClass::Any)
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_collation(mut self, name: impl Into<String>) -> Self {
        self.collation = Some(name.into());
        self
    }

    pub fn is_numeric(&self) -> bool {
        self.class.is_numeric()
    }
}

/// Result-type inference for polymorphic scalar functions:
/// all-same → that type; mixed numeric → REAL if any REAL else INTEGER;
/// otherwise the first argument's type (conservative).
pub fn infer_result_type(args: &[LogicalType]) -> LogicalType {
    let Some(first) = args.first() else {
        return LogicalType::any().nullable();
    };
    if args.iter().all(|t| t.class == first.class) {
        return first.clone();
    }
    if args.iter().all(|t| t.is_numeric()) {
        let class = if args.iter().any(|t| t.class == TypeClass::Real) {
            TypeClass::Real
        } else {
            TypeClass::Integer
        };
        let mut ty = LogicalType::new(class);
        ty.nullable = args.iter().any(|t| t.nullable);
        return ty;
    }
    first.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_name_affinity() {
        assert_eq!(TypeClass::from_declared("INTEGER"), TypeClass::Integer);
        assert_eq!(TypeClass::from_declared("varchar(30)"), TypeClass::Text);
        assert_eq!(TypeClass::from_declared("DOUBLE PRECISION"), TypeClass::Real);
        assert_eq!(TypeClass::from_declared("DECIMAL(10,2)"), TypeClass::Numeric);
        assert_eq!(TypeClass::from_declared("wibble"), TypeClass::Any);
    }

    #[test]
    fn inference_all_same() {
        let t = infer_result_type(&[LogicalType::text(), LogicalType::text()]);
        assert_eq!(t.class, TypeClass::Text);
    }

    #[test]
    fn inference_mixed_numeric_prefers_real() {
        let t = infer_result_type(&[LogicalType::integer(), LogicalType::real()]);
        assert_eq!(t.class, TypeClass::Real);
        let t = infer_result_type(&[LogicalType::integer(), LogicalType::boolean()]);
        assert_eq!(t.class, TypeClass::Integer);
    }

    #[test]
    fn inference_falls_back_to_first() {
        let t = infer_result_type(&[LogicalType::text(), LogicalType::integer()]);
        assert_eq!(t.class, TypeClass::Text);
    }
}
