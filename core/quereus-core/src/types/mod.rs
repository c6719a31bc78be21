//! Value and type system: [`SqlValue`], rows, collations and logical types.

pub mod collation;
pub mod logical;
pub mod value;

pub use collation::TextCollation;
pub use logical::{LogicalType, TypeClass};
pub use value::{Row, SqlValue, compare_values};

/// Sort direction for key columns and orderings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn is_desc(&self) -> bool {
        matches!(self, SortDirection::Desc)
    }
}
