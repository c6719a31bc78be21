//! Access-path analysis and lazy scans for [`StoreTable`].
//!
//! Three patterns over the primary key: point lookup when every pk column
//! is pinned by `=`, a range scan when the leading pk column carries a
//! range constraint (bounds built from the constraints, never a full-scan
//! fallback), and a full scan otherwise. When the access plan selected a
//! secondary index, the scan walks the index store and joins back to the
//! data store through the pk suffix embedded in each entry.
//!
//! Every scan re-checks the residual constraints per row with the
//! type-aware comparator under each column's collation.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::codec::{
    DATA_PREFIX, KeyEncodingOptions, build_data_key, data_scan_bounds, deserialize_row,
    encode_composite, prefix_successor, split_index_key,
};
use crate::codec::IDX_PREFIX;
use crate::error::QuereusResult;
use crate::schema::{CollationRegistry, IndexSchema, KeyColumn, TableSchema};
use crate::storage::{IterateOptions, KvIter, KvStore};
use crate::transaction::TransactionCoordinator;
use crate::types::{Row, SortDirection, SqlValue, TextCollation, compare_values};
use crate::vtab::access_plan::{ConstraintOp, FilterConstraint};
use crate::vtab::module::{FilterInfo, RowIter};
use crate::vtab::access_plan::PRIMARY_INDEX;

use super::{StoreTable, internal};

enum AccessPath {
    Point {
        pk: Vec<SqlValue>,
    },
    PkRange {
        lower: Option<(SqlValue, bool)>,
        upper: Option<(SqlValue, bool)>,
    },
    IndexEq {
        index: IndexSchema,
        values: Vec<SqlValue>,
    },
    IndexRange {
        index: IndexSchema,
        lower: Option<(SqlValue, bool)>,
        upper: Option<(SqlValue, bool)>,
    },
    Full,
}

impl StoreTable {
    pub(crate) fn scan(&self, filter: &FilterInfo) -> QuereusResult<RowIter> {
        let stores = self.ensure_stores()?;
        let residual = ResidualFilter::new(
            Arc::clone(&self.schema),
            Arc::clone(&self.collations),
            filter.constraints.clone(),
        );

        match self.analyze_access(filter)? {
            AccessPath::Point { pk } => {
                let key = build_data_key(&pk, &self.schema.pk_encoding_options())?;
                let mut out = Vec::new();
                if let Some(bytes) = self.read_kv(&stores.data, &key)? {
                    let row = deserialize_row(&bytes)?;
                    if residual.matches(&row) {
                        out.push(Ok(row));
                    }
                }
                Ok(Box::new(out.into_iter()))
            }
            AccessPath::PkRange { lower, upper } => {
                let schema = Arc::clone(&self.schema);
                let opts = range_iterate_options(
                    &[DATA_PREFIX],
                    &[],
                    &schema.primary_key[0],
                    &schema,
                    lower,
                    upper,
                )?;
                let iter = self.iterate_kv(&stores.data, opts)?;
                Ok(Box::new(DataRowScan { inner: iter, residual }))
            }
            AccessPath::Full => {
                let bounds = data_scan_bounds();
                let iter = self.iterate_kv(
                    &stores.data,
                    IterateOptions::half_open(bounds.lower, bounds.upper),
                )?;
                Ok(Box::new(DataRowScan { inner: iter, residual }))
            }
            AccessPath::IndexEq { index, values } => {
                let schema = Arc::clone(&self.schema);
                let mut prefix = vec![IDX_PREFIX];
                prefix.extend(encode_composite(&values, &schema.index_encoding_options(&index))?);
                let upper = prefix_successor(&prefix);
                let opts = bounded(prefix, upper);
                self.index_join_scan(&stores, &index, opts, residual)
            }
            AccessPath::IndexRange { index, lower, upper } => {
                let schema = Arc::clone(&self.schema);
                let opts = range_iterate_options(
                    &[IDX_PREFIX],
                    &[],
                    &index.columns[0],
                    &schema,
                    lower,
                    upper,
                )?;
                self.index_join_scan(&stores, &index, opts, residual)
            }
        }
    }

    fn index_join_scan(
        &self,
        stores: &Arc<super::TableStores>,
        index: &IndexSchema,
        opts: IterateOptions,
        residual: ResidualFilter,
    ) -> QuereusResult<RowIter> {
        let (_, index_store) = stores
            .indexes
            .iter()
            .find(|(schema, _)| schema.name == index.name)
            .ok_or_else(|| internal(format!("no store for index {}", index.name)))?;
        let iter = self.iterate_kv(index_store, opts)?;
        Ok(Box::new(IndexRowScan {
            inner: iter,
            n_cols: index.columns.len(),
            directions: index.columns.iter().map(|c| c.direction).collect(),
            data: Arc::clone(&stores.data),
            coordinator: Arc::clone(self.coordinator()),
            residual,
        }))
    }

    fn analyze_access(&self, filter: &FilterInfo) -> QuereusResult<AccessPath> {
        let schema = &self.schema;

        if let Some(name) = &filter.index_name
            && name != PRIMARY_INDEX
        {
            let index = schema
                .indexes
                .iter()
                .find(|i| i.name.eq_ignore_ascii_case(name))
                .cloned()
                .ok_or_else(|| internal(format!("access plan chose unknown index {name}")))?;
            let eq_values: Vec<Option<SqlValue>> = index
                .columns
                .iter()
                .map(|c| find_eq_value(&filter.constraints, c.column_index))
                .collect();
            if eq_values.iter().all(|v| v.is_some()) {
                return Ok(AccessPath::IndexEq {
                    values: eq_values.into_iter().flatten().collect(),
                    index,
                });
            }
            let leading = index.columns[0].column_index;
            let (lower, upper) = range_bounds_for(&filter.constraints, leading);
            if lower.is_some() || upper.is_some() {
                return Ok(AccessPath::IndexRange { index, lower, upper });
            }
            return Ok(AccessPath::Full);
        }

        // Primary-key analysis: point when every pk column is pinned.
        let pk_values: Vec<Option<SqlValue>> = schema
            .primary_key
            .iter()
            .map(|k| find_eq_value(&filter.constraints, k.column_index))
            .collect();
        if !pk_values.is_empty() && pk_values.iter().all(|v| v.is_some()) {
            return Ok(AccessPath::Point {
                pk: pk_values.into_iter().flatten().collect(),
            });
        }

        if let Some(leading) = schema.primary_key.first() {
            let (lower, upper) = range_bounds_for(&filter.constraints, leading.column_index);
            if lower.is_some() || upper.is_some() {
                return Ok(AccessPath::PkRange { lower, upper });
            }
        }

        Ok(AccessPath::Full)
    }
}

fn find_eq_value(constraints: &[FilterConstraint], column: usize) -> Option<SqlValue> {
    constraints
        .iter()
        .find(|c| c.usable && c.column_index == column && c.op == ConstraintOp::Eq)
        .and_then(|c| c.value.clone())
}

/// Collect the tightest lower/upper bound constraints on one column.
fn range_bounds_for(
    constraints: &[FilterConstraint],
    column: usize,
) -> (Option<(SqlValue, bool)>, Option<(SqlValue, bool)>) {
    let mut lower: Option<(SqlValue, bool)> = None;
    let mut upper: Option<(SqlValue, bool)> = None;
    for constraint in constraints {
        if !constraint.usable || constraint.column_index != column {
            continue;
        }
        let Some(value) = constraint.value.clone() else { continue };
        match constraint.op {
            ConstraintOp::Gt | ConstraintOp::Ge => {
                let candidate = (value, constraint.op == ConstraintOp::Ge);
                lower = Some(match lower.take() {
                    None => candidate,
                    Some(current) => tighter(current, candidate, true),
                });
            }
            ConstraintOp::Lt | ConstraintOp::Le => {
                let candidate = (value, constraint.op == ConstraintOp::Le);
                upper = Some(match upper.take() {
                    None => candidate,
                    Some(current) => tighter(current, candidate, false),
                });
            }
            _ => {}
        }
    }
    (lower, upper)
}

fn tighter(
    a: (SqlValue, bool),
    b: (SqlValue, bool),
    lower: bool,
) -> (SqlValue, bool) {
    match compare_values(&a.0, &b.0, TextCollation::Binary) {
        Some(Ordering::Less) => {
            if lower { b } else { a }
        }
        Some(Ordering::Greater) => {
            if lower { a } else { b }
        }
        // Same value: exclusive is tighter than inclusive.
        _ => {
            if a.1 && !b.1 { b } else { a }
        }
    }
}

/// Build iteration bounds for a range constraint on the leading key column.
/// A descending column flips the comparison before it maps onto bytes.
fn range_iterate_options(
    store_prefix: &[u8],
    eq_prefix_bytes: &[u8],
    leading: &KeyColumn,
    schema: &TableSchema,
    lower: Option<(SqlValue, bool)>,
    upper: Option<(SqlValue, bool)>,
) -> QuereusResult<IterateOptions> {
    let mut base = store_prefix.to_vec();
    base.extend_from_slice(eq_prefix_bytes);

    let component_opts = KeyEncodingOptions {
        collations: vec![
            TextCollation::parse(&schema.key_collation_name(leading)).unwrap_or_default(),
        ],
        directions: vec![leading.direction],
        strict: false,
    };
    let encode = |value: &SqlValue| -> QuereusResult<Vec<u8>> {
        let mut key = base.clone();
        key.extend(encode_composite(std::slice::from_ref(value), &component_opts)?);
        Ok(key)
    };

    let desc = leading.direction.is_desc();
    // Under a descending encoding the logical lower bound becomes the byte
    // upper bound and vice versa.
    let (byte_lower, byte_upper) = if desc { (upper, lower) } else { (lower, upper) };

    let mut opts = IterateOptions::default();
    opts.gte = Some(match byte_lower {
        Some((value, inclusive)) => {
            let key = encode(&value)?;
            if inclusive { key } else { prefix_successor(&key) }
        }
        None => base.clone(),
    });
    let upper_key = match byte_upper {
        Some((value, inclusive)) => {
            let key = encode(&value)?;
            if inclusive { prefix_successor(&key) } else { key }
        }
        None => prefix_successor(&base),
    };
    if !upper_key.is_empty() {
        opts.lt = Some(upper_key);
    }
    Ok(opts)
}

fn bounded(lower: Vec<u8>, upper: Vec<u8>) -> IterateOptions {
    let mut opts = IterateOptions::default();
    opts.gte = Some(lower);
    if !upper.is_empty() {
        opts.lt = Some(upper);
    }
    opts
}

/// Per-row re-check of the pushed-down constraints.
pub(crate) struct ResidualFilter {
    schema: Arc<TableSchema>,
    collations: Arc<CollationRegistry>,
    constraints: Vec<FilterConstraint>,
}

impl ResidualFilter {
    pub(crate) fn new(
        schema: Arc<TableSchema>,
        collations: Arc<CollationRegistry>,
        constraints: Vec<FilterConstraint>,
    ) -> Self {
        Self {
            schema,
            collations,
            constraints,
        }
    }

    pub(crate) fn matches(&self, row: &Row) -> bool {
        self.constraints.iter().all(|constraint| {
            let Some(value) = &constraint.value else {
                // Value unknown at this layer; a Filter node re-checks it.
                return true;
            };
            let cell = row.get(constraint.column_index).unwrap_or(&SqlValue::Null);
            let Some(order) = self.compare(constraint.column_index, cell, value) else {
                // NULL is not equal to anything; ordered comparisons are false.
                return false;
            };
            match constraint.op {
                ConstraintOp::Eq => order == Ordering::Equal,
                ConstraintOp::Lt => order == Ordering::Less,
                ConstraintOp::Le => order != Ordering::Greater,
                ConstraintOp::Gt => order == Ordering::Greater,
                ConstraintOp::Ge => order != Ordering::Less,
                // IN/LIKE are never pushed with a single value
                ConstraintOp::In | ConstraintOp::Like => true,
            }
        })
    }

    fn compare(&self, column: usize, a: &SqlValue, b: &SqlValue) -> Option<Ordering> {
        if a.is_null() || b.is_null() {
            return None;
        }
        let name = self
            .schema
            .columns
            .get(column)
            .and_then(|c| c.logical_type.collation.as_deref())
            .unwrap_or("BINARY");
        if let Some(builtin) = TextCollation::parse(name) {
            return compare_values(a, b, builtin);
        }
        // Custom collation: applies to text pairs; everything else is binary.
        if let (SqlValue::Text(x), SqlValue::Text(y)) = (a, b)
            && let Ok(custom) = self.collations.resolve(name)
        {
            return Some(custom(x, y));
        }
        compare_values(a, b, TextCollation::Binary)
    }
}

struct DataRowScan {
    inner: KvIter,
    residual: ResidualFilter,
}

impl Iterator for DataRowScan {
    type Item = QuereusResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(err) => return Some(Err(err)),
            };
            let row = match deserialize_row(&entry.value) {
                Ok(row) => row,
                Err(err) => return Some(Err(err)),
            };
            if self.residual.matches(&row) {
                return Some(Ok(row));
            }
        }
    }
}

struct IndexRowScan {
    inner: KvIter,
    n_cols: usize,
    directions: Vec<SortDirection>,
    data: Arc<dyn KvStore>,
    coordinator: Arc<TransactionCoordinator>,
    residual: ResidualFilter,
}

impl Iterator for IndexRowScan {
    type Item = QuereusResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(err) => return Some(Err(err)),
            };
            let pk_part = match split_index_key(&entry.key, self.n_cols, &self.directions) {
                Ok((_, pk)) => pk,
                Err(err) => return Some(Err(err)),
            };
            let mut data_key = Vec::with_capacity(1 + pk_part.len());
            data_key.push(DATA_PREFIX);
            data_key.extend_from_slice(pk_part);

            let bytes = match self.coordinator.pending_lookup(&self.data, &data_key) {
                Some(pending) => pending,
                None => match self.data.get(&data_key) {
                    Ok(stored) => stored,
                    Err(err) => return Some(Err(err)),
                },
            };
            let Some(bytes) = bytes else {
                return Some(Err(internal("index entry references a missing row")));
            };
            let row = match deserialize_row(&bytes) {
                Ok(row) => row,
                Err(err) => return Some(Err(err)),
            };
            if self.residual.matches(&row) {
                return Some(Ok(row));
            }
        }
    }
}
