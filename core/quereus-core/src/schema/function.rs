//! Scalar, aggregate and table-valued function registries.
//!
//! Lookup is by `(lowercased name, arg count)` with `-1` meaning variadic.
//! A handful of standard functions are pre-registered so a fresh database
//! can run ordinary queries.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{QuereusError, QuereusResult};
use crate::types::{LogicalType, Row, SqlValue, TextCollation, compare_values};

pub type ScalarFn = Arc<dyn Fn(&[SqlValue]) -> QuereusResult<SqlValue> + Send + Sync>;

/// Accumulator state for one aggregate evaluation.
pub trait AggregateState: Send {
    fn accumulate(&mut self, args: &[SqlValue]) -> QuereusResult<()>;
    fn finalize(&mut self) -> QuereusResult<SqlValue>;
}

pub type AggregateFactory = Arc<dyn Fn() -> Box<dyn AggregateState> + Send + Sync>;

/// A registered table-valued function: a relation signature plus a call
/// hook returning a lazy row sequence.
pub struct TableFunction {
    pub name: String,
    pub column_names: Vec<String>,
    pub column_types: Vec<LogicalType>,
    pub num_args: i32,
    #[allow(clippy::type_complexity)]
    pub call: Arc<
        dyn Fn(&[SqlValue]) -> QuereusResult<Box<dyn Iterator<Item = QuereusResult<Row>> + Send>>
            + Send
            + Sync,
    >,
}

#[derive(Clone)]
pub struct ScalarFunction {
    pub name: String,
    pub num_args: i32,
    pub func: ScalarFn,
}

#[derive(Clone)]
pub struct AggregateFunction {
    pub name: String,
    pub num_args: i32,
    pub factory: AggregateFactory,
}

/// Registry keyed by `(name, num_args)`; `-1` registrations match any arity.
pub struct FunctionRegistry {
    scalars: DashMap<(String, i32), ScalarFunction>,
    aggregates: DashMap<(String, i32), AggregateFunction>,
    table_functions: DashMap<(String, i32), Arc<TableFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        let registry = Self {
            scalars: DashMap::new(),
            aggregates: DashMap::new(),
            table_functions: DashMap::new(),
        };
        registry.install_builtins();
        registry
    }

    pub fn register_scalar(&self, name: &str, num_args: i32, func: ScalarFn) {
        let name = name.to_lowercase();
        self.scalars.insert(
            (name.clone(), num_args),
            ScalarFunction {
                name,
                num_args,
                func,
            },
        );
    }

    pub fn register_aggregate(&self, name: &str, num_args: i32, factory: AggregateFactory) {
        let name = name.to_lowercase();
        self.aggregates.insert(
            (name.clone(), num_args),
            AggregateFunction {
                name,
                num_args,
                factory,
            },
        );
    }

    pub fn register_table_function(&self, func: TableFunction) {
        let key = (func.name.to_lowercase(), func.num_args);
        self.table_functions.insert(key, Arc::new(func));
    }

    pub fn scalar(&self, name: &str, num_args: usize) -> QuereusResult<ScalarFunction> {
        let name = name.to_lowercase();
        self.scalars
            .get(&(name.clone(), num_args as i32))
            .or_else(|| self.scalars.get(&(name.clone(), -1)))
            .map(|e| e.value().clone())
            .ok_or(QuereusError::Resolve {
                kind: "function",
                name,
            })
    }

    pub fn aggregate(&self, name: &str, num_args: usize) -> Option<AggregateFunction> {
        let name = name.to_lowercase();
        self.aggregates
            .get(&(name.clone(), num_args as i32))
            .or_else(|| self.aggregates.get(&(name, -1)))
            .map(|e| e.value().clone())
    }

    pub fn table_function(&self, name: &str, num_args: usize) -> QuereusResult<Arc<TableFunction>> {
        let name = name.to_lowercase();
        self.table_functions
            .get(&(name.clone(), num_args as i32))
            .or_else(|| self.table_functions.get(&(name.clone(), -1)))
            .map(|e| e.value().clone())
            .ok_or(QuereusError::Resolve {
                kind: "table function",
                name,
            })
    }

    fn install_builtins(&self) {
        self.register_scalar("upper", 1, Arc::new(|args| {
            Ok(match &args[0] {
                SqlValue::Text(t) => SqlValue::Text(t.to_uppercase()),
                SqlValue::Null => SqlValue::Null,
                other => other.clone(),
            })
        }));
        self.register_scalar("lower", 1, Arc::new(|args| {
            Ok(match &args[0] {
                SqlValue::Text(t) => SqlValue::Text(t.to_lowercase()),
                SqlValue::Null => SqlValue::Null,
                other => other.clone(),
            })
        }));
        self.register_scalar("length", 1, Arc::new(|args| {
            Ok(match &args[0] {
                SqlValue::Text(t) => SqlValue::Integer(t.chars().count() as i64),
                SqlValue::Blob(b) => SqlValue::Integer(b.len() as i64),
                SqlValue::Null => SqlValue::Null,
                _ => SqlValue::Null,
            })
        }));
        self.register_scalar("abs", 1, Arc::new(|args| {
            Ok(match &args[0] {
                SqlValue::Integer(i) => SqlValue::Integer(i.saturating_abs()),
                SqlValue::Real(f) => SqlValue::Real(f.abs()),
                SqlValue::BigInt(b) => SqlValue::BigInt(if b.sign() == num_bigint::Sign::Minus {
                    -b.clone()
                } else {
                    b.clone()
                }),
                SqlValue::Null => SqlValue::Null,
                _ => SqlValue::Null,
            })
        }));
        self.register_scalar("coalesce", -1, Arc::new(|args| {
            Ok(args
                .iter()
                .find(|v| !v.is_null())
                .cloned()
                .unwrap_or(SqlValue::Null))
        }));
        self.register_scalar("typeof", 1, Arc::new(|args| {
            Ok(SqlValue::Text(args[0].type_name().to_string()))
        }));

        self.register_aggregate("count", -1, Arc::new(|| Box::new(CountState { count: 0 })));
        self.register_aggregate("sum", 1, Arc::new(|| Box::new(SumState::default())));
        self.register_aggregate("avg", 1, Arc::new(|| Box::new(AvgState::default())));
        self.register_aggregate("min", 1, Arc::new(|| Box::new(ExtremumState::new(true))));
        self.register_aggregate("max", 1, Arc::new(|| Box::new(ExtremumState::new(false))));
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct CountState {
    count: i64,
}

impl AggregateState for CountState {
    fn accumulate(&mut self, args: &[SqlValue]) -> QuereusResult<()> {
        // COUNT(*) takes no args; COUNT(x) skips NULLs
        if args.is_empty() || !args[0].is_null() {
            self.count += 1;
        }
        Ok(())
    }

    fn finalize(&mut self) -> QuereusResult<SqlValue> {
        Ok(SqlValue::Integer(self.count))
    }
}

#[derive(Default)]
struct SumState {
    int_sum: i64,
    real_sum: f64,
    saw_real: bool,
    saw_any: bool,
}

impl AggregateState for SumState {
    fn accumulate(&mut self, args: &[SqlValue]) -> QuereusResult<()> {
        match &args[0] {
            SqlValue::Null => {}
            SqlValue::Integer(i) => {
                self.saw_any = true;
                self.int_sum = self.int_sum.wrapping_add(*i);
                self.real_sum += *i as f64;
            }
            SqlValue::Real(f) => {
                self.saw_any = true;
                self.saw_real = true;
                self.real_sum += f;
            }
            other => {
                return Err(QuereusError::Type(format!(
                    "sum() over non-numeric value of type {}",
                    other.type_name()
                )));
            }
        }
        Ok(())
    }

    fn finalize(&mut self) -> QuereusResult<SqlValue> {
        if !self.saw_any {
            Ok(SqlValue::Null)
        } else if self.saw_real {
            Ok(SqlValue::Real(self.real_sum))
        } else {
            Ok(SqlValue::Integer(self.int_sum))
        }
    }
}

#[derive(Default)]
struct AvgState {
    sum: f64,
    count: i64,
}

impl AggregateState for AvgState {
    fn accumulate(&mut self, args: &[SqlValue]) -> QuereusResult<()> {
        if let Some(f) = args[0].as_f64() {
            self.sum += f;
            self.count += 1;
        }
        Ok(())
    }

    fn finalize(&mut self) -> QuereusResult<SqlValue> {
        if self.count == 0 {
            Ok(SqlValue::Null)
        } else {
            Ok(SqlValue::Real(self.sum / self.count as f64))
        }
    }
}

struct ExtremumState {
    min: bool,
    best: Option<SqlValue>,
}

impl ExtremumState {
    fn new(min: bool) -> Self {
        Self { min, best: None }
    }
}

impl AggregateState for ExtremumState {
    fn accumulate(&mut self, args: &[SqlValue]) -> QuereusResult<()> {
        let value = &args[0];
        if value.is_null() {
            return Ok(());
        }
        let replace = match &self.best {
            None => true,
            Some(best) => match compare_values(value, best, TextCollation::Binary) {
                Some(std::cmp::Ordering::Less) => self.min,
                Some(std::cmp::Ordering::Greater) => !self.min,
                _ => false,
            },
        };
        if replace {
            self.best = Some(value.clone());
        }
        Ok(())
    }

    fn finalize(&mut self) -> QuereusResult<SqlValue> {
        Ok(self.best.take().unwrap_or(SqlValue::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_lookup_prefers_exact_arity() {
        let registry = FunctionRegistry::new();
        let upper = registry.scalar("UPPER", 1).unwrap();
        assert_eq!(
            (upper.func)(&[SqlValue::Text("abc".into())]).unwrap(),
            SqlValue::Text("ABC".into())
        );
        assert!(registry.scalar("upper", 3).is_err());
    }

    #[test]
    fn variadic_fallback() {
        let registry = FunctionRegistry::new();
        let coalesce = registry.scalar("coalesce", 3).unwrap();
        let out = (coalesce.func)(&[SqlValue::Null, SqlValue::Integer(5), SqlValue::Integer(9)]).unwrap();
        assert_eq!(out, SqlValue::Integer(5));
    }

    #[test]
    fn count_skips_nulls_but_star_counts_all() {
        let registry = FunctionRegistry::new();
        let agg = registry.aggregate("count", 1).unwrap();
        let mut state = (agg.factory)();
        state.accumulate(&[SqlValue::Null]).unwrap();
        state.accumulate(&[SqlValue::Integer(1)]).unwrap();
        assert_eq!(state.finalize().unwrap(), SqlValue::Integer(1));

        let mut star = (agg.factory)();
        star.accumulate(&[]).unwrap();
        star.accumulate(&[]).unwrap();
        assert_eq!(star.finalize().unwrap(), SqlValue::Integer(2));
    }

    #[test]
    fn sum_stays_integer_until_a_real_appears() {
        let registry = FunctionRegistry::new();
        let agg = registry.aggregate("sum", 1).unwrap();
        let mut state = (agg.factory)();
        state.accumulate(&[SqlValue::Integer(2)]).unwrap();
        state.accumulate(&[SqlValue::Integer(3)]).unwrap();
        assert_eq!(state.finalize().unwrap(), SqlValue::Integer(5));

        let mut state = (agg.factory)();
        state.accumulate(&[SqlValue::Integer(2)]).unwrap();
        state.accumulate(&[SqlValue::Real(0.5)]).unwrap();
        assert_eq!(state.finalize().unwrap(), SqlValue::Real(2.5));
    }

    #[test]
    fn min_max_ignore_nulls() {
        let registry = FunctionRegistry::new();
        let agg = registry.aggregate("min", 1).unwrap();
        let mut state = (agg.factory)();
        state.accumulate(&[SqlValue::Null]).unwrap();
        state.accumulate(&[SqlValue::Integer(4)]).unwrap();
        state.accumulate(&[SqlValue::Integer(2)]).unwrap();
        assert_eq!(state.finalize().unwrap(), SqlValue::Integer(2));
    }

    #[test]
    fn table_function_lookup_by_arity() {
        let registry = FunctionRegistry::new();
        registry.register_table_function(TableFunction {
            name: "generate_series".into(),
            column_names: vec!["value".into()],
            column_types: vec![LogicalType::integer()],
            num_args: 2,
            call: Arc::new(|args| {
                let (start, end) = match (&args[0], &args[1]) {
                    (SqlValue::Integer(s), SqlValue::Integer(e)) => (*s, *e),
                    _ => return Err(QuereusError::Type("generate_series(int, int)".into())),
                };
                Ok(Box::new((start..=end).map(|i| Ok(vec![SqlValue::Integer(i)]))))
            }),
        });
        let tvf = registry.table_function("GENERATE_SERIES", 2).unwrap();
        let rows: Vec<Row> = (tvf.call)(&[SqlValue::Integer(1), SqlValue::Integer(3)])
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(rows.len(), 3);
        assert!(registry.table_function("generate_series", 1).is_err());
    }
}
