//! Scalar expression evaluation.
//!
//! SQL three-valued logic throughout: NULL propagates through operators,
//! AND/OR implement Kleene logic, and a NULL predicate result is falsy.
//! `apply_binary`/`apply_unary` are pure and shared with the optimizer's
//! constant folder.

use std::collections::HashMap;
use std::sync::Arc;

use num_bigint::BigInt;

use crate::error::{QuereusError, QuereusResult};
use crate::schema::{CollationRegistry, FunctionRegistry};
use crate::sql::planner::types::{BinaryOp, PlanNode, ScalarExpr, UnaryOp};
use crate::types::{Row, SqlValue, TextCollation, compare_values};

/// Runs an uncorrelated subquery plan and materializes its rows.
pub type SubqueryRunner =
    Arc<dyn Fn(&PlanNode, &RuntimeServices) -> QuereusResult<Vec<Row>> + Send + Sync>;

/// Immutable services an expression needs at runtime. Cloned into lazy row
/// iterators, so everything here is cheap to clone.
#[derive(Clone)]
pub struct RuntimeServices {
    pub params: Arc<HashMap<String, SqlValue>>,
    pub functions: Arc<FunctionRegistry>,
    pub collations: Arc<CollationRegistry>,
    pub subquery: Option<SubqueryRunner>,
}

impl RuntimeServices {
    pub fn new(functions: Arc<FunctionRegistry>, collations: Arc<CollationRegistry>) -> Self {
        Self {
            params: Arc::new(HashMap::new()),
            functions,
            collations,
            subquery: None,
        }
    }

    pub fn with_params(mut self, params: HashMap<String, SqlValue>) -> Self {
        self.params = Arc::new(params);
        self
    }
}

pub fn eval_expr(
    expr: &ScalarExpr,
    row: &[SqlValue],
    services: &RuntimeServices,
) -> QuereusResult<SqlValue> {
    match expr {
        ScalarExpr::Column { index, name } => row.get(*index).cloned().ok_or_else(|| {
            QuereusError::Internal(format!(
                "column {name} (#{index}) outside a {}-column row",
                row.len()
            ))
        }),
        ScalarExpr::Literal(value) => Ok(value.clone()),
        ScalarExpr::Param(name) => services
            .params
            .get(name)
            .cloned()
            .ok_or_else(|| QuereusError::Misuse(format!("unbound parameter {name}"))),
        ScalarExpr::Binary { op, left, right } => match op {
            // Kleene AND/OR short-circuit on the determining operand.
            BinaryOp::And => {
                let left = eval_expr(left, row, services)?;
                if left.is_truthy() == Some(false) {
                    return Ok(SqlValue::from_bool(false));
                }
                let right = eval_expr(right, row, services)?;
                Ok(match (left.is_truthy(), right.is_truthy()) {
                    (_, Some(false)) => SqlValue::from_bool(false),
                    (Some(true), Some(true)) => SqlValue::from_bool(true),
                    _ => SqlValue::Null,
                })
            }
            BinaryOp::Or => {
                let left = eval_expr(left, row, services)?;
                if left.is_truthy() == Some(true) {
                    return Ok(SqlValue::from_bool(true));
                }
                let right = eval_expr(right, row, services)?;
                Ok(match (left.is_truthy(), right.is_truthy()) {
                    (_, Some(true)) => SqlValue::from_bool(true),
                    (Some(false), Some(false)) => SqlValue::from_bool(false),
                    _ => SqlValue::Null,
                })
            }
            _ => {
                let left = eval_expr(left, row, services)?;
                let right = eval_expr(right, row, services)?;
                apply_binary(*op, &left, &right)
            }
        },
        ScalarExpr::Unary { op, operand } => {
            let value = eval_expr(operand, row, services)?;
            apply_unary(*op, &value)
        }
        ScalarExpr::FunctionCall { name, args } => {
            let function = services.functions.scalar(name, args.len())?;
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(eval_expr(arg, row, services)?);
            }
            (function.func)(&evaluated)
        }
        ScalarExpr::Case {
            operand,
            branches,
            otherwise,
        } => {
            match operand {
                Some(operand) => {
                    let subject = eval_expr(operand, row, services)?;
                    for (when, then) in branches {
                        let candidate = eval_expr(when, row, services)?;
                        if compare_values(&subject, &candidate, TextCollation::Binary)
                            == Some(std::cmp::Ordering::Equal)
                        {
                            return eval_expr(then, row, services);
                        }
                    }
                }
                None => {
                    for (when, then) in branches {
                        if eval_expr(when, row, services)?.is_truthy() == Some(true) {
                            return eval_expr(then, row, services);
                        }
                    }
                }
            }
            match otherwise {
                Some(e) => eval_expr(e, row, services),
                None => Ok(SqlValue::Null),
            }
        }
        ScalarExpr::IsNull { operand, negated } => {
            let value = eval_expr(operand, row, services)?;
            Ok(SqlValue::from_bool(value.is_null() != *negated))
        }
        ScalarExpr::InList {
            expr,
            list,
            negated,
        } => {
            let needle = eval_expr(expr, row, services)?;
            let mut candidates = Vec::with_capacity(list.len());
            for item in list {
                candidates.push(eval_expr(item, row, services)?);
            }
            in_result(&needle, candidates.iter(), *negated)
        }
        ScalarExpr::InSubquery {
            expr,
            subquery,
            negated,
        } => {
            let needle = eval_expr(expr, row, services)?;
            let rows = run_subquery(subquery, services)?;
            let firsts: Vec<SqlValue> = rows
                .into_iter()
                .map(|r| r.into_iter().next().unwrap_or(SqlValue::Null))
                .collect();
            in_result(&needle, firsts.iter(), *negated)
        }
        ScalarExpr::Subquery(plan) => {
            let rows = run_subquery(plan, services)?;
            Ok(rows
                .into_iter()
                .next()
                .and_then(|r| r.into_iter().next())
                .unwrap_or(SqlValue::Null))
        }
        ScalarExpr::Like {
            expr,
            pattern,
            negated,
        } => {
            let subject = eval_expr(expr, row, services)?;
            let pattern = eval_expr(pattern, row, services)?;
            match (&subject, &pattern) {
                (SqlValue::Null, _) | (_, SqlValue::Null) => Ok(SqlValue::Null),
                (SqlValue::Text(s), SqlValue::Text(p)) => {
                    Ok(SqlValue::from_bool(like_match(p, s) != *negated))
                }
                _ => Ok(SqlValue::from_bool(*negated)),
            }
        }
    }
}

/// Evaluate a predicate: NULL and FALSE both reject the row.
pub fn eval_predicate(
    expr: &ScalarExpr,
    row: &[SqlValue],
    services: &RuntimeServices,
) -> QuereusResult<bool> {
    Ok(eval_expr(expr, row, services)?.is_truthy() == Some(true))
}

fn run_subquery(plan: &PlanNode, services: &RuntimeServices) -> QuereusResult<Vec<Row>> {
    match &services.subquery {
        Some(runner) => runner(plan, services),
        None => Err(QuereusError::Internal(
            "subquery evaluation outside a statement context".into(),
        )),
    }
}

/// SQL IN semantics: TRUE on a match, NULL when no match but a NULL
/// candidate exists, FALSE otherwise.
fn in_result<'a>(
    needle: &SqlValue,
    candidates: impl Iterator<Item = &'a SqlValue>,
    negated: bool,
) -> QuereusResult<SqlValue> {
    if needle.is_null() {
        return Ok(SqlValue::Null);
    }
    let mut saw_null = false;
    for candidate in candidates {
        match compare_values(needle, candidate, TextCollation::Binary) {
            Some(std::cmp::Ordering::Equal) => return Ok(SqlValue::from_bool(!negated)),
            None => saw_null = true,
            _ => {}
        }
    }
    if saw_null {
        Ok(SqlValue::Null)
    } else {
        Ok(SqlValue::from_bool(negated))
    }
}

/// ASCII case-insensitive LIKE with `%` and `_`.
fn like_match(pattern: &str, subject: &str) -> bool {
    fn inner(p: &[u8], s: &[u8]) -> bool {
        match p.first() {
            None => s.is_empty(),
            Some(b'%') => (0..=s.len()).any(|i| inner(&p[1..], &s[i..])),
            Some(b'_') => !s.is_empty() && inner(&p[1..], &s[1..]),
            Some(&c) => {
                !s.is_empty() && s[0].eq_ignore_ascii_case(&c) && inner(&p[1..], &s[1..])
            }
        }
    }
    inner(pattern.as_bytes(), subject.as_bytes())
}

/// Pure binary operator application over two values.
pub fn apply_binary(op: BinaryOp, a: &SqlValue, b: &SqlValue) -> QuereusResult<SqlValue> {
    if matches!(op, BinaryOp::And | BinaryOp::Or) {
        let result = match (a.is_truthy(), b.is_truthy()) {
            (Some(x), Some(y)) => {
                let v = if op == BinaryOp::And { x && y } else { x || y };
                SqlValue::from_bool(v)
            }
            (Some(false), _) | (_, Some(false)) if op == BinaryOp::And => SqlValue::from_bool(false),
            (Some(true), _) | (_, Some(true)) if op == BinaryOp::Or => SqlValue::from_bool(true),
            _ => SqlValue::Null,
        };
        return Ok(result);
    }

    if op.is_comparison() {
        return Ok(match compare_values(a, b, TextCollation::Binary) {
            None => SqlValue::Null,
            Some(order) => {
                let truth = match op {
                    BinaryOp::Eq => order == std::cmp::Ordering::Equal,
                    BinaryOp::NotEq => order != std::cmp::Ordering::Equal,
                    BinaryOp::Lt => order == std::cmp::Ordering::Less,
                    BinaryOp::LtEq => order != std::cmp::Ordering::Greater,
                    BinaryOp::Gt => order == std::cmp::Ordering::Greater,
                    BinaryOp::GtEq => order != std::cmp::Ordering::Less,
                    _ => unreachable!(),
                };
                SqlValue::from_bool(truth)
            }
        });
    }

    if a.is_null() || b.is_null() {
        return Ok(SqlValue::Null);
    }

    if op == BinaryOp::Concat {
        let text = |v: &SqlValue| -> String {
            match v {
                SqlValue::Text(t) => t.clone(),
                SqlValue::Integer(i) => i.to_string(),
                SqlValue::BigInt(bi) => bi.to_string(),
                SqlValue::Real(f) => f.to_string(),
                SqlValue::Blob(_) | SqlValue::Null => String::new(),
            }
        };
        return Ok(SqlValue::Text(format!("{}{}", text(a), text(b))));
    }

    numeric_binary(op, a, b)
}

fn numeric_binary(op: BinaryOp, a: &SqlValue, b: &SqlValue) -> QuereusResult<SqlValue> {
    match (a, b) {
        (SqlValue::Integer(x), SqlValue::Integer(y)) => Ok(match op {
            // Overflow promotes to the arbitrary-precision representation.
            BinaryOp::Add => x
                .checked_add(*y)
                .map(SqlValue::Integer)
                .unwrap_or_else(|| SqlValue::BigInt(BigInt::from(*x) + BigInt::from(*y))),
            BinaryOp::Sub => x
                .checked_sub(*y)
                .map(SqlValue::Integer)
                .unwrap_or_else(|| SqlValue::BigInt(BigInt::from(*x) - BigInt::from(*y))),
            BinaryOp::Mul => x
                .checked_mul(*y)
                .map(SqlValue::Integer)
                .unwrap_or_else(|| SqlValue::BigInt(BigInt::from(*x) * BigInt::from(*y))),
            BinaryOp::Div => {
                if *y == 0 {
                    SqlValue::Null
                } else {
                    SqlValue::Integer(x.wrapping_div(*y))
                }
            }
            BinaryOp::Mod => {
                if *y == 0 {
                    SqlValue::Null
                } else {
                    SqlValue::Integer(x.wrapping_rem(*y))
                }
            }
            other => return type_error(other, a, b),
        }),
        (SqlValue::BigInt(_), SqlValue::Integer(_) | SqlValue::BigInt(_))
        | (SqlValue::Integer(_), SqlValue::BigInt(_)) => {
            let to_big = |v: &SqlValue| -> BigInt {
                match v {
                    SqlValue::Integer(i) => BigInt::from(*i),
                    SqlValue::BigInt(b) => b.clone(),
                    _ => unreachable!("guarded by the match arm"),
                }
            };
            let (x, y) = (to_big(a), to_big(b));
            Ok(match op {
                BinaryOp::Add => SqlValue::BigInt(x + y),
                BinaryOp::Sub => SqlValue::BigInt(x - y),
                BinaryOp::Mul => SqlValue::BigInt(x * y),
                BinaryOp::Div => {
                    if y == BigInt::ZERO {
                        SqlValue::Null
                    } else {
                        SqlValue::BigInt(x / y)
                    }
                }
                BinaryOp::Mod => {
                    if y == BigInt::ZERO {
                        SqlValue::Null
                    } else {
                        SqlValue::BigInt(x % y)
                    }
                }
                other => return type_error(other, a, b),
            })
        }
        _ => real_binary(op, a, b),
    }
}

fn real_binary(op: BinaryOp, a: &SqlValue, b: &SqlValue) -> QuereusResult<SqlValue> {
    let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
        return type_error(op, a, b);
    };
    Ok(match op {
        BinaryOp::Add => SqlValue::Real(x + y),
        BinaryOp::Sub => SqlValue::Real(x - y),
        BinaryOp::Mul => SqlValue::Real(x * y),
        BinaryOp::Div => {
            if y == 0.0 {
                SqlValue::Null
            } else {
                SqlValue::Real(x / y)
            }
        }
        BinaryOp::Mod => {
            if y == 0.0 {
                SqlValue::Null
            } else {
                SqlValue::Real(x % y)
            }
        }
        other => return type_error(other, a, b),
    })
}

fn type_error(op: BinaryOp, a: &SqlValue, b: &SqlValue) -> QuereusResult<SqlValue> {
    Err(QuereusError::Type(format!(
        "cannot apply {op:?} to {} and {}",
        a.type_name(),
        b.type_name()
    )))
}

pub fn apply_unary(op: UnaryOp, value: &SqlValue) -> QuereusResult<SqlValue> {
    Ok(match op {
        UnaryOp::Neg => match value {
            SqlValue::Null => SqlValue::Null,
            SqlValue::Integer(i) => i
                .checked_neg()
                .map(SqlValue::Integer)
                .unwrap_or_else(|| SqlValue::BigInt(-BigInt::from(*i))),
            SqlValue::BigInt(b) => SqlValue::BigInt(-b.clone()),
            SqlValue::Real(f) => SqlValue::Real(-f),
            other => {
                return Err(QuereusError::Type(format!(
                    "cannot negate {}",
                    other.type_name()
                )));
            }
        },
        UnaryOp::Not => match value.is_truthy() {
            Some(b) => SqlValue::from_bool(!b),
            None => SqlValue::Null,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services() -> RuntimeServices {
        RuntimeServices::new(
            Arc::new(FunctionRegistry::new()),
            Arc::new(CollationRegistry::new()),
        )
    }

    #[test]
    fn arithmetic_with_overflow_promotes() {
        let out = apply_binary(
            BinaryOp::Add,
            &SqlValue::Integer(i64::MAX),
            &SqlValue::Integer(1),
        )
        .unwrap();
        assert_eq!(out, SqlValue::BigInt(BigInt::from(i64::MAX) + 1));
    }

    #[test]
    fn division_by_zero_is_null() {
        assert_eq!(
            apply_binary(BinaryOp::Div, &SqlValue::Integer(1), &SqlValue::Integer(0)).unwrap(),
            SqlValue::Null
        );
    }

    #[test]
    fn null_propagates_through_comparison_and_arithmetic() {
        assert_eq!(
            apply_binary(BinaryOp::Eq, &SqlValue::Null, &SqlValue::Null).unwrap(),
            SqlValue::Null
        );
        assert_eq!(
            apply_binary(BinaryOp::Add, &SqlValue::Null, &SqlValue::Integer(1)).unwrap(),
            SqlValue::Null
        );
    }

    #[test]
    fn kleene_and_or() {
        let s = services();
        let null = ScalarExpr::Literal(SqlValue::Null);
        let t = ScalarExpr::Literal(SqlValue::from_bool(true));
        let f = ScalarExpr::Literal(SqlValue::from_bool(false));
        let and = |a: &ScalarExpr, b: &ScalarExpr| ScalarExpr::Binary {
            op: BinaryOp::And,
            left: Box::new(a.clone()),
            right: Box::new(b.clone()),
        };
        assert_eq!(eval_expr(&and(&null, &f), &[], &s).unwrap(), SqlValue::from_bool(false));
        assert_eq!(eval_expr(&and(&null, &t), &[], &s).unwrap(), SqlValue::Null);
        let or = |a: &ScalarExpr, b: &ScalarExpr| ScalarExpr::Binary {
            op: BinaryOp::Or,
            left: Box::new(a.clone()),
            right: Box::new(b.clone()),
        };
        assert_eq!(eval_expr(&or(&null, &t), &[], &s).unwrap(), SqlValue::from_bool(true));
        assert_eq!(eval_expr(&or(&null, &f), &[], &s).unwrap(), SqlValue::Null);
    }

    #[test]
    fn in_list_with_null_candidate() {
        let s = services();
        let expr = ScalarExpr::InList {
            expr: Box::new(ScalarExpr::Literal(SqlValue::Integer(9))),
            list: vec![
                ScalarExpr::Literal(SqlValue::Integer(1)),
                ScalarExpr::Literal(SqlValue::Null),
            ],
            negated: false,
        };
        assert_eq!(eval_expr(&expr, &[], &s).unwrap(), SqlValue::Null);
    }

    #[test]
    fn like_patterns() {
        assert!(like_match("al%", "Alice"));
        assert!(like_match("_ob", "bob"));
        assert!(!like_match("al%", "bob"));
        assert!(like_match("%", ""));
    }

    #[test]
    fn unbound_parameter_is_misuse() {
        let s = services();
        let err = eval_expr(&ScalarExpr::Param("?1".into()), &[], &s).unwrap_err();
        assert!(matches!(err, QuereusError::Misuse(_)));
    }

    #[test]
    fn case_searched_and_simple() {
        let s = services();
        let searched = ScalarExpr::Case {
            operand: None,
            branches: vec![(
                ScalarExpr::Literal(SqlValue::from_bool(false)),
                ScalarExpr::Literal(SqlValue::Integer(1)),
            )],
            otherwise: Some(Box::new(ScalarExpr::Literal(SqlValue::Integer(2)))),
        };
        assert_eq!(eval_expr(&searched, &[], &s).unwrap(), SqlValue::Integer(2));

        let simple = ScalarExpr::Case {
            operand: Some(Box::new(ScalarExpr::Literal(SqlValue::Text("b".into())))),
            branches: vec![
                (
                    ScalarExpr::Literal(SqlValue::Text("a".into())),
                    ScalarExpr::Literal(SqlValue::Integer(1)),
                ),
                (
                    ScalarExpr::Literal(SqlValue::Text("b".into())),
                    ScalarExpr::Literal(SqlValue::Integer(2)),
                ),
            ],
            otherwise: None,
        };
        assert_eq!(eval_expr(&simple, &[], &s).unwrap(), SqlValue::Integer(2));
    }
}
