//! Data-driven execution of the instruction DAG.
//!
//! The scheduler linearizes the instruction tree in post-order during
//! construction and records each instruction's destination (its unique
//! consumer). Execution then walks the list in order, accumulating outputs
//! into destination argument slots. It stays purely synchronous until some
//! instruction yields a deferred value; from that point on it joins (forces)
//! all pending arguments, left to right, before each invocation: the
//! cooperative sync→async transition.
//!
//! With a tracer attached, row streams are wrapped once (idempotent, marked
//! by a sentinel) so every produced row fires a row hook, and input/output/
//! error hooks fire around each `run`. Metrics mode tallies executions,
//! elapsed time and argument/output cardinalities per instruction and logs
//! an aggregate line on completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{QuereusError, QuereusResult};
use crate::types::Row;

use super::expr::RuntimeServices;
use super::instruction::{Instruction, RowStream, RunFn, Value};

/// Observer of instruction execution and row production.
pub trait ExecTracer: Send + Sync {
    fn on_input(&self, instruction: usize, note: &str, argc: usize);
    fn on_output(&self, instruction: usize, note: &str, output: &Value);
    fn on_error(&self, instruction: usize, note: &str, error: &QuereusError);
    fn on_row(&self, instruction: usize, row_index: u64, row: &Row);
}

/// Per-instruction tallies collected in metrics mode.
#[derive(Debug, Default, Clone)]
pub struct InstructionMetrics {
    pub note: String,
    pub executions: u64,
    pub elapsed: Duration,
    pub input_rows: u64,
    pub output_rows: u64,
}

/// Tracks per-query context stacks (join and correlation contexts) and
/// warns (never errors) when something is left on them at end of query.
#[derive(Default)]
pub struct ContextTracker {
    depths: HashMap<&'static str, usize>,
}

impl ContextTracker {
    pub fn enter(&mut self, kind: &'static str) {
        *self.depths.entry(kind).or_insert(0) += 1;
    }

    pub fn exit(&mut self, kind: &'static str) {
        if let Some(depth) = self.depths.get_mut(kind) {
            *depth = depth.saturating_sub(1);
        }
    }

    fn finish(&mut self) {
        for (kind, depth) in self.depths.drain() {
            if depth > 0 {
                warn!(context = kind, depth, "residual context at end of query");
            }
        }
    }
}

/// Mutable execution state threaded through every `run` call.
pub struct ExecContext {
    pub services: RuntimeServices,
    pub tracer: Option<Arc<dyn ExecTracer>>,
    pub metrics: Option<Vec<InstructionMetrics>>,
    pub tracker: ContextTracker,
}

impl ExecContext {
    pub fn new(services: RuntimeServices) -> Self {
        Self {
            services,
            tracer: None,
            metrics: None,
            tracker: ContextTracker::default(),
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn ExecTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn with_metrics(mut self) -> Self {
        self.metrics = Some(Vec::new());
        self
    }

    pub fn take_metrics(&mut self) -> Option<Vec<InstructionMetrics>> {
        self.metrics.take()
    }
}

struct FlatInstruction {
    run: RunFn,
    note: String,
    /// Index of the unique consuming instruction, if any.
    dest: Option<usize>,
}

pub struct Scheduler;

impl Scheduler {
    /// Execute an instruction tree to completion and return the root value.
    /// A deferred root is forced before returning.
    pub fn execute(root: Instruction, ctx: &mut ExecContext) -> QuereusResult<Value> {
        let mut flat = Vec::new();
        flatten(root, &mut flat);

        if let Some(metrics) = &mut ctx.metrics {
            metrics.clear();
            metrics.extend(flat.iter().map(|f| InstructionMetrics {
                note: f.note.clone(),
                ..Default::default()
            }));
        }

        let mut slots: Vec<Vec<Value>> = (0..flat.len()).map(|_| Vec::new()).collect();
        let mut result = None;
        let mut async_mode = false;

        for index in 0..flat.len() {
            let mut args = std::mem::take(&mut slots[index]);

            // Once async, all pending arguments join before the call,
            // preserving left-to-right evaluation order.
            if async_mode {
                for arg in &mut args {
                    force_in_place(arg, ctx)?;
                }
            }

            let argc = args.len();
            if let Some(tracer) = &ctx.tracer {
                tracer.on_input(index, &flat[index].note, argc);
            }
            let input_size: u64 = args.iter().map(Value::metric_size).sum();

            let started = Instant::now();
            let output = (flat[index].run)(ctx, args);
            let elapsed = started.elapsed();

            let mut output = match output {
                Ok(output) => output,
                Err(error) => {
                    if let Some(tracer) = &ctx.tracer {
                        tracer.on_error(index, &flat[index].note, &error);
                    }
                    ctx.tracker.finish();
                    return Err(error);
                }
            };

            if matches!(output, Value::Deferred(_)) {
                async_mode = true;
            }

            // Row-level tracing wrapper, applied at most once per stream.
            if let (Some(tracer), Value::Rows(stream)) = (&ctx.tracer, &mut output)
                && !stream.traced
            {
                let inner = std::mem::replace(&mut stream.iter, Box::new(std::iter::empty()));
                *stream = RowStream {
                    iter: Box::new(TracedRows {
                        inner,
                        tracer: Arc::clone(tracer),
                        instruction: index,
                        produced: 0,
                    }),
                    traced: true,
                };
            }

            if let Some(tracer) = &ctx.tracer {
                tracer.on_output(index, &flat[index].note, &output);
            }
            if let Some(metrics) = &mut ctx.metrics {
                let m = &mut metrics[index];
                m.executions += 1;
                m.elapsed += elapsed;
                m.input_rows += input_size;
                m.output_rows += output.metric_size();
            }

            match flat[index].dest {
                Some(dest) => slots[dest].push(output),
                None => result = Some(output),
            }
        }

        ctx.tracker.finish();

        let mut result = result.ok_or_else(|| {
            QuereusError::Internal("instruction graph produced no result".into())
        })?;
        force_in_place(&mut result, ctx)?;

        if let Some(metrics) = &ctx.metrics {
            let total: Duration = metrics.iter().map(|m| m.elapsed).sum();
            debug!(
                instructions = metrics.len(),
                total_us = total.as_micros() as u64,
                "query execution metrics"
            );
        }
        Ok(result)
    }
}

/// Post-order flattening; children precede their consumer and learn its
/// index as their destination. Returns the instruction's own index; the
/// overall root keeps `dest: None`.
fn flatten(instruction: Instruction, flat: &mut Vec<FlatInstruction>) -> usize {
    let Instruction { params, run, note } = instruction;
    let child_roots: Vec<usize> = params.into_iter().map(|p| flatten(p, flat)).collect();
    let own_index = flat.len();
    flat.push(FlatInstruction {
        run,
        note,
        dest: None,
    });
    for root in child_roots {
        flat[root].dest = Some(own_index);
    }
    own_index
}

fn force_in_place(value: &mut Value, ctx: &mut ExecContext) -> QuereusResult<()> {
    while matches!(value, Value::Deferred(_)) {
        let Value::Deferred(thunk) = std::mem::replace(value, Value::Unit) else {
            unreachable!()
        };
        *value = (thunk.0)(ctx)?;
    }
    Ok(())
}

struct TracedRows {
    inner: super::instruction::RowSeq,
    tracer: Arc<dyn ExecTracer>,
    instruction: usize,
    produced: u64,
}

impl Iterator for TracedRows {
    type Item = QuereusResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        if let Ok(row) = &item {
            self.tracer.on_row(self.instruction, self.produced, row);
            self.produced += 1;
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CollationRegistry, FunctionRegistry};
    use crate::sql::executor::instruction::Thunk;
    use crate::types::SqlValue;
    use parking_lot::Mutex;

    fn ctx() -> ExecContext {
        ExecContext::new(RuntimeServices::new(
            Arc::new(FunctionRegistry::new()),
            Arc::new(CollationRegistry::new()),
        ))
    }

    fn lit(value: i64) -> Instruction {
        Instruction::leaf(
            format!("lit {value}"),
            Box::new(move |_, _| Ok(Value::Scalar(SqlValue::Integer(value)))),
        )
    }

    fn sum(params: Vec<Instruction>) -> Instruction {
        Instruction::with_params(
            "sum",
            params,
            Box::new(|_, args| {
                let mut total = 0i64;
                for arg in args {
                    match arg {
                        Value::Scalar(SqlValue::Integer(i)) => total += i,
                        other => panic!("unexpected arg {other:?}"),
                    }
                }
                Ok(Value::Scalar(SqlValue::Integer(total)))
            }),
        )
    }

    #[test]
    fn arguments_arrive_in_parameter_order() {
        let order: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let record = |value: i64, order: &Arc<Mutex<Vec<i64>>>| {
            let order = Arc::clone(order);
            Instruction::leaf(
                format!("rec {value}"),
                Box::new(move |_, _| {
                    order.lock().push(value);
                    Ok(Value::Scalar(SqlValue::Integer(value)))
                }),
            )
        };
        let root = sum(vec![
            record(1, &order),
            record(2, &order),
            record(3, &order),
        ]);
        let out = Scheduler::execute(root, &mut ctx()).unwrap();
        assert!(matches!(out, Value::Scalar(SqlValue::Integer(6))));
        assert_eq!(order.lock().clone(), vec![1, 2, 3]);
    }

    #[test]
    fn nested_trees_route_to_the_right_destinations() {
        let root = sum(vec![sum(vec![lit(1), lit(2)]), lit(10), sum(vec![lit(4)])]);
        let out = Scheduler::execute(root, &mut ctx()).unwrap();
        assert!(matches!(out, Value::Scalar(SqlValue::Integer(17))));
    }

    #[test]
    fn deferred_value_switches_to_async_and_joins_args() {
        // One deferred argument among immediate ones: the consumer must see
        // all of them forced, in order.
        let deferred = Instruction::leaf(
            "deferred 2",
            Box::new(|_, _| {
                Ok(Value::Deferred(Thunk(Box::new(|_| {
                    Ok(Value::Scalar(SqlValue::Integer(2)))
                }))))
            }),
        );
        let root = sum(vec![lit(1), deferred, lit(3)]);
        let out = Scheduler::execute(root, &mut ctx()).unwrap();
        assert!(matches!(out, Value::Scalar(SqlValue::Integer(6))));
    }

    #[test]
    fn deferred_root_is_forced() {
        let root = Instruction::leaf(
            "deferred root",
            Box::new(|_, _| {
                Ok(Value::Deferred(Thunk(Box::new(|_| {
                    Ok(Value::Scalar(SqlValue::Integer(9)))
                }))))
            }),
        );
        let out = Scheduler::execute(root, &mut ctx()).unwrap();
        assert!(matches!(out, Value::Scalar(SqlValue::Integer(9))));
    }

    #[test]
    fn chained_thunks_force_to_a_ground_value() {
        let root = Instruction::leaf(
            "double deferred",
            Box::new(|_, _| {
                Ok(Value::Deferred(Thunk(Box::new(|_| {
                    Ok(Value::Deferred(Thunk(Box::new(|_| {
                        Ok(Value::Scalar(SqlValue::Integer(5)))
                    }))))
                }))))
            }),
        );
        let out = Scheduler::execute(root, &mut ctx()).unwrap();
        assert!(matches!(out, Value::Scalar(SqlValue::Integer(5))));
    }

    struct CountingTracer {
        rows: Mutex<Vec<(usize, u64)>>,
        errors: Mutex<usize>,
    }

    impl ExecTracer for CountingTracer {
        fn on_input(&self, _: usize, _: &str, _: usize) {}
        fn on_output(&self, _: usize, _: &str, _: &Value) {}
        fn on_error(&self, _: usize, _: &str, _: &QuereusError) {
            *self.errors.lock() += 1;
        }
        fn on_row(&self, instruction: usize, row_index: u64, _: &Row) {
            self.rows.lock().push((instruction, row_index));
        }
    }

    #[test]
    fn tracer_sees_each_row_once() {
        let tracer = Arc::new(CountingTracer {
            rows: Mutex::new(Vec::new()),
            errors: Mutex::new(0),
        });
        let source = Instruction::leaf(
            "rows",
            Box::new(|_, _| {
                Ok(Value::rows(Box::new(
                    vec![vec![SqlValue::Integer(1)], vec![SqlValue::Integer(2)]]
                        .into_iter()
                        .map(Ok),
                )))
            }),
        );
        // Pass-through consumer returns the (already wrapped) stream.
        let root = Instruction::with_params(
            "pass",
            vec![source],
            Box::new(|_, mut args| Ok(args.pop().unwrap())),
        );
        let mut context = ctx().with_tracer(tracer.clone() as Arc<dyn ExecTracer>);
        let out = Scheduler::execute(root, &mut context).unwrap();
        let rows: Vec<Row> = out.into_rows().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        // wrapped once at the producing instruction, not re-wrapped by pass
        assert_eq!(tracer.rows.lock().clone(), vec![(0, 0), (0, 1)]);
    }

    #[test]
    fn error_fires_error_hook_and_propagates() {
        let tracer = Arc::new(CountingTracer {
            rows: Mutex::new(Vec::new()),
            errors: Mutex::new(0),
        });
        let root = Instruction::leaf(
            "boom",
            Box::new(|_, _| Err(QuereusError::Internal("boom".into()))),
        );
        let mut context = ctx().with_tracer(tracer.clone() as Arc<dyn ExecTracer>);
        assert!(Scheduler::execute(root, &mut context).is_err());
        assert_eq!(*tracer.errors.lock(), 1);
    }

    #[test]
    fn metrics_tally_executions() {
        let root = sum(vec![lit(1), lit(2)]);
        let mut context = ctx().with_metrics();
        Scheduler::execute(root, &mut context).unwrap();
        let metrics = context.take_metrics().unwrap();
        assert_eq!(metrics.len(), 3);
        assert!(metrics.iter().all(|m| m.executions == 1));
        let root_metrics = metrics.last().unwrap();
        assert_eq!(root_metrics.input_rows, 2);
        assert_eq!(root_metrics.output_rows, 1);
    }
}
