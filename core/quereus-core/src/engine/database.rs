//! The `Database`: registry of modules and live table connections,
//! statement execution, and implicit-transaction orchestration.
//!
//! A statement batch of two or more statements without explicit transaction
//! control runs inside an implicit transaction: `begin` on every registered
//! connection, each statement in order, then commit on all, or rollback on
//! the first failure. A single autocommitting DML statement gets the same
//! treatment so its row loop is atomic. Connections registered while a
//! transaction is open join it immediately; disconnects during an implicit
//! transaction are deferred until it resolves.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{QuereusError, QuereusResult};
use crate::schema::{
    AggregateFactory, CollationFn, IndexSchema, ScalarFn, SchemaChangeSink, SchemaManager,
    TableFunction, TableSchema,
};
use crate::sql::executor::emit::EmissionContext;
use crate::sql::executor::expr::RuntimeServices;
use crate::sql::executor::instruction::Value;
use crate::sql::executor::scheduler::{ExecContext, Scheduler};
use crate::sql::optimizer::{Optimizer, OptimizerContext, TableResolver};
use crate::sql::planner::builder::{BuiltStatement, PlanBuilder, PlanningContext, parse_sql};
use crate::sql::planner::types::PlanNode;
use crate::storage::MemoryStoreProvider;
use crate::vtab::module::{VirtualTable, VirtualTableConnection, VtabModule};
use crate::vtab::store::StoreModule;

use super::options::{ColumnNullability, Options};
use super::statement::{Params, Statement};

#[derive(Default)]
struct TxState {
    in_transaction: bool,
    in_implicit_transaction: bool,
    /// SAVEPOINT names in creation order; the index is the depth.
    savepoints: Vec<String>,
}

struct CachedPlan {
    plan: PlanNode,
    dep_keys: Vec<String>,
}

#[derive(Default)]
struct PlanCache {
    map: DashMap<String, Arc<CachedPlan>>,
}

impl PlanCache {
    fn get(&self, key: &str) -> Option<Arc<CachedPlan>> {
        self.map.get(key).map(|e| e.value().clone())
    }

    fn insert(&self, key: String, plan: PlanNode, dep_keys: Vec<String>) {
        self.map.insert(key, Arc::new(CachedPlan { plan, dep_keys }));
    }

    /// Evict every plan depending on the changed object.
    fn evict_for(&self, schema_name: &str, object_name: &str) {
        let needle = format!("table:{schema_name}.{object_name}");
        self.map
            .retain(|_, cached| !cached.dep_keys.iter().any(|k| k == &needle));
    }

    fn remove(&self, key: &str) {
        self.map.remove(key);
    }
}

pub struct Database {
    schema: Arc<SchemaManager>,
    options: Options,
    optimizer: Optimizer,
    modules: DashMap<String, Arc<dyn VtabModule>>,
    tables: DashMap<(String, String), Arc<dyn VirtualTable>>,
    connections: DashMap<Uuid, Arc<dyn VirtualTableConnection>>,
    deferred_unregister: Mutex<Vec<Uuid>>,
    plan_cache: Arc<PlanCache>,
    tx: Mutex<TxState>,
    closed: AtomicBool,
}

impl Database {
    pub fn new() -> Arc<Self> {
        let schema = Arc::new(SchemaManager::new());
        let plan_cache = Arc::new(PlanCache::default());

        // Plan-cache invalidation rides the schema-change bus.
        let eviction_cache = Arc::clone(&plan_cache);
        schema.subscribe(Arc::new(move |event| {
            eviction_cache.evict_for(&event.schema_name, &event.object_name);
        }));

        let db = Arc::new(Self {
            modules: DashMap::new(),
            tables: DashMap::new(),
            connections: DashMap::new(),
            deferred_unregister: Mutex::new(Vec::new()),
            plan_cache,
            tx: Mutex::new(TxState::default()),
            closed: AtomicBool::new(false),
            options: Options::new(),
            optimizer: Optimizer::new(),
            schema,
        });

        // The bundled in-memory module is the default backing for tables.
        let memory = StoreModule::new(
            Arc::new(MemoryStoreProvider::new()),
            Arc::clone(&db.schema.collations),
        );
        db.register_vtab_module("memory", Arc::new(memory));
        db
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn schema_manager(&self) -> &Arc<SchemaManager> {
        &self.schema
    }

    pub fn set_option(&self, name: &str, value: serde_json::Value) -> QuereusResult<()> {
        self.options.set(name, value)
    }

    // ===== registration =====

    pub fn register_vtab_module(&self, name: &str, module: Arc<dyn VtabModule>) {
        // Module-originated storage changes also invalidate cached plans.
        let cache = Arc::clone(&self.plan_cache);
        module.set_change_sink(Arc::new(move |event| {
            debug!(kind = ?event.kind, object = %event.object_name, "vtab schema change");
            cache.evict_for(&event.schema_name, &event.object_name);
        }));
        self.modules.insert(name.to_lowercase(), module);
    }

    pub fn register_collation(&self, name: &str, compare: CollationFn) {
        self.schema.collations.register(name, compare);
    }

    pub fn create_scalar_function(&self, name: &str, num_args: i32, func: ScalarFn) {
        self.schema.functions.register_scalar(name, num_args, func);
    }

    pub fn create_aggregate_function(&self, name: &str, num_args: i32, factory: AggregateFactory) {
        self.schema.functions.register_aggregate(name, num_args, factory);
    }

    pub fn register_table_function(&self, function: TableFunction) {
        self.schema.functions.register_table_function(function);
    }

    pub fn on_schema_change(&self, sink: SchemaChangeSink) {
        self.schema.subscribe(sink);
    }

    // ===== table/connection registry =====

    fn module(&self, name: &str) -> QuereusResult<Arc<dyn VtabModule>> {
        self.modules
            .get(&name.to_lowercase())
            .map(|e| e.value().clone())
            .ok_or(QuereusError::Resolve {
                kind: "module",
                name: name.to_string(),
            })
    }

    /// The live instance for a table, connecting (and registering its
    /// connection) on first use.
    pub fn table_instance(
        &self,
        schema_name: &str,
        table_name: &str,
    ) -> QuereusResult<Arc<dyn VirtualTable>> {
        let key = (schema_name.to_lowercase(), table_name.to_lowercase());
        if let Some(instance) = self.tables.get(&key) {
            return Ok(instance.value().clone());
        }
        let current = self.schema.lookup_table(Some(schema_name), table_name)?;
        let module = self.module(&current.module_name)?;
        let instance = module.connect(current)?;
        self.register_connection(instance.connection()?)?;
        self.tables.insert(key, Arc::clone(&instance));
        Ok(instance)
    }

    /// Register a connection; if a transaction is open it joins mid-flight.
    fn register_connection(
        &self,
        connection: Arc<dyn VirtualTableConnection>,
    ) -> QuereusResult<()> {
        let joins_transaction = self.tx.lock().in_transaction;
        if joins_transaction {
            connection.begin()?;
        }
        self.connections.insert(connection.id(), connection);
        Ok(())
    }

    /// Unregister by id; deferred while an implicit transaction is open.
    pub fn unregister_connection(&self, id: Uuid) {
        if self.tx.lock().in_implicit_transaction {
            self.deferred_unregister.lock().push(id);
        } else {
            self.connections.remove(&id);
        }
    }

    fn process_deferred_unregisters(&self) {
        for id in self.deferred_unregister.lock().drain(..) {
            self.connections.remove(&id);
        }
    }

    fn begin_all(&self) -> QuereusResult<()> {
        for entry in self.connections.iter() {
            entry.value().begin()?;
        }
        Ok(())
    }

    fn commit_all(&self) -> QuereusResult<()> {
        let connections: Vec<_> = self.connections.iter().map(|e| e.value().clone()).collect();
        let mut first_error = None;
        for connection in &connections {
            if let Err(err) = connection.commit() {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            None => Ok(()),
            Some(err) => {
                // A failed commit aborts whatever has not committed yet.
                for connection in &connections {
                    let _ = connection.rollback();
                }
                Err(err)
            }
        }
    }

    fn rollback_all(&self) {
        for entry in self.connections.iter() {
            let _ = entry.value().rollback();
        }
    }

    // ===== explicit transactions =====

    pub fn begin_transaction(&self) -> QuereusResult<()> {
        {
            let mut tx = self.tx.lock();
            if tx.in_transaction {
                return Err(QuereusError::Misuse(
                    "a transaction is already active".into(),
                ));
            }
            tx.in_transaction = true;
        }
        self.begin_all()
    }

    pub fn commit(&self) -> QuereusResult<()> {
        if !self.tx.lock().in_transaction {
            return Err(QuereusError::Misuse("no transaction is active".into()));
        }
        let result = self.commit_all();
        let mut tx = self.tx.lock();
        tx.in_transaction = false;
        tx.in_implicit_transaction = false;
        tx.savepoints.clear();
        drop(tx);
        self.process_deferred_unregisters();
        result
    }

    pub fn rollback(&self) -> QuereusResult<()> {
        if !self.tx.lock().in_transaction {
            return Err(QuereusError::Misuse("no transaction is active".into()));
        }
        self.rollback_all();
        let mut tx = self.tx.lock();
        tx.in_transaction = false;
        tx.in_implicit_transaction = false;
        tx.savepoints.clear();
        drop(tx);
        self.process_deferred_unregisters();
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.lock().in_transaction
    }

    pub fn is_autocommit(&self) -> bool {
        !self.in_transaction()
    }

    pub fn savepoint(&self, name: &str) -> QuereusResult<()> {
        // SAVEPOINT outside a transaction opens one.
        if !self.tx.lock().in_transaction {
            self.begin_transaction()?;
        }
        let depth = {
            let mut tx = self.tx.lock();
            let depth = tx.savepoints.len() as u32;
            tx.savepoints.push(name.to_lowercase());
            depth
        };
        for entry in self.connections.iter() {
            entry.value().create_savepoint(depth)?;
        }
        Ok(())
    }

    pub fn rollback_to_savepoint(&self, name: &str) -> QuereusResult<()> {
        let depth = self.savepoint_depth(name)?;
        for entry in self.connections.iter() {
            entry.value().rollback_to_savepoint(depth)?;
        }
        // The savepoint itself survives a rollback to it.
        self.tx.lock().savepoints.truncate(depth as usize + 1);
        Ok(())
    }

    pub fn release_savepoint(&self, name: &str) -> QuereusResult<()> {
        let depth = self.savepoint_depth(name)?;
        for entry in self.connections.iter() {
            entry.value().release_savepoint(depth)?;
        }
        self.tx.lock().savepoints.truncate(depth as usize);
        Ok(())
    }

    fn savepoint_depth(&self, name: &str) -> QuereusResult<u32> {
        let needle = name.to_lowercase();
        self.tx
            .lock()
            .savepoints
            .iter()
            .rposition(|s| *s == needle)
            .map(|d| d as u32)
            .ok_or_else(|| QuereusError::NotFound(format!("savepoint {name}")))
    }

    // ===== statement execution =====

    pub fn prepare(self: &Arc<Self>, sql: &str) -> Statement {
        Statement::new(Arc::clone(self), sql)
    }

    /// Execute a batch. Two or more statements without explicit transaction
    /// control run inside one implicit transaction. Returns the number of
    /// rows affected by DML statements.
    pub fn exec(self: &Arc<Self>, sql: &str, params: impl Into<Params>) -> QuereusResult<u64> {
        self.check_open()?;
        let params = params.into();
        let statements = parse_sql(sql)?;
        let built: Vec<(BuiltStatement, String)> = {
            let planning = self.planning_context();
            let mut builder = PlanBuilder::new(&planning);
            statements
                .iter()
                .map(|s| Ok((builder.build_statement(s)?, s.to_string())))
                .collect::<QuereusResult<_>>()?
        };

        let implicit = built.len() >= 2
            && !built.iter().any(|(s, _)| is_transaction_control(s))
            && !self.in_transaction();
        if implicit {
            let mut tx = self.tx.lock();
            tx.in_transaction = true;
            tx.in_implicit_transaction = true;
            drop(tx);
            self.begin_all()?;
        }

        let mut affected = 0u64;
        for (statement, key) in built {
            match self.run_built(&statement, Some(&key), &params) {
                Ok(value) => {
                    affected += drain_value(value)?;
                }
                Err(err) => {
                    if implicit {
                        self.rollback_all();
                        let mut tx = self.tx.lock();
                        tx.in_transaction = false;
                        tx.in_implicit_transaction = false;
                        tx.savepoints.clear();
                        drop(tx);
                        self.process_deferred_unregisters();
                    }
                    return Err(err);
                }
            }
        }

        if implicit {
            let result = self.commit_all();
            let mut tx = self.tx.lock();
            tx.in_transaction = false;
            tx.in_implicit_transaction = false;
            tx.savepoints.clear();
            drop(tx);
            self.process_deferred_unregisters();
            result?;
        }
        Ok(affected)
    }

    /// Run a single query and return its rows lazily.
    pub fn eval(
        self: &Arc<Self>,
        sql: &str,
        params: impl Into<Params>,
    ) -> QuereusResult<crate::vtab::module::RowIter> {
        self.check_open()?;
        let params = params.into();
        let statements = parse_sql(sql)?;
        let [statement] = statements.as_slice() else {
            return Err(QuereusError::Misuse(
                "eval expects exactly one statement".into(),
            ));
        };
        let planning = self.planning_context();
        let built = PlanBuilder::new(&planning).build_statement(statement)?;
        let value = self.run_built(&built, Some(&statement.to_string()), &params)?;
        match value {
            Value::Rows(stream) => Ok(stream.iter),
            other => {
                drain_value(other)?;
                Ok(Box::new(std::iter::empty()))
            }
        }
    }

    pub fn close(&self) -> QuereusResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.in_transaction() {
            self.rollback_all();
            let mut tx = self.tx.lock();
            tx.in_transaction = false;
            tx.in_implicit_transaction = false;
            tx.savepoints.clear();
        }
        for entry in self.tables.iter() {
            let _ = entry.value().disconnect();
        }
        self.tables.clear();
        self.connections.clear();
        Ok(())
    }

    fn check_open(&self) -> QuereusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(QuereusError::Misuse("database is closed".into()))
        } else {
            Ok(())
        }
    }

    pub(crate) fn planning_context(&self) -> PlanningContext {
        PlanningContext {
            schema: Arc::clone(&self.schema),
            default_nullable: self.options.default_column_nullability()
                == ColumnNullability::Nullable,
            default_vtab_module: self.options.default_vtab_module(),
        }
    }

    pub(crate) fn resolver(self: &Arc<Self>) -> TableResolver {
        let db = Arc::clone(self);
        Arc::new(move |table: &TableSchema| db.table_instance(&table.schema_name, &table.name))
    }

    /// Optimize (with plan-cache reuse), emit, validate and execute one
    /// built statement.
    pub(crate) fn run_built(
        self: &Arc<Self>,
        statement: &BuiltStatement,
        cache_key: Option<&str>,
        params: &Params,
    ) -> QuereusResult<Value> {
        self.check_open()?;
        match statement {
            BuiltStatement::Plan(plan) => {
                let (plan, from_cache) = self.optimized_plan(plan, cache_key)?;

                let mut emission =
                    EmissionContext::new(Arc::clone(&self.schema), self.resolver());
                let instruction = emission.emit(&plan)?;
                if let Err(err) = emission.validate_captured_schema_objects() {
                    if from_cache && let Some(key) = cache_key {
                        self.plan_cache.remove(key);
                    }
                    return Err(err);
                }
                if let Some(key) = cache_key
                    && !from_cache
                {
                    let dep_keys = emission.dependencies().iter().map(|d| d.key()).collect();
                    self.plan_cache.insert(key.to_string(), plan.clone(), dep_keys);
                }

                // A lone autocommitting DML statement still runs atomically.
                let auto_tx = contains_dml(&plan) && !self.in_transaction();
                if auto_tx {
                    let mut tx = self.tx.lock();
                    tx.in_transaction = true;
                    tx.in_implicit_transaction = true;
                    drop(tx);
                    self.begin_all()?;
                }

                let subquery = emission.subquery_runner();
                let mut services = RuntimeServices::new(
                    Arc::clone(&self.schema.functions),
                    Arc::clone(&self.schema.collations),
                )
                .with_params(params.0.clone());
                services.subquery = Some(subquery);
                let mut context = ExecContext::new(services);
                if self.options.runtime_stats() {
                    context = context.with_metrics();
                }

                let result = Scheduler::execute(instruction, &mut context);

                if auto_tx {
                    let outcome = match &result {
                        Ok(_) => self.commit_all(),
                        Err(_) => {
                            self.rollback_all();
                            Ok(())
                        }
                    };
                    let mut tx = self.tx.lock();
                    tx.in_transaction = false;
                    tx.in_implicit_transaction = false;
                    tx.savepoints.clear();
                    drop(tx);
                    self.process_deferred_unregisters();
                    outcome?;
                }
                result
            }
            BuiltStatement::CreateTable {
                schema,
                if_not_exists,
            } => {
                self.ddl_create_table(schema.clone(), *if_not_exists)?;
                Ok(Value::Unit)
            }
            BuiltStatement::CreateIndex {
                schema_name,
                table_name,
                index,
            } => {
                self.ddl_create_index(schema_name.as_deref(), table_name, index)?;
                Ok(Value::Unit)
            }
            BuiltStatement::DropTable {
                schema_name,
                table_name,
                if_exists,
            } => {
                self.ddl_drop_table(schema_name.as_deref(), table_name, *if_exists)?;
                Ok(Value::Unit)
            }
            BuiltStatement::Begin(_mode) => {
                self.begin_transaction()?;
                Ok(Value::Unit)
            }
            BuiltStatement::Commit => {
                self.commit()?;
                Ok(Value::Unit)
            }
            BuiltStatement::Rollback => {
                self.rollback()?;
                Ok(Value::Unit)
            }
            BuiltStatement::RollbackToSavepoint(name) => {
                self.rollback_to_savepoint(name)?;
                Ok(Value::Unit)
            }
            BuiltStatement::Savepoint(name) => {
                self.savepoint(name)?;
                Ok(Value::Unit)
            }
            BuiltStatement::ReleaseSavepoint(name) => {
                self.release_savepoint(name)?;
                Ok(Value::Unit)
            }
        }
    }

    pub(crate) fn explain_plan(self: &Arc<Self>, plan: &PlanNode) -> QuereusResult<String> {
        let (optimized, _) = self.optimized_plan(plan, None)?;
        Ok(optimized.explain())
    }

    fn optimized_plan(
        self: &Arc<Self>,
        plan: &PlanNode,
        cache_key: Option<&str>,
    ) -> QuereusResult<(PlanNode, bool)> {
        if let Some(key) = cache_key
            && let Some(cached) = self.plan_cache.get(key)
        {
            return Ok((cached.plan.clone(), true));
        }
        let ctx = OptimizerContext {
            resolve_table: self.resolver(),
            validate: self.options.validate_plan(),
        };
        let optimized = self.optimizer.optimize(plan.clone(), &ctx)?;
        if self.options.trace_plan_stack() {
            debug!(plan = %optimized.explain(), "optimized plan");
        }
        Ok((optimized, false))
    }

    // ===== DDL =====

    fn ddl_create_table(&self, mut schema: TableSchema, if_not_exists: bool) -> QuereusResult<()> {
        if schema.module_args.is_null() {
            schema.module_args = self.options.default_vtab_args();
        }
        if self
            .schema
            .lookup_table(Some(&schema.schema_name), &schema.name)
            .is_ok()
        {
            if if_not_exists {
                return Ok(());
            }
            return Err(QuereusError::Misuse(format!(
                "table {}.{} already exists",
                schema.schema_name, schema.name
            )));
        }
        let module = self.module(&schema.module_name)?;
        let registered = self.schema.register_table(schema)?;
        let instance = module.create(Arc::clone(&registered))?;
        self.register_connection(instance.connection()?)?;
        self.tables.insert(
            (
                registered.schema_name.to_lowercase(),
                registered.name.to_lowercase(),
            ),
            instance,
        );
        Ok(())
    }

    fn ddl_create_index(
        &self,
        schema_name: Option<&str>,
        table_name: &str,
        index: &IndexSchema,
    ) -> QuereusResult<()> {
        let table = self.schema.lookup_table(schema_name, table_name)?;
        // Make sure a live instance exists so the module can backfill, and
        // remember its connection id; the backfill retires the instance.
        let connection_id = self
            .table_instance(&table.schema_name, table_name)?
            .connection()?
            .id();
        let module = self.module(&table.module_name)?;
        module.create_index(&table.schema_name, table_name, index)?;

        // The module dropped its live instance; retire ours too.
        let key = (table.schema_name.to_lowercase(), table_name.to_lowercase());
        if self.tables.remove(&key).is_some() {
            self.unregister_connection(connection_id);
        }
        self.schema
            .add_index(schema_name, table_name, index.clone())?;
        Ok(())
    }

    fn ddl_drop_table(
        &self,
        schema_name: Option<&str>,
        table_name: &str,
        if_exists: bool,
    ) -> QuereusResult<()> {
        let table = match self.schema.lookup_table(schema_name, table_name) {
            Ok(table) => table,
            Err(_) if if_exists => return Ok(()),
            Err(err) => return Err(err),
        };
        let key = (table.schema_name.to_lowercase(), table_name.to_lowercase());
        if let Some((_, instance)) = self.tables.remove(&key) {
            self.unregister_connection(instance.connection()?.id());
        }
        let module = self.module(&table.module_name)?;
        self.schema.drop_table(schema_name, table_name)?;
        module.destroy(&table.schema_name, &table.name)?;
        Ok(())
    }
}

fn is_transaction_control(statement: &BuiltStatement) -> bool {
    matches!(
        statement,
        BuiltStatement::Begin(_)
            | BuiltStatement::Commit
            | BuiltStatement::Rollback
            | BuiltStatement::RollbackToSavepoint(_)
            | BuiltStatement::Savepoint(_)
            | BuiltStatement::ReleaseSavepoint(_)
    )
}

pub(crate) fn contains_dml(plan: &PlanNode) -> bool {
    match plan {
        PlanNode::Insert { .. } | PlanNode::Update { .. } | PlanNode::Delete { .. } => true,
        PlanNode::Block { statements } => statements.iter().any(contains_dml),
        _ => false,
    }
}

/// Drain a statement result to its affected count; lazy rows are consumed
/// so their effects happen.
pub(crate) fn drain_value(value: Value) -> QuereusResult<u64> {
    match value {
        Value::Affected(n) => Ok(n),
        Value::Rows(stream) => {
            for row in stream.iter {
                row?;
            }
            Ok(0)
        }
        _ => Ok(0),
    }
}

