//! Virtual-table substrate: the module contract, access planning, and the
//! generic KV-backed [`store::StoreTable`].

pub mod access_plan;
pub mod module;
pub mod store;

pub use access_plan::{
    BestAccessPlanRequest, BestAccessPlanResult, CandidateIndex, ConstraintOp, FilterConstraint,
    OrderingSpec, PRIMARY_INDEX, choose_best_access, validate_access_plan,
};
pub use module::{
    ConflictPolicy, DmlOp, FilterInfo, RowIter, UpdateArgs, VirtualTable,
    VirtualTableConnection, VtabModule,
};
pub use store::{StoreModule, StoreTable};
