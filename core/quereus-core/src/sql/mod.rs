//! The query pipeline: plan algebra and builder, rule-driven optimizer,
//! emission to an instruction DAG, and the scheduler that runs it.

pub mod executor;
pub mod optimizer;
pub mod planner;
