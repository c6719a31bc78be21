//! Per-table transaction state: buffered writes, savepoints and at-commit
//! event delivery.

pub mod coordinator;

pub use coordinator::{
    ChangeEvent, ChangeKind, EventSink, TransactionCoordinator, TxHook, merge_with_pending,
};
