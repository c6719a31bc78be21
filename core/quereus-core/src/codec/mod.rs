//! Persistent byte layouts: the order-preserving key codec and the
//! self-describing row/stats codec.
//!
//! These formats are binding interfaces: bytes produced here must be
//! byte-compatible across KV backends so that data written by one backend
//! and read by another still sorts correctly.

pub mod key;
pub mod row;

pub use key::{
    DATA_PREFIX, IDX_PREFIX, KEY_SEP, KeyEncodingOptions, ScanBounds, build_data_key,
    build_index_key, build_meta_key, build_meta_scan_bounds, data_scan_bounds, encode_composite,
    index_prefix_bounds, prefix_successor, split_index_key,
};
pub use row::{StatsRecord, deserialize_row, deserialize_stats, serialize_row, serialize_stats};
