#![warn(clippy::todo)]
#![deny(
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    rustdoc::private_intra_doc_links,
    rust_2018_idioms,
    missing_docs,
    clippy::needless_borrow,
    clippy::redundant_clone,
    missing_debug_implementations
)]

//! # Stratum
//!
//! `Stratum` is the aggregation layer of a block based query engine. Workers aggregate
//! the blocks of a relation concurrently into the shared [`AggregationOperationState`],
//! grouped aggregation runs on concurrent hash tables whose keys are encoded by the
//! key codec.
//!
//! [`AggregationOperationState`]: storage::aggregation_operation_state::AggregationOperationState

pub mod catalog;
pub mod common;
pub mod expressions;
pub mod metric;
pub mod proto;
pub mod storage;

mod private {
    /// Sealed trait protect against downstream implementations
    pub trait Sealed {}
}
