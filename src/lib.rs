//! Umbra: the versioned posting-list storage core of a graph database.
//!
//! Posting lists hold the values and edges of one key under multi-version
//! concurrency control. Transactions stage writes in per-list layers, the
//! [`txn::Oracle`] arbitrates commits, and the [`index`] module keeps token,
//! reverse, count and uniqueness indexes in step with data and schema.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod db;
pub mod index;
pub mod posting;
pub mod primitives;
pub mod schema;
pub mod storage;
pub mod tok;
pub mod txn;
pub mod types;

pub use db::{Engine, EngineConfig, GcStats};
pub use index::{IndexOp, IndexRebuild, TokIndexRebuildInfo};
pub use posting::{DirectedEdge, Posting, PostingOp};
pub use primitives::concurrency::CancelToken;
pub use schema::SchemaDescriptor;
pub use types::{Attr, Result, Ts, Uid, UmbraError, Value, ValueType};
