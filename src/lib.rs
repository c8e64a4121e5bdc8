//! debatemap core: clusters extracted debate statements ("points") into a
//! navigable hierarchical topic tree for a selectable filter window.
//!
//! Pipeline: filter -> per-job vector store (scratch files) -> recursive
//! mini-batch k-means partitioning -> persisted cluster tree, driven as an
//! asynchronous job. Finished trees are served through cursor-based
//! pagination over a cluster's member points.

pub mod config;
pub mod db;
pub mod embedding;
pub mod jobs;
pub mod paging;
pub mod partition;
pub mod run;
pub mod store;
pub mod tree;
