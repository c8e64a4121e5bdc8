mod models;
mod schema;

pub use models::{ClusterJob, ClusterNode, JobStatus, PagedPoints, PageMeta, Point};
pub use schema::{Database, NewCluster};
