use serde::{Deserialize, Serialize};

/// Lifecycle state of an asynchronous tree-build job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Complete,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "complete" => Some(JobStatus::Complete),
            "failed" => Some(JobStatus::Failed),
            "aborted" => Some(JobStatus::Aborted),
            _ => None,
        }
    }

    /// Queued and running jobs cannot survive a restart; the worker pool is
    /// process-local, so finding one at startup means it was abandoned.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

/// An extracted statement. Vectors are stored on the row (full-precision
/// f32 blob plus its f16 image) but never loaded into this struct; the
/// store and paging layers read them directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point {
    #[serde(rename = "pointId")]
    pub point_id: i64,
    pub text: String,
    #[serde(rename = "memberId")]
    pub member_id: Option<i64>,
    pub house: Option<String>,
    /// Debate date, `YYYY-MM-DD`.
    pub date: Option<String>,
}

/// A persisted topic-tree node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    #[serde(rename = "clusterId")]
    pub cluster_id: i64,
    #[serde(rename = "parentClusterId")]
    pub parent_cluster_id: Option<i64>,
    pub title: Option<String>,
    pub summary: Option<String>,
    /// 0 at the root, parent depth + 1 below.
    pub depth: u32,
    /// Filters shared by the whole tree, canonical JSON.
    pub filters: String,
    /// Config shared by the whole tree, canonical JSON.
    pub config: String,
    #[serde(rename = "jobId")]
    pub job_id: i64,
    /// Flips false -> true exactly once, when the owning job completes.
    pub visible: bool,
    /// Representative vector (embedded title), f32 little-endian blob.
    /// Drives semantic paging order when present.
    #[serde(skip)]
    pub centre: Option<Vec<u8>>,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// A tree-build job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterJob {
    #[serde(rename = "jobId")]
    pub job_id: i64,
    pub status: JobStatus,
    /// Canonical (filters, config) JSON, the dedup key.
    pub params: String,
    pub error: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "startedAt")]
    pub started_at: Option<i64>,
    #[serde(rename = "finishedAt")]
    pub finished_at: Option<i64>,
}

/// Cursor metadata for one page of cluster members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageMeta {
    /// Set iff a full page was returned; anchor for the next page.
    #[serde(rename = "nextCursor")]
    pub next_cursor: Option<i64>,
    /// First item's id on a non-empty page; anchor for the previous page.
    #[serde(rename = "prevCursor")]
    pub prev_cursor: Option<i64>,
    #[serde(rename = "totalCount")]
    pub total_count: i64,
}

/// One page of a cluster's member points, always ascending in the active
/// order (chronological or semantic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagedPoints {
    pub data: Vec<Point>,
    pub meta: PageMeta,
}
