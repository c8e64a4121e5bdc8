//! Asynchronous job lifecycle: submission with dedup, a bounded worker
//! pool, the atomic visibility commit, and the startup purge.
//!
//! At most two builds run at once; submissions beyond that wait on the
//! semaphore in queued state. An identical in-flight (filters, config) pair
//! is never queued twice, the existing job id is returned instead.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;

use crate::config::JobParams;
use crate::db::{Database, JobStatus};
use crate::embedding::{Embedder, Labeller};
use crate::run::run_clustering;
use crate::store::cleanup_store;

/// Builds running at once, process-wide.
const MAX_CONCURRENT_JOBS: usize = 2;

/// Status view returned to callers polling a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    #[serde(rename = "jobId")]
    pub job_id: i64,
    pub status: JobStatus,
    pub error: Option<String>,
    /// Set once the job is complete and produced a tree.
    #[serde(rename = "rootClusterId")]
    pub root_cluster_id: Option<i64>,
}

pub struct JobPool {
    db: Arc<Database>,
    scratch_dir: PathBuf,
    semaphore: Arc<Semaphore>,
    embedder: Option<Arc<dyn Embedder>>,
    labeller: Option<Arc<dyn Labeller>>,
}

impl JobPool {
    pub fn new(
        db: Arc<Database>,
        scratch_dir: PathBuf,
        embedder: Option<Arc<dyn Embedder>>,
        labeller: Option<Arc<dyn Labeller>>,
    ) -> Self {
        Self {
            db,
            scratch_dir,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_JOBS)),
            embedder,
            labeller,
        }
    }

    /// Queue a build, or return the id of an identical in-flight one.
    /// The returned job starts queued; poll [`Self::job_status`].
    pub fn submit(&self, params: &JobParams) -> Result<i64, String> {
        params.validate()?;
        let params_json = params.canonical_json()?;

        let (job_id, created) = self
            .db
            .create_job_if_absent(&params_json)
            .map_err(|e| e.to_string())?;
        if !created {
            println!("[Jobs] Identical job {} already in flight, reusing", job_id);
            return Ok(job_id);
        }
        println!("[Jobs] Queued job {}", job_id);

        let db = Arc::clone(&self.db);
        let semaphore = Arc::clone(&self.semaphore);
        let scratch_dir = self.scratch_dir.clone();
        let embedder = self.embedder.clone();
        let labeller = self.labeller.clone();
        let params = params.clone();

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return, // pool dropped, process is going down
            };
            if let Err(e) = db.set_job_running(job_id) {
                eprintln!("[Jobs] Job {}: could not mark running: {}", job_id, e);
                return;
            }

            let worker_db = Arc::clone(&db);
            let outcome = tokio::task::spawn_blocking(move || {
                run_clustering(
                    &worker_db,
                    &scratch_dir,
                    &params,
                    job_id,
                    embedder.as_deref(),
                    labeller.as_deref(),
                )
            })
            .await;

            match outcome {
                Ok(Ok(root)) => match db.finalise_job(job_id) {
                    Ok(()) => match root {
                        Some(root) => println!("[Jobs] Job {} complete, root {}", job_id, root),
                        None => println!("[Jobs] Job {} complete, no matching points", job_id),
                    },
                    Err(e) => {
                        eprintln!("[Jobs] Job {}: finalise failed: {}", job_id, e);
                        let _ = db.set_job_failed(job_id, &e.to_string());
                    }
                },
                Ok(Err(e)) => {
                    eprintln!("[Jobs] Job {} failed: {}", job_id, e);
                    let _ = db.set_job_failed(job_id, &e);
                }
                Err(e) => {
                    // worker panicked; the job must not stay in flight
                    eprintln!("[Jobs] Job {} worker panicked: {}", job_id, e);
                    let _ = db.set_job_failed(job_id, &e.to_string());
                }
            }
        });

        Ok(job_id)
    }

    pub fn job_status(&self, job_id: i64) -> Result<Option<JobReport>, String> {
        let job = match self.db.get_job(job_id).map_err(|e| e.to_string())? {
            Some(job) => job,
            None => return Ok(None),
        };
        let root_cluster_id = if job.status == JobStatus::Complete {
            self.db.find_root_cluster(job_id).map_err(|e| e.to_string())?
        } else {
            None
        };
        Ok(Some(JobReport {
            job_id: job.job_id,
            status: job.status,
            error: job.error,
            root_cluster_id,
        }))
    }

    /// Startup sweep: delete every queued or running job left by a previous
    /// process, together with its nodes, memberships and scratch files.
    /// Call before accepting submissions.
    pub fn purge_stale_jobs(&self) -> Result<usize, String> {
        let stale = self.db.in_flight_job_ids().map_err(|e| e.to_string())?;
        for &job_id in &stale {
            println!("[Jobs] Purging abandoned job {}", job_id);
            self.db.delete_job_cascade(job_id).map_err(|e| e.to_string())?;
            cleanup_store(&self.scratch_dir, job_id);
        }
        Ok(stale.len())
    }
}
