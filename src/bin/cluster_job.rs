//! Run one clustering job to completion against a debatemap database.
//!
//! Synchronous: purges jobs abandoned by a previous process, queues a job
//! for the given filters, runs it in the foreground and finalises it.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;

use debatemap::config::{ClusterConfig, JobParams, PointFilter};
use debatemap::db::Database;
use debatemap::jobs::JobPool;
use debatemap::run::run_clustering;

#[derive(Parser)]
#[command(name = "debatemap-cluster", about = "Build a topic tree for a window of debate points")]
struct Args {
    /// SQLite database path
    #[arg(long)]
    db: PathBuf,

    /// Directory for per-job scratch files
    #[arg(long, default_value = ".")]
    scratch_dir: PathBuf,

    /// Earliest debate date, YYYY-MM-DD inclusive
    #[arg(long)]
    start_date: Option<String>,

    /// Latest debate date, YYYY-MM-DD inclusive
    #[arg(long)]
    end_date: Option<String>,

    /// Restrict to one house
    #[arg(long)]
    house: Option<String>,

    /// Restrict to these member ids, comma separated
    #[arg(long, value_delimiter = ',')]
    member_ids: Option<Vec<i64>>,

    /// Depth at which recursion stops (root is 0)
    #[arg(long, default_value_t = 2)]
    max_depth: u32,

    /// Subsets smaller than this become leaves
    #[arg(long, default_value_t = 3)]
    min_points: usize,

    /// Group count below the root
    #[arg(long, default_value_t = 3)]
    n_clusters: usize,

    /// Group count at the root
    #[arg(long, default_value_t = 5)]
    n_clusters_base: usize,
}

fn main() {
    if let Err(e) = run(Args::parse()) {
        eprintln!("[Cluster] {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), String> {
    let db = Arc::new(Database::new(&args.db).map_err(|e| e.to_string())?);

    let pool = JobPool::new(Arc::clone(&db), args.scratch_dir.clone(), None, None);
    let purged = pool.purge_stale_jobs()?;
    if purged > 0 {
        println!("[Cluster] Purged {} abandoned jobs", purged);
    }

    let params = JobParams {
        filters: PointFilter {
            start_date: args.start_date,
            end_date: args.end_date,
            house: args.house,
            member_ids: args.member_ids,
            query: None,
        },
        config: ClusterConfig {
            max_depth: args.max_depth,
            min_points: args.min_points,
            n_clusters: args.n_clusters,
            n_clusters_base: args.n_clusters_base,
            // No labelling collaborators are wired up here
            skip_llm: true,
            search: false,
            search_limit: None,
        },
    };
    params.validate()?;

    let job_id = db
        .create_job(&params.canonical_json()?)
        .map_err(|e| e.to_string())?;
    db.set_job_running(job_id).map_err(|e| e.to_string())?;

    match run_clustering(&db, &args.scratch_dir, &params, job_id, None, None) {
        Ok(root) => {
            db.finalise_job(job_id).map_err(|e| e.to_string())?;
            match root {
                Some(root) => println!("[Cluster] Job {} complete, root cluster {}", job_id, root),
                None => println!("[Cluster] Job {} complete, no points matched", job_id),
            }
            Ok(())
        }
        Err(e) => {
            let _ = db.set_job_failed(job_id, &e);
            Err(format!("job {} failed: {}", job_id, e))
        }
    }
}
