//! Recursive tree builder: drives the partitioner over store-row subsets
//! and persists one cluster node (plus memberships) per recursion step.
//!
//! Nodes are written top-down, root first, and are immediately durable;
//! nothing is exposed until the owning job flips the visibility gate. A
//! failure partway through a branch leaves already-persisted siblings
//! intact and invisible.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::ClusterConfig;
use crate::db::{Database, NewCluster};
use crate::embedding::{vec_to_blob, Embedder, Labeller};
use crate::partition::partition;
use crate::store::VectorStore;

/// Centroid seeding for every partitioning step.
const KMEANS_SEED: u64 = 42;

/// Upper bound on texts fetched for one labelling call.
const LABEL_SAMPLE: usize = 15;

/// Everything one tree build shares across recursion steps.
pub struct TreeContext<'a> {
    pub db: &'a Database,
    pub store: &'a VectorStore,
    pub config: &'a ClusterConfig,
    /// Canonical filters JSON stamped on every node.
    pub filters_json: &'a str,
    /// Canonical config JSON stamped on every node.
    pub config_json: &'a str,
    pub job_id: i64,
    pub embedder: Option<&'a dyn Embedder>,
    pub labeller: Option<&'a dyn Labeller>,
}

/// Build the node for `subset` and recurse into its partitions.
/// Returns the persisted cluster id.
pub fn cluster_recursive(
    ctx: &TreeContext,
    subset: &[u32],
    depth: u32,
    parent_cluster_id: Option<i64>,
) -> Result<i64, String> {
    debug_assert!(!subset.is_empty(), "caller stops recursion before empty subsets");

    // The root is unlabelled except for search-style builds, where it names
    // the query's topic
    let wants_label = !ctx.config.skip_llm && (depth > 0 || ctx.config.search);
    let (title, summary) = if wants_label {
        label_subset(ctx, subset, depth)
    } else {
        (None, None)
    };

    // Representative vector: the embedded title, when both exist. Embed
    // failure means no semantic ordering for this node, nothing more.
    let centre = match (&title, ctx.embedder) {
        (Some(title), Some(embedder)) => embedder.embed(title).map(|v| vec_to_blob(&v)),
        _ => None,
    };

    let cluster_id = ctx
        .db
        .insert_cluster(&NewCluster {
            parent_cluster_id,
            title: title.as_deref(),
            summary: summary.as_deref(),
            depth,
            filters: ctx.filters_json,
            config: ctx.config_json,
            job_id: ctx.job_id,
            centre: centre.as_deref(),
        })
        .map_err(|e| e.to_string())?;

    let point_ids: Vec<i64> = subset
        .iter()
        .map(|&row| ctx.store.id_at(row as usize))
        .collect();
    ctx.db
        .insert_cluster_points(cluster_id, &point_ids)
        .map_err(|e| e.to_string())?;

    // Leaf: depth exhausted or subset too small to split further
    if depth >= ctx.config.max_depth || subset.len() < ctx.config.min_points {
        return Ok(cluster_id);
    }

    let k = if depth == 0 {
        ctx.config.n_clusters_base
    } else {
        ctx.config.n_clusters
    };
    let labels = partition(ctx.store, subset, k, KMEANS_SEED);

    let group_count = labels.iter().max().map(|&max| max as usize + 1).unwrap_or(0);
    let mut groups: Vec<Vec<u32>> = vec![Vec::new(); group_count];
    for (pos, &label) in labels.iter().enumerate() {
        groups[label as usize].push(subset[pos]);
    }

    // Ascending label order keeps sibling order stable within a run
    for group in groups.iter().filter(|g| !g.is_empty()) {
        cluster_recursive(ctx, group, depth + 1, Some(cluster_id))?;
    }

    Ok(cluster_id)
}

/// Bounded random text sample from the subset, handed to the labeller.
/// Labelling failure degrades to an untitled node rather than aborting the
/// branch.
fn label_subset(ctx: &TreeContext, subset: &[u32], depth: u32) -> (Option<String>, Option<String>) {
    let labeller = match ctx.labeller {
        Some(labeller) => labeller,
        None => return (None, None),
    };

    let mut rng = StdRng::seed_from_u64(KMEANS_SEED + depth as u64);
    let sample_ids: Vec<i64> = subset
        .choose_multiple(&mut rng, LABEL_SAMPLE)
        .map(|&row| ctx.store.id_at(row as usize))
        .collect();

    let texts = match ctx.db.point_texts(&sample_ids) {
        Ok(texts) => texts,
        Err(e) => {
            eprintln!("[Tree] Sample fetch failed for labelling: {}", e);
            return (None, None);
        }
    };

    match labeller.label(&texts, None) {
        Ok((title, summary)) => (Some(title), Some(summary)),
        Err(e) => {
            eprintln!("[Tree] Labelling failed, keeping node untitled: {}", e);
            (None, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PointFilter;
    use crate::db::Point;
    use crate::store::build_store;
    use std::collections::HashSet;
    use tempfile::TempDir;

    struct StubLabeller {
        fail: bool,
    }
    impl Labeller for StubLabeller {
        fn label(&self, samples: &[String], _context: Option<&str>) -> Result<(String, String), String> {
            if self.fail {
                Err("model unavailable".to_string())
            } else {
                Ok((
                    format!("Topic of {} points", samples.len()),
                    "A summary".to_string(),
                ))
            }
        }
    }

    struct StubEmbedder;
    impl Embedder for StubEmbedder {
        fn embed(&self, text: &str) -> Option<Vec<f32>> {
            Some(vec![text.len() as f32, 1.0])
        }
    }

    /// Seven points in two separated blobs of four and three.
    fn seed_two_blob_points(db: &Database) {
        let vectors = [
            vec![1.0, 0.05, 0.0],
            vec![0.95, 0.0, 0.05],
            vec![1.05, 0.0, 0.0],
            vec![0.9, 0.05, 0.05],
            vec![0.0, 1.0, 0.05],
            vec![0.05, 0.95, 0.0],
            vec![0.0, 1.05, 0.0],
        ];
        for (i, v) in vectors.iter().enumerate() {
            let id = (i + 1) as i64;
            db.insert_point(
                &Point {
                    point_id: id,
                    text: format!("point {}", id),
                    member_id: Some(id),
                    house: Some("Commons".to_string()),
                    date: Some("2025-05-10".to_string()),
                },
                Some(v),
            )
            .unwrap();
        }
    }

    fn build_ctx_store(db: &Database, dir: &TempDir, job_id: i64) -> crate::store::StoreMeta {
        build_store(
            db,
            dir.path(),
            &PointFilter::default(),
            &ClusterConfig::default(),
            job_id,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_two_level_tree_partitions_memberships_exactly() {
        let db = Database::in_memory().unwrap();
        seed_two_blob_points(&db);
        let dir = TempDir::new().unwrap();
        let job_id = db.create_job("{}").unwrap();
        let meta = build_ctx_store(&db, &dir, job_id);
        let store = VectorStore::open(&meta).unwrap();

        let config = ClusterConfig {
            max_depth: 1,
            min_points: 3,
            n_clusters_base: 2,
            skip_llm: true,
            ..Default::default()
        };
        let ctx = TreeContext {
            db: &db,
            store: &store,
            config: &config,
            filters_json: "{}",
            config_json: "{}",
            job_id,
            embedder: None,
            labeller: None,
        };
        let subset: Vec<u32> = (0..store.len() as u32).collect();
        let root = cluster_recursive(&ctx, &subset, 0, None).unwrap();

        let nodes = db.clusters_for_job(job_id).unwrap();
        assert_eq!(nodes.len(), 3);

        let root_node = nodes.iter().find(|n| n.cluster_id == root).unwrap();
        assert_eq!(root_node.depth, 0);
        assert!(root_node.parent_cluster_id.is_none());
        assert!(root_node.title.is_none());

        let root_members = db.cluster_point_ids(root).unwrap();
        assert_eq!(root_members.len(), 7);

        let children: Vec<_> = nodes.iter().filter(|n| n.cluster_id != root).collect();
        assert_eq!(children.len(), 2);
        let mut sizes = Vec::new();
        let mut union = HashSet::new();
        let mut total = 0;
        for child in &children {
            assert_eq!(child.depth, 1);
            assert_eq!(child.parent_cluster_id, Some(root));
            assert!(child.title.is_none());
            let members = db.cluster_point_ids(child.cluster_id).unwrap();
            total += members.len();
            sizes.push(members.len());
            union.extend(members);
        }
        sizes.sort();
        assert_eq!(sizes, vec![3, 4]);
        // Pairwise disjoint and union equals the parent's membership
        assert_eq!(total, union.len());
        assert_eq!(union, root_members.into_iter().collect::<HashSet<_>>());
    }

    #[test]
    fn test_depth_arithmetic_holds_for_deeper_trees() {
        let db = Database::in_memory().unwrap();
        seed_two_blob_points(&db);
        let dir = TempDir::new().unwrap();
        let job_id = db.create_job("{}").unwrap();
        let meta = build_ctx_store(&db, &dir, job_id);
        let store = VectorStore::open(&meta).unwrap();

        let config = ClusterConfig {
            max_depth: 2,
            min_points: 2,
            n_clusters: 2,
            n_clusters_base: 2,
            skip_llm: true,
            ..Default::default()
        };
        let ctx = TreeContext {
            db: &db,
            store: &store,
            config: &config,
            filters_json: "{}",
            config_json: "{}",
            job_id,
            embedder: None,
            labeller: None,
        };
        let subset: Vec<u32> = (0..store.len() as u32).collect();
        let root = cluster_recursive(&ctx, &subset, 0, None).unwrap();

        let nodes = db.clusters_for_job(job_id).unwrap();
        let by_id: std::collections::HashMap<i64, _> =
            nodes.iter().map(|n| (n.cluster_id, n)).collect();
        for node in &nodes {
            match node.parent_cluster_id {
                None => assert_eq!(node.depth, 0),
                Some(parent_id) => {
                    let parent = by_id.get(&parent_id).unwrap();
                    assert_eq!(node.depth, parent.depth + 1);
                }
            }
            // Reachable from the root in exactly `depth` parent-hops
            let mut cursor = node.cluster_id;
            for _ in 0..node.depth {
                cursor = by_id.get(&cursor).unwrap().parent_cluster_id.unwrap();
            }
            assert_eq!(cursor, root);
        }
    }

    #[test]
    fn test_labelling_failure_degrades_to_untitled() {
        let db = Database::in_memory().unwrap();
        seed_two_blob_points(&db);
        let dir = TempDir::new().unwrap();
        let job_id = db.create_job("{}").unwrap();
        let meta = build_ctx_store(&db, &dir, job_id);
        let store = VectorStore::open(&meta).unwrap();

        let config = ClusterConfig {
            max_depth: 1,
            min_points: 3,
            n_clusters_base: 2,
            skip_llm: false,
            ..Default::default()
        };
        let labeller = StubLabeller { fail: true };
        let ctx = TreeContext {
            db: &db,
            store: &store,
            config: &config,
            filters_json: "{}",
            config_json: "{}",
            job_id,
            embedder: Some(&StubEmbedder),
            labeller: Some(&labeller),
        };
        let subset: Vec<u32> = (0..store.len() as u32).collect();
        cluster_recursive(&ctx, &subset, 0, None).unwrap();

        // Branch completed despite the failing labeller
        let nodes = db.clusters_for_job(job_id).unwrap();
        assert_eq!(nodes.len(), 3);
        assert!(nodes.iter().all(|n| n.title.is_none() && n.summary.is_none()));
        assert!(nodes.iter().all(|n| n.centre.is_none()));
    }

    #[test]
    fn test_labelled_children_carry_titles_and_centres() {
        let db = Database::in_memory().unwrap();
        seed_two_blob_points(&db);
        let dir = TempDir::new().unwrap();
        let job_id = db.create_job("{}").unwrap();
        let meta = build_ctx_store(&db, &dir, job_id);
        let store = VectorStore::open(&meta).unwrap();

        let config = ClusterConfig {
            max_depth: 1,
            min_points: 3,
            n_clusters_base: 2,
            skip_llm: false,
            ..Default::default()
        };
        let labeller = StubLabeller { fail: false };
        let ctx = TreeContext {
            db: &db,
            store: &store,
            config: &config,
            filters_json: "{}",
            config_json: "{}",
            job_id,
            embedder: Some(&StubEmbedder),
            labeller: Some(&labeller),
        };
        let subset: Vec<u32> = (0..store.len() as u32).collect();
        let root = cluster_recursive(&ctx, &subset, 0, None).unwrap();

        for node in db.clusters_for_job(job_id).unwrap() {
            if node.cluster_id == root {
                // Non-search root stays unlabelled
                assert!(node.title.is_none());
            } else {
                assert!(node.title.is_some());
                assert!(node.summary.is_some());
                assert!(node.centre.is_some());
            }
        }
    }

    #[test]
    fn test_search_build_labels_the_root() {
        let db = Database::in_memory().unwrap();
        seed_two_blob_points(&db);
        let dir = TempDir::new().unwrap();
        let job_id = db.create_job("{}").unwrap();
        let meta = build_ctx_store(&db, &dir, job_id);
        let store = VectorStore::open(&meta).unwrap();

        let config = ClusterConfig {
            max_depth: 0, // root only
            search: true,
            search_limit: Some(100),
            skip_llm: false,
            ..Default::default()
        };
        let labeller = StubLabeller { fail: false };
        let ctx = TreeContext {
            db: &db,
            store: &store,
            config: &config,
            filters_json: "{}",
            config_json: "{}",
            job_id,
            embedder: None,
            labeller: Some(&labeller),
        };
        let subset: Vec<u32> = (0..store.len() as u32).collect();
        let root = cluster_recursive(&ctx, &subset, 0, None).unwrap();

        let nodes = db.clusters_for_job(job_id).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].cluster_id, root);
        assert!(nodes[0].title.is_some());
    }
}
