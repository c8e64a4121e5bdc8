//! Bidirectional cursor pagination over a cluster's member points.
//!
//! The active order is a property of the node: semantic (distance to the
//! node's representative vector, ties broken by id) when the node has one,
//! chronological (point id, which follows ingest order) otherwise. Pages
//! are always returned ascending in the active order; `before` pages are
//! fetched descending and re-reversed here.
//!
//! Cursors are plain point ids. The anchor row's sort key is recomputed at
//! query time, so a cursor stays valid as long as the point exists.

use crate::db::{Database, PagedPoints, PageMeta};

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 200;

/// One page of a visible cluster's members. `Ok(None)` when the cluster
/// does not exist or is not visible; the two cases are indistinguishable to
/// callers on purpose.
pub fn get_cluster_points(
    db: &Database,
    cluster_id: i64,
    limit: Option<i64>,
    after: Option<i64>,
    before: Option<i64>,
) -> Result<Option<PagedPoints>, String> {
    if after.is_some() && before.is_some() {
        return Err("after and before are mutually exclusive".to_string());
    }

    let cluster = match db.get_visible_cluster(cluster_id).map_err(|e| e.to_string())? {
        Some(cluster) => cluster,
        None => return Ok(None),
    };

    let limit = limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let semantic = cluster.centre.is_some();

    let mut data = if semantic {
        db.page_points_semantic(cluster_id, limit, after, before)
    } else {
        db.page_points_chrono(cluster_id, limit, after, before)
    }
    .map_err(|e| e.to_string())?;

    // Before-pages arrive in reverse; presentation order is always ascending
    if before.is_some() {
        data.reverse();
    }

    let total_count = db.count_cluster_points(cluster_id).map_err(|e| e.to_string())?;
    let next_cursor = if data.len() as i64 == limit {
        data.last().map(|p| p.point_id)
    } else {
        None
    };
    let prev_cursor = data.first().map(|p| p.point_id);

    Ok(Some(PagedPoints {
        data,
        meta: PageMeta {
            next_cursor,
            prev_cursor,
            total_count,
        },
    }))
}
