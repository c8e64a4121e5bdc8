//! Typed filter and clustering configuration.
//!
//! Filters select the window of points to cluster; the config controls the
//! shape of the tree. Both are persisted verbatim (canonical JSON) on every
//! cluster row and on the job, so an identical (filters, config) pair can be
//! recognised and deduplicated.

use serde::{Deserialize, Serialize};

/// Selection window for points feeding one tree build.
///
/// Dates are `YYYY-MM-DD` strings, inclusive on both ends, compared lexically
/// (the format makes lexical and chronological order coincide).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub house: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_ids: Option<Vec<i64>>,
    /// Free-text query. When present the build runs in search mode: points
    /// are ranked by embedding distance to the query and only the top
    /// `search_limit` are clustered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl PointFilter {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [("start_date", &self.start_date), ("end_date", &self.end_date)] {
            if let Some(d) = value {
                if !is_iso_date(d) {
                    return Err(format!("{} must be YYYY-MM-DD, got '{}'", name, d));
                }
            }
        }
        if let (Some(start), Some(end)) = (&self.start_date, &self.end_date) {
            if start > end {
                return Err(format!("start_date {} is after end_date {}", start, end));
            }
        }
        if let Some(ids) = &self.member_ids {
            if ids.is_empty() {
                return Err("member_ids must not be an empty list".to_string());
            }
        }
        Ok(())
    }
}

fn is_iso_date(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| matches!(i, 4 | 7) || b.is_ascii_digit())
}

/// Knobs controlling one recursive tree build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Depth at which recursion stops; the root is depth 0.
    pub max_depth: u32,
    /// Subsets smaller than this become leaves without partitioning.
    pub min_points: usize,
    /// Group count at depths below the root.
    pub n_clusters: usize,
    /// Group count at the root (wider fan-out than deeper levels).
    pub n_clusters_base: usize,
    /// Skip title/summary labelling entirely.
    pub skip_llm: bool,
    /// Search-style build: store is ranked+limited, and the root is labelled.
    pub search: bool,
    /// Candidate cap for search-mode builds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_limit: Option<usize>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            min_points: 3,
            n_clusters: 3,
            n_clusters_base: 5,
            skip_llm: false,
            search: false,
            search_limit: None,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_points == 0 {
            return Err("min_points must be at least 1".to_string());
        }
        if self.n_clusters == 0 || self.n_clusters_base == 0 {
            return Err("n_clusters and n_clusters_base must be at least 1".to_string());
        }
        if self.search && self.search_limit.map_or(true, |l| l == 0) {
            return Err("search mode requires search_limit > 0".to_string());
        }
        Ok(())
    }
}

/// The (filters, config) pair identifying one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    pub filters: PointFilter,
    pub config: ClusterConfig,
}

impl JobParams {
    pub fn validate(&self) -> Result<(), String> {
        self.filters.validate()?;
        self.config.validate()?;
        if self.config.search && self.filters.query.is_none() {
            return Err("search mode requires a query filter".to_string());
        }
        Ok(())
    }

    /// Canonical serialization used for job dedup. Struct field order is
    /// fixed at compile time, so equal params always serialize identically.
    pub fn canonical_json(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ClusterConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_rejects_zero_clusters() {
        let config = ClusterConfig {
            n_clusters: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_search_requires_limit_and_query() {
        let config = ClusterConfig {
            search: true,
            search_limit: None,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let params = JobParams {
            filters: PointFilter::default(),
            config: ClusterConfig {
                search: true,
                search_limit: Some(100),
                ..Default::default()
            },
        };
        // Valid config, but no query in the filters
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_filter_rejects_bad_dates() {
        let filter = PointFilter {
            start_date: Some("2025-5-01".to_string()),
            ..Default::default()
        };
        assert!(filter.validate().is_err());

        let filter = PointFilter {
            start_date: Some("2025-06-01".to_string()),
            end_date: Some("2025-05-01".to_string()),
            ..Default::default()
        };
        assert!(filter.validate().is_err());
    }

    #[test]
    fn test_canonical_json_identical_for_equal_params() {
        let a = JobParams {
            filters: PointFilter {
                start_date: Some("2025-05-01".to_string()),
                end_date: Some("2025-05-31".to_string()),
                ..Default::default()
            },
            config: ClusterConfig::default(),
        };
        let b = a.clone();
        assert_eq!(a.canonical_json().unwrap(), b.canonical_json().unwrap());
    }
}
