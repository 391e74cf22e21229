use linfa::{traits::Transformer, ParamGuard};
use linfa_clustering::Dbscan;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::error::{AnalysisError, Result};
use crate::sampling::FrameRef;

/// Label given to points that belong to no cluster.
pub const NOISE_LABEL: i32 = -1;

/// DBSCAN radius and density threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterParams {
    pub eps: f64,
    /// Neighbors (the point itself included) needed to be a core point.
    pub min_points: usize,
}

impl ClusterParams {
    pub fn new(eps: f64, min_points: usize) -> Self {
        Self { eps, min_points }
    }

    pub fn validate(&self) -> Result<()> {
        if self.eps.is_nan() || self.eps <= 0.0 {
            return Err(AnalysisError::InvalidParameter(format!(
                "eps must be positive, got {}",
                self.eps
            )));
        }
        if self.min_points == 0 {
            return Err(AnalysisError::InvalidParameter(
                "min_points must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Assigns one label per row: `NOISE_LABEL` or a cluster id `0..n`.
pub trait ClusterAssigner {
    fn assign(&self, points: &Array2<f64>) -> Result<Vec<i32>>;
}

#[derive(Debug, Clone)]
pub struct DbscanAssigner {
    params: ClusterParams,
}

impl DbscanAssigner {
    pub fn new(params: ClusterParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> ClusterParams {
        self.params
    }
}

impl ClusterAssigner for DbscanAssigner {
    fn assign(&self, points: &Array2<f64>) -> Result<Vec<i32>> {
        if points.nrows() == 0 {
            return Ok(Vec::new());
        }

        // linfa needs at least two points per neighborhood. With one, every
        // point is core, which differs from two only for isolated points:
        // those become singleton clusters below.
        let memberships: Array1<Option<usize>> = Dbscan::params(self.params.min_points.max(2))
            .tolerance(self.params.eps)
            .check()
            .map_err(|e| AnalysisError::Clustering(format!("invalid DBSCAN parameters: {e}")))?
            .transform(points);

        let mut raw: Vec<Option<usize>> = memberships.to_vec();
        if self.params.min_points == 1 {
            let mut next = raw.iter().flatten().max().map_or(0, |m| m + 1);
            for label in raw.iter_mut().filter(|l| l.is_none()) {
                *label = Some(next);
                next += 1;
            }
        }

        let labels = relabel_by_first_appearance(&raw);
        debug!(
            points = labels.len(),
            eps = self.params.eps,
            min_points = self.params.min_points,
            "DBSCAN finished"
        );
        Ok(labels)
    }
}

/// Renumber clusters `0..n` in the order they first occur; `None` is noise.
fn relabel_by_first_appearance(raw: &[Option<usize>]) -> Vec<i32> {
    let mut mapping: HashMap<usize, i32> = HashMap::new();
    raw.iter()
        .map(|membership| match membership {
            Some(cluster) => {
                let next = mapping.len() as i32;
                *mapping.entry(*cluster).or_insert(next)
            }
            None => NOISE_LABEL,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub num_points: usize,
    pub num_clusters: usize,
    pub noise: usize,
    /// Members per label, noise included under `-1`.
    pub sizes: BTreeMap<i32, usize>,
}

/// A cluster member chosen to stand for its cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Representative {
    pub label: i32,
    pub row: usize,
    pub frame: FrameRef,
    pub distance_to_centroid: f64,
}

/// Projected coordinates, labels and traceability index, one entry per point.
#[derive(Debug, Clone)]
pub struct ClusteredFrames {
    coords: Array2<f64>,
    labels: Vec<i32>,
    index: Vec<FrameRef>,
}

impl ClusteredFrames {
    pub(crate) fn new(coords: Array2<f64>, labels: Vec<i32>, index: Vec<FrameRef>) -> Result<Self> {
        if coords.nrows() != labels.len() || labels.len() != index.len() {
            return Err(AnalysisError::ShapeMismatch(format!(
                "{} points, {} labels and {} index entries",
                coords.nrows(),
                labels.len(),
                index.len()
            )));
        }
        if let Some(bad) = labels.iter().find(|&&l| l < NOISE_LABEL) {
            return Err(AnalysisError::Clustering(format!("invalid cluster label {bad}")));
        }
        Ok(Self {
            coords,
            labels,
            index,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn coords(&self) -> &Array2<f64> {
        &self.coords
    }

    pub fn labels(&self) -> &[i32] {
        &self.labels
    }

    pub fn index(&self) -> &[FrameRef] {
        &self.index
    }

    /// Distinct cluster ids in ascending order, noise excluded.
    pub fn cluster_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .labels
            .iter()
            .copied()
            .filter(|&l| l != NOISE_LABEL)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn summary(&self) -> ClusterSummary {
        let mut sizes = BTreeMap::new();
        for &label in &self.labels {
            *sizes.entry(label).or_insert(0) += 1;
        }
        let noise = sizes.get(&NOISE_LABEL).copied().unwrap_or(0);
        let num_clusters = sizes.len() - usize::from(noise > 0);

        ClusterSummary {
            num_points: self.len(),
            num_clusters,
            noise,
            sizes,
        }
    }

    /// Up to `per_cluster` members of each cluster, closest to the cluster
    /// centroid first. Ties keep row order.
    pub fn representatives(&self, per_cluster: usize) -> Vec<Representative> {
        let mut picked = Vec::new();

        for cluster in self.cluster_ids() {
            let rows: Vec<usize> = (0..self.len())
                .filter(|&row| self.labels[row] == cluster)
                .collect();

            let mut centroid = Array1::<f64>::zeros(self.coords.ncols());
            for &row in &rows {
                centroid += &self.coords.row(row);
            }
            centroid /= rows.len() as f64;

            let mut ranked: Vec<(usize, f64)> = rows
                .iter()
                .map(|&row| (row, euclidean(self.coords.row(row), centroid.view())))
                .collect();
            // Stable sort, so equal distances stay in row order.
            ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

            picked.extend(ranked.into_iter().take(per_cluster).map(|(row, distance)| {
                Representative {
                    label: cluster,
                    row,
                    frame: self.index[row].clone(),
                    distance_to_centroid: distance,
                }
            }));
        }

        picked
    }
}

fn euclidean(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}
