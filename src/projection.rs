use linfa::{traits::Transformer, ParamGuard};
use linfa_tsne::TSneParams;
use ndarray::{Array2, Axis};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, info};

use crate::clustering::{ClusterAssigner, ClusteredFrames};
use crate::error::{AnalysisError, Result};
use crate::sampling::FrameRef;

/// Dimensionality of every projection.
pub const PROJECTION_DIM: usize = 3;

/// Nonlinear reduction of `[rows, features]` data to `[rows, PROJECTION_DIM]`.
pub trait Projector {
    fn project(&self, data: &Array2<f64>) -> Result<Array2<f64>>;
}

/// Barnes-Hut t-SNE.
///
/// The seed fixes the initial embedding only. The neighbor tree inside
/// bhtsne draws from a thread-local generator, so two runs with the same
/// seed agree on structure but not on exact coordinates.
///
/// The output is rescaled so its widest axis spans exactly 1.0, keeping the
/// DBSCAN radius meaningful across sample sizes and perplexities. The
/// rescaling is uniform, so neighborhoods keep their shape.
#[derive(Debug, Clone)]
pub struct TsneProjector {
    seed: u64,
    perplexity: f64,
    approx_threshold: f64,
    max_iter: usize,
}

impl TsneProjector {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            perplexity: 30.0,
            approx_threshold: 0.5,
            max_iter: 1000,
        }
    }

    pub fn with_perplexity(mut self, perplexity: f64) -> Self {
        self.perplexity = perplexity;
        self
    }

    /// Barnes-Hut angle; 0.0 computes exact gradients.
    pub fn with_approx_threshold(mut self, approx_threshold: f64) -> Self {
        self.approx_threshold = approx_threshold;
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn perplexity(&self) -> f64 {
        self.perplexity
    }

    pub fn validate(&self) -> Result<()> {
        if self.perplexity.is_nan() || self.perplexity <= 0.0 {
            return Err(AnalysisError::InvalidParameter(format!(
                "perplexity must be positive, got {}",
                self.perplexity
            )));
        }
        if !(0.0..=1.0).contains(&self.approx_threshold) {
            return Err(AnalysisError::InvalidParameter(format!(
                "approx_threshold must lie in [0, 1], got {}",
                self.approx_threshold
            )));
        }
        if self.max_iter == 0 {
            return Err(AnalysisError::InvalidParameter(
                "max_iter must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Projector for TsneProjector {
    fn project(&self, data: &Array2<f64>) -> Result<Array2<f64>> {
        self.validate()?;

        let rows = data.nrows();
        // The neighbor search needs more than 3 * perplexity other points.
        if (rows as f64 - 1.0) < 3.0 * self.perplexity {
            return Err(AnalysisError::Projection(format!(
                "perplexity {} is too large for {} points (need at least {})",
                self.perplexity,
                rows,
                (3.0 * self.perplexity).ceil() as usize + 1
            )));
        }

        debug!(rows, features = data.ncols(), perplexity = self.perplexity, seed = self.seed, "running t-SNE");

        let rng = StdRng::seed_from_u64(self.seed);
        let embedding = TSneParams::embedding_size_with_rng(PROJECTION_DIM, rng)
            .perplexity(self.perplexity)
            .approx_threshold(self.approx_threshold)
            .max_iter(self.max_iter)
            .check()
            .map_err(|e| AnalysisError::Projection(format!("invalid t-SNE parameters: {e}")))?
            .transform(data.to_owned())
            .map_err(|e| AnalysisError::Projection(format!("t-SNE failed: {e}")))?;

        Ok(rescale_to_unit_span(embedding))
    }
}

/// Shift to the origin and divide every axis by the widest span.
fn rescale_to_unit_span(mut coords: Array2<f64>) -> Array2<f64> {
    let mut widest = 0.0_f64;
    for mut column in coords.axis_iter_mut(Axis(1)) {
        let min = column.iter().copied().fold(f64::INFINITY, f64::min);
        let max = column.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if min.is_finite() {
            column.mapv_inplace(|v| v - min);
            widest = widest.max(max - min);
        }
    }
    if widest > 0.0 {
        coords.mapv_inplace(|v| v / widest);
    }
    coords
}

/// Projected coordinates paired with the traceability index.
#[derive(Debug, Clone)]
pub struct ProjectedFrames {
    coords: Array2<f64>,
    index: Vec<FrameRef>,
}

impl ProjectedFrames {
    pub(crate) fn new(coords: Array2<f64>, index: Vec<FrameRef>) -> Result<Self> {
        if coords.nrows() != index.len() {
            return Err(AnalysisError::ShapeMismatch(format!(
                "{} projected rows but {} index entries",
                coords.nrows(),
                index.len()
            )));
        }
        Ok(Self { coords, index })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn coords(&self) -> &Array2<f64> {
        &self.coords
    }

    pub fn index(&self) -> &[FrameRef] {
        &self.index
    }

    pub fn cluster<A: ClusterAssigner + ?Sized>(&self, assigner: &A) -> Result<ClusteredFrames> {
        let labels = assigner.assign(&self.coords)?;
        let clustered = ClusteredFrames::new(self.coords.clone(), labels, self.index.clone())?;

        let summary = clustered.summary();
        info!(
            points = self.len(),
            clusters = summary.num_clusters,
            noise = summary.noise,
            "frames clustered"
        );
        Ok(clustered)
    }
}
