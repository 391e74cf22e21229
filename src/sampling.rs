use ndarray::{Array2, Array3, ArrayView1, Axis};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::embedding::frame_embeddings;
use crate::error::{AnalysisError, Result};
use crate::projection::{ProjectedFrames, Projector, PROJECTION_DIM};

/// Where a frame-level row came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRef {
    pub source_name: String,
    pub frame: usize,
}

/// Frame-level embeddings paired row-for-row with their traceability index.
///
/// Rows and references only ever move together, so a row can always be traced
/// back to the recording and frame it was computed from.
#[derive(Debug, Clone)]
pub struct FrameTable {
    embeddings: Array2<f32>,
    index: Vec<FrameRef>,
}

impl FrameTable {
    /// Flatten `[sample, frame, feature]` embeddings. Row `i` is frame `i % F`
    /// of `source_names[i / F]`.
    pub fn from_embeddings(embeddings: &Array3<f32>, source_names: &[String]) -> Result<Self> {
        let (samples, frames, features) = embeddings.dim();
        if source_names.len() != samples {
            return Err(AnalysisError::ShapeMismatch(format!(
                "{} source names for {} embedded samples",
                source_names.len(),
                samples
            )));
        }

        let rows = frame_embeddings(embeddings)?;
        let index = source_names
            .iter()
            .flat_map(|name| {
                (0..frames).map(move |frame| FrameRef {
                    source_name: name.clone(),
                    frame,
                })
            })
            .collect();

        info!(rows = samples * frames, features, "frame table built");
        Self::new(rows, index)
    }

    fn new(embeddings: Array2<f32>, index: Vec<FrameRef>) -> Result<Self> {
        if embeddings.nrows() != index.len() {
            return Err(AnalysisError::ShapeMismatch(format!(
                "{} embedding rows but {} index entries",
                embeddings.nrows(),
                index.len()
            )));
        }
        Ok(Self { embeddings, index })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.embeddings.ncols()
    }

    pub fn index(&self) -> &[FrameRef] {
        &self.index
    }

    pub fn embeddings(&self) -> &Array2<f32> {
        &self.embeddings
    }

    pub fn row(&self, i: usize) -> Option<(ArrayView1<'_, f32>, &FrameRef)> {
        self.index
            .get(i)
            .map(|reference| (self.embeddings.row(i), reference))
    }

    /// Draw `k` distinct rows. The same `(seed, k, len)` always picks the same rows.
    pub fn sample(&self, k: usize, seed: u64) -> Result<Self> {
        if k == 0 {
            return Err(AnalysisError::InvalidParameter(
                "sample size must be greater than 0".to_string(),
            ));
        }
        if k > self.len() {
            return Err(AnalysisError::InsufficientFrames {
                requested: k,
                available: self.len(),
            });
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let indices = rand::seq::index::sample(&mut rng, self.len(), k).into_vec();

        debug!(k, seed, available = self.len(), "sampled frames");
        self.select(&indices)
    }

    /// Gather rows (and their references) in the given order.
    pub fn select(&self, indices: &[usize]) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(AnalysisError::InvalidParameter(format!(
                "row {} out of range for a table of {} rows",
                bad,
                self.len()
            )));
        }

        let embeddings = self.embeddings.select(Axis(0), indices);
        let index = indices.iter().map(|&i| self.index[i].clone()).collect();
        Self::new(embeddings, index)
    }

    pub fn project<P: Projector + ?Sized>(&self, projector: &P) -> Result<ProjectedFrames> {
        let data = self.embeddings.mapv(f64::from);
        let coords = projector.project(&data)?;

        if coords.dim() != (self.len(), PROJECTION_DIM) {
            return Err(AnalysisError::Projection(format!(
                "projector returned {:?} for {} rows, expected {} columns",
                coords.dim(),
                self.len(),
                PROJECTION_DIM
            )));
        }

        info!(rows = self.len(), from = self.dim(), to = PROJECTION_DIM, "frames projected");
        ProjectedFrames::new(coords, self.index.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Embeddings whose first two features encode (sample, frame).
    fn traced_embeddings(samples: usize, frames: usize, features: usize) -> Array3<f32> {
        Array3::from_shape_fn((samples, frames, features), |(s, f, d)| match d {
            0 => s as f32,
            1 => f as f32,
            _ => (s * frames + f) as f32 * 0.001,
        })
    }

    fn names(samples: usize) -> Vec<String> {
        (0..samples).map(|s| format!("rec_{s:02}")).collect()
    }

    fn assert_aligned(table: &FrameTable) {
        for i in 0..table.len() {
            let (row, reference) = table.row(i).unwrap();
            assert_eq!(reference.source_name, format!("rec_{:02}", row[0] as usize));
            assert_eq!(reference.frame, row[1] as usize);
        }
    }

    #[test]
    fn flattening_keeps_row_to_frame_mapping() {
        let table = FrameTable::from_embeddings(&traced_embeddings(10, 100, 64), &names(10)).unwrap();

        assert_eq!(table.len(), 1000);
        assert_eq!(table.dim(), 64);
        assert_eq!(table.index()[0], FrameRef { source_name: "rec_00".into(), frame: 0 });
        assert_eq!(table.index()[250], FrameRef { source_name: "rec_02".into(), frame: 50 });
        assert_eq!(table.index()[999], FrameRef { source_name: "rec_09".into(), frame: 99 });
        assert_aligned(&table);
    }

    #[test]
    fn rejects_name_count_mismatch() {
        let result = FrameTable::from_embeddings(&traced_embeddings(3, 5, 4), &names(2));
        assert!(matches!(result, Err(AnalysisError::ShapeMismatch(_))));
    }

    #[test]
    fn sample_is_deterministic_and_unique() {
        let table = FrameTable::from_embeddings(&traced_embeddings(10, 100, 8), &names(10)).unwrap();

        let first = table.sample(200, 42).unwrap();
        let second = table.sample(200, 42).unwrap();

        assert_eq!(first.len(), 200);
        assert_eq!(first.index(), second.index());
        assert_eq!(first.embeddings(), second.embeddings());

        let unique: HashSet<_> = first.index().iter().collect();
        assert_eq!(unique.len(), 200);
        assert_aligned(&first);
    }

    #[test]
    fn different_seeds_pick_different_rows() {
        let table = FrameTable::from_embeddings(&traced_embeddings(10, 100, 4), &names(10)).unwrap();
        let a = table.sample(200, 1).unwrap();
        let b = table.sample(200, 2).unwrap();
        assert_ne!(a.index(), b.index());
    }

    #[test]
    fn oversized_sample_fails() {
        let table = FrameTable::from_embeddings(&traced_embeddings(10, 100, 4), &names(10)).unwrap();
        match table.sample(5000, 42) {
            Err(AnalysisError::InsufficientFrames { requested, available }) => {
                assert_eq!(requested, 5000);
                assert_eq!(available, 1000);
            }
            other => panic!("expected InsufficientFrames, got {other:?}"),
        }
    }

    #[test]
    fn full_and_empty_samples() {
        let table = FrameTable::from_embeddings(&traced_embeddings(2, 5, 4), &names(2)).unwrap();
        assert_eq!(table.sample(10, 7).unwrap().len(), 10);
        assert!(matches!(table.sample(0, 7), Err(AnalysisError::InvalidParameter(_))));
    }

    #[test]
    fn select_rejects_out_of_range_rows() {
        let table = FrameTable::from_embeddings(&traced_embeddings(2, 5, 4), &names(2)).unwrap();
        assert!(table.select(&[0, 10]).is_err());

        let picked = table.select(&[9, 0]).unwrap();
        assert_eq!(picked.index()[0], FrameRef { source_name: "rec_01".into(), frame: 4 });
        assert_aligned(&picked);
    }

    /// Keeps the first three features; enough to check alignment through projection.
    struct Truncate;

    impl Projector for Truncate {
        fn project(&self, data: &Array2<f64>) -> Result<Array2<f64>> {
            Ok(data.slice(ndarray::s![.., ..PROJECTION_DIM]).to_owned())
        }
    }

    struct WrongRows;

    impl Projector for WrongRows {
        fn project(&self, data: &Array2<f64>) -> Result<Array2<f64>> {
            Ok(Array2::zeros((data.nrows() + 1, PROJECTION_DIM)))
        }
    }

    #[test]
    fn projection_keeps_index_aligned() {
        let table = FrameTable::from_embeddings(&traced_embeddings(4, 25, 6), &names(4)).unwrap();
        let sampled = table.sample(30, 3).unwrap();
        let projected = sampled.project(&Truncate).unwrap();

        assert_eq!(projected.len(), 30);
        for (coords, reference) in projected.coords().rows().into_iter().zip(projected.index()) {
            assert_eq!(reference.source_name, format!("rec_{:02}", coords[0] as usize));
            assert_eq!(reference.frame, coords[1] as usize);
        }
    }

    #[test]
    fn projection_row_count_is_checked() {
        let table = FrameTable::from_embeddings(&traced_embeddings(2, 5, 4), &names(2)).unwrap();
        assert!(matches!(table.project(&WrongRows), Err(AnalysisError::Projection(_))));
    }
}
