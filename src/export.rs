use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::clustering::{ClusterSummary, ClusteredFrames};
use crate::config::AnalysisConfig;
use crate::embedding::EmbeddingVariant;
use crate::error::Result;
use crate::projection::PROJECTION_DIM;
use crate::sampling::FrameRef;

/// Everything that fixes the outcome of one clustering run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunKey {
    pub variant: EmbeddingVariant,
    pub eps: f64,
    pub min_points: usize,
    pub sample_size: usize,
    pub seed: u64,
}

impl RunKey {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            variant: config.variant,
            eps: config.eps,
            min_points: config.min_points,
            sample_size: config.sample_size,
            seed: config.seed,
        }
    }

    /// Shared by every file of the run, e.g. `combined_eps0.15_min5_seed42`.
    pub fn file_stem(&self) -> String {
        format!(
            "{}_eps{}_min{}_seed{}",
            self.variant, self.eps, self.min_points, self.seed
        )
    }

    pub fn clusters_file_name(&self) -> String {
        format!("clusters_{}.json", self.file_stem())
    }

    pub fn scatter_file_name(&self) -> String {
        format!("scatter_{}.png", self.file_stem())
    }

    pub fn clips_dir_name(&self) -> String {
        format!("clips_{}", self.file_stem())
    }

    /// Plot title line.
    pub fn describe(&self) -> String {
        format!(
            "{} embeddings, K={}, eps={}, min_points={}",
            self.variant, self.sample_size, self.eps, self.min_points
        )
    }
}

/// One projected, labelled frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedPoint {
    pub source_name: String,
    pub frame: usize,
    pub coords: [f64; PROJECTION_DIM],
    pub label: i32,
}

/// Cluster assignments of a run, enough to redraw the scatter without
/// re-running projection or clustering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterExport {
    pub run: RunKey,
    pub summary: ClusterSummary,
    pub points: Vec<ExportedPoint>,
}

impl ClusterExport {
    pub fn new(run: RunKey, clustered: &ClusteredFrames) -> Self {
        let points = clustered
            .coords()
            .rows()
            .into_iter()
            .zip(clustered.labels())
            .zip(clustered.index())
            .map(|((row, &label), reference)| ExportedPoint {
                source_name: reference.source_name.clone(),
                frame: reference.frame,
                coords: [row[0], row[1], row[2]],
                label,
            })
            .collect();

        Self {
            run,
            summary: clustered.summary(),
            points,
        }
    }

    /// Rebuild the paired container the plots draw from.
    pub fn clustered(&self) -> Result<ClusteredFrames> {
        let mut coords = Array2::zeros((self.points.len(), PROJECTION_DIM));
        for (mut row, point) in coords.rows_mut().into_iter().zip(&self.points) {
            for (d, value) in point.coords.iter().enumerate() {
                row[d] = *value;
            }
        }
        let labels = self.points.iter().map(|p| p.label).collect();
        let index = self
            .points
            .iter()
            .map(|p| FrameRef {
                source_name: p.source_name.clone(),
                frame: p.frame,
            })
            .collect();

        ClusteredFrames::new(coords, labels, index)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)?;
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::{ClusterAssigner, NOISE_LABEL};
    use ndarray::array;
    use tempfile::NamedTempFile;

    fn run_key() -> RunKey {
        RunKey {
            variant: EmbeddingVariant::Combined,
            eps: 0.15,
            min_points: 5,
            sample_size: 200,
            seed: 42,
        }
    }

    struct FixedLabels(Vec<i32>);

    impl ClusterAssigner for FixedLabels {
        fn assign(&self, _points: &Array2<f64>) -> Result<Vec<i32>> {
            Ok(self.0.clone())
        }
    }

    fn clustered() -> ClusteredFrames {
        let index = vec![
            FrameRef { source_name: "mouse_a".into(), frame: 3 },
            FrameRef { source_name: "mouse_b".into(), frame: 7 },
            FrameRef { source_name: "mouse_b".into(), frame: 8 },
        ];
        let coords = array![[0.1, 0.2, 0.3], [0.4, 0.5, 0.6], [0.9, 0.9, 0.9]];
        crate::projection::ProjectedFrames::new(coords, index)
            .unwrap()
            .cluster(&FixedLabels(vec![0, 0, NOISE_LABEL]))
            .unwrap()
    }

    #[test]
    fn test_file_names_carry_run_key() {
        let key = run_key();
        assert_eq!(key.file_stem(), "combined_eps0.15_min5_seed42");
        assert_eq!(key.clusters_file_name(), "clusters_combined_eps0.15_min5_seed42.json");
        assert_eq!(key.scatter_file_name(), "scatter_combined_eps0.15_min5_seed42.png");
        assert_eq!(key.clips_dir_name(), "clips_combined_eps0.15_min5_seed42");
    }

    #[test]
    fn test_cluster_export_save_load() {
        let original = ClusterExport::new(run_key(), &clustered());

        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        original.save_json(path).unwrap();
        let loaded = ClusterExport::load_json(path).unwrap();

        assert_eq!(loaded.run, run_key());
        assert_eq!(loaded.points, original.points);
        assert_eq!(loaded.summary.num_clusters, 1);
        assert_eq!(loaded.summary.noise, 1);

        let rebuilt = loaded.clustered().unwrap();
        assert_eq!(rebuilt.labels(), &[0, 0, -1]);
        assert_eq!(rebuilt.index()[1].source_name, "mouse_b");
        assert_eq!(rebuilt.coords()[[2, 0]], 0.9);
    }

    #[test]
    fn test_cluster_export_json_format() {
        let export = ClusterExport::new(run_key(), &clustered());
        let json = serde_json::to_string_pretty(&export).unwrap();

        assert!(json.contains("\"variant\": \"combined\""));
        assert!(json.contains("\"source_name\": \"mouse_a\""));
        assert!(json.contains("\"label\": -1"));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "not json").unwrap();
        assert!(ClusterExport::load_json(temp_file.path()).is_err());
    }
}
