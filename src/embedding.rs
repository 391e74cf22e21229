use burn::{
    data::dataset::Dataset,
    tensor::{backend::Backend, Tensor, TensorData},
};
use ndarray::{concatenate, Array2, Array3, Axis};
use ndarray_npy::{write_npy, NpzReader, NpzWriter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::path::Path;
use std::str::FromStr;
use std::time::UNIX_EPOCH;
use tracing::{debug, info};

use crate::data::{FeatureMode, PoseDataset};
use crate::error::{AnalysisError, Result};
use crate::model::{MultiscaleEncoder, MultiscaleEncoderConfig};

/// Cached embeddings, kept in the model folder.
pub const EMBEDDINGS_FILE: &str = "embeddings.npz";
pub const SHORT_TERM_KEY: &str = "short_term";
pub const LONG_TERM_KEY: &str = "long_term";
/// Provenance of the cached embeddings, written next to them.
pub const EMBEDDINGS_KEY_FILE: &str = "embeddings_key.json";

/// Which embedding subspace feeds the analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingVariant {
    Short,
    Long,
    Combined,
}

impl EmbeddingVariant {
    pub fn name(&self) -> &'static str {
        match self {
            EmbeddingVariant::Short => "short",
            EmbeddingVariant::Long => "long",
            EmbeddingVariant::Combined => "combined",
        }
    }
}

impl fmt::Display for EmbeddingVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EmbeddingVariant {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "short" | "short_term" => Ok(EmbeddingVariant::Short),
            "long" | "long_term" => Ok(EmbeddingVariant::Long),
            "combined" | "both" => Ok(EmbeddingVariant::Combined),
            other => Err(format!(
                "unknown embedding variant {other:?} (expected short, long or combined)"
            )),
        }
    }
}

/// Short-term and long-term embeddings, both `[sample, frame, feature]`.
///
/// The two tensors always agree on the sample and frame axes; their feature
/// sizes are independent.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingPair {
    short_term: Array3<f32>,
    long_term: Array3<f32>,
}

impl EmbeddingPair {
    pub fn new(short_term: Array3<f32>, long_term: Array3<f32>) -> Result<Self> {
        let (s_samples, s_frames, _) = short_term.dim();
        let (l_samples, l_frames, _) = long_term.dim();
        if (s_samples, s_frames) != (l_samples, l_frames) {
            return Err(AnalysisError::ShapeMismatch(format!(
                "short-term embeddings are {}x{} (sample x frame) but long-term are {}x{}",
                s_samples, s_frames, l_samples, l_frames
            )));
        }
        Ok(Self {
            short_term,
            long_term,
        })
    }

    pub fn short_term(&self) -> &Array3<f32> {
        &self.short_term
    }

    pub fn long_term(&self) -> &Array3<f32> {
        &self.long_term
    }

    pub fn num_samples(&self) -> usize {
        self.short_term.len_of(Axis(0))
    }

    pub fn num_frames(&self) -> usize {
        self.short_term.len_of(Axis(1))
    }

    /// Short-term and long-term features side by side on the feature axis.
    pub fn combined(&self) -> Result<Array3<f32>> {
        concatenate(Axis(2), &[self.short_term.view(), self.long_term.view()])
            .map_err(|e| AnalysisError::ShapeMismatch(format!("concatenating embeddings: {e}")))
    }

    pub fn variant(&self, variant: EmbeddingVariant) -> Result<Array3<f32>> {
        match variant {
            EmbeddingVariant::Short => Ok(self.short_term.clone()),
            EmbeddingVariant::Long => Ok(self.long_term.clone()),
            EmbeddingVariant::Combined => self.combined(),
        }
    }

    pub fn save_npz(&self, path: &Path) -> Result<()> {
        let mut npz = NpzWriter::new(File::create(path)?);
        npz.add_array(SHORT_TERM_KEY, &self.short_term)
            .map_err(|e| AnalysisError::Persistence(format!("writing {SHORT_TERM_KEY}: {e}")))?;
        npz.add_array(LONG_TERM_KEY, &self.long_term)
            .map_err(|e| AnalysisError::Persistence(format!("writing {LONG_TERM_KEY}: {e}")))?;
        npz.finish()
            .map_err(|e| AnalysisError::Persistence(format!("finishing {}: {e}", path.display())))?;

        info!(path = %path.display(), short = ?self.short_term.dim(), long = ?self.long_term.dim(), "embeddings saved");
        Ok(())
    }

    pub fn load_npz(path: &Path) -> Result<Self> {
        let mut npz = NpzReader::new(File::open(path)?)
            .map_err(|e| AnalysisError::Persistence(format!("opening {}: {e}", path.display())))?;
        let names = npz
            .names()
            .map_err(|e| AnalysisError::Persistence(format!("listing {}: {e}", path.display())))?;

        let short_term = read_entry(&mut npz, &names, SHORT_TERM_KEY)?;
        let long_term = read_entry(&mut npz, &names, LONG_TERM_KEY)?;

        info!(path = %path.display(), short = ?short_term.dim(), long = ?long_term.dim(), "embeddings loaded");
        Self::new(short_term, long_term)
    }
}

fn read_entry(npz: &mut NpzReader<File>, names: &[String], key: &str) -> Result<Array3<f32>> {
    let with_extension = format!("{key}.npy");
    let name = names
        .iter()
        .find(|name| name.as_str() == key || **name == with_extension)
        .ok_or_else(|| AnalysisError::Persistence(format!("missing entry {key:?}")))?;

    npz.by_name(name)
        .map_err(|e| AnalysisError::Persistence(format!("reading {key}: {e}")))
}

/// Everything besides the pose data that decides the encoder output.
///
/// A cache written under a different key was computed from other features
/// or other weights and must not be reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingCacheKey {
    pub feature_mode: FeatureMode,
    pub angle_bins: usize,
    pub checkpoint: String,
    pub checkpoint_bytes: u64,
    pub checkpoint_modified_nanos: Option<u64>,
    pub input_dim: usize,
    pub short_term_dim: usize,
    pub long_term_dim: usize,
    pub kernel_size: usize,
    pub long_term_dilation: usize,
}

impl EmbeddingCacheKey {
    pub fn new(
        feature_mode: FeatureMode,
        angle_bins: usize,
        checkpoint: &Path,
        encoder: &MultiscaleEncoderConfig,
    ) -> Result<Self> {
        let metadata = fs::metadata(checkpoint)?;
        // Not every filesystem records modification times.
        let checkpoint_modified_nanos = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .and_then(|age| u64::try_from(age.as_nanos()).ok());

        Ok(Self {
            feature_mode,
            angle_bins,
            checkpoint: checkpoint
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            checkpoint_bytes: metadata.len(),
            checkpoint_modified_nanos,
            input_dim: encoder.input_dim,
            short_term_dim: encoder.short_term_dim,
            long_term_dim: encoder.long_term_dim,
            kernel_size: encoder.kernel_size,
            long_term_dilation: encoder.long_term_dilation,
        })
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        debug!(path = %path.display(), checkpoint = %self.checkpoint, "embedding cache key saved");
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Recording-level embeddings: the mean over the frame axis, `[sample, feature]`.
pub fn sequence_embeddings(embeddings: &Array3<f32>) -> Result<Array2<f32>> {
    embeddings.mean_axis(Axis(1)).ok_or_else(|| {
        AnalysisError::ShapeMismatch("cannot average embeddings with zero frames".to_string())
    })
}

/// Frame-level embeddings: sample and frame axes merged row-major into
/// `[sample * frame, feature]` (all frames of sample 0, then sample 1, ...).
pub fn frame_embeddings(embeddings: &Array3<f32>) -> Result<Array2<f32>> {
    let (samples, frames, features) = embeddings.dim();
    let values: Vec<f32> = embeddings.iter().copied().collect();
    Array2::from_shape_vec((samples * frames, features), values)
        .map_err(|e| AnalysisError::ShapeMismatch(format!("flattening embeddings: {e}")))
}

pub fn save_sequence_embeddings(embeddings: &Array2<f32>, path: &Path) -> Result<()> {
    write_npy(path, embeddings)
        .map_err(|e| AnalysisError::Persistence(format!("writing {}: {e}", path.display())))?;
    debug!(path = %path.display(), shape = ?embeddings.dim(), "sequence embeddings saved");
    Ok(())
}

/// Run the encoder over the whole dataset, `batch_size` recordings at a time.
pub fn extract_embeddings<B: Backend>(
    model: &MultiscaleEncoder<B>,
    dataset: &PoseDataset,
    batch_size: usize,
    device: &B::Device,
) -> Result<EmbeddingPair> {
    if batch_size == 0 {
        return Err(AnalysisError::InvalidParameter(
            "batch_size must be greater than 0".to_string(),
        ));
    }

    let samples = dataset.len();
    let frames = dataset.num_frames();
    let input_dim = dataset.input_dim();

    let mut short_values = Vec::new();
    let mut long_values = Vec::new();
    let mut short_dim = 0;
    let mut long_dim = 0;

    for batch_start in (0..samples).step_by(batch_size) {
        let batch_end = (batch_start + batch_size).min(samples);
        let batch_len = batch_end - batch_start;

        // Flatten the batch row-major: [batch, frame, feature]
        let mut inputs_vec = Vec::with_capacity(batch_len * frames * input_dim);
        for idx in batch_start..batch_end {
            let sample = dataset.get(idx).ok_or_else(|| {
                AnalysisError::Model(format!("missing dataset sample at index {}", idx))
            })?;
            inputs_vec.extend(sample.features.iter().copied());
        }

        let inputs = Tensor::<B, 3>::from_data(
            TensorData::new(inputs_vec, [batch_len, frames, input_dim]),
            device,
        );
        let (short, long) = model.forward(inputs);

        // Output widths come from the checkpoint, not the dataset
        short_dim = short.dims()[2];
        long_dim = long.dims()[2];

        short_values.extend(tensor_values(short)?);
        long_values.extend(tensor_values(long)?);

        debug!(batch_start, batch_len, "encoded batch");
    }

    // Batches were appended in sample order, so the values are already row-major
    let short_term = Array3::from_shape_vec((samples, frames, short_dim), short_values)
        .map_err(|e| AnalysisError::ShapeMismatch(format!("short-term output: {e}")))?;
    let long_term = Array3::from_shape_vec((samples, frames, long_dim), long_values)
        .map_err(|e| AnalysisError::ShapeMismatch(format!("long-term output: {e}")))?;

    info!(
        samples,
        frames,
        short_term_dim = short_dim,
        long_term_dim = long_dim,
        "embeddings extracted"
    );
    EmbeddingPair::new(short_term, long_term)
}

fn tensor_values<B: Backend>(tensor: Tensor<B, 3>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| AnalysisError::Model(format!("reading encoder output: {:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FeatureMode, PoseTrack};
    use crate::model::MultiscaleEncoderConfig;
    use burn::backend::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn pair(samples: usize, frames: usize, short: usize, long: usize) -> EmbeddingPair {
        let short_term = Array3::from_shape_fn((samples, frames, short), |(s, f, d)| {
            (s * 1000 + f * 10 + d) as f32
        });
        let long_term =
            Array3::from_shape_fn((samples, frames, long), |(s, f, d)| -((s * 100 + f + d) as f32));
        EmbeddingPair::new(short_term, long_term).unwrap()
    }

    #[test]
    fn combined_dim_is_sum_of_parts() {
        let embeddings = pair(3, 5, 4, 6);
        let combined = embeddings.combined().unwrap();
        assert_eq!(combined.dim(), (3, 5, 10));
        assert_eq!(combined[[1, 2, 0]], embeddings.short_term()[[1, 2, 0]]);
        assert_eq!(combined[[1, 2, 4]], embeddings.long_term()[[1, 2, 0]]);
    }

    #[test]
    fn mismatched_leading_axes_are_rejected() {
        let short_term = Array3::<f32>::zeros((3, 5, 4));
        let long_term = Array3::<f32>::zeros((3, 6, 4));
        assert!(matches!(
            EmbeddingPair::new(short_term, long_term),
            Err(AnalysisError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn variant_parsing() {
        assert_eq!("Short".parse::<EmbeddingVariant>().unwrap(), EmbeddingVariant::Short);
        assert_eq!("long_term".parse::<EmbeddingVariant>().unwrap(), EmbeddingVariant::Long);
        assert_eq!("combined".parse::<EmbeddingVariant>().unwrap(), EmbeddingVariant::Combined);
        assert!("medium".parse::<EmbeddingVariant>().is_err());
    }

    #[test]
    fn sequence_embeddings_average_frames() {
        let embeddings = pair(2, 4, 3, 1);
        let sequence = sequence_embeddings(embeddings.short_term()).unwrap();
        assert_eq!(sequence.dim(), (2, 3));
        // Frames 0..4 contribute 0, 10, 20, 30 -> mean 15.
        assert_eq!(sequence[[1, 2]], 1000.0 + 15.0 + 2.0);
    }

    #[test]
    fn frame_embeddings_are_row_major() {
        let embeddings = pair(10, 100, 64, 8);
        let frames = frame_embeddings(embeddings.short_term()).unwrap();
        assert_eq!(frames.dim(), (1000, 64));
        for row in [0usize, 99, 100, 537, 999] {
            let (sample, frame) = (row / 100, row % 100);
            assert_eq!(frames[[row, 5]], embeddings.short_term()[[sample, frame, 5]]);
        }
    }

    #[test]
    fn npz_round_trip_keeps_both_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(EMBEDDINGS_FILE);
        let embeddings = pair(2, 3, 4, 5);

        embeddings.save_npz(&path).unwrap();
        let loaded = EmbeddingPair::load_npz(&path).unwrap();
        assert_eq!(loaded, embeddings);
    }

    #[test]
    fn extraction_shapes_and_batch_independence() {
        let device = Default::default();
        let tracks: Vec<PoseTrack> = (0..5)
            .map(|i| PoseTrack {
                source_name: format!("rec{i}"),
                category: "cat".into(),
                keypoints: Array3::from_shape_fn((12, 3, 2), |(f, k, c)| {
                    ((i + f * k + c) % 7) as f32 * 0.3
                }),
            })
            .collect();
        let dataset = PoseDataset::from_tracks(&tracks, FeatureMode::SubtractCentroid, 4).unwrap();
        let model = MultiscaleEncoderConfig::new(dataset.input_dim(), 6, 3)
            .init::<TestBackend>(&device);

        let whole = extract_embeddings(&model, &dataset, 16, &device).unwrap();
        let batched = extract_embeddings(&model, &dataset, 2, &device).unwrap();

        assert_eq!(whole.short_term().dim(), (5, 12, 6));
        assert_eq!(whole.long_term().dim(), (5, 12, 3));
        for (a, b) in whole.short_term().iter().zip(batched.short_term().iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn cache_key_tracks_features_and_checkpoint() {
        let dir = TempDir::new().unwrap();
        let checkpoint = dir.path().join("bams-test.mpk");
        std::fs::write(&checkpoint, b"weights").unwrap();
        let encoder = MultiscaleEncoderConfig::new(10, 4, 6);

        let key = EmbeddingCacheKey::new(FeatureMode::SubtractCentroid, 8, &checkpoint, &encoder).unwrap();
        assert_eq!(key.checkpoint, "bams-test.mpk");
        assert_eq!(key.checkpoint_bytes, 7);

        let raw = EmbeddingCacheKey::new(FeatureMode::Raw, 8, &checkpoint, &encoder).unwrap();
        assert_ne!(key, raw);
        let fewer_bins = EmbeddingCacheKey::new(FeatureMode::SubtractCentroid, 4, &checkpoint, &encoder).unwrap();
        assert_ne!(key, fewer_bins);

        std::fs::write(&checkpoint, b"retrained weights").unwrap();
        let retrained = EmbeddingCacheKey::new(FeatureMode::SubtractCentroid, 8, &checkpoint, &encoder).unwrap();
        assert_ne!(key, retrained);

        let path = dir.path().join(EMBEDDINGS_KEY_FILE);
        retrained.save_json(&path).unwrap();
        assert_eq!(EmbeddingCacheKey::load_json(&path).unwrap(), retrained);
    }

    #[test]
    fn extraction_rejects_zero_batch() {
        let device = Default::default();
        let tracks = vec![PoseTrack {
            source_name: "a".into(),
            category: "c".into(),
            keypoints: Array3::zeros((4, 2, 2)),
        }];
        let dataset = PoseDataset::from_tracks(&tracks, FeatureMode::Raw, 0).unwrap();
        let model = MultiscaleEncoderConfig::new(4, 2, 2).init::<TestBackend>(&device);
        assert!(extract_embeddings(&model, &dataset, 0, &device).is_err());
    }
}
