use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use crate::clustering::ClusterParams;
use crate::data::FeatureMode;
use crate::embedding::EmbeddingVariant;
use crate::error::{AnalysisError, Result};
use crate::projection::TsneProjector;

/// Every user-tunable knob of an analysis session.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub model_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Folder holding the source videos; clips are still planned without it.
    pub media_dir: Option<PathBuf>,
    pub feature_mode: FeatureMode,
    /// Histogram-of-angles bins appended to every frame (0 disables).
    pub angle_bins: usize,
    pub variant: EmbeddingVariant,
    pub sample_size: usize,
    pub seed: u64,
    pub eps: f64,
    pub min_points: usize,
    pub perplexity: f64,
    pub max_iter: usize,
    /// Recordings per inference batch.
    pub batch_size: usize,
    pub clip_half_window: usize,
    pub clips_per_cluster: usize,
    pub fps: f64,
    pub reuse_embeddings: bool,
    pub render_plot: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models/bams"),
            data_dir: PathBuf::from("data"),
            media_dir: None,
            feature_mode: FeatureMode::SubtractCentroid,
            angle_bins: 32,
            variant: EmbeddingVariant::Combined,
            sample_size: 5000,
            seed: 42,
            eps: 0.15,
            min_points: 5,
            perplexity: 30.0,
            max_iter: 1000,
            batch_size: 16,
            clip_half_window: 15,
            clips_per_cluster: 1,
            fps: 30.0,
            reuse_embeddings: true,
            render_plot: true,
        }
    }
}

impl AnalysisConfig {
    /// Defaults overridden by `ATLAS_*` environment variables, so sweeps can be
    /// scripted without touching code.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            model_dir: env_or("ATLAS_MODEL_DIR", defaults.model_dir)?,
            data_dir: env_or("ATLAS_DATA_DIR", defaults.data_dir)?,
            media_dir: match std::env::var("ATLAS_MEDIA_DIR") {
                Ok(value) if !value.is_empty() => Some(PathBuf::from(value)),
                _ => None,
            },
            feature_mode: env_or("ATLAS_FEATURE_MODE", defaults.feature_mode)?,
            angle_bins: env_or("ATLAS_ANGLE_BINS", defaults.angle_bins)?,
            variant: env_or("ATLAS_VARIANT", defaults.variant)?,
            sample_size: env_or("ATLAS_SAMPLE_SIZE", defaults.sample_size)?,
            seed: env_or("ATLAS_SEED", defaults.seed)?,
            eps: env_or("ATLAS_EPS", defaults.eps)?,
            min_points: env_or("ATLAS_MIN_POINTS", defaults.min_points)?,
            perplexity: env_or("ATLAS_PERPLEXITY", defaults.perplexity)?,
            max_iter: env_or("ATLAS_MAX_ITER", defaults.max_iter)?,
            batch_size: env_or("ATLAS_BATCH_SIZE", defaults.batch_size)?,
            clip_half_window: env_or("ATLAS_CLIP_HALF_WINDOW", defaults.clip_half_window)?,
            clips_per_cluster: env_or("ATLAS_CLIPS_PER_CLUSTER", defaults.clips_per_cluster)?,
            fps: env_or("ATLAS_FPS", defaults.fps)?,
            reuse_embeddings: env_or("ATLAS_REUSE_EMBEDDINGS", defaults.reuse_embeddings)?,
            render_plot: env_or("ATLAS_RENDER_PLOT", defaults.render_plot)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_size == 0 {
            return Err(AnalysisError::InvalidParameter(
                "sample_size must be greater than 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(AnalysisError::InvalidParameter(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if self.fps.is_nan() || self.fps <= 0.0 {
            return Err(AnalysisError::InvalidParameter(format!(
                "fps must be positive, got {}",
                self.fps
            )));
        }
        self.cluster_params().validate()?;
        self.projector().validate()?;
        Ok(())
    }

    pub fn cluster_params(&self) -> ClusterParams {
        ClusterParams::new(self.eps, self.min_points)
    }

    pub fn projector(&self) -> TsneProjector {
        TsneProjector::new(self.seed)
            .with_perplexity(self.perplexity)
            .with_max_iter(self.max_iter)
    }

    /// Output folder for this session: `<model_dir>/<sample_size>`.
    pub fn output_dir(&self) -> PathBuf {
        self.model_dir.join(self.sample_size.to_string())
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| AnalysisError::InvalidConfig {
                    key: key.to_string(),
                    message: format!("{value:?}: {e}"),
                })
        }
        _ => Ok(default),
    }
}
