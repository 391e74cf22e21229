use burn::{
    config::Config,
    module::Module,
    record::{CompactRecorder, Recorder},
    tensor::backend::Backend,
};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{AnalysisError, Result};
use crate::model::{MultiscaleEncoder, MultiscaleEncoderConfig};

/// Checkpoint files are named `bams-<label>.mpk`.
pub const CHECKPOINT_PREFIX: &str = "bams-";
pub const CHECKPOINT_SUFFIX: &str = ".mpk";
/// Encoder hyperparameters stored next to the checkpoint.
pub const ENCODER_CONFIG_FILE: &str = "encoder_config.json";

/// Find the one checkpoint in `model_dir` that follows the naming convention.
///
/// Zero or several matches are configuration errors.
pub fn locate_checkpoint(model_dir: &Path) -> Result<PathBuf> {
    let mut candidates = Vec::new();

    for entry in std::fs::read_dir(model_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        if let Some(filename) = path.file_name().and_then(|s| s.to_str()) {
            if filename.starts_with(CHECKPOINT_PREFIX) && filename.ends_with(CHECKPOINT_SUFFIX) {
                candidates.push(path);
            }
        }
    }

    candidates.sort();
    match candidates.len() {
        0 => Err(AnalysisError::CheckpointNotFound {
            dir: model_dir.to_path_buf(),
            pattern: format!("{CHECKPOINT_PREFIX}*{CHECKPOINT_SUFFIX}"),
        }),
        1 => Ok(candidates.remove(0)),
        _ => Err(AnalysisError::AmbiguousCheckpoint {
            dir: model_dir.to_path_buf(),
            candidates: candidates
                .iter()
                .filter_map(|p| p.file_name().and_then(|s| s.to_str()).map(String::from))
                .collect(),
        }),
    }
}

pub fn load_encoder_config(model_dir: &Path) -> Result<MultiscaleEncoderConfig> {
    let path = model_dir.join(ENCODER_CONFIG_FILE);
    MultiscaleEncoderConfig::load(&path)
        .map_err(|e| AnalysisError::Model(format!("failed to read {}: {:?}", path.display(), e)))
}

/// Load the pretrained encoder from `model_dir`.
pub fn load_encoder<B: Backend>(
    model_dir: &Path,
    device: &B::Device,
) -> Result<(MultiscaleEncoder<B>, MultiscaleEncoderConfig)> {
    // Checkpoint and layout first, so a bad folder fails before any allocation
    let path = locate_checkpoint(model_dir)?;
    let config = load_encoder_config(model_dir)?;
    let model = config.init::<B>(device);

    // Weights replace the fresh initialization
    let record = CompactRecorder::new()
        .load(path.clone(), device)
        .map_err(|e| AnalysisError::Model(format!("failed to load checkpoint: {:?}", e)))?;

    let model = model.load_record(record);

    info!(checkpoint = %path.display(), input_dim = config.input_dim, "encoder loaded");
    Ok((model, config))
}

/// Save an encoder as `bams-<label>.mpk` plus its config.
pub fn save_encoder<B: Backend>(
    model: &MultiscaleEncoder<B>,
    config: &MultiscaleEncoderConfig,
    model_dir: &Path,
    label: &str,
) -> Result<PathBuf> {
    std::fs::create_dir_all(model_dir)?;

    // Weights
    let path = model_dir.join(format!("{CHECKPOINT_PREFIX}{label}{CHECKPOINT_SUFFIX}"));
    CompactRecorder::new()
        .record(model.clone().into_record(), path.clone())
        .map_err(|e| AnalysisError::Model(format!("failed to save checkpoint: {:?}", e)))?;

    // Layout, needed to rebuild the module before loading
    config.save(model_dir.join(ENCODER_CONFIG_FILE))?;

    info!(checkpoint = %path.display(), "encoder saved");
    Ok(path)
}
