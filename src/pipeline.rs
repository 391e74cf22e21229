use burn::backend::{ndarray::NdArrayDevice, NdArray};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use crate::checkpoint::{load_encoder, load_encoder_config, locate_checkpoint};
use crate::clips::{
    plan_clips, render_pose_clip, save_manifest, ClipSpec, ClipWindow, MediaLibrary, MANIFEST_FILE,
};
use crate::clustering::{ClusterSummary, DbscanAssigner};
use crate::config::AnalysisConfig;
use crate::data::{
    load_annotations, load_pose_tracks, save_annotations, PoseDataset, PoseTrack, ANNOTATIONS_FILE,
};
use crate::embedding::{
    extract_embeddings, save_sequence_embeddings, sequence_embeddings, EmbeddingCacheKey,
    EmbeddingPair, EMBEDDINGS_FILE, EMBEDDINGS_KEY_FILE,
};
use crate::error::{AnalysisError, Result};
use crate::export::{ClusterExport, RunKey};
use crate::plotting::plot_clusters_3d;
use crate::sampling::FrameTable;

/// Inference runs on the CPU.
type InferenceBackend = NdArray;

/// What a session produced and where it went.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub run: RunKey,
    pub checkpoint: PathBuf,
    pub output_dir: PathBuf,
    pub embeddings_reused: bool,
    pub summary: ClusterSummary,
    pub clusters_path: PathBuf,
    pub scatter_path: Option<PathBuf>,
    pub sequence_embeddings_path: PathBuf,
    pub manifest_path: PathBuf,
    pub clips: Vec<ClipSpec>,
}

/// Run one analysis session end to end.
pub fn run_analysis(config: &AnalysisConfig) -> Result<AnalysisReport> {
    let start = Instant::now();
    config.validate()?;

    // A missing or ambiguous checkpoint is fatal before any computation.
    let checkpoint = locate_checkpoint(&config.model_dir)?;
    let encoder_config = load_encoder_config(&config.model_dir)?;
    info!(checkpoint = %checkpoint.display(), "using checkpoint");

    // Load pose tracks and build the model input
    let tracks = load_pose_tracks(&config.data_dir)?;
    let dataset = PoseDataset::from_tracks(&tracks, config.feature_mode, config.angle_bins)?;
    dataset.ensure_input_dim(encoder_config.input_dim)?;

    // Reuse cached embeddings only when they came from this exact setup
    let cache_key = EmbeddingCacheKey::new(
        config.feature_mode,
        config.angle_bins,
        &checkpoint,
        &encoder_config,
    )?;
    let device = NdArrayDevice::default();
    let (embeddings, embeddings_reused) =
        obtain_embeddings(config, &dataset, &cache_key, &device)?;

    // Frame table for the chosen variant
    let chosen = embeddings.variant(config.variant)?;
    let table = FrameTable::from_embeddings(&chosen, &dataset.source_names())?;

    // Fail before anything lands in the output folder
    if config.sample_size > table.len() {
        return Err(AnalysisError::InsufficientFrames {
            requested: config.sample_size,
            available: table.len(),
        });
    }

    let output_dir = config.output_dir();
    fs::create_dir_all(&output_dir)?;

    // Recording-level embeddings
    let sequence = sequence_embeddings(&chosen)?;
    let sequence_embeddings_path =
        output_dir.join(format!("sequence_embeddings_{}.npy", config.variant));
    save_sequence_embeddings(&sequence, &sequence_embeddings_path)?;

    // Sample, project and cluster
    let stage = Instant::now();
    let sampled = table.sample(config.sample_size, config.seed)?;
    let projected = sampled.project(&config.projector())?;
    info!(elapsed = ?stage.elapsed(), "projection finished");

    let clustered = projected.cluster(&DbscanAssigner::new(config.cluster_params())?)?;
    let summary = clustered.summary();

    // Cluster assignments, keyed by run parameters
    let run = RunKey::from_config(config);
    let clusters_path = output_dir.join(run.clusters_file_name());
    ClusterExport::new(run.clone(), &clustered).save_json(&clusters_path)?;
    info!(path = %clusters_path.display(), "cluster assignments saved");

    // 3D scatter
    let scatter_path = if config.render_plot {
        let path = output_dir.join(run.scatter_file_name());
        plot_clusters_3d(&clustered, &run, &path)
            .map_err(|e| AnalysisError::Render(format!("{}: {e}", path.display())))?;
        Some(path)
    } else {
        None
    };

    // Clips around each cluster's representatives
    let media = match &config.media_dir {
        Some(dir) => MediaLibrary::scan(dir)?,
        None => MediaLibrary::default(),
    };
    let window = ClipWindow {
        half_window: config.clip_half_window,
        per_cluster: config.clips_per_cluster,
        num_frames: dataset.num_frames(),
        fps: config.fps,
    };
    let clips = plan_clips(&clustered, &media, window)?;

    let clips_dir = output_dir.join(run.clips_dir_name());
    fs::create_dir_all(&clips_dir)?;
    let manifest_path = clips_dir.join(MANIFEST_FILE);
    save_manifest(&clips, &manifest_path)?;
    render_clips(&tracks, &clips, &clips_dir)?;

    info!(
        clusters = summary.num_clusters,
        noise = summary.noise,
        clips = clips.len(),
        output = %output_dir.display(),
        elapsed = ?start.elapsed(),
        "analysis complete"
    );

    Ok(AnalysisReport {
        run,
        checkpoint,
        output_dir,
        embeddings_reused,
        summary,
        clusters_path,
        scatter_path,
        sequence_embeddings_path,
        manifest_path,
        clips,
    })
}

/// Load cached embeddings when they still describe this dataset and setup,
/// otherwise run the encoder and refresh the cache.
fn obtain_embeddings(
    config: &AnalysisConfig,
    dataset: &PoseDataset,
    cache_key: &EmbeddingCacheKey,
    device: &NdArrayDevice,
) -> Result<(EmbeddingPair, bool)> {
    let cache_path = config.model_dir.join(EMBEDDINGS_FILE);
    let key_path = config.model_dir.join(EMBEDDINGS_KEY_FILE);
    let annotations_path = config.model_dir.join(ANNOTATIONS_FILE);

    if config.reuse_embeddings && cache_path.exists() {
        let cached = EmbeddingPair::load_npz(&cache_path)?;
        if cache_matches(&cached, dataset, &annotations_path, cache_key, &key_path)? {
            info!(path = %cache_path.display(), "reusing cached embeddings");
            return Ok((cached, true));
        }
        warn!(path = %cache_path.display(), "cached embeddings do not match this run; recomputing");
    }

    // Inference on the full dataset
    let stage = Instant::now();
    let (model, _) = load_encoder::<InferenceBackend>(&config.model_dir, device)?;
    let embeddings = extract_embeddings(&model, dataset, config.batch_size, device)?;
    info!(elapsed = ?stage.elapsed(), "embeddings extracted");

    // Persist the cache together with what produced it
    embeddings.save_npz(&cache_path)?;
    save_annotations(dataset.annotations(), &annotations_path)?;
    cache_key.save_json(&key_path)?;
    Ok((embeddings, false))
}

fn cache_matches(
    cached: &EmbeddingPair,
    dataset: &PoseDataset,
    annotations_path: &Path,
    cache_key: &EmbeddingCacheKey,
    key_path: &Path,
) -> Result<bool> {
    if (cached.num_samples(), cached.num_frames()) != (dataset.num_samples(), dataset.num_frames()) {
        return Ok(false);
    }
    // Caches written without a key have unknown provenance
    if !annotations_path.exists() || !key_path.exists() {
        return Ok(false);
    }
    if EmbeddingCacheKey::load_json(key_path)? != *cache_key {
        return Ok(false);
    }
    Ok(load_annotations(annotations_path)? == dataset.annotations())
}

fn render_clips(tracks: &[PoseTrack], clips: &[ClipSpec], clips_dir: &Path) -> Result<()> {
    let by_name: HashMap<&str, &PoseTrack> = tracks
        .iter()
        .map(|track| (track.source_name.as_str(), track))
        .collect();

    for clip in clips {
        let track = by_name.get(clip.source_name.as_str()).ok_or_else(|| {
            AnalysisError::InvalidParameter(format!("no pose track named {}", clip.source_name))
        })?;
        render_pose_clip(track, clip, &clips_dir.join(clip.file_name()))?;
    }

    info!(dir = %clips_dir.display(), clips = clips.len(), "pose clips rendered");
    Ok(())
}
