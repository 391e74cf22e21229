use behavior_atlas::{config::AnalysisConfig, init_tracing, pipeline::run_analysis};
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    // Load config from environment variables (for parameter sweeps) or use defaults
    let config = AnalysisConfig::from_env()?;

    println!("🐭 Behavior atlas starting...");
    println!("Configuration:");
    println!("  - Model folder: {}", config.model_dir.display());
    println!("  - Pose data: {}", config.data_dir.display());
    println!(
        "  - Features: {} (+{} angle bins)",
        config.feature_mode, config.angle_bins
    );
    println!("  - Embeddings: {}", config.variant);
    println!("  - Sample size: {} (seed {})", config.sample_size, config.seed);
    println!(
        "  - t-SNE: perplexity {}, {} iterations",
        config.perplexity, config.max_iter
    );
    println!(
        "  - DBSCAN: eps {}, min_points {}",
        config.eps, config.min_points
    );
    println!();

    let report = run_analysis(&config)?;
    info!(output = %report.output_dir.display(), "session finished");

    println!();
    println!("✅ Analysis complete!");
    println!(
        "  - Embeddings: {}",
        if report.embeddings_reused { "reused from cache" } else { "extracted" }
    );
    println!(
        "  - Clusters: {} ({} noise points of {})",
        report.summary.num_clusters, report.summary.noise, report.summary.num_points
    );
    println!();
    println!("📂 Output files:");
    println!("  {}", report.clusters_path.display());
    if let Some(scatter) = &report.scatter_path {
        println!("  {}", scatter.display());
    }
    println!("  {}", report.sequence_embeddings_path.display());
    println!("  {} ({} clips)", report.manifest_path.display(), report.clips.len());

    Ok(())
}
