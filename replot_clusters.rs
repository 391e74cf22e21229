/// Redraw the cluster scatter from a saved cluster JSON
/// Usage: cargo run --bin replot_clusters -- <clusters.json> [output.png]
use behavior_atlas::{export::ClusterExport, init_tracing, plotting};
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let Some(input) = args.get(1).map(PathBuf::from) else {
        eprintln!("usage: replot_clusters <clusters.json> [output.png]");
        std::process::exit(2);
    };

    let export = ClusterExport::load_json(&input)?;
    let output = match args.get(2) {
        Some(path) => PathBuf::from(path),
        None => input.with_file_name(export.run.scatter_file_name()),
    };

    println!("📊 Replotting {}...", input.display());
    println!("  - Run: {}", export.run.describe());
    println!(
        "  - Points: {} ({} clusters, {} noise)",
        export.points.len(),
        export.summary.num_clusters,
        export.summary.noise
    );

    let clustered = export.clustered()?;
    plotting::plot_clusters_3d(&clustered, &export.run, &output)?;

    println!("✅ Scatter saved to: {}", output.display());
    Ok(())
}
