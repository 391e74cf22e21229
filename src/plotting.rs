use plotters::prelude::*;
use std::ops::Range;
use std::path::Path;
use tracing::info;

use crate::clustering::{ClusteredFrames, NOISE_LABEL};
use crate::export::RunKey;

/// Clusters beyond this many are drawn but left out of the legend.
const MAX_LEGEND_ENTRIES: usize = 20;

const NOISE_COLOR: RGBColor = RGBColor(170, 170, 170);

/// Viridis colormap - maps value in [0, 1] to RGB
fn viridis_color(t: f64) -> RGBColor {
    // Polynomial fit of matplotlib's viridis (purple -> cyan -> yellow)
    let r = (0.267 + t * (0.329 - 0.267 + t * (0.984 - 0.329))) * 255.0;
    let g = (0.005 + t * (0.569 - 0.005 + t * (0.906 - 0.569))) * 255.0;
    let b = (0.329 + t * (0.758 - 0.329 - t * (0.758 - 0.121))) * 255.0;

    RGBColor(
        r.clamp(0.0, 255.0) as u8,
        g.clamp(0.0, 255.0) as u8,
        b.clamp(0.0, 255.0) as u8,
    )
}

/// Color for a cluster label; noise is always gray.
pub fn cluster_color(label: i32, num_clusters: usize) -> RGBColor {
    if label == NOISE_LABEL {
        return NOISE_COLOR;
    }
    let span = num_clusters.saturating_sub(1).max(1) as f64;
    viridis_color((label.max(0) as f64 / span).min(1.0))
}

/// Axis range of one coordinate column, padded so single points stay visible.
fn axis_range(values: impl Iterator<Item = f64>) -> Range<f64> {
    let (min, max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !min.is_finite() || !max.is_finite() {
        return 0.0..1.0;
    }
    let pad = ((max - min) * 0.05).max(1e-3);
    (min - pad)..(max + pad)
}

fn points_with(clustered: &ClusteredFrames, label: i32) -> Vec<(f64, f64, f64)> {
    let coords = clustered.coords();
    clustered
        .labels()
        .iter()
        .enumerate()
        .filter(|(_, l)| **l == label)
        .map(|(row, _)| (coords[[row, 0]], coords[[row, 1]], coords[[row, 2]]))
        .collect()
}

/// 3D scatter of the projected frames, one color per cluster and noise in gray.
pub fn plot_clusters_3d(
    clustered: &ClusteredFrames,
    run: &RunKey,
    output_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let coords = clustered.coords();
    let labels = clustered.labels();
    let cluster_ids = clustered.cluster_ids();

    let root = BitMapBackend::new(output_path, (1200, 1000)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(
            format!("Behavior clusters: {}", run.describe()),
            ("sans-serif", 32).into_font(),
        )
        .margin(20)
        .build_cartesian_3d(
            axis_range(coords.column(0).iter().copied()),
            axis_range(coords.column(1).iter().copied()),
            axis_range(coords.column(2).iter().copied()),
        )?;

    chart.with_projection(|mut pb| {
        pb.pitch = 0.5;
        pb.yaw = 0.6;
        pb.scale = 0.85;
        pb.into_matrix()
    });

    chart
        .configure_axes()
        .light_grid_style(BLACK.mix(0.15))
        .max_light_lines(3)
        .draw()?;

    // Noise first so clusters draw on top.
    let noise_count = labels.iter().filter(|&&l| l == NOISE_LABEL).count();
    if noise_count > 0 {
        chart
            .draw_series(
                points_with(clustered, NOISE_LABEL)
                    .into_iter()
                    .map(|p| Circle::new(p, 2, NOISE_COLOR.mix(0.5).filled())),
            )?
            .label(format!("noise ({noise_count})"))
            .legend(|(x, y)| Circle::new((x, y), 4, NOISE_COLOR.filled()));
    }

    for (i, &cluster) in cluster_ids.iter().enumerate() {
        let color = cluster_color(cluster, cluster_ids.len());
        let series = chart.draw_series(
            points_with(clustered, cluster)
                .into_iter()
                .map(move |p| Circle::new(p, 3, color.filled())),
        )?;
        if i < MAX_LEGEND_ENTRIES {
            series
                .label(format!("cluster {cluster}"))
                .legend(move |(x, y)| Circle::new((x, y), 4, color.filled()));
        }
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;

    root.present()?;
    info!(path = %output_path.display(), clusters = cluster_ids.len(), noise = noise_count, "cluster scatter saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plotting_function_has_expected_signature() {
        // Compile-time check that the API stays in place for the replot binary.
        let _: fn(&ClusteredFrames, &RunKey, &Path) -> Result<(), Box<dyn std::error::Error>> =
            plot_clusters_3d;
    }

    #[test]
    fn noise_is_gray_and_clusters_are_not() {
        assert_eq!(cluster_color(NOISE_LABEL, 5), NOISE_COLOR);
        for label in 0..5 {
            assert_ne!(cluster_color(label, 5), NOISE_COLOR);
        }
    }

    #[test]
    fn cluster_colors_span_the_colormap() {
        assert_eq!(cluster_color(0, 3), viridis_color(0.0));
        assert_eq!(cluster_color(2, 3), viridis_color(1.0));
        assert_ne!(cluster_color(0, 3), cluster_color(1, 3));
        // A lone cluster still gets a color.
        assert_eq!(cluster_color(0, 1), viridis_color(0.0));
    }

    #[test]
    fn axis_range_pads_degenerate_columns() {
        let range = axis_range([2.0, 2.0].into_iter());
        assert!(range.start < 2.0 && range.end > 2.0);

        let range = axis_range([0.0, 1.0].into_iter());
        assert!((range.start + 0.05).abs() < 1e-12);
        assert!((range.end - 1.05).abs() < 1e-12);

        assert_eq!(axis_range(std::iter::empty()), 0.0..1.0);
    }
}
