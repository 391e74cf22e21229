use burn::data::dataset::Dataset;
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use ndarray_npy::read_npy;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{AnalysisError, Result};

/// File name of the annotations table kept next to the checkpoint.
pub const ANNOTATIONS_FILE: &str = "annotations.json";

const TRACK_EXTENSION: &str = "npy";

/// How raw keypoint coordinates are turned into per-frame model inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureMode {
    Raw,
    SubtractCentroid,
}

impl FeatureMode {
    pub fn name(&self) -> &'static str {
        match self {
            FeatureMode::Raw => "raw",
            FeatureMode::SubtractCentroid => "subtract_centroid",
        }
    }
}

impl fmt::Display for FeatureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FeatureMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "raw" => Ok(FeatureMode::Raw),
            "subtract_centroid" => Ok(FeatureMode::SubtractCentroid),
            other => Err(format!(
                "unknown feature mode {other:?} (expected raw or subtract_centroid)"
            )),
        }
    }
}

/// One recording's keypoint track: `keypoints[frame, keypoint, coord]`.
#[derive(Debug, Clone)]
pub struct PoseTrack {
    pub source_name: String,
    pub category: String,
    pub keypoints: Array3<f32>,
}

impl PoseTrack {
    pub fn num_frames(&self) -> usize {
        self.keypoints.len_of(Axis(0))
    }

    pub fn num_keypoints(&self) -> usize {
        self.keypoints.len_of(Axis(1))
    }

    pub fn num_coords(&self) -> usize {
        self.keypoints.len_of(Axis(2))
    }

    /// Keypoints of a single frame, shape `[keypoint, coord]`.
    pub fn frame(&self, frame: usize) -> ArrayView2<'_, f32> {
        self.keypoints.index_axis(Axis(0), frame)
    }
}

/// One row of the annotations table, in dataset order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub source_name: String,
    pub category: String,
    pub num_frames: usize,
}

/// Load every `<category>/<recording>.npy` track under `data_dir`.
///
/// Categories and recordings are visited in name order so the dataset layout is
/// stable across runs. Arrays stored as `f64` are narrowed to `f32`.
pub fn load_pose_tracks(data_dir: &Path) -> Result<Vec<PoseTrack>> {
    let mut categories: Vec<PathBuf> = fs::read_dir(data_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    categories.sort();

    let mut tracks = Vec::new();
    for category_dir in categories {
        let category = file_name(&category_dir);

        let mut files: Vec<PathBuf> = fs::read_dir(&category_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|ext| ext.to_str()) == Some(TRACK_EXTENSION)
            })
            .collect();
        files.sort();

        for path in files {
            let keypoints = read_track_array(&path)?;
            let source_name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            debug!(source = %source_name, category = %category, shape = ?keypoints.dim(), "loaded pose track");
            tracks.push(PoseTrack {
                source_name,
                category: category.clone(),
                keypoints,
            });
        }
    }

    if tracks.is_empty() {
        return Err(AnalysisError::NoPoseData(data_dir.to_path_buf()));
    }

    info!(tracks = tracks.len(), dir = %data_dir.display(), "pose tracks loaded");
    Ok(tracks)
}

fn read_track_array(path: &Path) -> Result<Array3<f32>> {
    match read_npy::<_, Array3<f32>>(path) {
        Ok(array) => Ok(array),
        Err(first_err) => read_npy::<_, Array3<f64>>(path)
            .map(|array| array.mapv(|v| v as f32))
            .map_err(|_| {
                AnalysisError::Persistence(format!(
                    "failed to read pose track {}: {}",
                    path.display(),
                    first_err
                ))
            }),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Check that all tracks share frame, keypoint and coordinate counts.
///
/// Returns `(frames, keypoints, coords)` of the run.
pub fn validate_tracks(tracks: &[PoseTrack]) -> Result<(usize, usize, usize)> {
    let first = tracks.first().ok_or_else(|| {
        AnalysisError::InvalidParameter("cannot build a dataset from zero tracks".to_string())
    })?;
    let expected = first.keypoints.dim();

    if expected.0 == 0 || expected.1 == 0 || expected.2 == 0 {
        return Err(AnalysisError::InconsistentTracks {
            source_name: first.source_name.clone(),
            expected: "non-empty (frames, keypoints, coords)".to_string(),
            found: format!("{:?}", expected),
        });
    }

    // Frames are traced by recording name alone, so names must be unique.
    let mut seen: HashMap<&str, &str> = HashMap::new();
    for track in tracks {
        if track.source_name.is_empty() {
            return Err(AnalysisError::InvalidParameter(format!(
                "a pose track in category {:?} has an empty recording name",
                track.category
            )));
        }
        if let Some(first) = seen.insert(track.source_name.as_str(), track.category.as_str()) {
            return Err(AnalysisError::DuplicateSourceName {
                source_name: track.source_name.clone(),
                first: first.to_string(),
                second: track.category.clone(),
            });
        }
    }

    for track in &tracks[1..] {
        let found = track.keypoints.dim();
        if found != expected {
            return Err(AnalysisError::InconsistentTracks {
                source_name: track.source_name.clone(),
                expected: format!(
                    "{} frames x {} keypoints x {} coords",
                    expected.0, expected.1, expected.2
                ),
                found: format!(
                    "{} frames x {} keypoints x {} coords",
                    found.0, found.1, found.2
                ),
            });
        }
    }

    Ok(expected)
}

/// A single recording's processed input, `features[frame, feature]`.
#[derive(Debug, Clone)]
pub struct PoseSample {
    pub source_name: String,
    pub features: Array2<f32>,
}

/// Model input for a run: `features[sample, frame, feature]` plus the parallel
/// annotations table (one row per sample, same order).
#[derive(Debug, Clone)]
pub struct PoseDataset {
    features: Array3<f32>,
    annotations: Vec<Annotation>,
}

impl PoseDataset {
    /// Build the dataset from validated tracks.
    ///
    /// Non-finite coordinates are zeroed before processing. With `angle_bins > 0`
    /// a normalized histogram of keypoint angles around the frame centroid is
    /// appended to every frame.
    pub fn from_tracks(tracks: &[PoseTrack], mode: FeatureMode, angle_bins: usize) -> Result<Self> {
        let (frames, keypoints, coords) = validate_tracks(tracks)?;
        if angle_bins > 0 && coords < 2 {
            return Err(AnalysisError::InvalidParameter(format!(
                "angle histogram needs at least 2 coordinates, tracks have {}",
                coords
            )));
        }

        let dim = feature_dim(keypoints, coords, angle_bins);
        let mut features = Array3::<f32>::zeros((tracks.len(), frames, dim));
        let mut annotations = Vec::with_capacity(tracks.len());

        for (sample, track) in tracks.iter().enumerate() {
            for frame in 0..frames {
                let row = frame_features(track.frame(frame), mode, angle_bins);
                features
                    .slice_mut(s![sample, frame, ..])
                    .assign(&ArrayView1::from(row.as_slice()));
            }
            annotations.push(Annotation {
                source_name: track.source_name.clone(),
                category: track.category.clone(),
                num_frames: frames,
            });
        }

        info!(
            samples = tracks.len(),
            frames,
            input_dim = dim,
            mode = %mode,
            angle_bins,
            "pose dataset built"
        );

        Ok(Self {
            features,
            annotations,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.features.len_of(Axis(0))
    }

    pub fn num_frames(&self) -> usize {
        self.features.len_of(Axis(1))
    }

    pub fn input_dim(&self) -> usize {
        self.features.len_of(Axis(2))
    }

    pub fn features(&self) -> &Array3<f32> {
        &self.features
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn source_names(&self) -> Vec<String> {
        self.annotations
            .iter()
            .map(|annotation| annotation.source_name.clone())
            .collect()
    }

    /// Fail unless the per-frame feature size matches what the model expects.
    pub fn ensure_input_dim(&self, expected: usize) -> Result<()> {
        if self.input_dim() != expected {
            return Err(AnalysisError::ShapeMismatch(format!(
                "dataset has {} features per frame, model expects {}",
                self.input_dim(),
                expected
            )));
        }
        Ok(())
    }
}

impl Dataset<PoseSample> for PoseDataset {
    fn get(&self, index: usize) -> Option<PoseSample> {
        let annotation = self.annotations.get(index)?;
        Some(PoseSample {
            source_name: annotation.source_name.clone(),
            features: self.features.index_axis(Axis(0), index).to_owned(),
        })
    }

    fn len(&self) -> usize {
        self.annotations.len()
    }
}

/// Per-frame feature size for the given track shape.
pub fn feature_dim(keypoints: usize, coords: usize, angle_bins: usize) -> usize {
    keypoints * coords + angle_bins
}

fn frame_features(frame: ArrayView2<'_, f32>, mode: FeatureMode, angle_bins: usize) -> Vec<f32> {
    let clean = frame.mapv(|v| if v.is_finite() { v } else { 0.0 });
    let (keypoints, coords) = clean.dim();
    let centroid = clean
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(coords));

    let mut row = Vec::with_capacity(feature_dim(keypoints, coords, angle_bins));
    for keypoint in clean.outer_iter() {
        for (c, value) in keypoint.iter().enumerate() {
            match mode {
                FeatureMode::Raw => row.push(*value),
                FeatureMode::SubtractCentroid => row.push(*value - centroid[c]),
            }
        }
    }

    if angle_bins > 0 {
        let mut histogram = vec![0.0f32; angle_bins];
        let weight = 1.0 / keypoints as f32;
        for keypoint in clean.outer_iter() {
            let dx = keypoint[0] - centroid[0];
            let dy = keypoint[1] - centroid[1];
            histogram[angle_bin(dy.atan2(dx), angle_bins)] += weight;
        }
        row.extend(histogram);
    }

    row
}

/// Bin of `angle` (radians, `[-pi, pi]`) among `bins` equal bins.
fn angle_bin(angle: f32, bins: usize) -> usize {
    let t = (angle + PI) / (2.0 * PI);
    ((t * bins as f32).floor() as usize).min(bins - 1)
}

pub fn save_annotations(annotations: &[Annotation], path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(annotations)?;
    fs::write(path, json)?;
    debug!(path = %path.display(), rows = annotations.len(), "annotations saved");
    Ok(())
}

pub fn load_annotations(path: &Path) -> Result<Vec<Annotation>> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_npy::write_npy;
    use tempfile::TempDir;

    fn track(name: &str, frames: usize, keypoints: usize) -> PoseTrack {
        let keypoints = Array3::from_shape_fn((frames, keypoints, 2), |(f, k, c)| {
            (f * 10 + k) as f32 + c as f32 * 0.5
        });
        PoseTrack {
            source_name: name.to_string(),
            category: "walk".to_string(),
            keypoints,
        }
    }

    #[test]
    fn feature_mode_parses_known_names() {
        assert_eq!("raw".parse::<FeatureMode>().unwrap(), FeatureMode::Raw);
        assert_eq!(
            "subtract centroid".parse::<FeatureMode>().unwrap(),
            FeatureMode::SubtractCentroid
        );
        assert!("wavelet".parse::<FeatureMode>().is_err());
    }

    #[test]
    fn validate_rejects_mismatched_frame_counts() {
        let tracks = vec![track("a", 10, 4), track("b", 9, 4)];
        match validate_tracks(&tracks) {
            Err(AnalysisError::InconsistentTracks { source_name, .. }) => {
                assert_eq!(source_name, "b")
            }
            other => panic!("expected inconsistent tracks, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_duplicate_recording_names() {
        let mut treated = track("mouse1", 10, 4);
        treated.category = "treated".to_string();
        let tracks = vec![track("mouse1", 10, 4), treated];
        match validate_tracks(&tracks) {
            Err(AnalysisError::DuplicateSourceName {
                source_name,
                first,
                second,
            }) => {
                assert_eq!(source_name, "mouse1");
                assert_eq!(first, "walk");
                assert_eq!(second, "treated");
            }
            other => panic!("expected duplicate name, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_empty_recording_name() {
        let tracks = vec![track("a", 5, 2), track("", 5, 2)];
        assert!(matches!(
            validate_tracks(&tracks),
            Err(AnalysisError::InvalidParameter(_))
        ));
    }

    #[test]
    fn same_stem_in_two_categories_fails_dataset_build() {
        let dir = TempDir::new().unwrap();
        for category in ["control", "treated"] {
            let folder = dir.path().join(category);
            fs::create_dir_all(&folder).unwrap();
            write_npy(folder.join("mouse1.npy"), &track("mouse1", 10, 3).keypoints).unwrap();
        }

        let tracks = load_pose_tracks(dir.path()).unwrap();
        assert_eq!(tracks.len(), 2);
        assert!(matches!(
            PoseDataset::from_tracks(&tracks, FeatureMode::Raw, 0),
            Err(AnalysisError::DuplicateSourceName { .. })
        ));
    }

    #[test]
    fn dataset_shape_and_annotation_order() {
        let tracks = vec![track("a", 6, 3), track("b", 6, 3), track("c", 6, 3)];
        let dataset = PoseDataset::from_tracks(&tracks, FeatureMode::Raw, 8).unwrap();

        assert_eq!(dataset.num_samples(), 3);
        assert_eq!(dataset.num_frames(), 6);
        assert_eq!(dataset.input_dim(), 3 * 2 + 8);
        assert_eq!(dataset.source_names(), vec!["a", "b", "c"]);
        assert_eq!(dataset.len(), 3);

        let sample = dataset.get(1).unwrap();
        assert_eq!(sample.source_name, "b");
        assert_eq!(sample.features.dim(), (6, 14));
        assert!(dataset.get(3).is_none());
    }

    #[test]
    fn subtract_centroid_centers_each_frame() {
        let tracks = vec![track("a", 2, 4)];
        let dataset = PoseDataset::from_tracks(&tracks, FeatureMode::SubtractCentroid, 0).unwrap();
        let frame = dataset.features().slice(s![0, 1, ..]).to_owned();
        let sum_x: f32 = frame.iter().step_by(2).sum();
        let sum_y: f32 = frame.iter().skip(1).step_by(2).sum();
        assert!(sum_x.abs() < 1e-4);
        assert!(sum_y.abs() < 1e-4);
    }

    #[test]
    fn angle_histogram_is_normalized() {
        let tracks = vec![track("a", 3, 5)];
        let dataset = PoseDataset::from_tracks(&tracks, FeatureMode::Raw, 16).unwrap();
        let row = dataset.features().slice(s![0, 2, 10..]).to_owned();
        let total: f32 = row.sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn angle_bins_cover_full_circle() {
        assert_eq!(angle_bin(-PI, 8), 0);
        assert_eq!(angle_bin(PI, 8), 7);
        assert_eq!(angle_bin(0.0, 8), 4);
    }

    #[test]
    fn ensure_input_dim_reports_mismatch() {
        let tracks = vec![track("a", 3, 2)];
        let dataset = PoseDataset::from_tracks(&tracks, FeatureMode::Raw, 0).unwrap();
        assert!(dataset.ensure_input_dim(4).is_ok());
        assert!(matches!(
            dataset.ensure_input_dim(5),
            Err(AnalysisError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn load_tracks_walks_categories_in_order() {
        let dir = TempDir::new().unwrap();
        for (category, name) in [("rear", "m2"), ("groom", "m1"), ("groom", "m0")] {
            let folder = dir.path().join(category);
            fs::create_dir_all(&folder).unwrap();
            write_npy(folder.join(format!("{name}.npy")), &track(name, 4, 3).keypoints).unwrap();
        }
        fs::write(dir.path().join("groom").join("notes.txt"), "ignored").unwrap();

        let tracks = load_pose_tracks(dir.path()).unwrap();
        let names: Vec<_> = tracks.iter().map(|t| t.source_name.as_str()).collect();
        assert_eq!(names, vec!["m0", "m1", "m2"]);
        assert_eq!(tracks[0].category, "groom");
        assert_eq!(tracks[2].category, "rear");
    }

    #[test]
    fn empty_data_folder_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            load_pose_tracks(dir.path()),
            Err(AnalysisError::NoPoseData(_))
        ));
    }

    #[test]
    fn annotations_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(ANNOTATIONS_FILE);
        let rows = vec![Annotation {
            source_name: "m0".into(),
            category: "groom".into(),
            num_frames: 100,
        }];
        save_annotations(&rows, &path).unwrap();
        assert_eq!(load_annotations(&path).unwrap(), rows);
    }
}
