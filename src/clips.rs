use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, Frame, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clustering::ClusteredFrames;
use crate::data::PoseTrack;
use crate::error::{AnalysisError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";

const CLIP_SIZE: u32 = 256;
const CLIP_MARGIN: f32 = 16.0;

/// A short window of one recording centred on a cluster representative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipSpec {
    pub label: i32,
    pub source_name: String,
    /// The representative frame itself.
    pub frame: usize,
    /// Source video, when one was found for the recording.
    pub media_path: Option<PathBuf>,
    pub start_frame: usize,
    /// Inclusive.
    pub end_frame: usize,
    pub start_seconds: f64,
    pub duration_seconds: f64,
}

impl ClipSpec {
    pub fn num_frames(&self) -> usize {
        self.end_frame - self.start_frame + 1
    }

    pub fn file_name(&self) -> String {
        format!(
            "cluster_{}_{}_{}.gif",
            self.label, self.source_name, self.frame
        )
    }
}

/// How much context to cut around each representative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipWindow {
    pub half_window: usize,
    pub per_cluster: usize,
    /// Frames per recording; clips are clamped to `0..num_frames`.
    pub num_frames: usize,
    pub fps: f64,
}

/// Media files under a folder, keyed by file stem.
#[derive(Debug, Clone, Default)]
pub struct MediaLibrary {
    files: HashMap<String, PathBuf>,
}

impl MediaLibrary {
    /// Walk `root` recursively. When two files share a stem the first in path
    /// order wins.
    pub fn scan(root: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        collect_files(root, &mut paths)?;
        paths.sort();

        let mut files = HashMap::new();
        for path in paths {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                files.entry(stem.to_string()).or_insert(path);
            }
        }

        info!(root = %root.display(), files = files.len(), "media library scanned");
        Ok(Self { files })
    }

    pub fn find(&self, source_name: &str) -> Option<&Path> {
        self.files.get(source_name).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

/// One clip per cluster representative, in label order.
pub fn plan_clips(
    clustered: &ClusteredFrames,
    media: &MediaLibrary,
    window: ClipWindow,
) -> Result<Vec<ClipSpec>> {
    if window.fps.is_nan() || window.fps <= 0.0 {
        return Err(AnalysisError::InvalidParameter(format!(
            "fps must be positive, got {}",
            window.fps
        )));
    }
    if window.num_frames == 0 {
        return Err(AnalysisError::InvalidParameter(
            "cannot cut clips from recordings with no frames".to_string(),
        ));
    }

    let mut clips = Vec::new();
    for representative in clustered.representatives(window.per_cluster) {
        let frame = representative.frame.frame;
        if frame >= window.num_frames {
            return Err(AnalysisError::InvalidParameter(format!(
                "frame {} of {} is outside a {}-frame recording",
                frame, representative.frame.source_name, window.num_frames
            )));
        }

        let start_frame = frame.saturating_sub(window.half_window);
        let end_frame = (frame + window.half_window).min(window.num_frames - 1);
        let media_path = media
            .find(&representative.frame.source_name)
            .map(Path::to_path_buf);
        if media_path.is_none() && !media.is_empty() {
            warn!(source = %representative.frame.source_name, "no media file for recording");
        }

        clips.push(ClipSpec {
            label: representative.label,
            source_name: representative.frame.source_name,
            frame,
            media_path,
            start_frame,
            end_frame,
            start_seconds: start_frame as f64 / window.fps,
            duration_seconds: (end_frame - start_frame + 1) as f64 / window.fps,
        });
    }

    debug!(clips = clips.len(), "clips planned");
    Ok(clips)
}

pub fn save_manifest(clips: &[ClipSpec], path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(clips)?;
    fs::write(path, json)?;
    info!(path = %path.display(), clips = clips.len(), "clip manifest saved");
    Ok(())
}

pub fn load_manifest(path: &Path) -> Result<Vec<ClipSpec>> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

/// Map pose coordinates into the clip canvas, keeping the aspect ratio.
struct Viewport {
    min_x: f32,
    min_y: f32,
    scale: f32,
}

impl Viewport {
    fn fit(track: &PoseTrack, start: usize, end: usize) -> Self {
        let (mut min_x, mut min_y) = (f32::INFINITY, f32::INFINITY);
        let (mut max_x, mut max_y) = (f32::NEG_INFINITY, f32::NEG_INFINITY);
        for f in start..=end {
            for point in track.frame(f).rows() {
                if point[0].is_finite() && point[1].is_finite() {
                    min_x = min_x.min(point[0]);
                    max_x = max_x.max(point[0]);
                    min_y = min_y.min(point[1]);
                    max_y = max_y.max(point[1]);
                }
            }
        }
        if !min_x.is_finite() {
            return Self { min_x: 0.0, min_y: 0.0, scale: 1.0 };
        }

        let span = (max_x - min_x).max(max_y - min_y).max(f32::EPSILON);
        Self {
            min_x,
            min_y,
            scale: (CLIP_SIZE as f32 - 2.0 * CLIP_MARGIN) / span,
        }
    }

    fn map(&self, x: f32, y: f32) -> (f32, f32) {
        (
            CLIP_MARGIN + (x - self.min_x) * self.scale,
            CLIP_MARGIN + (y - self.min_y) * self.scale,
        )
    }
}

fn keypoint_color(keypoint: usize, keypoints: usize) -> Rgba<u8> {
    let t = keypoint as f32 / keypoints.saturating_sub(1).max(1) as f32;
    Rgba([
        (80.0 + 175.0 * t) as u8,
        (200.0 - 120.0 * t) as u8,
        (255.0 - 200.0 * t) as u8,
        255,
    ])
}

/// Draw the keypoints of one clip as a looping GIF.
///
/// Consecutive keypoints are joined by a faint line, and the representative
/// frame gets a white border.
pub fn render_pose_clip(track: &PoseTrack, spec: &ClipSpec, path: &Path) -> Result<()> {
    if spec.end_frame >= track.num_frames() || spec.start_frame > spec.end_frame {
        return Err(AnalysisError::InvalidParameter(format!(
            "clip {}..={} does not fit {} ({} frames)",
            spec.start_frame,
            spec.end_frame,
            track.source_name,
            track.num_frames()
        )));
    }
    if track.num_coords() < 2 {
        return Err(AnalysisError::Render(format!(
            "{} has {} coordinates per keypoint, need at least 2",
            track.source_name,
            track.num_coords()
        )));
    }

    let viewport = Viewport::fit(track, spec.start_frame, spec.end_frame);
    let keypoints = track.num_keypoints();
    let delay = Delay::from_saturating_duration(Duration::from_secs_f64(
        spec.duration_seconds / spec.num_frames() as f64,
    ));

    let mut frames = Vec::with_capacity(spec.num_frames());
    for f in spec.start_frame..=spec.end_frame {
        let mut canvas = RgbaImage::from_pixel(CLIP_SIZE, CLIP_SIZE, Rgba([12, 12, 20, 255]));
        let pose = track.frame(f);

        let points: Vec<Option<(f32, f32)>> = pose
            .rows()
            .into_iter()
            .map(|p| (p[0].is_finite() && p[1].is_finite()).then(|| viewport.map(p[0], p[1])))
            .collect();

        for pair in points.windows(2) {
            if let (Some(a), Some(b)) = (pair[0], pair[1]) {
                draw_line_segment_mut(&mut canvas, a, b, Rgba([70, 70, 90, 255]));
            }
        }
        for (k, point) in points.iter().enumerate() {
            if let Some((x, y)) = point {
                draw_filled_circle_mut(
                    &mut canvas,
                    (*x as i32, *y as i32),
                    4,
                    keypoint_color(k, keypoints),
                );
            }
        }
        if f == spec.frame {
            draw_hollow_rect_mut(
                &mut canvas,
                Rect::at(2, 2).of_size(CLIP_SIZE - 4, CLIP_SIZE - 4),
                Rgba([255, 255, 255, 255]),
            );
        }

        frames.push(Frame::from_parts(canvas, 0, 0, delay));
    }

    let file = BufWriter::new(File::create(path)?);
    let mut encoder = GifEncoder::new(file);
    encoder
        .set_repeat(Repeat::Infinite)
        .map_err(|e| AnalysisError::Render(format!("{}: {e}", path.display())))?;
    encoder
        .encode_frames(frames)
        .map_err(|e| AnalysisError::Render(format!("{}: {e}", path.display())))?;

    debug!(path = %path.display(), frames = spec.num_frames(), "pose clip rendered");
    Ok(())
}
