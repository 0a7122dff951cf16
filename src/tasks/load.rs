//! Load stage (C4): decode, reflect-pad to a wavelet-aligned size, record
//! the valid region. Grounded on `original_source/src/task_loadimg.cc`
//! (decode-or-throw) plus the padding/level-count bookkeeping spec'd in
//! §4.4, since the retrieved original pads inside the wavelet task rather
//! than at load time — this crate does it once at Load so every downstream
//! stage inherits a consistent `valid_area` without repeating the padding
//! decision per task.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{EngineError, Result};
use crate::geometry::Rect;
use crate::image::{Bgr8, ColorImage, GrayImage, Image};
use crate::logger::Logger;
use crate::task::{Artifact, Task, TaskBase};

/// Clamps the wavelet level count to `[5, 10]` so that `dim >> L ≈ 8`.
pub fn choose_levels(min_dim: u32) -> u32 {
    if min_dim <= 8 {
        return 5;
    }
    let approx = (min_dim as f64 / 8.0).log2().round();
    (approx as i64).clamp(5, 10) as u32
}

pub fn padded_dim(dim: u32, levels: u32) -> u32 {
    let multiple = 1u32 << levels;
    dim.div_ceil(multiple) * multiple
}

/// Classic mirror-with-edge-duplication reflect used to fill the padding
/// border (`cv::BORDER_REFLECT`), distinct from the reflect-about-edge
/// indexing the wavelet transform itself uses internally (see
/// `tasks::wavelet::reflect_index`).
fn mirror_reflect_index(pos: i64, len: i64) -> i64 {
    let mut p = pos;
    if len <= 1 {
        return 0;
    }
    while p < 0 || p >= len {
        if p < 0 {
            p = -p - 1;
        }
        if p >= len {
            p = 2 * len - 1 - p;
        }
    }
    p
}

enum Decoded {
    Gray(Vec<u8>, u32, u32),
    Color(Vec<Bgr8>, u32, u32),
}

fn decode(path: &Path) -> Result<Decoded> {
    let img = image::open(path).map_err(|e| match e {
        image::ImageError::IoError(_) => EngineError::LoadFailure(path.display().to_string()),
        other => EngineError::Image(other),
    })?;

    let decoded = match img {
        image::DynamicImage::ImageLuma8(buf) => {
            let (w, h) = (buf.width(), buf.height());
            Decoded::Gray(buf.into_raw(), w, h)
        }
        other => {
            let rgb = other.to_rgb8();
            let (w, h) = (rgb.width(), rgb.height());
            let bgr: Vec<Bgr8> = rgb.pixels().map(|p| [p[2], p[1], p[0]]).collect();
            Decoded::Color(bgr, w, h)
        }
    };
    Ok(decoded)
}

fn pad_plan(orig_w: u32, orig_h: u32) -> (u32, u32, u32, u32, u32) {
    let levels = choose_levels(orig_w.min(orig_h));
    let padded_w = padded_dim(orig_w, levels);
    let padded_h = padded_dim(orig_h, levels);
    let pad_x = padded_w - orig_w;
    let pad_y = padded_h - orig_h;
    (levels, padded_w, padded_h, pad_x, pad_y)
}

fn build_padded<T: Copy>(src: &[T], orig_w: u32, orig_h: u32, padded_w: u32, padded_h: u32, pad_x: u32, pad_y: u32) -> Vec<T> {
    let off_x = (pad_x / 2) as i64;
    let off_y = (pad_y / 2) as i64;
    let mut out = Vec::with_capacity((padded_w as usize) * (padded_h as usize));
    for y in 0..padded_h as i64 {
        let src_y = mirror_reflect_index(y - off_y, orig_h as i64) as u32;
        for x in 0..padded_w as i64 {
            let src_x = mirror_reflect_index(x - off_x, orig_w as i64) as u32;
            out.push(src[(src_y as usize) * (orig_w as usize) + (src_x as usize)]);
        }
    }
    out
}

/// Decodes one input image and pads it to a wavelet-aligned size. Produces
/// either `Artifact::Gray` or `Artifact::Color` depending on the source.
pub struct LoadTask {
    base: TaskBase,
    path: std::path::PathBuf,
    wait_images: Option<Duration>,
    deadline: Instant,
}

impl LoadTask {
    pub fn new(index: usize, path: impl AsRef<Path>, wait_images: Option<Duration>) -> Arc<Self> {
        let path = path.as_ref().to_path_buf();
        let name = format!("Load {}", path.display());
        Arc::new(Self {
            base: TaskBase::new(name, path.to_string_lossy().to_string(), index, false),
            path,
            wait_images,
            deadline: Instant::now() + wait_images.unwrap_or(Duration::ZERO),
        })
    }
}

impl Task for LoadTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn ready_to_run(&self) -> bool {
        if self.wait_images.is_none() {
            return true;
        }
        self.path.exists() || Instant::now() >= self.deadline
    }

    fn execute(&self, _logger: &Logger) -> Result<Artifact> {
        if !self.path.exists() && self.wait_images.is_some() {
            return Err(EngineError::LoadFailure(self.path.display().to_string()));
        }

        let decoded = decode(&self.path)?;

        let artifact = match decoded {
            Decoded::Gray(pixels, w, h) => {
                let (levels, pw, ph, pad_x, pad_y) = pad_plan(w, h);
                let padded = build_padded(&pixels, w, h, pw, ph, pad_x, pad_y);
                let img: GrayImage = Image {
                    width: pw,
                    height: ph,
                    data: padded,
                    valid_area: Rect::new(pad_x / 2, pad_y / 2, w, h),
                    orig_size: (w, h),
                    index: self.index(),
                };
                let _ = levels;
                Artifact::Gray(Arc::new(img))
            }
            Decoded::Color(pixels, w, h) => {
                let (levels, pw, ph, pad_x, pad_y) = pad_plan(w, h);
                let padded = build_padded(&pixels, w, h, pw, ph, pad_x, pad_y);
                let img: ColorImage = Image {
                    width: pw,
                    height: ph,
                    data: padded,
                    valid_area: Rect::new(pad_x / 2, pad_y / 2, w, h),
                    orig_size: (w, h),
                    index: self.index(),
                };
                let _ = levels;
                Artifact::Color(Arc::new(img))
            }
        };

        if let Some(area) = artifact_valid_area(&artifact) {
            self.limit_valid_area(area);
        }
        Ok(artifact)
    }
}

fn artifact_valid_area(artifact: &Artifact) -> Option<Rect> {
    match artifact {
        Artifact::Gray(img) => Some(img.valid_area),
        Artifact::Color(img) => Some(img.valid_area),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choose_levels_clamps_range() {
        assert_eq!(choose_levels(8), 5);
        assert!(choose_levels(4096) <= 10);
        assert!(choose_levels(64) >= 5);
    }

    #[test]
    fn padded_dim_is_multiple_of_power_of_two() {
        let levels = 5;
        let padded = padded_dim(100, levels);
        assert_eq!(padded % (1 << levels), 0);
        assert!(padded >= 100);
    }

    #[test]
    fn mirror_reflect_duplicates_edge_not_skips() {
        assert_eq!(mirror_reflect_index(-1, 10), 0);
        assert_eq!(mirror_reflect_index(10, 10), 9);
    }
}
