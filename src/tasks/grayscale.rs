//! Grayscale stage (C5): PCA-derived luminance projection, shared with the
//! reference image when one is given. Grounded on `original_source/src/
//! task_grayscale.cc`'s `do_pca` (64x64 grid sample, 2-component PCA,
//! backprojected weight vector normalised to sum to one).

use std::sync::Arc;

use crate::error::Result;
use crate::image::{Bgr8, ColorImage, GrayF32Image, Image};
use crate::logger::Logger;
use crate::task::{Artifact, Task, TaskBase};

/// `(w_b, w_g, w_r)`, always summing to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrayWeights(pub f32, pub f32, pub f32);

impl GrayWeights {
    pub fn apply(&self, px: Bgr8) -> f32 {
        self.0 * px[0] as f32 + self.1 * px[1] as f32 + self.2 * px[2] as f32
    }
}

/// Samples a 64x64 grid from `img` and fits the first principal component
/// of the BGR distribution, returning it as normalised projection weights.
///
/// Ported from `task_grayscale.cc::do_pca`: rather than link a linear
/// algebra crate for a 3x3 covariance eigenproblem, the power iteration
/// below converges in a handful of steps on 3-dimensional data and needs no
/// new dependency beyond what the teacher already pulls in for pixel math.
pub fn fit_pca_weights(img: &ColorImage) -> GrayWeights {
    const GRID: u32 = 64;
    let w = img.width;
    let h = img.height;
    let step_x = (w / GRID).max(1);
    let step_y = (h / GRID).max(1);

    let mut samples: Vec<[f64; 3]> = Vec::new();
    let mut y = 0;
    while y < h {
        let mut x = 0;
        while x < w {
            let px = *img.at(x, y);
            samples.push([px[0] as f64, px[1] as f64, px[2] as f64]);
            x += step_x;
        }
        y += step_y;
    }

    if samples.is_empty() {
        return GrayWeights(1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0);
    }

    let n = samples.len() as f64;
    let mean = samples.iter().fold([0.0; 3], |acc, s| {
        [acc[0] + s[0] / n, acc[1] + s[1] / n, acc[2] + s[2] / n]
    });

    let mut cov = [[0.0f64; 3]; 3];
    for s in &samples {
        let d = [s[0] - mean[0], s[1] - mean[1], s[2] - mean[2]];
        for i in 0..3 {
            for j in 0..3 {
                cov[i][j] += d[i] * d[j] / n;
            }
        }
    }

    // Power iteration for the dominant eigenvector of `cov`.
    let mut v = [1.0, 1.0, 1.0];
    for _ in 0..64 {
        let mut next = [0.0; 3];
        for i in 0..3 {
            next[i] = cov[i][0] * v[0] + cov[i][1] * v[1] + cov[i][2] * v[2];
        }
        let norm = (next[0] * next[0] + next[1] * next[1] + next[2] * next[2]).sqrt();
        if norm < 1e-12 {
            break;
        }
        v = [next[0] / norm, next[1] / norm, next[2] / norm];
    }

    // Orient so the projection of (1,1,1)-ish brighter samples is positive,
    // then centre by subtracting the projection of the zero vector (which
    // is zero since the axis passes through the origin by construction of
    // power iteration on the covariance matrix) and normalise to sum to 1.
    let proj_one = v[0] + v[1] + v[2];
    if proj_one < 0.0 {
        v = [-v[0], -v[1], -v[2]];
    }

    let sum = v[0] + v[1] + v[2];
    if sum.abs() < 1e-12 {
        GrayWeights(1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0)
    } else {
        GrayWeights((v[0] / sum) as f32, (v[1] / sum) as f32, (v[2] / sum) as f32)
    }
}

pub struct GrayscaleTask {
    base: TaskBase,
    color: Arc<dyn Task>,
    reference_weights: Option<GrayWeights>,
}

impl GrayscaleTask {
    /// `reference_weights`: `Some(w)` shares an already-computed reference
    /// image's weights (R2); `None` computes fresh PCA weights from `color`.
    pub fn new(index: usize, filename: impl Into<String>, color: Arc<dyn Task>, reference_weights: Option<GrayWeights>) -> Arc<Self> {
        let filename = filename.into();
        Arc::new(Self {
            base: TaskBase::new(format!("Grayscale {filename}"), filename, index, false)
                .with_depends_on(vec![color.clone()]),
            color,
            reference_weights,
        })
    }
}

impl Task for GrayscaleTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn execute(&self, _logger: &Logger) -> Result<Artifact> {
        let artifact = self.color.result();

        // Already single-channel: passthrough, converting to f32.
        if let Some(gray) = artifact.as_gray() {
            let data: Vec<f32> = gray.data.iter().map(|&v| v as f32).collect();
            let img = GrayF32Image {
                width: gray.width,
                height: gray.height,
                data,
                valid_area: gray.valid_area,
                orig_size: gray.orig_size,
                index: self.index(),
            };
            self.limit_valid_area(img.valid_area);
            return Ok(Artifact::GrayF32(Arc::new(img)));
        }

        let color = artifact
            .as_color()
            .expect("Grayscale task's dependency must produce Gray or Color")
            .clone();

        let weights = self.reference_weights.unwrap_or_else(|| fit_pca_weights(&color));

        let data: Vec<f32> = color.data.iter().map(|&px| weights.apply(px)).collect();
        let img: GrayF32Image = Image {
            width: color.width,
            height: color.height,
            data,
            valid_area: color.valid_area,
            orig_size: color.orig_size,
            index: self.index(),
        };
        self.limit_valid_area(img.valid_area);
        Ok(Artifact::GrayF32(Arc::new(img)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;

    #[test]
    fn pca_isolates_green_channel() {
        let mut img: ColorImage = Image::new_filled(64, 64, [0u8, 0, 0], 0);
        *img.at_mut(32, 32) = [0, 255, 0];
        let weights = fit_pca_weights(&img);
        assert!(weights.1 > weights.0);
        assert!(weights.1 > weights.2);
        assert!((weights.0 + weights.1 + weights.2 - 1.0).abs() < 1e-3);
    }

    #[test]
    fn apply_is_linear_combination() {
        let w = GrayWeights(0.2, 0.5, 0.3);
        let v = w.apply([10, 20, 30]);
        assert!((v - (0.2 * 10.0 + 0.5 * 20.0 + 0.3 * 30.0)).abs() < 1e-3);
    }

    #[test]
    fn empty_area_fallback_is_not_used_for_nonzero_images() {
        let img: ColorImage = Image::new_filled(4, 4, [1u8, 2, 3], 0);
        let _ = Rect::from_size(4, 4);
        let weights = fit_pca_weights(&img);
        assert!((weights.0 + weights.1 + weights.2 - 1.0).abs() < 1e-2);
    }
}
