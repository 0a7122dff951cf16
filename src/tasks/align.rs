//! Alignment stage (C6): ECC affine registration with contrast/white
//! balance matching, downscaled-then-refined search, neighbour-chained or
//! global transform composition. Grounded on `original_source/src/
//! task_align.cc` (contrast ratio, `findTransformECC`, inverse warp with
//! cubic interpolation and reflect borders) generalised per spec §4.6.

use std::sync::Arc;

use crate::error::Result;
use crate::geometry::Rect;
use crate::image::{Bgr8, ColorImage, GrayF32Image, Image};
use crate::logger::Logger;
use crate::task::{Artifact, Task, TaskBase};

/// A 2x3 affine transform, `[[a, b, tx], [c, d, ty]]`, mapping a *source*
/// pixel coordinate to its *reference* coordinate (the ECC convention
/// `findTransformECC` itself uses, applied with `WARP_INVERSE_MAP`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub m: [[f32; 3]; 2],
}

impl Transform {
    pub fn identity() -> Self {
        Self { m: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]] }
    }

    pub fn apply_point(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.m[0][0] * x + self.m[0][1] * y + self.m[0][2],
            self.m[1][0] * x + self.m[1][1] * y + self.m[1][2],
        )
    }

    /// Composes `self ∘ other`: applying the result to a point equals
    /// applying `other` first, then `self`. Used to chain a local
    /// neighbour-relative transform onto its neighbour's own transform so
    /// the final transform is referenced to the global origin (§4.6 step 4).
    pub fn compose(&self, other: &Transform) -> Transform {
        let mut out = [[0.0f32; 3]; 2];
        for row in 0..2 {
            for col in 0..2 {
                out[row][col] = self.m[row][0] * other.m[0][col] + self.m[row][1] * other.m[1][col];
            }
            out[row][2] = self.m[row][0] * other.m[0][2] + self.m[row][1] * other.m[1][2] + self.m[row][2];
        }
        Transform { m: out }
    }

    fn invert(&self) -> Transform {
        let [[a, b, tx], [c, d, ty]] = self.m;
        let det = a * d - b * c;
        if det.abs() < 1e-9 {
            return Transform::identity();
        }
        let inv_det = 1.0 / det;
        let ia = d * inv_det;
        let ib = -b * inv_det;
        let ic = -c * inv_det;
        let id = a * inv_det;
        let itx = -(ia * tx + ib * ty);
        let ity = -(ic * tx + id * ty);
        Transform { m: [[ia, ib, itx], [ic, id, ity]] }
    }
}

/// Scalar luminance-sum ratio, `reference / source` (task_align.cc's
/// `match_contrast`).
pub fn match_contrast(reference: &GrayF32Image, source: &GrayF32Image) -> f32 {
    let ref_sum: f64 = reference.data.iter().map(|&v| v as f64).sum();
    let src_sum: f64 = source.data.iter().map(|&v| v as f64).sum();
    if src_sum.abs() < 1e-9 {
        1.0
    } else {
        (ref_sum / src_sum) as f32
    }
}

/// Per-channel gain so the source colour image's channel sums match the
/// reference's (§4.6 step 2, white-balance match).
pub fn match_white_balance(reference: &ColorImage, source: &ColorImage) -> [f32; 3] {
    let mut ref_sum = [0f64; 3];
    let mut src_sum = [0f64; 3];
    for px in &reference.data {
        for c in 0..3 {
            ref_sum[c] += px[c] as f64;
        }
    }
    for px in &source.data {
        for c in 0..3 {
            src_sum[c] += px[c] as f64;
        }
    }
    let mut gains = [1.0f32; 3];
    for c in 0..3 {
        gains[c] = if src_sum[c].abs() > 1e-9 {
            (ref_sum[c] / src_sum[c]) as f32
        } else {
            1.0
        };
    }
    gains
}

/// Coordinate-descent hill climb over the affine parameters maximising
/// normalised cross-correlation between `reference` and `source * contrast`
/// — a compact stand-in for OpenCV's Gauss-Newton ECC solver, run first on
/// a downscaled copy (§4.6 step 3: "downscaled resolution first ... refined
/// at higher resolution") and then refined at full size starting from the
/// downscaled result.
pub fn match_transform(reference: &GrayF32Image, source: &GrayF32Image, contrast: f32, initial: Transform, full_resolution: bool) -> Transform {
    let long_side = reference.width.max(reference.height);
    let downscale = if full_resolution || long_side <= 2048 {
        1
    } else {
        (long_side as f64 / 2048.0).ceil() as u32
    };

    let coarse = if downscale > 1 {
        let small_ref = downsample(reference, downscale);
        let small_src = downsample(source, downscale);
        let mut t = initial;
        t.m[0][2] /= downscale as f32;
        t.m[1][2] /= downscale as f32;
        let refined = hill_climb(&small_ref, &small_src, contrast, t);
        let mut scaled = refined;
        scaled.m[0][2] *= downscale as f32;
        scaled.m[1][2] *= downscale as f32;
        scaled
    } else {
        initial
    };

    hill_climb(reference, source, contrast, coarse)
}

fn downsample(img: &GrayF32Image, factor: u32) -> GrayF32Image {
    let w = (img.width / factor).max(1);
    let h = (img.height / factor).max(1);
    let mut data = Vec::with_capacity((w * h) as usize);
    for y in 0..h {
        for x in 0..w {
            let sx = (x * factor).min(img.width - 1);
            let sy = (y * factor).min(img.height - 1);
            data.push(*img.at(sx, sy));
        }
    }
    Image {
        width: w,
        height: h,
        data,
        valid_area: Rect::from_size(w, h),
        orig_size: (w, h),
        index: img.index,
    }
}

fn ncc(reference: &GrayF32Image, source: &GrayF32Image, contrast: f32, t: &Transform) -> f64 {
    let (w, h) = (reference.width, reference.height);
    let mut sum_ref = 0f64;
    let mut sum_src = 0f64;
    let mut sum_ref2 = 0f64;
    let mut sum_src2 = 0f64;
    let mut sum_cross = 0f64;
    let mut n = 0f64;

    let step = ((w * h) / 4096).max(1);
    let mut idx = 0u32;
    for y in 0..h {
        for x in 0..w {
            if idx % step == 0 {
                let (sx, sy) = t.apply_point(x as f32, y as f32);
                if sx >= 0.0 && sy >= 0.0 && (sx as u32) < source.width && (sy as u32) < source.height {
                    let r = *reference.at(x, y) as f64;
                    let s = sample_bilinear(source, sx, sy) as f64 * contrast as f64;
                    sum_ref += r;
                    sum_src += s;
                    sum_ref2 += r * r;
                    sum_src2 += s * s;
                    sum_cross += r * s;
                    n += 1.0;
                }
            }
            idx += 1;
        }
    }

    if n < 1.0 {
        return -1.0;
    }
    let mean_ref = sum_ref / n;
    let mean_src = sum_src / n;
    let cov = sum_cross / n - mean_ref * mean_src;
    let var_ref = (sum_ref2 / n - mean_ref * mean_ref).max(1e-9);
    let var_src = (sum_src2 / n - mean_src * mean_src).max(1e-9);
    cov / (var_ref.sqrt() * var_src.sqrt())
}

fn hill_climb(reference: &GrayF32Image, source: &GrayF32Image, contrast: f32, start: Transform) -> Transform {
    let mut best = start;
    let mut best_score = ncc(reference, source, contrast, &best);

    let mut step_translate = (reference.width.max(reference.height) as f32) * 0.05;
    let mut step_linear = 0.05f32;

    for _ in 0..24 {
        let mut improved = false;
        let candidates = [
            (0, 2, step_translate),
            (0, 2, -step_translate),
            (1, 2, step_translate),
            (1, 2, -step_translate),
            (0, 0, step_linear),
            (0, 0, -step_linear),
            (1, 1, step_linear),
            (1, 1, -step_linear),
            (0, 1, step_linear),
            (0, 1, -step_linear),
            (1, 0, step_linear),
            (1, 0, -step_linear),
        ];
        for (row, col, delta) in candidates {
            let mut candidate = best;
            candidate.m[row][col] += delta;
            let score = ncc(reference, source, contrast, &candidate);
            if score > best_score {
                best_score = score;
                best = candidate;
                improved = true;
            }
        }
        if !improved {
            step_translate *= 0.5;
            step_linear *= 0.5;
            if step_translate < 0.05 && step_linear < 0.0005 {
                break;
            }
        }
    }

    best
}

fn sample_bilinear(img: &GrayF32Image, x: f32, y: f32) -> f32 {
    let x0 = x.floor().max(0.0) as u32;
    let y0 = y.floor().max(0.0) as u32;
    let x1 = (x0 + 1).min(img.width - 1);
    let y1 = (y0 + 1).min(img.height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let v00 = *img.at(x0, y0);
    let v10 = *img.at(x1, y0);
    let v01 = *img.at(x0, y1);
    let v11 = *img.at(x1, y1);
    let top = v00 * (1.0 - fx) + v10 * fx;
    let bottom = v01 * (1.0 - fx) + v11 * fx;
    top * (1.0 - fy) + bottom * fy
}

fn sample_bicubic_bgr(img: &ColorImage, x: f32, y: f32) -> Bgr8 {
    // Cubic (Catmull-Rom) interpolation per channel, matching
    // `cv::INTER_CUBIC` in `apply_transform`'s warp.
    fn cubic_weight(t: f32) -> [f32; 4] {
        let t2 = t * t;
        let t3 = t2 * t;
        [
            -0.5 * t3 + t2 - 0.5 * t,
            1.5 * t3 - 2.5 * t2 + 1.0,
            -1.5 * t3 + 2.0 * t2 + 0.5 * t,
            0.5 * t3 - 0.5 * t2,
        ]
    }

    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let wx = cubic_weight(fx);
    let wy = cubic_weight(fy);

    let clamp = |v: i64, max: u32| v.clamp(0, max as i64 - 1) as u32;

    let mut out = [0f32; 3];
    for (j, wyv) in wy.iter().enumerate() {
        let sy = clamp(y0 - 1 + j as i64, img.height);
        let mut row = [0f32; 3];
        for (i, wxv) in wx.iter().enumerate() {
            let sx = clamp(x0 - 1 + i as i64, img.width);
            let px = *img.at(sx, sy);
            for c in 0..3 {
                row[c] += px[c] as f32 * wxv;
            }
        }
        for c in 0..3 {
            out[c] += row[c] * wyv;
        }
    }
    [out[0].clamp(0.0, 255.0) as u8, out[1].clamp(0.0, 255.0) as u8, out[2].clamp(0.0, 255.0) as u8]
}

/// Inverse-warps `src` with the transform (applied `WARP_INVERSE_MAP`
/// style: for every *output* pixel, looks up the *source* pixel the
/// transform maps it from), multiplying by `contrast` and the white-balance
/// gains, with reflect borders outside the source bounds.
pub fn apply_transform(src: &ColorImage, t: &Transform, contrast: f32, wb_gains: [f32; 3]) -> ColorImage {
    let inv = t.invert();
    let (w, h) = (src.width, src.height);
    let mut data = Vec::with_capacity((w * h) as usize);
    for y in 0..h {
        for x in 0..w {
            let (sx, sy) = inv.apply_point(x as f32, y as f32);
            let sx_clamped = reflect_coord(sx, w);
            let sy_clamped = reflect_coord(sy, h);
            let px = sample_bicubic_bgr(src, sx_clamped, sy_clamped);
            data.push([
                (px[0] as f32 * contrast * wb_gains[0]).clamp(0.0, 255.0) as u8,
                (px[1] as f32 * contrast * wb_gains[1]).clamp(0.0, 255.0) as u8,
                (px[2] as f32 * contrast * wb_gains[2]).clamp(0.0, 255.0) as u8,
            ]);
        }
    }
    Image {
        width: w,
        height: h,
        data,
        valid_area: src.valid_area,
        orig_size: src.orig_size,
        index: src.index,
    }
}

fn reflect_coord(v: f32, len: u32) -> f32 {
    let len = len as f32;
    if v < 0.0 {
        -v
    } else if v >= len {
        2.0 * len - v - 1.0
    } else {
        v
    }
    .clamp(0.0, len - 1.0)
}

pub struct AlignTask {
    base: TaskBase,
    reference: Option<Arc<dyn Task>>,
    reference_color: Option<Arc<dyn Task>>,
    initial_guess: Option<Arc<dyn Task>>,
    stacked_transform: Option<Arc<dyn Task>>,
    grayscale: Arc<dyn Task>,
    color: Arc<dyn Task>,
    use_whitebalance: bool,
    use_contrast: bool,
    full_resolution: bool,
    keep_size: bool,
    border_band: u32,
}

impl AlignTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        filename: impl Into<String>,
        reference: Option<Arc<dyn Task>>,
        reference_color: Option<Arc<dyn Task>>,
        initial_guess: Option<Arc<dyn Task>>,
        stacked_transform: Option<Arc<dyn Task>>,
        grayscale: Arc<dyn Task>,
        color: Arc<dyn Task>,
        use_whitebalance: bool,
        use_contrast: bool,
        full_resolution: bool,
        keep_size: bool,
    ) -> Arc<Self> {
        let filename = filename.into();
        let mut deps = vec![grayscale.clone(), color.clone()];
        if let Some(r) = &reference {
            deps.push(r.clone());
        }
        if let Some(rc) = &reference_color {
            deps.push(rc.clone());
        }
        if let Some(g) = &initial_guess {
            deps.push(g.clone());
        }
        if let Some(s) = &stacked_transform {
            deps.push(s.clone());
        }
        Arc::new(Self {
            base: TaskBase::new(format!("Align {filename}"), filename, index, false).with_depends_on(deps),
            reference,
            reference_color,
            initial_guess,
            stacked_transform,
            grayscale,
            color,
            use_whitebalance,
            use_contrast,
            full_resolution,
            keep_size,
            border_band: 8,
        })
    }

    /// The reference image's own alignment task: identity, scheduled only
    /// to keep downstream types uniform (§4.6 "Reference image special case").
    pub fn identity(index: usize, filename: impl Into<String>, color: Arc<dyn Task>) -> Arc<Self> {
        let filename = filename.into();
        Arc::new(Self {
            base: TaskBase::new(format!("Align {filename}"), filename, index, false)
                .with_depends_on(vec![color.clone()]),
            reference: None,
            reference_color: None,
            initial_guess: None,
            stacked_transform: None,
            grayscale: color.clone(),
            color,
            use_whitebalance: false,
            use_contrast: false,
            full_resolution: false,
            keep_size: true,
            border_band: 0,
        })
    }
}

impl Task for AlignTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn execute(&self, logger: &Logger) -> Result<Artifact> {
        let color_artifact = self.color.result();
        let color = color_artifact.as_color().expect("Align needs a colour image").clone();

        let Some(reference) = &self.reference else {
            // Identity case: no reference means this IS the reference.
            self.limit_valid_area(color.valid_area);
            return Ok(Artifact::Align(color.clone(), Arc::new(Transform::identity())));
        };

        let ref_gray = reference.result();
        let ref_gray = ref_gray.as_gray_f32().expect("Align reference must be grayscale").clone();
        let src_gray_artifact = self.grayscale.result();
        let src_gray = src_gray_artifact.as_gray_f32().expect("Align needs grayscale").clone();

        let contrast = if self.use_contrast { match_contrast(&ref_gray, &src_gray) } else { 1.0 };

        let wb_gains = if self.use_whitebalance {
            match self.reference_color.as_ref().map(|rc| rc.result()) {
                Some(ref_color_artifact) => match ref_color_artifact.as_color() {
                    Some(rc) => match_white_balance(rc, &color),
                    None => [1.0; 3],
                },
                None => [1.0; 3],
            }
        } else {
            [1.0; 3]
        };

        let initial = self
            .initial_guess
            .as_ref()
            .and_then(|g| g.result().as_align_transform().cloned())
            .map(|t| *t)
            .unwrap_or_else(Transform::identity);

        let local = match_transform(&ref_gray, &src_gray, contrast, initial, self.full_resolution);

        let final_transform = match &self.stacked_transform {
            Some(stacked) => {
                let stacked = stacked.result();
                let stacked = stacked.as_align_transform().expect("stacked_transform must produce an Align artifact");
                stacked.compose(&local)
            }
            None => local,
        };

        if final_transform == Transform::identity() {
            logger.verbose(format!("{}: ECC made no progress, using initial guess", self.name()));
        }

        let mut warped = apply_transform(&color, &final_transform, contrast, wb_gains);
        if !self.keep_size {
            warped.limit_valid_area(warped.valid_area.shrink(self.border_band));
        }
        self.limit_valid_area(warped.valid_area);

        Ok(Artifact::Align(Arc::new(warped), Arc::new(final_transform)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_apply_point_is_noop() {
        let t = Transform::identity();
        assert_eq!(t.apply_point(3.0, 4.0), (3.0, 4.0));
    }

    #[test]
    fn compose_chains_neighbour_then_stacked() {
        let mut local = Transform::identity();
        local.m[0][2] = 1.0;
        let mut stacked = Transform::identity();
        stacked.m[1][2] = 2.0;
        let composed = stacked.compose(&local);
        assert_eq!(composed.apply_point(0.0, 0.0), (1.0, 2.0));
    }

    #[test]
    fn invert_round_trips_translation() {
        let mut t = Transform::identity();
        t.m[0][2] = 5.0;
        t.m[1][2] = -3.0;
        let inv = t.invert();
        let (x, y) = t.apply_point(0.0, 0.0);
        assert_eq!(inv.apply_point(x, y), (0.0, 0.0));
    }

    #[test]
    fn match_contrast_is_ratio_of_sums() {
        let r: GrayF32Image = Image::new_filled(2, 2, 2.0, 0);
        let s: GrayF32Image = Image::new_filled(2, 2, 1.0, 0);
        assert!((match_contrast(&r, &s) - 2.0).abs() < 1e-6);
    }
}
