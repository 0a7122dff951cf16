//! Focus measure stage: Tenengrad gradient-energy map, one per aligned
//! image. Grounded on `original_source/src/task_focusmeasure.cc` — squared
//! Sobel-x plus squared Sobel-y, thresholded, then a Gaussian blur sized
//! from the smoothing radius.

use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::image::{GrayF32Image, Image};
use crate::logger::Logger;
use crate::task::{Artifact, Task, TaskBase};

fn sobel_x(gray: &GrayF32Image, x: u32, y: u32) -> f32 {
    let w = gray.width;
    let h = gray.height;
    let xm = x.saturating_sub(1);
    let xp = (x + 1).min(w - 1);
    let ym = y.saturating_sub(1);
    let yp = (y + 1).min(h - 1);
    -*gray.at(xm, ym) - 2.0 * *gray.at(xm, y) - *gray.at(xm, yp)
        + *gray.at(xp, ym)
        + 2.0 * *gray.at(xp, y)
        + *gray.at(xp, yp)
}

fn sobel_y(gray: &GrayF32Image, x: u32, y: u32) -> f32 {
    let w = gray.width;
    let h = gray.height;
    let xm = x.saturating_sub(1);
    let xp = (x + 1).min(w - 1);
    let ym = y.saturating_sub(1);
    let yp = (y + 1).min(h - 1);
    -*gray.at(xm, ym) - 2.0 * *gray.at(x, ym) - *gray.at(xp, ym)
        + *gray.at(xm, yp)
        + 2.0 * *gray.at(x, yp)
        + *gray.at(xp, yp)
}

/// Separable Gaussian blur, reflecting at the border; `radius` selects a
/// `4*radius + 1` window, matching the original's `blurwindow` sizing.
fn gaussian_blur(src: &[f32], w: usize, h: usize, radius: f32) -> Vec<f32> {
    if radius <= 0.0 {
        return src.to_vec();
    }
    let window = (radius * 4.0) as isize + 1;
    let half = window / 2;
    let sigma = radius.max(1e-3);
    let mut kernel = Vec::with_capacity(window as usize);
    let mut sum = 0.0f32;
    for i in -half..=half {
        let v = (-(i * i) as f32 / (2.0 * sigma * sigma)).exp();
        kernel.push(v);
        sum += v;
    }
    for v in kernel.iter_mut() {
        *v /= sum;
    }

    let reflect = |p: isize, len: isize| -> isize {
        if len <= 1 {
            return 0;
        }
        let mut q = p;
        if q < 0 {
            q = -q;
        }
        if q >= len {
            q = (len - 1) - (q - (len - 1));
        }
        q.clamp(0, len - 1)
    };

    let mut tmp = vec![0.0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (i, &k) in kernel.iter().enumerate() {
                let dx = i as isize - half;
                let xi = reflect(x as isize + dx, w as isize) as usize;
                acc += k * src[y * w + xi];
            }
            tmp[y * w + x] = acc;
        }
    }
    let mut out = vec![0.0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (i, &k) in kernel.iter().enumerate() {
                let dy = i as isize - half;
                let yi = reflect(y as isize + dy, h as isize) as usize;
                acc += k * tmp[yi * w + x];
            }
            out[y * w + x] = acc;
        }
    }
    out
}

/// Computes the Tenengrad focus measure map for a grayscale image.
pub fn tenengrad(gray: &GrayF32Image, radius: f32, threshold: f32) -> GrayF32Image {
    let w = gray.width;
    let h = gray.height;
    let mut magnitude = vec![0.0f32; (w * h) as usize];
    for y in 0..h {
        for x in 0..w {
            let gx = sobel_x(gray, x, y);
            let gy = sobel_y(gray, x, y);
            let mut m = gx * gx + gy * gy;
            if m < threshold {
                m = 0.0;
            }
            magnitude[(y * w + x) as usize] = m;
        }
    }
    let blurred = gaussian_blur(&magnitude, w as usize, h as usize, radius);
    Image {
        width: w,
        height: h,
        data: blurred,
        valid_area: gray.valid_area,
        orig_size: gray.orig_size,
        index: gray.index,
    }
}

pub struct FocusMeasureTask {
    base: TaskBase,
    input: Arc<dyn Task>,
    radius: f32,
    threshold: f32,
}

impl FocusMeasureTask {
    pub fn new(index: usize, filename: impl Into<String>, input: Arc<dyn Task>, radius: f32, threshold: f32) -> Arc<Self> {
        let filename = filename.into();
        Arc::new(Self {
            base: TaskBase::new(format!("Focus measure {filename}"), filename, index, false)
                .with_depends_on(vec![input.clone()]),
            input,
            radius,
            threshold,
        })
    }
}

impl Task for FocusMeasureTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn execute(&self, _logger: &Logger) -> Result<Artifact> {
        let artifact = self.input.result();
        let gray = artifact
            .as_gray_f32()
            .ok_or_else(|| EngineError::ConfigError("Focus measure needs a grayscale input".to_string()))?;
        let measure = tenengrad(gray, self.radius, self.threshold);
        self.limit_valid_area(measure.valid_area);
        Ok(Artifact::GrayF32(Arc::new(measure)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;

    fn flat(w: u32, h: u32, fill: impl Fn(u32, u32) -> f32) -> GrayF32Image {
        let mut data = Vec::with_capacity((w * h) as usize);
        for y in 0..h {
            for x in 0..w {
                data.push(fill(x, y));
            }
        }
        Image { width: w, height: h, data, valid_area: Rect::from_size(w, h), orig_size: (w, h), index: 0 }
    }

    #[test]
    fn flat_image_has_near_zero_focus_measure() {
        let gray = flat(16, 16, |_, _| 100.0);
        let measure = tenengrad(&gray, 1.0, 0.0);
        for v in &measure.data {
            assert!(*v < 1e-3);
        }
    }

    #[test]
    fn edge_has_higher_focus_measure_than_flat_region() {
        let gray = flat(16, 16, |x, _| if x < 8 { 0.0 } else { 255.0 });
        let measure = tenengrad(&gray, 0.0, 0.0);
        let edge = *measure.at(8, 8);
        let flat_region = *measure.at(2, 8);
        assert!(edge > flat_region);
    }

    #[test]
    fn threshold_suppresses_low_gradient_noise() {
        let gray = flat(16, 16, |x, y| ((x + y) % 2) as f32 * 0.1);
        let measure = tenengrad(&gray, 0.0, 1000.0);
        assert!(measure.data.iter().all(|&v| v == 0.0));
    }
}
