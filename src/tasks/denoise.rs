//! Denoise stage: soft-threshold wavelet coefficients, skipping the
//! lowest-resolution subband (the downscaled image itself carries no
//! high-frequency noise to suppress). Grounded on `original_source/src/
//! task_denoise.cc`.

use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::image::WaveletImage;
use crate::logger::Logger;
use crate::task::{Artifact, Task, TaskBase};

fn threshold_filter(x: f32, level: f32) -> f32 {
    if x < -level {
        x + level
    } else if x > level {
        x - level
    } else {
        0.0
    }
}

/// Soft-thresholds every wavelet coefficient outside the top-left
/// `levels`-deep low-pass quadrant.
pub fn denoise(wav: &WaveletImage, levels: u32, level: f32) -> WaveletImage {
    let mut out = wav.clone();
    let lowest_w = wav.width >> levels;
    let lowest_h = wav.height >> levels;

    for y in 0..wav.height {
        for x in 0..wav.width {
            if y < lowest_h && x < lowest_w {
                continue;
            }
            let v = out.at_mut(x, y);
            v[0] = threshold_filter(v[0], level);
            v[1] = threshold_filter(v[1], level);
        }
    }
    out
}

pub struct DenoiseTask {
    base: TaskBase,
    input: Arc<dyn Task>,
    levels: u32,
    level: f32,
}

impl DenoiseTask {
    pub fn new(index: usize, filename: impl Into<String>, input: Arc<dyn Task>, levels: u32, level: f32) -> Arc<Self> {
        let filename = filename.into();
        Arc::new(Self {
            base: TaskBase::new(format!("Denoise {filename}"), filename, index, false)
                .with_depends_on(vec![input.clone()]),
            input,
            levels,
            level,
        })
    }
}

impl Task for DenoiseTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn execute(&self, _logger: &Logger) -> Result<Artifact> {
        let artifact = self.input.result();
        let wav = artifact
            .as_wavelet()
            .ok_or_else(|| EngineError::ConfigError("Denoise needs a wavelet input".to_string()))?;
        let out = denoise(wav, self.levels, self.level);
        self.limit_valid_area(out.valid_area);
        Ok(Artifact::Wavelet(Arc::new(out)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;
    use crate::image::Image;

    fn wavelet(w: u32, h: u32, fill: impl Fn(u32, u32) -> [f32; 2]) -> WaveletImage {
        let mut data = Vec::with_capacity((w * h) as usize);
        for y in 0..h {
            for x in 0..w {
                data.push(fill(x, y));
            }
        }
        Image { width: w, height: h, data, valid_area: Rect::from_size(w, h), orig_size: (w, h), index: 0 }
    }

    #[test]
    fn small_coefficients_are_zeroed() {
        let wav = wavelet(8, 8, |_, _| [0.5, -0.5]);
        let out = denoise(&wav, 1, 1.0);
        assert_eq!(*out.at(7, 7), [0.0, 0.0]);
    }

    #[test]
    fn large_coefficients_shrink_toward_zero() {
        let wav = wavelet(8, 8, |_, _| [5.0, -5.0]);
        let out = denoise(&wav, 1, 1.0);
        assert_eq!(*out.at(7, 7), [4.0, -4.0]);
    }

    #[test]
    fn lowest_subband_is_left_untouched() {
        let wav = wavelet(8, 8, |_, _| [5.0, -5.0]);
        let out = denoise(&wav, 1, 1.0);
        assert_eq!(*out.at(0, 0), [5.0, -5.0]);
    }
}
