//! Background removal (§B, `--remove-bg=N`): threshold-segments the merged
//! grayscale into foreground/background, closes small gaps in the mask with
//! the radial filter, and smooths the result with a disk-kernel morphology
//! open/close pair. Grounded on `original_source/src/
//! task_background_removal.cc`: a positive threshold selects pixels
//! brighter than it (subject photographed against a dark background), a
//! negative one selects pixels darker than `-threshold` (light background).
//! OpenCV's 5x5 elliptical erode/dilate has no equivalent crate here, so the
//! structuring element is a small hand-rolled disk of the same radius.

use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::geometry::Rect;
use crate::image::{GrayF32Image, Image};
use crate::logger::Logger;
use crate::radial_filter;
use crate::task::{Artifact, Task, TaskBase};

fn disk_offsets(radius: i32) -> Vec<(i32, i32)> {
    let mut offsets = Vec::new();
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                offsets.push((dx, dy));
            }
        }
    }
    offsets
}

fn morph(mask: &[f32], w: usize, h: usize, offsets: &[(i32, i32)], dilate: bool) -> Vec<f32> {
    let mut out = vec![0.0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = if dilate { 0.0f32 } else { 255.0f32 };
            for &(dx, dy) in offsets {
                let sx = (x as i32 + dx).clamp(0, w as i32 - 1) as usize;
                let sy = (y as i32 + dy).clamp(0, h as i32 - 1) as usize;
                let v = mask[sy * w + sx];
                acc = if dilate { acc.max(v) } else { acc.min(v) };
            }
            out[y * w + x] = acc;
        }
    }
    out
}

fn threshold_mask(gray: &GrayF32Image, threshold: i32) -> Vec<f32> {
    gray.data
        .iter()
        .map(|&v| {
            let hit = if threshold >= 0 { v > threshold as f32 } else { v < -(threshold as f32) };
            if hit {
                255.0
            } else {
                0.0
            }
        })
        .collect()
}

/// Segments `gray` into a binary (0/255) foreground mask.
pub fn remove_background(gray: &GrayF32Image, threshold: i32, gapsize: u32) -> GrayF32Image {
    let w = gray.width as usize;
    let h = gray.height as usize;
    let disk2 = disk_offsets(2);

    let original = threshold_mask(gray, threshold);
    let eroded = morph(&original, w, h, &disk2, false);
    let dilated = morph(&eroded, w, h, &disk2, true);

    let dilated_img: GrayF32Image = Image {
        width: gray.width,
        height: gray.height,
        data: dilated,
        valid_area: Rect::from_size(gray.width, gray.height),
        orig_size: gray.orig_size,
        index: gray.index,
    };
    let connected = radial_filter::connect(&dilated_img, gapsize as f32, 64);

    let mut combined: Vec<f32> = original
        .iter()
        .zip(connected.data.iter())
        .map(|(&a, &b)| if a > 0.0 || b > 0.0 { 255.0 } else { 0.0 })
        .collect();

    combined = morph(&combined, w, h, &disk2, true);
    combined = morph(&combined, w, h, &disk2, false);
    combined = morph(&combined, w, h, &disk2, false);
    combined = morph(&combined, w, h, &disk2, true);

    let mut out: GrayF32Image = Image {
        width: gray.width,
        height: gray.height,
        data: combined,
        valid_area: gray.valid_area,
        orig_size: gray.orig_size,
        index: gray.index,
    };
    out.limit_valid_area(gray.valid_area);
    out
}

pub struct BackgroundRemovalTask {
    base: TaskBase,
    input: Arc<dyn Task>,
    threshold: i32,
    gapsize: u32,
}

impl BackgroundRemovalTask {
    pub fn new(index: usize, input: Arc<dyn Task>, threshold: i32, gapsize: u32) -> Arc<Self> {
        Arc::new(Self {
            base: TaskBase::new("Remove background", "bgmask.png", index, false).with_depends_on(vec![input.clone()]),
            input,
            threshold,
            gapsize,
        })
    }
}

impl Task for BackgroundRemovalTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn execute(&self, _logger: &Logger) -> Result<Artifact> {
        let artifact = self.input.result();
        let gray = artifact
            .as_gray_f32()
            .ok_or_else(|| EngineError::ConfigError("background removal needs a merged grayscale input".to_string()))?;
        let mask = remove_background(gray, self.threshold, self.gapsize);
        self.limit_valid_area(mask.valid_area);
        Ok(Artifact::GrayF32(Arc::new(mask)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(w: u32, h: u32, data: Vec<f32>) -> GrayF32Image {
        Image { width: w, height: h, data, valid_area: Rect::from_size(w, h), orig_size: (w, h), index: 0 }
    }

    #[test]
    fn bright_subject_on_dark_background_is_foreground() {
        let mut data = vec![10.0f32; 100];
        for y in 3..7 {
            for x in 3..7 {
                data[y * 10 + x] = 200.0;
            }
        }
        let gray = image(10, 10, data);
        let mask = remove_background(&gray, 100, 8);
        assert!(*mask.at(5, 5) > 0.0);
        assert_eq!(*mask.at(0, 0), 0.0);
    }

    #[test]
    fn negative_threshold_selects_dark_subject_on_light_background() {
        let mut data = vec![240.0f32; 100];
        for y in 3..7 {
            for x in 3..7 {
                data[y * 10 + x] = 20.0;
            }
        }
        let gray = image(10, 10, data);
        let mask = remove_background(&gray, -100, 8);
        assert!(*mask.at(5, 5) > 0.0);
        assert_eq!(*mask.at(0, 0), 0.0);
    }
}
