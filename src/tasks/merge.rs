//! Merge stage (C8): maximum-magnitude wavelet fusion with an optional
//! two-pass consistency denoise, rolling a batch into a running merge.
//! Grounded on `original_source/src/task_merge.cc`: selection pass picks
//! the per-pixel largest-magnitude coefficient and labels it with the
//! contributing image's index, subband-consistency denoise majority-votes
//! the three detail subbands at every level, and neighbour-consistency
//! denoise flattens depth-label outliers among the four Von Neumann
//! neighbours.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::image::{complex_sq_mag, DepthLabelImage, Image, WaveletImage};
use crate::logger::Logger;
use crate::task::{Artifact, Task, TaskBase};

fn levels_for_size(w: u32, h: u32) -> u32 {
    let mut levels = 0;
    let mut cw = w;
    let mut ch = h;
    while cw % 2 == 0 && ch % 2 == 0 && cw > 1 && ch > 1 && levels < 16 {
        cw /= 2;
        ch /= 2;
        levels += 1;
    }
    levels
}

/// Looks up the contributing image for `label`, falling back to the
/// previous rolling merge if `label` isn't one of the current batch's
/// indices — mirrors `Task_Merge::get_source_img`'s behaviour when the
/// neighbour-average label happens to coincide with an index outside the
/// current batch.
fn source_coeff(
    label: u16,
    batch: &HashMap<u16, Arc<WaveletImage>>,
    prev: Option<&WaveletImage>,
    x: u32,
    y: u32,
) -> Option<[f32; 2]> {
    if let Some(img) = batch.get(&label) {
        Some(*img.at(x, y))
    } else {
        prev.map(|p| *p.at(x, y))
    }
}

fn denoise_subbands(
    merged: &mut WaveletImage,
    labels: &mut DepthLabelImage,
    batch: &HashMap<u16, Arc<WaveletImage>>,
    prev: Option<&WaveletImage>,
) {
    let levels = levels_for_size(merged.width, merged.height);
    for level in 0..levels {
        let w = (merged.width >> level) as usize;
        let h = (merged.height >> level) as usize;
        let (w2, h2) = (w / 2, h / 2);
        if w2 == 0 || h2 == 0 {
            continue;
        }

        for y in 0..h2 as u32 {
            for x in 0..w2 as u32 {
                // Three detail subbands at this level: horizontal (top-right
                // quadrant), diagonal (bottom-right), vertical (bottom-left).
                let (hx, hy) = (w2 as u32 + x, y);
                let (dx, dy) = (w2 as u32 + x, h2 as u32 + y);
                let (vx, vy) = (x, h2 as u32 + y);

                let v1 = *labels.at(hx, hy);
                let v2 = *labels.at(dx, dy);
                let v3 = *labels.at(vx, vy);

                if v1 == v2 && v2 == v3 {
                    continue;
                } else if v2 == v3 {
                    if let Some(c) = source_coeff(v2, batch, prev, hx, hy) {
                        *labels.at_mut(hx, hy) = v2;
                        *merged.at_mut(hx, hy) = c;
                    }
                } else if v1 == v3 {
                    if let Some(c) = source_coeff(v1, batch, prev, dx, dy) {
                        *labels.at_mut(dx, dy) = v1;
                        *merged.at_mut(dx, dy) = c;
                    }
                } else if v1 == v2 {
                    if let Some(c) = source_coeff(v1, batch, prev, vx, vy) {
                        *labels.at_mut(vx, vy) = v1;
                        *merged.at_mut(vx, vy) = c;
                    }
                }
            }
        }
    }
}

fn denoise_neighbours(
    merged: &mut WaveletImage,
    labels: &mut DepthLabelImage,
    batch: &HashMap<u16, Arc<WaveletImage>>,
    prev: Option<&WaveletImage>,
) {
    let w = labels.width;
    let h = labels.height;
    if w < 3 || h < 3 {
        return;
    }
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let left = *labels.at(x - 1, y);
            let right = *labels.at(x + 1, y);
            let top = *labels.at(x, y - 1);
            let bottom = *labels.at(x, y + 1);
            let center = *labels.at(x, y);

            let all_greater = center > top && center > bottom && center > left && center > right;
            let all_less = center < top && center < bottom && center < left && center < right;
            if all_greater || all_less {
                let avg = ((top as u32 + bottom as u32 + left as u32 + right as u32 + 2) / 4) as u16;
                if let Some(c) = source_coeff(avg, batch, prev, x, y) {
                    *labels.at_mut(x, y) = avg;
                    *merged.at_mut(x, y) = c;
                }
            }
        }
    }
}

pub struct MergeTask {
    base: TaskBase,
    previous: Option<Arc<dyn Task>>,
    batch: Vec<Arc<dyn Task>>,
    consistency: u8,
}

impl MergeTask {
    pub fn new(index: usize, previous: Option<Arc<dyn Task>>, batch: Vec<Arc<dyn Task>>, consistency: u8) -> Arc<Self> {
        let mut deps = batch.clone();
        if let Some(p) = &previous {
            deps.push(p.clone());
        }
        Arc::new(Self {
            base: TaskBase::new(format!("Merge {} images", batch.len()), "merge_result.jpg", index, false)
                .with_depends_on(deps),
            previous,
            batch,
            consistency,
        })
    }
}

impl Task for MergeTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn execute(&self, _logger: &Logger) -> Result<Artifact> {
        if self.batch.is_empty() {
            return Err(EngineError::ConfigError("Merge requires at least one wavelet image".to_string()));
        }

        let first_artifact = self.batch[0].result();
        let first = first_artifact
            .as_wavelet()
            .ok_or_else(|| EngineError::ConfigError("Merge inputs must be wavelet images".to_string()))?;
        let w = first.width;
        let h = first.height;

        let prev_artifact = self.previous.as_ref().map(|p| p.result());
        let prev_wavelet = prev_artifact.as_ref().and_then(|a| a.as_wavelet());
        let prev_labels = prev_artifact.as_ref().and_then(|a| a.as_depth_label());

        let (mut merged, mut labels, mut max_sq) = if let (Some(pw), Some(pl)) = (prev_wavelet, prev_labels) {
            ((**pw).clone(), (**pl).clone(), vec![-1.0f32; (w * h) as usize])
        } else {
            (
                Image::new_filled(w, h, [0.0f32, 0.0], 0),
                Image::new_filled(w, h, 0u16, 0),
                vec![-1.0f32; (w * h) as usize],
            )
        };

        // With a prior merge, seed max_sq from its own coefficients so the
        // selection pass only overwrites where the batch genuinely wins.
        if prev_wavelet.is_some() {
            for (i, c) in merged.data.iter().enumerate() {
                max_sq[i] = complex_sq_mag(c);
            }
        }

        let mut batch_map: HashMap<u16, Arc<WaveletImage>> = HashMap::with_capacity(self.batch.len());

        for task in &self.batch {
            let artifact = task.result();
            let wavelet = artifact
                .as_wavelet()
                .ok_or_else(|| EngineError::ConfigError("Merge inputs must be wavelet images".to_string()))?
                .clone();
            let idx = task.index() as u16;

            for i in 0..(w * h) as usize {
                let sq = complex_sq_mag(&wavelet.data[i]);
                if sq > max_sq[i] {
                    max_sq[i] = sq;
                    merged.data[i] = wavelet.data[i];
                    labels.data[i] = idx;
                }
            }

            batch_map.insert(idx, wavelet);
        }

        if self.consistency >= 1 {
            denoise_subbands(&mut merged, &mut labels, &batch_map, prev_wavelet.map(|a| a.as_ref()));
        }
        if self.consistency >= 2 {
            denoise_neighbours(&mut merged, &mut labels, &batch_map, prev_wavelet.map(|a| a.as_ref()));
        }

        let mut valid_area = self.batch[0].valid_area();
        for task in self.batch.iter().skip(1) {
            valid_area = valid_area.intersect(&task.valid_area());
        }
        if let Some(p) = &self.previous {
            valid_area = valid_area.intersect(&p.valid_area());
        }
        merged.limit_valid_area(valid_area);
        labels.limit_valid_area(valid_area);
        self.limit_valid_area(valid_area);

        Ok(Artifact::Merge(Arc::new(merged), Arc::new(labels)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;

    struct FakeWavelet {
        base: TaskBase,
        value: WaveletImage,
    }

    impl Task for FakeWavelet {
        fn base(&self) -> &TaskBase {
            &self.base
        }
        fn execute(&self, _logger: &Logger) -> Result<Artifact> {
            Ok(Artifact::Wavelet(Arc::new(self.value.clone())))
        }
    }

    fn wavelet_task(index: usize, w: u32, h: u32, fill: impl Fn(u32, u32) -> [f32; 2]) -> Arc<dyn Task> {
        let mut data = Vec::with_capacity((w * h) as usize);
        for y in 0..h {
            for x in 0..w {
                data.push(fill(x, y));
            }
        }
        let img = Image { width: w, height: h, data, valid_area: Rect::from_size(w, h), orig_size: (w, h), index };
        let t = Arc::new(FakeWavelet { base: TaskBase::new("w", "w.jpg", index, false), value: img });
        t.run(&Logger::new()).unwrap();
        t as Arc<dyn Task>
    }

    #[test]
    fn selection_pass_picks_larger_magnitude_coefficient_per_half() {
        let w = 8u32;
        let h = 8u32;
        let a = wavelet_task(0, w, h, |x, _| if x < 4 { [5.0, 0.0] } else { [0.0, 0.0] });
        let b = wavelet_task(1, w, h, |x, _| if x < 4 { [0.0, 0.0] } else { [5.0, 0.0] });

        let merge = MergeTask::new(0, None, vec![a, b], 0);
        merge.run(&Logger::new()).unwrap();
        let artifact = merge.result();
        let merged = artifact.as_wavelet().unwrap();
        let labels = artifact.as_depth_label().unwrap();

        assert_eq!(*merged.at(0, 0), [5.0, 0.0]);
        assert_eq!(*merged.at(7, 0), [5.0, 0.0]);
        assert_eq!(*labels.at(0, 0), 0);
        assert_eq!(*labels.at(7, 0), 1);
    }

    #[test]
    fn rolling_merge_consumes_previous_result() {
        let w = 4u32;
        let h = 4u32;
        let first_batch = wavelet_task(0, w, h, |_, _| [3.0, 0.0]);
        let first_merge = MergeTask::new(0, None, vec![first_batch], 0);
        first_merge.run(&Logger::new()).unwrap();

        let second_batch = wavelet_task(1, w, h, |_, _| [1.0, 0.0]);
        let second_merge = MergeTask::new(1, Some(first_merge.clone() as Arc<dyn Task>), vec![second_batch], 0);
        second_merge.run(&Logger::new()).unwrap();

        let artifact = second_merge.result();
        let merged = artifact.as_wavelet().unwrap();
        // previous merge's larger-magnitude coefficient should survive.
        assert_eq!(*merged.at(0, 0), [3.0, 0.0]);
    }
}
