//! Reassign stage (C9): recovers colour for the fused luminance. Two sub-
//! contracts per spec §4.9, both rolling a running map batch-by-batch the
//! same way Merge rolls `rolling_merge` — grounded on
//! `original_source/src/task_reassign.cc` for the final per-pixel
//! nearest-match/clamp mechanics (there a placeholder that just converts
//! the merged buffer to 8-bit; the richer incremental-map contract
//! implemented here is carried over from the design notes' two-sub-
//! contract description).
//!
//! Colour inputs keep, per pixel, the union of distinct `(gray, colour)`
//! pairs seen across the stack (capped at 255 entries, matching the u8
//! `counts` field the design calls for); grayscale-only inputs reduce to a
//! per-pixel `(min, max)` clamp range.

use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::geometry::Rect;
use crate::image::{Bgr8, ColorImage, GrayF32Image};
use crate::logger::Logger;
use crate::task::{Artifact, Task, TaskBase};

#[derive(Debug, Clone, Copy)]
struct ColorEntry {
    gray: u8,
    color: Bgr8,
}

/// Per-pixel union of distinct `(gray, colour)` pairs seen so far, capped
/// at 255 entries per pixel (the `counts` byte in the design's flat-array
/// layout caps the same way).
#[derive(Debug, Clone)]
pub struct ColorMap {
    width: u32,
    height: u32,
    entries: Vec<Vec<ColorEntry>>,
}

impl ColorMap {
    fn empty(width: u32, height: u32) -> Self {
        Self { width, height, entries: vec![Vec::new(); (width * height) as usize] }
    }

    fn insert(&mut self, x: u32, y: u32, gray: u8, color: Bgr8) {
        let idx = (y * self.width + x) as usize;
        let bucket = &mut self.entries[idx];
        if bucket.iter().any(|e| e.gray == gray) {
            return;
        }
        if bucket.len() < 255 {
            bucket.push(ColorEntry { gray, color });
        }
    }

    /// Nearest-gray match, ties broken by first-seen order (stable
    /// insertion order in `entries`).
    fn nearest(&self, x: u32, y: u32, target: f32) -> Option<Bgr8> {
        let idx = (y * self.width + x) as usize;
        self.entries[idx]
            .iter()
            .min_by(|a, b| {
                let da = (a.gray as f32 - target).abs();
                let db = (b.gray as f32 - target).abs();
                da.partial_cmp(&db).unwrap()
            })
            .map(|e| e.color)
    }
}

/// Per-pixel `(min, max)` clamp range for grayscale-only stacks.
#[derive(Debug, Clone)]
pub struct RangeMap {
    width: u32,
    height: u32,
    min: Vec<f32>,
    max: Vec<f32>,
}

impl RangeMap {
    fn full_range(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            min: vec![f32::INFINITY; (width * height) as usize],
            max: vec![f32::NEG_INFINITY; (width * height) as usize],
        }
    }

    fn update(&mut self, x: u32, y: u32, value: f32) {
        let idx = (y * self.width + x) as usize;
        self.min[idx] = self.min[idx].min(value);
        self.max[idx] = self.max[idx].max(value);
    }

    fn clamp(&self, x: u32, y: u32, value: f32) -> f32 {
        let idx = (y * self.width + x) as usize;
        value.clamp(self.min[idx], self.max[idx])
    }
}

#[derive(Debug, Clone)]
pub enum ReassignMap {
    Color(ColorMap),
    Range(RangeMap),
}

/// Incrementally extends the running map with one batch of aligned images.
/// `images` pairs each image's grayscale task with its colour task (or
/// `None` for grayscale-only stacks, selecting the range-clamp contract).
pub struct ReassignMapTask {
    base: TaskBase,
    previous: Option<Arc<dyn Task>>,
    images: Vec<(Arc<dyn Task>, Option<Arc<dyn Task>>)>,
}

impl ReassignMapTask {
    pub fn new(index: usize, previous: Option<Arc<dyn Task>>, images: Vec<(Arc<dyn Task>, Option<Arc<dyn Task>>)>) -> Arc<Self> {
        let mut deps: Vec<Arc<dyn Task>> = Vec::new();
        for (gray, color) in &images {
            deps.push(gray.clone());
            if let Some(c) = color {
                deps.push(c.clone());
            }
        }
        if let Some(p) = &previous {
            deps.push(p.clone());
        }
        Arc::new(Self {
            base: TaskBase::new("Update reassignment map", "reassign_map", index, false).with_depends_on(deps),
            previous,
            images,
        })
    }
}

impl Task for ReassignMapTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn execute(&self, _logger: &Logger) -> Result<Artifact> {
        if self.images.is_empty() {
            return Err(EngineError::ConfigError("reassignment map update needs at least one image".to_string()));
        }

        let has_color = self.images[0].1.is_some();
        let first_gray = self.images[0]
            .0
            .result()
            .as_gray_f32()
            .cloned()
            .ok_or_else(|| EngineError::ConfigError("reassignment map inputs must be grayscale".to_string()))?;
        let (w, h) = (first_gray.width, first_gray.height);

        let prev_artifact = self.previous.as_ref().map(|p| p.result());

        if has_color {
            let mut map = match prev_artifact.as_ref().and_then(|a| a.as_reassign_map()) {
                Some(m) => match m.as_ref() {
                    ReassignMap::Color(c) => c.clone(),
                    ReassignMap::Range(_) => return Err(EngineError::ConfigError("reassignment map mode changed mid-stack".to_string())),
                },
                None => ColorMap::empty(w, h),
            };

            for (gray_task, color_task) in &self.images {
                let gray_artifact = gray_task.result();
                let gray = gray_artifact
                    .as_gray_f32()
                    .ok_or_else(|| EngineError::ConfigError("reassignment map inputs must be grayscale".to_string()))?;
                let color_artifact = color_task.as_ref().unwrap().result();
                let color = color_artifact
                    .as_color()
                    .ok_or_else(|| EngineError::ConfigError("reassignment map colour input missing".to_string()))?;

                for y in 0..h {
                    for x in 0..w {
                        let g = (*gray.at(x, y)).round().clamp(0.0, 255.0) as u8;
                        let c = *color.at(x, y);
                        map.insert(x, y, g, c);
                    }
                }
            }

            self.limit_valid_area(Rect::from_size(w, h));
            Ok(Artifact::ReassignMap(Arc::new(ReassignMap::Color(map))))
        } else {
            let mut map = match prev_artifact.as_ref().and_then(|a| a.as_reassign_map()) {
                Some(m) => match m.as_ref() {
                    ReassignMap::Range(r) => r.clone(),
                    ReassignMap::Color(_) => return Err(EngineError::ConfigError("reassignment map mode changed mid-stack".to_string())),
                },
                None => RangeMap::full_range(w, h),
            };

            for (gray_task, _) in &self.images {
                let gray_artifact = gray_task.result();
                let gray = gray_artifact
                    .as_gray_f32()
                    .ok_or_else(|| EngineError::ConfigError("reassignment map inputs must be grayscale".to_string()))?;
                for y in 0..h {
                    for x in 0..w {
                        map.update(x, y, *gray.at(x, y));
                    }
                }
            }

            self.limit_valid_area(Rect::from_size(w, h));
            Ok(Artifact::ReassignMap(Arc::new(ReassignMap::Range(map))))
        }
    }
}

/// Final stage: applies the finalised map to the inverse-wavelet-
/// transformed merged grayscale, producing either a recovered colour
/// image or a ringing-suppressed grayscale clamp.
pub struct ReassignTask {
    base: TaskBase,
    merged: Arc<dyn Task>,
    map: Arc<dyn Task>,
}

impl ReassignTask {
    pub fn new(index: usize, filename: impl Into<String>, merged: Arc<dyn Task>, map: Arc<dyn Task>) -> Arc<Self> {
        let filename = filename.into();
        Arc::new(Self {
            base: TaskBase::new("Reassign pixel values", filename, index, false)
                .with_depends_on(vec![merged.clone(), map.clone()]),
            merged,
            map,
        })
    }
}

impl Task for ReassignTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn execute(&self, _logger: &Logger) -> Result<Artifact> {
        let merged_artifact = self.merged.result();
        let merged: &GrayF32Image = merged_artifact
            .as_gray_f32()
            .ok_or_else(|| EngineError::ConfigError("Reassign needs an inverse-wavelet grayscale".to_string()))?;

        let map_artifact = self.map.result();
        let map = map_artifact
            .as_reassign_map()
            .ok_or_else(|| EngineError::ConfigError("Reassign needs a finalised reassignment map".to_string()))?;

        match map.as_ref() {
            ReassignMap::Color(cmap) => {
                let mut out: ColorImage = crate::image::Image::new_filled(merged.width, merged.height, [0u8, 0, 0], merged.index);
                for y in 0..merged.height {
                    for x in 0..merged.width {
                        let value = *merged.at(x, y);
                        let color = cmap.nearest(x, y, value).unwrap_or([value.clamp(0.0, 255.0) as u8; 3]);
                        *out.at_mut(x, y) = color;
                    }
                }
                out.limit_valid_area(merged.valid_area);
                self.limit_valid_area(out.valid_area);
                Ok(Artifact::Color(Arc::new(out)))
            }
            ReassignMap::Range(rmap) => {
                let mut out = merged.clone();
                for y in 0..merged.height {
                    for x in 0..merged.width {
                        let clamped = rmap.clamp(x, y, *merged.at(x, y));
                        *out.at_mut(x, y) = clamped;
                    }
                }
                out.limit_valid_area(merged.valid_area);
                self.limit_valid_area(out.valid_area);
                Ok(Artifact::GrayF32(Arc::new(out)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Image;

    struct FakeGray {
        base: TaskBase,
        value: GrayF32Image,
    }
    impl Task for FakeGray {
        fn base(&self) -> &TaskBase {
            &self.base
        }
        fn execute(&self, _logger: &Logger) -> Result<Artifact> {
            Ok(Artifact::GrayF32(Arc::new(self.value.clone())))
        }
    }

    struct FakeColor {
        base: TaskBase,
        value: ColorImage,
    }
    impl Task for FakeColor {
        fn base(&self) -> &TaskBase {
            &self.base
        }
        fn execute(&self, _logger: &Logger) -> Result<Artifact> {
            Ok(Artifact::Color(Arc::new(self.value.clone())))
        }
    }

    fn gray_task(index: usize, w: u32, h: u32, fill: f32) -> Arc<dyn Task> {
        let img: GrayF32Image = Image::new_filled(w, h, fill, index);
        let t = Arc::new(FakeGray { base: TaskBase::new("g", "g.jpg", index, false), value: img });
        t.run(&Logger::new()).unwrap();
        t as Arc<dyn Task>
    }

    fn color_task(index: usize, w: u32, h: u32, fill: Bgr8) -> Arc<dyn Task> {
        let img: ColorImage = Image::new_filled(w, h, fill, index);
        let t = Arc::new(FakeColor { base: TaskBase::new("c", "c.jpg", index, false), value: img });
        t.run(&Logger::new()).unwrap();
        t as Arc<dyn Task>
    }

    #[test]
    fn color_map_nearest_picks_closest_gray_entry() {
        let g1 = gray_task(0, 2, 2, 50.0);
        let c1 = color_task(0, 2, 2, [10, 20, 30]);
        let g2 = gray_task(1, 2, 2, 200.0);
        let c2 = color_task(1, 2, 2, [200, 210, 220]);

        let map_task = ReassignMapTask::new(0, None, vec![(g1, Some(c1)), (g2, Some(c2))]);
        map_task.run(&Logger::new()).unwrap();

        let merged = gray_task(2, 2, 2, 60.0);
        let reassign = ReassignTask::new(1, "out.jpg", merged, map_task.clone() as Arc<dyn Task>);
        reassign.run(&Logger::new()).unwrap();

        let artifact = reassign.result();
        let color = artifact.as_color().unwrap();
        assert_eq!(*color.at(0, 0), [10, 20, 30]);
    }

    #[test]
    fn range_map_clamps_outside_seen_bounds() {
        let g1 = gray_task(0, 2, 2, 40.0);
        let g2 = gray_task(1, 2, 2, 60.0);

        let map_task = ReassignMapTask::new(0, None, vec![(g1, None), (g2, None)]);
        map_task.run(&Logger::new()).unwrap();

        let merged = gray_task(2, 2, 2, 1000.0);
        let reassign = ReassignTask::new(1, "out.jpg", merged, map_task.clone() as Arc<dyn Task>);
        reassign.run(&Logger::new()).unwrap();

        let artifact = reassign.result();
        let gray = artifact.as_gray_f32().unwrap();
        assert_eq!(*gray.at(0, 0), 60.0);
    }
}
