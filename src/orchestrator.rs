//! Pipeline orchestrator (C3): builds the dependency graph for a whole
//! stack and drives it through the scheduler. Grounded on
//! `original_source/src/focusstack.cc`'s `FocusStack::run()` — reference
//! selection, alternating-outward scheduling order, per-image neighbour or
//! global alignment, rolling merge/reassignment-map batching, and the
//! finalization chain (denoise → inverse wavelet → reassign → save, plus
//! optional depth inpaint and 3-D preview).
//!
//! Two simplifications versus the original's incremental graph
//! construction, both recorded in DESIGN.md:
//! - The reference image's Load and Grayscale tasks are run synchronously
//!   (not just scheduled) the moment the reference index is known, so their
//!   PCA grayscale weights and padded dimensions are available values the
//!   orchestrator can hand to every other image's tasks at construction
//!   time, rather than threading a lazy "ask the reference task" dependency
//!   through `GrayscaleTask`'s and `WaveletTask`'s constructors.
//! - `start`/`add_image`/`finalize` accumulate the input list and defer all
//!   graph construction to `finalize`, once the final image count is known
//!   (needed for reference auto-selection and the depth fit's `max_depth`).
//!   This keeps the documented four-call streaming shape while avoiding a
//!   genuinely reference-count-dependent graph being built two images at a
//!   time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::gpu::GpuContext;
use crate::logger::Logger;
use crate::scheduler::{Scheduler, WaitOutcome};
use crate::task::Task;
use crate::tasks::align::AlignTask;
use crate::tasks::background_removal::BackgroundRemovalTask;
use crate::tasks::depth::DepthLayerTask;
use crate::tasks::depth_inpaint::DepthInpaintTask;
use crate::tasks::denoise::DenoiseTask;
use crate::tasks::focus_measure::FocusMeasureTask;
use crate::tasks::grayscale::{fit_pca_weights, GrayWeights, GrayscaleTask};
use crate::tasks::load::{choose_levels, LoadTask};
use crate::tasks::merge::MergeTask;
use crate::tasks::preview3d::Preview3DTask;
use crate::tasks::reassign::{ReassignMapTask, ReassignTask};
use crate::tasks::save::SaveTask;
use crate::tasks::wavelet::WaveletTask;
use crate::tasks::wavelet_gpu::WaveletGpuTask;

/// Resolves `--reference=I`, falling back to the middle image of the stack
/// when unset or out of range.
pub fn resolve_reference(explicit: Option<usize>, count: usize) -> usize {
    match explicit {
        Some(i) if i < count => i,
        _ => count / 2,
    }
}

/// Builds the `ref, ref-1, ref+1, ref-2, ref+2, …` visiting order (spec
/// §4.3 "Scheduling order").
pub fn alternating_order(refidx: usize, count: usize) -> Vec<usize> {
    let mut order = vec![refidx];
    let mut step = 1isize;
    loop {
        let lo = refidx as isize - step;
        let hi = refidx as isize + step;
        let mut added = false;
        if lo >= 0 {
            order.push(lo as usize);
            added = true;
        }
        if hi < count as isize {
            order.push(hi as usize);
            added = true;
        }
        if !added {
            break;
        }
        step += 1;
    }
    order
}

fn neighbour_of(i: usize, refidx: usize) -> usize {
    if i < refidx {
        i + 1
    } else {
        i - 1
    }
}

/// Terminal task handles produced by a finished run, for programmatic
/// retrieval (spec §6 "retrieve the result image, depth map, 3-D view by
/// value").
pub struct EngineOutputs {
    pub output: Arc<dyn Task>,
    pub depthmap: Option<Arc<dyn Task>>,
    pub preview_3d: Option<Arc<dyn Task>>,
}

struct PerImage {
    load: Option<Arc<dyn Task>>,
    grayscale: Option<Arc<dyn Task>>,
    aligned: Option<Arc<dyn Task>>,
    aligned_grayscale: Option<Arc<dyn Task>>,
    focus: Option<Arc<dyn Task>>,
}

impl PerImage {
    fn empty() -> Self {
        Self { load: None, grayscale: None, aligned: None, aligned_grayscale: None, focus: None }
    }
}

pub struct Orchestrator {
    config: EngineConfig,
    logger: Logger,
    scheduler: Scheduler,
    gpu: Option<Arc<GpuContext>>,
    pending_paths: Mutex<Vec<String>>,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, logger: Logger) -> Result<Self> {
        let gpu = GpuContext::probe(config.allow_gpu)?;
        if config.allow_gpu && gpu.is_none() {
            logger.verbose("GPU unavailable, falling back to CPU wavelet transform");
        }
        let scheduler = Scheduler::new(config.threads.max(1), logger.clone());
        Ok(Self { config, logger, scheduler, gpu, pending_paths: Mutex::new(Vec::new()) })
    }

    /// Streaming entry point: queues one more input path.
    pub fn add_image(&self, path: impl Into<String>) {
        self.pending_paths.lock().unwrap().push(path.into());
    }

    /// Blocking entry point: adds every path then builds and waits for the
    /// whole graph.
    pub fn run(&self, paths: impl IntoIterator<Item = String>, timeout: Option<Duration>) -> Result<(EngineOutputs, WaitOutcome)> {
        for p in paths {
            self.add_image(p);
        }
        let outputs = self.finalize()?;
        let outcome = self.scheduler.wait_all(timeout);
        Ok((outputs, outcome))
    }

    pub fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        self.scheduler.wait_all(timeout)
    }

    pub fn get_status(&self) -> (u32, u32) {
        self.scheduler.get_status()
    }

    fn wavelet_task(&self, index: usize, filename: impl Into<String>, input: Arc<dyn Task>, levels: u32, forward: bool) -> Arc<dyn Task> {
        match &self.gpu {
            Some(ctx) => WaveletGpuTask::new(index, filename, ctx.clone(), input, levels, forward) as Arc<dyn Task>,
            None => WaveletTask::new(index, filename, input, levels, forward) as Arc<dyn Task>,
        }
    }

    /// Builds the whole dependency graph from the accumulated `add_image`
    /// calls and returns handles to its terminal tasks. Does not block;
    /// call `wait` (or use `run`) to drive the scheduler to completion.
    pub fn finalize(&self) -> Result<EngineOutputs> {
        let paths = std::mem::take(&mut *self.pending_paths.lock().unwrap());
        let count = paths.len();
        if count < 2 {
            return Err(EngineError::ConfigError(format!(
                "focus stacking needs at least 2 input images, got {count}"
            )));
        }

        let refidx = resolve_reference(self.config.reference, count);
        let order = alternating_order(refidx, count);
        let wait_images = if self.config.wait_images_secs > 0 {
            Some(Duration::from_secs(self.config.wait_images_secs))
        } else {
            None
        };

        let mut images: Vec<PerImage> = (0..count).map(|_| PerImage::empty()).collect();
        let mut next_index = count;
        let mut alloc_index = || {
            let i = next_index;
            next_index += 1;
            i
        };

        // Reference image: load and grayscale-convert synchronously so its
        // PCA weights and padded dimensions are known values before any
        // other image's tasks are constructed.
        let ref_path = paths[refidx].clone();
        let ref_load = LoadTask::new(refidx, &ref_path, wait_images);
        self.scheduler.prepend(ref_load.clone() as Arc<dyn Task>);
        ref_load.run(&self.logger).map_err(|m| EngineError::TaskException { task_name: ref_load.name().to_string(), message: m })?;

        let ref_color_artifact = ref_load.result();
        let ref_weights: Option<GrayWeights> = ref_color_artifact.as_color().map(|c| fit_pca_weights(c));
        let (ref_w, ref_h) = if let Some(c) = ref_color_artifact.as_color() {
            (c.width, c.height)
        } else if let Some(g) = ref_color_artifact.as_gray() {
            (g.width, g.height)
        } else {
            return Err(EngineError::ConfigError("reference image produced no raster".to_string()));
        };
        let levels = choose_levels(ref_w.min(ref_h));

        let ref_gray = GrayscaleTask::new(refidx, &ref_path, ref_load.clone() as Arc<dyn Task>, None);
        self.scheduler.prepend(ref_gray.clone() as Arc<dyn Task>);
        ref_gray.run(&self.logger).map_err(|m| EngineError::TaskException { task_name: ref_gray.name().to_string(), message: m })?;

        images[refidx].load = Some(ref_load.clone() as Arc<dyn Task>);
        images[refidx].grayscale = Some(ref_gray.clone() as Arc<dyn Task>);

        let mut merge_batch: Vec<Arc<dyn Task>> = Vec::new();
        let mut reassign_batch: Vec<(Arc<dyn Task>, Option<Arc<dyn Task>>)> = Vec::new();
        let mut rolling_merge: Option<Arc<dyn Task>> = None;
        let mut rolling_map: Option<Arc<dyn Task>> = None;

        let mut left_frontier: Option<usize> = None;
        let mut right_frontier: Option<usize> = None;

        for &i in &order {
            let basename = paths[i].rsplit(['/', '\\']).next().unwrap_or(&paths[i]).to_string();

            let (load, grayscale): (Arc<dyn Task>, Arc<dyn Task>) = if i == refidx {
                (ref_load.clone() as Arc<dyn Task>, ref_gray.clone() as Arc<dyn Task>)
            } else {
                let load = LoadTask::new(i, &paths[i], wait_images);
                self.scheduler.add(load.clone() as Arc<dyn Task>);
                let gray = GrayscaleTask::new(i, &paths[i], load.clone() as Arc<dyn Task>, ref_weights);
                self.scheduler.add(gray.clone() as Arc<dyn Task>);
                (load as Arc<dyn Task>, gray as Arc<dyn Task>)
            };

            let aligned: Arc<dyn Task> = if i == refidx {
                let t = AlignTask::identity(refidx, format!("aligned_{basename}"), load.clone());
                self.scheduler.prepend(t.clone() as Arc<dyn Task>);
                t as Arc<dyn Task>
            } else {
                let neighbour = neighbour_of(i, refidx);
                let t = if self.config.global_align {
                    AlignTask::new(
                        i,
                        format!("aligned_{basename}"),
                        Some(images[refidx].aligned_grayscale.clone().expect("reference aligned grayscale built before any non-reference image")),
                        Some(images[refidx].aligned.clone().expect("reference align task built before any non-reference image")),
                        Some(images[neighbour].aligned.clone().expect("neighbour must be scheduled before this image in alternating order")),
                        None,
                        grayscale.clone(),
                        load.clone(),
                        self.config.use_whitebalance,
                        self.config.use_contrast,
                        self.config.full_resolution_align,
                        self.config.align_keep_size,
                    )
                } else {
                    AlignTask::new(
                        i,
                        format!("aligned_{basename}"),
                        Some(images[neighbour].aligned_grayscale.clone().expect("neighbour aligned grayscale must exist")),
                        Some(images[neighbour].load.clone().expect("neighbour load must exist")),
                        None,
                        Some(images[neighbour].aligned.clone().expect("neighbour align task must exist")),
                        grayscale.clone(),
                        load.clone(),
                        self.config.use_whitebalance,
                        self.config.use_contrast,
                        self.config.full_resolution_align,
                        self.config.align_keep_size,
                    )
                };
                self.scheduler.add(t.clone() as Arc<dyn Task>);
                t as Arc<dyn Task>
            };

            if self.config.save_steps {
                self.scheduler.add(SaveTask::new(alloc_index(), format!("grayscale_{basename}"), grayscale.clone(), None, self.config.jpg_quality, true) as Arc<dyn Task>);
                self.scheduler.add(SaveTask::new(alloc_index(), format!("aligned_{basename}"), aligned.clone(), None, self.config.jpg_quality, self.config.nocrop) as Arc<dyn Task>);
            }

            images[i].load = Some(load);
            images[i].grayscale = Some(grayscale);
            images[i].aligned = Some(aligned.clone());

            if self.config.align_only {
                if !self.config.save_steps {
                    self.scheduler.add(SaveTask::new(alloc_index(), format!("aligned_{basename}"), aligned, None, self.config.jpg_quality, self.config.nocrop) as Arc<dyn Task>);
                }
                continue;
            }

            let aligned_gray = GrayscaleTask::new(i, &basename, aligned.clone(), ref_weights);
            self.scheduler.add(aligned_gray.clone() as Arc<dyn Task>);
            images[i].aligned_grayscale = Some(aligned_gray.clone() as Arc<dyn Task>);

            let focus = FocusMeasureTask::new(i, format!("focus_{basename}"), aligned_gray.clone() as Arc<dyn Task>, 1.0, 0.0);
            self.scheduler.add(focus.clone() as Arc<dyn Task>);
            images[i].focus = Some(focus as Arc<dyn Task>);

            let wavelet = self.wavelet_task(i, format!("wavelet_{basename}"), aligned_gray.clone() as Arc<dyn Task>, levels, true);
            self.scheduler.add(wavelet.clone());
            merge_batch.push(wavelet);
            reassign_batch.push((aligned_gray.clone() as Arc<dyn Task>, Some(aligned.clone())));

            if merge_batch.len() >= self.config.batch_size {
                let merge = MergeTask::new(alloc_index(), rolling_merge.take(), std::mem::take(&mut merge_batch), self.config.consistency.level());
                self.scheduler.add(merge.clone() as Arc<dyn Task>);
                rolling_merge = Some(merge as Arc<dyn Task>);

                let map = ReassignMapTask::new(alloc_index(), rolling_map.take(), std::mem::take(&mut reassign_batch));
                self.scheduler.add(map.clone() as Arc<dyn Task>);
                rolling_map = Some(map as Arc<dyn Task>);
            }

            let frontier = if i < refidx { &mut left_frontier } else { &mut right_frontier };
            if let Some(stale) = frontier.replace(i) {
                if stale != refidx {
                    images[stale].aligned = None;
                    images[stale].aligned_grayscale = None;
                    images[stale].load = None;
                    images[stale].grayscale = None;
                }
            }
        }

        if self.config.align_only {
            let last = images[order[order.len() - 1]].aligned.clone().expect("align-only run always builds an aligned task");
            return Ok(EngineOutputs { output: last, depthmap: None, preview_3d: None });
        }

        if !merge_batch.is_empty() {
            let merge = if merge_batch.len() == 1 && rolling_merge.is_none() {
                merge_batch.pop().unwrap()
            } else {
                let t = MergeTask::new(alloc_index(), rolling_merge.take(), std::mem::take(&mut merge_batch), self.config.consistency.level());
                self.scheduler.add(t.clone() as Arc<dyn Task>);
                t as Arc<dyn Task>
            };
            rolling_merge = Some(merge);
        }
        if !reassign_batch.is_empty() {
            let map = ReassignMapTask::new(alloc_index(), rolling_map.take(), std::mem::take(&mut reassign_batch));
            self.scheduler.add(map.clone() as Arc<dyn Task>);
            rolling_map = Some(map as Arc<dyn Task>);
        }

        let merged_wavelet = rolling_merge.expect("at least one merge batch is always produced for count >= 2");
        let final_map = rolling_map.expect("at least one reassignment map batch is always produced for count >= 2");

        let denoised = DenoiseTask::new(alloc_index(), "denoised", merged_wavelet, levels, self.config.denoise);
        self.scheduler.add(denoised.clone() as Arc<dyn Task>);

        let merged_gray = self.wavelet_task(alloc_index(), "merged_gray", denoised as Arc<dyn Task>, levels, false);
        self.scheduler.add(merged_gray.clone());
        if self.config.save_steps {
            self.scheduler.add(SaveTask::new(alloc_index(), "merged_gray.png", merged_gray.clone(), None, self.config.jpg_quality, true) as Arc<dyn Task>);
        }

        let reassigned = ReassignTask::new(alloc_index(), self.config.output.clone(), merged_gray.clone(), final_map);
        self.scheduler.add(reassigned.clone() as Arc<dyn Task>);

        let alpha_mask = self.config.remove_bg.map(|threshold| {
            let mask = BackgroundRemovalTask::new(alloc_index(), merged_gray.clone(), threshold, self.config.halo_radius * 2);
            self.scheduler.add(mask.clone() as Arc<dyn Task>);
            mask as Arc<dyn Task>
        });

        let output_save = SaveTask::new(alloc_index(), self.config.output.clone(), reassigned.clone() as Arc<dyn Task>, alpha_mask, self.config.jpg_quality, self.config.nocrop);
        self.scheduler.add(output_save.clone() as Arc<dyn Task>);

        let compute_depth = self.config.depthmap.is_some() || self.config.preview_3d.is_some();
        let mut depthmap_save: Option<Arc<dyn Task>> = None;
        let mut preview_save: Option<Arc<dyn Task>> = None;

        if compute_depth {
            let mut previous_layer: Option<Arc<dyn Task>> = None;
            let max_depth = (count - 1) as u32;
            for idx in 0..count {
                let focus = images[idx].focus.clone().expect("every image's focus measure is built before finalization");
                let layer = DepthLayerTask::new(alloc_index(), Some(focus), previous_layer.clone(), idx as u32, idx == count - 1, max_depth);
                self.scheduler.add(layer.clone() as Arc<dyn Task>);
                previous_layer = Some(layer as Arc<dyn Task>);
            }
            let last_layer = previous_layer.expect("count >= 2 guarantees at least one depth layer");

            let inpainted = DepthInpaintTask::new(
                alloc_index(),
                "depthmap.png",
                last_layer,
                self.config.depthmap_threshold,
                self.config.depthmap_smooth_xy,
                self.config.depthmap_smooth_z,
                self.config.halo_radius,
            );
            self.scheduler.add(inpainted.clone() as Arc<dyn Task>);

            if let Some(path) = &self.config.depthmap {
                let save = SaveTask::new(alloc_index(), path.clone(), inpainted.clone() as Arc<dyn Task>, None, self.config.jpg_quality, self.config.nocrop);
                self.scheduler.add(save.clone() as Arc<dyn Task>);
                depthmap_save = Some(save as Arc<dyn Task>);
            }

            if let Some(path) = &self.config.preview_3d {
                let preview = Preview3DTask::new(alloc_index(), path.clone(), reassigned.clone() as Arc<dyn Task>, inpainted as Arc<dyn Task>, self.config.view_point);
                let save = SaveTask::new(alloc_index(), path.clone(), preview as Arc<dyn Task>, None, self.config.jpg_quality, self.config.nocrop);
                self.scheduler.add(save.clone() as Arc<dyn Task>);
                preview_save = Some(save as Arc<dyn Task>);
            }
        }

        Ok(EngineOutputs { output: output_save, depthmap: depthmap_save, preview_3d: preview_save })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_defaults_to_middle_image() {
        assert_eq!(resolve_reference(None, 7), 3);
        assert_eq!(resolve_reference(None, 4), 2);
    }

    #[test]
    fn reference_out_of_range_falls_back_to_middle() {
        assert_eq!(resolve_reference(Some(99), 5), 2);
    }

    #[test]
    fn explicit_in_range_reference_is_kept() {
        assert_eq!(resolve_reference(Some(1), 5), 1);
    }

    #[test]
    fn alternating_order_visits_reference_first_then_outward() {
        assert_eq!(alternating_order(2, 5), vec![2, 1, 3, 0, 4]);
    }

    #[test]
    fn alternating_order_handles_reference_at_an_edge() {
        assert_eq!(alternating_order(0, 4), vec![0, 1, 2, 3]);
        assert_eq!(alternating_order(3, 4), vec![3, 2, 1, 0]);
    }

    #[test]
    fn neighbour_of_points_toward_the_reference() {
        assert_eq!(neighbour_of(0, 2), 1);
        assert_eq!(neighbour_of(4, 2), 3);
    }
}
