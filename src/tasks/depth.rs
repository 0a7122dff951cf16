//! Depth pipeline, layer accumulation and Gaussian fit (C10). Grounded on
//! `original_source/src/task_depthmap.cc`: each layer chains through a
//! `previous` link so re-execution cost is linear in layer count
//! regardless of pool width, the running accumulator is an 8-channel Guo
//! buffer (`GuoAccumulator`), and the final fit solves a 3x3 linear system
//! per pixel (Hongwei Guo's closed-form Gaussian fit) once the last layer
//! has been folded in.

use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::geometry::Rect;
use crate::histogram::HistogramPercentile;
use crate::image::{GrayF32Image, GuoAccumulator, GuoChannels, Image};
use crate::logger::Logger;
use crate::task::{Artifact, Task, TaskBase};

/// The running accumulator plus the noise floor estimated once on the
/// first layer and carried unchanged down the `previous` chain (re-
/// estimating it per layer would double-subtract the noise floor).
#[derive(Debug, Clone)]
pub struct GuoState {
    pub guo: GuoAccumulator,
    pub noise_level: f32,
}

/// Per-pixel Gaussian-fit result: mean (scaled to `[0, 255]` depth), std
/// deviation of the fit, and fitted amplitude — unknown pixels (fit
/// rejected) get `(0, 255, 0)`.
#[derive(Debug, Clone)]
pub struct DepthMap {
    pub width: u32,
    pub height: u32,
    pub mean: Vec<f32>,
    pub dev: Vec<f32>,
    pub amp: Vec<f32>,
    pub noise_level: f32,
    pub valid_area: Rect,
}

impl DepthMap {
    pub fn at_mean(&self, x: u32, y: u32) -> f32 {
        self.mean[(y * self.width + x) as usize]
    }

    /// Amplitude-minus-noise mask with high-deviation suppression and halo
    /// removal by dilating the mask and subtracting half its value, as in
    /// `Task_Depthmap::mask`.
    pub fn mask(&self, halo_radius: u32) -> Vec<f32> {
        let w = self.width as usize;
        let h = self.height as usize;
        let mut mask: Vec<f32> = self
            .amp
            .iter()
            .map(|&a| (a - self.noise_level).max(0.0).min(255.0))
            .collect();
        for i in 0..mask.len() {
            if self.dev[i] > 128.0 {
                mask[i] = 0.0;
            }
        }
        if halo_radius == 0 {
            return mask;
        }
        let r = halo_radius as isize;
        let mut dilated = vec![0.0f32; mask.len()];
        for y in 0..h as isize {
            for x in 0..w as isize {
                let mut best = 0.0f32;
                for dy in -r..=r {
                    for dx in -r..=r {
                        if dx * dx + dy * dy > r * r {
                            continue;
                        }
                        let (sx, sy) = (x + dx, y + dy);
                        if sx >= 0 && sy >= 0 && (sx as usize) < w && (sy as usize) < h {
                            best = best.max(mask[sy as usize * w + sx as usize]);
                        }
                    }
                }
                dilated[y as usize * w + x as usize] = best;
            }
        }
        for i in 0..mask.len() {
            mask[i] -= dilated[i] * 0.5;
        }
        mask
    }
}

fn add_to_guo(guo: &mut GuoAccumulator, y_values: &[f32], x: f32) {
    for (i, &y) in y_values.iter().enumerate() {
        let y2 = y * y;
        let lny = y.ln();
        let ch: &mut GuoChannels = &mut guo.data[i];
        ch[0] += y2;
        ch[1] += x * y2;
        ch[2] += x * x * y2;
        ch[3] += x * x * x * y2;
        ch[4] += x * x * x * x * y2;
        ch[5] += y2 * lny;
        ch[6] += x * y2 * lny;
        ch[7] += x * x * y2 * lny;
    }
}

fn solve_3x3(a: [[f32; 3]; 3], b: [f32; 3]) -> Option<[f32; 3]> {
    let det = a[0][0] * (a[1][1] * a[2][2] - a[1][2] * a[2][1])
        - a[0][1] * (a[1][0] * a[2][2] - a[1][2] * a[2][0])
        + a[0][2] * (a[1][0] * a[2][1] - a[1][1] * a[2][0]);
    if det.abs() < 1e-12 {
        return None;
    }
    let mut c = [0.0f32; 3];
    for col in 0..3 {
        let mut m = a;
        for row in 0..3 {
            m[row][col] = b[row];
        }
        let d = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
        c[col] = d / det;
    }
    Some(c)
}

fn compute_result(guo: &GuoAccumulator, max_depth: u32, noise_level: f32) -> DepthMap {
    let w = guo.width;
    let h = guo.height;
    let max_depth_f = max_depth as f32;
    let (scaler, offset) = if max_depth < 254 {
        let s = 255.0 / (max_depth_f + 1.0);
        (s, s)
    } else {
        (254.0 / max_depth_f, 1.0)
    };

    let mut mean = vec![0.0f32; (w * h) as usize];
    let mut dev = vec![255.0f32; (w * h) as usize];
    let mut amp = vec![0.0f32; (w * h) as usize];

    for (i, ch) in guo.data.iter().enumerate() {
        let a = [
            [ch[0], ch[1], ch[2]],
            [ch[1], ch[2], ch[3]],
            [ch[2], ch[3], ch[4]],
        ];
        let b = [ch[5], ch[6], ch[7]];
        if let Some(c) = solve_3x3(a, b) {
            let (a0, b0, c0) = (c[0], c[1], c[2]);
            if c0 < -1e-5 {
                let m = -b0 / (2.0 * c0);
                if m >= 0.0 && m <= max_depth_f {
                    mean[i] = m * scaler + offset;
                    dev[i] = (-1.0 / (2.0 * c0)).sqrt() * scaler;
                    amp[i] = (a0 - (b0 * b0) / (4.0 * c0)).exp();
                }
            }
        }
    }

    DepthMap { width: w, height: h, mean, dev, amp, noise_level, valid_area: guo.valid_area }
}

/// One layer's accumulation step. `previous` chains to the prior layer's
/// `DepthLayerTask`; the first layer in the chain has `previous == None`
/// and starts a fresh accumulator sized from `input`.
pub struct DepthLayerTask {
    base: TaskBase,
    input: Option<Arc<dyn Task>>,
    previous: Option<Arc<dyn Task>>,
    depth: u32,
    is_last: bool,
    max_depth: u32,
}

impl DepthLayerTask {
    pub fn new(
        index: usize,
        input: Option<Arc<dyn Task>>,
        previous: Option<Arc<dyn Task>>,
        depth: u32,
        is_last: bool,
        max_depth: u32,
    ) -> Arc<Self> {
        let mut deps = Vec::new();
        if let Some(i) = &input {
            deps.push(i.clone());
        }
        if let Some(p) = &previous {
            deps.push(p.clone());
        }
        Arc::new(Self {
            base: TaskBase::new(format!("Construct depthmap layer {depth}"), "depthmap.png", index, false)
                .with_depends_on(deps),
            input,
            previous,
            depth,
            is_last,
            max_depth,
        })
    }
}

impl Task for DepthLayerTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn execute(&self, logger: &Logger) -> Result<Artifact> {
        let mut state = if let Some(prev) = &self.previous {
            let prev_artifact = prev.result();
            let prev_state = prev_artifact
                .as_guo()
                .ok_or_else(|| EngineError::ConfigError("depth layer chain needs a Guo accumulator".to_string()))?;
            (**prev_state).clone()
        } else {
            let input_artifact = self.input.as_ref().expect("first depth layer needs an input").result();
            let focus = input_artifact
                .as_gray_f32()
                .ok_or_else(|| EngineError::ConfigError("depth layer needs a grayscale focus measure".to_string()))?;
            let hist = HistogramPercentile::new(focus.data.iter().copied(), 1024);
            let noise_level = hist.percentile(0.1);
            logger.verbose(&format!("estimated focus measure noise level: {noise_level:.3}"));
            GuoState {
                guo: Image::new_filled(focus.width, focus.height, [0.0f32; 8], focus.index),
                noise_level,
            }
        };

        if let Some(input) = &self.input {
            let input_artifact = input.result();
            let focus = input_artifact
                .as_gray_f32()
                .ok_or_else(|| EngineError::ConfigError("depth layer needs a grayscale focus measure".to_string()))?;
            self.limit_valid_area(focus.valid_area);

            let y_nobias: Vec<f32> = focus.data.iter().map(|&v| (v - state.noise_level).max(1.0)).collect();
            add_to_guo(&mut state.guo, &y_nobias, self.depth as f32);
            state.guo.limit_valid_area(focus.valid_area);
        }

        self.limit_valid_area(state.guo.valid_area);

        if self.is_last {
            let depth_map = compute_result(&state.guo, self.max_depth, state.noise_level);
            Ok(Artifact::Depth(Arc::new(depth_map)))
        } else {
            Ok(Artifact::Guo(Arc::new(state)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Logger;

    struct FakeFocus {
        base: TaskBase,
        value: GrayF32Image,
    }

    impl Task for FakeFocus {
        fn base(&self) -> &TaskBase {
            &self.base
        }
        fn execute(&self, _logger: &Logger) -> Result<Artifact> {
            Ok(Artifact::GrayF32(Arc::new(self.value.clone())))
        }
    }

    fn focus_image(w: u32, h: u32, peak_at: (u32, u32), peak_depth: u32) -> GrayF32Image {
        let mut data = vec![1.0f32; (w * h) as usize];
        let (px, py) = peak_at;
        data[(py * w + px) as usize] = 50.0;
        let _ = peak_depth;
        Image { width: w, height: h, data, valid_area: Rect::from_size(w, h), orig_size: (w, h), index: 0 }
    }

    fn make_focus_task(index: usize, img: GrayF32Image) -> Arc<dyn Task> {
        let t = Arc::new(FakeFocus { base: TaskBase::new("focus", "f.jpg", index, false), value: img });
        t.run(&Logger::new()).unwrap();
        t as Arc<dyn Task>
    }

    #[test]
    fn three_layer_chain_produces_depth_artifact() {
        let logger = Logger::new();
        let f0 = make_focus_task(0, focus_image(8, 8, (4, 4), 0));
        let f1 = make_focus_task(1, focus_image(8, 8, (4, 4), 1));
        let f2 = make_focus_task(2, focus_image(8, 8, (4, 4), 2));

        let l0 = DepthLayerTask::new(0, Some(f0), None, 0, false, 2);
        l0.run(&logger).unwrap();
        let l1 = DepthLayerTask::new(1, Some(f1), Some(l0.clone() as Arc<dyn Task>), 1, false, 2);
        l1.run(&logger).unwrap();
        let l2 = DepthLayerTask::new(2, Some(f2), Some(l1.clone() as Arc<dyn Task>), 2, true, 2);
        l2.run(&logger).unwrap();

        let artifact = l2.result();
        assert!(artifact.as_depth().is_some());
    }

    #[test]
    fn mask_zeroes_out_high_deviation_pixels() {
        let dm = DepthMap {
            width: 2,
            height: 1,
            mean: vec![10.0, 10.0],
            dev: vec![10.0, 200.0],
            amp: vec![100.0, 100.0],
            noise_level: 0.0,
            valid_area: Rect::from_size(2, 1),
        };
        let m = dm.mask(0);
        assert!(m[0] > 0.0);
        assert_eq!(m[1], 0.0);
    }
}
