//! 3-D preview rendering (§B, `--3dview=PATH`, `--3dviewpoint=x:y:z:zscale`):
//! a deterministic point-cloud rasteriser over the (inpainted) depth map and
//! the merged colour result — not an interactive viewer, just a single
//! raster produced from a fixed view vector. Grounded on
//! `original_source/src/task_3dpreview.cc`'s camera-basis construction and
//! back-to-front painter's-algorithm projection.

use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::image::{ColorImage, GrayF32Image, Image};
use crate::logger::Logger;
use crate::task::{Artifact, Task, TaskBase};

/// Parsed `--3dviewpoint=x:y:z:zscale`: the (unnormalised) view direction
/// the camera looks along, plus a scale applied to depth before projection.
#[derive(Debug, Clone, Copy)]
pub struct ViewPoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub z_scale: f32,
}

impl Default for ViewPoint {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0, z: 1.0, z_scale: 1.0 }
    }
}

type Vec3 = (f32, f32, f32);

fn normalize(v: Vec3) -> Vec3 {
    let len = (v.0 * v.0 + v.1 * v.1 + v.2 * v.2).sqrt();
    if len < 1e-9 {
        (0.0, 0.0, 1.0)
    } else {
        (v.0 / len, v.1 / len, v.2 / len)
    }
}

fn dot(a: Vec3, b: Vec3) -> f32 {
    a.0 * b.0 + a.1 * b.1 + a.2 * b.2
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    (a.1 * b.2 - a.2 * b.1, a.2 * b.0 - a.0 * b.2, a.0 * b.1 - a.1 * b.0)
}

fn sub(a: Vec3, b: Vec3) -> Vec3 {
    (a.0 - b.0, a.1 - b.1, a.2 - b.2)
}

fn scale(a: Vec3, s: f32) -> Vec3 {
    (a.0 * s, a.1 * s, a.2 * s)
}

/// Renders a colour+depth pair from `view` onto a raster the same size as
/// `color`. Depth increases away from the camera at `view.z >= 0`;  points
/// are splatted back-to-front so nearer points win ties at the same output
/// pixel, with each point's depth widened to its largest neighbour
/// (`depth_back`) so adjacent samples don't leave single-pixel holes when
/// the view direction isn't axis-aligned.
pub fn render(color: &ColorImage, depth: &GrayF32Image, view: ViewPoint) -> ColorImage {
    let w = color.width;
    let h = color.height;
    let view_dir = normalize((view.x, view.y, view.z));
    let up = (0.0f32, 0.0f32, 1.0f32);
    let camera_y = normalize(sub(up, scale(view_dir, dot(up, view_dir))));
    let camera_x = cross(camera_y, view_dir);

    let cx = w as f32 / 2.0;
    let cy = h as f32 / 2.0;

    let mut out: ColorImage = Image::new_filled(w, h, [0u8, 0, 0], color.index);
    let mut depth_buffer = vec![f32::NEG_INFINITY; (w * h) as usize];

    let rows: Box<dyn Iterator<Item = u32>> =
        if view_dir.2 >= 0.0 { Box::new(0..h) } else { Box::new((0..h).rev()) };

    for y in rows {
        for x in 0..w {
            let mut depth_back = *depth.at(x, y);
            if x + 1 < w {
                depth_back = depth_back.max(*depth.at(x + 1, y));
            }
            if x > 0 {
                depth_back = depth_back.max(*depth.at(x - 1, y));
            }
            if y + 1 < h {
                depth_back = depth_back.max(*depth.at(x, y + 1));
            }
            if y > 0 {
                depth_back = depth_back.max(*depth.at(x, y - 1));
            }

            let z = *depth.at(x, y) * view.z_scale;
            let world = (x as f32 - cx, y as f32 - cy, -z);
            let px = dot(world, camera_x) + cx;
            let py = dot(world, camera_y) + cy;
            if px < 0.0 || py < 0.0 || px >= w as f32 || py >= h as f32 {
                continue;
            }
            let (ix, iy) = (px.round() as u32, py.round() as u32);
            let idx = (iy * w + ix) as usize;
            if depth_back >= depth_buffer[idx] {
                depth_buffer[idx] = depth_back;
                *out.at_mut(ix, iy) = *color.at(x, y);
            }
        }
    }

    out.valid_area = color.valid_area.intersect(&depth.valid_area);
    out
}

pub struct Preview3DTask {
    base: TaskBase,
    color: Arc<dyn Task>,
    depth: Arc<dyn Task>,
    view: ViewPoint,
}

impl Preview3DTask {
    pub fn new(index: usize, filename: impl Into<String>, color: Arc<dyn Task>, depth: Arc<dyn Task>, view: ViewPoint) -> Arc<Self> {
        let filename = filename.into();
        Arc::new(Self {
            base: TaskBase::new(format!("Render 3D preview {filename}"), filename, index, false)
                .with_depends_on(vec![color.clone(), depth.clone()]),
            color,
            depth,
            view,
        })
    }
}

impl Task for Preview3DTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn execute(&self, _logger: &Logger) -> Result<Artifact> {
        let color_artifact = self.color.result();
        let color = color_artifact
            .as_color()
            .ok_or_else(|| EngineError::ConfigError("3D preview needs a colour result".to_string()))?;
        let depth_artifact = self.depth.result();
        let depth = depth_artifact
            .as_gray_f32()
            .ok_or_else(|| EngineError::ConfigError("3D preview needs an inpainted depth buffer".to_string()))?;

        let out = render(color, depth, self.view);
        self.limit_valid_area(out.valid_area);
        Ok(Artifact::Color(Arc::new(out)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;

    #[test]
    fn flat_scene_from_straight_on_view_reproduces_color() {
        let color: ColorImage = Image::new_filled(8, 8, [10, 20, 30], 0);
        let depth: GrayF32Image = Image::new_filled(8, 8, 0.0, 0);
        let out = render(&color, &depth, ViewPoint::default());
        assert_eq!(*out.at(4, 4), [10, 20, 30]);
    }

    #[test]
    fn output_valid_area_is_intersection_of_inputs() {
        let mut color: ColorImage = Image::new_filled(8, 8, [1, 2, 3], 0);
        color.limit_valid_area(Rect::new(0, 0, 6, 6));
        let mut depth: GrayF32Image = Image::new_filled(8, 8, 0.0, 0);
        depth.limit_valid_area(Rect::new(1, 1, 8, 8));
        let out = render(&color, &depth, ViewPoint::default());
        assert_eq!(out.valid_area, Rect::new(0, 0, 6, 6).intersect(&Rect::new(1, 1, 8, 8)));
    }
}
