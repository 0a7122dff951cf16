//! Bresenham-style ray walker (spec §4.10 steps 2 and 4, §B "Radial filter
//! utility"): propagates known values into unknown regions by shooting a
//! fixed number of evenly spaced rays outward from each unfilled pixel, and
//! closes small gaps in a thresholded mask by linking two non-zero pixels
//! whenever a ray between them stays inside a distance limit. Grounded on
//! `original_source/src/radialfilter.cc`'s `RadialFilter::average` /
//! `RadialFilter::connect`; both the depth-inpaint cascade (§4.10) and
//! background removal (§B) use it for their gap-closing step.

use std::f32::consts::PI;

use crate::image::GrayF32Image;

/// Walks outward from `(x0, y0)` along `angle` one step at a time, rounding
/// to the nearest pixel each step (the "Bresenham" part: no two consecutive
/// steps skip a pixel along the dominant axis), stopping at the buffer edge
/// or after `max_dist`.
fn walk_at_angle(width: u32, height: u32, x0: u32, y0: u32, angle: f32, max_dist: f32) -> Vec<(u32, u32)> {
    let (dx, dy) = (angle.cos(), angle.sin());
    let mut points = Vec::new();
    let mut last = (x0, y0);
    let mut t = 1.0f32;
    while t <= max_dist {
        let fx = x0 as f32 + dx * t;
        let fy = y0 as f32 + dy * t;
        if fx < 0.0 || fy < 0.0 || fx >= width as f32 || fy >= height as f32 {
            break;
        }
        let p = (fx.round() as u32, fy.round() as u32);
        if p != last {
            points.push(p);
            last = p;
        }
        t += 1.0;
    }
    points
}

fn default_raycount(raycount: u32) -> u32 {
    if raycount == 0 {
        64
    } else {
        raycount
    }
}

/// Fills every zero-valued pixel with the average of the first non-zero
/// pixel each of `raycount` evenly spaced rays reaches; pixels with no ray
/// reaching a non-zero value (isolated unknown regions larger than the
/// buffer diagonal) are left at zero.
pub fn average(input: &GrayF32Image, raycount: u32) -> GrayF32Image {
    let raycount = default_raycount(raycount);
    let mut out = input.clone();
    let w = input.width;
    let h = input.height;
    let max_dist = ((w * w + h * h) as f32).sqrt();

    for y in 0..h {
        for x in 0..w {
            if *input.at(x, y) != 0.0 {
                continue;
            }
            let mut sum = 0.0f64;
            let mut count = 0u32;
            for i in 0..raycount {
                let angle = 2.0 * PI * i as f32 / raycount as f32;
                for (px, py) in walk_at_angle(w, h, x, y, angle, max_dist) {
                    let v = *input.at(px, py);
                    if v != 0.0 {
                        sum += v as f64;
                        count += 1;
                        break;
                    }
                }
            }
            if count > 0 {
                *out.at_mut(x, y) = (sum / count as f64) as f32;
            }
        }
    }
    out
}

/// Closes gaps in a thresholded image: for every zero pixel, if at least two
/// of the `raycount` rays reach a non-zero pixel within `distance_limit`,
/// every pixel on those rays' paths is set to the reached value (whichever
/// ray got there first wins a given pixel). A single reaching ray isn't
/// enough — that's just a pixel near the mask's edge, not a gap between two
/// separate regions.
pub fn connect(input: &GrayF32Image, distance_limit: f32, raycount: u32) -> GrayF32Image {
    let raycount = default_raycount(raycount);
    let mut out = input.clone();
    let w = input.width;
    let h = input.height;

    for y in 0..h {
        for x in 0..w {
            if *input.at(x, y) != 0.0 {
                continue;
            }
            let mut hits: Vec<(Vec<(u32, u32)>, f32)> = Vec::new();
            for i in 0..raycount {
                let angle = 2.0 * PI * i as f32 / raycount as f32;
                let ray = walk_at_angle(w, h, x, y, angle, distance_limit);
                for (idx, &(px, py)) in ray.iter().enumerate() {
                    let v = *input.at(px, py);
                    if v != 0.0 {
                        hits.push((ray[..=idx].to_vec(), v));
                        break;
                    }
                }
            }
            if hits.len() >= 2 {
                for (path, v) in &hits {
                    for &(px, py) in path {
                        if *out.at(px, py) == 0.0 {
                            *out.at_mut(px, py) = *v;
                        }
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;
    use crate::image::Image;

    fn image(w: u32, h: u32, data: Vec<f32>) -> GrayF32Image {
        Image { width: w, height: h, data, valid_area: Rect::from_size(w, h), orig_size: (w, h), index: 0 }
    }

    #[test]
    fn average_leaves_nonzero_pixels_untouched() {
        let img = image(3, 3, vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 2.0]);
        let out = average(&img, 16);
        assert_eq!(*out.at(0, 0), 1.0);
        assert_eq!(*out.at(2, 2), 2.0);
    }

    #[test]
    fn average_fills_unknown_pixel_between_two_equal_values() {
        let img = image(3, 1, vec![10.0, 0.0, 10.0]);
        let out = average(&img, 16);
        assert!((*out.at(1, 0) - 10.0).abs() < 1e-3);
    }

    #[test]
    fn average_does_not_touch_isolated_region_with_no_reachable_pixel() {
        let img = image(1, 1, vec![0.0]);
        let out = average(&img, 8);
        assert_eq!(*out.at(0, 0), 0.0);
    }

    #[test]
    fn connect_links_two_endpoints_across_a_gap() {
        let img = image(5, 1, vec![5.0, 0.0, 0.0, 0.0, 5.0]);
        let out = connect(&img, 10.0, 32);
        assert_ne!(*out.at(2, 0), 0.0);
    }

    #[test]
    fn connect_ignores_gap_reachable_from_only_one_side() {
        let img = image(5, 1, vec![5.0, 0.0, 0.0, 0.0, 0.0]);
        let out = connect(&img, 10.0, 32);
        assert_eq!(*out.at(3, 0), 0.0);
    }
}
