//! Command-line surface (spec §6 "CLI surface"). Grounded on the teacher's
//! `Args` (`clap::Parser`) in `main.rs`: one flat derive struct, long flags
//! only, `#[arg(long)]` throughout, converted into an `EngineConfig` by
//! `into_config`.

use clap::Parser;

use crate::config::{parse_view_point, Consistency, EngineConfig};
use crate::tasks::preview3d::ViewPoint;

#[derive(Parser, Debug)]
#[command(name = "focus-stack", version, about = "Combines a focus-bracketed photo stack into one all-in-focus image")]
pub struct Cli {
    /// Input images, at least two required.
    #[arg(required = true, num_args = 2..)]
    pub inputs: Vec<String>,

    #[arg(long, default_value = "output.jpg")]
    pub output: String,

    #[arg(long)]
    pub depthmap: Option<String>,

    #[arg(long = "3dview")]
    pub preview_3d: Option<String>,

    #[arg(long)]
    pub save_steps: bool,

    #[arg(long, default_value_t = 95)]
    pub jpgquality: u8,

    #[arg(long)]
    pub nocrop: bool,

    #[arg(long)]
    pub reference: Option<usize>,

    #[arg(long = "global-align")]
    pub global_align: bool,

    #[arg(long = "full-resolution-align")]
    pub full_resolution_align: bool,

    #[arg(long = "no-whitebalance")]
    pub no_whitebalance: bool,

    #[arg(long = "no-contrast")]
    pub no_contrast: bool,

    #[arg(long = "align-only")]
    pub align_only: bool,

    #[arg(long = "align-keep-size")]
    pub align_keep_size: bool,

    #[arg(long, default_value_t = 0)]
    pub consistency: u8,

    #[arg(long, default_value_t = 1.0)]
    pub denoise: f32,

    #[arg(long = "depthmap-threshold", default_value_t = 20.0)]
    pub depthmap_threshold: f32,

    #[arg(long = "depthmap-smooth-xy", default_value_t = 32.0)]
    pub depthmap_smooth_xy: f32,

    #[arg(long = "depthmap-smooth-z", default_value_t = 4.0)]
    pub depthmap_smooth_z: f32,

    #[arg(long = "remove-bg")]
    pub remove_bg: Option<i32>,

    #[arg(long = "halo-radius", default_value_t = 4)]
    pub halo_radius: u32,

    #[arg(long = "3dviewpoint")]
    pub view_point: Option<String>,

    #[arg(long)]
    pub threads: Option<usize>,

    #[arg(long = "batchsize", default_value_t = 8)]
    pub batchsize: usize,

    #[arg(long = "no-opencl")]
    pub no_opencl: bool,

    #[arg(long = "wait-images", default_value_t = 0)]
    pub wait_images: u64,

    #[arg(long)]
    pub verbose: bool,
}

impl Cli {
    /// Converts parsed flags into the engine's own config type, applying
    /// the `--3dviewpoint` fallback to `ViewPoint::default()` when unset or
    /// unparsable (a malformed viewpoint is a CLI usage mistake reported at
    /// parse time by `run`, not silently ignored here).
    pub fn into_config(self) -> Result<EngineConfig, String> {
        let view_point = match &self.view_point {
            Some(s) => parse_view_point(s).map_err(|e| e.to_string())?,
            None => ViewPoint::default(),
        };

        Ok(EngineConfig {
            output: self.output,
            depthmap: self.depthmap,
            preview_3d: self.preview_3d,
            save_steps: self.save_steps,
            jpg_quality: self.jpgquality,
            nocrop: self.nocrop,
            reference: self.reference,
            global_align: self.global_align,
            full_resolution_align: self.full_resolution_align,
            use_whitebalance: !self.no_whitebalance,
            use_contrast: !self.no_contrast,
            align_only: self.align_only,
            align_keep_size: self.align_keep_size,
            consistency: Consistency::from_level(self.consistency),
            denoise: self.denoise,
            depthmap_threshold: self.depthmap_threshold,
            depthmap_smooth_xy: self.depthmap_smooth_xy,
            depthmap_smooth_z: self.depthmap_smooth_z,
            remove_bg: self.remove_bg,
            halo_radius: self.halo_radius,
            view_point,
            threads: self.threads.unwrap_or_else(crate::config::default_thread_count),
            batch_size: self.batchsize.max(1),
            allow_gpu: !self.no_opencl,
            wait_images_secs: self.wait_images,
            verbose: self.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::parse_from(["focus-stack", "a.jpg", "b.jpg"]);
        assert_eq!(cli.inputs, vec!["a.jpg", "b.jpg"]);
        assert_eq!(cli.output, "output.jpg");
        assert_eq!(cli.jpgquality, 95);
    }

    #[test]
    fn no_whitebalance_flag_disables_whitebalance_in_config() {
        let cli = Cli::parse_from(["focus-stack", "--no-whitebalance", "a.jpg", "b.jpg"]);
        let cfg = cli.into_config().unwrap();
        assert!(!cfg.use_whitebalance);
        assert!(cfg.use_contrast);
    }

    #[test]
    fn invalid_viewpoint_is_rejected() {
        let cli = Cli::parse_from(["focus-stack", "--3dviewpoint=1:2", "a.jpg", "b.jpg"]);
        assert!(cli.into_config().is_err());
    }

    #[test]
    fn consistency_level_maps_into_config() {
        let cli = Cli::parse_from(["focus-stack", "--consistency=2", "a.jpg", "b.jpg"]);
        let cfg = cli.into_config().unwrap();
        assert_eq!(cfg.consistency, Consistency::Neighbour);
    }
}
