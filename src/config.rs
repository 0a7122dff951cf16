//! Programmatic configuration for a pipeline run (spec §6 "Programmatic
//! API"). `cli.rs`'s `clap::Parser` struct is a thin shell that parses
//! argv and converts into this type; embedders that never touch argv
//! construct `EngineConfig` directly.

use crate::tasks::preview3d::ViewPoint;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ViewPointParseError {
    #[error("expected 4 colon-separated fields (x:y:z:zscale), got {0}")]
    WrongFieldCount(usize),
    #[error("'{0}' is not a number")]
    NotANumber(String),
}

/// `--consistency={0,1,2}` (spec §4.8): how aggressively the merge stage
/// cross-checks the depth labels it selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    #[default]
    Off,
    Subband,
    Neighbour,
}

impl Consistency {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Consistency::Off,
            1 => Consistency::Subband,
            _ => Consistency::Neighbour,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            Consistency::Off => 0,
            Consistency::Subband => 1,
            Consistency::Neighbour => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub output: String,
    pub depthmap: Option<String>,
    pub preview_3d: Option<String>,
    pub save_steps: bool,
    pub jpg_quality: u8,
    pub nocrop: bool,
    pub reference: Option<usize>,
    pub global_align: bool,
    pub full_resolution_align: bool,
    pub use_whitebalance: bool,
    pub use_contrast: bool,
    pub align_only: bool,
    pub align_keep_size: bool,
    pub consistency: Consistency,
    pub denoise: f32,
    pub depthmap_threshold: f32,
    pub depthmap_smooth_xy: f32,
    pub depthmap_smooth_z: f32,
    pub remove_bg: Option<i32>,
    pub halo_radius: u32,
    pub view_point: ViewPoint,
    pub threads: usize,
    pub batch_size: usize,
    pub allow_gpu: bool,
    pub wait_images_secs: u64,
    pub verbose: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output: "output.jpg".to_string(),
            depthmap: None,
            preview_3d: None,
            save_steps: false,
            jpg_quality: 95,
            nocrop: false,
            reference: None,
            global_align: false,
            full_resolution_align: false,
            use_whitebalance: true,
            use_contrast: true,
            align_only: false,
            align_keep_size: false,
            consistency: Consistency::Off,
            denoise: 1.0,
            depthmap_threshold: 20.0,
            depthmap_smooth_xy: 32.0,
            depthmap_smooth_z: 4.0,
            remove_bg: None,
            halo_radius: 4,
            view_point: ViewPoint::default(),
            threads: default_thread_count(),
            batch_size: 8,
            allow_gpu: true,
            wait_images_secs: 0,
            verbose: false,
        }
    }
}

/// Hardware concurrency plus one spare thread to carry GPU submission
/// (spec §5 "fixed pool of OS-level threads").
pub fn default_thread_count() -> usize {
    num_cpus::get() + 1
}

/// Parses `--3dviewpoint=x:y:z:zscale`.
pub fn parse_view_point(s: &str) -> Result<ViewPoint, ViewPointParseError> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 4 {
        return Err(ViewPointParseError::WrongFieldCount(parts.len()));
    }
    let parse = |field: &str| field.parse::<f32>().map_err(|_| ViewPointParseError::NotANumber(field.to_string()));
    Ok(ViewPoint {
        x: parse(parts[0])?,
        y: parse(parts[1])?,
        z: parse(parts[2])?,
        z_scale: parse(parts[3])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.output, "output.jpg");
        assert!(cfg.use_whitebalance);
        assert!(cfg.use_contrast);
        assert_eq!(cfg.batch_size, 8);
    }

    #[test]
    fn consistency_level_round_trips() {
        assert_eq!(Consistency::from_level(0), Consistency::Off);
        assert_eq!(Consistency::from_level(1), Consistency::Subband);
        assert_eq!(Consistency::from_level(2), Consistency::Neighbour);
        assert_eq!(Consistency::from_level(9), Consistency::Neighbour);
    }

    #[test]
    fn view_point_parses_colon_separated_fields() {
        let vp = parse_view_point("1:0:2.5:1.5").unwrap();
        assert_eq!(vp.x, 1.0);
        assert_eq!(vp.z, 2.5);
        assert_eq!(vp.z_scale, 1.5);
    }

    #[test]
    fn view_point_rejects_wrong_field_count() {
        assert!(parse_view_point("1:2:3").is_err());
    }
}
