//! Save stage (C11): crops to `valid_area`, converts whatever artifact kind
//! the input produced into a displayable raster, and emits it to the codec
//! identified by the filename's extension — unless the filename is empty or
//! the reserved token `:memory:`, in which case the converted image is only
//! kept as this task's own result for programmatic retrieval. Grounded on
//! `original_source/src/task_saveimg.cc` (two-channel wavelet buffers split
//! into `real, imag, 0`; crop before encode).

use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::geometry::Rect;
use crate::image::{ColorImage, GrayF32Image, GrayImage, Image, WaveletImage};
use crate::logger::Logger;
use crate::task::{Artifact, Task, TaskBase};

/// Reserved filename that keeps the result in memory instead of writing it.
pub const MEMORY_SINK: &str = ":memory:";

fn crop<T: Clone>(img: &Image<T>) -> Image<T> {
    let area = img.valid_area;
    if area.is_empty() || (area == Rect::from_size(img.width, img.height)) {
        return img.clone();
    }
    let mut data = Vec::with_capacity((area.w * area.h) as usize);
    for y in area.y..area.bottom() {
        for x in area.x..area.right() {
            data.push(img.at(x, y).clone());
        }
    }
    Image {
        width: area.w,
        height: area.h,
        data,
        valid_area: Rect::from_size(area.w, area.h),
        orig_size: img.orig_size,
        index: img.index,
    }
}

fn wavelet_preview(wav: &WaveletImage) -> ColorImage {
    let mut out: ColorImage = Image::new_filled(wav.width, wav.height, [0u8, 0, 0], wav.index);
    for (i, c) in wav.data.iter().enumerate() {
        out.data[i] = [c[0].round().clamp(0.0, 255.0) as u8, c[1].round().clamp(0.0, 255.0) as u8, 0];
    }
    out.valid_area = wav.valid_area;
    out.orig_size = wav.orig_size;
    out
}

fn to_gray_u8(src: &GrayF32Image) -> GrayImage {
    let mut out: GrayImage = Image::new_filled(src.width, src.height, 0u8, src.index);
    for (i, &v) in src.data.iter().enumerate() {
        out.data[i] = v.round().clamp(0.0, 255.0) as u8;
    }
    out.valid_area = src.valid_area;
    out.orig_size = src.orig_size;
    out
}

fn is_jpeg(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".jpg") || lower.ends_with(".jpeg")
}

fn write_color(path: &str, img: &ColorImage, alpha: Option<&GrayF32Image>, quality: u8) -> Result<()> {
    if let Some(a) = alpha {
        let mut buf = image::RgbaImage::new(img.width, img.height);
        for y in 0..img.height {
            for x in 0..img.width {
                let [b, g, r] = *img.at(x, y);
                let av = a.at(x, y).round().clamp(0.0, 255.0) as u8;
                buf.put_pixel(x, y, image::Rgba([r, g, b, av]));
            }
        }
        buf.save(path).map_err(EngineError::Image)?;
        return Ok(());
    }

    let mut buf = image::RgbImage::new(img.width, img.height);
    for y in 0..img.height {
        for x in 0..img.width {
            let [b, g, r] = *img.at(x, y);
            buf.put_pixel(x, y, image::Rgb([r, g, b]));
        }
    }

    if is_jpeg(path) {
        let file = std::fs::File::create(path).map_err(EngineError::Io)?;
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(file, quality);
        encoder
            .encode_image(&image::DynamicImage::ImageRgb8(buf))
            .map_err(EngineError::Image)?;
    } else {
        buf.save(path).map_err(EngineError::Image)?;
    }
    Ok(())
}

fn write_gray(path: &str, img: &GrayImage) -> Result<()> {
    let mut buf = image::GrayImage::new(img.width, img.height);
    for y in 0..img.height {
        for x in 0..img.width {
            buf.put_pixel(x, y, image::Luma([*img.at(x, y)]));
        }
    }
    buf.save(path).map_err(EngineError::Image)?;
    Ok(())
}

pub struct SaveTask {
    base: TaskBase,
    input: Arc<dyn Task>,
    alpha: Option<Arc<dyn Task>>,
    jpg_quality: u8,
    nocrop: bool,
}

impl SaveTask {
    pub fn new(
        index: usize,
        filename: impl Into<String>,
        input: Arc<dyn Task>,
        alpha: Option<Arc<dyn Task>>,
        jpg_quality: u8,
        nocrop: bool,
    ) -> Arc<Self> {
        let filename = filename.into();
        let mut deps = vec![input.clone()];
        if let Some(a) = &alpha {
            deps.push(a.clone());
        }
        Arc::new(Self {
            base: TaskBase::new(format!("Save {filename}"), filename, index, false).with_depends_on(deps),
            input,
            alpha,
            jpg_quality,
            nocrop,
        })
    }
}

impl Task for SaveTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn execute(&self, logger: &Logger) -> Result<Artifact> {
        let artifact = self.input.result();
        let alpha_mask = match &self.alpha {
            Some(t) => Some(
                t.result()
                    .as_gray_f32()
                    .cloned()
                    .ok_or_else(|| EngineError::ConfigError("save alpha mask must be grayscale".to_string()))?,
            ),
            None => None,
        };

        let filename = self.base.filename().to_string();
        let skip_write = filename.is_empty() || filename == MEMORY_SINK;
        if skip_write {
            logger.verbose(format!("'{}' keeping result in memory, not writing a file", self.base.name()));
        }

        if let Some(color) = artifact.as_color() {
            let out = if self.nocrop { (**color).clone() } else { crop(color) };
            if !skip_write {
                write_color(&filename, &out, alpha_mask.as_deref(), self.jpg_quality)?;
            }
            self.limit_valid_area(out.valid_area);
            return Ok(Artifact::Color(Arc::new(out)));
        }

        if let Some(wav) = artifact.as_wavelet() {
            let preview = wavelet_preview(wav);
            let out = if self.nocrop { preview } else { crop(&preview) };
            if !skip_write {
                write_color(&filename, &out, None, self.jpg_quality)?;
            }
            self.limit_valid_area(out.valid_area);
            return Ok(Artifact::Color(Arc::new(out)));
        }

        if let Some(gray_f32) = artifact.as_gray_f32() {
            let gray_u8 = to_gray_u8(gray_f32);
            let out = if self.nocrop { gray_u8 } else { crop(&gray_u8) };
            if !skip_write {
                write_gray(&filename, &out)?;
            }
            self.limit_valid_area(out.valid_area);
            return Ok(Artifact::Gray(Arc::new(out)));
        }

        if let Some(gray) = artifact.as_gray() {
            let out = if self.nocrop { (**gray).clone() } else { crop(gray) };
            if !skip_write {
                write_gray(&filename, &out)?;
            }
            self.limit_valid_area(out.valid_area);
            return Ok(Artifact::Gray(Arc::new(out)));
        }

        Err(EngineError::ConfigError(format!(
            "Save input '{}' has no raster representation",
            self.input.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeInput {
        base: TaskBase,
        value: Artifact,
    }

    impl Task for FakeInput {
        fn base(&self) -> &TaskBase {
            &self.base
        }
        fn execute(&self, _logger: &Logger) -> Result<Artifact> {
            Ok(self.value.clone())
        }
    }

    fn color_task(w: u32, h: u32, fill: [u8; 3]) -> Arc<dyn Task> {
        let img: ColorImage = Image::new_filled(w, h, fill, 0);
        let t = Arc::new(FakeInput { base: TaskBase::new("c", "c.jpg", 0, false), value: Artifact::Color(Arc::new(img)) });
        t.run(&Logger::new()).unwrap();
        t as Arc<dyn Task>
    }

    #[test]
    fn memory_sink_skips_writing_but_still_produces_result() {
        let input = color_task(4, 4, [10, 20, 30]);
        let save = SaveTask::new(0, MEMORY_SINK, input, None, 90, true);
        save.run(&Logger::new()).unwrap();
        let out = save.result();
        let color = out.as_color().unwrap();
        assert_eq!(*color.at(0, 0), [10, 20, 30]);
    }

    #[test]
    fn crop_narrows_to_valid_area() {
        let mut img: ColorImage = Image::new_filled(6, 6, [1, 2, 3], 0);
        img.limit_valid_area(Rect::new(1, 1, 2, 2));
        let cropped = crop(&img);
        assert_eq!(cropped.width, 2);
        assert_eq!(cropped.height, 2);
    }

    #[test]
    fn wavelet_preview_packs_real_imag_into_first_two_channels() {
        let wav: WaveletImage = Image::new_filled(2, 2, [7.0, -3.0], 0);
        let preview = wavelet_preview(&wav);
        assert_eq!(*preview.at(0, 0), [7, 0, 0]);
    }

    #[test]
    fn fails_without_raster_representation() {
        let t = Arc::new(FakeInput { base: TaskBase::new("u", "u.jpg", 0, false), value: Artifact::Unit });
        t.run(&Logger::new()).unwrap();
        let save = SaveTask::new(0, MEMORY_SINK, t as Arc<dyn Task>, None, 90, true);
        assert!(save.run(&Logger::new()).is_err());
    }
}
