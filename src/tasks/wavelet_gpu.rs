//! Wavelet stage, GPU implementation (C7). Four compute kernels
//! (`decompose_vertical`, `decompose_horizontal`, `compose_vertical`,
//! `compose_horizontal`), each dispatched with a 2-D work-group matching
//! the current level's output dimensions, serialised through the
//! scheduler's single GPU slot (`uses_gpu() == true`). Shares the exact
//! filter coefficients `tasks::wavelet` uses on the CPU (the original's
//! `filter_hr`/`filter_gr`/`filter_hi`/`filter_gi`) and the same
//! real/imaginary cross-term combination, so the two implementations
//! agree (I5's cross-implementation tolerance).
//!
//! Device setup mirrors the teacher's `PathTracer::new` pipeline
//! construction in `main.rs`: instance → adapter → device/queue → compute
//! pipeline from a `wgsl` module, buffers sized and bound per dispatch.
//! Each level works on a compact `region_w * region_h` buffer extracted
//! from the top-left quadrant, mirroring `tasks::wavelet`'s
//! `decompose_2d_level`/`compose_2d_level`: one vertical pass with the
//! real taps and one with the imaginary taps, then two horizontal passes
//! off of each, summing the four terms (`Task_Wavelet::decompose`'s
//! "Real x Real" / "Real x Imag" / "Imag x Imag" / "Imag x Real").

use std::sync::Arc;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::error::{EngineError, Result};
use crate::gpu::GpuContext;
use crate::image::{Complex, GrayF32Image, Image, WaveletImage};
use crate::logger::Logger;
use crate::task::{Artifact, Task, TaskBase};

const SHADER_SRC: &str = include_str!("../shaders/wavelet.wgsl");

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Params {
    width: u32,
    height: u32,
    imag_filter: u32,
    _pad: u32,
}

struct Kernels {
    decompose_vertical: wgpu::ComputePipeline,
    decompose_horizontal: wgpu::ComputePipeline,
    compose_vertical: wgpu::ComputePipeline,
    compose_horizontal: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

fn build_kernels(device: &wgpu::Device) -> Kernels {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("wavelet.wgsl"),
        source: wgpu::ShaderSource::Wgsl(SHADER_SRC.into()),
    });

    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("wavelet bind group layout"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer { ty: wgpu::BufferBindingType::Uniform, has_dynamic_offset: false, min_binding_size: None },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer { ty: wgpu::BufferBindingType::Storage { read_only: true }, has_dynamic_offset: false, min_binding_size: None },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer { ty: wgpu::BufferBindingType::Storage { read_only: false }, has_dynamic_offset: false, min_binding_size: None },
                count: None,
            },
        ],
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("wavelet pipeline layout"),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });

    let make = |entry: &str| {
        device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: entry,
            compilation_options: Default::default(),
            cache: None,
        })
    };

    Kernels {
        decompose_vertical: make("decompose_vertical"),
        decompose_horizontal: make("decompose_horizontal"),
        compose_vertical: make("compose_vertical"),
        compose_horizontal: make("compose_horizontal"),
        bind_group_layout,
    }
}

fn complex_buffer(device: &wgpu::Device, data: &[Complex], usage: wgpu::BufferUsages) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("wavelet complex buffer"),
        contents: bytemuck::cast_slice(data),
        usage,
    })
}

fn readback(ctx: &GpuContext, buffer: &wgpu::Buffer, len: usize) -> Result<Vec<Complex>> {
    let floats = ctx.read_buffer_f32(buffer, Duration::from_secs(10))?;
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        out.push([floats[2 * i], floats[2 * i + 1]]);
    }
    Ok(out)
}

/// Runs one axis kernel over a compact `w * h` buffer and reads the
/// result back. `imag_filter` selects the real or imaginary tap pair.
fn run_axis(ctx: &GpuContext, kernels: &Kernels, pipeline: &wgpu::ComputePipeline, input: &[Complex], w: u32, h: u32, imag_filter: bool) -> Result<Vec<Complex>> {
    let usage_storage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ;
    let src_buf = complex_buffer(&ctx.device, input, wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST);
    let dst_buf = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("wavelet axis dst"),
        size: (input.len() * std::mem::size_of::<Complex>()) as u64,
        usage: usage_storage,
        mapped_at_creation: false,
    });

    let params = Params { width: w, height: h, imag_filter: imag_filter as u32, _pad: 0 };
    let params_buf = ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("wavelet params"),
        contents: bytemuck::bytes_of(&params),
        usage: wgpu::BufferUsages::UNIFORM,
    });

    let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("wavelet bind group"),
        layout: &kernels.bind_group_layout,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: params_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: src_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 2, resource: dst_buf.as_entire_binding() },
        ],
    });

    let mut encoder = ctx.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("wavelet encoder") });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some("wavelet pass"), timestamp_writes: None });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        let groups_x = w.div_ceil(8).max(1);
        let groups_y = h.div_ceil(8).max(1);
        pass.dispatch_workgroups(groups_x, groups_y, 1);
    }
    ctx.queue.submit(Some(encoder.finish()));

    readback(ctx, &dst_buf, input.len())
}

fn add_assign(dst: &mut [Complex], src: &[Complex]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        d[0] += s[0];
        d[1] += s[1];
    }
}

/// One forward decomposition level on a compact `w * h` buffer, mirroring
/// `tasks::wavelet::decompose_2d_level`'s four-term combination.
fn decompose_level(ctx: &GpuContext, kernels: &Kernels, input: &[Complex], w: u32, h: u32) -> Result<Vec<Complex>> {
    let tmp_r = run_axis(ctx, kernels, &kernels.decompose_vertical, input, w, h, false)?;
    let mut out = run_axis(ctx, kernels, &kernels.decompose_horizontal, &tmp_r, w, h, false)?;
    add_assign(&mut out, &run_axis(ctx, kernels, &kernels.decompose_horizontal, &tmp_r, w, h, true)?);

    let tmp_i = run_axis(ctx, kernels, &kernels.decompose_vertical, input, w, h, true)?;
    add_assign(&mut out, &run_axis(ctx, kernels, &kernels.decompose_horizontal, &tmp_i, w, h, true)?);
    add_assign(&mut out, &run_axis(ctx, kernels, &kernels.decompose_horizontal, &tmp_i, w, h, false)?);

    Ok(out)
}

/// One inverse composition level, the dual of `decompose_level`.
fn compose_level(ctx: &GpuContext, kernels: &Kernels, input: &[Complex], w: u32, h: u32) -> Result<Vec<Complex>> {
    let tmp_r = run_axis(ctx, kernels, &kernels.compose_vertical, input, w, h, false)?;
    let mut out = run_axis(ctx, kernels, &kernels.compose_horizontal, &tmp_r, w, h, false)?;
    add_assign(&mut out, &run_axis(ctx, kernels, &kernels.compose_horizontal, &tmp_r, w, h, true)?);

    let tmp_i = run_axis(ctx, kernels, &kernels.compose_vertical, input, w, h, true)?;
    add_assign(&mut out, &run_axis(ctx, kernels, &kernels.compose_horizontal, &tmp_i, w, h, true)?);
    add_assign(&mut out, &run_axis(ctx, kernels, &kernels.compose_horizontal, &tmp_i, w, h, false)?);

    Ok(out)
}

fn extract_region(buf: &[Complex], stride: u32, w: u32, h: u32) -> Vec<Complex> {
    let (stride, w, h) = (stride as usize, w as usize, h as usize);
    let mut out = Vec::with_capacity(w * h);
    for y in 0..h {
        out.extend_from_slice(&buf[y * stride..y * stride + w]);
    }
    out
}

fn splice_region(buf: &mut [Complex], region: &[Complex], stride: u32, w: u32, h: u32) {
    let (stride, w, h) = (stride as usize, w as usize, h as usize);
    for y in 0..h {
        buf[y * stride..y * stride + w].copy_from_slice(&region[y * w..y * w + w]);
    }
}

/// Runs the forward multi-level transform on the GPU, level by level,
/// recursing into the top-left quadrant exactly as the CPU path does.
pub fn forward_gpu(ctx: &GpuContext, gray: &GrayF32Image, levels: u32) -> Result<WaveletImage> {
    let kernels = build_kernels(&ctx.device);
    let w = gray.width;
    let h = gray.height;
    let mut data: Vec<Complex> = gray.data.iter().map(|&v| [v, 0.0]).collect();

    let (mut cur_w, mut cur_h) = (w, h);
    for _ in 0..levels {
        let region = extract_region(&data, w, cur_w, cur_h);
        let transformed = decompose_level(ctx, &kernels, &region, cur_w, cur_h)?;
        splice_region(&mut data, &transformed, w, cur_w, cur_h);
        cur_w /= 2;
        cur_h /= 2;
    }

    Ok(Image {
        width: w,
        height: h,
        data,
        valid_area: gray.valid_area,
        orig_size: gray.orig_size,
        index: gray.index,
    })
}

/// GPU inverse transform, innermost quadrant outward.
pub fn inverse_gpu(ctx: &GpuContext, wav: &WaveletImage, levels: u32) -> Result<GrayF32Image> {
    let kernels = build_kernels(&ctx.device);
    let w = wav.width;
    let h = wav.height;
    let mut data = wav.data.clone();

    let mut sizes = Vec::with_capacity(levels as usize);
    let (mut cw, mut ch) = (w, h);
    for _ in 0..levels {
        cw /= 2;
        ch /= 2;
        sizes.push((cw, ch));
    }

    for &(region_w, region_h) in sizes.iter().rev() {
        let region = extract_region(&data, w, region_w, region_h);
        let transformed = compose_level(ctx, &kernels, &region, region_w, region_h)?;
        splice_region(&mut data, &transformed, w, region_w, region_h);
    }

    let gray_data: Vec<f32> = data.iter().map(|c| c[0]).collect();
    Ok(Image {
        width: w,
        height: h,
        data: gray_data,
        valid_area: wav.valid_area,
        orig_size: wav.orig_size,
        index: wav.index,
    })
}

pub struct WaveletGpuTask {
    base: TaskBase,
    gpu: Arc<GpuContext>,
    input: Arc<dyn Task>,
    levels: u32,
    forward: bool,
}

impl WaveletGpuTask {
    pub fn new(index: usize, filename: impl Into<String>, gpu: Arc<GpuContext>, input: Arc<dyn Task>, levels: u32, forward: bool) -> Arc<Self> {
        let filename = filename.into();
        let label = if forward { "Wavelet(GPU)" } else { "Wavelet inverse(GPU)" };
        Arc::new(Self {
            base: TaskBase::new(format!("{label} {filename}"), filename, index, true).with_depends_on(vec![input.clone()]),
            gpu,
            input,
            levels,
            forward,
        })
    }
}

impl Task for WaveletGpuTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn execute(&self, _logger: &Logger) -> Result<Artifact> {
        if self.forward {
            let artifact = self.input.result();
            let gray = artifact.as_gray_f32().ok_or_else(|| EngineError::ConfigError("Wavelet forward needs a grayscale input".to_string()))?;
            let wav = forward_gpu(&self.gpu, gray, self.levels)?;
            self.limit_valid_area(wav.valid_area);
            Ok(Artifact::Wavelet(Arc::new(wav)))
        } else {
            let artifact = self.input.result();
            let wav = artifact.as_wavelet().ok_or_else(|| EngineError::ConfigError("Wavelet inverse needs a wavelet input".to_string()))?;
            let gray = inverse_gpu(&self.gpu, wav, self.levels)?;
            self.limit_valid_area(gray.valid_area);
            Ok(Artifact::GrayF32(Arc::new(gray)))
        }
    }
}
