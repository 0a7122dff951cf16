//! Shared `wgpu` device/queue context used by the GPU wavelet kernels
//! (`src/tasks/wavelet_gpu.rs`). Device creation and buffer-mapping are
//! probed once at engine start and the resulting `GpuContext` is handed to
//! every GPU-using task; the scheduler's single GPU slot (`src/
//! scheduler.rs`) serialises their actual dispatch.
//!
//! Device setup follows the teacher's `PathTracer::new` in `main.rs`
//! (instance → adapter → device/queue, `wgpu::Features::empty()` since no
//! shader-side timestamp queries or push constants are needed here);
//! buffer read-back follows `error_handling.rs`'s `map_buffer_async`, which
//! wraps `wgpu::Buffer::slice().map_async` in a `tokio` oneshot + timeout
//! because `map_async`'s callback has no async-aware waker of its own.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Whether a GPU device was successfully probed at start. Computed once and
/// shared by both the forward and inverse wavelet task constructors so they
/// agree on which implementation to pick — see DESIGN.md's note on the
/// original's inverted have_opencl branch, which this resolves by having a
/// single source of truth instead of two independent tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpuAvailability {
    Available,
    Unavailable,
}

impl GpuAvailability {
    pub fn use_gpu(self) -> bool {
        matches!(self, GpuAvailability::Available)
    }
}

pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    runtime: tokio::runtime::Runtime,
}

impl GpuContext {
    /// Probes for an adapter and opens a device. Returns `Ok(None)` (not an
    /// error) when no suitable adapter exists or `--no-opencl` disabled GPU
    /// use — callers fall back to the CPU wavelet path, logging at verbose
    /// per the `GpuUnavailable` error kind's documented severity.
    pub fn probe(allow_gpu: bool) -> Result<Option<Arc<GpuContext>>> {
        if !allow_gpu {
            return Ok(None);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(EngineError::Io)?;

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = runtime.block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }));

        let Some(adapter) = adapter else {
            return Ok(None);
        };

        let (device, queue) = runtime.block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("focus-stack wavelet device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        ))?;

        Ok(Some(Arc::new(GpuContext { device, queue, runtime })))
    }

    /// Maps `buffer`'s full range for reading and copies it out as `f32`s,
    /// blocking the calling worker thread on the small bundled runtime —
    /// same pattern as the teacher's `map_buffer_async`, minus the
    /// `ResourceTracker` bookkeeping (this crate has one short-lived buffer
    /// per kernel dispatch rather than a shared buffer pool).
    pub fn read_buffer_f32(&self, buffer: &wgpu::Buffer, timeout: Duration) -> Result<Vec<f32>> {
        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        self.device.poll(wgpu::Maintain::Wait);

        let result = self
            .runtime
            .block_on(async {
                tokio::time::timeout(timeout, async {
                    loop {
                        if let Ok(r) = rx.try_recv() {
                            return r;
                        }
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                })
                .await
            })
            .map_err(|_| EngineError::ConfigError("GPU buffer map timed out".to_string()))?;

        result.map_err(|_| EngineError::ConfigError("GPU buffer map failed".to_string()))?;

        let data = slice.get_mapped_range();
        let floats = bytemuck::cast_slice::<u8, f32>(&data).to_vec();
        drop(data);
        buffer.unmap();
        Ok(floats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_respects_allow_gpu_false() {
        let ctx = GpuContext::probe(false).unwrap();
        assert!(ctx.is_none());
    }

    #[test]
    fn availability_flag_round_trips() {
        assert!(GpuAvailability::Available.use_gpu());
        assert!(!GpuAvailability::Unavailable.use_gpu());
    }
}
