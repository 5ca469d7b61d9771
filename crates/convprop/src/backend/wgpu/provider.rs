use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::cast_slice;
use convprop_api::{
    BuildOptions, ConvError, DeviceBackend, DeviceBuffer, DeviceKernel, KernelArg, Result,
};
use futures::channel::oneshot;
use log::{debug, error, info, trace};
use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use super::bindings::build_propagate_bgl;
use super::dispatch::{self, workgroup_grid};
use super::params::PropagateParams;
use crate::backend::signature::bind_propagate_args;
use crate::kernel::preprocess::{declares_entry_point, preprocess, specialize_workgroup};
use crate::kernel::{selected_activation, BIASED_DEFINE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WgpuBackendOptions {
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
    /// Cap below the device's invocations-per-workgroup limit.
    pub max_workgroup_size: Option<u32>,
    /// Cap below the device's per-dimension work-group count.
    pub max_groups_per_dim: Option<u32>,
}

impl Default for WgpuBackendOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            max_workgroup_size: None,
            max_groups_per_dim: None,
        }
    }
}

/// Storage buffer usable as both kernel input and output.
#[derive(Clone)]
pub struct WgpuBuffer {
    buffer: Arc<wgpu::Buffer>,
    len: usize,
}

impl WgpuBuffer {
    pub fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

impl DeviceBuffer for WgpuBuffer {
    fn len(&self) -> usize {
        self.len
    }
}

impl std::fmt::Debug for WgpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBuffer").field("len", &self.len).finish()
    }
}

const STORAGE_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter_info: wgpu::AdapterInfo,
    max_workgroup_size: u32,
    max_groups_per_dim: u32,
}

impl WgpuBackend {
    pub async fn new_async(opts: WgpuBackendOptions) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: opts.power_preference,
                force_fallback_adapter: opts.force_fallback_adapter,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| {
                ConvError::DeviceUnavailable("wgpu: no compatible adapter found".to_string())
            })?;
        let adapter_info = adapter.get_info();
        let limits = adapter.limits();

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("convprop wgpu device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits,
                },
                None,
            )
            .await
            .map_err(|e| ConvError::DeviceUnavailable(format!("wgpu: {e}")))?;
        install_device_error_handlers(&device);

        let satisfied = device.limits();
        let max_workgroup_size = satisfied
            .max_compute_workgroup_size_x
            .min(satisfied.max_compute_invocations_per_workgroup)
            .min(opts.max_workgroup_size.unwrap_or(u32::MAX))
            .max(1);
        let max_groups_per_dim = satisfied
            .max_compute_workgroups_per_dimension
            .min(opts.max_groups_per_dim.unwrap_or(u32::MAX))
            .max(1);
        info!(
            "wgpu adapter '{}' ({:?}) ready: max_workgroup_size={} max_groups_per_dim={}",
            adapter_info.name,
            adapter_info.backend,
            max_workgroup_size,
            max_groups_per_dim
        );
        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
            max_workgroup_size,
            max_groups_per_dim,
        })
    }

    pub fn new(opts: WgpuBackendOptions) -> Result<Self> {
        pollster::block_on(Self::new_async(opts))
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    fn storage_buffer(&self, len: usize, label: &str) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: byte_len(len),
            usage: STORAGE_USAGE,
            mapped_at_creation: false,
        })
    }
}

/// Bindings reject zero-sized buffers, so empty buffers get one element.
fn byte_len(len: usize) -> u64 {
    (len.max(1) * std::mem::size_of::<f32>()) as u64
}

fn install_device_error_handlers(device: &wgpu::Device) {
    device.on_uncaptured_error(Box::new(|error| {
        error!("wgpu uncaptured error: {:?}", error);
    }));
    device.set_device_lost_callback(|reason, message| {
        error!("wgpu device lost: reason={:?}, message={}", reason, message);
    });
}

/// A specialised program. Pipelines are compiled per workgroup size on first
/// use; the one for the device maximum is compiled at build time, so a
/// compile failure for a smaller size surfaces from `run_1d` as a dispatch
/// error.
///
/// Validation error scopes are device-wide in wgpu, so a kernel and its
/// backend should be driven from one thread at a time.
pub struct WgpuKernel {
    name: String,
    options: BuildOptions,
    n_inputs: usize,
    source: String,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pipelines: Mutex<HashMap<u32, Arc<wgpu::ComputePipeline>>>,
    max_workgroup_size: u32,
    max_groups_per_dim: u32,
}

impl WgpuKernel {
    fn pipeline(
        &self,
        workgroup_size: u32,
    ) -> std::result::Result<Arc<wgpu::ComputePipeline>, String> {
        let mut cache = self.pipelines.lock();
        if let Some(pipeline) = cache.get(&workgroup_size) {
            return Ok(Arc::clone(pipeline));
        }
        let text = specialize_workgroup(&self.source, workgroup_size);
        let label = format!("convprop-{}-wg{}", self.name, workgroup_size);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&label),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(text)),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&label),
                layout: Some(&self.pipeline_layout),
                module: &module,
                entry_point: &self.name,
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(err.to_string());
        }
        debug!("compiled pipeline {label}");
        let pipeline = Arc::new(pipeline);
        cache.insert(workgroup_size, Arc::clone(&pipeline));
        Ok(pipeline)
    }

    fn fail(&self, message: impl Into<String>) -> ConvError {
        ConvError::dispatch(&self.name, message)
    }
}

impl DeviceKernel for WgpuKernel {
    type Buffer = WgpuBuffer;

    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> &BuildOptions {
        &self.options
    }

    fn run_1d(
        &self,
        args: &[KernelArg<'_, WgpuBuffer>],
        global_size: usize,
        workgroup_size: usize,
    ) -> Result<()> {
        if workgroup_size == 0 || workgroup_size > self.max_workgroup_size as usize {
            return Err(self.fail(format!(
                "workgroup size {workgroup_size} outside 1..={}",
                self.max_workgroup_size
            )));
        }
        if global_size % workgroup_size != 0 {
            return Err(self.fail(format!(
                "global size {global_size} is not a multiple of workgroup size {workgroup_size}"
            )));
        }
        let groups = u32::try_from(global_size / workgroup_size)
            .map_err(|_| self.fail(format!("{global_size} work-items exceed the device grid")))?;
        let grid = workgroup_grid(groups, self.max_groups_per_dim).ok_or_else(|| {
            self.fail(format!(
                "{groups} work-groups exceed the device grid of {0}x{0}",
                self.max_groups_per_dim
            ))
        })?;

        let bound = bind_propagate_args(args, self.n_inputs).map_err(|m| self.fail(m))?;
        let params = PropagateParams::from_args(&bound.ints)
            .ok_or_else(|| self.fail("scalar argument count mismatch"))?;
        let pipeline = self
            .pipeline(workgroup_size as u32)
            .map_err(|m| self.fail(format!("pipeline for workgroup size {workgroup_size}: {m}")))?;

        let span = tracing::info_span!(
            "convprop.dispatch",
            kernel = %self.name,
            global_size,
            workgroup_size,
            grid_x = grid.0,
            grid_y = grid.1
        );
        let _enter = span.enter();

        let params_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("convprop-propagate-params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let mut entries = Vec::with_capacity(self.n_inputs + 2);
        entries.push(wgpu::BindGroupEntry {
            binding: 0,
            resource: params_buffer.as_entire_binding(),
        });
        for (i, input) in bound.inputs.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: input.buffer.as_entire_binding(),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: self.n_inputs as u32 + 1,
            resource: bound.output.buffer.as_entire_binding(),
        });

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("convprop-propagate-bg"),
            layout: &self.layout,
            entries: &entries,
        });
        dispatch::run(&self.device, &self.queue, &pipeline, &bind_group, grid);
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(self.fail(err.to_string()));
        }
        trace!(
            "{}: submitted {} work-items as {}x{} groups of {}",
            self.name,
            global_size,
            grid.0,
            grid.1,
            workgroup_size
        );
        Ok(())
    }
}

impl DeviceBackend for WgpuBackend {
    type Buffer = WgpuBuffer;
    type Kernel = WgpuKernel;

    fn build_kernel(
        &self,
        source: &str,
        kernel_name: &str,
        options: &str,
        source_label: &str,
    ) -> Result<WgpuKernel> {
        let parsed = BuildOptions::parse(options).map_err(|e| match e {
            ConvError::DeviceBuild { message, .. } => {
                ConvError::build(kernel_name, options, message)
            }
            other => other,
        })?;
        let text = preprocess(source, &parsed, kernel_name, source_label)?;
        if !declares_entry_point(&text, kernel_name) {
            return Err(ConvError::build(
                kernel_name,
                options,
                format!("{source_label}: entry point not found"),
            ));
        }
        selected_activation(&parsed).map_err(|m| ConvError::build(kernel_name, options, m))?;
        let n_inputs = if parsed.is_defined(BIASED_DEFINE) { 3 } else { 2 };

        let layout = build_propagate_bgl(&self.device, n_inputs);
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("convprop-propagate-pl"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let kernel = WgpuKernel {
            name: kernel_name.to_string(),
            options: parsed,
            n_inputs,
            source: text,
            device: Arc::clone(&self.device),
            queue: Arc::clone(&self.queue),
            layout,
            pipeline_layout,
            pipelines: Mutex::new(HashMap::new()),
            max_workgroup_size: self.max_workgroup_size,
            max_groups_per_dim: self.max_groups_per_dim,
        };
        kernel
            .pipeline(self.max_workgroup_size)
            .map_err(|m| ConvError::build(kernel_name, options, format!("{source_label}: {m}")))?;
        debug!(
            "wgpu build {kernel_name} [{}] from {source_label}",
            kernel.options
        );
        Ok(kernel)
    }

    fn max_workgroup_size(&self) -> usize {
        self.max_workgroup_size as usize
    }

    fn finish(&self) -> Result<()> {
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn upload(&self, data: &[f32], label: &str) -> Result<WgpuBuffer> {
        if data.is_empty() {
            return self.create_buffer(0, label);
        }
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: cast_slice(data),
                usage: STORAGE_USAGE,
            });
        Ok(WgpuBuffer {
            buffer: Arc::new(buffer),
            len: data.len(),
        })
    }

    fn create_buffer(&self, len: usize, label: &str) -> Result<WgpuBuffer> {
        Ok(WgpuBuffer {
            buffer: Arc::new(self.storage_buffer(len, label)),
            len,
        })
    }

    fn download(&self, buffer: &WgpuBuffer) -> Result<Vec<f32>> {
        if buffer.len == 0 {
            return Ok(Vec::new());
        }
        let size_bytes = (buffer.len * std::mem::size_of::<f32>()) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("convprop-download-staging"),
            size: size_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("convprop-download-encoder"),
            });
        encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging, 0, size_bytes);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device.poll(wgpu::Maintain::Wait);
        let unavailable = |m: String| ConvError::DeviceUnavailable(format!("wgpu download: {m}"));
        pollster::block_on(rx)
            .map_err(|_| unavailable("map_async callback dropped".to_string()))?
            .map_err(|e| unavailable(e.to_string()))?;

        let data = slice.get_mapped_range();
        let out = cast_slice::<u8, f32>(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(out)
    }

    fn device_info(&self) -> String {
        format!(
            "wgpu {} ({:?}, {:?}) max_workgroup_size={}",
            self.adapter_info.name,
            self.adapter_info.backend,
            self.adapter_info.device_type,
            self.max_workgroup_size
        )
    }
}
