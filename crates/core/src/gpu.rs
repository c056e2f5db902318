//! Compute-device plumbing on top of `wgpu`.
//!
//! A [`GpuContext`] wraps one adapter's device and queue. Kernel pipelines are
//! compiled once per (context, kernel) and memoized process-wide; a
//! [`CommandStream`] records uploads, dispatches and downloads into a single
//! encoder that is only submitted when host data is needed or a tile ends.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock};

use tracing::{debug, info};
use wgpu::util::DeviceExt;

use crate::error::{InterpolationError, Result};
use crate::kernels::{GpuProgram, Kernel, KernelId};
use crate::tensor::{Shape, Tensor};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);
static KERNEL_CACHE: OnceLock<Mutex<HashMap<KernelCacheKey, Arc<CompiledKernel>>>> =
    OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct KernelCacheKey {
    context: u64,
    kernel: KernelId,
}

fn kernel_cache() -> &'static Mutex<HashMap<KernelCacheKey, Arc<CompiledKernel>>> {
    KERNEL_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Drop every memoized pipeline. Returns how many entries were evicted.
pub fn clear_kernel_cache() -> usize {
    let mut cache = kernel_cache()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let evicted = cache.len();
    cache.clear();
    evicted
}

pub fn cached_kernel_count() -> usize {
    kernel_cache()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .len()
}

pub struct CompiledKernel {
    pub id: KernelId,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

pub struct GpuContext {
    id: u64,
    index: usize,
    adapter_name: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("adapter_name", &self.adapter_name)
            .finish()
    }
}

/// Hardware adapters on the primary backends, one entry per physical GPU.
/// Software rasterizers are skipped, and a GPU exposed through several
/// backends keeps only its first entry.
fn enumerate_adapters() -> Vec<wgpu::Adapter> {
    let instance = wgpu::Instance::default();
    let adapters = instance.enumerate_adapters(wgpu::Backends::PRIMARY);
    let infos: Vec<wgpu::AdapterInfo> = adapters.iter().map(|a| a.get_info()).collect();
    let keep = hardware_adapters(&infos);
    adapters
        .into_iter()
        .enumerate()
        .filter(|(i, _)| keep.contains(i))
        .map(|(_, adapter)| adapter)
        .collect()
}

fn hardware_adapters(infos: &[wgpu::AdapterInfo]) -> Vec<usize> {
    let mut seen = HashSet::new();
    infos
        .iter()
        .enumerate()
        .filter(|(_, info)| info.device_type != wgpu::DeviceType::Cpu)
        .filter(|(_, info)| seen.insert((info.vendor, info.device, info.name.clone())))
        .map(|(i, _)| i)
        .collect()
}

impl GpuContext {
    pub fn adapter_count() -> usize {
        enumerate_adapters().len()
    }

    /// Open the `index`-th adapter reported by the platform.
    pub fn open(index: usize) -> Result<Arc<Self>> {
        let adapters = enumerate_adapters();
        let count = adapters.len();
        let adapter = adapters.into_iter().nth(index).ok_or_else(|| {
            InterpolationError::DeviceUnavailable(format!(
                "gpu device {index} not found ({count} available)"
            ))
        })?;

        let info = adapter.get_info();
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("midframe.device"),
                required_limits: adapter.limits(),
                ..Default::default()
            },
            None,
        ))
        .map_err(|e| {
            InterpolationError::DeviceUnavailable(format!("gpu device {index} ({}): {e}", info.name))
        })?;

        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            gpu_id = index,
            adapter = %info.name,
            backend = ?info.backend,
            "Compute device ready"
        );

        Ok(Arc::new(Self {
            id,
            index,
            adapter_name: info.name,
            device,
            queue,
        }))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    pub fn max_buffer_bytes(&self) -> u64 {
        self.device.limits().max_storage_buffer_binding_size as u64
    }

    /// Fetch the pipeline for `kernel`, compiling it on first use.
    pub fn compiled(&self, kernel: KernelId, program: &GpuProgram) -> Result<Arc<CompiledKernel>> {
        let key = KernelCacheKey {
            context: self.id,
            kernel,
        };
        let mut cache = kernel_cache()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = cache.get(&key) {
            return Ok(existing.clone());
        }

        let compiled = Arc::new(self.compile(kernel, program)?);
        cache.insert(key, compiled.clone());
        Ok(compiled)
    }

    fn compile(&self, kernel: KernelId, program: &GpuProgram) -> Result<CompiledKernel> {
        let started = std::time::Instant::now();
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(program.label),
                source: wgpu::ShaderSource::Wgsl(program.source.into()),
            });

        let mut entries: Vec<wgpu::BindGroupLayoutEntry> = (0..program.inputs as u32)
            .map(|binding| bge_storage(binding, true))
            .collect();
        entries.push(bge_storage(program.inputs as u32, false));
        entries.push(bge_uniform(program.inputs as u32 + 1));

        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(program.label),
                entries: &entries,
            });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(program.label),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(program.label),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: "main",
                compilation_options: Default::default(),
            });

        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(InterpolationError::Kernel(format!(
                "failed to compile {kernel}: {error}"
            )));
        }

        let ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!(kernel = %kernel, compile_ms = %format!("{ms:.1}"), "Compiled kernel");
        Ok(CompiledKernel {
            id: kernel,
            layout,
            pipeline,
        })
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        let mut cache = kernel_cache()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.retain(|key, _| key.context != self.id);
    }
}

fn bge_storage(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bge_uniform(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Tensor resident in a device storage buffer.
#[derive(Clone)]
pub struct DeviceTensor {
    buffer: Arc<wgpu::Buffer>,
    shape: Shape,
}

impl DeviceTensor {
    pub fn shape(&self) -> Shape {
        self.shape
    }
}

impl std::fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceTensor({})", self.shape)
    }
}

/// Batched command recording against one device queue.
pub struct CommandStream {
    context: Arc<GpuContext>,
    encoder: Option<wgpu::CommandEncoder>,
    recorded: usize,
}

impl CommandStream {
    pub fn new(context: Arc<GpuContext>) -> Self {
        Self {
            context,
            encoder: None,
            recorded: 0,
        }
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }

    /// Commands recorded since the last submit.
    pub fn pending(&self) -> usize {
        self.recorded
    }

    fn encoder_mut(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.context.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("midframe.stream"),
            })
        })
    }

    fn check_size(&self, shape: Shape) -> Result<u64> {
        let bytes = shape.byte_len() as u64;
        if bytes == 0 {
            return Err(InterpolationError::AllocationFailure(format!(
                "refusing to allocate empty tensor {shape}"
            )));
        }
        let limit = self.context.max_buffer_bytes();
        if bytes > limit {
            return Err(InterpolationError::AllocationFailure(format!(
                "tensor {shape} needs {bytes} bytes, device binding limit is {limit}"
            )));
        }
        Ok(bytes)
    }

    fn guarded<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T> {
        let device = &self.context.device;
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let value = f(device);
        match pollster::block_on(device.pop_error_scope()) {
            Some(error) => Err(InterpolationError::AllocationFailure(error.to_string())),
            None => Ok(value),
        }
    }

    pub fn upload(&mut self, tensor: &Tensor) -> Result<DeviceTensor> {
        let shape = tensor.shape();
        self.check_size(shape)?;
        let buffer = self.guarded(|device| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("midframe.blob"),
                contents: bytemuck::cast_slice(tensor.as_slice()),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
            })
        })?;
        Ok(DeviceTensor {
            buffer: Arc::new(buffer),
            shape,
        })
    }

    pub fn alloc(&mut self, shape: Shape) -> Result<DeviceTensor> {
        let size = self.check_size(shape)?;
        let buffer = self.guarded(|device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("midframe.blob"),
                size,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })?;
        Ok(DeviceTensor {
            buffer: Arc::new(buffer),
            shape,
        })
    }

    /// Record one dispatch of `kernel` over `workgroups`.
    pub fn record(
        &mut self,
        kernel: &CompiledKernel,
        inputs: &[&DeviceTensor],
        output: &DeviceTensor,
        params: [u32; 4],
        workgroups: [u32; 3],
    ) {
        let device = &self.context.device;
        let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("midframe.params"),
            contents: bytemuck::cast_slice(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let mut entries: Vec<wgpu::BindGroupEntry<'_>> = inputs
            .iter()
            .enumerate()
            .map(|(binding, tensor)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: tensor.buffer.as_entire_binding(),
            })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: inputs.len() as u32,
            resource: output.buffer.as_entire_binding(),
        });
        entries.push(wgpu::BindGroupEntry {
            binding: inputs.len() as u32 + 1,
            resource: params_buffer.as_entire_binding(),
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("midframe.bindings"),
            layout: &kernel.layout,
            entries: &entries,
        });

        let encoder = self.encoder_mut();
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("midframe.dispatch"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroups[0], workgroups[1], workgroups[2]);
        }
        self.recorded += 1;
    }

    /// Copy a device tensor back to the host. Flushes everything recorded so far.
    pub fn download(&mut self, tensor: &DeviceTensor) -> Result<Tensor> {
        let size = tensor.shape.byte_len() as u64;
        let staging = self.guarded(|device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("midframe.staging"),
                size,
                usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                mapped_at_creation: false,
            })
        })?;

        self.encoder_mut()
            .copy_buffer_to_buffer(&tensor.buffer, 0, &staging, 0, size);
        self.recorded += 1;
        self.submit_and_wait()?;

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self.context.device.poll(wgpu::Maintain::Wait);
        match receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                return Err(InterpolationError::AllocationFailure(format!(
                    "failed to map staging buffer: {error}"
                )))
            }
            Err(_) => {
                return Err(InterpolationError::AllocationFailure(
                    "staging buffer map callback dropped".to_string(),
                ))
            }
        }

        let values: Vec<f32> = {
            let mapped = slice.get_mapped_range();
            bytemuck::cast_slice(&mapped).to_vec()
        };
        staging.unmap();
        Tensor::from_vec(tensor.shape, values)
    }

    /// Submit the recorded commands and block until the queue drains.
    pub fn submit_and_wait(&mut self) -> Result<()> {
        if let Some(encoder) = self.encoder.take() {
            self.context.queue.submit(Some(encoder.finish()));
        }
        let _ = self.context.device.poll(wgpu::Maintain::Wait);
        self.recorded = 0;
        Ok(())
    }
}

/// Record `kernel` against device-resident inputs and return its output.
pub fn record_kernel(
    stream: &mut CommandStream,
    kernel: &dyn Kernel,
    inputs: &[&DeviceTensor],
) -> Result<DeviceTensor> {
    let program = kernel.gpu_program().ok_or_else(|| {
        InterpolationError::Kernel(format!("{} has no device program", kernel.id()))
    })?;
    let shapes: Vec<Shape> = inputs.iter().map(|t| t.shape()).collect();
    let output_shape = kernel.output_shape(&shapes)?;
    let compiled = stream.context().compiled(kernel.id(), &program)?;
    let output = stream.alloc(output_shape)?;
    stream.record(
        &compiled,
        inputs,
        &output,
        program.params(&shapes, output_shape),
        program.workgroups(output_shape),
    );
    Ok(output)
}

/// Upload, dispatch and download in one blocking call.
pub fn run_kernel_sync(
    context: &Arc<GpuContext>,
    kernel: &dyn Kernel,
    inputs: &[&Tensor],
) -> Result<Tensor> {
    let mut stream = CommandStream::new(context.clone());
    let uploaded = inputs
        .iter()
        .map(|t| stream.upload(t))
        .collect::<Result<Vec<_>>>()?;
    let refs: Vec<&DeviceTensor> = uploaded.iter().collect();
    let output = record_kernel(&mut stream, kernel, &refs)?;
    stream.download(&output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{Correlation, FilterInterpolation, OpticalFlowWarp};

    // Skips quietly on machines without an adapter.
    fn try_context() -> Option<Arc<GpuContext>> {
        GpuContext::open(0).ok()
    }

    fn pattern(shape: Shape, seed: usize) -> Tensor {
        Tensor::from_shape_fn(shape, |c, y, x| {
            (((c + 3) * 29 + y * 13 + x * 7 + seed * 5) % 31) as f32 / 15.0 - 1.0
        })
    }

    #[test]
    fn out_of_range_device_is_unavailable() {
        let err = GpuContext::open(usize::MAX).unwrap_err();
        assert!(matches!(err, InterpolationError::DeviceUnavailable(_)));
    }

    #[test]
    fn correlation_matches_cpu() {
        let Some(ctx) = try_context() else { return };
        let a = pattern(Shape::new(21, 13, 6), 1);
        let b = pattern(Shape::new(21, 13, 6), 2);
        let cpu = Correlation.forward_cpu(&[&a, &b]).unwrap();
        let gpu = run_kernel_sync(&ctx, &Correlation, &[&a, &b]).unwrap();
        assert!(cpu.max_abs_diff(&gpu) < 1e-4);
    }

    #[test]
    fn warp_matches_cpu() {
        let Some(ctx) = try_context() else { return };
        let image = pattern(Shape::new(19, 11, 3), 3);
        let flow = pattern(Shape::new(19, 11, 2), 4);
        let cpu = OpticalFlowWarp.forward_cpu(&[&image, &flow]).unwrap();
        let gpu = run_kernel_sync(&ctx, &OpticalFlowWarp, &[&image, &flow]).unwrap();
        assert!(cpu.max_abs_diff(&gpu) < 1e-4);
    }

    #[test]
    fn filter_interpolation_matches_cpu() {
        let Some(ctx) = try_context() else { return };
        let image = pattern(Shape::new(17, 9, 3), 5);
        let flow = pattern(Shape::new(17, 9, 2), 6);
        let filter = pattern(Shape::new(17, 9, 16), 7);
        let cpu = FilterInterpolation
            .forward_cpu(&[&image, &flow, &filter])
            .unwrap();
        let gpu = run_kernel_sync(&ctx, &FilterInterpolation, &[&image, &flow, &filter]).unwrap();
        assert!(cpu.max_abs_diff(&gpu) < 1e-4);
    }

    #[test]
    fn pipelines_are_memoized_and_evicted_with_context() {
        let Some(ctx) = try_context() else { return };
        let program = Correlation.gpu_program().unwrap();
        let first = ctx.compiled(KernelId::Correlation, &program).unwrap();
        let second = ctx.compiled(KernelId::Correlation, &program).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let key = KernelCacheKey {
            context: ctx.id,
            kernel: KernelId::Correlation,
        };
        drop(first);
        drop(second);
        drop(ctx);
        let cache = kernel_cache().lock().unwrap();
        assert!(!cache.contains_key(&key));
    }

    #[test]
    fn stream_batches_until_download() {
        let Some(ctx) = try_context() else { return };
        let mut stream = CommandStream::new(ctx);
        let a = stream.upload(&pattern(Shape::new(8, 8, 2), 0)).unwrap();
        let flow = stream.upload(&Tensor::zeros(Shape::new(8, 8, 2))).unwrap();
        let warped = record_kernel(&mut stream, &OpticalFlowWarp, &[&a, &flow]).unwrap();
        assert_eq!(stream.pending(), 1);
        let host = stream.download(&warped).unwrap();
        assert_eq!(stream.pending(), 0);
        assert_eq!(host.shape(), Shape::new(8, 8, 2));
    }

    #[test]
    fn record_kernel_rejects_cpu_only_kernel() {
        let Some(ctx) = try_context() else { return };
        let mut stream = CommandStream::new(ctx);
        let flow = stream.upload(&Tensor::zeros(Shape::new(4, 4, 2))).unwrap();
        let depth = stream.upload(&Tensor::zeros(Shape::new(4, 4, 1))).unwrap();
        let err = record_kernel(
            &mut stream,
            &crate::kernels::DepthFlowProjection,
            &[&flow, &depth],
        )
        .unwrap_err();
        assert!(matches!(err, InterpolationError::Kernel(_)));
    }
    fn adapter_info(name: &str, device: u32, device_type: wgpu::DeviceType, backend: wgpu::Backend) -> wgpu::AdapterInfo {
        wgpu::AdapterInfo {
            name: name.to_string(),
            vendor: 0x10de,
            device,
            device_type,
            driver: String::new(),
            driver_info: String::new(),
            backend,
        }
    }

    #[test]
    fn hardware_adapters_skip_software_and_duplicate_backends() {
        use wgpu::{Backend, DeviceType};
        let infos = [
            adapter_info("llvmpipe", 0, DeviceType::Cpu, Backend::Vulkan),
            adapter_info("GPU A", 1, DeviceType::DiscreteGpu, Backend::Vulkan),
            adapter_info("GPU B", 2, DeviceType::DiscreteGpu, Backend::Vulkan),
            adapter_info("GPU A", 1, DeviceType::DiscreteGpu, Backend::Gl),
        ];
        assert_eq!(hardware_adapters(&infos), vec![1, 2]);
        assert!(hardware_adapters(&infos[..1]).is_empty());
    }
}
