//! Tiling orchestrator driving the depth, flow, context and synthesis
//! sub-networks over a frame pair.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::backend::{BackendOptions, InferenceBackend};
use crate::engine::{
    Blob, BlobMap, ExecutionTarget, SegmentedNetwork, SubNetwork, CONTEXT_NETWORK,
    DEPTH_NETWORK, FLOW_NETWORK, SYNTHESIS_NETWORK,
};
use crate::error::{InterpolationError, Result};
use crate::gpu::{CommandStream, GpuContext};
use crate::kernels::LayerRegistry;
use crate::tensor::{Shape, Tensor};
use crate::tiling::{
    inject_border, paste_tile, plan_tiles, validate_prepadding, validate_tile_size, Tile,
};
use crate::types::Frame;

/// `{tile_size, prepadding, gpu_id}`; `gpu_id = -1` selects pure CPU mode.
///
/// A non-negative `gpu_id` names two things: the index into
/// [`GpuContext::adapter_count`]'s list (hardware adapters only, one per
/// physical GPU, in platform order) for the custom kernels, and the CUDA
/// ordinal for the ONNX sessions. The two orders are not guaranteed to agree
/// on multi-GPU hosts; there, narrow both to one card with
/// `CUDA_VISIBLE_DEVICES` and the driver's device selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpolatorOptions {
    pub tile_size: usize,
    pub prepadding: usize,
    pub gpu_id: i32,
}

impl Default for InterpolatorOptions {
    fn default() -> Self {
        Self {
            tile_size: 256,
            prepadding: 64,
            gpu_id: 0,
        }
    }
}

impl InterpolatorOptions {
    pub fn validate(&self) -> Result<()> {
        validate_tile_size(self.tile_size)?;
        validate_prepadding(self.prepadding)?;
        if self.gpu_id < -1 {
            return Err(InterpolationError::DeviceUnavailable(format!(
                "invalid gpu id {}",
                self.gpu_id
            )));
        }
        Ok(())
    }

    pub fn uses_gpu(&self) -> bool {
        self.gpu_id >= 0
    }
}

pub fn validate_timestep(timestep: f32) -> Result<()> {
    if !timestep.is_finite() || !(0.0..=1.0).contains(&timestep) {
        return Err(InterpolationError::config(format!(
            "timestep {timestep} must be within [0, 1]"
        )));
    }
    Ok(())
}

/// The four collaborating networks, in pipeline order.
pub struct SubNetworks {
    pub depth: Box<dyn SubNetwork>,
    pub flow: Box<dyn SubNetwork>,
    pub context: Box<dyn SubNetwork>,
    pub synthesis: Box<dyn SubNetwork>,
}

impl SubNetworks {
    pub fn load(models_dir: &Path, backend: &BackendOptions) -> Result<Self> {
        let registry = LayerRegistry::with_builtin_layers();
        let load = |name: &str| -> Result<Box<dyn SubNetwork>> {
            Ok(Box::new(SegmentedNetwork::load_named(
                models_dir, name, backend, &registry,
            )?))
        };
        Ok(Self {
            depth: load(DEPTH_NETWORK)?,
            flow: load(FLOW_NETWORK)?,
            context: load(CONTEXT_NETWORK)?,
            synthesis: load(SYNTHESIS_NETWORK)?,
        })
    }
}

fn run(
    network: &dyn SubNetwork,
    inputs: Vec<(&str, Blob)>,
    output: &str,
    target: &mut ExecutionTarget<'_>,
) -> Result<Blob> {
    let inputs: BlobMap = inputs
        .into_iter()
        .map(|(name, blob)| (name.to_string(), blob))
        .collect();
    network.extract(inputs, output, target)
}

fn run_host(network: &dyn SubNetwork, inputs: Vec<(&str, Blob)>, output: &str) -> Result<Blob> {
    run(network, inputs, output, &mut ExecutionTarget::Cpu)
}

/// Outputs of the six frame-pair stages for one tile.
struct TileFeatures {
    depth0: Blob,
    depth1: Blob,
    flow0: Blob,
    flow1: Blob,
    ctx0: Blob,
    ctx1: Blob,
}

pub struct Interpolator {
    networks: SubNetworks,
    options: InterpolatorOptions,
    device: Option<Arc<GpuContext>>,
}

impl Interpolator {
    /// Wrap already-loaded networks. `device` is `None` in CPU mode.
    pub fn new(
        networks: SubNetworks,
        options: InterpolatorOptions,
        device: Option<Arc<GpuContext>>,
    ) -> Result<Self> {
        options.validate()?;
        match (&device, options.uses_gpu()) {
            (None, false) => {}
            (Some(context), true) if context.index() == options.gpu_id as usize => {}
            (Some(context), true) => {
                return Err(InterpolationError::config(format!(
                    "gpu id {} does not match the opened device {}",
                    options.gpu_id,
                    context.index()
                )));
            }
            (None, true) => {
                return Err(InterpolationError::config(format!(
                    "gpu id {} requires a compute device",
                    options.gpu_id
                )));
            }
            (Some(context), false) => {
                return Err(InterpolationError::config(format!(
                    "gpu id -1 selects CPU mode but device {} was supplied",
                    context.index()
                )));
            }
        }
        Ok(Self {
            networks,
            options,
            device,
        })
    }

    /// Open the compute device and load all four networks from `models_dir`.
    pub fn load(
        models_dir: &Path,
        options: InterpolatorOptions,
        backend: &BackendOptions,
    ) -> Result<Self> {
        options.validate()?;

        let (device, backend) = if options.uses_gpu() {
            let index = options.gpu_id as usize;
            let count = GpuContext::adapter_count();
            if index >= count {
                return Err(InterpolationError::DeviceUnavailable(format!(
                    "gpu id {index} out of range ({count} adapters)"
                )));
            }
            let backend = BackendOptions {
                device_id: options.gpu_id,
                ..backend.clone()
            };
            (Some(GpuContext::open(index)?), backend)
        } else {
            let backend = BackendOptions {
                backend: InferenceBackend::Cpu,
                ..backend.clone()
            };
            (None, backend)
        };

        let started = Instant::now();
        let networks = SubNetworks::load(models_dir, &backend)?;
        info!(
            models_dir = %models_dir.display(),
            backend = %backend.backend,
            gpu_id = options.gpu_id,
            load_ms = %format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            "Sub-networks loaded"
        );

        Self::new(networks, options, device)
    }

    pub fn options(&self) -> &InterpolatorOptions {
        &self.options
    }

    pub fn device(&self) -> Option<&Arc<GpuContext>> {
        self.device.as_ref()
    }

    /// Synthesize the frame at `timestep` between `frame0` (0.0) and `frame1` (1.0).
    pub fn process(&self, frame0: &Frame, frame1: &Frame, timestep: f32) -> Result<Frame> {
        self.check_pair(frame0, frame1, timestep)?;
        if timestep == 0.0 {
            return Ok(frame0.clone());
        }
        if timestep == 1.0 {
            return Ok(frame1.clone());
        }
        Frame::from_bgr_tensor(&self.synthesize_frame(frame0, frame1, timestep)?)
    }

    /// Like [`Interpolator::process`], but returns the planar BGR output
    /// before it is quantized back to 8 bits.
    pub fn process_tensor(&self, frame0: &Frame, frame1: &Frame, timestep: f32) -> Result<Tensor> {
        self.check_pair(frame0, frame1, timestep)?;
        if timestep == 0.0 {
            return Ok(frame0.to_bgr_tensor());
        }
        if timestep == 1.0 {
            return Ok(frame1.to_bgr_tensor());
        }
        self.synthesize_frame(frame0, frame1, timestep)
    }

    fn check_pair(&self, frame0: &Frame, frame1: &Frame, timestep: f32) -> Result<()> {
        validate_timestep(timestep)?;
        frame0.check_buffer()?;
        frame1.check_buffer()?;
        if !frame0.same_extent(frame1) {
            return Err(InterpolationError::shape(
                "frame pair",
                format!("{}x{}", frame0.width, frame0.height),
                format!("{}x{}", frame1.width, frame1.height),
            ));
        }
        Ok(())
    }

    fn synthesize_frame(&self, frame0: &Frame, frame1: &Frame, timestep: f32) -> Result<Tensor> {
        let (width, height) = (frame0.width as usize, frame0.height as usize);
        let plan = plan_tiles(width, height, self.options.tile_size, self.options.prepadding)?;
        let started = Instant::now();

        let image0 = frame0.to_bgr_tensor();
        let image1 = frame1.to_bgr_tensor();
        let mut output = Tensor::zeros(Shape::new(width, height, 3));
        let mut stream = self
            .device
            .as_ref()
            .map(|context| CommandStream::new(context.clone()));

        for tile in &plan.tiles {
            let tile_started = Instant::now();
            let result = match stream.as_mut() {
                Some(stream) => self.process_tile_device(&image0, &image1, tile, timestep, stream)?,
                None => self.process_tile_cpu(&image0, &image1, tile, timestep)?,
            };
            paste_tile(&mut output, &result, tile)?;
            drop(result);

            // One tile's working set at a time on the device.
            if plan.is_tiled() {
                if let Some(stream) = stream.as_mut() {
                    stream.submit_and_wait()?;
                }
            }

            let ms = tile_started.elapsed().as_secs_f64() * 1000.0;
            debug!(
                tile = tile.index,
                tiles = plan.len(),
                x = tile.x,
                y = tile.y,
                tile_ms = %format!("{ms:.1}"),
                "Tile synthesized"
            );
        }

        let ms = started.elapsed().as_secs_f64() * 1000.0;
        info!(
            width,
            height,
            timestep,
            tiles = plan.len(),
            columns = plan.columns,
            rows = plan.rows,
            device = self.device.is_some(),
            total_ms = %format!("{ms:.1}"),
            "Frame interpolated"
        );
        Ok(output)
    }

    fn process_tile_cpu(
        &self,
        image0: &Tensor,
        image1: &Tensor,
        tile: &Tile,
        timestep: f32,
    ) -> Result<Tensor> {
        let in0 = inject_border(image0, tile);
        let in1 = inject_border(image1, tile);
        let nets = &self.networks;

        let depth = |input: &Tensor| {
            run_host(nets.depth.as_ref(), vec![("input", input.clone().into())], "depth")
        };
        let flow = |first: &Tensor, second: &Tensor| {
            run_host(
                nets.flow.as_ref(),
                vec![("input0", first.clone().into()), ("input1", second.clone().into())],
                "flow",
            )
        };
        let context = |input: &Tensor| {
            run_host(nets.context.as_ref(), vec![("input", input.clone().into())], "ctx")
        };

        // The three pairs are independent of each other.
        let ((depth0, depth1), ((flow0, flow1), (ctx0, ctx1))) = rayon::join(
            || rayon::join(|| depth(&in0), || depth(&in1)),
            || {
                rayon::join(
                    || rayon::join(|| flow(&in0, &in1), || flow(&in1, &in0)),
                    || rayon::join(|| context(&in0), || context(&in1)),
                )
            },
        );
        let features = TileFeatures {
            depth0: depth0?,
            depth1: depth1?,
            flow0: flow0?,
            flow1: flow1?,
            ctx0: ctx0?,
            ctx1: ctx1?,
        };

        let mut target = ExecutionTarget::Cpu;
        self.synthesize(in0, in1, features, timestep, &mut target)
    }

    fn process_tile_device(
        &self,
        image0: &Tensor,
        image1: &Tensor,
        tile: &Tile,
        timestep: f32,
        stream: &mut CommandStream,
    ) -> Result<Tensor> {
        let in0 = inject_border(image0, tile);
        let in1 = inject_border(image1, tile);
        let nets = &self.networks;
        let mut target = ExecutionTarget::Gpu(stream);

        let features = TileFeatures {
            depth0: run(nets.depth.as_ref(), vec![("input", in0.clone().into())], "depth", &mut target)?,
            depth1: run(nets.depth.as_ref(), vec![("input", in1.clone().into())], "depth", &mut target)?,
            flow0: run(
                nets.flow.as_ref(),
                vec![("input0", in0.clone().into()), ("input1", in1.clone().into())],
                "flow",
                &mut target,
            )?,
            flow1: run(
                nets.flow.as_ref(),
                vec![("input0", in1.clone().into()), ("input1", in0.clone().into())],
                "flow",
                &mut target,
            )?,
            ctx0: run(nets.context.as_ref(), vec![("input", in0.clone().into())], "ctx", &mut target)?,
            ctx1: run(nets.context.as_ref(), vec![("input", in1.clone().into())], "ctx", &mut target)?,
        };

        self.synthesize(in0, in1, features, timestep, &mut target)
    }

    /// Consumes every per-tile intermediate; they are released when this returns.
    fn synthesize(
        &self,
        in0: Tensor,
        in1: Tensor,
        features: TileFeatures,
        timestep: f32,
        target: &mut ExecutionTarget<'_>,
    ) -> Result<Tensor> {
        let TileFeatures {
            depth0,
            depth1,
            flow0,
            flow1,
            ctx0,
            ctx1,
        } = features;

        let expected = in0.shape();
        let blob = run(
            self.networks.synthesis.as_ref(),
            vec![
                ("input0", in0.into()),
                ("input1", in1.into()),
                ("depth0", depth0),
                ("depth1", depth1),
                ("flow0", flow0),
                ("flow1", flow1),
                ("flow0_w", Tensor::scalar(timestep).into()),
                ("flow1_w", Tensor::scalar(1.0 - timestep).into()),
                ("ctx0", ctx0),
                ("ctx1", ctx1),
            ],
            "output_rectified",
            target,
        )?;

        let output = target.host(&blob)?.into_owned();
        output.ensure_shape(expected, "synthesis output")?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Applies `f` to every element of its single input.
    struct Pointwise {
        name: &'static str,
        output: &'static str,
        f: fn(f32) -> f32,
    }

    impl SubNetwork for Pointwise {
        fn name(&self) -> &str {
            self.name
        }

        fn extract(&self, mut inputs: BlobMap, output: &str, target: &mut ExecutionTarget<'_>) -> Result<Blob> {
            assert_eq!(output, self.output);
            let key = if inputs.contains_key("input") { "input" } else { "input0" };
            let blob = inputs.remove(key).unwrap();
            let host = target.host(&blob)?.into_owned();
            let data = host.into_array().mapv(self.f);
            Ok(Tensor::from_array(data).into())
        }
    }

    /// Blends the two frames with the scalar weights.
    struct Blend {
        calls: Arc<AtomicUsize>,
    }

    impl SubNetwork for Blend {
        fn name(&self) -> &str {
            "interpolation"
        }

        fn extract(&self, inputs: BlobMap, _output: &str, target: &mut ExecutionTarget<'_>) -> Result<Blob> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for name in ["depth0", "depth1", "flow0", "flow1", "ctx0", "ctx1"] {
                assert!(inputs.contains_key(name), "missing {name}");
            }
            let a = target.host(&inputs["input0"])?.into_owned();
            let b = target.host(&inputs["input1"])?.into_owned();
            let w0 = target.host(&inputs["flow0_w"])?.get(0, 0, 0);
            let w1 = target.host(&inputs["flow1_w"])?.get(0, 0, 0);
            let data = a.into_array() * w1 + b.into_array() * w0;
            Ok(Tensor::from_array(data).into())
        }
    }

    struct Failing;

    impl SubNetwork for Failing {
        fn name(&self) -> &str {
            "depthnet"
        }

        fn extract(&self, _: BlobMap, _: &str, _: &mut ExecutionTarget<'_>) -> Result<Blob> {
            Err(InterpolationError::inference("depthnet", "out of memory"))
        }
    }

    fn mock_networks(calls: Arc<AtomicUsize>) -> SubNetworks {
        SubNetworks {
            depth: Box::new(Pointwise { name: "depthnet", output: "depth", f: |v| v.abs() }),
            flow: Box::new(Pointwise { name: "flownet", output: "flow", f: |v| v * 0.5 }),
            context: Box::new(Pointwise { name: "ctxnet", output: "ctx", f: |v| v }),
            synthesis: Box::new(Blend { calls }),
        }
    }

    fn cpu_options(tile_size: usize) -> InterpolatorOptions {
        InterpolatorOptions {
            tile_size,
            prepadding: 16,
            gpu_id: -1,
        }
    }

    fn gradient(width: u32, height: u32, seed: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(((x * 3 + seed) % 256) as u8);
                data.push(((y * 5 + seed) % 256) as u8);
                data.push(((x + y + seed * 7) % 256) as u8);
            }
        }
        Frame::new(width, height, data).unwrap()
    }

    #[test]
    fn endpoints_return_inputs_without_inference() {
        let calls = Arc::new(AtomicUsize::new(0));
        let interp = Interpolator::new(mock_networks(calls.clone()), cpu_options(0), None).unwrap();
        let a = gradient(40, 30, 1);
        let b = gradient(40, 30, 9);
        assert_eq!(interp.process(&a, &b, 0.0).unwrap(), a);
        assert_eq!(interp.process(&a, &b, 1.0).unwrap(), b);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn timestep_out_of_range_is_rejected() {
        let interp = Interpolator::new(mock_networks(Arc::default()), cpu_options(0), None).unwrap();
        let a = gradient(8, 8, 0);
        for t in [-0.1, 1.5, f32::NAN, f32::INFINITY] {
            let err = interp.process(&a, &a, t).unwrap_err();
            assert!(matches!(err, InterpolationError::InvalidConfiguration(_)), "{t}");
        }
    }

    #[test]
    fn mismatched_frames_are_rejected() {
        let interp = Interpolator::new(mock_networks(Arc::default()), cpu_options(0), None).unwrap();
        let err = interp
            .process(&gradient(16, 16, 0), &gradient(16, 8, 0), 0.5)
            .unwrap_err();
        assert!(matches!(err, InterpolationError::ShapeMismatch { .. }));
    }

    #[test]
    fn invalid_options_fail_before_compute() {
        for options in [
            InterpolatorOptions { tile_size: 100, prepadding: 16, gpu_id: -1 },
            InterpolatorOptions { tile_size: 144, prepadding: 16, gpu_id: -1 },
            InterpolatorOptions { tile_size: 0, prepadding: 10, gpu_id: -1 },
            InterpolatorOptions { tile_size: 0, prepadding: 16, gpu_id: -2 },
        ] {
            let err = Interpolator::new(mock_networks(Arc::default()), options, None)
                .err()
                .unwrap();
            assert!(err.is_configuration(), "{options:?}");
        }
    }

    #[test]
    fn midpoint_blends_frames() {
        let interp = Interpolator::new(mock_networks(Arc::default()), cpu_options(0), None).unwrap();
        let a = Frame::solid(20, 12, [10, 100, 200]);
        let b = Frame::solid(20, 12, [30, 120, 220]);
        let out = interp.process(&a, &b, 0.5).unwrap();
        assert_eq!(out.pixel(0, 0), [20, 110, 210]);
        assert_eq!(out.pixel(19, 11), [20, 110, 210]);
    }

    #[test]
    fn tiled_run_visits_every_tile() {
        let calls = Arc::new(AtomicUsize::new(0));
        let interp = Interpolator::new(mock_networks(calls.clone()), cpu_options(128), None).unwrap();
        let a = gradient(300, 140, 2);
        let b = gradient(300, 140, 5);
        let out = interp.process(&a, &b, 0.25).unwrap();
        // padded 320x160 -> 3 columns x 2 rows
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!((out.width, out.height), (300, 140));

        let whole = Interpolator::new(mock_networks(Arc::default()), cpu_options(0), None).unwrap();
        assert_eq!(whole.process(&a, &b, 0.25).unwrap(), out);
    }

    #[test]
    fn network_failure_aborts_call() {
        let mut networks = mock_networks(Arc::default());
        networks.depth = Box::new(Failing);
        let interp = Interpolator::new(networks, cpu_options(0), None).unwrap();
        let a = gradient(32, 32, 0);
        let err = interp.process(&a, &a, 0.5).unwrap_err();
        assert!(matches!(err, InterpolationError::Inference { .. }));
    }

    #[test]
    fn load_rejects_out_of_range_device() {
        let dir = tempfile::tempdir().unwrap();
        let options = InterpolatorOptions { gpu_id: i32::MAX, ..Default::default() };
        let err = Interpolator::load(dir.path(), options, &BackendOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, InterpolationError::DeviceUnavailable(_)));
    }

    #[test]
    fn load_without_descriptors_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let options = InterpolatorOptions { gpu_id: -1, ..Default::default() };
        let err = Interpolator::load(dir.path(), options, &BackendOptions::default())
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }
    #[test]
    fn hand_built_frames_with_wrong_buffers_are_rejected() {
        let interp = Interpolator::new(mock_networks(Arc::default()), cpu_options(0), None).unwrap();
        let good = Frame::solid(2, 2, [0, 0, 0]);
        let long = Frame { width: 2, height: 2, data: vec![0u8; 15] };
        let short = Frame { width: 2, height: 2, data: vec![0u8; 9] };

        for bad in [&long, &short] {
            for t in [0.0, 0.5, 1.0] {
                let err = interp.process(bad, bad, t).unwrap_err();
                assert!(matches!(err, InterpolationError::ShapeMismatch { .. }), "{t}");
                let err = interp.process(&good, bad, t).unwrap_err();
                assert!(matches!(err, InterpolationError::ShapeMismatch { .. }), "{t}");
            }
            let err = interp.process_tensor(bad, &good, 0.5).unwrap_err();
            assert!(matches!(err, InterpolationError::ShapeMismatch { .. }));
        }
    }

    #[test]
    fn process_tensor_matches_quantized_output() {
        let interp = Interpolator::new(mock_networks(Arc::default()), cpu_options(0), None).unwrap();
        let a = gradient(24, 20, 3);
        let b = gradient(24, 20, 8);
        let tensor = interp.process_tensor(&a, &b, 0.3).unwrap();
        assert_eq!(Frame::from_bgr_tensor(&tensor).unwrap(), interp.process(&a, &b, 0.3).unwrap());
        assert_eq!(interp.process_tensor(&a, &b, 0.0).unwrap(), a.to_bgr_tensor());
    }

    #[test]
    fn gpu_id_without_device_is_rejected() {
        let options = InterpolatorOptions { gpu_id: 0, ..cpu_options(0) };
        let err = Interpolator::new(mock_networks(Arc::default()), options, None)
            .err()
            .unwrap();
        assert!(matches!(err, InterpolationError::InvalidConfiguration(_)));
    }

    #[test]
    fn device_with_cpu_or_mismatched_gpu_id_is_rejected() {
        let Ok(context) = GpuContext::open(0) else {
            return;
        };
        for gpu_id in [-1, 1] {
            let options = InterpolatorOptions { gpu_id, ..cpu_options(0) };
            let err = Interpolator::new(mock_networks(Arc::default()), options, Some(context.clone()))
                .err()
                .unwrap();
            assert!(matches!(err, InterpolationError::InvalidConfiguration(_)), "{gpu_id}");
        }
        let options = InterpolatorOptions { gpu_id: 0, ..cpu_options(0) };
        assert!(Interpolator::new(mock_networks(Arc::default()), options, Some(context)).is_ok());
    }
}
