//! Bilinear backward warp of an image by a flow field.

use rayon::prelude::*;

use super::{
    expect_channels, expect_inputs, expect_same_extent, shapes_of, GpuProgram, Kernel, KernelId,
};
use crate::error::Result;
use crate::tensor::{Shape, Tensor};

pub struct OpticalFlowWarp;

impl Kernel for OpticalFlowWarp {
    fn id(&self) -> KernelId {
        KernelId::OpticalFlowWarp
    }

    fn output_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        expect_inputs(self.id(), inputs, 2)?;
        expect_channels(self.id(), "flow", inputs[1], 2)?;
        expect_same_extent(self.id(), "flow", inputs[0], inputs[1])?;
        Ok(inputs[0])
    }

    fn forward_cpu(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        let shape = self.output_shape(&shapes_of(inputs))?;
        Ok(warp(inputs[0], inputs[1], shape))
    }

    fn gpu_program(&self) -> Option<GpuProgram> {
        Some(GpuProgram {
            label: "midframe.optical_flow_warp",
            source: include_str!("shaders/optical_flow_warp.wgsl"),
            inputs: 2,
        })
    }
}

/// Samples whose 2x2 neighbourhood leaves the image are exactly zero.
fn warp(image: &Tensor, flow: &Tensor, shape: Shape) -> Tensor {
    let (w, h) = (shape.width, shape.height);
    let flow_x = flow.plane(0);
    let flow_y = flow.plane(1);
    let src = image.as_slice();

    let mut out = Tensor::zeros(shape);
    out.as_slice_mut()
        .par_chunks_mut(w * h)
        .enumerate()
        .for_each(|(q, dst)| {
            let plane = &src[q * w * h..(q + 1) * w * h];
            for y in 0..h {
                for x in 0..w {
                    let i = y * w + x;
                    let sx = x as f32 + flow_x[i];
                    let sy = y as f32 + flow_y[i];
                    let fx0 = sx.floor();
                    let fy0 = sy.floor();
                    // negated form also rejects NaN
                    if !(fx0 >= 0.0 && fy0 >= 0.0 && fx0 < (w - 1) as f32 && fy0 < (h - 1) as f32)
                    {
                        continue;
                    }
                    let (x0, y0) = (fx0 as usize, fy0 as usize);
                    let alpha = sx - fx0;
                    let beta = sy - fy0;

                    let base = y0 * w + x0;
                    let v0 = plane[base];
                    let v1 = plane[base + 1];
                    let v2 = plane[base + w];
                    let v3 = plane[base + w + 1];

                    let top = v0 * (1.0 - alpha) + v1 * alpha;
                    let bottom = v2 * (1.0 - alpha) + v3 * alpha;
                    dst[i] = top * (1.0 - beta) + bottom * beta;
                }
            }
        });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(w: usize, h: usize, c: usize) -> Tensor {
        Tensor::from_shape_fn(Shape::new(w, h, c), |q, y, x| (q * 1000 + y * w + x) as f32 + 1.0)
    }

    fn constant_flow(w: usize, h: usize, dx: f32, dy: f32) -> Tensor {
        Tensor::from_shape_fn(Shape::new(w, h, 2), |c, _, _| if c == 0 { dx } else { dy })
    }

    #[test]
    fn test_zero_flow_is_identity_inside_border() {
        let image = ramp(6, 5, 2);
        let out = OpticalFlowWarp
            .forward_cpu(&[&image, &constant_flow(6, 5, 0.0, 0.0)])
            .unwrap();
        for y in 0..4 {
            for x in 0..5 {
                assert_eq!(out.get(1, y, x), image.get(1, y, x));
            }
        }
        // last column and row have no complete 2x2 neighbourhood
        assert_eq!(out.get(0, 0, 5), 0.0);
        assert_eq!(out.get(0, 4, 0), 0.0);
    }

    #[test]
    fn test_sample_at_last_column_is_zero() {
        let (w, h) = (8, 4);
        let image = ramp(w, h, 1);
        let mut flow = constant_flow(w, h, 0.0, 0.0);
        flow.set(0, 1, 0, (w - 1) as f32);
        let out = OpticalFlowWarp.forward_cpu(&[&image, &flow]).unwrap();
        assert_eq!(out.get(0, 1, 0), 0.0);
    }

    #[test]
    fn test_sample_at_second_last_column_is_exact() {
        let (w, h) = (8, 4);
        let image = ramp(w, h, 1);
        let mut flow = constant_flow(w, h, 0.0, 0.0);
        flow.set(0, 1, 0, (w - 2) as f32);
        let out = OpticalFlowWarp.forward_cpu(&[&image, &flow]).unwrap();
        assert_eq!(out.get(0, 1, 0), image.get(0, 1, w - 2));
    }

    #[test]
    fn test_fractional_flow_blends_bilinearly() {
        let image = ramp(4, 4, 1);
        let out = OpticalFlowWarp
            .forward_cpu(&[&image, &constant_flow(4, 4, 0.25, 0.5)])
            .unwrap();
        let expected = {
            let top = image.get(0, 1, 1) * 0.75 + image.get(0, 1, 2) * 0.25;
            let bottom = image.get(0, 2, 1) * 0.75 + image.get(0, 2, 2) * 0.25;
            top * 0.5 + bottom * 0.5
        };
        assert!((out.get(0, 1, 1) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_negative_sample_is_zero() {
        let image = ramp(4, 4, 1);
        let out = OpticalFlowWarp
            .forward_cpu(&[&image, &constant_flow(4, 4, -0.5, 0.0)])
            .unwrap();
        assert_eq!(out.get(0, 2, 0), 0.0);
        assert_ne!(out.get(0, 2, 1), 0.0);
    }

    #[test]
    fn test_nan_flow_is_zero() {
        let image = ramp(4, 4, 1);
        let out = OpticalFlowWarp
            .forward_cpu(&[&image, &constant_flow(4, 4, f32::NAN, 0.0)])
            .unwrap();
        assert!(out.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_flow_must_have_two_channels() {
        let image = ramp(4, 4, 3);
        let flow = Tensor::zeros(Shape::new(4, 4, 3));
        assert!(OpticalFlowWarp.forward_cpu(&[&image, &flow]).is_err());
    }
}
