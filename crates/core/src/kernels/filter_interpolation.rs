//! Learned 4x4 adaptive-kernel resampling.
//!
//! Weight channel `4 * r + c` belongs to the tap at row `r - 1`, column
//! `c - 1` relative to the floor of the sample position. Weights are applied
//! as given, without renormalisation.

use rayon::prelude::*;

use super::{
    expect_channels, expect_inputs, expect_same_extent, shapes_of, GpuProgram, Kernel, KernelId,
};
use crate::error::Result;
use crate::tensor::{Shape, Tensor};

pub const TAPS: usize = 16;

pub struct FilterInterpolation;

impl Kernel for FilterInterpolation {
    fn id(&self) -> KernelId {
        KernelId::FilterInterpolation
    }

    fn output_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        expect_inputs(self.id(), inputs, 3)?;
        expect_channels(self.id(), "flow", inputs[1], 2)?;
        expect_channels(self.id(), "filter", inputs[2], TAPS)?;
        expect_same_extent(self.id(), "flow", inputs[0], inputs[1])?;
        expect_same_extent(self.id(), "filter", inputs[0], inputs[2])?;
        Ok(inputs[0])
    }

    fn forward_cpu(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        let shape = self.output_shape(&shapes_of(inputs))?;
        Ok(resample(inputs[0], inputs[1], inputs[2], shape))
    }

    fn gpu_program(&self) -> Option<GpuProgram> {
        Some(GpuProgram {
            label: "midframe.filter_interpolation",
            source: include_str!("shaders/filter_interpolation.wgsl"),
            inputs: 3,
        })
    }
}

fn resample(image: &Tensor, flow: &Tensor, filter: &Tensor, shape: Shape) -> Tensor {
    let (w, h) = (shape.width, shape.height);
    let plane_len = w * h;
    let flow_x = flow.plane(0);
    let flow_y = flow.plane(1);
    let weights = filter.as_slice();
    let src = image.as_slice();
    let half_w = w as f32 / 2.0;
    let half_h = h as f32 / 2.0;

    let mut out = Tensor::zeros(shape);
    out.as_slice_mut()
        .par_chunks_mut(plane_len)
        .enumerate()
        .for_each(|(q, dst)| {
            let plane = &src[q * plane_len..(q + 1) * plane_len];
            let tap = |x: isize, y: isize| {
                let cx = x.clamp(0, w as isize - 1) as usize;
                let cy = y.clamp(0, h as isize - 1) as usize;
                plane[cy * w + cx]
            };

            for y in 0..h {
                for x in 0..w {
                    let i = y * w + x;
                    let fx = flow_x[i];
                    let fy = flow_y[i];
                    let sx = x as f32 + fx;
                    let sy = y as f32 + fy;

                    let inside = sx >= 0.0
                        && sy >= 0.0
                        && sx < (w - 1) as f32
                        && sy < (h - 1) as f32
                        && fx.abs() <= half_w
                        && fy.abs() <= half_h;
                    if !inside {
                        dst[i] = plane[i];
                        continue;
                    }

                    let x1 = sx.floor();
                    let y1 = sy.floor();
                    let alpha = sx - x1;
                    let beta = sy - y1;
                    let (x1, y1) = (x1 as isize, y1 as isize);

                    let mut quad = [0.0f32; 4];
                    for r in 0..4 {
                        for c in 0..4 {
                            let weight = weights[(r * 4 + c) * plane_len + i];
                            let value = tap(x1 - 1 + c as isize, y1 - 1 + r as isize);
                            quad[(r / 2) * 2 + c / 2] += value * weight;
                        }
                    }

                    let top = quad[0] * (1.0 - alpha) + quad[1] * alpha;
                    let bottom = quad[2] * (1.0 - alpha) + quad[3] * alpha;
                    dst[i] = top * (1.0 - beta) + bottom * beta;
                }
            }
        });
    out
}
