//! Depth-weighted forward projection of a flow field, with hole filling.
//!
//! The scatter is a multi-writer accumulation, so it runs serialized; the
//! average and hole-fill passes are per-cell independent and run on rayon.
//! There is no device variant: under a device target the inputs are
//! downloaded and this CPU path runs instead.

use rayon::prelude::*;

use super::{expect_channels, expect_inputs, expect_same_extent, shapes_of, Kernel, KernelId};
use crate::error::Result;
use crate::tensor::{Shape, Tensor};

pub struct DepthFlowProjection;

impl Kernel for DepthFlowProjection {
    fn id(&self) -> KernelId {
        KernelId::DepthFlowProjection
    }

    fn output_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        expect_inputs(self.id(), inputs, 2)?;
        expect_channels(self.id(), "flow", inputs[0], 2)?;
        expect_channels(self.id(), "depth", inputs[1], 1)?;
        expect_same_extent(self.id(), "depth", inputs[0], inputs[1])?;
        Ok(inputs[0])
    }

    fn forward_cpu(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        self.output_shape(&shapes_of(inputs))?;
        let projection = project(inputs[0], inputs[1]);
        Ok(fill_holes(&projection))
    }
}

/// Averaged projected flow together with the scattered depth mass per cell.
#[derive(Debug, Clone)]
pub struct Projection {
    pub flow: Tensor,
    pub count: Tensor,
}

/// Scatter and average. Cells with `count <= 0` are holes.
pub fn project(flow: &Tensor, depth: &Tensor) -> Projection {
    let mut projection = scatter(flow, depth);
    average(&mut projection);
    projection
}

fn scatter(flow: &Tensor, depth: &Tensor) -> Projection {
    let (w, h) = (flow.width(), flow.height());
    let mut acc = Tensor::zeros(Shape::new(w, h, 2));
    let mut count = Tensor::zeros(Shape::new(w, h, 1));

    let fx = flow.plane(0);
    let fy = flow.plane(1);
    let d = depth.plane(0);
    let (acc_x, acc_y) = acc.as_slice_mut().split_at_mut(w * h);
    let mass = count.as_slice_mut();

    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            let sx = (x as f32 + fx[i]).floor();
            let sy = (y as f32 + fy[i]).floor();
            if !(sx >= 0.0 && sy >= 0.0 && sx < (w - 1) as f32 && sy < (h - 1) as f32) {
                continue;
            }
            let (x0, y0) = (sx as usize, sy as usize);
            let weighted_x = fx[i] * d[i];
            let weighted_y = fy[i] * d[i];
            for cell in [
                y0 * w + x0,
                y0 * w + x0 + 1,
                (y0 + 1) * w + x0,
                (y0 + 1) * w + x0 + 1,
            ] {
                acc_x[cell] -= weighted_x;
                acc_y[cell] -= weighted_y;
                mass[cell] += d[i];
            }
        }
    }

    Projection { flow: acc, count }
}

fn average(projection: &mut Projection) {
    let plane = projection.count.as_slice().len();
    let counts = projection.count.as_slice();
    for channel in projection.flow.as_slice_mut().chunks_mut(plane) {
        channel
            .par_iter_mut()
            .zip(counts.par_iter())
            .for_each(|(value, &count)| {
                if count > 0.0 {
                    *value /= count;
                }
            });
    }
}

/// Fill every hole with the mean of the nearest non-hole cell found in each
/// of the four cardinal directions.
///
/// Searches read the count map from the projection only, so a hole never
/// borrows a value that was itself filled. Holes whose four searches all
/// fail stay zero.
pub fn fill_holes(projection: &Projection) -> Tensor {
    let (w, h) = (projection.flow.width(), projection.flow.height());
    let counts = projection.count.plane(0);
    let src_x = projection.flow.plane(0);
    let src_y = projection.flow.plane(1);

    let mut filled = projection.flow.clone();
    let (out_x, out_y) = filled.as_slice_mut().split_at_mut(w * h);

    out_x
        .par_chunks_mut(w)
        .zip(out_y.par_chunks_mut(w))
        .enumerate()
        .for_each(|(y, (row_x, row_y))| {
            let valid = |j: &usize| counts[*j] > 0.0;
            for x in 0..w {
                if counts[y * w + x] > 0.0 {
                    continue;
                }
                let found = [
                    (0..x).rev().map(|nx| y * w + nx).find(valid),
                    (x + 1..w).map(|nx| y * w + nx).find(valid),
                    (0..y).rev().map(|ny| ny * w + x).find(valid),
                    (y + 1..h).map(|ny| ny * w + x).find(valid),
                ];

                let mut sum_x = 0.0;
                let mut sum_y = 0.0;
                let mut n = 0usize;
                for j in found.into_iter().flatten() {
                    sum_x += src_x[j];
                    sum_y += src_y[j];
                    n += 1;
                }

                if n > 0 {
                    row_x[x] = sum_x / n as f32;
                    row_y[x] = sum_y / n as f32;
                } else {
                    row_x[x] = 0.0;
                    row_y[x] = 0.0;
                }
            }
        });

    filled
}
