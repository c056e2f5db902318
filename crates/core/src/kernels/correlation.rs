//! Dense 9x9 displacement cost volume.

use ndarray::{s, Array3};
use rayon::prelude::*;

use super::{expect_inputs, expect_same_extent, shapes_of, GpuProgram, Kernel, KernelId};
use crate::error::Result;
use crate::tensor::{Shape, Tensor};

pub const RADIUS: usize = 4;
pub const WINDOW: usize = 2 * RADIUS + 1;
pub const DISPLACEMENTS: usize = WINDOW * WINDOW;
/// Output channel of the zero displacement.
pub const CENTER_CHANNEL: usize = RADIUS * WINDOW + RADIUS;

pub struct Correlation;

impl Kernel for Correlation {
    fn id(&self) -> KernelId {
        KernelId::Correlation
    }

    fn output_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        expect_inputs(self.id(), inputs, 2)?;
        let (a, b) = (inputs[0], inputs[1]);
        expect_same_extent(self.id(), "feature maps", a, b)?;
        if a.channels != b.channels {
            return Err(crate::error::InterpolationError::shape(
                "Correlation feature channels",
                a.channels,
                b.channels,
            ));
        }
        Ok(a.with_channels(DISPLACEMENTS))
    }

    fn forward_cpu(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        let shape = self.output_shape(&shapes_of(inputs))?;
        Ok(correlate(inputs[0], inputs[1], shape))
    }

    fn gpu_program(&self) -> Option<GpuProgram> {
        Some(GpuProgram {
            label: "midframe.correlation",
            source: include_str!("shaders/correlation.wgsl"),
            inputs: 2,
        })
    }
}

fn zero_pad(tensor: &Tensor) -> Array3<f32> {
    let (w, h, c) = (tensor.width(), tensor.height(), tensor.channels());
    let mut padded = Array3::zeros((c, h + 2 * RADIUS, w + 2 * RADIUS));
    padded
        .slice_mut(s![.., RADIUS..RADIUS + h, RADIUS..RADIUS + w])
        .assign(&tensor.view());
    padded
}

fn correlate(a: &Tensor, b: &Tensor, output: Shape) -> Tensor {
    let (w, h, c) = (a.width(), a.height(), a.channels());
    let a_pad = zero_pad(a);
    let b_pad = zero_pad(b);
    let norm = 1.0 / c as f32;

    let mut out = Tensor::zeros(output);
    out.as_slice_mut()
        .par_chunks_mut(w * h)
        .enumerate()
        .for_each(|(t, dst)| {
            let tx = t % WINDOW;
            let ty = t / WINDOW;
            for q in 0..c {
                let a_plane = a_pad.slice(s![q, .., ..]);
                let b_plane = b_pad.slice(s![q, .., ..]);
                for y in 0..h {
                    let row = &mut dst[y * w..(y + 1) * w];
                    for (x, acc) in row.iter_mut().enumerate() {
                        *acc += a_plane[[y + RADIUS, x + RADIUS]] * b_plane[[y + ty, x + tx]];
                    }
                }
            }
            dst.iter_mut().for_each(|v| *v *= norm);
        });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InterpolationError;

    fn features(w: usize, h: usize, c: usize, seed: usize) -> Tensor {
        Tensor::from_shape_fn(Shape::new(w, h, c), |q, y, x| {
            (((q + 1) * 31 + y * 17 + x * 7 + seed * 13) % 23) as f32 / 11.0 - 1.0
        })
    }

    #[test]
    fn test_output_has_81_channels() {
        let a = features(12, 9, 4, 0);
        let out = Correlation.forward_cpu(&[&a, &a]).unwrap();
        assert_eq!(out.shape(), Shape::new(12, 9, DISPLACEMENTS));
    }

    #[test]
    fn test_center_channel_is_unshifted_mean() {
        let a = features(10, 7, 3, 1);
        let b = features(10, 7, 3, 2);
        let out = Correlation.forward_cpu(&[&a, &b]).unwrap();
        for y in 0..7 {
            for x in 0..10 {
                let expected: f32 = (0..3).map(|q| a.get(q, y, x) * b.get(q, y, x)).sum::<f32>() / 3.0;
                assert!((out.get(CENTER_CHANNEL, y, x) - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_zero_inputs_give_zero_volume() {
        let zero = Tensor::zeros(Shape::new(8, 8, 5));
        let out = Correlation.forward_cpu(&[&zero, &zero]).unwrap();
        assert!(out.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_self_correlation_center_is_nonnegative() {
        let a = features(9, 6, 4, 3);
        let out = Correlation.forward_cpu(&[&a, &a]).unwrap();
        assert!(out.plane(CENTER_CHANNEL).iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_displacement_reads_shifted_neighbour() {
        let a = features(11, 11, 2, 4);
        let b = features(11, 11, 2, 5);
        let out = Correlation.forward_cpu(&[&a, &b]).unwrap();
        // tx = 6, ty = 1 -> offset (+2, -3)
        let t = WINDOW + 6;
        let (x, y) = (5, 6);
        let expected: f32 = (0..2).map(|q| a.get(q, y, x) * b.get(q, y - 3, x + 2)).sum::<f32>() / 2.0;
        assert!((out.get(t, y, x) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_out_of_image_displacement_is_zero() {
        let a = features(6, 6, 2, 6);
        let out = Correlation.forward_cpu(&[&a, &a]).unwrap();
        // channel 0 looks 4 pixels up and left
        assert_eq!(out.get(0, 0, 0), 0.0);
        assert_eq!(out.get(0, 3, 3), 0.0);
        assert_ne!(out.get(0, 5, 5), 0.0);
    }

    #[test]
    fn test_mismatched_inputs_rejected() {
        let a = features(6, 6, 2, 0);
        let b = features(6, 5, 2, 0);
        let c = features(6, 6, 3, 0);
        assert!(matches!(
            Correlation.forward_cpu(&[&a, &b]),
            Err(InterpolationError::ShapeMismatch { .. })
        ));
        assert!(Correlation.forward_cpu(&[&a, &c]).is_err());
        assert!(Correlation.forward_cpu(&[&a]).is_err());
    }
}
