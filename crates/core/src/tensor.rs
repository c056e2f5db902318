//! Planar `f32` tensors exchanged between sub-networks and custom kernels.
//!
//! Storage is channel-major (`c`, `h`, `w`) and always kept in standard
//! layout so kernels can work on flat plane slices.

use std::fmt;

use ndarray::{Array3, Array4, ArrayD, ArrayView3, ArrayViewMut3, Axis, Ix4};

use crate::error::{InterpolationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

impl Shape {
    pub const fn new(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    pub fn plane(&self) -> usize {
        self.width * self.height
    }

    pub fn len(&self) -> usize {
        self.plane() * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len() * std::mem::size_of::<f32>()
    }

    pub fn with_channels(self, channels: usize) -> Self {
        Self { channels, ..self }
    }

    pub fn same_extent(&self, other: &Shape) -> bool {
        self.width == other.width && self.height == other.height
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.channels)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Array3<f32>,
}

impl Tensor {
    pub fn zeros(shape: Shape) -> Self {
        Self {
            data: Array3::zeros((shape.channels, shape.height, shape.width)),
        }
    }

    pub fn filled(shape: Shape, value: f32) -> Self {
        Self {
            data: Array3::from_elem((shape.channels, shape.height, shape.width), value),
        }
    }

    /// One-element tensor, used for scalar network inputs such as blend weights.
    pub fn scalar(value: f32) -> Self {
        Self::filled(Shape::new(1, 1, 1), value)
    }

    /// Build a tensor from a `(channel, y, x)` generator.
    pub fn from_shape_fn<F>(shape: Shape, mut f: F) -> Self
    where
        F: FnMut(usize, usize, usize) -> f32,
    {
        Self {
            data: Array3::from_shape_fn((shape.channels, shape.height, shape.width), |(c, y, x)| {
                f(c, y, x)
            }),
        }
    }

    pub fn from_vec(shape: Shape, values: Vec<f32>) -> Result<Self> {
        let actual = values.len();
        let data = Array3::from_shape_vec((shape.channels, shape.height, shape.width), values)
            .map_err(|_| InterpolationError::shape("tensor storage", shape.len(), actual))?;
        Ok(Self { data })
    }

    pub fn from_array(data: Array3<f32>) -> Self {
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        Self { data }
    }

    /// Accept a `[1, c, h, w]` array as produced by an inference session.
    pub fn from_nchw(array: ArrayD<f32>) -> Result<Self> {
        let dims = array.shape().to_vec();
        let array = array
            .into_dimensionality::<Ix4>()
            .map_err(|_| InterpolationError::shape("nchw tensor", "rank 4", format!("{dims:?}")))?;
        if array.shape()[0] != 1 {
            return Err(InterpolationError::shape(
                "nchw tensor",
                "batch 1",
                format!("batch {}", array.shape()[0]),
            ));
        }
        Ok(Self::from_array(array.index_axis_move(Axis(0), 0)))
    }

    pub fn to_nchw(&self) -> Array4<f32> {
        self.data.clone().insert_axis(Axis(0))
    }

    pub fn shape(&self) -> Shape {
        let dims = self.data.shape();
        Shape::new(dims[2], dims[1], dims[0])
    }

    pub fn width(&self) -> usize {
        self.data.shape()[2]
    }

    pub fn height(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn channels(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn get(&self, channel: usize, y: usize, x: usize) -> f32 {
        self.data[[channel, y, x]]
    }

    pub fn set(&mut self, channel: usize, y: usize, x: usize, value: f32) {
        self.data[[channel, y, x]] = value;
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    pub fn view_mut(&mut self) -> ArrayViewMut3<'_, f32> {
        self.data.view_mut()
    }

    pub fn as_slice(&self) -> &[f32] {
        self.data
            .as_slice()
            .expect("standard layout must be contiguous")
    }

    pub fn as_slice_mut(&mut self) -> &mut [f32] {
        self.data
            .as_slice_mut()
            .expect("standard layout must be contiguous")
    }

    pub fn plane(&self, channel: usize) -> &[f32] {
        let plane = self.width() * self.height();
        &self.as_slice()[channel * plane..(channel + 1) * plane]
    }

    pub fn into_array(self) -> Array3<f32> {
        self.data
    }

    pub fn ensure_shape(&self, expected: Shape, context: &str) -> Result<()> {
        let actual = self.shape();
        if actual == expected {
            Ok(())
        } else {
            Err(InterpolationError::shape(context, expected, actual))
        }
    }

    pub fn max_abs_diff(&self, other: &Tensor) -> f32 {
        self.as_slice()
            .iter()
            .zip(other.as_slice())
            .fold(0.0_f32, |acc, (a, b)| acc.max((a - b).abs()))
    }
}
