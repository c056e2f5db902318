use crate::error::{InterpolationError, Result};
use crate::tensor::{Shape, Tensor};

/// Interleaved 8-bit RGB image, the unit passed in and out of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let frame = Self {
            width,
            height,
            data,
        };
        frame.check_buffer()?;
        Ok(frame)
    }

    /// The fields are public, so frames built by hand are re-checked here
    /// before any conversion indexes into `data`.
    pub fn check_buffer(&self) -> Result<()> {
        let (width, height) = (self.width, self.height);
        if width == 0 || height == 0 {
            return Err(InterpolationError::shape(
                "frame extent",
                "non-empty frame",
                format!("{width}x{height}"),
            ));
        }
        let expected = width as usize * height as usize * 3;
        if self.data.len() != expected {
            return Err(InterpolationError::shape(
                "frame buffer",
                format!("{expected} bytes ({width}x{height}x3)"),
                format!("{} bytes", self.data.len()),
            ));
        }
        Ok(())
    }

    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self {
            width,
            height,
            data,
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        [
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ]
    }

    pub fn same_extent(&self, other: &Frame) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Planar BGR tensor normalised to `[0, 1]`, the layout the networks consume.
    pub fn to_bgr_tensor(&self) -> Tensor {
        let w = self.width as usize;
        let h = self.height as usize;
        let hw = w * h;
        let mut tensor = Tensor::zeros(Shape::new(w, h, 3));
        let planes = tensor.as_slice_mut();

        for (i, px) in self.data.chunks_exact(3).enumerate() {
            planes[i] = px[2] as f32 / 255.0;
            planes[hw + i] = px[1] as f32 / 255.0;
            planes[2 * hw + i] = px[0] as f32 / 255.0;
        }
        tensor
    }

    /// Inverse of [`Frame::to_bgr_tensor`]: scale by 255, round, clamp, swap back to RGB.
    pub fn from_bgr_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.shape();
        if shape.channels != 3 {
            return Err(InterpolationError::shape(
                "output frame",
                "3 channels",
                format!("{} channels", shape.channels),
            ));
        }
        let hw = shape.plane();
        let planes = tensor.as_slice();
        let b_plane = &planes[..hw];
        let g_plane = &planes[hw..2 * hw];
        let r_plane = &planes[2 * hw..3 * hw];

        let mut rgb = vec![0u8; hw * 3];

        const CHUNK: usize = 4096;

        let mut offset = 0;
        while offset < hw {
            let len = CHUNK.min(hw - offset);
            let r_chunk = &r_plane[offset..offset + len];
            let g_chunk = &g_plane[offset..offset + len];
            let b_chunk = &b_plane[offset..offset + len];
            let dst = &mut rgb[offset * 3..(offset + len) * 3];

            for j in 0..len {
                dst[j * 3] = to_u8(r_chunk[j]);
                dst[j * 3 + 1] = to_u8(g_chunk[j]);
                dst[j * 3 + 2] = to_u8(b_chunk[j]);
            }

            offset += len;
        }

        Frame::new(shape.width as u32, shape.height as u32, rgb)
    }
}

fn to_u8(value: f32) -> u8 {
    (value * 255.0 + 0.5).clamp(0.0, 255.0) as u8
}
