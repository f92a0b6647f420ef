use thiserror::Error;
use v4l2sink::{Format, PixelFormat};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NewFrameGeneratorError {
    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(PixelFormat),
    #[error("invalid stride {stride} for a line of {width} pixels")]
    InvalidStride { stride: usize, width: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenerateFrameError {
    #[error("provided buffer is too small ({0} bytes)")]
    BufferTooSmall(usize),
}

/// Layout of the pixels a generator can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Packing {
    /// 4:2:2 YUV, two pixels per 4-byte macropixel, luma at `luma_offset`
    /// and `luma_offset + 2`.
    Yuv422 { luma_offset: usize },
    /// 24 bits per pixel RGB.
    Rgb24,
}

impl Packing {
    fn from_pixelformat(pixelformat: PixelFormat) -> Option<Self> {
        match &pixelformat.to_fourcc() {
            b"UYVY" | b"VYUY" => Some(Packing::Yuv422 { luma_offset: 1 }),
            b"YUYV" | b"YVYU" => Some(Packing::Yuv422 { luma_offset: 0 }),
            b"RGB3" | b"BGR3" => Some(Packing::Rgb24),
            _ => None,
        }
    }

    fn bytes_per_pixel(self) -> usize {
        match self {
            Packing::Yuv422 { .. } => 2,
            Packing::Rgb24 => 3,
        }
    }
}

/// Produces a moving test pattern into frames of a packed pixel format.
pub struct FrameGenerator {
    width: usize,
    height: usize,
    stride: usize,
    packing: Packing,
    step: u32,
}

impl FrameGenerator {
    /// Create a generator for frames of `format`. A `bytesperline` of 0 means
    /// lines are tightly packed.
    pub fn new(format: &Format) -> Result<Self, NewFrameGeneratorError> {
        let packing = Packing::from_pixelformat(format.pixelformat)
            .ok_or(NewFrameGeneratorError::UnsupportedFormat(format.pixelformat))?;
        let width = format.width as usize;
        let min_stride = width * packing.bytes_per_pixel();
        let stride = match format.bytesperline as usize {
            0 => min_stride,
            stride => stride,
        };
        if stride < min_stride {
            return Err(NewFrameGeneratorError::InvalidStride { stride, width });
        }

        Ok(FrameGenerator {
            width,
            height: format.height as usize,
            stride,
            packing,
            step: 0,
        })
    }

    pub fn frame_size(&self) -> usize {
        self.stride * self.height
    }

    /// Write the next frame of the pattern into `frame`.
    pub fn next_frame<S: AsMut<[u8]> + ?Sized>(
        &mut self,
        frame: &mut S,
    ) -> Result<(), GenerateFrameError> {
        let frame = frame.as_mut();

        if frame.len() < self.frame_size() {
            return Err(GenerateFrameError::BufferTooSmall(frame.len()));
        }

        self.gen_pattern(frame);
        self.step = self.step.wrapping_add(1);

        Ok(())
    }

    fn gen_pattern(&self, frame: &mut [u8]) {
        let line_len = self.width * self.packing.bytes_per_pixel();
        let step = self.step;

        frame
            .chunks_exact_mut(self.stride)
            .take(self.height)
            .map(|l| &mut l[0..line_len])
            .enumerate()
            .for_each(|(y, line)| match self.packing {
                Packing::Yuv422 { luma_offset } => {
                    line.chunks_exact_mut(4).enumerate().for_each(|(x, macropixel)| {
                        let luma = step.wrapping_add((x ^ y) as u32) as u8;
                        macropixel.fill(0x80);
                        macropixel[luma_offset] = luma;
                        macropixel[luma_offset + 2] = luma;
                    });
                }
                Packing::Rgb24 => {
                    line.chunks_exact_mut(3).enumerate().for_each(|(x, pixel)| {
                        let rgba = step.wrapping_add((x ^ y) as u32).to_le_bytes();
                        pixel.copy_from_slice(&rgba[0..3]);
                    });
                }
            });
    }
}
