//! Captured frames and their conversion to model input.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};

use crate::engine::FrameGeometry;
use crate::error::FrameError;

/// Channel layout of a captured frame. Camera capture usually yields BGR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Bgr8,
    Rgb8,
    Gray8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Bgr8 | PixelFormat::Rgb8 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// A tightly packed 8-bit image of arbitrary size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty);
        }
        let expected = width as usize * height as usize * format.channels();
        if data.len() != expected {
            return Err(FrameError::BufferSize {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    /// Uniformly coloured BGR frame.
    pub fn solid_bgr(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let data = bgr
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self {
            width,
            height,
            format: PixelFormat::Bgr8,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn to_rgb(&self) -> RgbImage {
        let rgb = match self.format {
            PixelFormat::Rgb8 => RgbImage::from_raw(self.width, self.height, self.data.clone()),
            PixelFormat::Bgr8 => {
                let mut swapped = self.data.clone();
                for px in swapped.chunks_exact_mut(3) {
                    px.swap(0, 2);
                }
                RgbImage::from_raw(self.width, self.height, swapped)
            }
            PixelFormat::Gray8 => GrayImage::from_raw(self.width, self.height, self.data.clone())
                .map(|gray| image::DynamicImage::ImageLuma8(gray).to_rgb8()),
        };
        // Buffer length was validated in `new`
        rgb.unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }
}

/// Convert a frame to contiguous RGB bytes of exactly `geometry`, resizing
/// with nearest-neighbour sampling when the size differs.
pub fn prepare(frame: &Frame, geometry: FrameGeometry) -> Vec<u8> {
    let rgb = frame.to_rgb();
    if rgb.width() == geometry.width && rgb.height() == geometry.height {
        return rgb.into_raw();
    }
    imageops::resize(&rgb, geometry.width, geometry.height, FilterType::Nearest).into_raw()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_wrong_buffer_size() {
        let err = Frame::new(2, 2, PixelFormat::Bgr8, vec![0; 5]).unwrap_err();
        assert_eq!(
            err,
            FrameError::BufferSize {
                width: 2,
                height: 2,
                expected: 12,
                actual: 5
            }
        );
        assert_eq!(
            Frame::new(0, 4, PixelFormat::Gray8, vec![]).unwrap_err(),
            FrameError::Empty
        );
    }

    #[test]
    fn test_bgr_is_swapped_to_rgb() {
        let frame = Frame::solid_bgr(2, 1, [10, 20, 30]);
        let out = prepare(&frame, FrameGeometry::new(1, 2));
        assert_eq!(out, vec![30, 20, 10, 30, 20, 10]);
    }

    #[test]
    fn test_resizes_to_model_geometry() {
        let frame = Frame::solid_bgr(640, 480, [1, 2, 3]);
        let geometry = FrameGeometry::new(336, 336);
        let out = prepare(&frame, geometry);
        assert_eq!(out.len(), geometry.frame_size());
        assert_eq!(&out[..3], &[3, 2, 1]);
    }

    #[test]
    fn test_gray_expands_to_three_channels() {
        let frame = Frame::new(2, 2, PixelFormat::Gray8, vec![7; 4]).unwrap();
        let out = prepare(&frame, FrameGeometry::new(2, 2));
        assert_eq!(out, vec![7; 12]);
    }
}
