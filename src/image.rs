// image.rs — 8-bit planes and planar 1- or 3-channel images.
//
// A `Plane` is one channel: a row-major grid of u8 intensities. Like the
// device-side layout it may carry a row stride larger than its width; the
// padding is never part of the image and is stripped whenever the plane is
// handed to a device (see `DeviceBufferSet::upload_plane`).
//
// Memory layout (stride = 5, width = 4):
//
//   data index:  0  1  2  3 [4]  5  6  7  8 [9] 10 11 12 13 [14]
//   pixel:       ■  ■  ■  ■  ·   ■  ■  ■  ■  ·   ■  ■  ■  ■  ·
//   row:         |--- row 0 ---|  |--- row 1 ---|  |--- row 2 ---|
//
// An `Image` owns one plane per channel (planar, like the loader hands it
// to us). Channel count is always 1 (grayscale) or 3 (RGB); every plane
// has the same width and height.

use std::fmt;

use crate::error::{HistEqError, Result};

// ---------------------------------------------------------------------------
// Plane
// ---------------------------------------------------------------------------

/// A single-channel 8-bit intensity grid, row-major, with explicit stride.
#[derive(Clone, PartialEq, Eq)]
pub struct Plane {
    /// Pixel data in row-major order. Length = height * stride.
    data: Vec<u8>,
    width: usize,
    height: usize,
    /// Row stride in bytes. stride >= width.
    stride: usize,
}

impl Plane {
    /// Create a zero-initialized plane. Stride equals width.
    pub fn new(width: usize, height: usize) -> Self {
        Self::new_with_stride(width, height, width)
    }

    /// Create a zero-initialized plane with an explicit stride.
    ///
    /// # Panics
    /// Panics if `stride < width`.
    pub fn new_with_stride(width: usize, height: usize, stride: usize) -> Self {
        assert!(stride >= width, "stride ({stride}) must be >= width ({width})");
        Plane { data: vec![0; height * stride], width, height, stride }
    }

    /// Create a plane filled with a single value.
    pub fn filled(width: usize, height: usize, value: u8) -> Self {
        Plane { data: vec![value; width * height], width, height, stride: width }
    }

    /// Wrap an existing pixel vector with no row padding.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<u8>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        Plane { data, width, height, stride: width }
    }

    /// Wrap raw data with explicit stride.
    ///
    /// # Panics
    /// Panics if `data.len() != height * stride` or `stride < width`.
    pub fn from_vec_with_stride(width: usize, height: usize, stride: usize, data: Vec<u8>) -> Self {
        assert!(stride >= width, "stride ({stride}) must be >= width ({width})");
        assert_eq!(
            data.len(),
            height * stride,
            "data length ({}) must equal height * stride ({})",
            data.len(),
            height * stride,
        );
        Plane { data, width, height, stride }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of pixels (width * height, padding excluded).
    #[inline]
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Size in bytes of the compacted plane, i.e. what a device buffer holds.
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.pixel_count()
    }

    /// True when both planes have the same width and height.
    pub fn same_size(&self, other: &Plane) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Get the pixel value at (x, y).
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.bounds_check(x, y);
        self.data[y * self.stride + x]
    }

    #[inline]
    pub fn get_mut(&mut self, x: usize, y: usize) -> &mut u8 {
        self.bounds_check(x, y);
        let idx = y * self.stride + x;
        &mut self.data[idx]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: u8) {
        *self.get_mut(x, y) = value;
    }

    /// Borrow a single row (padding excluded).
    #[inline]
    pub fn row(&self, y: usize) -> &[u8] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.stride;
        &self.data[start..start + self.width]
    }

    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.stride;
        &mut self.data[start..start + self.width]
    }

    /// Iterate over all pixels in row-major order, skipping stride padding.
    pub fn pixels(&self) -> impl Iterator<Item = u8> + '_ {
        (0..self.height).flat_map(move |y| self.row(y).iter().copied())
    }

    /// The underlying buffer, stride padding included.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Total number of bytes in the buffer (including stride padding).
    pub fn buffer_len(&self) -> usize {
        self.data.len()
    }

    /// Return the pixels as one contiguous row-major vector (stride == width).
    pub fn to_contiguous(&self) -> Vec<u8> {
        if self.stride == self.width {
            return self.data.clone();
        }
        let mut out = Vec::with_capacity(self.pixel_count());
        for y in 0..self.height {
            out.extend_from_slice(self.row(y));
        }
        out
    }

    /// Consume the plane and return contiguous row-major pixels.
    pub fn into_contiguous(self) -> Vec<u8> {
        if self.stride == self.width {
            self.data
        } else {
            self.to_contiguous()
        }
    }

    #[inline]
    fn bounds_check(&self, x: usize, y: usize) {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for plane {}×{}",
            self.width,
            self.height,
        );
    }
}

impl fmt::Debug for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Plane {{ {}×{}, stride={} }}", self.width, self.height, self.stride)?;
        for y in 0..self.height.min(8) {
            write!(f, "  row {y}: [")?;
            for x in 0..self.width.min(16) {
                if x > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", self.get(x, y))?;
            }
            if self.width > 16 {
                write!(f, ", ...")?;
            }
            writeln!(f, "]")?;
        }
        if self.height > 8 {
            writeln!(f, "  ...")?;
        }
        Ok(())
    }
}

impl std::ops::Index<(usize, usize)> for Plane {
    type Output = u8;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &u8 {
        self.bounds_check(x, y);
        &self.data[y * self.stride + x]
    }
}

impl std::ops::IndexMut<(usize, usize)> for Plane {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut u8 {
        self.bounds_check(x, y);
        let idx = y * self.stride + x;
        &mut self.data[idx]
    }
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

/// Width, height and channel count of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageShape {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

impl fmt::Display for ImageShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}×{}", self.width, self.height, self.channels)
    }
}

/// A planar 8-bit image with 1 (grayscale) or 3 (RGB) channels.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    planes: Vec<Plane>,
}

impl Image {
    /// A single-channel image.
    pub fn gray(plane: Plane) -> Self {
        Image { planes: vec![plane] }
    }

    /// A three-channel RGB image. All planes must match the red plane's size.
    pub fn rgb(r: Plane, g: Plane, b: Plane) -> Result<Self> {
        Self::from_planes(vec![r, g, b])
    }

    /// Build an image from 1 or 3 equally sized planes.
    pub fn from_planes(planes: Vec<Plane>) -> Result<Self> {
        if planes.len() != 1 && planes.len() != 3 {
            return Err(HistEqError::UnsupportedChannels(planes.len()));
        }
        let (w, h) = (planes[0].width(), planes[0].height());
        for (i, p) in planes.iter().enumerate().skip(1) {
            if !p.same_size(&planes[0]) {
                return Err(HistEqError::InvalidDimensions {
                    plane: CHANNEL_NAMES[i],
                    expected_width: w,
                    expected_height: h,
                    found_width: p.width(),
                    found_height: p.height(),
                });
            }
        }
        Ok(Image { planes })
    }

    /// Build an image from interleaved samples (`RGBRGB...` or `YYY...`).
    ///
    /// # Errors
    /// `UnsupportedChannels` unless `channels` is 1 or 3; `SampleCount` if
    /// `data.len() != width * height * channels`.
    pub fn from_interleaved(width: usize, height: usize, channels: usize, data: &[u8]) -> Result<Self> {
        if channels != 1 && channels != 3 {
            return Err(HistEqError::UnsupportedChannels(channels));
        }
        let expected = width * height * channels;
        if data.len() != expected {
            return Err(HistEqError::SampleCount { width, height, channels, expected, found: data.len() });
        }
        if channels == 1 {
            return Ok(Image::gray(Plane::from_vec(width, height, data.to_vec())));
        }
        let n = width * height;
        let mut planes = [vec![0u8; n], vec![0u8; n], vec![0u8; n]];
        for (i, px) in data.chunks_exact(3).enumerate() {
            planes[0][i] = px[0];
            planes[1][i] = px[1];
            planes[2][i] = px[2];
        }
        let [r, g, b] = planes;
        Image::rgb(
            Plane::from_vec(width, height, r),
            Plane::from_vec(width, height, g),
            Plane::from_vec(width, height, b),
        )
    }

    /// Interleave the planes back into `RGBRGB...` (or a copy of the gray plane).
    pub fn to_interleaved(&self) -> Vec<u8> {
        if self.planes.len() == 1 {
            return self.planes[0].to_contiguous();
        }
        let mut out = Vec::with_capacity(self.width() * self.height() * 3);
        for y in 0..self.height() {
            let (r, g, b) = (self.planes[0].row(y), self.planes[1].row(y), self.planes[2].row(y));
            for x in 0..self.width() {
                out.extend_from_slice(&[r[x], g[x], b[x]]);
            }
        }
        out
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.planes[0].width()
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.planes[0].height()
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.planes.len()
    }

    pub fn shape(&self) -> ImageShape {
        ImageShape { width: self.width(), height: self.height(), channels: self.channels() }
    }

    pub fn is_color(&self) -> bool {
        self.planes.len() == 3
    }

    /// Borrow channel `c`.
    ///
    /// # Panics
    /// Panics if `c >= channels()`.
    pub fn plane(&self, c: usize) -> &Plane {
        &self.planes[c]
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// Give up ownership of the planes (channel order preserved).
    pub fn into_planes(self) -> Vec<Plane> {
        self.planes
    }
}

const CHANNEL_NAMES: [&str; 3] = ["red", "green", "blue"];

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Image {{ {} }}", self.shape())?;
        for (c, p) in self.planes.iter().enumerate() {
            write!(f, "  channel {c}: {p:?}")?;
        }
        Ok(())
    }
}
