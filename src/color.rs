// color.rs — RGB ↔ YCbCr plane conversion for colour equalization.
//
// Colour images are equalized on luminance only: equalizing R, G and B
// independently shifts hues. The image is split into Y, Cb, Cr planes, the
// Y plane goes through the device pipeline, and the result is recombined
// with the untouched chroma planes.
//
// Coefficients are full-range ITU-R BT.601 (the JFIF variant):
//
//   Y  =       0.299    R + 0.587    G + 0.114    B
//   Cb = 128 - 0.168736 R - 0.331264 G + 0.5      B
//   Cr = 128 + 0.5      R - 0.418688 G - 0.081312 B
//
//   R = Y + 1.402    (Cr - 128)
//   G = Y - 0.344136 (Cb - 128) - 0.714136 (Cr - 128)
//   B = Y + 1.772    (Cb - 128)
//
// All three planes use the full 0..=255 range, so split → recombine
// without equalization reproduces every RGB triple to within ±1.
//
// OWNERSHIP
// ─────────
// `split` consumes the image. The planes it returns are owned by the
// caller (luminance goes to the pipeline, chroma waits in `SplitImage`)
// and nothing aliases the original channel storage.

use crate::error::{HistEqError, Result};
use crate::image::{Image, ImageShape, Plane};

/// The two colour-difference planes of a split colour image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChromaPlanes {
    pub cb: Plane,
    pub cr: Plane,
}

/// Output of [`split`]: a luminance plane, chroma if the source had
/// colour, and the source shape for reassembly.
#[derive(Debug, Clone)]
pub struct SplitImage {
    pub luminance: Plane,
    pub chroma: Option<ChromaPlanes>,
    pub shape: ImageShape,
}

impl SplitImage {
    pub fn is_color(&self) -> bool {
        self.chroma.is_some()
    }
}

// ---------------------------------------------------------------------------
// Per-pixel transforms
// ---------------------------------------------------------------------------

#[inline]
fn to_level(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Convert one RGB triple to (Y, Cb, Cr).
#[inline]
pub fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = 128.0 - 0.168736 * r - 0.331264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418688 * g - 0.081312 * b;
    (to_level(y), to_level(cb), to_level(cr))
}

/// Convert one (Y, Cb, Cr) triple back to RGB.
#[inline]
pub fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> (u8, u8, u8) {
    let y = y as f32;
    let cb = cb as f32 - 128.0;
    let cr = cr as f32 - 128.0;
    let r = y + 1.402 * cr;
    let g = y - 0.344136 * cb - 0.714136 * cr;
    let b = y + 1.772 * cb;
    (to_level(r), to_level(g), to_level(b))
}

// ---------------------------------------------------------------------------
// Plane-level split / recombine
// ---------------------------------------------------------------------------

/// Split an image into luminance (plus chroma for 3-channel input).
///
/// A 1-channel image is passed through unchanged as the luminance plane.
pub fn split(image: Image) -> SplitImage {
    let shape = image.shape();
    let mut planes = image.into_planes();
    if planes.len() == 1 {
        let luminance = planes.remove(0);
        return SplitImage { luminance, chroma: None, shape };
    }

    let (w, h) = (shape.width, shape.height);
    let mut y_plane = Plane::new(w, h);
    let mut cb_plane = Plane::new(w, h);
    let mut cr_plane = Plane::new(w, h);

    for row in 0..h {
        let (r, g, b) = (planes[0].row(row), planes[1].row(row), planes[2].row(row));
        for x in 0..w {
            let (yv, cbv, crv) = rgb_to_ycbcr(r[x], g[x], b[x]);
            y_plane.set(x, row, yv);
            cb_plane.set(x, row, cbv);
            cr_plane.set(x, row, crv);
        }
    }

    SplitImage {
        luminance: y_plane,
        chroma: Some(ChromaPlanes { cb: cb_plane, cr: cr_plane }),
        shape,
    }
}

/// Inverse of [`split`] for colour images.
///
/// # Errors
/// `InvalidDimensions` if either chroma plane differs in size from the
/// luminance plane. Nothing is cropped or resized.
pub fn recombine(luminance: &Plane, cb: &Plane, cr: &Plane) -> Result<Image> {
    for (name, plane) in [("Cb", cb), ("Cr", cr)] {
        if !plane.same_size(luminance) {
            return Err(HistEqError::InvalidDimensions {
                plane: name,
                expected_width: luminance.width(),
                expected_height: luminance.height(),
                found_width: plane.width(),
                found_height: plane.height(),
            });
        }
    }

    let (w, h) = (luminance.width(), luminance.height());
    let mut r_plane = Plane::new(w, h);
    let mut g_plane = Plane::new(w, h);
    let mut b_plane = Plane::new(w, h);

    for row in 0..h {
        let (y, u, v) = (luminance.row(row), cb.row(row), cr.row(row));
        for x in 0..w {
            let (r, g, b) = ycbcr_to_rgb(y[x], u[x], v[x]);
            r_plane.set(x, row, r);
            g_plane.set(x, row, g);
            b_plane.set(x, row, b);
        }
    }

    Image::rgb(r_plane, g_plane, b_plane)
}
