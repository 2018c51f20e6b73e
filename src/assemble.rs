// assemble.rs — Rebuild a display-ready image from the processed plane.

use crate::color::{self, ChromaPlanes};
use crate::error::{HistEqError, Result};
use crate::image::{Image, ImageShape, Plane};

/// Combine the equalized luminance with the chroma set aside by `split`.
///
/// Grayscale input (no chroma) is wrapped as-is. The result always has
/// the width, height and channel count recorded in `shape`.
pub fn assemble(luminance: Plane, chroma: Option<ChromaPlanes>, shape: ImageShape) -> Result<Image> {
    if luminance.width() != shape.width || luminance.height() != shape.height {
        return Err(HistEqError::InvalidDimensions {
            plane: "luminance",
            expected_width: shape.width,
            expected_height: shape.height,
            found_width: luminance.width(),
            found_height: luminance.height(),
        });
    }

    let image = match chroma {
        None => Image::gray(luminance),
        Some(ChromaPlanes { cb, cr }) => color::recombine(&luminance, &cb, &cr)?,
    };

    if image.channels() != shape.channels {
        return Err(HistEqError::ChannelMismatch { expected: shape.channels, found: image.channels() });
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::split;

    #[test]
    fn test_gray_wraps_plane() {
        let plane = Plane::from_vec(2, 1, vec![10, 20]);
        let shape = ImageShape { width: 2, height: 1, channels: 1 };
        let img = assemble(plane.clone(), None, shape).unwrap();
        assert_eq!(img.shape(), shape);
        assert_eq!(img.plane(0), &plane);
    }

    #[test]
    fn test_color_restores_channels() {
        let img = Image::from_interleaved(2, 1, 3, &[255, 0, 0, 0, 0, 255]).unwrap();
        let s = split(img.clone());
        let out = assemble(s.luminance, s.chroma, s.shape).unwrap();
        assert_eq!(out.shape(), img.shape());
        for (a, b) in out.to_interleaved().iter().zip(img.to_interleaved()) {
            assert!(a.abs_diff(b) <= 1);
        }
    }

    #[test]
    fn test_rejects_resized_luminance() {
        let shape = ImageShape { width: 4, height: 4, channels: 1 };
        let err = assemble(Plane::new(4, 2), None, shape).unwrap_err();
        assert!(matches!(err, HistEqError::InvalidDimensions { plane: "luminance", .. }));
    }

    #[test]
    fn test_missing_chroma_is_channel_mismatch() {
        // a colour shape but no chroma planes to rebuild it from
        let shape = ImageShape { width: 2, height: 2, channels: 3 };
        let err = assemble(Plane::new(2, 2), None, shape).unwrap_err();
        assert_eq!(err.to_string(), "assembled image has 1 channel(s), expected 3");
        assert!(matches!(err, HistEqError::ChannelMismatch { expected: 3, found: 1 }));
    }
}
