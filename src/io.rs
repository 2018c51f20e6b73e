// io.rs — Image file loading and saving via the `image` crate.
//
// Anything with colour becomes a 3-plane RGB image (alpha is dropped);
// grayscale sources become a single plane.

use std::path::Path;

use crate::error::{HistEqError, Result};
use crate::image::Image;

/// Load any format the `image` crate was built with.
pub fn load_image(path: impl AsRef<Path>) -> Result<Image> {
    let path = path.as_ref();
    let load_err = |reason: String| HistEqError::Load { path: path.to_path_buf(), reason };

    let img = image::open(path).map_err(|e| load_err(e.to_string()))?;
    let (w, h) = (img.width() as usize, img.height() as usize);
    if w == 0 || h == 0 {
        return Err(load_err("image has no pixels".to_string()));
    }

    if img.color().has_color() {
        let rgb = img.to_rgb8();
        Image::from_interleaved(w, h, 3, rgb.as_raw())
    } else {
        let gray = img.to_luma8();
        Image::from_interleaved(w, h, 1, gray.as_raw())
    }
}

/// Write an image; the format follows the file extension.
pub fn save_image(path: impl AsRef<Path>, image: &Image) -> Result<()> {
    let path = path.as_ref();
    let save_err = |reason: String| HistEqError::Save { path: path.to_path_buf(), reason };

    let (w, h) = (image.width() as u32, image.height() as u32);
    let data = image.to_interleaved();
    let result = if image.is_color() {
        image::RgbImage::from_raw(w, h, data)
            .ok_or_else(|| save_err("pixel buffer size mismatch".to_string()))?
            .save(path)
    } else {
        image::GrayImage::from_raw(w, h, data)
            .ok_or_else(|| save_err("pixel buffer size mismatch".to_string()))?
            .save(path)
    };
    result.map_err(|e| save_err(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Plane;

    #[test]
    fn test_missing_file_is_load_error() {
        let err = load_image("/nonexistent/definitely-missing.ppm").unwrap_err();
        assert!(matches!(err, HistEqError::Load { .. }));
        assert!(err.to_string().contains("definitely-missing.ppm"));
    }

    #[test]
    fn test_save_and_reload_color() {
        let path = std::env::temp_dir().join(format!("gpu_histeq_io_{}.ppm", std::process::id()));
        let img = Image::from_interleaved(2, 2, 3, &[10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110, 120])
            .unwrap();
        save_image(&path, &img).unwrap();
        let back = load_image(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(back, img);
    }

    #[test]
    fn test_save_and_reload_gray() {
        let path = std::env::temp_dir().join(format!("gpu_histeq_io_{}.png", std::process::id()));
        let img = Image::gray(Plane::from_vec(3, 1, vec![0, 128, 255]));
        save_image(&path, &img).unwrap();
        let back = load_image(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(back.channels(), 1);
        assert_eq!(back, img);
    }
}
