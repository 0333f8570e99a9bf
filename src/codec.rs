//! Conversion between encoded image bytes, 8-bit RGB rasters and the
//! normalized channel-first tensors the generator consumes.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, RgbImage, imageops::FilterType};
use tch::{Device, Kind, Tensor};

use crate::error::ServiceError;

pub const RGB_CHANNELS: i64 = 3;

/// Decode any raster format the `image` crate understands into RGB and
/// resize it to `target` (width, height) if it is not already that size.
pub fn decode_and_resize(raw: &[u8], target: (u32, u32)) -> Result<RgbImage, ServiceError> {
    let decoded = image::load_from_memory(raw).map_err(ServiceError::Decode)?;
    let rgb = decoded.to_rgb8();

    if rgb.dimensions() == target {
        return Ok(rgb);
    }

    tracing::debug!(
        from = ?rgb.dimensions(),
        to = ?target,
        "resizing input image"
    );
    Ok(image::imageops::resize(
        &rgb,
        target.0,
        target.1,
        FilterType::Lanczos3,
    ))
}

/// Map every sample `s` to `s / 127.5 - 1.0` and lay the result out as
/// `(1, 3, height, width)` float32 on the CPU.
pub fn to_tensor(image: &RgbImage) -> Tensor {
    let (width, height) = image.dimensions();
    let normalized: Vec<f32> = image
        .as_raw()
        .iter()
        .map(|&s| f32::from(s) / 127.5 - 1.0)
        .collect();

    Tensor::from_slice(&normalized)
        .reshape([i64::from(height), i64::from(width), RGB_CHANNELS])
        .permute([2, 0, 1])
        .unsqueeze(0)
        .contiguous()
}

/// Inverse of [`to_tensor`]: `clip((t + 1) / 2 * 255, 0, 255)` rounded to the
/// nearest integer. Accepts tensors on any device.
pub fn from_tensor(tensor: &Tensor) -> Result<RgbImage, ServiceError> {
    let size = tensor.size();
    let (height, width) = match size.as_slice() {
        &[1, RGB_CHANNELS, h, w] if h > 0 && w > 0 => (h, w),
        _ => {
            return Err(ServiceError::shape_mismatch(
                "(1, 3, H, W)",
                format!("{size:?}"),
            ));
        }
    };

    let (width, height) = match (u32::try_from(width), u32::try_from(height)) {
        (Ok(w), Ok(h)) => (w, h),
        _ => {
            return Err(ServiceError::shape_mismatch(
                "sides that fit in u32",
                format!("{size:?}"),
            ));
        }
    };

    let hwc = tensor
        .to_kind(Kind::Float)
        .squeeze_dim(0)
        .permute([1, 2, 0])
        .contiguous()
        .to(Device::Cpu)
        .reshape([-1]);
    let values = Vec::<f32>::try_from(&hwc)?;
    let samples: Vec<u8> = values.into_iter().map(denormalize).collect();

    RgbImage::from_raw(width, height, samples).ok_or_else(|| {
        ServiceError::shape_mismatch(
            format!("{} samples", width as usize * height as usize * 3),
            "short sample buffer",
        )
    })
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, ServiceError> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(ServiceError::Encode)?;
    Ok(buffer.into_inner())
}

#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn denormalize(value: f32) -> u8 {
    ((value + 1.0) / 2.0 * 255.0).clamp(0.0, 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbaImage};

    fn png_bytes(image: DynamicImage) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Png).unwrap();
        buffer.into_inner()
    }

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn denormalize_clamps_and_rounds() {
        assert_eq!(denormalize(-1.0), 0);
        assert_eq!(denormalize(0.0), 128);
        assert_eq!(denormalize(1.0), 255);
        assert_eq!(denormalize(-3.0), 0);
        assert_eq!(denormalize(7.5), 255);
    }

    #[test]
    fn arbitrary_inputs_become_256_square_tensors_in_range() {
        for (w, h) in [(17, 301), (256, 256), (640, 480)] {
            let raw = png_bytes(DynamicImage::ImageRgb8(gradient(w, h)));
            let image = decode_and_resize(&raw, (256, 256)).unwrap();
            let tensor = to_tensor(&image);

            assert_eq!(tensor.size(), vec![1, 3, 256, 256]);
            assert!(tensor.min().double_value(&[]) >= -1.0);
            assert!(tensor.max().double_value(&[]) <= 1.0);
        }
    }

    #[test]
    fn alpha_is_dropped() {
        let rgba = RgbaImage::from_pixel(8, 8, image::Rgba([10, 20, 30, 0]));
        let raw = png_bytes(DynamicImage::ImageRgba8(rgba));
        let image = decode_and_resize(&raw, (8, 8)).unwrap();
        assert_eq!(image.get_pixel(3, 3), &Rgb([10, 20, 30]));
    }

    #[test]
    fn same_size_input_is_not_resampled() {
        let original = gradient(256, 256);
        let raw = png_bytes(DynamicImage::ImageRgb8(original.clone()));
        let decoded = decode_and_resize(&raw, (256, 256)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn tensor_layout_is_channel_first() {
        let mut image = RgbImage::new(4, 2);
        image.put_pixel(3, 1, Rgb([255, 0, 51]));
        let tensor = to_tensor(&image);

        assert_eq!(tensor.size(), vec![1, 3, 2, 4]);
        assert_eq!(tensor.double_value(&[0, 0, 1, 3]), 1.0);
        assert_eq!(tensor.double_value(&[0, 1, 1, 3]), -1.0);
        assert!((tensor.double_value(&[0, 2, 1, 3]) - (51.0 / 127.5 - 1.0)).abs() < 1e-6);
        assert_eq!(tensor.double_value(&[0, 0, 0, 0]), -1.0);
    }

    #[test]
    fn round_trip_reproduces_image() {
        let original = gradient(64, 32);
        let restored = from_tensor(&to_tensor(&original)).unwrap();

        assert_eq!(restored.dimensions(), original.dimensions());
        for (a, b) in original.pixels().zip(restored.pixels()) {
            for c in 0..3 {
                assert!((i16::from(a[c]) - i16::from(b[c])).abs() <= 1);
            }
        }
    }

    #[test]
    fn tensor_round_trip_stays_within_quantization_bound() {
        let tensor = Tensor::linspace(-1.0, 1.0, 3 * 16 * 16, (Kind::Float, Device::Cpu))
            .reshape([1, 3, 16, 16]);
        let image = from_tensor(&tensor).unwrap();
        let back = to_tensor(&image);

        let max_err = (&back - &tensor).abs().max().double_value(&[]);
        assert!(max_err <= 1.0 / 255.0 + 1e-6, "max error {max_err}");
    }

    #[test]
    fn from_tensor_rejects_wrong_shapes() {
        let tensor = Tensor::zeros([1, 4, 8, 8], (Kind::Float, Device::Cpu));
        assert!(matches!(
            from_tensor(&tensor),
            Err(ServiceError::ShapeMismatch { .. })
        ));

        let tensor = Tensor::zeros([3, 8, 8], (Kind::Float, Device::Cpu));
        assert!(matches!(
            from_tensor(&tensor),
            Err(ServiceError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn malformed_bytes_yield_decode_error() {
        let cases: [&[u8]; 3] = [b"", b"not an image", &[0x89, b'P', b'N', b'G', 0, 0, 0]];
        for raw in cases {
            assert!(matches!(
                decode_and_resize(raw, (256, 256)),
                Err(ServiceError::Decode(_))
            ));
        }
    }

    #[test]
    fn png_encoding_decodes_back() {
        let original = gradient(32, 16);
        let raw = encode_png(&original).unwrap();
        let decoded = image::load_from_memory_with_format(&raw, ImageFormat::Png).unwrap();
        assert_eq!(decoded.dimensions(), (32, 16));
        assert_eq!(decoded.to_rgb8(), original);
    }
}
