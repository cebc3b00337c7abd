use fast_image_resize::images::Image as FirImage;
use fast_image_resize::{
    FilterType as FirFilterType, PixelType as FirPixelType, ResizeAlg as FirResizeAlg,
    ResizeOptions as FirResizeOptions, Resizer as FirResizer,
};
use zune_jpeg::zune_core::bytestream::ZCursor;
use zune_jpeg::JpegDecoder;

use imgstream_core::error::FetchError;
use imgstream_core::types::Image;

fn looks_like_jpeg(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] == 0xD8
}

fn decode_rgb_with_image(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32), FetchError> {
    let decoded =
        ::image::load_from_memory(bytes).map_err(|e| FetchError::Decode(e.to_string()))?;
    let rgb = decoded.to_rgb8();
    let width = rgb.width();
    let height = rgb.height();
    Ok((rgb.into_raw(), width, height))
}

fn decode_jpeg_rgb_with_zune(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32), FetchError> {
    let cursor = ZCursor::new(bytes);
    let mut decoder = JpegDecoder::new(cursor);
    let pixels = decoder
        .decode()
        .map_err(|e| FetchError::Decode(format!("zune: {e}")))?;
    let info = decoder
        .info()
        .ok_or_else(|| FetchError::Decode("zune: missing image info".to_string()))?;
    let width = u32::from(info.width);
    let height = u32::from(info.height);
    let expected_len = (width as usize)
        .checked_mul(height as usize)
        .and_then(|px| px.checked_mul(3))
        .ok_or_else(|| FetchError::Decode("zune: decoded shape overflow".to_string()))?;
    if pixels.len() != expected_len {
        return Err(FetchError::Decode(format!(
            "zune: unexpected channel count (len={}, expected_rgb_len={expected_len})",
            pixels.len()
        )));
    }
    Ok((pixels, width, height))
}

/// Decodes an encoded image payload into packed RGB and resizes it to `height x width`.
///
/// JPEG payloads go through zune-jpeg first and fall back to the `image` crate when the
/// fast path rejects them (progressive CMYK, odd channel layouts).
pub fn decode_and_resize(bytes: &[u8], height: u32, width: u32) -> Result<Image, FetchError> {
    if bytes.is_empty() {
        return Err(FetchError::Decode("empty payload".to_string()));
    }

    let (raw_rgb, src_w, src_h) = if looks_like_jpeg(bytes) {
        match decode_jpeg_rgb_with_zune(bytes) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::trace!(error = %err, "zune decode rejected payload; falling back");
                decode_rgb_with_image(bytes)?
            }
        }
    } else {
        decode_rgb_with_image(bytes)?
    };

    if src_w == 0 || src_h == 0 {
        return Err(FetchError::Decode(format!(
            "decoded image has no pixels ({src_h}x{src_w})"
        )));
    }

    let pixels = if src_w == width && src_h == height {
        raw_rgb
    } else {
        let src_image = FirImage::from_vec_u8(src_w, src_h, raw_rgb, FirPixelType::U8x3)
            .map_err(|e| FetchError::Resize(format!("source init: {e}")))?;
        let mut dst_image = FirImage::new(width, height, FirPixelType::U8x3);
        let mut resizer = FirResizer::new();
        let options =
            FirResizeOptions::new().resize_alg(FirResizeAlg::Convolution(FirFilterType::Bilinear));
        resizer
            .resize(&src_image, &mut dst_image, &options)
            .map_err(|e| FetchError::Resize(e.to_string()))?;
        dst_image.into_vec()
    };

    Image::from_rgb(height, width, pixels).map_err(|e| FetchError::Resize(e.to_string()))
}
