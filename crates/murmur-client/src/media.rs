//! Shrinking pictures before they are uploaded.
//!
//! Pictures are scaled down to at most [`IMAGE_MAX_WIDTH`] pixels wide,
//! keeping the aspect ratio, and re-encoded as JPEG. Other files and
//! pictures that fail to decode are sent as picked.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageResult};
use tracing::{debug, warn};

use murmur_shared::constants::{COMPRESSED_IMAGE_TYPE, IMAGE_JPEG_QUALITY, IMAGE_MAX_WIDTH};

use crate::dispatch::MediaUpload;

/// Height after scaling a `width` x `height` picture down to the maximum
/// width.
pub fn scaled_height(width: u32, height: u32) -> u32 {
    let scaled = f64::from(height) * f64::from(IMAGE_MAX_WIDTH) / f64::from(width);
    (scaled.round() as u32).max(1)
}

/// Compress an `image/*` upload. Anything else comes back untouched.
pub fn compress_image(upload: MediaUpload) -> MediaUpload {
    if !upload.content_type.starts_with("image/") {
        return upload;
    }

    match reencode(&upload.data) {
        Ok(data) => {
            debug!(
                file = %upload.file_name,
                before = upload.data.len(),
                after = data.len(),
                "picture compressed"
            );
            MediaUpload {
                file_name: upload.file_name,
                content_type: COMPRESSED_IMAGE_TYPE.to_string(),
                data,
            }
        }
        Err(e) => {
            warn!(file = %upload.file_name, error = %e, "picture not compressed, sending original");
            upload
        }
    }
}

/// [`compress_image`] on the blocking pool.
pub async fn compress_in_background(upload: MediaUpload) -> MediaUpload {
    if !upload.content_type.starts_with("image/") {
        return upload;
    }
    let original = upload.clone();
    match tokio::task::spawn_blocking(move || compress_image(upload)).await {
        Ok(compressed) => compressed,
        Err(e) => {
            warn!(file = %original.file_name, error = %e, "compression task failed");
            original
        }
    }
}

fn reencode(data: &[u8]) -> ImageResult<Bytes> {
    let mut picture = image::load_from_memory(data)?;
    if picture.width() > IMAGE_MAX_WIDTH {
        let height = scaled_height(picture.width(), picture.height());
        picture = picture.resize_exact(IMAGE_MAX_WIDTH, height, FilterType::Triangle);
    }

    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(picture.to_rgb8());
    let mut out = Cursor::new(Vec::new());
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, IMAGE_JPEG_QUALITY))?;
    Ok(Bytes::from(out.into_inner()))
}

#[cfg(test)]
pub(crate) mod tests {
    use image::{ImageFormat, Rgb, RgbImage};

    use super::*;

    /// A PNG-encoded gradient of the given size.
    pub(crate) fn png(width: u32, height: u32) -> Bytes {
        let picture = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(picture)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        Bytes::from(out.into_inner())
    }

    fn upload(content_type: &str, data: Bytes) -> MediaUpload {
        MediaUpload {
            file_name: "photo.png".into(),
            content_type: content_type.into(),
            data,
        }
    }

    #[test]
    fn wide_picture_is_scaled_to_max_width() {
        let out = compress_image(upload("image/png", png(2400, 1200)));
        assert_eq!(out.content_type, "image/jpeg");
        assert_eq!(out.file_name, "photo.png");

        let decoded = image::load_from_memory(&out.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1920, 960));
        assert_eq!(
            image::guess_format(&out.data).unwrap(),
            ImageFormat::Jpeg
        );
    }

    #[test]
    fn narrow_picture_keeps_its_size() {
        let out = compress_image(upload("image/png", png(640, 480)));
        assert_eq!(out.content_type, "image/jpeg");
        let decoded = image::load_from_memory(&out.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (640, 480));
    }

    #[test]
    fn undecodable_picture_is_sent_as_is() {
        let data = Bytes::from(vec![7u8; 1000]);
        let out = compress_image(upload("image/png", data.clone()));
        assert_eq!(out.content_type, "image/png");
        assert_eq!(out.data, data);
    }

    #[test]
    fn other_files_are_left_alone() {
        let data = png(2400, 10);
        let out = compress_image(upload("application/octet-stream", data.clone()));
        assert_eq!(out.content_type, "application/octet-stream");
        assert_eq!(out.data, data);
    }

    #[test]
    fn heights_round_like_the_aspect_ratio() {
        assert_eq!(scaled_height(3840, 2160), 1080);
        assert_eq!(scaled_height(4000, 3), 1);
        assert_eq!(scaled_height(2000, 1001), 961);
    }
}
