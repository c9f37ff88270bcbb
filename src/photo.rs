//! Photo fetching and conversion to the printer's monochrome raster format.

use crate::errors::{QueueError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::DynamicImage;
use std::time::Duration;
use tracing::debug;

/// 1-bit raster ready for an ePOS `<image>` element
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
    pub width: u32,
    pub height: u32,
    /// Base64 of the packed bitmap, MSB first, rows padded to whole bytes
    pub data: String,
}

/// Turns a request's photo URL into a printable raster.
#[async_trait]
pub trait PhotoRenderer: Send + Sync {
    async fn render(&self, url: &str) -> Result<EncodedImage>;
}

/// Downloads photos over HTTP
pub struct HttpPhotoRenderer {
    client: reqwest::Client,
    max_width: u32,
}

impl HttpPhotoRenderer {
    pub fn new(max_width: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| QueueError::Photo(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_width: max_width.max(8),
        })
    }
}

#[async_trait]
impl PhotoRenderer for HttpPhotoRenderer {
    async fn render(&self, url: &str) -> Result<EncodedImage> {
        debug!("Fetching photo {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| QueueError::Photo(format!("Photo download failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(QueueError::Photo(format!(
                "Photo download returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| QueueError::Photo(format!("Photo download failed: {}", e)))?;

        let img = image::load_from_memory(&bytes)
            .map_err(|e| QueueError::Photo(format!("Unsupported photo: {}", e)))?;

        Ok(rasterize(&img, self.max_width))
    }
}

/// Scale down to `max_width` and threshold to 1 bit (dark pixels print).
pub fn rasterize(img: &DynamicImage, max_width: u32) -> EncodedImage {
    let (orig_width, orig_height) = (img.width(), img.height());

    let (width, height) = if orig_width > max_width {
        let scale = max_width as f32 / orig_width as f32;
        (max_width, ((orig_height as f32 * scale) as u32).max(1))
    } else {
        (orig_width, orig_height)
    };

    let gray = if width != orig_width {
        img.resize_exact(width, height, image::imageops::FilterType::Lanczos3)
            .to_luma8()
    } else {
        img.to_luma8()
    };

    let byte_width = (width + 7) / 8;
    let mut bitmap = Vec::with_capacity((byte_width * height) as usize);

    for y in 0..height {
        for bx in 0..byte_width {
            let mut byte_val = 0u8;
            for bit in 0..8u32 {
                let x = bx * 8 + bit;
                if x < width && gray.get_pixel(x, y)[0] < 128 {
                    byte_val |= 1 << (7 - bit);
                }
            }
            bitmap.push(byte_val);
        }
    }

    EncodedImage {
        width,
        height,
        data: STANDARD.encode(&bitmap),
    }
}
