use std::{io::Cursor, path::Path};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{codecs::jpeg::JpegEncoder, DynamicImage, RgbImage};

const JPEG_QUALITY: u8 = 80;

/// Camera frames handed to the visual predictor.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture(&self) -> Result<RgbImage>;
}

/// Serves the same frame on every capture: a still image on disk, or a blank frame.
pub struct StaticFrameSource {
    frame: RgbImage,
}

impl StaticFrameSource {
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            frame: RgbImage::new(width, height),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let frame = image::open(path)
            .with_context(|| format!("failed to open frame image {}", path.display()))?
            .to_rgb8();
        Ok(Self { frame })
    }
}

#[async_trait]
impl FrameSource for StaticFrameSource {
    async fn capture(&self) -> Result<RgbImage> {
        Ok(self.frame.clone())
    }
}

/// JPEG-encode a frame and base64 it for the JSON request body.
pub fn encode_jpeg(frame: &RgbImage) -> Result<String> {
    let mut bytes = Vec::new();
    let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut bytes), JPEG_QUALITY);
    DynamicImage::ImageRgb8(frame.clone())
        .write_with_encoder(encoder)
        .context("failed to encode frame as JPEG")?;
    Ok(STANDARD.encode(&bytes))
}
