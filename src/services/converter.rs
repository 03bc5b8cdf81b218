use async_trait::async_trait;
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info};

use crate::models::TargetFormat;

/// JPEG quality used for every re-encode; conversion must not add loss beyond
/// the mandatory format change.
pub const JPEG_QUALITY: u8 = 100;

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("failed to decode source image: {0}")]
    Decode(String),

    #[error("failed to encode {format:?} output: {reason}")]
    Encode { format: TargetFormat, reason: String },

    #[error("{program} failed: {stderr}")]
    Process { program: String, stderr: String },

    #[error("input is not a supported image container")]
    Unsupported,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Converts image bytes into a target format.
///
/// Implementations may work in-process or shell out; callers only see bytes in,
/// bytes out and an explicit error.
#[async_trait]
pub trait ImageConverter: Send + Sync {
    async fn convert(&self, input: &[u8], target: TargetFormat) -> Result<Vec<u8>, ConversionError>;

    /// Check if the backend is usable on this host
    async fn health_check(&self) -> bool;

    fn name(&self) -> &'static str;
}

/// In-process conversion with the `image` crate. Decodes whatever the enabled
/// codecs recognise from the bytes themselves.
///
/// The `image` crate has no HEIF decoder: HEIC input is refused with
/// [`ConversionError::Unsupported`]. Use the ffmpeg backend for real uploads.
pub struct NativeConverter;

#[async_trait]
impl ImageConverter for NativeConverter {
    async fn convert(&self, input: &[u8], target: TargetFormat) -> Result<Vec<u8>, ConversionError> {
        if infer::image::is_heif(input) {
            return Err(ConversionError::Unsupported);
        }
        let img = image::load_from_memory(input)
            .map_err(|e| ConversionError::Decode(e.to_string()))?;
        encode(&img, target)
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "native"
    }
}

/// HEIC/HEIF conversion through an external `ffmpeg` binary.
///
/// ffmpeg renders the primary image to PNG (lossless intermediate), which is
/// then encoded in-process so the quality setting is applied the same way as
/// in [`NativeConverter`].
pub struct FfmpegConverter {
    program: String,
}

impl FfmpegConverter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FfmpegConverter {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl ImageConverter for FfmpegConverter {
    async fn convert(&self, input: &[u8], target: TargetFormat) -> Result<Vec<u8>, ConversionError> {
        let suffix = if infer::image::is_heif(input) {
            ".heic"
        } else if let Some(kind) = infer::get(input).filter(|k| k.mime_type().starts_with("image/")) {
            // ffmpeg sniffs the content, the suffix only helps it pick a demuxer
            match kind.extension() {
                "jpg" => ".jpg",
                "png" => ".png",
                "webp" => ".webp",
                "gif" => ".gif",
                _ => ".img",
            }
        } else {
            return Err(ConversionError::Unsupported);
        };

        let mut input_file = tempfile::Builder::new().suffix(suffix).tempfile()?;
        input_file.write_all(input)?;
        let input_path = input_file.into_temp_path();

        let output_file = NamedTempFile::with_suffix(".png")?;
        let output_path = output_file.path().to_path_buf();

        let output = Command::new(&self.program)
            .arg("-y")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(input_path.as_os_str())
            .arg("-frames:v")
            .arg("1")
            .arg(&output_path)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("{} failed on HEIC: {}", self.program, stderr);
            return Err(ConversionError::Process {
                program: self.program.clone(),
                stderr,
            });
        }

        let png_data = tokio::fs::read(&output_path).await?;
        let img = image::load_from_memory_with_format(&png_data, ImageFormat::Png)
            .map_err(|e| ConversionError::Decode(e.to_string()))?;
        encode(&img, target)
    }

    async fn health_check(&self) -> bool {
        match Command::new(&self.program).arg("-version").output().await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    fn name(&self) -> &'static str {
        "ffmpeg"
    }
}

fn encode(img: &DynamicImage, target: TargetFormat) -> Result<Vec<u8>, ConversionError> {
    let mut out_data = Vec::new();

    match target {
        TargetFormat::Jpeg => {
            // JPEG carries no alpha and only 8-bit samples.
            let rgb = img.to_rgb8();
            let (width, height) = img.dimensions();
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out_data, JPEG_QUALITY)
                .encode(rgb.as_raw(), width, height, image::ColorType::Rgb8)
                .map_err(|e| ConversionError::Encode {
                    format: target,
                    reason: e.to_string(),
                })?;
        }
        TargetFormat::Png => {
            let mut cursor = std::io::Cursor::new(&mut out_data);
            img.write_to(&mut cursor, ImageFormat::Png)
                .map_err(|e| ConversionError::Encode {
                    format: target,
                    reason: e.to_string(),
                })?;
        }
    }

    Ok(out_data)
}

/// Factory function to create the converter named by configuration
pub fn create_converter(backend: &str) -> Arc<dyn ImageConverter> {
    match backend.to_lowercase().as_str() {
        "ffmpeg" => Arc::new(FfmpegConverter::default()),
        "native" | "image" => Arc::new(NativeConverter),
        _ => {
            tracing::warn!("Unknown converter backend '{}', using ffmpeg", backend);
            Arc::new(FfmpegConverter::default())
        }
    }
}

/// Logs which backend was picked and whether it is usable.
pub async fn announce(converter: &dyn ImageConverter) {
    if converter.health_check().await {
        info!("🖼️  Converter backend '{}' ready", converter.name());
    } else {
        tracing::warn!(
            "⚠️  Converter backend '{}' unavailable! Conversions will fail until it is installed.",
            converter.name()
        );
    }
}
