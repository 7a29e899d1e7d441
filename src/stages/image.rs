use anyhow::{Result, anyhow, bail};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{
    CompressionType as PngCompressionType, FilterType as PngFilterType, PngEncoder,
};
use image::{DynamicImage, ImageFormat};
use serde_json::Value;
use tracing::debug;
use webp::Encoder as WebpEncoder;

use super::{param_f64, param_string, param_u8, value_as_u64};
use crate::error::Fault;
use crate::pipeline::{FileRecord, Stage, StageParameters};

/// Re-encodes raster images with tighter settings and keeps whichever of
/// the original and re-encoded bytes is smaller. Formats without a
/// lossless-safe encoder (SVG, GIF, ICO, ...) pass through untouched.
pub struct CompressImageStage {
    jpeg_quality: u8,
    png_compression: PngCompressionType,
    png_filter: PngFilterType,
    webp_quality: f32,
}

impl CompressImageStage {
    pub fn from_params(params: StageParameters) -> Result<Self> {
        let jpeg_quality = param_u8(&params, "jpeg_quality").unwrap_or(75).clamp(1, 100);
        let webp_quality = param_f64(&params, "webp_quality")
            .unwrap_or(75.0)
            .clamp(0.0, 100.0) as f32;
        Ok(Self {
            jpeg_quality,
            png_compression: parse_png_compression(&params)?,
            png_filter: parse_png_filter(&params)?,
            webp_quality,
        })
    }

    fn encode(&self, image: &DynamicImage, format: ImageFormat) -> Result<Option<Vec<u8>>> {
        let mut buffer = Vec::new();
        match format {
            ImageFormat::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(&mut buffer, self.jpeg_quality);
                if image.color().has_alpha() {
                    DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)?;
                } else {
                    image.write_with_encoder(encoder)?;
                }
            }
            ImageFormat::Png => {
                let encoder =
                    PngEncoder::new_with_quality(&mut buffer, self.png_compression, self.png_filter);
                image.write_with_encoder(encoder)?;
            }
            ImageFormat::WebP => {
                let encoder = WebpEncoder::from_image(image)
                    .map_err(|err| anyhow!("Failed to prepare WebP encoder: {err}"))?;
                buffer = encoder.encode(self.webp_quality).to_vec();
            }
            _ => return Ok(None),
        }
        Ok(Some(buffer))
    }
}

impl Stage for CompressImageStage {
    fn name(&self) -> &'static str {
        "compress-image"
    }

    fn apply(&self, record: FileRecord) -> Result<Vec<FileRecord>, Fault> {
        let Some(format) = record
            .path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(ImageFormat::from_extension)
        else {
            return Ok(vec![record]);
        };
        if !matches!(
            format,
            ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP
        ) {
            return Ok(vec![record]);
        }

        let image = image::load_from_memory_with_format(&record.contents, format).map_err(|err| {
            Fault::transform(self.name(), &record.path, format!("decode failed: {err}"))
        })?;
        let encoded = self.encode(&image, format).map_err(|err| {
            Fault::transform(self.name(), &record.path, format!("encode failed: {err:#}"))
        })?;

        match encoded {
            Some(bytes) if bytes.len() < record.contents.len() => {
                debug!(
                    path = %record.path.display(),
                    before = record.contents.len(),
                    after = bytes.len(),
                    "Image compressed"
                );
                Ok(vec![record.with_contents(bytes)])
            }
            _ => Ok(vec![record]),
        }
    }
}

fn parse_png_compression(options: &StageParameters) -> Result<PngCompressionType> {
    let Some(value) = options.get("png_compression") else {
        return Ok(PngCompressionType::Best);
    };
    if let Some(s) = param_string(options, "png_compression") {
        return match s.trim().to_lowercase().as_str() {
            "fast" => Ok(PngCompressionType::Fast),
            "default" => Ok(PngCompressionType::Default),
            "best" => Ok(PngCompressionType::Best),
            other => bail!("Unknown PNG compression profile '{other}'"),
        };
    }
    if let Some(level) = value_as_u64(value) {
        return Ok(match level {
            0..=3 => PngCompressionType::Fast,
            4..=6 => PngCompressionType::Default,
            _ => PngCompressionType::Best,
        });
    }
    bail!("Unsupported PNG compression value: {value}")
}

fn parse_png_filter(options: &StageParameters) -> Result<PngFilterType> {
    let Some(value) = options.get("png_filter") else {
        return Ok(PngFilterType::Adaptive);
    };
    match value {
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "adaptive" => Ok(PngFilterType::Adaptive),
            "none" | "nofilter" => Ok(PngFilterType::NoFilter),
            "sub" => Ok(PngFilterType::Sub),
            "up" => Ok(PngFilterType::Up),
            "avg" | "average" => Ok(PngFilterType::Avg),
            "paeth" => Ok(PngFilterType::Paeth),
            other => bail!("Unknown PNG filter '{other}'"),
        },
        other => bail!("Unsupported PNG filter value: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;

    fn noisy_png() -> Vec<u8> {
        let img = ImageBuffer::from_fn(32, 32, |x, y| Rgb([(x * 8) as u8, (y * 8) as u8, 128]));
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_with_encoder(PngEncoder::new_with_quality(
                &mut cursor,
                PngCompressionType::Fast,
                PngFilterType::NoFilter,
            ))
            .unwrap();
        cursor.into_inner()
    }

    #[test]
    fn output_never_grows() {
        let stage = CompressImageStage::from_params(StageParameters::new()).unwrap();
        let original = noisy_png();
        let out = stage
            .apply(FileRecord::new("img/a.png", "img", original.clone()))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].contents.len() <= original.len());
        assert_eq!(
            image::guess_format(&out[0].contents).unwrap(),
            ImageFormat::Png
        );
    }

    #[test]
    fn svg_passes_through() {
        let stage = CompressImageStage::from_params(StageParameters::new()).unwrap();
        let svg = b"<svg xmlns=\"http://www.w3.org/2000/svg\"/>".to_vec();
        let out = stage
            .apply(FileRecord::new("img/logo.svg", "img", svg.clone()))
            .unwrap();
        assert_eq!(out[0].contents, svg);
    }

    #[test]
    fn corrupt_images_fault() {
        let stage = CompressImageStage::from_params(StageParameters::new()).unwrap();
        let result = stage.apply(FileRecord::new("img/bad.jpg", "img", b"nope".to_vec()));
        assert!(matches!(result, Err(Fault::Transform { .. })));
    }

    #[test]
    fn png_options_are_validated() {
        let mut params = StageParameters::new();
        params.insert("png_filter".into(), Value::String("sideways".into()));
        assert!(CompressImageStage::from_params(params).is_err());
    }
}
