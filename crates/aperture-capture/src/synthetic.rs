use aperture_types::{
    config::{CameraConfig, PixelFormat},
    status::SensorInfo,
    Result,
};
use async_trait::async_trait;
use image::{codecs::jpeg::JpegEncoder, ColorType, ImageBuffer, Rgb, RgbImage};
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::{capture_error, CaptureDevice, CaptureFault};

/// Distinct pattern frames rendered at configure time and cycled through.
const PATTERN_FRAMES: usize = 8;

/// Host-side stand-in for the camera module: a moving test pattern encoded as JPEG.
pub struct SyntheticSensor {
    frames: Vec<Vec<u8>>,
    interval: Duration,
    cursor: usize,
}

impl SyntheticSensor {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            interval: Duration::from_millis(40),
            cursor: 0,
        }
    }
}

impl Default for SyntheticSensor {
    fn default() -> Self {
        Self::new()
    }
}

/// Sensor quality runs 0 (best) to 63; the encoder wants 1 to 100.
fn encoder_quality(sensor_quality: u8) -> u8 {
    let scaled = 100u32.saturating_sub(u32::from(sensor_quality) * 100 / 64);
    scaled.clamp(1, 100) as u8
}

fn render_pattern(width: u32, height: u32, phase: usize) -> RgbImage {
    let bar_width = (width / PATTERN_FRAMES as u32).max(1);
    let bar_start = bar_width * phase as u32;
    ImageBuffer::from_fn(width, height, |x, y| {
        if x >= bar_start && x < bar_start + bar_width {
            Rgb([255, 255, 255])
        } else {
            Rgb([
                (x * 255 / width.max(1)) as u8,
                (y * 255 / height.max(1)) as u8,
                (phase * 255 / PATTERN_FRAMES) as u8,
            ])
        }
    })
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> std::result::Result<Vec<u8>, image::ImageError> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode(
        image.as_raw(),
        image.width(),
        image.height(),
        ColorType::Rgb8,
    )?;
    Ok(out)
}

#[async_trait]
impl CaptureDevice for SyntheticSensor {
    async fn configure(&mut self, config: &CameraConfig) -> Result<SensorInfo> {
        if config.pixel_format != PixelFormat::Jpeg {
            return Err(capture_error("synthetic sensor only produces JPEG"));
        }
        let (width, height) = config.frame_size.dimensions();
        let quality = encoder_quality(config.jpeg_quality);

        let frames = tokio::task::spawn_blocking(move || {
            (0..PATTERN_FRAMES)
                .map(|phase| encode_jpeg(&render_pattern(width, height, phase), quality))
                .collect::<std::result::Result<Vec<_>, _>>()
        })
        .await
        .map_err(|err| capture_error(format!("pattern renderer panicked: {err}")))?
        .map_err(|err| capture_error(format!("failed to encode test pattern: {err}")))?;

        debug!(
            "Rendered {} pattern frames, first is {} bytes",
            frames.len(),
            frames.first().map(Vec::len).unwrap_or_default()
        );
        self.frames = frames;
        self.interval = config.sensor_interval();
        self.cursor = 0;
        info!("Synthetic sensor ready at {}", config.frame_size);

        Ok(SensorInfo {
            model: "synthetic-test-pattern".into(),
            frame_size: config.frame_size,
            jpeg_quality: config.jpeg_quality,
        })
    }

    async fn capture(&mut self, buffer: &mut Vec<u8>) -> std::result::Result<(), CaptureFault> {
        if self.frames.is_empty() {
            return Err(CaptureFault::new("sensor not configured"));
        }
        sleep(self.interval).await;
        buffer.extend_from_slice(&self.frames[self.cursor]);
        self.cursor = (self.cursor + 1) % self.frames.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_types::frame::FrameSize;

    #[test]
    fn quality_mapping_stays_in_encoder_range() {
        assert_eq!(encoder_quality(0), 100);
        assert_eq!(encoder_quality(63), 2);
        assert!(encoder_quality(12) > encoder_quality(40));
    }

    #[tokio::test]
    async fn captures_are_jpeg_bitstreams() {
        let mut sensor = SyntheticSensor::new();
        let config = CameraConfig {
            frame_size: FrameSize::Qqvga,
            sensor_interval_ms: 0,
            ..CameraConfig::default()
        };
        let info = sensor.configure(&config).await.expect("configure");
        assert_eq!(info.frame_size, FrameSize::Qqvga);

        let mut buffer = Vec::new();
        sensor.capture(&mut buffer).await.expect("capture");
        assert_eq!(&buffer[..2], &[0xFF, 0xD8]);
        assert_eq!(&buffer[buffer.len() - 2..], &[0xFF, 0xD9]);
    }

    #[tokio::test]
    async fn capture_before_configure_faults() {
        let mut sensor = SyntheticSensor::new();
        let mut buffer = Vec::new();
        assert!(sensor.capture(&mut buffer).await.is_err());
    }
}
