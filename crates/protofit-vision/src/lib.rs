//! Frame surfaces and encoding for the analysis upload path.

use std::{
    fs,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use image::{
    codecs::jpeg::JpegEncoder, imageops::FilterType, ColorType, DynamicImage, ImageBuffer, Rgba,
    RgbaImage,
};
use protofit_types::{vision::ImageFrame, ProtofitError, Result};
use tracing::debug;

/// The visible drawing surface the render loop paints into.
#[derive(Debug, Clone, Default)]
pub struct Surface {
    width: u32,
    height: u32,
    contents: Option<ImageFrame>,
    frames_drawn: u64,
}

impl Surface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resize to the sink's dimensions. Clears whatever was drawn.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.contents = None;
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        if self.width == 0 || self.height == 0 {
            None
        } else {
            Some((self.width, self.height))
        }
    }

    pub fn draw(&mut self, frame: &ImageFrame) -> Result<()> {
        let (width, height) = self
            .dimensions()
            .ok_or_else(|| vision_error("surface has not been sized yet"))?;
        let drawn = if frame.dimensions() == (width, height) {
            frame.clone()
        } else {
            scale_frame(frame, width, height)?
        };
        self.contents = Some(drawn);
        self.frames_drawn += 1;
        Ok(())
    }

    pub fn contents(&self) -> Option<&ImageFrame> {
        self.contents.as_ref()
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames_drawn
    }

    pub fn clear(&mut self) {
        self.width = 0;
        self.height = 0;
        self.contents = None;
    }
}

/// JPEG bytes plus the base64 payload sent over the wire.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
    /// Standard base64 of `jpeg`, no `data:image/jpeg;base64,` header.
    pub base64: String,
}

/// Render `frame` into an off-screen `width`x`height` buffer and JPEG encode it.
///
/// The source frame is never modified, so the visible surface can keep
/// drawing while an upload is being prepared.
pub fn encode_jpeg(frame: &ImageFrame, width: u32, height: u32, quality: u8) -> Result<EncodedFrame> {
    let offscreen = to_rgba_image(frame)?;
    let offscreen = if offscreen.dimensions() == (width, height) {
        offscreen
    } else {
        image::imageops::resize(&offscreen, width, height, FilterType::Triangle)
    };
    let rgb = DynamicImage::ImageRgba8(offscreen).to_rgb8();

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
        .encode(rgb.as_raw(), width, height, ColorType::Rgb8)
        .map_err(|err| vision_error(format!("JPEG encoding failed: {err}")))?;
    let base64 = general_purpose::STANDARD.encode(&jpeg);
    debug!(
        "Encoded {}x{} frame: {} bytes JPEG, {} chars base64",
        width,
        height,
        jpeg.len(),
        base64.len()
    );
    Ok(EncodedFrame {
        width,
        height,
        jpeg,
        base64,
    })
}

/// Shrink a frame to fit within `max_width`x`max_height`, keeping aspect.
pub fn thumbnail(frame: &ImageFrame, max_width: u32, max_height: u32) -> Result<ImageFrame> {
    let buffer = to_rgba_image(frame)?;
    let small = DynamicImage::ImageRgba8(buffer).thumbnail(max_width, max_height);
    let rgba = small.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(ImageFrame {
        width,
        height,
        data: rgba.into_raw(),
        captured_at: frame.captured_at,
    })
}

fn scale_frame(frame: &ImageFrame, width: u32, height: u32) -> Result<ImageFrame> {
    let buffer = to_rgba_image(frame)?;
    let scaled = image::imageops::resize(&buffer, width, height, FilterType::Triangle);
    Ok(ImageFrame {
        width,
        height,
        data: scaled.into_raw(),
        captured_at: frame.captured_at,
    })
}

fn to_rgba_image(frame: &ImageFrame) -> Result<RgbaImage> {
    if frame.is_empty() {
        return Err(vision_error("frame is empty"));
    }
    ImageBuffer::<Rgba<u8>, _>::from_raw(frame.width, frame.height, frame.data.clone()).ok_or_else(
        || {
            vision_error(format!(
                "frame buffer of {} bytes does not match {}x{}",
                frame.data.len(),
                frame.width,
                frame.height
            ))
        },
    )
}

/// Writes dispatched frames to disk for later inspection.
pub struct FrameArchive {
    dir: PathBuf,
}

impl FrameArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn persist(&self, seq: u64, frame: &EncodedFrame) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            vision_error(format!("failed to create capture dir {:?}: {err}", self.dir))
        })?;
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let path = self.dir.join(format!("frame_{timestamp}_{seq:06}.jpg"));
        fs::write(&path, &frame.jpeg)
            .map_err(|err| vision_error(format!("failed to write {:?}: {err}", path)))?;
        Ok(path)
    }
}

pub fn vision_error(message: impl Into<String>) -> ProtofitError {
    ProtofitError::Vision(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageFormat;

    fn solid_frame(width: u32, height: u32, rgba: [u8; 4]) -> ImageFrame {
        let data = rgba
            .iter()
            .copied()
            .cycle()
            .take((width * height * 4) as usize)
            .collect();
        ImageFrame::from_rgba(width, height, data)
    }

    #[test]
    fn surface_requires_size_before_drawing() {
        let mut surface = Surface::new();
        let frame = solid_frame(4, 4, [10, 20, 30, 255]);
        assert!(surface.draw(&frame).is_err());

        surface.resize(4, 4);
        surface.draw(&frame).expect("draw at native size");
        assert_eq!(surface.frames_drawn(), 1);
        assert_eq!(surface.contents().map(|f| f.dimensions()), Some((4, 4)));
    }

    #[test]
    fn surface_scales_mismatched_frames() {
        let mut surface = Surface::new();
        surface.resize(2, 2);
        surface
            .draw(&solid_frame(8, 6, [200, 0, 0, 255]))
            .expect("draw scaled");
        let contents = surface.contents().expect("contents");
        assert_eq!(contents.dimensions(), (2, 2));
        assert!(contents.is_consistent());
    }

    #[test]
    fn jpeg_payload_is_plain_base64() {
        let frame = solid_frame(16, 12, [0, 128, 255, 255]);
        let encoded = encode_jpeg(&frame, 16, 12, 92).expect("encode");
        assert!(!encoded.base64.starts_with("data:"));
        assert!(!encoded.base64.contains(','));

        let bytes = general_purpose::STANDARD
            .decode(&encoded.base64)
            .expect("valid base64");
        assert_eq!(bytes, encoded.jpeg);
        let decoded =
            image::load_from_memory_with_format(&bytes, ImageFormat::Jpeg).expect("valid jpeg");
        assert_eq!((decoded.width(), decoded.height()), (16, 12));
    }

    #[test]
    fn offscreen_render_uses_requested_size() {
        let frame = solid_frame(32, 24, [90, 90, 90, 255]);
        let encoded = encode_jpeg(&frame, 8, 6, 75).expect("encode resized");
        let decoded = image::load_from_memory(&encoded.jpeg).expect("decode");
        assert_eq!((decoded.width(), decoded.height()), (8, 6));
    }

    #[test]
    fn encoding_rejects_inconsistent_buffers() {
        let frame = ImageFrame::from_rgba(4, 4, vec![0; 10]);
        assert!(encode_jpeg(&frame, 4, 4, 90).is_err());
        assert!(encode_jpeg(&ImageFrame::empty(), 4, 4, 90).is_err());
    }

    #[test]
    fn thumbnail_keeps_aspect_ratio() {
        let frame = solid_frame(64, 32, [1, 2, 3, 255]);
        let small = thumbnail(&frame, 16, 16).expect("thumbnail");
        assert_eq!(small.dimensions(), (16, 8));
    }

    #[test]
    fn archive_writes_jpeg_files() {
        let dir = std::env::temp_dir().join(format!("protofit-archive-{}", std::process::id()));
        let archive = FrameArchive::new(&dir);
        let encoded = encode_jpeg(&solid_frame(4, 4, [5, 5, 5, 255]), 4, 4, 90).expect("encode");
        let path = archive.persist(3, &encoded).expect("persist");
        assert!(path.starts_with(archive.dir()));
        assert_eq!(fs::read(&path).expect("read back"), encoded.jpeg);
        fs::remove_dir_all(&dir).expect("cleanup archive dir");
    }
}
