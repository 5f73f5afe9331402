// Image loading module
// Decodes animated GIFs (or still images) into BGRA frames and tracks playback

use anyhow::Context;
use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, ImageFormat, RgbaImage};
use log::{debug, info};
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Frames shorter than this are stretched, like browsers do
const MIN_FRAME_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
#[error("failed to load image {path}: {source:#}")]
pub struct ImageError {
    pub path: String,
    #[source]
    pub source: anyhow::Error,
}

/// One decoded frame in BGRA order (Wayland ARGB8888 little-endian)
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub bgra: Vec<u8>,
    pub delay: Duration,
}

/// All frames of an image; still images have exactly one
#[derive(Debug, Clone)]
pub struct AnimatedImage {
    pub frames: Vec<Frame>,
}

impl AnimatedImage {
    pub fn load(path: &Path) -> Result<Self, ImageError> {
        let wrap = |source: anyhow::Error| ImageError {
            path: path.display().to_string(),
            source,
        };
        let data = fs::read(path)
            .with_context(|| format!("Failed to read image file: {}", path.display()))
            .map_err(wrap)?;
        let image = Self::from_bytes(&data).map_err(wrap)?;
        info!(
            "Image loaded from {}: {} frame(s), {}x{}",
            path.display(),
            image.frames.len(),
            image.width(),
            image.height()
        );
        Ok(image)
    }

    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        let format = image::guess_format(data).context("Failed to detect image format")?;
        if format == ImageFormat::Gif {
            let decoder = GifDecoder::new(Cursor::new(data)).context("Failed to open GIF")?;
            let frames = decoder
                .into_frames()
                .collect_frames()
                .context("Failed to decode GIF frames")?;
            let frames: Vec<Frame> = frames
                .into_iter()
                .map(|frame| {
                    let (numer, denom) = frame.delay().numer_denom_ms();
                    let millis = if denom == 0 { 0 } else { numer / denom };
                    to_frame(frame.into_buffer(), Duration::from_millis(u64::from(millis)))
                })
                .collect();
            anyhow::ensure!(!frames.is_empty(), "GIF contains no frames");
            return Ok(Self { frames });
        }

        let still: DynamicImage =
            image::load(Cursor::new(data), format).context("Failed to decode image")?;
        Ok(Self {
            frames: vec![to_frame(still.to_rgba8(), Duration::ZERO)],
        })
    }

    pub fn width(&self) -> u32 {
        self.frames.first().map_or(0, |frame| frame.width)
    }

    pub fn height(&self) -> u32 {
        self.frames.first().map_or(0, |frame| frame.height)
    }

    pub fn is_animated(&self) -> bool {
        self.frames.len() > 1
    }
}

fn to_frame(rgba: RgbaImage, delay: Duration) -> Frame {
    let (width, height) = rgba.dimensions();
    let mut bgra = rgba.into_raw();
    for pixel in bgra.chunks_exact_mut(4) {
        pixel.swap(0, 2); // Swap R and B
    }
    Frame {
        width,
        height,
        bgra,
        delay,
    }
}

/// Playable image: frames, the size they are drawn at and the cursor
#[derive(Debug, Clone)]
pub struct Playback {
    image: AnimatedImage,
    scaled_size: (u32, u32),
    current: usize,
    playing: bool,
}

impl Playback {
    pub fn new(image: AnimatedImage) -> Self {
        let scaled_size = (image.width(), image.height());
        Self {
            image,
            scaled_size,
            current: 0,
            playing: false,
        }
    }

    pub fn scale_to(&mut self, width: u32, height: u32) {
        self.scaled_size = (width.max(1), height.max(1));
    }

    pub fn scaled_size(&self) -> (u32, u32) {
        self.scaled_size
    }

    /// Start (or resume) playback, returns the delay until the next frame
    pub fn start(&mut self) -> Option<Duration> {
        self.playing = true;
        self.current_delay()
    }

    pub fn frame(&self) -> &Frame {
        &self.image.frames[self.current]
    }

    pub fn frame_index(&self) -> usize {
        self.current
    }

    /// Move to the next frame, returns the delay until the one after it
    pub fn advance(&mut self) -> Option<Duration> {
        if !self.playing || !self.image.is_animated() {
            return None;
        }
        self.current = (self.current + 1) % self.image.frames.len();
        debug!("Showing frame {}", self.current);
        self.current_delay()
    }

    fn current_delay(&self) -> Option<Duration> {
        self.image
            .is_animated()
            .then(|| self.frame().delay.max(MIN_FRAME_DELAY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::gif::GifEncoder;
    use image::{Delay, Rgba};

    fn encode_gif(colors: &[[u8; 4]], delay_ms: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut bytes);
            let frames = colors.iter().map(|color| {
                image::Frame::from_parts(
                    RgbaImage::from_pixel(4, 3, Rgba(*color)),
                    0,
                    0,
                    Delay::from_numer_denom_ms(delay_ms, 1),
                )
            });
            encoder.encode_frames(frames).unwrap();
        }
        bytes
    }

    #[test]
    fn decodes_every_gif_frame_in_bgra_order() {
        let bytes = encode_gif(&[[255, 0, 0, 255], [0, 0, 255, 255]], 100);
        let image = AnimatedImage::from_bytes(&bytes).unwrap();
        assert_eq!(image.frames.len(), 2);
        assert_eq!((image.width(), image.height()), (4, 3));
        // red pixel ends up with its red channel in byte 2
        let first = &image.frames[0].bgra[..4];
        assert!(first[2] > 200 && first[0] < 50, "unexpected pixel {first:?}");
        assert_eq!(image.frames[0].delay, Duration::from_millis(100));
    }

    #[test]
    fn playback_cycles_frames_only_after_start() {
        let bytes = encode_gif(&[[255, 0, 0, 255], [0, 255, 0, 255], [0, 0, 255, 255]], 5);
        let mut playback = Playback::new(AnimatedImage::from_bytes(&bytes).unwrap());
        assert_eq!(playback.advance(), None);
        assert_eq!(playback.frame_index(), 0);

        assert_eq!(playback.start(), Some(MIN_FRAME_DELAY));
        playback.advance();
        playback.advance();
        assert_eq!(playback.frame_index(), 2);
        playback.advance();
        assert_eq!(playback.frame_index(), 0);
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(AnimatedImage::from_bytes(b"definitely not an image").is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = AnimatedImage::load(Path::new("/nonexistent/kiwi.gif")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/kiwi.gif"));
    }
}
