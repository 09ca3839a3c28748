use rxing::common::HybridBinarizer;
use rxing::{BinaryBitmap, BufferedImageLuminanceSource, Reader};

/// Decodes a QR code from a frame of RGBA pixels, as returned by
/// `CanvasRenderingContext2D.getImageData`.
pub fn decode_rgba(width: u32, height: u32, data: Vec<u8>) -> Option<String> {
    if width == 0 || height == 0 {
        return None;
    }
    let frame = image::ImageBuffer::<image::Rgba<u8>, _>::from_raw(width, height, data)?;

    let mut image = BinaryBitmap::new(HybridBinarizer::new(BufferedImageLuminanceSource::new(
        image::DynamicImage::from(frame),
    )));

    let mut reader = rxing::qrcode::QRCodeReader;

    reader
        .decode(&mut image)
        .ok()
        .map(|res| res.getText().to_string())
}

/// Throttles decoding to every `period`th frame.
#[derive(Debug)]
pub struct FrameGate {
    period: u32,
    seen: u32,
}

impl FrameGate {
    pub fn new(period: u32) -> Self {
        Self {
            period: period.max(1),
            seen: 0,
        }
    }

    pub fn tick(&mut self) -> bool {
        self.seen = (self.seen + 1) % self.period;
        self.seen == 0
    }
}

/// Suppresses a code that matches the previous one until `period_ms` has
/// passed since it was last reported. A different code always goes through.
#[derive(Debug)]
pub struct Refractory {
    period_ms: f64,
    last: Option<(String, f64)>,
}

impl Refractory {
    pub fn new(period_ms: u32) -> Self {
        Self {
            period_ms: period_ms as f64,
            last: None,
        }
    }

    /// `now_ms` is a monotonic-enough millisecond clock (`Date.now()`).
    pub fn admit(&mut self, text: &str, now_ms: f64) -> bool {
        if let Some((last, at)) = &self.last {
            if last == text && now_ms - at < self.period_ms {
                return false;
            }
        }
        self.last = Some((text.to_owned(), now_ms));
        true
    }
}
