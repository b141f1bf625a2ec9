use std::{fmt, io::Cursor, str::FromStr, sync::Arc};

use image::{DynamicImage, ImageFormat, Rgb};
use qrcode::{QrCode, render::svg, types::QrError};
use rearch::CapsuleHandle;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

pub const DEFAULT_DARK_COLOR: &str = "#000000";
pub const DEFAULT_LIGHT_COLOR: &str = "#ffffff";
/// Minimum edge length, in pixels, of a rendered code.
pub const DEFAULT_WIDTH: u32 = 400;

pub fn qr_encoder_capsule(_: CapsuleHandle) -> Arc<dyn QrImageEncoder> {
    Arc::new(QrCodeEncoder)
}

pub trait QrImageEncoder: Send + Sync {
    /// Renders `payload` as a QR code in the given `format`.
    ///
    /// The returned content type always matches the returned bytes.
    ///
    /// # Errors
    /// Will return [`Err`] if the payload does not fit in a QR code or the raster encoder fails.
    fn encode(
        &self,
        payload: &str,
        style: &QrStyle,
        format: QrFormat,
    ) -> Result<EncodedImage, EncodeError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QrFormat {
    #[default]
    Png,
    Jpg,
    Svg,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown image format {0:?}; expected one of png, jpg, svg")]
pub struct UnknownFormatError(pub String);

impl QrFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpg => "jpg",
            Self::Svg => "svg",
        }
    }

    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpg => "image/jpeg",
            Self::Svg => "image/svg+xml",
        }
    }
}

impl FromStr for QrFormat {
    type Err = UnknownFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "jpg" | "jpeg" => Ok(Self::Jpg),
            "svg" => Ok(Self::Svg),
            _ => Err(UnknownFormatError(s.to_owned())),
        }
    }
}

impl fmt::Display for QrFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A color as the client spelled it, together with its resolved RGB value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QrColor {
    text: String,
    rgb: [u8; 3],
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid color {0:?}; expected #rgb, #rrggbb or a basic color name")]
pub struct InvalidColorError(pub String);

const NAMED_COLORS: &[(&str, [u8; 3])] = &[
    ("black", [0x00, 0x00, 0x00]),
    ("white", [0xff, 0xff, 0xff]),
    ("red", [0xff, 0x00, 0x00]),
    ("green", [0x00, 0x80, 0x00]),
    ("lime", [0x00, 0xff, 0x00]),
    ("blue", [0x00, 0x00, 0xff]),
    ("navy", [0x00, 0x00, 0x80]),
    ("yellow", [0xff, 0xff, 0x00]),
    ("orange", [0xff, 0xa5, 0x00]),
    ("purple", [0x80, 0x00, 0x80]),
    ("fuchsia", [0xff, 0x00, 0xff]),
    ("maroon", [0x80, 0x00, 0x00]),
    ("olive", [0x80, 0x80, 0x00]),
    ("teal", [0x00, 0x80, 0x80]),
    ("aqua", [0x00, 0xff, 0xff]),
    ("silver", [0xc0, 0xc0, 0xc0]),
    ("gray", [0x80, 0x80, 0x80]),
    ("grey", [0x80, 0x80, 0x80]),
];

impl QrColor {
    /// The color exactly as it was supplied (trimmed).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub const fn rgb(&self) -> [u8; 3] {
        self.rgb
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        let [r, g, b] = self.rgb;
        format!("#{r:02x}{g:02x}{b:02x}")
    }

    fn parse_hex(digits: &str) -> Option<[u8; 3]> {
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let channel = |s: &str| u8::from_str_radix(s, 16).ok();
        match digits.len() {
            3 => {
                let mut rgb = [0; 3];
                for (slot, i) in rgb.iter_mut().zip(0..3) {
                    *slot = channel(&digits[i..=i])? * 0x11;
                }
                Some(rgb)
            }
            6 => Some([
                channel(&digits[0..2])?,
                channel(&digits[2..4])?,
                channel(&digits[4..6])?,
            ]),
            _ => None,
        }
    }
}

impl Default for QrColor {
    fn default() -> Self {
        Self {
            text: DEFAULT_DARK_COLOR.to_owned(),
            rgb: [0, 0, 0],
        }
    }
}

impl FromStr for QrColor {
    type Err = InvalidColorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let rgb = match text.strip_prefix('#') {
            Some(digits) => Self::parse_hex(digits),
            None => NAMED_COLORS
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(text))
                .map(|&(_, rgb)| rgb),
        };
        rgb.map(|rgb| Self {
            text: text.to_owned(),
            rgb,
        })
        .ok_or_else(|| InvalidColorError(s.to_owned()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QrStyle {
    pub dark: QrColor,
    pub light: QrColor,
    pub width: u32,
}

impl QrStyle {
    /// Default light color and width with the given foreground.
    #[must_use]
    pub fn with_dark(dark: QrColor) -> Self {
        Self {
            dark,
            ..Self::default()
        }
    }
}

impl Default for QrStyle {
    fn default() -> Self {
        Self {
            dark: QrColor::default(),
            light: QrColor {
                text: DEFAULT_LIGHT_COLOR.to_owned(),
                rgb: [0xff, 0xff, 0xff],
            },
            width: DEFAULT_WIDTH,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("payload cannot be encoded as a QR code: {0}")]
    Qr(#[from] QrError),
    #[error("failed to encode raster image: {0}")]
    Image(#[from] image::ImageError),
}

/// [`QrImageEncoder`] backed by the `qrcode` renderer and the `image` codecs.
pub struct QrCodeEncoder;

impl QrImageEncoder for QrCodeEncoder {
    #[instrument(skip(self, style), fields(dark = style.dark.as_str()))]
    fn encode(
        &self,
        payload: &str,
        style: &QrStyle,
        format: QrFormat,
    ) -> Result<EncodedImage, EncodeError> {
        let code = QrCode::new(payload.as_bytes())?;

        let bytes = match format {
            QrFormat::Svg => {
                let (dark, light) = (style.dark.to_hex(), style.light.to_hex());
                code.render::<svg::Color>()
                    .min_dimensions(style.width, style.width)
                    .dark_color(svg::Color(&dark))
                    .light_color(svg::Color(&light))
                    .quiet_zone(true)
                    .build()
                    .into_bytes()
            }
            QrFormat::Png | QrFormat::Jpg => {
                let raster = code
                    .render::<Rgb<u8>>()
                    .min_dimensions(style.width, style.width)
                    .dark_color(Rgb(style.dark.rgb()))
                    .light_color(Rgb(style.light.rgb()))
                    .quiet_zone(true)
                    .build();

                let image_format = if format == QrFormat::Png {
                    ImageFormat::Png
                } else {
                    ImageFormat::Jpeg
                };
                let mut out = Cursor::new(Vec::new());
                DynamicImage::ImageRgb8(raster).write_to(&mut out, image_format)?;
                out.into_inner()
            }
        };

        Ok(EncodedImage {
            bytes,
            content_type: format.content_type(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const PAYLOAD: &str = "http://qr.test/redirect/abcDEF12";

    #[test]
    fn test_format_parsing() {
        assert_eq!("png".parse(), Ok(QrFormat::Png));
        assert_eq!("JPG".parse(), Ok(QrFormat::Jpg));
        assert_eq!("jpeg".parse(), Ok(QrFormat::Jpg));
        assert_eq!(" svg ".parse(), Ok(QrFormat::Svg));
        assert_eq!(
            "gif".parse::<QrFormat>(),
            Err(UnknownFormatError("gif".to_owned()))
        );
        assert_eq!(QrFormat::default(), QrFormat::Png);
    }

    #[test]
    fn test_format_content_types() {
        assert_eq!(QrFormat::Png.content_type(), "image/png");
        assert_eq!(QrFormat::Jpg.content_type(), "image/jpeg");
        assert_eq!(QrFormat::Svg.content_type(), "image/svg+xml");
    }

    #[test]
    fn test_color_parsing() {
        let short_hex: QrColor = "#f0a".parse().unwrap();
        assert_eq!(short_hex.rgb(), [0xff, 0x00, 0xaa]);
        assert_eq!(short_hex.as_str(), "#f0a");

        let long_hex: QrColor = "#1A2b3C".parse().unwrap();
        assert_eq!(long_hex.rgb(), [0x1a, 0x2b, 0x3c]);
        assert_eq!(long_hex.to_hex(), "#1a2b3c");

        let named: QrColor = "Navy".parse().unwrap();
        assert_eq!(named.rgb(), [0x00, 0x00, 0x80]);
        assert_eq!(named.as_str(), "Navy");

        assert_eq!(QrColor::default().as_str(), DEFAULT_DARK_COLOR);
    }

    #[test]
    fn test_color_rejects_garbage() {
        for bad in ["", "#", "#12", "#12345", "#gggggg", "#ffé", "chartreuse-ish"] {
            assert_eq!(
                bad.parse::<QrColor>(),
                Err(InvalidColorError(bad.to_owned())),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn test_encode_png() {
        let image = QrCodeEncoder
            .encode(PAYLOAD, &QrStyle::default(), QrFormat::Png)
            .unwrap();
        assert_eq!(image.content_type, "image/png");
        assert_eq!(&image.bytes[..4], b"\x89PNG");

        let decoded = image::load_from_memory_with_format(&image.bytes, ImageFormat::Png).unwrap();
        assert!(decoded.width() >= DEFAULT_WIDTH);
        assert_eq!(decoded.width(), decoded.height());
    }

    #[test]
    fn test_encode_png_uses_dark_color() {
        let style = QrStyle::with_dark("#ff0000".parse().unwrap());
        let image = QrCodeEncoder.encode(PAYLOAD, &style, QrFormat::Png).unwrap();

        let decoded = image::load_from_memory(&image.bytes).unwrap().to_rgb8();
        let pixels: Vec<_> = decoded.pixels().map(|p| p.0).collect();
        assert!(pixels.contains(&[0xff, 0x00, 0x00]));
        assert!(pixels.contains(&[0xff, 0xff, 0xff]));
        assert!(!pixels.contains(&[0x00, 0x00, 0x00]));
    }

    #[test]
    fn test_encode_jpg() {
        let image = QrCodeEncoder
            .encode(PAYLOAD, &QrStyle::default(), QrFormat::Jpg)
            .unwrap();
        assert_eq!(image.content_type, "image/jpeg");
        assert_eq!(&image.bytes[..3], &[0xff, 0xd8, 0xff]);
        assert!(image::load_from_memory_with_format(&image.bytes, ImageFormat::Jpeg).is_ok());
    }

    #[test]
    fn test_encode_svg() {
        let style = QrStyle::with_dark("teal".parse().unwrap());
        let image = QrCodeEncoder.encode(PAYLOAD, &style, QrFormat::Svg).unwrap();
        assert_eq!(image.content_type, "image/svg+xml");

        let text = String::from_utf8(image.bytes).unwrap();
        assert!(text.contains("<svg"));
        assert!(text.contains("#008080"));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = "x".repeat(8000);
        let result = QrCodeEncoder.encode(&payload, &QrStyle::default(), QrFormat::Png);
        assert!(matches!(result, Err(EncodeError::Qr(_))));
    }
}
