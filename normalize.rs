use crate::config::{IntensityPolicy, NormalizerConfig};
use crate::error::{Error, Result};
use crate::models::{NormalizedTensor, TARGET_HEIGHT, TARGET_WIDTH};
use image::{DynamicImage, GrayImage};
use ndarray::{Array2, Array4};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Declared by the caller, never sniffed from the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    #[default]
    #[serde(alias = "jpg")]
    Jpeg,
}

impl InputFormat {
    fn image_format(self) -> image::ImageFormat {
        match self {
            Self::Jpeg => image::ImageFormat::Jpeg,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        ext.parse().ok()
    }
}

impl FromStr for InputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            other => Err(Error::UnsupportedFormat(format!(
                "'{other}' is not a supported input format"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    format: InputFormat,
    policy: IntensityPolicy,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Result<Self> {
        Ok(Self {
            format: config.format,
            policy: config.required_policy()?,
        })
    }

    pub fn policy(&self) -> IntensityPolicy {
        self.policy
    }

    pub fn format(&self) -> InputFormat {
        self.format
    }

    pub fn normalize(&self, bytes: &[u8]) -> Result<NormalizedTensor> {
        normalize(bytes, self.format, self.policy)
    }
}

pub fn normalize(
    bytes: &[u8],
    format: InputFormat,
    policy: IntensityPolicy,
) -> Result<NormalizedTensor> {
    policy.validate()?;
    let gray = decode_grayscale(bytes, format)?;
    let pixels = gray_to_f32(&gray);
    let resized = resize_bilinear(&pixels, TARGET_HEIGHT, TARGET_WIDTH)?;
    let mut batched: Array4<f32> = resized
        .into_shape_with_order((1, TARGET_HEIGHT, TARGET_WIDTH, 1))
        .map_err(|e| Error::Resize(format!("Invalid normalized tensor shape: {e}")))?;
    if policy != IntensityPolicy::Raw {
        batched.mapv_inplace(|v| policy.apply(v));
    }
    NormalizedTensor::new(batched)
}

/// Colour sources are reduced with the BT.601 luma weights.
pub fn decode_grayscale(bytes: &[u8], format: InputFormat) -> Result<GrayImage> {
    if bytes.is_empty() {
        return Err(Error::Decode("empty image payload".into()));
    }
    let img = image::load_from_memory_with_format(bytes, format.image_format())?;
    let gray = match img {
        DynamicImage::ImageLuma8(gray) => gray,
        other => {
            let rgb = other.to_rgb8();
            GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
                let p = rgb.get_pixel(x, y);
                let luma = 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32;
                image::Luma([luma.round().clamp(0.0, 255.0) as u8])
            })
        }
    };
    if gray.width() == 0 || gray.height() == 0 {
        return Err(Error::Decode("decoded image has no pixels".into()));
    }
    Ok(gray)
}

fn gray_to_f32(gray: &GrayImage) -> Array2<f32> {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    Array2::from_shape_fn((h, w), |(y, x)| gray.get_pixel(x as u32, y as u32)[0] as f32)
}

/// Bilinear resample without corner alignment or half-pixel centres.
pub fn resize_bilinear(src: &Array2<f32>, out_h: usize, out_w: usize) -> Result<Array2<f32>> {
    let (in_h, in_w) = src.dim();
    if in_h == 0 || in_w == 0 || out_h == 0 || out_w == 0 {
        return Err(Error::Resize(format!(
            "cannot resize {in_w}x{in_h} to {out_w}x{out_h}"
        )));
    }
    let ys = interpolation_weights(in_h, out_h);
    let xs = interpolation_weights(in_w, out_w);
    let mut out = Array2::<f32>::zeros((out_h, out_w));
    for (y, &(top, bottom, y_lerp)) in ys.iter().enumerate() {
        for (x, &(left, right, x_lerp)) in xs.iter().enumerate() {
            let top_left = src[[top, left]];
            let top_right = src[[top, right]];
            let bottom_left = src[[bottom, left]];
            let bottom_right = src[[bottom, right]];
            let top_row = top_left + (top_right - top_left) * x_lerp;
            let bottom_row = bottom_left + (bottom_right - bottom_left) * x_lerp;
            out[[y, x]] = top_row + (bottom_row - top_row) * y_lerp;
        }
    }
    Ok(out)
}

fn interpolation_weights(in_size: usize, out_size: usize) -> Vec<(usize, usize, f32)> {
    let scale = in_size as f32 / out_size as f32;
    (0..out_size)
        .map(|i| {
            let pos = i as f32 * scale;
            let lower = (pos.floor() as usize).min(in_size - 1);
            let upper = (lower + 1).min(in_size - 1);
            (lower, upper, pos - lower as f32)
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use image::{DynamicImage, GrayImage, ImageOutputFormat, RgbImage};
    use std::io::Cursor;

    pub fn jpeg_from_gray(img: GrayImage) -> Vec<u8> {
        encode(DynamicImage::ImageLuma8(img))
    }

    pub fn jpeg_from_rgb(img: RgbImage) -> Vec<u8> {
        encode(DynamicImage::ImageRgb8(img))
    }

    pub fn solid_gray_jpeg(width: u32, height: u32, value: u8) -> Vec<u8> {
        jpeg_from_gray(GrayImage::from_pixel(width, height, image::Luma([value])))
    }

    fn encode(img: DynamicImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageOutputFormat::Jpeg(100))
            .expect("encode fixture jpeg");
        buf.into_inner()
    }
}
