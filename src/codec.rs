//! Conversions between pixel surfaces and the engine's planar `f32` tensors.
//!
//! Images enter the model letterboxed into a square: the content keeps its
//! aspect ratio and is centred, the remainder is filled with a pad colour.
//! Masks go through the same geometry so both stay aligned.

use crate::tensor::{ShapeMismatchError, Tensor};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};
use ndarray::{Array4, ArrayView3};
use serde::{Deserialize, Serialize};

const CHANNELS: usize = 3;

/// Width and height in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub w: u32,
    pub h: u32,
}

impl Size {
    pub const fn new(w: u32, h: u32) -> Self {
        Size { w, h }
    }

    pub const fn square(side: u32) -> Self {
        Size { w: side, h: side }
    }

    pub fn of_rgb(image: &RgbImage) -> Self {
        Size::new(image.width(), image.height())
    }

    pub fn of_gray(image: &GrayImage) -> Self {
        Size::new(image.width(), image.height())
    }

    fn validate(self) -> CodecResult<Self> {
        if self.w == 0 || self.h == 0 {
            Err(CodecError::InvalidGeometry {
                width: self.w,
                height: self.h,
            })
        } else {
            Ok(self)
        }
    }
}

/// Placement of resized content inside a target canvas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PadBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Numeric range pixel samples are mapped to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelRange {
    /// 0.0 ..= 1.0
    #[default]
    Unit,
    /// 0.0 ..= 255.0
    Byte,
}

impl PixelRange {
    fn scale(self) -> f32 {
        match self {
            PixelRange::Unit => 255.0,
            PixelRange::Byte => 1.0,
        }
    }

    pub fn normalize(self, sample: u8) -> f32 {
        sample as f32 / self.scale()
    }

    /// Inverse of `normalize`. NaN maps to 0, everything else is clamped.
    pub fn denormalize(self, value: f32) -> u8 {
        if value.is_nan() {
            return 0;
        }
        (value * self.scale()).round().clamp(0.0, 255.0) as u8
    }
}

/// Pure geometry: where a `source` sized surface lands inside `target`
/// without distortion. The content is scaled to touch the target on its
/// longer side and centred on the other; offsets are floored.
pub fn resize_and_pad_box(source: Size, target: Size) -> CodecResult<PadBox> {
    let source = source.validate()?;
    let target = target.validate()?;

    let scale = f64::min(
        target.w as f64 / source.w as f64,
        target.h as f64 / source.h as f64,
    );

    let w = ((source.w as f64 * scale).round() as u32).clamp(1, target.w);
    let h = ((source.h as f64 * scale).round() as u32).clamp(1, target.h);

    Ok(PadBox {
        x: (target.w - w) / 2,
        y: (target.h - h) / 2,
        w,
        h,
    })
}

/// Image/mask ↔ tensor conversion with configurable value ranges.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorCodec {
    /// Range image samples are normalised to on the way in
    pub input_range: PixelRange,
    /// Range the engine's output tensor is expressed in
    pub output_range: PixelRange,
    pub pad_color: [u8; 3],
}

impl Default for TensorCodec {
    fn default() -> Self {
        TensorCodec {
            input_range: PixelRange::Unit,
            output_range: PixelRange::Unit,
            pad_color: [0, 0, 0],
        }
    }
}

impl TensorCodec {
    /// The exported LaMa graph takes images in 0..1 and emits 0..255.
    pub fn lama() -> Self {
        TensorCodec {
            output_range: PixelRange::Byte,
            ..Default::default()
        }
    }

    /// Letterbox `image` into `target` and lay it out as `[1, 3, H, W]`.
    pub fn image_to_tensor(&self, image: &RgbImage, target: Size) -> CodecResult<Tensor> {
        let canvas = self.letterbox(image, target)?;
        let (w, h) = (target.w as usize, target.h as usize);

        let mut planes = Array4::<f32>::zeros((1, CHANNELS, h, w));
        for (x, y, pixel) in canvas.enumerate_pixels() {
            for c in 0..CHANNELS {
                planes[[0, c, y as usize, x as usize]] = self.input_range.normalize(pixel[c]);
            }
        }

        Ok(Tensor::new(vec![1, CHANNELS, h, w], planes.into_raw_vec())?)
    }

    /// Letterbox `mask` into `target`, binarise it (`> 0` becomes 1.0) and lay
    /// it out as `[1, 1, H, W]`. Padding never marks pixels for removal.
    pub fn mask_to_tensor(&self, mask: &GrayImage, target: Size) -> CodecResult<Tensor> {
        let source = Size::of_gray(mask).validate()?;
        let placed = resize_and_pad_box(source, target)?;

        let resized = imageops::resize(mask, placed.w, placed.h, FilterType::Nearest);
        let mut canvas = GrayImage::from_pixel(target.w, target.h, Luma([0]));
        imageops::overlay(&mut canvas, &resized, placed.x as i64, placed.y as i64);

        let data = canvas
            .pixels()
            .map(|p| if p[0] > 0 { 1.0 } else { 0.0 })
            .collect();

        Ok(Tensor::new(
            vec![1, 1, target.h as usize, target.w as usize],
            data,
        )?)
    }

    /// Interleave a `[1, 3, H, W]` or `[3, H, W]` tensor back into pixels.
    pub fn tensor_to_image(&self, tensor: &Tensor) -> CodecResult<RgbImage> {
        let (h, w) = match tensor.shape() {
            [1, c, h, w] | [c, h, w] if *c == CHANNELS => (*h, *w),
            other => return Err(CodecError::UnexpectedLayout(other.to_vec())),
        };

        Size::new(w as u32, h as u32).validate()?;

        let planes = ArrayView3::from_shape((CHANNELS, h, w), tensor.data())
            .map_err(|_| CodecError::UnexpectedLayout(tensor.shape().to_vec()))?;

        let range = self.output_range;
        Ok(RgbImage::from_fn(w as u32, h as u32, |x, y| {
            let (x, y) = (x as usize, y as usize);
            Rgb([
                range.denormalize(planes[[0, y, x]]),
                range.denormalize(planes[[1, y, x]]),
                range.denormalize(planes[[2, y, x]]),
            ])
        }))
    }

    /// Cut the content box of a letterboxed `result` out again and scale it
    /// back to the `source` dimensions it was produced from.
    pub fn unletterbox(&self, result: &RgbImage, source: Size) -> CodecResult<RgbImage> {
        let placed = resize_and_pad_box(source, Size::of_rgb(result))?;
        let content = imageops::crop_imm(result, placed.x, placed.y, placed.w, placed.h).to_image();

        if Size::of_rgb(&content) == source {
            return Ok(content);
        }
        Ok(imageops::resize(&content, source.w, source.h, FilterType::Triangle))
    }

    /// Letterbox an uploaded image into a square of its longer side.
    pub fn pad_to_square(&self, image: &RgbImage) -> CodecResult<RgbImage> {
        let size = Size::of_rgb(image).validate()?;
        self.letterbox(image, Size::square(size.w.max(size.h)))
    }

    fn letterbox(&self, image: &RgbImage, target: Size) -> CodecResult<RgbImage> {
        let source = Size::of_rgb(image).validate()?;
        let placed = resize_and_pad_box(source, target)?;

        let mut canvas = RgbImage::from_pixel(target.w, target.h, Rgb(self.pad_color));

        if placed.w == source.w && placed.h == source.h {
            imageops::overlay(&mut canvas, image, placed.x as i64, placed.y as i64);
        } else {
            let resized = imageops::resize(image, placed.w, placed.h, FilterType::Triangle);
            imageops::overlay(&mut canvas, &resized, placed.x as i64, placed.y as i64);
        }

        Ok(canvas)
    }
}

pub type CodecResult<T> = Result<T, CodecError>;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("degenerate surface of {width}x{height} pixels")]
    InvalidGeometry { width: u32, height: u32 },

    #[error("expected a [1, 3, H, W] or [3, H, W] tensor, got {0:?}")]
    UnexpectedLayout(Vec<usize>),

    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatchError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: u8, b: u8, tolerance: u8) -> bool {
        a.abs_diff(b) <= tolerance
    }

    #[test]
    fn square_source_fills_target() {
        let placed = resize_and_pad_box(Size::square(1024), Size::square(512)).unwrap();
        assert_eq!(placed, PadBox { x: 0, y: 0, w: 512, h: 512 });
    }

    #[test]
    fn portrait_source_is_centred_horizontally() {
        let placed = resize_and_pad_box(Size::new(300, 600), Size::square(512)).unwrap();
        assert_eq!(placed, PadBox { x: 128, y: 0, w: 256, h: 512 });
    }

    #[test]
    fn landscape_source_is_centred_vertically() {
        let placed = resize_and_pad_box(Size::new(1000, 500), Size::square(512)).unwrap();
        assert_eq!(placed, PadBox { x: 0, y: 128, w: 512, h: 256 });
    }

    #[test]
    fn geometry_is_deterministic() {
        let a = resize_and_pad_box(Size::new(333, 777), Size::square(512)).unwrap();
        let b = resize_and_pad_box(Size::new(333, 777), Size::square(512)).unwrap();
        assert_eq!(a, b);
        assert!(a.x + a.w <= 512 && a.y + a.h <= 512);
    }

    #[test]
    fn zero_area_is_rejected() {
        assert!(matches!(
            resize_and_pad_box(Size::new(0, 10), Size::square(512)),
            Err(CodecError::InvalidGeometry { .. })
        ));
        assert!(matches!(
            resize_and_pad_box(Size::new(10, 10), Size::new(512, 0)),
            Err(CodecError::InvalidGeometry { .. })
        ));

        let codec = TensorCodec::default();
        assert!(codec.image_to_tensor(&RgbImage::new(0, 0), Size::square(8)).is_err());
        assert!(codec.mask_to_tensor(&GrayImage::new(4, 0), Size::square(8)).is_err());
    }

    #[test]
    fn image_tensor_is_planar_and_normalised() {
        let codec = TensorCodec::default();
        let image = RgbImage::from_pixel(2, 2, Rgb([255, 0, 51]));

        let tensor = codec.image_to_tensor(&image, Size::square(2)).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 2, 2]);

        let data = tensor.data();
        assert!(data[0..4].iter().all(|v| (*v - 1.0).abs() < 1e-6));
        assert!(data[4..8].iter().all(|v| *v == 0.0));
        assert!(data[8..12].iter().all(|v| (*v - 0.2).abs() < 1e-6));
    }

    #[test]
    fn uniform_image_round_trips() {
        let codec = TensorCodec::default();
        let image = RgbImage::from_pixel(100, 100, Rgb([200, 120, 30]));

        let tensor = codec.image_to_tensor(&image, Size::square(64)).unwrap();
        let back = codec.tensor_to_image(&tensor).unwrap();

        assert_eq!(Size::of_rgb(&back), Size::square(64));
        for pixel in back.pixels() {
            assert!(close(pixel[0], 200, 2));
            assert!(close(pixel[1], 120, 2));
            assert!(close(pixel[2], 30, 2));
        }
    }

    #[test]
    fn letterbox_pads_outside_the_content_box() {
        let codec = TensorCodec::default();
        let image = RgbImage::from_pixel(200, 100, Rgb([255, 255, 255]));

        let back = codec
            .tensor_to_image(&codec.image_to_tensor(&image, Size::square(64)).unwrap())
            .unwrap();

        // content occupies rows 16..48
        assert_eq!(back.get_pixel(32, 0), &Rgb([0, 0, 0]));
        assert_eq!(back.get_pixel(32, 63), &Rgb([0, 0, 0]));
        assert!(close(back.get_pixel(32, 32)[0], 255, 2));
    }

    #[test]
    fn mask_is_binarised_and_aligned() {
        let codec = TensorCodec::default();
        let mut mask = GrayImage::new(4, 2);
        mask.put_pixel(0, 0, Luma([7]));
        mask.put_pixel(3, 1, Luma([255]));

        let tensor = codec.mask_to_tensor(&mask, Size::square(4)).unwrap();
        assert_eq!(tensor.shape(), &[1, 1, 4, 4]);

        // landscape 4x2 lands in rows 1..3
        let data = tensor.data();
        assert_eq!(data[4], 1.0);
        assert_eq!(data[2 * 4 + 3], 1.0);
        assert_eq!(data.iter().filter(|v| **v == 1.0).count(), 2);
        assert!(data.iter().all(|v| *v == 0.0 || *v == 1.0));
    }

    #[test]
    fn output_is_clamped_and_nan_guarded() {
        let codec = TensorCodec::lama();
        let data = vec![f32::NAN, -20.0, 300.0, 127.6, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let tensor = Tensor::new(vec![3, 2, 2], data).unwrap();

        let image = codec.tensor_to_image(&tensor).unwrap();
        assert_eq!(image.get_pixel(0, 0)[0], 0);
        assert_eq!(image.get_pixel(1, 0)[0], 0);
        assert_eq!(image.get_pixel(0, 1)[0], 255);
        assert_eq!(image.get_pixel(1, 1)[0], 128);
    }

    #[test]
    fn foreign_layouts_are_rejected() {
        let codec = TensorCodec::default();
        let tensor = Tensor::zeros(vec![1, 1, 4, 4]);
        assert!(matches!(
            codec.tensor_to_image(&tensor),
            Err(CodecError::UnexpectedLayout(_))
        ));
    }

    #[test]
    fn unletterbox_restores_source_dimensions() {
        let codec = TensorCodec::default();
        let source = RgbImage::from_pixel(120, 60, Rgb([10, 200, 90]));

        let boxed = codec.letterbox(&source, Size::square(64)).unwrap();
        let restored = codec.unletterbox(&boxed, Size::of_rgb(&source)).unwrap();

        assert_eq!(Size::of_rgb(&restored), Size::new(120, 60));
        let center = restored.get_pixel(60, 30);
        assert!(close(center[1], 200, 3));
    }

    #[test]
    fn pad_to_square_keeps_pixels_unscaled() {
        let codec = TensorCodec::default();
        let image = RgbImage::from_pixel(30, 10, Rgb([1, 2, 3]));

        let square = codec.pad_to_square(&image).unwrap();
        assert_eq!(Size::of_rgb(&square), Size::square(30));
        assert_eq!(square.get_pixel(0, 10), &Rgb([1, 2, 3]));
        assert_eq!(square.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }
}
