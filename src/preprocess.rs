use std::str::FromStr;

use fast_image_resize::images::Image;
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use image::{DynamicImage, RgbImage};
use imageproc::filter::gaussian_blur_f32;
use ndarray::{Array3, Array4, Axis};
use rayon::prelude::*;

use crate::error::DecodeError;

#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl Default for PreprocessConfig {
    /// ImageNet statistics at the EfficientNet-B0 input resolution.
    fn default() -> Self {
        Self {
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
            height: 224,
            width: 224,
            channels: 3,
        }
    }
}

impl PreprocessConfig {
    pub fn with_size(mut self, height: usize, width: usize) -> Self {
        self.height = height;
        self.width = width;
        self
    }

    /// Tensor shape for a single image, `[1, C, H, W]`.
    pub fn input_shape(&self) -> [usize; 4] {
        [1, self.channels, self.height, self.width]
    }
}

/// Pixel-space transform applied after resizing and before normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreprocessMethod {
    /// Plain `[0, 1]` rescale followed by mean/std normalisation.
    #[default]
    Rescale,
    /// Ben Graham local-average subtraction, then the plain rescale.
    GaussianFiltered,
}

impl PreprocessMethod {
    pub fn name(self) -> &'static str {
        match self {
            PreprocessMethod::Rescale => "rescale_1_255",
            PreprocessMethod::GaussianFiltered => "gaussian_filtered",
        }
    }
}

impl FromStr for PreprocessMethod {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "rescale_1_255" | "rescale" => Ok(PreprocessMethod::Rescale),
            "gaussian_filtered" | "ben_graham" => Ok(PreprocessMethod::GaussianFiltered),
            other => Err(DecodeError::UnsupportedPreprocessing(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Processor {
    pub config: PreprocessConfig,
}

impl Processor {
    /// Create a new instance of the Processor struct
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Resize to exactly the configured input size (no letterboxing).
    pub fn resize_rgb(&self, image: &DynamicImage) -> Result<RgbImage, DecodeError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DecodeError::EmptyImage);
        }
        let src = DynamicImage::ImageRgb8(image.to_rgb8());
        let mut dst = Image::new(
            self.config.width as u32,
            self.config.height as u32,
            PixelType::U8x3,
        );
        let options =
            ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear));
        Resizer::new()
            .resize(&src, &mut dst, Some(&options))
            .map_err(|e| DecodeError::Preprocess(e.to_string()))?;

        RgbImage::from_raw(dst.width(), dst.height(), dst.into_vec())
            .ok_or_else(|| DecodeError::Preprocess("resized buffer has unexpected length".into()))
    }

    /// `4 * img - 4 * blur(img) + 128`, clamped to u8.
    pub fn gaussian_filter(&self, image: &RgbImage) -> RgbImage {
        let sigma = (self.config.width as f32 / 30.0).max(0.5);
        let blurred = gaussian_blur_f32(image, sigma);
        let mut out = image.clone();
        for (px, blur) in out.pixels_mut().zip(blurred.pixels()) {
            for c in 0..3 {
                let v = 4.0 * px[c] as f32 - 4.0 * blur[c] as f32 + 128.0;
                px[c] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
        out
    }

    /// CHW array with per-channel mean/std normalisation.
    pub fn normalize(&self, image: &RgbImage) -> Array3<f32> {
        let (w, h) = image.dimensions();
        let mut img_arr = Array3::<f32>::zeros((self.config.channels, h as usize, w as usize));
        for (x, y, rgb) in image.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..self.config.channels {
                img_arr[[c, y, x]] =
                    (rgb[c] as f32 / 255.0 - self.config.mean[c]) / self.config.std[c];
            }
        }
        img_arr
    }

    fn prepare(
        &self,
        image: &DynamicImage,
        method: PreprocessMethod,
    ) -> Result<(RgbImage, Array3<f32>), DecodeError> {
        let resized = self.resize_rgb(image)?;
        let tensor = match method {
            PreprocessMethod::Rescale => self.normalize(&resized),
            PreprocessMethod::GaussianFiltered => self.normalize(&self.gaussian_filter(&resized)),
        };
        Ok((resized, tensor))
    }

    /// Preprocess a single image. Returns the resized RGB image (for display)
    /// together with the `[1, C, H, W]` network input.
    pub fn preprocess_one(
        &self,
        image: &DynamicImage,
        method: PreprocessMethod,
    ) -> Result<(RgbImage, Array4<f32>), DecodeError> {
        let (resized, tensor) = self.prepare(image, method)?;
        Ok((resized, tensor.insert_axis(Axis(0))))
    }

    /// Preprocess a batch of images into an `[N, C, H, W]` array.
    pub fn preprocess(
        &self,
        xs: &[DynamicImage],
        method: PreprocessMethod,
    ) -> Result<Array4<f32>, DecodeError> {
        let img_arrs = xs
            .par_iter()
            .map(|x| self.prepare(x, method).map(|(_, arr)| arr))
            .collect::<Result<Vec<_>, DecodeError>>()?;

        let views: Vec<_> = img_arrs.iter().map(|arr| arr.view()).collect();
        ndarray::stack(Axis(0), &views).map_err(|e| DecodeError::Preprocess(e.to_string()))
    }
}
