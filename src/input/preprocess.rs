// 该文件是 Biaoqing （表情） 项目的一部分。
// src/input/preprocess.rs - 解码、缩放与归一化
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use image::{DynamicImage, imageops::FilterType};
use tracing::{debug, warn};

use super::InputError;
use crate::frame::{ColorMode, ImageTensor, TensorShape};

/// 把任意常见格式的图像转换为模型输入：先转换颜色模式，再用最近邻缩放到固定尺寸，
/// 像素值除以 255
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preprocessor {
  width: u32,
  height: u32,
  color_mode: ColorMode,
}

impl Preprocessor {
  pub fn new(width: u32, height: u32, color_mode: ColorMode) -> Self {
    Self {
      width,
      height,
      color_mode,
    }
  }

  pub fn shape(&self) -> TensorShape {
    TensorShape::new(
      self.height as usize,
      self.width as usize,
      self.color_mode.channels(),
    )
  }

  pub fn preprocess(&self, bytes: &[u8]) -> Result<ImageTensor, InputError> {
    if bytes.is_empty() {
      return Err(InputError::NoInput);
    }
    let image = image::load_from_memory(bytes).inspect_err(|e| {
      warn!("图像解码失败: {}", e);
    })?;
    Ok(self.preprocess_image(&image))
  }

  pub fn preprocess_image(&self, image: &DynamicImage) -> ImageTensor {
    debug!(
      "预处理图像: {}x{} -> {}x{} ({:?})",
      image.width(),
      image.height(),
      self.width,
      self.height,
      self.color_mode
    );
    match self.color_mode {
      ColorMode::Grayscale => {
        let gray = image.to_luma8();
        let resized = image::imageops::resize(&gray, self.width, self.height, FilterType::Nearest);
        ImageTensor::from(&resized)
      }
      ColorMode::Rgb => {
        let rgb = image.to_rgb8();
        let resized = image::imageops::resize(&rgb, self.width, self.height, FilterType::Nearest);
        ImageTensor::from(&resized)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{ImageFormat, Rgb, RgbImage};
  use std::io::Cursor;

  fn encode_png(image: &RgbImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
    bytes
  }

  #[test]
  fn converts_to_grayscale_tensor_of_fixed_shape() {
    let image = RgbImage::from_pixel(96, 64, Rgb([255, 255, 255]));
    let preprocessor = Preprocessor::new(48, 48, ColorMode::Grayscale);

    let tensor = preprocessor.preprocess(&encode_png(&image)).unwrap();
    assert_eq!(tensor.shape(), TensorShape::new(48, 48, 1));
    assert_eq!(tensor.shape(), preprocessor.shape());
    assert!(tensor.view().iter().all(|&v| v == 1.0));
  }

  #[test]
  fn rgb_mode_keeps_three_channels() {
    let image = RgbImage::from_pixel(10, 10, Rgb([255, 0, 0]));
    let preprocessor = Preprocessor::new(4, 4, ColorMode::Rgb);

    let tensor = preprocessor.preprocess(&encode_png(&image)).unwrap();
    assert_eq!(tensor.shape(), TensorShape::new(4, 4, 3));
    assert_eq!(tensor.intensity(0, 0, 0), 1.0);
    assert_eq!(tensor.intensity(0, 0, 1), 0.0);
  }

  #[test]
  fn empty_and_garbage_uploads_are_no_input() {
    let preprocessor = Preprocessor::new(48, 48, ColorMode::Grayscale);

    let err = preprocessor.preprocess(&[]).unwrap_err();
    assert!(matches!(err, InputError::NoInput));

    let err = preprocessor.preprocess(b"definitely not an image").unwrap_err();
    assert!(matches!(err, InputError::Unsupported(_)));
    assert!(err.is_no_input());
  }
}
