// 该文件是 Biaoqing （表情） 项目的一部分。
// src/frame.rs - HWC 图像张量定义
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

use std::fmt;

use image::{GrayImage, RgbImage};
use ndarray::Array3;
use serde::{Deserialize, Serialize};

const GRAY_CHANNELS: usize = 1;
const RGB_CHANNELS: usize = 3;

/// 颜色模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
  #[default]
  Grayscale,
  Rgb,
}

impl ColorMode {
  pub fn channels(&self) -> usize {
    match self {
      ColorMode::Grayscale => GRAY_CHANNELS,
      ColorMode::Rgb => RGB_CHANNELS,
    }
  }
}

/// 张量形状，批次维度固定为 1，不在此记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorShape {
  pub height: usize,
  pub width: usize,
  pub channels: usize,
}

impl TensorShape {
  pub fn new(height: usize, width: usize, channels: usize) -> Self {
    Self {
      height,
      width,
      channels,
    }
  }

  pub fn dim(&self) -> (usize, usize, usize) {
    (self.height, self.width, self.channels)
  }

  pub fn len(&self) -> usize {
    self.height * self.width * self.channels
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl From<(usize, usize, usize)> for TensorShape {
  fn from((height, width, channels): (usize, usize, usize)) -> Self {
    Self::new(height, width, channels)
  }
}

impl fmt::Display for TensorShape {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "1x{}x{}x{}", self.height, self.width, self.channels)
  }
}

/// 模型输入张量，NHWC 排布（N = 1），数值归一化到 [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
  data: Array3<f32>,
}

impl ImageTensor {
  pub fn shape(&self) -> TensorShape {
    self.data.dim().into()
  }

  pub fn height(&self) -> usize {
    self.data.dim().0
  }

  pub fn width(&self) -> usize {
    self.data.dim().1
  }

  pub fn channels(&self) -> usize {
    self.data.dim().2
  }

  pub fn view(&self) -> ndarray::ArrayView3<'_, f32> {
    self.data.view()
  }

  pub fn into_inner(self) -> Array3<f32> {
    self.data
  }

  /// 取 (x, y) 处第 c 个通道的值；单通道图像对任意 c 都返回灰度值
  pub fn intensity(&self, x: usize, y: usize, c: usize) -> f32 {
    let c = if self.channels() == GRAY_CHANNELS { 0 } else { c };
    self.data[[y, x, c]]
  }
}

impl From<Array3<f32>> for ImageTensor {
  fn from(data: Array3<f32>) -> Self {
    Self { data }
  }
}

impl From<&GrayImage> for ImageTensor {
  fn from(image: &GrayImage) -> Self {
    let (width, height) = image.dimensions();
    let data = Array3::from_shape_fn((height as usize, width as usize, GRAY_CHANNELS), |(y, x, _)| {
      image.get_pixel(x as u32, y as u32)[0] as f32 / 255.0
    });
    Self { data }
  }
}

impl From<&RgbImage> for ImageTensor {
  fn from(image: &RgbImage) -> Self {
    let (width, height) = image.dimensions();
    let data = Array3::from_shape_fn((height as usize, width as usize, RGB_CHANNELS), |(y, x, c)| {
      image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    });
    Self { data }
  }
}
