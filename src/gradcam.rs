// 该文件是 Biaoqing （表情） 项目的一部分。
// src/gradcam.rs - Grad-CAM 热力图计算与叠加
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

//! Grad-CAM：对目标类别得分求中间卷积层输出的梯度，按空间平均得到每个通道的权重，
//! 加权合成单通道热力图，截去负值后按最大值归一化到 [0, 1]。

use std::fmt;

use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage, imageops::FilterType};
use imageproc::map::map_pixels as map_colors;
use ndarray::{Array, Array2, Array3, Axis, Dimension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  frame::ImageTensor,
  model::{ActivationCapture, CaptureLayer, ClassifierError},
};

mod colormap;
pub use self::colormap::Colormap;

const RGB_CHANNELS: usize = 3;
const DISPLAY_MAX: f32 = 255.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationStage {
  Heatmap,
  Overlay,
}

impl fmt::Display for NormalizationStage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      NormalizationStage::Heatmap => write!(f, "热力图"),
      NormalizationStage::Overlay => write!(f, "叠加图"),
    }
  }
}

/// 归一化分母为零或非有限值，由调用方就地替换为兜底结果
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum NormalizationError {
  #[error("{stage}归一化失败: 最大值为 {max}")]
  Degenerate { stage: NormalizationStage, max: f32 },
}

#[derive(Error, Debug)]
pub enum AttributionError {
  #[error("分类模型错误: {0}")]
  Classifier(#[from] ClassifierError),
  #[error("热力图为空")]
  EmptyHeatmap,
  #[error("图像为空")]
  EmptyImage,
  #[error("不支持 {0} 通道的图像")]
  UnsupportedChannels(usize),
}

/// 叠加权重：`overlay = color * heatmap + original * (1 - image)`，两者相互独立
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendWeights {
  pub heatmap: f32,
  pub image: f32,
}

impl Default for BlendWeights {
  fn default() -> Self {
    Self {
      heatmap: 0.004,
      image: 0.0005,
    }
  }
}

/// 输出像素的通道顺序；内部统一使用 RGB，仅在 I/O 边界转换
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
  #[default]
  Rgb,
  Bgr,
}

/// 按最大值归一化，最大值不为正或不是有限值时报错
pub fn normalize_by_max<D: Dimension>(
  values: Array<f32, D>,
  stage: NormalizationStage,
) -> Result<Array<f32, D>, NormalizationError> {
  let max = values.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
  if !(max > 0.0 && max.is_finite()) {
    return Err(NormalizationError::Degenerate { stage, max });
  }
  Ok(values.mapv_into(|v| v / max))
}

/// 归一化到 [0, 1] 的类激活热力图，分辨率与被捕获层一致
#[derive(Debug, Clone, PartialEq)]
pub struct Heatmap {
  values: Array2<f32>,
  class_index: usize,
  degenerate: bool,
}

impl Heatmap {
  pub fn values(&self) -> &Array2<f32> {
    &self.values
  }

  pub fn class_index(&self) -> usize {
    self.class_index
  }

  /// 没有任何正贡献时为 true，此时热力图全为 0
  pub fn is_degenerate(&self) -> bool {
    self.degenerate
  }

  pub fn height(&self) -> usize {
    self.values.nrows()
  }

  pub fn width(&self) -> usize {
    self.values.ncols()
  }
}

/// 计算 `class_index` 类（缺省为预测得分最高的类）在 `layer_name` 层上的 Grad-CAM 热力图
pub fn compute_heatmap<M: CaptureLayer>(
  model: &M,
  input: &ImageTensor,
  layer_name: &str,
  class_index: Option<usize>,
) -> Result<Heatmap, AttributionError> {
  let capture = model.activations_and_prediction(input, layer_name)?;
  let class_index = class_index.unwrap_or_else(|| capture.predictions().argmax());

  let grads = capture.gradient(class_index)?;
  let activations = capture.activations();
  let (h, w, c) = activations.dim();
  if h * w * c == 0 {
    return Err(AttributionError::EmptyHeatmap);
  }

  let weights = grads.sum_axis(Axis(0)).sum_axis(Axis(0)) / (h * w) as f32;
  debug!("通道权重: {} 个, 类别 {}", weights.len(), class_index);

  let cam = (activations * &weights).sum_axis(Axis(2)) / c as f32;
  // NaN 经 max 后也变为 0
  let cam = cam.mapv_into(|v| v.max(0.0));

  let (values, degenerate) = match normalize_by_max(cam, NormalizationStage::Heatmap) {
    Ok(values) => (values, false),
    Err(e) => {
      warn!("{}，返回全零热力图", e);
      (Array2::zeros((h, w)), true)
    }
  };

  Ok(Heatmap {
    values,
    class_index,
    degenerate,
  })
}

/// 叠加结果，像素按 `order` 指定的通道顺序交错存储
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
  width: u32,
  height: u32,
  order: ChannelOrder,
  data: Box<[u8]>,
  degenerate: bool,
}

impl Overlay {
  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channel_order(&self) -> ChannelOrder {
    self.order
  }

  pub fn as_raw(&self) -> &[u8] {
    &self.data
  }

  /// 归一化失败、退回原图时为 true
  pub fn is_degenerate(&self) -> bool {
    self.degenerate
  }

  /// (x, y) 处的像素，通道顺序与 `channel_order` 一致
  pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
    let idx = ((y * self.width + x) as usize) * RGB_CHANNELS;
    [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
  }

  pub fn to_rgb_image(&self) -> RgbImage {
    ImageBuffer::from_fn(self.width, self.height, |x, y| {
      let [a, b, c] = self.pixel(x, y);
      match self.order {
        ChannelOrder::Rgb => Rgb([a, b, c]),
        ChannelOrder::Bgr => Rgb([c, b, a]),
      }
    })
  }
}

/// 将热力图着色、上采样到原图尺寸后与原图混合
pub fn composite(
  original: &ImageTensor,
  heatmap: &Heatmap,
  weights: BlendWeights,
  order: ChannelOrder,
) -> Result<Overlay, AttributionError> {
  let (height, width, channels) = original.shape().dim();
  if height * width == 0 {
    return Err(AttributionError::EmptyImage);
  }
  if channels != 1 && channels != RGB_CHANNELS {
    return Err(AttributionError::UnsupportedChannels(channels));
  }
  if heatmap.values.is_empty() {
    return Err(AttributionError::EmptyHeatmap);
  }

  let quantized = GrayImage::from_fn(heatmap.width() as u32, heatmap.height() as u32, |x, y| {
    Luma([(heatmap.values[[y as usize, x as usize]] * DISPLAY_MAX) as u8])
  });
  let colormap = Colormap::jet();
  let colored: ImageBuffer<Rgb<f32>, Vec<f32>> = map_colors(&quantized, |Luma([level])| colormap.color(level));
  let colored = image::imageops::resize(&colored, width as u32, height as u32, FilterType::Triangle);
  debug!(
    "热力图上采样: {}x{} -> {}x{}",
    heatmap.width(),
    heatmap.height(),
    width,
    height
  );

  let blended = Array3::from_shape_fn((height, width, RGB_CHANNELS), |(y, x, c)| {
    let color = colored.get_pixel(x as u32, y as u32)[c] * DISPLAY_MAX;
    color * weights.heatmap + original.intensity(x, y, c) * (1.0 - weights.image)
  });

  let (normalized, degenerate) = match normalize_by_max(blended, NormalizationStage::Overlay) {
    Ok(values) => (values, false),
    Err(e) => {
      warn!("{}，退回原图", e);
      let original = Array3::from_shape_fn((height, width, RGB_CHANNELS), |(y, x, c)| {
        original.intensity(x, y, c)
      });
      (original, true)
    }
  };

  let mut data = Vec::with_capacity(height * width * RGB_CHANNELS);
  for px in normalized.lanes(Axis(2)) {
    let ordered = match order {
      ChannelOrder::Rgb => [px[0], px[1], px[2]],
      ChannelOrder::Bgr => [px[2], px[1], px[0]],
    };
    data.extend(ordered.map(to_display));
  }

  Ok(Overlay {
    width: width as u32,
    height: height as u32,
    order,
    data: data.into_boxed_slice(),
    degenerate,
  })
}

fn to_display(v: f32) -> u8 {
  if v.is_finite() {
    (v * DISPLAY_MAX).round().clamp(0.0, DISPLAY_MAX) as u8
  } else {
    0
  }
}
