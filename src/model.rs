// 该文件是 Biaoqing （表情） 项目的一部分。
// src/model.rs - 分类模型适配层
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

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{ImageTensor, TensorShape};

#[derive(Error, Debug)]
pub enum ClassifierError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型格式错误: {0}")]
  ModelFormatError(#[from] serde_json::Error),
  #[error("模型无效: {0}")]
  InvalidModel(String),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("模型中不存在层 '{0}'")]
  LayerNotFound(String),
  #[error("输入形状不匹配: 期望 {expected}, 实际 {actual}")]
  ShapeMismatch {
    expected: TensorShape,
    actual: TensorShape,
  },
  #[error("类别索引 {index} 超出范围 (共 {classes} 类)")]
  ClassIndexOutOfRange { index: usize, classes: usize },
  #[error("张量形状错误: {0}")]
  TensorShapeError(#[from] ndarray::ShapeError),
}

impl ClassifierError {
  pub fn invalid(msg: impl Into<String>) -> Self {
    ClassifierError::InvalidModel(msg.into())
  }
}

/// 一次前向推理得到的各类别得分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
  scores: Box<[f32]>,
}

impl Prediction {
  pub fn scores(&self) -> &[f32] {
    &self.scores
  }

  pub fn score(&self, class_index: usize) -> Option<f32> {
    self.scores.get(class_index).copied()
  }

  pub fn len(&self) -> usize {
    self.scores.len()
  }

  pub fn is_empty(&self) -> bool {
    self.scores.is_empty()
  }

  /// 得分最高的类别；并列时取索引最小者
  pub fn argmax(&self) -> usize {
    let mut best = 0usize;
    let mut best_score = f32::NEG_INFINITY;
    for (i, &score) in self.scores.iter().enumerate() {
      if score > best_score {
        best_score = score;
        best = i;
      }
    }
    best
  }
}

impl From<Vec<f32>> for Prediction {
  fn from(scores: Vec<f32>) -> Self {
    Self {
      scores: scores.into_boxed_slice(),
    }
  }
}

/// 分类模型：给定输入张量输出各类别得分
pub trait Classifier {
  type Error;

  /// 模型声明的输入形状
  fn input_shape(&self) -> TensorShape;

  fn predict(&self, input: &ImageTensor) -> Result<Prediction, Self::Error>;
}

/// 一次前向推理中捕获的中间层输出，可对其求类别得分的梯度
pub trait ActivationCapture {
  fn activations(&self) -> &Array3<f32>;

  fn predictions(&self) -> &Prediction;

  /// ∂ predictions[class_index] / ∂ activations，形状与 activations 一致
  fn gradient(&self, class_index: usize) -> Result<Array3<f32>, ClassifierError>;
}

/// 能够暴露指定中间层输出的分类模型
pub trait CaptureLayer: Classifier<Error = ClassifierError> {
  type Capture<'a>: ActivationCapture
  where
    Self: 'a;

  /// 单次前向推理，同时返回 `layer_name` 层的输出与最终预测
  fn activations_and_prediction<'a>(
    &'a self,
    input: &ImageTensor,
    layer_name: &str,
  ) -> Result<Self::Capture<'a>, ClassifierError>;
}

pub trait WithLabel: Sized + std::fmt::Debug {
  fn to_label_str(&self) -> String;
  fn to_label_id(&self) -> u32;
  fn from_label_id(id: u32) -> Option<Self>;
}

/// 表情类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emotion {
  Angry,
  Disgust,
  Fear,
  Happy,
  Neutral,
  Sad,
  Surprise,
}

impl Emotion {
  pub const ALL: [Emotion; 7] = [
    Emotion::Angry,
    Emotion::Disgust,
    Emotion::Fear,
    Emotion::Happy,
    Emotion::Neutral,
    Emotion::Sad,
    Emotion::Surprise,
  ];
}

impl WithLabel for Emotion {
  fn to_label_str(&self) -> String {
    match self {
      Emotion::Angry => "angry",
      Emotion::Disgust => "disgust",
      Emotion::Fear => "fear",
      Emotion::Happy => "happy",
      Emotion::Neutral => "neutral",
      Emotion::Sad => "sad",
      Emotion::Surprise => "surprise",
    }
    .to_string()
  }

  fn to_label_id(&self) -> u32 {
    *self as u32
  }

  fn from_label_id(id: u32) -> Option<Self> {
    Self::ALL.get(id as usize).copied()
  }
}

/// 类别索引到标签名的映射表，运行期只读
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelTable {
  labels: Vec<String>,
}

impl Default for LabelTable {
  fn default() -> Self {
    Self {
      labels: Emotion::ALL.iter().map(WithLabel::to_label_str).collect(),
    }
  }
}

impl LabelTable {
  pub fn new(labels: Vec<String>) -> Self {
    Self { labels }
  }

  pub fn label(&self, class_index: usize) -> Option<&str> {
    self.labels.get(class_index).map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }
}

mod format;
mod layers;
mod sequential;

pub use self::format::{LayerKind, LayerSpec, ModelFile, SequentialLoader};
pub use self::layers::{Activation, Layer, Op, Padding};
pub use self::sequential::{Sequential, SequentialBuilder, SequentialCapture};
