// 该文件是 Biaoqing （表情） 项目的一部分。
// src/model/format.rs - 模型文件格式与加载
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

use ndarray::{Array1, Array2, Array4};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use url::Url;

use super::{
  ClassifierError,
  layers::{Activation, Layer, Op, Padding},
  sequential::{Sequential, SequentialBuilder},
};
use crate::{FromUrl, FromUrlWithScheme, frame::TensorShape};

fn default_epsilon() -> f32 {
  1e-3
}

/// JSON 模型文件，权重均为按行优先展开的一维数组
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFile {
  /// [height, width, channels]
  pub input_shape: [usize; 3],
  pub layers: Vec<LayerSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSpec {
  pub name: String,
  #[serde(flatten)]
  pub kind: LayerKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerKind {
  /// weights 排布为 [kh, kw, c_in, filters]
  Conv2d {
    filters: usize,
    kernel_size: [usize; 2],
    #[serde(default)]
    padding: Padding,
    #[serde(default)]
    activation: Activation,
    weights: Vec<f32>,
    #[serde(default)]
    bias: Option<Vec<f32>>,
  },
  MaxPool2d {
    pool_size: [usize; 2],
  },
  BatchNorm {
    gamma: Vec<f32>,
    beta: Vec<f32>,
    moving_mean: Vec<f32>,
    moving_variance: Vec<f32>,
    #[serde(default = "default_epsilon")]
    epsilon: f32,
  },
  Dropout {
    #[serde(default)]
    rate: f32,
  },
  Activation {
    activation: Activation,
  },
  Flatten,
  /// weights 排布为 [inputs, units]
  Dense {
    units: usize,
    #[serde(default)]
    activation: Activation,
    weights: Vec<f32>,
    #[serde(default)]
    bias: Option<Vec<f32>>,
  },
  GlobalAveragePool2d,
}

impl LayerSpec {
  fn into_layer(self) -> Result<Layer, ClassifierError> {
    let name = self.name;
    let op = match self.kind {
      LayerKind::Conv2d {
        filters,
        kernel_size: [kh, kw],
        padding,
        activation,
        weights,
        bias,
      } => {
        let per_input = kh * kw * filters;
        if per_input == 0 || weights.len() % per_input != 0 {
          return Err(ClassifierError::invalid(format!(
            "层 '{}': 权重长度 {} 不是 {}x{}x{} 的整数倍",
            name,
            weights.len(),
            kh,
            kw,
            filters
          )));
        }
        let c_in = weights.len() / per_input;
        Op::Conv2d {
          kernel: Array4::from_shape_vec((kh, kw, c_in, filters), weights)?,
          bias: bias.map(Array1::from).unwrap_or_else(|| Array1::zeros(filters)),
          padding,
          activation,
        }
      }
      LayerKind::MaxPool2d { pool_size: [ph, pw] } => Op::MaxPool2d { pool: (ph, pw) },
      LayerKind::BatchNorm {
        gamma,
        beta,
        moving_mean,
        moving_variance,
        epsilon,
      } => Op::BatchNorm {
        gamma: Array1::from(gamma),
        beta: Array1::from(beta),
        mean: Array1::from(moving_mean),
        variance: Array1::from(moving_variance),
        epsilon,
      },
      LayerKind::Dropout { rate } => {
        debug!("层 '{}': dropout({}) 推理时不生效", name, rate);
        Op::Dropout
      }
      LayerKind::Activation { activation } => Op::Activation(activation),
      LayerKind::Flatten => Op::Flatten,
      LayerKind::Dense {
        units,
        activation,
        weights,
        bias,
      } => {
        if units == 0 || weights.len() % units != 0 {
          return Err(ClassifierError::invalid(format!(
            "层 '{}': 权重长度 {} 不是 {} 的整数倍",
            name,
            weights.len(),
            units
          )));
        }
        let inputs = weights.len() / units;
        Op::Dense {
          kernel: Array2::from_shape_vec((inputs, units), weights)?,
          bias: bias.map(Array1::from).unwrap_or_else(|| Array1::zeros(units)),
          activation,
        }
      }
      LayerKind::GlobalAveragePool2d => Op::GlobalAveragePool2d,
    };
    Ok(Layer::new(name, op))
  }
}

impl ModelFile {
  pub fn into_sequential(self) -> Result<Sequential, ClassifierError> {
    let [h, w, c] = self.input_shape;
    self
      .layers
      .into_iter()
      .try_fold(SequentialBuilder::new(TensorShape::new(h, w, c)), |builder, spec| {
        Ok::<_, ClassifierError>(builder.layer(spec.into_layer()?))
      })?
      .build()
  }
}

/// 通过 `cnn:<path>` 加载 JSON 模型文件
pub struct SequentialLoader {
  model_path: String,
}

impl FromUrlWithScheme for SequentialLoader {
  const SCHEME: &'static str = "cnn";
}

impl FromUrl for SequentialLoader {
  type Error = ClassifierError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ClassifierError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    Ok(SequentialLoader {
      model_path: url.path().to_string(),
    })
  }
}

impl SequentialLoader {
  pub fn model_path(&self) -> &str {
    &self.model_path
  }

  pub fn build(self) -> Result<Sequential, ClassifierError> {
    info!("加载模型文件: {}", self.model_path);
    let data = std::fs::read(&self.model_path)?;
    debug!("模型文件大小: {:.2} MB", data.len() as f64 / (1024.0 * 1024.0));

    let file: ModelFile = serde_json::from_slice(&data).inspect_err(|e| {
      error!("模型文件解析失败: {}", e);
    })?;
    let model = file.into_sequential()?;
    info!("模型加载完成: {} 层", model.layers().len());
    Ok(model)
  }
}
