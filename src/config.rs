// 该文件是 Biaoqing （表情） 项目的一部分。
// src/config.rs - 运行配置
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

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  frame::ColorMode,
  gradcam::{BlendWeights, ChannelOrder},
  input::Preprocessor,
  model::LabelTable,
};

pub const DEFAULT_MODEL: &str = "cnn:FER_64.json";
pub const DEFAULT_OUTPUT: &str = "folder:static/heatmaps";
pub const DEFAULT_LAYER: &str = "conv2d_40";
pub const DEFAULT_SIZE: u32 = 48;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("读取配置文件失败: {0}")]
  IoError(#[from] std::io::Error),
  #[error("配置文件格式错误: {0}")]
  FormatError(#[from] serde_json::Error),
  #[error("配置无效: {0}")]
  Invalid(String),
  #[error("URL 解析错误: {0}")]
  UrlError(#[from] url::ParseError),
}

/// 运行配置，未出现在配置文件中的字段取默认值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// 模型 URL，例如 `cnn:FER_64.json`
  pub model: String,
  pub width: u32,
  pub height: u32,
  pub color_mode: ColorMode,
  /// 用于计算热力图的中间层
  pub layer_name: String,
  pub blend: BlendWeights,
  pub labels: LabelTable,
  pub channel_order: ChannelOrder,
  /// 输出 URL，例如 `folder:static/heatmaps`
  pub output: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      model: DEFAULT_MODEL.to_string(),
      width: DEFAULT_SIZE,
      height: DEFAULT_SIZE,
      color_mode: ColorMode::default(),
      layer_name: DEFAULT_LAYER.to_string(),
      blend: BlendWeights::default(),
      labels: LabelTable::default(),
      channel_order: ChannelOrder::default(),
      output: DEFAULT_OUTPUT.to_string(),
    }
  }
}

impl Config {
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    info!("读取配置文件: {}", path.display());
    let data = std::fs::read(path)?;
    let config: Config = serde_json::from_slice(&data)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.width == 0 || self.height == 0 {
      return Err(ConfigError::Invalid(format!(
        "输入尺寸 {}x{} 无效",
        self.width, self.height
      )));
    }
    if self.layer_name.is_empty() {
      return Err(ConfigError::Invalid("未指定中间层名称".to_string()));
    }
    if self.labels.is_empty() {
      return Err(ConfigError::Invalid("标签表为空".to_string()));
    }
    Ok(())
  }

  pub fn model_url(&self) -> Result<Url, ConfigError> {
    Ok(Url::parse(&self.model)?)
  }

  pub fn output_url(&self) -> Result<Url, ConfigError> {
    Ok(Url::parse(&self.output)?)
  }

  pub fn preprocessor(&self) -> Preprocessor {
    Preprocessor::new(self.width, self.height, self.color_mode)
  }
}
