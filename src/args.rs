// 该文件是 Biaoqing （表情） 项目的一部分。
// src/args.rs - 命令行参数
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

use std::path::PathBuf;

use clap::Args;
use url::Url;

use crate::{
  config::{Config, ConfigError},
  frame::ColorMode,
  gradcam::ChannelOrder,
};

/// Biaoqing 公共参数，命令行参数覆盖配置文件中的同名项
#[derive(Args, Debug, Clone)]
pub struct ExplainArgs {
  /// JSON 配置文件
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,

  /// 模型文件，例如 cnn:FER_64.json
  #[arg(long, value_name = "MODEL")]
  pub model: Option<Url>,

  /// 输入来源
  /// 支持格式:
  /// - 单个图像: image:face.jpg
  /// - 目录: folder:faces
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 输出路径
  /// 支持格式:
  /// - 单个文件: image:heatmap.png
  /// - 按日期归档: folder:static/heatmaps[?record=false]
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,

  /// 用于计算热力图的中间层
  #[arg(long, value_name = "LAYER")]
  pub layer: Option<String>,

  /// 热力图对应的类别，缺省为预测类别
  #[arg(long, value_name = "INDEX")]
  pub class_index: Option<usize>,

  #[arg(long, value_name = "WEIGHT")]
  pub heatmap_weight: Option<f32>,

  #[arg(long, value_name = "WEIGHT")]
  pub image_weight: Option<f32>,

  #[arg(long, value_name = "PIXELS")]
  pub width: Option<u32>,

  #[arg(long, value_name = "PIXELS")]
  pub height: Option<u32>,

  #[arg(long, value_enum)]
  pub color_mode: Option<ColorMode>,

  #[arg(long, value_enum)]
  pub channel_order: Option<ChannelOrder>,
}

impl ExplainArgs {
  pub fn load_config(&self) -> Result<Config, ConfigError> {
    let mut config = match &self.config {
      Some(path) => Config::from_json_file(path)?,
      None => Config::default(),
    };
    self.apply(&mut config);
    config.validate()?;
    Ok(config)
  }

  pub fn apply(&self, config: &mut Config) {
    if let Some(model) = &self.model {
      config.model = model.to_string();
    }
    if let Some(output) = &self.output {
      config.output = output.to_string();
    }
    if let Some(layer) = &self.layer {
      config.layer_name = layer.clone();
    }
    if let Some(weight) = self.heatmap_weight {
      config.blend.heatmap = weight;
    }
    if let Some(weight) = self.image_weight {
      config.blend.image = weight;
    }
    if let Some(width) = self.width {
      config.width = width;
    }
    if let Some(height) = self.height {
      config.height = height;
    }
    if let Some(color_mode) = self.color_mode {
      config.color_mode = color_mode;
    }
    if let Some(channel_order) = self.channel_order {
      config.channel_order = channel_order;
    }
  }
}
