// 该文件是 Biaoqing （表情） 项目的一部分。
// src/output/directory_record.rs - 按日期归档叠加图与识别记录
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

use std::{
  fs::File,
  io::BufWriter,
  path::{Path, PathBuf},
};

use chrono::Datelike;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{Render, ensure_parent},
  task::{Explanation, RequestId},
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("记录序列化错误: {0}")]
  RecordError(#[from] serde_json::Error),
}

/// 与叠加图同名的 JSON 记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub id: String,
  pub label: String,
  pub class_index: usize,
  pub heatmap_class_index: usize,
  pub probabilities: Vec<f32>,
  pub heatmap_degenerate: bool,
  pub overlay_degenerate: bool,
}

impl Record {
  fn new(id: &RequestId, result: &Explanation) -> Self {
    Self {
      id: id.to_string(),
      label: result.label.clone(),
      class_index: result.class_index,
      heatmap_class_index: result.heatmap.class_index(),
      probabilities: result.prediction.scores().to_vec(),
      heatmap_degenerate: result.heatmap.is_degenerate(),
      overlay_degenerate: result.overlay.is_degenerate(),
    }
  }

  fn save(&self, path: &Path) -> Result<(), DirectoryRecordOutputError> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, self)?;
    Ok(())
  }
}

/// `folder:<dir>`，写入 `<dir>/YYYY/MM/DD/<请求标识>-<标签>.png`；
/// 查询参数 `record=false` 关闭 JSON 记录
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  record: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let record = uri
      .query_pairs()
      .find(|(k, _)| k == "record")
      .map(|(_, v)| v != "false" && v != "0")
      .unwrap_or(true);

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(uri.path()),
      record,
    })
  }
}

fn sanitize(label: &str) -> String {
  label
    .chars()
    .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
    .collect()
}

impl DirectoryRecordOutput {
  pub fn directory(&self) -> &Path {
    &self.directory
  }

  pub fn records_enabled(&self) -> bool {
    self.record
  }

  fn frame_path(&self, id: &RequestId, label: &str) -> PathBuf {
    let date = id.timestamp();
    self
      .directory
      .join(date.year().to_string())
      .join(format!("{:02}", date.month()))
      .join(format!("{:02}", date.day()))
      .join(format!("{}-{}.png", id, sanitize(label)))
  }
}

impl Render<Explanation> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, id: &RequestId, result: &Explanation) -> Result<PathBuf, Self::Error> {
    let path = self.frame_path(id, &result.label);
    ensure_parent(&path)?;
    result.overlay.to_rgb_image().save(&path)?;
    debug!("保存叠加图: {}", path.display());

    if self.record {
      Record::new(id, result).save(&path.with_extension("json"))?;
    }
    info!("请求 {} 的结果已保存到 {}", id, path.display());
    Ok(path)
  }
}
