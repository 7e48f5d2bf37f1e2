// 该文件是 Biaoqing （表情） 项目的一部分。
// src/output.rs - 结果输出
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

use std::path::{Path, PathBuf};

use thiserror::Error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  task::{Explanation, RequestId},
};

/// 保存一次请求的结果，返回叠加图的保存路径
pub trait Render<Output>: Sized {
  type Error;
  fn render_result(&self, id: &RequestId, result: &Output) -> Result<PathBuf, Self::Error>;
}

mod directory_record;
mod save_image_file;

pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError, Record};
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub(crate) fn ensure_parent(path: &Path) -> std::io::Result<()> {
  match path.parent() {
    Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
    _ => Ok(()),
  }
}

pub enum OutputWrapper {
  SaveImageFileOutput(SaveImageFileOutput),
  DirectoryRecordOutput(DirectoryRecordOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      SaveImageFileOutput::SCHEME => {
        let output = SaveImageFileOutput::from_url(url)?;
        Ok(OutputWrapper::SaveImageFileOutput(output))
      }
      DirectoryRecordOutput::SCHEME => {
        let output = DirectoryRecordOutput::from_url(url)?;
        Ok(OutputWrapper::DirectoryRecordOutput(output))
      }
      scheme => Err(OutputError::SchemeMismatch(scheme.to_string())),
    }
  }
}

impl Render<Explanation> for OutputWrapper {
  type Error = OutputError;

  fn render_result(&self, id: &RequestId, result: &Explanation) -> Result<PathBuf, Self::Error> {
    match self {
      OutputWrapper::SaveImageFileOutput(output) => output
        .render_result(id, result)
        .map_err(OutputError::from),
      OutputWrapper::DirectoryRecordOutput(output) => output
        .render_result(id, result)
        .map_err(OutputError::from),
    }
  }
}
