// 该文件是 Biaoqing （表情） 项目的一部分。
// src/input/directory_input.rs - 目录批量输入
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

use tracing::{info, warn};
use url::Url;

use super::{InputError, Upload};
use crate::{FromUrl, FromUrlWithScheme};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "webp"];

fn is_image_file(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| {
      let ext = ext.to_lowercase();
      IMAGE_EXTENSIONS.contains(&ext.as_str())
    })
    .unwrap_or(false)
}

/// `folder:<dir>`，按文件名顺序逐个读取目录下的图像文件（不递归）
pub struct DirectoryInput {
  files: Vec<PathBuf>,
}

impl FromUrlWithScheme for DirectoryInput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryInput {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(InputError::SchemeMismatch(url.scheme().to_string()));
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(url.path())? {
      let path = entry?.path();
      if path.is_file() && is_image_file(&path) {
        files.push(path);
      }
    }
    files.sort();

    if files.is_empty() {
      warn!("目录 {} 中没有图像文件", url.path());
    } else {
      info!("目录 {} 中共有 {} 个图像文件", url.path(), files.len());
    }
    Ok(DirectoryInput { files })
  }
}

impl DirectoryInput {
  pub fn files(&self) -> &[PathBuf] {
    &self.files
  }
}

impl IntoIterator for DirectoryInput {
  type Item = Result<Upload, InputError>;
  type IntoIter = DirectoryInputIter;

  fn into_iter(self) -> Self::IntoIter {
    DirectoryInputIter {
      files: self.files.into_iter(),
    }
  }
}

pub struct DirectoryInputIter {
  files: std::vec::IntoIter<PathBuf>,
}

impl Iterator for DirectoryInputIter {
  type Item = Result<Upload, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    self.files.next().map(Upload::read)
  }
}
