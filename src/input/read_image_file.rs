// 该文件是 Biaoqing （表情） 项目的一部分。
// src/input/read_image_file.rs - 单个图像文件输入
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

use tracing::{debug, error};
use url::Url;

use super::{InputError, Upload};
use crate::{FromUrl, FromUrlWithScheme};

/// `image:<path>`，读出文件原始内容，解码推迟到预处理阶段
pub struct ImageFileInput {
  upload: Upload,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(InputError::SchemeMismatch(url.scheme().to_string()));
    }

    let upload = Upload::read(url.path())?;
    debug!("读取图像文件: {} ({} 字节)", url.path(), upload.bytes().len());
    Ok(ImageFileInput { upload })
  }
}

impl IntoIterator for ImageFileInput {
  type Item = Result<Upload, InputError>;
  type IntoIter = ImageFileInputIter;

  fn into_iter(self) -> Self::IntoIter {
    ImageFileInputIter {
      upload: Some(self.upload),
    }
  }
}

pub struct ImageFileInputIter {
  upload: Option<Upload>,
}

impl Iterator for ImageFileInputIter {
  type Item = Result<Upload, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    self.upload.take().map(Ok)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn yields_file_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("face.png");
    std::fs::write(&path, [0u8; 4]).unwrap();

    let url = Url::parse(&format!("image:{}", path.display())).unwrap();
    let mut iter = ImageFileInput::from_url(&url).unwrap().into_iter();
    let upload = iter.next().unwrap().unwrap();
    assert_eq!(upload.filename(), Some("face.png"));
    assert!(iter.next().is_none());
  }

  #[test]
  fn missing_file_is_io_error() {
    let url = Url::parse("image:/definitely/not/here.png").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&url),
      Err(InputError::IoError(_))
    ));
  }
}
