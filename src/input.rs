// 该文件是 Biaoqing （表情） 项目的一部分。
// src/input.rs - 输入源与图像预处理
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

use thiserror::Error;

use crate::{FromUrl, FromUrlWithScheme};

mod directory_input;
mod preprocess;
mod read_image_file;

pub use self::directory_input::{DirectoryInput, DirectoryInputIter};
pub use self::preprocess::Preprocessor;
pub use self::read_image_file::{ImageFileInput, ImageFileInputIter};

#[derive(Error, Debug)]
pub enum InputError {
  #[error("没有上传图像")]
  NoInput,
  #[error("无法识别的图像: {0}")]
  Unsupported(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl InputError {
  /// 请求中没有可用的图像：未上传、内容为空或无法解码
  pub fn is_no_input(&self) -> bool {
    matches!(self, InputError::NoInput | InputError::Unsupported(_))
  }
}

/// 一次上传的原始文件内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
  filename: Option<String>,
  bytes: Vec<u8>,
}

impl Upload {
  pub fn new(filename: Option<String>, bytes: Vec<u8>) -> Self {
    Self { filename, bytes }
  }

  pub fn filename(&self) -> Option<&str> {
    self.filename.as_deref()
  }

  pub fn bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }

  pub fn read(path: impl AsRef<std::path::Path>) -> Result<Self, InputError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let filename = path.file_name().map(|name| name.to_string_lossy().into_owned());
    Ok(Self { filename, bytes })
  }
}

pub enum InputWrapper {
  ImageFile(ImageFileInput),
  Directory(DirectoryInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      ImageFileInput::SCHEME => Ok(InputWrapper::ImageFile(ImageFileInput::from_url(url)?)),
      DirectoryInput::SCHEME => Ok(InputWrapper::Directory(DirectoryInput::from_url(url)?)),
      scheme => Err(InputError::SchemeMismatch(format!(
        "不支持的输入方式 '{}'",
        scheme
      ))),
    }
  }
}

impl IntoIterator for InputWrapper {
  type Item = Result<Upload, InputError>;
  type IntoIter = InputWrapperIter;

  fn into_iter(self) -> Self::IntoIter {
    match self {
      InputWrapper::ImageFile(input) => InputWrapperIter::ImageFile(input.into_iter()),
      InputWrapper::Directory(input) => InputWrapperIter::Directory(input.into_iter()),
    }
  }
}

pub enum InputWrapperIter {
  ImageFile(ImageFileInputIter),
  Directory(DirectoryInputIter),
}

impl Iterator for InputWrapperIter {
  type Item = Result<Upload, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      InputWrapperIter::ImageFile(input) => input.next(),
      InputWrapperIter::Directory(input) => input.next(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn wrapper_dispatches_on_scheme() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.png"), b"not really a png").unwrap();

    let url = url::Url::parse(&format!("folder:{}", dir.path().display())).unwrap();
    let input = InputWrapper::from_url(&url).unwrap();
    assert!(matches!(input, InputWrapper::Directory(_)));
    assert_eq!(input.into_iter().count(), 1);

    let url = url::Url::parse("v4l2:///dev/video0").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(InputError::SchemeMismatch(_))
    ));
  }

  #[test]
  fn upload_keeps_file_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("face.jpg");
    std::fs::write(&path, [1u8, 2, 3]).unwrap();

    let upload = Upload::read(&path).unwrap();
    assert_eq!(upload.filename(), Some("face.jpg"));
    assert_eq!(upload.bytes(), &[1, 2, 3]);
    assert!(!upload.is_empty());
  }
}
