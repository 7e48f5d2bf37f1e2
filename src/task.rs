// 该文件是 Biaoqing （表情） 项目的一部分。
// src/task.rs - 请求处理流程与任务
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
  fmt,
  path::PathBuf,
  sync::atomic::{AtomicU64, Ordering},
  time::Instant,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
  config::Config,
  frame::ImageTensor,
  gradcam::{self, AttributionError, BlendWeights, ChannelOrder, Heatmap, Overlay},
  input::{InputError, Preprocessor, Upload},
  model::{CaptureLayer, Classifier, ClassifierError, LabelTable, Prediction},
  output::{OutputError, Render},
};

static REQUEST_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// 请求标识：时间戳加进程内递增序号，同一进程内不会重复
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
  timestamp: DateTime<Utc>,
  sequence: u64,
}

impl RequestId {
  pub fn next() -> Self {
    Self {
      timestamp: Utc::now(),
      sequence: REQUEST_SEQUENCE.fetch_add(1, Ordering::Relaxed),
    }
  }

  pub fn timestamp(&self) -> DateTime<Utc> {
    self.timestamp
  }

  pub fn sequence(&self) -> u64 {
    self.sequence
  }
}

impl fmt::Display for RequestId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}-{:04X}",
      self.timestamp.format("%H-%M-%S-%3f"),
      self.sequence
    )
  }
}

#[derive(Error, Debug)]
pub enum RequestError {
  #[error("没有上传图像")]
  NoInput,
  #[error("输入错误: {0}")]
  Input(InputError),
  #[error("分类模型错误: {0}")]
  Classifier(#[from] ClassifierError),
  #[error("热力图计算错误: {0}")]
  Attribution(#[from] AttributionError),
  #[error("输出错误: {0}")]
  Output(#[from] OutputError),
  #[error("类别 {0} 没有对应的标签")]
  UnknownLabel(usize),
}

impl From<InputError> for RequestError {
  fn from(err: InputError) -> Self {
    if err.is_no_input() {
      RequestError::NoInput
    } else {
      RequestError::Input(err)
    }
  }
}

impl RequestError {
  /// 面向用户的提示文本
  pub fn user_message(&self) -> &'static str {
    match self {
      RequestError::NoInput => "No image uploaded.",
      _ => "Failed to analyze the uploaded image.",
    }
  }
}

/// 一次识别与解释的全部结果
#[derive(Debug, Clone)]
pub struct Explanation {
  pub prediction: Prediction,
  pub class_index: usize,
  pub label: String,
  pub heatmap: Heatmap,
  pub overlay: Overlay,
}

/// 返回给调用方的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
  pub id: String,
  pub class_index: usize,
  pub label: String,
  pub message: String,
  pub probabilities: Vec<f32>,
  pub overlay_path: PathBuf,
}

/// 单个请求的完整流程：预处理、分类、计算热力图、叠加、保存。
/// 模型只读，可在多个请求之间共享
pub struct Explainer<M> {
  model: M,
  preprocessor: Preprocessor,
  layer_name: String,
  class_index: Option<usize>,
  blend: BlendWeights,
  channel_order: ChannelOrder,
  labels: LabelTable,
}

impl<M: CaptureLayer> Explainer<M> {
  pub fn new(model: M, config: &Config) -> Self {
    Self {
      model,
      preprocessor: config.preprocessor(),
      layer_name: config.layer_name.clone(),
      class_index: None,
      blend: config.blend,
      channel_order: config.channel_order,
      labels: config.labels.clone(),
    }
  }

  /// 固定热力图对应的类别；缺省时使用预测结果
  pub fn with_class_index(mut self, class_index: Option<usize>) -> Self {
    self.class_index = class_index;
    self
  }

  pub fn model(&self) -> &M {
    &self.model
  }

  pub fn explain(&self, input: &ImageTensor) -> Result<Explanation, RequestError> {
    let prediction = self.model.predict(input)?;
    let class_index = prediction.argmax();
    let label = self
      .labels
      .label(class_index)
      .ok_or(RequestError::UnknownLabel(class_index))?
      .to_string();
    info!("识别结果: {} (类别 {})", label, class_index);

    let target = self.class_index.unwrap_or(class_index);
    let heatmap = gradcam::compute_heatmap(&self.model, input, &self.layer_name, Some(target))?;
    let overlay = gradcam::composite(input, &heatmap, self.blend, self.channel_order)?;

    Ok(Explanation {
      prediction,
      class_index,
      label,
      heatmap,
      overlay,
    })
  }

  pub fn handle_upload<O>(&self, upload: Option<Upload>, output: &O) -> Result<Response, RequestError>
  where
    O: Render<Explanation>,
    O::Error: Into<OutputError>,
  {
    let upload = upload.filter(|upload| !upload.is_empty()).ok_or(RequestError::NoInput)?;
    let id = RequestId::next();
    info!(
      "处理请求 {}: {}",
      id,
      upload.filename().unwrap_or("<未命名>")
    );

    let input = self.preprocessor.preprocess(upload.bytes())?;
    let explanation = self.explain(&input)?;
    let overlay_path = output
      .render_result(&id, &explanation)
      .map_err(|e| RequestError::Output(e.into()))?;

    Ok(Response {
      id: id.to_string(),
      class_index: explanation.class_index,
      message: format!("Recognized emotion is {}", explanation.label),
      label: explanation.label,
      probabilities: explanation.prediction.scores().to_vec(),
      overlay_path,
    })
  }
}

pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error>;
}

/// 只处理第一个输入，失败即返回错误
pub struct OneShotTask;

impl<I, M, O> Task<I, Explainer<M>, O> for OneShotTask
where
  I: Iterator<Item = Result<Upload, InputError>>,
  M: CaptureLayer,
  O: Render<Explanation>,
  O::Error: Into<OutputError>,
{
  type Output = Response;
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, explainer: Explainer<M>, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let upload = input.next().transpose()?;
    let now = Instant::now();
    let response = explainer.handle_upload(upload, &output).inspect_err(|e| {
      error!("请求处理失败: {}", e);
    })?;
    info!(
      "{}，耗时: {:.2?}，结果保存到 {}",
      response.message,
      now.elapsed(),
      response.overlay_path.display()
    );
    Ok(response)
  }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
  pub succeeded: usize,
  pub failed: usize,
}

/// 逐个处理全部输入；单个请求失败只记录日志，不影响后续请求
#[derive(Debug, Default)]
pub struct BatchTask {
  limit: Option<usize>,
}

impl BatchTask {
  pub fn with_limit(mut self, limit: Option<usize>) -> Self {
    self.limit = limit;
    self
  }
}

impl<I, M, O> Task<I, Explainer<M>, O> for BatchTask
where
  I: Iterator<Item = Result<Upload, InputError>>,
  M: CaptureLayer,
  O: Render<Explanation>,
  O::Error: Into<OutputError>,
{
  type Output = BatchReport;
  type Error = anyhow::Error;

  fn run_task(self, input: I, explainer: Explainer<M>, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始批量任务...");
    let mut report = BatchReport::default();
    let start = Instant::now();

    for (index, upload) in input.take(self.limit.unwrap_or(usize::MAX)).enumerate() {
      let now = Instant::now();
      let result = upload
        .map_err(RequestError::from)
        .and_then(|upload| explainer.handle_upload(Some(upload), &output));
      match result {
        Ok(response) => {
          report.succeeded += 1;
          info!(
            "({}) {}，耗时: {:.2?}",
            index,
            response.message,
            now.elapsed()
          );
        }
        Err(e) => {
          report.failed += 1;
          warn!("({}) 处理失败: {} ({})", index, e, e.user_message());
        }
      }
    }

    info!(
      "批量任务完成: 成功 {}，失败 {}，总耗时: {:.2?}",
      report.succeeded,
      report.failed,
      start.elapsed()
    );
    Ok(report)
  }
}
