// 该文件是 Biaoqing （表情） 项目的一部分。
// src/bin/simple_batch.rs - 批量识别目录中的图像
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

use anyhow::Result;
use clap::Parser;

use biaoqing::{
  FromUrl,
  args::ExplainArgs,
  input::InputWrapper,
  model::SequentialLoader,
  output::OutputWrapper,
  task::{BatchTask, Explainer, Task},
};
use tracing::{info, warn};

/// Biaoqing 批量识别
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub explain: ExplainArgs,

  /// 最多处理的图像数量
  #[arg(long, value_name = "COUNT")]
  pub limit: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let config = args.explain.load_config()?;

  info!("模型文件路径: {}", config.model);
  info!("输入来源: {}", args.explain.input);
  info!("输出路径: {}", config.output);

  let input = InputWrapper::from_url(&args.explain.input)?;
  let model = SequentialLoader::from_url(&config.model_url()?)?.build()?;
  let output = OutputWrapper::from_url(&config.output_url()?)?;
  let explainer = Explainer::new(model, &config).with_class_index(args.explain.class_index);

  let report = BatchTask::default()
    .with_limit(args.limit)
    .run_task(input.into_iter(), explainer, output)?;

  if report.failed > 0 {
    warn!("{} 张图像处理失败", report.failed);
  }
  println!("{}", serde_json::to_string(&report)?);

  Ok(())
}
