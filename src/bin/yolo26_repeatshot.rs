// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/yolo26_repeatshot.rs - 重复解码计时
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
use url::Url;

use tracing::info;
use yolo26::{
  FromUrl, Yolo26Builder,
  args::DecodeArgs,
  engine::ReplayEngine,
  input::ImageFileInput,
  output::OutputWrapper,
  task::{RepeatShotTask, Task},
};

/// YOLO26 重复解码参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 推理输出记录文件
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入图像
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT", default_value = "log:")]
  pub output: Url,
  /// 重复次数
  #[arg(long, default_value_t = 1000)]
  pub times: usize,
  /// 不计入平均耗时的预热次数
  #[arg(long, default_value_t = 2)]
  pub warmup: usize,
  #[command(flatten)]
  pub decode: DecodeArgs,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型记录路径: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let input = ImageFileInput::from_url(&args.input)?;
  let engine = ReplayEngine::from_url(&args.model)?;
  let model = Yolo26Builder::new(engine)
    .config(args.decode.to_config())
    .build()?;
  let output = OutputWrapper::from_url(&args.output)?;

  RepeatShotTask::default()
    .with_times(args.times)
    .with_warmup(args.warmup)
    .run_task(input, model, output)?;

  Ok(())
}
