// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

mod args;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use liaowang::{
  config::Settings,
  input::InputWrapper,
  model::{Detector, create_network},
  output::OutputWrapper,
  task::{ContinuousTask, Task, install_interrupt_handler},
};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();
  info!("配置文件: {}", args.settings.display());

  let settings = Settings::load(&args.settings)
    .with_context(|| format!("无法加载配置 {}", args.settings.display()))?;
  info!("输入类型: {}", settings.source);

  let detector = if settings.network.enable {
    info!(
      "加载模型: {} ({}, {})",
      settings.network.weights.display(),
      settings.network.backend,
      settings.network.target
    );
    let network = create_network(&settings.network).context("模型加载失败")?;
    Some(Detector::new(network, &settings.network))
  } else {
    info!("检测已关闭");
    None
  };

  let input = InputWrapper::from_settings(&settings).context("无法打开输入")?;
  let output = OutputWrapper::from_settings(&settings.mjpeg).context("无法创建输出")?;
  if !output.is_active() {
    warn!("显示与推流均已关闭，处理结果不会输出");
  }

  let stop = install_interrupt_handler()?;
  let task = ContinuousTask::from_settings(&settings)?
    .with_frame_limit(args.frame_limit())
    .with_stop_signal(stop);

  let summary = task.run_task(input, detector, output)?;
  info!("退出: {}", summary);

  Ok(())
}
