// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/task.rs - 处理循环
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
  sync::mpsc::{self, Receiver},
  thread,
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::{
  config::Settings,
  frame::{FrameBuffer, FrameLedger, preprocess},
  input::{Acquired, FrameSource, InputError, RetryReason},
  model::{DetectedObject, Model},
  output::{Annotator, OutputError, Render, RenderFlow},
};

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<TaskSummary, Self::Error>;
}

#[derive(Error, Debug)]
pub enum TaskError {
  #[error("输入错误: {0}")]
  Input(#[from] InputError),
  #[error("输出错误: {0}")]
  Output(#[from] OutputError),
  #[error("无法设置中断处理: {0}")]
  Interrupt(#[from] ctrlc::Error),
}

/// 重试间隔
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// 取帧或预处理失败后的等待
  pub acquire_backoff: Duration,
  /// 检测失败后的等待
  pub detection_backoff: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    RetryPolicy {
      acquire_backoff: Duration::from_millis(400),
      detection_backoff: Duration::from_millis(100),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
  /// 输入结束
  SourceExhausted,
  /// 显示窗口请求退出
  ExitRequested,
  /// 收到中断信号
  Interrupted,
  /// 达到指定帧数
  FrameLimit,
}

impl fmt::Display for StopReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let text = match self {
      StopReason::SourceExhausted => "输入结束",
      StopReason::ExitRequested => "用户退出",
      StopReason::Interrupted => "中断信号",
      StopReason::FrameLimit => "达到帧数上限",
    };
    f.write_str(text)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
  Init,
  Capturing,
  Detecting,
  Annotating,
  Publishing,
  Stopped,
}

/// 运行统计
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskSummary {
  /// 完成发布的周期数
  pub cycles: usize,
  /// 因取帧或预处理失败而跳过的周期数
  pub skipped: usize,
  pub detection_failures: usize,
  /// 检测结果总数
  pub detections: usize,
  pub stop_reason: Option<StopReason>,
}

impl fmt::Display for TaskSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "完成 {} 个周期, 跳过 {} 次, 检测失败 {} 次, 检测目标 {} 个",
      self.cycles, self.skipped, self.detection_failures, self.detections
    )?;
    if let Some(reason) = self.stop_reason {
      write!(f, ", 退出原因: {}", reason)?;
    }
    Ok(())
  }
}

/// 安装 Ctrl-C 处理，返回停止信号的接收端
///
/// 收到信号 30 秒后仍未退出则强制结束进程。
pub fn install_interrupt_handler() -> Result<Receiver<()>, TaskError> {
  let (tx, rx) = mpsc::channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })?;
  Ok(rx)
}

/// 逐帧连续处理：取帧、预处理、检测、标注、发布
pub struct ContinuousTask {
  target: (u32, u32),
  clip_bounds: (u32, u32),
  frame_limit: Option<usize>,
  policy: RetryPolicy,
  stop: Option<Receiver<()>>,
  ledger: FrameLedger,
  annotator: Annotator,
}

impl ContinuousTask {
  /// 缩放到 `target`，检测框默认裁剪到同一尺寸
  pub fn new(target: (u32, u32)) -> Result<Self, TaskError> {
    Ok(ContinuousTask {
      target,
      clip_bounds: target,
      frame_limit: None,
      policy: RetryPolicy::default(),
      stop: None,
      ledger: FrameLedger::new(),
      annotator: Annotator::new()?,
    })
  }

  pub fn from_settings(settings: &Settings) -> Result<Self, TaskError> {
    let target = settings.target_resolution();
    info!("缩放分辨率: {}x{}", target.0, target.1);
    let task = Self::new(target)?.with_clip_bounds(settings.clip_bounds(target.0, target.1));
    Ok(task)
  }

  pub fn with_clip_bounds(mut self, bounds: (u32, u32)) -> Self {
    self.clip_bounds = bounds;
    self
  }

  pub fn with_frame_limit(mut self, frame_limit: Option<usize>) -> Self {
    self.frame_limit = frame_limit;
    self
  }

  pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn with_stop_signal(mut self, stop: Receiver<()>) -> Self {
    self.stop = Some(stop);
    self
  }

  pub fn with_ledger(mut self, ledger: FrameLedger) -> Self {
    self.ledger = ledger;
    self
  }

  fn stop_requested(&self) -> bool {
    self.stop.as_ref().is_some_and(|rx| rx.try_recv().is_ok())
  }
}

fn transition(state: &mut PipelineState, next: PipelineState) {
  trace!("{:?} -> {:?}", state, next);
  *state = next;
}

impl<I, M, O> Task<I, Option<M>, O> for ContinuousTask
where
  I: FrameSource,
  M: Model<Input = crate::frame::DetectionCopy, Output = Vec<DetectedObject>>,
  M::Error: fmt::Display,
  O: Render<Error = OutputError>,
{
  type Error = TaskError;

  fn run_task(
    self,
    mut input: I,
    mut model: Option<M>,
    mut output: O,
  ) -> Result<TaskSummary, Self::Error> {
    let mut state = PipelineState::Init;
    info!(
      "开始任务... 检测{}",
      if model.is_some() { "开启" } else { "关闭" }
    );

    let mut buffer = FrameBuffer::new(self.ledger.clone());
    let mut summary = TaskSummary::default();
    let mut now = Instant::now();

    let reason = loop {
      if self.stop_requested() {
        warn!("中断信号接收，退出任务循环");
        break StopReason::Interrupted;
      }

      transition(&mut state, PipelineState::Capturing);
      match input.acquire(buffer.raw_mut()) {
        Ok(Acquired::Frame) => {}
        Ok(Acquired::Retry(RetryReason::Timeout)) => {
          trace!("等待输入数据");
          continue;
        }
        Ok(Acquired::Retry(reason)) => {
          debug!("暂无可用帧: {}", reason);
          summary.skipped += 1;
          thread::sleep(self.policy.acquire_backoff);
          continue;
        }
        Ok(Acquired::Exhausted) => {
          info!("输入结束");
          break StopReason::SourceExhausted;
        }
        Err(e) => {
          error!("输入失败，终止任务: {}", e);
          transition(&mut state, PipelineState::Stopped);
          return Err(e.into());
        }
      }

      if buffer.raw().is_empty() {
        debug!("空帧，跳过本周期");
        summary.skipped += 1;
        thread::sleep(self.policy.acquire_backoff);
        continue;
      }

      if let Err(e) = preprocess(&mut buffer, self.target.0, self.target.1) {
        warn!("预处理失败: {}", e);
        summary.skipped += 1;
        thread::sleep(self.policy.acquire_backoff);
        continue;
      }

      let objects = match (model.as_mut(), buffer.take_scaled_copy()) {
        (Some(model), Some(copy)) => {
          transition(&mut state, PipelineState::Detecting);
          match model.infer(copy) {
            Ok(objects) => objects,
            Err(e) => {
              warn!("检测失败: {}", e);
              summary.detection_failures += 1;
              thread::sleep(self.policy.detection_backoff);
              Vec::new()
            }
          }
        }
        _ => Vec::new(),
      };
      buffer.end_cycle();

      if !objects.is_empty() {
        transition(&mut state, PipelineState::Annotating);
        debug!("标注 {} 个目标", objects.len());
        self
          .annotator
          .annotate(buffer.scaled_mut(), &objects, self.clip_bounds);
        summary.detections += objects.len();
      }

      transition(&mut state, PipelineState::Publishing);
      let flow = output.render_frame(buffer.scaled())?;
      summary.cycles += 1;
      debug!("第 {} 帧处理完成，耗时: {:.2?}", summary.cycles, now.elapsed());
      now = Instant::now();

      if flow == RenderFlow::Stop {
        info!("显示窗口请求退出");
        break StopReason::ExitRequested;
      }
      if self.frame_limit.is_some_and(|n| summary.cycles >= n) {
        info!("达到指定帧数 {}, 退出任务循环", summary.cycles);
        break StopReason::FrameLimit;
      }
    };

    transition(&mut state, PipelineState::Stopped);
    drop(buffer);
    drop(model);
    drop(input);
    debug!(
      "剩余帧缓冲: {}, 检测副本: {}",
      self.ledger.outstanding_frames(),
      self.ledger.outstanding_copies()
    );

    summary.stop_reason = Some(reason);
    info!("任务完成: {}", summary);
    Ok(summary)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_policy_matches_backoff_constants() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.acquire_backoff, Duration::from_millis(400));
    assert_eq!(policy.detection_backoff, Duration::from_millis(100));
  }

  #[test]
  fn summary_display_includes_reason() {
    let summary = TaskSummary {
      cycles: 3,
      stop_reason: Some(StopReason::FrameLimit),
      ..Default::default()
    };
    let text = summary.to_string();
    assert!(text.contains("完成 3 个周期"));
    assert!(text.contains("达到帧数上限"));
  }

  #[test]
  fn stop_signal_is_observed() {
    let (tx, rx) = mpsc::channel();
    let task = ContinuousTask::new((4, 4)).unwrap().with_stop_signal(rx);
    assert!(!task.stop_requested());
    tx.send(()).unwrap();
    assert!(task.stop_requested());
  }
}
