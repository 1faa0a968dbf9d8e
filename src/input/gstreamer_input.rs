// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 采集输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # GStreamer 采集输入
//!
//! 用于本地摄像头与视频文件（或可由 `uridecodebin` 打开的 URL）。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! 所有管道都以 `videoconvert ! video/x-raw,format=RGB ! appsink` 结尾，
//! appsink 只保留最新的两帧，旧帧直接丢弃。

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{frame::Frame, input::Capture};

#[derive(Error, Debug)]
pub enum GStreamerInputError {
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 操作失败: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("找不到 appsink 元素")]
  AppSinkNotFound,
  #[error("无法从 caps 获取视频信息")]
  VideoInfoError,
  #[error("不支持的视频格式")]
  UnsupportedFormat,
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("缓冲区大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("状态切换错误: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

enum PipelineItem {
  Camera(String),
  File(String),
  Uri(String),
  Rgb,
}

impl PipelineItem {
  fn to_pipeline(&self) -> String {
    match self {
      PipelineItem::Camera(device) => format!("v4l2src device={}", device),
      PipelineItem::File(path) => format!("filesrc location=\"{}\" ! decodebin", path),
      PipelineItem::Uri(uri) => format!("uridecodebin uri=\"{}\"", uri),
      PipelineItem::Rgb => "videoconvert ! video/x-raw,format=RGB".to_string(),
    }
  }
}

/// GStreamer 采集
pub struct GStreamerCapture {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
}

impl Drop for GStreamerCapture {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("停止 GStreamer 管道失败: {}", e);
    }
  }
}

impl GStreamerCapture {
  /// 打开 V4L2 摄像头设备
  pub fn camera(device: &str) -> Result<Self, GStreamerInputError> {
    Self::launch(&[PipelineItem::Camera(device.to_string()), PipelineItem::Rgb])
  }

  /// 打开视频文件；带协议的地址交给 uridecodebin
  pub fn file(source: &str) -> Result<Self, GStreamerInputError> {
    let item = match url::Url::parse(source) {
      Ok(url) if url.scheme().len() > 1 => PipelineItem::Uri(url.to_string()),
      _ => PipelineItem::File(source.to_string()),
    };
    Self::launch(&[item, PipelineItem::Rgb])
  }

  fn launch(items: &[PipelineItem]) -> Result<Self, GStreamerInputError> {
    gst::init()?;

    let description = format!(
      "{} ! appsink max-buffers=2 drop=true name=sink",
      items
        .iter()
        .map(PipelineItem::to_pipeline)
        .collect::<Vec<_>>()
        .join(" ! ")
    );
    info!("GStreamer 管道: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("无法创建管道".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkNotFound)?;

    pipeline.set_state(gst::State::Playing)?;

    Ok(GStreamerCapture { pipeline, appsink })
  }
}

impl Capture for GStreamerCapture {
  fn read(&mut self, frame: &mut Frame) -> bool {
    let sample = match self.appsink.pull_sample() {
      Ok(sample) => sample,
      Err(_) => {
        info!("GStreamer 输入结束");
        return false;
      }
    };

    match copy_sample_into(&sample, frame) {
      Ok(()) => true,
      Err(e) => {
        error!("读取采样失败: {}", e);
        false
      }
    }
  }
}

fn copy_sample_into(sample: &gst::Sample, frame: &mut Frame) -> Result<(), GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("采样中没有缓冲区".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("采样中没有 caps".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;
  if video_info.format() != gst_video::VideoFormat::Rgb {
    return Err(GStreamerInputError::UnsupportedFormat);
  }

  let width = video_info.width();
  let height = video_info.height();
  let stride = video_info.stride()[0] as usize;
  let row_bytes = width as usize * 3;

  let map = buffer
    .map_readable()
    .map_err(|e| GStreamerInputError::PipelineError(format!("无法映射缓冲区: {}", e)))?;
  let data = map.as_slice();

  let expected = stride * (height as usize).saturating_sub(1) + row_bytes;
  if data.len() < expected {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  // RGB 行宽按 4 字节对齐，需要去掉行尾填充
  let result = if stride == row_bytes {
    frame.overwrite(width, height, &data[..row_bytes * height as usize])
  } else {
    let mut packed = Vec::with_capacity(row_bytes * height as usize);
    for row in data.chunks(stride).take(height as usize) {
      packed.extend_from_slice(&row[..row_bytes]);
    }
    frame.overwrite(width, height, &packed)
  };
  result.map_err(|e| GStreamerInputError::PipelineError(e.to_string()))
}
