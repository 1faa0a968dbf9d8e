// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/output/gstreamer_display.rs - GStreamer 本地窗口显示
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 本地窗口显示
//!
//! `appsrc ! videoconvert ! autovideosink`，在窗口中按下 Esc 或关闭窗口时请求退出。

use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  frame::Frame,
  output::{Render, RenderFlow},
};

const DISPLAY_FPS: i32 = 30;
const EXIT_KEY: &str = "Escape";

#[derive(Error, Debug)]
pub enum GStreamerDisplayError {
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 操作失败: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("找不到 appsrc 元素")]
  AppSrcNotFound,
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("状态切换错误: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

pub struct GStreamerDisplay {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  exit_requested: Arc<AtomicBool>,
  caps_size: Option<(u32, u32)>,
  frame_count: u64,
}

impl GStreamerDisplay {
  pub fn new() -> Result<Self, GStreamerDisplayError> {
    gst::init()?;

    let description = "appsrc name=src is-live=true ! videoconvert ! autovideosink sync=false";
    info!("创建显示管道: {}", description);

    let pipeline = gst::parse::launch(description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerDisplayError::PipelineError("无法创建管道".to_string()))?;
    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerDisplayError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerDisplayError::AppSrcNotFound)?;
    appsrc.set_format(gst::Format::Time);

    // 窗口中的按键以导航事件的形式逆流而上到达 appsrc
    let exit_requested = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&exit_requested);
    let pad = appsrc
      .static_pad("src")
      .ok_or_else(|| GStreamerDisplayError::PipelineError("appsrc 没有 src pad".to_string()))?;
    pad.add_probe(gst::PadProbeType::EVENT_UPSTREAM, move |_, info| {
      if let Some(event) = info.event() {
        if let Ok(gst_video::NavigationEvent::KeyPress { key, .. }) =
          gst_video::NavigationEvent::parse(event)
        {
          debug!("窗口按键: {}", key);
          if key == EXIT_KEY {
            flag.store(true, Ordering::SeqCst);
          }
        }
      }
      gst::PadProbeReturn::Ok
    });

    pipeline.set_state(gst::State::Playing)?;

    Ok(GStreamerDisplay {
      pipeline,
      appsrc,
      exit_requested,
      caps_size: None,
      frame_count: 0,
    })
  }

  /// 窗口被关闭时管道会报告错误或结束
  fn window_closed(&self) -> bool {
    let Some(bus) = self.pipeline.bus() else {
      return false;
    };
    match bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos]) {
      Some(message) => {
        info!("显示管道结束: {:?}", message.view());
        true
      }
      None => false,
    }
  }

  fn push_frame(&mut self, frame: &Frame) -> Result<(), GStreamerDisplayError> {
    let size = (frame.width(), frame.height());
    if self.caps_size != Some(size) {
      let caps = gst::Caps::builder("video/x-raw")
        .field("format", "RGB")
        .field("width", size.0 as i32)
        .field("height", size.1 as i32)
        .field("framerate", gst::Fraction::new(DISPLAY_FPS, 1))
        .build();
      self.appsrc.set_caps(Some(&caps));
      self.caps_size = Some(size);
    }

    let mut buffer = gst::Buffer::from_slice(frame.as_raw().to_vec());
    let frame_ns = 1_000_000_000 / DISPLAY_FPS as u64;
    if let Some(buffer_ref) = buffer.get_mut() {
      buffer_ref.set_pts(gst::ClockTime::from_nseconds(self.frame_count * frame_ns));
      buffer_ref.set_duration(gst::ClockTime::from_nseconds(frame_ns));
    }
    self.frame_count += 1;

    self
      .appsrc
      .push_buffer(buffer)
      .map_err(|e| GStreamerDisplayError::PipelineError(format!("推送缓冲区失败: {:?}", e)))?;
    Ok(())
  }
}

impl Drop for GStreamerDisplay {
  fn drop(&mut self) {
    let _ = self.appsrc.end_of_stream();
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("停止显示管道失败: {}", e);
    }
    info!("显示窗口关闭，共显示 {} 帧", self.frame_count);
  }
}

impl Render for GStreamerDisplay {
  type Error = GStreamerDisplayError;

  fn render_frame(&mut self, frame: &Frame) -> Result<RenderFlow, Self::Error> {
    if self.exit_requested.load(Ordering::SeqCst) || self.window_closed() {
      return Ok(RenderFlow::Stop);
    }
    self.push_frame(frame)?;
    Ok(RenderFlow::Continue)
  }
}
