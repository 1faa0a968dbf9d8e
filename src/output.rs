// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/output.rs - 输出定义
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::codecs::jpeg::JpegEncoder;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  config::{ConfigError, MjpegSettings},
  frame::Frame,
};

/// 渲染后是否继续处理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderFlow {
  Continue,
  /// 用户请求退出
  Stop,
}

pub trait Render {
  type Error;
  fn render_frame(&mut self, frame: &Frame) -> Result<RenderFlow, Self::Error>;
}

/// 接收编码好的 JPEG 帧，只保留最新一帧
pub trait Publisher {
  fn publish(&self, jpeg: Vec<u8>);
}

pub mod draw;
pub use self::draw::{Annotator, PALETTE};

#[cfg(feature = "mjpeg_output")]
mod mjpeg;
#[cfg(feature = "mjpeg_output")]
pub use self::mjpeg::MjpegPublisher;

#[cfg(feature = "gstreamer_output")]
mod gstreamer_display;
#[cfg(feature = "gstreamer_output")]
pub use self::gstreamer_display::{GStreamerDisplay, GStreamerDisplayError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error("字体加载失败: {0}")]
  Font(String),
  #[error("JPEG 编码失败: {0}")]
  Encode(#[from] image::ImageError),
  #[error("无法监听端口 {port}: {source}")]
  Bind {
    port: u16,
    source: std::io::Error,
  },
  #[error("无法编码空帧")]
  EmptyFrame,
  #[error("推流服务错误: {0}")]
  Server(String),
  #[cfg(feature = "gstreamer_output")]
  #[error("GStreamer 显示错误: {0}")]
  GStreamerDisplay(#[from] GStreamerDisplayError),
}

/// 按给定质量编码为 JPEG
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, OutputError> {
  if frame.is_empty() {
    return Err(OutputError::EmptyFrame);
  }
  let mut jpeg = Vec::new();
  JpegEncoder::new_with_quality(&mut jpeg, quality).encode_image(frame.image())?;
  Ok(jpeg)
}

struct MappedRender<R>(R);

impl<R> Render for MappedRender<R>
where
  R: Render,
  OutputError: From<R::Error>,
{
  type Error = OutputError;

  fn render_frame(&mut self, frame: &Frame) -> Result<RenderFlow, Self::Error> {
    self.0.render_frame(frame).map_err(OutputError::from)
  }
}

/// 本地显示与 MJPEG 推流的组合，两者都可以关闭
pub struct OutputWrapper {
  display: Option<Box<dyn Render<Error = OutputError>>>,
  publisher: Option<Box<dyn Publisher>>,
  jpeg_quality: u8,
}

impl OutputWrapper {
  pub fn new(jpeg_quality: u8) -> Self {
    OutputWrapper {
      display: None,
      publisher: None,
      jpeg_quality,
    }
  }

  pub fn with_display<R>(mut self, display: R) -> Self
  where
    R: Render + 'static,
    OutputError: From<R::Error>,
  {
    self.display = Some(Box::new(MappedRender(display)));
    self
  }

  pub fn with_publisher<P: Publisher + 'static>(mut self, publisher: P) -> Self {
    self.publisher = Some(Box::new(publisher));
    self
  }

  pub fn from_settings(settings: &MjpegSettings) -> Result<Self, OutputError> {
    let mut output = OutputWrapper::new(settings.jpeg_quality);

    if settings.imshow_enable {
      #[cfg(feature = "gstreamer_output")]
      {
        output = output.with_display(GStreamerDisplay::new()?);
      }
      #[cfg(not(feature = "gstreamer_output"))]
      return Err(ConfigError::FeatureDisabled("gstreamer_output").into());
    }

    if settings.enable {
      #[cfg(feature = "mjpeg_output")]
      {
        output = output.with_publisher(MjpegPublisher::start(settings.port)?);
      }
      #[cfg(not(feature = "mjpeg_output"))]
      return Err(ConfigError::FeatureDisabled("mjpeg_output").into());
    }

    Ok(output)
  }

  /// 是否有任何输出需要渲染
  pub fn is_active(&self) -> bool {
    self.display.is_some() || self.publisher.is_some()
  }
}

impl Render for OutputWrapper {
  type Error = OutputError;

  fn render_frame(&mut self, frame: &Frame) -> Result<RenderFlow, Self::Error> {
    if let Some(display) = self.display.as_mut() {
      if display.render_frame(frame)? == RenderFlow::Stop {
        return Ok(RenderFlow::Stop);
      }
    }

    if let Some(publisher) = self.publisher.as_ref() {
      match encode_jpeg(frame, self.jpeg_quality) {
        Ok(jpeg) => {
          debug!("推送 JPEG 帧 {} 字节", jpeg.len());
          publisher.publish(jpeg);
        }
        Err(e) => warn!("JPEG 编码失败: {}", e),
      }
    }

    Ok(RenderFlow::Continue)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::RgbImage;
  use std::{cell::RefCell, rc::Rc};

  #[derive(Clone, Default)]
  struct Collect(Rc<RefCell<Vec<Vec<u8>>>>);

  impl Publisher for Collect {
    fn publish(&self, jpeg: Vec<u8>) {
      self.0.borrow_mut().push(jpeg);
    }
  }

  struct StopAfter(usize);

  impl Render for StopAfter {
    type Error = OutputError;

    fn render_frame(&mut self, _: &Frame) -> Result<RenderFlow, OutputError> {
      if self.0 == 0 {
        return Ok(RenderFlow::Stop);
      }
      self.0 -= 1;
      Ok(RenderFlow::Continue)
    }
  }

  #[test]
  fn jpeg_has_soi_marker() {
    let jpeg = encode_jpeg(&Frame::from_image(RgbImage::new(16, 8)), 95).unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
  }

  #[test]
  fn encode_failure_is_not_published() {
    let sink = Collect::default();
    let mut output = OutputWrapper::new(95).with_publisher(sink.clone());
    assert_eq!(
      output.render_frame(&Frame::empty()).unwrap(),
      RenderFlow::Continue
    );
    assert!(sink.0.borrow().is_empty());

    output
      .render_frame(&Frame::from_image(RgbImage::new(4, 4)))
      .unwrap();
    assert_eq!(sink.0.borrow().len(), 1);
  }

  #[test]
  fn display_stop_skips_publishing() {
    let sink = Collect::default();
    let mut output = OutputWrapper::new(80)
      .with_display(StopAfter(1))
      .with_publisher(sink.clone());
    let frame = Frame::from_image(RgbImage::new(4, 4));

    assert_eq!(output.render_frame(&frame).unwrap(), RenderFlow::Continue);
    assert_eq!(output.render_frame(&frame).unwrap(), RenderFlow::Stop);
    assert_eq!(sink.0.borrow().len(), 1);
  }

  #[test]
  fn disabled_outputs_are_inactive() {
    let settings = MjpegSettings {
      imshow_enable: false,
      enable: false,
      port: 0,
      jpeg_quality: 90,
    };
    assert!(!OutputWrapper::from_settings(&settings).unwrap().is_active());
  }
}
