// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/input.rs - 视频帧输入源
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

use std::fmt;

use thiserror::Error;
use tracing::info;

use crate::{
  config::{ConfigError, Settings, SourceKind},
  frame::{Frame, FrameError},
};

/// 阻塞式采集设备
pub trait Capture {
  /// 读取一帧写入 `frame`，返回 false 表示没有更多帧
  fn read(&mut self, frame: &mut Frame) -> bool;
}

impl<C: Capture + ?Sized> Capture for Box<C> {
  fn read(&mut self, frame: &mut Frame) -> bool {
    (**self).read(frame)
  }
}

/// 压缩视频流解码器，跨调用保持解码状态
pub trait StreamDecoder {
  fn decode(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, InputError>;
}

impl<D: StreamDecoder + ?Sized> StreamDecoder for Box<D> {
  fn decode(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, InputError> {
    (**self).decode(bytes)
  }
}

/// 一次取帧的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
  /// 新帧已写入
  Frame,
  /// 暂时没有可用帧，稍后重试
  Retry(RetryReason),
  /// 输入结束
  Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
  /// 数据报短于传输头
  ShortPayload(usize),
  /// 解码失败
  DecodeFailed,
  /// 解码未产生任何帧
  NoFrameDecoded,
  /// 等待数据超时
  Timeout,
}

impl fmt::Display for RetryReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RetryReason::ShortPayload(n) => write!(f, "数据报过短 ({} 字节)", n),
      RetryReason::DecodeFailed => f.write_str("解码失败"),
      RetryReason::NoFrameDecoded => f.write_str("未解码出帧"),
      RetryReason::Timeout => f.write_str("等待数据超时"),
    }
  }
}

/// 帧来源
pub trait FrameSource {
  /// 取一帧写入 `raw`；只有不可恢复的错误才返回 Err
  fn acquire(&mut self, raw: &mut Frame) -> Result<Acquired, InputError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
  fn acquire(&mut self, raw: &mut Frame) -> Result<Acquired, InputError> {
    (**self).acquire(raw)
  }
}

#[derive(Error, Debug)]
pub enum InputError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error("无法绑定 UDP 地址 {addr}: {source}")]
  Bind {
    addr: String,
    source: std::io::Error,
  },
  #[error("套接字读取失败: {0}")]
  Socket(std::io::Error),
  #[error("帧错误: {0}")]
  Frame(#[from] FrameError),
  #[error("解码错误: {0}")]
  Decode(String),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer 输入错误: {0}")]
  GStreamer(#[from] GStreamerInputError),
  #[cfg(feature = "v4l2_input")]
  #[error("V4L2 输入错误: {0}")]
  V4l2(#[from] V4l2SourceError),
}

/// 把阻塞采集设备包装为帧来源，读取失败即视为输入结束
pub struct CaptureSource<C> {
  capture: C,
}

impl<C: Capture> CaptureSource<C> {
  pub fn new(capture: C) -> Self {
    CaptureSource { capture }
  }
}

impl<C: Capture> FrameSource for CaptureSource<C> {
  fn acquire(&mut self, raw: &mut Frame) -> Result<Acquired, InputError> {
    if self.capture.read(raw) {
      Ok(Acquired::Frame)
    } else {
      Ok(Acquired::Exhausted)
    }
  }
}

mod stream;
pub use self::stream::{DATAGRAM_SIZE, MIN_PAYLOAD_LEN, UdpStreamInput};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{GStreamerCapture, GStreamerInputError};

#[cfg(feature = "v4l2_input")]
mod v4l2_source;
#[cfg(feature = "v4l2_input")]
pub use self::v4l2_source::{V4l2Source, V4l2SourceError};

#[cfg(feature = "ffmpeg_decoder")]
mod ffmpeg_decoder;
#[cfg(feature = "ffmpeg_decoder")]
pub use self::ffmpeg_decoder::FfmpegStreamDecoder;

/// 启动时选定的输入源
pub enum InputWrapper {
  /// 本地摄像头
  Device(CaptureSource<Box<dyn Capture>>),
  /// 视频文件或 URL
  File(CaptureSource<Box<dyn Capture>>),
  /// UDP 压缩视频流
  Stream(UdpStreamInput<Box<dyn StreamDecoder>>),
}

impl InputWrapper {
  pub fn from_settings(settings: &Settings) -> Result<Self, InputError> {
    info!("打开输入源: {}", settings.source);
    match settings.source {
      SourceKind::Device => {
        let device_id = settings.device.as_ref().map(|d| d.device_id).unwrap_or(0);
        Ok(InputWrapper::Device(CaptureSource::new(open_device(
          device_id,
        )?)))
      }
      SourceKind::File => Ok(InputWrapper::File(CaptureSource::new(open_file(
        &settings.video.source,
      )?))),
      SourceKind::Stream => {
        let camera = settings
          .camera
          .as_ref()
          .ok_or(ConfigError::MissingSection("camera_settings"))?;
        let decoder = open_stream_decoder()?;
        let input = UdpStreamInput::bind(
          &camera.address,
          camera.port,
          camera.read_timeout_ms,
          decoder,
        )?;
        Ok(InputWrapper::Stream(input))
      }
    }
  }
}

impl FrameSource for InputWrapper {
  fn acquire(&mut self, raw: &mut Frame) -> Result<Acquired, InputError> {
    match self {
      InputWrapper::Device(source) => source.acquire(raw),
      InputWrapper::File(source) => source.acquire(raw),
      InputWrapper::Stream(source) => source.acquire(raw),
    }
  }
}

#[cfg(feature = "v4l2_input")]
fn open_device(device_id: u32) -> Result<Box<dyn Capture>, InputError> {
  let path = format!("/dev/video{}", device_id);
  Ok(Box::new(V4l2Source::new(&path)?))
}

#[cfg(all(not(feature = "v4l2_input"), feature = "gstreamer_input"))]
fn open_device(device_id: u32) -> Result<Box<dyn Capture>, InputError> {
  let path = format!("/dev/video{}", device_id);
  Ok(Box::new(GStreamerCapture::camera(&path)?))
}

#[cfg(all(not(feature = "v4l2_input"), not(feature = "gstreamer_input")))]
fn open_device(_device_id: u32) -> Result<Box<dyn Capture>, InputError> {
  Err(ConfigError::FeatureDisabled("v4l2_input").into())
}

#[cfg(feature = "gstreamer_input")]
fn open_file(source: &str) -> Result<Box<dyn Capture>, InputError> {
  Ok(Box::new(GStreamerCapture::file(source)?))
}

#[cfg(not(feature = "gstreamer_input"))]
fn open_file(_source: &str) -> Result<Box<dyn Capture>, InputError> {
  Err(ConfigError::FeatureDisabled("gstreamer_input").into())
}

#[cfg(feature = "ffmpeg_decoder")]
fn open_stream_decoder() -> Result<Box<dyn StreamDecoder>, InputError> {
  Ok(Box::new(FfmpegStreamDecoder::h264()?))
}

#[cfg(not(feature = "ffmpeg_decoder"))]
fn open_stream_decoder() -> Result<Box<dyn StreamDecoder>, InputError> {
  Err(ConfigError::FeatureDisabled("ffmpeg_decoder").into())
}
