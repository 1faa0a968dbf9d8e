// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/input/v4l2_source.rs - V4L2 摄像头输入源
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::pin::Pin;

use thiserror::Error;
use tracing::{error, info};
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture as _;

use crate::{frame::Frame, input::Capture};

const V4L2_BUFFER_COUNT: u32 = 4;

#[derive(Error, Debug)]
pub enum V4l2SourceError {
  #[error("无法打开设备 {path}: {source}")]
  Open {
    path: String,
    source: std::io::Error,
  },
  #[error("设备 I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("设备不支持 YUYV 格式，实际为 {0}")]
  UnsupportedFormat(FourCC),
}

/// V4L2 摄像头
///
/// 使用 Pin<Box<Device>> 固定设备地址，使引用它的 Stream 可以与其存放在同一结构体中。
pub struct V4l2Source {
  device: Pin<Box<Device>>,
  stream: Option<Stream<'static>>,
  width: u32,
  height: u32,
  rgb: Vec<u8>,
}

impl V4l2Source {
  /// 打开设备，使用设备当前分辨率，像素格式固定为 YUYV
  pub fn new(device_path: &str) -> Result<Self, V4l2SourceError> {
    let device = Box::pin(Device::with_path(device_path).map_err(|source| {
      V4l2SourceError::Open {
        path: device_path.to_string(),
        source,
      }
    })?);

    let mut format = device.format()?;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device.set_format(&format)?;
    if format.fourcc != FourCC::new(b"YUYV") {
      return Err(V4l2SourceError::UnsupportedFormat(format.fourcc));
    }
    info!(
      "打开摄像头 {}: {}x{}",
      device_path, format.width, format.height
    );

    let mut source = V4l2Source {
      device,
      stream: None,
      width: format.width,
      height: format.height,
      rgb: Vec::new(),
    };

    // SAFETY: device 固定在堆上不会移动；stream 在 Drop 中先于 device 释放
    let device_ref: &Device = &source.device;
    let stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, V4L2_BUFFER_COUNT)?
    };
    source.stream = Some(stream);
    Ok(source)
  }
}

impl Drop for V4l2Source {
  fn drop(&mut self) {
    self.stream.take();
  }
}

impl Capture for V4l2Source {
  fn read(&mut self, frame: &mut Frame) -> bool {
    let Some(stream) = self.stream.as_mut() else {
      return false;
    };

    match stream.next() {
      Ok((buffer, _meta)) => {
        yuyv_to_rgb(buffer, &mut self.rgb);
        match frame.overwrite(self.width, self.height, &self.rgb) {
          Ok(()) => true,
          Err(e) => {
            error!("摄像头帧尺寸异常: {}", e);
            false
          }
        }
      }
      Err(e) => {
        error!("无法捕获帧: {}", e);
        false
      }
    }
  }
}

/// YUYV 转 RGB，每 4 字节输出两个像素
fn yuyv_to_rgb(yuyv: &[u8], rgb: &mut Vec<u8>) {
  rgb.clear();
  for chunk in yuyv.chunks_exact(4) {
    let u = chunk[1] as f32 - 128.0;
    let v = chunk[3] as f32 - 128.0;
    for y in [chunk[0] as f32, chunk[2] as f32] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn yuyv_grey_maps_to_grey() {
    let mut rgb = Vec::new();
    yuyv_to_rgb(&[100, 128, 200, 128], &mut rgb);
    assert_eq!(rgb, vec![100, 100, 100, 200, 200, 200]);
  }
}
