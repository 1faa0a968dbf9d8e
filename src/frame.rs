// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/frame.rs - RGB 帧与帧缓冲
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

use std::sync::{
  Arc,
  atomic::{AtomicUsize, Ordering},
};

use image::{RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::debug;

pub const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("帧为空")]
  EmptyFrame,
  #[error("无效的目标分辨率 {width}x{height}")]
  InvalidTarget { width: u32, height: u32 },
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  DataSize { expected: usize, actual: usize },
}

/// 记账凭据，存活期间对应计数器加一
#[derive(Debug)]
struct Lease(Arc<AtomicUsize>);

impl Lease {
  fn new(counter: &Arc<AtomicUsize>) -> Self {
    counter.fetch_add(1, Ordering::SeqCst);
    Lease(Arc::clone(counter))
  }
}

impl Clone for Lease {
  fn clone(&self) -> Self {
    Lease::new(&self.0)
  }
}

impl Drop for Lease {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

/// 帧分配记账
///
/// 每个经由记账创建的帧（及其克隆）和每个检测副本都会计数，
/// 释放时自动扣减，用于核对缓冲是否按时释放。
#[derive(Debug, Clone, Default)]
pub struct FrameLedger {
  frames: Arc<AtomicUsize>,
  copies: Arc<AtomicUsize>,
}

impl FrameLedger {
  pub fn new() -> Self {
    Self::default()
  }

  /// 当前存活的帧数量
  pub fn outstanding_frames(&self) -> usize {
    self.frames.load(Ordering::SeqCst)
  }

  /// 当前存活的检测副本数量
  pub fn outstanding_copies(&self) -> usize {
    self.copies.load(Ordering::SeqCst)
  }

  pub fn track(&self, image: RgbImage) -> Frame {
    Frame {
      image,
      lease: Some(Lease::new(&self.frames)),
    }
  }
}

/// 一帧 RGB 图像，像素按行优先紧密排列
#[derive(Debug)]
pub struct Frame {
  image: RgbImage,
  lease: Option<Lease>,
}

impl Clone for Frame {
  fn clone(&self) -> Self {
    Frame {
      image: self.image.clone(),
      lease: self.lease.clone(),
    }
  }
}

impl Default for Frame {
  fn default() -> Self {
    Self::empty()
  }
}

impl Frame {
  /// 0x0 的空帧
  pub fn empty() -> Self {
    Frame {
      image: RgbImage::new(0, 0),
      lease: None,
    }
  }

  pub fn from_image(image: RgbImage) -> Self {
    Frame { image, lease: None }
  }

  pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
    let expected = rgb_len(width, height);
    if data.len() != expected {
      return Err(FrameError::DataSize {
        expected,
        actual: data.len(),
      });
    }
    let image = RgbImage::from_raw(width, height, data).ok_or(FrameError::DataSize {
      expected,
      actual: 0,
    })?;
    Ok(Frame::from_image(image))
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn is_empty(&self) -> bool {
    self.image.width() == 0 || self.image.height() == 0
  }

  pub fn as_raw(&self) -> &[u8] {
    self.image.as_raw()
  }

  pub fn image(&self) -> &RgbImage {
    &self.image
  }

  pub fn image_mut(&mut self) -> &mut RgbImage {
    &mut self.image
  }

  /// 用新像素覆盖本帧；尺寸不变时复用已有内存
  pub fn overwrite(&mut self, width: u32, height: u32, data: &[u8]) -> Result<(), FrameError> {
    let expected = rgb_len(width, height);
    if data.len() != expected {
      return Err(FrameError::DataSize {
        expected,
        actual: data.len(),
      });
    }

    if self.image.width() == width && self.image.height() == height {
      let buffer: &mut [u8] = &mut self.image;
      buffer.copy_from_slice(data);
    } else {
      debug!(
        "帧尺寸变化 {}x{} -> {}x{}，重新分配",
        self.image.width(),
        self.image.height(),
        width,
        height
      );
      self.replace(RgbImage::from_raw(width, height, data.to_vec()).ok_or(
        FrameError::DataSize {
          expected,
          actual: data.len(),
        },
      )?);
    }
    Ok(())
  }

  /// 替换像素内容，保留记账凭据
  pub fn replace(&mut self, image: RgbImage) {
    self.image = image;
  }

  /// 清空为 0x0 帧
  pub fn clear(&mut self) {
    self.image = RgbImage::new(0, 0);
  }
}

fn rgb_len(width: u32, height: u32) -> usize {
  width as usize * height as usize * RGB_CHANNELS
}

/// 供检测使用的独立副本
///
/// 不可克隆，只能整体移交给检测器，由检测器消费后释放。
#[derive(Debug)]
pub struct DetectionCopy {
  frame: Frame,
  _lease: Lease,
}

impl DetectionCopy {
  pub fn frame(&self) -> &Frame {
    &self.frame
  }

  pub fn width(&self) -> u32 {
    self.frame.width()
  }

  pub fn height(&self) -> u32 {
    self.frame.height()
  }
}

/// 一个处理周期内的三块图像缓冲：原始帧、缩放帧、缩放帧的检测副本
#[derive(Debug)]
pub struct FrameBuffer {
  ledger: FrameLedger,
  raw: Frame,
  scaled: Frame,
  scaled_copy: Option<DetectionCopy>,
}

impl FrameBuffer {
  pub fn new(ledger: FrameLedger) -> Self {
    let raw = ledger.track(RgbImage::new(0, 0));
    let scaled = ledger.track(RgbImage::new(0, 0));
    FrameBuffer {
      ledger,
      raw,
      scaled,
      scaled_copy: None,
    }
  }

  pub fn ledger(&self) -> &FrameLedger {
    &self.ledger
  }

  pub fn raw(&self) -> &Frame {
    &self.raw
  }

  pub fn raw_mut(&mut self) -> &mut Frame {
    &mut self.raw
  }

  pub fn scaled(&self) -> &Frame {
    &self.scaled
  }

  pub fn scaled_mut(&mut self) -> &mut Frame {
    &mut self.scaled
  }

  /// 取走检测副本，之后由调用者负责消费
  pub fn take_scaled_copy(&mut self) -> Option<DetectionCopy> {
    self.scaled_copy.take()
  }

  /// 结束本周期，释放未被取走的检测副本
  pub fn end_cycle(&mut self) {
    if self.scaled_copy.take().is_some() {
      debug!("释放未使用的检测副本");
    }
  }
}

impl Drop for FrameBuffer {
  fn drop(&mut self) {
    debug!("释放帧缓冲");
  }
}

/// 将原始帧双线性缩放到目标分辨率，并生成一份独立的检测副本
pub fn preprocess(
  buffer: &mut FrameBuffer,
  target_width: u32,
  target_height: u32,
) -> Result<(), FrameError> {
  if buffer.raw.is_empty() {
    return Err(FrameError::EmptyFrame);
  }
  if target_width == 0 || target_height == 0 {
    return Err(FrameError::InvalidTarget {
      width: target_width,
      height: target_height,
    });
  }

  let resized = if buffer.raw.width() == target_width && buffer.raw.height() == target_height {
    buffer.raw.image.clone()
  } else {
    image::imageops::resize(
      &buffer.raw.image,
      target_width,
      target_height,
      FilterType::Triangle,
    )
  };
  buffer.scaled.replace(resized);

  let copy = DetectionCopy {
    frame: Frame::from_image(buffer.scaled.image.clone()),
    _lease: Lease::new(&buffer.ledger.copies),
  };
  if buffer.scaled_copy.replace(copy).is_some() {
    debug!("上一周期的检测副本未释放，已覆盖");
  }
  Ok(())
}
