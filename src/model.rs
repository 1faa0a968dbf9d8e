// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/model.rs - 模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::imageops::FilterType;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  config::{Backend, ConfigError, NetworkSettings, Target},
  frame::{DetectionCopy, Frame, RGB_CHANNELS},
};

/// 网络输入边长
pub const BLOB_SIZE: u32 = 608;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&mut self, input: Self::Input) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error("模型加载错误 {path}: {reason}")]
  Load { path: String, reason: String },
  #[error("后端 {0} 不受当前网络支持")]
  UnsupportedBackend(Backend),
  #[error("后端 {backend} 不支持推理目标 {target}")]
  UnsupportedTarget { backend: Backend, target: Target },
  #[error("未知输出层: {0}")]
  UnknownOutput(String),
  #[error("输入尺寸不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  InputShape {
    expected: (u32, u32),
    actual: (u32, u32),
  },
  #[error("推理错误: {0}")]
  Inference(String),
  #[cfg(feature = "model_rknn")]
  #[error("RKNN 错误: {0}")]
  Rknn(#[from] rknpu::Error),
}

#[derive(Error, Debug)]
pub enum DetectError {
  #[error("检测输入为空")]
  EmptyInput,
  #[error("网络推理失败: {0}")]
  Network(#[from] ModelError),
}

/// 网络输入张量，1x3xHxW，RGB 通道顺序，像素值缩放到 [0, 1]
#[derive(Debug, Clone)]
pub struct Blob {
  width: u32,
  height: u32,
  data: Vec<f32>,
}

impl Blob {
  /// 不裁剪、直接缩放到 width x height
  pub fn from_frame(frame: &Frame, width: u32, height: u32) -> Self {
    let resized;
    let image = if frame.width() == width && frame.height() == height {
      frame.image()
    } else {
      resized = image::imageops::resize(frame.image(), width, height, FilterType::Triangle);
      &resized
    };

    let plane = width as usize * height as usize;
    let mut data = vec![0f32; plane * RGB_CHANNELS];
    for (idx, pixel) in image.pixels().enumerate() {
      for c in 0..RGB_CHANNELS {
        data[c * plane + idx] = pixel.0[c] as f32 / 255.0;
      }
    }

    Blob {
      width,
      height,
      data,
    }
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  /// NCHW 排列的数据
  pub fn as_nchw(&self) -> &[f32] {
    &self.data
  }

  /// 还原为 NHWC 排列的 u8 数据，供只接受量化输入的运行时使用
  pub fn to_nhwc_u8(&self) -> Vec<u8> {
    let plane = self.width as usize * self.height as usize;
    let mut out = Vec::with_capacity(plane * RGB_CHANNELS);
    for idx in 0..plane {
      for c in 0..RGB_CHANNELS {
        out.push((self.data[c * plane + idx] * 255.0).round().clamp(0.0, 255.0) as u8);
      }
    }
    out
  }
}

/// 一个输出层的结果，按行存放，每行长度为 cols
#[derive(Debug, Clone, Default)]
pub struct OutputTensor {
  cols: usize,
  data: Vec<f32>,
}

impl OutputTensor {
  pub fn new(cols: usize, data: Vec<f32>) -> Self {
    OutputTensor { cols, data }
  }

  pub fn cols(&self) -> usize {
    self.cols
  }

  pub fn len_rows(&self) -> usize {
    if self.cols == 0 {
      0
    } else {
      self.data.len() / self.cols
    }
  }

  /// 逐行遍历，末尾不足一行的数据被忽略
  pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
    self.data.chunks_exact(self.cols.max(1)).take(self.len_rows())
  }
}

/// 像素坐标系下的矩形，右下角坐标为 left + width、top + height
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
  pub left: i32,
  pub top: i32,
  pub right: i32,
  pub bottom: i32,
}

impl Rect {
  pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
    Rect {
      left,
      top,
      right,
      bottom,
    }
  }

  pub fn width(&self) -> i32 {
    self.right.saturating_sub(self.left)
  }

  pub fn height(&self) -> i32 {
    self.bottom.saturating_sub(self.top)
  }

  pub fn area(&self) -> i64 {
    let w = (self.right as i64 - self.left as i64).max(0);
    let h = (self.bottom as i64 - self.top as i64).max(0);
    w.saturating_mul(h)
  }
}

/// 一个检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedObject {
  pub rect: Rect,
  pub class_id: usize,
  pub class_name: String,
  pub confidence: f32,
}

/// 推理网络
///
/// 前向计算本身对调用者不透明，输入为 [`Blob`]，输出为若干检测头张量。
pub trait Network {
  /// 未连接的输出层名称，即检测头
  fn output_layer_names(&self) -> Vec<String>;
  fn set_preferable_backend(&mut self, backend: Backend) -> Result<(), ModelError>;
  fn set_preferable_target(&mut self, target: Target) -> Result<(), ModelError>;
  fn forward(
    &mut self,
    blob: &Blob,
    output_layers: &[String],
  ) -> Result<Vec<OutputTensor>, ModelError>;
}

impl<N: Network + ?Sized> Network for Box<N> {
  fn output_layer_names(&self) -> Vec<String> {
    (**self).output_layer_names()
  }

  fn set_preferable_backend(&mut self, backend: Backend) -> Result<(), ModelError> {
    (**self).set_preferable_backend(backend)
  }

  fn set_preferable_target(&mut self, target: Target) -> Result<(), ModelError> {
    (**self).set_preferable_target(target)
  }

  fn forward(
    &mut self,
    blob: &Blob,
    output_layers: &[String],
  ) -> Result<Vec<OutputTensor>, ModelError> {
    (**self).forward(blob, output_layers)
  }
}

/// 按配置加载网络并设置后端与目标
pub fn create_network(settings: &NetworkSettings) -> Result<Box<dyn Network>, ModelError> {
  info!(
    "加载网络: 后端 {}, 目标 {}, 权重 {}",
    settings.backend,
    settings.target,
    settings.weights.display()
  );

  let mut network = match settings.backend {
    Backend::Rknn => load_rknn(settings)?,
    Backend::Tract => load_tract(settings)?,
  };

  network.set_preferable_backend(settings.backend)?;
  network.set_preferable_target(settings.target)?;
  Ok(network)
}

#[cfg(feature = "model_rknn")]
fn load_rknn(settings: &NetworkSettings) -> Result<Box<dyn Network>, ModelError> {
  // 每行包含 4 个框参数、1 个目标置信度和各类别分数
  let row_len = settings.class_names.len() + decode::SCORES_OFFSET;
  debug!("每行输出长度: {}", row_len);
  Ok(Box::new(RknnNetwork::load(&settings.weights, row_len)?))
}

#[cfg(not(feature = "model_rknn"))]
fn load_rknn(_settings: &NetworkSettings) -> Result<Box<dyn Network>, ModelError> {
  Err(ConfigError::FeatureDisabled("model_rknn").into())
}

#[cfg(feature = "model_tract")]
fn load_tract(settings: &NetworkSettings) -> Result<Box<dyn Network>, ModelError> {
  Ok(Box::new(TractNetwork::load(&settings.weights, BLOB_SIZE, BLOB_SIZE)?))
}

#[cfg(not(feature = "model_tract"))]
fn load_tract(_settings: &NetworkSettings) -> Result<Box<dyn Network>, ModelError> {
  Err(ConfigError::FeatureDisabled("model_tract").into())
}

/// 目标检测器：网络推理加后处理
pub struct Detector<N> {
  network: N,
  output_layers: Vec<String>,
  class_names: Vec<String>,
  class_filter: Vec<String>,
  conf_threshold: f32,
  nms_threshold: f32,
}

impl<N: Network> Detector<N> {
  pub fn new(network: N, settings: &NetworkSettings) -> Self {
    let output_layers = network.output_layer_names();
    debug!("输出层: {:?}", output_layers);
    Detector {
      network,
      output_layers,
      class_names: settings.class_names.clone(),
      class_filter: settings.target_classes.clone(),
      conf_threshold: settings.conf_threshold,
      nms_threshold: settings.nms_threshold,
    }
  }
}

impl<N: Network> Model for Detector<N> {
  type Input = DetectionCopy;
  type Output = Vec<DetectedObject>;
  type Error = DetectError;

  fn infer(&mut self, input: Self::Input) -> Result<Self::Output, Self::Error> {
    let (width, height) = (input.width(), input.height());
    if width == 0 || height == 0 {
      return Err(DetectError::EmptyInput);
    }

    let blob = Blob::from_frame(input.frame(), BLOB_SIZE, BLOB_SIZE);
    drop(input);

    debug!("执行模型推理");
    let tensors = self.network.forward(&blob, &self.output_layers)?;

    let objects = decode::decode(
      &tensors,
      self.conf_threshold,
      self.nms_threshold,
      width,
      height,
      &self.class_names,
      &self.class_filter,
    );
    debug!("检测到 {} 个物体", objects.len());
    Ok(objects)
  }
}

pub mod decode;

#[cfg(feature = "model_rknn")]
mod rknn;
#[cfg(feature = "model_rknn")]
pub use self::rknn::RknnNetwork;

#[cfg(feature = "model_tract")]
mod tract;
#[cfg(feature = "model_tract")]
pub use self::tract::TractNetwork;

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::{FrameBuffer, FrameLedger, preprocess};
  use image::{Rgb, RgbImage};

  #[test]
  fn blob_is_planar_and_normalised() {
    let mut image = RgbImage::new(2, 1);
    image.put_pixel(0, 0, Rgb([255, 0, 51]));
    image.put_pixel(1, 0, Rgb([0, 102, 255]));
    let blob = Blob::from_frame(&Frame::from_image(image), 2, 1);

    let data = blob.as_nchw();
    assert_eq!(data.len(), 6);
    assert_eq!(data[0], 1.0);
    assert_eq!(data[1], 0.0);
    assert!((data[3] - 0.4).abs() < 1e-6);
    assert!((data[4] - 0.2).abs() < 1e-6);
    assert_eq!(data[5], 1.0);
    assert_eq!(blob.to_nhwc_u8(), vec![255, 0, 51, 0, 102, 255]);
  }

  #[test]
  fn blob_resizes_to_requested_size() {
    let blob = Blob::from_frame(&Frame::from_image(RgbImage::new(64, 48)), 32, 32);
    assert_eq!((blob.width(), blob.height()), (32, 32));
    assert_eq!(blob.as_nchw().len(), 32 * 32 * 3);
  }

  #[test]
  fn output_tensor_ignores_partial_rows() {
    let tensor = OutputTensor::new(3, vec![0.0; 7]);
    assert_eq!(tensor.len_rows(), 2);
    assert_eq!(tensor.rows().count(), 2);
    assert_eq!(OutputTensor::new(0, vec![1.0]).rows().count(), 0);
  }

  struct FixedNetwork {
    rows: Vec<f32>,
    seen: Option<(u32, u32)>,
  }

  impl Network for FixedNetwork {
    fn output_layer_names(&self) -> Vec<String> {
      vec!["yolo_0".to_string()]
    }

    fn set_preferable_backend(&mut self, _: Backend) -> Result<(), ModelError> {
      Ok(())
    }

    fn set_preferable_target(&mut self, _: Target) -> Result<(), ModelError> {
      Ok(())
    }

    fn forward(&mut self, blob: &Blob, layers: &[String]) -> Result<Vec<OutputTensor>, ModelError> {
      assert_eq!(layers, ["yolo_0".to_string()]);
      self.seen = Some((blob.width(), blob.height()));
      Ok(vec![OutputTensor::new(9, self.rows.clone())])
    }
  }

  fn settings() -> NetworkSettings {
    NetworkSettings {
      enable: true,
      backend: Backend::Tract,
      target: Target::Cpu,
      weights: Default::default(),
      config: None,
      conf_threshold: 0.5,
      nms_threshold: 0.4,
      class_names: ["person", "bicycle", "car", "motorbike"]
        .map(String::from)
        .to_vec(),
      target_classes: vec!["motorbike".to_string()],
    }
  }

  #[test]
  fn detector_consumes_copy_and_decodes_against_copy_size() {
    let ledger = FrameLedger::new();
    let mut buffer = FrameBuffer::new(ledger.clone());
    buffer
      .raw_mut()
      .overwrite(64, 48, &vec![128; 64 * 48 * 3])
      .unwrap();
    preprocess(&mut buffer, 640, 480).unwrap();

    let network = FixedNetwork {
      rows: vec![0.5, 0.5, 0.2, 0.4, 0.8, 0.0, 0.0, 0.0, 0.9],
      seen: None,
    };
    let mut detector = Detector::new(network, &settings());
    let copy = buffer.take_scaled_copy().unwrap();
    let objects = detector.infer(copy).unwrap();

    assert_eq!(ledger.outstanding_copies(), 0);
    assert_eq!(detector.network.seen, Some((BLOB_SIZE, BLOB_SIZE)));
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].class_id, 3);
    assert_eq!(objects[0].rect, Rect::new(256, 144, 384, 336));
  }

  #[cfg(not(feature = "model_tract"))]
  #[test]
  fn tract_backend_without_feature_is_config_error() {
    assert!(matches!(
      create_network(&settings()),
      Err(ModelError::Config(ConfigError::FeatureDisabled("model_tract")))
    ));
  }

  #[cfg(not(feature = "model_rknn"))]
  #[test]
  fn rknn_backend_without_feature_is_config_error() {
    let settings = NetworkSettings {
      backend: Backend::Rknn,
      target: Target::Npu,
      ..settings()
    };
    assert!(matches!(
      create_network(&settings),
      Err(ModelError::Config(ConfigError::FeatureDisabled("model_rknn")))
    ));
  }
}
