// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/config.rs - 运行配置
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 运行配置
//!
//! 配置在启动时从 JSON 文件读取一次，校验后在整个运行期间只读。
//!
//! ```json
//! {
//!   "source": "camera",
//!   "neural_network_settings": {
//!     "enable": true,
//!     "backend": "tract",
//!     "target": "cpu",
//!     "weights": "models/yolov4.onnx",
//!     "classes": "models/coco.names",
//!     "conf_threshold": 0.5,
//!     "nms_threshold": 0.4,
//!     "target_classes": ["person", "car"]
//!   },
//!   "camera_settings": {
//!     "address": "0.0.0.0", "port": 11111,
//!     "width": 960, "height": 720,
//!     "reduced_width": 640, "reduced_height": 480
//!   },
//!   "video_settings": { "source": "", "reduced_width": 640, "reduced_height": 480 },
//!   "mjpeg_settings": { "imshow_enable": false, "enable": true, "port": 8090 }
//! }
//! ```

use std::{
  fmt,
  path::{Path, PathBuf},
  str::FromStr,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

const DEFAULT_CONF_THRESHOLD: f32 = 0.5;
const DEFAULT_NMS_THRESHOLD: f32 = 0.4;
const DEFAULT_REDUCED_WIDTH: u32 = 640;
const DEFAULT_REDUCED_HEIGHT: u32 = 480;
const DEFAULT_MJPEG_PORT: u16 = 8090;
const DEFAULT_JPEG_QUALITY: u8 = 95;
const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("无法读取文件 {}: {source}", path.display())]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("配置文件格式错误: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("输入源配置为空")]
  EmptySource,
  #[error("未知输入源: '{0}'（可选 webcam / video / camera）")]
  UnknownSource(String),
  #[error("缺少配置段 '{0}'")]
  MissingSection(&'static str),
  #[error("未知推理后端: '{0}'")]
  UnknownBackend(String),
  #[error("未知推理目标: '{0}'")]
  UnknownTarget(String),
  #[error("未知裁剪模式: '{0}'")]
  UnknownClipMode(String),
  #[error("模型文件不存在: {}", .0.display())]
  MissingModelFile(PathBuf),
  #[error("阈值 {name} 超出范围 [0, 1]: {value}")]
  ThresholdOutOfRange { name: &'static str, value: f32 },
  #[error("功能 '{0}' 未编译进当前程序")]
  FeatureDisabled(&'static str),
}

/// 输入源类型，启动时选定，运行期间不会切换
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
  /// 本地摄像头设备
  Device,
  /// 视频文件或 URL
  File,
  /// UDP 推送的压缩视频流
  Stream,
}

impl FromStr for SourceKind {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim() {
      "" => Err(ConfigError::EmptySource),
      "webcam" => Ok(SourceKind::Device),
      "video" => Ok(SourceKind::File),
      "camera" => Ok(SourceKind::Stream),
      other => Err(ConfigError::UnknownSource(other.to_string())),
    }
  }
}

impl fmt::Display for SourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      SourceKind::Device => "webcam",
      SourceKind::File => "video",
      SourceKind::Stream => "camera",
    };
    f.write_str(name)
  }
}

/// 推理后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
  /// Rockchip NPU 运行时
  Rknn,
  /// tract ONNX 运行时
  #[default]
  Tract,
}

impl FromStr for Backend {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "rknn" | "rknpu" => Ok(Backend::Rknn),
      "tract" | "onnx" => Ok(Backend::Tract),
      other => Err(ConfigError::UnknownBackend(other.to_string())),
    }
  }
}

impl fmt::Display for Backend {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Backend::Rknn => f.write_str("rknn"),
      Backend::Tract => f.write_str("tract"),
    }
  }
}

/// 推理目标设备
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
  #[default]
  Cpu,
  Npu,
}

impl FromStr for Target {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "cpu" => Ok(Target::Cpu),
      "npu" => Ok(Target::Npu),
      other => Err(ConfigError::UnknownTarget(other.to_string())),
    }
  }
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Target::Cpu => f.write_str("cpu"),
      Target::Npu => f.write_str("npu"),
    }
  }
}

/// 检测框裁剪所参照的分辨率
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClipMode {
  /// 检测框计算时使用的缩放帧尺寸
  #[default]
  Scaled,
  /// 摄像头采集分辨率（camera_settings.width / height）
  Capture,
}

impl FromStr for ClipMode {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "" | "scaled" => Ok(ClipMode::Scaled),
      "capture" => Ok(ClipMode::Capture),
      other => Err(ConfigError::UnknownClipMode(other.to_string())),
    }
  }
}

// ---- 配置文件原始结构 ----

#[derive(Debug, Deserialize, Default)]
struct SettingsFile {
  #[serde(default)]
  source: String,
  #[serde(default)]
  neural_network_settings: NetworkSettingsFile,
  camera_settings: Option<CameraSettings>,
  video_capture_device: Option<DeviceSettings>,
  video_settings: Option<VideoSettingsFile>,
  #[serde(default)]
  mjpeg_settings: MjpegSettingsFile,
  #[serde(default)]
  annotation_settings: AnnotationSettingsFile,
}

#[derive(Debug, Deserialize, Default)]
struct NetworkSettingsFile {
  #[serde(default)]
  enable: bool,
  #[serde(default)]
  backend: String,
  #[serde(default)]
  target: String,
  #[serde(default, alias = "darknet_weights")]
  weights: PathBuf,
  #[serde(default, alias = "darknet_cfg")]
  config: Option<PathBuf>,
  #[serde(default, alias = "darknet_classes")]
  classes: Option<PathBuf>,
  conf_threshold: Option<f32>,
  nms_threshold: Option<f32>,
  #[serde(default)]
  target_classes: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoSettingsFile {
  #[serde(default)]
  source: String,
  #[serde(default)]
  reduced_width: u32,
  #[serde(default)]
  reduced_height: u32,
}

#[derive(Debug, Deserialize, Default)]
struct MjpegSettingsFile {
  #[serde(default)]
  imshow_enable: bool,
  #[serde(default)]
  enable: bool,
  port: Option<u16>,
  jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct AnnotationSettingsFile {
  #[serde(default)]
  clip: String,
}

// ---- 校验后的配置 ----

/// 神经网络配置
#[derive(Debug, Clone)]
pub struct NetworkSettings {
  pub enable: bool,
  pub backend: Backend,
  pub target: Target,
  /// 权重 / 模型文件
  pub weights: PathBuf,
  /// 网络结构描述文件，现有后端都从权重文件读取结构，此项只作记录
  pub config: Option<PathBuf>,
  pub conf_threshold: f32,
  pub nms_threshold: f32,
  /// 网络全部类别名称，下标即类别编号
  pub class_names: Vec<String>,
  /// 需要保留的类别名称
  pub target_classes: Vec<String>,
}

/// UDP 压缩视频流配置
#[derive(Debug, Clone, Deserialize)]
pub struct CameraSettings {
  pub address: String,
  pub port: u16,
  /// 采集分辨率
  #[serde(default)]
  pub width: u32,
  #[serde(default)]
  pub height: u32,
  #[serde(default)]
  pub reduced_width: u32,
  #[serde(default)]
  pub reduced_height: u32,
  /// 读超时（毫秒），0 表示阻塞读取
  #[serde(default = "default_read_timeout_ms")]
  pub read_timeout_ms: u64,
}

fn default_read_timeout_ms() -> u64 {
  DEFAULT_READ_TIMEOUT_MS
}

/// 本地摄像头设备配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DeviceSettings {
  #[serde(default)]
  pub device_id: u32,
}

/// 视频文件配置，同时提供非 UDP 源的缩放分辨率
#[derive(Debug, Clone)]
pub struct VideoSettings {
  pub source: String,
  pub reduced_width: u32,
  pub reduced_height: u32,
}

#[derive(Debug, Clone)]
pub struct MjpegSettings {
  /// 是否在本地窗口显示
  pub imshow_enable: bool,
  /// 是否启动 MJPEG 推流
  pub enable: bool,
  pub port: u16,
  pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Default)]
pub struct AnnotationSettings {
  pub clip: ClipMode,
}

/// 应用配置
#[derive(Debug, Clone)]
pub struct Settings {
  pub source: SourceKind,
  pub network: NetworkSettings,
  pub camera: Option<CameraSettings>,
  pub device: Option<DeviceSettings>,
  pub video: VideoSettings,
  pub mjpeg: MjpegSettings,
  pub annotation: AnnotationSettings,
}

impl Settings {
  /// 从配置文件加载
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    info!("读取配置文件: {}", path.display());
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let settings = Self::from_json(&text)?;
    settings.check_model_files()?;
    Ok(settings)
  }

  /// 解析并校验 JSON 配置；类别文件在此读取
  pub fn from_json(text: &str) -> Result<Self, ConfigError> {
    let file: SettingsFile = serde_json::from_str(text)?;

    let source = SourceKind::from_str(&file.source)?;

    let video = file
      .video_settings
      .map(VideoSettings::prepare)
      .ok_or(ConfigError::MissingSection("video_settings"))?;

    let network = NetworkSettings::from_file(file.neural_network_settings)?;

    if source == SourceKind::Stream && file.camera_settings.is_none() {
      return Err(ConfigError::MissingSection("camera_settings"));
    }

    let mjpeg = MjpegSettings {
      imshow_enable: file.mjpeg_settings.imshow_enable,
      enable: file.mjpeg_settings.enable,
      port: file.mjpeg_settings.port.unwrap_or(DEFAULT_MJPEG_PORT),
      jpeg_quality: file
        .mjpeg_settings
        .jpeg_quality
        .unwrap_or(DEFAULT_JPEG_QUALITY)
        .clamp(1, 100),
    };

    let annotation = AnnotationSettings {
      clip: ClipMode::from_str(&file.annotation_settings.clip)?,
    };

    Ok(Settings {
      source,
      network,
      camera: file.camera_settings,
      device: file.video_capture_device,
      video,
      mjpeg,
      annotation,
    })
  }

  fn check_model_files(&self) -> Result<(), ConfigError> {
    if !self.network.enable {
      return Ok(());
    }
    if !self.network.weights.is_file() {
      return Err(ConfigError::MissingModelFile(self.network.weights.clone()));
    }
    if let Some(cfg) = &self.network.config {
      debug!("网络结构文件 {} 不被当前后端使用", cfg.display());
    }
    Ok(())
  }

  /// 当前输入源对应的缩放分辨率
  ///
  /// UDP 源在其缩放尺寸与采集尺寸都不同时使用 camera_settings 的缩放尺寸，
  /// 其余情况使用 video_settings 的缩放尺寸。
  pub fn target_resolution(&self) -> (u32, u32) {
    if self.source == SourceKind::Stream {
      if let Some(camera) = &self.camera {
        if camera.reduced_width != camera.width
          && camera.reduced_height != camera.height
          && camera.reduced_width > 0
          && camera.reduced_height > 0
        {
          return (camera.reduced_width, camera.reduced_height);
        }
      }
    }
    (self.video.reduced_width, self.video.reduced_height)
  }

  /// 检测框裁剪的边界尺寸
  pub fn clip_bounds(&self, scaled_width: u32, scaled_height: u32) -> (u32, u32) {
    match self.annotation.clip {
      ClipMode::Scaled => (scaled_width, scaled_height),
      ClipMode::Capture => match &self.camera {
        Some(camera) if camera.width > 0 && camera.height > 0 => (camera.width, camera.height),
        _ => {
          warn!("未配置采集分辨率，裁剪边界回退为缩放帧尺寸");
          (scaled_width, scaled_height)
        }
      },
    }
  }
}

impl VideoSettings {
  fn prepare(file: VideoSettingsFile) -> Self {
    let (reduced_width, reduced_height) = if file.reduced_width == 0 || file.reduced_height == 0 {
      debug!(
        "video_settings 未指定缩放分辨率，使用默认值 {}x{}",
        DEFAULT_REDUCED_WIDTH, DEFAULT_REDUCED_HEIGHT
      );
      (DEFAULT_REDUCED_WIDTH, DEFAULT_REDUCED_HEIGHT)
    } else {
      (file.reduced_width, file.reduced_height)
    };

    VideoSettings {
      source: file.source,
      reduced_width,
      reduced_height,
    }
  }
}

impl NetworkSettings {
  fn from_file(file: NetworkSettingsFile) -> Result<Self, ConfigError> {
    let backend = match (file.enable, file.backend.trim()) {
      (false, "") => Backend::default(),
      (_, name) => Backend::from_str(name)?,
    };
    let target = match (file.enable, file.target.trim()) {
      (false, "") => Target::default(),
      (_, name) => Target::from_str(name)?,
    };

    let conf_threshold = check_threshold(
      "conf_threshold",
      file.conf_threshold.unwrap_or(DEFAULT_CONF_THRESHOLD),
    )?;
    let nms_threshold = check_threshold(
      "nms_threshold",
      file.nms_threshold.unwrap_or(DEFAULT_NMS_THRESHOLD),
    )?;

    let class_names = match &file.classes {
      Some(path) => read_class_names(path)?,
      None if file.enable => return Err(ConfigError::MissingSection("neural_network_settings.classes")),
      None => Vec::new(),
    };

    if file.enable && file.target_classes.is_empty() {
      warn!("target_classes 为空，所有检测结果都将被过滤");
    }
    for name in &file.target_classes {
      if !class_names.iter().any(|c| c == name) {
        warn!("目标类别 '{}' 不在网络类别列表中", name);
      }
    }

    Ok(NetworkSettings {
      enable: file.enable,
      backend,
      target,
      weights: file.weights,
      config: file.config,
      conf_threshold,
      nms_threshold,
      class_names,
      target_classes: file.target_classes,
    })
  }
}

fn check_threshold(name: &'static str, value: f32) -> Result<f32, ConfigError> {
  if (0.0..=1.0).contains(&value) {
    Ok(value)
  } else {
    Err(ConfigError::ThresholdOutOfRange { name, value })
  }
}

/// 读取类别文件，每行一个类别名称
pub fn read_class_names(path: &Path) -> Result<Vec<String>, ConfigError> {
  let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  Ok(parse_class_names(&content))
}

fn parse_class_names(content: &str) -> Vec<String> {
  let mut names: Vec<String> = content.lines().map(|l| l.trim_end().to_string()).collect();
  while names.last().is_some_and(|n| n.is_empty()) {
    names.pop();
  }
  names
}
