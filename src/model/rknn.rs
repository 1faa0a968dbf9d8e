// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/model/rknn.rs - RKNN NPU 推理网络
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use tracing::{debug, error, info};

use crate::{
  config::{Backend, Target},
  model::{Blob, ModelError, Network, OutputTensor},
};

const RKNN_NUM_INPUTS: u32 = 1;

pub struct RknnNetwork {
  context: Context,
  output_names: Vec<String>,
  row_len: usize,
}

impl RknnNetwork {
  /// 加载 .rknn 模型，`row_len` 为每个检测行的长度
  pub fn load(model_path: &Path, row_len: usize) -> Result<Self, ModelError> {
    info!("加载模型文件: {}", model_path.display());
    let model_data = std::fs::read(model_path).map_err(|e| ModelError::Load {
      path: model_path.display().to_string(),
      reason: e.to_string(),
    })?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&model_data, InitFlags::default())?;

    if let Ok(version) = context.sdk_version() {
      if let Ok(api_ver) = version.api_version() {
        debug!("模型 API 版本: {}", api_ver);
      }
      if let Ok(drv_ver) = version.driver_version() {
        debug!("模型驱动版本: {}", drv_ver);
      }
    }

    let num_inputs = context.num_inputs()?;
    let num_outputs = context.num_outputs()?;
    if num_inputs != RKNN_NUM_INPUTS {
      error!(
        "预期模型输入数量为 {}, 实际为 {}",
        RKNN_NUM_INPUTS, num_inputs
      );
      return Err(ModelError::Load {
        path: model_path.display().to_string(),
        reason: format!("输入数量为 {}", num_inputs),
      });
    }
    debug!("模型输出数量: {}", num_outputs);

    let output_names = (0..num_outputs).map(|i| format!("output{}", i)).collect();
    info!("模型加载完成");

    Ok(RknnNetwork {
      context,
      output_names,
      row_len,
    })
  }
}

impl Network for RknnNetwork {
  fn output_layer_names(&self) -> Vec<String> {
    self.output_names.clone()
  }

  fn set_preferable_backend(&mut self, backend: Backend) -> Result<(), ModelError> {
    match backend {
      Backend::Rknn => Ok(()),
      other => Err(ModelError::UnsupportedBackend(other)),
    }
  }

  fn set_preferable_target(&mut self, target: Target) -> Result<(), ModelError> {
    match target {
      Target::Npu => Ok(()),
      other => Err(ModelError::UnsupportedTarget {
        backend: Backend::Rknn,
        target: other,
      }),
    }
  }

  fn forward(
    &mut self,
    blob: &Blob,
    output_layers: &[String],
  ) -> Result<Vec<OutputTensor>, ModelError> {
    // RKNN 模型内部完成归一化，输入为量化前的 NHWC 字节
    let input = blob.to_nhwc_u8();
    self
      .context
      .set_input(0, &input, TensorFormat::NHWC, TensorType::UInt8)?;

    debug!("执行模型推理");
    self.context.run()?;

    let outputs = self.context.get_outputs()?;
    let mut tensors = Vec::with_capacity(output_layers.len());
    for name in output_layers {
      let index = self
        .output_names
        .iter()
        .position(|n| n == name)
        .ok_or_else(|| ModelError::UnknownOutput(name.clone()))?;
      let data = outputs.get_f32(index)?;
      tensors.push(OutputTensor::new(self.row_len, data.to_vec()));
    }
    Ok(tensors)
  }
}
