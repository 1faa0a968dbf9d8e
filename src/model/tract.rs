// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/model/tract.rs - tract ONNX 推理网络
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use tract_onnx::prelude::*;
use tracing::{debug, info};

use crate::{
  config::{Backend, Target},
  model::{Blob, ModelError, Network, OutputTensor},
};

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>>;

pub struct TractNetwork {
  plan: Plan,
  width: u32,
  height: u32,
  output_names: Vec<String>,
}

fn load_error(path: &Path, e: impl std::fmt::Display) -> ModelError {
  ModelError::Load {
    path: path.display().to_string(),
    reason: e.to_string(),
  }
}

impl TractNetwork {
  /// 加载 ONNX 模型，输入固定为 1x3xHxW 的 f32 张量
  pub fn load(model_path: &Path, width: u32, height: u32) -> Result<Self, ModelError> {
    info!("加载 ONNX 模型: {}", model_path.display());
    let model = tract_onnx::onnx()
      .model_for_path(model_path)
      .map_err(|e| load_error(model_path, e))?
      .with_input_fact(
        0,
        InferenceFact::dt_shape(
          f32::datum_type(),
          tvec!(1, 3, height as usize, width as usize),
        ),
      )
      .map_err(|e| load_error(model_path, e))?
      .into_optimized()
      .map_err(|e| load_error(model_path, e))?;

    let output_names = model
      .output_outlets()
      .map_err(|e| load_error(model_path, e))?
      .iter()
      .map(|outlet| model.node(outlet.node).name.clone())
      .collect::<Vec<_>>();
    debug!("模型输出层: {:?}", output_names);

    let plan = model
      .into_runnable()
      .map_err(|e| load_error(model_path, e))?;
    info!("模型加载完成");

    Ok(TractNetwork {
      plan,
      width,
      height,
      output_names,
    })
  }
}

impl Network for TractNetwork {
  fn output_layer_names(&self) -> Vec<String> {
    self.output_names.clone()
  }

  fn set_preferable_backend(&mut self, backend: Backend) -> Result<(), ModelError> {
    match backend {
      Backend::Tract => Ok(()),
      other => Err(ModelError::UnsupportedBackend(other)),
    }
  }

  fn set_preferable_target(&mut self, target: Target) -> Result<(), ModelError> {
    match target {
      Target::Cpu => Ok(()),
      other => Err(ModelError::UnsupportedTarget {
        backend: Backend::Tract,
        target: other,
      }),
    }
  }

  fn forward(
    &mut self,
    blob: &Blob,
    output_layers: &[String],
  ) -> Result<Vec<OutputTensor>, ModelError> {
    if blob.width() != self.width || blob.height() != self.height {
      return Err(ModelError::InputShape {
        expected: (self.width, self.height),
        actual: (blob.width(), blob.height()),
      });
    }

    let input = tract_ndarray::Array4::from_shape_vec(
      (1, 3, self.height as usize, self.width as usize),
      blob.as_nchw().to_vec(),
    )
    .map_err(|e| ModelError::Inference(e.to_string()))?
    .into_tensor();

    let outputs = self
      .plan
      .run(tvec!(input.into()))
      .map_err(|e| ModelError::Inference(format!("{:#}", e)))?;

    let mut tensors = Vec::with_capacity(output_layers.len());
    for name in output_layers {
      let index = self
        .output_names
        .iter()
        .position(|n| n == name)
        .ok_or_else(|| ModelError::UnknownOutput(name.clone()))?;
      let view = outputs
        .get(index)
        .ok_or_else(|| ModelError::UnknownOutput(name.clone()))?
        .to_array_view::<f32>()
        .map_err(|e| ModelError::Inference(format!("{:#}", e)))?;
      let cols = view.shape().last().copied().unwrap_or(0);
      tensors.push(OutputTensor::new(cols, view.iter().copied().collect()));
    }
    Ok(tensors)
  }
}
