// 该文件是 Shanan （山南西风） 项目的一部分。
// src/engine/replay.rs - 回放推理引擎
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

use std::{collections::BTreeMap, path::Path};

use ndarray::{ArrayD, ArrayView3, IxDyn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, engine::Engine};

#[derive(Error, Debug)]
pub enum ReplayEngineError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 解析错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("张量 '{name}' 形状与数据不匹配: {source}")]
  ShapeError {
    name: String,
    source: ndarray::ShapeError,
  },
  #[error("未知的输入张量: {0}")]
  UnknownInput(String),
  #[error("未知的输出张量: {0}")]
  UnknownOutput(String),
}

/// 记录文件中的单个张量，数据按行优先展开
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedTensor {
  pub shape: Vec<usize>,
  pub data: Vec<f32>,
}

fn default_inputs() -> Vec<String> {
  vec!["in0".to_string()]
}

/// 记录文件格式：
///
/// ```json
/// { "inputs": ["in0"], "outputs": { "out0": { "shape": [1, 300, 6], "data": [...] } } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
  #[serde(default = "default_inputs")]
  pub inputs: Vec<String>,
  pub outputs: BTreeMap<String, RecordedTensor>,
}

/// 回放事先记录的网络输出，不做任何实际计算
#[derive(Debug, Clone)]
pub struct ReplayEngine {
  inputs: Vec<String>,
  outputs: BTreeMap<String, ArrayD<f32>>,
  last_input_shape: Option<[usize; 3]>,
  use_gpu: bool,
}

impl Default for ReplayEngine {
  fn default() -> Self {
    Self {
      inputs: default_inputs(),
      outputs: BTreeMap::new(),
      last_input_shape: None,
      use_gpu: false,
    }
  }
}

impl FromUrlWithScheme for ReplayEngine {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayEngine {
  type Error = ReplayEngineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ReplayEngineError::SchemeMismatch(format!(
        "期望方案 '{}', 实际方案 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }
    Self::from_path(url.path())
  }
}

impl ReplayEngine {
  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ReplayEngineError> {
    let path = path.as_ref();
    info!("加载输出记录文件: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    let recording: Recording = serde_json::from_str(&text)?;
    Self::from_recording(recording)
  }

  pub fn from_recording(recording: Recording) -> Result<Self, ReplayEngineError> {
    let mut outputs = BTreeMap::new();
    for (name, tensor) in recording.outputs {
      let array = ArrayD::from_shape_vec(IxDyn(&tensor.shape), tensor.data).map_err(|source| {
        ReplayEngineError::ShapeError {
          name: name.clone(),
          source,
        }
      })?;
      debug!("记录输出 '{}': 形状 {:?}", name, array.shape());
      outputs.insert(name, array);
    }

    Ok(Self {
      inputs: recording.inputs,
      outputs,
      ..Self::default()
    })
  }

  pub fn with_input_names<I, S>(mut self, names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.inputs = names.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_output(mut self, name: impl Into<String>, tensor: ArrayD<f32>) -> Self {
    self.outputs.insert(name.into(), tensor);
    self
  }

  pub fn last_input_shape(&self) -> Option<[usize; 3]> {
    self.last_input_shape
  }

  pub fn use_gpu(&self) -> bool {
    self.use_gpu
  }
}

impl Engine for ReplayEngine {
  type Error = ReplayEngineError;

  fn input(&mut self, name: &str, tensor: ArrayView3<'_, f32>) -> Result<(), Self::Error> {
    if !self.inputs.iter().any(|input| input == name) {
      return Err(ReplayEngineError::UnknownInput(name.to_string()));
    }
    let (c, h, w) = tensor.dim();
    self.last_input_shape = Some([c, h, w]);
    Ok(())
  }

  fn extract(&mut self, name: &str) -> Result<ArrayD<f32>, Self::Error> {
    self
      .outputs
      .get(name)
      .cloned()
      .ok_or_else(|| ReplayEngineError::UnknownOutput(name.to_string()))
  }

  fn set_gpu(&mut self, enabled: bool) {
    self.use_gpu = enabled;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn recording_from_json() {
    let text = r#"{ "outputs": { "out0": { "shape": [2, 3], "data": [0, 1, 2, 3, 4, 5] } } }"#;
    let recording: Recording = serde_json::from_str(text).unwrap();
    let mut engine = ReplayEngine::from_recording(recording).unwrap();

    let tensor = engine.extract("out0").unwrap();
    assert_eq!(tensor.shape(), &[2, 3]);
    assert_eq!(tensor[[1, 0]], 3.0);
    assert!(matches!(
      engine.extract("out1"),
      Err(ReplayEngineError::UnknownOutput(_))
    ));
  }

  #[test]
  fn mismatched_shape_is_rejected() {
    let text = r#"{ "outputs": { "out0": { "shape": [2, 4], "data": [0, 1, 2] } } }"#;
    let recording: Recording = serde_json::from_str(text).unwrap();
    assert!(matches!(
      ReplayEngine::from_recording(recording),
      Err(ReplayEngineError::ShapeError { .. })
    ));
  }

  #[test]
  fn only_declared_inputs_are_accepted() {
    let mut engine = ReplayEngine::default();
    let tensor = ndarray::Array3::<f32>::zeros((3, 2, 2));
    assert!(engine.input("images", tensor.view()).is_err());
    assert!(engine.input("in0", tensor.view()).is_ok());
  }

  #[test]
  fn load_from_url() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outputs.json");
    std::fs::write(
      &path,
      r#"{ "inputs": ["images"], "outputs": { "output0": { "shape": [1], "data": [7] } } }"#,
    )
    .unwrap();

    let url = Url::from_file_path(&path).unwrap();
    let url = Url::parse(&url.as_str().replacen("file", "replay", 1)).unwrap();
    let mut engine = ReplayEngine::from_url(&url).unwrap();
    assert_eq!(engine.extract("output0").unwrap()[[0]], 7.0);

    let wrong = Url::parse("image:///tmp/a.json").unwrap();
    assert!(matches!(
      ReplayEngine::from_url(&wrong),
      Err(ReplayEngineError::SchemeMismatch(_))
    ));
  }
}
