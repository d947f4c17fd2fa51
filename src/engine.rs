// 该文件是 Shanan （山南西风） 项目的一部分。
// src/engine.rs - 推理引擎接口
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

use ndarray::{ArrayD, ArrayView3};
use tracing::debug;

use crate::model::DecodeError;

mod replay;
pub use self::replay::{RecordedTensor, Recording, ReplayEngine, ReplayEngineError};

/// 输入张量的备选名称
pub const INPUT_FALLBACKS: [&str; 3] = ["in0", "images", "data"];
/// 检测输出张量的备选名称
pub const OUTPUT_FALLBACKS: [&str; 3] = ["out0", "output0", "output"];
/// 原型（掩码）张量的备选名称
pub const PROTO_FALLBACKS: [&str; 3] = ["out1", "seg", "output1"];

/// 推理引擎。
///
/// 引擎本身不可重入，调用方需要为每个工作线程准备独立实例。
pub trait Engine {
  type Error: std::error::Error + Send + Sync + 'static;

  /// 按名称提交输入张量 `(3, h, w)`
  fn input(&mut self, name: &str, tensor: ArrayView3<'_, f32>) -> Result<(), Self::Error>;

  /// 按名称取出输出张量
  fn extract(&mut self, name: &str) -> Result<ArrayD<f32>, Self::Error>;

  /// GPU 加速提示，引擎可以忽略
  fn set_gpu(&mut self, _enabled: bool) {}
}

fn candidate_names<'a>(preferred: &'a str, fallbacks: &'a [&'a str]) -> Vec<&'a str> {
  std::iter::once(preferred)
    .chain(fallbacks.iter().copied().filter(|name| *name != preferred))
    .collect()
}

/// 依次尝试首选名称和备选名称提交输入，返回成功的名称
pub fn input_with_fallback<'a, E: Engine>(
  engine: &mut E,
  preferred: &'a str,
  tensor: ArrayView3<'_, f32>,
  fallbacks: &'a [&'a str],
) -> Result<&'a str, DecodeError> {
  let names = candidate_names(preferred, fallbacks);
  for name in names.iter().copied() {
    match engine.input(name, tensor) {
      Ok(()) => return Ok(name),
      Err(e) => debug!("输入张量 '{}' 提交失败: {}", name, e),
    }
  }
  Err(DecodeError::ExtractionFailed {
    names: names.iter().map(|name| name.to_string()).collect(),
  })
}

/// 依次尝试首选名称和备选名称取出输出
pub fn extract_with_fallback<E: Engine>(
  engine: &mut E,
  preferred: &str,
  fallbacks: &[&str],
) -> Result<ArrayD<f32>, DecodeError> {
  let names = candidate_names(preferred, fallbacks);
  for name in names.iter().copied() {
    match engine.extract(name) {
      Ok(tensor) => {
        debug!("取出输出张量 '{}', 形状 {:?}", name, tensor.shape());
        return Ok(tensor);
      }
      Err(e) => debug!("输出张量 '{}' 取出失败: {}", name, e),
    }
  }
  Err(DecodeError::ExtractionFailed {
    names: names.iter().map(|name| name.to_string()).collect(),
  })
}
