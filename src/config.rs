// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 解码配置
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

use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::model::DecodeError;

/// 边界框编码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoxFormat {
  /// 中心点 + 宽高
  #[default]
  CxCyWh,
  /// 左上角 + 右下角
  XyXy,
}

/// 后处理方式选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostprocessMode {
  /// 根据边界框格式自动选择：角点格式使用 TopK，否则使用 NMS
  #[default]
  Auto,
  Nms,
  TopK,
}

/// 解析后的解码策略，在 `detect()` 开始时确定一次
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
  /// 逐锚点取最大类别，阈值过滤后做 NMS
  Nms,
  /// 全局两阶段 TopK，可选去重
  TopK { dedup: bool },
}

/// 掩码重建方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskStrategy {
  /// 纯检测模型
  None,
  /// 先在网络输入空间裁剪、二值化，再映射回原图
  InputSpace,
  /// 直接从原型分辨率缩放到原图分辨率（retina）
  Retina,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigParseError {
  #[error("未知的边界框格式: {0}（可选 cxcywh, xyxy）")]
  UnknownBoxFormat(String),
  #[error("未知的后处理方式: {0}（可选 auto, nms, topk）")]
  UnknownPostprocess(String),
}

impl FromStr for BoxFormat {
  type Err = ConfigParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "cxcywh" => Ok(BoxFormat::CxCyWh),
      "xyxy" => Ok(BoxFormat::XyXy),
      _ => Err(ConfigParseError::UnknownBoxFormat(s.to_string())),
    }
  }
}

impl fmt::Display for BoxFormat {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BoxFormat::CxCyWh => write!(f, "cxcywh"),
      BoxFormat::XyXy => write!(f, "xyxy"),
    }
  }
}

impl FromStr for PostprocessMode {
  type Err = ConfigParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "auto" => Ok(PostprocessMode::Auto),
      "nms" => Ok(PostprocessMode::Nms),
      "topk" => Ok(PostprocessMode::TopK),
      _ => Err(ConfigParseError::UnknownPostprocess(s.to_string())),
    }
  }
}

impl fmt::Display for PostprocessMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PostprocessMode::Auto => write!(f, "auto"),
      PostprocessMode::Nms => write!(f, "nms"),
      PostprocessMode::TopK => write!(f, "topk"),
    }
  }
}

/// 旧式逐步长检测头：回归张量 `(4, h, w)` 与分类张量 `(nc, h, w)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridHead {
  pub stride: u32,
  pub reg_name: String,
  pub cls_name: String,
}

impl GridHead {
  pub fn new(stride: u32, reg_name: impl Into<String>, cls_name: impl Into<String>) -> Self {
    Self {
      stride,
      reg_name: reg_name.into(),
      cls_name: cls_name.into(),
    }
  }
}

/// 解码配置，单次 `detect()` 调用期间不可变
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
  pub input_width: u32,
  pub input_height: u32,
  pub num_classes: usize,
  pub conf_threshold: f32,
  pub iou_threshold: f32,
  pub max_det: usize,
  pub padding_value: u8,
  pub scaleup: bool,
  pub center: bool,
  pub box_format: BoxFormat,
  pub postprocess: PostprocessMode,
  pub topk_dedup: bool,
  pub agnostic_nms: bool,
  pub retina_masks: bool,
  /// 透传给推理引擎的 GPU 提示
  pub use_gpu: bool,
  /// 掩码系数维度，0 表示纯检测模型
  pub mask_dim: usize,
  pub input_name: String,
  pub output_name: String,
  pub proto_name: String,
  pub grid_heads: Vec<GridHead>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      input_width: 640,
      input_height: 640,
      num_classes: 80,
      conf_threshold: 0.25,
      iou_threshold: 0.45,
      max_det: 300,
      padding_value: 114,
      scaleup: true,
      center: true,
      box_format: BoxFormat::CxCyWh,
      postprocess: PostprocessMode::Auto,
      topk_dedup: false,
      agnostic_nms: false,
      retina_masks: false,
      use_gpu: false,
      mask_dim: 0,
      input_name: "in0".to_string(),
      output_name: "out0".to_string(),
      proto_name: "out1".to_string(),
      grid_heads: Vec::new(),
    }
  }
}

impl Config {
  /// 实例分割预设
  pub fn segmentation() -> Self {
    Self {
      conf_threshold: 0.5,
      mask_dim: 32,
      ..Self::default()
    }
  }

  pub fn with_input_size(mut self, width: u32, height: u32) -> Self {
    self.input_width = width;
    self.input_height = height;
    self
  }

  pub fn with_num_classes(mut self, num_classes: usize) -> Self {
    self.num_classes = num_classes;
    self
  }

  pub fn with_thresholds(mut self, conf_threshold: f32, iou_threshold: f32) -> Self {
    self.conf_threshold = conf_threshold;
    self.iou_threshold = iou_threshold;
    self
  }

  pub fn with_max_det(mut self, max_det: usize) -> Self {
    self.max_det = max_det;
    self
  }

  pub fn with_box_format(mut self, box_format: BoxFormat) -> Self {
    self.box_format = box_format;
    self
  }

  pub fn with_postprocess(mut self, postprocess: PostprocessMode) -> Self {
    self.postprocess = postprocess;
    self
  }

  pub fn with_topk_dedup(mut self, topk_dedup: bool) -> Self {
    self.topk_dedup = topk_dedup;
    self
  }

  pub fn with_agnostic_nms(mut self, agnostic_nms: bool) -> Self {
    self.agnostic_nms = agnostic_nms;
    self
  }

  pub fn with_retina_masks(mut self, retina_masks: bool) -> Self {
    self.retina_masks = retina_masks;
    self
  }

  pub fn with_mask_dim(mut self, mask_dim: usize) -> Self {
    self.mask_dim = mask_dim;
    self
  }

  pub fn with_letterbox(mut self, padding_value: u8, scaleup: bool, center: bool) -> Self {
    self.padding_value = padding_value;
    self.scaleup = scaleup;
    self.center = center;
    self
  }

  pub fn with_grid_heads(mut self, grid_heads: Vec<GridHead>) -> Self {
    self.grid_heads = grid_heads;
    self
  }

  pub fn is_segmentation(&self) -> bool {
    self.mask_dim > 0
  }

  pub fn validate(&self) -> Result<(), DecodeError> {
    if self.input_width == 0 || self.input_height == 0 {
      return Err(DecodeError::InvalidInput(format!(
        "网络输入尺寸必须为正数: {}x{}",
        self.input_width, self.input_height
      )));
    }
    if self.num_classes == 0 {
      return Err(DecodeError::InvalidInput("类别数量必须为正数".to_string()));
    }
    if self.max_det == 0 {
      return Err(DecodeError::InvalidInput("最大检测数量必须为正数".to_string()));
    }
    if self.grid_heads.iter().any(|head| head.stride == 0) {
      return Err(DecodeError::InvalidInput("检测头步长必须为正数".to_string()));
    }
    Ok(())
  }

  /// 解析 `postprocess` 与 `box_format` 得到最终解码策略
  pub fn decode_strategy(&self) -> DecodeStrategy {
    let topk = DecodeStrategy::TopK {
      dedup: self.topk_dedup,
    };
    match self.postprocess {
      PostprocessMode::Nms => DecodeStrategy::Nms,
      PostprocessMode::TopK => topk,
      PostprocessMode::Auto => match self.box_format {
        BoxFormat::XyXy => topk,
        BoxFormat::CxCyWh => DecodeStrategy::Nms,
      },
    }
  }

  pub fn mask_strategy(&self) -> MaskStrategy {
    if !self.is_segmentation() {
      MaskStrategy::None
    } else if self.retina_masks {
      MaskStrategy::Retina
    } else {
      MaskStrategy::InputSpace
    }
  }
}
