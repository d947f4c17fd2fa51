// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型
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

use image::GrayImage;
use ndarray::Array2;
use thiserror::Error;

pub mod decode;
pub mod layout;
pub mod mask;
pub mod nms;
pub mod rescale;
pub mod topk;
mod yolo26;

pub use self::yolo26::{Yolo26, Yolo26Builder};

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("输入无效: {0}")]
  InvalidInput(String),
  #[error("不支持的输出布局: 形状 {shape:?}")]
  UnsupportedLayout { shape: Vec<usize> },
  #[error("无法取出张量，已尝试: {names:?}")]
  ExtractionFailed { names: Vec<String> },
  #[error("原型张量无效: {0}")]
  MalformedProto(String),
}

/// 二值掩码，取值 0 或 1，形状 `(h, w)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
  data: Array2<u8>,
}

impl Mask {
  pub fn from_array(data: Array2<u8>) -> Self {
    Self { data }
  }

  pub fn width(&self) -> usize {
    self.data.ncols()
  }

  pub fn height(&self) -> usize {
    self.data.nrows()
  }

  /// 前景像素数
  pub fn area(&self) -> usize {
    self.data.iter().filter(|&&v| v != 0).count()
  }

  pub fn get(&self, x: usize, y: usize) -> Option<bool> {
    self.data.get((y, x)).map(|&v| v != 0)
  }

  pub fn as_array(&self) -> &Array2<u8> {
    &self.data
  }

  /// 转为 0/255 灰度图
  pub fn to_gray_image(&self) -> GrayImage {
    GrayImage::from_fn(self.width() as u32, self.height() as u32, |x, y| {
      image::Luma([if self.data[[y as usize, x as usize]] != 0 { 255 } else { 0 }])
    })
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
  pub label: usize,
  pub score: f32,
  /// 掩码系数（分割模型）
  pub mask_coeffs: Option<Vec<f32>>,
  /// 原图分辨率的二值掩码（分割模型）
  pub mask: Option<Mask>,
}

impl Detection {
  pub fn new(bbox: [f32; 4], label: usize, score: f32) -> Self {
    Self {
      x1: bbox[0],
      y1: bbox[1],
      x2: bbox[2],
      y2: bbox[3],
      label,
      score,
      mask_coeffs: None,
      mask: None,
    }
  }

  pub fn with_mask_coeffs(mut self, coeffs: Vec<f32>) -> Self {
    self.mask_coeffs = Some(coeffs);
    self
  }

  /// `[x_min, y_min, x_max, y_max]`
  pub fn bbox(&self) -> [f32; 4] {
    [self.x1, self.y1, self.x2, self.y2]
  }

  pub fn set_bbox(&mut self, bbox: [f32; 4]) {
    [self.x1, self.y1, self.x2, self.y2] = bbox;
  }

  pub fn width(&self) -> f32 {
    self.x2 - self.x1
  }

  pub fn height(&self) -> f32 {
    self.y2 - self.y1
  }

  pub fn area(&self) -> f32 {
    self.width() * self.height()
  }
}

#[derive(Debug, Clone, Default)]
pub struct DetectResult {
  pub items: Box<[Detection]>,
}

impl DetectResult {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
    self.items.iter()
  }
}

impl From<Vec<Detection>> for DetectResult {
  fn from(items: Vec<Detection>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}
