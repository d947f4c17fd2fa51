// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output.rs - 输出定义
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

use std::{
  marker::PhantomData,
  path::{Path, PathBuf},
};

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  labels::{CocoLabel, WithLabel},
  model::{DetectResult, Detection},
};

pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum RecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
  /// 每行 `name, score, x1, y1, x2, y2`
  Text,
  Json,
}

/// 单个检测的 JSON 记录
#[derive(Debug, Clone, Serialize)]
pub struct DetectionRecord {
  pub label: usize,
  pub name: String,
  pub score: f32,
  #[serde(rename = "box")]
  pub bbox: [f32; 4],
  #[serde(skip_serializing_if = "Option::is_none")]
  pub mask_area: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameRecord {
  pub width: u32,
  pub height: u32,
  pub detections: Vec<DetectionRecord>,
}

impl DetectionRecord {
  fn from_detection<L: WithLabel>(det: &Detection) -> Self {
    DetectionRecord {
      label: det.label,
      name: L::from_label_id(det.label).to_label_str(),
      score: det.score,
      bbox: det.bbox(),
      mask_area: det.mask.as_ref().map(|mask| mask.area()),
    }
  }
}

/// 将检测结果写入文件。
///
/// `record:///path/result.json` 写 JSON，其余扩展名写文本；
/// 查询参数 `record=id` 时文本记录使用类别下标，`masks` 时额外保存掩码 PNG。
/// 类别名称由 `L` 给出，默认使用 COCO 类别。
pub struct RecordOutput<L: WithLabel = CocoLabel> {
  path: PathBuf,
  format: RecordFormat,
  label_with_name: bool,
  save_masks: bool,
  _label: PhantomData<L>,
}

impl FromUrlWithScheme for RecordOutput {
  const SCHEME: &'static str = "record";
}

impl FromUrl for RecordOutput {
  type Error = RecordOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(RecordOutputError::SchemeMismatch);
    }

    let label_with_name = !url.query_pairs().any(|(k, v)| k == "record" && v == "id");
    let save_masks = url.query_pairs().any(|(k, _)| k == "masks");

    Ok(Self::new(url.path())
      .with_label_name(label_with_name)
      .with_masks(save_masks))
  }
}

impl<L: WithLabel> RecordOutput<L> {
  pub fn new(path: impl AsRef<Path>) -> Self {
    let path = path.as_ref().to_path_buf();
    let format = match path.extension().and_then(|ext| ext.to_str()) {
      Some("json") => RecordFormat::Json,
      _ => RecordFormat::Text,
    };
    RecordOutput {
      path,
      format,
      label_with_name: true,
      save_masks: false,
      _label: PhantomData,
    }
  }

  pub fn with_label_name(mut self, label_with_name: bool) -> Self {
    self.label_with_name = label_with_name;
    self
  }

  pub fn with_masks(mut self, save_masks: bool) -> Self {
    self.save_masks = save_masks;
    self
  }

  pub fn format(&self) -> RecordFormat {
    self.format
  }

  fn text_record(&self, result: &DetectResult) -> String {
    result
      .iter()
      .map(|det| {
        let name = if self.label_with_name {
          L::from_label_id(det.label).to_label_str()
        } else {
          det.label.to_string()
        };
        format!(
          "{}, {:.4}, {:.4}, {:.4}, {:.4}, {:.4}",
          name, det.score, det.x1, det.y1, det.x2, det.y2
        )
      })
      .collect::<Vec<_>>()
      .join("\n")
  }

  fn frame_record(&self, frame: &RgbImage, result: &DetectResult) -> FrameRecord {
    FrameRecord {
      width: frame.width(),
      height: frame.height(),
      detections: result
        .iter()
        .map(DetectionRecord::from_detection::<L>)
        .collect(),
    }
  }

  fn mask_path(&self, index: usize) -> PathBuf {
    let stem = self
      .path
      .file_stem()
      .and_then(|stem| stem.to_str())
      .unwrap_or("record");
    self.path.with_file_name(format!("{}-mask-{:03}.png", stem, index))
  }
}

impl<L: WithLabel> Render<RgbImage, DetectResult> for RecordOutput<L> {
  type Error = RecordOutputError;

  fn render_result(&self, frame: &RgbImage, result: &DetectResult) -> Result<(), Self::Error> {
    match self.format {
      RecordFormat::Text => std::fs::write(&self.path, self.text_record(result))?,
      RecordFormat::Json => {
        let text = serde_json::to_string_pretty(&self.frame_record(frame, result))?;
        std::fs::write(&self.path, text)?;
      }
    }

    if self.save_masks {
      for (index, det) in result.iter().enumerate() {
        if let Some(mask) = &det.mask {
          mask.to_gray_image().save(self.mask_path(index))?;
        }
      }
    }

    info!("写入 {} 个检测结果: {}", result.len(), self.path.display());
    Ok(())
  }
}

/// 只把检测结果打印到日志
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOutput;

impl Render<RgbImage, DetectResult> for LogOutput {
  type Error = std::convert::Infallible;

  fn render_result(&self, frame: &RgbImage, result: &DetectResult) -> Result<(), Self::Error> {
    info!(
      "{}x{} 图像检测到 {} 个物体",
      frame.width(),
      frame.height(),
      result.len()
    );
    for det in result.iter() {
      info!(
        "{} {:.3} [{:.1}, {:.1}, {:.1}, {:.1}]{}",
        CocoLabel::from_label_id(det.label).to_label_str(),
        det.score,
        det.x1,
        det.y1,
        det.x2,
        det.y2,
        det
          .mask
          .as_ref()
          .map(|mask| format!(" 掩码 {} 像素", mask.area()))
          .unwrap_or_default()
      );
    }
    Ok(())
  }
}

impl FromUrlWithScheme for LogOutput {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogOutput {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch);
    }
    Ok(LogOutput)
  }
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("记录输出错误: {0}")]
  RecordOutputError(#[from] RecordOutputError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 按 URI 方案选择输出
pub enum OutputWrapper {
  Record(RecordOutput),
  Log(LogOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      <RecordOutput as FromUrlWithScheme>::SCHEME => {
        Ok(OutputWrapper::Record(RecordOutput::from_url(url)?))
      }
      LogOutput::SCHEME => Ok(OutputWrapper::Log(LogOutput::from_url(url)?)),
      _ => Err(OutputError::SchemeMismatch),
    }
  }
}

impl Render<RgbImage, DetectResult> for OutputWrapper {
  type Error = OutputError;

  fn render_result(&self, frame: &RgbImage, result: &DetectResult) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::Record(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      OutputWrapper::Log(output) => match output.render_result(frame, result) {
        Ok(()) => Ok(()),
        Err(never) => match never {},
      },
    }
  }
}
