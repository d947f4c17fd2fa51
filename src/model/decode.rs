// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/decode.rs - 检测解码
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

use ndarray::{ArrayView1, ArrayView2, ArrayView3, s};
use tracing::debug;

use crate::{
  config::{BoxFormat, Config},
  model::{
    DecodeError, Detection,
    layout::{BOX_FIELDS, END2END_FIELDS},
    topk::select_topk,
  },
};

pub fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

/// 将原始边界框转换为 `[x1, y1, x2, y2]`
pub fn convert_box(raw: [f32; 4], format: BoxFormat) -> [f32; 4] {
  match format {
    BoxFormat::XyXy => raw,
    BoxFormat::CxCyWh => {
      let [cx, cy, w, h] = raw;
      [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
    }
  }
}

fn row_box(row: &ArrayView1<'_, f32>) -> [f32; 4] {
  [row[0], row[1], row[2], row[3]]
}

fn row_coeffs(row: &ArrayView1<'_, f32>, offset: usize, mask_dim: usize) -> Vec<f32> {
  row.iter().skip(offset).take(mask_dim).copied().collect()
}

fn check_width(table: &ArrayView2<'_, f32>, expected: usize) -> Result<(), DecodeError> {
  if table.ncols() < expected {
    return Err(DecodeError::UnsupportedLayout {
      shape: vec![table.nrows(), table.ncols()],
    });
  }
  Ok(())
}

/// 逐锚点解码：取分数最高的类别（并列取第一个），分数不低于阈值的保留。
///
/// `table` 每行一个锚点：`box(4) | scores(nc) | coeffs(md)`。结果尚未做 NMS。
pub fn decode_dense(
  table: ArrayView2<'_, f32>,
  config: &Config,
  with_mask: bool,
) -> Result<Vec<Detection>, DecodeError> {
  let nc = config.num_classes;
  let md = if with_mask { config.mask_dim } else { 0 };
  check_width(&table, BOX_FIELDS + nc + md)?;

  let mut detections = Vec::new();
  for row in table.outer_iter() {
    let mut label = 0;
    let mut score = row[BOX_FIELDS];
    for c in 1..nc {
      let value = row[BOX_FIELDS + c];
      if value > score {
        score = value;
        label = c;
      }
    }
    if score.is_nan() || score < config.conf_threshold {
      continue;
    }

    let bbox = convert_box(row_box(&row), config.box_format);
    let mut det = Detection::new(bbox, label, score);
    if with_mask {
      det = det.with_mask_coeffs(row_coeffs(&row, BOX_FIELDS + nc, md));
    }
    detections.push(det);
  }

  debug!("密集解码: {} 个锚点, {} 个候选", table.nrows(), detections.len());
  Ok(detections)
}

/// 全局两阶段 TopK 解码，之后按置信度阈值过滤
pub fn decode_topk(
  table: ArrayView2<'_, f32>,
  config: &Config,
  with_mask: bool,
) -> Result<Vec<Detection>, DecodeError> {
  let nc = config.num_classes;
  let md = if with_mask { config.mask_dim } else { 0 };
  check_width(&table, BOX_FIELDS + nc + md)?;

  let entries = select_topk(table.nrows(), nc, config.max_det, |anchor, class| {
    table[[anchor, BOX_FIELDS + class]]
  });
  let selected = entries.len();

  let detections: Vec<Detection> = entries
    .into_iter()
    .filter(|entry| entry.score >= config.conf_threshold)
    .map(|entry| {
      let row = table.row(entry.anchor);
      let bbox = convert_box(row_box(&row), config.box_format);
      let det = Detection::new(bbox, entry.class, entry.score);
      if with_mask {
        det.with_mask_coeffs(row_coeffs(&row, BOX_FIELDS + nc, md))
      } else {
        det
      }
    })
    .collect();

  debug!("TopK 解码: 选出 {} 个, 阈值过滤后 {} 个", selected, detections.len());
  Ok(detections)
}

/// 端到端输出：每行 `x1, y1, x2, y2, score, label [, coeffs]`，已按分数排序
pub fn decode_passthrough(
  table: ArrayView2<'_, f32>,
  config: &Config,
  with_mask: bool,
) -> Result<Vec<Detection>, DecodeError> {
  let md = if with_mask { config.mask_dim } else { 0 };
  check_width(&table, END2END_FIELDS + md)?;

  let mut detections = Vec::new();
  for row in table.outer_iter() {
    if detections.len() >= config.max_det {
      break;
    }
    let score = row[4];
    if score.is_nan() || score < config.conf_threshold {
      continue;
    }
    let label = row[5];
    if !label.is_finite() || label < 0.0 {
      continue;
    }

    let mut det = Detection::new(row_box(&row), label.round() as usize, score);
    if with_mask {
      det = det.with_mask_coeffs(row_coeffs(&row, END2END_FIELDS, md));
    }
    detections.push(det);
  }

  debug!("端到端输出: {} 行, 保留 {} 个", table.nrows(), detections.len());
  Ok(detections)
}

/// 单个步长检测头的网格解码。
///
/// `reg` 为 `(4, h, w)` 的左、上、右、下距离（网格单位），`cls` 为 `(nc, h, w)`
/// 的类别 logit。框坐标按步长放大后截断到 `[0, input - 1]`。
pub fn decode_grid(
  reg: ArrayView3<'_, f32>,
  cls: ArrayView3<'_, f32>,
  stride: u32,
  input_w: u32,
  input_h: u32,
  conf_threshold: f32,
) -> Result<Vec<Detection>, DecodeError> {
  let (reg_c, grid_h, grid_w) = reg.dim();
  let (nc, cls_h, cls_w) = cls.dim();
  if reg_c != BOX_FIELDS || nc == 0 || (cls_h, cls_w) != (grid_h, grid_w) {
    return Err(DecodeError::UnsupportedLayout {
      shape: vec![reg_c, grid_h, grid_w, nc, cls_h, cls_w],
    });
  }

  let stride = stride as f32;
  let max_x = input_w.saturating_sub(1) as f32;
  let max_y = input_h.saturating_sub(1) as f32;

  let mut detections = Vec::new();
  for y in 0..grid_h {
    for x in 0..grid_w {
      let logits = cls.slice(s![.., y, x]);
      let (label, logit) = logits
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (c, &v)| {
          if v > best.1 { (c, v) } else { best }
        });
      let score = sigmoid(logit);
      if score < conf_threshold {
        continue;
      }

      let gx = x as f32 + 0.5;
      let gy = y as f32 + 0.5;
      let ltrb = reg.slice(s![.., y, x]);
      let bbox = [
        ((gx - ltrb[0]) * stride).clamp(0.0, max_x),
        ((gy - ltrb[1]) * stride).clamp(0.0, max_y),
        ((gx + ltrb[2]) * stride).clamp(0.0, max_x),
        ((gy + ltrb[3]) * stride).clamp(0.0, max_y),
      ];
      detections.push(Detection::new(bbox, label, score));
    }
  }

  debug!(
    "步长 {} 网格 {}x{}: {} 个候选",
    stride,
    grid_w,
    grid_h,
    detections.len()
  );
  Ok(detections)
}

/// 按分数降序稳定排序
pub fn sort_by_score(detections: &mut [Detection]) {
  detections.sort_by(|a, b| b.score.total_cmp(&a.score));
}
