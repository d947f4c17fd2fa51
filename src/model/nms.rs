// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/nms.rs - 非极大值抑制
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

use tracing::debug;

use crate::model::Detection;

/// 计算两个 `[x1, y1, x2, y2]` 边界框的 IoU，并集面积非正时返回 0
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
  let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
  let intersection = inter_w * inter_h;

  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  let union = area_a + area_b - intersection;

  if union <= 0.0 {
    0.0
  } else {
    intersection / union
  }
}

/// 按分数降序贪心抑制。非 `agnostic` 时只在同类别之间抑制。
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32, agnostic: bool) -> Vec<Detection> {
  if detections.is_empty() {
    return detections;
  }

  detections.sort_by(|a, b| b.score.total_cmp(&a.score));

  let boxes: Vec<[f32; 4]> = detections.iter().map(Detection::bbox).collect();
  let mut suppressed = vec![false; detections.len()];

  for i in 0..detections.len() {
    if suppressed[i] {
      continue;
    }
    for j in (i + 1)..detections.len() {
      if suppressed[j] {
        continue;
      }
      if !agnostic && detections[i].label != detections[j].label {
        continue;
      }
      if iou(&boxes[i], &boxes[j]) > iou_threshold {
        suppressed[j] = true;
      }
    }
  }

  let before = detections.len();
  let kept: Vec<Detection> = detections
    .into_iter()
    .zip(suppressed)
    .filter_map(|(det, suppressed)| (!suppressed).then_some(det))
    .collect();
  debug!("NMS: {} -> {}", before, kept.len());
  kept
}

/// TopK 之后的去重清理：NMS 后截断到 `max_det`
pub fn dedup(detections: Vec<Detection>, iou_threshold: f32, agnostic: bool, max_det: usize) -> Vec<Detection> {
  let mut kept = nms(detections, iou_threshold, agnostic);
  kept.truncate(max_det);
  kept
}
