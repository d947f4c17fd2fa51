// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/rescale.rs - 坐标映射回原图
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

use crate::{frame::LetterboxMapping, model::Detection};

/// 网络输入坐标 → 原图坐标，截断到 `[0, width] × [0, height]`
pub fn scale_box(bbox: [f32; 4], orig_w: u32, orig_h: u32, mapping: &LetterboxMapping) -> [f32; 4] {
  let (x1, y1) = mapping.to_original(bbox[0], bbox[1]);
  let (x2, y2) = mapping.to_original(bbox[2], bbox[3]);
  let w = orig_w as f32;
  let h = orig_h as f32;
  [
    x1.clamp(0.0, w),
    y1.clamp(0.0, h),
    x2.clamp(0.0, w),
    y2.clamp(0.0, h),
  ]
}

/// 原图坐标 → 网络输入坐标
pub fn project_box(bbox: [f32; 4], mapping: &LetterboxMapping) -> [f32; 4] {
  let (x1, y1) = mapping.to_input(bbox[0], bbox[1]);
  let (x2, y2) = mapping.to_input(bbox[2], bbox[3]);
  [x1, y1, x2, y2]
}

pub fn scale_detections(
  detections: &mut [Detection],
  orig_w: u32,
  orig_h: u32,
  mapping: &LetterboxMapping,
) {
  for det in detections.iter_mut() {
    det.set_bbox(scale_box(det.bbox(), orig_w, orig_h, mapping));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn mapping() -> LetterboxMapping {
    // 1280x720 → 640x640
    LetterboxMapping {
      gain: 0.5,
      pad_x: 0,
      pad_y: 140,
      resized_w: 640,
      resized_h: 360,
      input_w: 640,
      input_h: 640,
    }
  }

  #[test]
  fn removes_padding_and_gain() {
    let scaled = scale_box([100.0, 240.0, 200.0, 340.0], 1280, 720, &mapping());
    assert_eq!(scaled, [200.0, 200.0, 400.0, 400.0]);
  }

  #[test]
  fn clamps_to_image_bounds() {
    let scaled = scale_box([-10.0, 100.0, 700.0, 600.0], 1280, 720, &mapping());
    assert_eq!(scaled, [0.0, 0.0, 1280.0, 720.0]);
  }

  #[test]
  fn round_trip_through_network_space() {
    let m = mapping();
    let input_box = [123.5, 201.25, 456.75, 480.0];
    let original = scale_box(input_box, 1280, 720, &m);
    let back = project_box(original, &m);
    for (a, b) in input_box.iter().zip(back.iter()) {
      assert!((a - b).abs() < 1e-3);
    }
  }

  #[test]
  fn rescales_every_detection() {
    let mut dets = vec![
      Detection::new([0.0, 140.0, 640.0, 500.0], 0, 0.9),
      Detection::new([320.0, 320.0, 330.0, 330.0], 1, 0.8),
    ];
    scale_detections(&mut dets, 1280, 720, &mapping());
    assert_eq!(dets[0].bbox(), [0.0, 0.0, 1280.0, 720.0]);
    assert_eq!(dets[1].bbox(), [640.0, 360.0, 660.0, 380.0]);
  }
}
