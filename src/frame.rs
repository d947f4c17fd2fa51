// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - Letterbox 输入帧
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

use image::{
  RgbImage,
  imageops::{self, FilterType},
};
use ndarray::Array3;
use tracing::debug;

use crate::model::DecodeError;

const RGB_CHANNELS: usize = 3;

/// Letterbox 逆变换所需的参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxMapping {
  /// 缩放比例
  pub gain: f32,
  /// 左侧填充像素
  pub pad_x: u32,
  /// 顶部填充像素
  pub pad_y: u32,
  pub resized_w: u32,
  pub resized_h: u32,
  pub input_w: u32,
  pub input_h: u32,
}

impl LetterboxMapping {
  /// 由原图与目标尺寸计算缩放和填充，尺寸需为正数。
  ///
  /// 居中时填充量减半后按 `round(d - 0.1)` / `round(d + 0.1)` 分给上下（左右）两侧。
  pub fn new(
    img_w: u32,
    img_h: u32,
    input_w: u32,
    input_h: u32,
    scaleup: bool,
    center: bool,
  ) -> Self {
    let r0 = (input_h as f32 / img_h as f32).min(input_w as f32 / img_w as f32);
    let gain = if scaleup { r0 } else { r0.min(1.0) };

    let resized_w = ((img_w as f32 * gain).round() as u32).clamp(1, input_w);
    let resized_h = ((img_h as f32 * gain).round() as u32).clamp(1, input_h);

    let mut dw = (input_w - resized_w) as f32;
    let mut dh = (input_h - resized_h) as f32;
    if center {
      dw /= 2.0;
      dh /= 2.0;
    }
    let pad_x = if center { (dw - 0.1).round() as u32 } else { 0 };
    let pad_y = if center { (dh - 0.1).round() as u32 } else { 0 };

    Self {
      gain,
      pad_x,
      pad_y,
      resized_w,
      resized_h,
      input_w,
      input_h,
    }
  }

  /// 原图坐标 → 网络输入坐标
  pub fn to_input(&self, x: f32, y: f32) -> (f32, f32) {
    (
      x * self.gain + self.pad_x as f32,
      y * self.gain + self.pad_y as f32,
    )
  }

  /// 网络输入坐标 → 原图坐标（不截断）
  pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
    (
      (x - self.pad_x as f32) / self.gain,
      (y - self.pad_y as f32) / self.gain,
    )
  }
}

/// 归一化后的 CHW 输入张量及其映射
#[derive(Debug, Clone)]
pub struct LetterboxFrame {
  /// `(3, input_h, input_w)`，RGB，取值 `[0, 1]`
  pub tensor: Array3<f32>,
  pub mapping: LetterboxMapping,
  pub original_width: u32,
  pub original_height: u32,
}

impl LetterboxFrame {
  pub fn height(&self) -> usize {
    self.tensor.dim().1
  }

  pub fn width(&self) -> usize {
    self.tensor.dim().2
  }
}

/// 等比缩放并填充到网络输入尺寸。
///
/// 填充边缘使用 `round(d ∓ 0.1)` 的非对称取整，奇数填充时多出的一个像素落在右/下侧。
pub fn letterbox(
  image: &RgbImage,
  input_w: u32,
  input_h: u32,
  padding_value: u8,
  scaleup: bool,
  center: bool,
) -> Result<LetterboxFrame, DecodeError> {
  let (img_w, img_h) = image.dimensions();
  if img_w == 0 || img_h == 0 {
    return Err(DecodeError::InvalidInput("输入图像为空".to_string()));
  }
  if input_w == 0 || input_h == 0 {
    return Err(DecodeError::InvalidInput(format!(
      "目标尺寸必须为正数: {}x{}",
      input_w, input_h
    )));
  }

  let mapping = LetterboxMapping::new(img_w, img_h, input_w, input_h, scaleup, center);
  let LetterboxMapping {
    pad_x: left,
    pad_y: top,
    resized_w,
    resized_h,
    ..
  } = mapping;
  let bottom = input_h - top - resized_h;
  let right = input_w - left - resized_w;
  debug!(
    "letterbox: {}x{} -> {}x{}, 填充 (上 {}, 下 {}, 左 {}, 右 {})",
    img_w, img_h, resized_w, resized_h, top, bottom, left, right
  );

  let resized = if (resized_w, resized_h) == (img_w, img_h) {
    None
  } else {
    Some(imageops::resize(
      image,
      resized_w,
      resized_h,
      FilterType::Triangle,
    ))
  };
  let source = resized.as_ref().unwrap_or(image);

  let height = (top + resized_h + bottom) as usize;
  let width = (left + resized_w + right) as usize;
  let fill = padding_value as f32 / 255.0;
  let mut tensor = Array3::from_elem((RGB_CHANNELS, height, width), fill);

  for (x, y, pixel) in source.enumerate_pixels() {
    let row = (y + top) as usize;
    let col = (x + left) as usize;
    for c in 0..RGB_CHANNELS {
      tensor[[c, row, col]] = pixel[c] as f32 / 255.0;
    }
  }

  Ok(LetterboxFrame {
    tensor,
    mapping,
    original_width: img_w,
    original_height: img_h,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  #[test]
  fn wide_image_is_padded_vertically() {
    let image = RgbImage::from_pixel(1280, 720, Rgb([255, 0, 0]));
    let frame = letterbox(&image, 640, 640, 114, true, true).unwrap();

    assert_eq!(frame.tensor.dim(), (3, 640, 640));
    assert!((frame.mapping.gain - 0.5).abs() < 1e-6);
    assert_eq!((frame.mapping.resized_w, frame.mapping.resized_h), (640, 360));
    assert_eq!((frame.mapping.pad_x, frame.mapping.pad_y), (0, 140));

    let fill = 114.0 / 255.0;
    assert!((frame.tensor[[0, 0, 0]] - fill).abs() < 1e-6);
    assert!((frame.tensor[[0, 139, 320]] - fill).abs() < 1e-6);
    assert!((frame.tensor[[0, 140, 320]] - 1.0).abs() < 1e-6);
    assert!((frame.tensor[[1, 140, 320]]).abs() < 1e-6);
    assert!((frame.tensor[[0, 499, 320]] - 1.0).abs() < 1e-6);
    assert!((frame.tensor[[0, 500, 320]] - fill).abs() < 1e-6);
  }

  #[test]
  fn odd_padding_goes_to_bottom_right() {
    // 7 像素的填充量：上 3 下 4
    let image = RgbImage::new(100, 93);
    let frame = letterbox(&image, 100, 100, 0, true, true).unwrap();
    assert_eq!(frame.mapping.pad_y, 3);
    assert_eq!(frame.tensor.dim(), (3, 100, 100));
  }

  #[test]
  fn without_center_padding_is_bottom_right_only() {
    let image = RgbImage::new(1280, 720);
    let frame = letterbox(&image, 640, 640, 114, true, false).unwrap();
    assert_eq!((frame.mapping.pad_x, frame.mapping.pad_y), (0, 0));
    assert_eq!(frame.tensor.dim(), (3, 640, 640));
  }

  #[test]
  fn no_scaleup_keeps_small_images() {
    let image = RgbImage::new(320, 200);
    let frame = letterbox(&image, 640, 640, 114, false, true).unwrap();
    assert!((frame.mapping.gain - 1.0).abs() < 1e-6);
    assert_eq!((frame.mapping.resized_w, frame.mapping.resized_h), (320, 200));
    assert_eq!((frame.mapping.pad_x, frame.mapping.pad_y), (160, 220));
    assert_eq!(frame.tensor.dim(), (3, 640, 640));
  }

  #[test]
  fn mapping_matches_the_padded_frame() {
    let frame = letterbox(&RgbImage::new(16, 8), 64, 64, 114, false, true).unwrap();
    let mapping = LetterboxMapping::new(16, 8, 64, 64, false, true);
    assert_eq!(frame.mapping, mapping);
    assert_eq!((mapping.pad_x, mapping.pad_y), (24, 28));
    assert_eq!((mapping.resized_w, mapping.resized_h), (16, 8));
  }

  #[test]
  fn resized_size_within_one_pixel_of_original() {
    for &(w, h) in &[(1280u32, 720u32), (333, 517), (17, 1000), (641, 639)] {
      let image = RgbImage::new(w, h);
      let frame = letterbox(&image, 640, 480, 114, true, true).unwrap();
      assert_eq!(frame.tensor.dim(), (3, 480, 640));
      let m = frame.mapping;
      assert!((m.resized_w as f32 / m.gain - w as f32).abs() < 1.0 / m.gain.min(1.0) + 1e-3);
      assert!((m.resized_h as f32 / m.gain - h as f32).abs() < 1.0 / m.gain.min(1.0) + 1e-3);
    }
  }

  #[test]
  fn mapping_round_trip() {
    let image = RgbImage::new(1280, 720);
    let frame = letterbox(&image, 640, 640, 114, true, true).unwrap();
    let (ix, iy) = frame.mapping.to_input(100.0, 200.0);
    assert!((ix - 50.0).abs() < 1e-4);
    assert!((iy - 240.0).abs() < 1e-4);
    let (ox, oy) = frame.mapping.to_original(ix, iy);
    assert!((ox - 100.0).abs() < 1e-3);
    assert!((oy - 200.0).abs() < 1e-3);
  }

  #[test]
  fn rejects_empty_input() {
    assert!(matches!(
      letterbox(&RgbImage::new(0, 0), 640, 640, 114, true, true),
      Err(DecodeError::InvalidInput(_))
    ));
    assert!(matches!(
      letterbox(&RgbImage::new(10, 10), 0, 640, 114, true, true),
      Err(DecodeError::InvalidInput(_))
    ));
  }
}
