// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/mask.rs - 实例掩码重建
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

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, ArrayViewMut2, Axis, s};
use tracing::debug;

use crate::{
  frame::LetterboxMapping,
  model::{DecodeError, Mask, decode::sigmoid},
};

/// 掩码 logit：`coeffs (n, c)` 与展平的 `protos (c, mh * mw)` 相乘，得到 `(n, mh, mw)`
pub fn mask_logits(
  coeffs: ArrayView2<'_, f32>,
  protos: ArrayView3<'_, f32>,
) -> Result<Array3<f32>, DecodeError> {
  let (c, mh, mw) = protos.dim();
  if c == 0 || mh == 0 || mw == 0 {
    return Err(DecodeError::MalformedProto(format!(
      "原型张量为空: {:?}",
      protos.shape()
    )));
  }
  if coeffs.ncols() != c {
    return Err(DecodeError::MalformedProto(format!(
      "掩码系数维度 {} 与原型通道数 {} 不一致",
      coeffs.ncols(),
      c
    )));
  }

  let flat = protos
    .to_shape((c, mh * mw))
    .map_err(|e| DecodeError::MalformedProto(e.to_string()))?;
  let n = coeffs.nrows();
  coeffs
    .dot(&flat)
    .into_shape_with_order((n, mh, mw))
    .map_err(|e| DecodeError::MalformedProto(e.to_string()))
}

/// sigmoid 后的掩码概率 `(n, mh, mw)`
pub fn mask_probabilities(
  coeffs: ArrayView2<'_, f32>,
  protos: ArrayView3<'_, f32>,
) -> Result<Array3<f32>, DecodeError> {
  Ok(mask_logits(coeffs, protos)?.mapv_into(sigmoid))
}

fn round_edge(v: f32, limit: usize) -> usize {
  v.round_ties_even().clamp(0.0, limit as f32) as usize
}

/// 将框外像素置零。框边按就近取整（平局取偶），截断到掩码范围；退化框清空整个掩码。
pub fn crop_mask(mut mask: ArrayViewMut2<'_, f32>, bbox: [f32; 4]) {
  let (h, w) = mask.dim();
  let x1 = round_edge(bbox[0], w);
  let y1 = round_edge(bbox[1], h);
  let x2 = round_edge(bbox[2], w);
  let y2 = round_edge(bbox[3], h);

  if x2 <= x1 || y2 <= y1 {
    mask.fill(0.0);
    return;
  }

  mask.slice_mut(s![..y1, ..]).fill(0.0);
  mask.slice_mut(s![y2.., ..]).fill(0.0);
  mask.slice_mut(s![y1..y2, ..x1]).fill(0.0);
  mask.slice_mut(s![y1..y2, x2..]).fill(0.0);
}

/// 栅格中的矩形区域，坐标可以为小数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
  pub x: f32,
  pub y: f32,
  pub w: f32,
  pub h: f32,
}

impl Region {
  pub fn full(h: usize, w: usize) -> Self {
    Self {
      x: 0.0,
      y: 0.0,
      w: w as f32,
      h: h as f32,
    }
  }

  /// letterbox 帧中原图内容所在的区域，换算到 `raster_h × raster_w` 的栅格
  pub fn letterbox_content(mapping: &LetterboxMapping, raster_h: usize, raster_w: usize) -> Self {
    let sy = raster_h as f32 / mapping.input_h as f32;
    let sx = raster_w as f32 / mapping.input_w as f32;
    Self {
      x: mapping.pad_x as f32 * sx,
      y: mapping.pad_y as f32 * sy,
      w: mapping.resized_w as f32 * sx,
      h: mapping.resized_h as f32 * sy,
    }
  }
}

/// 单个轴上每个目标像素的采样位置 `(i0, i1, 权重)`，下标截断在区域覆盖的像素内
fn axis_samples(
  start: f32,
  extent: f32,
  src_len: usize,
  dst_len: usize,
) -> Option<Vec<(usize, usize, f32)>> {
  let lo = start.floor().max(0.0) as usize;
  let hi = ((start + extent).ceil().max(0.0) as usize).min(src_len);
  if extent <= 0.0 || hi <= lo || dst_len == 0 {
    return None;
  }

  let scale = extent / dst_len as f32;
  let clamp = |i: isize| i.clamp(lo as isize, hi as isize - 1) as usize;
  Some(
    (0..dst_len)
      .map(|d| {
        let f = start + (d as f32 + 0.5) * scale - 0.5;
        let i0 = f.floor();
        let weight = f - i0;
        let i0 = i0 as isize;
        (clamp(i0), clamp(i0 + 1), weight)
      })
      .collect(),
  )
}

/// 把 `region` 双线性缩放到 `dst_h × dst_w`。
///
/// 像素中心对齐（align_corners = false），越界采样取区域边缘值；区域与栅格不相交时返回 `None`。
pub fn resize_region(
  src: ArrayView2<'_, f32>,
  region: Region,
  dst_h: usize,
  dst_w: usize,
) -> Option<Array2<f32>> {
  let (src_h, src_w) = src.dim();
  let rows = axis_samples(region.y, region.h, src_h, dst_h)?;
  let columns = axis_samples(region.x, region.w, src_w, dst_w)?;

  let mut dst = Array2::zeros((dst_h, dst_w));
  for (mut row, &(y0, y1, ly)) in dst.axis_iter_mut(Axis(0)).zip(rows.iter()) {
    let r0 = src.row(y0);
    let r1 = src.row(y1);
    for (value, &(x0, x1, lx)) in row.iter_mut().zip(columns.iter()) {
      let v0 = r0[x0] + (r0[x1] - r0[x0]) * lx;
      let v1 = r1[x0] + (r1[x1] - r1[x0]) * lx;
      *value = v0 + (v1 - v0) * ly;
    }
  }
  Some(dst)
}

/// 整幅双线性缩放
pub fn resize_bilinear(src: ArrayView2<'_, f32>, dst_h: usize, dst_w: usize) -> Array2<f32> {
  let (src_h, src_w) = src.dim();
  resize_region(src, Region::full(src_h, src_w), dst_h, dst_w)
    .unwrap_or_else(|| Array2::zeros((dst_h, dst_w)))
}

fn binarize(values: ArrayView2<'_, f32>, threshold: f32) -> Mask {
  Mask::from_array(values.mapv(|v| u8::from(v > threshold)))
}

fn check_boxes(coeffs: &ArrayView2<'_, f32>, boxes: &[[f32; 4]]) -> Result<(), DecodeError> {
  if coeffs.nrows() != boxes.len() {
    return Err(DecodeError::InvalidInput(format!(
      "掩码系数 {} 行, 边界框 {} 个",
      coeffs.nrows(),
      boxes.len()
    )));
  }
  Ok(())
}

/// 输入空间掩码。
///
/// `boxes` 位于 `shape_h × shape_w` 的网络输入空间，按原型与输入的分辨率比缩放后裁剪；
/// `upsample` 时再双线性放大到输入分辨率。logit 大于 0 的像素记为前景。
pub fn process_mask(
  protos: ArrayView3<'_, f32>,
  coeffs: ArrayView2<'_, f32>,
  boxes: &[[f32; 4]],
  shape_h: usize,
  shape_w: usize,
  upsample: bool,
) -> Result<Vec<Mask>, DecodeError> {
  if shape_h == 0 || shape_w == 0 {
    return Err(DecodeError::InvalidInput(format!(
      "掩码目标尺寸必须为正数: {}x{}",
      shape_w, shape_h
    )));
  }
  check_boxes(&coeffs, boxes)?;

  let (_, mh, mw) = protos.dim();
  let width_ratio = mw as f32 / shape_w as f32;
  let height_ratio = mh as f32 / shape_h as f32;

  let mut logits = mask_logits(coeffs, protos)?;
  let mut masks = Vec::with_capacity(boxes.len());
  for (mut mask, bbox) in logits.outer_iter_mut().zip(boxes) {
    let scaled = [
      bbox[0] * width_ratio,
      bbox[1] * height_ratio,
      bbox[2] * width_ratio,
      bbox[3] * height_ratio,
    ];
    crop_mask(mask.view_mut(), scaled);

    if upsample && (mh, mw) != (shape_h, shape_w) {
      let up = resize_bilinear(mask.view(), shape_h, shape_w);
      masks.push(binarize(up.view(), 0.0));
    } else {
      masks.push(binarize(mask.view(), 0.0));
    }
  }
  Ok(masks)
}

/// 按 letterbox 映射裁掉填充区域，再缩放到原图尺寸 `target_h × target_w`。
///
/// `src` 可以是网络输入分辨率或原型分辨率，内容区域按两者的比例换算；
/// 区域为空时返回 `None`。
pub fn scale_mask(
  src: ArrayView2<'_, f32>,
  target_h: usize,
  target_w: usize,
  mapping: &LetterboxMapping,
) -> Option<Array2<f32>> {
  let (in_h, in_w) = src.dim();
  if in_h == 0 || in_w == 0 {
    return None;
  }
  let region = Region::letterbox_content(mapping, in_h, in_w);
  resize_region(src, region, target_h, target_w)
}

/// 二值掩码从输入空间映射到原图空间，缩放后以 0.5 为阈值重新二值化
pub fn scale_masks(
  masks: &[Mask],
  target_h: usize,
  target_w: usize,
  mapping: &LetterboxMapping,
) -> Result<Vec<Mask>, DecodeError> {
  masks
    .iter()
    .map(|mask| {
      let values = mask.as_array().mapv(f32::from);
      let scaled = scale_mask(values.view(), target_h, target_w, mapping).ok_or_else(|| {
        DecodeError::InvalidInput(format!(
          "无法将 {}x{} 掩码缩放到 {}x{}",
          mask.width(),
          mask.height(),
          target_w,
          target_h
        ))
      })?;
      Ok(binarize(scaled.view(), 0.5))
    })
    .collect()
}

/// 原图空间（retina）掩码：整幅 logit 直接缩放到原图，再按原图坐标的框裁剪
pub fn process_mask_native(
  protos: ArrayView3<'_, f32>,
  coeffs: ArrayView2<'_, f32>,
  boxes: &[[f32; 4]],
  shape_h: usize,
  shape_w: usize,
  mapping: &LetterboxMapping,
) -> Result<Vec<Mask>, DecodeError> {
  check_boxes(&coeffs, boxes)?;

  let logits = mask_logits(coeffs, protos)?;
  let mut masks = Vec::with_capacity(boxes.len());
  for (mask, bbox) in logits.outer_iter().zip(boxes) {
    let mut scaled = scale_mask(mask, shape_h, shape_w, mapping).ok_or_else(|| {
      DecodeError::InvalidInput(format!(
        "无法将 {}x{} 掩码缩放到 {}x{}",
        mask.ncols(),
        mask.nrows(),
        shape_w,
        shape_h
      ))
    })?;
    crop_mask(scaled.view_mut(), *bbox);
    masks.push(binarize(scaled.view(), 0.0));
  }

  debug!("原图空间掩码: {} 个, {}x{}", masks.len(), shape_w, shape_h);
  Ok(masks)
}
