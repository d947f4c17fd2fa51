// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/layout.rs - 输出张量布局识别
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

use ndarray::{ArrayD, ArrayView2, ArrayView3, ArrayViewD, Axis, Ix2, Ix3};
use tracing::{debug, warn};

use crate::model::DecodeError;

/// 端到端输出每行的固定字段：x1, y1, x2, y2, score, label
pub const END2END_FIELDS: usize = 6;
/// 密集输出每个锚点的边界框字段数
pub const BOX_FIELDS: usize = 4;

/// 输出矩阵布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
  /// `(4 + nc [+ md], anchors)`，特征在行
  FeatureMajor { anchors: usize, with_mask: bool },
  /// `(anchors, 4 + nc [+ md])`，特征在列
  AnchorMajor { anchors: usize, with_mask: bool },
  /// `(n, 6 [+ md])`，每行一个已选出的检测
  End2EndRows { detections: usize, with_mask: bool },
  /// `(6 [+ md], n)`
  End2EndCols { detections: usize, with_mask: bool },
}

impl OutputLayout {
  pub fn is_end2end(&self) -> bool {
    matches!(
      self,
      OutputLayout::End2EndRows { .. } | OutputLayout::End2EndCols { .. }
    )
  }

  pub fn with_mask(&self) -> bool {
    match *self {
      OutputLayout::FeatureMajor { with_mask, .. }
      | OutputLayout::AnchorMajor { with_mask, .. }
      | OutputLayout::End2EndRows { with_mask, .. }
      | OutputLayout::End2EndCols { with_mask, .. } => with_mask,
    }
  }

  /// 锚点数或检测数
  pub fn count(&self) -> usize {
    match *self {
      OutputLayout::FeatureMajor { anchors, .. } | OutputLayout::AnchorMajor { anchors, .. } => {
        anchors
      }
      OutputLayout::End2EndRows { detections, .. }
      | OutputLayout::End2EndCols { detections, .. } => detections,
    }
  }
}

fn drop_unit_batch(view: ArrayViewD<'_, f32>) -> ArrayViewD<'_, f32> {
  if view.ndim() == 4 && view.shape()[0] == 1 {
    view.index_axis_move(Axis(0), 0)
  } else {
    view
  }
}

/// 折叠长度为 1 的维度得到二维矩阵，不拷贝数据。
///
/// 依次尝试：二维直接使用；三维单通道取第 0 通道；`(c, 1, w)` 视为 `(c, w)`；
/// `(c, h, 1)` 视为 `(c, h)`。四维张量先去掉长度为 1 的批次维。
pub fn to_matrix(raw: &ArrayD<f32>) -> Result<ArrayView2<'_, f32>, DecodeError> {
  let unsupported = || DecodeError::UnsupportedLayout {
    shape: raw.shape().to_vec(),
  };

  let view = drop_unit_batch(raw.view());
  let view = match view.ndim() {
    2 => view,
    3 => {
      let shape = view.shape().to_vec();
      if shape[0] == 1 {
        view.index_axis_move(Axis(0), 0)
      } else if shape[1] == 1 {
        view.index_axis_move(Axis(1), 0)
      } else if shape[2] == 1 {
        view.index_axis_move(Axis(2), 0)
      } else {
        return Err(unsupported());
      }
    }
    _ => return Err(unsupported()),
  };

  view.into_dimensionality::<Ix2>().map_err(|_| unsupported())
}

/// 三维 `(c, h, w)` 视图，四维时去掉长度为 1 的批次维
pub fn to_chw(raw: &ArrayD<f32>) -> Option<ArrayView3<'_, f32>> {
  drop_unit_batch(raw.view()).into_dimensionality::<Ix3>().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schema {
  Dense,
  End2End,
}

/// 根据 `(rows, cols)` 识别输出布局。
///
/// 依次匹配四种宽度：`mask_dim > 0` 时先试带掩码系数的密集输出 `4 + nc + md`
/// 和端到端输出 `6 + md`，再试不带系数的 `4 + nc` 和 `6`。
/// `with_mask` 取自匹配到的那一种。密集输出优先认为特征在行，端到端输出优先认为每行一个检测。
/// 同一宽度同时符合密集和端到端（如 nc = 2、md = 0 时都是 6）时按密集输出处理。
pub fn classify(
  dims: (usize, usize),
  num_classes: usize,
  mask_dim: usize,
) -> Result<OutputLayout, DecodeError> {
  let (rows, cols) = dims;

  let mut schemas = Vec::with_capacity(4);
  if mask_dim > 0 {
    schemas.push((Schema::Dense, BOX_FIELDS + num_classes + mask_dim, true));
    schemas.push((Schema::End2End, END2END_FIELDS + mask_dim, true));
  }
  schemas.push((Schema::Dense, BOX_FIELDS + num_classes, false));
  schemas.push((Schema::End2End, END2END_FIELDS, false));

  let matched: Vec<OutputLayout> = schemas
    .iter()
    .filter_map(|&(schema, width, with_mask)| match schema {
      Schema::Dense if rows == width => Some(OutputLayout::FeatureMajor {
        anchors: cols,
        with_mask,
      }),
      Schema::Dense if cols == width => Some(OutputLayout::AnchorMajor {
        anchors: rows,
        with_mask,
      }),
      Schema::End2End if cols == width => Some(OutputLayout::End2EndRows {
        detections: rows,
        with_mask,
      }),
      Schema::End2End if rows == width => Some(OutputLayout::End2EndCols {
        detections: cols,
        with_mask,
      }),
      _ => None,
    })
    .collect();

  let layout = match matched.first() {
    Some(&layout) => layout,
    None => {
      return Err(DecodeError::UnsupportedLayout {
        shape: vec![rows, cols],
      });
    }
  };
  if matched.len() > 1 {
    warn!(
      "输出矩阵 {}x{} 同时符合 {:?}，按 {:?} 解码",
      rows, cols, matched, layout
    );
  }

  debug!("输出矩阵 {}x{} 识别为 {:?}", rows, cols, layout);
  Ok(layout)
}

/// 统一为“每行一个锚点/检测、每列一个特征”的视图
pub fn anchor_table<'a>(matrix: ArrayView2<'a, f32>, layout: OutputLayout) -> ArrayView2<'a, f32> {
  match layout {
    OutputLayout::FeatureMajor { .. } | OutputLayout::End2EndCols { .. } => {
      matrix.reversed_axes()
    }
    OutputLayout::AnchorMajor { .. } | OutputLayout::End2EndRows { .. } => matrix,
  }
}
