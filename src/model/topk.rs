// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/topk.rs - 两阶段 TopK 选择
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

use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopKEntry {
  pub score: f32,
  pub class: usize,
  pub anchor: usize,
}

fn entry_cmp_desc(a: &TopKEntry, b: &TopKEntry) -> Ordering {
  b.score
    .total_cmp(&a.score)
    .then_with(|| a.anchor.cmp(&b.anchor))
    .then_with(|| a.class.cmp(&b.class))
}

/// 只保留排序后的前 `k` 项
fn partial_sort(items: &mut Vec<TopKEntry>, k: usize) {
  if k == 0 {
    items.clear();
    return;
  }
  if k < items.len() {
    items.select_nth_unstable_by(k - 1, entry_cmp_desc);
    items.truncate(k);
  }
  items.sort_unstable_by(entry_cmp_desc);
}

/// 全局两阶段 TopK。
///
/// 第一阶段按每个锚点的最高类别分数选出 `K = min(max_det, anchors)` 个锚点；
/// 第二阶段在这些锚点的全部类别上选出分数最高的 `min(max_det, K * nc)` 个
/// (锚点, 类别) 组合。分数相同时锚点下标小者优先，其次类别下标小者优先。
pub fn select_topk<F>(anchors: usize, num_classes: usize, max_det: usize, score: F) -> Vec<TopKEntry>
where
  F: Fn(usize, usize) -> f32,
{
  if anchors == 0 || num_classes == 0 || max_det == 0 {
    return Vec::new();
  }

  let k = max_det.min(anchors);

  let mut anchor_best: Vec<TopKEntry> = (0..anchors)
    .map(|anchor| {
      let best = (1..num_classes)
        .map(|c| score(anchor, c))
        .fold(score(anchor, 0), f32::max);
      TopKEntry {
        score: best,
        class: 0,
        anchor,
      }
    })
    .collect();
  partial_sort(&mut anchor_best, k);

  let mut candidates: Vec<TopKEntry> = anchor_best
    .iter()
    .flat_map(|best| {
      (0..num_classes).map(|class| TopKEntry {
        score: score(best.anchor, class),
        class,
        anchor: best.anchor,
      })
    })
    .collect();
  let keep = max_det.min(candidates.len());
  partial_sort(&mut candidates, keep);

  candidates
}
