// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/yolo26_parity.rs - 一致性数据生成
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
  fs::File,
  io::{BufWriter, Write},
  path::{Path, PathBuf},
};

use anyhow::{Result, ensure};
use clap::{Parser, Subcommand};
use ndarray::{Array2, Array3};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;
use tracing::info;

use yolo26::{
  Detection, Mask,
  frame::LetterboxMapping,
  model::{
    mask::{process_mask, process_mask_native, scale_masks},
    nms::nms,
    topk::select_topk,
  },
};

const INPUT_SIZE: f32 = 640.0;

/// 生成随机数据并写出解码结果，供外部实现逐项比对
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// 两阶段 TopK 选择
  Topk {
    anchors: usize,
    classes: usize,
    max_det: usize,
    seed: u64,
    /// 分数矩阵 `(anchors, classes)`，小端 f32
    scores: PathBuf,
    /// 每行 `score class anchor`
    topk: PathBuf,
  },
  /// 按类别 NMS
  Nms {
    anchors: usize,
    classes: usize,
    max_det: usize,
    conf: f32,
    iou: f32,
    #[arg(long)]
    agnostic: bool,
    seed: u64,
    out_dir: PathBuf,
  },
  /// 原型掩码的三种处理路径
  Mask {
    n: usize,
    mask_dim: usize,
    mh: usize,
    mw: usize,
    in_h: usize,
    in_w: usize,
    orig_h: usize,
    orig_w: usize,
    seed: u64,
    out_dir: PathBuf,
  },
}

fn write_f32(path: &Path, data: impl IntoIterator<Item = f32>) -> Result<()> {
  let mut writer = BufWriter::new(File::create(path)?);
  for v in data {
    writer.write_all(&v.to_le_bytes())?;
  }
  writer.flush()?;
  Ok(())
}

fn write_masks(path: &Path, masks: &[Mask]) -> Result<()> {
  let mut writer = BufWriter::new(File::create(path)?);
  for mask in masks {
    let bytes: Vec<u8> = mask.as_array().iter().copied().collect();
    writer.write_all(&bytes)?;
  }
  writer.flush()?;
  Ok(())
}

/// 在 `[0, w) x [0, h)` 内随机生成一个 xyxy 框
fn random_box(rng: &mut StdRng, w: f32, h: f32) -> [f32; 4] {
  let x1 = rng.random::<f32>() * (w - 1.0).max(0.0);
  let y1 = rng.random::<f32>() * (h - 1.0).max(0.0);
  let x2 = x1 + rng.random::<f32>() * (w - x1);
  let y2 = y1 + rng.random::<f32>() * (h - y1);
  [x1.min(x2), y1.min(y2), x1.max(x2), y1.max(y2)]
}

fn run_topk(
  anchors: usize,
  classes: usize,
  max_det: usize,
  seed: u64,
  scores_path: &Path,
  topk_path: &Path,
) -> Result<()> {
  ensure!(anchors > 0 && classes > 0 && max_det > 0, "参数必须为正数");

  let mut rng = StdRng::seed_from_u64(seed);
  let scores: Vec<f32> = (0..anchors * classes).map(|_| rng.random::<f32>()).collect();
  write_f32(scores_path, scores.iter().copied())?;

  let topk = select_topk(anchors, classes, max_det, |anchor, class| {
    scores[anchor * classes + class]
  });
  let text: String = topk
    .iter()
    .map(|entry| format!("{:.9} {} {}\n", entry.score, entry.class, entry.anchor))
    .collect();
  std::fs::write(topk_path, text)?;

  info!("TopK: {} 个锚点, {} 个类别, 选出 {} 个", anchors, classes, topk.len());
  Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_nms(
  anchors: usize,
  classes: usize,
  max_det: usize,
  conf: f32,
  iou: f32,
  agnostic: bool,
  seed: u64,
  out_dir: &Path,
) -> Result<()> {
  ensure!(anchors > 0 && classes > 0 && max_det > 0, "参数必须为正数");
  std::fs::create_dir_all(out_dir)?;

  let mut rng = StdRng::seed_from_u64(seed);
  let boxes: Vec<[f32; 4]> = (0..anchors)
    .map(|_| {
      let x1 = rng.random::<f32>() * INPUT_SIZE;
      let y1 = rng.random::<f32>() * INPUT_SIZE;
      let x2 = x1 + rng.random::<f32>() * (INPUT_SIZE - x1);
      let y2 = y1 + rng.random::<f32>() * (INPUT_SIZE - y1);
      [(x1 + x2) * 0.5, (y1 + y2) * 0.5, x2 - x1, y2 - y1]
    })
    .collect();
  let scores = Array2::from_shape_fn((anchors, classes), |_| rng.random::<f32>());

  let proposals: Vec<Detection> = boxes
    .iter()
    .zip(scores.outer_iter())
    .filter_map(|(&[cx, cy, w, h], row)| {
      let (label, &score) = row
        .iter()
        .enumerate()
        .fold((0, &row[0]), |best, (c, s)| if *s > *best.1 { (c, s) } else { best });
      if score < conf {
        return None;
      }
      let bbox = [cx - w * 0.5, cy - h * 0.5, cx + w * 0.5, cy + h * 0.5];
      Some(Detection::new(bbox, label, score))
    })
    .collect();

  let mut kept = nms(proposals, iou, agnostic);
  kept.truncate(max_det);

  write_f32(&out_dir.join("boxes_cxcywh.bin"), boxes.iter().flatten().copied())?;
  write_f32(&out_dir.join("scores.bin"), scores.iter().copied())?;
  let text: String = kept
    .iter()
    .map(|det| {
      format!(
        "{:.9} {:.9} {:.9} {:.9} {:.9} {}\n",
        det.x1, det.y1, det.x2, det.y2, det.score, det.label
      )
    })
    .collect();
  std::fs::write(out_dir.join("dets.txt"), text)?;

  info!("NMS: {} 个锚点, 保留 {} 个", anchors, kept.len());
  Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_mask(
  n: usize,
  mask_dim: usize,
  mh: usize,
  mw: usize,
  in_h: usize,
  in_w: usize,
  orig_h: usize,
  orig_w: usize,
  seed: u64,
  out_dir: &Path,
) -> Result<()> {
  ensure!(
    [n, mask_dim, mh, mw, in_h, in_w, orig_h, orig_w].iter().all(|&v| v > 0),
    "参数必须为正数"
  );
  std::fs::create_dir_all(out_dir)?;

  let mut rng = StdRng::seed_from_u64(seed);
  let protos = Array3::from_shape_fn((mask_dim, mh, mw), |_| {
    rng.sample::<f32, _>(StandardNormal)
  });
  let coeffs = Array2::from_shape_fn((n, mask_dim), |_| rng.sample::<f32, _>(StandardNormal));

  let mut boxes_in = Vec::with_capacity(n);
  let mut boxes_orig = Vec::with_capacity(n);
  for _ in 0..n {
    boxes_in.push(random_box(&mut rng, in_w as f32, in_h as f32));
    boxes_orig.push(random_box(&mut rng, orig_w as f32, orig_h as f32));
  }

  // 原图居中 letterbox 到输入尺寸
  let mapping = LetterboxMapping::new(
    orig_w as u32,
    orig_h as u32,
    in_w as u32,
    in_h as u32,
    true,
    true,
  );
  let masks_proc = process_mask(protos.view(), coeffs.view(), &boxes_in, in_h, in_w, true)?;
  let masks_scaled = scale_masks(&masks_proc, orig_h, orig_w, &mapping)?;
  let masks_native =
    process_mask_native(protos.view(), coeffs.view(), &boxes_orig, orig_h, orig_w, &mapping)?;

  write_f32(&out_dir.join("protos.bin"), protos.iter().copied())?;
  write_f32(&out_dir.join("masks_in.bin"), coeffs.iter().copied())?;
  write_f32(&out_dir.join("boxes_in.bin"), boxes_in.iter().flatten().copied())?;
  write_f32(&out_dir.join("boxes_orig.bin"), boxes_orig.iter().flatten().copied())?;
  write_masks(&out_dir.join("masks_proc.bin"), &masks_proc)?;
  write_masks(&out_dir.join("masks_scaled.bin"), &masks_scaled)?;
  write_masks(&out_dir.join("masks_native.bin"), &masks_native)?;

  info!("掩码: {} 个实例, 结果写入 {}", n, out_dir.display());
  Ok(())
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  match args.command {
    Command::Topk {
      anchors,
      classes,
      max_det,
      seed,
      scores,
      topk,
    } => run_topk(anchors, classes, max_det, seed, &scores, &topk),
    Command::Nms {
      anchors,
      classes,
      max_det,
      conf,
      iou,
      agnostic,
      seed,
      out_dir,
    } => run_nms(anchors, classes, max_det, conf, iou, agnostic, seed, &out_dir),
    Command::Mask {
      n,
      mask_dim,
      mh,
      mw,
      in_h,
      in_w,
      orig_h,
      orig_w,
      seed,
      out_dir,
    } => run_mask(n, mask_dim, mh, mw, in_h, in_w, orig_h, orig_w, seed, &out_dir),
  }
}
