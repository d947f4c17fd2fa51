// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/yolo26.rs - 模型定义
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

use image::RgbImage;
use ndarray::{Array2, ArrayD, ArrayView3};
use tracing::{debug, info, warn};

use crate::{
  config::{Config, DecodeStrategy, MaskStrategy},
  engine::{Engine, INPUT_FALLBACKS, OUTPUT_FALLBACKS, PROTO_FALLBACKS, extract_with_fallback, input_with_fallback},
  frame::{LetterboxFrame, letterbox},
  model::{
    DecodeError, DetectResult, Detection, Model,
    decode::{decode_dense, decode_grid, decode_passthrough, decode_topk, sort_by_score},
    layout,
    mask::{process_mask, process_mask_native, scale_masks},
    nms::{dedup, nms},
    rescale::scale_detections,
  },
};

const BOX_CHANNELS: usize = 4;

pub struct Yolo26Builder<E> {
  engine: E,
  config: Config,
}

impl<E: Engine> Yolo26Builder<E> {
  pub fn new(engine: E) -> Self {
    Self {
      engine,
      config: Config::default(),
    }
  }

  pub fn config(mut self, config: Config) -> Self {
    self.config = config;
    self
  }

  pub fn build(mut self) -> Result<Yolo26<E>, DecodeError> {
    self.config.validate()?;
    self.engine.set_gpu(self.config.use_gpu);

    info!(
      "YOLO26 解码器: 输入 {}x{}, {} 个类别, 解码 {:?}, 掩码 {:?}",
      self.config.input_width,
      self.config.input_height,
      self.config.num_classes,
      self.config.decode_strategy(),
      self.config.mask_strategy()
    );
    if !self.config.grid_heads.is_empty() {
      debug!("配置了 {} 个网格检测头", self.config.grid_heads.len());
    }

    Ok(Yolo26 {
      engine: self.engine,
      config: self.config,
    })
  }
}

/// YOLO26 检测与实例分割解码器。
///
/// 推理引擎不可重入，`detect()` 需要 `&mut self`；多线程时每个线程持有独立实例。
pub struct Yolo26<E> {
  engine: E,
  config: Config,
}

impl<E: Engine> Yolo26<E> {
  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn engine(&self) -> &E {
    &self.engine
  }

  pub fn detect(&mut self, image: &RgbImage) -> Result<DetectResult, DecodeError> {
    let config = &self.config;
    let strategy = config.decode_strategy();
    let mask_strategy = config.mask_strategy();

    let frame = letterbox(
      image,
      config.input_width,
      config.input_height,
      config.padding_value,
      config.scaleup,
      config.center,
    )?;

    let input_name = input_with_fallback(
      &mut self.engine,
      &config.input_name,
      frame.tensor.view(),
      &INPUT_FALLBACKS,
    )?;
    debug!("输入张量 '{}': {:?}", input_name, frame.tensor.dim());

    if mask_strategy == MaskStrategy::None && !config.grid_heads.is_empty() {
      if let Some(mut detections) = decode_grid_heads(&mut self.engine, config)? {
        scale_detections(
          &mut detections,
          frame.original_width,
          frame.original_height,
          &frame.mapping,
        );
        debug!("网格解码得到 {} 个检测", detections.len());
        return Ok(detections.into());
      }
      debug!("网格检测头不完整，改用单输出解码");
    }

    let raw = extract_with_fallback(&mut self.engine, &config.output_name, &OUTPUT_FALLBACKS)?;
    let matrix = layout::to_matrix(&raw)?;
    let output_layout = layout::classify(matrix.dim(), config.num_classes, config.mask_dim)?;
    let with_mask = output_layout.with_mask();

    // 输出不带掩码系数时只做检测，不取原型
    let protos = match mask_strategy {
      MaskStrategy::None => None,
      MaskStrategy::InputSpace | MaskStrategy::Retina if !with_mask => {
        warn!("输出布局 {:?} 不含掩码系数，跳过掩码", output_layout);
        None
      }
      MaskStrategy::InputSpace | MaskStrategy::Retina => Some(extract_with_fallback(
        &mut self.engine,
        &config.proto_name,
        &PROTO_FALLBACKS,
      )?),
    };
    let table = layout::anchor_table(matrix, output_layout);

    let mut detections = if output_layout.is_end2end() {
      decode_passthrough(table, config, with_mask)?
    } else {
      match strategy {
        DecodeStrategy::Nms => {
          let candidates = decode_dense(table, config, with_mask)?;
          let mut kept = nms(candidates, config.iou_threshold, config.agnostic_nms);
          kept.truncate(config.max_det);
          kept
        }
        DecodeStrategy::TopK { dedup: false } => decode_topk(table, config, with_mask)?,
        DecodeStrategy::TopK { dedup: true } => dedup(
          decode_topk(table, config, with_mask)?,
          config.iou_threshold,
          config.agnostic_nms,
          config.max_det,
        ),
      }
    };
    debug!("{:?} 解码得到 {} 个检测", output_layout, detections.len());

    if detections.is_empty() {
      return Ok(DetectResult::default());
    }

    match protos {
      Some(protos) => {
        detections = attach_masks(detections, &protos, &frame, config, mask_strategy)?;
      }
      None => scale_detections(
        &mut detections,
        frame.original_width,
        frame.original_height,
        &frame.mapping,
      ),
    }

    Ok(detections.into())
  }
}

impl<E: Engine> Model for Yolo26<E> {
  type Input = RgbImage;
  type Output = DetectResult;
  type Error = DecodeError;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.detect(input)
  }
}

/// 取出全部检测头并做网格解码；任一检测头缺失时返回 `None`
fn decode_grid_heads<E: Engine>(
  engine: &mut E,
  config: &Config,
) -> Result<Option<Vec<Detection>>, DecodeError> {
  let mut tensors = Vec::with_capacity(config.grid_heads.len());
  for head in &config.grid_heads {
    let reg = match engine.extract(&head.reg_name) {
      Ok(tensor) => tensor,
      Err(e) => {
        debug!("检测头 '{}' 取出失败: {}", head.reg_name, e);
        return Ok(None);
      }
    };
    let cls = match engine.extract(&head.cls_name) {
      Ok(tensor) => tensor,
      Err(e) => {
        debug!("检测头 '{}' 取出失败: {}", head.cls_name, e);
        return Ok(None);
      }
    };
    tensors.push((head.stride, reg, cls));
  }

  let mut proposals = Vec::new();
  for (stride, reg, cls) in &tensors {
    let (reg, cls) = match_reg_cls(reg, cls, *stride)?;
    proposals.extend(decode_grid(
      reg,
      cls,
      *stride,
      config.input_width,
      config.input_height,
      config.conf_threshold,
    )?);
  }

  sort_by_score(&mut proposals);
  let mut kept = nms(proposals, config.iou_threshold, config.agnostic_nms);
  kept.truncate(config.max_det);
  Ok(Some(kept))
}

/// 根据通道数区分回归与分类输出，两者顺序颠倒时交换
fn match_reg_cls<'a>(
  reg: &'a ArrayD<f32>,
  cls: &'a ArrayD<f32>,
  stride: u32,
) -> Result<(ArrayView3<'a, f32>, ArrayView3<'a, f32>), DecodeError> {
  let unsupported = |tensor: &ArrayD<f32>| DecodeError::UnsupportedLayout {
    shape: tensor.shape().to_vec(),
  };
  let reg_view = layout::to_chw(reg).ok_or_else(|| unsupported(reg))?;
  let cls_view = layout::to_chw(cls).ok_or_else(|| unsupported(cls))?;

  if reg_view.dim().0 != BOX_CHANNELS && cls_view.dim().0 == BOX_CHANNELS {
    debug!("步长 {}: 回归与分类输出顺序交换", stride);
    Ok((cls_view, reg_view))
  } else {
    Ok((reg_view, cls_view))
  }
}

fn attach_masks(
  mut detections: Vec<Detection>,
  protos: &ArrayD<f32>,
  frame: &LetterboxFrame,
  config: &Config,
  strategy: MaskStrategy,
) -> Result<Vec<Detection>, DecodeError> {
  let protos = layout::to_chw(protos).ok_or_else(|| {
    DecodeError::MalformedProto(format!("原型张量必须为三维: {:?}", protos.shape()))
  })?;
  if protos.dim().0 != config.mask_dim {
    return Err(DecodeError::MalformedProto(format!(
      "原型通道数 {} 与掩码维度 {} 不一致",
      protos.dim().0,
      config.mask_dim
    )));
  }

  let mut coeffs = Array2::<f32>::zeros((detections.len(), config.mask_dim));
  for (mut row, det) in coeffs.outer_iter_mut().zip(&detections) {
    match &det.mask_coeffs {
      Some(values) if values.len() == config.mask_dim => {
        row.iter_mut().zip(values).for_each(|(dst, &src)| *dst = src);
      }
      _ => {
        return Err(DecodeError::MalformedProto(
          "检测缺少完整的掩码系数".to_string(),
        ));
      }
    }
  }

  let orig_w = frame.original_width;
  let orig_h = frame.original_height;
  let masks = match strategy {
    MaskStrategy::InputSpace => {
      let boxes: Vec<[f32; 4]> = detections.iter().map(Detection::bbox).collect();
      let masks = process_mask(
        protos,
        coeffs.view(),
        &boxes,
        frame.height(),
        frame.width(),
        true,
      )?;
      let masks = scale_masks(&masks, orig_h as usize, orig_w as usize, &frame.mapping)?;
      scale_detections(&mut detections, orig_w, orig_h, &frame.mapping);
      masks
    }
    MaskStrategy::Retina => {
      scale_detections(&mut detections, orig_w, orig_h, &frame.mapping);
      let boxes: Vec<[f32; 4]> = detections.iter().map(Detection::bbox).collect();
      process_mask_native(
        protos,
        coeffs.view(),
        &boxes,
        orig_h as usize,
        orig_w as usize,
        &frame.mapping,
      )?
    }
    MaskStrategy::None => {
      scale_detections(&mut detections, orig_w, orig_h, &frame.mapping);
      return Ok(detections);
    }
  };

  let before = detections.len();
  let kept: Vec<Detection> = detections
    .into_iter()
    .zip(masks)
    .filter_map(|(mut det, mask)| {
      if mask.area() == 0 {
        return None;
      }
      det.mask = Some(mask);
      Some(det)
    })
    .collect();
  if kept.len() != before {
    debug!("丢弃 {} 个空掩码检测", before - kept.len());
  }
  Ok(kept)
}
