// 该文件是 Shanan （山南西风） 项目的一部分。
// src/args.rs - 解码参数配置
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

use clap::Args;

use crate::config::{BoxFormat, Config, GridHead, PostprocessMode};

/// 解码参数，各个可执行文件共用
#[derive(Args, Debug, Clone)]
pub struct DecodeArgs {
  /// 网络输入尺寸（正方形）
  #[arg(long, default_value_t = 640, value_name = "PIXELS")]
  pub imgsz: u32,

  /// 类别数量
  #[arg(long, default_value_t = 80, value_name = "COUNT")]
  pub classes: usize,

  /// 置信度阈值，默认检测 0.25、分割 0.5
  #[arg(long, value_name = "THRESHOLD")]
  pub conf: Option<f32>,

  /// NMS IoU 阈值
  #[arg(long, default_value_t = 0.45, value_name = "THRESHOLD")]
  pub iou: f32,

  /// 最大检测数量
  #[arg(long, default_value_t = 300, value_name = "COUNT")]
  pub max_det: usize,

  /// 后处理方式: auto, nms, topk
  #[arg(long = "post", default_value_t = PostprocessMode::Auto, value_name = "MODE")]
  pub postprocess: PostprocessMode,

  /// 边界框格式: cxcywh, xyxy
  #[arg(long = "box", default_value_t = BoxFormat::CxCyWh, value_name = "FORMAT")]
  pub box_format: BoxFormat,

  /// TopK 之后再做一次 NMS 去重
  #[arg(long)]
  pub dedup: bool,

  /// 不区分类别的 NMS
  #[arg(long)]
  pub agnostic: bool,

  /// 原图分辨率掩码
  #[arg(long)]
  pub retina: bool,

  /// GPU 加速提示
  #[arg(long)]
  pub gpu: bool,

  /// 掩码系数维度，0 表示纯检测模型
  #[arg(long, default_value_t = 0, value_name = "DIM")]
  pub mask_dim: usize,

  /// 输入张量名称
  #[arg(long, default_value = "in0", value_name = "NAME")]
  pub input_name: String,

  /// 检测输出张量名称
  #[arg(long, default_value = "out0", value_name = "NAME")]
  pub output_name: String,

  /// 原型张量名称
  #[arg(long, default_value = "out1", value_name = "NAME")]
  pub proto_name: String,

  /// 网格检测头 `stride:reg:cls`，可重复
  #[arg(long = "head", value_parser = parse_grid_head, value_name = "HEAD")]
  pub heads: Vec<GridHead>,
}

fn parse_grid_head(s: &str) -> Result<GridHead, String> {
  let mut parts = s.splitn(3, ':');
  match (parts.next(), parts.next(), parts.next()) {
    (Some(stride), Some(reg), Some(cls)) if !reg.is_empty() && !cls.is_empty() => {
      let stride = stride
        .parse::<u32>()
        .map_err(|e| format!("无效的步长 '{}': {}", stride, e))?;
      Ok(GridHead::new(stride, reg, cls))
    }
    _ => Err(format!("检测头格式应为 stride:reg:cls, 实际为 '{}'", s)),
  }
}

impl DecodeArgs {
  pub fn to_config(&self) -> Config {
    let base = if self.mask_dim > 0 {
      Config::segmentation().with_mask_dim(self.mask_dim)
    } else {
      Config::default()
    };
    let conf = self.conf.unwrap_or(base.conf_threshold);

    let mut config = base
      .with_input_size(self.imgsz, self.imgsz)
      .with_num_classes(self.classes)
      .with_thresholds(conf, self.iou)
      .with_max_det(self.max_det)
      .with_postprocess(self.postprocess)
      .with_box_format(self.box_format)
      .with_topk_dedup(self.dedup)
      .with_agnostic_nms(self.agnostic)
      .with_retina_masks(self.retina)
      .with_grid_heads(self.heads.clone());
    config.use_gpu = self.gpu;
    config.input_name = self.input_name.clone();
    config.output_name = self.output_name.clone();
    config.proto_name = self.proto_name.clone();
    config
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::Parser;

  #[derive(Parser, Debug)]
  struct Cli {
    #[command(flatten)]
    decode: DecodeArgs,
  }

  #[test]
  fn defaults_match_detection_preset() {
    let cli = Cli::parse_from(["test"]);
    let config = cli.decode.to_config();
    assert_eq!(config, Config::default());
  }

  #[test]
  fn segmentation_flags() {
    let cli = Cli::parse_from([
      "test",
      "--mask-dim",
      "32",
      "--post",
      "topk",
      "--box",
      "xyxy",
      "--dedup",
      "--retina",
      "--max-det",
      "100",
    ]);
    let config = cli.decode.to_config();
    assert_eq!(config.conf_threshold, 0.5);
    assert_eq!(config.mask_dim, 32);
    assert_eq!(config.postprocess, PostprocessMode::TopK);
    assert_eq!(config.box_format, BoxFormat::XyXy);
    assert!(config.topk_dedup && config.retina_masks);
    assert_eq!(config.max_det, 100);
  }

  #[test]
  fn grid_heads_are_parsed() {
    let cli = Cli::parse_from(["test", "--head", "8:reg8:cls8", "--head", "16:reg16:cls16"]);
    let config = cli.decode.to_config();
    assert_eq!(config.grid_heads.len(), 2);
    assert_eq!(config.grid_heads[1], GridHead::new(16, "reg16", "cls16"));
    assert!(parse_grid_head("x:reg:cls").is_err());
    assert!(parse_grid_head("8:reg").is_err());
  }
}
