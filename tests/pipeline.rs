// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/pipeline.rs - 解码流程集成测试
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
use ndarray::{Array4, ArrayD, Axis, arr2};

use yolo26::{
  BoxFormat, Config, DecodeError, DetectResult, Detection, GridHead, Yolo26Builder,
  engine::ReplayEngine, model::decode::sigmoid,
};

/// 128x64 原图在 64x64 输入下：缩放 0.5，上下各填充 16 像素
fn wide_image() -> RgbImage {
  RgbImage::new(128, 64)
}

fn small_config(num_classes: usize) -> Config {
  Config::default()
    .with_input_size(64, 64)
    .with_num_classes(num_classes)
}

fn assert_box(actual: [f32; 4], expected: [f32; 4]) {
  for (a, e) in actual.iter().zip(expected.iter()) {
    assert!((a - e).abs() < 1e-4, "box {:?} != {:?}", actual, expected);
  }
}

fn detections(result: &DetectResult) -> Vec<&Detection> {
  result.iter().collect()
}

fn detect(engine: ReplayEngine, config: Config, image: &RgbImage) -> Result<DetectResult, DecodeError> {
  Yolo26Builder::new(engine).config(config).build()?.detect(image)
}

fn end2end_output() -> ArrayD<f32> {
  arr2(&[
    [8.0, 20.0, 24.0, 40.0, 0.9, 2.0],
    [0.0, 0.0, 10.0, 10.0, 0.1, 1.0],
    [4.0, 16.0, 12.0, 24.0, 0.8, -1.0],
  ])
  .insert_axis(Axis(0))
  .into_dyn()
}

#[test]
fn end2end_rows_are_rescaled_to_original() {
  let engine = ReplayEngine::default().with_output("out0", end2end_output());
  let mut model = Yolo26Builder::new(engine)
    .config(small_config(3))
    .build()
    .unwrap();

  let result = model.detect(&wide_image()).unwrap();
  let dets = detections(&result);
  assert_eq!(dets.len(), 1);
  assert_eq!(dets[0].label, 2);
  assert_eq!(dets[0].score, 0.9);
  assert_box(dets[0].bbox(), [16.0, 8.0, 48.0, 48.0]);
  assert!(dets[0].mask.is_none());

  assert_eq!(model.engine().last_input_shape(), Some([3, 64, 64]));
}

/// 特征在行的密集输出 `(7, 4)`，三个类别
fn dense_output() -> ArrayD<f32> {
  arr2(&[
    [32.0, 33.0, 33.0, 10.0],
    [32.0, 32.0, 32.0, 40.0],
    [16.0, 16.0, 16.0, 4.0],
    [16.0, 16.0, 16.0, 4.0],
    [0.9, 0.8, 0.0, 0.1],
    [0.1, 0.0, 0.7, 0.2],
    [0.0, 0.0, 0.0, 0.1],
  ])
  .insert_axis(Axis(0))
  .into_dyn()
}

#[test]
fn dense_output_with_class_aware_nms() {
  // 输入、输出都只能通过备选名称找到
  let engine = ReplayEngine::default()
    .with_input_names(["images"])
    .with_output("output0", dense_output());
  let result = detect(engine, small_config(3), &wide_image()).unwrap();

  let dets = detections(&result);
  assert_eq!(dets.len(), 2);
  assert_eq!((dets[0].label, dets[0].score), (0, 0.9));
  assert_box(dets[0].bbox(), [48.0, 16.0, 80.0, 48.0]);
  assert_eq!((dets[1].label, dets[1].score), (1, 0.7));
  assert_box(dets[1].bbox(), [50.0, 16.0, 82.0, 48.0]);
}

#[test]
fn agnostic_nms_ignores_labels() {
  let engine = ReplayEngine::default().with_output("out0", dense_output());
  let config = small_config(3).with_agnostic_nms(true);
  let result = detect(engine, config, &wide_image()).unwrap();
  assert_eq!(result.len(), 1);
  assert_eq!(detections(&result)[0].score, 0.9);
}

/// 锚点在行、xyxy 格式的密集输出
fn topk_output() -> ArrayD<f32> {
  arr2(&[
    [0.0, 16.0, 32.0, 48.0, 0.3, 0.6, 0.1],
    [10.0, 20.0, 30.0, 40.0, 0.9, 0.2, 0.05],
    [0.0, 0.0, 4.0, 4.0, 0.1, 0.1, 0.1],
  ])
  .into_dyn()
}

#[test]
fn xyxy_output_uses_topk() {
  let engine = ReplayEngine::default().with_output("out0", topk_output());
  let config = small_config(3)
    .with_box_format(BoxFormat::XyXy)
    .with_max_det(3);
  let result = detect(engine, config, &wide_image()).unwrap();

  let dets = detections(&result);
  let picked: Vec<(usize, f32)> = dets.iter().map(|det| (det.label, det.score)).collect();
  assert_eq!(picked, vec![(0, 0.9), (1, 0.6), (0, 0.3)]);
  assert_box(dets[0].bbox(), [20.0, 8.0, 60.0, 48.0]);
  // 同一锚点的两个类别都会被选中
  assert_box(dets[1].bbox(), [0.0, 0.0, 64.0, 64.0]);
  assert_box(dets[2].bbox(), [0.0, 0.0, 64.0, 64.0]);
}

#[test]
fn topk_dedup_removes_same_anchor_duplicates() {
  let engine = ReplayEngine::default().with_output("out0", topk_output());
  let config = small_config(3)
    .with_box_format(BoxFormat::XyXy)
    .with_max_det(3)
    .with_topk_dedup(true)
    .with_agnostic_nms(true);
  let result = detect(engine, config, &wide_image()).unwrap();

  let picked: Vec<(usize, f32)> = result.iter().map(|det| (det.label, det.score)).collect();
  assert_eq!(picked, vec![(0, 0.9), (1, 0.6)]);
}

/// 单类别、单通道原型的分割输出：第一个检测系数为正，第二个为负
fn segmentation_rows() -> ArrayD<f32> {
  arr2(&[
    [16.0, 16.0, 48.0, 48.0, 0.9, 0.0, 1.0],
    [0.0, 16.0, 64.0, 48.0, 0.8, 0.0, -1.0],
  ])
  .insert_axis(Axis(0))
  .into_dyn()
}

fn segmentation_engine() -> ReplayEngine {
  let protos = Array4::<f32>::ones((1, 1, 16, 16)).into_dyn();
  ReplayEngine::default()
    .with_output("out0", segmentation_rows())
    .with_output("out1", protos)
}

/// 16x8 原图对应的单个端到端检测，原型全为正
fn small_image_engine(row: [f32; 7]) -> ReplayEngine {
  let rows = arr2(&[row]).insert_axis(Axis(0)).into_dyn();
  let protos = Array4::<f32>::ones((1, 1, 16, 16)).into_dyn();
  ReplayEngine::default()
    .with_output("out0", rows)
    .with_output("out1", protos)
}

fn segmentation_config() -> Config {
  Config::segmentation()
    .with_input_size(64, 64)
    .with_num_classes(1)
    .with_mask_dim(1)
}

#[test]
fn input_space_masks_follow_the_box() {
  let result = detect(segmentation_engine(), segmentation_config(), &wide_image()).unwrap();

  // 掩码为空的检测被丢弃
  let dets = detections(&result);
  assert_eq!(dets.len(), 1);
  assert_box(dets[0].bbox(), [32.0, 0.0, 96.0, 64.0]);

  let mask = dets[0].mask.as_ref().unwrap();
  assert_eq!((mask.width(), mask.height()), (128, 64));
  assert_eq!(mask.get(64, 32), Some(true));
  assert_eq!(mask.get(5, 5), Some(false));
  assert_eq!(mask.get(120, 60), Some(false));
  assert!(mask.area() > 0);
}

#[test]
fn retina_masks_are_cropped_in_original_space() {
  let config = segmentation_config().with_retina_masks(true);
  let result = detect(segmentation_engine(), config, &wide_image()).unwrap();

  let dets = detections(&result);
  assert_eq!(dets.len(), 1);
  let mask = dets[0].mask.as_ref().unwrap();
  assert_eq!((mask.width(), mask.height()), (128, 64));
  assert_eq!(mask.area(), 64 * 64);
  assert_eq!(mask.get(32, 0), Some(true));
  assert_eq!(mask.get(31, 0), Some(false));
  assert_eq!(mask.get(96, 10), Some(false));
}

#[test]
fn proto_channel_mismatch_is_reported() {
  let engine = segmentation_engine().with_output("out1", Array4::<f32>::ones((1, 2, 16, 16)).into_dyn());
  let result = detect(engine, segmentation_config(), &wide_image());
  assert!(matches!(result, Err(DecodeError::MalformedProto(_))));
}

#[test]
fn unscaled_letterbox_masks_cover_the_box() {
  // 16x8 原图不放大，居中放在 64x64 输入的 (24, 28) 处
  let image = RgbImage::new(16, 8);
  let row = [24.0, 28.0, 40.0, 36.0, 0.9, 0.0, 1.0];

  for retina in [false, true] {
    let config = segmentation_config()
      .with_letterbox(114, false, true)
      .with_retina_masks(retina);
    let result = detect(small_image_engine(row), config, &image).unwrap();

    let dets = detections(&result);
    assert_eq!(dets.len(), 1);
    assert_box(dets[0].bbox(), [0.0, 0.0, 16.0, 8.0]);
    let mask = dets[0].mask.as_ref().unwrap();
    assert_eq!((mask.width(), mask.height()), (16, 8));
    assert_eq!(mask.area(), 128, "retina = {}", retina);
  }
}

#[test]
fn top_left_letterbox_masks_cover_the_box() {
  // 不居中时 16x8 原图放大到 64x32 贴在左上角
  let image = RgbImage::new(16, 8);
  let row = [0.0, 0.0, 64.0, 32.0, 0.9, 0.0, 1.0];

  for retina in [false, true] {
    let config = segmentation_config()
      .with_letterbox(114, true, false)
      .with_retina_masks(retina);
    let result = detect(small_image_engine(row), config, &image).unwrap();

    let dets = detections(&result);
    assert_eq!(dets.len(), 1);
    assert_box(dets[0].bbox(), [0.0, 0.0, 16.0, 8.0]);
    assert_eq!(dets[0].mask.as_ref().unwrap().area(), 128, "retina = {}", retina);
  }
}

#[test]
fn maskless_output_skips_masks() {
  // 分割配置遇到不带掩码系数的输出时只做检测，也不需要原型
  let engine = ReplayEngine::default().with_output("out0", end2end_output());
  let config = segmentation_config().with_num_classes(3);
  let result = detect(engine, config, &wide_image()).unwrap();
  let dets = detections(&result);
  assert_eq!(dets.len(), 1);
  assert_eq!(dets[0].label, 2);
  assert_box(dets[0].bbox(), [16.0, 8.0, 48.0, 48.0]);
  assert!(dets[0].mask.is_none());

  let engine = ReplayEngine::default().with_output("out0", topk_output());
  let config = Config::segmentation()
    .with_input_size(64, 64)
    .with_num_classes(3)
    .with_box_format(BoxFormat::XyXy)
    .with_max_det(3);
  let result = detect(engine, config, &wide_image()).unwrap();
  let picked: Vec<(usize, f32)> = result.iter().map(|det| (det.label, det.score)).collect();
  assert_eq!(picked, vec![(0, 0.9), (1, 0.6)]);
  assert!(result.iter().all(|det| det.mask.is_none()));
}

#[test]
fn missing_proto_output_fails_extraction() {
  let engine = ReplayEngine::default().with_output("out0", segmentation_rows());
  let result = detect(engine, segmentation_config(), &wide_image());
  assert!(matches!(result, Err(DecodeError::ExtractionFailed { .. })));
}

#[test]
fn unknown_output_shape_is_unsupported() {
  let engine = ReplayEngine::default().with_output("out0", Array4::<f32>::zeros((1, 1, 5, 5)).into_dyn());
  let result = detect(engine, small_config(3), &wide_image());
  assert!(matches!(result, Err(DecodeError::UnsupportedLayout { .. })));
}

#[test]
fn extraction_failure_lists_tried_names() {
  let result = detect(ReplayEngine::default(), small_config(3), &wide_image());
  match result {
    Err(DecodeError::ExtractionFailed { names }) => {
      assert_eq!(names, vec!["out0", "output0", "output"]);
    }
    other => panic!("unexpected result: {:?}", other.map(|r| r.len())),
  }

  let engine = ReplayEngine::default()
    .with_input_names(["pixels"])
    .with_output("out0", end2end_output());
  match detect(engine, small_config(3), &wide_image()) {
    Err(DecodeError::ExtractionFailed { names }) => {
      assert_eq!(names, vec!["in0", "images", "data"]);
    }
    other => panic!("unexpected result: {:?}", other.map(|r| r.len())),
  }
}

/// 步长 8 的 8x8 网格，只有 (3, 3) 处类别 1 的 logit 为正
fn grid_tensors() -> (ArrayD<f32>, ArrayD<f32>) {
  let reg = Array4::<f32>::ones((1, 4, 8, 8));
  let mut cls = Array4::<f32>::from_elem((1, 2, 8, 8), -10.0);
  cls[[0, 1, 3, 3]] = 3.0;
  (reg.into_dyn(), cls.into_dyn())
}

fn grid_config() -> Config {
  small_config(2).with_grid_heads(vec![GridHead::new(8, "reg8", "cls8")])
}

#[test]
fn grid_heads_are_decoded() {
  let (reg, cls) = grid_tensors();
  let engine = ReplayEngine::default()
    .with_output("reg8", reg)
    .with_output("cls8", cls);
  let result = detect(engine, grid_config(), &RgbImage::new(64, 64)).unwrap();

  let dets = detections(&result);
  assert_eq!(dets.len(), 1);
  assert_eq!(dets[0].label, 1);
  assert!((dets[0].score - sigmoid(3.0)).abs() < 1e-6);
  assert_box(dets[0].bbox(), [20.0, 20.0, 36.0, 36.0]);
}

#[test]
fn swapped_grid_tensors_are_matched_by_channels() {
  let (reg, cls) = grid_tensors();
  let engine = ReplayEngine::default()
    .with_output("reg8", cls)
    .with_output("cls8", reg);
  let result = detect(engine, grid_config(), &RgbImage::new(64, 64)).unwrap();
  assert_eq!(result.len(), 1);
  assert_box(detections(&result)[0].bbox(), [20.0, 20.0, 36.0, 36.0]);
}

#[test]
fn incomplete_grid_heads_fall_back_to_single_output() {
  let (reg, _) = grid_tensors();
  let engine = ReplayEngine::default()
    .with_output("reg8", reg)
    .with_output("out0", end2end_output());
  let config = grid_config().with_num_classes(3);
  let result = detect(engine, config, &wide_image()).unwrap();
  assert_eq!(result.len(), 1);
  assert_eq!(detections(&result)[0].label, 2);
}

#[test]
fn build_validates_config_and_forwards_gpu_hint() {
  let result = Yolo26Builder::new(ReplayEngine::default())
    .config(small_config(0))
    .build();
  assert!(matches!(result, Err(DecodeError::InvalidInput(_))));

  let mut config = small_config(3);
  config.use_gpu = true;
  let model = Yolo26Builder::new(ReplayEngine::default())
    .config(config)
    .build()
    .unwrap();
  assert!(model.engine().use_gpu());
}

#[test]
fn empty_image_is_rejected() {
  let engine = ReplayEngine::default().with_output("out0", end2end_output());
  let result = detect(engine, small_config(3), &RgbImage::new(0, 0));
  assert!(matches!(result, Err(DecodeError::InvalidInput(_))));
}
