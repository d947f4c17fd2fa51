// 该文件是 Shanan （山南西风） 项目的一部分。
// src/labels.rs - 类别标签
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

/// COCO 数据集类别名称
pub const COCO_NAMES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

/// 越界类别的显示名称
pub const UNKNOWN_LABEL: &str = "unknown";

/// 按类别下标查表，越界时返回 `"unknown"`
pub fn label_name<'a>(names: &[&'a str], id: usize) -> &'a str {
  names.get(id).copied().unwrap_or(UNKNOWN_LABEL)
}

pub trait WithLabel: Sized + std::fmt::Debug {
  fn to_label_str(&self) -> String;
  fn to_label_id(&self) -> usize;
  fn from_label_id(id: usize) -> Self;
}

/// COCO 类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CocoLabel(pub usize);

impl WithLabel for CocoLabel {
  fn to_label_str(&self) -> String {
    label_name(&COCO_NAMES, self.0).to_string()
  }

  fn to_label_id(&self) -> usize {
    self.0
  }

  fn from_label_id(id: usize) -> Self {
    CocoLabel(id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn coco_names_lookup() {
    assert_eq!(label_name(&COCO_NAMES, 0), "person");
    assert_eq!(label_name(&COCO_NAMES, 79), "toothbrush");
    assert_eq!(label_name(&COCO_NAMES, 80), "unknown");
  }

  #[test]
  fn coco_label_round_trip() {
    let label = CocoLabel::from_label_id(2);
    assert_eq!(label.to_label_str(), "car");
    assert_eq!(label.to_label_id(), 2);
    assert_eq!(CocoLabel(1000).to_label_str(), "unknown");
  }
}
