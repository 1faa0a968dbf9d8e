// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/model/decode.rs - 检测输出解码与非极大值抑制
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use tracing::{debug, warn};

use crate::model::{DetectedObject, OutputTensor, Rect};

/// 类别分数在每行中的起始位置，前面依次是 cx, cy, w, h, objectness
pub const SCORES_OFFSET: usize = 5;

/// 将各检测头的输出解码为去重后的检测结果
///
/// 置信度必须严格大于 `conf_threshold`，类别名称必须在 `class_filter` 中。
/// 所有检测头的候选框合并后做一次不区分类别的 NMS，结果按 NMS 顺序返回。
pub fn decode(
  tensors: &[OutputTensor],
  conf_threshold: f32,
  nms_threshold: f32,
  frame_width: u32,
  frame_height: u32,
  class_names: &[String],
  class_filter: &[String],
) -> Vec<DetectedObject> {
  let mut candidates = Vec::new();

  for (head, tensor) in tensors.iter().enumerate() {
    debug!("检测头 {}: {} 行 x {} 列", head, tensor.len_rows(), tensor.cols());
    for row in tensor.rows() {
      let scores = row.get(SCORES_OFFSET..).unwrap_or(&[]);
      let (class_id, confidence) = best_class(scores);
      if confidence <= conf_threshold {
        continue;
      }

      let Some(class_name) = class_names.get(class_id) else {
        warn!("类别编号 {} 超出类别列表范围 ({})", class_id, class_names.len());
        continue;
      };
      if !class_filter.iter().any(|c| c == class_name) {
        continue;
      }

      let Some(rect) = bounding_box(row, frame_width, frame_height) else {
        warn!("检测框参数不是有限值，跳过: {:?}", &row[..row.len().min(4)]);
        continue;
      };
      candidates.push(DetectedObject {
        rect,
        class_id,
        class_name: class_name.clone(),
        confidence,
      });
    }
  }

  debug!("NMS 前候选框数量: {}", candidates.len());
  nms(candidates, nms_threshold)
}

/// 最高分类别，分数相同时取编号最小者
fn best_class(scores: &[f32]) -> (usize, f32) {
  let mut best = (0, 0.0f32);
  for (idx, &score) in scores.iter().enumerate() {
    if score > best.1 {
      best = (idx, score);
    }
  }
  best
}

/// 像素坐标的绝对值上限，保证后续加减不会溢出
const COORD_LIMIT: f32 = (1 << 29) as f32;

fn to_pixels(fraction: f32, scale: f32) -> i32 {
  (fraction * scale).round().clamp(-COORD_LIMIT, COORD_LIMIT) as i32
}

/// 由中心点与宽高（占帧尺寸的比例）计算像素矩形；参数含非有限值时返回 None
fn bounding_box(row: &[f32], frame_width: u32, frame_height: u32) -> Option<Rect> {
  if row.len() < 4 {
    return Some(Rect::default());
  }
  if !row[..4].iter().all(|v| v.is_finite()) {
    return None;
  }

  let (fw, fh) = (frame_width as f32, frame_height as f32);
  let center_x = to_pixels(row[0], fw);
  let center_y = to_pixels(row[1], fh);
  let width = to_pixels(row[2], fw);
  let height = to_pixels(row[3], fh);

  let left = center_x - width / 2;
  let top = center_y - height / 2;
  Some(Rect::new(left, top, left + width, top + height))
}

/// 交并比
pub fn iou(a: &Rect, b: &Rect) -> f32 {
  let overlap = Rect::new(
    a.left.max(b.left),
    a.top.max(b.top),
    a.right.min(b.right),
    a.bottom.min(b.bottom),
  );
  let intersection = area(&overlap);
  let union = area(a) + area(b) - intersection;

  if union > 0.0 {
    (intersection / union) as f32
  } else {
    0.0
  }
}

fn area(rect: &Rect) -> f64 {
  let w = (rect.right as f64 - rect.left as f64).max(0.0);
  let h = (rect.bottom as f64 - rect.top as f64).max(0.0);
  w * h
}

/// 贪心非极大值抑制，不区分类别
///
/// 按置信度降序（稳定排序）逐个检查，与任一已保留框的 IoU 超过阈值即被抑制。
pub fn nms(mut candidates: Vec<DetectedObject>, threshold: f32) -> Vec<DetectedObject> {
  candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

  let mut kept = vec![false; candidates.len()];
  for i in 0..candidates.len() {
    let suppressed = (0..i)
      .filter(|&j| kept[j])
      .any(|j| iou(&candidates[i].rect, &candidates[j].rect) > threshold);
    kept[i] = !suppressed;
  }

  candidates
    .into_iter()
    .zip(kept)
    .filter_map(|(object, keep)| keep.then_some(object))
    .collect()
}

/// 将矩形限制在 max_width x max_height 的画面之内
pub fn fix_rect(rect: Rect, max_width: u32, max_height: u32) -> Rect {
  let max_x = max_width as i32 - 1;
  let max_y = max_height as i32 - 1;
  Rect {
    left: rect.left.max(0),
    top: rect.top.max(0),
    right: rect.right.min(max_x),
    bottom: rect.bottom.min(max_y),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn names() -> Vec<String> {
    ["person", "bicycle", "car", "motorbike", "aeroplane"]
      .map(String::from)
      .to_vec()
  }

  fn object(rect: Rect, class_id: usize, confidence: f32) -> DetectedObject {
    DetectedObject {
      rect,
      class_id,
      class_name: names()[class_id].clone(),
      confidence,
    }
  }

  #[test]
  fn single_row_decodes_to_pixel_box() {
    let row = vec![0.5, 0.5, 0.2, 0.4, 0.7, 0.0, 0.0, 0.0, 0.9, 0.0];
    let tensor = OutputTensor::new(row.len(), row);
    let filter = vec!["motorbike".to_string()];

    let objects = decode(&[tensor], 0.5, 0.4, 640, 480, &names(), &filter);
    assert_eq!(objects.len(), 1);
    let object = &objects[0];
    assert_eq!(object.class_id, 3);
    assert_eq!(object.class_name, "motorbike");
    assert_eq!(object.confidence, 0.9);
    assert_eq!(object.rect, Rect::new(256, 144, 384, 336));
  }

  #[test]
  fn confidence_must_exceed_threshold() {
    let rows = vec![
      0.5, 0.5, 0.1, 0.1, 1.0, 0.5, 0.0, 0.0, 0.0, 0.0, //
      0.2, 0.2, 0.1, 0.1, 1.0, 0.51, 0.0, 0.0, 0.0, 0.0,
    ];
    let tensor = OutputTensor::new(10, rows);
    let filter = vec!["person".to_string()];

    let objects = decode(&[tensor], 0.5, 0.4, 100, 100, &names(), &filter);
    assert_eq!(objects.len(), 1);
    assert!(objects.iter().all(|o| o.confidence > 0.5));
  }

  #[test]
  fn classes_outside_filter_are_dropped() {
    let row = vec![0.5, 0.5, 0.1, 0.1, 1.0, 0.0, 0.0, 0.95, 0.0, 0.0];
    let tensor = OutputTensor::new(10, row);
    let filter = vec!["person".to_string()];
    assert!(decode(&[tensor], 0.5, 0.4, 100, 100, &names(), &filter).is_empty());
  }

  #[test]
  fn class_ties_resolve_to_lowest_index() {
    assert_eq!(best_class(&[0.3, 0.8, 0.8, 0.1]), (1, 0.8));
    assert_eq!(best_class(&[]), (0, 0.0));
  }

  #[test]
  fn class_id_beyond_names_is_skipped() {
    let row = vec![0.5, 0.5, 0.1, 0.1, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.99];
    let tensor = OutputTensor::new(11, row);
    let filter = names();
    assert!(decode(&[tensor], 0.5, 0.4, 100, 100, &names(), &filter).is_empty());
  }

  #[test]
  fn short_row_yields_zero_box() {
    assert_eq!(bounding_box(&[0.5, 0.5, 0.2], 640, 480), Some(Rect::default()));
  }

  #[test]
  fn overlapping_boxes_keep_most_confident() {
    let a = Rect::new(0, 0, 100, 100);
    let b = Rect::new(10, 10, 110, 110);
    assert!(iou(&a, &b) > 0.6);

    let kept = nms(vec![object(b, 0, 0.6), object(a, 0, 0.9)], 0.4);
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].confidence, 0.9);
    assert_eq!(kept[0].rect, a);
  }

  #[test]
  fn suppression_crosses_classes() {
    let a = Rect::new(0, 0, 100, 100);
    let b = Rect::new(10, 10, 110, 110);
    let kept = nms(vec![object(a, 0, 0.9), object(b, 2, 0.6)], 0.4);
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].class_id, 0);
  }

  #[test]
  fn suppressed_box_does_not_suppress_others() {
    // b 被 a 抑制，c 与 b 重叠但与 a 不重叠，应保留
    let a = Rect::new(0, 0, 100, 100);
    let b = Rect::new(50, 0, 150, 100);
    let c = Rect::new(100, 0, 200, 100);
    let kept = nms(
      vec![object(a, 0, 0.9), object(b, 0, 0.8), object(c, 0, 0.7)],
      0.3,
    );
    let confidences: Vec<f32> = kept.iter().map(|o| o.confidence).collect();
    assert_eq!(confidences, vec![0.9, 0.7]);
  }

  #[test]
  fn boxes_from_all_heads_are_pooled() {
    let filter = names();
    let head_a = OutputTensor::new(10, vec![0.5, 0.5, 0.5, 0.5, 1.0, 0.7, 0.0, 0.0, 0.0, 0.0]);
    let head_b = OutputTensor::new(10, vec![0.5, 0.5, 0.5, 0.5, 1.0, 0.0, 0.8, 0.0, 0.0, 0.0]);
    let objects = decode(&[head_a, head_b], 0.5, 0.4, 200, 200, &names(), &filter);
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].class_name, "bicycle");
  }

  #[test]
  fn kept_boxes_never_overlap_beyond_threshold() {
    // 线性同余生成器，保证测试可复现
    let mut seed = 0x2545_f491u32;
    let mut next = move || {
      seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
      (seed >> 8) as f32 / (1u32 << 24) as f32
    };

    for _ in 0..20 {
      let mut rows = Vec::new();
      for _ in 0..40 {
        rows.extend([next(), next(), next() * 0.5, next() * 0.5, 1.0]);
        rows.extend((0..5).map(|_| next()));
      }
      let tensor = OutputTensor::new(10, rows);
      let threshold = 0.3 + next() * 0.4;
      let objects = decode(&[tensor], 0.2, threshold, 320, 240, &names(), &names());

      for (i, a) in objects.iter().enumerate() {
        assert!(a.confidence > 0.2);
        for b in objects.iter().skip(i + 1) {
          if a.confidence != b.confidence {
            assert!(iou(&a.rect, &b.rect) <= threshold);
          }
        }
      }
      assert!(objects.windows(2).all(|w| w[0].confidence >= w[1].confidence));
    }
  }

  #[test]
  fn fix_rect_clamps_to_frame() {
    let rect = Rect::new(-5, -1, 700, 500);
    assert_eq!(fix_rect(rect, 640, 480), Rect::new(0, 0, 639, 479));
    let inside = Rect::new(10, 20, 30, 40);
    assert_eq!(fix_rect(inside, 640, 480), inside);
  }

  #[test]
  fn fix_rect_is_idempotent() {
    for rect in [
      Rect::new(-10, -10, 2000, 2000),
      Rect::new(5, 5, 10, 10),
      Rect::new(639, 479, 640, 480),
    ] {
      let once = fix_rect(rect, 640, 480);
      assert_eq!(fix_rect(once, 640, 480), once);
    }
  }

  #[test]
  fn non_finite_box_rows_are_skipped() {
    let rows = vec![
      f32::INFINITY, 0.5, f32::INFINITY, 0.1, 1.0, 0.0, 0.0, 0.0, 0.9, 0.0, //
      0.5, f32::NAN, 0.1, 0.1, 1.0, 0.0, 0.0, 0.0, 0.9, 0.0, //
      0.5, 0.5, 0.1, 0.1, 1.0, 0.0, 0.0, 0.0, 0.8, 0.0,
    ];
    let filter = vec!["motorbike".to_string()];
    let objects = decode(&[OutputTensor::new(10, rows)], 0.5, 0.4, 640, 480, &names(), &filter);
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].confidence, 0.8);
  }

  #[test]
  fn huge_finite_values_are_bounded() {
    let rect = bounding_box(&[f32::MAX, -f32::MAX, f32::MAX, f32::MAX], 640, 480).unwrap();
    assert!(rect.left <= rect.right && rect.top <= rect.bottom);

    let extreme = Rect::new(i32::MIN, i32::MIN, i32::MAX, i32::MAX);
    assert_eq!(iou(&extreme, &extreme), 1.0);
    assert!(extreme.width() > 0 && extreme.area() > 0);
    let clipped = fix_rect(extreme, 640, 480);
    assert_eq!(clipped, Rect::new(0, 0, 639, 479));
  }
}
