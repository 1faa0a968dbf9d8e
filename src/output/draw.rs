// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/output/draw.rs - 检测结果标注
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use ab_glyph::{FontArc, PxScale};
use image::Rgb;
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};

use crate::{
  frame::Frame,
  model::{DetectedObject, decode::fix_rect},
  output::OutputError,
};

const LABEL_FONT_SIZE: f32 = 16.0;

/// 按类别编号循环使用的颜色：黄、绿、青、红
pub const PALETTE: [Rgb<u8>; 4] = [
  Rgb([255, 255, 0]),
  Rgb([0, 255, 0]),
  Rgb([0, 255, 255]),
  Rgb([255, 0, 0]),
];

/// 在帧上绘制检测框与类别名称
pub struct Annotator {
  font: FontArc,
  font_scale: PxScale,
}

impl Annotator {
  pub fn new() -> Result<Self, OutputError> {
    let font_data = include_bytes!("../../assets/DejaVuSans.ttf");
    let font =
      FontArc::try_from_slice(font_data).map_err(|e| OutputError::Font(e.to_string()))?;

    Ok(Annotator {
      font,
      font_scale: PxScale::from(LABEL_FONT_SIZE),
    })
  }

  pub fn color_for(class_id: usize) -> Rgb<u8> {
    PALETTE[class_id % PALETTE.len()]
  }

  /// 原地标注；检测框先裁剪到 `bounds` 之内
  pub fn annotate(&self, frame: &mut Frame, objects: &[DetectedObject], bounds: (u32, u32)) {
    let image = frame.image_mut();
    for object in objects {
      let color = Self::color_for(object.class_id);
      let rect = fix_rect(object.rect, bounds.0, bounds.1);

      // 端点包含在内，宽高各加一
      let width = rect.right - rect.left + 1;
      let height = rect.bottom - rect.top + 1;
      if width > 0 && height > 0 {
        let outline =
          imageproc::rect::Rect::at(rect.left, rect.top).of_size(width as u32, height as u32);
        draw_hollow_rect_mut(image, outline, color);
      }

      let text_y = (rect.top - LABEL_FONT_SIZE as i32).max(0);
      draw_text_mut(
        image,
        color,
        rect.left,
        text_y,
        self.font_scale,
        &self.font,
        &object.class_name,
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::Rect;
  use image::RgbImage;

  fn object(rect: Rect, class_id: usize) -> DetectedObject {
    DetectedObject {
      rect,
      class_id,
      class_name: "car".to_string(),
      confidence: 0.9,
    }
  }

  #[test]
  fn palette_wraps_by_class_id() {
    assert_eq!(Annotator::color_for(0), Rgb([255, 255, 0]));
    assert_eq!(Annotator::color_for(3), Rgb([255, 0, 0]));
    assert_eq!(Annotator::color_for(5), Rgb([0, 255, 0]));
  }

  #[test]
  fn outline_is_one_pixel_wide() {
    let annotator = Annotator::new().unwrap();
    let mut frame = Frame::from_image(RgbImage::new(100, 100));
    annotator.annotate(&mut frame, &[object(Rect::new(20, 40, 60, 80), 2)], (100, 100));

    let image = frame.image();
    let cyan = Rgb([0, 255, 255]);
    assert_eq!(image.get_pixel(20, 60), &cyan);
    assert_eq!(image.get_pixel(60, 60), &cyan);
    assert_eq!(image.get_pixel(40, 80), &cyan);
    assert_eq!(image.get_pixel(21, 60), &Rgb([0, 0, 0]));
    assert_eq!(image.get_pixel(40, 60), &Rgb([0, 0, 0]));
  }

  #[test]
  fn boxes_are_clipped_before_drawing() {
    let annotator = Annotator::new().unwrap();
    let mut frame = Frame::from_image(RgbImage::new(50, 40));
    annotator.annotate(&mut frame, &[object(Rect::new(-30, -30, 500, 500), 3)], (50, 40));

    let image = frame.image();
    assert_eq!(image.get_pixel(49, 20), &Rgb([255, 0, 0]));
    assert_eq!(image.get_pixel(25, 39), &Rgb([255, 0, 0]));
  }

  #[test]
  fn class_name_is_drawn_above_the_box() {
    let annotator = Annotator::new().unwrap();
    let mut frame = Frame::from_image(RgbImage::new(120, 80));
    annotator.annotate(&mut frame, &[object(Rect::new(10, 40, 110, 70), 0)], (120, 80));

    let image = frame.image();
    let label_pixels = (10..110)
      .flat_map(|x| (24..40).map(move |y| (x, y)))
      .filter(|&(x, y)| image.get_pixel(x, y).0 != [0, 0, 0])
      .count();
    assert!(label_pixels > 0);
  }

  #[test]
  fn nothing_drawn_without_objects() {
    let annotator = Annotator::new().unwrap();
    let mut frame = Frame::from_image(RgbImage::new(10, 10));
    annotator.annotate(&mut frame, &[], (10, 10));
    assert!(frame.as_raw().iter().all(|&b| b == 0));
  }
}
