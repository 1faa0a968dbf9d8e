// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/input/ffmpeg_decoder.rs - FFmpeg H.264 码流解码
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use ffmpeg_next as ffmpeg;
use ffmpeg::software::scaling;
use ffmpeg::util::format::pixel::Pixel;
use tracing::{debug, info};

use crate::{
  frame::Frame,
  input::{InputError, StreamDecoder},
};

fn ffmpeg_error(context: &str, e: ffmpeg::Error) -> InputError {
  InputError::Decode(format!("{}: {}", context, e))
}

/// 有状态的 H.264 解码器，输出 RGB 帧
pub struct FfmpegStreamDecoder {
  decoder: ffmpeg::decoder::Video,
  scaler: Option<Scaler>,
  decoded: ffmpeg::frame::Video,
  rgb: ffmpeg::frame::Video,
}

struct Scaler {
  context: scaling::context::Context,
  format: Pixel,
  width: u32,
  height: u32,
}

impl FfmpegStreamDecoder {
  pub fn h264() -> Result<Self, InputError> {
    ffmpeg::init().map_err(|e| ffmpeg_error("初始化 ffmpeg 失败", e))?;
    let codec = ffmpeg::decoder::find(ffmpeg::codec::Id::H264)
      .ok_or_else(|| InputError::Decode("找不到 H.264 解码器".to_string()))?;
    let decoder = ffmpeg::codec::context::Context::new()
      .decoder()
      .open_as(codec)
      .map_err(|e| ffmpeg_error("打开解码器失败", e))?
      .video()
      .map_err(|e| ffmpeg_error("解码器不是视频解码器", e))?;
    info!("H.264 解码器就绪");

    Ok(FfmpegStreamDecoder {
      decoder,
      scaler: None,
      decoded: ffmpeg::frame::Video::empty(),
      rgb: ffmpeg::frame::Video::empty(),
    })
  }
}

impl StreamDecoder for FfmpegStreamDecoder {
  fn decode(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, InputError> {
    let packet = ffmpeg::Packet::copy(bytes);
    self
      .decoder
      .send_packet(&packet)
      .map_err(|e| ffmpeg_error("送入码流失败", e))?;

    let mut frames = Vec::new();
    while self.decoder.receive_frame(&mut self.decoded).is_ok() {
      let scaler = prepare_scaler(&mut self.scaler, &self.decoded)?;
      scaler
        .run(&self.decoded, &mut self.rgb)
        .map_err(|e| ffmpeg_error("像素格式转换失败", e))?;
      frames.push(rgb_to_frame(&self.rgb)?);
    }
    Ok(frames)
  }
}

/// 按解码帧的格式与尺寸准备转换器，变化时重建
fn prepare_scaler<'a>(
  slot: &'a mut Option<Scaler>,
  decoded: &ffmpeg::frame::Video,
) -> Result<&'a mut scaling::context::Context, InputError> {
  let (format, width, height) = (decoded.format(), decoded.width(), decoded.height());
  let stale = !matches!(
    slot,
    Some(s) if s.format == format && s.width == width && s.height == height
  );
  if stale {
    debug!("创建像素格式转换器 {:?} {}x{}", format, width, height);
    let context = scaling::context::Context::get(
      format,
      width,
      height,
      Pixel::RGB24,
      width,
      height,
      scaling::flag::Flags::BILINEAR,
    )
    .map_err(|e| ffmpeg_error("创建像素格式转换器失败", e))?;
    *slot = Some(Scaler {
      context,
      format,
      width,
      height,
    });
  }
  slot
    .as_mut()
    .map(|s| &mut s.context)
    .ok_or_else(|| InputError::Decode("像素格式转换器不可用".to_string()))
}

fn rgb_to_frame(frame: &ffmpeg::frame::Video) -> Result<Frame, InputError> {
  let width = frame.width();
  let height = frame.height();
  let row_bytes = width as usize * 3;
  let stride = frame.stride(0);
  let data = frame.data(0);

  let mut pixels = Vec::with_capacity(row_bytes * height as usize);
  for row in 0..height as usize {
    let start = row * stride;
    let line = data
      .get(start..start + row_bytes)
      .ok_or_else(|| InputError::Decode("解码帧数据越界".to_string()))?;
    pixels.extend_from_slice(line);
  }
  Ok(Frame::from_rgb(width, height, pixels)?)
}
