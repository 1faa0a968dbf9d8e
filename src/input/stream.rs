// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/input/stream.rs - UDP 压缩视频流输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # UDP 视频流输入
//!
//! 每个数据报前 72 字节为传输头，其后是压缩视频码流片段。
//! 短于传输头的数据报视为暂无数据；解码失败或未解码出帧都不是致命错误，
//! 只有套接字读取失败会终止输入。

use std::{
  io::ErrorKind,
  net::{SocketAddr, UdpSocket},
  time::Duration,
};

use tracing::{debug, info, warn};

use super::{Acquired, FrameSource, InputError, RetryReason, StreamDecoder};
use crate::frame::Frame;

/// 接收缓冲大小
pub const DATAGRAM_SIZE: usize = 1514;
/// 传输头长度
pub const MIN_PAYLOAD_LEN: usize = 72;

pub struct UdpStreamInput<D> {
  socket: UdpSocket,
  decoder: D,
  buf: Vec<u8>,
}

impl<D: StreamDecoder> UdpStreamInput<D> {
  /// 绑定本地地址；`read_timeout_ms` 为 0 时阻塞读取
  pub fn bind(
    address: &str,
    port: u16,
    read_timeout_ms: u64,
    decoder: D,
  ) -> Result<Self, InputError> {
    let addr = format!("{}:{}", address, port);
    let socket = UdpSocket::bind(&addr).map_err(|source| InputError::Bind {
      addr: addr.clone(),
      source,
    })?;
    if read_timeout_ms > 0 {
      socket
        .set_read_timeout(Some(Duration::from_millis(read_timeout_ms)))
        .map_err(InputError::Socket)?;
    }
    info!("UDP 视频流监听于 {}", addr);
    Ok(Self::from_socket(socket, decoder))
  }

  pub fn from_socket(socket: UdpSocket, decoder: D) -> Self {
    UdpStreamInput {
      socket,
      decoder,
      buf: vec![0u8; DATAGRAM_SIZE],
    }
  }

  pub fn local_addr(&self) -> Result<SocketAddr, InputError> {
    self.socket.local_addr().map_err(InputError::Socket)
  }

  pub fn decoder(&self) -> &D {
    &self.decoder
  }
}

impl<D: StreamDecoder> FrameSource for UdpStreamInput<D> {
  fn acquire(&mut self, raw: &mut Frame) -> Result<Acquired, InputError> {
    let n = match self.socket.recv(&mut self.buf) {
      Ok(n) => n,
      Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
        return Ok(Acquired::Retry(RetryReason::Timeout));
      }
      Err(e) => return Err(InputError::Socket(e)),
    };

    if n < MIN_PAYLOAD_LEN {
      return Ok(Acquired::Retry(RetryReason::ShortPayload(n)));
    }

    let frames = match self.decoder.decode(&self.buf[MIN_PAYLOAD_LEN..n]) {
      Ok(frames) => frames,
      Err(e) => {
        warn!("解码视频流失败: {}", e);
        return Ok(Acquired::Retry(RetryReason::DecodeFailed));
      }
    };

    let Some(first) = frames.first() else {
      return Ok(Acquired::Retry(RetryReason::NoFrameDecoded));
    };
    if frames.len() > 1 {
      debug!("一次解码得到 {} 帧，仅使用第一帧", frames.len());
    }

    raw.overwrite(first.width(), first.height(), first.as_raw())?;
    Ok(Acquired::Frame)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Default)]
  struct RecordingDecoder {
    calls: Vec<usize>,
    fail: bool,
    frames: usize,
  }

  impl StreamDecoder for RecordingDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, InputError> {
      self.calls.push(bytes.len());
      if self.fail {
        return Err(InputError::Decode("损坏的码流".to_string()));
      }
      Ok(
        (0..self.frames)
          .map(|i| Frame::from_rgb(2, 1, vec![i as u8; 6]))
          .collect::<Result<_, _>>()?,
      )
    }
  }

  fn input_with(decoder: RecordingDecoder) -> (UdpStreamInput<RecordingDecoder>, UdpSocket) {
    let input = UdpStreamInput::bind("127.0.0.1", 0, 500, decoder).unwrap();
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.connect(input.local_addr().unwrap()).unwrap();
    (input, sender)
  }

  #[test]
  fn short_datagram_never_reaches_decoder() {
    let (mut input, sender) = input_with(RecordingDecoder {
      frames: 1,
      ..Default::default()
    });
    sender.send(&[0u8; 50]).unwrap();

    let mut raw = Frame::empty();
    assert_eq!(
      input.acquire(&mut raw).unwrap(),
      Acquired::Retry(RetryReason::ShortPayload(50))
    );
    assert!(input.decoder().calls.is_empty());
    assert!(raw.is_empty());
  }

  #[test]
  fn header_is_stripped_and_first_frame_used() {
    let (mut input, sender) = input_with(RecordingDecoder {
      frames: 3,
      ..Default::default()
    });
    sender.send(&[7u8; 100]).unwrap();

    let mut raw = Frame::empty();
    assert_eq!(input.acquire(&mut raw).unwrap(), Acquired::Frame);
    assert_eq!(input.decoder().calls, vec![100 - MIN_PAYLOAD_LEN]);
    assert_eq!((raw.width(), raw.height()), (2, 1));
    assert_eq!(raw.as_raw(), &[0u8; 6]);
  }

  #[test]
  fn decode_miss_and_failure_are_retried() {
    let (mut input, sender) = input_with(RecordingDecoder::default());
    sender.send(&[1u8; MIN_PAYLOAD_LEN]).unwrap();
    let mut raw = Frame::empty();
    assert_eq!(
      input.acquire(&mut raw).unwrap(),
      Acquired::Retry(RetryReason::NoFrameDecoded)
    );
    assert_eq!(input.decoder().calls, vec![0]);

    let (mut input, sender) = input_with(RecordingDecoder {
      fail: true,
      ..Default::default()
    });
    sender.send(&[1u8; 200]).unwrap();
    assert_eq!(
      input.acquire(&mut raw).unwrap(),
      Acquired::Retry(RetryReason::DecodeFailed)
    );
  }

  #[test]
  fn idle_socket_times_out() {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
      .set_read_timeout(Some(Duration::from_millis(20)))
      .unwrap();
    let mut input = UdpStreamInput::from_socket(socket, RecordingDecoder::default());
    let mut raw = Frame::empty();
    assert_eq!(
      input.acquire(&mut raw).unwrap(),
      Acquired::Retry(RetryReason::Timeout)
    );
  }
}
