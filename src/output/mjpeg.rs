// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/output/mjpeg.rs - MJPEG HTTP 推流
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # MJPEG 推流
//!
//! HTTP 服务运行在独立线程上，处理循环只通过单槽广播交付最新的 JPEG 帧。
//! 每个观看者在 `/` 上得到 `multipart/x-mixed-replace` 流，
//! 连接较慢的观看者会跳过中间帧。

use std::{sync::mpsc, thread::JoinHandle};

use actix_web::{
  App, HttpRequest, HttpResponse, HttpServer,
  http::header,
  web::{self, Bytes},
};
use async_stream::stream;
use tokio::sync::{oneshot, watch};
use tracing::{error, info};

use crate::output::{OutputError, Publisher};

type LatestFrame = watch::Receiver<Option<Bytes>>;

/// MJPEG 推流服务句柄，释放时停止服务
pub struct MjpegPublisher {
  latest: Option<watch::Sender<Option<Bytes>>>,
  shutdown: Option<oneshot::Sender<()>>,
  handle: Option<JoinHandle<()>>,
  port: u16,
}

impl MjpegPublisher {
  /// 在 0.0.0.0:`port` 上启动服务，端口绑定失败时返回错误
  pub fn start(port: u16) -> Result<Self, OutputError> {
    let (latest_tx, latest_rx) = watch::channel::<Option<Bytes>>(None);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = mpsc::channel::<std::io::Result<u16>>();

    let handle = std::thread::Builder::new()
      .name("mjpeg-publisher".into())
      .spawn(move || {
        let result = actix_web::rt::System::new().block_on(async move {
          let server = HttpServer::new(move || {
            App::new()
              .app_data(web::Data::new(latest_rx.clone()))
              .route("/", web::get().to(stream_handler))
          })
          .workers(1)
          // 退出信号统一由处理循环的 ctrlc 处理，服务只随 stop 关闭
          .disable_signals()
          .bind(("0.0.0.0", port));

          let server = match server {
            Ok(server) => server,
            Err(e) => {
              let _ = ready_tx.send(Err(e));
              return Ok(());
            }
          };
          let bound = server.addrs().first().map(|a| a.port()).unwrap_or(port);
          let server = server.run();
          let _ = ready_tx.send(Ok(bound));

          let srv_handle = server.handle();
          actix_web::rt::spawn(async move {
            let _ = shutdown_rx.await;
            srv_handle.stop(true).await;
          });

          server.await
        });
        if let Err(e) = result {
          error!("MJPEG 服务错误: {}", e);
        }
      })
      .map_err(|e| OutputError::Server(e.to_string()))?;

    let port = match ready_rx.recv() {
      Ok(Ok(bound)) => bound,
      Ok(Err(source)) => {
        let _ = handle.join();
        return Err(OutputError::Bind { port, source });
      }
      Err(_) => {
        let _ = handle.join();
        return Err(OutputError::Server("服务线程意外退出".to_string()));
      }
    };
    info!("MJPEG 推流地址: http://0.0.0.0:{}/", port);

    Ok(MjpegPublisher {
      latest: Some(latest_tx),
      shutdown: Some(shutdown_tx),
      handle: Some(handle),
      port,
    })
  }

  /// 实际监听的端口
  pub fn port(&self) -> u16 {
    self.port
  }

  /// 停止服务并等待线程退出
  pub fn stop(&mut self) {
    // 先关闭广播，使所有观看者的流结束
    self.latest.take();
    if let Some(tx) = self.shutdown.take() {
      let _ = tx.send(());
    }
    if let Some(handle) = self.handle.take() {
      if handle.join().is_err() {
        error!("MJPEG 服务线程异常退出");
      }
      info!("MJPEG 推流已停止");
    }
  }
}

impl Drop for MjpegPublisher {
  fn drop(&mut self) {
    self.stop();
  }
}

impl Publisher for MjpegPublisher {
  fn publish(&self, jpeg: Vec<u8>) {
    if let Some(latest) = &self.latest {
      latest.send_replace(Some(Bytes::from(jpeg)));
    }
  }
}

fn multipart_chunk(jpeg: &[u8]) -> Bytes {
  let mut payload = Vec::with_capacity(jpeg.len() + 96);
  payload.extend_from_slice(b"--frame\r\n");
  payload.extend_from_slice(b"Content-Type: image/jpeg\r\n");
  payload.extend_from_slice(format!("Content-Length: {}\r\n\r\n", jpeg.len()).as_bytes());
  payload.extend_from_slice(jpeg);
  payload.extend_from_slice(b"\r\n");
  Bytes::from(payload)
}

async fn stream_handler(req: HttpRequest, latest: web::Data<LatestFrame>) -> HttpResponse {
  let mut rx = latest.get_ref().clone();
  let stream = stream! {
    loop {
      let frame = rx.borrow_and_update().clone();
      if let Some(jpeg) = frame {
        yield Ok::<Bytes, actix_web::Error>(multipart_chunk(&jpeg));
      }
      if rx.changed().await.is_err() {
        break;
      }
    }
  };

  // 允许任意来源并携带凭据：回显请求的 Origin
  let origin = req
    .headers()
    .get(header::ORIGIN)
    .and_then(|v| v.to_str().ok())
    .unwrap_or("*")
    .to_string();

  HttpResponse::Ok()
    .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, origin))
    .insert_header((header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true"))
    .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
    .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
    .insert_header((header::VARY, "Origin"))
    .append_header(("Cache-Control", "no-cache"))
    .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
    .streaming(stream)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{
    io::{Read, Write},
    net::TcpStream,
    time::{Duration, Instant},
  };

  fn read_until(stream: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while Instant::now() < deadline {
      match stream.read(&mut buf) {
        Ok(0) => break,
        Ok(n) => {
          received.extend_from_slice(&buf[..n]);
          if received.windows(needle.len()).any(|w| w == needle) {
            break;
          }
        }
        Err(_) => continue,
      }
    }
    received
  }

  #[test]
  fn chunk_has_boundary_and_headers() {
    let chunk = multipart_chunk(b"JPEG");
    assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n"));
    assert!(chunk.ends_with(b"\r\n\r\nJPEG\r\n"));
  }

  #[test]
  fn viewer_receives_latest_frame_with_cors() {
    let publisher = MjpegPublisher::start(0).unwrap();
    publisher.publish(b"first-frame".to_vec());
    publisher.publish(b"latest-frame".to_vec());

    let mut stream = TcpStream::connect(("127.0.0.1", publisher.port())).unwrap();
    stream
      .set_read_timeout(Some(Duration::from_millis(200)))
      .unwrap();
    stream
      .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nOrigin: http://viewer.local\r\n\r\n")
      .unwrap();

    let received = String::from_utf8_lossy(&read_until(&mut stream, b"latest-frame")).to_string();
    assert!(received.contains("multipart/x-mixed-replace; boundary=frame"));
    assert!(received.to_ascii_lowercase().contains("access-control-allow-origin: http://viewer.local"));
    assert!(received.to_ascii_lowercase().contains("access-control-allow-credentials: true"));
    assert!(received.contains("latest-frame"));
    assert!(!received.contains("first-frame"));
  }

  fn connect_and_read(port: u16, needle: &[u8]) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
      .set_read_timeout(Some(Duration::from_millis(200)))
      .unwrap();
    stream
      .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
      .unwrap();
    String::from_utf8_lossy(&read_until(&mut stream, needle)).to_string()
  }

  #[cfg(unix)]
  #[test]
  fn server_keeps_running_after_sigterm() {
    let publisher = MjpegPublisher::start(0).unwrap();
    publisher.publish(b"before-signal".to_vec());
    assert!(connect_and_read(publisher.port(), b"before-signal").contains("before-signal"));

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
      let _ = tx.send(());
    })
    .unwrap();
    let status = std::process::Command::new("kill")
      .args(["-TERM", &std::process::id().to_string()])
      .status()
      .unwrap();
    assert!(status.success());
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    std::thread::sleep(Duration::from_millis(500));

    publisher.publish(b"after-signal".to_vec());
    assert!(connect_and_read(publisher.port(), b"after-signal").contains("after-signal"));
  }

  #[test]
  fn occupied_port_is_reported() {
    let listener = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    assert!(matches!(
      MjpegPublisher::start(port),
      Err(OutputError::Bind { .. })
    ));
  }
}
