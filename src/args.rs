// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/args.rs - 命令行参数
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use clap::Parser;

/// 瞭望：视频帧检测与推流
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 配置文件路径
  #[arg(long, value_name = "FILE", default_value = "config.json")]
  pub settings: PathBuf,

  /// 最大处理帧数，0 表示不限制
  #[arg(long, value_name = "FRAME_NUMBER", default_value_t = 0)]
  pub max_frames: usize,
}

impl Args {
  pub fn frame_limit(&self) -> Option<usize> {
    (self.max_frames > 0).then_some(self.max_frames)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_to_config_json_without_limit() {
    let args = Args::parse_from(["liaowang"]);
    assert_eq!(args.settings, PathBuf::from("config.json"));
    assert_eq!(args.frame_limit(), None);
  }

  #[test]
  fn max_frames_sets_limit() {
    let args = Args::parse_from(["liaowang", "--settings", "a.json", "--max-frames", "12"]);
    assert_eq!(args.settings, PathBuf::from("a.json"));
    assert_eq!(args.frame_limit(), Some(12));
  }
}
