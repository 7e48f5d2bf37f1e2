// 该文件是 Biaoqing （表情） 项目的一部分。
// src/gradcam/colormap.rs - jet 伪彩色查找表
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

use image::Rgb;

const LEVELS: usize = 256;

// (位置, 取值) 锚点，锚点之间线性插值：低值为蓝，高值为红
const JET_RED: &[(f32, f32)] = &[(0.0, 0.0), (0.35, 0.0), (0.66, 1.0), (0.89, 1.0), (1.0, 0.5)];
const JET_GREEN: &[(f32, f32)] = &[
  (0.0, 0.0),
  (0.125, 0.0),
  (0.375, 1.0),
  (0.64, 1.0),
  (0.91, 0.0),
  (1.0, 0.0),
];
const JET_BLUE: &[(f32, f32)] = &[(0.0, 0.5), (0.11, 1.0), (0.34, 1.0), (0.65, 0.0), (1.0, 0.0)];

/// 256 级颜色查找表，输出 RGB 分量位于 [0, 1]
#[derive(Debug, Clone)]
pub struct Colormap {
  table: [[f32; 3]; LEVELS],
}

impl Default for Colormap {
  fn default() -> Self {
    Self::jet()
  }
}

impl Colormap {
  pub fn jet() -> Self {
    let mut table = [[0.0; 3]; LEVELS];
    for (i, entry) in table.iter_mut().enumerate() {
      let x = i as f32 / (LEVELS - 1) as f32;
      *entry = [
        interpolate(JET_RED, x),
        interpolate(JET_GREEN, x),
        interpolate(JET_BLUE, x),
      ];
    }
    Self { table }
  }

  pub fn color(&self, level: u8) -> Rgb<f32> {
    Rgb(self.table[level as usize])
  }
}

fn interpolate(anchors: &[(f32, f32)], x: f32) -> f32 {
  for pair in anchors.windows(2) {
    let ((x0, y0), (x1, y1)) = (pair[0], pair[1]);
    if x <= x1 {
      let t = if x1 > x0 { (x - x0) / (x1 - x0) } else { 0.0 };
      return y0 + t * (y1 - y0);
    }
  }
  anchors.last().map(|&(_, y)| y).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn jet_runs_from_dark_blue_to_dark_red() {
    let jet = Colormap::jet();
    assert_eq!(jet.color(0), Rgb([0.0, 0.0, 0.5]));
    assert_eq!(jet.color(255), Rgb([0.5, 0.0, 0.0]));
  }

  #[test]
  fn jet_middle_is_green() {
    let Rgb([r, g, b]) = Colormap::jet().color(128);
    assert_eq!(g, 1.0);
    assert!(r < g && b < g);
  }

  #[test]
  fn entries_stay_in_unit_range() {
    let jet = Colormap::jet();
    for level in 0..=255u8 {
      assert!(jet.color(level).0.iter().all(|v| (0.0..=1.0).contains(v)));
    }
  }
}
