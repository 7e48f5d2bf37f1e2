// 该文件是 Biaoqing （表情） 项目的一部分。
// src/model/layers.rs - 网络层的前向与反向计算
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

//! 所有张量均为 HWC 排布的 `Array3<f32>`；全连接层的输出形状为 (1, 1, units)。
//! 反向计算只求对层输入的梯度，推理阶段不需要权重梯度。

use ndarray::{Array1, Array2, Array3, Array4, ArrayViewMut1, Axis, Zip, s};
use serde::{Deserialize, Serialize};

use super::ClassifierError;
use crate::frame::TensorShape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
  #[default]
  Linear,
  Relu,
  /// 沿通道维做 softmax
  Softmax,
}

impl Activation {
  fn apply(&self, mut x: Array3<f32>) -> Array3<f32> {
    match self {
      Activation::Linear => {}
      Activation::Relu => x.mapv_inplace(|v| v.max(0.0)),
      Activation::Softmax => {
        for lane in x.lanes_mut(Axis(2)) {
          softmax_inplace(lane);
        }
      }
    }
    x
  }

  /// 由激活输出 `output` 和对输出的梯度求对激活输入的梯度
  fn backward(&self, output: &Array3<f32>, mut grad: Array3<f32>) -> Array3<f32> {
    match self {
      Activation::Linear => {}
      Activation::Relu => {
        Zip::from(&mut grad).and(output).for_each(|g, &o| {
          if o <= 0.0 {
            *g = 0.0;
          }
        });
      }
      Activation::Softmax => {
        for (mut g, p) in grad.lanes_mut(Axis(2)).into_iter().zip(output.lanes(Axis(2))) {
          let dot = g.dot(&p);
          g.zip_mut_with(&p, |g, &p| *g = p * (*g - dot));
        }
      }
    }
    grad
  }
}

fn softmax_inplace(mut lane: ArrayViewMut1<f32>) {
  let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
  lane.mapv_inplace(|v| (v - max).exp());
  let sum = lane.sum();
  if sum > 0.0 {
    lane.mapv_inplace(|v| v / sum);
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
  #[default]
  Valid,
  /// 步长为 1 时输出与输入同尺寸，多出的一行/列补在下方/右侧
  Same,
}

impl Padding {
  /// 输出尺寸；卷积核大于输入时为 0
  fn output_size(&self, h: usize, w: usize, kh: usize, kw: usize) -> (usize, usize) {
    match self {
      Padding::Valid => ((h + 1).saturating_sub(kh), (w + 1).saturating_sub(kw)),
      Padding::Same => (h, w),
    }
  }

  fn offsets(&self, kh: usize, kw: usize) -> (usize, usize) {
    match self {
      Padding::Valid => (0, 0),
      Padding::Same => ((kh.max(1) - 1) / 2, (kw.max(1) - 1) / 2),
    }
  }
}

#[derive(Debug, Clone)]
pub enum Op {
  /// 卷积核排布为 [kh, kw, c_in, c_out]，步长为 1
  Conv2d {
    kernel: Array4<f32>,
    bias: Array1<f32>,
    padding: Padding,
    activation: Activation,
  },
  /// 窗口大小即步长，不补边
  MaxPool2d { pool: (usize, usize) },
  /// 推理模式：y = (x - mean) / sqrt(variance + epsilon) * gamma + beta
  BatchNorm {
    gamma: Array1<f32>,
    beta: Array1<f32>,
    mean: Array1<f32>,
    variance: Array1<f32>,
    epsilon: f32,
  },
  Dropout,
  Activation(Activation),
  Flatten,
  /// 作用于最后一维，权重排布为 [inputs, units]
  Dense {
    kernel: Array2<f32>,
    bias: Array1<f32>,
    activation: Activation,
  },
  GlobalAveragePool2d,
}

#[derive(Debug, Clone)]
pub struct Layer {
  name: String,
  op: Op,
}

impl Layer {
  pub fn new(name: impl Into<String>, op: Op) -> Self {
    Self {
      name: name.into(),
      op,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn op(&self) -> &Op {
    &self.op
  }

  /// 推导输出形状，同时校验权重与输入是否匹配
  pub fn output_shape(&self, input: TensorShape) -> Result<TensorShape, ClassifierError> {
    let (h, w, c) = input.dim();
    let shape = match &self.op {
      Op::Conv2d {
        kernel,
        bias,
        padding,
        ..
      } => {
        let (kh, kw, c_in, c_out) = kernel.dim();
        if c_in != c {
          return Err(self.invalid(format!("卷积核输入通道 {} 与输入通道 {} 不符", c_in, c)));
        }
        if bias.len() != c_out {
          return Err(self.invalid(format!("偏置长度 {} 与输出通道 {} 不符", bias.len(), c_out)));
        }
        let (oh, ow) = padding.output_size(h, w, kh, kw);
        TensorShape::new(oh, ow, c_out)
      }
      Op::MaxPool2d { pool: (ph, pw) } => {
        if *ph == 0 || *pw == 0 {
          return Err(self.invalid("池化窗口不能为 0"));
        }
        TensorShape::new(h / ph, w / pw, c)
      }
      Op::BatchNorm {
        gamma,
        beta,
        mean,
        variance,
        ..
      } => {
        for (param, len) in [
          ("gamma", gamma.len()),
          ("beta", beta.len()),
          ("mean", mean.len()),
          ("variance", variance.len()),
        ] {
          if len != c {
            return Err(self.invalid(format!("{} 长度 {} 与通道数 {} 不符", param, len, c)));
          }
        }
        input
      }
      Op::Dropout | Op::Activation(_) => input,
      Op::Flatten => TensorShape::new(1, 1, input.len()),
      Op::Dense { kernel, bias, .. } => {
        let (inputs, units) = kernel.dim();
        if inputs != c {
          return Err(self.invalid(format!("权重输入维度 {} 与输入维度 {} 不符", inputs, c)));
        }
        if bias.len() != units {
          return Err(self.invalid(format!("偏置长度 {} 与输出维度 {} 不符", bias.len(), units)));
        }
        TensorShape::new(h, w, units)
      }
      Op::GlobalAveragePool2d => {
        if h == 0 || w == 0 {
          return Err(self.invalid("空的空间维度无法做全局平均池化"));
        }
        TensorShape::new(1, 1, c)
      }
    };

    if shape.is_empty() {
      return Err(self.invalid(format!("输入 {} 经过本层后为空", input)));
    }
    Ok(shape)
  }

  pub fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>, ClassifierError> {
    let output = match &self.op {
      Op::Conv2d {
        kernel,
        bias,
        padding,
        activation,
      } => activation.apply(conv2d(input, kernel, bias, *padding)),
      Op::MaxPool2d { pool } => max_pool2d(input, *pool),
      Op::BatchNorm {
        gamma,
        beta,
        mean,
        variance,
        epsilon,
      } => {
        let scale = batch_norm_scale(gamma, variance, *epsilon);
        (input - mean) * &scale + beta
      }
      Op::Dropout => input.clone(),
      Op::Activation(activation) => activation.apply(input.clone()),
      Op::Flatten => Array3::from_shape_vec((1, 1, input.len()), input.iter().copied().collect())?,
      Op::Dense {
        kernel,
        bias,
        activation,
      } => activation.apply(dense(input, kernel, bias)),
      Op::GlobalAveragePool2d => {
        let (h, w, _) = input.dim();
        let mean = input.sum_axis(Axis(0)).sum_axis(Axis(0)) / (h * w) as f32;
        mean.insert_axis(Axis(0)).insert_axis(Axis(0))
      }
    };
    Ok(output)
  }

  /// 已知本层输入、输出以及对输出的梯度，求对输入的梯度
  pub fn backward(
    &self,
    input: &Array3<f32>,
    output: &Array3<f32>,
    grad: Array3<f32>,
  ) -> Result<Array3<f32>, ClassifierError> {
    let grad = match &self.op {
      Op::Conv2d {
        kernel,
        padding,
        activation,
        ..
      } => conv2d_backward(input.dim(), kernel, *padding, &activation.backward(output, grad)),
      Op::MaxPool2d { pool } => max_pool2d_backward(input, *pool, &grad),
      Op::BatchNorm {
        gamma,
        variance,
        epsilon,
        ..
      } => grad * &batch_norm_scale(gamma, variance, *epsilon),
      Op::Dropout => grad,
      Op::Activation(activation) => activation.backward(output, grad),
      Op::Flatten => Array3::from_shape_vec(input.dim(), grad.iter().copied().collect())?,
      Op::Dense {
        kernel, activation, ..
      } => dense_backward(kernel, &activation.backward(output, grad)),
      Op::GlobalAveragePool2d => {
        let (h, w, _) = input.dim();
        let n = (h * w) as f32;
        Array3::from_shape_fn(input.dim(), |(_, _, c)| grad[[0, 0, c]] / n)
      }
    };
    Ok(grad)
  }

  fn invalid(&self, msg: impl std::fmt::Display) -> ClassifierError {
    ClassifierError::invalid(format!("层 '{}': {}", self.name, msg))
  }
}

fn batch_norm_scale(gamma: &Array1<f32>, variance: &Array1<f32>, epsilon: f32) -> Array1<f32> {
  gamma / &variance.mapv(|v| (v + epsilon).sqrt())
}

/// 卷积窗口 (oy + ky, ox + kx) 在补边后对应的输入坐标
fn source_index(out: usize, k: usize, offset: usize, size: usize) -> Option<usize> {
  (out + k).checked_sub(offset).filter(|&i| i < size)
}

fn conv2d(input: &Array3<f32>, kernel: &Array4<f32>, bias: &Array1<f32>, padding: Padding) -> Array3<f32> {
  let (h, w, _) = input.dim();
  let (kh, kw, _, c_out) = kernel.dim();
  let (oh, ow) = padding.output_size(h, w, kh, kw);
  let (top, left) = padding.offsets(kh, kw);

  let mut output = Array3::zeros((oh, ow, c_out));
  for oy in 0..oh {
    for ox in 0..ow {
      let mut acc = bias.clone();
      for ky in 0..kh {
        let Some(iy) = source_index(oy, ky, top, h) else {
          continue;
        };
        for kx in 0..kw {
          let Some(ix) = source_index(ox, kx, left, w) else {
            continue;
          };
          acc += &input.slice(s![iy, ix, ..]).dot(&kernel.slice(s![ky, kx, .., ..]));
        }
      }
      output.slice_mut(s![oy, ox, ..]).assign(&acc);
    }
  }
  output
}

fn conv2d_backward(
  input_dim: (usize, usize, usize),
  kernel: &Array4<f32>,
  padding: Padding,
  grad: &Array3<f32>,
) -> Array3<f32> {
  let (h, w, _) = input_dim;
  let (kh, kw, _, _) = kernel.dim();
  let (oh, ow, _) = grad.dim();
  let (top, left) = padding.offsets(kh, kw);

  let mut grad_input = Array3::zeros(input_dim);
  for oy in 0..oh {
    for ox in 0..ow {
      let g = grad.slice(s![oy, ox, ..]);
      for ky in 0..kh {
        let Some(iy) = source_index(oy, ky, top, h) else {
          continue;
        };
        for kx in 0..kw {
          let Some(ix) = source_index(ox, kx, left, w) else {
            continue;
          };
          let contribution = kernel.slice(s![ky, kx, .., ..]).dot(&g);
          let mut target = grad_input.slice_mut(s![iy, ix, ..]);
          target += &contribution;
        }
      }
    }
  }
  grad_input
}

fn max_pool2d(input: &Array3<f32>, (ph, pw): (usize, usize)) -> Array3<f32> {
  let (h, w, c) = input.dim();
  Array3::from_shape_fn((h / ph, w / pw, c), |(oy, ox, ch)| {
    input
      .slice(s![oy * ph..(oy + 1) * ph, ox * pw..(ox + 1) * pw, ch])
      .fold(f32::NEG_INFINITY, |m, &v| m.max(v))
  })
}

/// 梯度只回传给窗口内第一个最大值所在的位置
fn max_pool2d_backward(input: &Array3<f32>, (ph, pw): (usize, usize), grad: &Array3<f32>) -> Array3<f32> {
  let (oh, ow, c) = grad.dim();
  let mut grad_input = Array3::zeros(input.dim());
  for oy in 0..oh {
    for ox in 0..ow {
      for ch in 0..c {
        let mut best = (oy * ph, ox * pw);
        let mut best_value = f32::NEG_INFINITY;
        for iy in oy * ph..(oy + 1) * ph {
          for ix in ox * pw..(ox + 1) * pw {
            let value = input[[iy, ix, ch]];
            if value > best_value {
              best_value = value;
              best = (iy, ix);
            }
          }
        }
        grad_input[[best.0, best.1, ch]] += grad[[oy, ox, ch]];
      }
    }
  }
  grad_input
}

fn dense(input: &Array3<f32>, kernel: &Array2<f32>, bias: &Array1<f32>) -> Array3<f32> {
  let (h, w, _) = input.dim();
  let mut output = Array3::zeros((h, w, kernel.ncols()));
  for y in 0..h {
    for x in 0..w {
      let z = input.slice(s![y, x, ..]).dot(kernel) + bias;
      output.slice_mut(s![y, x, ..]).assign(&z);
    }
  }
  output
}

fn dense_backward(kernel: &Array2<f32>, grad: &Array3<f32>) -> Array3<f32> {
  let (h, w, _) = grad.dim();
  let mut grad_input = Array3::zeros((h, w, kernel.nrows()));
  for y in 0..h {
    for x in 0..w {
      let g = kernel.dot(&grad.slice(s![y, x, ..]));
      grad_input.slice_mut(s![y, x, ..]).assign(&g);
    }
  }
  grad_input
}
