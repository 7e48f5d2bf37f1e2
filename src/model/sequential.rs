// 该文件是 Biaoqing （表情） 项目的一部分。
// src/model/sequential.rs - 顺序卷积网络
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

use std::collections::HashSet;

use ndarray::{Array1, Array2, Array3, Array4};
use tracing::{debug, error};

use super::{
  ActivationCapture, CaptureLayer, Classifier, ClassifierError, Prediction,
  layers::{Activation, Layer, Op, Padding},
};
use crate::frame::{ImageTensor, TensorShape};

/// 顺序卷积网络，加载后只读，可在多个线程间共享
#[derive(Debug, Clone)]
pub struct Sequential {
  input_shape: TensorShape,
  layers: Vec<Layer>,
  output_shapes: Vec<TensorShape>,
}

impl Sequential {
  pub fn layers(&self) -> &[Layer] {
    &self.layers
  }

  pub fn layer_index(&self, name: &str) -> Option<usize> {
    self.layers.iter().position(|layer| layer.name() == name)
  }

  /// 指定层的输出形状
  pub fn layer_output_shape(&self, name: &str) -> Option<TensorShape> {
    self.layer_index(name).map(|index| self.output_shapes[index])
  }

  pub fn num_classes(&self) -> usize {
    self.output_shapes.last().map(TensorShape::len).unwrap_or(0)
  }

  fn check_input(&self, input: &ImageTensor) -> Result<(), ClassifierError> {
    let actual = input.shape();
    if actual != self.input_shape {
      error!("输入形状不匹配: 期望 {}, 实际 {}", self.input_shape, actual);
      return Err(ClassifierError::ShapeMismatch {
        expected: self.input_shape,
        actual,
      });
    }
    Ok(())
  }

  /// 前向推理并保留每一层的输出，trace[0] 为输入，trace[i + 1] 为第 i 层输出
  fn forward_trace(&self, input: &ImageTensor) -> Result<Vec<Array3<f32>>, ClassifierError> {
    let mut trace = Vec::with_capacity(self.layers.len() + 1);
    trace.push(input.view().to_owned());
    for layer in &self.layers {
      let output = layer.forward(&trace[trace.len() - 1])?;
      trace.push(output);
    }
    Ok(trace)
  }

  fn forward(&self, input: &ImageTensor) -> Result<Array3<f32>, ClassifierError> {
    let mut x = input.view().to_owned();
    for layer in &self.layers {
      x = layer.forward(&x)?;
    }
    Ok(x)
  }

  /// 把 `layer_index` 层的输出替换为 `activations` 后继续推理
  #[cfg(test)]
  pub(crate) fn forward_from(
    &self,
    layer_index: usize,
    activations: Array3<f32>,
  ) -> Result<Prediction, ClassifierError> {
    let mut x = activations;
    for layer in &self.layers[layer_index + 1..] {
      x = layer.forward(&x)?;
    }
    Ok(to_prediction(&x))
  }
}

fn to_prediction(output: &Array3<f32>) -> Prediction {
  Prediction::from(output.iter().copied().collect::<Vec<_>>())
}

impl Classifier for Sequential {
  type Error = ClassifierError;

  fn input_shape(&self) -> TensorShape {
    self.input_shape
  }

  fn predict(&self, input: &ImageTensor) -> Result<Prediction, Self::Error> {
    self.check_input(input)?;
    debug!("执行模型推理");
    let output = self.forward(input)?;
    Ok(to_prediction(&output))
  }
}

impl CaptureLayer for Sequential {
  type Capture<'a> = SequentialCapture<'a>;

  fn activations_and_prediction<'a>(
    &'a self,
    input: &ImageTensor,
    layer_name: &str,
  ) -> Result<Self::Capture<'a>, ClassifierError> {
    // 先确认层存在，再做任何计算
    let layer_index = self.layer_index(layer_name).ok_or_else(|| {
      error!("模型中不存在层 '{}'", layer_name);
      ClassifierError::LayerNotFound(layer_name.to_string())
    })?;
    self.check_input(input)?;

    debug!("执行模型推理并捕获层 '{}' (#{})", layer_name, layer_index);
    let trace = self.forward_trace(input)?;
    let predictions = to_prediction(&trace[trace.len() - 1]);

    Ok(SequentialCapture {
      model: self,
      layer_index,
      trace,
      predictions,
    })
  }
}

/// 单次前向推理的完整记录，用于从输出反向求到被捕获层的梯度
#[derive(Debug)]
pub struct SequentialCapture<'a> {
  model: &'a Sequential,
  layer_index: usize,
  trace: Vec<Array3<f32>>,
  predictions: Prediction,
}

impl SequentialCapture<'_> {
  pub fn layer_index(&self) -> usize {
    self.layer_index
  }
}

impl ActivationCapture for SequentialCapture<'_> {
  fn activations(&self) -> &Array3<f32> {
    &self.trace[self.layer_index + 1]
  }

  fn predictions(&self) -> &Prediction {
    &self.predictions
  }

  fn gradient(&self, class_index: usize) -> Result<Array3<f32>, ClassifierError> {
    let classes = self.predictions.len();
    if class_index >= classes {
      return Err(ClassifierError::ClassIndexOutOfRange {
        index: class_index,
        classes,
      });
    }

    // 输出层对自身第 class_index 个元素的梯度为 one-hot
    let mut grad = Array3::zeros(self.trace[self.trace.len() - 1].dim());
    if let Some(g) = grad.iter_mut().nth(class_index) {
      *g = 1.0;
    }

    let layers = &self.model.layers;
    for index in (self.layer_index + 1..layers.len()).rev() {
      grad = layers[index].backward(&self.trace[index], &self.trace[index + 1], grad)?;
    }
    debug!("反向传播完成: 梯度形状 {:?}", grad.dim());
    Ok(grad)
  }
}

/// 逐层构建 [`Sequential`]，`build` 时推导形状并校验
#[derive(Debug, Clone)]
pub struct SequentialBuilder {
  input_shape: TensorShape,
  layers: Vec<Layer>,
}

impl SequentialBuilder {
  pub fn new(input_shape: TensorShape) -> Self {
    Self {
      input_shape,
      layers: Vec::new(),
    }
  }

  pub fn layer(mut self, layer: Layer) -> Self {
    self.layers.push(layer);
    self
  }

  pub fn conv2d(
    self,
    name: &str,
    kernel: Array4<f32>,
    bias: Array1<f32>,
    padding: Padding,
    activation: Activation,
  ) -> Self {
    self.layer(Layer::new(
      name,
      Op::Conv2d {
        kernel,
        bias,
        padding,
        activation,
      },
    ))
  }

  pub fn max_pool2d(self, name: &str, pool: (usize, usize)) -> Self {
    self.layer(Layer::new(name, Op::MaxPool2d { pool }))
  }

  pub fn batch_norm(
    self,
    name: &str,
    gamma: Array1<f32>,
    beta: Array1<f32>,
    mean: Array1<f32>,
    variance: Array1<f32>,
    epsilon: f32,
  ) -> Self {
    self.layer(Layer::new(
      name,
      Op::BatchNorm {
        gamma,
        beta,
        mean,
        variance,
        epsilon,
      },
    ))
  }

  pub fn dropout(self, name: &str) -> Self {
    self.layer(Layer::new(name, Op::Dropout))
  }

  pub fn activation(self, name: &str, activation: Activation) -> Self {
    self.layer(Layer::new(name, Op::Activation(activation)))
  }

  pub fn flatten(self, name: &str) -> Self {
    self.layer(Layer::new(name, Op::Flatten))
  }

  pub fn dense(self, name: &str, kernel: Array2<f32>, bias: Array1<f32>, activation: Activation) -> Self {
    self.layer(Layer::new(
      name,
      Op::Dense {
        kernel,
        bias,
        activation,
      },
    ))
  }

  pub fn global_average_pool2d(self, name: &str) -> Self {
    self.layer(Layer::new(name, Op::GlobalAveragePool2d))
  }

  pub fn build(self) -> Result<Sequential, ClassifierError> {
    if self.input_shape.is_empty() {
      return Err(ClassifierError::invalid(format!("输入形状 {} 为空", self.input_shape)));
    }
    if self.layers.is_empty() {
      return Err(ClassifierError::invalid("模型没有任何层"));
    }

    let mut output_shapes = Vec::with_capacity(self.layers.len());
    {
      let mut names = HashSet::new();
      let mut shape = self.input_shape;
      for layer in &self.layers {
        if !names.insert(layer.name()) {
          return Err(ClassifierError::invalid(format!("层名重复: '{}'", layer.name())));
        }
        shape = layer.output_shape(shape)?;
        debug!("层 '{}': 输出形状 {}", layer.name(), shape);
        output_shapes.push(shape);
      }
    }

    Ok(Sequential {
      input_shape: self.input_shape,
      layers: self.layers,
      output_shapes,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::Array;

  /// 确定性的伪随机数，避免测试依赖随机数库
  fn pseudo_random(len: usize, seed: u32) -> Vec<f32> {
    let mut state = seed;
    (0..len)
      .map(|_| {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
      })
      .collect()
  }

  fn small_network() -> Sequential {
    SequentialBuilder::new(TensorShape::new(6, 6, 1))
      .conv2d(
        "conv_a",
        Array::from_shape_vec((3, 3, 1, 4), pseudo_random(36, 1)).unwrap(),
        Array1::from(pseudo_random(4, 2)),
        Padding::Same,
        Activation::Relu,
      )
      .conv2d(
        "conv_b",
        Array::from_shape_vec((3, 3, 4, 3), pseudo_random(108, 3)).unwrap(),
        Array1::from(pseudo_random(3, 4)),
        Padding::Valid,
        Activation::Linear,
      )
      .batch_norm(
        "bn",
        Array1::from(vec![1.2, 0.8, 1.0]),
        Array1::from(vec![0.1, -0.1, 0.0]),
        Array1::from(vec![0.05, 0.02, 0.0]),
        Array1::from(vec![0.5, 1.5, 1.0]),
        1e-3,
      )
      .max_pool2d("pool", (2, 2))
      .dropout("drop")
      .flatten("flatten")
      .dense(
        "hidden",
        Array::from_shape_vec((12, 5), pseudo_random(60, 5)).unwrap(),
        Array1::from(pseudo_random(5, 6)),
        Activation::Relu,
      )
      .dense(
        "predictions",
        Array::from_shape_vec((5, 3), pseudo_random(15, 7)).unwrap(),
        Array1::zeros(3),
        Activation::Softmax,
      )
      .build()
      .unwrap()
  }

  fn input() -> ImageTensor {
    ImageTensor::from(Array::from_shape_vec((6, 6, 1), pseudo_random(36, 9).iter().map(|v| v + 0.5).collect()).unwrap())
  }

  #[test]
  fn build_infers_layer_shapes() {
    let model = small_network();
    assert_eq!(model.layer_output_shape("conv_a"), Some(TensorShape::new(6, 6, 4)));
    assert_eq!(model.layer_output_shape("conv_b"), Some(TensorShape::new(4, 4, 3)));
    assert_eq!(model.layer_output_shape("flatten"), Some(TensorShape::new(1, 1, 12)));
    assert_eq!(model.num_classes(), 3);
  }

  #[test]
  fn duplicate_layer_names_are_rejected() {
    let result = SequentialBuilder::new(TensorShape::new(2, 2, 1))
      .flatten("same")
      .dropout("same")
      .build();
    assert!(matches!(result, Err(ClassifierError::InvalidModel(_))));
  }

  #[test]
  fn capture_matches_plain_prediction() {
    let model = small_network();
    let prediction = model.predict(&input()).unwrap();
    let capture = model.activations_and_prediction(&input(), "conv_b").unwrap();
    assert_eq!(capture.predictions(), &prediction);
    assert_eq!(capture.activations().dim(), (4, 4, 3));
    assert!((prediction.scores().iter().sum::<f32>() - 1.0).abs() < 1e-5);
  }

  #[test]
  fn gradient_agrees_with_finite_differences() {
    let model = small_network();
    let capture = model.activations_and_prediction(&input(), "conv_b").unwrap();
    let class_index = capture.predictions().argmax();
    let grad = capture.gradient(class_index).unwrap();
    let activations = capture.activations().clone();
    let layer_index = capture.layer_index();

    let eps = 1e-3f32;
    for (i, &analytic) in grad.iter().enumerate() {
      let mut plus = activations.clone();
      let mut minus = activations.clone();
      *plus.iter_mut().nth(i).unwrap() += eps;
      *minus.iter_mut().nth(i).unwrap() -= eps;
      let p = model.forward_from(layer_index, plus).unwrap().score(class_index).unwrap();
      let m = model.forward_from(layer_index, minus).unwrap().score(class_index).unwrap();
      let numeric = (p - m) / (2.0 * eps);
      assert!(
        (numeric - analytic).abs() <= 2e-3 + 0.05 * analytic.abs(),
        "element {}: numeric {} vs analytic {}",
        i,
        numeric,
        analytic
      );
    }
  }

  #[test]
  fn unknown_layer_is_reported_before_shape_check() {
    let model = small_network();
    let wrong_shape = ImageTensor::from(Array3::zeros((3, 3, 1)));
    let err = model.activations_and_prediction(&wrong_shape, "conv2d_40").unwrap_err();
    assert!(matches!(err, ClassifierError::LayerNotFound(name) if name == "conv2d_40"));
  }

  #[test]
  fn shape_mismatch_is_rejected() {
    let model = small_network();
    let wrong_shape = ImageTensor::from(Array3::zeros((48, 48, 1)));
    assert!(matches!(
      model.predict(&wrong_shape),
      Err(ClassifierError::ShapeMismatch { .. })
    ));
  }

  #[test]
  fn class_index_out_of_range_is_rejected() {
    let model = small_network();
    let capture = model.activations_and_prediction(&input(), "conv_b").unwrap();
    assert!(matches!(
      capture.gradient(3),
      Err(ClassifierError::ClassIndexOutOfRange { index: 3, classes: 3 })
    ));
  }
}
