// 该文件是 Biaoqing （表情） 项目的一部分。
// tests/explain_upload.rs - 上传到热力图的端到端流程
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

use std::{io::Cursor, path::Path};

use image::{GrayImage, ImageFormat, Luma};
use url::Url;

use biaoqing::{
  FromUrl,
  config::Config,
  gradcam::{AttributionError, ChannelOrder, compute_heatmap},
  input::{DirectoryInput, Upload},
  model::{
    Activation, ClassifierError, LayerKind, LayerSpec, ModelFile, Padding, Sequential, SequentialLoader,
  },
  output::{DirectoryRecordOutput, OutputWrapper, Record, SaveImageFileOutput},
  task::{BatchTask, Explainer, RequestError, Task},
};

const SIZE: usize = 48;
const POOLED: usize = SIZE / 2;
const CLASSES: usize = 7;
const HAPPY: usize = 3;
const NEUTRAL: usize = 4;

// 嘴部区域 (行, 列)，以 48x48 像素计
const MOUTH_ROWS: std::ops::Range<usize> = 30..40;
const MOUTH_COLS: std::ops::Range<usize> = 12..36;

fn in_mouth(y: usize, x: usize) -> bool {
  MOUTH_ROWS.contains(&y) && MOUTH_COLS.contains(&x)
}

/// conv2d_40 输出两个通道：亮度与反色亮度。
/// happy 只看嘴部区域的亮度，neutral 对全图反色亮度给出很弱的响应。
fn smile_model_file() -> ModelFile {
  let mut dense = vec![0.0f32; POOLED * POOLED * 2 * CLASSES];
  for y in 0..POOLED {
    for x in 0..POOLED {
      for c in 0..2 {
        let i = (y * POOLED + x) * 2 + c;
        if c == 0 && in_mouth(y * 2, x * 2) {
          dense[i * CLASSES + HAPPY] = 0.1;
        }
        if c == 1 {
          dense[i * CLASSES + NEUTRAL] = 0.002;
        }
      }
    }
  }

  ModelFile {
    input_shape: [SIZE, SIZE, 1],
    layers: vec![
      LayerSpec {
        name: "conv2d_40".to_string(),
        kind: LayerKind::Conv2d {
          filters: 2,
          kernel_size: [1, 1],
          padding: Padding::Valid,
          activation: Activation::Relu,
          weights: vec![1.0, -1.0],
          bias: Some(vec![0.0, 1.0]),
        },
      },
      LayerSpec {
        name: "max_pooling2d_20".to_string(),
        kind: LayerKind::MaxPool2d { pool_size: [2, 2] },
      },
      LayerSpec {
        name: "dropout_30".to_string(),
        kind: LayerKind::Dropout { rate: 0.25 },
      },
      LayerSpec {
        name: "flatten_10".to_string(),
        kind: LayerKind::Flatten,
      },
      LayerSpec {
        name: "dense_20".to_string(),
        kind: LayerKind::Dense {
          units: CLASSES,
          activation: Activation::Softmax,
          weights: dense,
          bias: None,
        },
      },
    ],
  }
}

fn load_smile_model(dir: &Path) -> Sequential {
  let path = dir.join("FER_smile.json");
  std::fs::write(&path, serde_json::to_vec(&smile_model_file()).unwrap()).unwrap();
  let url = Url::parse(&format!("cnn:{}", path.display())).unwrap();
  SequentialLoader::from_url(&url).unwrap().build().unwrap()
}

fn smiling_face() -> GrayImage {
  GrayImage::from_fn(SIZE as u32, SIZE as u32, |x, y| {
    if in_mouth(y as usize, x as usize) {
      Luma([255])
    } else {
      Luma([26])
    }
  })
}

fn encode_png(image: &GrayImage) -> Vec<u8> {
  let mut bytes = Vec::new();
  image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
  bytes
}

fn smile_upload() -> Upload {
  Upload::new(Some("smile.png".to_string()), encode_png(&smiling_face()))
}

fn folder_output(dir: &Path) -> DirectoryRecordOutput {
  let url = Url::parse(&format!("folder:{}", dir.display())).unwrap();
  DirectoryRecordOutput::from_url(&url).unwrap()
}

fn count_files(dir: &Path) -> usize {
  if !dir.exists() {
    return 0;
  }
  std::fs::read_dir(dir)
    .unwrap()
    .map(|entry| {
      let path = entry.unwrap().path();
      if path.is_dir() { count_files(&path) } else { 1 }
    })
    .sum()
}

#[test]
fn smiling_face_is_recognized_as_happy() {
  let scratch = tempfile::tempdir().unwrap();
  let model = load_smile_model(scratch.path());
  let out_dir = scratch.path().join("heatmaps");
  let explainer = Explainer::new(model, &Config::default());

  let response = explainer
    .handle_upload(Some(smile_upload()), &folder_output(&out_dir))
    .unwrap();

  assert_eq!(response.class_index, HAPPY);
  assert_eq!(response.label, "happy");
  assert_eq!(response.message, "Recognized emotion is happy");
  assert_eq!(response.probabilities.len(), CLASSES);
  let total: f32 = response.probabilities.iter().sum();
  assert!((total - 1.0).abs() < 1e-4);

  assert!(response.overlay_path.starts_with(&out_dir));
  let overlay = image::open(&response.overlay_path).unwrap().to_rgb8();
  assert_eq!(overlay.dimensions(), (SIZE as u32, SIZE as u32));

  let record: Record =
    serde_json::from_slice(&std::fs::read(response.overlay_path.with_extension("json")).unwrap()).unwrap();
  assert_eq!(record.id, response.id);
  assert_eq!(record.label, "happy");
  assert_eq!(record.heatmap_class_index, HAPPY);
  assert!(!record.heatmap_degenerate);
  assert!(!record.overlay_degenerate);
}

#[test]
fn heatmap_concentrates_on_the_mouth() {
  let scratch = tempfile::tempdir().unwrap();
  let model = load_smile_model(scratch.path());
  let input = Config::default().preprocessor().preprocess(&encode_png(&smiling_face())).unwrap();

  let heatmap = compute_heatmap(&model, &input, "conv2d_40", None).unwrap();
  assert_eq!(heatmap.class_index(), HAPPY);
  assert_eq!(heatmap.values().dim(), (SIZE, SIZE));

  let (mut peak, mut peak_at) = (f32::NEG_INFINITY, (0, 0));
  let (mut inside, mut outside) = ((0.0f32, 0usize), (0.0f32, 0usize));
  for ((y, x), &v) in heatmap.values().indexed_iter() {
    if v > peak {
      peak = v;
      peak_at = (y, x);
    }
    if in_mouth(y, x) {
      inside = (inside.0 + v, inside.1 + 1);
    } else {
      outside = (outside.0 + v, outside.1 + 1);
    }
  }

  assert_eq!(peak, 1.0);
  assert!(in_mouth(peak_at.0, peak_at.1), "peak at {:?}", peak_at);
  assert!(inside.0 / inside.1 as f32 > 2.0 * outside.0 / outside.1 as f32);
}

#[test]
fn malformed_upload_writes_nothing() {
  let scratch = tempfile::tempdir().unwrap();
  let model = load_smile_model(scratch.path());
  let out_dir = scratch.path().join("heatmaps");
  let output = folder_output(&out_dir);
  let explainer = Explainer::new(model, &Config::default());

  let uploads = [
    None,
    Some(Upload::new(Some("empty.png".to_string()), Vec::new())),
    Some(Upload::new(Some("notes.png".to_string()), b"this is not a picture".to_vec())),
  ];
  for upload in uploads {
    let err = explainer.handle_upload(upload, &output).unwrap_err();
    assert!(matches!(err, RequestError::NoInput), "{}", err);
    assert_eq!(err.user_message(), "No image uploaded.");
  }

  assert_eq!(count_files(&out_dir), 0);
}

#[test]
fn misconfigured_layer_is_reported() {
  let scratch = tempfile::tempdir().unwrap();
  let model = load_smile_model(scratch.path());
  let out_dir = scratch.path().join("heatmaps");
  let config = Config {
    layer_name: "conv2d_41".to_string(),
    ..Config::default()
  };
  let explainer = Explainer::new(model, &config);

  let err = explainer
    .handle_upload(Some(smile_upload()), &folder_output(&out_dir))
    .unwrap_err();
  assert!(matches!(
    err,
    RequestError::Attribution(AttributionError::Classifier(ClassifierError::LayerNotFound(ref name)))
      if name == "conv2d_41"
  ));
  assert_eq!(count_files(&out_dir), 0);
}

#[test]
fn wrong_input_size_is_shape_mismatch() {
  let scratch = tempfile::tempdir().unwrap();
  let model = load_smile_model(scratch.path());
  let config = Config {
    width: 32,
    height: 32,
    ..Config::default()
  };
  let explainer = Explainer::new(model, &config);

  let err = explainer
    .handle_upload(Some(smile_upload()), &folder_output(scratch.path()))
    .unwrap_err();
  assert!(matches!(
    err,
    RequestError::Classifier(ClassifierError::ShapeMismatch { .. })
  ));
}

#[test]
fn concurrent_requests_get_distinct_outputs() {
  let scratch = tempfile::tempdir().unwrap();
  let model = load_smile_model(scratch.path());
  let out_dir = scratch.path().join("heatmaps");
  let output = folder_output(&out_dir);
  let explainer = Explainer::new(model, &Config::default());

  let responses: Vec<_> = std::thread::scope(|s| {
    let handles: Vec<_> = (0..4)
      .map(|_| s.spawn(|| explainer.handle_upload(Some(smile_upload()), &output).unwrap()))
      .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
  });

  let mut paths: Vec<_> = responses.iter().map(|r| r.overlay_path.clone()).collect();
  paths.sort();
  paths.dedup();
  assert_eq!(paths.len(), 4);
  assert!(responses.iter().all(|r| r.label == "happy"));
  // 每个请求一张叠加图加一份记录
  assert_eq!(count_files(&out_dir), 8);
}

#[test]
fn channel_order_does_not_change_saved_image() {
  let scratch = tempfile::tempdir().unwrap();
  let mut saved = Vec::new();
  for (order, name) in [(ChannelOrder::Rgb, "rgb.png"), (ChannelOrder::Bgr, "bgr.png")] {
    let model = load_smile_model(scratch.path());
    let config = Config {
      channel_order: order,
      ..Config::default()
    };
    let url = Url::parse(&format!("image:{}", scratch.path().join("out").join(name).display())).unwrap();
    let output = OutputWrapper::from_url(&url).unwrap();
    let response = Explainer::new(model, &config)
      .handle_upload(Some(smile_upload()), &output)
      .unwrap();
    saved.push(image::open(&response.overlay_path).unwrap().to_rgb8());
  }
  assert_eq!(saved[0], saved[1]);
}

#[test]
fn batch_continues_past_failures() {
  let scratch = tempfile::tempdir().unwrap();
  let model = load_smile_model(scratch.path());
  let faces = scratch.path().join("faces");
  std::fs::create_dir(&faces).unwrap();
  std::fs::write(faces.join("a_broken.png"), b"garbage").unwrap();
  std::fs::write(faces.join("b_smile.png"), encode_png(&smiling_face())).unwrap();
  std::fs::write(faces.join("c_smile.png"), encode_png(&smiling_face())).unwrap();

  let input = DirectoryInput::from_url(&Url::parse(&format!("folder:{}", faces.display())).unwrap()).unwrap();
  let out_file = scratch.path().join("out").join("last.png");
  let output = SaveImageFileOutput::from_url(&Url::parse(&format!("image:{}", out_file.display())).unwrap()).unwrap();
  let explainer = Explainer::new(model, &Config::default());

  let report = BatchTask::default()
    .run_task(input.into_iter(), explainer, output)
    .unwrap();
  assert_eq!(report.succeeded, 2);
  assert_eq!(report.failed, 1);
  assert!(out_file.exists());
}
