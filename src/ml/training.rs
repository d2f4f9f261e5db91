//! モデル学習
//!
//! クラスごとのサブディレクトリに画像を置いたデータセットから `FoodClassifier` を学習し、
//! モデルバンドルとラベルカタログを書き出します。

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::{
    backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, Autodiff, NdArray, Wgpu},
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    optim::AdamConfig,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
    train::{
        metric::{AccuracyMetric, LossMetric},
        ClassificationOutput, LearnerBuilder, LearningStrategy, TrainOutput, TrainStep, ValidStep,
    },
};
use ndarray::{Array3, ArrayView3, Axis};
use rand::Rng;

use crate::catalog::LabelCatalog;
use crate::ml::inference::{model_to_bytes, save_backbone};
use crate::ml::{to_model_input, FoodClassifier, ModelConfig};
use crate::model::config::{AppConfig, DeviceType, TrainingSettings};
use crate::model::{save_model_with_metadata, ModelMetadata};
use crate::preprocess::{ImageNormalizer, PixelScale, INPUT_SIZE};

/// 学習に使う画像の拡張子
const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "bmp"];

/// 学習データセット（パスのリストのみ保持）
#[derive(Debug, Clone)]
pub struct FoodDataset {
    samples: Vec<(PathBuf, usize)>, // (画像パス, クラスID)
    class_names: Vec<String>,
}

impl FoodDataset {
    /// ディレクトリから学習データを読み込む
    ///
    /// サブディレクトリ名がクラス名になり、名前順にクラスIDを割り当てる。
    pub fn from_directory(data_dir: &Path) -> Result<Self> {
        if !data_dir.is_dir() {
            anyhow::bail!("Dataset directory not found: {}", data_dir.display());
        }

        let mut class_names = Vec::new();
        for entry in std::fs::read_dir(data_dir)
            .with_context(|| format!("Failed to read dataset directory: {:?}", data_dir))?
        {
            let path = entry?.path();
            if path.is_dir() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    class_names.push(name.to_string());
                }
            }
        }
        class_names.sort();

        if class_names.is_empty() {
            anyhow::bail!("No class directories found in {}", data_dir.display());
        }

        let mut samples = Vec::new();
        let mut empty_classes = Vec::new();
        for (class_id, class_name) in class_names.iter().enumerate() {
            let mut images: Vec<PathBuf> = std::fs::read_dir(data_dir.join(class_name))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.is_file() && is_image(path))
                .collect();
            images.sort();

            if images.is_empty() {
                empty_classes.push(class_name.clone());
            }
            tracing::info!("  Class {}: {} ({} images)", class_id, class_name, images.len());
            samples.extend(images.into_iter().map(|path| (path, class_id)));
        }

        if !empty_classes.is_empty() {
            anyhow::bail!(
                "The following class directories contain no images: {}",
                empty_classes.join(", ")
            );
        }

        tracing::info!(
            "Loaded {} samples from {} classes",
            samples.len(),
            class_names.len()
        );
        Ok(Self {
            samples,
            class_names,
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// シャッフルして学習用と検証用に分割
    pub fn split(self, train_ratio: f32, seed: u64) -> (Self, Self) {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let mut samples = self.samples;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        samples.shuffle(&mut rng);

        let train_len = ((samples.len() as f32 * train_ratio) as usize).min(samples.len());
        let validation = samples.split_off(train_len);

        (
            Self {
                samples,
                class_names: self.class_names.clone(),
            },
            Self {
                samples: validation,
                class_names: self.class_names,
            },
        )
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct FoodItem {
    pub path: PathBuf,
    pub label: usize,
}

impl Dataset<FoodItem> for FoodDataset {
    fn get(&self, index: usize) -> Option<FoodItem> {
        let (path, label) = self.samples.get(index)?;
        Some(FoodItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// 学習時のランダムな拡張の範囲
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Augmentation {
    pub horizontal_flip: bool,
    /// 回転（度）
    pub rotation_degrees: f32,
    /// 平行移動（画像サイズに対する割合）
    pub shift: f32,
    /// せん断角（度）
    pub shear_degrees: f32,
    /// 拡大縮小（1 ± zoom）
    pub zoom: f32,
}

impl Augmentation {
    pub fn from_settings(settings: &TrainingSettings) -> Self {
        Self {
            horizontal_flip: settings.horizontal_flip,
            rotation_degrees: settings.rotation_range,
            shift: settings.shift_range,
            shear_degrees: settings.shear_range,
            zoom: settings.zoom_range,
        }
    }

    /// 1枚分の変換を選ぶ（縦横の拡大率は独立）
    fn sample<R: Rng>(&self, rng: &mut R, size: usize) -> Transform {
        Transform {
            flip: self.horizontal_flip && rng.gen_bool(0.5),
            rotation: symmetric(rng, self.rotation_degrees).to_radians(),
            shift_rows: symmetric(rng, self.shift) * size as f32,
            shift_cols: symmetric(rng, self.shift) * size as f32,
            shear: symmetric(rng, self.shear_degrees).to_radians(),
            zoom_rows: 1.0 + symmetric(rng, self.zoom),
            zoom_cols: 1.0 + symmetric(rng, self.zoom),
        }
    }
}

fn symmetric<R: Rng>(rng: &mut R, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

/// 1枚の画像に適用するアフィン変換と左右反転
#[derive(Debug, Clone, Copy, PartialEq)]
struct Transform {
    flip: bool,
    /// ラジアン
    rotation: f32,
    /// 画素
    shift_rows: f32,
    shift_cols: f32,
    /// ラジアン
    shear: f32,
    zoom_rows: f32,
    zoom_cols: f32,
}

impl Transform {
    const IDENTITY: Self = Self {
        flip: false,
        rotation: 0.0,
        shift_rows: 0.0,
        shift_cols: 0.0,
        shear: 0.0,
        zoom_rows: 1.0,
        zoom_cols: 1.0,
    };

    /// 出力座標 (行, 列) から入力座標への行列（画像中心が原点）
    ///
    /// 回転 → 平行移動 → せん断 → 拡大縮小 の順に合成する。
    fn matrix(&self) -> [[f32; 3]; 3] {
        let (sin, cos) = self.rotation.sin_cos();
        let rotation = [[cos, -sin, 0.0], [sin, cos, 0.0], [0.0, 0.0, 1.0]];
        let shift = [
            [1.0, 0.0, self.shift_rows],
            [0.0, 1.0, self.shift_cols],
            [0.0, 0.0, 1.0],
        ];
        let shear = [
            [1.0, -self.shear.sin(), 0.0],
            [0.0, self.shear.cos(), 0.0],
            [0.0, 0.0, 1.0],
        ];
        let zoom = [
            [self.zoom_rows, 0.0, 0.0],
            [0.0, self.zoom_cols, 0.0],
            [0.0, 0.0, 1.0],
        ];
        mat_mul(mat_mul(mat_mul(rotation, shift), shear), zoom)
    }

    /// (H, W, C) の画素に適用する。範囲外は最も近い端の画素で埋める。
    fn apply(&self, pixels: ArrayView3<f32>) -> Array3<f32> {
        let (height, width, channels) = pixels.dim();
        let m = self.matrix();
        let center_row = (height as f32 - 1.0) / 2.0;
        let center_col = (width as f32 - 1.0) / 2.0;

        let mut out = Array3::<f32>::zeros((height, width, channels));
        for row in 0..height {
            for col in 0..width {
                let y = row as f32 - center_row;
                let x = col as f32 - center_col;
                let src_row = m[0][0] * y + m[0][1] * x + m[0][2] + center_row;
                let src_col = m[1][0] * y + m[1][1] * x + m[1][2] + center_col;
                let dst_col = if self.flip { width - 1 - col } else { col };
                for channel in 0..channels {
                    out[[row, dst_col, channel]] = bilinear(&pixels, src_row, src_col, channel);
                }
            }
        }
        out
    }
}

fn mat_mul(a: [[f32; 3]; 3], b: [[f32; 3]; 3]) -> [[f32; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, value) in row.iter_mut().enumerate() {
            *value = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

fn bilinear(pixels: &ArrayView3<f32>, row: f32, col: f32, channel: usize) -> f32 {
    let (height, width, _) = pixels.dim();
    let row = row.clamp(0.0, (height - 1) as f32);
    let col = col.clamp(0.0, (width - 1) as f32);

    let r0 = row.floor() as usize;
    let c0 = col.floor() as usize;
    let r1 = (r0 + 1).min(height - 1);
    let c1 = (c0 + 1).min(width - 1);
    let fr = row - r0 as f32;
    let fc = col - c0 as f32;

    let top = pixels[[r0, c0, channel]] * (1.0 - fc) + pixels[[r0, c1, channel]] * fc;
    let bottom = pixels[[r1, c0, channel]] * (1.0 - fc) + pixels[[r1, c1, channel]] * fc;
    top * (1.0 - fr) + bottom * fr
}

/// バッチャー
///
/// 推論と同じ `ImageNormalizer` を通し、学習時のみランダムな拡張を加える。
#[derive(Clone)]
pub struct FoodBatcher {
    normalizer: ImageNormalizer,
    scale: PixelScale,
    augmentation: Option<Augmentation>,
}

impl FoodBatcher {
    pub fn new(scale: PixelScale) -> Self {
        Self {
            normalizer: ImageNormalizer::new().without_enhancement(),
            scale,
            augmentation: None,
        }
    }

    pub fn with_augmentation(mut self, augmentation: Augmentation) -> Self {
        self.augmentation = Some(augmentation);
        self
    }

    fn pixels(&self, item: &FoodItem, transform: Option<&Transform>) -> Vec<f32> {
        match self.normalizer.open(&item.path, self.scale) {
            Ok(tensor) => match transform {
                Some(transform) => transform
                    .apply(tensor.as_array().index_axis(Axis(0), 0))
                    .iter()
                    .copied()
                    .collect(),
                None => tensor.to_vec(),
            },
            Err(e) => {
                // 読めない画像はゼロで埋める
                tracing::warn!("Failed to load {}: {}", item.path.display(), e);
                vec![0.0f32; INPUT_SIZE * INPUT_SIZE * 3]
            }
        }
    }
}

impl<B: Backend> Batcher<B, FoodItem, FoodBatch<B>> for FoodBatcher {
    fn batch(&self, items: Vec<FoodItem>, device: &B::Device) -> FoodBatch<B> {
        let batch_size = items.len();
        let mut all_pixels = Vec::with_capacity(batch_size * INPUT_SIZE * INPUT_SIZE * 3);
        let mut targets_vec = Vec::with_capacity(batch_size);
        let mut rng = rand::thread_rng();

        for item in &items {
            let transform = self
                .augmentation
                .as_ref()
                .map(|augmentation| augmentation.sample(&mut rng, INPUT_SIZE));
            all_pixels.extend(self.pixels(item, transform.as_ref()));
            targets_vec.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = to_model_input::<B>(&all_pixels, batch_size, self.scale, device);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), device);

        FoodBatch { images, targets }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct FoodBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// TrainStep実装 (学習時の順伝播 + 逆伝播)
impl<B: AutodiffBackend> TrainStep<FoodBatch<B>, ClassificationOutput<B>> for FoodClassifier<B> {
    fn step(&self, batch: FoodBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets);
        let grads = item.loss.backward();
        TrainOutput::new(self, grads, item)
    }
}

/// ValidStep実装 (検証時の順伝播のみ)
impl<B: Backend> ValidStep<FoodBatch<B>, ClassificationOutput<B>> for FoodClassifier<B> {
    fn step(&self, batch: FoodBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}

/// 学習結果の概要
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub num_classes: usize,
    pub train_samples: usize,
    pub validation_samples: usize,
    pub validation_accuracy: Option<f32>,
    pub transfer_learned: bool,
    pub bundle_path: PathBuf,
    pub catalog_path: PathBuf,
    /// 全層を学習した場合に書き出したバックボーン
    pub exported_backbone: Option<PathBuf>,
}

/// モデル学習を実行
///
/// 設定の `device_type` に応じてバックエンドを選び、学習後に
/// `model.weights_path` へバンドルを、`catalog.path` へラベルカタログを書き出す。
/// `model.fallback_backbone` のファイルがあればバックボーンを固定して転移学習し、
/// 無ければ全層を学習してそのパスへバックボーンを書き出す。
pub fn train_model(data_dir: &Path, config: &AppConfig) -> Result<TrainingReport> {
    match config.device_type {
        DeviceType::Wgpu => train_on::<Autodiff<Wgpu>>(data_dir, config, WgpuDevice::default()),
        DeviceType::Cpu => train_on::<Autodiff<NdArray>>(data_dir, config, NdArrayDevice::Cpu),
    }
}

fn train_on<B: AutodiffBackend>(
    data_dir: &Path,
    config: &AppConfig,
    device: B::Device,
) -> Result<TrainingReport> {
    let settings = &config.training;
    let scale = config.model.input_scale;

    if settings.num_epochs == 0 {
        anyhow::bail!("num_epochs must be at least 1");
    }
    if settings.batch_size == 0 {
        anyhow::bail!("batch_size must be at least 1");
    }

    tracing::info!("Training on {} ({:?})", config.device_type, device);

    let dataset = FoodDataset::from_directory(data_dir)?;
    let class_names = dataset.class_names().to_vec();
    let num_classes = dataset.num_classes();
    let catalog = LabelCatalog::new(class_names.clone())?;

    let (dataset_train, dataset_val) = dataset.split(settings.train_ratio, settings.seed);
    let train_samples = dataset_train.len();
    let validation_samples = dataset_val.len();
    tracing::info!(
        "Split: {} training / {} validation samples",
        train_samples,
        validation_samples
    );
    if train_samples == 0 {
        anyhow::bail!("No training samples left after the train/validation split");
    }

    let mut model = ModelConfig::new(num_classes)
        .with_dropout(config.model.dropout)
        .init::<B>(&device);

    // バックボーンがあれば転移学習（ヘッドのみ学習）
    let backbone_path = config.fallback_backbone_path().filter(|p| p.exists());
    if let Some(path) = &backbone_path {
        let binary = std::fs::read(path)
            .with_context(|| format!("Failed to read backbone weights: {:?}", path))?;
        let record = BinBytesRecorder::<FullPrecisionSettings>::default()
            .load(binary, &device)
            .map_err(|e| anyhow::anyhow!("バックボーンの読み込みエラー: {:?}", e))?;
        model = model.load_backbone_record(record).freeze_backbone();
        tracing::info!("Transfer learning from backbone {} (frozen)", path.display());
    } else {
        tracing::info!("No backbone weights found, training all layers");
    }

    let batcher_train = FoodBatcher::new(scale).with_augmentation(Augmentation::from_settings(settings));
    let batcher_val = FoodBatcher::new(scale);

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(settings.batch_size)
        .num_workers(settings.num_workers)
        .build(dataset_train);

    let dataloader_val = DataLoaderBuilder::new(batcher_val)
        .batch_size(settings.batch_size)
        .num_workers(settings.num_workers)
        .build(dataset_val);

    let bundle_path = config.weights_path();
    let artifact_dir = bundle_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join("training_artifacts");
    std::fs::create_dir_all(&artifact_dir)
        .with_context(|| format!("Failed to create artifact directory: {:?}", artifact_dir))?;
    let artifact_dir_str = artifact_dir.to_string_lossy().to_string();

    tracing::info!(
        "Epochs: {}, batch size: {}, learning rate: {}",
        settings.num_epochs,
        settings.batch_size,
        settings.learning_rate
    );

    let mut builder = LearnerBuilder::new(&artifact_dir_str)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .learning_strategy(LearningStrategy::SingleDevice(device.clone()))
        .num_epochs(settings.num_epochs);
    if settings.summary {
        builder = builder.summary();
    }
    let learner = builder.build(model, AdamConfig::new().init(), settings.learning_rate);

    let trained = learner.fit(dataloader_train, dataloader_val.clone()).model;

    let validation_accuracy = if validation_samples > 0 {
        Some(evaluate(&trained, dataloader_val)?)
    } else {
        None
    };
    if let Some(accuracy) = validation_accuracy {
        tracing::info!("Validation accuracy: {:.2}%", accuracy * 100.0);
    }

    let mut metadata = ModelMetadata::new(class_names, scale, settings.num_epochs as u32)
        .with_train_samples(train_samples);
    if let Some(accuracy) = validation_accuracy {
        metadata = metadata.with_validation_accuracy(accuracy);
    }
    if let Some(path) = &backbone_path {
        metadata = metadata.with_backbone(path.display().to_string());
    }

    // 全層を学習した場合はバックボーンを次回の転移学習・フォールバック用に残す
    let exported_backbone = match config.fallback_backbone_path() {
        Some(path) if backbone_path.is_none() => {
            save_backbone(&trained, &path)?;
            tracing::info!("Saved backbone weights to {}", path.display());
            Some(path)
        }
        _ => None,
    };

    save_model_with_metadata(&bundle_path, &metadata, &model_to_bytes(trained)?)?;
    tracing::info!("Saved model bundle to {}", bundle_path.display());

    let catalog_path = config.catalog_path();
    catalog.save(&catalog_path)?;
    tracing::info!("Saved label catalog to {}", catalog_path.display());

    std::fs::remove_dir_all(&artifact_dir).ok();

    Ok(TrainingReport {
        num_classes,
        train_samples,
        validation_samples,
        validation_accuracy,
        transfer_learned: backbone_path.is_some(),
        bundle_path,
        catalog_path,
        exported_backbone,
    })
}

/// 検証データでの正解率
fn evaluate<B: Backend>(
    model: &FoodClassifier<B>,
    dataloader: Arc<dyn DataLoader<B, FoodBatch<B>>>,
) -> Result<f32> {
    let mut correct = 0usize;
    let mut total = 0usize;

    for batch in dataloader.iter() {
        let [batch_size, _, _, _] = batch.images.dims();
        let predictions = model
            .forward(batch.images)
            .argmax(1)
            .reshape([batch_size])
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))?;
        let targets = batch
            .targets
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|e| anyhow::anyhow!("正解ラベルの取得エラー: {:?}", e))?;

        correct += predictions
            .iter()
            .zip(&targets)
            .filter(|(p, t)| p == t)
            .count();
        total += batch_size;
    }

    Ok(if total == 0 {
        0.0
    } else {
        correct as f32 / total as f32
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_image(path: &Path, color: [u8; 3]) {
        RgbImage::from_pixel(32, 32, Rgb(color)).save(path).unwrap();
    }

    fn make_dataset(root: &Path, classes: &[(&str, usize)]) {
        for (name, count) in classes {
            let dir = root.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                write_image(&dir.join(format!("{}.png", i)), [i as u8 * 40, 100, 200]);
            }
        }
    }

    #[test]
    fn test_classes_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        make_dataset(dir.path(), &[("sushi", 2), ("apple_pie", 3), ("pizza", 1)]);
        std::fs::write(dir.path().join("pizza").join("notes.txt"), "ignored").unwrap();

        let dataset = FoodDataset::from_directory(dir.path()).unwrap();

        assert_eq!(dataset.class_names(), &["apple_pie", "pizza", "sushi"]);
        assert_eq!(dataset.len(), 6);
        assert_eq!(dataset.get(0).unwrap().label, 0);
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FoodDataset::from_directory(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_no_classes() {
        let dir = tempfile::tempdir().unwrap();
        let err = FoodDataset::from_directory(dir.path()).unwrap_err();
        assert!(err.to_string().contains("No class directories"));
    }

    #[test]
    fn test_empty_class_is_named() {
        let dir = tempfile::tempdir().unwrap();
        make_dataset(dir.path(), &[("ramen", 2), ("tacos", 0)]);

        let err = FoodDataset::from_directory(dir.path()).unwrap_err();
        assert!(err.to_string().contains("tacos"));
    }

    #[test]
    fn test_split_is_seeded() {
        let dir = tempfile::tempdir().unwrap();
        make_dataset(dir.path(), &[("a", 5), ("b", 5)]);
        let dataset = FoodDataset::from_directory(dir.path()).unwrap();

        let (train_a, val_a) = dataset.clone().split(0.8, 7);
        let (train_b, _) = dataset.split(0.8, 7);

        assert_eq!(train_a.len(), 8);
        assert_eq!(val_a.len(), 2);
        assert_eq!(train_a.samples, train_b.samples);
    }

    #[test]
    fn test_batcher_shapes_and_flip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("half.png");
        let mut image = RgbImage::from_pixel(32, 32, Rgb([0, 0, 0]));
        for y in 0..32 {
            for x in 0..16 {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        image.save(&path).unwrap();
        let item = FoodItem { path, label: 1 };

        let batcher = FoodBatcher::new(PixelScale::Unit);
        let flip = Transform {
            flip: true,
            ..Transform::IDENTITY
        };
        let plain = batcher.pixels(&item, None);
        let flipped = batcher.pixels(&item, Some(&flip));
        // 左端が白、反転後は右端が白
        assert!(plain[0] > 0.9);
        assert!(flipped[0] < 0.1);
        assert!(flipped[(INPUT_SIZE - 1) * 3] > 0.9);
        assert_eq!(batcher.pixels(&item, Some(&Transform::IDENTITY)), plain);

        let augmented = batcher.with_augmentation(Augmentation::from_settings(&TrainingSettings::default()));
        let batch: FoodBatch<NdArray> =
            augmented.batch(vec![item.clone(), item], &NdArrayDevice::Cpu);
        assert_eq!(batch.images.dims(), [2, 3, INPUT_SIZE, INPUT_SIZE]);
        assert_eq!(batch.targets.dims(), [2]);
    }

    /// 値が `行 * 10 + 列` の 1チャンネル画像
    fn index_image(size: usize) -> Array3<f32> {
        Array3::from_shape_fn((size, size, 1), |(r, c, _)| (r * 10 + c) as f32)
    }

    #[test]
    fn test_shift_samples_neighbouring_rows() {
        let image = index_image(8);
        let shifted = Transform {
            shift_rows: 2.0,
            ..Transform::IDENTITY
        }
        .apply(image.view());

        assert_eq!(shifted[[0, 3, 0]], image[[2, 3, 0]]);
        assert_eq!(shifted[[5, 1, 0]], image[[7, 1, 0]]);
        // 範囲外は端の画素
        assert_eq!(shifted[[7, 4, 0]], image[[7, 4, 0]]);
    }

    #[test]
    fn test_quarter_rotation() {
        let image = index_image(5);
        let rotated = Transform {
            rotation: std::f32::consts::FRAC_PI_2,
            ..Transform::IDENTITY
        }
        .apply(image.view());

        for r in 0..5 {
            for c in 0..5 {
                assert!((rotated[[r, c, 0]] - image[[4 - c, r, 0]]).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn test_zoom_keeps_center() {
        let image = index_image(5);
        let zoomed = Transform {
            zoom_rows: 0.5,
            zoom_cols: 0.5,
            ..Transform::IDENTITY
        }
        .apply(image.view());

        assert_eq!(zoomed[[2, 2, 0]], image[[2, 2, 0]]);
        // 中心から2画素先は入力の1画素先
        assert_eq!(zoomed[[4, 2, 0]], image[[3, 2, 0]]);
    }

    #[test]
    fn test_sampled_transform_stays_in_range() {
        use rand::SeedableRng;

        let augmentation = Augmentation::from_settings(&TrainingSettings::default());
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let t = augmentation.sample(&mut rng, INPUT_SIZE);
            assert!(t.rotation.abs() <= 20f32.to_radians() + 1e-6);
            assert!(t.shift_rows.abs() <= 0.2 * INPUT_SIZE as f32 + 1e-3);
            assert!((0.8 - 1e-6..=1.2 + 1e-6).contains(&t.zoom_cols));
        }

        let none = Augmentation {
            horizontal_flip: false,
            rotation_degrees: 0.0,
            shift: 0.0,
            shear_degrees: 0.0,
            zoom: 0.0,
        };
        assert_eq!(none.sample(&mut rng, INPUT_SIZE), Transform::IDENTITY);
    }

    fn training_config(root: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.device_type = DeviceType::Cpu;
        config.model.weights_path = root.join("models/food_classifier.tar.gz").display().to_string();
        config.model.fallback_backbone = Some(root.join("models/backbone.bin").display().to_string());
        config.catalog.path = root.join("classes.txt").display().to_string();
        config.training.num_epochs = 1;
        config.training.batch_size = 2;
        config.training.summary = false;
        config
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        make_dataset(&dir.path().join("data"), &[("ramen", 3), ("tacos", 3)]);
        let mut config = training_config(dir.path());
        config.training.batch_size = 0;

        let err = train_model(&dir.path().join("data"), &config).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    #[ignore = "trains a full CNN on CPU; slow in debug builds"]
    fn test_train_writes_bundle_catalog_and_backbone() {
        use crate::adapter::{ModelLoader, WeightsKind};
        use crate::ml::BurnModelLoader;

        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        make_dataset(&data, &[("ramen", 3), ("tacos", 3)]);
        let config = training_config(dir.path());

        let report = train_model(&data, &config).unwrap();

        assert_eq!(report.num_classes, 2);
        assert!(!report.transfer_learned);
        assert!(report.bundle_path.exists());
        assert_eq!(
            LabelCatalog::load(&report.catalog_path).unwrap(),
            LabelCatalog::new(vec!["ramen".into(), "tacos".into()]).unwrap()
        );
        let backbone = report.exported_backbone.clone().unwrap();
        assert!(backbone.exists());

        let loaded = BurnModelLoader::new(DeviceType::Cpu, &report.bundle_path)
            .load_specialized(2)
            .unwrap();
        assert_eq!(loaded.weights, WeightsKind::Specialized);

        // 2回目は書き出したバックボーンで転移学習
        let second = train_model(&data, &config).unwrap();
        assert!(second.transfer_learned);
        assert!(second.exported_backbone.is_none());
        let (metadata, _) = crate::model::load_model_with_metadata(&second.bundle_path).unwrap();
        assert_eq!(metadata.backbone, Some(backbone.display().to_string()));
    }
}
