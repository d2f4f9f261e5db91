//! burnによる推論
//!
//! モデルバンドル（tar.gz）またはバックボーンの重みから `FoodClassifier` を構築し、
//! 推論アダプタの `Classifier` / `ModelLoader` として提供します。

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use burn::{
    backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, NdArray, Wgpu},
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};

use crate::adapter::{Classifier, InferenceError, LoadError, LoadedModel, ModelLoader, WeightsKind};
use crate::ml::{FoodClassifier, ModelConfig};
use crate::model::config::{AppConfig, DeviceType};
use crate::model::{load_model_with_metadata, log_metadata_info};
use crate::preprocess::{ImageTensor, PixelScale, INPUT_SIZE};

/// burnモデルを包んだ分類器
///
/// バックエンドによってはモジュールが `Sync` でないため `Mutex` で保護する。
pub struct BurnClassifier<B: Backend> {
    model: Mutex<FoodClassifier<B>>,
    device: B::Device,
    num_classes: usize,
    input_scale: PixelScale,
}

impl<B: Backend> BurnClassifier<B> {
    pub fn new(model: FoodClassifier<B>, device: B::Device, input_scale: PixelScale) -> Self {
        let num_classes = model.num_classes();
        Self {
            model: Mutex::new(model),
            device,
            num_classes,
            input_scale,
        }
    }
}

impl<B: Backend> Classifier for BurnClassifier<B> {
    fn classify(&self, tensor: &ImageTensor) -> Result<Vec<f32>, InferenceError> {
        let input = crate::ml::to_model_input::<B>(&tensor.to_vec(), 1, self.input_scale, &self.device);

        let model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        model
            .probabilities(input)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| InferenceError::Backend(format!("failed to read model output: {:?}", e)))
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn input_scale(&self) -> PixelScale {
        self.input_scale
    }
}

/// モデルバンドルとフォールバック用バックボーンからの読み込み
#[derive(Debug, Clone)]
pub struct BurnModelLoader {
    device_type: DeviceType,
    weights_path: PathBuf,
    fallback_backbone: Option<PathBuf>,
    fallback_scale: PixelScale,
    dropout: f64,
}

impl BurnModelLoader {
    pub fn new(device_type: DeviceType, weights_path: impl Into<PathBuf>) -> Self {
        Self {
            device_type,
            weights_path: weights_path.into(),
            fallback_backbone: None,
            fallback_scale: PixelScale::default(),
            dropout: 0.0,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let mut loader = Self::new(config.device_type, config.weights_path());
        loader.dropout = config.model.dropout;
        loader.fallback_scale = config.model.input_scale;
        if config.model.allow_fallback {
            loader.fallback_backbone = config.fallback_backbone_path();
        }
        loader
    }

    pub fn with_fallback_backbone(mut self, path: impl Into<PathBuf>, scale: PixelScale) -> Self {
        self.fallback_backbone = Some(path.into());
        self.fallback_scale = scale;
        self
    }

    fn load_bundle<B: Backend>(&self, device: B::Device, num_classes: usize) -> Result<LoadedModel, LoadError> {
        let (metadata, binary) = load_model_with_metadata(&self.weights_path)
            .map_err(|e| LoadError::InvalidBundle(format!("{:#}", e)))?;
        log_metadata_info(&metadata);

        if metadata.input_size as usize != INPUT_SIZE {
            return Err(LoadError::InvalidBundle(format!(
                "model was trained for {}x{} input, expected {}x{}",
                metadata.input_size, metadata.input_size, INPUT_SIZE, INPUT_SIZE
            )));
        }
        if metadata.num_classes() != num_classes {
            return Err(LoadError::CatalogMismatch {
                model: metadata.num_classes(),
                catalog: num_classes,
            });
        }

        let model = ModelConfig::new(num_classes)
            .with_dropout(self.dropout)
            .init::<B>(&device);
        let record = BinBytesRecorder::<FullPrecisionSettings>::default()
            .load(binary, &device)
            .map_err(|e| LoadError::InvalidBundle(format!("failed to restore weights: {:?}", e)))?;
        let model = model.load_record(record);

        Ok(LoadedModel {
            classifier: Box::new(BurnClassifier::new(model, device, metadata.input_scale)),
            weights: WeightsKind::Specialized,
            model_type: format!("FoodClassifier ({})", self.device_type),
        })
    }

    fn load_backbone<B: Backend>(
        &self,
        device: B::Device,
        backbone_path: &Path,
        num_classes: usize,
    ) -> Result<LoadedModel, LoadError> {
        let binary = std::fs::read(backbone_path)
            .map_err(|e| LoadError::Backend(format!("failed to read {}: {}", backbone_path.display(), e)))?;
        let record = BinBytesRecorder::<FullPrecisionSettings>::default()
            .load(binary, &device)
            .map_err(|e| LoadError::InvalidBundle(format!("failed to restore backbone: {:?}", e)))?;

        let model = ModelConfig::new(num_classes)
            .with_dropout(self.dropout)
            .init::<B>(&device)
            .load_backbone_record(record);

        Ok(LoadedModel {
            classifier: Box::new(BurnClassifier::new(model, device, self.fallback_scale)),
            weights: WeightsKind::Fallback,
            model_type: format!("FoodClassifier backbone, untrained head ({})", self.device_type),
        })
    }
}

impl ModelLoader for BurnModelLoader {
    fn load_specialized(&self, num_classes: usize) -> Result<LoadedModel, LoadError> {
        if !self.weights_path.exists() {
            return Err(LoadError::WeightsNotFound {
                path: self.weights_path.display().to_string(),
            });
        }

        tracing::info!(
            "Loading model bundle {} on {}",
            self.weights_path.display(),
            self.device_type
        );
        match self.device_type {
            DeviceType::Wgpu => self.load_bundle::<Wgpu>(WgpuDevice::default(), num_classes),
            DeviceType::Cpu => self.load_bundle::<NdArray>(NdArrayDevice::Cpu, num_classes),
        }
    }

    fn load_fallback(&self, num_classes: usize) -> Option<Result<LoadedModel, LoadError>> {
        let backbone_path = self.fallback_backbone.as_deref()?;
        if !backbone_path.exists() {
            return Some(Err(LoadError::WeightsNotFound {
                path: backbone_path.display().to_string(),
            }));
        }

        tracing::info!(
            "Loading fallback backbone {} on {}",
            backbone_path.display(),
            self.device_type
        );
        Some(match self.device_type {
            DeviceType::Wgpu => self.load_backbone::<Wgpu>(WgpuDevice::default(), backbone_path, num_classes),
            DeviceType::Cpu => self.load_backbone::<NdArray>(NdArrayDevice::Cpu, backbone_path, num_classes),
        })
    }
}

/// バックボーンの重みをバイト列に変換
fn backbone_to_bytes<B: Backend>(model: &FoodClassifier<B>) -> anyhow::Result<Vec<u8>> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(model.backbone().clone().into_record(), ())
        .map_err(|e| anyhow::anyhow!("バックボーンの書き出しエラー: {:?}", e))
}

/// バックボーンの重みをフォールバック用ファイルとして保存
///
/// 親ディレクトリが無ければ作成する。
pub fn save_backbone<B: Backend>(model: &FoodClassifier<B>, path: &Path) -> anyhow::Result<()> {
    use anyhow::Context;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
    }
    std::fs::write(path, backbone_to_bytes(model)?)
        .with_context(|| format!("Failed to write backbone weights: {:?}", path))
}

/// モデル全体の重みをバイト列に変換
pub fn model_to_bytes<B: Backend>(model: FoodClassifier<B>) -> anyhow::Result<Vec<u8>> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(model.into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みの書き出しエラー: {:?}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{save_model_with_metadata, ModelMetadata};
    use ndarray::Array4;

    type TestBackend = NdArray;

    fn write_bundle(path: &Path, labels: &[&str]) {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new(labels.len()).init::<TestBackend>(&device);
        let metadata = ModelMetadata::new(
            labels.iter().map(|s| s.to_string()).collect(),
            PixelScale::Unit,
            1,
        );
        save_model_with_metadata(path, &metadata, &model_to_bytes(model).unwrap()).unwrap();
    }

    fn input() -> ImageTensor {
        ImageTensor::new(Array4::from_elem((1, 224, 224, 3), 0.5), PixelScale::Unit)
    }

    #[test]
    fn test_missing_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let loader = BurnModelLoader::new(DeviceType::Cpu, dir.path().join("none.tar.gz"));

        assert!(matches!(
            loader.load_specialized(3),
            Err(LoadError::WeightsNotFound { .. })
        ));
        assert!(loader.load_fallback(3).is_none());
    }

    #[test]
    fn test_load_bundle_and_classify() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("food_classifier.tar.gz");
        write_bundle(&path, &["pizza", "ramen", "sushi"]);

        let loaded = BurnModelLoader::new(DeviceType::Cpu, &path)
            .load_specialized(3)
            .unwrap();
        assert_eq!(loaded.weights, WeightsKind::Specialized);
        assert_eq!(loaded.classifier.num_classes(), 3);

        let scores = loaded.classifier.classify(&input()).unwrap();
        assert_eq!(scores.len(), 3);
        assert!((scores.iter().sum::<f32>() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_bundle_catalog_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("food_classifier.tar.gz");
        write_bundle(&path, &["pizza", "ramen"]);

        let result = BurnModelLoader::new(DeviceType::Cpu, &path).load_specialized(5);

        assert!(matches!(
            result,
            Err(LoadError::CatalogMismatch { model: 2, catalog: 5 })
        ));
    }

    #[test]
    fn test_corrupt_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("food_classifier.tar.gz");
        std::fs::write(&path, b"not a tarball").unwrap();

        let result = BurnModelLoader::new(DeviceType::Cpu, &path).load_specialized(2);

        assert!(matches!(result, Err(LoadError::InvalidBundle(_))));
    }

    #[test]
    fn test_fallback_backbone_gets_fresh_head() {
        let dir = tempfile::tempdir().unwrap();
        let backbone_path = dir.path().join("backbone.bin");
        let source = ModelConfig::new(10).init::<TestBackend>(&NdArrayDevice::Cpu);
        save_backbone(&source, &backbone_path).unwrap();

        let loader = BurnModelLoader::new(DeviceType::Cpu, dir.path().join("missing.tar.gz"))
            .with_fallback_backbone(&backbone_path, PixelScale::Unit);
        let loaded = loader.load_fallback(4).unwrap().unwrap();

        assert_eq!(loaded.weights, WeightsKind::Fallback);
        assert_eq!(loaded.classifier.num_classes(), 4);
        assert_eq!(loaded.classifier.classify(&input()).unwrap().len(), 4);
    }

    #[test]
    fn test_saved_backbone_keeps_weights() {
        let dir = tempfile::tempdir().unwrap();
        let backbone_path = dir.path().join("models").join("backbone.bin");
        let device = NdArrayDevice::Cpu;
        let source = ModelConfig::new(3).init::<TestBackend>(&device);

        save_backbone(&source, &backbone_path).unwrap();

        let record = BinBytesRecorder::<FullPrecisionSettings>::default()
            .load(std::fs::read(&backbone_path).unwrap(), &device)
            .unwrap();
        let restored = ModelConfig::new(5)
            .init::<TestBackend>(&device)
            .load_backbone_record(record);
        assert_eq!(
            backbone_to_bytes(&restored).unwrap(),
            backbone_to_bytes(&source).unwrap()
        );
    }
}
