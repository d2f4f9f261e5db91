//! 食品認識サービス本体
//!
//! ラベルカタログ・推論アダプタ・画像ノーマライザを束ね、
//! 1リクエスト分の処理（読み込み → デコード → 推論 → 上位K件）を行います。
//! HTTP層からは `Arc<Recognizer>` として共有されます。

use std::path::PathBuf;
use std::sync::Arc;

use crate::adapter::{ClassifyError, InferenceAdapter, InferenceError, LoadError, LoadedModel, ModelLoader, WeightsKind};
use crate::catalog::{CatalogError, LabelCatalog};
use crate::download::{FetchError, WeightsFetcher};
use crate::model::config::AppConfig;
use crate::preprocess::{DecodeError, ImageNormalizer};
use crate::slot::LoadSlot;
use crate::top_k::{top_k, TopKError};
use crate::types::{ModelStatus, PredictionResponse};

/// 返す候補数（主結果 + 代替2件）
pub const DEFAULT_TOP_K: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("No image file provided")]
    MissingImage,
    #[error("Invalid upload: {0}")]
    InvalidUpload(String),
    #[error("Uploaded file is too large")]
    UploadTooLarge,
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Invalid image: {0}")]
    Decode(#[from] DecodeError),
    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("Ranking failed: {0}")]
    TopK(#[from] TopKError),
    #[error("Ranking produced no labels")]
    EmptyRanking,
}

impl From<CatalogError> for PredictError {
    fn from(e: CatalogError) -> Self {
        PredictError::ServiceUnavailable(format!("failed to load food classes: {}", e))
    }
}

impl From<LoadError> for PredictError {
    fn from(e: LoadError) -> Self {
        PredictError::ServiceUnavailable(format!("failed to load model: {}", e))
    }
}

impl From<ClassifyError> for PredictError {
    fn from(e: ClassifyError) -> Self {
        match e {
            ClassifyError::Load(e) => e.into(),
            ClassifyError::Inference(e) => e.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("No pre-trained weights URL is configured")]
    NotConfigured,
    #[error("Failed to download pre-trained weights: {0}")]
    Fetch(#[from] FetchError),
    #[error("Weights downloaded but could not be loaded: {0}")]
    Reload(String),
}

pub struct Recognizer {
    catalog_path: PathBuf,
    catalog: LoadSlot<LabelCatalog>,
    adapter: InferenceAdapter,
    normalizer: ImageNormalizer,
    fetcher: Option<WeightsFetcher>,
    download_guard: tokio::sync::Mutex<()>,
    top_k: usize,
}

impl Recognizer {
    pub fn new(catalog_path: impl Into<PathBuf>, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            catalog_path: catalog_path.into(),
            catalog: LoadSlot::new(),
            adapter: InferenceAdapter::new(loader),
            normalizer: ImageNormalizer::new(),
            fetcher: None,
            download_guard: tokio::sync::Mutex::new(()),
            top_k: DEFAULT_TOP_K,
        }
    }

    /// 設定から作成
    pub fn from_config(config: &AppConfig, loader: Arc<dyn ModelLoader>) -> Self {
        let mut recognizer = Self::new(config.catalog_path(), loader)
            .with_normalizer(ImageNormalizer::from_settings(&config.preprocessing));

        if let Some(fetcher) = WeightsFetcher::from_config(config) {
            if config.model.download_on_missing {
                recognizer.adapter = recognizer.adapter.with_auto_download(fetcher.clone());
            }
            recognizer.fetcher = Some(fetcher);
        }
        recognizer
    }

    pub fn with_normalizer(mut self, normalizer: ImageNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_fetcher(mut self, fetcher: WeightsFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// ラベルカタログを読み込む（読み込み済みならそのまま返す）
    pub async fn load_catalog(&self) -> Result<Arc<LabelCatalog>, CatalogError> {
        self.catalog
            .get_or_try_load(|| async {
                let path = self.catalog_path.clone();
                let catalog = tokio::task::spawn_blocking(move || LabelCatalog::load(&path))
                    .await
                    .map_err(|e| CatalogError::Io {
                        path: self.catalog_path.display().to_string(),
                        source: std::io::Error::other(e),
                    })??;
                tracing::info!(
                    "Loaded {} food classes from {}",
                    catalog.len(),
                    self.catalog_path.display()
                );
                Ok::<_, CatalogError>(catalog)
            })
            .await
    }

    /// カタログとモデルを読み込む
    pub async fn ensure_ready(&self) -> Result<(Arc<LabelCatalog>, Arc<LoadedModel>), PredictError> {
        let catalog = self.load_catalog().await?;
        let model = self.adapter.load(&catalog).await?;
        Ok((catalog, model))
    }

    /// アップロードされた画像を分類
    pub async fn predict(&self, image: Vec<u8>) -> Result<PredictionResponse, PredictError> {
        if image.is_empty() {
            return Err(PredictError::MissingImage);
        }

        let (catalog, model) = self.ensure_ready().await?;

        // モデルが期待するスケールで正規化する
        let scale = model.classifier.input_scale();
        let normalizer = self.normalizer.clone();
        let tensor = tokio::task::spawn_blocking(move || normalizer.normalize(&image, scale))
            .await
            .map_err(|e| InferenceError::Backend(format!("image decoding task failed: {}", e)))??;

        let scores = self.adapter.classify(tensor, &catalog).await?;
        let ranked = top_k(&scores, &catalog, self.top_k.min(scores.len()))?;

        let response =
            PredictionResponse::from_ranked(&ranked).ok_or(PredictError::EmptyRanking)?;
        tracing::info!(
            "Prediction successful: {} ({:.3})",
            response.ingredient,
            response.confidence
        );
        Ok(response)
    }

    /// 現在の状態（読み込みは行わない）
    pub fn status(&self) -> ModelStatus {
        let catalog = self.catalog.get();
        let model = self.adapter.current();

        ModelStatus {
            model_loaded: model.is_some(),
            classes_loaded: catalog.is_some(),
            number_of_classes: catalog.as_ref().map_or(0, |c| c.len()),
            using_pretrained_weights: model
                .as_ref()
                .is_some_and(|m| m.weights == WeightsKind::Specialized),
            using_fallback_weights: model
                .as_ref()
                .is_some_and(|m| m.weights == WeightsKind::Fallback),
            model_type: model.as_ref().map(|m| m.model_type.clone()),
        }
    }

    /// 専用の重みをダウンロードしてモデルを読み込み直す
    pub async fn download_weights(&self) -> Result<String, DownloadError> {
        let fetcher = self.fetcher.as_ref().ok_or(DownloadError::NotConfigured)?;

        let _guard = self.download_guard.lock().await;
        let received = fetcher.fetch().await?;

        let catalog = self
            .load_catalog()
            .await
            .map_err(|e| DownloadError::Reload(e.to_string()))?;
        self.adapter
            .reload(&catalog)
            .await
            .map_err(|e| DownloadError::Reload(e.to_string()))?;

        tracing::info!("Reloaded model after downloading {} bytes", received);
        Ok("Pre-trained weights downloaded and loaded successfully".to_string())
    }
}
