//! 推論アダプタ
//!
//! 分類モデルを `Classifier` トレイトの背後に隠し、遅延読み込み・
//! フォールバック・入力/出力の検証を担当します。
//! 具体的なバックエンド（burn など）は `ModelLoader` として差し替え可能です。

use std::sync::Arc;

use crate::catalog::{CatalogError, LabelCatalog};
use crate::download::{FetchError, WeightsFetcher};
use crate::preprocess::{ImageTensor, PixelScale, INPUT_SHAPE};
use crate::slot::LoadSlot;

/// 正規化済みテンソルから確率ベクトルを返す分類器
pub trait Classifier: Send + Sync {
    fn classify(&self, tensor: &ImageTensor) -> Result<Vec<f32>, InferenceError>;

    /// 出力次元
    fn num_classes(&self) -> usize;

    /// 入力テンソルに期待する画素スケール
    fn input_scale(&self) -> PixelScale;
}

/// 読み込まれた重みの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightsKind {
    /// ファインチューニング済みの専用重み
    Specialized,
    /// 汎用バックボーン + 未学習ヘッド
    Fallback,
}

pub struct LoadedModel {
    pub classifier: Box<dyn Classifier>,
    pub weights: WeightsKind,
    pub model_type: String,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("num_classes", &self.classifier.num_classes())
            .field("weights", &self.weights)
            .field("model_type", &self.model_type)
            .finish()
    }
}

/// モデルの読み込み（ブロッキング）
pub trait ModelLoader: Send + Sync {
    /// 専用の重みを読み込む
    ///
    /// 重みファイルが無い場合は `LoadError::WeightsNotFound` を返すこと。
    fn load_specialized(&self, num_classes: usize) -> Result<LoadedModel, LoadError>;

    /// 汎用バックボーンへのフォールバック（ポリシー未設定なら `None`）
    fn load_fallback(&self, num_classes: usize) -> Option<Result<LoadedModel, LoadError>>;
}

/// バックエンドを含まないビルド用のローダー
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableLoader;

impl ModelLoader for UnavailableLoader {
    fn load_specialized(&self, _num_classes: usize) -> Result<LoadedModel, LoadError> {
        Err(LoadError::Unavailable)
    }

    fn load_fallback(&self, _num_classes: usize) -> Option<Result<LoadedModel, LoadError>> {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("model weights not found at {path}")]
    WeightsNotFound { path: String },
    #[error("failed to download model weights: {0}")]
    Download(#[from] FetchError),
    #[error("invalid model bundle: {0}")]
    InvalidBundle(String),
    #[error("model produces {model} classes but the label catalog has {catalog}")]
    CatalogMismatch { model: usize, catalog: usize },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("model backend error: {0}")]
    Backend(String),
    #[error("no model backend is compiled into this build")]
    Unavailable,
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("input tensor has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        expected: [usize; 4],
        actual: Vec<usize>,
    },
    #[error("input tensor is scaled to {actual}, model expects {expected}")]
    ScaleMismatch {
        expected: PixelScale,
        actual: PixelScale,
    },
    #[error("model returned {output} scores but the label catalog has {catalog}")]
    CatalogMismatch { output: usize, catalog: usize },
    #[error("model returned score {value} for class {index}, outside [0, 1]")]
    OutOfRange { index: usize, value: f32 },
    #[error("model backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

pub struct InferenceAdapter {
    loader: Arc<dyn ModelLoader>,
    fetcher: Option<WeightsFetcher>,
    slot: LoadSlot<LoadedModel>,
}

impl InferenceAdapter {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            fetcher: None,
            slot: LoadSlot::new(),
        }
    }

    /// 専用の重みが無い場合に読み込み時にダウンロードを試みる
    pub fn with_auto_download(mut self, fetcher: WeightsFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn is_ready(&self) -> bool {
        self.slot.is_loaded()
    }

    /// 読み込み済みのモデル（読み込みは行わない）
    pub fn current(&self) -> Option<Arc<LoadedModel>> {
        self.slot.get()
    }

    /// 未読み込みなら読み込む（冪等）
    pub async fn load(&self, catalog: &LabelCatalog) -> Result<Arc<LoadedModel>, LoadError> {
        let num_classes = catalog.len();
        self.slot
            .get_or_try_load(|| self.load_fresh(num_classes))
            .await
    }

    /// 読み込み済みでも読み込み直す（失敗時は以前のモデルを維持）
    pub async fn reload(&self, catalog: &LabelCatalog) -> Result<Arc<LoadedModel>, LoadError> {
        let num_classes = catalog.len();
        self.slot.replace_with(|| self.load_fresh(num_classes)).await
    }

    async fn load_fresh(&self, num_classes: usize) -> Result<LoadedModel, LoadError> {
        let model = match self.run_blocking(num_classes, false).await {
            Err(LoadError::WeightsNotFound { path }) => self.recover_missing(num_classes, path).await?,
            other => other?,
        };

        let model_classes = model.classifier.num_classes();
        if model_classes != num_classes {
            return Err(LoadError::CatalogMismatch {
                model: model_classes,
                catalog: num_classes,
            });
        }

        tracing::info!(
            "Model loaded: {} ({} classes, {:?} weights)",
            model.model_type,
            model_classes,
            model.weights
        );
        Ok(model)
    }

    /// 専用の重みが無い場合: ダウンロード → フォールバック の順に試す
    async fn recover_missing(
        &self,
        num_classes: usize,
        path: String,
    ) -> Result<LoadedModel, LoadError> {
        let mut download_error: Option<FetchError> = None;

        if let Some(fetcher) = &self.fetcher {
            tracing::warn!("Weights not found at {}, attempting download", path);
            match fetcher.fetch().await {
                Ok(_) => return self.run_blocking(num_classes, false).await,
                Err(e) => download_error = Some(e),
            }
        }

        match (self.run_blocking(num_classes, true).await, download_error.take()) {
            (Ok(model), _) => {
                tracing::warn!(
                    "Specialized weights unavailable at {}, using fallback backbone",
                    path
                );
                Ok(model)
            }
            (Err(LoadError::WeightsNotFound { .. } | LoadError::Unavailable), Some(e)) => {
                Err(LoadError::Download(e))
            }
            (Err(LoadError::WeightsNotFound { .. } | LoadError::Unavailable), None) => {
                Err(LoadError::WeightsNotFound { path })
            }
            (Err(e), _) => Err(e),
        }
    }

    async fn run_blocking(&self, num_classes: usize, fallback: bool) -> Result<LoadedModel, LoadError> {
        let loader = self.loader.clone();
        tokio::task::spawn_blocking(move || {
            if fallback {
                loader
                    .load_fallback(num_classes)
                    .unwrap_or(Err(LoadError::Unavailable))
            } else {
                loader.load_specialized(num_classes)
            }
        })
        .await
        .map_err(|e| LoadError::Backend(format!("model loading task failed: {}", e)))?
    }

    /// テンソルを分類し、カタログと同じ長さの確率ベクトルを返す
    ///
    /// 未読み込みの場合はここで読み込む。
    pub async fn classify(
        &self,
        tensor: ImageTensor,
        catalog: &LabelCatalog,
    ) -> Result<Vec<f32>, ClassifyError> {
        let model = self.load(catalog).await?;

        if tensor.shape() != INPUT_SHAPE {
            return Err(InferenceError::ShapeMismatch {
                expected: INPUT_SHAPE,
                actual: tensor.shape().to_vec(),
            }
            .into());
        }

        let expected_scale = model.classifier.input_scale();
        if tensor.scale() != expected_scale {
            return Err(InferenceError::ScaleMismatch {
                expected: expected_scale,
                actual: tensor.scale(),
            }
            .into());
        }

        let output = tokio::task::spawn_blocking(move || model.classifier.classify(&tensor))
            .await
            .map_err(|e| InferenceError::Backend(format!("inference task failed: {}", e)))??;

        validate_output(&output, catalog.len())?;
        Ok(output)
    }
}

fn validate_output(output: &[f32], catalog_len: usize) -> Result<(), InferenceError> {
    if output.len() != catalog_len {
        return Err(InferenceError::CatalogMismatch {
            output: output.len(),
            catalog: catalog_len,
        });
    }

    if let Some((index, &value)) = output
        .iter()
        .enumerate()
        .find(|(_, v)| !(0.0..=1.0).contains(*v))
    {
        return Err(InferenceError::OutOfRange { index, value });
    }

    Ok(())
}
