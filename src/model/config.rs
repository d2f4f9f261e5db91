//! アプリケーション設定管理モジュール
//!
//! サーバー・カタログ・モデル・前処理・学習の設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::preprocess::{EnhanceFactors, PixelScale, ResizeFilter};

/// 設定ファイルパスを指定する環境変数
pub const CONFIG_ENV_VAR: &str = "FOOD_RECOGNIZER_CONFIG";

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// HTTPサーバー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// アップロードの最大サイズ（バイト）
    pub max_upload_bytes: usize,
    /// 起動時にラベルカタログの読み込みを必須とするか
    pub require_catalog_at_startup: bool,
    /// 起動時にモデルも読み込むか（失敗しても起動は継続）
    pub preload_model: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5001,
            max_upload_bytes: 16 * 1024 * 1024,
            require_catalog_at_startup: true,
            preload_model: false,
        }
    }
}

/// ラベルカタログ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    /// `.json` なら index→label のマッピング、それ以外は1行1ラベルのテキスト
    pub path: String,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            path: "food_classes.txt".to_string(),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// 専用モデルバンドル（tar.gz）のパス
    pub weights_path: String,
    /// 専用モデルが無い場合に汎用バックボーンへフォールバックするか
    pub allow_fallback: bool,
    /// 汎用バックボーンの重みファイル
    pub fallback_backbone: Option<String>,
    /// 専用モデルバンドルの取得元URL
    pub weights_url: Option<String>,
    /// 専用モデルが無い場合に読み込み時に自動ダウンロードするか
    pub download_on_missing: bool,
    /// モデルが期待する画素スケール
    pub input_scale: PixelScale,
    /// ドロップアウト率
    pub dropout: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            weights_path: "models/food_classifier.tar.gz".to_string(),
            allow_fallback: true,
            fallback_backbone: Some("models/backbone.bin".to_string()),
            weights_url: None,
            download_on_missing: false,
            input_scale: PixelScale::Unit,
            dropout: 0.2,
        }
    }
}

/// 前処理設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessSettings {
    /// コントラスト・明るさ・彩度の補正を行うか
    pub enhance: bool,
    pub enhance_factors: EnhanceFactors,
    pub resize_filter: ResizeFilter,
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            enhance: true,
            enhance_factors: EnhanceFactors::default(),
            resize_filter: ResizeFilter::default(),
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// トレーニングデータの割合
    pub train_ratio: f32,
    /// 学習時に左右反転の拡張を行うか
    pub horizontal_flip: bool,
    /// 回転の範囲（度）
    pub rotation_range: f32,
    /// 平行移動の範囲（画像サイズに対する割合）
    pub shift_range: f32,
    /// せん断角の範囲（度）
    pub shear_range: f32,
    /// 拡大縮小の範囲（1 ± zoom_range）
    pub zoom_range: f32,
    /// 学習終了時にサマリーを表示するか
    pub summary: bool,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 1,
            batch_size: 32,
            num_workers: 0,
            learning_rate: 1e-3,
            seed: 42,
            train_ratio: 0.8,
            horizontal_flip: true,
            rotation_range: 20.0,
            shift_range: 0.2,
            shear_range: 0.2,
            zoom_range: 0.2,
            summary: true,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    pub server: ServerSettings,
    pub catalog: CatalogSettings,
    pub model: ModelSettings,
    pub preprocessing: PreprocessSettings,
    pub training: TrainingSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス（環境変数で上書き可能）
    pub fn default_path() -> PathBuf {
        std::env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.json"))
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to read config file {} ({}), using defaults",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// デフォルトパスから設定を読み込む
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(Self::default_path())
    }

    /// 待ち受けアドレス
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn weights_path(&self) -> PathBuf {
        PathBuf::from(&self.model.weights_path)
    }

    pub fn catalog_path(&self) -> PathBuf {
        PathBuf::from(&self.catalog.path)
    }

    pub fn fallback_backbone_path(&self) -> Option<PathBuf> {
        self.model.fallback_backbone.as_ref().map(PathBuf::from)
    }
}
