//! モデルメタデータの定義
//!
//! モデルバンドル（tar.gz）に同梱され、重みがどのカタログ・入力契約で
//! 学習されたかを記録します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::preprocess::{PixelScale, INPUT_SIZE};

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラスラベル（インデックス順）
    /// 例: ["apple_pie", "baby_back_ribs", ...]
    pub class_labels: Vec<String>,

    /// モデル入力サイズ（正方形、通常224）
    #[serde(default = "default_input_size")]
    pub input_size: u32,

    /// 学習時の入力画素スケール
    #[serde(default)]
    pub input_scale: PixelScale,

    /// 汎用バックボーンから転移学習したか
    #[serde(default)]
    pub backbone: Option<String>,

    /// 学習エポック数
    pub num_epochs: u32,

    /// 学習サンプル数
    #[serde(default)]
    pub train_samples: usize,

    /// 最終エポック後の検証精度（0..1）
    #[serde(default)]
    pub validation_accuracy: Option<f32>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

fn default_input_size() -> u32 {
    INPUT_SIZE as u32
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(class_labels: Vec<String>, input_scale: PixelScale, num_epochs: u32) -> Self {
        Self {
            class_labels,
            input_size: default_input_size(),
            input_scale,
            backbone: None,
            num_epochs,
            train_samples: 0,
            validation_accuracy: None,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn with_backbone(mut self, backbone: impl Into<String>) -> Self {
        self.backbone = Some(backbone.into());
        self
    }

    pub fn with_train_samples(mut self, train_samples: usize) -> Self {
        self.train_samples = train_samples;
        self
    }

    pub fn with_validation_accuracy(mut self, accuracy: f32) -> Self {
        self.validation_accuracy = Some(accuracy);
        self
    }

    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_defaults_for_older_bundles() {
        let json = r#"{
            "class_labels": ["pizza", "sushi"],
            "num_epochs": 3,
            "trained_at": "2024-05-01T10:00:00+09:00"
        }"#;
        let metadata = ModelMetadata::from_json_string(json).unwrap();

        assert_eq!(metadata.num_classes(), 2);
        assert_eq!(metadata.input_size, 224);
        assert_eq!(metadata.input_scale, PixelScale::Unit);
        assert!(metadata.backbone.is_none());
        assert!(metadata.validation_accuracy.is_none());
    }

    #[test]
    fn test_builder_fields_survive_json() {
        let metadata = ModelMetadata::new(vec!["ramen".into()], PixelScale::Raw, 5)
            .with_backbone("models/backbone.bin")
            .with_train_samples(120)
            .with_validation_accuracy(0.875);

        let json = metadata.to_json_string().unwrap();
        let restored = ModelMetadata::from_json_string(&json).unwrap();

        assert_eq!(restored, metadata);
    }

    #[test]
    fn test_invalid_json() {
        assert!(ModelMetadata::from_json_string("{not json").is_err());
    }
}
