use serde::{Deserialize, Serialize};

/// 上位候補の1件（インデックス・ラベル・信頼度）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedLabel {
    pub index: usize,
    pub label: String,
    pub confidence: f32,
}

/// `/predict` のレスポンス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub ingredient: String,
    pub confidence: f32,
    pub alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    pub name: String,
    pub confidence: f32,
}

impl PredictionResponse {
    /// 先頭を主結果、残りを代替候補として組み立てる
    ///
    /// 空のリストに対しては `None` を返す。
    pub fn from_ranked(ranked: &[RankedLabel]) -> Option<Self> {
        let (primary, rest) = ranked.split_first()?;
        Some(Self {
            ingredient: primary.label.clone(),
            confidence: primary.confidence,
            alternatives: rest
                .iter()
                .map(|r| Alternative {
                    name: r.label.clone(),
                    confidence: r.confidence,
                })
                .collect(),
        })
    }
}

/// `/model-status` のレスポンス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub model_loaded: bool,
    pub classes_loaded: bool,
    pub number_of_classes: usize,
    /// 専用（ファインチューニング済み）の重みが有効か
    pub using_pretrained_weights: bool,
    /// 汎用バックボーンへのフォールバック中か
    pub using_fallback_weights: bool,
    pub model_type: Option<String>,
}

/// ダウンロード系エンドポイントのレスポンス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub status: String,
    pub message: String,
}

impl OperationStatus {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(label: &str, confidence: f32, index: usize) -> RankedLabel {
        RankedLabel {
            index,
            label: label.to_string(),
            confidence,
        }
    }

    #[test]
    fn test_response_from_ranked() {
        let list = vec![
            ranked("Pizza", 0.7, 3),
            ranked("Lasagna", 0.2, 1),
            ranked("Garlic Bread", 0.05, 0),
        ];
        let response = PredictionResponse::from_ranked(&list).unwrap();

        assert_eq!(response.ingredient, "Pizza");
        assert_eq!(response.confidence, 0.7);
        assert_eq!(response.alternatives.len(), 2);
        assert_eq!(response.alternatives[0].name, "Lasagna");
        assert_eq!(response.alternatives[1].name, "Garlic Bread");
    }

    #[test]
    fn test_response_from_empty() {
        assert!(PredictionResponse::from_ranked(&[]).is_none());
    }

    #[test]
    fn test_response_json_shape() {
        let response = PredictionResponse::from_ranked(&[ranked("Sushi", 0.9, 0)]).unwrap();
        let json = serde_json::to_value(&response).unwrap();

        assert!(json.get("ingredient").is_some());
        assert!(json.get("confidence").is_some());
        assert_eq!(json["alternatives"], serde_json::json!([]));
    }
}
