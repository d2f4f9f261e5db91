//! 上位K件の選択

use crate::catalog::LabelCatalog;
use crate::types::RankedLabel;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopKError {
    #[error("label catalog is empty")]
    EmptyCatalog,
    #[error("k must be between 1 and {len}, got {k}")]
    InvalidK { k: usize, len: usize },
    #[error("prediction has {vector} entries but the catalog has {catalog} labels")]
    CatalogMismatch { vector: usize, catalog: usize },
}

/// 確率ベクトルから上位 `k` 件を信頼度の降順で返す
///
/// 同値の場合はインデックスの小さい方が先（安定ソート）。
/// ラベルは表示用に変換される。
pub fn top_k(
    vector: &[f32],
    catalog: &LabelCatalog,
    k: usize,
) -> Result<Vec<RankedLabel>, TopKError> {
    if catalog.is_empty() {
        return Err(TopKError::EmptyCatalog);
    }
    if k < 1 || k > vector.len() {
        return Err(TopKError::InvalidK {
            k,
            len: vector.len(),
        });
    }
    if vector.len() > catalog.len() {
        return Err(TopKError::CatalogMismatch {
            vector: vector.len(),
            catalog: catalog.len(),
        });
    }

    let mut indices: Vec<usize> = (0..vector.len()).collect();
    indices.sort_by(|&a, &b| vector[b].total_cmp(&vector[a]));

    Ok(indices
        .into_iter()
        .take(k)
        .filter_map(|index| {
            catalog.display_label(index).map(|label| RankedLabel {
                index,
                label,
                confidence: vector[index],
            })
        })
        .collect())
}
