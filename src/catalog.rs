//! ラベルカタログ
//!
//! クラスインデックス（0..N-1、欠番なし）から表示用ラベルへの対応表です。
//! 1行1ラベルのテキストファイル、または `{"0": "apple_pie", ...}` 形式の
//! JSONマッピングから読み込みます。

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read label catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("label catalog mapping is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("label catalog key '{0}' is not a class index")]
    InvalidKey(String),
    #[error("label catalog is missing class index {0}")]
    MissingIndex(usize),
    #[error("label catalog contains no labels")]
    Empty,
}

/// インデックス順に並んだクラスラベル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelCatalog {
    labels: Vec<String>,
}

impl LabelCatalog {
    /// ラベル列から作成（空は不可）
    pub fn new(labels: Vec<String>) -> Result<Self, CatalogError> {
        if labels.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(Self { labels })
    }

    /// 1行1ラベルのテキストを解析（前後の空白は除去、空行は無視）
    pub fn from_text(text: &str) -> Result<Self, CatalogError> {
        let labels = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Self::new(labels)
    }

    /// index→label のJSONマッピングを解析
    ///
    /// キーは 0..N-1 をちょうど1回ずつ含む必要がある。
    pub fn from_json_mapping(json: &str) -> Result<Self, CatalogError> {
        let raw: BTreeMap<String, String> = serde_json::from_str(json)?;

        let mut indexed = BTreeMap::new();
        for (key, label) in raw {
            let index: usize = key
                .trim()
                .parse()
                .map_err(|_| CatalogError::InvalidKey(key.clone()))?;
            if indexed.insert(index, label).is_some() {
                return Err(CatalogError::InvalidKey(key));
            }
        }

        let mut labels = Vec::with_capacity(indexed.len());
        for (expected, (index, label)) in indexed.into_iter().enumerate() {
            if index != expected {
                return Err(CatalogError::MissingIndex(expected));
            }
            labels.push(label);
        }

        Self::new(labels)
    }

    /// 拡張子で形式を判定してファイルから読み込む
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;

        if is_json(path) {
            Self::from_json_mapping(&content)
        } else {
            Self::from_text(&content)
        }
    }

    /// 拡張子に合わせた形式でファイルへ書き出す
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let content = if is_json(path) {
            let mapping: BTreeMap<String, &String> = self
                .labels
                .iter()
                .enumerate()
                .map(|(i, label)| (i.to_string(), label))
                .collect();
            serde_json::to_string_pretty(&mapping)?
        } else {
            let mut text = self.labels.join("\n");
            text.push('\n');
            text
        };

        fs::write(path, content)
            .with_context(|| format!("Failed to write label catalog: {:?}", path))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// 生のラベル
    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    /// 表示用ラベル（`french_fries` → `French Fries`）
    pub fn display_label(&self, index: usize) -> Option<String> {
        self.get(index).map(display_label)
    }
}

/// `.json`（大文字小文字を問わない）ならJSONマッピング、それ以外はテキスト
fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// アンダースコアを空白にし、単語ごとに先頭を大文字化する
///
/// 英字の連続の先頭のみ大文字、それ以外は小文字にする。
pub fn display_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut previous_is_alpha = false;

    for ch in raw.chars() {
        let ch = if ch == '_' { ' ' } else { ch };
        if ch.is_alphabetic() {
            if previous_is_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            previous_is_alpha = true;
        } else {
            out.push(ch);
            previous_is_alpha = false;
        }
    }

    out
}
