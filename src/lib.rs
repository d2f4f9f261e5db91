#![recursion_limit = "256"]

pub mod adapter;
pub mod catalog;
pub mod download;
pub mod model;
pub mod preprocess;
pub mod recognizer;
pub mod server;
pub mod slot;
pub mod top_k;
pub mod types;

// 機械学習バックエンド
#[cfg(feature = "ml")]
pub mod ml;

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use adapter::ModelLoader;
use model::config::AppConfig;
use recognizer::Recognizer;

/// ログ出力の初期化（`RUST_LOG` 未設定時は info）
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

/// 設定に応じたモデルローダー
#[cfg(feature = "ml")]
pub fn build_loader(config: &AppConfig) -> Arc<dyn ModelLoader> {
    Arc::new(ml::BurnModelLoader::from_config(config))
}

#[cfg(not(feature = "ml"))]
pub fn build_loader(_config: &AppConfig) -> Arc<dyn ModelLoader> {
    Arc::new(adapter::UnavailableLoader)
}

/// サーバーを起動する
///
/// ラベルカタログは起動時に必須（設定で無効化可）。
/// モデルの事前読み込みに失敗しても起動は継続し、最初のリクエストで再試行する。
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    tracing::info!("Starting food recognition server on {}", config.device_type);

    let recognizer = Arc::new(Recognizer::from_config(&config, build_loader(&config)));

    if config.server.require_catalog_at_startup {
        recognizer.load_catalog().await.map_err(|e| {
            anyhow::anyhow!(
                "Failed to load food classes from {}: {}",
                config.catalog_path().display(),
                e
            )
        })?;
    }

    if config.server.preload_model {
        match recognizer.ensure_ready().await {
            Ok(_) => tracing::info!("Model preloaded"),
            Err(e) => tracing::warn!("Model preload failed, will retry on first request: {}", e),
        }
    }

    let router = server::construct_router(recognizer, config.server.max_upload_bytes);
    server::serve(router, &config.bind_address()).await
}
