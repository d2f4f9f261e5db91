//! 重みファイルのダウンロード
//!
//! リモートのモデルバンドルを `.part` ファイルへストリーミングし、
//! Content-Length と照合してから本来のパスへリネームします。

use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::model::config::AppConfig;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },
    #[error("download truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// モデルバンドルの取得
#[derive(Debug, Clone)]
pub struct WeightsFetcher {
    client: reqwest::Client,
    url: String,
    destination: PathBuf,
}

impl WeightsFetcher {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            destination: destination.into(),
        }
    }

    /// `model.weights_url` が設定されていれば作成
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        config
            .model
            .weights_url
            .as_ref()
            .map(|url| Self::new(url.clone(), config.weights_path()))
    }

    fn partial_path(&self) -> PathBuf {
        let mut name = self.destination.as_os_str().to_owned();
        name.push(".part");
        PathBuf::from(name)
    }

    /// ダウンロードして保存し、書き込んだバイト数を返す
    pub async fn fetch(&self) -> Result<u64, FetchError> {
        tracing::info!(
            "Downloading weights from {} to {}",
            self.url,
            self.destination.display()
        );

        let partial = self.partial_path();
        let result = self.fetch_to(&partial).await;

        match result {
            Ok(received) => {
                tokio::fs::rename(&partial, &self.destination)
                    .await
                    .map_err(|source| FetchError::Io {
                        path: self.destination.display().to_string(),
                        source,
                    })?;
                tracing::info!("Downloaded {} bytes to {}", received, self.destination.display());
                Ok(received)
            }
            Err(e) => {
                tokio::fs::remove_file(&partial).await.ok();
                tracing::error!("Weights download failed: {}", e);
                Err(e)
            }
        }
    }

    async fn fetch_to(&self, partial: &Path) -> Result<u64, FetchError> {
        let request_error = |source| FetchError::Request {
            url: self.url.clone(),
            source,
        };
        let io_error = |source| FetchError::Io {
            path: partial.display().to_string(),
            source,
        };

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let expected = response.content_length();

        if let Some(parent) = partial.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let mut file = tokio::fs::File::create(partial).await.map_err(io_error)?;

        let mut received = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(request_error)?;
            file.write_all(&chunk).await.map_err(io_error)?;
            received += chunk.len() as u64;
        }
        file.flush().await.map_err(io_error)?;

        if let Some(expected) = expected {
            if received != expected {
                return Err(FetchError::Truncated { expected, received });
            }
        }

        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_fetch_writes_destination() {
        let payload = vec![7u8; 64 * 1024];
        let body = payload.clone();
        let base = serve(Router::new().route(
            "/weights",
            get(move || {
                let body = body.clone();
                async move { body }
            }),
        ))
        .await;

        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("models").join("food_classifier.tar.gz");
        let fetcher = WeightsFetcher::new(format!("{}/weights", base), &destination);

        let received = fetcher.fetch().await.unwrap();

        assert_eq!(received, payload.len() as u64);
        assert_eq!(std::fs::read(&destination).unwrap(), payload);
        assert!(!fetcher.partial_path().exists());
    }

    #[tokio::test]
    async fn test_fetch_bad_status() {
        let base = serve(Router::new().route(
            "/weights",
            get(|| async { (StatusCode::NOT_FOUND, "missing") }),
        ))
        .await;

        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("food_classifier.tar.gz");
        let fetcher = WeightsFetcher::new(format!("{}/weights", base), &destination);

        let result = fetcher.fetch().await;

        assert!(matches!(result, Err(FetchError::Status { status: 404, .. })));
        assert!(!destination.exists());
        assert!(!fetcher.partial_path().exists());
    }

    #[tokio::test]
    async fn test_fetch_unreachable_host() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = WeightsFetcher::new("http://127.0.0.1:1/weights", dir.path().join("w.tar.gz"));

        assert!(matches!(fetcher.fetch().await, Err(FetchError::Request { .. })));
    }
}
