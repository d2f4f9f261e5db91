//! HTTPサーバー
//!
//! エンドポイント:
//! - `POST /predict` - 画像を分類
//! - `GET /model-status` - 読み込み状態（読み込みは行わない）
//! - `POST /download-pretrained` - 専用の重みを取得して読み込み直す
//! - `GET /test` - 死活確認

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::recognizer::Recognizer;

pub mod error;
mod routes;

pub use error::ApiError;

pub type AppState = Arc<Recognizer>;

pub fn construct_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/predict", post(routes::predict))
        .route("/model-status", get(routes::model_status))
        .route("/download-pretrained", post(routes::download_pretrained))
        .route("/test", get(routes::health))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// 待ち受けを開始し、終了するまで処理する
pub async fn serve(router: Router, addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::FakeLoader;
    use crate::download::WeightsFetcher;
    use crate::recognizer::tests::{png_bytes, write_catalog};
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use std::sync::atomic::Ordering;
    use tower::ServiceExt;

    const BOUNDARY: &str = "food-recognizer-test-boundary";

    fn multipart_body(name: &str, filename: &str, content: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                name, filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn predict_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/predict")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn router_with(loader: Arc<FakeLoader>, labels: &[&str]) -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = write_catalog(dir.path(), labels);
        let recognizer = Arc::new(Recognizer::new(catalog, loader));
        (construct_router(recognizer, 1024 * 1024), dir)
    }

    #[tokio::test]
    async fn test_predict_success() {
        let loader = Arc::new(FakeLoader::new(vec![0.05, 0.15, 0.8]));
        let (router, _dir) = router_with(loader, &["garlic_bread", "lasagna", "pizza"]);

        let response = router
            .oneshot(predict_request(multipart_body("image", "dinner.png", &png_bytes())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["ingredient"], "Pizza");
        assert_eq!(json["alternatives"][0]["name"], "Lasagna");
        assert_eq!(json["alternatives"][1]["name"], "Garlic Bread");
    }

    #[tokio::test]
    async fn test_predict_without_image_field() {
        let loader = Arc::new(FakeLoader::new(vec![1.0]));
        let (router, _dir) = router_with(loader.clone(), &["ramen"]);

        let response = router
            .oneshot(predict_request(multipart_body("photo", "a.png", &png_bytes())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert!(json.get("error").is_some());
        assert_eq!(loader.specialized_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_predict_with_empty_filename() {
        let (router, _dir) = router_with(Arc::new(FakeLoader::new(vec![1.0])), &["ramen"]);

        let response = router
            .oneshot(predict_request(multipart_body("image", "", &png_bytes())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await.get("error").is_some());
    }

    #[tokio::test]
    async fn test_predict_not_multipart() {
        let (router, _dir) = router_with(Arc::new(FakeLoader::new(vec![1.0])), &["ramen"]);

        let request = Request::builder()
            .method("POST")
            .uri("/predict")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await.get("error").is_some());
    }

    #[tokio::test]
    async fn test_predict_undecodable_image() {
        let (router, _dir) = router_with(Arc::new(FakeLoader::new(vec![1.0])), &["ramen"]);

        let response = router
            .oneshot(predict_request(multipart_body("image", "a.png", b"not an image")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_predict_model_unavailable() {
        let loader = Arc::new(FakeLoader::new(vec![1.0]).missing_weights());
        let (router, _dir) = router_with(loader, &["ramen"]);

        let response = router
            .oneshot(predict_request(multipart_body("image", "a.png", &png_bytes())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = json_body(response).await;
        let message = json["error"].as_str().unwrap();
        assert!(message.contains("not available"));
        assert!(!message.contains("food_classifier.tar.gz"));
    }

    #[tokio::test]
    async fn test_model_status_does_not_load() {
        let loader = Arc::new(FakeLoader::new(vec![0.5, 0.5]));
        let (router, _dir) = router_with(loader.clone(), &["ramen", "tacos"]);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/model-status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["model_loaded"], false);
        assert_eq!(json["classes_loaded"], false);
        assert_eq!(json["number_of_classes"], 0);
        assert_eq!(loader.specialized_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _dir) = router_with(Arc::new(FakeLoader::new(vec![1.0])), &["ramen"]);

        let response = router
            .oneshot(Request::builder().uri("/test").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["message"], "Food recognition server is running");
    }

    #[tokio::test]
    async fn test_download_without_url() {
        let (router, _dir) = router_with(Arc::new(FakeLoader::new(vec![1.0])), &["ramen"]);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/download-pretrained")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = json_body(response).await;
        assert_eq!(json["status"], "error");
    }

    #[tokio::test]
    async fn test_download_and_reload() {
        // 重みの配信元
        let upstream = Router::new().route("/weights", get(|| async { vec![1u8; 128] }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, upstream).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let catalog = write_catalog(dir.path(), &["ramen", "tacos"]);
        let loader = Arc::new(FakeLoader::new(vec![0.4, 0.6]));
        let fetcher = WeightsFetcher::new(
            format!("http://{}/weights", addr),
            dir.path().join("food_classifier.tar.gz"),
        );
        let recognizer = Arc::new(Recognizer::new(catalog, loader.clone()).with_fetcher(fetcher));
        let router = construct_router(recognizer.clone(), 1024 * 1024);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/download-pretrained")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "success");
        assert!(dir.path().join("food_classifier.tar.gz").exists());
        assert!(recognizer.status().model_loaded);
        assert_eq!(loader.specialized_calls.load(Ordering::SeqCst), 1);
    }
}
