use food_recognizer_lib::model::config::AppConfig;

#[tokio::main]
async fn main() {
    food_recognizer_lib::init_tracing();

    let config = AppConfig::load_or_default();

    if let Err(e) = food_recognizer_lib::run(config).await {
        tracing::error!("Failed to initialize server: {:#}", e);
        std::process::exit(1);
    }
}
