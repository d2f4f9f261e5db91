//! 食品分類モデルの学習用バイナリ
//!
//! 使い方:
//!   train_classifier [--dataset <dir>] [--epochs <n>] [--batch-size <n>] [--config <path>]
//!
//! `<dir>` 以下のサブディレクトリ名をクラス名として学習し、
//! 設定の `model.weights_path` にバンドル、`catalog.path` にラベルカタログを書き出します。

use anyhow::{Context, Result};
use std::path::PathBuf;

use food_recognizer_lib::ml::train_model;
use food_recognizer_lib::model::config::AppConfig;

struct Args {
    dataset: PathBuf,
    epochs: Option<usize>,
    batch_size: Option<usize>,
    config: Option<PathBuf>,
}

fn parse_count(flag: &str, value: &str) -> Result<usize> {
    let count: usize = value
        .parse()
        .with_context(|| format!("{} must be a number", flag))?;
    if count == 0 {
        anyhow::bail!("{} must be at least 1", flag);
    }
    Ok(count)
}

fn parse_args(argv: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut args = Args {
        dataset: PathBuf::from("dataset"),
        epochs: None,
        batch_size: None,
        config: None,
    };

    let mut iter = argv.into_iter();
    while let Some(flag) = iter.next() {
        let mut value = || {
            iter.next()
                .with_context(|| format!("{} requires a value", flag))
        };
        match flag.as_str() {
            "--dataset" => args.dataset = PathBuf::from(value()?),
            "--epochs" => args.epochs = Some(parse_count("--epochs", &value()?)?),
            "--batch-size" => args.batch_size = Some(parse_count("--batch-size", &value()?)?),
            "--config" => args.config = Some(PathBuf::from(value()?)),
            other => anyhow::bail!(
                "Unknown argument: {}\nUsage: train_classifier [--dataset <dir>] [--epochs <n>] [--batch-size <n>] [--config <path>]",
                other
            ),
        }
    }

    Ok(args)
}

fn main() {
    food_recognizer_lib::init_tracing();

    if let Err(e) = run() {
        tracing::error!("Training failed: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => AppConfig::load_or_default(),
    };
    if let Some(epochs) = args.epochs {
        config.training.num_epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.training.batch_size = batch_size;
    }

    tracing::info!("=== Food classifier training ===");
    tracing::info!("Dataset: {}", args.dataset.display());

    let report = train_model(&args.dataset, &config)?;

    tracing::info!("=== Training complete ===");
    tracing::info!("Classes: {}", report.num_classes);
    tracing::info!(
        "Samples: {} training / {} validation",
        report.train_samples,
        report.validation_samples
    );
    if let Some(accuracy) = report.validation_accuracy {
        tracing::info!("Validation accuracy: {:.2}%", accuracy * 100.0);
    }
    tracing::info!(
        "Mode: {}",
        if report.transfer_learned {
            "transfer learning (frozen backbone)"
        } else {
            "full training"
        }
    );
    tracing::info!("Model bundle: {}", report.bundle_path.display());
    tracing::info!("Label catalog: {}", report.catalog_path.display());
    if let Some(backbone) = &report.exported_backbone {
        tracing::info!("Backbone weights: {}", backbone.display());
    }

    Ok(())
}
