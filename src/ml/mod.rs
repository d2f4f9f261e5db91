pub mod ml_model;
pub mod training;
pub mod inference;

pub use ml_model::{to_model_input, Backbone, FoodClassifier, ModelConfig, BACKBONE_FEATURES};
pub use training::{train_model, FoodDataset, TrainingReport};
pub use inference::{save_backbone, BurnClassifier, BurnModelLoader};
