pub mod evaluation;
pub mod inference;
pub mod lenet;
pub mod training;

pub use evaluation::{evaluate, predict, ConfusionMatrix, Evaluation, Predictions};
pub use inference::{Classification, InferenceEngine};
pub use lenet::{sign_name, LeNet, LeNetConfig, IMAGE_SIZE, NUM_CLASSES, SIGN_NAMES};
pub use training::{train, EpochMetrics, History};
