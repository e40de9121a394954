//! モデル学習
//!
//! エポックごとに学習データで重みを更新し、検証データで損失と正解率を測ります。
//! 各エポックの指標は [`History`] に記録され、グラフ描画と CSV 出力に使われます。

use anyhow::{bail, Context, Result};
use burn::{
    data::dataloader::DataLoaderBuilder,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::backend::AutodiffBackend,
};
use log::info;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::data::batcher::{SignBatcher, SignDataset};
use crate::data::preprocess::PreparedSplit;
use crate::ml::evaluation::RunningStats;
use crate::ml::lenet::{LeNet, LeNetConfig};
use crate::model::config::TrainingSettings;

/// 1 エポック分の指標
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

/// 学習履歴
#[derive(Debug, Clone, Default)]
pub struct History {
    epochs: Vec<EpochMetrics>,
}

impl History {
    pub fn push(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn epochs(&self) -> &[EpochMetrics] {
        &self.epochs
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    pub fn accuracy(&self) -> Vec<f64> {
        self.epochs.iter().map(|m| m.accuracy).collect()
    }

    pub fn loss(&self) -> Vec<f64> {
        self.epochs.iter().map(|m| m.loss).collect()
    }

    pub fn val_accuracy(&self) -> Vec<f64> {
        self.epochs.iter().map(|m| m.val_accuracy).collect()
    }

    pub fn val_loss(&self) -> Vec<f64> {
        self.epochs.iter().map(|m| m.val_loss).collect()
    }

    /// CSV出力（ヘッダー: epoch,loss,accuracy,val_loss,val_accuracy）
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;
        for metrics in &self.epochs {
            writer.serialize(metrics)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// モデル学習を実行
///
/// 学習データは毎エポック `settings.seed` に基づいてシャッフルされます。
/// 戻り値のモデルは Autodiff バックエンドのままなので、推論には `valid()` を使います。
pub fn train<B: AutodiffBackend>(
    model_config: &LeNetConfig,
    settings: &TrainingSettings,
    train: Arc<PreparedSplit>,
    valid: Arc<PreparedSplit>,
    device: &B::Device,
) -> Result<(LeNet<B>, History)> {
    if train.is_empty() {
        bail!("学習データが見つかりません");
    }
    if valid.is_empty() {
        bail!("検証データが見つかりません");
    }

    let height = train.images.height;
    let width = train.images.width;
    if height != model_config.image_size || width != model_config.image_size {
        bail!(
            "画像サイズ {}x{} がモデル入力サイズ {}x{} と一致しません",
            height,
            width,
            model_config.image_size,
            model_config.image_size
        );
    }

    info!("学習データ: {} 枚", train.len());
    info!("検証データ: {} 枚", valid.len());
    info!(
        "エポック数: {}, バッチサイズ: {}, 学習率: {}",
        settings.num_epochs, settings.batch_size, settings.learning_rate
    );

    let batcher_train = SignBatcher::<B>::new(device.clone(), height, width);
    let batcher_valid = SignBatcher::<B::InnerBackend>::new(device.clone(), height, width);

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(settings.batch_size)
        .shuffle(settings.seed)
        .num_workers(settings.num_workers)
        .build(SignDataset::new(train));

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(settings.batch_size)
        .num_workers(settings.num_workers)
        .build(SignDataset::new(valid));

    let mut model = model_config.init::<B>(device)?;
    let mut optim = optimizer_config().init();
    let mut history = History::default();

    for epoch in 1..=settings.num_epochs {
        let mut train_stats = RunningStats::default();
        for batch in dataloader_train.iter() {
            let output = model.forward_classification(batch.images, batch.targets);
            let grads = output.loss.backward();
            train_stats.update(&output);

            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(settings.learning_rate, model, grads);
        }

        let model_valid = model.valid();
        let mut valid_stats = RunningStats::default();
        for batch in dataloader_valid.iter() {
            let output = model_valid.forward_classification(batch.images, batch.targets);
            valid_stats.update(&output);
        }

        let metrics = EpochMetrics {
            epoch,
            loss: train_stats.loss(),
            accuracy: train_stats.accuracy(),
            val_loss: valid_stats.loss(),
            val_accuracy: valid_stats.accuracy(),
        };
        info!(
            "Epoch {}/{} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4}",
            epoch,
            settings.num_epochs,
            metrics.loss,
            metrics.accuracy,
            metrics.val_loss,
            metrics.val_accuracy
        );
        history.push(metrics);
    }

    info!("学習完了");
    Ok((model, history))
}

/// 分母の安定化項 epsilon
const ADAM_EPSILON: f32 = 1e-7;

fn optimizer_config() -> AdamConfig {
    AdamConfig::new().with_epsilon(ADAM_EPSILON)
}
