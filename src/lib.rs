//! LeNet による交通標識分類
//!
//! pickle 形式の学習・検証・テストデータを読み込み、グレースケール化と正規化を行ってから
//! LeNet を学習し、テスト正解率・混同行列・学習曲線などのレポートを出力します。

pub mod data;
pub mod ml;
pub mod model;
pub mod report;

use anyhow::{Context, Result};
use burn::{backend::Wgpu, module::AutodiffModule, tensor::backend::AutodiffBackend};
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::WgpuDevice;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::data::dataset::DatasetSplits;
use crate::data::preprocess::{self, PreparedSplit};
use crate::ml::evaluation::{evaluate, predict, ConfusionMatrix, Evaluation};
use crate::ml::inference::encode_weights;
use crate::ml::lenet::{sign_name, LeNetConfig, SIGN_NAMES};
use crate::ml::training::{train, History};
use crate::model::{save_model_with_metadata, AppConfig, DeviceType, ModelMetadata};

/// 1 回の学習・評価の結果
#[derive(Debug)]
pub struct RunSummary {
    pub history: History,
    pub test: Evaluation,
    pub confusion: ConfusionMatrix,
    /// 保存したモデル（tar.gz）
    pub model_path: PathBuf,
    /// 書き出したレポート（PNG・CSV）
    pub artifacts: Vec<PathBuf>,
}

/// クラスIDの順に並んだ名前（GTSRB 以外のクラス数では連番）
pub fn class_names(num_classes: usize) -> Vec<String> {
    (0..num_classes)
        .map(|i| {
            if i < SIGN_NAMES.len() {
                sign_name(i).to_string()
            } else {
                format!("class {}", i)
            }
        })
        .collect()
}

/// 設定に従ってバックエンドを選び、学習からレポート出力までを実行
pub fn run(config: &AppConfig) -> Result<RunSummary> {
    config.validate()?;
    info!("計算デバイス: {}", config.device_type);

    match config.device_type {
        DeviceType::Wgpu => run_with_backend::<Autodiff<Wgpu>>(config, WgpuDevice::default()),
        DeviceType::Cpu => run_with_backend::<Autodiff<NdArray<f32>>>(config, NdArrayDevice::Cpu),
    }
}

/// 読み込み → シャッフル → 前処理 → 学習 → 評価 → 予測 → 保存 → レポート
pub fn run_with_backend<B: AutodiffBackend>(config: &AppConfig, device: B::Device) -> Result<RunSummary> {
    let num_classes = config.model.num_classes;
    let batch_size = config.training.batch_size;
    let output_dir = PathBuf::from(&config.report.output_dir);
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;
    let mut artifacts = Vec::new();

    let mut splits = DatasetSplits::load(&config.data, num_classes)?;
    preprocess::shuffle(&mut splits.train, config.training.seed);

    for (name, split) in splits.named() {
        match report::write_sample_previews(&output_dir, name, split, config.report.sample_index) {
            Ok(paths) => artifacts.extend(paths),
            Err(e) => warn!("サンプル画像を保存できませんでした: {:#}", e),
        }
    }

    let train_split = Arc::new(PreparedSplit::from_split(&splits.train));
    let valid_split = Arc::new(PreparedSplit::from_split(&splits.valid));
    let test_split = PreparedSplit::from_split(&splits.test);
    info!(
        "前処理後の形状: train {:?}, valid {:?}, test {:?}",
        train_split.images.shape(),
        valid_split.images.shape(),
        test_split.images.shape()
    );
    if let Some((lo, hi)) = train_split.images.value_range() {
        info!("正規化後の画素値の範囲: [{:.4}, {:.4}]", lo, hi);
    }

    let model_config = LeNetConfig::new(num_classes).with_image_size(config.model.image_size);
    let (model, history) = train::<B>(&model_config, &config.training, train_split, valid_split, &device)?;
    let model = model.valid();

    let test = evaluate(&model, &test_split, batch_size, &device)?;
    info!("テスト損失: {:.4}", test.loss);
    println!("Test Accuracy: {}", test.accuracy_label());

    let predictions = predict(&model, &test_split.images, batch_size, &device)?;
    let predicted = predictions.classes();
    let confusion = ConfusionMatrix::from_predictions(&test_split.labels, &predicted, num_classes)?;
    for (truth, guess, count) in confusion.most_confused(5) {
        info!(
            "誤分類: {} ({}) -> {} ({}): {} 件",
            truth,
            sign_name(truth),
            guess,
            sign_name(guess),
            count
        );
    }

    let metadata = ModelMetadata::new(
        class_names(num_classes),
        config.model.image_size,
        config.training.num_epochs,
        batch_size,
        config.training.learning_rate,
    )
    .with_accuracies(test.accuracy, history.last().map(|m| m.val_accuracy));
    let model_path = save_model_with_metadata(
        Path::new(&config.model.model_path),
        &metadata,
        &encode_weights(&model)?,
    )?;
    info!("モデルを保存しました: {}", model_path.display());

    let history_csv = output_dir.join("history.csv");
    history.write_csv(&history_csv)?;
    artifacts.push(history_csv);
    let confusion_csv = output_dir.join("confusion_matrix.csv");
    confusion.write_csv(&confusion_csv)?;
    artifacts.push(confusion_csv);

    if config.report.render_plots {
        artifacts.extend(report::plot_history(&output_dir, &history)?);

        let confusion_png = output_dir.join("confusion_matrix.png");
        report::plot_confusion(&confusion_png, &confusion)?;
        artifacts.push(confusion_png);

        let grid_png = output_dir.join("predictions_grid.png");
        report::plot_prediction_grid(
            &grid_png,
            &splits.test.images,
            &predicted,
            &splits.test.labels,
            config.report.grid_rows,
            config.report.grid_cols,
        )?;
        artifacts.push(grid_png);
    }
    info!("レポートを {} に出力しました ({} 件)", output_dir.display(), artifacts.len());

    Ok(RunSummary {
        history,
        test,
        confusion,
        model_path,
        artifacts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_names() {
        let names = class_names(43);
        assert_eq!(names.len(), 43);
        assert_eq!(names[14], "Stop");

        let extended = class_names(45);
        assert_eq!(extended[44], "class 44");
    }
}
