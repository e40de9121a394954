//! 評価・予測・混同行列

use anyhow::{anyhow, bail, Context, Result};
use burn::{
    tensor::{backend::Backend, ElementConversion, Int, Tensor},
    train::ClassificationOutput,
};
use std::path::Path;

use crate::data::batcher::{images_to_tensor, labels_to_tensor};
use crate::data::preprocess::{GrayImages, PreparedSplit};
use crate::ml::lenet::LeNet;

/// バッチ内の正解数
pub fn correct_count<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size] = targets.dims();
    let correct = output
        .argmax(1)
        .reshape([batch_size])
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>();
    correct.max(0) as usize
}

/// バッチサイズで重み付けした損失と正解数の集計
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningStats {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl RunningStats {
    pub fn update<B: Backend>(&mut self, output: &ClassificationOutput<B>) {
        let [batch_size] = output.targets.dims();
        let loss = output.loss.clone().into_scalar().elem::<f64>();

        self.loss_sum += loss * batch_size as f64;
        self.correct += correct_count(output.output.clone(), output.targets.clone());
        self.samples += batch_size;
    }

    pub fn loss(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.loss_sum / self.samples as f64
    }

    pub fn accuracy(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.correct as f64 / self.samples as f64
    }

    pub fn finish(&self) -> Evaluation {
        Evaluation {
            loss: self.loss(),
            accuracy: self.accuracy(),
            samples: self.samples,
        }
    }
}

/// 評価結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    /// 0〜1
    pub accuracy: f64,
    pub samples: usize,
}

impl Evaluation {
    /// パーセント表記（小数点以下 2 桁で丸め）
    pub fn accuracy_percent(&self) -> f64 {
        (self.accuracy * 100.0 * 100.0).round() / 100.0
    }

    /// `Test Accuracy: 91.23%` の形式（整数値でも小数点以下 1 桁は残す）
    pub fn accuracy_label(&self) -> String {
        let percent = self.accuracy_percent();
        if percent.fract() == 0.0 {
            format!("{:.1}%", percent)
        } else {
            format!("{}%", percent)
        }
    }
}

/// 前処理済みデータで損失と正解率を計算する
pub fn evaluate<B: Backend>(
    model: &LeNet<B>,
    split: &PreparedSplit,
    batch_size: usize,
    device: &B::Device,
) -> Result<Evaluation> {
    if split.is_empty() {
        bail!("評価データが空です");
    }
    let batch_size = batch_size.max(1);
    let images = &split.images;
    let mut stats = RunningStats::default();

    for start in (0..split.len()).step_by(batch_size) {
        let end = (start + batch_size).min(split.len());
        let pixels = images.range(start, end);
        let targets: Vec<i64> = split.labels[start..end].iter().map(|&l| l as i64).collect();

        let output = model.forward_classification(
            images_to_tensor::<B>(pixels, end - start, images.height, images.width, device),
            labels_to_tensor::<B>(&targets, device),
        );
        stats.update(&output);
    }

    Ok(stats.finish())
}

/// クラス確率（N x num_classes、行優先）
#[derive(Debug, Clone)]
pub struct Predictions {
    pub probabilities: Vec<f32>,
    pub num_classes: usize,
}

impl Predictions {
    pub fn len(&self) -> usize {
        if self.num_classes == 0 {
            return 0;
        }
        self.probabilities.len() / self.num_classes
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// i 番目のサンプルの確率分布
    pub fn row(&self, index: usize) -> Option<&[f32]> {
        self.probabilities
            .chunks_exact(self.num_classes.max(1))
            .nth(index)
    }

    /// 各サンプルの最尤クラス
    pub fn classes(&self) -> Vec<usize> {
        self.probabilities
            .chunks_exact(self.num_classes.max(1))
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &p)| if p > best.1 { (i, p) } else { best })
                    .0
            })
            .collect()
    }
}

/// 画像ごとのクラス確率を計算する
pub fn predict<B: Backend>(
    model: &LeNet<B>,
    images: &GrayImages,
    batch_size: usize,
    device: &B::Device,
) -> Result<Predictions> {
    let batch_size = batch_size.max(1);
    let mut probabilities = Vec::new();
    let mut num_classes = 0;

    for start in (0..images.count).step_by(batch_size) {
        let end = (start + batch_size).min(images.count);
        let tensor = images_to_tensor::<B>(
            images.range(start, end),
            end - start,
            images.height,
            images.width,
            device,
        );
        let proba = model.predict_proba(tensor);
        num_classes = proba.dims()[1];

        let values = proba
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow!("推論結果の取得エラー: {:?}", e))?;
        probabilities.extend(values);
    }

    Ok(Predictions {
        probabilities,
        num_classes,
    })
}

/// 混同行列（行: 正解クラス、列: 予測クラス）
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    counts: Vec<u64>,
    num_classes: usize,
}

impl ConfusionMatrix {
    pub fn from_predictions(truth: &[usize], predicted: &[usize], num_classes: usize) -> Result<Self> {
        if truth.len() != predicted.len() {
            bail!(
                "正解数 {} と予測数 {} が一致しません",
                truth.len(),
                predicted.len()
            );
        }

        let mut counts = vec![0u64; num_classes * num_classes];
        for (&t, &p) in truth.iter().zip(predicted) {
            if t >= num_classes || p >= num_classes {
                bail!("クラス ({}, {}) が範囲外です (クラス数: {})", t, p, num_classes);
            }
            counts[t * num_classes + p] += 1;
        }

        Ok(Self { counts, num_classes })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn get(&self, truth: usize, predicted: usize) -> u64 {
        if truth >= self.num_classes || predicted >= self.num_classes {
            return 0;
        }
        self.counts[truth * self.num_classes + predicted]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn correct(&self) -> u64 {
        (0..self.num_classes).map(|c| self.get(c, c)).sum()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.correct() as f64 / total as f64
    }

    fn row_sum(&self, truth: usize) -> u64 {
        (0..self.num_classes).map(|p| self.get(truth, p)).sum()
    }

    fn col_sum(&self, predicted: usize) -> u64 {
        (0..self.num_classes).map(|t| self.get(t, predicted)).sum()
    }

    /// 予測がそのクラスだったもののうち正解だった割合（予測なしは None）
    pub fn precision(&self, class: usize) -> Option<f64> {
        let predicted = self.col_sum(class);
        (predicted > 0).then(|| self.get(class, class) as f64 / predicted as f64)
    }

    /// そのクラスのサンプルのうち正しく予測された割合（サンプルなしは None）
    pub fn recall(&self, class: usize) -> Option<f64> {
        let actual = self.row_sum(class);
        (actual > 0).then(|| self.get(class, class) as f64 / actual as f64)
    }

    /// 誤分類の多い組 (正解, 予測, 件数) を件数の降順で返す
    pub fn most_confused(&self, limit: usize) -> Vec<(usize, usize, u64)> {
        let mut pairs: Vec<_> = (0..self.num_classes)
            .flat_map(|t| (0..self.num_classes).map(move |p| (t, p)))
            .filter(|&(t, p)| t != p)
            .map(|(t, p)| (t, p, self.get(t, p)))
            .filter(|&(_, _, n)| n > 0)
            .collect();
        pairs.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)).then(a.1.cmp(&b.1)));
        pairs.truncate(limit);
        pairs
    }

    pub fn max_count(&self) -> u64 {
        self.counts.iter().copied().max().unwrap_or(0)
    }

    /// CSV出力（1行目は予測クラス、1列目は正解クラス）
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;

        let mut header = vec!["true\\pred".to_string()];
        header.extend((0..self.num_classes).map(|c| c.to_string()));
        writer.write_record(&header)?;

        for t in 0..self.num_classes {
            let mut record = vec![t.to_string()];
            record.extend((0..self.num_classes).map(|p| self.get(t, p).to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}
