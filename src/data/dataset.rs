//! 交通標識データセットの読み込み
//!
//! 学習・検証・テストの各分割は `features` (N, H, W, C) と `labels` (N) を持つ
//! pickle ファイルとして保存されています。

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use std::fs;
use std::path::Path;

use crate::data::pickle;
use crate::model::config::DataSettings;

/// RGB 画像の集合（N, H, W, C の順で平坦化された u8）
#[derive(Debug, Clone, PartialEq)]
pub struct RawImages {
    pub data: Vec<u8>,
    pub count: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl RawImages {
    pub fn new(data: Vec<u8>, count: usize, height: usize, width: usize, channels: usize) -> Result<Self> {
        let expected = [count, height, width, channels]
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| anyhow!("画像サイズが大きすぎます: {}x{}x{}x{}", count, height, width, channels))?;
        if data.len() != expected {
            bail!(
                "画像データ長が不正です: {} (期待: {} = {}x{}x{}x{})",
                data.len(),
                expected,
                count,
                height,
                width,
                channels
            );
        }
        Ok(Self { data, count, height, width, channels })
    }

    /// 1 枚あたりの要素数
    pub fn image_len(&self) -> usize {
        self.height * self.width * self.channels
    }

    /// i 番目の画像 (H, W, C)
    pub fn image(&self, index: usize) -> Option<&[u8]> {
        if index >= self.count {
            return None;
        }
        let len = self.image_len();
        Some(&self.data[index * len..(index + 1) * len])
    }

    /// numpy の `.shape` に相当
    pub fn shape(&self) -> [usize; 4] {
        [self.count, self.height, self.width, self.channels]
    }
}

/// 画像とラベルの組
#[derive(Debug, Clone)]
pub struct SignSplit {
    pub images: RawImages,
    pub labels: Vec<usize>,
}

impl SignSplit {
    pub fn new(images: RawImages, labels: Vec<usize>) -> Result<Self> {
        if images.count != labels.len() {
            bail!(
                "画像数 {} とラベル数 {} が一致しません",
                images.count,
                labels.len()
            );
        }
        Ok(Self { images, labels })
    }

    /// pickle ファイルから読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read dataset file: {}", path.display()))?;
        let split = Self::from_pickle_bytes(&bytes)
            .with_context(|| format!("Failed to decode dataset file: {}", path.display()))?;

        info!(
            "{} を読み込みました: features {:?}, labels ({},)",
            path.display(),
            split.images.shape(),
            split.labels.len()
        );
        Ok(split)
    }

    /// pickle バイト列から分割を復元する
    pub fn from_pickle_bytes(bytes: &[u8]) -> Result<Self> {
        let root = pickle::from_slice(bytes)?;

        let features = root
            .get("features")
            .ok_or_else(|| anyhow!("'features' キーがありません (keys: {:?})", root.keys()))?
            .as_array()
            .ok_or_else(|| anyhow!("'features' が numpy 配列ではありません"))?;
        let labels = root
            .get("labels")
            .ok_or_else(|| anyhow!("'labels' キーがありません (keys: {:?})", root.keys()))?
            .as_array()
            .ok_or_else(|| anyhow!("'labels' が numpy 配列ではありません"))?;

        let [count, height, width, channels] = match features.shape.as_slice() {
            &[n, h, w, c] => [n, h, w, c],
            other => bail!("features は 4 次元配列である必要があります: {:?}", other),
        };
        if labels.ndim() != 1 {
            bail!("labels は 1 次元配列である必要があります: {:?}", labels.shape);
        }

        let images = RawImages::new(features.to_u8()?, count, height, width, channels)?;
        let labels = labels
            .to_i64()?
            .into_iter()
            .map(|label| {
                usize::try_from(label).map_err(|_| anyhow!("負のラベルがあります: {}", label))
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(images, labels)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// クラスごとのサンプル数
    pub fn class_histogram(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0usize; num_classes];
        for &label in &self.labels {
            if let Some(count) = counts.get_mut(label) {
                *count += 1;
            }
        }
        counts
    }

    /// すべてのラベルが `num_classes` 未満であることを確認する
    pub fn check_labels(&self, num_classes: usize) -> Result<()> {
        match self.labels.iter().position(|&label| label >= num_classes) {
            Some(index) => bail!(
                "ラベル {} (index {}) がクラス数 {} の範囲外です",
                self.labels[index],
                index,
                num_classes
            ),
            None => Ok(()),
        }
    }
}

/// 学習・検証・テストの 3 分割
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: SignSplit,
    pub valid: SignSplit,
    pub test: SignSplit,
}

impl DatasetSplits {
    /// 設定されたパスから 3 分割すべてを読み込む
    pub fn load(settings: &DataSettings, num_classes: usize) -> Result<Self> {
        let splits = Self {
            train: SignSplit::load(&settings.train_path)?,
            valid: SignSplit::load(&settings.valid_path)?,
            test: SignSplit::load(&settings.test_path)?,
        };

        for (name, split) in splits.named() {
            split
                .check_labels(num_classes)
                .with_context(|| format!("{} データのラベルが不正です", name))?;
            let [_, h, w, c] = split.images.shape();
            if [h, w, c] != splits.train.images.shape()[1..] {
                bail!(
                    "{} データの画像サイズ {}x{}x{} が学習データと一致しません",
                    name,
                    h,
                    w,
                    c
                );
            }
        }

        let histogram = splits.train.class_histogram(num_classes);
        debug!("学習データのクラス分布: {:?}", histogram);
        if let Some(class) = histogram.iter().position(|&n| n == 0) {
            log::warn!("学習データにクラス {} のサンプルがありません", class);
        }

        Ok(splits)
    }

    pub fn named(&self) -> [(&'static str, &SignSplit); 3] {
        [("train", &self.train), ("valid", &self.valid), ("test", &self.test)]
    }
}
