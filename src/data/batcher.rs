//! burn 用のデータセットとバッチャー

use std::sync::Arc;

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};

use crate::data::preprocess::PreparedSplit;

/// データセットアイテム（正規化済み 1 チャネル画像とクラスID）
#[derive(Clone, Debug)]
pub struct SignItem {
    pub pixels: Vec<f32>,
    pub label: usize,
}

/// 前処理済み分割を共有参照で保持するデータセット
pub struct SignDataset {
    split: Arc<PreparedSplit>,
}

impl SignDataset {
    pub fn new(split: Arc<PreparedSplit>) -> Self {
        Self { split }
    }
}

impl Dataset<SignItem> for SignDataset {
    fn get(&self, index: usize) -> Option<SignItem> {
        let pixels = self.split.images.image(index)?;
        let label = *self.split.labels.get(index)?;
        Some(SignItem {
            pixels: pixels.to_vec(),
            label,
        })
    }

    fn len(&self) -> usize {
        self.split.len()
    }
}

/// バッチャー
#[derive(Clone)]
pub struct SignBatcher<B: Backend> {
    device: B::Device,
    height: usize,
    width: usize,
}

impl<B: Backend> SignBatcher<B> {
    pub fn new(device: B::Device, height: usize, width: usize) -> Self {
        Self { device, height, width }
    }
}

impl<B: Backend> Batcher<B, SignItem, SignBatch<B>> for SignBatcher<B> {
    fn batch(&self, items: Vec<SignItem>, _device: &B::Device) -> SignBatch<B> {
        let batch_size = items.len();
        let mut all_pixels = Vec::with_capacity(batch_size * self.height * self.width);
        let mut targets = Vec::with_capacity(batch_size);

        for item in items {
            all_pixels.extend_from_slice(&item.pixels);
            targets.push(item.label as i64);
        }

        SignBatch {
            images: images_to_tensor(&all_pixels, batch_size, self.height, self.width, &self.device),
            targets: labels_to_tensor(&targets, &self.device),
        }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct SignBatch<B: Backend> {
    /// [batch_size, 1, height, width]
    pub images: Tensor<B, 4>,
    /// [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

/// (N, H, W) の画素列を [N, 1, H, W] のテンソルに変換する
pub fn images_to_tensor<B: Backend>(
    pixels: &[f32],
    count: usize,
    height: usize,
    width: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    Tensor::<B, 1>::from_floats(pixels, device).reshape([count, 1, height, width])
}

pub fn labels_to_tensor<B: Backend>(labels: &[i64], device: &B::Device) -> Tensor<B, 1, Int> {
    Tensor::<B, 1, Int>::from_ints(labels, device)
}
