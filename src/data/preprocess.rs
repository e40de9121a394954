//! 前処理: シャッフル、グレースケール化、正規化
//!
//! 画素値 0〜255 の RGB 画像を 1 チャネルの平均値に変換し、
//! `(x - 128) / 128` で [-1, 1] の範囲に収めます。

use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::data::dataset::{RawImages, SignSplit};

/// 正規化の中心値
pub const PIXEL_CENTER: f32 = 128.0;

/// 1 チャネル画像の集合（N, H, W の順で平坦化）
#[derive(Debug, Clone, PartialEq)]
pub struct GrayImages {
    pub data: Vec<f32>,
    pub count: usize,
    pub height: usize,
    pub width: usize,
}

impl GrayImages {
    pub fn image_len(&self) -> usize {
        self.height * self.width
    }

    pub fn image(&self, index: usize) -> Option<&[f32]> {
        if index >= self.count {
            return None;
        }
        let len = self.image_len();
        Some(&self.data[index * len..(index + 1) * len])
    }

    /// 連続する範囲の画像をまとめて取得する
    pub fn range(&self, start: usize, end: usize) -> &[f32] {
        let len = self.image_len();
        let end = end.min(self.count);
        let start = start.min(end);
        &self.data[start * len..end * len]
    }

    /// (N, H, W, 1)
    pub fn shape(&self) -> [usize; 4] {
        [self.count, self.height, self.width, 1]
    }

    /// 画素値の最小値と最大値
    pub fn value_range(&self) -> Option<(f32, f32)> {
        self.data.iter().fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }
}

/// 前処理済みの分割（正規化済みグレースケール画像とラベル）
#[derive(Debug, Clone)]
pub struct PreparedSplit {
    pub images: GrayImages,
    pub labels: Vec<usize>,
}

impl PreparedSplit {
    pub fn from_split(split: &SignSplit) -> Self {
        Self {
            images: prepare(&split.images),
            labels: split.labels.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// 画像とラベルを同じ順序で並び替える
///
/// ネットワークが画像の順序を学習しないよう、学習データのみに適用します。
pub fn shuffle(split: &mut SignSplit, seed: u64) {
    let mut indices: Vec<usize> = (0..split.len()).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let len = split.images.image_len();
    let mut data = Vec::with_capacity(split.images.data.len());
    let mut labels = Vec::with_capacity(split.labels.len());
    for &index in &indices {
        data.extend_from_slice(&split.images.data[index * len..(index + 1) * len]);
        labels.push(split.labels[index]);
    }

    split.images.data = data;
    split.labels = labels;
}

/// チャネル平均によるグレースケール化（深さ 3 → 1）
pub fn to_grayscale(images: &RawImages) -> GrayImages {
    let channels = images.channels.max(1);
    let data = images
        .data
        .chunks_exact(channels)
        .map(|pixel| pixel.iter().map(|&v| v as f32 / channels as f32).sum())
        .collect();

    GrayImages {
        data,
        count: images.count,
        height: images.height,
        width: images.width,
    }
}

/// `(x - 128) / 128` による正規化
pub fn normalize(gray: &GrayImages) -> GrayImages {
    GrayImages {
        data: gray.data.iter().map(|&v| (v - PIXEL_CENTER) / PIXEL_CENTER).collect(),
        count: gray.count,
        height: gray.height,
        width: gray.width,
    }
}

/// グレースケール化と正規化をまとめて適用する
pub fn prepare(images: &RawImages) -> GrayImages {
    normalize(&to_grayscale(images))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(count: usize) -> SignSplit {
        // 各画像の全画素を画像番号で埋める
        let data = (0..count).flat_map(|i| vec![i as u8; 2 * 2 * 3]).collect();
        let images = RawImages::new(data, count, 2, 2, 3).unwrap();
        SignSplit::new(images, (0..count).collect()).unwrap()
    }

    #[test]
    fn test_grayscale_reduces_depth() {
        let images = RawImages::new(vec![30, 60, 90, 255, 255, 255], 1, 1, 2, 3).unwrap();
        let gray = to_grayscale(&images);

        assert_eq!(gray.shape(), [1, 1, 2, 1]);
        assert!((gray.data[0] - 60.0).abs() < 1e-4);
        assert!((gray.data[1] - 255.0).abs() < 1e-4);
    }

    #[test]
    fn test_normalized_values_within_unit_range() {
        let data: Vec<u8> = (0..=255u8).flat_map(|v| [v, v, v]).collect();
        let images = RawImages::new(data, 1, 16, 16, 3).unwrap();
        let prepared = prepare(&images);

        let (lo, hi) = prepared.value_range().unwrap();
        assert_eq!(lo, -1.0);
        assert!(hi <= 1.0);
        assert!((hi - 127.0 / 128.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_keeps_dimensions() {
        let images = RawImages::new(vec![128; 3 * 2 * 4 * 3], 3, 2, 4, 3).unwrap();
        let normalized = normalize(&to_grayscale(&images));

        assert_eq!(normalized.shape(), [3, 2, 4, 1]);
        assert_eq!(normalized.data.len(), 3 * 2 * 4);
        assert!(normalized.data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_shuffle_keeps_pairs_aligned() {
        let mut data = split(20);
        shuffle(&mut data, 7);

        assert_ne!(data.labels, (0..20).collect::<Vec<_>>());
        for (i, &label) in data.labels.iter().enumerate() {
            assert!(data.images.image(i).unwrap().iter().all(|&v| v as usize == label));
        }
    }

    #[test]
    fn test_shuffle_is_deterministic() {
        let mut a = split(10);
        let mut b = split(10);
        shuffle(&mut a, 42);
        shuffle(&mut b, 42);
        assert_eq!(a.labels, b.labels);
    }

    #[test]
    fn test_range_is_clamped() {
        let prepared = PreparedSplit::from_split(&split(3));
        assert_eq!(prepared.images.range(1, 10).len(), 2 * 4);
        assert!(prepared.images.range(5, 10).is_empty());
    }
}
