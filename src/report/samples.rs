//! サンプル画像のプレビュー出力
//!
//! 各分割の同じインデックスの画像を、元の RGB・グレースケール・正規化後の
//! 3 段階で PNG に書き出し、前処理の結果を目視で確認できるようにします。

use anyhow::{anyhow, bail, Context, Result};
use image::{imageops::FilterType, DynamicImage, GenericImageView, GrayImage, RgbImage};
use log::info;
use std::path::{Path, PathBuf};

use crate::data::dataset::{RawImages, SignSplit};
use crate::data::preprocess::{normalize, to_grayscale, GrayImages};

/// 32x32 では小さすぎるので拡大して保存する
const PREVIEW_SCALE: u32 = 4;

/// RGB 画像を取り出す（1 チャネルの場合は灰色として展開）
pub fn rgb_image(images: &RawImages, index: usize) -> Result<RgbImage> {
    let pixels = images
        .image(index)
        .ok_or_else(|| anyhow!("インデックス {} は範囲外です (画像数: {})", index, images.count))?;

    let rgb: Vec<u8> = match images.channels {
        3 => pixels.to_vec(),
        1 => pixels.iter().flat_map(|&v| [v, v, v]).collect(),
        c => bail!("チャネル数 {} の画像はプレビューできません", c),
    };

    RgbImage::from_raw(images.width as u32, images.height as u32, rgb)
        .context("RgbImageの作成に失敗しました")
}

/// 1 チャネル画像を 0〜255 に伸長して取り出す
///
/// 画素値の最小値を黒、最大値を白に対応させます。
pub fn gray_image(images: &GrayImages, index: usize) -> Result<GrayImage> {
    let pixels = images
        .image(index)
        .ok_or_else(|| anyhow!("インデックス {} は範囲外です (画像数: {})", index, images.count))?;

    let (lo, hi) = pixels
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let span = hi - lo;
    let data = pixels
        .iter()
        .map(|&v| {
            if span <= f32::EPSILON {
                0
            } else {
                ((v - lo) / span * 255.0).round().clamp(0.0, 255.0) as u8
            }
        })
        .collect();

    GrayImage::from_raw(images.width as u32, images.height as u32, data)
        .context("GrayImageの作成に失敗しました")
}

fn save_scaled(image: DynamicImage, path: &Path) -> Result<()> {
    let (width, height) = (image.width(), image.height());
    image
        .resize_exact(width * PREVIEW_SCALE, height * PREVIEW_SCALE, FilterType::Nearest)
        .save(path)
        .with_context(|| format!("Failed to save image: {}", path.display()))
}

/// `{name}_raw.png`・`{name}_gray.png`・`{name}_normalized.png` を書き出す
pub fn write_sample_previews(dir: &Path, name: &str, split: &SignSplit, index: usize) -> Result<Vec<PathBuf>> {
    let images = &split.images;
    let pixels = images
        .image(index)
        .ok_or_else(|| anyhow!("{}: インデックス {} は範囲外です (画像数: {})", name, index, images.count))?;
    let single = RawImages::new(pixels.to_vec(), 1, images.height, images.width, images.channels)?;

    let gray = to_grayscale(&single);
    let normalized = normalize(&gray);

    let raw_path = dir.join(format!("{}_raw.png", name));
    let gray_path = dir.join(format!("{}_gray.png", name));
    let normalized_path = dir.join(format!("{}_normalized.png", name));

    save_scaled(DynamicImage::ImageRgb8(rgb_image(&single, 0)?), &raw_path)?;
    save_scaled(DynamicImage::ImageLuma8(gray_image(&gray, 0)?), &gray_path)?;
    save_scaled(DynamicImage::ImageLuma8(gray_image(&normalized, 0)?), &normalized_path)?;

    let label = split.labels.get(index).copied().unwrap_or_default();
    info!(
        "{} のサンプル画像 (index {}, label {}) を保存しました",
        name, index, label
    );

    Ok(vec![raw_path, gray_path, normalized_path])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split() -> SignSplit {
        let mut data = Vec::new();
        for i in 0..2u8 {
            for p in 0..4u8 {
                data.extend_from_slice(&[i * 100 + p * 10, 0, 255]);
            }
        }
        let images = RawImages::new(data, 2, 2, 2, 3).unwrap();
        SignSplit::new(images, vec![3, 7]).unwrap()
    }

    #[test]
    fn test_rgb_image() {
        let split = split();
        let img = rgb_image(&split.images, 1).unwrap();
        assert_eq!(img.dimensions(), (2, 2));
        assert_eq!(img.get_pixel(1, 0).0, [110, 0, 255]);
        assert!(rgb_image(&split.images, 2).is_err());
    }

    #[test]
    fn test_gray_image_stretches_range() {
        let gray = GrayImages {
            data: vec![-1.0, 0.0, 0.5, 1.0],
            count: 1,
            height: 2,
            width: 2,
        };
        let img = gray_image(&gray, 0).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [0]);
        assert_eq!(img.get_pixel(1, 1).0, [255]);

        let flat = GrayImages {
            data: vec![0.3; 4],
            count: 1,
            height: 2,
            width: 2,
        };
        assert!(gray_image(&flat, 0).unwrap().pixels().all(|p| p.0 == [0]));
    }

    #[test]
    fn test_write_sample_previews() {
        let dir = tempfile::tempdir().unwrap();
        let written = write_sample_previews(dir.path(), "train", &split(), 1).unwrap();

        assert_eq!(written.len(), 3);
        for path in &written {
            let img = image::open(path).unwrap();
            assert_eq!((img.width(), img.height()), (2 * PREVIEW_SCALE, 2 * PREVIEW_SCALE));
        }
        assert!(write_sample_previews(dir.path(), "train", &split(), 5).is_err());
    }
}
