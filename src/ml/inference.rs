//! モデル推論機能
//!
//! 保存済みの tar.gz バンドルからモデルを復元し、RGB 画像を分類します。

use anyhow::{anyhow, bail, Result};
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use std::path::Path;

use crate::data::dataset::{RawImages, SignSplit};
use crate::data::preprocess::{prepare, PreparedSplit};
use crate::ml::evaluation::{evaluate, predict, Evaluation};
use crate::ml::lenet::{LeNet, LeNetConfig};
use crate::model::{load_model_with_metadata, ModelMetadata};

/// モデルの重みをバイト列に変換（f32精度）
pub fn encode_weights<B: Backend>(model: &LeNet<B>) -> Result<Vec<u8>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    Recorder::<B>::record(&recorder, model.clone().into_record(), ())
        .map_err(|e| anyhow!("モデル重みの書き出しエラー: {:?}", e))
}

/// バイト列から重みを復元
pub fn decode_weights<B: Backend>(model: LeNet<B>, bytes: Vec<u8>, device: &B::Device) -> Result<LeNet<B>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = recorder
        .load(bytes, device)
        .map_err(|e| anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
    Ok(model.load_record(record))
}

/// 1 枚分の分類結果
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: LeNet<B>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let (metadata, model_binary) = load_model_with_metadata(model_path.as_ref())?;

        let model = LeNetConfig::new(metadata.num_classes)
            .with_image_size(metadata.image_size)
            .init::<B>(&device)?;
        let model = decode_weights(model, model_binary, &device)?;

        Ok(Self {
            model,
            metadata,
            device,
        })
    }

    /// 学習直後のモデルから作成
    pub fn from_model(model: LeNet<B>, metadata: ModelMetadata, device: B::Device) -> Self {
        Self {
            model,
            metadata,
            device,
        }
    }

    fn check_shape(&self, images: &RawImages) -> Result<()> {
        let size = self.metadata.image_size;
        if images.height != size || images.width != size {
            bail!(
                "画像サイズ {}x{} がモデル入力サイズ {}x{} と一致しません",
                images.height,
                images.width,
                size,
                size
            );
        }
        Ok(())
    }

    /// RGB 画像（前処理前）を分類
    pub fn classify(&self, images: &RawImages, batch_size: usize) -> Result<Vec<Classification>> {
        self.check_shape(images)?;
        let predictions = predict(&self.model, &prepare(images), batch_size, &self.device)?;

        predictions
            .classes()
            .into_iter()
            .enumerate()
            .map(|(i, class_id)| {
                let confidence = predictions
                    .row(i)
                    .and_then(|row| row.get(class_id).copied())
                    .unwrap_or(0.0);
                let label = self
                    .metadata
                    .class_name(class_id)
                    .ok_or_else(|| anyhow!("クラスインデックス {} は範囲外です", class_id))?
                    .to_string();
                Ok(Classification {
                    class_id,
                    label,
                    confidence,
                })
            })
            .collect()
    }

    /// ラベル付きデータで評価
    pub fn evaluate(&self, split: &SignSplit, batch_size: usize) -> Result<Evaluation> {
        self.check_shape(&split.images)?;
        split.check_labels(self.metadata.num_classes)?;
        evaluate(&self.model, &PreparedSplit::from_split(split), batch_size, &self.device)
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::save_model_with_metadata;
    use burn::tensor::Tensor;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn metadata() -> ModelMetadata {
        ModelMetadata::new(vec!["red".into(), "green".into(), "blue".into()], 32, 1, 8, 1e-3)
    }

    #[test]
    fn test_weights_roundtrip_preserves_outputs() {
        let device = NdArrayDevice::Cpu;
        let model = LeNetConfig::new(3).init::<TestBackend>(&device).unwrap();
        let bytes = encode_weights(&model).unwrap();

        let fresh = LeNetConfig::new(3).init::<TestBackend>(&device).unwrap();
        let restored = decode_weights(fresh, bytes, &device).unwrap();

        let input = Tensor::<TestBackend, 4>::ones([1, 1, 32, 32], &device);
        let a = model.forward(input.clone()).into_data().to_vec::<f32>().unwrap();
        let b = restored.forward(input).into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_load_bundle_and_classify() {
        let device = NdArrayDevice::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let model = LeNetConfig::new(3).init::<TestBackend>(&device).unwrap();
        let path = save_model_with_metadata(
            &dir.path().join("lenet.tar.gz"),
            &metadata(),
            &encode_weights(&model).unwrap(),
        )
        .unwrap();

        let engine = InferenceEngine::<TestBackend>::load(&path, device).unwrap();
        assert_eq!(engine.metadata().num_classes, 3);

        let images = RawImages::new(vec![200; 2 * 32 * 32 * 3], 2, 32, 32, 3).unwrap();
        let results = engine.classify(&images, 8).unwrap();
        assert_eq!(results.len(), 2);
        for result in &results {
            assert!(result.class_id < 3);
            assert!(["red", "green", "blue"].contains(&result.label.as_str()));
            assert!((0.0..=1.0).contains(&result.confidence));
        }

        let split = SignSplit::new(images, vec![0, 2]).unwrap();
        let eval = engine.evaluate(&split, 8).unwrap();
        assert_eq!(eval.samples, 2);
    }

    #[test]
    fn test_classify_rejects_wrong_size() {
        let device = NdArrayDevice::Cpu;
        let model = LeNetConfig::new(3).init::<TestBackend>(&device).unwrap();
        let engine = InferenceEngine::from_model(model, metadata(), device);

        let images = RawImages::new(vec![0; 28 * 28 * 3], 1, 28, 28, 3).unwrap();
        assert!(engine.classify(&images, 8).is_err());
    }
}
