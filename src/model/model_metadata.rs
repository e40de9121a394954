//! モデルメタデータの定義と永続化
//!
//! tar.gz形式でモデルと関連するメタデータを保存・読み込みします。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラスIDの順に並んだ標識名
    pub class_names: Vec<String>,

    /// 分類クラス数
    pub num_classes: usize,

    /// モデル入力サイズ（1チャネル、正方形）
    pub image_size: usize,

    /// 学習エポック数
    pub num_epochs: usize,

    /// バッチサイズ
    pub batch_size: usize,

    /// 学習率
    pub learning_rate: f64,

    /// テストデータでの正解率（0〜1）
    #[serde(default)]
    pub test_accuracy: Option<f64>,

    /// 最終エポックの検証正解率（0〜1）
    #[serde(default)]
    pub final_val_accuracy: Option<f64>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_names: Vec<String>,
        image_size: usize,
        num_epochs: usize,
        batch_size: usize,
        learning_rate: f64,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            num_classes: class_names.len(),
            class_names,
            image_size,
            num_epochs,
            batch_size,
            learning_rate,
            test_accuracy: None,
            final_val_accuracy: None,
            trained_at,
        }
    }

    /// 評価結果を記録
    pub fn with_accuracies(mut self, test_accuracy: f64, final_val_accuracy: Option<f64>) -> Self {
        self.test_accuracy = Some(test_accuracy);
        self.final_val_accuracy = final_val_accuracy;
        self
    }

    /// クラスIDから名前を取得
    pub fn class_name(&self, class_id: usize) -> Option<&str> {
        self.class_names.get(class_id).map(String::as_str)
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        let metadata: Self =
            serde_json::from_str(json).context("Failed to deserialize metadata from JSON")?;
        if metadata.class_names.len() != metadata.num_classes {
            anyhow::bail!(
                "クラス名の数 {} が num_classes {} と一致しません",
                metadata.class_names.len(),
                metadata.num_classes
            );
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> ModelMetadata {
        ModelMetadata::new(vec!["Stop".into(), "Yield".into()], 32, 5, 500, 1e-3)
    }

    #[test]
    fn test_json_roundtrip() {
        let saved = metadata().with_accuracies(0.91, Some(0.89));
        let json = saved.to_json_string().unwrap();
        let restored = ModelMetadata::from_json_string(&json).unwrap();

        assert_eq!(restored.num_classes, 2);
        assert_eq!(restored.class_name(1), Some("Yield"));
        assert_eq!(restored.test_accuracy, Some(0.91));
        assert_eq!(restored.trained_at, saved.trained_at);
    }

    #[test]
    fn test_inconsistent_class_count() {
        let mut broken = metadata();
        broken.num_classes = 3;
        let json = serde_json::to_string(&broken).unwrap();
        assert!(ModelMetadata::from_json_string(&json).is_err());
    }
}
