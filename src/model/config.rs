//! アプリケーション設定管理モジュール
//!
//! データセットのパス、計算デバイス、学習パラメータ、レポート出力先などを
//! JSON形式で保存・読み込みします。

use anyhow::Context;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ml::lenet::{IMAGE_SIZE, NUM_CLASSES};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// データセット設定
///
/// 各分割は `features` と `labels` を持つ pickle ファイルです。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    pub train_path: String,
    pub valid_path: String,
    pub test_path: String,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            train_path: "./traffic-signs-data/train.p".to_string(),
            valid_path: "./traffic-signs-data/valid.p".to_string(),
            test_path: "./traffic-signs-data/test.p".to_string(),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 学習済みモデルの保存先（tar.gz）
    pub model_path: String,
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像サイズ（正方形）
    #[serde(default = "default_image_size")]
    pub image_size: usize,
}

fn default_image_size() -> usize {
    IMAGE_SIZE
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: "models/lenet_traffic_signs.tar.gz".to_string(),
            num_classes: NUM_CLASSES,
            image_size: IMAGE_SIZE,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 5,
            batch_size: 500,
            num_workers: 1,
            learning_rate: 1e-3,
            seed: 42,
        }
    }
}

/// レポート出力設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSettings {
    /// グラフ・CSV の出力ディレクトリ
    pub output_dir: String,
    /// グラフを描画するか（フォントのない環境では false にする）
    pub render_plots: bool,
    /// サンプル表示に使う学習データのインデックス
    pub sample_index: usize,
    /// 予測グリッドの行数
    pub grid_rows: usize,
    /// 予測グリッドの列数
    pub grid_cols: usize,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            output_dir: "reports".to_string(),
            render_plots: true,
            sample_index: 23,
            grid_rows: 5,
            grid_cols: 5,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// データセット設定
    #[serde(default)]
    pub data: DataSettings,
    /// モデル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
    /// レポート設定
    #[serde(default)]
    pub report: ReportSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しないか壊れている場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                info!("設定ファイルを読み込みました: {}", path.display());
                config
            }
            Err(e) => {
                warn!(
                    "設定ファイルの読み込みに失敗しました ({}): {:#}",
                    path.display(),
                    e
                );
                warn!("デフォルト設定を使用します");
                Self::default()
            }
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定値の整合性を確認
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.model.num_classes == 0 {
            anyhow::bail!("num_classes は 1 以上である必要があります");
        }
        if self.training.batch_size == 0 {
            anyhow::bail!("batch_size は 1 以上である必要があります");
        }
        if self.training.num_epochs == 0 {
            anyhow::bail!("num_epochs は 1 以上である必要があります");
        }
        if self.report.grid_rows == 0 || self.report.grid_cols == 0 {
            anyhow::bail!("予測グリッドの行数・列数は 1 以上である必要があります");
        }
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("\n--- データセット ---");
        println!("学習: {}", self.data.train_path);
        println!("検証: {}", self.data.valid_path);
        println!("テスト: {}", self.data.test_path);
        println!("\n--- モデル設定 ---");
        println!("モデルパス: {}", self.model.model_path);
        println!("分類クラス数: {}", self.model.num_classes);
        println!("入力サイズ: {}x{}", self.model.image_size, self.model.image_size);
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("シード: {}", self.training.seed);
        println!("\n--- レポート設定 ---");
        println!("出力先: {}", self.report.output_dir);
        println!("グラフ描画: {}", self.report.render_plots);
        println!(
            "予測グリッド: {}x{}",
            self.report.grid_rows, self.report.grid_cols
        );
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.model.num_classes, 43);
        assert_eq!(config.training.num_epochs, 5);
        assert_eq!(config.training.batch_size, 500);
        assert_eq!(config.training.learning_rate, 0.001);
        assert_eq!(config.report.sample_index, 23);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.model.num_classes, deserialized.model.num_classes);
        assert_eq!(config.data.test_path, deserialized.data.test_path);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "device_type": "Cpu", "training": { "num_epochs": 2, "batch_size": 16, "num_workers": 1, "learning_rate": 0.01, "seed": 1 } }"#)
                .unwrap();

        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.training.num_epochs, 2);
        assert_eq!(config.model.num_classes, 43);
        assert_eq!(config.report.grid_rows, 5);
    }

    #[test]
    fn test_load_or_default_from_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let config = AppConfig::load_or_default_from(&path);
        assert_eq!(config.training.num_epochs, 5);
        assert!(AppConfig::load(&path).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = AppConfig::default();
        config.device_type = DeviceType::Cpu;
        config.report.render_plots = false;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.device_type, DeviceType::Cpu);
        assert!(!loaded.report.render_plots);
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = AppConfig::default();
        config.training.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
