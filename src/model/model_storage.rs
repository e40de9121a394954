//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス名、入力サイズ、学習条件、評価結果）
//! - model.bin       - モデルの重み（バイナリ）

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// 保存先パスを `.tar.gz` に揃える
pub fn bundle_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 実際に書き込んだパスを返します。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = bundle_path(output_path);

    if let Some(parent) = tar_gz_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    tar_builder
        .into_inner()
        .context("Failed to finalize tar.gz archive")?
        .finish()
        .context("Failed to finish gzip stream")?;

    Ok(tar_gz_path)
}

/// アーカイブ内の指定エントリを走査し、`wanted` に一致したものを読み込む
fn read_entries(tar_gz_path: &Path, wanted: &[&str]) -> Result<Vec<(String, Vec<u8>)>> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    let mut found = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();

        if wanted.contains(&name.as_str()) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            found.push((name, buffer));
            if found.len() == wanted.len() {
                break;
            }
        }
    }
    Ok(found)
}

fn take_entry(entries: &mut Vec<(String, Vec<u8>)>, name: &str) -> Result<Vec<u8>> {
    let index = entries
        .iter()
        .position(|(entry, _)| entry == name)
        .ok_or_else(|| anyhow!("{} not found in tar.gz archive", name))?;
    Ok(entries.swap_remove(index).1)
}

fn parse_metadata(bytes: Vec<u8>) -> Result<ModelMetadata> {
    let json_str = String::from_utf8(bytes).context("metadata.json is not valid UTF-8")?;
    ModelMetadata::from_json_string(&json_str)
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let mut entries = read_entries(tar_gz_path, &[METADATA_ENTRY])?;
    parse_metadata(take_entry(&mut entries, METADATA_ENTRY)?)
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let mut entries = read_entries(tar_gz_path, &[METADATA_ENTRY, MODEL_ENTRY])?;
    let metadata = parse_metadata(take_entry(&mut entries, METADATA_ENTRY)?)?;
    let binary = take_entry(&mut entries, MODEL_ENTRY)?;
    Ok((metadata, binary))
}

fn percent(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.2}%", v * 100.0))
        .unwrap_or_else(|| "-".to_string())
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("クラス数: {}", metadata.num_classes);
    println!("モデル入力サイズ: {}x{}x1", metadata.image_size, metadata.image_size);
    println!("学習エポック数: {}", metadata.num_epochs);
    println!("バッチサイズ: {}", metadata.batch_size);
    println!("学習率: {}", metadata.learning_rate);
    println!("検証正解率（最終エポック）: {}", percent(metadata.final_val_accuracy));
    println!("テスト正解率: {}", percent(metadata.test_accuracy));
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}
