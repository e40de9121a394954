//! 保存済みモデルの確認用バイナリ
//!
//! 使い方: inspect_model <model.tar.gz> [test.p] [cpu|wgpu]

use anyhow::{bail, Result};
use burn::backend::Wgpu;
use burn::tensor::backend::Backend;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::WgpuDevice;
use env_logger::Env;
use std::path::{Path, PathBuf};

use traffic_signs_lib::data::SignSplit;
use traffic_signs_lib::ml::InferenceEngine;
use traffic_signs_lib::model::{load_metadata, print_metadata_info};

const BATCH_SIZE: usize = 500;

fn evaluate_with<B: Backend>(model_path: &Path, test_path: &Path, device: B::Device) -> Result<()> {
    let engine = InferenceEngine::<B>::load(model_path, device)?;
    let split = SignSplit::load(test_path)?;
    let eval = engine.evaluate(&split, BATCH_SIZE)?;

    println!("Test Loss: {:.4}", eval.loss);
    println!("Test Accuracy: {}", eval.accuracy_label());

    let shown = split.len().min(5);
    let head = traffic_signs_lib::data::RawImages::new(
        split.images.data[..shown * split.images.image_len()].to_vec(),
        shown,
        split.images.height,
        split.images.width,
        split.images.channels,
    )?;
    for (i, result) in engine.classify(&head, BATCH_SIZE)?.iter().enumerate() {
        println!(
            "  [{}] 予測: {} ({}, {:.1}%) / 正解: {}",
            i,
            result.class_id,
            result.label,
            result.confidence * 100.0,
            split.labels[i]
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let Some(model_path) = args.get(1).map(PathBuf::from) else {
        bail!("使い方: inspect_model <model.tar.gz> [test.p] [cpu|wgpu]");
    };

    let metadata = load_metadata(&model_path)?;
    print_metadata_info(&metadata);

    let Some(test_path) = args.get(2).map(PathBuf::from) else {
        return Ok(());
    };

    match args.get(3).map(String::as_str).unwrap_or("cpu") {
        "cpu" => evaluate_with::<NdArray<f32>>(&model_path, &test_path, NdArrayDevice::Cpu),
        "wgpu" => evaluate_with::<Wgpu>(&model_path, &test_path, WgpuDevice::default()),
        other => bail!("不明なバックエンド: {} (cpu または wgpu)", other),
    }
}
