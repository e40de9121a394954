//! 合成データによる学習〜保存〜再読み込みの通しテスト

use burn_ndarray::{NdArray, NdArrayDevice};
use std::fs;
use std::path::Path;

use traffic_signs_lib::data::SignSplit;
use traffic_signs_lib::ml::InferenceEngine;
use traffic_signs_lib::model::{load_metadata, AppConfig, DeviceType};

const SIZE: usize = 32;
const NUM_CLASSES: usize = 3;

fn short_unicode(out: &mut Vec<u8>, s: &str) {
    out.push(0x8c);
    out.push(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
}

/// numpy 配列を `_reconstruct` + BUILD 形式で書き出す
fn push_array(out: &mut Vec<u8>, shape: &[usize], descr: &str, data: &[u8]) {
    out.extend_from_slice(b"cnumpy.core.multiarray\n_reconstruct\n");
    out.extend_from_slice(b"cnumpy\nndarray\n");
    out.extend_from_slice(&[b'K', 0, 0x85, b'C', 1, b'b', 0x87, b'R']);

    out.extend_from_slice(&[b'(', b'K', 1, b'(']);
    for &dim in shape {
        out.push(b'J');
        out.extend_from_slice(&(dim as i32).to_le_bytes());
    }
    out.push(b't');
    out.extend_from_slice(b"cnumpy\ndtype\n");
    short_unicode(out, descr);
    out.extend_from_slice(&[0x89, 0x88, 0x87, b'R', b'(', b'K', 3]);
    short_unicode(out, if descr == "u1" { "|" } else { "<" });
    out.extend_from_slice(&[b'N', b'N', b'N', b'J']);
    out.extend_from_slice(&(-1i32).to_le_bytes());
    out.push(b'J');
    out.extend_from_slice(&(-1i32).to_le_bytes());
    out.extend_from_slice(&[b'K', 0, b't', b'b']);

    out.extend_from_slice(&[0x89, b'B']);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(&[b't', b'b']);
}

/// 明るさでクラスを区別できる画像を生成し、pickle として保存する
fn write_split(path: &Path, count: usize, seed: u32) {
    let mut features = Vec::with_capacity(count * SIZE * SIZE * 3);
    let mut labels = Vec::with_capacity(count);
    for i in 0..count {
        let class = (i + seed as usize) % NUM_CLASSES;
        let base = [30u32, 128, 225][class];
        for p in 0..SIZE * SIZE {
            let noise = (p as u32 * 7 + i as u32 * 13 + seed) % 21;
            let v = (base + noise).min(255) as u8;
            features.extend_from_slice(&[v, v, v]);
        }
        labels.push(class as i64);
    }
    let label_bytes: Vec<u8> = labels.iter().flat_map(|v| v.to_le_bytes()).collect();

    let mut out = vec![0x80, 2, b'}', b'('];
    short_unicode(&mut out, "features");
    push_array(&mut out, &[count, SIZE, SIZE, 3], "u1", &features);
    short_unicode(&mut out, "labels");
    push_array(&mut out, &[count], "i8", &label_bytes);
    out.extend_from_slice(&[b'u', b'.']);

    fs::write(path, out).unwrap();
}

fn config_for(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.device_type = DeviceType::Cpu;
    config.data.train_path = dir.join("train.p").to_string_lossy().into_owned();
    config.data.valid_path = dir.join("valid.p").to_string_lossy().into_owned();
    config.data.test_path = dir.join("test.p").to_string_lossy().into_owned();
    config.model.num_classes = NUM_CLASSES;
    config.model.model_path = dir.join("models").join("lenet").to_string_lossy().into_owned();
    config.training.num_epochs = 2;
    config.training.batch_size = 16;
    config.report.output_dir = dir.join("reports").to_string_lossy().into_owned();
    config.report.render_plots = false;
    config.report.sample_index = 3;
    config
}

#[test]
fn test_full_pipeline_on_cpu() {
    let dir = tempfile::tempdir().unwrap();
    write_split(&dir.path().join("train.p"), 60, 0);
    write_split(&dir.path().join("valid.p"), 15, 1);
    write_split(&dir.path().join("test.p"), 15, 2);
    let config = config_for(dir.path());

    let summary = traffic_signs_lib::run(&config).unwrap();

    assert_eq!(summary.history.len(), 2);
    assert_eq!(summary.test.samples, 15);
    assert!((0.0..=1.0).contains(&summary.test.accuracy));
    assert_eq!(summary.confusion.total(), 15);
    assert_eq!(summary.confusion.num_classes(), NUM_CLASSES);
    assert!((summary.confusion.accuracy() - summary.test.accuracy).abs() < 1e-9);

    assert_eq!(summary.model_path, dir.path().join("models").join("lenet.tar.gz"));
    assert!(summary.model_path.exists());
    let reports = dir.path().join("reports");
    for name in ["history.csv", "confusion_matrix.csv", "train_raw.png", "test_normalized.png"] {
        assert!(reports.join(name).exists(), "{} がありません", name);
    }

    let metadata = load_metadata(&summary.model_path).unwrap();
    assert_eq!(metadata.num_classes, NUM_CLASSES);
    assert_eq!(metadata.num_epochs, 2);
    assert_eq!(metadata.test_accuracy, Some(summary.test.accuracy));

    // 保存したモデルで同じテスト結果が再現できる
    let engine = InferenceEngine::<NdArray<f32>>::load(&summary.model_path, NdArrayDevice::Cpu).unwrap();
    let test = SignSplit::load(dir.path().join("test.p")).unwrap();
    let reloaded = engine.evaluate(&test, 16).unwrap();
    assert!((reloaded.accuracy - summary.test.accuracy).abs() < 1e-9);
}

#[test]
fn test_missing_dataset_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path());

    let err = traffic_signs_lib::run(&config).unwrap_err();
    assert!(format!("{:#}", err).contains("train.p"));
}

#[test]
fn test_out_of_range_labels_fail() {
    let dir = tempfile::tempdir().unwrap();
    write_split(&dir.path().join("train.p"), 6, 0);
    write_split(&dir.path().join("valid.p"), 3, 0);
    write_split(&dir.path().join("test.p"), 3, 0);
    let mut config = config_for(dir.path());
    config.model.num_classes = 2;

    assert!(traffic_signs_lib::run(&config).is_err());
}
