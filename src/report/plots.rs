//! 学習曲線・混同行列・予測サンプルの PNG 描画

use anyhow::{anyhow, bail, Result};
use plotters::prelude::*;
use std::path::{Path, PathBuf};

use crate::data::dataset::RawImages;
use crate::ml::evaluation::ConfusionMatrix;
use crate::ml::training::History;

const CHART_SIZE: (u32, u32) = (800, 600);
const ORANGE: RGBColor = RGBColor(255, 165, 0);

fn draw_err<E: std::fmt::Display>(e: E) -> anyhow::Error {
    anyhow!("描画エラー: {}", e)
}

/// 折れ線 1 本分
#[derive(Debug, Clone, Copy)]
pub struct Series<'a> {
    pub label: &'a str,
    pub values: &'a [f64],
    pub color: RGBColor,
}

/// 値の範囲に 5% の余白を付ける（値が 1 種類でも幅を持たせる）
pub fn padded_range(values: impl IntoIterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if lo > hi {
        return (0.0, 1.0);
    }
    let span = hi - lo;
    if span < 1e-9 {
        return (lo - 0.5, hi + 0.5);
    }
    (lo - span * 0.05, hi + span * 0.05)
}

/// エポックごとの指標を折れ線と黒い点で描画する
///
/// 系列が 2 本以上あるときは凡例を付けます。
pub fn plot_series(path: &Path, title: &str, y_desc: &str, series: &[Series<'_>]) -> Result<()> {
    let epochs = series.iter().map(|s| s.values.len()).max().unwrap_or(0);
    if epochs == 0 {
        bail!("描画するデータがありません: {}", title);
    }
    let (y_min, y_max) = padded_range(series.iter().flat_map(|s| s.values.iter().copied()));

    let root = BitMapBackend::new(path, CHART_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(draw_err)?;

    {
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .caption(title, ("sans-serif", 24))
            .set_label_area_size(LabelAreaPosition::Left, 60)
            .set_label_area_size(LabelAreaPosition::Bottom, 50)
            .build_cartesian_2d(0.5f64..(epochs as f64 + 0.5), y_min..y_max)
            .map_err(draw_err)?;

        chart
            .configure_mesh()
            .x_desc("Epochs")
            .y_desc(y_desc)
            .x_labels(epochs.min(20))
            .draw()
            .map_err(draw_err)?;

        for s in series {
            let points: Vec<(f64, f64)> = s
                .values
                .iter()
                .enumerate()
                .map(|(i, &v)| ((i + 1) as f64, v))
                .collect();
            let color = s.color;

            chart
                .draw_series(LineSeries::new(points.clone(), color.stroke_width(2)))
                .map_err(draw_err)?
                .label(s.label)
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2)));
            chart
                .draw_series(points.into_iter().map(|p| Circle::new(p, 3, BLACK.filled())))
                .map_err(draw_err)?;
        }

        if series.len() > 1 {
            chart
                .configure_series_labels()
                .background_style(WHITE.mix(0.8))
                .border_style(BLACK)
                .draw()
                .map_err(draw_err)?;
        }
    }

    root.present().map_err(draw_err)?;
    Ok(())
}

/// 件数の割合 (0〜1) を白から紺へのグラデーションに変換
pub fn heat_color(norm: f64) -> RGBColor {
    let t = norm.clamp(0.0, 1.0);
    let r = (255.0 * (1.0 - 0.97 * t)) as u8;
    let g = (255.0 * (1.0 - 0.8 * t)) as u8;
    let b = (255.0 * (1.0 - 0.55 * t)) as u8;
    RGBColor(r, g, b)
}

/// 混同行列のヒートマップ（各セルに件数を表示）
///
/// 縦軸が正解クラス（上が 0）、横軸が予測クラスです。
pub fn plot_confusion(path: &Path, matrix: &ConfusionMatrix) -> Result<()> {
    let n = matrix.num_classes();
    if n == 0 {
        bail!("クラス数が 0 の混同行列は描画できません");
    }
    let n_i = n as i32;
    let max_count = matrix.max_count().max(1) as f64;

    let root = BitMapBackend::new(path, (1000, 960)).into_drawing_area();
    root.fill(&WHITE).map_err(draw_err)?;

    {
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .caption("Confusion Matrix", ("sans-serif", 24))
            .set_label_area_size(LabelAreaPosition::Left, 50)
            .set_label_area_size(LabelAreaPosition::Bottom, 50)
            .build_cartesian_2d(0..n_i, 0..n_i)
            .map_err(draw_err)?;

        let y_formatter = |y: &i32| (n_i - 1 - *y).to_string();
        chart
            .configure_mesh()
            .disable_mesh()
            .x_desc("Predicted")
            .y_desc("True")
            .x_labels(n)
            .y_labels(n)
            .y_label_formatter(&y_formatter)
            .draw()
            .map_err(draw_err)?;

        let font_size = (600 / n_i).clamp(8, 16);
        for truth in 0..n {
            let y = n_i - 1 - truth as i32;
            for predicted in 0..n {
                let x = predicted as i32;
                let count = matrix.get(truth, predicted);
                let norm = count as f64 / max_count;

                chart
                    .draw_series(std::iter::once(Rectangle::new(
                        [(x, y), (x + 1, y + 1)],
                        heat_color(norm).filled(),
                    )))
                    .map_err(draw_err)?;

                if count > 0 {
                    let text_color = if norm > 0.5 { WHITE } else { BLACK };
                    let style = ("sans-serif", font_size).into_font().color(&text_color);
                    chart
                        .draw_series(std::iter::once(
                            EmptyElement::at((x, y + 1)) + Text::new(count.to_string(), (2, 2), style),
                        ))
                        .map_err(draw_err)?;
                }
            }
        }
    }

    root.present().map_err(draw_err)?;
    Ok(())
}

/// 画像の画素 (px, py) を描画領域上の矩形に対応付ける
///
/// 縦横比を保ったまま領域に収まる最大の倍率で拡大し、中央に配置します。
pub fn pixel_rect(
    px: usize,
    py: usize,
    image_size: (usize, usize),
    area_size: (u32, u32),
) -> ((i32, i32), (i32, i32)) {
    let (img_w, img_h) = (image_size.0.max(1) as f64, image_size.1.max(1) as f64);
    let (area_w, area_h) = (area_size.0 as f64, area_size.1 as f64);
    let scale = (area_w / img_w).min(area_h / img_h);
    let offset_x = (area_w - img_w * scale) / 2.0;
    let offset_y = (area_h - img_h * scale) / 2.0;

    let x0 = offset_x + px as f64 * scale;
    let y0 = offset_y + py as f64 * scale;
    (
        (x0.round() as i32, y0.round() as i32),
        ((x0 + scale).round() as i32, (y0 + scale).round() as i32),
    )
}

/// 画像ごとに「Predictions = {}, True = {}」の見出しを付けたグリッド
pub fn plot_prediction_grid(
    path: &Path,
    images: &RawImages,
    predicted: &[usize],
    truth: &[usize],
    rows: usize,
    cols: usize,
) -> Result<()> {
    let count = (rows * cols).min(images.count).min(predicted.len()).min(truth.len());
    let cell = 240u32;

    let root = BitMapBackend::new(path, (cell * cols as u32, cell * rows as u32)).into_drawing_area();
    root.fill(&WHITE).map_err(draw_err)?;

    for (i, area) in root.split_evenly((rows, cols)).into_iter().enumerate().take(count) {
        let title = format!("Predictions = {}, True = {}", predicted[i], truth[i]);
        let inner = area.titled(&title, ("sans-serif", 14)).map_err(draw_err)?;
        let inner = inner.margin(2, 2, 2, 2);

        let Some(pixels) = images.image(i) else {
            continue;
        };
        let area_size = inner.dim_in_pixel();
        for (index, pixel) in pixels.chunks_exact(images.channels.max(1)).enumerate() {
            let (px, py) = (index % images.width, index / images.width);
            let color = match pixel {
                [r, g, b, ..] => RGBColor(*r, *g, *b),
                [v, ..] => RGBColor(*v, *v, *v),
                [] => continue,
            };
            let (top_left, bottom_right) = pixel_rect(px, py, (images.width, images.height), area_size);
            inner
                .draw(&Rectangle::new([top_left, bottom_right], color.filled()))
                .map_err(draw_err)?;
        }
    }

    root.present().map_err(draw_err)?;
    Ok(())
}

/// 学習履歴から 6 種類の曲線を描画し、書き出したパスを返す
pub fn plot_history(dir: &Path, history: &History) -> Result<Vec<PathBuf>> {
    let accuracy = history.accuracy();
    let loss = history.loss();
    let val_accuracy = history.val_accuracy();
    let val_loss = history.val_loss();

    let charts: [(&str, &str, &str, Vec<Series<'_>>); 6] = [
        (
            "training_accuracy.png",
            "Training Accuracy over Epochs",
            "Accuracy",
            vec![Series { label: "Training", values: &accuracy, color: BLUE }],
        ),
        (
            "training_loss.png",
            "Training Loss over Epochs",
            "Loss",
            vec![Series { label: "Training", values: &loss, color: RED }],
        ),
        (
            "validation_accuracy.png",
            "Validation Accuracy over Epochs",
            "Accuracy",
            vec![Series { label: "Validation", values: &val_accuracy, color: GREEN }],
        ),
        (
            "validation_loss.png",
            "Validation Loss over Epochs",
            "Loss",
            vec![Series { label: "Validation", values: &val_loss, color: ORANGE }],
        ),
        (
            "accuracy_comparison.png",
            "Training vs. Validation Accuracy",
            "Accuracy",
            vec![
                Series { label: "Training", values: &accuracy, color: BLUE },
                Series { label: "Validation", values: &val_accuracy, color: RED },
            ],
        ),
        (
            "loss_comparison.png",
            "Training vs. Validation Loss",
            "Loss",
            vec![
                Series { label: "Training", values: &loss, color: GREEN },
                Series { label: "Validation", values: &val_loss, color: ORANGE },
            ],
        ),
    ];

    let mut written = Vec::with_capacity(charts.len());
    for (file, title, y_desc, series) in &charts {
        let path = dir.join(file);
        plot_series(&path, title, y_desc, series)?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::training::EpochMetrics;

    #[test]
    fn test_padded_range() {
        assert_eq!(padded_range(Vec::new()), (0.0, 1.0));
        assert_eq!(padded_range(vec![2.0, 2.0]), (1.5, 2.5));

        let (lo, hi) = padded_range(vec![0.0, 1.0, f64::NAN]);
        assert!((lo + 0.05).abs() < 1e-12);
        assert!((hi - 1.05).abs() < 1e-12);
    }

    #[test]
    fn test_heat_color_bounds() {
        assert_eq!(heat_color(0.0), RGBColor(255, 255, 255));
        assert_eq!(heat_color(-1.0), heat_color(0.0));
        let dark = heat_color(1.0);
        assert!(dark.0 < 10 && dark.2 > dark.0);
    }

    #[test]
    fn test_pixel_rect_keeps_aspect_and_centers() {
        // 32x32 画像を 200x100 の領域へ: 倍率 3.125、横方向に 50px の余白
        assert_eq!(pixel_rect(0, 0, (32, 32), (200, 100)), ((50, 0), (53, 3)));
        let (_, bottom_right) = pixel_rect(31, 31, (32, 32), (200, 100));
        assert_eq!(bottom_right, (150, 100));
    }

    #[test]
    fn test_plot_series_rejects_empty() {
        let dir = tempfile::tempdir().unwrap();
        let result = plot_series(&dir.path().join("empty.png"), "Empty", "Loss", &[]);
        assert!(result.is_err());
    }

    #[test]
    #[ignore = "requires system fonts"]
    fn test_render_all_charts() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = History::default();
        for epoch in 1..=3 {
            let e = epoch as f64;
            history.push(EpochMetrics {
                epoch,
                loss: 2.0 / e,
                accuracy: 0.3 * e,
                val_loss: 2.2 / e,
                val_accuracy: 0.28 * e,
            });
        }

        let written = plot_history(dir.path(), &history).unwrap();
        assert_eq!(written.len(), 6);
        assert!(written.iter().all(|p| p.exists()));

        let matrix = ConfusionMatrix::from_predictions(&[0, 1, 2, 2], &[0, 1, 2, 0], 3).unwrap();
        let confusion = dir.path().join("confusion.png");
        plot_confusion(&confusion, &matrix).unwrap();
        assert!(confusion.exists());

        let images = RawImages::new(vec![128; 4 * 32 * 32 * 3], 4, 32, 32, 3).unwrap();
        let grid = dir.path().join("grid.png");
        plot_prediction_grid(&grid, &images, &[0, 1, 2, 0], &[0, 1, 2, 2], 2, 2).unwrap();
        assert!(grid.exists());
    }
}
