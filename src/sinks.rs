//! Output sinks the trainer reports to: image grids and per-epoch metrics.

use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor};
use image::{Rgb, RgbImage};
use plotters::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::IMAGE_CHANNELS;
use crate::error::CycleVaeError;

pub trait VisualizationSink {
    /// `images`: channel-last `B×H×W×3` batch in `[0, 1]`.
    fn image_grid(&mut self, images: &Tensor, label: &str) -> Result<()>;
}

pub trait ProgressSink {
    fn update(&mut self, epoch: usize, metrics: &BTreeMap<&'static str, f64>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// PNG grids
// ---------------------------------------------------------------------------

/// Tiles the first `rows * cols` images of a batch into one PNG per label.
pub struct PngGridWriter {
    dir: PathBuf,
    rows: usize,
    cols: usize,
}

impl PngGridWriter {
    pub fn new(dir: impl Into<PathBuf>, rows: usize, cols: usize) -> Self {
        Self {
            dir: dir.into(),
            rows,
            cols,
        }
    }

    pub fn path_for(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{label}.png"))
    }
}

impl VisualizationSink for PngGridWriter {
    fn image_grid(&mut self, images: &Tensor, label: &str) -> Result<()> {
        let dims = images.dims();
        if dims.len() != 4 || dims[3] != IMAGE_CHANNELS {
            return Err(CycleVaeError::shape("grid images", "B×H×W×3", dims).into());
        }
        let (batch, height, width) = (dims[0], dims[1], dims[2]);
        let count = batch.min(self.rows * self.cols);

        let pixels = images
            .narrow(0, 0, count)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .clamp(0f32, 1f32)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        let mut canvas = RgbImage::new((self.cols * width) as u32, (self.rows * height) as u32);
        for idx in 0..count {
            let (row, col) = (idx / self.cols, idx % self.cols);
            for y in 0..height {
                for x in 0..width {
                    let base = ((idx * height + y) * width + x) * IMAGE_CHANNELS;
                    let px = |c: usize| (pixels[base + c] * 255.0).round() as u8;
                    canvas.put_pixel(
                        (col * width + x) as u32,
                        (row * height + y) as u32,
                        Rgb([px(0), px(1), px(2)]),
                    );
                }
            }
        }

        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(label);
        canvas.save(&path)?;
        tracing::debug!(path = %path.display(), images = count, "image grid written");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loss history
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HistoryLine<'a> {
    epoch: usize,
    #[serde(flatten)]
    metrics: &'a BTreeMap<&'static str, f64>,
}

const CHART_SIZE: (u32, u32) = (800, 480);
const SERIES_COLORS: [RGBColor; 6] = [RED, BLUE, GREEN, MAGENTA, CYAN, BLACK];

/// Appends one JSON object per epoch to a `.jsonl` file and, when a chart path
/// is set, redraws a line chart with one series per metric after every epoch.
pub struct LossHistory {
    path: PathBuf,
    chart: Option<PathBuf>,
    epochs: Vec<(usize, BTreeMap<&'static str, f64>)>,
}

impl LossHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            chart: None,
            epochs: Vec::new(),
        }
    }

    pub fn with_chart(mut self, chart: impl Into<PathBuf>) -> Self {
        self.chart = Some(chart.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chart_path(&self) -> Option<&Path> {
        self.chart.as_deref()
    }

    fn append_line(&self, epoch: usize, metrics: &BTreeMap<&'static str, f64>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(&HistoryLine { epoch, metrics })?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Series per metric name, finite points only.
    fn series(&self) -> BTreeMap<&'static str, Vec<(f64, f64)>> {
        let mut series: BTreeMap<&'static str, Vec<(f64, f64)>> = BTreeMap::new();
        for (epoch, metrics) in &self.epochs {
            for (&name, &value) in metrics {
                let points = series.entry(name).or_default();
                if value.is_finite() {
                    points.push((*epoch as f64, value));
                }
            }
        }
        series
    }

    fn draw_chart(&self, path: &Path) -> Result<()> {
        let series = self.series();
        let points = series.values().flatten();
        let (mut x_min, mut x_max) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut y_min, mut y_max) = (f64::INFINITY, f64::NEG_INFINITY);
        for &(x, y) in points {
            x_min = x_min.min(x);
            x_max = x_max.max(x);
            y_min = y_min.min(y);
            y_max = y_max.max(y);
        }
        if !x_min.is_finite() {
            tracing::debug!("no finite losses yet, chart skipped");
            return Ok(());
        }
        if x_max - x_min < 1.0 {
            x_max = x_min + 1.0;
        }
        let pad = ((y_max - y_min) * 0.05).max(1e-6);
        let (y_lo, y_hi) = (y_min - pad, y_max + pad);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let root = BitMapBackend::new(path, CHART_SIZE).into_drawing_area();
        root.fill(&WHITE).map_err(|e| anyhow!("chart backend error: {e}"))?;
        {
            // no text: the bitmap backend is built without a font renderer
            let mut chart = ChartBuilder::on(&root)
                .margin(10)
                .build_cartesian_2d(x_min..x_max, y_lo..y_hi)
                .map_err(|e| anyhow!("chart build error: {e}"))?;
            for (idx, points) in series.into_values().enumerate() {
                let color = SERIES_COLORS[idx % SERIES_COLORS.len()];
                chart
                    .draw_series(LineSeries::new(points, color.stroke_width(2)))
                    .map_err(|e| anyhow!("chart draw error: {e}"))?;
            }
        }
        root.present().map_err(|e| anyhow!("chart render error: {e}"))?;
        tracing::debug!(path = %path.display(), epochs = self.epochs.len(), "loss chart written");
        Ok(())
    }
}

impl ProgressSink for LossHistory {
    fn update(&mut self, epoch: usize, metrics: &BTreeMap<&'static str, f64>) -> Result<()> {
        tracing::info!(epoch, ?metrics, "epoch metrics");
        self.epochs.push((epoch, metrics.clone()));
        self.append_line(epoch, metrics)?;
        if let Some(chart) = &self.chart {
            self.draw_chart(chart)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_layout_and_clamping() -> Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let mut writer = PngGridWriter::new(dir.path().join("grids"), 1, 2);

        // first image over-saturated, second negative, third beyond the grid
        let bright = Tensor::full(2f32, (1, 3, 4, 3), &device)?;
        let dark = Tensor::full(-1f32, (1, 3, 4, 3), &device)?;
        let extra = Tensor::full(0.5f32, (1, 3, 4, 3), &device)?;
        let images = Tensor::cat(&[&bright, &dark, &extra], 0)?;
        writer.image_grid(&images, "0_original")?;

        let png = image::open(writer.path_for("0_original"))?.to_rgb8();
        assert_eq!(png.dimensions(), (8, 3));
        assert_eq!(png.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(png.get_pixel(7, 2), &Rgb([0, 0, 0]));
        Ok(())
    }

    #[test]
    fn test_grid_rejects_channel_first() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut writer = PngGridWriter::new(dir.path(), 2, 8);
        let images = Tensor::zeros((2, 3, 60, 60), DType::F32, &Device::Cpu)?;
        assert!(writer.image_grid(&images, "bad").is_err());
        Ok(())
    }

    #[test]
    fn test_history_appends_json_lines() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut history = LossHistory::new(dir.path().join("figures").join("run.jsonl"));
        for epoch in 0..3 {
            let metrics = BTreeMap::from([("reconstruction_error", epoch as f64 * 0.5)]);
            history.update(epoch, &metrics)?;
        }
        let raw = std::fs::read_to_string(history.path())?;
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(serde_json::from_str::<serde_json::Value>)
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2]["epoch"], 2);
        assert_eq!(lines[2]["reconstruction_error"], 1.0);
        Ok(())
    }

    #[test]
    fn test_history_redraws_loss_chart() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let chart = dir.path().join("figures").join("sprites.png");
        let mut history = LossHistory::new(dir.path().join("figures").join("sprites_history.jsonl"))
            .with_chart(&chart);
        assert_eq!(history.chart_path(), Some(chart.as_path()));

        for epoch in 0..2 {
            let metrics = BTreeMap::from([
                ("kl_divergence_error", 0.5 / (epoch + 1) as f64),
                ("reconstruction_error", 2.0 - epoch as f64),
                ("reverse_cycle_loss", 0.25),
            ]);
            history.update(epoch, &metrics)?;
        }

        let png = image::open(&chart)?.to_rgb8();
        assert_eq!(png.dimensions(), CHART_SIZE);
        assert!(png.pixels().any(|p| p != &Rgb([255, 255, 255])), "chart is blank");
        assert_eq!(std::fs::read_to_string(history.path())?.lines().count(), 2);
        Ok(())
    }

    #[test]
    fn test_chart_tolerates_non_finite_epoch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let chart = dir.path().join("nan.png");
        let mut history = LossHistory::new(dir.path().join("nan.jsonl")).with_chart(&chart);
        history.update(0, &BTreeMap::from([("reconstruction_error", f64::NAN)]))?;
        assert!(!chart.exists());
        history.update(1, &BTreeMap::from([("reconstruction_error", 1.0)]))?;
        assert!(chart.exists());
        Ok(())
    }
}
