//! Plot sinks: an SVG panel grid and a terminal progress spinner.

use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use plotters::prelude::*;
use tracing::debug;

use crate::record::TIME_COLUMN;
use crate::sink::PlotSink;
use crate::table::Snapshot;

/// Panel grid: `ceil(sqrt(n))` columns and as many rows as needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub rows: usize,
    pub cols: usize,
    pub panels: usize,
}

impl Layout {
    pub fn for_panels(panels: usize) -> Self {
        let cols = ((panels as f64).sqrt().ceil() as usize).max(1);
        Self {
            rows: panels.div_ceil(cols).max(1),
            cols,
            panels,
        }
    }
}

/// Draws every plotted column against `time` into an SVG file.
#[derive(Debug)]
pub struct SvgPlotter {
    path: PathBuf,
    columns: Option<Vec<String>>,
    width: u32,
    height: u32,
    every: usize,
    calls: usize,
    layout: Option<Layout>,
    rebuilds: usize,
}

impl SvgPlotter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            columns: None,
            width: 1024,
            height: 768,
            every: 1,
            calls: 0,
            layout: None,
            rebuilds: 0,
        }
    }

    /// Plot only these columns, in this order.
    pub fn columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Redraw on every `n`-th call only.
    pub fn every(mut self, n: usize) -> Self {
        self.every = n.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> Option<Layout> {
        self.layout
    }

    /// How many times the panel grid was laid out.
    pub fn rebuilds(&self) -> usize {
        self.rebuilds
    }

    fn panel_names(&self, data: &Snapshot) -> Vec<String> {
        match &self.columns {
            Some(columns) => columns.clone(),
            None => data
                .schema()
                .names()
                .filter(|n| *n != TIME_COLUMN)
                .map(str::to_string)
                .collect(),
        }
    }

    fn layout_for(&mut self, panels: usize) -> Layout {
        match self.layout {
            Some(layout) if layout.panels == panels => layout,
            _ => {
                let layout = Layout::for_panels(panels);
                debug!(?layout, path = %self.path.display(), "plot layout rebuilt");
                self.layout = Some(layout);
                self.rebuilds += 1;
                layout
            }
        }
    }

    fn draw(&self, data: &Snapshot, names: &[String], layout: Layout) -> anyhow::Result<()> {
        let root = SVGBackend::new(&self.path, (self.width, self.height)).into_drawing_area();
        root.fill(&WHITE)?;
        let panels = root.split_evenly((layout.rows, layout.cols));
        let times = data.floats(TIME_COLUMN).unwrap_or(&[]);

        for (panel, name) in panels.iter().zip(names) {
            let values = data.floats(name);
            let (x_range, y_range) = ranges(times, values.unwrap_or(&[]));
            let mut chart = ChartBuilder::on(panel)
                .caption(name, ("sans-serif", 20))
                .margin(10)
                .x_label_area_size(30)
                .y_label_area_size(60)
                .build_cartesian_2d(x_range, y_range)?;
            chart.configure_mesh().x_desc(TIME_COLUMN).draw()?;
            // text columns keep an empty titled panel
            if let Some(values) = values {
                chart.draw_series(LineSeries::new(
                    times.iter().copied().zip(values.iter().copied()),
                    &BLUE,
                ))?;
            }
        }
        root.present()?;
        Ok(())
    }
}

/// Axis ranges covering the data, padded so a flat or empty series still
/// gets a drawable span.
fn ranges(xs: &[f64], ys: &[f64]) -> (std::ops::Range<f64>, std::ops::Range<f64>) {
    fn span(values: &[f64]) -> std::ops::Range<f64> {
        let (lo, hi) = values
            .iter()
            .filter(|v| v.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if lo > hi {
            return 0.0..1.0;
        }
        if hi - lo < f64::EPSILON {
            let pad = if lo == 0.0 { 1.0 } else { lo.abs() * 0.1 };
            return lo - pad..hi + pad;
        }
        let pad = (hi - lo) * 0.05;
        lo - pad..hi + pad
    }
    (span(xs), span(ys))
}

impl PlotSink for SvgPlotter {
    fn render(&mut self, data: &Snapshot) -> anyhow::Result<()> {
        let call = self.calls;
        self.calls += 1;
        if call % self.every != 0 {
            return Ok(());
        }
        let names = self.panel_names(data);
        let layout = self.layout_for(names.len());
        self.draw(data, &names, layout)
    }
}

/// Terminal spinner showing the sample count and the latest `time`.
///
/// Clones share the same spinner.
#[derive(Debug, Clone)]
pub struct ProgressPlot {
    bar: ProgressBar,
}

impl ProgressPlot {
    pub fn new() -> Self {
        Self::with_bar(ProgressBar::new_spinner())
    }

    /// Progress sink that draws nowhere, for tests and quiet runs.
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    fn with_bar(bar: ProgressBar) -> Self {
        if let Ok(style) = ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}") {
            bar.set_style(style);
        }
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    pub fn message(&self) -> String {
        self.bar.message()
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressPlot {
    fn default() -> Self {
        Self::new()
    }
}

impl PlotSink for ProgressPlot {
    fn render(&mut self, data: &Snapshot) -> anyhow::Result<()> {
        let last = data
            .floats(TIME_COLUMN)
            .and_then(|t| t.last().copied())
            .unwrap_or_default();
        self.bar
            .set_message(format!("{} samples, t = {last:.3} s", data.len()));
        self.bar.tick();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Measurement;
    use crate::table::SampleTable;
    use tempfile::TempDir;

    fn data(extra: &[&str]) -> Snapshot {
        let mut table = SampleTable::new();
        for i in 0..4 {
            let mut m = Measurement::new(i as f64, &[]);
            for name in extra {
                m.set(*name, (i * i) as f64).unwrap();
            }
            m.set("mode", "dc").unwrap();
            table.append(&m).unwrap();
        }
        table.snapshot()
    }

    #[test]
    fn layout_grid_sizes() {
        assert_eq!(Layout::for_panels(1), Layout { rows: 1, cols: 1, panels: 1 });
        assert_eq!(Layout::for_panels(3), Layout { rows: 2, cols: 2, panels: 3 });
        assert_eq!(Layout::for_panels(5), Layout { rows: 2, cols: 3, panels: 5 });
        assert_eq!(Layout::for_panels(0), Layout { rows: 1, cols: 1, panels: 0 });
    }

    #[test]
    fn writes_svg_and_rebuilds_on_column_change() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("plot.svg");
        let mut plotter = SvgPlotter::new(&path).size(640, 480);

        plotter.render(&data(&["current"])).unwrap();
        plotter.render(&data(&["current"])).unwrap();
        assert_eq!(plotter.rebuilds(), 1);
        assert_eq!(plotter.layout().unwrap().panels, 2);

        plotter.render(&data(&["current", "voltage", "power"])).unwrap();
        assert_eq!(plotter.rebuilds(), 2);
        assert_eq!(plotter.layout().unwrap(), Layout { rows: 2, cols: 2, panels: 4 });

        let svg = std::fs::read_to_string(&path).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("voltage"));
    }

    #[test]
    fn every_skips_intermediate_calls() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("plot.svg");
        let mut plotter = SvgPlotter::new(&path).every(3).columns(["current"]);
        plotter.render(&data(&["current"])).unwrap();
        std::fs::remove_file(&path).unwrap();
        plotter.render(&data(&["current"])).unwrap();
        plotter.render(&data(&["current"])).unwrap();
        assert!(!path.exists());
        plotter.render(&data(&["current"])).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn flat_and_empty_ranges_are_padded() {
        let (x, y) = ranges(&[], &[2.0, 2.0]);
        assert_eq!(x, 0.0..1.0);
        assert!(y.start < 2.0 && y.end > 2.0);
    }

    #[test]
    fn progress_reports_count() {
        let mut progress = ProgressPlot::hidden();
        progress.render(&data(&[])).unwrap();
        assert!(progress.message().starts_with("4 samples"));
        progress.finish();
    }
}
