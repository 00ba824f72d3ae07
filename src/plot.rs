//! SVG plots.
//!
//! The experiments do not draw live plots. Instead, each sweep is followed by
//! a [`SeriesPlot`] observer that accumulates the plotted values of every step
//! and writes an SVG file into the result bundle when the sweep finishes.

use crate::sweep::{Step, SweepObserver};
use anyhow::Result;
use plotters::prelude::*;
use std::path::{Path, PathBuf};

const SIZE: (u32, u32) = (1024, 600);
const COLORS: [RGBColor; 6] = [BLUE, RED, GREEN, MAGENTA, CYAN, BLACK];

fn range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (min, max) = values
        .filter(|x| x.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), x| {
            (lo.min(x), hi.max(x))
        });
    if min > max {
        (0.0, 1.0)
    } else if min == max {
        (min - 0.5, max + 0.5)
    } else {
        (min, max)
    }
}

/// Writes an SVG plot with one line per series.
///
/// Non-finite values are skipped.
pub fn plot_lines(
    path: &Path,
    title: &str,
    x_label: &str,
    y_label: &str,
    x: &[f64],
    series: &[(&str, &[f64])],
) -> Result<()> {
    let root = SVGBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE)?;
    let (x_min, x_max) = range(x.iter().copied());
    let (y_min, y_max) = range(series.iter().flat_map(|(_, y)| y.iter().copied()));
    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 24))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)?;
    chart
        .configure_mesh()
        .x_desc(x_label)
        .y_desc(y_label)
        .draw()?;
    for (j, (label, y)) in series.iter().enumerate() {
        let color = COLORS[j % COLORS.len()];
        chart
            .draw_series(LineSeries::new(
                x.iter()
                    .zip(y.iter())
                    .filter(|(x, y)| x.is_finite() && y.is_finite())
                    .map(|(&x, &y)| (x, y)),
                color,
            ))?
            .label(*label)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], color));
    }
    chart
        .configure_series_labels()
        .border_style(BLACK)
        .background_style(WHITE.mix(0.8))
        .draw()?;
    root.present()?;
    Ok(())
}

/// Sweep observer that writes an SVG plot when the sweep finishes.
///
/// The x axis is the baseband frequency of the steps.
#[derive(Debug, Clone)]
pub struct SeriesPlot {
    path: PathBuf,
    title: String,
    y_label: String,
    labels: Vec<String>,
    x: Vec<f64>,
    y: Vec<Vec<f64>>,
    enabled: bool,
}

impl SeriesPlot {
    /// Creates a plot with one series per label.
    ///
    /// A disabled plot records nothing and writes no file.
    pub fn new(path: PathBuf, title: &str, y_label: &str, labels: &[&str], enabled: bool) -> SeriesPlot {
        SeriesPlot {
            path,
            title: title.to_string(),
            y_label: y_label.to_string(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            x: Vec::new(),
            y: vec![Vec::new(); labels.len()],
            enabled,
        }
    }
}

impl SweepObserver for SeriesPlot {
    fn on_step(&mut self, step: &Step, values: &[f64]) {
        tracing::trace!(index = step.index, ?values, "plot step");
        if !self.enabled {
            return;
        }
        self.x.push(step.freq);
        for (j, y) in self.y.iter_mut().enumerate() {
            y.push(values.get(j).copied().unwrap_or(f64::NAN));
        }
    }

    fn on_finish(&mut self) -> Result<()> {
        if !self.enabled || self.x.is_empty() {
            return Ok(());
        }
        let series: Vec<(&str, &[f64])> = self
            .labels
            .iter()
            .map(String::as_str)
            .zip(self.y.iter().map(Vec::as_slice))
            .collect();
        plot_lines(
            &self.path,
            &self.title,
            "Frequency [MHz]",
            &self.y_label,
            &self.x,
            &series,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ranges() {
        assert_eq!(range([1.0, f64::NEG_INFINITY, 3.0].into_iter()), (1.0, 3.0));
        assert_eq!(range([2.0].into_iter()), (1.5, 2.5));
        assert_eq!(range(std::iter::empty()), (0.0, 1.0));
    }

    #[test]
    fn writes_svg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srr.svg");
        let mut plot = SeriesPlot::new(path.clone(), "SRR", "SRR [dB]", &["USB", "LSB"], true);
        for (index, channel) in [1usize, 11, 21].into_iter().enumerate() {
            let step = Step {
                index,
                channel,
                freq: channel as f64,
                rf_freq: channel as f64,
            };
            plot.on_step(&step, &[40.0 + index as f64, 45.0]);
        }
        plot.on_finish().unwrap();
        let svg = std::fs::read_to_string(&path).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("USB"));
    }
}
