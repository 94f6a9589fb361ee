//! Reference-vs-study PCA scatter plots.

use std::collections::BTreeMap;
use std::path::Path;

use log::info;
use plotters::coord::Shift;
use plotters::prelude::*;

use crate::classifier::LabeledTable;
use crate::error::{AncestryError, Result};

const PANEL_SIZE: (u32, u32) = (600, 600);
const UNKNOWN_COLOR: RGBColor = RGBColor(0xBB, 0xBB, 0xBB);

/// Super-population colours, in legend order.
pub const PALETTE: [(&str, RGBColor); 8] = [
    ("AFR", RGBColor(0x98, 0x4E, 0xA3)),
    ("EAS", RGBColor(0x4D, 0xAF, 0x4A)),
    ("EUR", RGBColor(0x37, 0x7E, 0xB8)),
    ("CSA", RGBColor(0xFF, 0x7F, 0x00)),
    ("AMR", RGBColor(0xE4, 0x1A, 0x1C)),
    ("MID", RGBColor(0xA6, 0x56, 0x28)),
    ("OCE", RGBColor(0x99, 0x99, 0x99)),
    ("oth", RGBColor(0xF0, 0xE4, 0x42)),
];

pub fn population_color(label: &str) -> RGBColor {
    PALETTE
        .iter()
        .find(|(name, _)| *name == label)
        .map_or(UNKNOWN_COLOR, |(_, color)| *color)
}

/// Study counts per palette entry (zero when absent), then any other labels.
pub fn legend_counts(predicted: &[&str]) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for label in predicted {
        *counts.entry(*label).or_default() += 1;
    }
    let mut legend: Vec<(String, usize)> = PALETTE
        .iter()
        .map(|(name, _)| (name.to_string(), counts.remove(name).unwrap_or(0)))
        .collect();
    legend.extend(counts.into_iter().map(|(name, n)| (name.to_string(), n)));
    legend
}

/// PC index pairs drawn one per panel: (0, 1), (2, 3), ...
pub fn panel_pairs(num_pcs: usize) -> Vec<(usize, usize)> {
    (0..num_pcs / 2).map(|i| (2 * i, 2 * i + 1)).collect()
}

fn plot_err<E: std::fmt::Debug>(e: E) -> AncestryError {
    AncestryError::Plot(format!("{:?}", e))
}

struct Points {
    reference: Vec<(f64, f64, RGBColor)>,
    study: Vec<(f64, f64, RGBColor)>,
}

fn draw_panel<DB: DrawingBackend>(
    area: &DrawingArea<DB, Shift>,
    labeled: &LabeledTable,
    study_rows: &[usize],
    known: &[usize],
    (x_pc, y_pc): (usize, usize),
    legend: &[(String, usize)],
) -> std::result::Result<(), DrawingAreaErrorKind<DB::ErrorType>> {
    area.fill(&WHITE)?;
    let scores = &labeled.table.scores;
    let point = |row: usize, color: RGBColor| (scores[[row, x_pc]], scores[[row, y_pc]], color);
    let points = Points {
        reference: known
            .iter()
            .map(|&r| point(r, labeled.known[r].as_deref().map_or(UNKNOWN_COLOR, population_color)))
            .collect(),
        study: study_rows
            .iter()
            .map(|&r| point(r, population_color(&labeled.predicted[r])))
            .collect(),
    };

    let (mut x_min, mut x_max, mut y_min, mut y_max) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
    for &(x, y, _) in points.reference.iter().chain(&points.study) {
        x_min = x_min.min(x);
        x_max = x_max.max(x);
        y_min = y_min.min(y);
        y_max = y_max.max(y);
    }
    if x_min > x_max {
        (x_min, x_max, y_min, y_max) = (-1.0, 1.0, -1.0, 1.0);
    }
    let pad_x = ((x_max - x_min) * 0.05).max(1e-6);
    let pad_y = ((y_max - y_min) * 0.05).max(1e-6);

    let x_desc = format!("PC{}", x_pc + 1);
    let y_desc = format!("PC{}", y_pc + 1);
    let mut chart = ChartBuilder::on(area)
        .caption(format!("{} vs {}", x_desc, y_desc), ("sans-serif", 20))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d((x_min - pad_x)..(x_max + pad_x), (y_min - pad_y)..(y_max + pad_y))?;
    chart
        .configure_mesh()
        .x_desc(x_desc.as_str())
        .y_desc(y_desc.as_str())
        .draw()?;

    chart.draw_series(
        points
            .reference
            .iter()
            .map(|&(x, y, color)| Circle::new((x, y), 2, color.mix(0.1).filled())),
    )?;
    chart.draw_series(
        points
            .study
            .iter()
            .map(|&(x, y, color)| Circle::new((x, y), 2, color.filled())),
    )?;

    for (name, count) in legend {
        let color = population_color(name);
        chart
            .draw_series(std::iter::empty::<Circle<(f64, f64), i32>>())?
            .label(format!("{} (n={})", name, count))
            .legend(move |(x, y)| Circle::new((x, y), 4, color.filled()));
    }
    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperRight)
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;
    Ok(())
}

/// Draws one panel per consecutive PC pair into a single SVG. Reference
/// points are coloured by known population, study points by prediction.
pub fn plot_pca_with_reference(labeled: &LabeledTable, num_pcs: usize, output_path: &Path) -> Result<()> {
    let num_pcs = num_pcs.min(labeled.table.scores.ncols());
    let pairs = panel_pairs(num_pcs);
    if pairs.is_empty() {
        return Err(AncestryError::Plot(format!("need at least two PCs to plot, have {}", num_pcs)));
    }
    let study_rows = labeled.unlabeled_rows();
    let known: Vec<usize> = (0..labeled.known.len()).filter(|&r| labeled.known[r].is_some()).collect();
    let predicted: Vec<&str> = study_rows.iter().map(|&r| labeled.predicted[r].as_str()).collect();
    let legend = legend_counts(&predicted);

    let cols = pairs.len().min(2);
    let rows = pairs.len().div_ceil(cols);
    let size = (PANEL_SIZE.0 * cols as u32, PANEL_SIZE.1 * rows as u32);
    let root = SVGBackend::new(output_path, size).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    let panels = root.split_evenly((rows, cols));
    for (panel, &pair) in panels.iter().zip(&pairs) {
        draw_panel(panel, labeled, &study_rows, &known, pair, &legend).map_err(plot_err)?;
    }
    root.present().map_err(plot_err)?;
    info!("Wrote {} PCA panels to {}", pairs.len(), output_path.display());
    Ok(())
}
