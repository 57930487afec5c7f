//! Formatted terminal output.
//!
//! We keep formatting code in one place so:
//! - the fitting and persistence code stays free of presentation
//! - output changes are localized

use crate::domain::FitConfig;
use crate::io::{EnqueueSummary, ResultQuery, ResultRecord};
use crate::models::ModelFit;

/// Format the fit summary: run settings, per-fold fitter diagnostics,
/// metrics and fitted parameters.
pub fn format_fit_summary(fit: &ModelFit, config: &FitConfig) -> String {
    let mut out = String::new();

    out.push_str("=== neurofit ===\n");
    out.push_str(&format!("Cell: {} | batch {}\n", config.cellid, config.batch));
    out.push_str(&format!("Model: {}\n", fit.modelname));
    out.push_str(&format!("Stack: {}\n", fit.stack.describe()));
    out.push_str(&format!(
        "Validation: {} | parameters: {}\n",
        if config.valmode { "on" } else { "off" },
        fit.stack.parameter_count()
    ));

    out.push_str("\nFit diagnostics:\n");
    if fit.outcomes.is_empty() {
        out.push_str("  (no fit keyword; initial parameters kept)\n");
    }
    for (i, o) in fit.outcomes.iter().enumerate() {
        let label = if fit.cross_validated {
            format!("fold {}", i + 1)
        } else {
            "fit".to_string()
        };
        out.push_str(&format!(
            "  {label:<8} {:<18} objective={:.6} iter={} evals={}{}\n",
            o.kind.display_name(),
            o.objective,
            o.iterations,
            o.evaluations,
            if o.converged { "" } else { " (not converged)" }
        ));
    }

    out.push_str("\nMetrics:\n");
    for (key, value) in &fit.stack.state.meta {
        out.push_str(&format!("  {key:<10} {value:>10.4}\n"));
    }

    out.push_str("\nParameters:\n");
    for module in &fit.stack.modules {
        for (param, values) in module.parameters() {
            out.push_str(&format!("- {} {param}: {}\n", module.name(), fmt_vec(&values)));
        }
    }

    out
}

/// Format a results listing as an aligned table.
pub fn format_results_table(query: &ResultQuery, rows: &[ResultRecord]) -> String {
    let columns = query.selected_columns();
    let cells = query.table(rows);
    if cells.is_empty() {
        return format!("No results for batch {}.\n", query.batch);
    }

    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| {
            cells
                .iter()
                .map(|row| row[i].chars().count())
                .chain(std::iter::once(c.header().len()))
                .max()
                .unwrap_or(0)
                .min(MAX_WIDTH)
        })
        .collect();

    let mut out = String::new();
    let header: Vec<String> = columns
        .iter()
        .zip(&widths)
        .map(|(c, &w)| format!("{:<w$}", c.header()))
        .collect();
    out.push_str(header.join(" ").trim_end());
    out.push('\n');
    let rule: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    out.push_str(&rule.join(" "));
    out.push('\n');

    for row in &cells {
        let line: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(v, &w)| format!("{:<w$}", truncate(v, w)))
            .collect();
        out.push_str(line.join(" ").trim_end());
        out.push('\n');
    }
    out
}

pub fn format_enqueue_summary(summary: &EnqueueSummary) -> String {
    let mut out = String::new();
    for (note, id) in &summary.queued {
        out.push_str(&format!("queued   {id:>6}  {note}\n"));
    }
    for note in &summary.existing {
        out.push_str(&format!("exists           {note}\n"));
    }
    for note in &summary.duplicates {
        out.push_str(&format!("in queue         {note}\n"));
    }
    out.push_str(&format!(
        "{} queued, {} with results, {} already in queue\n",
        summary.queued.len(),
        summary.existing.len(),
        summary.duplicates.len()
    ));
    out
}

const MAX_WIDTH: usize = 40;

fn fmt_vec(v: &[f64]) -> String {
    let parts: Vec<String> = v.iter().map(|x| format!("{x:.6}")).collect();
    format!("[{}]", parts.join(", "))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}
