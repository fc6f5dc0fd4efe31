use std::fmt::Write;

use serde::Serialize;

use crate::models::{AggregationResult, HistoricalRate, RankedDefect, RowKind};

/// Everything the dashboard renders for one request, in JSON-friendly form.
#[derive(Debug, Serialize)]
pub struct DashboardSnapshot<'a> {
    pub window: String,
    pub overall_failure_rate_pct: Option<f64>,
    #[serde(flatten)]
    pub result: &'a AggregationResult,
    pub history: &'a [HistoricalRate],
}

impl<'a> DashboardSnapshot<'a> {
    pub fn new(window: String, result: &'a AggregationResult, history: &'a [HistoricalRate]) -> Self {
        Self {
            window,
            overall_failure_rate_pct: result.overall_failure_rate_pct(),
            result,
            history,
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn format_dppm(dppm: Option<i64>) -> String {
    dppm.map_or_else(|| "n/a".to_string(), |value| value.to_string())
}

fn format_rate(rate: Option<f64>) -> String {
    rate.map_or_else(|| "n/a".to_string(), |value| format!("{value:.2}%"))
}

fn current_dppm(result: &AggregationResult, defect_id: i32) -> Option<i64> {
    result
        .defects
        .iter()
        .find(|row| row.kind == RowKind::Defect && row.defect_id == Some(defect_id))
        .and_then(|row| row.dppm)
}

pub fn build_report(window_label: &str, result: &AggregationResult, history: &[HistoricalRate]) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Production Defect Dashboard");
    let _ = writeln!(
        output,
        "Generated for {} ({})",
        result.scope.label(),
        window_label
    );
    let _ = writeln!(
        output,
        "Overall failure rate: {} ({} defects over {} units input)",
        format_rate(result.overall_failure_rate_pct()),
        result.total_defect_quantity,
        result.total_production_input
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Defect Pareto");
    let _ = writeln!(output, "| Defect | Qty | DPPM |");
    let _ = writeln!(output, "| --- | ---: | ---: |");

    for row in &result.defects {
        let label = match row.kind {
            RowKind::Total => format!("**{}**", row.criterion),
            _ => row.criterion.clone(),
        };
        let _ = writeln!(
            output,
            "| {} | {} | {} |",
            label,
            row.quantity,
            format_dppm(row.dppm)
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Weekly Failure Rate");

    if result.weekly_rates.is_empty() {
        let _ = writeln!(output, "No production recorded for this window.");
    } else {
        let _ = writeln!(output, "| Week | Defects | Input | FOR |");
        let _ = writeln!(output, "| --- | ---: | ---: | ---: |");
        for (week, rate) in &result.weekly_rates {
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} |",
                week,
                rate.defect_quantity,
                rate.production_input,
                format_rate(rate.failure_rate_pct())
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Output by Model");

    if result.model_outputs.is_empty() {
        let _ = writeln!(output, "No production recorded for this window.");
    } else {
        for (model, produced) in &result.model_outputs {
            let _ = writeln!(output, "- {model}: {produced} units");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Historical Comparison");

    if history.is_empty() {
        let _ = writeln!(output, "No top defects to compare for this window.");
    } else {
        if let Some(earliest) = result.earliest_date_id {
            let _ = writeln!(output, "Baseline taken from production days before {earliest}.");
            let _ = writeln!(output);
        }
        let _ = writeln!(output, "| Defect | Current DPPM | Historical DPPM |");
        let _ = writeln!(output, "| --- | ---: | ---: |");
        for rate in history {
            let _ = writeln!(
                output,
                "| {} | {} | {} |",
                rate.criterion,
                format_dppm(current_dppm(result, rate.defect_id)),
                format_dppm(rate.dppm)
            );
        }
    }

    output
}

fn summary_line(row: &RankedDefect) -> String {
    format!(
        "{:<28} {:>8} {:>10}",
        row.criterion,
        row.quantity,
        format_dppm(row.dppm)
    )
}

pub fn print_summary(window_label: &str, result: &AggregationResult) {
    println!("Defect Pareto for {} ({}):", result.scope.label(), window_label);
    println!("{:<28} {:>8} {:>10}", "defect", "qty", "dppm");
    for row in &result.defects {
        println!("{}", summary_line(row));
    }
    println!(
        "Overall failure rate {} across {} weeks and {} models.",
        format_rate(result.overall_failure_rate_pct()),
        result.weekly_rates.len(),
        result.model_outputs.len()
    );
}
