//! Run reports: per-job CSV, full-status JSON, and a Markdown summary.

use std::path::Path;

use anyhow::{Context, Result};

use crate::controller::{JobStatus, PipelineStatus, RunSummary};
use crate::metrics::format_duration;

// ─── CSV export ─────────────────────────────────────────────────────

/// One row per job.
///
/// Columns: symbol, status, progress, data_points, api_calls, duration_secs,
/// started_at, message
pub fn export_status_csv(status: &PipelineStatus) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);

    wtr.write_record([
        "symbol",
        "status",
        "progress",
        "data_points",
        "api_calls",
        "duration_secs",
        "started_at",
        "message",
    ])?;

    for job in &status.jobs {
        wtr.write_record([
            job.symbol.as_str(),
            job.status.as_str(),
            &format!("{:.1}", job.progress),
            &job.data_points.to_string(),
            &job.api_calls.to_string(),
            &job.duration_secs.map_or_else(String::new, |d| format!("{d:.2}")),
            &job.started_at.map_or_else(String::new, |t| t.to_rfc3339()),
            job.message.as_deref().unwrap_or(""),
        ])?;
    }

    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

// ─── JSON export ────────────────────────────────────────────────────

pub fn export_status_json(status: &PipelineStatus) -> Result<String> {
    serde_json::to_string_pretty(status).context("failed to serialize pipeline status to JSON")
}

/// Write a status report; `.json` gets JSON, anything else CSV.
pub fn save_status(status: &PipelineStatus, path: &Path) -> Result<()> {
    let body = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => export_status_json(status)?,
        _ => export_status_csv(status)?,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create report dir: {}", parent.display()))?;
    }
    std::fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))
}

// ─── Markdown summary ───────────────────────────────────────────────

pub fn generate_summary(summary: &RunSummary, status: &PipelineStatus) -> String {
    let mut md = String::with_capacity(1024);

    md.push_str(if summary.stopped {
        "# Harvest Run (stopped)\n\n"
    } else {
        "# Harvest Run\n\n"
    });
    md.push_str("| Field | Value |\n");
    md.push_str("| --- | --- |\n");
    md.push_str(&format!("| Jobs | {} |\n", status.total));
    md.push_str(&format!("| Completed | {} |\n", summary.completed));
    md.push_str(&format!("| Failed | {} |\n", summary.failed));
    md.push_str(&format!("| Skipped | {} |\n", summary.skipped));
    md.push_str(&format!("| Cancelled | {} |\n", summary.cancelled));
    md.push_str(&format!("| API calls | {} |\n", summary.total_api_calls));
    md.push_str(&format!(
        "| Duration | {} |\n",
        format_duration(summary.duration.as_secs_f64())
    ));
    md.push('\n');

    let problems: Vec<_> = status
        .jobs
        .iter()
        .filter(|j| j.message.is_some() && j.status != JobStatus::Completed)
        .collect();
    if !problems.is_empty() {
        md.push_str("## Not completed\n\n");
        md.push_str("| Symbol | Status | Reason |\n");
        md.push_str("| --- | --- | --- |\n");
        for job in problems {
            md.push_str(&format!(
                "| {} | {} | {} |\n",
                job.symbol,
                job.status,
                job.message.as_deref().unwrap_or("").replace('|', "\\|")
            ));
        }
        md.push('\n');
    }

    md
}
