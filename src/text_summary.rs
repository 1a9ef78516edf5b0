//! Text summary builder for CLI output.
//!
//! This module formats a finished run report as human-readable lines for text mode.

use crate::model::{FailureCause, RunOutcome, RunReport, Stage, StageStatus};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn status_label(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Pending => "pending",
        StageStatus::Success => "ok",
        StageStatus::Failure(FailureCause::Error) => "failed",
        StageStatus::Failure(FailureCause::Skipped) => "skipped",
        StageStatus::Failure(FailureCause::NothingFound) => "no fire found",
    }
}

/// Build a text summary from a finished run report.
pub(crate) fn build_text_summary(report: &RunReport) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!(
        "Fire event: {} ({})",
        report.fire_event_name,
        if report.affiliation.is_empty() {
            "-"
        } else {
            report.affiliation.as_str()
        }
    ));
    match &report.outcome {
        RunOutcome::Rejected { reason } => {
            lines.push(format!("Outcome: {} ({reason})", report.outcome.label()));
            return TextSummary { lines };
        }
        outcome => lines.push(format!("Outcome: {}", outcome.label())),
    }

    for stage in Stage::ALL {
        lines.push(format!(
            "  {:<34} {}",
            stage.label(),
            status_label(report.stages.get(stage))
        ));
    }

    if let Some(passes) = report.satellite_pass_info.as_ref() {
        let latest = if passes.latest_pass.is_empty() {
            "-"
        } else {
            passes.latest_pass.as_str()
        };
        lines.push(format!(
            "Satellite passes: {} prefire / {} postfire (latest {latest})",
            passes.n_prefire_passes, passes.n_postfire_passes
        ));
    }

    if !report.products.is_empty() {
        lines.push("Derived products:".to_string());
        for p in &report.products {
            lines.push(format!("  {}: {}", p.product_type, p.url));
        }
    }
    for link in &report.map_links {
        lines.push(format!("Map ({}): {}", link.product, link.url));
    }

    TextSummary { lines }
}
