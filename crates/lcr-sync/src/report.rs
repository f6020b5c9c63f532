use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::SyncRunSummary;

/// Writes `<reports_root>/<run_id>/run_summary.json` and `brief.md`.
pub async fn write_reports(reports_root: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    fs::write(run_dir.join("brief.md"), brief_markdown(summary))
        .await
        .context("writing brief.md")?;

    Ok(run_dir)
}

pub fn brief_markdown(summary: &SyncRunSummary) -> String {
    let expected = summary
        .expected_total
        .map(|n| n.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let colors = if summary.status_colors.is_empty() {
        "- none".to_string()
    } else {
        summary
            .status_colors
            .iter()
            .map(|(color, n)| format!("- {}: {}", color.as_str(), n))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut brief = format!(
        "# Licensed Company Registry Sync\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Elapsed: {} ms\n- Expected records: {}\n- Received records: {} ({} malformed, {} pages)\n- Fetch complete: {}\n- Company groups: {}\n- Loaded: {} ({} inserted, {} updated)\n- Skipped without coordinates: {}\n- Errors: {}\n- Cancelled: {}\n- Snapshot digest: `{}`\n\n## License Status\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.elapsed_ms,
        expected,
        summary.received_records,
        summary.malformed_records,
        summary.pages,
        summary.fetch_complete,
        summary.company_groups,
        summary.loaded,
        summary.inserted,
        summary.updated,
        summary.skipped_ungeocoded,
        summary.errors,
        summary.cancelled,
        summary.snapshot_digest,
        colors,
    );

    if let Some((expected, received)) = summary.count_mismatch() {
        brief.push_str(&format!(
            "\n> Count mismatch: expected {expected}, received {received}.\n"
        ));
    }
    if !summary.failures.is_empty() {
        brief.push_str("\n## Write Failures\n");
        for failure in &summary.failures {
            brief.push_str(&format!("- {}: {}\n", failure.global_id, failure.message));
        }
    }
    brief
}
