//! Output formatting for search results, run summaries and status.

use crate::cli::OutputFormat;
use crate::driver::RunSummary;
use crate::error::Result;
use crate::rag::{Answer, Hit, Related};
use crate::store::StoreStatus;
use colored::Colorize;
use serde::Serialize;
use std::fmt::Write as _;

/// Characters of text shown per hit in text mode.
const PREVIEW_CHARS: usize = 160;

/// Pretty JSON for any serializable value.
fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Shorten `text` to `max` characters, appending an ellipsis when cut.
#[must_use]
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Non-empty text fields joined on one line.
fn preview(texts: &[String]) -> String {
    let joined = texts
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" / ");
    truncate(&joined, PREVIEW_CHARS)
}

/// Render a ranked hit list.
pub fn format_hits(hits: &[Hit], format: OutputFormat) -> Result<String> {
    if format == OutputFormat::Json {
        return to_json(hits);
    }
    if hits.is_empty() {
        return Ok("No results found.".dimmed().to_string());
    }
    let mut out = String::new();
    for (rank, hit) in hits.iter().enumerate() {
        let _ = writeln!(
            out,
            "{:>2}. {} {}",
            rank + 1,
            format!("#{}", hit.id).cyan(),
            format!("({:.4})", hit.score).dimmed()
        );
        let _ = writeln!(out, "    {}", preview(&hit.texts));
    }
    Ok(out.trim_end().to_string())
}

/// Render term matches and their neighbors.
pub fn format_related(related: &[Related], format: OutputFormat) -> Result<String> {
    if format == OutputFormat::Json {
        return to_json(related);
    }
    if related.is_empty() {
        return Ok("No embedded records match.".dimmed().to_string());
    }
    let mut out = String::new();
    for item in related {
        let _ = writeln!(
            out,
            "{} {}",
            format!("#{}", item.record.id).cyan().bold(),
            preview(&item.record.texts)
        );
        for hit in &item.neighbors {
            let _ = writeln!(
                out,
                "  {} {} {}",
                "→".dimmed(),
                format!("#{}", hit.id).cyan(),
                format!("({:.4})", hit.score).dimmed()
            );
            let _ = writeln!(out, "    {}", preview(&hit.texts));
        }
        out.push('\n');
    }
    Ok(out.trim_end().to_string())
}

/// Render a generated answer and its sources.
pub fn format_answer(answer: &Answer, format: OutputFormat) -> Result<String> {
    if format == OutputFormat::Json {
        return to_json(answer);
    }
    let mut out = String::new();
    let _ = writeln!(out, "{}\n", answer.text.trim());
    let _ = writeln!(out, "{}", "Sources:".bold());
    for hit in &answer.sources {
        let _ = writeln!(
            out,
            "  {} {} {}",
            format!("#{}", hit.id).cyan(),
            format!("({:.4})", hit.score).dimmed(),
            truncate(&preview(&hit.texts), 80)
        );
    }
    Ok(out.trim_end().to_string())
}

/// Render the outcome of an embedding run.
pub fn format_summary(summary: &RunSummary, format: OutputFormat) -> Result<String> {
    if format == OutputFormat::Json {
        return to_json(summary);
    }
    let elapsed = (summary.finished_at - summary.started_at).num_milliseconds();
    let mut out = String::new();
    let mark = if summary.failed.is_empty() {
        "✓".green()
    } else {
        "!".yellow()
    };
    let _ = writeln!(
        out,
        "{mark} Embedded {} of {} records with {} in {} ({} commits)",
        summary.embedded,
        summary.attempted,
        summary.model,
        format_elapsed(elapsed),
        summary.commits
    );
    if !summary.failed.is_empty() {
        let _ = writeln!(
            out,
            "{} {} records failed",
            "Failed:".red(),
            summary.failed.len()
        );
        for failure in &summary.failures {
            let ids: Vec<String> = failure.ids.iter().map(ToString::to_string).collect();
            let _ = writeln!(
                out,
                "  chunk {}: {}",
                failure.chunk,
                failure.reason.dimmed()
            );
            let _ = writeln!(out, "    ids: {}", truncate(&ids.join(", "), 200));
        }
    }
    if !summary.skipped.is_empty() {
        let ids: Vec<String> = summary.skipped.iter().map(ToString::to_string).collect();
        let _ = writeln!(
            out,
            "{} {} records not attempted",
            "Skipped:".yellow(),
            summary.skipped.len()
        );
        let _ = writeln!(out, "    ids: {}", truncate(&ids.join(", "), 200));
    }
    if let Some(error) = &summary.error {
        let _ = writeln!(out, "{} {error}", "Run stopped on store error:".red());
    } else if summary.aborted {
        let _ = writeln!(out, "{}", "Run aborted after a failed batch.".yellow());
    }
    if summary.remaining > 0 {
        let _ = writeln!(
            out,
            "{} {} records still pending",
            "Pending:".yellow(),
            summary.remaining
        );
    }
    Ok(out.trim_end().to_string())
}

/// Render table status.
pub fn format_status(status: &StoreStatus, db: &str, format: OutputFormat) -> Result<String> {
    if format == OutputFormat::Json {
        return to_json(&serde_json::json!({
            "database": db,
            "table": status.table,
            "total": status.total,
            "embedded": status.embedded,
            "pending": status.pending,
            "dimension": status.dimension,
        }));
    }
    let mut out = String::new();
    let _ = writeln!(out, "{}\n", "Embedding Store".bold());
    let _ = writeln!(out, "Database: {db}");
    let _ = writeln!(out, "Table:    {}\n", status.table.cyan());
    let _ = writeln!(out, "{}", "Records".bold());
    let _ = writeln!(out, "  Total:     {}", status.total);
    let _ = writeln!(out, "  Embedded:  {}", status.embedded);
    if status.pending > 0 {
        let _ = writeln!(
            out,
            "  {}   {} (run 'embedstore embed')",
            "Pending:".yellow(),
            status.pending
        );
    }
    let dim = status
        .dimension
        .map_or_else(|| "not set".to_string(), |d| d.to_string());
    let _ = writeln!(out, "  Dimension: {dim}");
    Ok(out.trim_end().to_string())
}

/// Milliseconds as `850ms`, `12.3s` or `4m 05s`.
#[must_use]
pub fn format_elapsed(millis: i64) -> String {
    let millis = millis.max(0);
    if millis < 1000 {
        format!("{millis}ms")
    } else if millis < 60_000 {
        #[allow(clippy::cast_precision_loss)]
        let secs = millis as f64 / 1000.0;
        format!("{secs:.1}s")
    } else {
        let secs = millis / 1000;
        format!("{}m {:02}s", secs / 60, secs % 60)
    }
}
