//! Terminal reporting for the CLI
//!
//! Live spinner driven by progress events, plus the header and final
//! summary printed around a run.

use crate::action::ActionStatus;
use crate::scanner::ShardCount;
use crate::summary::BulkActionSummaryOverview;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Errors listed in the text summary
const MAX_PRINTED_ERRORS: usize = 10;

/// Spinner that shows run status
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .expect("Invalid progress template")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Update the display from a progress event
    pub fn update(&self, overview: &BulkActionSummaryOverview) {
        let summary = &overview.summary;
        let secs = overview.duration_ms as f64 / 1000.0;
        let rate = if secs > 0.0 {
            summary.processed as f64 / secs
        } else {
            0.0
        };

        let msg = format!(
            "{} | Processed: {} | OK: {} | Failed: {} | Rate: {:.0}/s | Shards: {}/{}",
            overview.status,
            format_number(summary.processed),
            format_number(summary.succeeded),
            format_number(summary.failed),
            rate,
            overview.progress.done,
            overview.progress.total,
        );

        self.bar.set_message(msg);
    }

    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| {
            chunk
                .iter()
                .rev()
                .map(|&b| b as char)
                .collect::<String>()
        })
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print a header before the run
pub fn print_header(url: &str, action: &str, pattern: &str, concurrency: usize) {
    println!();
    println!(
        "{} {}",
        style("keyspace-bulk").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Store:").bold(), url);
    println!("  {} {}", style("Action:").bold(), action);
    println!("  {} {}", style("Pattern:").bold(), pattern);
    println!("  {} {}", style("Shards at once:").bold(), concurrency);
    println!();
}

/// Print the final summary of a run
pub fn print_summary(overview: &BulkActionSummaryOverview) {
    let summary = &overview.summary;
    let secs = overview.duration_ms as f64 / 1000.0;
    let rate = if secs > 0.0 {
        summary.processed as f64 / secs
    } else {
        0.0
    };

    let title = format!("Bulk {} {}", overview.action, overview.status);
    println!();
    match overview.status {
        ActionStatus::Completed => println!("{}", style(title).green().bold()),
        ActionStatus::Aborted => println!("{}", style(title).yellow().bold()),
        _ => println!("{}", style(title).red().bold()),
    }
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Run:").bold(), overview.id);
    println!(
        "  {} {}",
        style("Processed:").bold(),
        format_number(summary.processed)
    );
    println!(
        "  {} {}",
        style("Succeeded:").bold(),
        format_number(summary.succeeded)
    );
    println!(
        "  {} {}/{}",
        style("Shards:").bold(),
        overview.progress.done,
        overview.progress.total
    );
    println!(
        "  {} {:.1}s ({:.0} keys/sec)",
        style("Duration:").bold(),
        secs,
        rate
    );

    if summary.failed > 0 {
        println!(
            "  {} {}",
            style("Failed:").yellow().bold(),
            format_number(summary.failed)
        );
        for err in summary.errors.iter().take(MAX_PRINTED_ERRORS) {
            println!("    {} {}", style(&err.key).dim(), err.message);
        }
        if summary.errors.len() > MAX_PRINTED_ERRORS {
            println!(
                "    {}",
                style(format!(
                    "... {} more",
                    summary.errors.len() - MAX_PRINTED_ERRORS
                ))
                .dim()
            );
        }
    }

    if let Some(error) = &overview.error {
        println!("  {} {}", style("Error:").red().bold(), error);
    }
    println!();
}

/// Print per-shard key counts
pub fn print_counts(counts: &[ShardCount]) {
    let total: u64 = counts.iter().map(|c| c.keys).sum();

    println!();
    println!("{}", style("Matching keys").green().bold());
    println!("{}", style("─".repeat(50)).dim());
    for count in counts {
        println!(
            "  {} {}",
            style(format!("{}:", count.node)).bold(),
            format_number(count.keys)
        );
    }
    println!("  {} {}", style("Total:").bold(), format_number(total));
    println!();
}
