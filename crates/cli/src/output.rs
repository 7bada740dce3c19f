//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use stagehand_e2e::runner::error_chain;
use stagehand_e2e::{EngineReport, RunOutcome, TestOutcome, TestStatus};

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Print the result of a run
pub fn print_outcome(outcome: &RunOutcome, format: OutputFormat) {
    match format {
        OutputFormat::Table => print_table(outcome),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&outcome.summary()).unwrap_or_default());
        }
        OutputFormat::Yaml => {
            println!("{}", serde_yaml::to_string(&outcome.summary()).unwrap_or_default());
        }
    }
}

fn print_table(outcome: &RunOutcome) {
    if let Some(report) = &outcome.report {
        print_report(report);
    }

    if let Some(err) = &outcome.error {
        print_error(&format!("{}: {}", error_heading(outcome.aborted()), err));
        print_causes(err);
    }
    if let Some(err) = &outcome.cleanup_error {
        print_warning(&format!("Cleanup failed: {}", error_chain(err)));
    }

    println!();
    let verdict = if outcome.success() {
        "✓ Passed".green().bold()
    } else if outcome.aborted() {
        "✗ Aborted".red().bold()
    } else {
        "✗ Failed".red().bold()
    };
    println!(
        "{} {} {}",
        verdict,
        format!("(exit code {})", outcome.exit_code).dimmed(),
        format!("run {}", outcome.run_id).dimmed()
    );
}

fn error_heading(aborted: bool) -> &'static str {
    if aborted {
        "Run aborted"
    } else {
        "Run failed"
    }
}

fn print_report(report: &EngineReport) {
    println!("{}", "━".repeat(60).dimmed());
    println!("{}", " Test Results".bold());
    println!("{}", "━".repeat(60).dimmed());
    println!(
        "  {} passing  {} failing  {} pending  {} skipped  {}",
        report.passed.to_string().green(),
        report.failed.to_string().red(),
        report.pending.to_string().cyan(),
        report.skipped.to_string().yellow(),
        format!("({} ms)", report.duration_ms).dimmed()
    );

    let notable: Vec<&TestOutcome> = report
        .tests
        .iter()
        .filter(|t| t.status == TestStatus::Failed || t.slow)
        .collect();
    if notable.is_empty() {
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Status", "Test", "Duration", "Error"]);

    for test in notable {
        table.add_row(vec![
            status_cell(test),
            Cell::new(&test.full_title),
            Cell::new(format!("{} ms", test.duration_ms)),
            Cell::new(test.error.as_deref().unwrap_or("")),
        ]);
    }

    println!("{table}");
}

fn status_cell(test: &TestOutcome) -> Cell {
    match test.status {
        TestStatus::Failed => Cell::new("✗ failed").fg(Color::Red),
        TestStatus::Passed => Cell::new("● slow").fg(Color::Yellow),
        TestStatus::Pending => Cell::new("○ pending").fg(Color::Cyan),
        TestStatus::Skipped => Cell::new("○ skipped"),
    }
}

/// Print every cause below the top-level error, one per line
fn print_causes(err: &(dyn std::error::Error + 'static)) {
    let mut last = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if text != last {
            eprintln!("   {} {}", "caused by:".dimmed(), text);
            last = text;
        }
        source = cause.source();
    }
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    eprintln!("⚠️  {}", message);
}
