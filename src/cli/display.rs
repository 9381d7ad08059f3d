//! Human-readable terminal output
//!
//! Renders the preflight report and the startup banner. All output goes to
//! stderr so stdout remains clean for piping.

use std::fmt::Write as _;

use colored::Colorize;

use crate::preflight::PreflightReport;
use crate::schedule::CycleConfig;

/// Render the preflight report as a colored multi-line string.
#[must_use]
pub fn render_preflight_report(report: &PreflightReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", "Preflight".bold().cyan());
    let _ = writeln!(out, "{}", "─".repeat(50).dimmed());

    for script in &report.scripts {
        let role = format!("{:<9}", script.role.as_str());
        match (&script.resolved, &script.problem) {
            (Some(path), _) => {
                let _ = writeln!(
                    out,
                    "  {} {} {} {}",
                    "✓".green().bold(),
                    role.bold(),
                    script.configured,
                    format!("→ {}", path.display()).dimmed()
                );
            }
            (None, problem) => {
                let reason = problem.as_deref().unwrap_or("unresolved");
                let _ = writeln!(
                    out,
                    "  {} {} {} {}",
                    "✗".red().bold(),
                    role.bold(),
                    script.configured,
                    format!("({reason})").red()
                );
            }
        }
    }

    let verdict = if report.all_resolved() {
        "all scripts ready".green().bold()
    } else if report.is_ok() {
        "scripts present but not all executable".yellow().bold()
    } else {
        "missing scripts".red().bold()
    };
    let _ = writeln!(out, "{}", "─".repeat(50).dimmed());
    let _ = write!(out, "  {verdict}");
    out
}

/// One-line summary of the cycle printed at startup.
#[must_use]
pub fn render_banner(config: &CycleConfig) -> String {
    format!(
        "{} {} {} every {} ({} sub-ticks), {} {} / {} {}",
        "flipflop".bold().cyan(),
        config.interface.bold(),
        "toggling".dimmed(),
        humantime::format_duration(config.period),
        config.subdivisions,
        "flip".green(),
        config.flip_latency,
        "flop".yellow(),
        config.flop_latency,
    )
}
