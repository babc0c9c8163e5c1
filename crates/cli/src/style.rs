//! Terminal styling for merge reports and timeline views.

use comfy_table::{Cell, Color};
use console::Style;

use semmerge_core::models::{ConflictSeverity, MergeDecision};

/// A fully merged file or a completed action.
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Files left unmerged or regions waiting on someone.
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Title printed above a report table.
pub fn header(msg: &str) -> String {
    let style = Style::new().bold();
    style.apply_to(msg).to_string()
}

/// Secondary detail such as counts or task intents.
pub fn dim(msg: &str) -> String {
    let style = Style::new().dim();
    style.apply_to(msg).to_string()
}

/// Table cell for a region decision.
pub fn decision_cell(decision: MergeDecision) -> Cell {
    match decision {
        MergeDecision::AutoMerged => Cell::new("✓ auto-merged").fg(Color::Green),
        MergeDecision::AiResolved => Cell::new("✓ ai-resolved").fg(Color::Cyan),
        MergeDecision::Failed => Cell::new("✗ failed").fg(Color::Red),
        MergeDecision::HumanRequired => Cell::new("⧗ human required").fg(Color::Yellow),
    }
}

/// Table cell for a severity.
pub fn severity_cell(severity: ConflictSeverity) -> Cell {
    let cell = Cell::new(severity.to_string());
    match severity {
        ConflictSeverity::None => cell,
        ConflictSeverity::Low => cell.fg(Color::Green),
        ConflictSeverity::Medium => cell.fg(Color::Yellow),
        ConflictSeverity::High => cell.fg(Color::Red),
        ConflictSeverity::Blocking => cell.fg(Color::Magenta),
    }
}
